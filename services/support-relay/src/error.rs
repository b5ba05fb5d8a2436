//! Service-specific error types

use std::net::SocketAddr;
use thiserror::Error;

/// Support relay lifecycle errors.
///
/// Per-request failures (invalid input, backend errors, exhausted keys) are
/// turned into HTTP responses by the relay handler and never propagate as
/// Rust errors.
#[derive(Error, Debug)]
pub enum Error {
    #[error(
        "no API keys configured: set GEMINI_API_KEY or GOOGLE_API_KEY_1..3, or pool.key_env / pool.keys_file"
    )]
    EmptyKeyPool,

    #[error("failed to bind listener on {addr}: {source}")]
    Listener {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}
