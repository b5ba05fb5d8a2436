//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! API keys are never stored in the TOML. They are read from the env vars
//! named in `pool.key_env` (in order), then from the optional
//! `pool.keys_file`, one key per line.

use common::Secret;
use generation::PromptTemplate;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Prompt used when `prompt.template_file` is not set
pub const DEFAULT_TEMPLATE: &str = include_str!("../templates/support_prompt.txt");

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub prompt: PromptConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Admin API listener. Disabled when unset.
    #[serde(default)]
    pub admin_listen_addr: Option<SocketAddr>,
    /// Allowed browser origins. Empty allows any origin.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Generation backend settings
#[derive(Debug, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            timeout_secs: default_timeout(),
        }
    }
}

/// API key pool settings
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    /// Env vars holding API keys, in pool order
    #[serde(default = "default_key_env")]
    pub key_env: Vec<String>,
    /// File with one API key per line, appended after env keys
    #[serde(default)]
    pub keys_file: Option<PathBuf>,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    /// Resolved keys, never deserialized
    #[serde(skip)]
    pub keys: Vec<Secret<String>>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            key_env: default_key_env(),
            keys_file: None,
            cooldown_secs: default_cooldown(),
            keys: Vec::new(),
        }
    }
}

/// Prompt settings
#[derive(Debug, Default, Deserialize)]
pub struct PromptConfig {
    #[serde(default)]
    pub template_file: Option<PathBuf>,
    /// Answer returned when the backend produces no text
    #[serde(default)]
    pub fallback_answer: Option<String>,
    /// Resolved template text
    #[serde(skip)]
    pub template: String,
}

fn default_max_connections() -> usize {
    1000
}

fn default_base_url() -> String {
    generation::gemini::DEFAULT_BASE_URL.to_string()
}

fn default_model() -> String {
    generation::gemini::DEFAULT_MODEL.to_string()
}

fn default_timeout() -> u64 {
    60
}

fn default_cooldown() -> u64 {
    key_pool::DEFAULT_COOLDOWN.as_secs()
}

fn default_key_env() -> Vec<String> {
    ["GEMINI_API_KEY", "GOOGLE_API_KEY_1", "GOOGLE_API_KEY_2", "GOOGLE_API_KEY_3"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Config {
    /// Load configuration from a TOML file, then resolve API keys and the
    /// prompt template.
    ///
    /// An empty key list is not an error here; startup refuses to serve
    /// without keys.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if !config.backend.base_url.starts_with("http://")
            && !config.backend.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                config.backend.base_url
            )));
        }

        if config.backend.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if config.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if config.pool.cooldown_secs == 0 {
            return Err(common::Error::Config(
                "cooldown_secs must be greater than 0".into(),
            ));
        }

        config.pool.keys = resolve_keys(&config.pool)?;

        config.prompt.template = match &config.prompt.template_file {
            Some(file) => std::fs::read_to_string(file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read template_file {}: {e}",
                    file.display()
                ))
            })?,
            None => DEFAULT_TEMPLATE.to_owned(),
        };
        PromptTemplate::new(config.prompt.template.as_str())?;

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("support-relay.toml")
    }
}

/// Collect keys from env vars, then the keys file. Blank values are skipped.
fn resolve_keys(pool: &PoolConfig) -> common::Result<Vec<Secret<String>>> {
    let mut keys = Vec::new();

    for name in &pool.key_env {
        if let Ok(value) = std::env::var(name) {
            let value = value.trim();
            if !value.is_empty() {
                keys.push(Secret::new(value.to_owned()));
            }
        }
    }

    if let Some(ref file) = pool.keys_file {
        let contents = std::fs::read_to_string(file).map_err(|e| {
            common::Error::Config(format!(
                "failed to read keys_file {}: {e}",
                file.display()
            ))
        })?;
        keys.extend(
            contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(|line| Secret::new(line.to_owned())),
        );
    }

    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that mutate environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn write_config(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("config.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    /// Minimal config whose keys come from test-only env vars, so a
    /// developer's real GEMINI_API_KEY never leaks into assertions.
    fn minimal_toml() -> &'static str {
        r#"
[server]
listen_addr = "127.0.0.1:5000"

[pool]
key_env = ["RELAY_TEST_KEY_A", "RELAY_TEST_KEY_B"]
"#
    }

    #[test]
    fn load_minimal_config_applies_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), minimal_toml());
        unsafe {
            remove_env("RELAY_TEST_KEY_A");
            remove_env("RELAY_TEST_KEY_B");
        }

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.listen_addr.port(), 5000);
        assert_eq!(config.server.max_connections, 1000);
        assert!(config.server.admin_listen_addr.is_none());
        assert_eq!(
            config.backend.base_url,
            "https://generativelanguage.googleapis.com"
        );
        assert_eq!(config.backend.model, "gemini-2.5-flash");
        assert_eq!(config.backend.timeout_secs, 60);
        assert_eq!(config.pool.cooldown_secs, 3600);
        assert!(config.pool.keys.is_empty());
        assert!(config.prompt.template.contains("{question}"));
        assert!(config.prompt.fallback_answer.is_none());
    }

    #[test]
    fn default_key_env_lists_primary_then_backups() {
        assert_eq!(
            PoolConfig::default().key_env,
            vec![
                "GEMINI_API_KEY",
                "GOOGLE_API_KEY_1",
                "GOOGLE_API_KEY_2",
                "GOOGLE_API_KEY_3"
            ]
        );
    }

    #[test]
    fn keys_resolve_from_env_in_order() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), minimal_toml());
        unsafe {
            set_env("RELAY_TEST_KEY_A", "key-a");
            set_env("RELAY_TEST_KEY_B", "key-b");
        }

        let config = Config::load(&path).unwrap();
        let keys: Vec<&str> = config.pool.keys.iter().map(|k| k.expose().as_str()).collect();
        assert_eq!(keys, vec!["key-a", "key-b"]);

        unsafe {
            remove_env("RELAY_TEST_KEY_A");
            remove_env("RELAY_TEST_KEY_B");
        }
    }

    #[test]
    fn unset_and_blank_env_keys_are_skipped() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), minimal_toml());
        unsafe {
            set_env("RELAY_TEST_KEY_A", "   ");
            set_env("RELAY_TEST_KEY_B", "key-b");
        }

        let config = Config::load(&path).unwrap();
        assert_eq!(config.pool.keys.len(), 1);
        assert_eq!(config.pool.keys[0].expose(), "key-b");

        unsafe {
            remove_env("RELAY_TEST_KEY_A");
            remove_env("RELAY_TEST_KEY_B");
        }
    }

    #[test]
    fn keys_file_appends_after_env_keys() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let keys_path = dir.path().join("keys");
        std::fs::write(&keys_path, "# backup keys\nfile-1\n\n  file-2  \n").unwrap();
        let path = write_config(
            dir.path(),
            &format!(
                r#"
[server]
listen_addr = "127.0.0.1:5000"

[pool]
key_env = ["RELAY_TEST_KEY_A"]
keys_file = "{}"
"#,
                keys_path.display()
            ),
        );
        unsafe { set_env("RELAY_TEST_KEY_A", "env-key") };

        let config = Config::load(&path).unwrap();
        let keys: Vec<&str> = config.pool.keys.iter().map(|k| k.expose().as_str()).collect();
        assert_eq!(keys, vec!["env-key", "file-1", "file-2"]);

        unsafe { remove_env("RELAY_TEST_KEY_A") };
    }

    #[test]
    fn missing_keys_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"
[server]
listen_addr = "127.0.0.1:5000"

[pool]
key_env = []
keys_file = "/nonexistent/relay/keys"
"#,
        );

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("keys_file"), "got: {err}");
    }

    #[test]
    fn load_missing_file() {
        assert!(Config::load(Path::new("/nonexistent/path/config.toml")).is_err());
    }

    #[test]
    fn load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "not valid {{{{ toml");
        assert!(matches!(
            Config::load(&path).unwrap_err(),
            common::Error::Toml(_)
        ));
    }

    #[test]
    fn missing_server_section_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "[backend]\nmodel = \"gemini-2.5-pro\"\n");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn invalid_base_url_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"
[server]
listen_addr = "127.0.0.1:5000"

[backend]
base_url = "generativelanguage.googleapis.com"

[pool]
key_env = []
"#,
        );
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("base_url"), "got: {err}");
    }

    #[test]
    fn zero_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cases = [
            ("[backend]\ntimeout_secs = 0\n", "timeout_secs"),
            ("[pool]\nkey_env = []\ncooldown_secs = 0\n", "cooldown_secs"),
        ];
        for (section, field) in cases {
            let path = write_config(
                dir.path(),
                &format!("[server]\nlisten_addr = \"127.0.0.1:5000\"\n\n{section}"),
            );
            let err = Config::load(&path).unwrap_err();
            assert!(err.to_string().contains(field), "{field}: got {err}");
        }

        let path = write_config(
            dir.path(),
            "[server]\nlisten_addr = \"127.0.0.1:5000\"\nmax_connections = 0\n",
        );
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("max_connections"), "got: {err}");
    }

    #[test]
    fn custom_template_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let template_path = dir.path().join("prompt.txt");
        std::fs::write(&template_path, "Q: {question}\nA:").unwrap();
        let path = write_config(
            dir.path(),
            &format!(
                r#"
[server]
listen_addr = "127.0.0.1:5000"

[pool]
key_env = []

[prompt]
template_file = "{}"
fallback_answer = "Sorry, no answer."
"#,
                template_path.display()
            ),
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.prompt.template, "Q: {question}\nA:");
        assert_eq!(
            config.prompt.fallback_answer.as_deref(),
            Some("Sorry, no answer.")
        );
    }

    #[test]
    fn template_without_placeholder_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let template_path = dir.path().join("prompt.txt");
        std::fs::write(&template_path, "no placeholder").unwrap();
        let path = write_config(
            dir.path(),
            &format!(
                "[server]\nlisten_addr = \"127.0.0.1:5000\"\n\n[pool]\nkey_env = []\n\n[prompt]\ntemplate_file = \"{}\"\n",
                template_path.display()
            ),
        );

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("{question}"), "got: {err}");
    }

    #[test]
    fn server_options_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"
[server]
listen_addr = "0.0.0.0:8080"
max_connections = 50
admin_listen_addr = "127.0.0.1:9090"
cors_origins = ["https://ztxhosting.example"]

[pool]
key_env = []
"#,
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.max_connections, 50);
        assert_eq!(
            config.server.admin_listen_addr,
            Some("127.0.0.1:9090".parse().unwrap())
        );
        assert_eq!(config.server.cors_origins, vec!["https://ztxhosting.example"]);
    }

    #[test]
    fn resolve_path_cli_arg() {
        assert_eq!(
            Config::resolve_path(Some("/etc/relay.toml")),
            PathBuf::from("/etc/relay.toml")
        );
    }

    #[test]
    fn resolve_path_env_then_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/from/env.toml") };
        assert_eq!(Config::resolve_path(None), PathBuf::from("/from/env.toml"));
        assert_eq!(
            Config::resolve_path(Some("/cli.toml")),
            PathBuf::from("/cli.toml")
        );

        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(
            Config::resolve_path(None),
            PathBuf::from("support-relay.toml")
        );
    }

    #[test]
    fn keys_are_redacted_in_debug() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), minimal_toml());
        unsafe { set_env("RELAY_TEST_KEY_A", "AIzaSy-very-secret") };

        let config = Config::load(&path).unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("AIzaSy-very-secret"), "leaked: {debug}");

        unsafe { remove_env("RELAY_TEST_KEY_A") };
    }
}
