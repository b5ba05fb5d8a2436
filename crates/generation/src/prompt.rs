//! Support prompt template
//!
//! The template is fixed at startup. Rendering substitutes the customer's
//! question for every `{question}` placeholder and nothing else.

/// Placeholder replaced by the customer's question.
pub const QUESTION_PLACEHOLDER: &str = "{question}";

/// Fixed prompt template with a `{question}` placeholder.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    text: String,
}

impl PromptTemplate {
    /// Build a template, rejecting text without a `{question}` placeholder.
    pub fn new(text: impl Into<String>) -> common::Result<Self> {
        let text = text.into();
        if !text.contains(QUESTION_PLACEHOLDER) {
            return Err(common::Error::Config(format!(
                "prompt template must contain the {QUESTION_PLACEHOLDER} placeholder"
            )));
        }
        Ok(Self { text })
    }

    pub fn render(&self, question: &str) -> String {
        self.text.replace(QUESTION_PLACEHOLDER, question)
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}
