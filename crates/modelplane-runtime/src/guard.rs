//! Input guardrails

use modelplane_core::{GuardrailConfig, ModelPlaneError, ModelPlaneResult};
use serde_json::Value;

/// Rejects inputs that contain a configured stop word
#[derive(Debug, Clone, Default)]
pub struct Guard {
    stop_words: Vec<String>,
}

impl Guard {
    pub fn new(config: &GuardrailConfig) -> Self {
        Self {
            stop_words: config
                .stop_words
                .iter()
                .map(|w| w.trim().to_lowercase())
                .filter(|w| !w.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stop_words.is_empty()
    }

    /// Check every string in `input`, case-insensitively
    pub fn validate(&self, input: &Value) -> ModelPlaneResult<()> {
        if self.stop_words.is_empty() {
            return Ok(());
        }
        match input {
            Value::String(text) => {
                let text = text.to_lowercase();
                match self.stop_words.iter().find(|w| text.contains(w.as_str())) {
                    Some(word) => Err(ModelPlaneError::validation(format!(
                        "input contains stop word \"{}\"",
                        word
                    ))),
                    None => Ok(()),
                }
            }
            Value::Array(items) => items.iter().try_for_each(|item| self.validate(item)),
            Value::Object(fields) => fields.values().try_for_each(|item| self.validate(item)),
            _ => Ok(()),
        }
    }
}
