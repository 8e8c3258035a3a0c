use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::conversation::DriverSettings;
use crate::evaluation::EvaluationPolicy;
use crate::persona::GeneratorSettings;
use crate::platform::{DEFAULT_API_BASE, DEFAULT_CHAT_BASE};

/// Harness configuration, read from an optional TOML file. Every section and
/// field falls back to its default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub llm: LlmSettings,
    pub platform: PlatformSettings,
    pub run: RunSettings,
    pub conversation: DriverSettings,
    pub generation: GeneratorSettings,
    pub evaluation: EvaluationPolicy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub model: String,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            model: "openai/gpt-4o-mini".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlatformSettings {
    /// Base URL for pathway definitions.
    pub api_base: String,
    /// Base URL for pathway chats.
    pub chat_base: String,
}

impl Default for PlatformSettings {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_owned(),
            chat_base: DEFAULT_CHAT_BASE.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    pub persona_count: usize,
    /// Conversations in flight at once.
    pub parallel: usize,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            persona_count: 3,
            parallel: 1,
        }
    }
}

impl Settings {
    pub async fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&text).context("Failed to parse config TOML")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn partial_file_keeps_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            [conversation]
            max_turns = 12

            [evaluation]
            pass_threshold = 100.0

            [platform]
            chat_base = "http://localhost:8080/v1"
            "#,
        )
        .unwrap();

        assert_eq!(settings.conversation.max_turns, 12);
        assert_eq!(settings.conversation.max_tokens, 150);
        assert_eq!(settings.evaluation.pass_threshold, 100.0);
        assert!(!settings.evaluation.require_goodbye);
        assert_eq!(settings.platform.chat_base, "http://localhost:8080/v1");
        assert_eq!(settings.platform.api_base, DEFAULT_API_BASE);
        assert_eq!(settings.llm.model, "openai/gpt-4o-mini");
        assert_eq!(settings.generation.max_attempts, 3);
        assert_eq!(settings.run.parallel, 1);
    }

    #[tokio::test]
    async fn missing_path_means_defaults() {
        let settings = Settings::load(None).await.unwrap();
        assert_eq!(settings.run.persona_count, 3);
    }

    #[tokio::test]
    async fn unreadable_file_is_an_error() {
        let error = Settings::load(Some(Path::new("/nonexistent/harness.toml")))
            .await
            .unwrap_err();
        assert!(error.to_string().starts_with("Failed to read config file"));
    }
}
