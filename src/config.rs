use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{
    env,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com";
pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

pub const DEFAULT_SYSTEM_PROMPT: &str = "Du bist ein Baukontroll-KI-System. Analysiere das Bild nach DIN 18202 (Toleranzen im Hochbau) und anderen Bauvorschriften. Berichte über sichtbare Abweichungen oder Fehler.";
pub const DEFAULT_USER_PROMPT: &str = "Bitte überprüfe dieses Baustellenbild und liste alle erkennbaren baulichen Mängel oder Verstöße gegen Normen wie DIN 18202 auf.";

/// Environment variables checked, in order, when the config file has no key.
pub const API_KEY_ENV_VARS: [&str; 2] = ["OPENAI_API_KEY", "VITE_OPENAI_API_KEY"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LLMConfig,
    pub prompts: PromptConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LLMConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    /// Unset means the request waits as long as the HTTP client lets it.
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub system: String,
    pub user: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            model: "gpt-4-vision-preview".to_string(),
            max_tokens: 1000,
            timeout_seconds: None,
        }
    }
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            system: DEFAULT_SYSTEM_PROMPT.to_string(),
            user: DEFAULT_USER_PROMPT.to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LLMConfig {
    /// Full chat-completions URL, honouring a custom `base_url`.
    pub fn endpoint(&self) -> String {
        let base = self
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_ENDPOINT)
            .trim_end_matches('/');
        format!("{}{}", base, CHAT_COMPLETIONS_PATH)
    }
}

impl Config {
    /// Get the default config file path (~/.site-inspector.toml)
    pub fn default_config_path() -> crate::Result<PathBuf> {
        let home_dir = env::var("HOME")
            .or_else(|_| env::var("USERPROFILE"))
            .map_err(|_| anyhow::anyhow!("Could not determine home directory"))?;
        Ok(PathBuf::from(home_dir).join(".site-inspector.toml"))
    }

    /// Load config from the default location, falling back to defaults if the file doesn't exist
    pub fn load() -> crate::Result<Self> {
        let config_path = Self::default_config_path()?;

        let config = if config_path.exists() {
            Self::from_file(&config_path)?
        } else {
            Self::default()
        };

        Ok(config.with_env_api_key(|name| env::var(name).ok()))
    }

    /// Load from an explicit path if given, else from the default location
    pub fn load_from(path: Option<&PathBuf>) -> crate::Result<Self> {
        match path {
            Some(path) => {
                let config = Self::from_file(path)?;
                Ok(config.with_env_api_key(|name| env::var(name).ok()))
            }
            None => Self::load(),
        }
    }

    /// Load config from a specific file path
    pub fn from_file(path: &PathBuf) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Write the documented default config, creating parent directories
    pub fn write_documented(path: &Path) -> crate::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        std::fs::write(path, Self::create_documented_config())
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Fill a missing API key from the environment. `lookup` is injected so
    /// tests don't have to touch the process environment.
    pub fn with_env_api_key<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.llm.api_key.is_none() {
            self.llm.api_key = API_KEY_ENV_VARS
                .iter()
                .find_map(|name| lookup(name).filter(|v| !v.trim().is_empty()));
        }
        self
    }

    /// Create a config file with all available options documented
    pub fn create_documented_config() -> String {
        format!(
            r#"# Site Inspector Configuration File
# Controls how construction-site photos are sent for analysis

[llm]
# API key for the chat-completions endpoint. Leave unset to read
# OPENAI_API_KEY (or VITE_OPENAI_API_KEY) from the environment.
# api_key = "your-api-key-here"

# Base URL of an OpenAI-compatible server (default: {endpoint})
# base_url = "https://api.openai.com"

# Vision-capable model to use
model = "gpt-4-vision-preview"

# Maximum tokens for the assessment
max_tokens = 1000

# Request timeout in seconds. Unset waits indefinitely.
# timeout_seconds = 120

[prompts]
# Instructions sent with every image. Edit to change the inspection focus.
system = "{system}"
user = "{user}"

[logging]
# Log level: error, warn, info, debug, trace (RUST_LOG overrides this)
level = "info"
"#,
            endpoint = DEFAULT_ENDPOINT,
            system = DEFAULT_SYSTEM_PROMPT,
            user = DEFAULT_USER_PROMPT,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_inspection_setup() {
        let config = Config::default();
        assert_eq!(config.llm.model, "gpt-4-vision-preview");
        assert_eq!(config.llm.max_tokens, 1000);
        assert!(config.llm.timeout_seconds.is_none());
        assert!(config.prompts.system.contains("DIN 18202"));
        assert_eq!(
            config.llm.endpoint(),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_custom_base_url_trailing_slash() {
        let mut llm = LLMConfig::default();
        llm.base_url = Some("http://localhost:8080/".to_string());
        assert_eq!(llm.endpoint(), "http://localhost:8080/v1/chat/completions");
    }

    #[test]
    fn test_env_key_fills_missing_key_only() {
        let from_env = Config::default().with_env_api_key(|name| match name {
            "VITE_OPENAI_API_KEY" => Some("sk-vite".to_string()),
            _ => None,
        });
        assert_eq!(from_env.llm.api_key.as_deref(), Some("sk-vite"));

        let mut explicit = Config::default();
        explicit.llm.api_key = Some("sk-file".to_string());
        let explicit = explicit.with_env_api_key(|_| Some("sk-env".to_string()));
        assert_eq!(explicit.llm.api_key.as_deref(), Some("sk-file"));
    }

    #[test]
    fn test_documented_config_parses_to_defaults() {
        let parsed: Config = toml::from_str(&Config::create_documented_config()).unwrap();
        assert_eq!(parsed.llm.model, "gpt-4-vision-preview");
        assert_eq!(parsed.prompts.system, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(parsed.prompts.user, DEFAULT_USER_PROMPT);
        assert_eq!(parsed.logging.level, "info");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "[prompts]\nuser = \"Nur Risse prüfen.\"\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.prompts.user, "Nur Risse prüfen.");
        assert_eq!(config.prompts.system, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(config.llm.max_tokens, 1000);
    }

    #[test]
    fn test_write_documented_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        Config::write_documented(&path).unwrap();

        let reloaded = Config::from_file(&path).unwrap();
        assert_eq!(reloaded.llm.model, "gpt-4-vision-preview");
        assert!(reloaded.llm.api_key.is_none());
        assert!(reloaded.llm.timeout_seconds.is_none());
    }

    #[test]
    fn test_missing_file_keeps_io_error_in_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");

        let err = Config::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
        let io = err.downcast_ref::<std::io::Error>().unwrap();
        assert_eq!(io.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn test_invalid_toml_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[llm\nmodel = 3").unwrap();

        let err = Config::from_file(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("broken.toml"));
    }
}
