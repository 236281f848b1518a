pub mod env_substitution;

use chatflow_core::{ChatflowError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use tracing::debug;

pub use env_substitution::substitute_env_vars;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatflowConfig {
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    File,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,
    #[serde(default = "default_home_dir")]
    pub home_dir: PathBuf,
    #[serde(default = "default_file_name")]
    pub file_name: String,
    /// Reject an insert while the same user/chat already has an active row.
    #[serde(default = "default_enforce_single_active")]
    pub enforce_single_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl ChatflowConfig {
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ChatflowError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let mut raw: serde_json::Value = if yaml.trim().is_empty() {
            serde_json::Value::Null
        } else {
            serde_yaml::from_str(yaml)
                .map_err(|e| ChatflowError::Config(format!("Failed to parse YAML: {}", e)))?
        };

        // A document with only comments parses to null as well
        if raw.is_null() {
            raw = serde_json::Value::Object(serde_json::Map::new());
        }
        substitute_env_vars(&mut raw)?;

        let mut config: ChatflowConfig = serde_json::from_value(raw)
            .map_err(|e| ChatflowError::Config(format!("Invalid configuration: {}", e)))?;

        config.expand_env_vars();
        config.validate()?;

        debug!("Loaded configuration: {:?}", config);
        Ok(config)
    }

    fn expand_env_vars(&mut self) {
        if let Ok(home_dir) = env::var("HOME_DIR") {
            self.store.home_dir = PathBuf::from(home_dir);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.store.file_name.trim().is_empty() {
            return Err(ChatflowError::Config("Store file name cannot be empty".into()));
        }
        if self.store.file_name.contains('/') || self.store.file_name.contains('\\') {
            return Err(ChatflowError::Config(
                "Store file name must not contain path separators".into(),
            ));
        }
        if self.logging.level.trim().is_empty() {
            return Err(ChatflowError::Config("Log level cannot be empty".into()));
        }
        Ok(())
    }

    /// Full path of the conversations file used by the file backend
    pub fn store_path(&self) -> PathBuf {
        self.store.home_dir.join(&self.store.file_name)
    }

    pub fn default_config_path() -> PathBuf {
        default_home_dir().join("chatflow.yaml")
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            home_dir: default_home_dir(),
            file_name: default_file_name(),
            enforce_single_active: default_enforce_single_active(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_backend() -> StoreBackend { StoreBackend::File }
fn default_file_name() -> String { "conversations.json".to_string() }
fn default_enforce_single_active() -> bool { true }
fn default_log_level() -> String { "info".to_string() }

fn default_home_dir() -> PathBuf {
    env::var("HOME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|p| p.join(".chatflow"))
                .unwrap_or_else(|| PathBuf::from("./.chatflow"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let yaml = r#"
store:
  backend: memory
  file_name: bot-conversations.json
  enforce_single_active: false

logging:
  level: debug
  json: true
"#;

        let config = ChatflowConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.file_name, "bot-conversations.json");
        assert!(!config.store.enforce_single_active);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
    }

    #[test]
    fn test_defaults_for_empty_document() {
        let config = ChatflowConfig::from_yaml_str("").unwrap();
        assert_eq!(config.store.backend, StoreBackend::File);
        assert_eq!(config.store.file_name, "conversations.json");
        assert!(config.store.enforce_single_active);
        assert_eq!(config.logging.level, "info");
        assert!(config.store_path().ends_with("conversations.json"));
    }

    #[test]
    fn test_env_substitution_in_values() {
        env::set_var("CHATFLOW_CFG_TEST_LEVEL", "trace");
        let yaml = r#"
logging:
  level: ${CHATFLOW_CFG_TEST_LEVEL}
store:
  file_name: ${CHATFLOW_CFG_TEST_UNSET:-fallback.json}
"#;

        let config = ChatflowConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.logging.level, "trace");
        assert_eq!(config.store.file_name, "fallback.json");
        env::remove_var("CHATFLOW_CFG_TEST_LEVEL");
    }

    #[test]
    fn test_validation() {
        let yaml = r#"
store:
  file_name: ""
"#;
        assert!(ChatflowConfig::from_yaml_str(yaml).is_err());

        let yaml = r#"
store:
  file_name: "nested/conversations.json"
"#;
        assert!(ChatflowConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "store:\n  backend: memory").unwrap();

        let config = ChatflowConfig::from_yaml(file.path()).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Memory);
    }
}
