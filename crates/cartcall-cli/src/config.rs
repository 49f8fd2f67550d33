//! Configuration file support

use cartcall_session::SessionConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for cartcall
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Session gateway base URL
    pub gateway_url: Option<String>,
    /// Bearer token for the gateway (alternative to CARTCALL_TOKEN)
    pub token: Option<String>,
    /// Room to join
    pub room: Option<String>,
    /// Participant identity
    pub identity: Option<String>,
    /// Session tuning
    #[serde(default)]
    pub session: SessionTuning,
}

/// Optional overrides for the orchestrator defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionTuning {
    pub max_retries: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub idle_timeout_secs: Option<u64>,
    pub probe_timeout_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub end_on_order_placed: Option<bool>,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cartcall")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("CARTCALL_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load config from file
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(&path) {
            Ok(content) => match Self::parse(&content) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Warning: Failed to parse config file: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                eprintln!("Warning: Failed to read config file: {}", e);
                Self::default()
            }
        }
    }

    /// Save config to file
    pub fn save(&self) -> std::io::Result<()> {
        let path = Self::config_path();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let content = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, content)
    }

    /// Create a default config file if it doesn't exist
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }

        let default_config = Config {
            gateway_url: Some("http://localhost:7880".to_string()),
            room: Some("shop".to_string()),
            identity: Some("shopper".to_string()),
            ..Default::default()
        };

        default_config.save()?;
        Ok(path)
    }

    /// Gateway token from config, falling back to CARTCALL_TOKEN
    pub fn get_token(&self) -> Option<String> {
        self.token
            .clone()
            .or_else(|| std::env::var("CARTCALL_TOKEN").ok())
    }
}

impl SessionTuning {
    /// Overlay the configured values onto `config`
    pub fn apply(&self, config: &mut SessionConfig) {
        if let Some(max_retries) = self.max_retries {
            config.retry.max_retries = max_retries;
        }
        if let Some(ms) = self.initial_delay_ms {
            config.retry.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.max_delay_ms {
            config.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = self.idle_timeout_secs {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.probe_timeout_secs {
            config.probe_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.connect_timeout_secs {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(end) = self.end_on_order_placed {
            config.end_on_order_placed = end;
        }
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# cartcall configuration file
# Place at ~/.config/cartcall/config.toml (Linux/Mac) or %APPDATA%\cartcall\config.toml (Windows)

# Session gateway base URL
gateway_url = "http://localhost:7880"

# Room the shopping agent is dispatched to
room = "shop"

# Participant identity
identity = "shopper"

# Gateway token (optional - CARTCALL_TOKEN is preferred)
# token = "..."

# Orchestrator tuning (all optional)
[session]
# max_retries = 3
# initial_delay_ms = 500
# max_delay_ms = 8000
# idle_timeout_secs = 30
# probe_timeout_secs = 5
# connect_timeout_secs = 10
# end_on_order_placed = true
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_parses() {
        let config = Config::parse(example_config()).unwrap();
        assert_eq!(config.gateway_url.as_deref(), Some("http://localhost:7880"));
        assert_eq!(config.room.as_deref(), Some("shop"));
        assert_eq!(config.token, None);
        assert_eq!(config.session.max_retries, None);
    }

    #[test]
    fn test_empty_config_is_default() {
        let config = Config::parse("").unwrap();
        assert!(config.gateway_url.is_none());
        assert!(config.identity.is_none());
    }

    #[test]
    fn test_tuning_overrides_defaults() {
        let config = Config::parse(
            r#"
            [session]
            max_retries = 5
            idle_timeout_secs = 12
            end_on_order_placed = false
            "#,
        )
        .unwrap();

        let mut session = SessionConfig::default();
        config.session.apply(&mut session);
        assert_eq!(session.retry.max_retries, 5);
        assert_eq!(session.idle_timeout, Duration::from_secs(12));
        assert!(!session.end_on_order_placed);
        // Untouched values keep their defaults
        assert_eq!(session.retry.initial_delay, Duration::from_millis(500));
        assert_eq!(session.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_config_roundtrips_through_toml() {
        let config = Config {
            gateway_url: Some("https://gw.example".into()),
            identity: Some("ana".into()),
            session: SessionTuning {
                max_delay_ms: Some(4000),
                ..Default::default()
            },
            ..Default::default()
        };
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed = Config::parse(&text).unwrap();
        assert_eq!(parsed.identity.as_deref(), Some("ana"));
        assert_eq!(parsed.session.max_delay_ms, Some(4000));
    }
}
