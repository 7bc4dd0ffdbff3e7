//! Layered configuration for a single agent process.
//!
//! Loaded from an optional TOML file (`AppConfig::load_from`, default
//! `config/default.toml`) with `serde(default)` on every section so a
//! partial or missing file is valid, then overridden field-by-field by the
//! environment variables enumerated below. Loading is fallible and fails the
//! process at startup — see [`ConfigError`].

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Operating mode fixed for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Voice,
    Text,
    Hybrid,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Text
    }
}

impl std::str::FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "voice" => Ok(Mode::Voice),
            "text" => Ok(Mode::Text),
            "hybrid" => Ok(Mode::Hybrid),
            other => Err(ConfigError::Invalid(format!("unknown MODE {other:?}"))),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("missing required setting: {0}")]
    Missing(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub agent_id: String,
    pub port: u16,
    pub workflow_file: String,
    pub persona_file: String,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            agent_id: "agent".to_string(),
            port: 8080,
            workflow_file: "workflow.json".to_string(),
            persona_file: "persona.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamSection {
    pub gateway_url: String,
    pub local_tools_url: String,
    pub llm_url: String,
    pub llm_api_key: String,
    pub gateway_rpc_timeout_ms: u64,
    pub tool_rpc_timeout_ms: u64,
    pub llm_rpc_timeout_ms: u64,
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            gateway_url: "http://localhost:9000".to_string(),
            local_tools_url: "http://localhost:9100".to_string(),
            llm_url: "http://localhost:9200".to_string(),
            llm_api_key: String::new(),
            gateway_rpc_timeout_ms: 5_000,
            tool_rpc_timeout_ms: 10_000,
            llm_rpc_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub auto_trigger_enabled: bool,
    pub auto_trigger_delay_ms: u64,
    pub handoff_confirmation_delay_ms: u64,
    pub max_session_errors: u32,
    pub error_window_ms: u64,
    pub history_window_turns: usize,
    pub heartbeat_interval_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            auto_trigger_enabled: true,
            auto_trigger_delay_ms: 1_500,
            handoff_confirmation_delay_ms: 2_000,
            max_session_errors: 5,
            error_window_ms: 10_000,
            history_window_turns: 20,
            heartbeat_interval_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySection {
    pub log_level: String,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self { log_level: "info".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub mode: Mode,
    pub agent: AgentSection,
    pub upstream: UpstreamSection,
    pub session: SessionSection,
    pub telemetry: TelemetrySection,
}

impl AppConfig {
    /// Load `path` if it exists, then apply environment overrides from §6.
    /// A missing file is not an error — defaults plus environment still make
    /// a valid configuration.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let mut config = if path_ref.exists() {
            let raw = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
                path: path_ref.display().to_string(),
                source,
            })?;
            toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path_ref.display().to_string(),
                source,
            })?
        } else {
            Self::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the default config path (`CONFIG_FILE` or `config/default.toml`)
    /// and load it.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = env::var("CONFIG_FILE").unwrap_or_else(|_| "config/default.toml".to_string());
        Self::load_from(path)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = env::var("MODE") {
            self.mode = v.parse()?;
        }
        if let Ok(v) = env::var("AGENT_ID") {
            self.agent.agent_id = v;
        }
        if let Ok(v) = env::var("AGENT_PORT") {
            self.agent.port = v
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("AGENT_PORT {v:?} is not a u16")))?;
        }
        if let Ok(v) = env::var("WORKFLOW_FILE") {
            self.agent.workflow_file = v;
        }
        if let Ok(v) = env::var("PERSONA_FILE") {
            self.agent.persona_file = v;
        }
        if let Ok(v) = env::var("GATEWAY_URL") {
            self.upstream.gateway_url = v;
        }
        if let Ok(v) = env::var("LOCAL_TOOLS_URL") {
            self.upstream.local_tools_url = v;
        }
        if let Ok(v) = env::var("LLM_URL") {
            self.upstream.llm_url = v;
        }
        if let Ok(v) = env::var("LLM_API_KEY") {
            self.upstream.llm_api_key = v;
        }
        if let Ok(v) = env::var("AUTO_TRIGGER_ENABLED") {
            self.session.auto_trigger_enabled = parse_bool(&v)?;
        }
        if let Ok(v) = env::var("MAX_SESSION_ERRORS") {
            self.session.max_session_errors = v
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("MAX_SESSION_ERRORS {v:?} is not a u32")))?;
        }
        if let Ok(v) = env::var("ERROR_WINDOW_MS") {
            self.session.error_window_ms = v
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("ERROR_WINDOW_MS {v:?} is not a u64")))?;
        }
        if let Ok(v) = env::var("LOG_LEVEL") {
            self.telemetry.log_level = v;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.agent_id.trim().is_empty() {
            return Err(ConfigError::Missing("AGENT_ID"));
        }
        if self.agent.workflow_file.trim().is_empty() {
            return Err(ConfigError::Missing("WORKFLOW_FILE"));
        }
        if self.agent.persona_file.trim().is_empty() {
            return Err(ConfigError::Missing("PERSONA_FILE"));
        }
        Ok(())
    }

    pub fn gateway_rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream.gateway_rpc_timeout_ms)
    }

    pub fn tool_rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream.tool_rpc_timeout_ms)
    }

    pub fn llm_rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream.llm_rpc_timeout_ms)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let rendered = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Invalid(format!("failed to render config: {e}")))?;
        fs::write(path_ref, rendered).map_err(|source| ConfigError::Read {
            path: path_ref.display().to_string(),
            source,
        })?;
        Ok(())
    }
}

fn parse_bool(v: &str) -> Result<bool, ConfigError> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::Invalid(format!("expected boolean, got {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.mode, Mode::Text);
        assert_eq!(config.session.max_session_errors, 5);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = AppConfig::load_from("/nonexistent/path/default.toml").unwrap();
        assert_eq!(config.agent.agent_id, "agent");
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        fs::write(&path, "[agent]\nagent_id = \"banking\"\n").unwrap();
        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.agent.agent_id, "banking");
        assert_eq!(config.session.max_session_errors, 5);
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("Voice".parse::<Mode>().unwrap(), Mode::Voice);
        assert_eq!("HYBRID".parse::<Mode>().unwrap(), Mode::Hybrid);
        assert!("nonsense".parse::<Mode>().is_err());
    }
}
