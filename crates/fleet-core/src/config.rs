use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::envsub::substitute_env;
use crate::types::{Group, Target};

/// Top-level fleet configuration, loaded from a JSON document.
///
/// **Security**: this struct never stores resolved secrets. Tokens appear in
/// the document as `${ENV_VAR}` references and are substituted once, at load
/// time, from the process environment.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl Config {
    /// Load from a specific path, substituting `${VAR}` references first.
    ///
    /// Unresolved variables do not fail the load; their names are returned
    /// alongside the config so callers can warn about them.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<(Self, Vec<String>), ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::parse(&text)
    }

    /// Parse a raw JSON document (after env substitution) and validate it.
    pub fn parse(text: &str) -> Result<(Self, Vec<String>), ConfigError> {
        let (substituted, unresolved) = substitute_env(text);
        for name in &unresolved {
            warn!(var = %name, "config references unset environment variable");
        }
        let cfg: Config =
            serde_json::from_str(&substituted).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok((cfg, unresolved))
    }

    /// Semantic validation for settings not expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = std::collections::BTreeSet::new();
        for target in &self.targets {
            let name = target.name.trim();
            if name.is_empty() {
                return Err(ConfigError::Validation(
                    "targets entries must have a non-empty name".to_string(),
                ));
            }
            if target.host.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "target '{}' has an empty host",
                    name
                )));
            }
            if target.port == 0 {
                return Err(ConfigError::Validation(format!(
                    "target '{}' has port 0",
                    name
                )));
            }
            if !names.insert(name.to_string()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate target name '{}'",
                    name
                )));
            }
        }

        let mut group_names = std::collections::BTreeSet::new();
        for group in &self.groups {
            if group.name.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "groups entries must have a non-empty name".to_string(),
                ));
            }
            if !group_names.insert(group.name.clone()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate group name '{}'",
                    group.name
                )));
            }
        }

        self.security.validate()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Master switch for the dangerous command set. Off by default.
    #[serde(default)]
    pub allow_dangerous_commands: bool,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_connections: usize,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub audit: AuditSettings,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allow_dangerous_commands: false,
            max_concurrent_connections: default_max_concurrent(),
            default_timeout_secs: default_timeout_secs(),
            rate_limit: RateLimitSettings::default(),
            audit: AuditSettings::default(),
        }
    }
}

impl SecurityConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_connections == 0 {
            return Err(ConfigError::Validation(
                "security.max_concurrent_connections must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.requests_per_minute == 0 {
            return Err(ConfigError::Validation(
                "security.rate_limit.requests_per_minute must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.burst == 0 {
            return Err(ConfigError::Validation(
                "security.rate_limit.burst must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_max_concurrent() -> usize {
    10
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_rpm")]
    pub requests_per_minute: u64,
    #[serde(default = "default_burst")]
    pub burst: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_minute: default_rpm(),
            burst: default_burst(),
        }
    }
}

fn default_rpm() -> u64 {
    60
}
fn default_burst() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_audit_path")]
    pub path: String,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_audit_path(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_audit_path() -> String {
    "logs/audit.ndjson".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_daemon_host")]
    pub host: String,
    #[serde(default = "default_daemon_port")]
    pub port: u16,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_daemon_host(),
            port: default_daemon_port(),
        }
    }
}

fn default_daemon_host() -> String {
    "127.0.0.1".into()
}
fn default_daemon_port() -> u16 {
    8700
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
