use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Target
// ---------------------------------------------------------------------------

/// A remote admin target the fleet can dispatch commands to.
///
/// Targets are normally loaded from the JSON config document but can also be
/// registered at runtime. The name is the registry key and must be unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    /// Unique name, used as the registry key and the audit/rate-limit key.
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Transport protocol identifier, e.g. `mcp-sse`, `mcp-http`, `http`.
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Bearer token sent as `Authorization: Bearer <token>`.
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Free-form tags, used for group membership and lookup.
    #[serde(default)]
    pub tags: Vec<String>,
    /// When false the target is reached over plain http and certificate
    /// checks are skipped. Intended for lab hosts only.
    #[serde(default = "default_true")]
    pub tls_verify: bool,
    /// Per-command timeout in seconds. Falls back to the security
    /// section's `default_timeout_secs` when unset.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Connection attempts before giving up.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Extra headers sent on every request to this target.
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,
    /// When present, only these commands may run on this target. The
    /// whitelist is a gate: listed commands still pass policy checks.
    #[serde(default)]
    pub allowed_commands: Option<Vec<String>>,
}

fn default_protocol() -> String {
    "mcp-sse".into()
}
fn default_true() -> bool {
    true
}
fn default_retry_attempts() -> u32 {
    3
}

impl Target {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            protocol: default_protocol(),
            auth_token: None,
            tags: Vec::new(),
            tls_verify: true,
            timeout_secs: None,
            retry_attempts: default_retry_attempts(),
            custom_headers: HashMap::new(),
            allowed_commands: None,
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

/// A named set of targets selected by tag, with optional extra restrictions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    /// A target belongs to the group when it carries at least one of these.
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub restrictions: GroupRestrictions,
}

impl Group {
    /// Tag-overlap membership test.
    pub fn contains(&self, target: &Target) -> bool {
        self.tags.iter().any(|t| target.has_tag(t))
    }
}

/// Command categories a group can forbid on its members.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRestrictions {
    #[serde(default)]
    pub deny_dangerous: bool,
    #[serde(default)]
    pub deny_file_writes: bool,
    #[serde(default)]
    pub deny_service_restarts: bool,
}

impl GroupRestrictions {
    pub fn denies(&self, category: RestrictedCategory) -> bool {
        match category {
            RestrictedCategory::Dangerous => self.deny_dangerous,
            RestrictedCategory::FileWrite => self.deny_file_writes,
            RestrictedCategory::ServiceRestart => self.deny_service_restarts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestrictedCategory {
    Dangerous,
    FileWrite,
    ServiceRestart,
}

impl std::fmt::Display for RestrictedCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Dangerous => "dangerous",
            Self::FileWrite => "file-write",
            Self::ServiceRestart => "service-restart",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Connection state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Observable connection state for one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub status: ConnectionStatus,
    pub connected_at: Option<DateTime<Utc>>,
    /// When the target last answered (or failed) a health probe.
    pub last_probe: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Failed probes since the last successful one.
    pub consecutive_failures: u32,
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            connected_at: None,
            last_probe: None,
            last_error: None,
            consecutive_failures: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// A single command dispatch against one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Correlation id, carried through the result and the audit record.
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub target: String,
    pub command: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Overrides the target's own timeout when set.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl CommandRequest {
    pub fn new(
        target: impl Into<String>,
        command: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            target: target.into(),
            command: command.into(),
            params,
            timeout_secs: None,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// Why a command dispatch did not produce output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UnknownTarget,
    NotAllowed,
    RateLimited,
    Connection,
    NotConnected,
    Timeout,
    Execution,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::UnknownTarget => "unknown_target",
            Self::NotAllowed => "not_allowed",
            Self::RateLimited => "rate_limited",
            Self::Connection => "connection",
            Self::NotConnected => "not_connected",
            Self::Timeout => "timeout",
            Self::Execution => "execution",
        };
        f.write_str(s)
    }
}

/// The outcome of one command dispatch. Failures are represented in-band,
/// never as an `Err`, so bulk results can carry a mix of both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub target: String,
    pub correlation_id: Uuid,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

impl CommandResult {
    pub fn ok(
        target: impl Into<String>,
        correlation_id: Uuid,
        output: serde_json::Value,
        duration_ms: u64,
    ) -> Self {
        Self {
            target: target.into(),
            correlation_id,
            success: true,
            output: Some(output),
            failure: None,
            error: None,
            duration_ms,
            finished_at: Utc::now(),
        }
    }

    pub fn fail(
        target: impl Into<String>,
        correlation_id: Uuid,
        kind: FailureKind,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            target: target.into(),
            correlation_id,
            success: false,
            output: None,
            failure: Some(kind),
            error: Some(error.into()),
            duration_ms,
            finished_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Policy decisions
// ---------------------------------------------------------------------------

/// What the policy/rate-limit gates decided for a dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Decision {
    Allowed,
    Denied { reason: DenyReason },
    RateLimited,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum DenyReason {
    /// The command is in the dangerous set and the global switch is off.
    DangerousDisabled { command: String },
    /// The target carries a whitelist and the command is not on it.
    NotWhitelisted { command: String },
    /// A group the target belongs to forbids this command's category.
    GroupRestriction {
        group: String,
        category: RestrictedCategory,
    },
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DangerousDisabled { command } => {
                write!(f, "dangerous command `{command}` is disabled")
            }
            Self::NotWhitelisted { command } => {
                write!(f, "command `{command}` is not whitelisted for this target")
            }
            Self::GroupRestriction { group, category } => {
                write!(f, "group `{group}` forbids {category} commands")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// How a dispatch ended, from the audit log's point of view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failed { error: String },
    /// The command never reached the target (denied or rate limited).
    Skipped,
}

/// One line in the append-only audit log. Exactly one record is written per
/// target per dispatch, whatever the gates decided.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub target: String,
    pub command: String,
    pub correlation_id: Uuid,
    pub decision: Decision,
    pub outcome: Outcome,
}

impl AuditRecord {
    pub fn new(
        target: impl Into<String>,
        command: impl Into<String>,
        correlation_id: Uuid,
        decision: Decision,
        outcome: Outcome,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            target: target.into(),
            command: command.into(),
            correlation_id,
            decision,
            outcome,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
