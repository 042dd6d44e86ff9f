use fleet_core::types::{Decision, DenyReason, Group, RestrictedCategory, Target};
use tracing::debug;

// ---------------------------------------------------------------------------
// Command categories
// ---------------------------------------------------------------------------

/// Commands that can damage or take down a host.
pub const DANGEROUS_COMMANDS: &[&str] = &["shell_exec", "service_restart", "reboot", "shutdown"];

/// Commands that modify files on the target.
pub const FILE_WRITE_COMMANDS: &[&str] = &["write_file", "edit_file", "create_file"];

/// Commands that bounce services.
pub const SERVICE_RESTART_COMMANDS: &[&str] = &["service_restart"];

/// All restricted categories a command falls into. A command can be in
/// several (`service_restart` is both dangerous and a service restart).
pub fn categories_of(command: &str) -> Vec<RestrictedCategory> {
    let mut cats = Vec::new();
    if DANGEROUS_COMMANDS.contains(&command) {
        cats.push(RestrictedCategory::Dangerous);
    }
    if FILE_WRITE_COMMANDS.contains(&command) {
        cats.push(RestrictedCategory::FileWrite);
    }
    if SERVICE_RESTART_COMMANDS.contains(&command) {
        cats.push(RestrictedCategory::ServiceRestart);
    }
    cats
}

// ---------------------------------------------------------------------------
// PolicyEngine
// ---------------------------------------------------------------------------

/// Pure command policy. Holds no mutable state, takes everything it needs
/// as arguments, and always returns the same decision for the same inputs.
///
/// Gate order:
/// 1. the global dangerous-commands switch
/// 2. the target's command whitelist, when it has one
/// 3. category restrictions of every group the target belongs to
///
/// The whitelist is a gate, not a bypass: a whitelisted command still has
/// to clear the dangerous switch and the group restrictions. Across groups
/// the bias is deny; the first restricting group in definition order is
/// named in the reason.
#[derive(Debug, Clone, Copy)]
pub struct PolicyEngine {
    allow_dangerous: bool,
}

impl PolicyEngine {
    pub fn new(allow_dangerous: bool) -> Self {
        Self { allow_dangerous }
    }

    pub fn evaluate(&self, target: &Target, groups: &[Group], command: &str) -> Decision {
        let categories = categories_of(command);

        if !self.allow_dangerous && categories.contains(&RestrictedCategory::Dangerous) {
            debug!(target = %target.name, command, "denied: dangerous commands disabled");
            return Decision::Denied {
                reason: DenyReason::DangerousDisabled {
                    command: command.to_string(),
                },
            };
        }

        // An empty whitelist means no whitelist at all.
        if let Some(allowed) = &target.allowed_commands {
            if !allowed.is_empty() && !allowed.iter().any(|c| c == command) {
                debug!(target = %target.name, command, "denied: not on target whitelist");
                return Decision::Denied {
                    reason: DenyReason::NotWhitelisted {
                        command: command.to_string(),
                    },
                };
            }
        }

        for group in groups {
            for &category in &categories {
                if group.restrictions.denies(category) {
                    debug!(
                        target = %target.name,
                        command,
                        group = %group.name,
                        %category,
                        "denied: group restriction"
                    );
                    return Decision::Denied {
                        reason: DenyReason::GroupRestriction {
                            group: group.name.clone(),
                            category,
                        },
                    };
                }
            }
        }

        Decision::Allowed
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
