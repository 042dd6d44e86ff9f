use std::collections::HashMap;

use fleet_core::types::{Group, Target};
use tokio::sync::RwLock;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate target name: `{0}`")]
    DuplicateTarget(String),
    #[error("unknown target: `{0}`")]
    UnknownTarget(String),
}

// ---------------------------------------------------------------------------
// TargetRegistry
// ---------------------------------------------------------------------------

/// In-memory registry of targets and groups.
///
/// Target names are the single identity used across the stack (audit keys,
/// rate-limit keys, connection keys), so duplicates are rejected unless the
/// caller explicitly asks to overwrite.
#[derive(Debug, Default)]
pub struct TargetRegistry {
    targets: RwLock<HashMap<String, Target>>,
    groups: RwLock<Vec<Group>>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a target. Fails on a duplicate name unless `overwrite` is set.
    pub async fn register(&self, target: Target, overwrite: bool) -> Result<(), RegistryError> {
        let mut targets = self.targets.write().await;
        if !overwrite && targets.contains_key(&target.name) {
            return Err(RegistryError::DuplicateTarget(target.name));
        }
        debug!(target = %target.name, protocol = %target.protocol, "registered target");
        targets.insert(target.name.clone(), target);
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> Option<Target> {
        self.targets.write().await.remove(name)
    }

    pub async fn get(&self, name: &str) -> Option<Target> {
        self.targets.read().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.targets.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn all(&self) -> Vec<Target> {
        self.targets.read().await.values().cloned().collect()
    }

    pub async fn by_tag(&self, tag: &str) -> Vec<Target> {
        self.targets
            .read()
            .await
            .values()
            .filter(|t| t.has_tag(tag))
            .cloned()
            .collect()
    }

    /// Targets carrying at least one of the given tags.
    pub async fn by_tags(&self, tags: &[&str]) -> Vec<Target> {
        self.targets
            .read()
            .await
            .values()
            .filter(|t| tags.iter().any(|tag| t.has_tag(tag)))
            .cloned()
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.targets.read().await.len()
    }

    // -- Groups --

    /// Replace the group definitions. Order is preserved; the policy engine
    /// reports the first restricting group in this order.
    pub async fn set_groups(&self, groups: Vec<Group>) {
        info!(count = groups.len(), "group definitions updated");
        *self.groups.write().await = groups;
    }

    pub async fn groups(&self) -> Vec<Group> {
        self.groups.read().await.clone()
    }

    /// Members of the named group, or empty when no such group exists.
    pub async fn targets_in_group(&self, name: &str) -> Vec<Target> {
        let groups = self.groups.read().await;
        let Some(group) = groups.iter().find(|g| g.name == name) else {
            return Vec::new();
        };
        self.targets
            .read()
            .await
            .values()
            .filter(|t| group.contains(t))
            .cloned()
            .collect()
    }

    /// Groups the target belongs to, in definition order.
    pub async fn groups_for(&self, target: &Target) -> Vec<Group> {
        self.groups
            .read()
            .await
            .iter()
            .filter(|g| g.contains(target))
            .cloned()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
