use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_core::config::Config;
use fleet_core::types::{CommandRequest, CommandResult, ConnectionInfo, Decision, Group, Target};
use fleet_transport::{FleetRateLimiter, TransportRegistry};
use tracing::{info, warn};

use crate::audit::AuditLog;
use crate::connection::{ConnectionError, ConnectionManager};
use crate::executor::{CommandExecutor, ExecutorError};
use crate::policy::PolicyEngine;
use crate::registry::{RegistryError, TargetRegistry};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

// ---------------------------------------------------------------------------
// CoordinationService
// ---------------------------------------------------------------------------

/// Facade over the coordination core.
///
/// Owns the registry, connection manager, audit log, and executor, wired
/// together from one `Config`. Constructed explicitly and passed around by
/// the host; there is no process-global instance.
pub struct CoordinationService {
    config: Config,
    registry: Arc<TargetRegistry>,
    connections: Arc<ConnectionManager>,
    executor: Arc<CommandExecutor>,
    policy: PolicyEngine,
    audit: Arc<AuditLog>,
}

impl CoordinationService {
    /// Build from config with the built-in transport factories.
    pub async fn new(config: Config) -> Result<Self, ServiceError> {
        Self::with_transports(config, TransportRegistry::with_defaults()).await
    }

    /// Build with a caller-supplied transport registry. Hosts use this to
    /// add custom protocol factories; tests use it to inject mocks.
    pub async fn with_transports(
        config: Config,
        transports: TransportRegistry,
    ) -> Result<Self, ServiceError> {
        let registry = Arc::new(TargetRegistry::new());
        for target in config.targets.clone() {
            registry.register(target, false).await?;
        }
        registry.set_groups(config.groups.clone()).await;

        let security = &config.security;
        let policy = PolicyEngine::new(security.allow_dangerous_commands);
        let limiter = Arc::new(FleetRateLimiter::from_settings(&security.rate_limit));
        let connections = Arc::new(ConnectionManager::new(
            transports,
            security.max_concurrent_connections,
            security.default_timeout_secs,
        ));
        let audit = if security.audit.enabled {
            Arc::new(AuditLog::to_file(&security.audit.path))
        } else {
            Arc::new(AuditLog::disabled())
        };

        let executor = Arc::new(CommandExecutor::new(
            Arc::clone(&registry),
            policy,
            Arc::clone(&limiter),
            Arc::clone(&connections),
            Arc::clone(&audit),
            security.default_timeout_secs,
            security.max_concurrent_connections,
        ));

        info!(
            targets = config.targets.len(),
            groups = config.groups.len(),
            audit = security.audit.enabled,
            "coordination service ready"
        );

        Ok(Self {
            config,
            registry,
            connections,
            executor,
            policy,
            audit,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // -- Targets and groups --

    pub async fn targets(&self) -> Vec<Target> {
        self.registry.all().await
    }

    pub async fn target(&self, name: &str) -> Option<Target> {
        self.registry.get(name).await
    }

    pub async fn targets_by_tag(&self, tag: &str) -> Vec<Target> {
        self.registry.by_tag(tag).await
    }

    pub async fn targets_by_tags(&self, tags: &[&str]) -> Vec<Target> {
        self.registry.by_tags(tags).await
    }

    pub async fn targets_in_group(&self, group: &str) -> Vec<Target> {
        self.registry.targets_in_group(group).await
    }

    /// Dry-run the policy for a command without dispatching it. Returns
    /// `None` when the target is not registered. Nothing is audited and no
    /// rate-limit tokens are consumed.
    pub async fn is_allowed(&self, name: &str, command: &str) -> Option<Decision> {
        let target = self.registry.get(name).await?;
        let groups = self.registry.groups_for(&target).await;
        Some(self.policy.evaluate(&target, &groups, command))
    }

    pub async fn register_target(
        &self,
        target: Target,
        overwrite: bool,
    ) -> Result<(), ServiceError> {
        Ok(self.registry.register(target, overwrite).await?)
    }

    /// Remove a target, tearing down its connection first.
    pub async fn remove_target(&self, name: &str) -> Option<Target> {
        self.connections.disconnect(name).await;
        self.registry.remove(name).await
    }

    pub async fn groups(&self) -> Vec<Group> {
        self.registry.groups().await
    }

    // -- Connections --

    pub async fn connect(&self, name: &str) -> Result<(), ServiceError> {
        let target = self
            .registry
            .get(name)
            .await
            .ok_or_else(|| RegistryError::UnknownTarget(name.to_string()))?;
        Ok(self.connections.connect(&target).await?)
    }

    /// Connect every registered target concurrently, continuing past
    /// failures. Returns how many targets ended up connected.
    pub async fn connect_all(&self) -> usize {
        let targets = self.registry.all().await;
        let results = self.connections.connect_all(targets).await;
        let mut connected = 0;
        for (name, outcome) in results {
            match outcome {
                Ok(()) => connected += 1,
                Err(e) => warn!(target = %name, error = %e, "startup connect failed"),
            }
        }
        connected
    }

    pub async fn disconnect(&self, name: &str) -> bool {
        self.connections.disconnect(name).await
    }

    pub async fn connection_status(&self, name: &str) -> Option<ConnectionInfo> {
        self.connections.info(name).await
    }

    pub async fn connection_statuses(&self) -> HashMap<String, ConnectionInfo> {
        self.connections.statuses().await
    }

    // -- Command dispatch --

    pub async fn execute(&self, request: CommandRequest) -> CommandResult {
        self.executor.execute(request).await
    }

    pub async fn execute_bulk(
        &self,
        targets: &[String],
        command: &str,
        params: serde_json::Value,
        deadline: Option<Duration>,
    ) -> Result<Vec<CommandResult>, ExecutorError> {
        self.executor
            .execute_bulk(targets, command, params, deadline)
            .await
    }

    /// Tear down all sessions and flush the audit backlog.
    pub async fn shutdown(&self) {
        self.connections.disconnect_all().await;
        self.audit.shutdown().await;
        info!("coordination service stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
