use std::sync::Arc;
use std::time::{Duration, Instant};

use fleet_core::types::{
    AuditRecord, CommandRequest, CommandResult, Decision, FailureKind, Outcome,
};
use fleet_transport::FleetRateLimiter;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::connection::{ConnectionError, ConnectionManager};
use crate::policy::PolicyEngine;
use crate::registry::TargetRegistry;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Per-target failures are carried inside `CommandResult`; this error only
/// covers whole-batch misuse.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("bulk request contained no targets")]
    EmptyBulk,
}

// ---------------------------------------------------------------------------
// CommandExecutor
// ---------------------------------------------------------------------------

/// Runs a command through the gate chain: registry lookup, policy, rate
/// limiter, auto-connect, then transport dispatch under a timeout.
///
/// Every dispatch against a registered target writes exactly one audit
/// record, whether the gates let it through or not. Failures never escape
/// as errors; they come back inside the `CommandResult` so bulk batches can
/// mix successes and failures slot by slot.
pub struct CommandExecutor {
    registry: Arc<TargetRegistry>,
    policy: PolicyEngine,
    limiter: Arc<FleetRateLimiter>,
    connections: Arc<ConnectionManager>,
    audit: Arc<AuditLog>,
    /// Command timeout when neither the request nor the target set one.
    default_timeout_secs: u64,
    /// Upper bound on in-flight dispatches within one bulk call.
    bulk_concurrency: usize,
}

impl CommandExecutor {
    pub fn new(
        registry: Arc<TargetRegistry>,
        policy: PolicyEngine,
        limiter: Arc<FleetRateLimiter>,
        connections: Arc<ConnectionManager>,
        audit: Arc<AuditLog>,
        default_timeout_secs: u64,
        bulk_concurrency: usize,
    ) -> Self {
        Self {
            registry,
            policy,
            limiter,
            connections,
            audit,
            default_timeout_secs: default_timeout_secs.max(1),
            bulk_concurrency: bulk_concurrency.max(1),
        }
    }

    /// Dispatch one command against one target.
    pub async fn execute(&self, request: CommandRequest) -> CommandResult {
        let start = Instant::now();

        let Some(target) = self.registry.get(&request.target).await else {
            warn!(target = %request.target, "dispatch to unknown target");
            return CommandResult::fail(
                &request.target,
                request.id,
                FailureKind::UnknownTarget,
                format!("no target named `{}`", request.target),
                elapsed_ms(start),
            );
        };

        let groups = self.registry.groups_for(&target).await;
        let decision = self.policy.evaluate(&target, &groups, &request.command);
        if let Decision::Denied { reason } = &decision {
            let message = reason.to_string();
            self.audit.record(AuditRecord::new(
                &target.name,
                &request.command,
                request.id,
                decision.clone(),
                Outcome::Skipped,
            ));
            return CommandResult::fail(
                &target.name,
                request.id,
                FailureKind::NotAllowed,
                message,
                elapsed_ms(start),
            );
        }

        if let Err(e) = self.limiter.check(&target.name) {
            self.audit.record(AuditRecord::new(
                &target.name,
                &request.command,
                request.id,
                Decision::RateLimited,
                Outcome::Skipped,
            ));
            return CommandResult::fail(
                &target.name,
                request.id,
                FailureKind::RateLimited,
                e.to_string(),
                elapsed_ms(start),
            );
        }

        // Auto-connect exactly once; a failed connect is this dispatch's
        // failure, not a retry loop.
        if !self.connections.is_connected(&target.name).await {
            if let Err(e) = self.connections.connect(&target).await {
                self.audit.record(AuditRecord::new(
                    &target.name,
                    &request.command,
                    request.id,
                    Decision::Allowed,
                    Outcome::Failed {
                        error: e.to_string(),
                    },
                ));
                return CommandResult::fail(
                    &target.name,
                    request.id,
                    FailureKind::Connection,
                    e.to_string(),
                    elapsed_ms(start),
                );
            }
        }

        let timeout_secs = request
            .timeout_secs
            .or(target.timeout_secs)
            .unwrap_or(self.default_timeout_secs);
        let dispatch = self
            .connections
            .send(&target.name, &request.command, &request.params);

        match tokio::time::timeout(Duration::from_secs(timeout_secs), dispatch).await {
            Err(_) => {
                let message = format!("command timed out after {timeout_secs}s");
                self.audit.record(AuditRecord::new(
                    &target.name,
                    &request.command,
                    request.id,
                    Decision::Allowed,
                    Outcome::Failed {
                        error: message.clone(),
                    },
                ));
                CommandResult::fail(
                    &target.name,
                    request.id,
                    FailureKind::Timeout,
                    message,
                    elapsed_ms(start),
                )
            }
            Ok(Err(e)) => {
                let kind = match &e {
                    ConnectionError::NotConnected(_) => FailureKind::NotConnected,
                    _ => FailureKind::Execution,
                };
                self.audit.record(AuditRecord::new(
                    &target.name,
                    &request.command,
                    request.id,
                    Decision::Allowed,
                    Outcome::Failed {
                        error: e.to_string(),
                    },
                ));
                CommandResult::fail(&target.name, request.id, kind, e.to_string(), elapsed_ms(start))
            }
            Ok(Ok(output)) => {
                self.audit.record(AuditRecord::new(
                    &target.name,
                    &request.command,
                    request.id,
                    Decision::Allowed,
                    Outcome::Success,
                ));
                info!(
                    target = %target.name,
                    command = %request.command,
                    duration_ms = elapsed_ms(start),
                    "command dispatched"
                );
                CommandResult::ok(&target.name, request.id, output, elapsed_ms(start))
            }
        }
    }

    /// Dispatch one command against many targets.
    ///
    /// Results come back in request order, one slot per requested target,
    /// with per-target failures isolated to their slot. When `deadline`
    /// expires, targets still in flight are abandoned and their slots are
    /// filled with timeout results; late responses are discarded.
    pub async fn execute_bulk(
        self: &Arc<Self>,
        targets: &[String],
        command: &str,
        params: serde_json::Value,
        deadline: Option<Duration>,
    ) -> Result<Vec<CommandResult>, ExecutorError> {
        if targets.is_empty() {
            return Err(ExecutorError::EmptyBulk);
        }

        let requests: Vec<CommandRequest> = targets
            .iter()
            .map(|t| CommandRequest::new(t.clone(), command, params.clone()))
            .collect();
        let ids: Vec<Uuid> = requests.iter().map(|r| r.id).collect();

        let slots: Vec<Arc<tokio::sync::Mutex<Option<CommandResult>>>> =
            (0..targets.len()).map(|_| Arc::default()).collect();
        let gate = Arc::new(Semaphore::new(self.bulk_concurrency));
        let mut tasks = JoinSet::new();

        for (i, request) in requests.into_iter().enumerate() {
            let executor = Arc::clone(self);
            let slot = Arc::clone(&slots[i]);
            let gate = Arc::clone(&gate);
            tasks.spawn(async move {
                let _permit = gate.acquire_owned().await;
                let result = executor.execute(request).await;
                *slot.lock().await = Some(result);
            });
        }

        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        match deadline {
            Some(deadline) => {
                if tokio::time::timeout(deadline, drain).await.is_err() {
                    warn!(
                        command,
                        deadline_ms = deadline.as_millis() as u64,
                        "bulk deadline expired, abandoning in-flight dispatches"
                    );
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                }
            }
            None => drain.await,
        }

        let mut results = Vec::with_capacity(slots.len());
        for (i, slot) in slots.iter().enumerate() {
            let taken = slot.lock().await.take();
            results.push(match taken {
                Some(result) => result,
                None => CommandResult::fail(
                    &targets[i],
                    ids[i],
                    FailureKind::Timeout,
                    "bulk deadline exceeded",
                    deadline.map(|d| d.as_millis() as u64).unwrap_or_default(),
                ),
            });
        }
        Ok(results)
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use fleet_core::types::{Group, GroupRestrictions, Target};
    use fleet_transport::{
        RateLimitConfig, Transport, TransportError, TransportFactory, TransportRegistry,
    };

    // -- Mock transport plumbing --

    struct EchoTransport {
        delay: Option<Duration>,
        probes: Arc<AtomicU32>,
    }

    #[async_trait::async_trait]
    impl Transport for EchoTransport {
        async fn probe(&self) -> Result<(), TransportError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn call(
            &self,
            command: &str,
            params: &serde_json::Value,
        ) -> Result<serde_json::Value, TransportError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(serde_json::json!({"echo": command, "params": params}))
        }
    }

    /// Per-target dispatch delays, keyed by target name.
    struct EchoFactory {
        delays: HashMap<String, Duration>,
        probes: Arc<AtomicU32>,
    }

    impl TransportFactory for EchoFactory {
        fn name(&self) -> &'static str {
            "echo"
        }
        fn supports(&self, protocol: &str) -> bool {
            protocol == "echo"
        }
        fn create(&self, target: &Target) -> Result<Box<dyn Transport>, TransportError> {
            Ok(Box::new(EchoTransport {
                delay: self.delays.get(&target.name).copied(),
                probes: Arc::clone(&self.probes),
            }))
        }
    }

    struct Harness {
        executor: Arc<CommandExecutor>,
        audit_path: std::path::PathBuf,
        probes: Arc<AtomicU32>,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        async fn audit_records(&self) -> Vec<AuditRecord> {
            // Flush the writer before reading
            self.executor.audit.shutdown().await;
            let text = std::fs::read_to_string(&self.audit_path).unwrap_or_default();
            text.lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect()
        }
    }

    async fn harness(
        targets: Vec<Target>,
        groups: Vec<Group>,
        allow_dangerous: bool,
        per_target_burst: u64,
        delays: HashMap<String, Duration>,
    ) -> Harness {
        let registry = Arc::new(TargetRegistry::new());
        for t in targets {
            registry.register(t, false).await.unwrap();
        }
        registry.set_groups(groups).await;

        let probes = Arc::new(AtomicU32::new(0));
        let mut transports = TransportRegistry::new();
        transports.register(Arc::new(EchoFactory {
            delays,
            probes: Arc::clone(&probes),
        }));

        let limiter = Arc::new(FleetRateLimiter::new(
            RateLimitConfig::per_minute(10_000),
            RateLimitConfig::per_minute(60).with_burst(per_target_burst),
        ));

        let dir = tempfile::tempdir().unwrap();
        let audit_path = dir.path().join("audit.ndjson");
        let audit = Arc::new(AuditLog::to_file(&audit_path));

        let connections = Arc::new(ConnectionManager::new(transports, 10, 30));
        let executor = Arc::new(CommandExecutor::new(
            registry,
            PolicyEngine::new(allow_dangerous),
            limiter,
            connections,
            audit,
            30,
            5,
        ));

        Harness {
            executor,
            audit_path,
            probes,
            _dir: dir,
        }
    }

    fn echo_target(name: &str) -> Target {
        let mut t = Target::new(name, "10.0.0.5", 8080);
        t.protocol = "echo".into();
        t
    }

    #[tokio::test]
    async fn unknown_target_fails_in_band() {
        let h = harness(vec![], vec![], false, 10, HashMap::new()).await;
        let result = h
            .executor
            .execute(CommandRequest::new("ghost", "get_status", serde_json::Value::Null))
            .await;
        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::UnknownTarget));
        assert_eq!(result.target, "ghost");
    }

    #[tokio::test]
    async fn successful_dispatch_audits_success() {
        let h = harness(vec![echo_target("web-01")], vec![], false, 10, HashMap::new()).await;
        let request = CommandRequest::new("web-01", "get_status", serde_json::json!({"v": 1}));
        let id = request.id;

        let result = h.executor.execute(request).await;
        assert!(result.success);
        assert_eq!(result.correlation_id, id);
        assert_eq!(result.output.as_ref().unwrap()["echo"], "get_status");

        let records = h.audit_records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].correlation_id, id);
        assert_eq!(records[0].decision, Decision::Allowed);
        assert_eq!(records[0].outcome, Outcome::Success);
    }

    #[tokio::test]
    async fn denied_command_is_audited_and_skipped() {
        let h = harness(vec![echo_target("web-01")], vec![], false, 10, HashMap::new()).await;
        let result = h
            .executor
            .execute(CommandRequest::new("web-01", "reboot", serde_json::Value::Null))
            .await;
        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::NotAllowed));

        let records = h.audit_records().await;
        assert_eq!(records.len(), 1);
        assert!(matches!(records[0].decision, Decision::Denied { .. }));
        assert_eq!(records[0].outcome, Outcome::Skipped);
        // Nothing reached the wire
        assert_eq!(h.probes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn group_restriction_applies_through_executor() {
        let mut target = echo_target("db-01");
        target.tags = vec!["prod".into()];
        let groups = vec![Group {
            name: "production".into(),
            tags: vec!["prod".into()],
            restrictions: GroupRestrictions {
                deny_file_writes: true,
                ..Default::default()
            },
        }];
        let h = harness(vec![target], groups, true, 10, HashMap::new()).await;

        let result = h
            .executor
            .execute(CommandRequest::new("db-01", "write_file", serde_json::Value::Null))
            .await;
        assert_eq!(result.failure, Some(FailureKind::NotAllowed));
        assert!(result.error.unwrap().contains("production"));
    }

    #[tokio::test]
    async fn rate_limited_dispatch_refused_immediately() {
        let h = harness(vec![echo_target("web-01")], vec![], false, 1, HashMap::new()).await;
        let ok = h
            .executor
            .execute(CommandRequest::new("web-01", "get_status", serde_json::Value::Null))
            .await;
        assert!(ok.success);

        let refused = h
            .executor
            .execute(CommandRequest::new("web-01", "get_status", serde_json::Value::Null))
            .await;
        assert!(!refused.success);
        assert_eq!(refused.failure, Some(FailureKind::RateLimited));

        let records = h.audit_records().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].decision, Decision::RateLimited);
        assert_eq!(records[1].outcome, Outcome::Skipped);
    }

    #[tokio::test]
    async fn auto_connect_happens_once() {
        let h = harness(vec![echo_target("web-01")], vec![], false, 10, HashMap::new()).await;
        for _ in 0..3 {
            let r = h
                .executor
                .execute(CommandRequest::new("web-01", "get_status", serde_json::Value::Null))
                .await;
            assert!(r.success);
        }
        assert_eq!(h.probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_command_times_out() {
        let mut delays = HashMap::new();
        delays.insert("slow-01".to_string(), Duration::from_secs(120));
        let h = harness(vec![echo_target("slow-01")], vec![], false, 10, delays).await;

        let request = CommandRequest::new("slow-01", "get_status", serde_json::Value::Null)
            .with_timeout(1);
        let result = h.executor.execute(request).await;
        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::Timeout));

        let records = h.audit_records().await;
        assert_eq!(records.len(), 1);
        assert!(matches!(records[0].outcome, Outcome::Failed { .. }));
    }

    // -- Bulk --

    #[tokio::test]
    async fn bulk_empty_batch_is_an_error() {
        let h = harness(vec![], vec![], false, 10, HashMap::new()).await;
        let err = h
            .executor
            .execute_bulk(&[], "get_status", serde_json::Value::Null, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::EmptyBulk));
    }

    #[tokio::test]
    async fn bulk_preserves_request_order_and_isolates_failures() {
        let h = harness(
            vec![echo_target("web-01"), echo_target("web-02")],
            vec![],
            false,
            10,
            HashMap::new(),
        )
        .await;

        let names = vec![
            "web-02".to_string(),
            "ghost".to_string(),
            "web-01".to_string(),
        ];
        let results = h
            .executor
            .execute_bulk(&names, "get_status", serde_json::Value::Null, None)
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].target, "web-02");
        assert!(results[0].success);
        assert_eq!(results[1].target, "ghost");
        assert_eq!(results[1].failure, Some(FailureKind::UnknownTarget));
        assert_eq!(results[2].target, "web-01");
        assert!(results[2].success);
    }

    #[tokio::test(start_paused = true)]
    async fn bulk_deadline_fills_pending_slots_with_timeouts() {
        let mut delays = HashMap::new();
        delays.insert("slow-01".to_string(), Duration::from_secs(300));
        let h = harness(
            vec![echo_target("fast-01"), echo_target("slow-01")],
            vec![],
            false,
            10,
            delays,
        )
        .await;

        let names = vec!["fast-01".to_string(), "slow-01".to_string()];
        let results = h
            .executor
            .execute_bulk(
                &names,
                "get_status",
                serde_json::Value::Null,
                Some(Duration::from_secs(5)),
            )
            .await
            .unwrap();

        assert!(results[0].success, "fast target should complete");
        assert!(!results[1].success);
        assert_eq!(results[1].failure, Some(FailureKind::Timeout));
        assert_eq!(results[1].target, "slow-01");
    }

    #[tokio::test]
    async fn bulk_duplicate_targets_get_separate_slots() {
        let h = harness(vec![echo_target("web-01")], vec![], false, 10, HashMap::new()).await;
        let names = vec!["web-01".to_string(), "web-01".to_string()];
        let results = h
            .executor
            .execute_bulk(&names, "get_status", serde_json::Value::Null, None)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].success && results[1].success);
        assert_ne!(results[0].correlation_id, results[1].correlation_id);
    }
}
