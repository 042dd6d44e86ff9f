use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use fleet_core::types::{ConnectionInfo, ConnectionStatus, Target};
use fleet_transport::{Transport, TransportError, TransportRegistry};
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("not connected to target `{0}`")]
    NotConnected(String),
    #[error("connection to `{target}` failed after {attempts} attempts: {source}")]
    Exhausted {
        target: String,
        attempts: u32,
        source: TransportError,
    },
    #[error("internal error: {0}")]
    Internal(String),
}

// ---------------------------------------------------------------------------
// ConnectionManager
// ---------------------------------------------------------------------------

struct Session {
    transport: Arc<dyn Transport>,
    // Held for the session's lifetime; returns capacity on disconnect.
    _permit: OwnedSemaphorePermit,
}

/// Owns the per-target transports and their lifecycle.
///
/// `connect` probes with retry and exponential backoff while holding one of
/// a bounded number of permits, so at most `max_concurrent` sessions exist
/// (including ones still connecting). `send` requires an established
/// session and never reconnects on its own; callers decide when a
/// reconnect is warranted.
pub struct ConnectionManager {
    transports: TransportRegistry,
    sessions: RwLock<HashMap<String, Session>>,
    infos: RwLock<HashMap<String, ConnectionInfo>>,
    permits: Arc<Semaphore>,
    // One guard per target so concurrent connects to the same target
    // collapse into a single attempt sequence.
    connect_guards: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    /// Probe deadline for targets without their own `timeout_secs`.
    default_timeout_secs: u64,
}

impl ConnectionManager {
    pub fn new(
        transports: TransportRegistry,
        max_concurrent: usize,
        default_timeout_secs: u64,
    ) -> Self {
        Self {
            transports,
            sessions: RwLock::new(HashMap::new()),
            infos: RwLock::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(max_concurrent)),
            connect_guards: DashMap::new(),
            default_timeout_secs: default_timeout_secs.max(1),
        }
    }

    /// Establish a session to the target, retrying failed probes with
    /// exponential backoff (1s, 2s, 4s, ...). A target that is already
    /// connected is left alone.
    pub async fn connect(&self, target: &Target) -> Result<(), ConnectionError> {
        let guard = self
            .connect_guards
            .entry(target.name.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _connecting = guard.lock().await;

        if self.is_connected(&target.name).await {
            return Ok(());
        }

        let transport: Arc<dyn Transport> = Arc::from(self.transports.create(target)?);

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| ConnectionError::Internal(e.to_string()))?;

        self.set_info(&target.name, |info| {
            info.status = ConnectionStatus::Connecting;
            info.connected_at = None;
        })
        .await;

        let max_attempts = target.retry_attempts.max(1);
        let mut last_error = TransportError::Protocol("no attempt made".into());

        // Each probe gets its own deadline so a black-holed host cannot
        // stall the connect path for the OS TCP timeout.
        let probe_deadline = Duration::from_secs(
            target.timeout_secs.unwrap_or(self.default_timeout_secs).max(1),
        );

        for attempt in 0..max_attempts {
            let probed = match tokio::time::timeout(probe_deadline, transport.probe()).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout),
            };
            self.set_info(&target.name, |info| info.last_probe = Some(Utc::now()))
                .await;

            match probed {
                Ok(()) => {
                    info!(target = %target.name, attempt = attempt + 1, "connected");
                    self.sessions.write().await.insert(
                        target.name.clone(),
                        Session {
                            transport,
                            _permit: permit,
                        },
                    );
                    self.set_info(&target.name, |info| {
                        info.status = ConnectionStatus::Connected;
                        info.connected_at = Some(Utc::now());
                        info.last_error = None;
                        info.consecutive_failures = 0;
                    })
                    .await;
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        target = %target.name,
                        attempt = attempt + 1,
                        max_attempts,
                        error = %e,
                        "connect attempt failed"
                    );
                    self.set_info(&target.name, |info| info.consecutive_failures += 1)
                        .await;
                    last_error = e;
                    if attempt + 1 < max_attempts {
                        let backoff = Duration::from_secs(1u64 << attempt.min(5));
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        self.set_info(&target.name, |info| {
            info.status = ConnectionStatus::Failed;
            info.last_error = Some(last_error.to_string());
        })
        .await;
        drop(permit);

        Err(ConnectionError::Exhausted {
            target: target.name.clone(),
            attempts: max_attempts,
            source: last_error,
        })
    }

    /// Dispatch over an established session. Fails with `NotConnected` when
    /// there is none; no implicit reconnect happens here.
    pub async fn send(
        &self,
        name: &str,
        command: &str,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, ConnectionError> {
        let transport = {
            let sessions = self.sessions.read().await;
            match sessions.get(name) {
                Some(session) => Arc::clone(&session.transport),
                None => return Err(ConnectionError::NotConnected(name.to_string())),
            }
        };
        Ok(transport.call(command, params).await?)
    }

    /// Tear down the session. Returns false when there was none.
    pub async fn disconnect(&self, name: &str) -> bool {
        let session = self.sessions.write().await.remove(name);
        match session {
            Some(session) => {
                session.transport.close().await;
                self.set_info(name, |info| {
                    info.status = ConnectionStatus::Disconnected;
                    info.connected_at = None;
                })
                .await;
                info!(target = %name, "disconnected");
                true
            }
            None => false,
        }
    }

    /// Connect every target concurrently. Failures do not stop the rest of
    /// the fan-out; the result maps each target name to its outcome.
    pub async fn connect_all(
        self: &Arc<Self>,
        targets: Vec<Target>,
    ) -> HashMap<String, Result<(), ConnectionError>> {
        let mut tasks = JoinSet::new();
        for target in targets {
            let manager = Arc::clone(self);
            tasks.spawn(async move {
                let outcome = manager.connect(&target).await;
                (target.name, outcome)
            });
        }
        let mut results = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            if let Ok((name, outcome)) = joined {
                results.insert(name, outcome);
            }
        }
        results
    }

    pub async fn disconnect_all(&self) {
        let names: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for name in names {
            self.disconnect(&name).await;
        }
    }

    pub async fn is_connected(&self, name: &str) -> bool {
        self.sessions.read().await.contains_key(name)
    }

    pub async fn info(&self, name: &str) -> Option<ConnectionInfo> {
        self.infos.read().await.get(name).cloned()
    }

    /// Connection state for every target the manager has touched.
    pub async fn statuses(&self) -> HashMap<String, ConnectionInfo> {
        self.infos.read().await.clone()
    }

    async fn set_info<F: FnOnce(&mut ConnectionInfo)>(&self, name: &str, f: F) {
        let mut infos = self.infos.write().await;
        f(infos.entry(name.to_string()).or_default());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
