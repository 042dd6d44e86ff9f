use std::sync::Arc;
use std::time::Duration;

use fleet_core::types::Target;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no transport supports protocol `{0}`")]
    UnsupportedProtocol(String),
    #[error("request timed out")]
    Timeout,
    #[error("authentication failed (status {0})")]
    AuthFailed(u16),
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_connect() {
            TransportError::Refused(e.to_string())
        } else {
            TransportError::Protocol(e.to_string())
        }
    }
}

/// Map auth and non-2xx statuses to transport errors.
pub(crate) fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = resp.status();
    if status.as_u16() == 401 || status.as_u16() == 403 {
        return Err(TransportError::AuthFailed(status.as_u16()));
    }
    if !status.is_success() {
        return Err(TransportError::Status(status.as_u16()));
    }
    Ok(resp)
}

// ---------------------------------------------------------------------------
// Transport trait (the seam the connection manager plugs into)
// ---------------------------------------------------------------------------

/// An established wire channel to one target.
///
/// Implementations own their HTTP client and endpoint layout. The connection
/// manager drives `probe` during connect with retry/backoff; the executor
/// drives `call` with its own timeout on top of the client timeout.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// One-shot liveness check used while establishing the connection.
    async fn probe(&self) -> Result<(), TransportError>;

    /// Dispatch a command and return its structured output.
    async fn call(
        &self,
        command: &str,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, TransportError>;

    /// Graceful teardown. Default is a no-op; stateless HTTP transports
    /// have nothing to release.
    async fn close(&self) {}
}

/// Builds a [`Transport`] for targets whose protocol it recognizes.
///
/// New protocols plug in by implementing this trait and registering the
/// factory; nothing in the dispatch path enumerates protocol names.
pub trait TransportFactory: Send + Sync {
    /// Short factory name for logs.
    fn name(&self) -> &'static str;

    fn supports(&self, protocol: &str) -> bool;

    fn create(&self, target: &Target) -> Result<Box<dyn Transport>, TransportError>;
}

// ---------------------------------------------------------------------------
// TransportRegistry
// ---------------------------------------------------------------------------

/// Ordered collection of transport factories. The first factory that claims
/// a protocol wins, so hosts can shadow a built-in by registering first.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    factories: Vec<Arc<dyn TransportFactory>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the built-in MCP and legacy HTTP factories.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::mcp::McpSseFactory));
        registry.register(Arc::new(crate::mcp::McpHttpFactory));
        registry.register(Arc::new(crate::legacy::LegacyHttpFactory));
        registry
    }

    pub fn register(&mut self, factory: Arc<dyn TransportFactory>) {
        self.factories.push(factory);
    }

    pub fn resolve(&self, protocol: &str) -> Option<&Arc<dyn TransportFactory>> {
        self.factories.iter().find(|f| f.supports(protocol))
    }

    /// Build a transport for the target, or fail if no factory claims its
    /// protocol.
    pub fn create(&self, target: &Target) -> Result<Box<dyn Transport>, TransportError> {
        match self.resolve(&target.protocol) {
            Some(factory) => {
                tracing::debug!(
                    target = %target.name,
                    protocol = %target.protocol,
                    factory = factory.name(),
                    "building transport"
                );
                factory.create(target)
            }
            None => Err(TransportError::UnsupportedProtocol(target.protocol.clone())),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared HTTP plumbing for the built-in transports
// ---------------------------------------------------------------------------

/// Base URL for a target. Targets with TLS verification disabled are lab
/// hosts reached over plain http.
pub(crate) fn base_url(target: &Target) -> String {
    let scheme = if target.tls_verify { "https" } else { "http" };
    format!("{scheme}://{}:{}", target.host, target.port)
}

/// reqwest client carrying the target's auth header, custom headers, and
/// per-request timeout.
pub(crate) fn build_client(target: &Target) -> Result<reqwest::Client, TransportError> {
    use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};

    let mut headers = HeaderMap::new();
    if let Some(token) = &target.auth_token {
        let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| TransportError::Protocol(format!("invalid auth token: {e}")))?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }
    for (name, value) in &target.custom_headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransportError::Protocol(format!("invalid header name `{name}`: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| TransportError::Protocol(format!("invalid header value: {e}")))?;
        headers.insert(name, value);
    }

    let mut builder = reqwest::Client::builder()
        .default_headers(headers)
        .danger_accept_invalid_certs(!target.tls_verify);
    if let Some(secs) = target.timeout_secs {
        builder = builder.timeout(Duration::from_secs(secs));
    }
    builder
        .build()
        .map_err(|e| TransportError::Protocol(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
