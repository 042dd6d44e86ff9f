use fleet_core::types::Target;
use serde::Serialize;
use tracing::debug;

use crate::transport::{base_url, build_client, check_status, Transport, TransportError, TransportFactory};

// ---------------------------------------------------------------------------
// Legacy HTTP transport
//
// Pre-MCP admin agents expose `GET /health` and accept commands as
// `POST /command` with a plain JSON body. Kept for fleets that have not
// migrated yet.
// ---------------------------------------------------------------------------

pub struct LegacyHttpTransport {
    client: reqwest::Client,
    base: String,
    target_name: String,
}

#[derive(Serialize)]
struct CommandBody<'a> {
    command: &'a str,
    params: &'a serde_json::Value,
}

impl LegacyHttpTransport {
    pub(crate) fn for_target(target: &Target) -> Result<Self, TransportError> {
        Ok(Self {
            client: build_client(target)?,
            base: base_url(target),
            target_name: target.name.clone(),
        })
    }

    #[cfg(test)]
    fn base(&self) -> &str {
        &self.base
    }
}

#[async_trait::async_trait]
impl Transport for LegacyHttpTransport {
    async fn probe(&self) -> Result<(), TransportError> {
        let resp = self
            .client
            .get(format!("{}/health", self.base))
            .send()
            .await?;
        check_status(resp)?;
        debug!(target = %self.target_name, "legacy health probe ok");
        Ok(())
    }

    async fn call(
        &self,
        command: &str,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, TransportError> {
        let resp = self
            .client
            .post(format!("{}/command", self.base))
            .json(&CommandBody { command, params })
            .send()
            .await?;
        let resp = check_status(resp)?;
        resp.json()
            .await
            .map_err(|e| TransportError::Protocol(format!("invalid response body: {e}")))
    }
}

pub struct LegacyHttpFactory;

impl TransportFactory for LegacyHttpFactory {
    fn name(&self) -> &'static str {
        "legacy-http"
    }

    fn supports(&self, protocol: &str) -> bool {
        matches!(protocol, "http" | "https")
    }

    fn create(&self, target: &Target) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(LegacyHttpTransport::for_target(target)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_claims_http_and_https() {
        let f = LegacyHttpFactory;
        assert!(f.supports("http"));
        assert!(f.supports("https"));
        assert!(!f.supports("mcp-sse"));
    }

    #[test]
    fn base_follows_target_scheme() {
        let mut target = Target::new("old-01", "192.168.1.20", 9000);
        target.tls_verify = false;
        let t = LegacyHttpTransport::for_target(&target).unwrap();
        assert_eq!(t.base(), "http://192.168.1.20:9000");
    }

    #[test]
    fn command_body_shape() {
        let params = serde_json::json!({"service": "nginx"});
        let body = CommandBody {
            command: "service_status",
            params: &params,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["command"], "service_status");
        assert_eq!(json["params"]["service"], "nginx");
    }
}
