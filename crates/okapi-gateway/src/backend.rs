//! Live collaborator implementations: HTTP invocation of backend modules
//! and the in-memory deployment map behind the `Discovery` trait.

use async_trait::async_trait;
use dashmap::DashMap;
use okapi_kernel::{
    Discovery, GatewayError, GatewayResult, HttpMethod, ModuleInvoker, ProxyResponse,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

// ─────────────────────────────────────────────────────────────────────────────
// Discovery
// ─────────────────────────────────────────────────────────────────────────────

/// Where a module instance is reachable.  Registered out-of-band through
/// the `/_/discovery` surface; the gateway only reads the URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentDescriptor {
    /// Module this instance serves.
    pub srvc_id: String,
    /// Base URL, e.g. `http://localhost:9131`.
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inst_id: Option<String>,
}

/// Module-id → deployment map.  One instance per module; registering again
/// replaces the previous address.
#[derive(Default)]
pub struct InMemoryDiscovery {
    deployments: DashMap<String, DeploymentDescriptor>,
}

impl InMemoryDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, dd: DeploymentDescriptor) -> GatewayResult<()> {
        if dd.srvc_id.trim().is_empty() {
            return Err(GatewayError::Validation(
                "deployment srvcId cannot be empty".to_string(),
            ));
        }
        if dd.url.trim().is_empty() {
            return Err(GatewayError::Validation(
                "deployment url cannot be empty".to_string(),
            ));
        }
        debug!(module = %dd.srvc_id, url = %dd.url, "deployment registered");
        self.deployments.insert(dd.srvc_id.clone(), dd);
        Ok(())
    }

    pub fn unregister(&self, module_id: &str) -> GatewayResult<()> {
        self.deployments
            .remove(module_id)
            .map(|_| ())
            .ok_or_else(|| GatewayError::NotFound(format!("deployment for '{module_id}'")))
    }

    pub fn list(&self) -> Vec<DeploymentDescriptor> {
        let mut out: Vec<DeploymentDescriptor> = self
            .deployments
            .iter()
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.srvc_id.cmp(&b.srvc_id));
        out
    }
}

#[async_trait]
impl Discovery for InMemoryDiscovery {
    async fn lookup(&self, module_id: &str) -> GatewayResult<String> {
        self.deployments
            .get(module_id)
            .map(|d| d.url.trim_end_matches('/').to_string())
            .ok_or_else(|| {
                GatewayError::BadGateway(format!("no deployment for module '{module_id}'"))
            })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP invoker
// ─────────────────────────────────────────────────────────────────────────────

/// Invokes backend modules over plain HTTP with a pooled [`reqwest`]
/// client.  Hop-by-hop headers are left to the client; everything else is
/// forwarded verbatim.
pub struct HttpModuleInvoker {
    client: reqwest::Client,
}

impl HttpModuleInvoker {
    pub fn new() -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| GatewayError::Internal(format!("http client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ModuleInvoker for HttpModuleInvoker {
    async fn invoke(
        &self,
        address: &str,
        method: HttpMethod,
        path: &str,
        headers: &HashMap<String, String>,
        body: &[u8],
    ) -> GatewayResult<ProxyResponse> {
        let url = format!("{address}{path}");
        let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
            .map_err(|e| GatewayError::Internal(format!("method: {e}")))?;

        let mut req = self.client.request(method, &url);
        for (k, v) in headers {
            if matches!(k.as_str(), "host" | "content-length" | "connection") {
                continue;
            }
            req = req.header(k, v);
        }
        let resp = req
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| GatewayError::BadGateway(format!("request to {url} failed: {e}")))?;

        let status = resp.status().as_u16();
        let mut out_headers = HashMap::new();
        for (k, v) in resp.headers() {
            if let Ok(v) = v.to_str() {
                out_headers.insert(k.as_str().to_lowercase(), v.to_string());
            }
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| GatewayError::BadGateway(format!("reading body from {url}: {e}")))?;
        Ok(ProxyResponse {
            status,
            headers: out_headers,
            body: bytes.to_vec(),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
