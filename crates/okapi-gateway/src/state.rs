//! Shared gateway state and environment-driven configuration.

use okapi_kernel::{GatewayError, GatewayResult, ModuleInvoker};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::backend::{HttpModuleInvoker, InMemoryDiscovery};
use crate::pipeline::builder::DEFAULT_REDIRECT_LIMIT;
use crate::pipeline::ExecutorConfig;
use crate::registry::ModuleRegistry;
use crate::tenant::TenantStore;

/// Gateway configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Listen port (`OKAPI_PORT`, default 9130).
    pub port: u16,
    /// Per-step backend timeout (`OKAPI_STEP_TIMEOUT_MS`, default 30000).
    pub step_timeout: Duration,
    /// Redirect hop limit (`OKAPI_REDIRECT_LIMIT`, default 10).
    pub redirect_limit: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 9130,
            step_timeout: Duration::from_secs(30),
            redirect_limit: DEFAULT_REDIRECT_LIMIT,
        }
    }
}

impl GatewayConfig {
    /// Build from environment variables, falling back to defaults.
    /// Unparseable values are rejected rather than silently defaulted.
    pub fn from_env() -> GatewayResult<Self> {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("OKAPI_PORT") {
            cfg.port = v
                .parse()
                .map_err(|_| GatewayError::Validation(format!("invalid OKAPI_PORT '{v}'")))?;
        }
        if let Ok(v) = std::env::var("OKAPI_STEP_TIMEOUT_MS") {
            let ms: u64 = v.parse().map_err(|_| {
                GatewayError::Validation(format!("invalid OKAPI_STEP_TIMEOUT_MS '{v}'"))
            })?;
            cfg.step_timeout = Duration::from_millis(ms);
        }
        if let Ok(v) = std::env::var("OKAPI_REDIRECT_LIMIT") {
            cfg.redirect_limit = v.parse().map_err(|_| {
                GatewayError::Validation(format!("invalid OKAPI_REDIRECT_LIMIT '{v}'"))
            })?;
        }
        Ok(cfg)
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            step_timeout: self.step_timeout,
        }
    }
}

/// Everything the HTTP handlers share.  The registry sits behind an async
/// `RwLock` (module CRUD is rare, reads are per-request); the tenant store
/// and the deployment map shard internally.
pub struct AppState {
    pub registry: RwLock<ModuleRegistry>,
    pub tenants: TenantStore,
    /// Deployment map, doubling as the pipeline's `Discovery`.
    pub discovery: InMemoryDiscovery,
    pub invoker: Arc<dyn ModuleInvoker>,
    pub config: GatewayConfig,
}

impl AppState {
    /// Production wiring with the HTTP invoker.
    pub fn new(config: GatewayConfig) -> GatewayResult<Arc<Self>> {
        let invoker = Arc::new(HttpModuleInvoker::new()?);
        Ok(Self::with_invoker(config, invoker))
    }

    /// Wiring with an injected invoker, used by tests.
    pub fn with_invoker(config: GatewayConfig, invoker: Arc<dyn ModuleInvoker>) -> Arc<Self> {
        Arc::new(Self {
            registry: RwLock::new(ModuleRegistry::new()),
            tenants: TenantStore::new(),
            discovery: InMemoryDiscovery::new(),
            invoker,
            config,
        })
    }
}
