//! `okapi-gateway` — runtime for the multi-tenant module gateway.
//!
//! Ties the contract types from `okapi-kernel` to a running service:
//! the module registry, per-tenant enablement, pipeline construction and
//! execution, backend discovery/invocation, and the axum HTTP surface.

pub mod backend;
pub mod error;
pub mod pipeline;
pub mod registry;
pub mod server;
pub mod state;
pub mod tenant;

pub use backend::{DeploymentDescriptor, HttpModuleInvoker, InMemoryDiscovery};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineExecutor, PipelineStep};
pub use registry::ModuleRegistry;
pub use server::{router, serve};
pub use state::{AppState, GatewayConfig};
pub use tenant::{Tenant, TenantStore};
