//! Request pipelines: a resolved, ordered chain of module invocations.
//!
//! [`builder`] turns (tenant enabled set × request method/path) into a
//! [`Pipeline`]; [`executor`] runs one sequentially against live backends.

pub mod builder;
pub mod executor;

pub use builder::PipelineBuilder;
pub use executor::{ExecutorConfig, PipelineExecutor};

use okapi_kernel::{Phase, RoutingEntry};

/// One step of a pipeline: a routing entry bound to the module that
/// declared it.
#[derive(Debug, Clone)]
pub struct PipelineStep {
    pub module_id: String,
    pub entry: RoutingEntry,
}

impl PipelineStep {
    pub fn new(module_id: impl Into<String>, entry: RoutingEntry) -> Self {
        Self {
            module_id: module_id.into(),
            entry,
        }
    }

    /// Filter phase, `None` for the handler step.
    pub fn phase(&self) -> Option<Phase> {
        self.entry.phase
    }
}

/// An ordered chain of steps for one request: pre filters, auth filters,
/// exactly one handler, post filters.  Order is fixed at build time.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    pub steps: Vec<PipelineStep>,
    /// Path the handler is invoked with.  Differs from the request path
    /// only when the resolution followed `redirect` entries.
    pub handler_path: String,
}

impl Pipeline {
    /// Index of the handler step.  Builders always produce exactly one.
    pub fn handler_index(&self) -> Option<usize> {
        self.steps.iter().position(|s| s.entry.is_handler())
    }
}
