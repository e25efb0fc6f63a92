//! Pipeline construction: match a request against a tenant's enabled set.
//!
//! Matching walks the enabled modules in enablement order, collecting every
//! filter whose routing entry matches the request and resolving exactly one
//! handler.  Filters run ordered by (phase, level, enablement order); the
//! handler sits between the `auth` and `post` phases.  `redirect`-typed
//! handlers re-resolve against the rewritten path, bounded by a hop limit;
//! filters are collected once, against the original path.

use okapi_kernel::{GatewayError, GatewayResult, InterfaceType, Phase, RoutingType};

use super::{Pipeline, PipelineStep};
use crate::registry::ModuleRegistry;

/// Redirect hops allowed before the chain is declared a loop.
pub const DEFAULT_REDIRECT_LIMIT: usize = 10;

/// Builds a [`Pipeline`] for one request from the registry and a tenant's
/// enabled set.  Borrowing the registry keeps construction allocation-light;
/// callers hold the registry read lock for the duration.
pub struct PipelineBuilder<'a> {
    registry: &'a ModuleRegistry,
    redirect_limit: usize,
}

impl<'a> PipelineBuilder<'a> {
    pub fn new(registry: &'a ModuleRegistry) -> Self {
        Self {
            registry,
            redirect_limit: DEFAULT_REDIRECT_LIMIT,
        }
    }

    pub fn with_redirect_limit(mut self, limit: usize) -> Self {
        self.redirect_limit = limit;
        self
    }

    /// Resolve `method path` against `enabled` (module ids in enablement
    /// order).  `module_selector` carries the `X-Okapi-Module-Id` value, if
    /// the caller sent one, to disambiguate `multiple`-type interfaces.
    ///
    /// Fails with `NotFound` when no handler matches, `Ambiguous` when more
    /// than one does and the selector does not settle it, and `Conflict`
    /// when a redirect chain exceeds the hop limit.
    pub fn build(
        &self,
        enabled: &[String],
        method: &str,
        path: &str,
        module_selector: Option<&str>,
    ) -> GatewayResult<Pipeline> {
        let (handler, handler_path) =
            self.resolve_handler(enabled, method, path, module_selector)?;

        // Filters match the original path, once, regardless of redirects.
        let mut filters: Vec<(u8, u32, usize, PipelineStep)> = Vec::new();
        for (seq, module_id) in enabled.iter().enumerate() {
            let Ok(md) = self.registry.descriptor(module_id) else {
                continue;
            };
            for entry in &md.filters {
                if entry.matches(method, path) {
                    let Some(phase) = entry.phase else { continue };
                    filters.push((
                        phase.rank(),
                        entry.level(),
                        seq,
                        PipelineStep::new(module_id.clone(), entry.clone()),
                    ));
                }
            }
        }
        filters.sort_by_key(|(rank, level, seq, _)| (*rank, *level, *seq));

        let mut steps = Vec::with_capacity(filters.len() + 1);
        let mut rest = Vec::new();
        for (rank, _, _, step) in filters {
            if rank < Phase::Post.rank() {
                steps.push(step);
            } else {
                rest.push(step);
            }
        }
        steps.push(handler);
        steps.extend(rest);

        Ok(Pipeline {
            steps,
            handler_path,
        })
    }

    /// Select the single handler for `method path`, following redirects.
    /// Returns the chosen step and the (possibly rewritten) path it is
    /// invoked with.
    fn resolve_handler(
        &self,
        enabled: &[String],
        method: &str,
        path: &str,
        module_selector: Option<&str>,
    ) -> GatewayResult<(PipelineStep, String)> {
        let mut current = path.to_string();
        for _ in 0..=self.redirect_limit {
            let chosen = self.select_one(enabled, method, &current, module_selector)?;
            if chosen.entry.entry_type == RoutingType::Redirect {
                current = chosen
                    .entry
                    .redirect_path
                    .clone()
                    .ok_or_else(|| {
                        GatewayError::Internal(format!(
                            "redirect entry in module '{}' has no redirectPath",
                            chosen.module_id
                        ))
                    })?;
                continue;
            }
            return Ok((chosen, current));
        }
        Err(GatewayError::Conflict(format!(
            "too many redirects resolving {method} {path}"
        )))
    }

    fn select_one(
        &self,
        enabled: &[String],
        method: &str,
        path: &str,
        module_selector: Option<&str>,
    ) -> GatewayResult<PipelineStep> {
        let mut candidates = self.handler_candidates(enabled, method, path);
        // The selector only arbitrates between several matches; a lone
        // candidate wins regardless of what the header says.
        if candidates.len() > 1 {
            if let Some(selector) = module_selector {
                candidates.retain(|c| c.module_id == selector);
            }
        }
        match candidates.len() {
            0 => Err(GatewayError::NotFound(format!(
                "no module handles {method} {path}"
            ))),
            1 => Ok(candidates.remove(0)),
            _ => {
                let ids: Vec<&str> = candidates.iter().map(|c| c.module_id.as_str()).collect();
                Err(GatewayError::Ambiguous(format!(
                    "{method} {path} is handled by multiple modules: {}",
                    ids.join(", ")
                )))
            }
        }
    }

    /// All handler entries matching the request, in enablement order.
    /// System-typed and `_`-prefixed interfaces are gateway-internal and
    /// never routable from tenant traffic.
    fn handler_candidates(&self, enabled: &[String], method: &str, path: &str) -> Vec<PipelineStep> {
        let mut out = Vec::new();
        for module_id in enabled {
            let Ok(md) = self.registry.descriptor(module_id) else {
                continue;
            };
            for iface in &md.provides {
                if iface.is_system_lifecycle() || iface.interface_type() == InterfaceType::System {
                    continue;
                }
                for entry in &iface.handlers {
                    if entry.is_handler() && entry.matches(method, path) {
                        out.push(PipelineStep::new(module_id.clone(), entry.clone()));
                    }
                }
            }
        }
        out
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use okapi_kernel::{InterfaceDescriptor, ModuleDescriptor, RoutingEntry};

    fn handler(pattern: &str) -> RoutingEntry {
        RoutingEntry {
            methods: vec!["GET".into(), "POST".into()],
            path_pattern: Some(pattern.into()),
            permissions_required: Some(vec![]),
            ..Default::default()
        }
    }

    fn filter(phase: Phase, level: Option<u32>) -> RoutingEntry {
        RoutingEntry {
            methods: vec!["*".into()],
            path: Some("/".into()),
            phase: Some(phase),
            level,
            ..Default::default()
        }
    }

    fn provider(module_id: &str, iface: &str, entries: Vec<RoutingEntry>) -> ModuleDescriptor {
        ModuleDescriptor {
            provides: vec![InterfaceDescriptor {
                handlers: entries,
                ..InterfaceDescriptor::new(iface, "1.0")
            }],
            ..ModuleDescriptor::new(module_id)
        }
    }

    fn registry_with(modules: Vec<ModuleDescriptor>) -> ModuleRegistry {
        let mut reg = ModuleRegistry::new();
        for md in modules {
            let raw = serde_json::to_string(&md).unwrap();
            reg.register(md, raw).unwrap();
        }
        reg
    }

    #[test]
    fn single_handler_no_filters() {
        let reg = registry_with(vec![provider("sample-1.0.0", "sample", vec![handler("/testb")])]);
        let enabled = vec!["sample-1.0.0".to_string()];
        let p = PipelineBuilder::new(&reg)
            .build(&enabled, "GET", "/testb", None)
            .unwrap();
        assert_eq!(p.steps.len(), 1);
        assert_eq!(p.steps[0].module_id, "sample-1.0.0");
        assert_eq!(p.handler_path, "/testb");
    }

    #[test]
    fn no_match_is_not_found() {
        let reg = registry_with(vec![provider("sample-1.0.0", "sample", vec![handler("/testb")])]);
        let enabled = vec!["sample-1.0.0".to_string()];
        let err = PipelineBuilder::new(&reg)
            .build(&enabled, "GET", "/nosuch", None)
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[test]
    fn filters_ordered_pre_auth_handler_post() {
        let auth = ModuleDescriptor {
            filters: vec![filter(Phase::Auth, None)],
            ..ModuleDescriptor::new("auth-1.0.0")
        };
        let pre = ModuleDescriptor {
            filters: vec![filter(Phase::Pre, None)],
            ..ModuleDescriptor::new("pre-1.0.0")
        };
        let post = ModuleDescriptor {
            filters: vec![filter(Phase::Post, None)],
            ..ModuleDescriptor::new("post-1.0.0")
        };
        let sample = provider("sample-1.0.0", "sample", vec![handler("/testb")]);
        let reg = registry_with(vec![auth, pre, post, sample]);
        // Enablement order deliberately scrambled; phase rank wins.
        let enabled: Vec<String> = ["post-1.0.0", "auth-1.0.0", "sample-1.0.0", "pre-1.0.0"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let p = PipelineBuilder::new(&reg)
            .build(&enabled, "GET", "/testb", None)
            .unwrap();
        let order: Vec<&str> = p.steps.iter().map(|s| s.module_id.as_str()).collect();
        assert_eq!(order, vec!["pre-1.0.0", "auth-1.0.0", "sample-1.0.0", "post-1.0.0"]);
    }

    #[test]
    fn level_breaks_ties_within_phase() {
        let a = ModuleDescriptor {
            filters: vec![filter(Phase::Pre, Some(20))],
            ..ModuleDescriptor::new("a-1.0.0")
        };
        let b = ModuleDescriptor {
            filters: vec![filter(Phase::Pre, Some(5))],
            ..ModuleDescriptor::new("b-1.0.0")
        };
        let sample = provider("sample-1.0.0", "sample", vec![handler("/testb")]);
        let reg = registry_with(vec![a, b, sample]);
        let enabled: Vec<String> = ["a-1.0.0", "b-1.0.0", "sample-1.0.0"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let p = PipelineBuilder::new(&reg)
            .build(&enabled, "GET", "/testb", None)
            .unwrap();
        assert_eq!(p.steps[0].module_id, "b-1.0.0");
        assert_eq!(p.steps[1].module_id, "a-1.0.0");
    }

    #[test]
    fn two_plain_handlers_are_ambiguous() {
        let reg = registry_with(vec![
            provider("a-1.0.0", "ia", vec![handler("/testb")]),
            provider("b-1.0.0", "ib", vec![handler("/testb")]),
        ]);
        let enabled: Vec<String> =
            ["a-1.0.0", "b-1.0.0"].iter().map(|s| s.to_string()).collect();
        let err = PipelineBuilder::new(&reg)
            .build(&enabled, "GET", "/testb", None)
            .unwrap_err();
        assert!(matches!(err, GatewayError::Ambiguous(_)));
    }

    #[test]
    fn module_id_selector_settles_multiple_interfaces() {
        let reg = registry_with(vec![
            provider("a-1.0.0", "sample", vec![handler("/testb")]),
            provider("b-1.0.0", "sample", vec![handler("/testb")]),
        ]);
        let enabled: Vec<String> =
            ["a-1.0.0", "b-1.0.0"].iter().map(|s| s.to_string()).collect();
        let p = PipelineBuilder::new(&reg)
            .build(&enabled, "GET", "/testb", Some("b-1.0.0"))
            .unwrap();
        assert_eq!(p.steps[0].module_id, "b-1.0.0");

        // Selector naming a module that does not handle the path: not found.
        let err = PipelineBuilder::new(&reg)
            .build(&enabled, "GET", "/testb", Some("c-1.0.0"))
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[test]
    fn selector_ignored_when_only_one_candidate_matches() {
        // A stale selector must not turn an unambiguous route into a miss;
        // the header only arbitrates between several candidates.
        let reg = registry_with(vec![provider("a-1.0.0", "sample", vec![handler("/testb")])]);
        let enabled = vec!["a-1.0.0".to_string()];
        let p = PipelineBuilder::new(&reg)
            .build(&enabled, "GET", "/testb", Some("gone-9.9.9"))
            .unwrap();
        assert_eq!(p.steps[0].module_id, "a-1.0.0");
    }

    #[test]
    fn redirect_chain_resolves_to_target_path() {
        let redirect = RoutingEntry {
            methods: vec!["GET".into()],
            path: Some("/red".into()),
            entry_type: RoutingType::Redirect,
            redirect_path: Some("/testb".into()),
            permissions_required: Some(vec![]),
            ..Default::default()
        };
        let reg = registry_with(vec![
            provider("redir-1.0.0", "redir", vec![redirect]),
            provider("sample-1.0.0", "sample", vec![handler("/testb")]),
        ]);
        let enabled: Vec<String> = ["redir-1.0.0", "sample-1.0.0"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let p = PipelineBuilder::new(&reg)
            .build(&enabled, "GET", "/red", None)
            .unwrap();
        assert_eq!(p.steps[0].module_id, "sample-1.0.0");
        assert_eq!(p.handler_path, "/testb");
    }

    #[test]
    fn redirect_loop_is_a_conflict() {
        let looping = RoutingEntry {
            methods: vec!["GET".into()],
            path: Some("/loop".into()),
            entry_type: RoutingType::Redirect,
            redirect_path: Some("/loop".into()),
            permissions_required: Some(vec![]),
            ..Default::default()
        };
        let reg = registry_with(vec![provider("loop-1.0.0", "loop", vec![looping])]);
        let enabled = vec!["loop-1.0.0".to_string()];
        let err = PipelineBuilder::new(&reg)
            .build(&enabled, "GET", "/loop", None)
            .unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));
    }

    #[test]
    fn system_interfaces_are_not_routable() {
        let md = ModuleDescriptor {
            provides: vec![InterfaceDescriptor {
                interface_type: Some(InterfaceType::System),
                handlers: vec![handler("/internal")],
                ..InterfaceDescriptor::new("internal", "1.0")
            }],
            ..ModuleDescriptor::new("sys-1.0.0")
        };
        let reg = registry_with(vec![md]);
        let enabled = vec!["sys-1.0.0".to_string()];
        let err = PipelineBuilder::new(&reg)
            .build(&enabled, "GET", "/internal", None)
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[test]
    fn pattern_segment_matching() {
        let reg = registry_with(vec![provider(
            "sample-1.0.0",
            "sample",
            vec![handler("/items/{id}")],
        )]);
        let enabled = vec!["sample-1.0.0".to_string()];
        let b = PipelineBuilder::new(&reg);
        assert!(b.build(&enabled, "GET", "/items/42", None).is_ok());
        assert!(b.build(&enabled, "GET", "/items/42/sub", None).is_err());
        assert!(b.build(&enabled, "GET", "/items/", None).is_err());
    }
}
