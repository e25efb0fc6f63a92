//! Module, interface, tenant, and routing descriptors.
//!
//! These are the persistent data model of the gateway: a
//! [`ModuleDescriptor`] declares what a backend module *provides* and
//! *requires* (versioned [`InterfaceDescriptor`]s) and how requests route to
//! it ([`RoutingEntry`]s).  The JSON wire format uses the camelCase field
//! names the ecosystem expects (`pathPattern`, `interfaceType`,
//! `permissionsRequired`, …).
//!
//! Validation follows the first-error pattern: every `validate()` returns
//! `Ok(())` or the *first* violated rule as a
//! [`GatewayError::Validation`].  Unknown enum tags (`interfaceType`,
//! routing `type`, `phase`) are rejected at deserialization time.

use crate::error::{GatewayError, GatewayResult};
use crate::version;
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Enums
// ─────────────────────────────────────────────────────────────────────────────

/// How an interface is exposed through the gateway.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    /// Routed through the proxy pipeline; at most one provider per tenant.
    #[default]
    Proxy,
    /// Invoked by the gateway itself during lifecycle events (`_tenant`,
    /// `_tenantPermissions`), never by external callers.
    System,
    /// Several simultaneously-enabled providers allowed; disambiguated
    /// per-request by the module-selector header.
    Multiple,
}

impl InterfaceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterfaceType::Proxy => "proxy",
            InterfaceType::System => "system",
            InterfaceType::Multiple => "multiple",
        }
    }
}

/// Filter execution stage relative to the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Pre,
    Auth,
    Post,
}

impl Phase {
    /// Ordering rank: pre=0, auth=1, post=2.
    pub fn rank(&self) -> u8 {
        match self {
            Phase::Pre => 0,
            Phase::Auth => 1,
            Phase::Post => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pre => "pre",
            Phase::Auth => "auth",
            Phase::Post => "post",
        }
    }
}

/// Body/response semantics of a pipeline step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingType {
    /// Body and headers flow through; the step's response replaces the
    /// flowing state (pre filters) or becomes the candidate final response
    /// (handler).
    #[default]
    #[serde(rename = "request-response")]
    RequestResponse,
    /// Body is forwarded, the step's own response is discarded except for
    /// status-override semantics.
    #[serde(rename = "request-only")]
    RequestOnly,
    /// Only headers are forwarded, no body.
    #[serde(rename = "headers")]
    Headers,
    /// Names another path to forward to; resolved at pipeline-build time.
    #[serde(rename = "redirect")]
    Redirect,
    /// Deprecated alias for request-response, kept for system handlers.
    #[serde(rename = "system")]
    System,
}

// ─────────────────────────────────────────────────────────────────────────────
// RoutingEntry
// ─────────────────────────────────────────────────────────────────────────────

/// Default execution level within a phase when none is declared.
pub const DEFAULT_LEVEL: u32 = 10;

/// A single routing rule: which methods and paths it matches, which phase it
/// runs in (absent = handler), and its body/permission semantics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoutingEntry {
    /// HTTP verbs, or `*` for all.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
    /// Literal path.  Mutually exclusive with `path_pattern`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Glob-like pattern (`*`, `{…}`), anchored at both ends.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_pattern: Option<String>,
    /// Filter phase; absent means this entry is a handler.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    /// Execution order within a phase, ascending.  Defaults to
    /// [`DEFAULT_LEVEL`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,
    #[serde(rename = "type")]
    pub entry_type: RoutingType,
    /// Forward target for `redirect`-typed entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_path: Option<String>,
    /// Mandatory (possibly empty) for handlers under a `provides` section.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions_required: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions_desired: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_permissions: Option<Vec<String>>,
}

impl RoutingEntry {
    /// Effective execution level.
    pub fn level(&self) -> u32 {
        self.level.unwrap_or(DEFAULT_LEVEL)
    }

    /// True when this entry is a handler (no phase).
    pub fn is_handler(&self) -> bool {
        self.phase.is_none()
    }

    /// Method match: `*` or exact verb.
    pub fn matches_method(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m == "*" || m == method)
    }

    /// Path match against a concrete request path.
    ///
    /// A literal `path` matches exactly for handlers and as a prefix for
    /// filters (a filter mounted on `/` observes every request).  A
    /// `pathPattern` is matched as an anchored restricted glob where `{…}`
    /// captures one path segment and `*` matches any remainder.
    pub fn matches_path(&self, request_path: &str) -> bool {
        if let Some(p) = &self.path {
            if self.is_handler() {
                return request_path == p;
            }
            return request_path.starts_with(p.as_str());
        }
        if let Some(pat) = &self.path_pattern {
            return glob_match(pat, request_path);
        }
        false
    }

    /// Combined method + path match.
    pub fn matches(&self, method: &str, request_path: &str) -> bool {
        self.matches_method(method) && self.matches_path(request_path)
    }

    /// Validate this entry.
    ///
    /// `in_filters` makes `phase` mandatory; `in_provides` makes
    /// `permissionsRequired` mandatory (handlers carried under a `provides`
    /// section must declare their permissions, even as an empty list).
    pub fn validate(&self, in_filters: bool, in_provides: bool) -> GatewayResult<()> {
        if in_filters && self.phase.is_none() {
            return Err(GatewayError::Validation(
                "filter routing entry must declare a phase".to_string(),
            ));
        }
        let has_path = self.path.as_deref().is_some_and(|p| !p.trim().is_empty());
        let has_pattern = self
            .path_pattern
            .as_deref()
            .is_some_and(|p| !p.trim().is_empty());
        if has_path == has_pattern {
            return Err(GatewayError::Validation(
                "routing entry must have exactly one of path or pathPattern".to_string(),
            ));
        }
        if let Some(pat) = &self.path_pattern {
            validate_pattern(pat)?;
        }
        if self.entry_type == RoutingType::Redirect && self.redirect_path.is_none() {
            return Err(GatewayError::Validation(
                "redirect routing entry must declare redirectPath".to_string(),
            ));
        }
        if in_provides && self.permissions_required.is_none() {
            return Err(GatewayError::Validation(
                "Missing field permissionsRequired".to_string(),
            ));
        }
        Ok(())
    }
}

/// Validate a path pattern against the safe glob subset: letters, digits,
/// `/`, `.`, `_`, `-`, `*`, and balanced `{…}` placeholders.  Regex
/// metacharacters outside this set are rejected.
fn validate_pattern(pattern: &str) -> GatewayResult<()> {
    if !pattern.starts_with('/') {
        return Err(GatewayError::Validation(format!(
            "pathPattern '{pattern}' must start with /"
        )));
    }
    let mut in_brace = false;
    for c in pattern.chars() {
        match c {
            '{' if in_brace => {
                return Err(GatewayError::Validation(format!(
                    "pathPattern '{pattern}' has nested braces"
                )));
            }
            '{' => in_brace = true,
            '}' if !in_brace => {
                return Err(GatewayError::Validation(format!(
                    "pathPattern '{pattern}' has unbalanced braces"
                )));
            }
            '}' => in_brace = false,
            '*' | '/' | '.' | '_' | '-' => {}
            c if c.is_ascii_alphanumeric() => {}
            c => {
                return Err(GatewayError::Validation(format!(
                    "pathPattern '{pattern}' contains invalid character '{c}'"
                )));
            }
        }
    }
    if in_brace {
        return Err(GatewayError::Validation(format!(
            "pathPattern '{pattern}' has unbalanced braces"
        )));
    }
    Ok(())
}

/// Anchored restricted-glob match: `{…}` matches one or more characters
/// excluding `/`; `*` matches any sequence including `/`.
fn glob_match(pattern: &str, path: &str) -> bool {
    fn inner(pat: &[u8], s: &[u8]) -> bool {
        match pat.first() {
            None => s.is_empty(),
            Some(b'*') => {
                let rest = &pat[1..];
                (0..=s.len()).any(|i| inner(rest, &s[i..]))
            }
            Some(b'{') => {
                let Some(close) = pat.iter().position(|&c| c == b'}') else {
                    return false;
                };
                let rest = &pat[close + 1..];
                // One path segment: at least one char, no '/'.
                let seg_end = s.iter().position(|&c| c == b'/').unwrap_or(s.len());
                (1..=seg_end).any(|i| inner(rest, &s[i..]))
            }
            Some(&c) => s.first() == Some(&c) && inner(&pat[1..], &s[1..]),
        }
    }
    inner(pattern.as_bytes(), path.as_bytes())
}

// ─────────────────────────────────────────────────────────────────────────────
// InterfaceDescriptor
// ─────────────────────────────────────────────────────────────────────────────

/// A named, versioned contract a module provides or requires.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InterfaceDescriptor {
    pub id: String,
    /// One triple for provided interfaces; a space-separated OR set of
    /// acceptable baselines for required interfaces.
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface_type: Option<InterfaceType>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub handlers: Vec<RoutingEntry>,
}

impl InterfaceDescriptor {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            interface_type: None,
            handlers: Vec::new(),
        }
    }

    /// Effective interface type (`proxy` when absent).
    pub fn interface_type(&self) -> InterfaceType {
        self.interface_type.unwrap_or_default()
    }

    /// System lifecycle interfaces (`_tenant`, `_tenantPermissions`) are
    /// invoked by the gateway itself and exempt from provider uniqueness.
    pub fn is_system_lifecycle(&self) -> bool {
        self.id.starts_with('_')
    }

    /// True when this (offered) interface satisfies `required`: same id and
    /// a compatible version per [`version::compatible`].
    pub fn is_compatible(&self, required: &InterfaceDescriptor) -> bool {
        self.id == required.id && version::compatible(&self.version, &required.version)
    }

    /// Validate id and version grammar; for provided interfaces also
    /// validate every handler entry.
    pub fn validate(&self, in_provides: bool) -> GatewayResult<()> {
        if self.id.trim().is_empty() {
            return Err(GatewayError::Validation(
                "interface id cannot be empty".to_string(),
            ));
        }
        version::parse_versions(&self.version)
            .map_err(|_| GatewayError::Validation(format!(
                "interface '{}' has invalid version '{}'",
                self.id, self.version
            )))?;
        if in_provides {
            for h in &self.handlers {
                h.validate(false, true).map_err(|e| {
                    GatewayError::Validation(format!("interface '{}': {e}", self.id))
                })?;
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ModuleDescriptor
// ─────────────────────────────────────────────────────────────────────────────

/// An installed backend module: identity, provided/required interfaces,
/// cross-cutting filters, and opaque deployment/UI metadata the core stores
/// but never interprets.
///
/// Immutable once stored; destroyed only when no tenant enables it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModuleDescriptor {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub provides: Vec<InterfaceDescriptor>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<InterfaceDescriptor>,
    /// Cross-cutting routing entries; `phase` is mandatory here.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<RoutingEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub permission_sets: Vec<serde_json::Value>,
    /// Opaque to the core; consumed by the external deployment orchestrator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub launch_descriptor: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ui_descriptor: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<serde_json::Value>,
}

impl ModuleDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// The provided interface with the given id, if any.
    pub fn provided(&self, interface_id: &str) -> Option<&InterfaceDescriptor> {
        self.provides.iter().find(|i| i.id == interface_id)
    }

    /// First handler of a provided system interface matching `method`; used
    /// by the gateway to invoke `_tenant` / `_tenantPermissions`.
    pub fn system_handler(&self, interface_id: &str, method: &str) -> Option<&RoutingEntry> {
        self.provided(interface_id)?
            .handlers
            .iter()
            .find(|h| h.matches_method(method))
    }

    /// Validate the whole descriptor, first violation wins.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.id.trim().is_empty() {
            return Err(GatewayError::Validation(
                "module id cannot be empty".to_string(),
            ));
        }
        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '+' | '_'))
        {
            return Err(GatewayError::Validation(format!(
                "module id '{}' contains invalid characters",
                self.id
            )));
        }
        for p in &self.provides {
            p.validate(true)
                .map_err(|e| GatewayError::Validation(format!("module '{}': {e}", self.id)))?;
        }
        for r in &self.requires {
            r.validate(false)
                .map_err(|e| GatewayError::Validation(format!("module '{}': {e}", self.id)))?;
        }
        for f in &self.filters {
            f.validate(true, false)
                .map_err(|e| GatewayError::Validation(format!("module '{}': {e}", self.id)))?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TenantDescriptor
// ─────────────────────────────────────────────────────────────────────────────

/// A tenant of the gateway.  Owns an ordered set of enabled modules,
/// managed by the runtime crate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TenantDescriptor {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TenantDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            description: None,
        }
    }

    pub fn validate(&self) -> GatewayResult<()> {
        if self.id.trim().is_empty() {
            return Err(GatewayError::Validation(
                "tenant id cannot be empty".to_string(),
            ));
        }
        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
        {
            return Err(GatewayError::Validation(format!(
                "tenant id '{}' contains invalid characters",
                self.id
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(path: &str) -> RoutingEntry {
        RoutingEntry {
            methods: vec!["GET".into(), "POST".into()],
            path: Some(path.into()),
            permissions_required: Some(vec![]),
            ..Default::default()
        }
    }

    #[test]
    fn interface_defaults_to_proxy_type() {
        let i = InterfaceDescriptor::new("sample", "1.0");
        assert_eq!(i.interface_type(), InterfaceType::Proxy);
    }

    #[test]
    fn interface_compatibility_checks_id_and_version() {
        let offered = InterfaceDescriptor::new("m", "3.4.5");
        assert!(!offered.is_compatible(&InterfaceDescriptor::new("somethingelse", "3.4.5")));
        assert!(offered.is_compatible(&InterfaceDescriptor::new("m", "3.4.5")));
        assert!(offered.is_compatible(&InterfaceDescriptor::new("m", "2.9.2 3.4.4")));
        assert!(!offered.is_compatible(&InterfaceDescriptor::new("m", "2.9.2 3.4.6")));
    }

    #[test]
    fn interface_rejects_bad_version_grammar() {
        let mut i = InterfaceDescriptor::new("fail", "4.x");
        assert!(i.validate(false).is_err());
        i.version = "1.2.3".into();
        assert!(i.validate(false).is_ok());
    }

    #[test]
    fn provides_handler_requires_permissions_required() {
        let mut i = InterfaceDescriptor::new("a", "1.0");
        assert!(i.validate(true).is_ok()); // no handlers at all is fine

        let mut e = RoutingEntry {
            path_pattern: Some("/pattern".into()),
            ..Default::default()
        };
        i.handlers = vec![e.clone()];
        let err = i.validate(true).unwrap_err();
        assert!(err.to_string().contains("Missing field permissionsRequired"));

        e.permissions_required = Some(vec![]);
        i.handlers = vec![e];
        assert!(i.validate(true).is_ok());
    }

    #[test]
    fn handler_needs_exactly_one_of_path_and_pattern() {
        let mut e = RoutingEntry {
            permissions_required: Some(vec![]),
            ..Default::default()
        };
        assert!(e.validate(false, true).is_err()); // neither
        e.path = Some("/a".into());
        e.path_pattern = Some("/b".into());
        assert!(e.validate(false, true).is_err()); // both
        e.path_pattern = None;
        assert!(e.validate(false, true).is_ok());
        e.path = Some(" ".into());
        assert!(e.validate(false, true).is_err()); // blank counts as absent
    }

    #[test]
    fn filter_entry_requires_phase() {
        let e = RoutingEntry {
            methods: vec!["*".into()],
            path: Some("/".into()),
            ..Default::default()
        };
        assert!(e.validate(true, false).is_err());
        let e = RoutingEntry {
            phase: Some(Phase::Auth),
            ..e
        };
        assert!(e.validate(true, false).is_ok());
    }

    #[test]
    fn redirect_entry_requires_redirect_path() {
        let mut e = RoutingEntry {
            path_pattern: Some("/red".into()),
            entry_type: RoutingType::Redirect,
            permissions_required: Some(vec![]),
            ..Default::default()
        };
        assert!(e.validate(false, true).is_err());
        e.redirect_path = Some("/target".into());
        assert!(e.validate(false, true).is_ok());
    }

    #[test]
    fn pattern_rejects_regex_metacharacters() {
        for bad in ["/test.*b(/?)", "/a[b]", "/a|b", "/a{b{c}}", "/a}b", "/a{b"] {
            let e = RoutingEntry {
                path_pattern: Some(bad.into()),
                permissions_required: Some(vec![]),
                ..Default::default()
            };
            assert!(e.validate(false, true).is_err(), "accepted '{bad}'");
        }
        let e = RoutingEntry {
            path_pattern: Some("/testb/{id}/sub*".into()),
            permissions_required: Some(vec![]),
            ..Default::default()
        };
        assert!(e.validate(false, true).is_ok());
    }

    #[test]
    fn glob_matching_semantics() {
        assert!(glob_match("/testb", "/testb"));
        assert!(!glob_match("/testb", "/testb/x"));
        assert!(glob_match("/testb/{id}", "/testb/42"));
        assert!(!glob_match("/testb/{id}", "/testb/42/x"));
        assert!(!glob_match("/testb/{id}", "/testb/"));
        assert!(glob_match("/testb*", "/testb/anything/below"));
        assert!(glob_match("/a/{x}/b", "/a/seg/b"));
        assert!(!glob_match("/a/{x}/b", "/a/se/g/b"));
    }

    #[test]
    fn literal_path_exact_for_handlers_prefix_for_filters() {
        let h = handler("/testb");
        assert!(h.matches("GET", "/testb"));
        assert!(!h.matches("GET", "/testb/sub"));
        let f = RoutingEntry {
            methods: vec!["*".into()],
            path: Some("/".into()),
            phase: Some(Phase::Auth),
            entry_type: RoutingType::Headers,
            ..Default::default()
        };
        assert!(f.matches("DELETE", "/anything/at/all"));
    }

    #[test]
    fn module_id_charset() {
        assert!(ModuleDescriptor::new("sample-module-1+1").validate().is_ok());
        assert!(ModuleDescriptor::new("bad module id?!").validate().is_err());
        assert!(ModuleDescriptor::new("").validate().is_err());
    }

    #[test]
    fn unknown_enum_tags_rejected_at_deserialization() {
        let bad_type = r#"{"methods":["GET"],"path":"/x","type":"strange-re-type"}"#;
        assert!(serde_json::from_str::<RoutingEntry>(bad_type).is_err());
        let bad_iface = r#"{"id":"a","version":"1.0","interfaceType":"strange"}"#;
        assert!(serde_json::from_str::<InterfaceDescriptor>(bad_iface).is_err());
    }

    #[test]
    fn descriptor_json_round_trip_uses_camel_case() {
        let json = r#"{
            "id": "sample-module-1",
            "name": "sample module",
            "provides": [{
                "id": "sample",
                "version": "1.0",
                "handlers": [{
                    "methods": ["GET", "POST"],
                    "pathPattern": "/testb",
                    "type": "request-response",
                    "permissionsRequired": []
                }]
            }],
            "filters": [{
                "methods": ["*"],
                "path": "/",
                "phase": "auth",
                "type": "headers",
                "permissionsRequired": []
            }],
            "launchDescriptor": { "exec": "java -jar mod.jar" }
        }"#;
        let md: ModuleDescriptor = serde_json::from_str(json).unwrap();
        assert!(md.validate().is_ok());
        assert_eq!(md.filters[0].phase, Some(Phase::Auth));
        assert_eq!(md.filters[0].entry_type, RoutingType::Headers);
        let back = serde_json::to_value(&md).unwrap();
        assert_eq!(back["provides"][0]["handlers"][0]["pathPattern"], "/testb");
    }
}
