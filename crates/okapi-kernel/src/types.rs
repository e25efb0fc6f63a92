//! Request, response, and per-request context types.
//!
//! All fields use owned types so values can cross async task boundaries
//! without lifetime complications.  Header names are lowercased on insert.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ─────────────────────────────────────────────────────────────────────────────
// Well-known headers
// ─────────────────────────────────────────────────────────────────────────────

/// Header names fixed by the gateway contract.
pub mod headers {
    /// Selects the tenant for a proxied request.
    pub const TENANT: &str = "x-okapi-tenant";
    /// Carries the caller's identity token.
    pub const TOKEN: &str = "x-okapi-token";
    /// Disambiguates `multiple`-type interfaces; consumed by the gateway,
    /// never forwarded to backends.
    pub const MODULE_ID: &str = "x-okapi-module-id";
    /// Repeated response header carrying the per-step execution trace.
    pub const TRACE: &str = "x-okapi-trace";
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP method
// ─────────────────────────────────────────────────────────────────────────────

/// HTTP method of an inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    /// Case-insensitive parse from a string slice.
    pub fn from_str_ci(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "GET" => Some(HttpMethod::Get),
            "POST" => Some(HttpMethod::Post),
            "PUT" => Some(HttpMethod::Put),
            "PATCH" => Some(HttpMethod::Patch),
            "DELETE" => Some(HttpMethod::Delete),
            "HEAD" => Some(HttpMethod::Head),
            "OPTIONS" => Some(HttpMethod::Options),
            _ => None,
        }
    }

    /// Standard uppercase representation, as it appears in trace entries.
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request / Response
// ─────────────────────────────────────────────────────────────────────────────

/// An inbound request flowing through the pipeline.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    /// Correlation id for logs and traces.
    pub id: String,
    /// Tenant this request is addressed to.
    pub tenant: String,
    pub method: HttpMethod,
    /// Path plus query string, e.g. `/testb?limit=10`.
    pub path: String,
    /// Header names are lowercased.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl ProxyRequest {
    pub fn new(
        id: impl Into<String>,
        tenant: impl Into<String>,
        method: HttpMethod,
        path: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            tenant: tenant.into(),
            method,
            path: path.into(),
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    /// Builder helper: attach a header (name lowercased).
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into().to_lowercase(), value.into());
        self
    }

    /// Builder helper: set the body.
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Path without the query string, used for route matching.
    pub fn route_path(&self) -> &str {
        self.path.split('?').next().unwrap_or(&self.path)
    }
}

/// A response produced by a backend module step.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl ProxyResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    /// Builder helper: attach a header (name lowercased).
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into().to_lowercase(), value.into());
        self
    }

    /// Builder helper: set the body.
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// 2xx/3xx — anything else short-circuits a pre/auth filter step.
    pub fn is_ok(&self) -> bool {
        (200..400).contains(&self.status)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-request context
// ─────────────────────────────────────────────────────────────────────────────

/// Mutable context for a single request's pipeline run: the flowing
/// request state plus the accumulated trace.
#[derive(Debug, Clone)]
pub struct ProxyContext {
    pub request: ProxyRequest,
    /// One entry per step actually invoked: `"<METHOD> <moduleId> <status>[ <note>]"`.
    pub trace: Vec<String>,
}

impl ProxyContext {
    pub fn new(request: ProxyRequest) -> Self {
        Self {
            request,
            trace: Vec::new(),
        }
    }

    /// Append a trace entry for an invoked step.
    pub fn add_trace(&mut self, module_id: &str, status: u16, note: Option<&str>) {
        let mut entry = format!("{} {} {}", self.request.method.as_str(), module_id, status);
        if let Some(n) = note {
            entry.push(' ');
            entry.push_str(n);
        }
        self.trace.push(entry);
    }
}
