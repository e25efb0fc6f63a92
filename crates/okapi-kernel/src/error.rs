//! Error taxonomy for the gateway kernel.
//!
//! [`GatewayError`] covers every failure mode the core can report to a
//! caller: malformed descriptors, unknown tenants/modules/routes,
//! dependency and uniqueness violations, unresolved multiple-interface
//! selection, and unreachable backends.  Registration, enable, and disable
//! errors are returned synchronously with no partial mutation; pipeline
//! build errors never invoke any backend.

use thiserror::Error;

/// Gateway error taxonomy.
///
/// Each variant carries a human-readable message naming the first violated
/// rule; [`status()`](Self::status) maps the variant to its HTTP-equivalent
/// status code.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// Malformed descriptor — caller's fault, never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown tenant, module, or route.
    #[error("not found: {0}")]
    NotFound(String),

    /// Dependency, version, or uniqueness violation, including redirect loops.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Unresolved multiple-interface selection.  Surfaced to HTTP callers as
    /// a routing miss (404) — the ambiguity is the caller's to resolve via
    /// the module-selector header.
    #[error("ambiguous request: {0}")]
    Ambiguous(String),

    /// Backend unreachable or timed out.
    #[error("bad gateway: {0}")]
    BadGateway(String),

    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP-equivalent status code for this error.
    pub fn status(&self) -> u16 {
        match self {
            GatewayError::Validation(_) => 400,
            GatewayError::NotFound(_) => 404,
            GatewayError::Conflict(_) => 409,
            GatewayError::Ambiguous(_) => 404,
            GatewayError::BadGateway(_) => 502,
            GatewayError::Internal(_) => 500,
        }
    }

    /// Stable machine-readable code, used in JSON error bodies and logs.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "VALIDATION",
            GatewayError::NotFound(_) => "NOT_FOUND",
            GatewayError::Conflict(_) => "CONFLICT",
            GatewayError::Ambiguous(_) => "AMBIGUOUS",
            GatewayError::BadGateway(_) => "BAD_GATEWAY",
            GatewayError::Internal(_) => "INTERNAL",
        }
    }
}

/// Convenience alias used throughout the kernel and runtime crates.
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(GatewayError::Validation("x".into()).status(), 400);
        assert_eq!(GatewayError::NotFound("x".into()).status(), 404);
        assert_eq!(GatewayError::Conflict("x".into()).status(), 409);
        // Ambiguity is a routing miss, not a server error.
        assert_eq!(GatewayError::Ambiguous("x".into()).status(), 404);
        assert_eq!(GatewayError::BadGateway("x".into()).status(), 502);
        assert_eq!(GatewayError::Internal("x".into()).status(), 500);
    }

    #[test]
    fn display_includes_message() {
        let e = GatewayError::Conflict("interface already provided".into());
        assert_eq!(e.to_string(), "conflict: interface already provided");
    }
}
