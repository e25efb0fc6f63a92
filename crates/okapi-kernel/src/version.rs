//! Interface version parsing and compatibility resolution.
//!
//! An interface version is one or more space-separated `major.minor[.patch]`
//! triples.  A *provided* interface always declares exactly one triple; a
//! *required* interface may declare several, forming an OR set of acceptable
//! requirement baselines (historically used to keep a window of
//! backward-compatible minors).
//!
//! Compatibility implements "offered is new enough to satisfy the required
//! baseline, within the same major version": a provider with a strictly
//! newer minor satisfies any patch level of that minor; a provider with the
//! same minor must have an equal-or-newer patch.  Different majors never
//! match — that is the breaking-change boundary.

use crate::error::{GatewayError, GatewayResult};

// ─────────────────────────────────────────────────────────────────────────────
// InterfaceVersion
// ─────────────────────────────────────────────────────────────────────────────

/// A single parsed `major.minor[.patch]` triple.  Missing patch parses as 0.
///
/// Components compare numerically, not lexicographically: `0.10.0` is newer
/// than `0.9.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct InterfaceVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl InterfaceVersion {
    /// Parse a single version token.
    ///
    /// The grammar is `\d+\.\d+(\.\d+)?` — two or three dot-separated
    /// decimal components, nothing else.  `"1"`, `"1."`, `"1.2.3.4"`, and
    /// `"1.2.*"` are all rejected.
    pub fn parse(token: &str) -> GatewayResult<Self> {
        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(GatewayError::Validation(format!(
                "invalid interface version '{token}'"
            )));
        }
        let mut nums = [0u32; 3];
        for (i, part) in parts.iter().enumerate() {
            nums[i] = part
                .parse()
                .map_err(|_| GatewayError::Validation(format!("invalid interface version '{token}'")))?;
        }
        Ok(Self {
            major: nums[0],
            minor: nums[1],
            patch: nums[2],
        })
    }

    /// True when this (offered) version satisfies `required` as a baseline:
    /// same major, and newer minor or same minor with equal-or-newer patch.
    pub fn satisfies(&self, required: &InterfaceVersion) -> bool {
        self.major == required.major
            && (self.minor > required.minor
                || (self.minor == required.minor && self.patch >= required.patch))
    }
}

impl std::fmt::Display for InterfaceVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Version-string helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Parse a full version string (one or more space-separated tokens).
///
/// Returns the first violated token as a [`GatewayError::Validation`].
pub fn parse_versions(version: &str) -> GatewayResult<Vec<InterfaceVersion>> {
    let tokens: Vec<&str> = version.split_whitespace().collect();
    if tokens.is_empty() {
        return Err(GatewayError::Validation(
            "interface version cannot be empty".to_string(),
        ));
    }
    tokens.iter().map(|t| InterfaceVersion::parse(t)).collect()
}

/// True when every space-separated token in `version` matches the grammar.
pub fn validate_version(version: &str) -> bool {
    parse_versions(version).is_ok()
}

/// Core compatibility judgement between an offered version string (exactly
/// one triple at registration time) and a required version string (an OR set
/// of acceptable baselines).
///
/// Interface *id* equality is checked separately by the caller, never here.
/// Both strings are validated at descriptor construction, so malformed input
/// conservatively yields `false` instead of panicking.
pub fn compatible(offered: &str, required: &str) -> bool {
    let Ok(offered) = parse_versions(offered) else {
        return false;
    };
    let Some(offered) = offered.first() else {
        return false;
    };
    let Ok(candidates) = parse_versions(required) else {
        return false;
    };
    // Logical OR across the required candidate list.
    candidates.iter().any(|r| offered.satisfies(r))
}

// =============================================================================
// Tests
// =============================================================================
