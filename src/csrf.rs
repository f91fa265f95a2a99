//! Double-submit CSRF verification.
//!
//! A session with a non-empty token demands that the same token arrive
//! twice: once in a header (which a cross-site form cannot set) and once in
//! a cookie (which only the session's own origin could have planted). Which
//! header and which cookie depends on the session type; unknown types use
//! the `DEFAULT` policy.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::auth::Session;
use crate::error::ConfigError;
use crate::request::{Request, query_unescape};

/// Session type whose policy backs every unknown type.
pub const DEFAULT_SESSION_TYPE: &str = "DEFAULT";

/// Where to find the two copies of the token.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CsrfPolicy {
    pub cookie_key: String,
    pub header_key: String,
}

impl CsrfPolicy {
    pub fn new(cookie_key: impl Into<String>, header_key: impl Into<String>) -> Self {
        Self { cookie_key: cookie_key.into(), header_key: header_key.into() }
    }
}

/// Policy table keyed by session type. Always holds a `DEFAULT` entry.
#[derive(Clone, Debug)]
pub struct CsrfPolicies {
    by_type: HashMap<String, CsrfPolicy>,
    fallback: CsrfPolicy,
}

impl CsrfPolicies {
    /// Fails when `policies` has no `DEFAULT` entry.
    pub fn new(policies: HashMap<String, CsrfPolicy>) -> Result<Self, ConfigError> {
        let fallback = policies
            .get(DEFAULT_SESSION_TYPE)
            .cloned()
            .ok_or(ConfigError::MissingDefaultCsrfPolicy)?;
        Ok(Self { by_type: policies, fallback })
    }

    /// The built-in table: `DEFAULT`, `NORMAL` and `IMPORTANT`.
    pub fn builtin() -> HashMap<String, CsrfPolicy> {
        HashMap::from([
            (DEFAULT_SESSION_TYPE.to_owned(), CsrfPolicy::new("CSRF_TOKEN", "X-CSRF-TOKEN")),
            ("NORMAL".to_owned(), CsrfPolicy::new("CSRF_TOKEN_NORMAL", "X-CSRF-TOKEN-NORMAL")),
            ("IMPORTANT".to_owned(), CsrfPolicy::new("CSRF_TOKEN_IMPORTANT", "X-CSRF-TOKEN-IMPORTANT")),
        ])
    }

    pub fn policy_for(&self, session_type: &str) -> &CsrfPolicy {
        self.by_type.get(session_type).unwrap_or(&self.fallback)
    }
}

impl Default for CsrfPolicies {
    fn default() -> Self {
        let by_type = Self::builtin();
        let fallback = CsrfPolicy::new("CSRF_TOKEN", "X-CSRF-TOKEN");
        Self { by_type, fallback }
    }
}

/// Why a request failed verification.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum CsrfError {
    #[error("csrf cookie `{0}` is missing")]
    MissingCookie(String),

    #[error("csrf cookie `{0}` is not valid percent-encoding")]
    UndecodableCookie(String),

    #[error("csrf does not match")]
    Mismatch,
}

/// Checks `request` against the token of `session`.
pub fn verify(session: &dyn Session, request: &Request, policies: &CsrfPolicies) -> Result<(), CsrfError> {
    let token = session.csrf_token();
    if token.is_empty() {
        return Ok(());
    }

    let policy = policies.policy_for(session.session_type());
    let header = request.header(&policy.header_key).unwrap_or_default();
    let raw = request
        .cookie(&policy.cookie_key)
        .ok_or_else(|| CsrfError::MissingCookie(policy.cookie_key.clone()))?;
    let cookie = query_unescape(raw).ok_or_else(|| CsrfError::UndecodableCookie(policy.cookie_key.clone()))?;

    if token != header || token != cookie {
        return Err(CsrfError::Mismatch);
    }
    Ok(())
}
