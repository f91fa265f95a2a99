//! Authorization and session collaborators.
//!
//! gantry does not authenticate anyone. An auth middleware (yours) looks at
//! the request, decides who is calling, and hands the result to
//! [`RequestContext::set_auth`](crate::RequestContext::set_auth). From that
//! point on every unit in the chain sees it, and if it carries a
//! [`Session`], every later unit runs behind CSRF verification.

use std::sync::Arc;

/// Who is calling, as decided by an auth middleware.
pub trait Authorization: Send + Sync + 'static {
    /// The raw credential the decision was made from.
    fn token(&self) -> &str;

    fn is_authenticated(&self) -> bool;

    fn current_account_id(&self) -> Option<String>;

    fn scopes(&self) -> &[String];

    /// True when every requested scope is granted.
    fn has_scope(&self, scopes: &[&str]) -> bool {
        scopes.iter().all(|wanted| self.scopes().iter().any(|s| s == wanted))
    }

    /// Browser session behind this authorization, if any.
    fn session(&self) -> Option<Arc<dyn Session>> {
        None
    }
}

/// A cookie-backed browser session.
pub trait Session: Send + Sync + 'static {
    /// The anti-forgery token bound to this session. Empty disables CSRF
    /// enforcement for the session.
    fn csrf_token(&self) -> &str;

    /// Selects the CSRF policy (cookie and header names).
    fn session_type(&self) -> &str;
}

/// A plain [`Session`] value.
#[derive(Clone, Debug, Default)]
pub struct BasicSession {
    pub csrf_token: String,
    pub session_type: String,
}

impl BasicSession {
    pub fn new(csrf_token: impl Into<String>, session_type: impl Into<String>) -> Self {
        Self { csrf_token: csrf_token.into(), session_type: session_type.into() }
    }
}

impl Session for BasicSession {
    fn csrf_token(&self) -> &str { &self.csrf_token }
    fn session_type(&self) -> &str { &self.session_type }
}
