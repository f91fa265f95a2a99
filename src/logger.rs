//! Structured logging.
//!
//! Two pieces:
//!
//! - [`Logger`] — a `tracing` span tagged with the source that owns it. Each
//!   handler unit carries one; the request context derives a child bound to
//!   the request UID, and every handler future runs inside it.
//! - [`AccessLog`] — one line per completed request, at a severity picked
//!   from the status code.

use std::collections::HashSet;
use std::time::Duration;

use http::StatusCode;
use tracing::{Span, debug, error, info, info_span};

/// A structured logger bound to a source.
#[derive(Clone, Debug)]
pub struct Logger {
    source: String,
    span: Span,
}

impl Logger {
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        let span = info_span!("unit", source = %source);
        Self { source, span }
    }

    /// Child logger whose events carry the request UID.
    pub fn with_uid(&self, uid: &str) -> Self {
        let span = info_span!(parent: &self.span, "request", uid = %uid);
        Self { source: self.source.clone(), span }
    }

    pub fn source(&self) -> &str { &self.source }
    pub fn span(&self) -> &Span { &self.span }

    /// Runs `f` with this logger's span entered.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        self.span.in_scope(f)
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new("gantry")
    }
}

/// What the access log records about one request.
#[derive(Debug)]
pub struct Completion<'a> {
    pub route: &'a str,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub ip: &'a str,
    pub method: &'a str,
    pub status: StatusCode,
    pub elapsed: Duration,
    pub uid: Option<&'a str>,
    pub user_id: Option<String>,
    pub mode: Option<&'a str>,
}

/// Request completion logging.
///
/// `<400` → debug, `424` → error, other `4xx` → info, `5xx` → error.
/// In development mode everything is logged at info.
#[derive(Clone, Debug, Default)]
pub struct AccessLog {
    service: String,
    skip_paths: HashSet<String>,
    development: bool,
}

impl AccessLog {
    pub fn new(service: impl Into<String>) -> Self {
        Self { service: service.into(), ..Self::default() }
    }

    /// Route patterns that are never logged (health checks, metrics scrapes).
    pub fn skip_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip_paths.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn development(mut self, on: bool) -> Self {
        self.development = on;
        self
    }

    pub fn is_skipped(&self, route: &str) -> bool {
        !route.is_empty() && self.skip_paths.contains(route)
    }

    pub fn record(&self, c: &Completion<'_>) {
        if self.is_skipped(c.route) {
            return;
        }
        let path = match c.query {
            Some(q) if !q.is_empty() => format!("{}?{q}", c.path),
            _ => c.path.to_owned(),
        };
        let elapsed_ms = c.elapsed.as_millis() as u64;
        let status = c.status.as_u16();
        let uid = c.uid.unwrap_or_default();
        let user_id = c.user_id.as_deref().unwrap_or_default();
        let mode = c.mode.unwrap_or_default();

        macro_rules! emit {
            ($level:ident, $msg:literal) => {
                $level!(
                    source = %self.service,
                    path = %path,
                    ip = %c.ip,
                    elapsed_ms,
                    method = %c.method,
                    status,
                    uid = %uid,
                    user_id = %user_id,
                    mode = %mode,
                    $msg
                )
            };
        }

        if self.development {
            emit!(info, "request");
        } else if status < 400 {
            emit!(debug, "request");
        } else if c.status == StatusCode::FAILED_DEPENDENCY {
            emit!(error, "failed dependency");
        } else if status < 500 {
            emit!(info, "request");
        } else {
            emit!(error, "request failed");
        }
    }
}
