//! Error types.
//!
//! Three families, three lifetimes:
//!
//! - [`ConfigError`] — startup-time. A chain, route, policy table or middleware
//!   entry is malformed. Returned from every registration API; the process
//!   should refuse to start.
//! - [`HandlerError`] — request-time. Produced by handlers and collaborators,
//!   always resolved into a JSON response by a [`Responder`](crate::Responder).
//!   Never escapes the dispatch loop.
//! - [`Error`] — infrastructure. Binding a port, accepting a connection.

use std::borrow::Cow;

use http::StatusCode;
use serde::Serialize;
use serde_json::{Map, Value};

/// The error type returned by gantry's server operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid socket address `{0}`")]
    Address(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A fatal configuration problem detected while building the router.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("chain has no handler units")]
    EmptyChain,

    #[error("logger is not set for non-terminal unit #{index} ({name})")]
    MissingLogger { index: usize, name: String },

    #[error("csrf policy table has no `DEFAULT` entry")]
    MissingDefaultCsrfPolicy,

    #[error("could not find middleware for type `{0}`")]
    UnknownMiddleware(String),

    #[error("middleware `{name}`: {reason}")]
    Middleware { name: String, reason: String },

    #[error("invalid route `{path}`: {source}")]
    InvalidRoute {
        path: String,
        #[source]
        source: matchit::InsertError,
    },

    #[error("reading config: {0}")]
    Read(#[from] std::io::Error),

    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),
}

// ── Request-time errors ──────────────────────────────────────────────────────

/// What went wrong, as far as the client is concerned.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Unauthorized,
    Forbidden,
    TooManyRequests,
    FailedDependency,
    TooEarly,
    MethodNotAllowed,
    Internal,
}

impl ErrorKind {
    /// Numeric status for this kind. Unmapped kinds are `500`.
    pub fn status(self) -> StatusCode {
        match self {
            Self::Validation       => StatusCode::BAD_REQUEST,
            Self::NotFound         => StatusCode::NOT_FOUND,
            Self::Unauthorized     => StatusCode::UNAUTHORIZED,
            Self::Forbidden        => StatusCode::FORBIDDEN,
            Self::TooManyRequests  => StatusCode::TOO_MANY_REQUESTS,
            Self::FailedDependency => StatusCode::FAILED_DEPENDENCY,
            Self::TooEarly         => StatusCode::from_u16(425).unwrap_or(StatusCode::BAD_REQUEST),
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::Internal         => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// A request-scoped failure, serialised as the JSON error body.
///
/// `id` is the message id used for localisation; `properties` are the
/// template values substituted into the localised message.
#[derive(Clone, Debug, Serialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct HandlerError {
    #[serde(rename = "type")]
    kind: ErrorKind,
    message: Cow<'static, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Cow<'static, str>>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    properties: Map<String, Value>,
}

impl HandlerError {
    pub fn new(kind: ErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        Self { kind, message: message.into(), id: None, properties: Map::new() }
    }

    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn unauthorized(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn failed_dependency(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::FailedDependency, message)
    }

    pub fn internal(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Attach a localisation message id.
    pub fn with_id(mut self, id: impl Into<Cow<'static, str>>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Attach a template property used when localising the message.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub(crate) fn with_message(mut self, message: String) -> Self {
        self.message = Cow::Owned(message);
        self
    }

    pub fn kind(&self) -> ErrorKind { self.kind }
    pub fn message(&self) -> &str { &self.message }
    pub fn id(&self) -> Option<&str> { self.id.as_deref() }
    pub fn properties(&self) -> &Map<String, Value> { &self.properties }

    pub fn status(&self) -> StatusCode { self.kind.status() }
}
