//! # gantry
//!
//! The request-dispatch core of an HTTP service: ordered handler units
//! compiled into middleware chains, one shared request context per request,
//! CSRF verification before business logic, and a request-scoped
//! cancellation that is released exactly once.
//!
//! ## The contract
//!
//! A route is a list of [`HandlerUnit`]s. The first unit creates the
//! [`RequestContext`]; every later unit sees the same one. Middleware
//! returns [`Outcome::Next`] to continue; anything else ends the chain.
//! The last unit always responds. Exactly one response is ever committed.
//!
//! What gantry leaves to others:
//!
//! - **Wire parsing** — hyper
//! - **Path matching** — [`matchit`]
//! - **TLS, rate limiting, body-size limits** — the reverse proxy
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gantry::{HandlerError, HandlerUnit, Logger, Outcome, RequestContext, Router, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let auth = HandlerUnit::new(authenticate).with_logger(Logger::new("auth"));
//!
//!     let mut app = Router::new();
//!     app.get("/orders/{id}", [auth.clone(), HandlerUnit::new(get_order)])?
//!        .post("/orders", [auth, HandlerUnit::new(create_order)])?;
//!
//!     Server::bind("0.0.0.0:3000")?.serve(app).await?;
//!     Ok(())
//! }
//!
//! async fn authenticate(ctx: Arc<RequestContext>) -> Outcome {
//!     if ctx.header("authorization").is_some() {
//!         Outcome::Next
//!     } else {
//!         HandlerError::unauthorized("missing credentials").into()
//!     }
//! }
//!
//! async fn get_order(ctx: Arc<RequestContext>) -> Result<serde_json::Value, HandlerError> {
//!     let id = ctx.param("id").unwrap_or_default();
//!     Ok(serde_json::json!({ "id": id }))
//! }
//!
//! // POST with a non-null payload answers 201.
//! async fn create_order(ctx: Arc<RequestContext>) -> Result<serde_json::Value, HandlerError> {
//!     let order: serde_json::Value = ctx.bind_json()?;
//!     Ok(order)
//! }
//! ```

mod auth;
mod chain;
mod config;
mod context;
mod csrf;
mod dispatch;
mod error;
mod handler;
mod language;
mod logger;
mod method;
mod monitoring;
mod registry;
mod request;
mod responder;
mod response;
mod router;
mod server;
mod status;

pub use auth::{Authorization, BasicSession, Session};
pub use chain::Position;
pub use config::{
    AccessLogConfig, CsrfConfig, DEFAULT_CONNECTION_TIMEOUT, DEFAULT_SHUTDOWN_TIMEOUT, HttpConfig,
    MiddlewareConfig, ServerConfig, Settings,
};
pub use context::{Connection, Interrupt, Pagination, REQUEST_UID_HEADER, RequestContext};
pub use csrf::{CsrfError, CsrfPolicies, CsrfPolicy, DEFAULT_SESSION_TYPE, verify};
pub use error::{ConfigError, Error, ErrorKind, HandlerError};
pub use handler::{Handler, HandlerUnit, Outcome};
pub use language::{Catalog, Language, Localizer};
pub use logger::{AccessLog, Completion, Logger};
pub use method::Method;
pub use monitoring::{Monitoring, NoopMonitoring, TracingMonitoring};
pub use registry::{Registry, UnitParts};
pub use request::Request;
pub use responder::{JsonResponder, PlainResponder, Responder};
pub use response::{ContentType, Response, ResponseBuilder};
pub use router::{Group, Router};
pub use server::Server;
pub use status::{StatusHint, StatusTable};
