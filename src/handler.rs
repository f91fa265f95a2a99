//! Handler units and type erasure.
//!
//! # How async handlers are stored
//!
//! A chain holds units whose handler functions all have *different* types.
//! They are erased behind [`ErasedHandler`] so a `Vec` can hold them:
//!
//! ```text
//! async fn load_user(ctx: Arc<RequestContext>) -> Result<User, HandlerError> { … }
//!        ↓ HandlerUnit::new(load_user)
//! load_user.into_boxed_handler()                  ← Handler blanket impl
//!        ↓
//! Arc::new(FnHandler(load_user))                  ← heap-allocated wrapper
//!        ↓  stored as BoxedHandler = Arc<dyn ErasedHandler>
//! handler.call(ctx)  at request time              ← one vtable dispatch
//!        ↓
//! Box::pin(async { load_user(ctx).await.into() }) ← BoxFuture<Outcome>
//! ```
//!
//! A [`HandlerUnit`] bundles the erased function with the logger and
//! responder that serve it. Units are cheap to clone and are compiled into
//! chains once, at startup.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::context::RequestContext;
use crate::error::HandlerError;
use crate::language::Catalog;
use crate::logger::Logger;
use crate::responder::{JsonResponder, Responder};
use crate::status::StatusHint;

// ── Outcome ──────────────────────────────────────────────────────────────────

/// What a handler function decided.
///
/// For middleware, only [`Outcome::Next`] continues the chain. A terminal
/// unit always ends in a response: `Next` and `Halt` there mean "respond
/// with an empty hint and no payload".
#[derive(Debug)]
pub enum Outcome {
    /// Continue with the next unit.
    Next,
    /// Stop the chain. If nothing was sent yet the client gets `403`.
    Halt,
    /// Respond with a status hint and a JSON payload.
    Reply(StatusHint, Value),
    /// Respond with a structured error.
    Fail(HandlerError),
}

impl Outcome {
    /// Reply with any serialisable payload.
    pub fn reply<T: Serialize>(status: StatusHint, payload: &T) -> Self {
        match serde_json::to_value(payload) {
            Ok(value) => Self::Reply(status, value),
            Err(e) => Self::Fail(HandlerError::internal(format!("serialising payload: {e}"))),
        }
    }

    /// `true` → `Next`, `false` → `Halt`.
    pub fn is_continue(&self) -> bool {
        matches!(self, Self::Next)
    }
}

impl From<bool> for Outcome {
    fn from(proceed: bool) -> Self {
        if proceed { Self::Next } else { Self::Halt }
    }
}

impl From<HandlerError> for Outcome {
    fn from(err: HandlerError) -> Self {
        Self::Fail(err)
    }
}

/// `Ok(payload)` replies with the empty hint, so the verb picks the status.
impl<T: Serialize> From<Result<T, HandlerError>> for Outcome {
    fn from(result: Result<T, HandlerError>) -> Self {
        match result {
            Ok(payload) => Self::reply(StatusHint::EMPTY, &payload),
            Err(err) => Self::Fail(err),
        }
    }
}

// ── Type erasure ─────────────────────────────────────────────────────────────

/// A heap-allocated, type-erased future that resolves to an [`Outcome`].
#[doc(hidden)]
pub type BoxFuture = Pin<Box<dyn Future<Output = Outcome> + Send + 'static>>;

/// Internal dispatch interface.
///
/// `#[doc(hidden)] pub` rather than `pub(crate)` because it appears in the
/// return type of the public `Handler` trait's `into_boxed_handler` method.
#[doc(hidden)]
pub trait ErasedHandler {
    fn call(&self, ctx: Arc<RequestContext>) -> BoxFuture;
}

#[doc(hidden)]
pub type BoxedHandler = Arc<dyn ErasedHandler + Send + Sync + 'static>;

/// Implemented for every valid handler function.
///
/// Automatically satisfied by any function or closure of the shape:
///
/// ```text
/// async fn name(ctx: Arc<RequestContext>) -> impl Into<Outcome>
/// ```
///
/// Sealed: only the blanket impl below can satisfy it.
pub trait Handler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedHandler;
}

mod private {
    pub trait Sealed {}
}

impl<F, Fut, O> private::Sealed for F
where
    F: Fn(Arc<RequestContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send + 'static,
    O: Into<Outcome> + Send + 'static,
{
}

impl<F, Fut, O> Handler for F
where
    F: Fn(Arc<RequestContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send + 'static,
    O: Into<Outcome> + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(FnHandler(self))
    }
}

/// Newtype bridging a concrete handler `F` to the trait-object world.
struct FnHandler<F>(F);

impl<F, Fut, O> ErasedHandler for FnHandler<F>
where
    F: Fn(Arc<RequestContext>) -> Fut + Send + Sync,
    Fut: Future<Output = O> + Send + 'static,
    O: Into<Outcome> + Send + 'static,
{
    fn call(&self, ctx: Arc<RequestContext>) -> BoxFuture {
        let fut = (self.0)(ctx);
        Box::pin(async move { fut.await.into() })
    }
}

// ── Handler unit ─────────────────────────────────────────────────────────────

/// A handler function plus the logger and responder that serve it.
///
/// ```rust
/// use std::sync::Arc;
/// use gantry::{HandlerUnit, Logger, RequestContext};
///
/// async fn require_tenant(ctx: Arc<RequestContext>) -> bool {
///     ctx.header("x-tenant").is_some()
/// }
///
/// let unit = HandlerUnit::new(require_tenant)
///     .with_logger(Logger::new("tenancy"))
///     .named("require-tenant");
/// ```
#[derive(Clone)]
pub struct HandlerUnit {
    handler: BoxedHandler,
    logger: Option<Logger>,
    responder: Arc<dyn Responder>,
    name: Option<Arc<str>>,
    catalog: Option<Arc<Catalog>>,
}

impl HandlerUnit {
    /// A unit with the default [`JsonResponder`] and no logger.
    pub fn new(handler: impl Handler) -> Self {
        Self {
            handler: handler.into_boxed_handler(),
            logger: None,
            responder: Arc::new(JsonResponder::default()),
            name: None,
            catalog: None,
        }
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn with_responder(mut self, responder: Arc<dyn Responder>) -> Self {
        self.responder = responder;
        self
    }

    /// Message catalog bound to the request when this unit opens the chain.
    pub fn with_catalog(mut self, catalog: Arc<Catalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Name reported in logs and configuration errors.
    pub fn named(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn logger(&self) -> Option<&Logger> { self.logger.as_ref() }
    pub fn responder(&self) -> &dyn Responder { self.responder.as_ref() }
    pub fn name(&self) -> Option<&str> { self.name.as_deref() }
    pub fn catalog(&self) -> Option<&Arc<Catalog>> { self.catalog.as_ref() }

    pub(crate) fn call(&self, ctx: Arc<RequestContext>) -> BoxFuture {
        self.handler.call(ctx)
    }
}

impl std::fmt::Debug for HandlerUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerUnit")
            .field("name", &self.name)
            .field("logger", &self.logger.as_ref().map(Logger::source))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn outcomes_convert_from_handler_returns() {
        assert!(Outcome::from(true).is_continue());
        assert!(matches!(Outcome::from(false), Outcome::Halt));
        assert!(matches!(Outcome::from(HandlerError::forbidden("no")), Outcome::Fail(_)));

        let ok: Result<_, HandlerError> = Ok(json!({ "id": 3 }));
        match Outcome::from(ok) {
            Outcome::Reply(hint, body) => {
                assert!(hint.is_empty());
                assert_eq!(body["id"], 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn erased_handler_runs_the_function() {
        let unit = HandlerUnit::new(|ctx: Arc<RequestContext>| async move {
            ctx.set_temp("seen", true);
            true
        })
        .named("sample");

        let ctx = crate::context::test_support::context(http::Request::get("/").body("").unwrap());
        let outcome = unit.call(Arc::clone(&ctx)).await;
        assert!(outcome.is_continue());
        assert_eq!(ctx.temp::<bool>("seen").as_deref(), Some(&true));
        assert_eq!(unit.name(), Some("sample"));
        assert!(unit.logger().is_none());
    }
}
