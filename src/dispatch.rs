//! Middleware adapter and per-request storage.
//!
//! Each compiled unit is wrapped in an [`Adapter`]. For one request the
//! adapters share an [`Exchange`]: the per-request slot holding the incoming
//! request (until the entry adapter claims it), the request context, and
//! the [`Lease`] that ends the request.
//!
//! Per invocation an adapter:
//!
//! 1. creates the context (entry) or fetches it from the exchange;
//! 2. verifies CSRF when the context carries a session, answering `403`
//!    and stopping on failure;
//! 3. runs the handler function, containing panics;
//! 4. settles the outcome through the unit's responder;
//! 5. releases the lease if it is terminal or the chain stops here.
//!
//! Releasing the lease notifies `on_request_end` and cancels the connection
//! scope. It happens once per request: on the normal path, or from `Drop`
//! if the request task unwinds or is dropped mid-chain.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::Value;
use tracing::{Instrument, error, warn};

use crate::chain::{Finished, Position};
use crate::config::Settings;
use crate::context::RequestContext;
use crate::csrf;
use crate::error::HandlerError;
use crate::handler::{HandlerUnit, Outcome};
use crate::monitoring::{Monitoring, notify};
use crate::request::Request;
use crate::response::Response;
use crate::status::StatusHint;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Step {
    Continue,
    Stop,
}

// ── Exchange ─────────────────────────────────────────────────────────────────

/// Per-request storage surviving across the adapters of one chain run.
pub(crate) struct Exchange {
    request: Option<Request>,
    context: Option<Arc<RequestContext>>,
    lease: Option<Lease>,
}

impl Exchange {
    pub(crate) fn new(request: Request) -> Self {
        Self { request: Some(request), context: None, lease: None }
    }

    fn open(&mut self, ctx: Arc<RequestContext>, monitoring: Arc<dyn Monitoring>) {
        notify("on_request_start", || monitoring.on_request_start(&ctx));
        self.lease = Some(Lease { ctx: Arc::clone(&ctx), monitoring });
        self.context = Some(ctx);
    }

    fn context(&self) -> Option<Arc<RequestContext>> {
        self.context.clone()
    }

    /// Ends the request. Later calls do nothing.
    fn release(&mut self) {
        drop(self.lease.take());
    }

    pub(crate) fn finish(mut self) -> Finished {
        self.release();
        let context = self.context.take();
        let response = context
            .as_ref()
            .and_then(|ctx| ctx.take_response())
            .unwrap_or_else(|| {
                let err = HandlerError::internal("request ended without a response");
                Response::builder().status(err.status()).json_value(&err)
            });
        Finished { response, context }
    }
}

/// Ends a request exactly once.
struct Lease {
    ctx: Arc<RequestContext>,
    monitoring: Arc<dyn Monitoring>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        notify("on_request_end", || self.monitoring.on_request_end(&self.ctx));
        self.ctx.connection().cancel();
    }
}

// ── Adapter ──────────────────────────────────────────────────────────────────

/// One compiled unit with its position in the chain.
pub(crate) struct Adapter {
    unit: HandlerUnit,
    position: Position,
    settings: Arc<Settings>,
    monitoring: Arc<dyn Monitoring>,
}

impl Adapter {
    pub(crate) fn new(
        unit: HandlerUnit,
        position: Position,
        settings: Arc<Settings>,
        monitoring: Arc<dyn Monitoring>,
    ) -> Self {
        Self { unit, position, settings, monitoring }
    }

    #[cfg(test)]
    pub(crate) fn position(&self) -> Position {
        self.position
    }

    pub(crate) async fn invoke(&self, exchange: &mut Exchange) -> Step {
        let Some(ctx) = self.enter(exchange) else {
            // A previous unit already ended this request.
            warn!(unit = self.unit.name().unwrap_or("unnamed"), position = ?self.position,
                "no request context in storage, aborting chain");
            exchange.release();
            return Step::Stop;
        };

        if let Some(session) = ctx.session() {
            if let Err(e) = csrf::verify(session.as_ref(), ctx.request(), &self.settings.csrf) {
                ctx.logger().in_scope(|| warn!(error = %e, "session verification failed"));
                self.unit.responder().respond_with_error(&ctx, &HandlerError::forbidden(e.to_string()));
                exchange.release();
                return Step::Stop;
            }
        }

        let outcome = self.call(&ctx).await;
        let proceed = self.settle(&ctx, outcome);

        if self.position.is_terminal() || !proceed {
            exchange.release();
            return Step::Stop;
        }
        Step::Continue
    }

    fn enter(&self, exchange: &mut Exchange) -> Option<Arc<RequestContext>> {
        if !self.position.is_entry() {
            return exchange.context();
        }
        let request = exchange.request.take()?;
        let logger = self.unit.logger().cloned().unwrap_or_default();
        let ctx = RequestContext::create(
            request,
            self.settings.connection_timeout,
            &logger,
            self.unit.catalog(),
        );
        exchange.open(Arc::clone(&ctx), Arc::clone(&self.monitoring));
        Some(ctx)
    }

    async fn call(&self, ctx: &Arc<RequestContext>) -> Outcome {
        let fut = self.unit.call(Arc::clone(ctx)).instrument(ctx.logger().span().clone());
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_default();
                ctx.logger().in_scope(|| error!(reason = %reason, "handler panicked"));
                Outcome::Fail(HandlerError::internal("internal error"))
            }
        }
    }

    /// Sends whatever the outcome calls for. Returns whether the chain may
    /// continue.
    fn settle(&self, ctx: &RequestContext, outcome: Outcome) -> bool {
        let responder = self.unit.responder();
        match outcome {
            Outcome::Next | Outcome::Halt if self.position.is_terminal() => {
                responder.respond(ctx, StatusHint::EMPTY, Value::Null);
                false
            }
            Outcome::Next => !ctx.is_responded(),
            Outcome::Halt => {
                responder.respond_with_error(ctx, &HandlerError::forbidden("request declined"));
                false
            }
            Outcome::Reply(status, payload) => {
                responder.respond(ctx, status, payload);
                false
            }
            Outcome::Fail(err) => {
                ctx.logger().in_scope(|| warn!(kind = ?err.kind(), error = %err.message(), "handler failed"));
                responder.respond_with_error(ctx, &err);
                false
            }
        }
    }
}
