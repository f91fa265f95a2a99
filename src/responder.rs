//! Responders: turning outcomes into committed responses.
//!
//! A responder builds a [`Response`] and commits it through
//! [`RequestContext::commit`], which checks and sets the responded flag
//! under the same lock as the write. A second respond call on the same
//! request is a no-op returning `false`, whichever responder makes it.
//!
//! Both built-in responders echo the request UID in `x-request-uid`.

use std::sync::Arc;

use http::StatusCode;
use serde_json::{Value, json};

use crate::context::{REQUEST_UID_HEADER, RequestContext};
use crate::error::HandlerError;
use crate::response::Response;
use crate::status::{StatusHint, StatusTable};

/// Writes results and errors for a request.
pub trait Responder: Send + Sync + 'static {
    /// Responds with `payload`. Returns whether this call sent the response.
    fn respond(&self, ctx: &RequestContext, status: StatusHint, payload: Value) -> bool;

    /// Responds with a structured error. Returns whether this call sent the response.
    fn respond_with_error(&self, ctx: &RequestContext, err: &HandlerError) -> bool;
}

/// The default responder.
///
/// - redirect hints send a `Location` header taken from a string payload;
/// - the empty hint derives the status from the verb;
/// - errors are localised through the request's language when the error
///   carries a message id.
#[derive(Clone, Debug, Default)]
pub struct JsonResponder {
    statuses: Arc<StatusTable>,
}

impl JsonResponder {
    pub fn new(statuses: StatusTable) -> Self {
        Self { statuses: Arc::new(statuses) }
    }
}

impl Responder for JsonResponder {
    fn respond(&self, ctx: &RequestContext, status: StatusHint, payload: Value) -> bool {
        if ctx.is_responded() {
            return false;
        }
        let response = match (status.redirect_code(), payload.as_str()) {
            (Some(code), Some(location)) => Response::redirect(code, location),
            (Some(_), None) => {
                let err = HandlerError::internal(format!("redirect `{status}` needs a string location"));
                Response::builder().status(err.status()).json_value(&err)
            }
            (None, _) => {
                let hint = status.or_derive(ctx.method(), &payload);
                json_body(self.statuses.code(&hint), &payload)
            }
        };
        ctx.commit(stamped(ctx, response))
    }

    fn respond_with_error(&self, ctx: &RequestContext, err: &HandlerError) -> bool {
        if ctx.is_responded() {
            return false;
        }
        let err = localized(ctx, err);
        let response = Response::builder().status(err.status()).json_value(&err);
        ctx.commit(stamped(ctx, response))
    }
}

/// A responder that maps hints straight through its table: no verb
/// derivation, no redirects, errors as `{"message": …}`.
#[derive(Clone, Debug, Default)]
pub struct PlainResponder {
    statuses: Arc<StatusTable>,
}

impl PlainResponder {
    pub fn new(statuses: StatusTable) -> Self {
        Self { statuses: Arc::new(statuses) }
    }
}

impl Responder for PlainResponder {
    fn respond(&self, ctx: &RequestContext, status: StatusHint, payload: Value) -> bool {
        if ctx.is_responded() {
            return false;
        }
        let response = json_body(self.statuses.code(&status), &payload);
        ctx.commit(stamped(ctx, response))
    }

    fn respond_with_error(&self, ctx: &RequestContext, err: &HandlerError) -> bool {
        if ctx.is_responded() {
            return false;
        }
        let response = Response::builder()
            .status(err.status())
            .json_value(&json!({ "message": err.message() }));
        ctx.commit(stamped(ctx, response))
    }
}

fn json_body(code: StatusCode, payload: &Value) -> Response {
    if code == StatusCode::NO_CONTENT {
        return Response::status(code);
    }
    Response::builder().status(code).json_value(payload)
}

fn stamped(ctx: &RequestContext, mut response: Response) -> Response {
    response.push_header(REQUEST_UID_HEADER, ctx.uid());
    response
}

fn localized(ctx: &RequestContext, err: &HandlerError) -> HandlerError {
    match (ctx.language(), err.id()) {
        (Some(_), Some(id)) if !id.is_empty() => {
            let message = ctx.localize(id, err.message(), err.properties());
            err.clone().with_message(message)
        }
        _ => err.clone(),
    }
}
