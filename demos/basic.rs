//! Minimal gantry example: a cookie-session auth middleware in front of
//! CSRF-protected JSON endpoints.
//!
//! Run with:
//!   RUST_LOG=debug cargo run --example basic
//!
//! Try:
//!   curl http://localhost:3000/healthz
//!   curl -H 'authorization: Bearer alice' http://localhost:3000/api/orders/42
//!   curl -X POST http://localhost:3000/api/orders \
//!        -H 'authorization: Bearer alice' \
//!        -H 'x-csrf-token: s3cret' -H 'cookie: CSRF_TOKEN=s3cret' \
//!        -d '{"item":"widget"}'

use std::sync::Arc;

use gantry::{
    Authorization, BasicSession, HandlerError, HandlerUnit, Logger, Outcome, RequestContext, Router,
    Server, Session, TracingMonitoring,
};
use serde::{Deserialize, Serialize};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let auth = HandlerUnit::new(authenticate).with_logger(Logger::new("auth")).named("auth");

    let mut app = Router::new();
    app.set_monitoring(TracingMonitoring);
    app.get("/healthz", [HandlerUnit::new(healthz)])?;

    let mut api = app.group("/api");
    api.middleware([auth]);
    api.get("/orders/{id}", [HandlerUnit::new(get_order)])?
        .post("/orders", [HandlerUnit::new(create_order)])?
        .delete("/orders/{id}", [HandlerUnit::new(delete_order)])?;

    Server::bind("0.0.0.0:3000")?.serve(app).await?;
    Ok(())
}

struct Caller {
    token: String,
    account: String,
    scopes: Vec<String>,
    session: Arc<BasicSession>,
}

impl Authorization for Caller {
    fn token(&self) -> &str { &self.token }
    fn is_authenticated(&self) -> bool { true }
    fn current_account_id(&self) -> Option<String> { Some(self.account.clone()) }
    fn scopes(&self) -> &[String] { &self.scopes }

    fn session(&self) -> Option<Arc<dyn Session>> {
        Some(Arc::clone(&self.session) as Arc<dyn Session>)
    }
}

// Every authenticated caller gets the same fixed CSRF token. A real service
// would look the session up by cookie.
async fn authenticate(ctx: Arc<RequestContext>) -> Outcome {
    let Some(account) = ctx.header("authorization").and_then(|v| v.strip_prefix("Bearer ")) else {
        return HandlerError::unauthorized("missing bearer token").into();
    };
    ctx.set_auth(Arc::new(Caller {
        token: account.to_owned(),
        account: account.to_owned(),
        scopes: vec!["orders".to_owned()],
        session: Arc::new(BasicSession::new("s3cret", "DEFAULT")),
    }));
    Outcome::Next
}

async fn healthz(_ctx: Arc<RequestContext>) -> Outcome {
    Outcome::Next
}

#[derive(Deserialize, Serialize)]
struct Order {
    #[serde(default)]
    id: String,
    item: String,
}

// GET /api/orders/{id} → 200
async fn get_order(ctx: Arc<RequestContext>) -> Result<Order, HandlerError> {
    let id = ctx.param("id").unwrap_or_default();
    Ok(Order { id: id.to_owned(), item: "widget".to_owned() })
}

// POST /api/orders → 201
async fn create_order(ctx: Arc<RequestContext>) -> Result<Order, HandlerError> {
    let mut order: Order = ctx.bind_json()?;
    order.id = ctx.uid().to_owned();
    Ok(order)
}

// DELETE /api/orders/{id} → 204
async fn delete_order(_ctx: Arc<RequestContext>) -> Result<(), HandlerError> {
    Ok(())
}
