use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use gantry::{
    AccessLog, Authorization, BasicSession, ConfigError, HandlerError, HandlerUnit, Interrupt, JsonResponder,
    Logger, Monitoring, Outcome, Registry, RequestContext, Responder, Response, Router, ServerConfig,
    Session, StatusHint, UnitParts,
};
use http::StatusCode;
use serde_json::{Value, json};

// ── Fixtures ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Counting {
    started: AtomicUsize,
    ended: AtomicUsize,
    canceled_at_end: AtomicBool,
}

#[derive(Clone, Default)]
struct Hooks(Arc<Counting>);

impl Hooks {
    fn started(&self) -> usize { self.0.started.load(Ordering::SeqCst) }
    fn ended(&self) -> usize { self.0.ended.load(Ordering::SeqCst) }
}

impl Monitoring for Hooks {
    fn on_request_start(&self, _ctx: &RequestContext) {
        self.0.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_request_end(&self, ctx: &RequestContext) {
        self.0.ended.fetch_add(1, Ordering::SeqCst);
        self.0.canceled_at_end.store(ctx.connection().is_canceled(), Ordering::SeqCst);
    }
}

struct User {
    session: Arc<BasicSession>,
}

impl Authorization for User {
    fn token(&self) -> &str { "bearer" }
    fn is_authenticated(&self) -> bool { true }
    fn current_account_id(&self) -> Option<String> { Some("u-1".to_owned()) }
    fn scopes(&self) -> &[String] { &[] }

    fn session(&self) -> Option<Arc<dyn Session>> {
        Some(Arc::clone(&self.session) as Arc<dyn Session>)
    }
}

/// Middleware that authenticates everyone with a session of `session_type`.
fn auth(token: &'static str, session_type: &'static str) -> HandlerUnit {
    HandlerUnit::new(move |ctx: Arc<RequestContext>| async move {
        ctx.set_auth(Arc::new(User { session: Arc::new(BasicSession::new(token, session_type)) }));
        true
    })
    .with_logger(Logger::new("auth"))
    .named("auth")
}

fn pass() -> HandlerUnit {
    HandlerUnit::new(|_ctx: Arc<RequestContext>| async { true }).with_logger(Logger::new("pass"))
}

/// Terminal unit echoing the body and flagging that it ran.
fn business(ran: Arc<AtomicBool>) -> HandlerUnit {
    HandlerUnit::new(move |ctx: Arc<RequestContext>| {
        let ran = Arc::clone(&ran);
        async move {
            ran.store(true, Ordering::SeqCst);
            ctx.bind_json::<Value>()
        }
    })
}

fn post(uri: &str) -> http::request::Builder {
    http::Request::post(uri)
}

fn request(builder: http::request::Builder, body: &'static str) -> http::Request<Bytes> {
    builder.body(Bytes::from_static(body.as_bytes())).unwrap()
}

fn json_of(response: &Response) -> Value {
    serde_json::from_slice(response.body()).unwrap()
}

async fn send(router: &Router, req: http::Request<Bytes>) -> Response {
    router.handle(req, Some("192.0.2.1:5000".parse().unwrap())).await
}

// ── CSRF ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn matching_csrf_token_reaches_business_logic() {
    let ran = Arc::new(AtomicBool::new(false));
    let hooks = Hooks::default();
    let mut router = Router::new();
    router.set_monitoring(hooks.clone());
    router
        .post("/orders", [auth("t0k", "DEFAULT"), pass().named("csrf-check"), business(ran.clone())])
        .unwrap();

    let res = send(
        &router,
        request(
            post("/orders")
                .header("x-csrf-token", "t0k")
                .header("cookie", "CSRF_TOKEN=t0k"),
            r#"{"item":"widget"}"#,
        ),
    )
    .await;

    assert!(ran.load(Ordering::SeqCst));
    assert_eq!(res.status_code(), StatusCode::CREATED);
    assert_eq!(json_of(&res), json!({ "item": "widget" }));
    assert_eq!((hooks.started(), hooks.ended()), (1, 1));
}

#[tokio::test]
async fn missing_csrf_cookie_is_forbidden_before_business_logic() {
    let ran = Arc::new(AtomicBool::new(false));
    let hooks = Hooks::default();
    let mut router = Router::new();
    router.set_monitoring(hooks.clone());
    router.post("/orders", [auth("t0k", "DEFAULT"), pass(), business(ran.clone())]).unwrap();

    let res = send(&router, request(post("/orders").header("x-csrf-token", "t0k"), "{}")).await;

    assert_eq!(res.status_code(), StatusCode::FORBIDDEN);
    assert_eq!(json_of(&res)["type"], "forbidden");
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!((hooks.started(), hooks.ended()), (1, 1));
    assert!(!hooks.0.canceled_at_end.load(Ordering::SeqCst));
}

#[tokio::test]
async fn unknown_session_type_uses_default_policy() {
    let ran = Arc::new(AtomicBool::new(false));
    let mut router = Router::new();
    router.put("/orders/{id}", [auth("abc+1", "KIOSK"), business(ran.clone())]).unwrap();

    let res = send(
        &router,
        request(
            http::Request::put("/orders/7")
                .header("X-CSRF-TOKEN", "abc 1")
                .header("cookie", "CSRF_TOKEN=abc%2B1"),
            "null",
        ),
    )
    .await;
    // cookie decodes to "abc+1", header is "abc 1"
    assert_eq!(res.status_code(), StatusCode::FORBIDDEN);
    assert!(!ran.load(Ordering::SeqCst));

    let res = send(
        &router,
        request(
            http::Request::put("/orders/7")
                .header("X-CSRF-TOKEN", "abc+1")
                .header("cookie", "CSRF_TOKEN=abc%2B1"),
            "null",
        ),
    )
    .await;
    assert!(ran.load(Ordering::SeqCst));
    assert_eq!(res.status_code(), StatusCode::NO_CONTENT);
    assert!(res.body().is_empty());
}

#[tokio::test]
async fn empty_session_token_skips_csrf() {
    let ran = Arc::new(AtomicBool::new(false));
    let mut router = Router::new();
    router.post("/orders", [auth("", "DEFAULT"), business(ran.clone())]).unwrap();

    let res = send(&router, request(post("/orders"), "[1]")).await;
    assert_eq!(res.status_code(), StatusCode::CREATED);
    assert!(ran.load(Ordering::SeqCst));
}

// ── Chain shape ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn single_unit_chain_creates_context_and_responds() {
    let hooks = Hooks::default();
    let mut router = Router::new();
    router.set_monitoring(hooks.clone());
    router
        .get("/ping", [HandlerUnit::new(|_ctx: Arc<RequestContext>| async {
            Ok::<_, HandlerError>(json!({ "pong": true }))
        })])
        .unwrap();

    let res = send(&router, request(http::Request::get("/ping"), "")).await;
    assert_eq!(res.status_code(), StatusCode::OK);
    assert_eq!(json_of(&res), json!({ "pong": true }));
    assert_eq!((hooks.started(), hooks.ended()), (1, 1));
    assert!(!hooks.0.canceled_at_end.load(Ordering::SeqCst));
}

#[tokio::test]
async fn every_unit_sees_the_same_context() {
    let mut router = Router::new();
    let first = HandlerUnit::new(|ctx: Arc<RequestContext>| async move {
        ctx.set_temp("seen-by-first", ctx.uid().to_owned());
        true
    })
    .with_logger(Logger::new("first"));
    let last = HandlerUnit::new(|ctx: Arc<RequestContext>| async move {
        let seen = ctx.temp::<String>("seen-by-first").map(|s| s.as_str() == ctx.uid());
        Ok::<_, HandlerError>(json!({ "same": seen, "uid": ctx.uid() }))
    });
    router.get("/ctx", [first, pass(), last]).unwrap();

    let res = send(&router, request(http::Request::get("/ctx").header("x-request-uid", "req-42"), "")).await;
    assert_eq!(json_of(&res), json!({ "same": true, "uid": "req-42" }));
    assert_eq!(res.header("x-request-uid"), Some("req-42"));
}

#[tokio::test]
async fn middleware_halt_without_response_is_forbidden() {
    let ran = Arc::new(AtomicBool::new(false));
    let hooks = Hooks::default();
    let deny = HandlerUnit::new(|_ctx: Arc<RequestContext>| async { false }).with_logger(Logger::new("deny"));
    let mut router = Router::new();
    router.set_monitoring(hooks.clone());
    router.get("/secret", [deny, business(ran.clone())]).unwrap();

    let res = send(&router, request(http::Request::get("/secret"), "")).await;
    assert_eq!(res.status_code(), StatusCode::FORBIDDEN);
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(hooks.ended(), 1);
}

#[tokio::test]
async fn middleware_may_answer_and_stop() {
    let ran = Arc::new(AtomicBool::new(false));
    let cached = HandlerUnit::new(|ctx: Arc<RequestContext>| async move {
        JsonResponder::default().respond(&ctx, StatusHint::OK, json!("cached"));
        Outcome::Next
    })
    .with_logger(Logger::new("cache"));
    let mut router = Router::new();
    router.get("/items", [cached, business(ran.clone())]).unwrap();

    let res = send(&router, request(http::Request::get("/items"), "")).await;
    assert_eq!(res.status_code(), StatusCode::OK);
    assert_eq!(json_of(&res), json!("cached"));
    assert!(!ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn second_respond_is_a_no_op() {
    let mut router = Router::new();
    router
        .post("/twice", [HandlerUnit::new(|ctx: Arc<RequestContext>| async move {
            let responder = JsonResponder::default();
            let first = responder.respond(&ctx, StatusHint::CONFLICT, json!("first"));
            let second = responder.respond(&ctx, StatusHint::OK, json!("second"));
            assert!(first && !second);
            Outcome::reply(StatusHint::OK, &"third")
        })])
        .unwrap();

    let res = send(&router, request(post("/twice"), "")).await;
    assert_eq!(res.status_code(), StatusCode::CONFLICT);
    assert_eq!(json_of(&res), json!("first"));
}

// ── Lifecycle ────────────────────────────────────────────────────────────────

fn capture(slot: Arc<Mutex<Option<Arc<RequestContext>>>>, outcome: fn() -> Outcome) -> HandlerUnit {
    HandlerUnit::new(move |ctx: Arc<RequestContext>| {
        let slot = Arc::clone(&slot);
        async move {
            *slot.lock().unwrap() = Some(Arc::clone(&ctx));
            outcome()
        }
    })
}

#[tokio::test]
async fn terminal_error_ends_and_cancels_once() {
    let slot = Arc::new(Mutex::new(None));
    let hooks = Hooks::default();
    let mut router = Router::new();
    router.set_monitoring(hooks.clone());
    router
        .get("/fail", [pass(), capture(slot.clone(), || HandlerError::validation("bad $page").into())])
        .unwrap();

    let res = send(&router, request(http::Request::get("/fail"), "")).await;
    assert_eq!(res.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(json_of(&res)["message"], "bad $page");
    assert_eq!((hooks.started(), hooks.ended()), (1, 1));

    let ctx = slot.lock().unwrap().take().unwrap();
    assert!(ctx.connection().is_canceled());
    assert_eq!(ctx.connection().err(), Some(Interrupt::Canceled));
    assert_eq!(ctx.connection().timeout(), Duration::from_secs(30));
}

#[tokio::test]
async fn panicking_handler_is_contained() {
    let hooks = Hooks::default();
    let mut router = Router::new();
    router.set_monitoring(hooks.clone());
    router
        .get("/boom", [pass(), HandlerUnit::new(|_ctx: Arc<RequestContext>| async {
            if true {
                panic!("boom");
            }
            Outcome::Next
        })])
        .unwrap();

    let res = send(&router, request(http::Request::get("/boom"), "")).await;
    assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json_of(&res)["type"], "internal");
    assert_eq!((hooks.started(), hooks.ended()), (1, 1));
}

#[tokio::test(start_paused = true)]
async fn slow_work_is_cut_off_at_the_deadline() {
    let mut router = Router::new();
    let mut api = router.group("/api");
    api.set_connection_timeout(Duration::from_millis(50));
    api.get("/slow", [HandlerUnit::new(|ctx: Arc<RequestContext>| async move {
        ctx.connection().run(tokio::time::sleep(Duration::from_secs(5))).await?;
        Ok::<_, HandlerError>("done")
    })])
    .unwrap();

    let res = send(&router, request(http::Request::get("/api/slow"), "")).await;
    assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json_of(&res)["message"], "request deadline exceeded");
}

#[tokio::test(start_paused = true)]
async fn handed_out_token_fires_at_the_deadline() {
    let mut router = Router::new();
    let mut api = router.group("/api");
    api.set_connection_timeout(Duration::from_millis(50));
    api.get("/watch", [HandlerUnit::new(|ctx: Arc<RequestContext>| async move {
        let token = ctx.connection().token();
        tokio::select! {
            () = token.cancelled() => Ok(ctx.connection().is_canceled()),
            () = tokio::time::sleep(Duration::from_secs(5)) => Err(HandlerError::internal("token never fired")),
        }
    })])
    .unwrap();

    let res = send(&router, request(http::Request::get("/api/watch"), "")).await;
    assert_eq!(res.status_code(), StatusCode::OK);
    assert_eq!(json_of(&res), json!(true));
}

#[tokio::test]
async fn dropping_an_unfinished_request_ends_it_once() {
    let slot = Arc::new(Mutex::new(None));
    let hooks = Hooks::default();
    let mut router = Router::new();
    router.set_monitoring(hooks.clone());
    router
        .get("/hang", [
            capture(slot.clone(), || Outcome::Next).with_logger(Logger::new("capture")),
            HandlerUnit::new(|_ctx: Arc<RequestContext>| std::future::pending::<Outcome>()),
        ])
        .unwrap();

    let pending = tokio::time::timeout(
        Duration::from_millis(20),
        send(&router, request(http::Request::get("/hang"), "")),
    )
    .await;
    assert!(pending.is_err());
    assert_eq!((hooks.started(), hooks.ended()), (1, 1));
    assert!(!hooks.0.canceled_at_end.load(Ordering::SeqCst));

    let ctx = slot.lock().unwrap().take().unwrap();
    assert_eq!(ctx.connection().err(), Some(Interrupt::Canceled));
}

// ── Routing ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_routes_and_verbs() {
    let mut router = Router::new();
    router.get("/orders", [pass()]).unwrap();
    router.post("/orders", [pass()]).unwrap();

    let res = send(&router, request(http::Request::get("/nope"), "")).await;
    assert_eq!(res.status_code(), StatusCode::NOT_FOUND);
    assert_eq!(json_of(&res)["type"], "not_found");

    let res = send(&router, request(http::Request::delete("/orders"), "")).await;
    assert_eq!(res.status_code(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(res.header("allow"), Some("GET, POST"));
}

#[tokio::test]
async fn groups_inherit_middleware_registered_before_them() {
    let tag = |name: &'static str| {
        HandlerUnit::new(move |ctx: Arc<RequestContext>| async move {
            let mut trail = ctx.temp::<Vec<&'static str>>("trail").map(|t| (*t).clone()).unwrap_or_default();
            trail.push(name);
            ctx.set_temp("trail", trail);
            true
        })
        .with_logger(Logger::new(name))
    };
    let trail = || {
        HandlerUnit::new(|ctx: Arc<RequestContext>| async move {
            let trail = ctx.temp::<Vec<&'static str>>("trail").map(|t| (*t).clone()).unwrap_or_default();
            Ok::<_, HandlerError>(trail)
        })
    };

    let mut router = Router::new();
    router.get("/bare", [trail()]).unwrap();
    router.middleware([tag("root")]);
    {
        let mut api = router.group("/api");
        api.middleware([tag("api")]);
        api.get("/x", [trail()]).unwrap();
        let mut v1 = api.group("v1");
        v1.middleware([tag("v1")]);
        v1.get("/x", [trail()]).unwrap();
        api.get("/y", [trail()]).unwrap();
    }
    router.get("/z", [trail()]).unwrap();

    let get = |path: &'static str| request(http::Request::get(path), "");
    assert_eq!(json_of(&send(&router, get("/bare")).await), json!([]));
    assert_eq!(json_of(&send(&router, get("/api/x")).await), json!(["root", "api"]));
    assert_eq!(json_of(&send(&router, get("/api/v1/x")).await), json!(["root", "api", "v1"]));
    assert_eq!(json_of(&send(&router, get("/api/y")).await), json!(["root", "api"]));
    assert_eq!(json_of(&send(&router, get("/z")).await), json!(["root"]));
}

// ── Configuration ────────────────────────────────────────────────────────────

#[tokio::test]
async fn configured_middleware_guards_every_route() {
    let config = ServerConfig::from_toml(
        r#"
        [http]
        service_name = "orders"

        [[middlewares]]
        name = "auth"
        type = "require-auth"
        "#,
    )
    .unwrap();
    let parts = UnitParts::new(Logger::new("middleware"));
    let mut router = Router::from_config(&config, &Registry::with_builtins(), &parts).unwrap();
    router.get("/orders", [pass()]).unwrap();

    let res = send(&router, request(http::Request::get("/orders"), "")).await;
    assert_eq!(res.status_code(), StatusCode::UNAUTHORIZED);
}

#[test]
fn startup_fails_on_unknown_middleware_or_missing_logger() {
    let config = ServerConfig::from_toml(
        r#"
        [[middlewares]]
        name = "limits"
        type = "rate-limit"
        "#,
    )
    .unwrap();
    let parts = UnitParts::new(Logger::default());
    assert!(matches!(
        Router::from_config(&config, &Registry::with_builtins(), &parts),
        Err(ConfigError::UnknownMiddleware(_)),
    ));

    let mut router = Router::new();
    router.set_access_log(AccessLog::new("orders"));
    let unlogged = HandlerUnit::new(|_ctx: Arc<RequestContext>| async { true });
    assert!(matches!(
        router.get("/x", [unlogged, pass()]),
        Err(ConfigError::MissingLogger { index: 0, .. }),
    ));
}
