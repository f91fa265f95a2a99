//! Per-request context.
//!
//! # Ownership
//!
//! One [`RequestContext`] per inbound request. The entry unit of a chain
//! creates it and every later unit receives the same `Arc`. Nothing else is
//! shared between units of one request.
//!
//! # Concurrency discipline
//!
//! Units run strictly one after another, but a handler may fan out work of
//! its own and hand the `Arc` to spawned tasks. Everything mutable is
//! therefore behind a lock:
//!
//! - the temp store: one `Mutex`, held only for the single read or write;
//! - auth: an `RwLock`, written by the auth collaborator, read by everyone;
//! - the outgoing slot: a `Mutex` under which the responded flag is
//!   checked and set together with the write, so exactly one response wins.
//!
//! # Cancellation
//!
//! The [`Connection`] scope is canceled when the chain ends or when its
//! deadline (30 s unless configured) passes, whichever comes first. Tokens
//! handed out by [`Connection::token`] fire in both cases. Handlers can also
//! wait on [`Connection::done`] or wrap slow calls in [`Connection::run`].

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::auth::{Authorization, Session};
use crate::error::HandlerError;
use crate::language::{Catalog, Language, Localizer};
use crate::logger::Logger;
use crate::method::Method;
use crate::request::{Request, query_unescape};
use crate::response::Response;

/// Header carrying the client-supplied request UID.
pub const REQUEST_UID_HEADER: &str = "x-request-uid";

// ── Connection scope ──────────────────────────────────────────────────────────

/// Why a connection scope ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Interrupt {
    #[error("request canceled")]
    Canceled,

    #[error("request deadline exceeded")]
    DeadlineExceeded,
}

impl From<Interrupt> for HandlerError {
    fn from(i: Interrupt) -> Self {
        HandlerError::internal(i.to_string())
    }
}

/// A cancelable, deadline-bound scope derived for one request.
#[derive(Debug)]
pub struct Connection {
    uid: String,
    client_ip: String,
    created: Instant,
    deadline: Instant,
    token: CancellationToken,
    expired: Arc<AtomicBool>,
}

impl Connection {
    /// Inside a runtime a timer task cancels the token at the deadline. It
    /// exits early once the scope is canceled.
    fn new(uid: String, client_ip: String, timeout: Duration) -> Self {
        let created = Instant::now();
        let deadline = created + timeout;
        let token = CancellationToken::new();
        let expired = Arc::new(AtomicBool::new(false));

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let token = token.clone();
            let expired = Arc::clone(&expired);
            runtime.spawn(async move {
                tokio::select! {
                    () = token.cancelled() => {}
                    () = sleep_until(deadline) => {
                        expired.store(true, Ordering::Release);
                        token.cancel();
                    }
                }
            });
        }

        Self { uid, client_ip, created, deadline, token, expired }
    }

    pub fn uid(&self) -> &str { &self.uid }
    pub fn client_ip(&self) -> &str { &self.client_ip }
    pub fn deadline(&self) -> Instant { self.deadline }

    pub fn timeout(&self) -> Duration {
        self.deadline - self.created
    }

    /// A token canceled together with this scope, at the deadline or when
    /// the chain ends, for handing to collaborators that take one.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// True exactly when [`err`](Connection::err) is `Some`.
    pub fn is_canceled(&self) -> bool {
        self.err().is_some()
    }

    fn interrupt(&self) -> Interrupt {
        if self.expired.load(Ordering::Acquire) {
            Interrupt::DeadlineExceeded
        } else {
            Interrupt::Canceled
        }
    }

    /// `Some` once the scope has been canceled or its deadline has passed.
    pub fn err(&self) -> Option<Interrupt> {
        if self.token.is_cancelled() {
            Some(self.interrupt())
        } else if Instant::now() >= self.deadline {
            Some(Interrupt::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Resolves when the scope is canceled or the deadline passes.
    pub async fn done(&self) -> Interrupt {
        tokio::select! {
            biased;
            () = self.token.cancelled() => self.interrupt(),
            () = sleep_until(self.deadline) => Interrupt::DeadlineExceeded,
        }
    }

    /// Runs `fut` unless the scope ends first.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Interrupt> {
        tokio::select! {
            biased;
            interrupt = self.done() => Err(interrupt),
            out = fut => Ok(out),
        }
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }
}

// ── Pagination ────────────────────────────────────────────────────────────────

/// Paging parameters read from `$page`, `$perpage` and `$sortby`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Pagination {
    pub page: u32,
    pub per_page: u32,
    pub sort_by: String,
}

// ── Request context ───────────────────────────────────────────────────────────

type TempValue = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
struct Outgoing {
    response: Option<Response>,
    status: Option<StatusCode>,
    headers: Vec<(String, String)>,
}

/// State shared by every unit of one request's chain.
pub struct RequestContext {
    uid: String,
    request: Request,
    connection: Connection,
    logger: Logger,
    language: Option<Language>,
    auth: RwLock<Option<Arc<dyn Authorization>>>,
    temp: Mutex<HashMap<String, TempValue>>,
    responded: AtomicBool,
    outgoing: Mutex<Outgoing>,
    paging: OnceLock<Pagination>,
    filters: OnceLock<HashMap<String, Vec<String>>>,
}

impl RequestContext {
    /// Created → Populated: UID, connection scope, logger and language bound.
    pub(crate) fn create(
        request: Request,
        timeout: Duration,
        logger: &Logger,
        catalog: Option<&Arc<Catalog>>,
    ) -> Arc<Self> {
        let uid = request
            .header(REQUEST_UID_HEADER)
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let connection = Connection::new(uid.clone(), request.client_ip(), timeout);
        let language = catalog.map(|catalog| {
            let accept_language = request.header("accept-language").unwrap_or_default().to_owned();
            let localizer = Localizer::new(Arc::clone(catalog), &accept_language);
            Language { accept_language, localizer }
        });

        Arc::new(Self {
            logger: logger.with_uid(&uid),
            uid,
            request,
            connection,
            language,
            auth: RwLock::new(None),
            temp: Mutex::new(HashMap::new()),
            responded: AtomicBool::new(false),
            outgoing: Mutex::new(Outgoing::default()),
            paging: OnceLock::new(),
            filters: OnceLock::new(),
        })
    }

    pub fn uid(&self) -> &str { &self.uid }
    pub fn request(&self) -> &Request { &self.request }
    pub fn connection(&self) -> &Connection { &self.connection }
    pub fn logger(&self) -> &Logger { &self.logger }
    pub fn language(&self) -> Option<&Language> { self.language.as_ref() }

    pub fn method(&self) -> Method { self.request.method() }
    pub fn client_ip(&self) -> &str { self.connection.client_ip() }

    /// The matched route pattern.
    pub fn route(&self) -> &str { self.request.route() }

    pub fn header(&self, name: &str) -> Option<&str> { self.request.header(name) }
    pub fn param(&self, key: &str) -> Option<&str> { self.request.param(key) }
    pub fn query(&self, key: &str) -> Option<String> { self.request.query(key) }
    pub fn body(&self) -> &Bytes { self.request.body() }

    /// Cookie value, decoded the same way the CSRF check decodes it.
    pub fn cookie(&self, name: &str) -> Option<String> {
        query_unescape(self.request.cookie(name)?)
    }

    /// Deserialises the JSON body. Failures are validation errors.
    pub fn bind_json<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_slice(self.request.body())
            .map_err(|e| HandlerError::validation(format!("invalid request body: {e}")))
    }

    // ── Lazily derived views ─────────────────────────────────────────────────

    pub fn paging(&self) -> &Pagination {
        self.paging.get_or_init(|| Pagination {
            page: self.query("$page").and_then(|v| v.parse().ok()).unwrap_or_default(),
            per_page: self.query("$perpage").and_then(|v| v.parse().ok()).unwrap_or_default(),
            sort_by: self.query("$sortby").unwrap_or_default(),
        })
    }

    /// Every query key with all of its values.
    pub fn filters(&self) -> &HashMap<String, Vec<String>> {
        self.filters.get_or_init(|| {
            let mut filters: HashMap<String, Vec<String>> = HashMap::new();
            for (k, v) in self.request.query_pairs() {
                filters.entry(k).or_default().push(v);
            }
            filters
        })
    }

    /// Localises `id`, or returns `default` when no catalog is bound or the
    /// id is unknown in every preferred language.
    pub fn localize(&self, id: &str, default: &str, params: &Map<String, Value>) -> String {
        self.language
            .as_ref()
            .and_then(|l| l.localizer.localize(id, params))
            .unwrap_or_else(|| default.to_owned())
    }

    // ── Authorization ────────────────────────────────────────────────────────

    pub fn set_auth(&self, auth: Arc<dyn Authorization>) {
        *self.auth.write() = Some(auth);
    }

    pub fn auth(&self) -> Option<Arc<dyn Authorization>> {
        self.auth.read().clone()
    }

    pub fn session(&self) -> Option<Arc<dyn Session>> {
        self.auth().and_then(|a| a.session())
    }

    pub fn token(&self) -> String {
        self.auth().map(|a| a.token().to_owned()).unwrap_or_default()
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth().is_some_and(|a| a.is_authenticated())
    }

    pub fn current_account_id(&self) -> Option<String> {
        self.auth().and_then(|a| a.current_account_id())
    }

    pub fn scopes(&self) -> Vec<String> {
        self.auth().map(|a| a.scopes().to_vec()).unwrap_or_default()
    }

    pub fn has_scope(&self, scopes: &[&str]) -> bool {
        self.auth().is_some_and(|a| a.has_scope(scopes))
    }

    // ── Temp store ───────────────────────────────────────────────────────────

    pub fn set_temp<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.temp.lock().insert(key.into(), Arc::new(value));
    }

    /// `None` when the key is absent or holds a different type.
    pub fn temp<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.temp.lock().get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    pub fn remove_temp(&self, key: &str) -> bool {
        self.temp.lock().remove(key).is_some()
    }

    // ── Response ─────────────────────────────────────────────────────────────

    pub fn is_responded(&self) -> bool {
        self.responded.load(Ordering::Acquire)
    }

    /// Stores `response` unless one was already committed. Returns whether
    /// this call won.
    pub fn commit(&self, response: Response) -> bool {
        let mut out = self.outgoing.lock();
        if self.responded.swap(true, Ordering::AcqRel) {
            return false;
        }
        out.status = Some(response.status_code());
        out.response = Some(response);
        true
    }

    /// Status of the committed response.
    pub fn status_code(&self) -> Option<StatusCode> {
        self.outgoing.lock().status
    }

    /// Header added to whatever response is eventually sent.
    pub fn append_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.outgoing.lock().headers.push((name.into(), value.into()));
    }

    /// Adds a `Set-Cookie` header; `cookie` is the full attribute string.
    pub fn set_cookie(&self, cookie: impl Into<String>) {
        self.append_header("set-cookie", cookie);
    }

    pub(crate) fn take_response(&self) -> Option<Response> {
        let mut out = self.outgoing.lock();
        let mut response = out.response.take()?;
        for (name, value) in out.headers.drain(..) {
            response.push_header(name, value);
        }
        Some(response)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::context;
    use super::*;
    use crate::request::test_support::request;

    fn get(uri: &'static str) -> http::Request<&'static str> {
        http::Request::get(uri).body("").unwrap()
    }

    #[test]
    fn uid_comes_from_header_or_is_generated() {
        let given = context(http::Request::get("/").header("X-Request-UID", "req-42").body("").unwrap());
        assert_eq!(given.uid(), "req-42");
        assert_eq!(given.connection().uid(), "req-42");

        let blank = context(http::Request::get("/").header("X-Request-UID", "").body("").unwrap());
        assert!(uuid::Uuid::parse_str(blank.uid()).is_ok());

        let other = context(get("/"));
        assert_ne!(blank.uid(), other.uid());
    }

    #[test]
    fn connection_carries_client_ip() {
        let ctx = context(http::Request::get("/").header("x-forwarded-for", "192.0.2.1, 10.1.1.1").body("").unwrap());
        assert_eq!(ctx.client_ip(), "192.0.2.1");
        assert_eq!(ctx.connection().client_ip(), "192.0.2.1");
    }

    #[test]
    fn only_the_first_commit_wins() {
        let ctx = context(get("/"));
        assert!(!ctx.is_responded());
        assert!(ctx.commit(Response::status(StatusCode::CREATED)));
        assert!(!ctx.commit(Response::status(StatusCode::CONFLICT)));
        assert!(ctx.is_responded());
        assert_eq!(ctx.status_code(), Some(StatusCode::CREATED));

        ctx.set_cookie("sid=1; HttpOnly");
        let response = ctx.take_response().unwrap();
        assert_eq!(response.status_code(), StatusCode::CREATED);
        assert_eq!(response.header("set-cookie"), Some("sid=1; HttpOnly"));
        assert!(ctx.take_response().is_none());
    }

    #[test]
    fn concurrent_commits_produce_one_response() {
        let ctx = context(get("/"));
        let winners: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| ctx.commit(Response::status(StatusCode::OK)) as usize))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(winners, 1);
    }

    #[test]
    fn temp_store_is_typed() {
        let ctx = context(get("/"));
        ctx.set_temp("tenant", String::from("acme"));
        ctx.set_temp("attempts", 3_u8);

        assert_eq!(ctx.temp::<String>("tenant").as_deref().map(String::as_str), Some("acme"));
        assert_eq!(ctx.temp::<u8>("attempts").as_deref(), Some(&3));
        assert!(ctx.temp::<u32>("attempts").is_none());
        assert!(ctx.remove_temp("tenant"));
        assert!(ctx.temp::<String>("tenant").is_none());
    }

    #[test]
    fn temp_store_is_shared_across_threads() {
        let ctx = context(get("/"));
        std::thread::scope(|s| {
            for i in 0..4 {
                let ctx = &ctx;
                s.spawn(move || ctx.set_temp(format!("k{i}"), i));
            }
        });
        assert_eq!((0..4).filter_map(|i| ctx.temp::<i32>(&format!("k{i}"))).count(), 4);
    }

    #[test]
    fn paging_and_filters_are_parsed_once() {
        let ctx = context(get("/items?$page=3&$perpage=25&$sortby=-created&tag=a&tag=b&$page=9"));
        assert_eq!(ctx.paging(), &Pagination { page: 3, per_page: 25, sort_by: "-created".into() });
        assert!(std::ptr::eq(ctx.paging(), ctx.paging()));
        assert_eq!(ctx.filters()["tag"], vec!["a", "b"]);

        let junk = context(get("/items?$page=abc"));
        assert_eq!(junk.paging(), &Pagination::default());
    }

    #[test]
    fn localize_falls_back_without_catalog() {
        let ctx = context(get("/"));
        assert_eq!(ctx.localize("greeting", "Hello", &Map::new()), "Hello");

        let mut catalog = Catalog::new("en");
        catalog.add("fr", "greeting", "Bonjour");
        let req = request(http::Request::get("/").header("accept-language", "fr-CA,fr").body("").unwrap());
        let ctx = RequestContext::create(req, Duration::from_secs(1), &Logger::default(), Some(&Arc::new(catalog)));
        assert_eq!(ctx.localize("greeting", "Hello", &Map::new()), "Bonjour");
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_defaults_to_thirty_seconds() {
        let ctx = context(get("/"));
        assert_eq!(ctx.connection().timeout(), Duration::from_secs(30));
        assert_eq!(ctx.connection().err(), None);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(ctx.connection().err(), None);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(ctx.connection().err(), Some(Interrupt::DeadlineExceeded));
        assert_eq!(ctx.connection().done().await, Interrupt::DeadlineExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn run_aborts_slow_work_at_the_deadline() {
        let ctx = context(get("/"));
        let slow = tokio::time::sleep(Duration::from_secs(60));
        assert_eq!(ctx.connection().run(slow).await, Err(Interrupt::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_cancels_handed_out_tokens() {
        let ctx = context(get("/"));
        let token = ctx.connection().token();
        assert!(!ctx.connection().is_canceled());

        tokio::time::timeout(Duration::from_secs(31), token.cancelled())
            .await
            .expect("token fires at the deadline");
        assert!(ctx.connection().is_canceled());
        assert_eq!(ctx.connection().err(), Some(Interrupt::DeadlineExceeded));
        assert_eq!(ctx.connection().done().await, Interrupt::DeadlineExceeded);

        // A later release keeps the original reason.
        ctx.connection().cancel();
        assert_eq!(ctx.connection().err(), Some(Interrupt::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn is_canceled_agrees_with_err_past_the_deadline() {
        let ctx = context(get("/"));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(ctx.connection().err(), Some(Interrupt::DeadlineExceeded));
        assert!(ctx.connection().is_canceled());
    }

    #[test]
    fn cookie_is_decoded_like_the_csrf_check() {
        let ctx = context(http::Request::get("/").header("cookie", "CSRF_TOKEN=a+b%2B1").body("").unwrap());
        assert_eq!(ctx.cookie("CSRF_TOKEN").as_deref(), Some("a b+1"));
        assert_eq!(ctx.cookie("missing"), None);
    }

    #[tokio::test]
    async fn cancel_notifies_waiters() {
        let ctx = context(get("/"));
        let token = ctx.connection().token();
        ctx.connection().cancel();
        assert!(token.is_cancelled());
        assert_eq!(ctx.connection().done().await, Interrupt::Canceled);
        assert_eq!(ctx.connection().run(async { 1 }).await, Err(Interrupt::Canceled));
        assert!(ctx.connection().is_canceled());
        assert_eq!(ctx.connection().err(), Some(Interrupt::Canceled));
    }
}
