//! Route tables and groups.
//!
//! One radix tree per HTTP method. Each registered path maps to a chain
//! compiled once, at registration, from the enclosing scope's middleware
//! followed by the route's own units. Nothing is composed per request.
//!
//! A [`Group`] is a prefix plus a copy of its parent's middleware, settings
//! and monitoring, taken when the group is created. Changing a group never
//! changes its parent, and middleware only applies to routes registered
//! after it.
//!
//! ```rust
//! use std::sync::Arc;
//! use gantry::{HandlerUnit, Logger, RequestContext, Router};
//!
//! async fn list(_ctx: Arc<RequestContext>) -> Result<Vec<u32>, gantry::HandlerError> {
//!     Ok(vec![1, 2, 3])
//! }
//!
//! # fn main() -> Result<(), gantry::ConfigError> {
//! let auth = HandlerUnit::new(|ctx: Arc<RequestContext>| async move { ctx.is_authenticated() })
//!     .with_logger(Logger::new("auth"));
//!
//! let mut router = Router::new();
//! let mut api = router.group("/api");
//! api.middleware([auth]);
//! api.get("/orders", [HandlerUnit::new(list)])?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use matchit::Router as MatchitRouter;

use crate::chain::Chain;
use crate::config::{MiddlewareConfig, ServerConfig, Settings};
use crate::csrf::CsrfPolicies;
use crate::error::{ConfigError, ErrorKind, HandlerError};
use crate::handler::HandlerUnit;
use crate::logger::{AccessLog, Completion};
use crate::method::Method;
use crate::monitoring::{Monitoring, NoopMonitoring};
use crate::registry::{Registry, UnitParts};
use crate::request::{self, Request};
use crate::response::Response;

struct Route {
    chain: Chain,
    pattern: Arc<str>,
}

type Table = HashMap<Method, MatchitRouter<Route>>;

enum Lookup<'a> {
    Found(Method, &'a Route, HashMap<String, String>),
    MethodNotAllowed(Vec<Method>),
    NotFound,
}

// ── Scope ────────────────────────────────────────────────────────────────────

/// What a route inherits from where it is registered.
#[derive(Clone)]
struct Scope {
    prefix: String,
    middleware: Vec<HandlerUnit>,
    settings: Arc<Settings>,
    monitoring: Arc<dyn Monitoring>,
}

impl Scope {
    fn child(&self, prefix: &str) -> Self {
        Self { prefix: join(&self.prefix, prefix), ..self.clone() }
    }

    fn register(
        &self,
        table: &mut Table,
        method: Method,
        path: &str,
        units: impl IntoIterator<Item = HandlerUnit>,
    ) -> Result<(), ConfigError> {
        let pattern = join(&self.prefix, path);
        let units: Vec<HandlerUnit> = self.middleware.iter().cloned().chain(units).collect();
        let chain = Chain::compile(units, &self.settings, &self.monitoring)?;
        let route = Route { chain, pattern: Arc::from(pattern.as_str()) };

        table
            .entry(method)
            .or_default()
            .insert(pattern.as_str(), route)
            .map_err(|source| ConfigError::InvalidRoute { path: pattern, source })
    }
}

fn join(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    match path {
        "" | "/" if !prefix.is_empty() => prefix.to_owned(),
        p if p.starts_with('/') => format!("{prefix}{p}"),
        p => format!("{prefix}/{p}"),
    }
}

macro_rules! verbs {
    ($($name:ident => $method:ident),* $(,)?) => {
        $(
            pub fn $name(
                &mut self,
                path: &str,
                units: impl IntoIterator<Item = HandlerUnit>,
            ) -> Result<&mut Self, ConfigError> {
                self.on(Method::$method, path, units)
            }
        )*
    };
}

// ── Router ───────────────────────────────────────────────────────────────────

/// The application router.
///
/// Build it once at startup and hand it to [`Server::serve`](crate::Server::serve),
/// or call [`Router::handle`] directly.
pub struct Router {
    table: Table,
    root: Scope,
    access_log: Option<Arc<AccessLog>>,
}

impl Router {
    pub fn new() -> Self {
        Self::with_settings(Settings::default())
    }

    pub fn with_settings(settings: Settings) -> Self {
        Self {
            table: HashMap::new(),
            root: Scope {
                prefix: String::new(),
                middleware: Vec::new(),
                settings: Arc::new(settings),
                monitoring: Arc::new(NoopMonitoring),
            },
            access_log: None,
        }
    }

    /// A router with the configured settings, access log and router-wide
    /// middleware.
    pub fn from_config(
        config: &ServerConfig,
        registry: &Registry,
        parts: &UnitParts,
    ) -> Result<Self, ConfigError> {
        let mut router = Self::with_settings(config.settings()?);
        router.set_access_log(config.access_log());
        router.setup_middlewares(registry, &config.middlewares, parts)?;
        Ok(router)
    }

    /// Hooks for routes registered from now on.
    pub fn set_monitoring(&mut self, monitoring: impl Monitoring) -> &mut Self {
        self.root.monitoring = Arc::new(monitoring);
        self
    }

    pub fn set_access_log(&mut self, access_log: AccessLog) -> &mut Self {
        self.access_log = Some(Arc::new(access_log));
        self
    }

    /// Prepends `units` to every route registered from now on.
    pub fn middleware(&mut self, units: impl IntoIterator<Item = HandlerUnit>) -> &mut Self {
        self.root.middleware.extend(units);
        self
    }

    /// Resolves configured middleware in order and installs it router-wide.
    pub fn setup_middlewares(
        &mut self,
        registry: &Registry,
        entries: &[MiddlewareConfig],
        parts: &UnitParts,
    ) -> Result<&mut Self, ConfigError> {
        let units = entries
            .iter()
            .map(|entry| registry.resolve(entry, parts))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.middleware(units))
    }

    pub fn on(
        &mut self,
        method: Method,
        path: &str,
        units: impl IntoIterator<Item = HandlerUnit>,
    ) -> Result<&mut Self, ConfigError> {
        self.root.register(&mut self.table, method, path, units)?;
        Ok(self)
    }

    verbs! {
        get    => Get,
        post   => Post,
        put    => Put,
        patch  => Patch,
        delete => Delete,
    }

    /// A namespace under `prefix` inheriting this router's configuration.
    pub fn group(&mut self, prefix: &str) -> Group<'_> {
        Group { table: &mut self.table, scope: self.root.child(prefix) }
    }

    /// Routes one request and runs its chain.
    pub async fn handle(&self, req: http::Request<Bytes>, peer: Option<SocketAddr>) -> Response {
        let started = Instant::now();
        let (parts, body) = req.into_parts();

        let (method, route, params) = match self.lookup(&parts.method, parts.uri.path()) {
            Lookup::Found(method, route, params) => (method, route, params),
            Lookup::MethodNotAllowed(allowed) => {
                let allow = allowed.iter().map(|m| m.as_str()).collect::<Vec<_>>().join(", ");
                let err = HandlerError::new(ErrorKind::MethodNotAllowed, "method not allowed");
                let response = Response::builder().status(err.status()).header("allow", &allow).json_value(&err);
                self.log_unrouted(&parts, peer, &response, started.elapsed());
                return response;
            }
            Lookup::NotFound => {
                let response = Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .json_value(&HandlerError::not_found("route not found"));
                self.log_unrouted(&parts, peer, &response, started.elapsed());
                return response;
            }
        };

        let request = Request::new(method, parts, body, Arc::clone(&route.pattern), params, peer);
        let finished = route.chain.run(request).await;

        if let (Some(log), Some(ctx)) = (&self.access_log, &finished.context) {
            let uri = ctx.request().uri();
            log.record(&Completion {
                route: ctx.route(),
                path: uri.path(),
                query: uri.query(),
                ip: ctx.client_ip(),
                method: ctx.method().as_str(),
                status: finished.response.status_code(),
                elapsed: started.elapsed(),
                uid: Some(ctx.uid()),
                user_id: ctx.current_account_id(),
                mode: ctx.header("x-mode"),
            });
        }
        finished.response
    }

    fn lookup(&self, method: &http::Method, path: &str) -> Lookup<'_> {
        if let Ok(method) = Method::try_from(method) {
            if let Some(matched) = self.table.get(&method).and_then(|tree| tree.at(path).ok()) {
                let params = matched
                    .params
                    .iter()
                    .map(|(k, v)| (k.to_owned(), v.to_owned()))
                    .collect();
                return Lookup::Found(method, matched.value, params);
            }
        }

        let mut allowed: Vec<Method> = self
            .table
            .iter()
            .filter(|(_, tree)| tree.at(path).is_ok())
            .map(|(method, _)| *method)
            .collect();
        if allowed.is_empty() {
            return Lookup::NotFound;
        }
        allowed.sort_by_key(|m| m.as_str());
        Lookup::MethodNotAllowed(allowed)
    }

    fn log_unrouted(
        &self,
        parts: &http::request::Parts,
        peer: Option<SocketAddr>,
        response: &Response,
        elapsed: Duration,
    ) {
        let Some(log) = &self.access_log else { return };
        let ip = request::client_ip(&parts.headers, peer);
        log.record(&Completion {
            route: parts.uri.path(),
            path: parts.uri.path(),
            query: parts.uri.query(),
            ip: &ip,
            method: parts.method.as_str(),
            status: response.status_code(),
            elapsed,
            uid: None,
            user_id: None,
            mode: parts.headers.get("x-mode").and_then(|v| v.to_str().ok()),
        });
    }
}

impl Default for Router {
    fn default() -> Self { Self::new() }
}

// ── Group ────────────────────────────────────────────────────────────────────

/// A route namespace borrowed from a [`Router`].
pub struct Group<'r> {
    table: &'r mut Table,
    scope: Scope,
}

impl Group<'_> {
    pub fn prefix(&self) -> &str { &self.scope.prefix }

    /// Prepends `units` to routes registered on this group from now on.
    pub fn middleware(&mut self, units: impl IntoIterator<Item = HandlerUnit>) -> &mut Self {
        self.scope.middleware.extend(units);
        self
    }

    pub fn set_connection_timeout(&mut self, timeout: Duration) -> &mut Self {
        let settings = Settings::clone(&self.scope.settings).with_connection_timeout(timeout);
        self.scope.settings = Arc::new(settings);
        self
    }

    pub fn set_csrf_policies(&mut self, policies: CsrfPolicies) -> &mut Self {
        let settings = Settings::clone(&self.scope.settings).with_csrf_policies(policies);
        self.scope.settings = Arc::new(settings);
        self
    }

    pub fn set_monitoring(&mut self, monitoring: impl Monitoring) -> &mut Self {
        self.scope.monitoring = Arc::new(monitoring);
        self
    }

    pub fn on(
        &mut self,
        method: Method,
        path: &str,
        units: impl IntoIterator<Item = HandlerUnit>,
    ) -> Result<&mut Self, ConfigError> {
        self.scope.register(self.table, method, path, units)?;
        Ok(self)
    }

    verbs! {
        get    => Get,
        post   => Post,
        put    => Put,
        patch  => Patch,
        delete => Delete,
    }

    /// A nested namespace. It copies this group's state as it is now.
    pub fn group(&mut self, prefix: &str) -> Group<'_> {
        Group { table: &mut *self.table, scope: self.scope.child(prefix) }
    }
}
