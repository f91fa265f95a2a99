//! Middleware registry.
//!
//! Configuration names middleware by type string; the registry turns each
//! `[[middlewares]]` entry into a [`HandlerUnit`] at startup. An unknown
//! type is a [`ConfigError`], never a silently skipped entry.
//!
//! ```rust
//! use std::sync::Arc;
//! use gantry::{HandlerUnit, Registry, RequestContext};
//!
//! let mut registry = Registry::with_builtins();
//! registry.register("tenant", |parts, _config| {
//!     Ok(parts.unit(|ctx: Arc<RequestContext>| async move { ctx.header("x-tenant").is_some() }))
//! });
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::MiddlewareConfig;
use crate::context::RequestContext;
use crate::error::{ConfigError, HandlerError};
use crate::handler::{Handler, HandlerUnit, Outcome};
use crate::language::Catalog;
use crate::logger::Logger;
use crate::responder::{JsonResponder, Responder};

/// What every registry-built unit is assembled from.
#[derive(Clone)]
pub struct UnitParts {
    pub logger: Logger,
    pub responder: Arc<dyn Responder>,
    pub catalog: Option<Arc<Catalog>>,
}

impl UnitParts {
    pub fn new(logger: Logger) -> Self {
        Self { logger, responder: Arc::new(JsonResponder::default()), catalog: None }
    }

    pub fn with_catalog(mut self, catalog: Arc<Catalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// A unit for `handler` wired with these parts.
    pub fn unit(&self, handler: impl Handler) -> HandlerUnit {
        let unit = HandlerUnit::new(handler)
            .with_logger(self.logger.clone())
            .with_responder(Arc::clone(&self.responder));
        match &self.catalog {
            Some(catalog) => unit.with_catalog(Arc::clone(catalog)),
            None => unit,
        }
    }
}

type Factory = Arc<dyn Fn(&UnitParts, &toml::Value) -> Result<HandlerUnit, ConfigError> + Send + Sync>;

/// Type name → middleware factory.
#[derive(Clone, Default)]
pub struct Registry {
    factories: HashMap<String, Factory>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding `require-auth` and `require-scope`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register("require-auth", |parts, _| Ok(parts.unit(require_auth)))
            .register("require-scope", require_scope);
        registry
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&UnitParts, &toml::Value) -> Result<HandlerUnit, ConfigError> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(factory));
        self
    }

    /// Builds the unit for one configured entry.
    pub fn resolve(&self, entry: &MiddlewareConfig, parts: &UnitParts) -> Result<HandlerUnit, ConfigError> {
        let factory = self
            .factories
            .get(&entry.kind)
            .ok_or_else(|| ConfigError::UnknownMiddleware(entry.kind.clone()))?;
        Ok(factory(parts, &entry.config)?.named(entry.name.as_str()))
    }
}

async fn require_auth(ctx: Arc<RequestContext>) -> Outcome {
    if ctx.is_authenticated() {
        Outcome::Next
    } else {
        HandlerError::unauthorized("authentication required").into()
    }
}

fn require_scope(parts: &UnitParts, config: &toml::Value) -> Result<HandlerUnit, ConfigError> {
    let scopes: Vec<String> = config
        .get("scopes")
        .and_then(toml::Value::as_array)
        .map(|list| list.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect())
        .filter(|list: &Vec<String>| !list.is_empty())
        .ok_or_else(|| ConfigError::Middleware {
            name: "require-scope".to_owned(),
            reason: "`scopes` must be a non-empty list of strings".to_owned(),
        })?;
    let scopes: Arc<[String]> = scopes.into();

    Ok(parts.unit(move |ctx: Arc<RequestContext>| {
        let scopes = Arc::clone(&scopes);
        async move {
            let wanted: Vec<&str> = scopes.iter().map(String::as_str).collect();
            if ctx.has_scope(&wanted) {
                Outcome::Next
            } else {
                HandlerError::forbidden("missing scope").with_property("scopes", wanted).into()
            }
        }
    }))
}
