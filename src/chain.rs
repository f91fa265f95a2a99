//! Chain compiler.
//!
//! An ordered list of handler units becomes middleware adapters plus one
//! terminal adapter, each tagged with its [`Position`] once, here, at
//! startup. Nothing about a chain is recomputed per request.
//!
//! ```text
//! [auth, csrf, orders::create]
//!    │     │        └── Terminal  responds, releases the connection scope
//!    │     └─────────── Middle    reuses the context
//!    └───────────────── Entry     creates the context
//!
//! [health]
//!    └───────────────── Sole      creates the context *and* responds
//! ```

use std::sync::Arc;

use crate::config::Settings;
use crate::context::RequestContext;
use crate::dispatch::{Adapter, Exchange, Step};
use crate::error::ConfigError;
use crate::handler::HandlerUnit;
use crate::monitoring::Monitoring;
use crate::request::Request;
use crate::response::Response;

/// Where a unit sits in its chain.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Position {
    /// First of several: creates the request context.
    Entry,
    /// Neither first nor last.
    Middle,
    /// Last of several: always responds and ends the request.
    Terminal,
    /// The only unit: both entry and terminal.
    Sole,
}

impl Position {
    fn of(index: usize, len: usize) -> Self {
        match (index, len) {
            (_, 1) => Self::Sole,
            (0, _) => Self::Entry,
            (i, n) if i + 1 == n => Self::Terminal,
            _ => Self::Middle,
        }
    }

    pub fn is_entry(self) -> bool {
        matches!(self, Self::Entry | Self::Sole)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminal | Self::Sole)
    }
}

/// A compiled, immutable chain shared by every request on its route.
pub(crate) struct Chain {
    middleware: Vec<Adapter>,
    terminal: Adapter,
}

impl Chain {
    /// Fails when `units` is empty or a non-terminal unit has no logger.
    pub(crate) fn compile(
        units: Vec<HandlerUnit>,
        settings: &Arc<Settings>,
        monitoring: &Arc<dyn Monitoring>,
    ) -> Result<Self, ConfigError> {
        let len = units.len();
        if len == 0 {
            return Err(ConfigError::EmptyChain);
        }

        let mut adapters = Vec::with_capacity(len);
        for (index, unit) in units.into_iter().enumerate() {
            let position = Position::of(index, len);
            if !position.is_terminal() && unit.logger().is_none() {
                return Err(ConfigError::MissingLogger {
                    index,
                    name: unit.name().unwrap_or("unnamed").to_owned(),
                });
            }
            adapters.push(Adapter::new(unit, position, Arc::clone(settings), Arc::clone(monitoring)));
        }

        let terminal = adapters.pop().ok_or(ConfigError::EmptyChain)?;
        Ok(Self { middleware: adapters, terminal })
    }

    /// Runs the chain for one request. Adapters execute strictly in order;
    /// the first one to stop ends the request.
    pub(crate) async fn run(&self, request: Request) -> Finished {
        let mut exchange = Exchange::new(request);
        for adapter in &self.middleware {
            if adapter.invoke(&mut exchange).await == Step::Stop {
                return exchange.finish();
            }
        }
        self.terminal.invoke(&mut exchange).await;
        exchange.finish()
    }

    #[cfg(test)]
    pub(crate) fn positions(&self) -> Vec<Position> {
        self.middleware
            .iter()
            .chain(std::iter::once(&self.terminal))
            .map(Adapter::position)
            .collect()
    }
}

/// The response of a finished chain and the context it ran on, if one was
/// ever created.
pub(crate) struct Finished {
    pub(crate) response: Response,
    pub(crate) context: Option<Arc<RequestContext>>,
}
