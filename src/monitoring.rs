//! Request start/end notifications.
//!
//! The dispatch loop calls [`Monitoring::on_request_start`] right after the
//! entry unit creates the request context and [`Monitoring::on_request_end`]
//! exactly once when the chain finishes, however it finishes. Hooks run
//! inline on the request task: keep them short and hand heavy work to a
//! channel. A panicking hook is logged and otherwise ignored.

use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::{debug, warn};

use crate::context::RequestContext;

pub trait Monitoring: Send + Sync + 'static {
    fn on_request_start(&self, ctx: &RequestContext);
    fn on_request_end(&self, ctx: &RequestContext);
}

/// Does nothing. The default for every router.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMonitoring;

impl Monitoring for NoopMonitoring {
    fn on_request_start(&self, _ctx: &RequestContext) {}
    fn on_request_end(&self, _ctx: &RequestContext) {}
}

/// Emits a debug event at both ends of every request.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingMonitoring;

impl Monitoring for TracingMonitoring {
    fn on_request_start(&self, ctx: &RequestContext) {
        ctx.logger().in_scope(|| debug!(route = ctx.route(), ip = ctx.client_ip(), "request started"));
    }

    fn on_request_end(&self, ctx: &RequestContext) {
        let status = ctx.status_code().map(|s| s.as_u16()).unwrap_or_default();
        ctx.logger().in_scope(|| debug!(route = ctx.route(), status, "request finished"));
    }
}

/// Runs a hook, containing any panic it raises.
pub(crate) fn notify(hook: &'static str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!(hook, "monitoring hook panicked");
    }
}
