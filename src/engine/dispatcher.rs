//! Stack dispatch with execution strategies.
//!
//! # Responsibilities
//! - Turn framed bytes into a pooled `RequestContext`
//! - Seed the handler stack from the router or the default handlers
//! - Run handlers one hop at a time under the attached strategy
//! - Offload to background tasks for async and deadline-bound requests
//! - Finish every request exactly once: response, gates, metrics, access log
//!
//! # Design Decisions
//! - A context that arrives aborted (parse failure) runs the default handler
//!   for its status instead of a route; statuses up to 200 are served as-is
//! - An abort raised mid-dispatch ends the stack and is served verbatim
//! - Handler panics become abort 500 and close the connection
//! - On timeout the caller answers from a fresh context carrying the request
//!   summary; the background task is detached, finishes on its own and only
//!   reports its outcome to the gates
//! - Only the calling path may offload; background tasks run the rest of the
//!   stack inline

use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use crate::config::ServerConfig;
use crate::error::ParseError;
use crate::http::abort::{FUSING_DENY, SECURITY_DENY, TIMEOUT, TTL_EXCEEDED};
use crate::http::{codec, RequestContext, RequestSummary};
use crate::observability::{logging, metrics};
use crate::pool::{Pool, Pooled};
use crate::resilience::strategy::{GateKind, StrategyLimits};
use crate::resilience::task::{self, CancelFlag, SpawnError, TaskTracker};
use crate::routing::handler::INTERNAL_ERROR_MESSAGE;
use crate::routing::Router;

/// Message used when a request cannot be parsed; the default 403 handler
/// replaces it unless overridden.
const BAD_REQUEST: &str = "Bad Request";

/// Idle contexts kept for reuse.
const MAX_IDLE_CONTEXTS: usize = 1024;

/// Receives an async request's context once its stack has drained.
pub type Completion = Box<dyn FnOnce(Pooled<RequestContext>) + Send>;

/// Outcome of [`Dispatcher::dispatch`].
#[derive(Debug)]
pub enum Dispatched {
    /// The response is ready on the calling path.
    Ready(Pooled<RequestContext>),
    /// A background task owns the request and will call the completion.
    Deferred,
}

enum Step {
    Done,
    Offload,
}

#[derive(Clone, Copy)]
enum Mode<'a> {
    Caller,
    Background(&'a CancelFlag),
}

/// Shared request pipeline; one per server, used by every shard or worker.
pub struct Dispatcher {
    router: Arc<Router>,
    limits: StrategyLimits,
    tasks: TaskTracker,
    contexts: Pool<RequestContext>,
    version: String,
    access_log: bool,
}

impl Dispatcher {
    pub fn new(router: Arc<Router>, config: &ServerConfig) -> Self {
        Self {
            router,
            limits: StrategyLimits::from(&config.strategy),
            tasks: TaskTracker::with_limit(config.strategy.max_background_tasks),
            contexts: Pool::new(MAX_IDLE_CONTEXTS, RequestContext::new),
            version: config.response.version.clone(),
            access_log: config.observability.access_log,
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Background tasks spawned by async and timeout strategies.
    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    /// A blank pooled context.
    pub fn context(&self) -> Pooled<RequestContext> {
        self.contexts.get()
    }

    /// Parse one framed request. Malformed input yields a context aborted
    /// with 403.
    pub fn prepare(&self, raw: &[u8], client_addr: Option<SocketAddr>) -> Pooled<RequestContext> {
        let mut ctx = self.contexts.get();
        ctx.begin(client_addr);
        if let Err(err) = codec::parse_into(raw, &mut ctx) {
            tracing::debug!(error = %err, request_id = %ctx.request_id(), "Rejecting malformed request");
            ctx.abort(403, BAD_REQUEST);
        }
        ctx
    }

    /// Context for input that could not be framed at all; the connection
    /// cannot be resynchronised, so it is closed after the response.
    pub fn reject(&self, err: &ParseError, client_addr: Option<SocketAddr>) -> Pooled<RequestContext> {
        let mut ctx = self.contexts.get();
        ctx.begin(client_addr);
        tracing::debug!(error = %err, request_id = %ctx.request_id(), "Rejecting unframeable input");
        ctx.abort(403, BAD_REQUEST);
        ctx.close_connection();
        ctx
    }

    /// Serialise the response with the configured version.
    pub fn encode<'a>(&self, ctx: &'a mut RequestContext) -> &'a [u8] {
        ctx.response_mut().encode(&self.version)
    }

    /// Run a request to completion or hand it to a background task.
    pub fn dispatch(self: &Arc<Self>, mut ctx: Pooled<RequestContext>, completion: Completion) -> Dispatched {
        self.seed(&mut ctx);
        match self.drive(&mut ctx, Mode::Caller) {
            Step::Done => {
                self.complete(&mut ctx);
                Dispatched::Ready(ctx)
            }
            Step::Offload => self.offload(ctx, completion),
        }
    }

    fn seed(&self, ctx: &mut RequestContext) {
        if let Some(abort) = ctx.clear_abort() {
            match self.router.defaults().resolve(abort.status) {
                Some(handler) => ctx.stack_mut().push(handler),
                None => ctx.abort(abort.status, abort.message),
            }
            return;
        }

        match self.router.lookup(ctx.method(), ctx.path()) {
            Some(handlers) => ctx.stack_mut().load(handlers),
            None => {
                tracing::debug!(method = %ctx.method(), path = %ctx.path(), "No route matched");
                let not_found = self.router.defaults().not_found();
                ctx.stack_mut().push(not_found);
            }
        }
    }

    fn drive(&self, ctx: &mut RequestContext, mode: Mode<'_>) -> Step {
        loop {
            if ctx.is_aborted() || ctx.stack().is_empty() {
                return Step::Done;
            }
            if let Mode::Background(cancel) = mode {
                if cancel.is_cancelled() {
                    return Step::Done;
                }
            }
            if ctx.strategy().is_some() {
                if let Some(step) = self.apply_strategy(ctx, matches!(mode, Mode::Caller)) {
                    return step;
                }
            }
            self.hop(ctx);
        }
    }

    /// Arm the strategy and consult its gates. `Some` ends this drive.
    fn apply_strategy(&self, ctx: &mut RequestContext, may_offload: bool) -> Option<Step> {
        let mut strategy = ctx.take_strategy()?;
        strategy.arm(&self.limits);
        let denied = strategy
            .check_gates(ctx)
            .map(|kind| (kind, strategy.gate_name(kind)));
        let offload = may_offload && (strategy.timeout().is_some() || strategy.is_async());
        ctx.register_strategy(strategy);

        if let Some((kind, gate)) = denied {
            tracing::debug!(gate, request_id = %ctx.request_id(), "Gate rejected request");
            metrics::record_gate_denial(gate);
            let message = match kind {
                GateKind::Fusing => FUSING_DENY,
                GateKind::Security => SECURITY_DENY,
            };
            ctx.abort(403, message);
            return Some(Step::Done);
        }
        offload.then_some(Step::Offload)
    }

    /// Pop and invoke one handler, then charge the hop budget.
    fn hop(&self, ctx: &mut RequestContext) {
        let Some(handler) = ctx.stack_mut().pop() else {
            return;
        };

        if panic::catch_unwind(AssertUnwindSafe(|| handler(ctx))).is_err() {
            tracing::error!(
                request_id = %ctx.request_id(),
                method = %ctx.method(),
                path = %ctx.path(),
                "Handler panicked"
            );
            ctx.abort(500, INTERNAL_ERROR_MESSAGE);
            ctx.close_connection();
            return;
        }

        let limits = self.limits;
        let spent = ctx
            .strategy_mut()
            .map(|strategy| {
                strategy.arm(&limits);
                strategy.consume_hop()
            })
            .unwrap_or(false);
        if spent && !ctx.is_aborted() && !ctx.stack().is_empty() {
            tracing::debug!(request_id = %ctx.request_id(), remaining = ctx.stack().len(), "Hop budget spent");
            ctx.abort(200, TTL_EXCEEDED);
        }
    }

    fn offload(self: &Arc<Self>, ctx: Pooled<RequestContext>, completion: Completion) -> Dispatched {
        match ctx.strategy().and_then(|s| s.deadline()) {
            Some(deadline) => {
                let summary = ctx.summary();
                Dispatched::Ready(self.run_with_deadline(ctx, summary, deadline))
            }
            None => self.run_detached(ctx, completion),
        }
    }

    /// Async strategy: the rest of the stack runs in the background and the
    /// completion receives the finished context.
    fn run_detached(self: &Arc<Self>, ctx: Pooled<RequestContext>, completion: Completion) -> Dispatched {
        let dispatcher = Arc::clone(self);
        let spawned = task::spawn(&self.tasks, (ctx, completion), move |(mut ctx, completion), cancel| {
            dispatcher.drive(&mut ctx, Mode::Background(&cancel));
            dispatcher.complete(&mut ctx);
            completion(ctx);
        });

        match spawned {
            Ok(_task) => Dispatched::Deferred,
            Err(SpawnError {
                payload: (mut ctx, _completion),
                source,
            }) => {
                tracing::warn!(error = %source, "Background task spawn failed, running inline");
                self.drive(&mut ctx, Mode::Background(&CancelFlag::default()));
                self.complete(&mut ctx);
                Dispatched::Ready(ctx)
            }
        }
    }

    /// Timeout strategy: race the background stack against `deadline`.
    fn run_with_deadline(
        self: &Arc<Self>,
        ctx: Pooled<RequestContext>,
        summary: RequestSummary,
        deadline: Instant,
    ) -> Pooled<RequestContext> {
        let (sender, waiter) = task::handoff();
        let dispatcher = Arc::clone(self);
        let spawned = task::spawn(&self.tasks, ctx, move |mut ctx, cancel| {
            dispatcher.drive(&mut ctx, Mode::Background(&cancel));
            if let Err(mut abandoned) = sender.deliver(ctx) {
                dispatcher.settle(&mut abandoned);
            }
        });

        let task = match spawned {
            Ok(task) => task,
            Err(SpawnError { payload: mut ctx, source }) => {
                tracing::warn!(error = %source, "Background task spawn failed, running inline");
                self.drive(&mut ctx, Mode::Background(&CancelFlag::default()));
                self.complete(&mut ctx);
                return ctx;
            }
        };

        match waiter.wait_until(deadline) {
            Some(mut ctx) => {
                self.complete(&mut ctx);
                ctx
            }
            None => {
                tracing::warn!(
                    request_id = %summary.request_id,
                    path = %summary.path,
                    "Request timed out, detaching background task"
                );
                task.detach();
                let mut ctx = self.contexts.get();
                ctx.restore(summary);
                ctx.abort(200, TIMEOUT);
                self.complete(&mut ctx);
                ctx
            }
        }
    }

    /// Fold the abort into the response and report it to admitting gates.
    fn settle(&self, ctx: &mut RequestContext) {
        ctx.apply_abort();
        ctx.record_gate_outcomes(ctx.response().status());
    }

    fn complete(&self, ctx: &mut RequestContext) {
        self.settle(ctx);
        let status = ctx.response().status();
        metrics::record_request(status, ctx.received_at());
        if self.access_log {
            logging::log_access(ctx, status, ctx.received_at());
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("router", &self.router)
            .field("limits", &self.limits)
            .field("tasks", &self.tasks)
            .finish_non_exhaustive()
    }
}
