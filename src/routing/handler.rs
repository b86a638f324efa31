//! Handler type and the built-in status handlers.

use std::collections::HashMap;
use std::sync::Arc;

use crate::http::RequestContext;

/// A unit of request processing.
///
/// Handlers may write the response, abort, touch the scratch store, or push
/// further handlers with [`RequestContext::next`].
pub type Handler = Arc<dyn Fn(&mut RequestContext) + Send + Sync>;

/// Wrap a closure as a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&mut RequestContext) + Send + Sync + 'static,
{
    Arc::new(f)
}

pub const NOT_FOUND_MESSAGE: &str = "Page not found";
pub const FORBIDDEN_MESSAGE: &str = "Bad request";
pub const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";

fn abort_with(status: u16, message: &'static str) -> Handler {
    handler(move |ctx| ctx.abort(status, message))
}

/// Per-status handlers substituted for the route stack when a request
/// arrives already aborted or matches no route.
#[derive(Clone)]
pub struct DefaultHandlers {
    handlers: HashMap<u16, Handler>,
    fallback: Handler,
}

impl Default for DefaultHandlers {
    fn default() -> Self {
        let mut handlers = HashMap::new();
        handlers.insert(404, abort_with(404, NOT_FOUND_MESSAGE));
        handlers.insert(403, abort_with(403, FORBIDDEN_MESSAGE));
        handlers.insert(500, abort_with(500, INTERNAL_ERROR_MESSAGE));
        Self {
            handlers,
            fallback: abort_with(500, INTERNAL_ERROR_MESSAGE),
        }
    }
}

impl DefaultHandlers {
    /// Override or add the handler for `status`.
    pub fn set(&mut self, status: u16, handler: Handler) {
        self.handlers.insert(status, handler);
    }

    /// Handler for `status`.
    ///
    /// Informational and 200 statuses have none: the abort is served as-is.
    /// Statuses without a registered handler fall back to 500.
    pub fn resolve(&self, status: u16) -> Option<Handler> {
        if (100..=200).contains(&status) {
            return None;
        }
        Some(
            self.handlers
                .get(&status)
                .cloned()
                .unwrap_or_else(|| Arc::clone(&self.fallback)),
        )
    }

    /// The 404 handler used for unmatched routes.
    pub fn not_found(&self) -> Handler {
        self.handlers
            .get(&404)
            .cloned()
            .unwrap_or_else(|| abort_with(404, NOT_FOUND_MESSAGE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::AbortMessage;

    fn run(h: Handler) -> RequestContext {
        let mut ctx = RequestContext::new();
        h(&mut ctx);
        ctx
    }

    #[test]
    fn built_in_statuses_abort_with_their_message() {
        let defaults = DefaultHandlers::default();
        for (status, message) in [
            (404, NOT_FOUND_MESSAGE),
            (403, FORBIDDEN_MESSAGE),
            (500, INTERNAL_ERROR_MESSAGE),
        ] {
            let ctx = run(defaults.resolve(status).unwrap());
            let abort = ctx.abort_record().unwrap();
            assert_eq!(abort.status, status);
            assert_eq!(abort.message, AbortMessage::from(message));
        }
    }

    #[test]
    fn unknown_status_falls_back_to_500() {
        let ctx = run(DefaultHandlers::default().resolve(418).unwrap());
        assert_eq!(ctx.abort_record().unwrap().status, 500);
    }

    #[test]
    fn informational_and_ok_have_no_substitute() {
        let defaults = DefaultHandlers::default();
        assert!(defaults.resolve(101).is_none());
        assert!(defaults.resolve(200).is_none());
    }

    #[test]
    fn override_replaces_built_in() {
        let mut defaults = DefaultHandlers::default();
        defaults.set(404, handler(|ctx| ctx.text(404, "nothing here")));
        let ctx = run(defaults.not_found());
        assert!(!ctx.is_aborted());
        assert_eq!(ctx.response().body(), b"nothing here");
    }
}
