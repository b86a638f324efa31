//! Per-request LIFO of handlers.

use std::sync::Arc;

use crate::routing::Handler;

/// Handlers still to run for one request; the top runs next.
#[derive(Clone, Default)]
pub struct HandlerStack {
    items: Vec<Handler>,
}

impl HandlerStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents with a route's handler list so that popping
    /// yields the list in its original order.
    pub fn load(&mut self, handlers: &[Handler]) {
        self.items.clear();
        self.items.extend(handlers.iter().rev().map(Arc::clone));
    }

    pub fn push(&mut self, handler: Handler) {
        self.items.push(handler);
    }

    pub fn pop(&mut self) -> Option<Handler> {
        self.items.pop()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl std::fmt::Debug for HandlerStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerStack")
            .field("len", &self.items.len())
            .finish()
    }
}
