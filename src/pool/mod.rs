//! Object pools with an explicit reset contract.
//!
//! # Responsibilities
//! - Hand out reusable objects (`Pool::get`) wrapped in an RAII guard
//! - Reset every object before it is made available again
//! - Bound the number of idle objects kept around
//!
//! # Design Decisions
//! - The pool calls `Reset::reset` itself when a guard drops; callers never
//!   clear fields by hand, so request data cannot leak into the next borrower
//! - Idle objects live in a lock-free `ArrayQueue` sized to `max_idle`; a
//!   borrowed object is owned exclusively by the guard holder until it drops
//! - Overflow beyond `max_idle` is simply dropped

mod buffer;

pub use buffer::ReadBuffer;

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

/// Clears every request-specific field of a pooled object.
pub trait Reset {
    fn reset(&mut self);
}

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

struct Shared<T> {
    idle: ArrayQueue<T>,
    factory: Factory<T>,
    max_idle: usize,
}

/// Thread-safe free list of `T`.
pub struct Pool<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Reset> Pool<T> {
    /// Create a pool that builds new objects with `factory` and keeps at most
    /// `max_idle` returned objects.
    pub fn new<F>(max_idle: usize, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                // ArrayQueue rejects a zero capacity; max_idle 0 is checked on release.
                idle: ArrayQueue::new(max_idle.max(1)),
                factory: Box::new(factory),
                max_idle,
            }),
        }
    }

    /// Borrow an object, reusing an idle one when available.
    pub fn get(&self) -> Pooled<T> {
        let value = self
            .shared
            .idle
            .pop()
            .unwrap_or_else(|| (self.shared.factory)());

        Pooled {
            value: Some(value),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Number of objects currently waiting for reuse.
    pub fn idle(&self) -> usize {
        self.shared.idle.len()
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("max_idle", &self.shared.max_idle)
            .finish_non_exhaustive()
    }
}

/// RAII guard over a borrowed object; returns it to the pool on drop.
pub struct Pooled<T: Reset> {
    // `None` only while dropping.
    value: Option<T>,
    shared: Arc<Shared<T>>,
}

impl<T: Reset> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("pooled value present until drop")
    }
}

impl<T: Reset> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("pooled value present until drop")
    }
}

impl<T: Reset> Drop for Pooled<T> {
    fn drop(&mut self) {
        let Some(mut value) = self.value.take() else {
            return;
        };
        value.reset();
        if self.shared.max_idle > 0 {
            // A full queue hands the object back; it is dropped here.
            let _ = self.shared.idle.push(value);
        }
    }
}

impl<T: Reset + fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Scratch {
        items: Vec<String>,
        resets: usize,
    }

    impl Reset for Scratch {
        fn reset(&mut self) {
            self.items.clear();
            self.resets += 1;
        }
    }

    #[test]
    fn returned_object_is_reset_before_reuse() {
        let pool = Pool::new(4, Scratch::default);

        {
            let mut scratch = pool.get();
            scratch.items.push("secret".to_string());
        }
        assert_eq!(pool.idle(), 1);

        let scratch = pool.get();
        assert!(scratch.items.is_empty());
        assert_eq!(scratch.resets, 1, "the same object came back");
    }

    #[test]
    fn idle_list_is_bounded() {
        let pool = Pool::new(1, Scratch::default);
        let a = pool.get();
        let b = pool.get();
        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn zero_max_idle_keeps_nothing() {
        let pool = Pool::new(0, Scratch::default);
        drop(pool.get());
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn concurrent_returns_stay_within_bound() {
        let pool = Pool::new(4, Scratch::default);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let mut scratch = pool.get();
                        scratch.items.push("x".to_string());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(pool.idle() <= 4);
        assert!(pool.get().items.is_empty());
    }

    #[test]
    fn clones_share_one_free_list() {
        let pool = Pool::new(4, Scratch::default);
        let other = pool.clone();
        drop(other.get());
        assert_eq!(pool.idle(), 1);
    }
}
