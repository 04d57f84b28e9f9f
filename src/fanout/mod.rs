//! Update fan-out bus decoupling source adapters from consumers.
//!
//! Producers publish an `UpdateEvent` after every successful store merge;
//! every subscriber registered for that update kind is invoked. A panicking
//! subscriber is isolated: the panic is caught and logged, the remaining
//! subscribers still run, and nothing propagates back into the producer's
//! write path.

use crate::utils::types::{UpdateEvent, UpdateKind};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::RwLock;

pub type UpdateCallback = Box<dyn Fn(&UpdateEvent) + Send + Sync>;

struct Subscriber {
    kinds: Vec<UpdateKind>,
    callback: UpdateCallback,
}

/// Registry of update subscribers keyed by update category.
#[derive(Default)]
pub struct UpdateBus {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl UpdateBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for the given update kinds.
    pub fn subscribe<F>(&self, kinds: &[UpdateKind], callback: F)
    where
        F: Fn(&UpdateEvent) + Send + Sync + 'static,
    {
        let mut subs = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subs.push(Subscriber { kinds: kinds.to_vec(), callback: Box::new(callback) });
    }

    /// Deliver an event to every subscriber registered for its kind.
    pub fn publish(&self, event: &UpdateEvent) {
        let subs = self
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for sub in subs.iter().filter(|s| s.kinds.contains(&event.kind)) {
            if catch_unwind(AssertUnwindSafe(|| (sub.callback)(event))).is_err() {
                log::error!(
                    "update subscriber panicked on {:?} event for {}",
                    event.kind,
                    event.symbol
                );
            }
        }
    }

}
