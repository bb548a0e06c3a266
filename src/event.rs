//! Generic event fan-out, used by the Gattlink client, the activity monitor
//! and the stack's composite emitter.
//!
//! `rips::stack::NetworkStack` fans packets out to listeners kept in
//! `Arc<Mutex<HashMap<.., Box<dyn Listener>>>>` maps that sockets register
//! into and never explicitly unregister from while alive. `EventEmitter`
//! generalizes that pattern for push-style events (as opposed to packet
//! listeners): subscribers are held as `Weak` references so a dropped
//! subscriber is silently pruned on the next emit, breaking sink/listener
//! reference cycles with a weak/observer handle rather than a manual
//! unsubscribe call.

use std::sync::{Mutex, Weak};

/// Anything that can receive events of type `E`.
pub trait Listener<E>: Send + Sync {
    fn on_event(&self, event: &E);
}

impl<E, F> Listener<E> for F
where
    F: Fn(&E) + Send + Sync,
{
    fn on_event(&self, event: &E) {
        self(event)
    }
}

/// A fan-out point for events of type `E`. Cloning an `EventEmitter` clones
/// the handle, not the subscriber list (subscribers are shared).
pub struct EventEmitter<E> {
    listeners: Mutex<Vec<Weak<dyn Listener<E>>>>,
}

impl<E> EventEmitter<E> {
    pub fn new() -> EventEmitter<E> {
        EventEmitter {
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Registers `listener`. The emitter only holds a weak reference, so the
    /// caller must keep the `Arc` alive for as long as it wants to keep
    /// receiving events.
    pub fn subscribe(&self, listener: std::sync::Weak<dyn Listener<E>>) {
        let mut listeners = self.listeners.lock().expect("event emitter lock poisoned");
        listeners.push(listener);
    }

    /// Delivers `event` to every live subscriber, in subscription order, and
    /// prunes subscribers whose `Arc` has since been dropped.
    pub fn emit(&self, event: E) {
        let mut listeners = self.listeners.lock().expect("event emitter lock poisoned");
        listeners.retain(|weak| {
            if let Some(listener) = weak.upgrade() {
                listener.on_event(&event);
                true
            } else {
                false
            }
        });
    }
}

impl<E> Default for EventEmitter<E> {
    fn default() -> Self {
        EventEmitter::new()
    }
}
