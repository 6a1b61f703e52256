//! Single-slot value/error channel with per-observer execution contexts.
//!
//! Architecture:
//! - One slot holds the most recent `Result<T, E>` plus a version counter
//! - Each registered observer is wrapped in an adapter bound to its executor
//! - Publishing bumps the version and asks every adapter to schedule a drain
//!
//! Delivery is "latest wins": a drain reads the slot when it runs, so values
//! published in quick succession may collapse into one delivery. Each adapter
//! has at most one drain in flight, which keeps its deliveries in publish order
//! and never repeats a version.
//!
//! Removal and replacement flip the adapter's `active` flag. The flag is checked
//! before a drain claims a version, so a drain already queued on the observer's executor
//! becomes a no-op without the channel and that executor sharing a lock.
//! Observers are invoked with no channel lock held and may publish back into
//! the channel.

use futures::future::{self, Ready};
use log::trace;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::entities::Executor;
use crate::error::ObservableError;

/// Receives values and errors from a `BroadcastState`.
pub trait Observer<T, E>: Send + Sync {
    fn on_new_data(&self, value: T);
    fn on_error(&self, error: E);
}

/// Versioned current value of the channel
struct Slot<T, E> {
    version: u64,
    result: Option<Result<T, E>>,
}

type SharedSlot<T, E> = Arc<Mutex<Slot<T, E>>>;

/// Identity of an observer: address of its Arc allocation
type ObserverKey = usize;

fn observer_key<T, E>(observer: &Arc<dyn Observer<T, E>>) -> ObserverKey {
    Arc::as_ptr(observer) as *const () as usize
}

#[derive(Default)]
struct DispatchState {
    scheduled: bool,
    delivered: u64,
}

struct ObserverAdapter<T, E> {
    active: AtomicBool,
    observer: Arc<dyn Observer<T, E>>,
    executor: Arc<dyn Executor>,
    slot: SharedSlot<T, E>,
    dispatch: Mutex<DispatchState>,
}

impl<T, E> ObserverAdapter<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn disable(&self) {
        self.active.store(false, Ordering::Release);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Schedule a drain on the observer's executor unless one is pending.
    fn notify(self: &Arc<Self>) {
        {
            let mut dispatch = self.dispatch.lock().unwrap_or_else(|e| e.into_inner());
            if dispatch.scheduled {
                return;
            }
            dispatch.scheduled = true;
        }
        let this = Arc::clone(self);
        self.executor.execute(Box::new(move || this.drain()));
    }

    /// Disable and return the last version this adapter claimed.
    ///
    /// Taken under the dispatch lock, so a drain either claimed its version
    /// before (and still delivers it) or sees the adapter disabled.
    fn retire(&self) -> u64 {
        let dispatch = self.dispatch.lock().unwrap_or_else(|e| e.into_inner());
        self.disable();
        dispatch.delivered
    }

    fn drain(&self) {
        loop {
            // Slot is read under the dispatch lock so a concurrent notify()
            // either sees `scheduled` or lands after we cleared it.
            let result = {
                let mut dispatch = self.dispatch.lock().unwrap_or_else(|e| e.into_inner());
                if !self.is_active() {
                    trace!("Observer disabled, dropping delivery");
                    dispatch.scheduled = false;
                    return;
                }
                let (version, result) = {
                    let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
                    (slot.version, slot.result.clone())
                };
                match result {
                    Some(result) if version > dispatch.delivered => {
                        dispatch.delivered = version;
                        result
                    }
                    _ => {
                        dispatch.scheduled = false;
                        return;
                    }
                }
            };

            match result {
                Ok(value) => self.observer.on_new_data(value),
                Err(error) => self.observer.on_error(error),
            }
        }
    }
}

/// Process-wide single-value-with-error broadcast channel.
pub struct BroadcastState<T, E> {
    slot: SharedSlot<T, E>,
    observers: Mutex<HashMap<ObserverKey, Arc<ObserverAdapter<T, E>>>>,
}

impl<T, E> Default for BroadcastState<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> std::fmt::Debug for BroadcastState<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastState")
            .field("version", &self.slot.lock().map(|s| s.version).unwrap_or(0))
            .field("observers", &self.observers.lock().map(|o| o.len()).unwrap_or(0))
            .finish()
    }
}

impl<T, E> BroadcastState<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot {
                version: 0,
                result: None,
            })),
            observers: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the current state with a value.
    pub fn publish_value(&self, value: T) {
        self.publish(Ok(value));
    }

    /// Replace the current state with an error.
    pub fn publish_error(&self, error: E) {
        self.publish(Err(error));
    }

    fn publish(&self, result: Result<T, E>) {
        {
            let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
            slot.version += 1;
            slot.result = Some(result);
        }
        for adapter in self.adapters() {
            adapter.notify();
        }
    }

    /// Current value, or the current error, or `NotYetInitialized`.
    pub fn fetch_current(&self) -> Ready<Result<T, ObservableError<E>>> {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        future::ready(match &slot.result {
            None => Err(ObservableError::NotYetInitialized),
            Some(Ok(value)) => Ok(value.clone()),
            Some(Err(error)) => Err(ObservableError::Published(error.clone())),
        })
    }

    /// Deliver every change to `observer` on `executor`.
    ///
    /// Registering the same observer again disables the previous registration
    /// before the new one becomes active. The current state, if any, is
    /// delivered to the new registration unless the previous one already
    /// delivered it.
    pub fn add_observer(&self, executor: Arc<dyn Executor>, observer: Arc<dyn Observer<T, E>>) {
        let key = observer_key(&observer);

        let adapter = {
            let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
            // A replacement resumes after whatever the old registration delivered
            let delivered = observers.get(&key).map_or(0, |old| old.retire());
            let adapter = Arc::new(ObserverAdapter {
                active: AtomicBool::new(true),
                observer,
                executor,
                slot: Arc::clone(&self.slot),
                dispatch: Mutex::new(DispatchState {
                    scheduled: false,
                    delivered,
                }),
            });
            observers.insert(key, Arc::clone(&adapter));
            adapter
        };

        adapter.notify();
    }

    /// Stop delivering to `observer`. A delivery already running may still finish.
    pub fn remove_observer(&self, observer: &Arc<dyn Observer<T, E>>) {
        let removed = self
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&observer_key(observer));
        if let Some(adapter) = removed {
            adapter.disable();
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn adapters(&self) -> Vec<Arc<ObserverAdapter<T, E>>> {
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}
