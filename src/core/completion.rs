//! Completion handles: one notification primitive for both callback and
//! future consumers.
//!
//! Hardware delivers frames through callbacks, while callers of `all_ready()`
//! or `shutdown_all()` want something they can await. A `Completion` is
//! fulfilled once through its `Completer` and can then be observed by
//! registering a callback (`on_complete`), by polling it as a `Future`, or by
//! blocking on it (`wait`).
//!
//! Callbacks and wakers always run after the internal lock is released, on the
//! thread that settles the completion (or inline, if already settled).

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use crate::error::Abandoned;

type Listener<T> = Box<dyn FnOnce(Result<T, Abandoned>) + Send + 'static>;

struct State<T> {
    outcome: Option<Result<T, Abandoned>>,
    wakers: Vec<Waker>,
    listeners: Vec<Listener<T>>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
}

impl<T: Clone + Send + 'static> Inner<T> {
    fn new(outcome: Option<Result<T, Abandoned>>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                outcome,
                wakers: Vec::new(),
                listeners: Vec::new(),
            }),
        })
    }

    fn settle(&self, outcome: Result<T, Abandoned>) {
        let (wakers, listeners) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.outcome.is_some() {
                return;
            }
            state.outcome = Some(outcome.clone());
            (
                std::mem::take(&mut state.wakers),
                std::mem::take(&mut state.listeners),
            )
        };

        for waker in wakers {
            waker.wake();
        }
        for listener in listeners {
            listener(outcome.clone());
        }
    }
}

/// Write side of a completion. Dropping it unfulfilled abandons the completion.
pub struct Completer<T: Clone + Send + 'static> {
    inner: Option<Arc<Inner<T>>>,
}

/// Read side of a completion. Cheap to clone; all clones see the same outcome.
pub struct Completion<T> {
    inner: Arc<Inner<T>>,
}

/// Create a connected completer/completion pair.
pub fn pair<T: Clone + Send + 'static>() -> (Completer<T>, Completion<T>) {
    let inner = Inner::new(None);
    (
        Completer {
            inner: Some(Arc::clone(&inner)),
        },
        Completion { inner },
    )
}

impl<T: Clone + Send + 'static> Completer<T> {
    /// Fulfil the completion. Registered callbacks run on this thread.
    pub fn complete(mut self, value: T) {
        if let Some(inner) = self.inner.take() {
            inner.settle(Ok(value));
        }
    }
}

impl<T: Clone + Send + 'static> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.settle(Err(Abandoned));
        }
    }
}

impl<T: Clone + Send + 'static> std::fmt::Debug for Completer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completer").finish_non_exhaustive()
    }
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("complete", &self.is_complete())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Completion<T> {
    /// Already-fulfilled completion
    pub fn ready(value: T) -> Self {
        Self {
            inner: Inner::new(Some(Ok(value))),
        }
    }

    /// Run `f` once the completion settles. Runs inline if it already has.
    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(Result<T, Abandoned>) + Send + 'static,
    {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(outcome) = state.outcome.clone() {
            drop(state);
            f(outcome);
            return;
        }
        state.listeners.push(Box::new(f));
    }

    pub fn is_complete(&self) -> bool {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .outcome
            .is_some()
    }

    /// Outcome if settled, without waiting
    pub fn try_get(&self) -> Option<Result<T, Abandoned>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .outcome
            .clone()
    }

    /// Block the calling thread until settled.
    pub fn wait(&self) -> Result<T, Abandoned> {
        futures::executor::block_on(self.clone())
    }

    /// True if both handles observe the same completion
    pub fn same_as(&self, other: &Completion<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Completion resolving with every value, in input order, once all inputs
    /// resolve. Abandoned as soon as any input is abandoned.
    pub fn all(parts: impl IntoIterator<Item = Completion<T>>) -> Completion<Vec<T>> {
        let parts: Vec<Completion<T>> = parts.into_iter().collect();
        if parts.is_empty() {
            return Completion::ready(Vec::new());
        }

        let (completer, combined) = pair::<Vec<T>>();
        let gather = Arc::new(Mutex::new(Gather {
            values: vec![None; parts.len()],
            remaining: parts.len(),
            completer: Some(completer),
        }));

        for (idx, part) in parts.iter().enumerate() {
            let gather = Arc::clone(&gather);
            part.on_complete(move |outcome| {
                // Settle outside the gather lock: listeners may re-enter
                let step = {
                    let mut g = gather.lock().unwrap_or_else(|e| e.into_inner());
                    g.record(idx, outcome)
                };
                match step {
                    GatherStep::Complete(completer, values) => completer.complete(values),
                    GatherStep::Abandon(completer) => drop(completer),
                    GatherStep::Pending => {}
                }
            });
        }

        combined
    }
}

impl<T: Clone + Send + 'static> Future for Completion<T> {
    type Output = Result<T, Abandoned>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(outcome) = &state.outcome {
            return Poll::Ready(outcome.clone());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

struct Gather<T: Clone + Send + 'static> {
    values: Vec<Option<T>>,
    remaining: usize,
    completer: Option<Completer<Vec<T>>>,
}

enum GatherStep<T: Clone + Send + 'static> {
    Complete(Completer<Vec<T>>, Vec<T>),
    Abandon(Completer<Vec<T>>),
    Pending,
}

impl<T: Clone + Send + 'static> Gather<T> {
    fn record(&mut self, idx: usize, outcome: Result<T, Abandoned>) -> GatherStep<T> {
        match outcome {
            Ok(value) => {
                if self.values[idx].is_none() {
                    self.values[idx] = Some(value);
                    self.remaining -= 1;
                }
                if self.remaining > 0 {
                    return GatherStep::Pending;
                }
                match self.completer.take() {
                    Some(completer) => {
                        let values = self.values.iter_mut().filter_map(Option::take).collect();
                        GatherStep::Complete(completer, values)
                    }
                    None => GatherStep::Pending,
                }
            }
            Err(Abandoned) => match self.completer.take() {
                Some(completer) => GatherStep::Abandon(completer),
                None => GatherStep::Pending,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_callback_and_future_see_same_value() {
        let (completer, completion) = pair::<i32>();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        completion.on_complete(move |v| {
            assert_eq!(v, Ok(3));
            s.fetch_add(1, Ordering::SeqCst);
        });

        assert!(completion.clone().now_or_never().is_none());
        completer.complete(3);

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(completion.clone().now_or_never(), Some(Ok(3)));
        assert_eq!(completion.try_get(), Some(Ok(3)));
    }

    #[test]
    fn test_listener_after_settle_runs_inline() {
        let completion = Completion::ready("done");
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        completion.on_complete(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_completer_abandons() {
        let (completer, completion) = pair::<u8>();
        drop(completer);
        assert_eq!(completion.wait(), Err(Abandoned));
    }

    #[test]
    fn test_wait_across_threads() {
        let (completer, completion) = pair::<u64>();
        let handle = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(10));
            completer.complete(99);
        });
        assert_eq!(completion.wait(), Ok(99));
        handle.join().unwrap();
    }

    #[test]
    fn test_all_preserves_input_order() {
        let (c1, f1) = pair::<i32>();
        let (c2, f2) = pair::<i32>();
        let (c3, f3) = pair::<i32>();
        let all = Completion::all([f1, f2, f3]);

        c3.complete(30);
        c1.complete(10);
        assert!(!all.is_complete());
        c2.complete(20);

        assert_eq!(all.try_get(), Some(Ok(vec![10, 20, 30])));
    }

    #[test]
    fn test_all_abandons_on_any_abandon() {
        let (c1, f1) = pair::<i32>();
        let (c2, f2) = pair::<i32>();
        let all = Completion::all([f1, f2]);
        c1.complete(1);
        drop(c2);
        assert_eq!(all.try_get(), Some(Err(Abandoned)));
    }

    #[test]
    fn test_all_empty_is_ready() {
        let all = Completion::<i32>::all(Vec::new());
        assert_eq!(all.try_get(), Some(Ok(Vec::new())));
    }
}
