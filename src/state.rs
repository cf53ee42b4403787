//! The single source of truth for gateway state and its observers.
//!
//! `StateHub` is created once at startup and shared by `Arc`. The supervisor
//! is its only writer; the UI reads the current state on demand and receives
//! every later transition through a `Subscription`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::process::GatewayState;

/// Holds the current `GatewayState` and pushes transitions to subscribers.
#[derive(Debug, Default)]
pub struct StateHub {
    inner: Mutex<HubInner>,
    next_id: AtomicU64,
}

#[derive(Debug, Default)]
struct HubInner {
    current: Option<GatewayState>,
    subscribers: Vec<(u64, mpsc::UnboundedSender<GatewayState>)>,
    attempt: u64,
    closed: bool,
}

impl StateHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The latest state, for observers that attach after it was broadcast.
    pub fn current(&self) -> Option<GatewayState> {
        self.lock().current.clone()
    }

    /// Registers for every transition applied from now on.
    ///
    /// Once the hub is closed the subscription yields `None`.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        if !inner.closed {
            inner.subscribers.push((id, tx));
        }
        Subscription {
            id,
            hub: Arc::downgrade(self),
            rx,
        }
    }

    /// Runs `callback` on a background task for each transition.
    ///
    /// The callback stops when the returned handle is dropped or
    /// `unsubscribe` is called.
    pub fn on_state_change<F>(self: &Arc<Self>, callback: F) -> Unsubscribe
    where
        F: Fn(&GatewayState) + Send + 'static,
    {
        let mut subscription = self.subscribe();
        let task = tokio::spawn(async move {
            while let Some(state) = subscription.recv().await {
                callback(&state);
            }
        });
        Unsubscribe { task }
    }

    /// Applies `next` and notifies subscribers, all under one lock.
    ///
    /// Returns `false` without broadcasting when the hub is closed or when
    /// `next` may not follow the current state.
    pub fn transition(&self, next: GatewayState) -> bool {
        let mut inner = self.lock();
        Self::apply(&mut inner, next)
    }

    /// Like `transition`, but only while `attempt` is still the current
    /// launch attempt.
    ///
    /// A probe that outlives its attempt cannot touch the next one.
    pub fn transition_for(&self, attempt: u64, next: GatewayState) -> bool {
        let mut inner = self.lock();
        if inner.attempt != attempt {
            debug!(
                attempt,
                current = inner.attempt,
                state = next.kind(),
                "dropping transition from a superseded attempt"
            );
            return false;
        }
        Self::apply(&mut inner, next)
    }

    /// Id of the launch attempt transitions currently apply to.
    pub fn attempt(&self) -> u64 {
        self.lock().attempt
    }

    fn apply(inner: &mut HubInner, next: GatewayState) -> bool {
        if inner.closed {
            debug!(state = next.kind(), "hub closed, dropping transition");
            return false;
        }
        if !GatewayState::can_transition_to(inner.current.as_ref(), &next) {
            warn!(
                from = inner.current.as_ref().map(GatewayState::kind),
                to = next.kind(),
                "rejected gateway state transition"
            );
            return false;
        }
        info!(state = next.kind(), port = next.port(), "gateway state changed");
        inner.current = Some(next.clone());
        inner.subscribers.retain(|(id, tx)| {
            let delivered = tx.send(next.clone()).is_ok();
            if !delivered {
                debug!(subscriber = id, "dropping closed subscriber");
            }
            delivered
        });
        true
    }

    /// Begins a new launch attempt: clears the current state so it can start
    /// again at `starting`, and returns the attempt's id.
    ///
    /// Has no effect once the hub is closed.
    pub fn reset(&self) -> u64 {
        let mut inner = self.lock();
        if !inner.closed {
            inner.current = None;
            inner.attempt += 1;
        }
        inner.attempt
    }

    /// Stops all further transitions and releases every subscriber.
    ///
    /// The last state stays readable through `current`.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn remove(&self, id: u64) {
        self.lock().subscribers.retain(|(sub, _)| *sub != id);
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A stream of state transitions. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    hub: Weak<StateHub>,
    rx: mpsc::UnboundedReceiver<GatewayState>,
}

impl Subscription {
    /// Waits for the next transition; `None` once the hub is closed.
    pub async fn recv(&mut self) -> Option<GatewayState> {
        self.rx.recv().await
    }

    /// Returns a transition that has already arrived, if any.
    pub fn try_recv(&mut self) -> Option<GatewayState> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(self.id);
        }
    }
}

/// Handle returned by [`StateHub::on_state_change`].
#[must_use = "dropping the handle unsubscribes the callback"]
#[derive(Debug)]
pub struct Unsubscribe {
    task: JoinHandle<()>,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {}
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.task.abort();
    }
}
