//! The provider: a per-request queue bridging a model callback (producer)
//! and a response writer (consumer).
//!
//! Lifecycle: a provider starts *open*; the producer moves it to *ended*
//! via [`Provider::end`], the consumer to *disconnected* via
//! [`Provider::disconnect`].  Both terminal states refuse further writes,
//! but reads keep draining queued events until the queue is empty.  A
//! provider that sees no write for longer than its timeout ends itself;
//! the check runs at every state-observing operation and before every
//! write.
//!
//! One producer and one consumer per provider.  Share it as
//! `Arc<Provider>` – all methods take `&self`.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::event::OutputEvent;

/// Default inactivity timeout: 60 s without a successful push ends the
/// provider.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Open,
    /// Producer finished (or the inactivity timeout fired).
    Ended,
    /// Consumer went away; the producer should observe failed pushes and
    /// abandon its work.
    Disconnected,
}

#[derive(Debug)]
struct Inner {
    queue: VecDeque<OutputEvent>,
    state: Lifecycle,
    last_activity: Instant,
    timeout: Duration,
}

impl Inner {
    /// Auto-end on inactivity.  Must hold the lock.
    fn check_timeout(&mut self) {
        if self.state == Lifecycle::Open && self.last_activity.elapsed() > self.timeout {
            self.state = Lifecycle::Ended;
        }
    }

    fn timed_out(&self) -> bool {
        self.last_activity.elapsed() > self.timeout
    }
}

/// Thread-safe event queue with timeout-driven liveness.
#[derive(Debug)]
pub struct Provider {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Default for Provider {
    fn default() -> Self {
        Self::new()
    }
}

impl Provider {
    /// A provider with the default 60 s inactivity timeout.
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                state: Lifecycle::Open,
                last_activity: Instant::now(),
                timeout,
            }),
            notify: Notify::new(),
        }
    }

    /// Append an event.  Returns `false` (and drops the event) once the
    /// provider is ended, disconnected, or timed out.  A successful push
    /// refreshes the inactivity timer and wakes one waiting reader.
    pub fn push(&self, event: OutputEvent) -> bool {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.check_timeout();
            if inner.state != Lifecycle::Open {
                return false;
            }
            inner.queue.push_back(event);
            inner.last_activity = Instant::now();
        }
        self.notify.notify_one();
        true
    }

    /// Producer-side completion.  Idempotent; wakes all waiters.
    pub fn end(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            // end() after disconnect() must not resurrect the provider.
            if inner.state == Lifecycle::Open {
                inner.state = Lifecycle::Ended;
            }
        }
        self.notify.notify_waiters();
    }

    /// Consumer-side abandonment (client connection closed).  Idempotent;
    /// wakes all waiters.  Subsequent pushes return `false`.
    pub fn disconnect(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = Lifecycle::Disconnected;
        }
        self.notify.notify_waiters();
    }

    /// Non-blocking read.  Queued events drain first; once empty, `None`.
    pub fn pop(&self) -> Option<OutputEvent> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_timeout();
        inner.queue.pop_front()
    }

    /// Block until an event is available or the provider leaves the open
    /// state.  `None` means the stream is over (or timed out) with nothing
    /// queued.
    pub async fn wait_pop(&self) -> Option<OutputEvent> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before inspecting state, so a push/end that
            // lands between the check and the await cannot be missed.
            notified.as_mut().enable();

            let poll_interval = {
                let mut inner = self.inner.lock().unwrap();
                inner.check_timeout();
                if let Some(ev) = inner.queue.pop_front() {
                    return Some(ev);
                }
                if inner.state != Lifecycle::Open {
                    return None;
                }
                // Bound the sleep to the rest of the inactivity window so the
                // auto-end is noticed even with no writer left to signal us.
                inner
                    .timeout
                    .saturating_sub(inner.last_activity.elapsed())
                    .max(Duration::from_millis(10))
            };

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    /// [`Self::wait_pop`] with a wall-clock bound: returns `None` no later
    /// than `wait` from now even if the provider stays open and silent.
    pub async fn wait_pop_for(&self, wait: Duration) -> Option<OutputEvent> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().unwrap();
                inner.check_timeout();
                if let Some(ev) = inner.queue.pop_front() {
                    return Some(ev);
                }
                if inner.state != Lifecycle::Open {
                    return None;
                }
            }

            let remaining = deadline.checked_duration_since(Instant::now())?;
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(remaining) => return None,
            }
        }
    }

    /// `true` while pushes would be accepted.
    pub fn is_writable(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.state == Lifecycle::Open && !inner.timed_out()
    }

    /// `true` while the stream is open and within its inactivity window.
    pub fn is_alive(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.state == Lifecycle::Open && !inner.timed_out()
    }

    /// `true` once the provider has left the open state *and* the queue is
    /// drained – the consumer has seen everything there is to see.
    pub fn is_ended(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.check_timeout();
        inner.state != Lifecycle::Open && inner.queue.is_empty()
    }

    /// Refresh the inactivity timer without queueing anything.  Used by the
    /// streaming layer to keep slow-but-live streams from self-ending.
    pub fn reset_timeout(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_activity = Instant::now();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().queue.is_empty()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
