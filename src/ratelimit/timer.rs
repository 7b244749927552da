//! Coalescing backoff timer.
//!
//! A [`BackoffTimer`] holds a single deadline. Repeated calls to
//! [`BackoffTimer::backoff_until`] while the timer is active are merged according
//! to its [`MergePolicy`], and the elapsed listener runs exactly once per
//! activation, at the final deadline.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::clock::Clock;

/// Callback invoked when the timer elapses.
pub type ElapsedListener = Arc<dyn Fn() + Send + Sync>;

/// How a new deadline is merged with an active one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// A later deadline replaces the active one; earlier ones are ignored.
    KeepLatest,
    /// An earlier deadline replaces the active one; later ones are ignored.
    KeepEarliest,
}

impl MergePolicy {
    fn accepts(&self, new_deadline: u64, current: u64) -> bool {
        match self {
            MergePolicy::KeepLatest => new_deadline > current,
            MergePolicy::KeepEarliest => new_deadline < current,
        }
    }
}

#[derive(Debug, Default)]
struct TimerState {
    active: bool,
    deadline_ms: u64,
    /// Bumped on every re-arm and reset so stale wakeups can be ignored
    generation: u64,
    task: Option<JoinHandle<()>>,
}

struct TimerInner {
    policy: MergePolicy,
    clock: Arc<dyn Clock>,
    state: Mutex<TimerState>,
    listener: Mutex<Option<ElapsedListener>>,
}

/// Single coalesced deadline with an elapsed notification.
///
/// Cloning yields another handle to the same timer. Arming a future deadline
/// spawns a task on the current Tokio runtime.
#[derive(Clone)]
pub struct BackoffTimer {
    inner: Arc<TimerInner>,
}

impl std::fmt::Debug for BackoffTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("BackoffTimer")
            .field("policy", &self.inner.policy)
            .field("active", &state.active)
            .field("deadline_ms", &state.deadline_ms)
            .finish()
    }
}

impl BackoffTimer {
    pub fn new(policy: MergePolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                policy,
                clock,
                state: Mutex::new(TimerState::default()),
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn policy(&self) -> MergePolicy {
        self.inner.policy
    }

    /// Register the elapsed listener, replacing any previous one.
    pub fn on_elapsed<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.inner.listener.lock() = Some(Arc::new(listener));
    }

    /// `true` while no deadline is pending.
    pub fn is_elapsed(&self) -> bool {
        !self.inner.state.lock().active
    }

    /// Milliseconds until the active deadline, 0 when elapsed.
    pub fn retry_after_ms(&self) -> u64 {
        let state = self.inner.state.lock();
        if !state.active {
            return 0;
        }
        state.deadline_ms.saturating_sub(self.inner.clock.now_millis())
    }

    /// Time at which the current (or last) deadline passes.
    pub fn retry_after_date(&self) -> DateTime<Utc> {
        let deadline = self.inner.state.lock().deadline_ms;
        let millis = i64::try_from(deadline).unwrap_or(i64::MAX);
        Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now)
    }

    /// Back off for `wait` from now.
    pub fn backoff(&self, wait: Duration) {
        let now = self.inner.clock.now_millis();
        self.backoff_until(now.saturating_add(wait.as_millis() as u64));
    }

    /// Back off until the epoch timestamp `deadline_ms`.
    ///
    /// A deadline that has already passed fires the listener synchronously.
    pub fn backoff_until(&self, deadline_ms: u64) {
        let now = self.inner.clock.now_millis();

        let fire = {
            let mut state = self.inner.state.lock();

            if !state.active && deadline_ms <= now {
                true
            } else if !state.active || self.inner.policy.accepts(deadline_ms, state.deadline_ms) {
                state.active = true;
                state.deadline_ms = deadline_ms;
                state.generation += 1;
                if let Some(task) = state.task.take() {
                    task.abort();
                }

                let wait = deadline_ms.saturating_sub(now);
                if wait >= 1 {
                    trace!(wait_ms = wait, policy = ?self.inner.policy, "Arming backoff timer");
                    state.task = self.spawn_wakeup(state.generation, wait);
                    false
                } else {
                    state.active = false;
                    true
                }
            } else {
                false
            }
        };

        if fire {
            self.inner.notify();
        }
    }

    /// Deactivate without firing.
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        state.active = false;
        state.generation += 1;
        if let Some(task) = state.task.take() {
            task.abort();
        }
    }

    fn spawn_wakeup(&self, generation: u64, wait_ms: u64) -> Option<JoinHandle<()>> {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(wait_ms, "No Tokio runtime available; backoff timer will not fire");
                return None;
            }
        };

        let wake_at = Instant::now() + Duration::from_millis(wait_ms);
        let weak: Weak<TimerInner> = Arc::downgrade(&self.inner);
        Some(handle.spawn(async move {
            tokio::time::sleep_until(wake_at).await;
            if let Some(inner) = weak.upgrade() {
                inner.elapse(generation);
            }
        }))
    }
}

impl TimerInner {
    fn elapse(&self, generation: u64) {
        {
            let mut state = self.state.lock();
            if !state.active || state.generation != generation {
                return;
            }
            state.active = false;
            state.task = None;
        }
        self.notify();
    }

    fn notify(&self) {
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            listener();
        }
    }
}

impl Drop for TimerInner {
    fn drop(&mut self) {
        if let Some(task) = self.state.get_mut().task.take() {
            task.abort();
        }
    }
}
