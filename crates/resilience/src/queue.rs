//! Priority admission queue
//!
//! Caps the number of in-flight requests. Pending tasks are kept sorted by
//! priority (high first) and, within a priority, by enqueue order; insertion
//! is an ordered insert so the invariant holds at every instant.
//!
//! Dispatch is eager: `enqueue` admits the task immediately when a slot is
//! free, so `active_count`/`pending_count` are accurate as soon as it
//! returns. When a task settles and others are waiting, the next dispatch is
//! paced by `min(base * (1 + pending * 0.1), 200ms)` to smooth bursts. While
//! a paced dispatch is scheduled, new arrivals only join the queue; they
//! don't take the freed slot ahead of the timer.
//!
//! The queue never inspects or retries task results. A task dropped by
//! `clear()` resolves its caller with a cancellation error. A task whose
//! caller dropped the result future is abandoned: it is never started if
//! still waiting, and is dropped mid-flight if running.

use std::collections::VecDeque;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Deserialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::error::ApiError;
use crate::metrics;

pub const DEFAULT_MAX_CONCURRENT: usize = 4;
pub const DEFAULT_PACING_BASE: Duration = Duration::from_millis(50);
pub const MAX_PACING: Duration = Duration::from_millis(200);

/// Dispatch priority. Higher runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
}

impl Priority {
    pub fn label(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// Delay before the next dispatch when `queue_len` tasks are still waiting.
pub fn pacing_delay(base: Duration, queue_len: usize) -> Duration {
    let micros = base.as_micros().saturating_mul(10 + queue_len as u128) / 10;
    Duration::from_micros(u64::try_from(micros).unwrap_or(u64::MAX)).min(MAX_PACING)
}

struct Pending {
    priority: Priority,
    enqueued_at: Instant,
    job: BoxFuture<'static, ()>,
}

#[derive(Default)]
struct State {
    pending: VecDeque<Pending>,
    active: usize,
    /// Paced dispatches scheduled but not yet run.
    paced: usize,
}

impl State {
    /// Insert before the first task of strictly lower priority.
    fn insert(&mut self, task: Pending) {
        let index = self
            .pending
            .iter()
            .position(|p| p.priority < task.priority)
            .unwrap_or(self.pending.len());
        self.pending.insert(index, task);
    }
}

struct Shared {
    state: Mutex<State>,
    max_concurrent: usize,
    pacing_base: Duration,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit pending tasks while slots are free.
    fn dispatch(self: &Arc<Self>) {
        let admitted: Vec<Pending> = {
            let mut state = self.lock();
            let mut admitted = Vec::new();
            while state.active < self.max_concurrent {
                let Some(task) = state.pending.pop_front() else {
                    break;
                };
                state.active += 1;
                admitted.push(task);
            }
            metrics::set_queue_gauges(state.pending.len(), state.active);
            admitted
        };

        for task in admitted {
            debug!(
                priority = task.priority.label(),
                waited_ms = task.enqueued_at.elapsed().as_millis() as u64,
                "dispatching queued task"
            );
            let slot = Slot(Arc::clone(self));
            tokio::spawn(async move {
                task.job.await;
                drop(slot);
            });
        }
    }
}

/// Releases an active slot when the task settles (or panics) and schedules
/// the next paced dispatch.
struct Slot(Arc<Shared>);

impl Drop for Slot {
    fn drop(&mut self) {
        let handle = tokio::runtime::Handle::try_current().ok();
        let waiting = {
            let mut state = self.0.lock();
            state.active = state.active.saturating_sub(1);
            metrics::set_queue_gauges(state.pending.len(), state.active);
            if handle.is_some() && !state.pending.is_empty() {
                state.paced += 1;
            }
            state.pending.len()
        };
        let Some(handle) = handle.filter(|_| waiting > 0) else {
            return;
        };
        let delay = pacing_delay(self.0.pacing_base, waiting);
        let shared = Arc::clone(&self.0);
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = shared.lock();
                state.paced = state.paced.saturating_sub(1);
            }
            shared.dispatch();
        });
    }
}

/// Concurrency-capped, priority-ordered scheduler.
///
/// Cloning is cheap and clones share the same queue. Must be used from
/// within a tokio runtime: admitted tasks are spawned.
#[derive(Clone)]
pub struct AdmissionQueue {
    shared: Arc<Shared>,
}

impl AdmissionQueue {
    pub fn new(max_concurrent: usize, pacing_base: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                max_concurrent: max_concurrent.max(1),
                pacing_base,
            }),
        }
    }

    /// Queue `task` and return a future resolving to its result.
    ///
    /// The task is admitted (or queued) before this returns; the returned
    /// future only waits for the outcome. If the task is removed by
    /// [`clear`](Self::clear) the future resolves to a cancellation error.
    /// Dropping the returned future cancels the task and frees its slot.
    pub fn enqueue<T, E, Fut>(
        &self,
        task: Fut,
        priority: Priority,
    ) -> impl Future<Output = Result<T, E>> + Send + use<T, E, Fut>
    where
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<ApiError> + Send + 'static,
    {
        let (mut tx, rx) = oneshot::channel();
        let job = async move {
            let outcome = tokio::select! {
                biased;
                () = tx.closed() => None,
                result = task => Some(result),
            };
            match outcome {
                Some(result) => {
                    let _ = tx.send(result);
                }
                None => debug!("caller went away, task abandoned"),
            }
        }
        .boxed();

        let paced = {
            let mut state = self.shared.lock();
            state.insert(Pending {
                priority,
                enqueued_at: Instant::now(),
                job,
            });
            debug!(
                priority = priority.label(),
                pending = state.pending.len(),
                active = state.active,
                "task enqueued"
            );
            state.paced > 0
        };
        // A scheduled paced dispatch owns the next free slot.
        if !paced {
            self.shared.dispatch();
        }

        async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(E::from(ApiError::cancelled())),
            }
        }
    }

    /// Tasks waiting for a slot.
    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Tasks currently running.
    pub fn active_count(&self) -> usize {
        self.shared.lock().active
    }

    /// Drop every pending task; their callers see a cancellation error.
    /// Running tasks are unaffected. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let dropped: Vec<Pending> = {
            let mut state = self.shared.lock();
            let dropped = state.pending.drain(..).collect();
            metrics::set_queue_gauges(0, state.active);
            dropped
        };
        let count = dropped.len();
        drop(dropped);
        if count > 0 {
            debug!(count, "cleared pending tasks");
        }
        count
    }
}

impl Default for AdmissionQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT, DEFAULT_PACING_BASE)
    }
}
