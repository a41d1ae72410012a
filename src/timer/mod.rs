//! Scheduled callbacks persisted in the external KV store.
//!
//! Each owned partition carries a logical span `[start, stop]` bounding the
//! alarm times of its persisted timers. Inserts expand the span; a scan
//! pass walks it second by second, fires due callbacks, and shrinks the
//! span behind itself.

pub mod span;
pub mod store;

use std::sync::{Arc, Mutex};

use thiserror::Error;

pub use span::Span;
pub use store::{Scan, TimerStore};

use crate::daemon::metrics::Metrics;
use crate::error::Transience;
use crate::kv::KvError;

/// A scheduled callback, keyed by `(partition, alarm_time, reference)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerEvent {
    pub partition: u16,
    /// Unix seconds, floored to whole seconds at creation.
    pub alarm_time: u64,
    pub reference: String,
    pub callback: String,
    /// Bounded JSON context handed back to the callback.
    pub context: String,
    /// Sequence number of the mutation that created the timer.
    pub origin_seq: u64,
}

#[derive(Debug, Error)]
pub enum TimerError {
    #[error("timer context is {got} bytes; the configured limit is {max}")]
    ContextTooLarge { got: usize, max: usize },
    #[error("timer `{reference}` already exists at {alarm_time}")]
    Collision { reference: String, alarm_time: u64 },
    #[error("malformed timer document `{key}`: {reason}")]
    MalformedDoc { key: String, reason: String },
    #[error(transparent)]
    Kv(#[from] KvError),
}

impl TimerError {
    pub fn transience(&self) -> Transience {
        match self {
            TimerError::Kv(err) if err.is_retriable() => Transience::Retryable,
            _ => Transience::Permanent,
        }
    }
}

/// Shared handle to a worker's timer store, given to the engine's host
/// globals. The store stays effectively single-threaded: only the owning
/// worker thread and host calls made from inside its own invocations take
/// the lock.
#[derive(Clone)]
pub struct TimerHandle {
    store: Arc<Mutex<TimerStore>>,
    metrics: Arc<Metrics>,
}

impl TimerHandle {
    pub fn new(store: Arc<Mutex<TimerStore>>, metrics: Arc<Metrics>) -> Self {
        Self { store, metrics }
    }

    pub fn store(&self) -> Arc<Mutex<TimerStore>> {
        Arc::clone(&self.store)
    }

    /// Create a timer. Collisions are logged and swallowed; real failures
    /// count as `timer_create_failure` and surface to the caller.
    pub fn set(&self, event: TimerEvent) -> Result<(), TimerError> {
        let result = {
            let mut store = self.store.lock().expect("timer store lock poisoned");
            store.set_timer(&event)
        };
        match result {
            Ok(()) => {
                self.metrics.bump(&self.metrics.timer_create_counter);
                Ok(())
            }
            Err(TimerError::Collision {
                reference,
                alarm_time,
            }) => {
                tracing::warn!(
                    partition = event.partition,
                    reference,
                    alarm_time,
                    "timer already exists; keeping the original"
                );
                Ok(())
            }
            Err(TimerError::ContextTooLarge { got, max }) => {
                self.metrics
                    .bump(&self.metrics.timer_context_size_exceeded_counter);
                Err(TimerError::ContextTooLarge { got, max })
            }
            Err(err) => {
                if let TimerError::Kv(kv_err) = &err {
                    if kv_err.is_retriable() {
                        self.metrics.bump(&self.metrics.lcb_retry_failure);
                    }
                }
                self.metrics.bump(&self.metrics.timer_create_failure);
                tracing::error!(partition = event.partition, %err, "timer creation failed");
                Err(err)
            }
        }
    }

    /// Cancel a timer by key; unknown keys are a no-op.
    pub fn cancel(
        &self,
        partition: u16,
        alarm_time: u64,
        reference: &str,
    ) -> Result<(), TimerError> {
        let mut store = self.store.lock().expect("timer store lock poisoned");
        store.delete_timer(partition, alarm_time, reference)
    }
}
