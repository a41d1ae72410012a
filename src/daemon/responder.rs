//! Response aggregation on the main stream.
//!
//! Control opcodes stage a single pending response and mark it urgent;
//! workers tick `messages_processed_counter` as they dispatch. After each
//! batch of routed frames the control thread flushes when the counter
//! reaches `batch_size` or the priority flag is up — priority wins when
//! both trigger in the same tick, which only means the flush happens now
//! rather than at the boundary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::daemon::metrics::Metrics;
use crate::daemon::transport::RetryWriter;
use crate::daemon::worker::WorkerHandle;
use crate::proto::{self, response, Response};

pub struct Responder {
    pending: Mutex<Option<Response>>,
    priority: AtomicBool,
    batch_size: usize,
    metrics: Arc<Metrics>,
}

impl Responder {
    pub fn new(batch_size: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            pending: Mutex::new(None),
            priority: AtomicBool::new(false),
            batch_size: batch_size.max(1),
            metrics,
        }
    }

    /// Stage an ad-hoc response. A later one replaces an unflushed earlier
    /// one; control traffic is serialized on the control thread so this
    /// only happens when the controller overlaps requests.
    pub fn stage(&self, response: Response) {
        let mut pending = self.pending.lock().expect("responder lock poisoned");
        if pending.is_some() {
            tracing::debug!("overwriting unflushed response");
        }
        *pending = Some(response);
    }

    pub fn mark_priority(&self) {
        self.priority.store(true, Ordering::Release);
    }

    pub fn should_flush(&self) -> bool {
        self.priority.load(Ordering::Acquire)
            || self.metrics.get(&self.metrics.messages_processed_counter) >= self.batch_size as u64
    }

    /// Emit the pending response (if any) plus a queue-depth snapshot, then
    /// reset the batch counter and the priority flag.
    pub fn flush(&self, writer: &mut RetryWriter, workers: &[Arc<WorkerHandle>]) {
        if let Some(response) = self
            .pending
            .lock()
            .expect("responder lock poisoned")
            .take()
        {
            writer.write_frame(&proto::encode_outbound_frame(&response));
        }

        if !workers.is_empty() {
            let mut agg_size = 0u64;
            let mut agg_memory = 0u64;
            for worker in workers {
                agg_size += worker.queue.size() as u64;
                agg_memory += worker.queue.memory() as u64;
            }
            let snapshot = Response::new(
                response::MSG_V8_WORKER_CONFIG,
                response::OP_QUEUE_SIZE,
                self.metrics.queue_stats(agg_size, agg_memory),
            );
            writer.write_frame(&proto::encode_outbound_frame(&snapshot));
        }

        self.metrics
            .messages_processed_counter
            .store(0, Ordering::Relaxed);
        self.priority.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_boundary_triggers_flush() {
        let metrics = Arc::new(Metrics::default());
        let responder = Responder::new(8, Arc::clone(&metrics));

        for _ in 0..7 {
            metrics.bump(&metrics.messages_processed_counter);
        }
        assert!(!responder.should_flush());

        metrics.bump(&metrics.messages_processed_counter);
        assert!(responder.should_flush());
    }

    #[test]
    fn priority_flag_forces_flush() {
        let metrics = Arc::new(Metrics::default());
        let responder = Responder::new(8, Arc::clone(&metrics));
        assert!(!responder.should_flush());
        responder.mark_priority();
        assert!(responder.should_flush());
    }
}
