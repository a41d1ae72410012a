//! Checkpoint emission on the feedback stream.
//!
//! Workers mark the last processed sequence number per vBucket; a
//! dedicated thread drains those marks every `checkpoint_interval` and
//! writes `vb::seqno` response frames in even-sized batches. The initial
//! one-second sleep gives the feedback connection time to establish
//! before the first flush.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError};

use crate::config::NUM_VBUCKETS;
use crate::daemon::transport::RetryWriter;
use crate::daemon::worker::WorkerHandle;
use crate::proto::{self, response, Response};

/// Per-worker dirty set of `(vBucket, seqno)` checkpoints. A slot holds
/// zero when clean; sequence numbers start at one upstream.
pub struct CheckpointLog {
    seqs: Vec<AtomicU64>,
}

impl Default for CheckpointLog {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckpointLog {
    pub fn new() -> Self {
        let mut seqs = Vec::with_capacity(NUM_VBUCKETS);
        seqs.resize_with(NUM_VBUCKETS, AtomicU64::default);
        Self { seqs }
    }

    /// Mark `vb` dirty at `seqno`. `vb` ultimately comes from wire
    /// metadata; values outside the slot range are ignored rather than
    /// indexed.
    pub fn record(&self, vb: u16, seqno: u64) {
        if let Some(slot) = self.seqs.get(vb as usize) {
            slot.fetch_max(seqno, Ordering::AcqRel);
        }
    }

    /// Forget a pending checkpoint; used when a hand-off acknowledges the
    /// same sequence number out of band.
    pub fn clear(&self, vb: u16) {
        if let Some(slot) = self.seqs.get(vb as usize) {
            slot.store(0, Ordering::Release);
        }
    }

    /// Take every dirty mark, resetting the slots.
    pub fn drain(&self) -> Vec<(u16, u64)> {
        let mut out = Vec::new();
        for (vb, slot) in self.seqs.iter().enumerate() {
            let seq = slot.swap(0, Ordering::AcqRel);
            if seq > 0 {
                out.push((vb as u16, seq));
            }
        }
        out
    }
}

/// Frames per write call: the configured batch, rounded up to even.
fn even_batch(feedback_batch_size: usize) -> usize {
    let batch = feedback_batch_size.max(1);
    if batch % 2 == 1 {
        batch + 1
    } else {
        batch
    }
}

fn checkpoint_frame(vb: u16, seq: u64) -> Vec<u8> {
    proto::encode_outbound_frame(&Response::new(
        response::MSG_BUCKET_OPS,
        response::OP_CHECKPOINT,
        format!("{vb}::{seq}"),
    ))
}

fn flush_once(workers: &RwLock<Vec<Arc<WorkerHandle>>>, writer: &mut RetryWriter, batch: usize) {
    let workers = workers.read().expect("worker list lock poisoned").clone();
    for worker in workers {
        let marks = worker.checkpoints.drain();
        if marks.is_empty() {
            continue;
        }
        let frames: Vec<Vec<u8>> = marks
            .into_iter()
            .map(|(vb, seq)| checkpoint_frame(vb, seq))
            .collect();
        writer.write_batched(&frames, batch);
    }
}

/// Body of the checkpoint writer thread. The stop channel hangs up when
/// the process shuts down.
pub fn run_checkpoint_loop(
    workers: Arc<RwLock<Vec<Arc<WorkerHandle>>>>,
    mut writer: RetryWriter,
    interval_ms: Arc<AtomicU64>,
    feedback_batch_size: usize,
    stop: Receiver<()>,
) {
    let batch = even_batch(feedback_batch_size);

    // Warm-up: let the feedback connection settle before the first flush.
    if !wait_or_stop(&stop, Duration::from_millis(1000)) {
        loop {
            flush_once(&workers, &mut writer, batch);
            let interval = Duration::from_millis(interval_ms.load(Ordering::Relaxed).max(1));
            if wait_or_stop(&stop, interval) {
                break;
            }
        }
    }

    // Final drain so the controller sees everything processed before exit.
    flush_once(&workers, &mut writer, batch);
}

/// Sleep for `timeout` or until the stop channel hangs up; true on stop.
pub(crate) fn wait_or_stop(stop: &Receiver<()>, timeout: Duration) -> bool {
    !matches!(stop.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
}
