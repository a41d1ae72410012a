//! Process-wide counters and the stat payloads built from them.
//!
//! All counters are lock-free atomics on one shared record; stat opcodes
//! render them into JSON with stable keys the controller scrapes.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::json;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Debug, Default)]
pub struct Metrics {
    // Framing and routing.
    pub messages_parsed: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub write_failure_counter: AtomicU64,
    pub dcp_events_lost: AtomicU64,
    pub v8_worker_events_lost: AtomicU64,
    pub app_worker_setting_events_lost: AtomicU64,
    pub debugger_events_lost: AtomicU64,
    pub timer_events_lost: AtomicU64,
    pub mutation_events_lost: AtomicU64,
    pub delete_events_lost: AtomicU64,

    // Enqueue side.
    pub enqueued_dcp_mutation_msg_counter: AtomicU64,
    pub enqueued_dcp_delete_msg_counter: AtomicU64,
    pub enqueued_timer_msg_counter: AtomicU64,

    // Dispatch side.
    pub dcp_mutation_msg_counter: AtomicU64,
    pub dcp_delete_msg_counter: AtomicU64,
    pub timer_msg_counter: AtomicU64,
    pub dcp_mutation_parse_failure: AtomicU64,
    pub dcp_delete_parse_failure: AtomicU64,
    pub filtered_dcp_mutation_counter: AtomicU64,
    pub filtered_dcp_delete_counter: AtomicU64,
    pub on_update_success: AtomicU64,
    pub on_update_failure: AtomicU64,
    pub on_delete_success: AtomicU64,
    pub on_delete_failure: AtomicU64,
    pub timeout_count: AtomicU64,

    // Timers.
    pub timer_create_counter: AtomicU64,
    pub timer_create_failure: AtomicU64,
    pub timer_context_size_exceeded_counter: AtomicU64,
    pub timer_callback_missing_counter: AtomicU64,

    // Collaborator failures.
    pub bucket_op_exception_count: AtomicU64,
    pub n1ql_op_exception_count: AtomicU64,
    pub lcb_retry_failure: AtomicU64,
    pub checkpoint_failure_count: AtomicU64,

    // Response aggregation.
    pub messages_processed_counter: AtomicU64,
    pub processed_events_size: AtomicU64,
}

impl Metrics {
    pub fn bump(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self, counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// `GetExecutionStats` payload. Queue gauges are aggregated by the
    /// caller, which can see every worker.
    pub fn execution_stats(&self, agg_queue_size: u64, agg_queue_memory: u64) -> String {
        json!({
            "on_update_success": self.get(&self.on_update_success),
            "on_update_failure": self.get(&self.on_update_failure),
            "on_delete_success": self.get(&self.on_delete_success),
            "on_delete_failure": self.get(&self.on_delete_failure),
            "timer_create_failure": self.get(&self.timer_create_failure),
            "timer_create_counter": self.get(&self.timer_create_counter),
            "messages_parsed": self.get(&self.messages_parsed),
            "dcp_mutation_msg_counter": self.get(&self.dcp_mutation_msg_counter),
            "dcp_delete_msg_counter": self.get(&self.dcp_delete_msg_counter),
            "timer_msg_counter": self.get(&self.timer_msg_counter),
            "enqueued_dcp_mutation_msg_counter": self.get(&self.enqueued_dcp_mutation_msg_counter),
            "enqueued_dcp_delete_msg_counter": self.get(&self.enqueued_dcp_delete_msg_counter),
            "enqueued_timer_msg_counter": self.get(&self.enqueued_timer_msg_counter),
            "dcp_mutation_parse_failure": self.get(&self.dcp_mutation_parse_failure),
            "dcp_delete_parse_failure": self.get(&self.dcp_delete_parse_failure),
            "filtered_dcp_mutation_counter": self.get(&self.filtered_dcp_mutation_counter),
            "filtered_dcp_delete_counter": self.get(&self.filtered_dcp_delete_counter),
            "write_failure_counter": self.get(&self.write_failure_counter),
            "lcb_retry_failure": self.get(&self.lcb_retry_failure),
            "agg_queue_size": agg_queue_size,
            "feedback_queue_size": 0,
            "agg_queue_memory": agg_queue_memory,
            "processed_events_size": self.get(&self.processed_events_size),
            "timestamp": timestamp_now(),
        })
        .to_string()
    }

    /// `GetFailureStats` payload.
    pub fn failure_stats(&self) -> String {
        json!({
            "bucket_op_exception_count": self.get(&self.bucket_op_exception_count),
            "n1ql_op_exception_count": self.get(&self.n1ql_op_exception_count),
            "timeout_count": self.get(&self.timeout_count),
            "checkpoint_failure_count": self.get(&self.checkpoint_failure_count),
            "dcp_events_lost": self.get(&self.dcp_events_lost),
            "v8worker_events_lost": self.get(&self.v8_worker_events_lost),
            "app_worker_setting_events_lost": self.get(&self.app_worker_setting_events_lost),
            "debugger_events_lost": self.get(&self.debugger_events_lost),
            "timer_events_lost": self.get(&self.timer_events_lost),
            "mutation_events_lost": self.get(&self.mutation_events_lost),
            "delete_events_lost": self.get(&self.delete_events_lost),
            "timer_context_size_exceeded_counter": self.get(&self.timer_context_size_exceeded_counter),
            "timer_callback_missing_counter": self.get(&self.timer_callback_missing_counter),
            "frames_dropped": self.get(&self.frames_dropped),
            "timestamp": timestamp_now(),
        })
        .to_string()
    }

    /// Queue-depth snapshot flushed at batch boundaries.
    pub fn queue_stats(&self, agg_queue_size: u64, agg_queue_memory: u64) -> String {
        json!({
            "agg_queue_size": agg_queue_size,
            "feedback_queue_size": 0,
            "agg_queue_memory": agg_queue_memory,
            "processed_events_size": self.get(&self.processed_events_size),
        })
        .to_string()
    }
}

pub fn timestamp_now() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::from("unknown"))
}

/// Fixed-bucket latency histogram, microsecond resolution.
#[derive(Debug)]
pub struct LatencyHistogram {
    from_us: u64,
    width_us: u64,
    buckets: Vec<AtomicU64>,
}

pub const HIST_FROM_US: u64 = 100;
pub const HIST_TILL_US: u64 = 1_000 * 1_000;
pub const HIST_WIDTH_US: u64 = 1_000;

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new(HIST_FROM_US, HIST_TILL_US, HIST_WIDTH_US)
    }
}

impl LatencyHistogram {
    pub fn new(from_us: u64, till_us: u64, width_us: u64) -> Self {
        let count = ((till_us - from_us) / width_us + 1) as usize;
        let mut buckets = Vec::with_capacity(count);
        buckets.resize_with(count, AtomicU64::default);
        Self {
            from_us,
            width_us,
            buckets,
        }
    }

    pub fn record(&self, micros: u64) {
        let idx = if micros <= self.from_us {
            0
        } else {
            (((micros - self.from_us) / self.width_us) as usize).min(self.buckets.len() - 1)
        };
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    /// Merge non-empty buckets into an aggregate keyed by upper bound.
    pub fn merge_into(&self, agg: &mut std::collections::BTreeMap<u64, u64>) {
        for (idx, bucket) in self.buckets.iter().enumerate() {
            let count = bucket.load(Ordering::Relaxed);
            if count > 0 {
                let upper = self.from_us + (idx as u64 + 1) * self.width_us;
                *agg.entry(upper).or_insert(0) += count;
            }
        }
    }
}

/// Render a merged histogram as the `GetLatencyStats` payload.
pub fn latency_stats_json(agg: &std::collections::BTreeMap<u64, u64>) -> String {
    let mut map = serde_json::Map::new();
    for (upper, count) in agg {
        map.insert(upper.to_string(), json!(count));
    }
    serde_json::Value::Object(map).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_stats_carry_stable_keys() {
        let metrics = Metrics::default();
        metrics.bump(&metrics.on_update_success);
        metrics.add(&metrics.processed_events_size, 512);

        let raw = metrics.execution_stats(3, 4096);
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["on_update_success"], json!(1));
        assert_eq!(value["agg_queue_size"], json!(3));
        assert_eq!(value["agg_queue_memory"], json!(4096));
        assert_eq!(value["processed_events_size"], json!(512));
        assert_eq!(value["lcb_retry_failure"], json!(0));
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn histogram_buckets_by_upper_bound() {
        let hist = LatencyHistogram::new(100, 10_000, 1_000);
        hist.record(50);
        hist.record(150);
        hist.record(1_500);
        hist.record(999_999);

        let mut agg = std::collections::BTreeMap::new();
        hist.merge_into(&mut agg);

        assert_eq!(agg.get(&1_100), Some(&2));
        assert_eq!(agg.get(&2_100), Some(&1));
        // Overflow lands in the last bucket.
        assert_eq!(agg.values().sum::<u64>(), 4);
    }
}
