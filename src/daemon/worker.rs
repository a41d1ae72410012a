//! Worker threads: one engine, one queue, one partition set each.
//!
//! A worker owns its engine for the whole process lifetime; everything
//! cross-thread reaches it through the queue. Invocations are guarded by
//! an out-of-thread watchdog that terminates the engine once the
//! execution timeout is exceeded.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Deserialize;

use crate::config::{HandlerConfig, Limits, ServerSettings};
use crate::daemon::checkpoint::CheckpointLog;
use crate::daemon::filter::{FilterTable, Verdict};
use crate::daemon::metrics::{LatencyHistogram, Metrics};
use crate::daemon::queue::{Queue, Weighted};
use crate::kv;
use crate::proto::{
    DcpOpcode, DebuggerOpcode, Event, FilterOpcode, Header, InternalOpcode, Payload,
    V8WorkerOpcode,
};
use crate::timer::{Scan, TimerHandle, TimerStore};
use crate::vm::{CurrentEvent, Engine, HostGlobals, Terminator, VmError};

/// One queued unit of work.
#[derive(Debug)]
pub struct WorkMsg {
    pub header: Header,
    pub payload: Payload,
    /// Payload bytes as received, for memory accounting.
    pub payload_bytes: usize,
}

impl WorkMsg {
    pub fn control(event: Event, opcode: u8) -> Self {
        Self {
            header: Header::new(event, opcode, 0, ""),
            payload: Payload::Empty,
            payload_bytes: 0,
        }
    }
}

impl Weighted for WorkMsg {
    fn weight(&self) -> usize {
        std::mem::size_of::<Header>() + self.header.metadata.len() + self.payload_bytes
    }
}

/// Mutation metadata as produced by the controller.
#[derive(Debug, Deserialize)]
struct DcpMeta {
    #[serde(alias = "vbucket")]
    vb: u16,
    #[serde(alias = "seqno")]
    seq: u64,
}

/// The shared face of a worker slot: everything other threads may touch.
pub struct WorkerHandle {
    pub id: usize,
    pub queue: Queue<WorkMsg>,
    pub filter: FilterTable,
    pub checkpoints: CheckpointLog,
    pub latency: Arc<LatencyHistogram>,
    pub timers: TimerHandle,
    /// Ownership set staged by the control thread, applied by the worker
    /// when the matching priority message arrives.
    pending_partitions: Mutex<Option<BTreeSet<u16>>>,
}

impl WorkerHandle {
    pub fn stage_partitions(&self, owned: BTreeSet<u16>) {
        *self
            .pending_partitions
            .lock()
            .expect("partition stage lock poisoned") = Some(owned);
    }

    fn take_partitions(&self) -> Option<BTreeSet<u16>> {
        self.pending_partitions
            .lock()
            .expect("partition stage lock poisoned")
            .take()
    }
}

/// A spawned worker: shared handle plus the threads to join at shutdown.
pub struct SpawnedWorker {
    pub handle: Arc<WorkerHandle>,
    pub thread: JoinHandle<()>,
    pub watchdog: JoinHandle<()>,
}

/// Shared state between a worker and its watchdog thread.
struct WatchdogState {
    executing: AtomicBool,
    /// Millis since `anchor` when the running invocation began.
    started_ms: AtomicU64,
    timeout: Duration,
    anchor: Instant,
    terminator: Mutex<Option<Arc<dyn Terminator>>>,
}

impl WatchdogState {
    fn new(timeout: Duration) -> Self {
        Self {
            executing: AtomicBool::new(false),
            started_ms: AtomicU64::new(0),
            timeout,
            anchor: Instant::now(),
            terminator: Mutex::new(None),
        }
    }

    fn arm(&self, terminator: Arc<dyn Terminator>) {
        *self.terminator.lock().expect("watchdog lock poisoned") = Some(terminator);
    }

    fn begin(&self) {
        let now = self.anchor.elapsed().as_millis() as u64;
        self.started_ms.store(now, Ordering::Release);
        self.executing.store(true, Ordering::Release);
    }

    fn end(&self) {
        self.executing.store(false, Ordering::Release);
    }

    fn overdue(&self) -> bool {
        // Zero disables the watchdog.
        if self.timeout.is_zero() || !self.executing.load(Ordering::Acquire) {
            return false;
        }
        let started = self.started_ms.load(Ordering::Acquire);
        let now = self.anchor.elapsed().as_millis() as u64;
        now.saturating_sub(started) > self.timeout.as_millis() as u64
    }
}

fn run_watchdog(state: Arc<WatchdogState>, shutdown: Arc<AtomicBool>) {
    let tick = (state.timeout / 4).clamp(Duration::from_millis(10), Duration::from_millis(100));
    while !shutdown.load(Ordering::Relaxed) {
        if state.overdue() {
            let terminator = state
                .terminator
                .lock()
                .expect("watchdog lock poisoned")
                .clone();
            if let Some(terminator) = terminator {
                terminator.terminate();
            }
            // Wait for the worker to observe the termination before
            // checking again.
            state.end();
        }
        std::thread::sleep(tick);
    }
}

#[allow(clippy::too_many_arguments)]
pub fn spawn(
    id: usize,
    config: HandlerConfig,
    settings: ServerSettings,
    engine: Result<Box<dyn Engine>, VmError>,
    kv: Arc<dyn kv::Store>,
    timer_prefix: String,
    context_max: Arc<AtomicUsize>,
    metrics: Arc<Metrics>,
    limits: &Limits,
    shutdown: Arc<AtomicBool>,
) -> SpawnedWorker {
    let store = TimerStore::new(
        Arc::clone(&kv),
        timer_prefix,
        context_max,
        Arc::clone(&metrics),
    );
    let timers = TimerHandle::new(Arc::new(Mutex::new(store)), Arc::clone(&metrics));

    let handle = Arc::new(WorkerHandle {
        id,
        queue: Queue::new(limits.max_queue_items, limits.max_queue_bytes),
        filter: FilterTable::new(),
        checkpoints: CheckpointLog::new(),
        latency: Arc::new(LatencyHistogram::default()),
        timers,
        pending_partitions: Mutex::new(None),
    });

    let watchdog_state = Arc::new(WatchdogState::new(config.execution_timeout));
    let watchdog = {
        let state = Arc::clone(&watchdog_state);
        let shutdown = Arc::clone(&shutdown);
        std::thread::Builder::new()
            .name(format!("watchdog-{id}"))
            .spawn(move || run_watchdog(state, shutdown))
            .expect("failed to spawn watchdog thread")
    };

    let engine = match engine {
        Ok(engine) => {
            watchdog_state.arm(engine.terminator());
            Some(engine)
        }
        Err(err) => {
            // The worker still serves control traffic so the controller
            // can observe the failure.
            tracing::error!(worker = id, %err, "engine initialisation failed");
            None
        }
    };

    let current = Arc::new(CurrentEvent::default());
    let globals = HostGlobals {
        app_name: config.app_name.clone(),
        kv,
        timers: config.using_timer.then(|| handle.timers.clone()),
        current: Arc::clone(&current),
    };

    let thread = {
        let handle = Arc::clone(&handle);
        let worker = Worker {
            id,
            config,
            settings,
            engine,
            globals_installed: false,
            handle,
            metrics,
            watchdog: watchdog_state,
            current,
            globals,
            debugger_running: false,
        };
        std::thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || worker.run())
            .expect("failed to spawn worker thread")
    };

    SpawnedWorker {
        handle,
        thread,
        watchdog,
    }
}

struct Worker {
    id: usize,
    config: HandlerConfig,
    settings: ServerSettings,
    engine: Option<Box<dyn Engine>>,
    globals_installed: bool,
    handle: Arc<WorkerHandle>,
    metrics: Arc<Metrics>,
    watchdog: Arc<WatchdogState>,
    current: Arc<CurrentEvent>,
    globals: HostGlobals,
    debugger_running: bool,
}

impl Worker {
    fn run(mut self) {
        tracing::info!(worker = self.id, app = %self.config.app_name, "worker loop started");
        while let Some(msg) = self.handle.queue.pop() {
            self.metrics
                .add(&self.metrics.processed_events_size, msg.weight() as u64);
            self.dispatch(msg);
            self.metrics.bump(&self.metrics.messages_processed_counter);
        }
        tracing::info!(worker = self.id, "worker loop stopped");
    }

    fn dispatch(&mut self, msg: WorkMsg) {
        match Event::from_u8(msg.header.event) {
            Some(Event::Dcp) => match DcpOpcode::from_u8(msg.header.opcode) {
                Some(DcpOpcode::Mutation) => self.on_mutation(&msg),
                Some(DcpOpcode::Delete) => self.on_delete(&msg),
                None => self.unknown(&msg.header),
            },
            Some(Event::V8Worker) => match V8WorkerOpcode::from_u8(msg.header.opcode) {
                Some(V8WorkerOpcode::Load) => self.load(&msg.header.metadata),
                _ => self.unknown(&msg.header),
            },
            Some(Event::Filter) => match FilterOpcode::from_u8(msg.header.opcode) {
                Some(FilterOpcode::ProcessedSeqNo) => self.update_processed(&msg.header.metadata),
                _ => self.unknown(&msg.header),
            },
            Some(Event::Debugger) => match DebuggerOpcode::from_u8(msg.header.opcode) {
                Some(DebuggerOpcode::Start) => self.start_debugger(),
                Some(DebuggerOpcode::Stop) => self.stop_debugger(),
                None => self.unknown(&msg.header),
            },
            Some(Event::Internal) => match InternalOpcode::from_u8(msg.header.opcode) {
                Some(InternalOpcode::ScanTimer) => self.scan_timers(),
                Some(InternalOpcode::UpdateVbMap) => self.apply_vb_map(),
                None => self.unknown(&msg.header),
            },
            Some(Event::AppWorkerSetting) | None => self.unknown(&msg.header),
        }
    }

    fn unknown(&self, header: &Header) {
        tracing::error!(
            worker = self.id,
            event = header.event,
            opcode = header.opcode,
            "message not handled by worker loop"
        );
    }

    fn load(&mut self, source: &str) {
        let composed = compose_script(&self.config, source);
        match self.with_engine(|engine| engine.load(&composed)) {
            Ok(flags) => {
                tracing::info!(
                    worker = self.id,
                    has_on_update = flags.has_on_update,
                    has_on_delete = flags.has_on_delete,
                    "handler loaded"
                );
            }
            Err(err) => {
                // Fatal to the VM, not to the worker: control traffic keeps
                // flowing so the controller can observe the failure.
                tracing::error!(worker = self.id, %err, "handler load failed");
            }
        }
    }

    fn on_mutation(&mut self, msg: &WorkMsg) {
        self.metrics.bump(&self.metrics.dcp_mutation_msg_counter);
        let meta: DcpMeta = match serde_json::from_str(&msg.header.metadata) {
            Ok(meta) => meta,
            Err(err) => {
                self.metrics.bump(&self.metrics.dcp_mutation_parse_failure);
                tracing::debug!(worker = self.id, %err, "mutation metadata unparseable");
                return;
            }
        };

        // Metadata is unvalidated wire input; a vBucket outside the slot
        // range is a misrouted event, dropped with a counter.
        let Some(verdict) = self.handle.filter.check(meta.vb, meta.seq) else {
            self.metrics.bump(&self.metrics.mutation_events_lost);
            tracing::error!(
                worker = self.id,
                vb = meta.vb,
                "mutation lost: vbucket out of range"
            );
            return;
        };

        match verdict {
            Verdict::Deliver => {
                let value = match &msg.payload {
                    Payload::Dcp(p) => p.value.clone(),
                    _ => String::new(),
                };
                self.current.set(meta.vb, meta.seq);
                let started = Instant::now();
                let result =
                    self.with_engine(|engine| engine.on_update(&value, &msg.header.metadata));
                self.handle
                    .latency
                    .record(started.elapsed().as_micros() as u64);
                match result {
                    Ok(()) => {
                        self.metrics.bump(&self.metrics.on_update_success);
                        self.advance(meta.vb, meta.seq);
                    }
                    Err(VmError::Terminated) => {
                        self.metrics.bump(&self.metrics.timeout_count);
                        tracing::warn!(
                            worker = self.id,
                            vb = meta.vb,
                            seq = meta.seq,
                            "OnUpdate terminated by watchdog"
                        );
                    }
                    Err(err) => {
                        self.metrics.bump(&self.metrics.on_update_failure);
                        tracing::debug!(worker = self.id, %err, "OnUpdate raised");
                        self.advance(meta.vb, meta.seq);
                    }
                }
            }
            Verdict::Duplicate | Verdict::Filtered => {
                self.metrics
                    .bump(&self.metrics.filtered_dcp_mutation_counter);
            }
        }
    }

    fn on_delete(&mut self, msg: &WorkMsg) {
        self.metrics.bump(&self.metrics.dcp_delete_msg_counter);
        let meta: DcpMeta = match serde_json::from_str(&msg.header.metadata) {
            Ok(meta) => meta,
            Err(err) => {
                self.metrics.bump(&self.metrics.dcp_delete_parse_failure);
                tracing::debug!(worker = self.id, %err, "delete metadata unparseable");
                return;
            }
        };

        let Some(verdict) = self.handle.filter.check(meta.vb, meta.seq) else {
            self.metrics.bump(&self.metrics.delete_events_lost);
            tracing::error!(
                worker = self.id,
                vb = meta.vb,
                "delete lost: vbucket out of range"
            );
            return;
        };

        match verdict {
            Verdict::Deliver => {
                self.current.set(meta.vb, meta.seq);
                let started = Instant::now();
                let result = self.with_engine(|engine| engine.on_delete(&msg.header.metadata));
                self.handle
                    .latency
                    .record(started.elapsed().as_micros() as u64);
                match result {
                    Ok(()) => {
                        self.metrics.bump(&self.metrics.on_delete_success);
                        self.advance(meta.vb, meta.seq);
                    }
                    Err(VmError::Terminated) => {
                        self.metrics.bump(&self.metrics.timeout_count);
                        tracing::warn!(
                            worker = self.id,
                            vb = meta.vb,
                            seq = meta.seq,
                            "OnDelete terminated by watchdog"
                        );
                    }
                    Err(err) => {
                        self.metrics.bump(&self.metrics.on_delete_failure);
                        tracing::debug!(worker = self.id, %err, "OnDelete raised");
                        self.advance(meta.vb, meta.seq);
                    }
                }
            }
            Verdict::Duplicate | Verdict::Filtered => {
                self.metrics.bump(&self.metrics.filtered_dcp_delete_counter);
            }
        }
    }

    fn advance(&self, vb: u16, seq: u64) {
        self.handle.filter.advance(vb, seq);
        self.handle.checkpoints.record(vb, seq);
    }

    fn update_processed(&mut self, metadata: &str) {
        let meta: DcpMeta = match serde_json::from_str(metadata) {
            Ok(meta) => meta,
            Err(err) => {
                tracing::warn!(worker = self.id, %err, "processed-seqno metadata unparseable");
                return;
            }
        };
        if (meta.vb as usize) >= crate::config::NUM_VBUCKETS {
            tracing::warn!(
                worker = self.id,
                vb = meta.vb,
                "processed-seqno update for an out-of-range vbucket; dropped"
            );
            return;
        }
        self.handle.filter.advance(meta.vb, meta.seq);
        tracing::info!(
            worker = self.id,
            vb = meta.vb,
            seq = meta.seq,
            "processed seqno updated without dispatch"
        );
    }

    fn start_debugger(&mut self) {
        let port = self.settings.debugger_port.parse::<u16>().unwrap_or_else(|_| {
            tracing::warn!(
                worker = self.id,
                port = %self.settings.debugger_port,
                "invalid debugger port; using an ephemeral one"
            );
            0
        });
        if self.debugger_running {
            tracing::error!(worker = self.id, "debugger already started");
            return;
        }
        match self.with_engine(|engine| engine.start_debugger(port)) {
            Ok(()) => {
                self.debugger_running = true;
                tracing::info!(worker = self.id, port, "debugger started");
            }
            Err(err) => tracing::error!(worker = self.id, %err, "debugger start failed"),
        }
    }

    fn stop_debugger(&mut self) {
        if !self.debugger_running {
            tracing::error!(worker = self.id, "debugger was not started");
            return;
        }
        if let Some(engine) = self.engine.as_deref_mut() {
            engine.stop_debugger();
        }
        self.debugger_running = false;
        tracing::info!(worker = self.id, "debugger stopped");
    }

    fn apply_vb_map(&mut self) {
        let Some(owned) = self.handle.take_partitions() else {
            return;
        };
        tracing::info!(worker = self.id, partitions = owned.len(), "ownership updated");
        let store = self.handle.timers.store();
        store
            .lock()
            .expect("timer store lock poisoned")
            .update_partitions(&owned);
    }

    fn scan_timers(&mut self) {
        if !self.config.using_timer {
            return;
        }
        let now = unix_now();
        let store = self.handle.timers.store();
        store
            .lock()
            .expect("timer store lock poisoned")
            .sync_span();

        let mut scan = Scan::new(store, now);
        while let Some(event) = scan.next() {
            self.metrics.bump(&self.metrics.timer_msg_counter);
            self.fire_timer(&event);
            scan.ack_fired(&event);
        }
    }

    fn fire_timer(&mut self, event: &crate::timer::TimerEvent) {
        self.current.set(event.partition, event.origin_seq);
        let started = Instant::now();
        let result =
            self.with_engine(|engine| engine.fire_callback(&event.callback, &event.context));
        self.handle
            .latency
            .record(started.elapsed().as_micros() as u64);
        match result {
            Ok(()) => {}
            Err(VmError::UnknownCallback { name }) => {
                self.metrics
                    .bump(&self.metrics.timer_callback_missing_counter);
                tracing::warn!(worker = self.id, callback = name, "timer callback missing");
            }
            Err(VmError::Terminated) => {
                self.metrics.bump(&self.metrics.timeout_count);
            }
            Err(err) => {
                tracing::debug!(worker = self.id, %err, "timer callback raised");
            }
        }
    }

    /// Run an engine call inside the watchdog window, installing host
    /// globals on first use.
    fn with_engine<T>(
        &mut self,
        f: impl FnOnce(&mut dyn Engine) -> Result<T, VmError>,
    ) -> Result<T, VmError> {
        let Some(engine) = self.engine.as_deref_mut() else {
            return Err(VmError::EngineUnavailable);
        };
        if !self.globals_installed {
            engine.install_globals(self.globals.clone())?;
            self.globals_installed = true;
        }
        self.watchdog.begin();
        let result = f(engine);
        self.watchdog.end();
        result
    }
}

fn compose_script(config: &HandlerConfig, source: &str) -> String {
    let mut out = String::new();
    for header in &config.handler_headers {
        out.push_str(header);
        out.push('\n');
    }
    out.push_str(source);
    out.push('\n');
    for footer in &config.handler_footers {
        out.push_str(footer);
        out.push('\n');
    }
    out
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_msg_weight_counts_metadata_and_payload() {
        let msg = WorkMsg {
            header: Header::new(Event::Dcp, DcpOpcode::Mutation.as_u8(), 1, "0123456789"),
            payload: Payload::Dcp(crate::proto::DcpPayload {
                value: "v".repeat(100),
            }),
            payload_bytes: 100,
        };
        assert_eq!(
            msg.weight(),
            std::mem::size_of::<Header>() + 10 + 100
        );
    }

    #[test]
    fn dcp_meta_accepts_long_key_aliases() {
        let meta: DcpMeta = serde_json::from_str(r#"{"vbucket": 3, "seqno": 9}"#).unwrap();
        assert_eq!(meta.vb, 3);
        assert_eq!(meta.seq, 9);
        let meta: DcpMeta =
            serde_json::from_str(r#"{"vb": 4, "seq": 2, "key": "doc", "cas": 1}"#).unwrap();
        assert_eq!(meta.vb, 4);
    }

    #[test]
    fn compose_script_wraps_source() {
        let config = HandlerConfig {
            app_name: "a".into(),
            dep_cfg: String::new(),
            execution_timeout: Duration::from_secs(5),
            lcb_inst_capacity: 1,
            using_timer: false,
            timer_context_size: 1024,
            handler_headers: vec!["'use strict';".into()],
            handler_footers: vec!["// end".into()],
        };
        let composed = compose_script(&config, "function OnUpdate() {}");
        assert!(composed.starts_with("'use strict';\n"));
        assert!(composed.trim_end().ends_with("// end"));
    }
}
