//! Control-thread message routing.
//!
//! The main reactor decodes frames and hands them here: control opcodes
//! are handled inline and stage priority responses, data events are routed
//! onto the target worker's queue. A full queue blocks this thread — that
//! is the back-pressure path to the controller.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;

use serde::Deserialize;
use serde_json::json;

use crate::config::{HandlerConfig, Limits, ServerSettings, WorkerArgs};
use crate::daemon::metrics::{latency_stats_json, Metrics};
use crate::daemon::responder::Responder;
use crate::daemon::router::Router;
use crate::daemon::transport::RetryWriter;
use crate::daemon::worker::{self, WorkMsg, WorkerHandle};
use crate::kv::StoreFactory;
use crate::proto::{
    self, response, AppWorkerSettingOpcode, DcpOpcode, Event, FilterOpcode, InternalOpcode,
    Payload, RawFrame, Response, V8WorkerOpcode,
};
use crate::telemetry::Telemetry;
use crate::vm::{CompileInfo, EngineFactory};

#[derive(Debug, Deserialize)]
struct FilterMeta {
    vb: u16,
    #[serde(alias = "seq_no", alias = "filter_seq_no")]
    seq: u64,
    #[serde(default)]
    skip_ack: bool,
}

pub struct Control {
    args: WorkerArgs,
    limits: Limits,
    metrics: Arc<Metrics>,
    responder: Arc<Responder>,
    router: Router,
    workers: Arc<RwLock<Vec<Arc<WorkerHandle>>>>,
    joins: Vec<JoinHandle<()>>,
    engines: Arc<dyn EngineFactory>,
    kv: Arc<dyn StoreFactory>,
    telemetry: Telemetry,
    shutdown: Arc<AtomicBool>,

    thread_count: usize,
    handler: Option<(HandlerConfig, ServerSettings)>,
    using_timer: Arc<AtomicBool>,
    context_max: Arc<AtomicUsize>,
    checkpoint_interval_ms: Arc<AtomicU64>,
}

#[allow(clippy::too_many_arguments)]
impl Control {
    pub fn new(
        args: WorkerArgs,
        limits: Limits,
        metrics: Arc<Metrics>,
        responder: Arc<Responder>,
        workers: Arc<RwLock<Vec<Arc<WorkerHandle>>>>,
        engines: Arc<dyn EngineFactory>,
        kv: Arc<dyn StoreFactory>,
        telemetry: Telemetry,
        using_timer: Arc<AtomicBool>,
        checkpoint_interval_ms: Arc<AtomicU64>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            args,
            limits,
            metrics,
            responder,
            router: Router::new(),
            workers,
            joins: Vec::new(),
            engines,
            kv,
            telemetry,
            shutdown,
            thread_count: 1,
            handler: None,
            using_timer,
            context_max: Arc::new(AtomicUsize::new(0)),
            checkpoint_interval_ms,
        }
    }

    /// Decode and route one inbound frame.
    pub fn handle_frame(&mut self, frame: RawFrame) {
        let header = match proto::decode_header(&frame.header, &self.limits) {
            Ok(header) => header,
            Err(err) => {
                self.metrics.bump(&self.metrics.frames_dropped);
                tracing::debug!(%err, "dropping frame with bad header");
                return;
            }
        };
        self.metrics.bump(&self.metrics.messages_parsed);

        let payload = match proto::decode_payload(
            header.event,
            header.opcode,
            &frame.payload,
            &self.limits,
        ) {
            Ok(payload) => payload,
            Err(err) => {
                self.metrics.bump(&self.metrics.frames_dropped);
                tracing::debug!(%err, event = header.event, opcode = header.opcode,
                    "dropping frame with bad payload");
                return;
            }
        };

        let msg = WorkMsg {
            header,
            payload,
            payload_bytes: frame.payload.len(),
        };

        match Event::from_u8(msg.header.event) {
            Some(Event::V8Worker) => self.on_v8_worker(msg),
            Some(Event::Dcp) => self.on_dcp(msg),
            Some(Event::Filter) => self.on_filter(msg),
            Some(Event::AppWorkerSetting) => self.on_setting(msg),
            Some(Event::Debugger) => self.on_debugger(msg),
            Some(Event::Internal) => self.on_internal(msg),
            None => {
                tracing::error!(event = msg.header.event, "unknown event class");
            }
        }
    }

    /// Batch boundary: flush when the counter or the priority flag says so.
    pub fn maybe_flush(&self, writer: &mut RetryWriter) {
        if self.responder.should_flush() {
            let workers = self.workers.read().expect("worker list lock poisoned");
            self.responder.flush(writer, &workers);
        }
    }

    /// Worker/watchdog threads to join once the queues are closed.
    pub fn take_joins(&mut self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut self.joins)
    }

    fn on_v8_worker(&mut self, msg: WorkMsg) {
        match V8WorkerOpcode::from_u8(msg.header.opcode) {
            Some(V8WorkerOpcode::Init) => self.init_workers(&msg),
            Some(V8WorkerOpcode::Load) => {
                let workers = self.workers.read().expect("worker list lock poisoned");
                tracing::info!(workers = workers.len(), "loading handler source");
                for worker in workers.iter() {
                    worker.queue.push_front(WorkMsg {
                        header: msg.header.clone(),
                        payload: Payload::Empty,
                        payload_bytes: 0,
                    });
                }
                self.responder.mark_priority();
            }
            Some(V8WorkerOpcode::Terminate) => {
                tracing::info!("terminate requested");
                self.shutdown.store(true, Ordering::Release);
            }
            Some(V8WorkerOpcode::GetExecutionStats) => {
                let (size, memory) = self.aggregate_queues();
                self.stage_priority(
                    response::OP_EXECUTION_STATS,
                    self.metrics.execution_stats(size, memory),
                );
            }
            Some(V8WorkerOpcode::GetFailureStats) => {
                self.stage_priority(response::OP_FAILURE_STATS, self.metrics.failure_stats());
            }
            Some(V8WorkerOpcode::GetLatencyStats) => {
                let mut agg = std::collections::BTreeMap::new();
                for worker in self.workers.read().expect("worker list lock poisoned").iter() {
                    worker.latency.merge_into(&mut agg);
                }
                self.stage_priority(response::OP_LATENCY_STATS, latency_stats_json(&agg));
            }
            Some(V8WorkerOpcode::GetCompileInfo) => {
                let info = self.compile_only(&msg.header.metadata);
                self.stage_priority(response::OP_COMPILE_INFO, info.to_json());
            }
            Some(V8WorkerOpcode::Dispose) | None => {
                self.metrics.bump(&self.metrics.v8_worker_events_lost);
                tracing::error!(opcode = msg.header.opcode, "v8worker opcode not implemented");
            }
        }
    }

    fn init_workers(&mut self, msg: &WorkMsg) {
        let Payload::Init(init) = &msg.payload else {
            self.metrics.bump(&self.metrics.v8_worker_events_lost);
            tracing::error!("init without an init payload");
            return;
        };
        if !self
            .workers
            .read()
            .expect("worker list lock poisoned")
            .is_empty()
        {
            tracing::warn!("init received twice; keeping existing workers");
            self.responder.mark_priority();
            return;
        }

        let config = HandlerConfig::from_init(init);
        let settings = ServerSettings::from_init(init);

        self.checkpoint_interval_ms.store(
            settings.checkpoint_interval.as_millis() as u64,
            Ordering::Relaxed,
        );
        self.using_timer.store(config.using_timer, Ordering::Relaxed);
        self.context_max
            .store(config.timer_context_size, Ordering::Relaxed);

        tracing::info!(
            app = %config.app_name,
            threads = self.thread_count,
            execution_timeout_s = config.execution_timeout.as_secs(),
            using_timer = config.using_timer,
            checkpoint_interval_ms = settings.checkpoint_interval.as_millis() as u64,
            "initialising workers"
        );

        let mut spawned = Vec::with_capacity(self.thread_count);
        for id in 0..self.thread_count {
            let engine = self.engines.create(&config, &settings);
            let kv = match self.kv.open(&settings) {
                Ok(kv) => kv,
                Err(err) => {
                    tracing::error!(worker = id, %err, "kv handle unavailable");
                    Arc::new(crate::kv::UnavailableStore) as Arc<dyn crate::kv::Store>
                }
            };
            spawned.push(worker::spawn(
                id,
                config.clone(),
                settings.clone(),
                engine,
                kv,
                self.args.timer_prefix(),
                Arc::clone(&self.context_max),
                Arc::clone(&self.metrics),
                &self.limits,
                Arc::clone(&self.shutdown),
            ));
        }

        let mut workers = self.workers.write().expect("worker list lock poisoned");
        for spawn in spawned {
            workers.push(spawn.handle);
            self.joins.push(spawn.thread);
            self.joins.push(spawn.watchdog);
        }
        self.handler = Some((config, settings));
        self.responder.mark_priority();
    }

    fn compile_only(&self, source: &str) -> CompileInfo {
        let Some((config, settings)) = &self.handler else {
            return CompileInfo {
                language: "JavaScript".into(),
                compile_success: false,
                index: 0,
                line_number: 0,
                column_number: 0,
                description: "handler is not initialised".into(),
                area: "init".into(),
            };
        };
        // Compile on a scratch engine: worker engines are never touched
        // from this thread.
        match self.engines.create(config, settings) {
            Ok(mut engine) => engine.compile(source),
            Err(err) => CompileInfo {
                language: "JavaScript".into(),
                compile_success: false,
                index: 0,
                line_number: 0,
                column_number: 0,
                description: err.to_string(),
                area: "engine".into(),
            },
        }
    }

    fn on_dcp(&mut self, msg: WorkMsg) {
        let opcode = DcpOpcode::from_u8(msg.header.opcode);
        let target = self.router.worker_for(msg.header.partition);
        let worker = target.and_then(|idx| {
            self.workers
                .read()
                .expect("worker list lock poisoned")
                .get(idx)
                .cloned()
        });

        match (opcode, worker) {
            (Some(DcpOpcode::Mutation), Some(worker)) => {
                self.metrics
                    .bump(&self.metrics.enqueued_dcp_mutation_msg_counter);
                worker.queue.push_back(msg);
            }
            (Some(DcpOpcode::Delete), Some(worker)) => {
                self.metrics
                    .bump(&self.metrics.enqueued_dcp_delete_msg_counter);
                worker.queue.push_back(msg);
            }
            (Some(DcpOpcode::Mutation), None) => {
                self.metrics.bump(&self.metrics.mutation_events_lost);
                tracing::error!(
                    partition = msg.header.partition,
                    "mutation lost: no worker for partition"
                );
            }
            (Some(DcpOpcode::Delete), None) => {
                self.metrics.bump(&self.metrics.delete_events_lost);
                tracing::error!(
                    partition = msg.header.partition,
                    "delete lost: no worker for partition"
                );
            }
            (None, _) => {
                self.metrics.bump(&self.metrics.dcp_events_lost);
                tracing::error!(opcode = msg.header.opcode, "dcp opcode not implemented");
            }
        }
    }

    fn on_filter(&mut self, msg: WorkMsg) {
        match FilterOpcode::from_u8(msg.header.opcode) {
            Some(FilterOpcode::VbFilter) => {
                let meta: FilterMeta = match serde_json::from_str(&msg.header.metadata) {
                    Ok(meta) => meta,
                    Err(err) => {
                        tracing::error!(%err, "vb filter metadata unparseable");
                        return;
                    }
                };
                let Some(worker) = self.worker_for_partition(msg.header.partition) else {
                    tracing::error!(
                        partition = msg.header.partition,
                        "filter event lost: no worker for partition"
                    );
                    return;
                };
                tracing::info!(vb = meta.vb, boundary = meta.seq, "filter hand-off requested");
                // Metadata is unvalidated wire input; an out-of-range
                // vBucket is a misrouted event and gets no ack.
                let Some(last_processed) = worker.filter.install(meta.vb, meta.seq) else {
                    tracing::error!(
                        vb = meta.vb,
                        "filter event lost: vbucket out of range"
                    );
                    return;
                };
                // The hand-off acknowledges this seqno; the checkpoint
                // writer must not re-emit it.
                worker.checkpoints.clear(meta.vb);

                let ack = json!({
                    "vb": meta.vb,
                    "seq": last_processed,
                    "skip_ack": meta.skip_ack,
                })
                .to_string();
                tracing::info!(vb = meta.vb, seq = last_processed, skip_ack = meta.skip_ack,
                    "sending filter ack");
                self.responder.stage(Response::new(
                    response::MSG_FILTER_ACK,
                    response::OP_VB_FILTER,
                    ack,
                ));
                self.responder.mark_priority();
            }
            Some(FilterOpcode::ProcessedSeqNo) => {
                if let Some(worker) = self.worker_for_partition(msg.header.partition) {
                    worker.queue.push_back(msg);
                }
            }
            None => {
                tracing::error!(opcode = msg.header.opcode, "filter opcode not implemented");
            }
        }
    }

    fn on_setting(&mut self, msg: WorkMsg) {
        match AppWorkerSettingOpcode::from_u8(msg.header.opcode) {
            Some(AppWorkerSettingOpcode::LogLevel) => {
                self.telemetry.set_level(&msg.header.metadata);
                tracing::info!(level = %msg.header.metadata, "log level configured");
                self.responder.mark_priority();
            }
            Some(AppWorkerSettingOpcode::WorkerThreadCount) => {
                match msg.header.metadata.parse::<usize>() {
                    Ok(count) if count > 0 => {
                        self.thread_count = count;
                        tracing::info!(count, "worker thread count configured");
                    }
                    _ => {
                        tracing::error!(raw = %msg.header.metadata, "bad worker thread count");
                    }
                }
                self.responder.mark_priority();
            }
            Some(AppWorkerSettingOpcode::WorkerThreadMap) => {
                let Payload::ThreadMap(map) = &msg.payload else {
                    self.metrics
                        .bump(&self.metrics.app_worker_setting_events_lost);
                    return;
                };
                tracing::info!(
                    entries = map.entries.len(),
                    partition_count = map.partition_count,
                    "worker thread map configured"
                );
                self.router.apply(map);
                self.responder.mark_priority();
            }
            Some(AppWorkerSettingOpcode::TimerContextSize) => {
                match msg.header.metadata.parse::<usize>() {
                    Ok(size) => {
                        self.context_max.store(size, Ordering::Relaxed);
                        tracing::info!(size, "timer context size configured");
                    }
                    Err(err) => {
                        tracing::error!(%err, "bad timer context size");
                    }
                }
                self.responder.mark_priority();
            }
            Some(AppWorkerSettingOpcode::VbMap) => self.on_vb_map(&msg),
            None => {
                self.metrics
                    .bump(&self.metrics.app_worker_setting_events_lost);
                tracing::error!(opcode = msg.header.opcode, "setting opcode not implemented");
            }
        }
    }

    fn on_vb_map(&mut self, msg: &WorkMsg) {
        if !self.using_timer.load(Ordering::Relaxed) {
            return;
        }
        let Payload::VbMap(map) = &msg.payload else {
            self.metrics
                .bump(&self.metrics.app_worker_setting_events_lost);
            return;
        };
        let workers = self.workers.read().expect("worker list lock poisoned");
        let split = self.router.split_owned(&map.vbuckets, workers.len());
        tracing::info!(vbuckets = map.vbuckets.len(), "vbucket ownership map updated");
        for (worker, owned) in workers.iter().zip(split) {
            worker.stage_partitions(owned);
            worker.queue.push_front(WorkMsg::control(
                Event::Internal,
                InternalOpcode::UpdateVbMap.as_u8(),
            ));
        }
    }

    fn on_debugger(&mut self, msg: WorkMsg) {
        let Some(worker) = self.worker_for_partition(msg.header.partition) else {
            self.metrics.bump(&self.metrics.debugger_events_lost);
            tracing::error!(
                partition = msg.header.partition,
                "debugger event lost: no worker for partition"
            );
            return;
        };
        worker.queue.push_back(msg);
        self.responder.mark_priority();
    }

    fn on_internal(&mut self, msg: WorkMsg) {
        match InternalOpcode::from_u8(msg.header.opcode) {
            Some(InternalOpcode::ScanTimer) => {
                let workers = self.workers.read().expect("worker list lock poisoned");
                for worker in workers.iter() {
                    self.metrics.bump(&self.metrics.enqueued_timer_msg_counter);
                    worker.queue.push_front(WorkMsg::control(
                        Event::Internal,
                        InternalOpcode::ScanTimer.as_u8(),
                    ));
                }
            }
            Some(InternalOpcode::UpdateVbMap) | None => {
                tracing::error!(opcode = msg.header.opcode, "internal opcode not routable");
            }
        }
    }

    fn worker_for_partition(&self, partition: u16) -> Option<Arc<WorkerHandle>> {
        let idx = self.router.worker_for(partition)?;
        self.workers
            .read()
            .expect("worker list lock poisoned")
            .get(idx)
            .cloned()
    }

    fn aggregate_queues(&self) -> (u64, u64) {
        let workers = self.workers.read().expect("worker list lock poisoned");
        let mut size = 0u64;
        let mut memory = 0u64;
        for worker in workers.iter() {
            size += worker.queue.size() as u64;
            memory += worker.queue.memory() as u64;
        }
        (size, memory)
    }

    fn stage_priority(&self, opcode: u8, msg: String) {
        self.responder
            .stage(Response::new(response::MSG_V8_WORKER_CONFIG, opcode, msg));
        self.responder.mark_priority();
    }
}
