//! Shared fixture plumbing for the socket-level tests.
#![allow(dead_code)]

use std::time::Duration;

use evhost::proto::{
    AppWorkerSettingOpcode, DcpOpcode, DcpPayload, Event, FilterOpcode, Header, InitPayload,
    InternalOpcode, Payload, ThreadMapEntry, ThreadMapPayload, V8WorkerOpcode, VbMapPayload,
};
use evhost::test_harness::TestController;

pub const DEPCFG: &str =
    r#"{"source_bucket":"src","metadata_bucket":"meta","buckets":[]}"#;

pub struct Setup {
    pub thread_count: usize,
    pub batch_size: usize,
    pub script: String,
    pub using_timer: bool,
    pub execution_timeout_secs: u64,
    pub checkpoint_interval_ms: u64,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            thread_count: 1,
            batch_size: 8,
            script: "function OnUpdate(doc, meta) {}\nfunction OnDelete(meta) {}".into(),
            using_timer: false,
            execution_timeout_secs: 5,
            checkpoint_interval_ms: 100,
        }
    }
}

/// Boot a worker: thread count, init, and handler load, then wait for the
/// load to land on every worker.
pub fn boot(setup: Setup) -> TestController {
    let mut ctl = TestController::start(setup.batch_size);

    ctl.send(
        &Header::new(
            Event::AppWorkerSetting,
            AppWorkerSettingOpcode::WorkerThreadCount.as_u8(),
            0,
            setup.thread_count.to_string(),
        ),
        &Payload::Empty,
    );

    let init = InitPayload {
        app_name: "harness".into(),
        depcfg: DEPCFG.into(),
        execution_timeout: setup.execution_timeout_secs,
        lcb_inst_capacity: 5,
        checkpoint_interval: setup.checkpoint_interval_ms,
        handler_headers: Vec::new(),
        handler_footers: Vec::new(),
        using_timer: setup.using_timer,
        timer_context_size: 1024,
        debugger_port: "0".into(),
        eventing_dir: "/tmp".into(),
        curr_eventing_port: "8096".into(),
        curr_host: "127.0.0.1".into(),
        kv_host_port: "127.0.0.1:11210".into(),
        function_instance_id: "harness-1".into(),
    };
    ctl.send(
        &Header::new(Event::V8Worker, V8WorkerOpcode::Init.as_u8(), 0, ""),
        &Payload::Init(init),
    );

    ctl.send(
        &Header::new(
            Event::V8Worker,
            V8WorkerOpcode::Load.as_u8(),
            0,
            setup.script.clone(),
        ),
        &Payload::Empty,
    );

    let expected = setup.thread_count as u32;
    assert!(
        evhost::test_harness::wait_until(Duration::from_secs(5), || {
            ctl.recorder
                .loads
                .load(std::sync::atomic::Ordering::Acquire)
                >= expected
        }),
        "handler never loaded on all workers"
    );

    ctl
}

pub fn thread_map(entries: &[(u16, &[u16])]) -> (Header, Payload) {
    (
        Header::new(
            Event::AppWorkerSetting,
            AppWorkerSettingOpcode::WorkerThreadMap.as_u8(),
            0,
            "",
        ),
        Payload::ThreadMap(ThreadMapPayload {
            partition_count: 1024,
            entries: entries
                .iter()
                .map(|(thread_id, partitions)| ThreadMapEntry {
                    thread_id: *thread_id,
                    partitions: partitions.to_vec(),
                })
                .collect(),
        }),
    )
}

pub fn mutation(vb: u16, seq: u64, value: &str) -> (Header, Payload) {
    (
        Header::new(
            Event::Dcp,
            DcpOpcode::Mutation.as_u8(),
            vb,
            format!(r#"{{"vb":{vb},"seq":{seq},"key":"doc_{seq}","cas":1,"expiry":0}}"#),
        ),
        Payload::Dcp(DcpPayload {
            value: value.to_string(),
        }),
    )
}

pub fn deletion(vb: u16, seq: u64) -> (Header, Payload) {
    (
        Header::new(
            Event::Dcp,
            DcpOpcode::Delete.as_u8(),
            vb,
            format!(r#"{{"vb":{vb},"seq":{seq},"key":"doc_{seq}"}}"#),
        ),
        Payload::Empty,
    )
}

pub fn vb_filter(vb: u16, boundary: u64) -> (Header, Payload) {
    (
        Header::new(
            Event::Filter,
            FilterOpcode::VbFilter.as_u8(),
            vb,
            format!(r#"{{"vb":{vb},"seq":{boundary},"skip_ack":false}}"#),
        ),
        Payload::Empty,
    )
}

pub fn vb_map(vbuckets: &[u16]) -> (Header, Payload) {
    (
        Header::new(
            Event::AppWorkerSetting,
            AppWorkerSettingOpcode::VbMap.as_u8(),
            0,
            "",
        ),
        Payload::VbMap(VbMapPayload {
            vbuckets: vbuckets.to_vec(),
        }),
    )
}

pub fn scan_timer() -> (Header, Payload) {
    (
        Header::new(
            Event::Internal,
            InternalOpcode::ScanTimer.as_u8(),
            0,
            "",
        ),
        Payload::Empty,
    )
}

pub fn get_execution_stats() -> (Header, Payload) {
    (
        Header::new(
            Event::V8Worker,
            V8WorkerOpcode::GetExecutionStats.as_u8(),
            0,
            "",
        ),
        Payload::Empty,
    )
}

pub fn get_failure_stats() -> (Header, Payload) {
    (
        Header::new(
            Event::V8Worker,
            V8WorkerOpcode::GetFailureStats.as_u8(),
            0,
            "",
        ),
        Payload::Empty,
    )
}
