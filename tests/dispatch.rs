//! Socket-level dispatch tests: init and load, routing, duplicate
//! suppression, the rebalance filter protocol, and batch flushing.

mod common;

use std::time::Duration;

use common::*;
use evhost::proto::response;

fn stats_field(ctl: &mut evhost::test_harness::TestController, opcode: u8, key: &str) -> u64 {
    let (header, payload) = if opcode == response::OP_EXECUTION_STATS {
        get_execution_stats()
    } else {
        get_failure_stats()
    };
    ctl.send(&header, &payload);
    let response = ctl
        .wait_for_response(Duration::from_secs(5), |r| {
            r.msg_type == response::MSG_V8_WORKER_CONFIG && r.opcode == opcode
        })
        .expect("stats response");
    let value: serde_json::Value = serde_json::from_str(&response.msg).expect("stats are JSON");
    value[key].as_u64().unwrap_or_else(|| panic!("{key} missing in {value}"))
}

#[test]
fn init_and_load_dispatches_on_update() {
    let mut ctl = boot(Setup {
        thread_count: 2,
        ..Setup::default()
    });

    let (header, payload) = thread_map(&[(0, &[17]), (1, &[18])]);
    ctl.send(&header, &payload);

    let (header, payload) = mutation(17, 1, r#"{"n":1}"#);
    ctl.send(&header, &payload);

    assert!(ctl.recorder.wait_for_updates(1, Duration::from_secs(5)));
    assert_eq!(ctl.recorder.update_count(), 1);
    ctl.stop();
}

#[test]
fn mutations_route_to_their_mapped_workers() {
    let mut ctl = boot(Setup {
        thread_count: 2,
        ..Setup::default()
    });
    let (header, payload) = thread_map(&[(0, &[17]), (1, &[18])]);
    ctl.send(&header, &payload);

    let (header, payload) = mutation(17, 10, r#"{"a":1}"#);
    ctl.send(&header, &payload);
    let (header, payload) = mutation(18, 3, r#"{"b":2}"#);
    ctl.send(&header, &payload);

    assert!(ctl.recorder.wait_for_updates(2, Duration::from_secs(5)));

    // Checkpoints on the feedback channel carry the processed seqnos.
    let feedback = ctl.drain_feedback(Duration::from_secs(3));
    let marks: Vec<&str> = feedback
        .iter()
        .filter(|r| r.msg_type == response::MSG_BUCKET_OPS)
        .map(|r| r.msg.as_str())
        .collect();
    assert!(marks.contains(&"17::10"), "missing 17::10 in {marks:?}");
    assert!(marks.contains(&"18::3"), "missing 18::3 in {marks:?}");
    ctl.stop();
}

#[test]
fn duplicate_seqno_is_suppressed() {
    let mut ctl = boot(Setup::default());
    let (header, payload) = thread_map(&[(0, &[17])]);
    ctl.send(&header, &payload);

    let (header, payload) = mutation(17, 10, r#"{"n":1}"#);
    ctl.send(&header, &payload);
    assert!(ctl.recorder.wait_for_updates(1, Duration::from_secs(5)));

    let (header, payload) = mutation(17, 10, r#"{"n":1}"#);
    ctl.send(&header, &payload);

    // The duplicate lands in the filtered counter, not in user code.
    assert!(evhost::test_harness::wait_until(
        Duration::from_secs(5),
        || stats_field(&mut ctl, response::OP_EXECUTION_STATS, "filtered_dcp_mutation_counter")
            >= 1
    ));
    assert_eq!(ctl.recorder.update_count(), 1);
    ctl.stop();
}

#[test]
fn filter_handoff_acks_and_suppresses() {
    let mut ctl = boot(Setup::default());
    let (header, payload) = thread_map(&[(0, &[17])]);
    ctl.send(&header, &payload);

    let (header, payload) = mutation(17, 10, r#"{"n":1}"#);
    ctl.send(&header, &payload);
    assert!(ctl.recorder.wait_for_updates(1, Duration::from_secs(5)));

    let (header, payload) = vb_filter(17, 15);
    ctl.send(&header, &payload);

    let ack = ctl
        .wait_for_response(Duration::from_secs(5), |r| {
            r.msg_type == response::MSG_FILTER_ACK
        })
        .expect("filter ack");
    let value: serde_json::Value = serde_json::from_str(&ack.msg).unwrap();
    assert_eq!(value["vb"], serde_json::json!(17));
    assert_eq!(value["seq"], serde_json::json!(10));
    assert_eq!(value["skip_ack"], serde_json::json!(false));

    // In-flight events at or below the boundary never reach user code.
    let (header, payload) = mutation(17, 12, r#"{"n":2}"#);
    ctl.send(&header, &payload);
    assert!(evhost::test_harness::wait_until(
        Duration::from_secs(5),
        || stats_field(&mut ctl, response::OP_EXECUTION_STATS, "filtered_dcp_mutation_counter")
            >= 1
    ));
    assert_eq!(ctl.recorder.update_count(), 1);

    // Past the boundary the stream flows again.
    let (header, payload) = mutation(17, 16, r#"{"n":3}"#);
    ctl.send(&header, &payload);
    assert!(ctl.recorder.wait_for_updates(2, Duration::from_secs(5)));
    ctl.stop();
}

#[test]
fn batch_boundary_emits_one_queue_snapshot() {
    let mut ctl = boot(Setup {
        batch_size: 8,
        ..Setup::default()
    });
    let (header, payload) = thread_map(&[(0, &[17])]);
    ctl.send(&header, &payload);

    // Reset the batch counter with a priority request, then clear the wire.
    let (header, payload) = get_execution_stats();
    ctl.send(&header, &payload);
    ctl.wait_for_response(Duration::from_secs(5), |r| {
        r.opcode == response::OP_EXECUTION_STATS
    })
    .expect("stats response");
    let _ = ctl.drain_responses(Duration::from_millis(300));

    for seq in 1..=8u64 {
        let (header, payload) = mutation(17, seq, r#"{"n":1}"#);
        ctl.send(&header, &payload);
    }
    assert!(ctl.recorder.wait_for_updates(8, Duration::from_secs(5)));

    let responses = ctl.drain_responses(Duration::from_secs(1));
    let snapshots: Vec<_> = responses
        .iter()
        .filter(|r| {
            r.msg_type == response::MSG_V8_WORKER_CONFIG && r.opcode == response::OP_QUEUE_SIZE
        })
        .collect();
    assert_eq!(snapshots.len(), 1, "snapshots: {snapshots:?}");

    let value: serde_json::Value = serde_json::from_str(&snapshots[0].msg).unwrap();
    assert!(value.get("agg_queue_size").is_some());
    assert!(value.get("agg_queue_memory").is_some());
    assert!(value.get("processed_events_size").is_some());
    ctl.stop();
}

#[test]
fn script_exception_still_advances_the_checkpoint() {
    let mut ctl = boot(Setup {
        script: "function OnUpdate(doc, meta) {}\n// fail OnUpdate".into(),
        ..Setup::default()
    });
    let (header, payload) = thread_map(&[(0, &[3])]);
    ctl.send(&header, &payload);

    let (header, payload) = mutation(3, 5, r#"{"n":1}"#);
    ctl.send(&header, &payload);
    assert!(ctl.recorder.wait_for_updates(1, Duration::from_secs(5)));

    assert!(evhost::test_harness::wait_until(
        Duration::from_secs(5),
        || stats_field(&mut ctl, response::OP_EXECUTION_STATS, "on_update_failure") >= 1
    ));

    // The thrown invocation still checkpoints its seqno.
    let feedback = ctl.drain_feedback(Duration::from_secs(3));
    assert!(
        feedback
            .iter()
            .any(|r| r.msg_type == response::MSG_BUCKET_OPS && r.msg == "3::5"),
        "no checkpoint for the failed invocation: {feedback:?}"
    );
    ctl.stop();
}

#[test]
fn timed_out_invocation_does_not_checkpoint() {
    let mut ctl = boot(Setup {
        script: "function OnUpdate(doc, meta) {}\n// hang OnUpdate 5000".into(),
        execution_timeout_secs: 1,
        ..Setup::default()
    });
    let (header, payload) = thread_map(&[(0, &[3])]);
    ctl.send(&header, &payload);

    let (header, payload) = mutation(3, 5, r#"{"n":1}"#);
    ctl.send(&header, &payload);

    assert!(evhost::test_harness::wait_until(
        Duration::from_secs(10),
        || stats_field(&mut ctl, response::OP_FAILURE_STATS, "timeout_count") >= 1
    ));

    let feedback = ctl.drain_feedback(Duration::from_millis(500));
    assert!(
        !feedback.iter().any(|r| r.msg == "3::5"),
        "terminated invocation must not checkpoint: {feedback:?}"
    );
    ctl.stop();
}

#[test]
fn corrupt_frame_is_dropped_without_tearing_the_stream() {
    let mut ctl = boot(Setup::default());
    let (header, payload) = thread_map(&[(0, &[17])]);
    ctl.send(&header, &payload);

    // Corrupt a byte inside the header record; framing lengths stay valid
    // so the reader resynchronises at the next frame.
    let (header, payload) = mutation(17, 1, r#"{"n":1}"#);
    let mut bytes = evhost::proto::encode_inbound_frame(&header, &payload);
    bytes[10] ^= 0xff;
    ctl.send_raw(&bytes);

    let (header, payload) = mutation(17, 2, r#"{"n":2}"#);
    ctl.send(&header, &payload);

    assert!(ctl.recorder.wait_for_updates(1, Duration::from_secs(5)));
    assert_eq!(ctl.recorder.update_count(), 1);
    assert!(stats_field(&mut ctl, response::OP_FAILURE_STATS, "frames_dropped") >= 1);
    ctl.stop();
}

#[test]
fn frames_split_across_writes_reassemble() {
    let mut ctl = boot(Setup::default());
    let (header, payload) = thread_map(&[(0, &[17])]);
    ctl.send(&header, &payload);

    let mut stream = Vec::new();
    for seq in 1..=3u64 {
        let (header, payload) = mutation(17, seq, r#"{"n":1}"#);
        stream.extend_from_slice(&evhost::proto::encode_inbound_frame(&header, &payload));
    }
    for chunk in stream.chunks(7) {
        ctl.send_raw(chunk);
        std::thread::sleep(Duration::from_millis(2));
    }

    assert!(ctl.recorder.wait_for_updates(3, Duration::from_secs(5)));
    assert_eq!(ctl.recorder.update_count(), 3);
    ctl.stop();
}

#[test]
fn callbacks_stay_in_seqno_order_within_a_partition() {
    let mut ctl = boot(Setup::default());
    let (header, payload) = thread_map(&[(0, &[21])]);
    ctl.send(&header, &payload);

    for seq in 1..=20u64 {
        let (header, payload) = mutation(21, seq, r#"{"n":1}"#);
        ctl.send(&header, &payload);
    }
    assert!(ctl.recorder.wait_for_updates(20, Duration::from_secs(5)));

    let updates = ctl.recorder.updates.lock().unwrap();
    let seqs: Vec<u64> = updates
        .iter()
        .map(|(_, meta)| {
            let value: serde_json::Value = serde_json::from_str(meta).unwrap();
            value["seq"].as_u64().unwrap()
        })
        .collect();
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    assert_eq!(seqs, sorted, "updates arrived out of order: {seqs:?}");
    assert_eq!(seqs.len(), 20);
    drop(updates);
    ctl.stop();
}

#[test]
fn control_opcodes_answer_with_priority_responses() {
    let mut ctl = boot(Setup::default());

    // Compile check runs on a scratch engine.
    ctl.send(
        &evhost::proto::Header::new(
            evhost::proto::Event::V8Worker,
            evhost::proto::V8WorkerOpcode::GetCompileInfo.as_u8(),
            0,
            "function OnUpdate(doc, meta) {}",
        ),
        &evhost::proto::Payload::Empty,
    );
    let info = ctl
        .wait_for_response(Duration::from_secs(5), |r| {
            r.opcode == response::OP_COMPILE_INFO
        })
        .expect("compile info response");
    let value: serde_json::Value = serde_json::from_str(&info.msg).unwrap();
    assert_eq!(value["compile_success"], serde_json::json!(true));

    // Latency stats render as a JSON object keyed by bucket upper bound.
    ctl.send(
        &evhost::proto::Header::new(
            evhost::proto::Event::V8Worker,
            evhost::proto::V8WorkerOpcode::GetLatencyStats.as_u8(),
            0,
            "",
        ),
        &evhost::proto::Payload::Empty,
    );
    let latency = ctl
        .wait_for_response(Duration::from_secs(5), |r| {
            r.opcode == response::OP_LATENCY_STATS
        })
        .expect("latency stats response");
    assert!(serde_json::from_str::<serde_json::Value>(&latency.msg)
        .unwrap()
        .is_object());

    // Log level reconfiguration must not disturb the stream.
    ctl.send(
        &evhost::proto::Header::new(
            evhost::proto::Event::AppWorkerSetting,
            evhost::proto::AppWorkerSettingOpcode::LogLevel.as_u8(),
            0,
            "debug",
        ),
        &evhost::proto::Payload::Empty,
    );
    let (header, payload) = get_execution_stats();
    ctl.send(&header, &payload);
    assert!(ctl
        .wait_for_response(Duration::from_secs(5), |r| {
            r.opcode == response::OP_EXECUTION_STATS
        })
        .is_some());
    ctl.stop();
}

#[test]
fn deletes_reach_on_delete() {
    let mut ctl = boot(Setup::default());
    let (header, payload) = thread_map(&[(0, &[9])]);
    ctl.send(&header, &payload);

    let (header, payload) = deletion(9, 4);
    ctl.send(&header, &payload);
    assert!(ctl.recorder.wait_for_deletes(1, Duration::from_secs(5)));
    ctl.stop();
}

#[test]
fn out_of_range_metadata_vbucket_is_dropped_not_fatal() {
    let mut ctl = boot(Setup::default());
    let (header, payload) = thread_map(&[(0, &[17])]);
    ctl.send(&header, &payload);

    // The routed partition is valid but the metadata names a vBucket far
    // outside the slot range; the worker must drop it and keep serving.
    let bogus = evhost::proto::Header::new(
        evhost::proto::Event::Dcp,
        evhost::proto::DcpOpcode::Mutation.as_u8(),
        17,
        r#"{"vb":5000,"seq":1}"#,
    );
    let bogus_payload = evhost::proto::Payload::Dcp(evhost::proto::DcpPayload {
        value: r#"{"n":1}"#.into(),
    });
    ctl.send(&bogus, &bogus_payload);

    assert!(evhost::test_harness::wait_until(
        Duration::from_secs(5),
        || stats_field(&mut ctl, response::OP_FAILURE_STATS, "mutation_events_lost") >= 1
    ));
    assert_eq!(ctl.recorder.update_count(), 0);

    // The stream is intact: a well-formed mutation still dispatches.
    let (header, payload) = mutation(17, 1, r#"{"n":1}"#);
    ctl.send(&header, &payload);
    assert!(ctl.recorder.wait_for_updates(1, Duration::from_secs(5)));
    ctl.stop();
}

#[test]
fn unmapped_partition_counts_as_lost() {
    let mut ctl = boot(Setup::default());
    // No thread map: every partition is unmapped.
    let (header, payload) = mutation(40, 1, r#"{"n":1}"#);
    ctl.send(&header, &payload);

    assert!(evhost::test_harness::wait_until(
        Duration::from_secs(5),
        || stats_field(&mut ctl, response::OP_FAILURE_STATS, "mutation_events_lost") >= 1
    ));
    assert_eq!(ctl.recorder.update_count(), 0);
    ctl.stop();
}
