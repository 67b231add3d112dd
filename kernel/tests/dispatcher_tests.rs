// Copyright (c) 2026 clove project
// SPDX-License-Identifier: AGPL-3.0

//! Integration tests driving the full dispatcher and its services with
//! synthetic frames, without a live socket.

use clove_kernel::application::dispatcher::{dispatch, KernelServices};
use clove_kernel::config::KernelConfig;
use clove_kernel::domain::agent::AgentId;
use clove_kernel::infrastructure::codec::{Frame, SyscallOp};
use serde_json::{json, Value};

fn services() -> KernelServices {
    KernelServices::new(KernelConfig::default())
}

fn call(services: &mut KernelServices, caller: u32, op: SyscallOp, payload: Value) -> Value {
    let frame = Frame::new(AgentId(caller), op, serde_json::to_vec(&payload).unwrap());
    let response = dispatch(services, &frame);
    serde_json::from_slice(&response.payload).unwrap()
}

#[test]
fn every_opcode_yields_exactly_one_response() {
    let mut svc = services();
    for opcode in 0u8..=255 {
        let frame = Frame::raw(AgentId(1), opcode, b"{}".to_vec());
        let response = dispatch(&mut svc, &frame);
        assert_eq!(response.opcode, opcode, "opcode 0x{opcode:02x} echoed back");
        assert_eq!(response.agent_id, AgentId(1));
    }
}

#[test]
fn registration_is_injective_across_agents() {
    let mut svc = services();
    let first = call(&mut svc, 1, SyscallOp::Register, json!({"name": "alpha"}));
    assert_eq!(first["success"], true);

    // Idempotent for the same agent.
    let again = call(&mut svc, 1, SyscallOp::Register, json!({"name": "alpha"}));
    assert_eq!(again["success"], true);

    // A different agent cannot take the name.
    let stolen = call(&mut svc, 2, SyscallOp::Register, json!({"name": "alpha"}));
    assert_eq!(stolen["success"], false);
    assert!(stolen["error"]
        .as_str()
        .unwrap()
        .contains("already registered"));
}

#[test]
fn ttl_expiry_hides_key_from_fetch_and_keys() {
    let mut svc = services();
    let stored = call(
        &mut svc,
        1,
        SyscallOp::Store,
        json!({"key": "ephemeral", "value": 1, "scope": "global", "ttl": 0}),
    );
    assert_eq!(stored["success"], true);
    std::thread::sleep(std::time::Duration::from_millis(20));

    let fetched = call(&mut svc, 2, SyscallOp::Fetch, json!({"key": "ephemeral"}));
    assert_eq!(fetched["exists"], false);

    let keys = call(&mut svc, 2, SyscallOp::Keys, json!({}));
    assert!(keys["keys"].as_array().unwrap().is_empty());
}

#[test]
fn subscription_fairness_events_arrive_in_emit_order() {
    let mut svc = services();
    call(
        &mut svc,
        1,
        SyscallOp::Subscribe,
        json!({"event_types": ["CUSTOM", "STATE_CHANGED"]}),
    );

    call(
        &mut svc,
        2,
        SyscallOp::Emit,
        json!({"event_type": "CUSTOM", "data": {"seq": 1}}),
    );
    // A global store emits STATE_CHANGED between the two customs.
    call(
        &mut svc,
        2,
        SyscallOp::Store,
        json!({"key": "k", "value": true, "scope": "global"}),
    );
    call(
        &mut svc,
        2,
        SyscallOp::Emit,
        json!({"event_type": "CUSTOM", "data": {"seq": 2}}),
    );

    let polled = call(&mut svc, 1, SyscallOp::PollEvents, json!({"max": 10}));
    let events = polled["events"].as_array().unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0]["type"], "CUSTOM");
    assert_eq!(events[0]["data"]["seq"], 1);
    assert_eq!(events[1]["type"], "STATE_CHANGED");
    assert_eq!(events[2]["data"]["seq"], 2);
}

#[test]
fn broadcast_counts_registered_recipients() {
    let mut svc = services();
    call(&mut svc, 1, SyscallOp::Register, json!({"name": "a"}));
    call(&mut svc, 2, SyscallOp::Register, json!({"name": "b"}));
    call(&mut svc, 3, SyscallOp::Register, json!({"name": "c"}));

    let sent = call(
        &mut svc,
        1,
        SyscallOp::Broadcast,
        json!({"message": {"hello": true}}),
    );
    assert_eq!(sent["delivered_count"], 2);

    let received = call(&mut svc, 2, SyscallOp::Recv, json!({"max": 10}));
    assert_eq!(received["count"], 1);
    assert_eq!(received["messages"][0]["from_name"], "a");
}

#[test]
fn audit_log_round_trip_over_syscalls() {
    let mut svc = services();
    // Generate one SECURITY entry.
    call(
        &mut svc,
        7,
        SyscallOp::Exec,
        json!({"command": "sudo reboot"}),
    );

    let log = call(
        &mut svc,
        1,
        SyscallOp::GetAuditLog,
        json!({"category": "SECURITY", "limit": 10}),
    );
    assert_eq!(log["success"], true);
    assert!(log["count"].as_u64().unwrap() >= 1);
    let entry = &log["entries"][0];
    assert_eq!(entry["category"], "SECURITY");
    assert_eq!(entry["agent_id"], 7);
    assert_eq!(entry["success"], false);

    // Toggle a category through SET_AUDIT_CONFIG and confirm it reports.
    let config = call(
        &mut svc,
        1,
        SyscallOp::SetAuditConfig,
        json!({"categories": {"IPC": true}}),
    );
    assert_eq!(config["config"]["categories"]["IPC"], true);
}

#[test]
fn record_replay_cycle_over_syscalls() {
    let mut svc = services();
    call(&mut svc, 1, SyscallOp::RecordStart, json!({}));
    call(
        &mut svc,
        1,
        SyscallOp::Store,
        json!({"key": "a", "value": 1}),
    );
    call(
        &mut svc,
        1,
        SyscallOp::Send,
        json!({"to": 2, "message": {"x": 1}}),
    );
    let stopped = call(&mut svc, 1, SyscallOp::RecordStop, json!({"export": true}));
    assert_eq!(stopped["success"], true);
    let recording = stopped["recording"].as_array().unwrap().clone();
    // RECORD_START itself is recorded along with STORE and SEND.
    assert_eq!(recording.len(), 3);

    let started = call(
        &mut svc,
        1,
        SyscallOp::ReplayStart,
        json!({"recording": recording}),
    );
    assert_eq!(started["success"], true);
    assert_eq!(started["imported"], 3);

    let status = call(&mut svc, 1, SyscallOp::ReplayStatus, json!({}));
    assert_eq!(status["state"], "running");
    assert_eq!(status["total_entries"], 3);
}

#[test]
fn pause_resume_errors_name_the_problem() {
    let mut svc = services();
    let missing = call(&mut svc, 1, SyscallOp::Pause, json!({"id": 99}));
    assert_eq!(missing["success"], false);
    assert!(missing["error"].as_str().unwrap().contains("not found"));

    let missing = call(&mut svc, 1, SyscallOp::Resume, json!({"name": "ghost"}));
    assert_eq!(missing["success"], false);
}

#[test]
fn kill_unknown_agent_reports_not_killed() {
    let mut svc = services();
    let body = call(&mut svc, 1, SyscallOp::Kill, json!({"id": 1234}));
    assert_eq!(body["success"], true);
    assert_eq!(body["killed"], false);
}

#[test]
fn list_is_a_bare_array() {
    let mut svc = services();
    let frame = Frame::new(AgentId(1), SyscallOp::List, b"{}".to_vec());
    let response = dispatch(&mut svc, &frame);
    let body: Value = serde_json::from_slice(&response.payload).unwrap();
    assert!(body.is_array());
}

#[test]
fn world_snapshot_restore_over_syscalls() {
    let mut svc = services();
    let created = call(
        &mut svc,
        1,
        SyscallOp::WorldCreate,
        json!({
            "name": "research",
            "config": {"mounts": ["/sim"], "vfs": {"/sim/notes.md": "# notes"}},
        }),
    );
    let world_id = created["world_id"].as_str().unwrap().to_string();

    call(&mut svc, 1, SyscallOp::WorldJoin, json!({"world_id": &world_id}));
    call(
        &mut svc,
        1,
        SyscallOp::Write,
        json!({"path": "/sim/out.txt", "content": "data"}),
    );

    let snapshot = call(
        &mut svc,
        1,
        SyscallOp::WorldSnapshot,
        json!({"world_id": world_id}),
    );
    let restored = call(
        &mut svc,
        1,
        SyscallOp::WorldRestore,
        json!({"snapshot": snapshot["snapshot"], "new_world_id": "world-rt"}),
    );
    assert_eq!(restored["success"], true);

    let state = call(
        &mut svc,
        1,
        SyscallOp::WorldState,
        json!({"world_id": "world-rt"}),
    );
    assert_eq!(state["state"]["vfs_entries"], 2);

    let listed = call(&mut svc, 1, SyscallOp::WorldList, json!({}));
    assert_eq!(listed["count"], 2);
}

#[test]
fn exec_timeout_is_reported() {
    let mut svc = services();
    let body = call(
        &mut svc,
        1,
        SyscallOp::Exec,
        json!({"command": "sleep 20", "timeout": 1}),
    );
    assert_eq!(body["success"], false);
    assert_eq!(body["exit_code"], -1);
    assert!(body["error"].as_str().unwrap().contains("timeout"));
}

#[test]
fn read_write_round_trip_on_real_files() {
    let mut svc = services();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("note.txt");
    let path_str = path.to_str().unwrap();

    let written = call(
        &mut svc,
        1,
        SyscallOp::Write,
        json!({"path": path_str, "content": "hello"}),
    );
    assert_eq!(written["success"], true);
    assert_eq!(written["bytes_written"], 5);

    let appended = call(
        &mut svc,
        1,
        SyscallOp::Write,
        json!({"path": path_str, "content": " world", "mode": "append"}),
    );
    assert_eq!(appended["success"], true);

    let read = call(&mut svc, 1, SyscallOp::Read, json!({"path": path_str}));
    assert_eq!(read["success"], true);
    assert_eq!(read["content"], "hello world");

    let missing = call(
        &mut svc,
        1,
        SyscallOp::Read,
        json!({"path": dir.path().join("absent").to_str().unwrap()}),
    );
    assert_eq!(missing["success"], false);
}

#[test]
fn readonly_preset_blocks_writes_via_set_perms() {
    let mut svc = services();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blocked.txt");

    call(
        &mut svc,
        1,
        SyscallOp::SetPerms,
        json!({"level": "readonly"}),
    );
    let denied = call(
        &mut svc,
        1,
        SyscallOp::Write,
        json!({"path": path.to_str().unwrap(), "content": "x"}),
    );
    assert_eq!(denied["success"], false);
    assert_eq!(denied["error"], "Permission denied: path not in whitelist");
    assert!(!path.exists());
}
