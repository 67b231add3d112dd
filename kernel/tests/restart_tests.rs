// Copyright (c) 2026 clove project
// SPDX-License-Identifier: AGPL-3.0

//! Restart subsystem end-to-end: spawn through the dispatcher, let the
//! agent die, and drive the reap/restart hooks the kernel loop runs every
//! tick. Event delivery is observed through the pub/sub syscalls.

use clove_kernel::application::dispatcher::{dispatch, KernelServices};
use clove_kernel::config::KernelConfig;
use clove_kernel::domain::agent::AgentId;
use clove_kernel::infrastructure::codec::{Frame, SyscallOp};
use serde_json::{json, Value};
use std::time::{Duration, Instant};

fn services() -> KernelServices {
    KernelServices::new(KernelConfig::default())
}

fn call(services: &mut KernelServices, caller: u32, op: SyscallOp, payload: Value) -> Value {
    let frame = Frame::new(AgentId(caller), op, serde_json::to_vec(&payload).unwrap());
    let response = dispatch(services, &frame);
    serde_json::from_slice(&response.payload).unwrap()
}

/// Run the kernel loop's per-tick supervision until the predicate holds or
/// the deadline passes.
fn tick_until(services: &mut KernelServices, deadline: Duration, mut done: impl FnMut(&KernelServices) -> bool) {
    let start = Instant::now();
    while start.elapsed() < deadline {
        let now = Instant::now();
        let reaped = services.supervisor.reap_and_restart(now);
        if !reaped.is_empty() {
            services.publish_supervisor_events(reaped);
        }
        let restarted = services
            .supervisor
            .process_pending_restarts(now, &mut services.ids);
        if !restarted.is_empty() {
            services.publish_supervisor_events(restarted);
        }
        if done(services) {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn spawn_failing_agent(services: &mut KernelServices, observer: u32, spawner: u32) {
    call(
        services,
        observer,
        SyscallOp::Subscribe,
        json!({"event_types": [
            "AGENT_SPAWNED", "AGENT_EXITED", "AGENT_RESTARTING", "AGENT_ESCALATED"
        ]}),
    );
    call(
        services,
        spawner,
        SyscallOp::SetPerms,
        json!({"permissions": {"can_spawn": true}}),
    );
    let spawned = call(
        services,
        spawner,
        SyscallOp::Spawn,
        json!({
            "name": "crasher",
            "script": "ignored",
            "interpreter": "/bin/false",
            "sandboxed": false,
            "restart_policy": "on_failure",
            "max_restarts": 2,
            "restart_window": 300,
            "backoff_initial_ms": 20,
            "backoff_multiplier": 2.0,
        }),
    );
    assert_eq!(spawned["success"], true, "spawn failed: {spawned}");
    assert_eq!(spawned["status"], "running");
    assert_eq!(spawned["restart_policy"], "on_failure");
}

#[test]
fn on_failure_agent_restarts_then_escalates() {
    let mut svc = services();
    spawn_failing_agent(&mut svc, 9, 1);

    // Budget of 2 restarts, then exactly one escalation.
    tick_until(&mut svc, Duration::from_secs(20), |svc| {
        svc.supervisor
            .restart_state("crasher")
            .is_some_and(|s| s.escalated)
    });

    let state = svc.supervisor.restart_state("crasher").expect("state kept");
    assert!(state.escalated);
    assert_eq!(state.count, 2, "restart bound held within the window");

    let polled = call(&mut svc, 9, SyscallOp::PollEvents, json!({"max": 100}));
    let events = polled["events"].as_array().unwrap();

    let restarting = events.iter().filter(|e| e["type"] == "AGENT_RESTARTING").count();
    let escalated = events.iter().filter(|e| e["type"] == "AGENT_ESCALATED").count();
    let exited = events.iter().filter(|e| e["type"] == "AGENT_EXITED").count();
    assert_eq!(restarting, 2);
    assert_eq!(escalated, 1, "exactly one escalation event");
    assert!(exited >= 3, "initial death plus each restarted death");

    // After escalation the scheduler stays quiet.
    let pending_before = svc.supervisor.pending_restart_count();
    tick_until(&mut svc, Duration::from_millis(300), |_| false);
    assert_eq!(svc.supervisor.pending_restart_count(), pending_before);
    assert!(svc.supervisor.get_by_name("crasher").is_none());
}

#[test]
fn backoff_delays_follow_the_curve() {
    let mut svc = services();
    spawn_failing_agent(&mut svc, 9, 1);

    tick_until(&mut svc, Duration::from_secs(20), |svc| {
        svc.supervisor
            .restart_state("crasher")
            .is_some_and(|s| s.escalated)
    });

    let polled = call(&mut svc, 9, SyscallOp::PollEvents, json!({"max": 100}));
    let delays: Vec<u64> = polled["events"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|e| e["type"] == "AGENT_RESTARTING")
        .map(|e| e["data"]["delay_ms"].as_u64().unwrap())
        .collect();
    // d_k = initial * multiplier^(k-1)
    assert_eq!(delays, vec![20, 40]);
}

#[test]
fn exited_agent_with_never_policy_is_dropped() {
    let mut svc = services();
    call(
        &mut svc,
        1,
        SyscallOp::SetPerms,
        json!({"permissions": {"can_spawn": true}}),
    );
    let spawned = call(
        &mut svc,
        1,
        SyscallOp::Spawn,
        json!({
            "name": "oneshot",
            "script": "ignored",
            "interpreter": "/bin/true",
            "sandboxed": false,
        }),
    );
    assert_eq!(spawned["success"], true);

    tick_until(&mut svc, Duration::from_secs(10), |svc| {
        svc.supervisor.get_by_name("oneshot").is_none()
    });
    assert!(svc.supervisor.get_by_name("oneshot").is_none());
    assert!(svc.supervisor.restart_state("oneshot").is_none());
    assert_eq!(svc.supervisor.pending_restart_count(), 0);

    // LIST no longer contains it.
    let frame = Frame::new(AgentId(1), SyscallOp::List, b"{}".to_vec());
    let response = dispatch(&mut svc, &frame);
    let list: Value = serde_json::from_slice(&response.payload).unwrap();
    assert!(list.as_array().unwrap().is_empty());
}

#[test]
fn clean_exit_preserves_on_failure_restart_state() {
    let mut svc = services();
    call(
        &mut svc,
        9,
        SyscallOp::Subscribe,
        json!({"event_types": ["AGENT_RESTARTING"]}),
    );
    call(
        &mut svc,
        1,
        SyscallOp::SetPerms,
        json!({"permissions": {"can_spawn": true}}),
    );

    // A script whose exit code flips by run: the first run fails, the
    // second exits cleanly, every later run fails again.
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("runs");
    let script = dir.path().join("flip.sh");
    std::fs::write(
        &script,
        format!(
            "c=0\n\
             [ -f {ctr} ] && c=$(cat {ctr})\n\
             c=$((c+1))\n\
             echo $c > {ctr}\n\
             [ \"$c\" -eq 2 ] && exit 0\n\
             exit 1\n",
            ctr = counter.display()
        ),
    )
    .unwrap();

    let spawn_payload = json!({
        "name": "phoenix",
        "script": script.to_str().unwrap(),
        "interpreter": "/bin/sh",
        "sandboxed": false,
        "restart_policy": "on_failure",
        "max_restarts": 5,
        "restart_window": 300,
        "backoff_initial_ms": 20,
        "backoff_multiplier": 2.0,
    });
    let spawned = call(&mut svc, 1, SyscallOp::Spawn, spawn_payload.clone());
    assert_eq!(spawned["success"], true, "spawn failed: {spawned}");

    // Run 1 fails and schedules a restart; the restarted run 2 exits
    // cleanly, so the supervisor drops the agent without restarting it.
    tick_until(&mut svc, Duration::from_secs(20), |svc| {
        svc.supervisor.get_by_name("phoenix").is_none()
            && svc.supervisor.pending_restart_count() == 0
            && svc
                .supervisor
                .restart_state("phoenix")
                .is_some_and(|s| s.count == 1)
    });

    // The clean exit must NOT have wiped the per-name bookkeeping.
    let state = svc
        .supervisor
        .restart_state("phoenix")
        .expect("restart state survives a clean exit");
    assert_eq!(state.count, 1);
    assert_eq!(state.consecutive_failures, 1);
    assert!(!state.escalated);

    // Respawning the same name inside the window picks the state back up:
    // run 3 fails and the backoff continues the curve instead of starting
    // over at the initial delay.
    let respawned = call(&mut svc, 1, SyscallOp::Spawn, spawn_payload);
    assert_eq!(respawned["success"], true, "respawn failed: {respawned}");

    tick_until(&mut svc, Duration::from_secs(20), |svc| {
        svc.supervisor
            .restart_state("phoenix")
            .is_some_and(|s| s.count >= 2)
    });

    let state = svc.supervisor.restart_state("phoenix").unwrap();
    assert_eq!(state.count, 2, "window budget carried across the clean exit");
    assert_eq!(state.consecutive_failures, 2);

    let polled = call(&mut svc, 9, SyscallOp::PollEvents, json!({"max": 100}));
    let delays: Vec<u64> = polled["events"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|e| e["type"] == "AGENT_RESTARTING")
        .map(|e| e["data"]["delay_ms"].as_u64().unwrap())
        .collect();
    assert_eq!(
        delays[..2],
        [20, 40],
        "backoff doubled after the clean exit, so consecutive_failures was kept"
    );
}

#[test]
fn spawned_then_killed_agent_never_restarts() {
    let mut svc = services();
    call(
        &mut svc,
        1,
        SyscallOp::SetPerms,
        json!({"permissions": {"can_spawn": true}}),
    );
    let spawned = call(
        &mut svc,
        1,
        SyscallOp::Spawn,
        json!({
            "name": "longrun",
            "script": "30",
            "interpreter": "/bin/sleep",
            "sandboxed": false,
            "restart_policy": "always",
        }),
    );
    assert_eq!(spawned["success"], true);
    let id = spawned["id"].as_u64().unwrap();

    let killed = call(&mut svc, 1, SyscallOp::Kill, json!({"id": id}));
    assert_eq!(killed["killed"], true);
    assert_eq!(killed["agent_id"], id);

    // An explicit kill forgets restart bookkeeping even for policy=always.
    tick_until(&mut svc, Duration::from_millis(300), |_| false);
    assert!(svc.supervisor.get_by_name("longrun").is_none());
    assert_eq!(svc.supervisor.pending_restart_count(), 0);
}
