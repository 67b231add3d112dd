// Copyright (c) 2026 clove project
// SPDX-License-Identifier: AGPL-3.0

//! Agent supervisor: identity, lifecycle, dead-process reaping and the
//! restart scheduler.
//!
//! Agents are shared `Rc<RefCell<_>>` records because the id map, the name
//! map and the pending-restart queue may all refer to one agent. Restart
//! bookkeeping is per NAME and survives agent death: within one restart
//! window at most `max_restarts` starts happen, the backoff delay grows
//! exponentially with consecutive failures, and the budget-exceeding death
//! emits exactly one escalation. `consecutive_failures` is NOT reset by a
//! successful start; only window expiry resets it, which preserves the
//! backoff curve for an agent that keeps flapping inside one window.

use crate::domain::agent::{
    AgentConfig, AgentId, AgentMetrics, AgentState, RestartConfig, RestartPolicy, RestartState,
};
use crate::error::KernelError;
use crate::infrastructure::metrics;
use crate::infrastructure::sandbox::{Sandbox, SandboxConfig};
use crate::infrastructure::socket_server::AgentIdAllocator;
use chrono::Utc;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug)]
pub struct Agent {
    pub id: AgentId,
    pub config: AgentConfig,
    pub state: AgentState,
    pub sandbox: Sandbox,
    pub exit_code: Option<i32>,
    pub parent_id: AgentId,
    pub child_ids: Vec<AgentId>,
    pub llm_calls: u64,
    pub llm_tokens: u64,
    pub created_at_ms: i64,
    pub started_at: Instant,
}

impl Agent {
    pub fn pid(&self) -> i32 {
        self.sandbox.pid().unwrap_or(-1)
    }

    pub fn record_llm_call(&mut self, tokens: u64) {
        self.llm_calls += 1;
        self.llm_tokens += tokens;
    }

    pub fn metrics(&self) -> AgentMetrics {
        let cgroup = self.sandbox.cgroup_path();
        AgentMetrics {
            id: self.id,
            name: self.config.name.clone(),
            pid: self.pid(),
            state: self.state,
            memory_bytes: metrics::read_u64(&cgroup.join("memory.current")),
            pids_current: metrics::read_u64(&cgroup.join("pids.current")),
            cpu_usage_us: metrics::read_cpu_stat_usage(&cgroup.join("cpu.stat")),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            llm_calls: self.llm_calls,
            llm_tokens: self.llm_tokens,
            parent_id: self.parent_id,
            child_ids: self.child_ids.clone(),
            created_at_ms: self.created_at_ms,
        }
    }
}

pub type SharedAgent = Rc<RefCell<Agent>>;

/// A scheduled restart waiting for its backoff delay to elapse.
struct PendingRestart {
    name: String,
    scheduled_at: Instant,
    config: AgentConfig,
}

/// Lifecycle notifications handed back to the kernel loop, which turns them
/// into bus events and audit entries.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    Exited {
        id: AgentId,
        name: String,
        exit_code: i32,
    },
    Restarting {
        name: String,
        attempt: u32,
        max_restarts: u32,
        delay_ms: u64,
        exit_code: i32,
    },
    Escalated {
        name: String,
        restarts: u32,
        exit_code: i32,
    },
    Restarted {
        name: String,
        id: AgentId,
        pid: i32,
    },
    RestartFailed {
        name: String,
        error: String,
    },
}

pub struct Supervisor {
    by_id: HashMap<AgentId, SharedAgent>,
    by_name: HashMap<String, SharedAgent>,
    saved_configs: HashMap<String, AgentConfig>,
    restart_states: HashMap<String, RestartState>,
    pending_restarts: Vec<PendingRestart>,
    /// Kernel-level master switch; a false here downgrades every spawn to an
    /// unsandboxed fork regardless of the per-agent flag.
    sandboxing_enabled: bool,
}

impl Supervisor {
    pub fn new(sandboxing_enabled: bool) -> Self {
        Self {
            by_id: HashMap::new(),
            by_name: HashMap::new(),
            saved_configs: HashMap::new(),
            restart_states: HashMap::new(),
            pending_restarts: Vec::new(),
            sandboxing_enabled,
        }
    }

    pub fn get(&self, id: AgentId) -> Option<SharedAgent> {
        self.by_id.get(&id).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<SharedAgent> {
        self.by_name.get(name).cloned()
    }

    pub fn agents(&self) -> Vec<SharedAgent> {
        let mut all: Vec<SharedAgent> = self.by_id.values().cloned().collect();
        all.sort_by_key(|a| a.borrow().id);
        all
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Spawn a new agent. Names must be unique among live agents.
    pub fn spawn(
        &mut self,
        mut config: AgentConfig,
        parent_id: AgentId,
        ids: &mut AgentIdAllocator,
    ) -> Result<SharedAgent, KernelError> {
        if self.by_name.contains_key(&config.name) {
            return Err(KernelError::InvalidRequest(format!(
                "agent '{}' already exists",
                config.name
            )));
        }
        if config.script_path.is_empty() {
            return Err(KernelError::missing_field("script"));
        }
        config.sandboxed = config.sandboxed && self.sandboxing_enabled;

        let id = ids.next();
        let agent = self.start_agent(id, config.clone(), parent_id)?;

        if let Some(parent) = self.by_id.get(&parent_id) {
            parent.borrow_mut().child_ids.push(id);
        }

        // Keep what the restart scheduler needs, but only for restartable
        // policies.
        if config.restart.policy != RestartPolicy::Never {
            self.saved_configs.insert(config.name.clone(), config.clone());
            self.restart_states
                .entry(config.name.clone())
                .or_insert_with(|| RestartState::new(Instant::now()));
        }

        Ok(agent)
    }

    fn start_agent(
        &mut self,
        id: AgentId,
        config: AgentConfig,
        parent_id: AgentId,
    ) -> Result<SharedAgent, KernelError> {
        let sandbox_name = format!("{}_{}", config.name, id);
        let sandbox_config = if config.sandboxed {
            SandboxConfig::isolated(sandbox_name, config.limits.clone(), config.enable_network)
        } else {
            SandboxConfig::plain(sandbox_name)
        };
        let mut sandbox = Sandbox::new(sandbox_config);
        sandbox.create();

        let mut args = vec![config.script_path.clone()];
        if !config.socket_path.is_empty() {
            args.push(config.socket_path.clone());
        }
        info!(
            "starting agent {} (id={id}, interpreter={})",
            config.name, config.interpreter
        );
        sandbox
            .start(&config.interpreter, &args)
            .map_err(|e| KernelError::Backend(format!("failed to start agent: {e}")))?;

        let agent = Rc::new(RefCell::new(Agent {
            id,
            state: AgentState::Running,
            sandbox,
            exit_code: None,
            parent_id,
            child_ids: Vec::new(),
            llm_calls: 0,
            llm_tokens: 0,
            created_at_ms: Utc::now().timestamp_millis(),
            started_at: Instant::now(),
            config,
        }));
        let name = agent.borrow().config.name.clone();
        self.by_id.insert(id, agent.clone());
        self.by_name.insert(name, agent.clone());
        Ok(agent)
    }

    fn resolve(&self, id: Option<AgentId>, name: Option<&str>) -> Option<SharedAgent> {
        if let Some(id) = id {
            return self.get(id);
        }
        name.and_then(|n| self.get_by_name(n))
    }

    /// Stop and remove an agent. An explicit kill also forgets the restart
    /// state so the scheduler does not resurrect it.
    pub fn kill(&mut self, id: Option<AgentId>, name: Option<&str>) -> Option<AgentId> {
        let agent = self.resolve(id, name)?;
        let (agent_id, agent_name) = {
            let mut inner = agent.borrow_mut();
            inner.state = AgentState::Stopping;
            let _ = inner.sandbox.stop(5_000);
            inner.exit_code = inner.sandbox.exit_code();
            inner.state = AgentState::Stopped;
            (inner.id, inner.config.name.clone())
        };
        self.by_id.remove(&agent_id);
        self.by_name.remove(&agent_name);
        self.saved_configs.remove(&agent_name);
        self.restart_states.remove(&agent_name);
        self.pending_restarts.retain(|p| p.name != agent_name);
        info!("agent {agent_name} killed (id={agent_id})");
        Some(agent_id)
    }

    pub fn pause(&mut self, id: Option<AgentId>, name: Option<&str>) -> Result<AgentId, KernelError> {
        let agent = self
            .resolve(id, name)
            .ok_or_else(|| KernelError::NotFound("agent not found".to_string()))?;
        let mut inner = agent.borrow_mut();
        if inner.state != AgentState::Running {
            return Err(KernelError::InvalidRequest(format!(
                "agent '{}' is not running",
                inner.config.name
            )));
        }
        inner
            .sandbox
            .pause()
            .map_err(|e| KernelError::Backend(format!("pause failed: {e}")))?;
        inner.state = AgentState::Paused;
        Ok(inner.id)
    }

    pub fn resume(&mut self, id: Option<AgentId>, name: Option<&str>) -> Result<AgentId, KernelError> {
        let agent = self
            .resolve(id, name)
            .ok_or_else(|| KernelError::NotFound("agent not found".to_string()))?;
        let mut inner = agent.borrow_mut();
        if inner.state != AgentState::Paused {
            return Err(KernelError::InvalidRequest(format!(
                "agent '{}' is not paused",
                inner.config.name
            )));
        }
        inner
            .sandbox
            .resume()
            .map_err(|e| KernelError::Backend(format!("resume failed: {e}")))?;
        inner.state = AgentState::Running;
        Ok(inner.id)
    }

    /// Collect dead agents and evaluate their restart policy. Called from
    /// the main loop after every reactor tick.
    pub fn reap_and_restart(&mut self, now: Instant) -> Vec<SupervisorEvent> {
        let mut events = Vec::new();

        let dead: Vec<(AgentId, String, i32)> = self
            .by_id
            .values()
            .filter_map(|agent| {
                let mut inner = agent.borrow_mut();
                let was_live = matches!(inner.state, AgentState::Running | AgentState::Paused);
                if was_live && !inner.sandbox.is_running() {
                    let code = inner.sandbox.exit_code().unwrap_or(-1);
                    inner.exit_code = Some(code);
                    inner.state = if code == 0 {
                        AgentState::Stopped
                    } else {
                        AgentState::Failed
                    };
                    Some((inner.id, inner.config.name.clone(), code))
                } else {
                    None
                }
            })
            .collect();

        for (id, name, exit_code) in dead {
            warn!("agent {name} died (id={id}, exit_code={exit_code})");
            self.by_id.remove(&id);
            self.by_name.remove(&name);
            events.push(SupervisorEvent::Exited {
                id,
                name: name.clone(),
                exit_code,
            });

            let Some(config) = self.saved_configs.get(&name).cloned() else {
                debug!("agent {name} exited, no restart policy");
                continue;
            };

            let should_restart = match config.restart.policy {
                RestartPolicy::Always => true,
                RestartPolicy::OnFailure => exit_code != 0,
                RestartPolicy::Never => false,
            };
            if !should_restart {
                // Only a Never policy forgets the per-name bookkeeping. An
                // OnFailure agent that exited cleanly keeps its saved config
                // and restart state: count/window/consecutive_failures must
                // survive every death within the window, or a respawned name
                // could overrun its restart budget.
                if config.restart.policy == RestartPolicy::Never {
                    self.saved_configs.remove(&name);
                    self.restart_states.remove(&name);
                } else {
                    debug!(
                        "agent {name} exited with code {exit_code}, no restart; \
                         restart state kept for the window"
                    );
                }
                continue;
            }

            let state = self
                .restart_states
                .entry(name.clone())
                .or_insert_with(|| RestartState::new(now));

            if now.duration_since(state.window_start).as_secs() >= config.restart.restart_window_sec
            {
                debug!("agent {name} restart window reset");
                state.reset_window(now);
            }

            if state.count >= config.restart.max_restarts {
                if !state.escalated {
                    error!(
                        "agent {name} exceeded max_restarts ({}) within window, escalating",
                        config.restart.max_restarts
                    );
                    state.escalated = true;
                    events.push(SupervisorEvent::Escalated {
                        name: name.clone(),
                        restarts: state.count,
                        exit_code,
                    });
                }
                continue;
            }

            let delay_ms = config.restart.backoff_delay_ms(state.consecutive_failures);
            state.count += 1;
            state.consecutive_failures += 1;
            info!(
                "agent {name} will restart in {delay_ms}ms (attempt {}/{})",
                state.count, config.restart.max_restarts
            );
            events.push(SupervisorEvent::Restarting {
                name: name.clone(),
                attempt: state.count,
                max_restarts: config.restart.max_restarts,
                delay_ms,
                exit_code,
            });
            self.pending_restarts.push(PendingRestart {
                name,
                scheduled_at: now + Duration::from_millis(delay_ms),
                config,
            });
        }

        events
    }

    /// Start every pending restart whose backoff has elapsed.
    pub fn process_pending_restarts(
        &mut self,
        now: Instant,
        ids: &mut AgentIdAllocator,
    ) -> Vec<SupervisorEvent> {
        if self.pending_restarts.is_empty() {
            return Vec::new();
        }
        let mut events = Vec::new();
        let due: Vec<PendingRestart> = {
            let mut still_pending = Vec::new();
            let mut due = Vec::new();
            for pending in self.pending_restarts.drain(..) {
                if now >= pending.scheduled_at {
                    due.push(pending);
                } else {
                    still_pending.push(pending);
                }
            }
            self.pending_restarts = still_pending;
            due
        };

        for pending in due {
            if self.by_name.contains_key(&pending.name) {
                events.push(SupervisorEvent::RestartFailed {
                    name: pending.name.clone(),
                    error: "name taken by another live agent".to_string(),
                });
                continue;
            }
            let id = ids.next();
            match self.start_agent(id, pending.config, AgentId::KERNEL) {
                Ok(agent) => {
                    let pid = agent.borrow().pid();
                    info!("agent {} restarted (new id={id}, pid={pid})", pending.name);
                    // consecutive_failures stays put on purpose; the next
                    // death inside this window keeps climbing the curve.
                    events.push(SupervisorEvent::Restarted {
                        name: pending.name,
                        id,
                        pid,
                    });
                }
                Err(e) => {
                    error!("failed to restart agent {}: {e}", pending.name);
                    events.push(SupervisorEvent::RestartFailed {
                        name: pending.name,
                        error: e.to_string(),
                    });
                }
            }
        }
        events
    }

    pub fn pending_restart_count(&self) -> usize {
        self.pending_restarts.len()
    }

    pub fn restart_state(&self, name: &str) -> Option<&RestartState> {
        self.restart_states.get(name)
    }

    /// Stop every agent; used during kernel shutdown.
    pub fn stop_all(&mut self) {
        info!("stopping all agents");
        for agent in self.by_id.values() {
            let mut inner = agent.borrow_mut();
            inner.state = AgentState::Stopping;
            let _ = inner.sandbox.stop(5_000);
            inner.state = AgentState::Stopped;
        }
        self.by_id.clear();
        self.by_name.clear();
        self.pending_restarts.clear();
    }

    /// Default restart config used when a SPAWN payload omits the knobs.
    pub fn restart_config_from_payload(payload: &serde_json::Value) -> RestartConfig {
        let mut restart = RestartConfig::default();
        if let Some(policy) = payload
            .get("restart_policy")
            .and_then(serde_json::Value::as_str)
            .and_then(RestartPolicy::parse)
        {
            restart.policy = policy;
        }
        if let Some(n) = payload.get("max_restarts").and_then(serde_json::Value::as_u64) {
            restart.max_restarts = n as u32;
        }
        if let Some(n) = payload
            .get("restart_window")
            .and_then(serde_json::Value::as_u64)
        {
            restart.restart_window_sec = n;
        }
        if let Some(n) = payload
            .get("backoff_initial_ms")
            .and_then(serde_json::Value::as_u64)
        {
            restart.backoff_initial_ms = n;
        }
        if let Some(m) = payload
            .get("backoff_multiplier")
            .and_then(serde_json::Value::as_f64)
        {
            restart.backoff_multiplier = m;
        }
        if let Some(n) = payload
            .get("backoff_max_ms")
            .and_then(serde_json::Value::as_u64)
        {
            restart.backoff_max_ms = n;
        }
        restart
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `/bin/false` as the "interpreter" gives a child that exits 1 almost
    /// immediately, without needing any script on disk.
    fn failing_config(name: &str, restart: RestartConfig) -> AgentConfig {
        let mut config = AgentConfig::new(name, "unused-script");
        config.interpreter = "/bin/false".to_string();
        config.sandboxed = false;
        config.restart = restart;
        config
    }

    fn sleeping_config(name: &str) -> AgentConfig {
        let mut config = AgentConfig::new(name, "30");
        config.interpreter = "/bin/sleep".to_string();
        config.sandboxed = false;
        config
    }

    fn wait_for_death(supervisor: &Supervisor, name: &str) {
        for _ in 0..100 {
            if let Some(agent) = supervisor.get_by_name(name) {
                if !agent.borrow_mut().sandbox.is_running() {
                    return;
                }
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn spawn_rejects_duplicate_names() {
        let mut supervisor = Supervisor::new(false);
        let mut ids = AgentIdAllocator::new();
        supervisor
            .spawn(sleeping_config("dup"), AgentId::KERNEL, &mut ids)
            .unwrap();
        let err = supervisor
            .spawn(sleeping_config("dup"), AgentId::KERNEL, &mut ids)
            .unwrap_err();
        assert!(matches!(err, KernelError::InvalidRequest(_)));
        supervisor.stop_all();
    }

    #[test]
    fn spawn_links_parent_and_child() {
        let mut supervisor = Supervisor::new(false);
        let mut ids = AgentIdAllocator::new();
        let parent = supervisor
            .spawn(sleeping_config("parent"), AgentId::KERNEL, &mut ids)
            .unwrap();
        let parent_id = parent.borrow().id;
        let child = supervisor
            .spawn(sleeping_config("child"), parent_id, &mut ids)
            .unwrap();
        assert_eq!(child.borrow().parent_id, parent_id);
        assert_eq!(parent.borrow().child_ids, vec![child.borrow().id]);
        supervisor.stop_all();
    }

    #[test]
    fn kill_forgets_restart_state() {
        let mut supervisor = Supervisor::new(false);
        let mut ids = AgentIdAllocator::new();
        let restart = RestartConfig {
            policy: RestartPolicy::Always,
            ..RestartConfig::default()
        };
        let mut config = sleeping_config("killme");
        config.restart = restart;
        supervisor.spawn(config, AgentId::KERNEL, &mut ids).unwrap();
        assert!(supervisor.restart_state("killme").is_some());

        let killed = supervisor.kill(None, Some("killme"));
        assert!(killed.is_some());
        assert!(supervisor.restart_state("killme").is_none());
        // Nothing left to reap or restart.
        assert!(supervisor.reap_and_restart(Instant::now()).is_empty());
        assert_eq!(supervisor.pending_restart_count(), 0);
    }

    #[test]
    fn on_failure_policy_schedules_restart_with_backoff() {
        let mut supervisor = Supervisor::new(false);
        let mut ids = AgentIdAllocator::new();
        let restart = RestartConfig {
            policy: RestartPolicy::OnFailure,
            max_restarts: 2,
            restart_window_sec: 300,
            backoff_initial_ms: 100,
            backoff_multiplier: 2.0,
            backoff_max_ms: 10_000,
        };
        supervisor
            .spawn(failing_config("flappy", restart), AgentId::KERNEL, &mut ids)
            .unwrap();

        wait_for_death(&supervisor, "flappy");
        let events = supervisor.reap_and_restart(Instant::now());
        assert!(events
            .iter()
            .any(|e| matches!(e, SupervisorEvent::Exited { exit_code: 1, .. })));
        let delay = events
            .iter()
            .find_map(|e| match e {
                SupervisorEvent::Restarting { delay_ms, .. } => Some(*delay_ms),
                _ => None,
            })
            .expect("restart scheduled");
        assert_eq!(delay, 100, "first delay is the initial backoff");
        assert_eq!(supervisor.pending_restart_count(), 1);

        // Not due yet.
        let now = Instant::now();
        assert!(supervisor.process_pending_restarts(now, &mut ids).is_empty());

        // Due after the delay.
        let events =
            supervisor.process_pending_restarts(now + Duration::from_millis(150), &mut ids);
        assert!(events
            .iter()
            .any(|e| matches!(e, SupervisorEvent::Restarted { .. })));
        assert!(supervisor.get_by_name("flappy").is_some());
        supervisor.stop_all();
    }

    #[test]
    fn escalation_fires_once_after_budget_exhausted() {
        let mut supervisor = Supervisor::new(false);
        let mut ids = AgentIdAllocator::new();
        let restart = RestartConfig {
            policy: RestartPolicy::OnFailure,
            max_restarts: 2,
            restart_window_sec: 300,
            backoff_initial_ms: 1,
            backoff_multiplier: 2.0,
            backoff_max_ms: 10,
        };
        supervisor
            .spawn(failing_config("doomed", restart), AgentId::KERNEL, &mut ids)
            .unwrap();

        let mut escalations = 0;
        let mut restarts = 0;
        // Drive enough reap/restart rounds for the budget to run out.
        for _ in 0..8 {
            wait_for_death(&supervisor, "doomed");
            let now = Instant::now();
            for event in supervisor.reap_and_restart(now) {
                match event {
                    SupervisorEvent::Escalated { .. } => escalations += 1,
                    SupervisorEvent::Restarting { .. } => restarts += 1,
                    _ => {}
                }
            }
            supervisor.process_pending_restarts(now + Duration::from_millis(50), &mut ids);
        }

        assert_eq!(restarts, 2, "restart bound holds within the window");
        assert_eq!(escalations, 1, "exactly one escalation");
        let state = supervisor.restart_state("doomed").unwrap();
        assert!(state.escalated);
        supervisor.stop_all();
    }

    #[test]
    fn consecutive_failures_survive_successful_restart() {
        let mut supervisor = Supervisor::new(false);
        let mut ids = AgentIdAllocator::new();
        let restart = RestartConfig {
            policy: RestartPolicy::OnFailure,
            max_restarts: 5,
            restart_window_sec: 300,
            backoff_initial_ms: 1,
            backoff_multiplier: 2.0,
            backoff_max_ms: 1_000,
        };
        supervisor
            .spawn(failing_config("curve", restart), AgentId::KERNEL, &mut ids)
            .unwrap();

        wait_for_death(&supervisor, "curve");
        let now = Instant::now();
        supervisor.reap_and_restart(now);
        supervisor.process_pending_restarts(now + Duration::from_millis(20), &mut ids);
        let after_first = supervisor.restart_state("curve").unwrap().consecutive_failures;
        assert_eq!(after_first, 1);

        wait_for_death(&supervisor, "curve");
        let now = Instant::now();
        let events = supervisor.reap_and_restart(now);
        let delay = events
            .iter()
            .find_map(|e| match e {
                SupervisorEvent::Restarting { delay_ms, .. } => Some(*delay_ms),
                _ => None,
            })
            .unwrap();
        assert_eq!(delay, 2, "second delay doubled: the curve survived the successful start");
        supervisor.stop_all();
    }
}
