// Copyright (c) 2026 clove project
// SPDX-License-Identifier: AGPL-3.0

//! Agent identity, lifecycle state and restart policy.
//!
//! An agent is a child process managed by the kernel. Ids are 32-bit,
//! globally monotonic within a kernel lifetime and never reused; id 0 is the
//! kernel itself. Lifecycle:
//! `Created → Starting → (Running ↔ Paused) → Stopping → Stopped | Failed`.
//! Only `Stopped` or `Failed` agents may be purged or restarted.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Unique agent identifier. Zero means "the kernel itself".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub u32);

impl AgentId {
    pub const KERNEL: AgentId = AgentId(0);

    pub fn is_kernel(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Created,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Failed,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Created => "created",
            AgentState::Starting => "starting",
            AgentState::Running => "running",
            AgentState::Paused => "paused",
            AgentState::Stopping => "stopping",
            AgentState::Stopped => "stopped",
            AgentState::Failed => "failed",
        }
    }

    /// Whether the agent may be purged or handed to the restart scheduler.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentState::Stopped | AgentState::Failed)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource limits applied through cgroups v2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// memory.max in bytes
    pub memory_limit_bytes: u64,
    /// Relative CPU weight on the legacy 2..262144 "shares" scale; converted
    /// to cpu.weight as `clamp(shares * 100 / 1024, 1, 10000)`
    pub cpu_shares: u64,
    /// cpu.max quota in microseconds per period
    pub cpu_quota_us: u64,
    /// cpu.max period in microseconds
    pub cpu_period_us: u64,
    /// pids.max
    pub max_pids: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_limit_bytes: 256 * 1024 * 1024,
            cpu_shares: 1024,
            cpu_quota_us: 100_000,
            cpu_period_us: 100_000,
            max_pids: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Drop the agent on death; forget its restart state and saved config.
    #[default]
    Never,
    /// Restart regardless of exit code.
    Always,
    /// Restart only when the exit code is non-zero.
    OnFailure,
}

impl RestartPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartPolicy::Never => "never",
            RestartPolicy::Always => "always",
            RestartPolicy::OnFailure => "on_failure",
        }
    }

    pub fn parse(s: &str) -> Option<RestartPolicy> {
        match s {
            "never" => Some(RestartPolicy::Never),
            "always" => Some(RestartPolicy::Always),
            "on_failure" | "on-failure" => Some(RestartPolicy::OnFailure),
            _ => None,
        }
    }
}

/// Restart budget and backoff curve for one agent name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartConfig {
    pub policy: RestartPolicy,
    /// Maximum starts within one window before escalation.
    pub max_restarts: u32,
    /// Window length in seconds; expiry resets the budget and the backoff.
    pub restart_window_sec: u64,
    pub backoff_initial_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_max_ms: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            policy: RestartPolicy::Never,
            max_restarts: 5,
            restart_window_sec: 300,
            backoff_initial_ms: 1_000,
            backoff_multiplier: 2.0,
            backoff_max_ms: 60_000,
        }
    }
}

impl RestartConfig {
    /// Delay before the k-th consecutive restart:
    /// `min(max, initial * multiplier^consecutive_failures)`, floored at the
    /// initial delay.
    pub fn backoff_delay_ms(&self, consecutive_failures: u32) -> u64 {
        let mut delay = self.backoff_initial_ms as f64;
        for _ in 0..consecutive_failures {
            delay *= self.backoff_multiplier;
            if delay >= self.backoff_max_ms as f64 {
                return self.backoff_max_ms;
            }
        }
        (delay as u64).max(self.backoff_initial_ms)
    }
}

/// Per-name restart bookkeeping. Persists across agent death; only window
/// expiry resets it. `consecutive_failures` is deliberately NOT reset on a
/// successful start, so a flapping agent keeps climbing the backoff curve
/// within one window.
#[derive(Debug)]
pub struct RestartState {
    pub count: u32,
    pub window_start: Instant,
    pub consecutive_failures: u32,
    pub escalated: bool,
}

impl RestartState {
    pub fn new(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
            consecutive_failures: 0,
            escalated: false,
        }
    }

    pub fn reset_window(&mut self, now: Instant) {
        self.window_start = now;
        self.count = 0;
        self.consecutive_failures = 0;
        self.escalated = false;
    }
}

/// Everything needed to start (or restart) an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    /// Path to the agent script.
    pub script_path: String,
    /// Interpreter the script is handed to.
    pub interpreter: String,
    /// Kernel socket the agent connects back to; passed as the script's
    /// first argument.
    pub socket_path: String,
    pub limits: ResourceLimits,
    pub sandboxed: bool,
    pub enable_network: bool,
    pub restart: RestartConfig,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>, script_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script_path: script_path.into(),
            interpreter: "python3".to_string(),
            socket_path: String::new(),
            limits: ResourceLimits::default(),
            sandboxed: true,
            enable_network: false,
            restart: RestartConfig::default(),
        }
    }
}

/// Point-in-time resource and activity snapshot for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub id: AgentId,
    pub name: String,
    pub pid: i32,
    pub state: AgentState,
    pub memory_bytes: u64,
    pub pids_current: u64,
    pub cpu_usage_us: u64,
    pub uptime_seconds: u64,
    pub llm_calls: u64,
    pub llm_tokens: u64,
    pub parent_id: AgentId,
    pub child_ids: Vec<AgentId>,
    pub created_at_ms: i64,
}
