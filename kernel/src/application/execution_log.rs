// Copyright (c) 2026 clove project
// SPDX-License-Identifier: AGPL-3.0

//! Deterministic syscall recording and cursor-based replay.
//!
//! Recording captures the deterministic subset of syscalls: read-only
//! syscalls never record, and the non-deterministic trio (THINK, HTTP, EXEC)
//! records only when its `include_*` flag is set. Replay only surfaces
//! entries through an explicit cursor; the driver decides how to re-inject
//! them.
//!
//! State machines:
//! recording `Idle → Recording ↔ Paused → Idle`;
//! replay `Idle → Running ↔ Paused → Completed | Error`.

use crate::domain::agent::AgentId;
use crate::infrastructure::codec::SyscallOp;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Idle,
    Recording,
    Paused,
}

impl RecordingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordingState::Idle => "idle",
            RecordingState::Recording => "recording",
            RecordingState::Paused => "paused",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayState {
    Idle,
    Running,
    Paused,
    Completed,
    Error,
}

impl ReplayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplayState::Idle => "idle",
            ReplayState::Running => "running",
            ReplayState::Paused => "paused",
            ReplayState::Completed => "completed",
            ReplayState::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordingConfig {
    pub max_entries: usize,
    pub include_think: bool,
    pub include_http: bool,
    pub include_exec: bool,
    /// Only record these agents; empty records everyone.
    pub filter_agents: Vec<AgentId>,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            max_entries: 50_000,
            include_think: false,
            include_http: false,
            include_exec: false,
            filter_agents: Vec::new(),
        }
    }
}

impl RecordingConfig {
    pub fn from_json(payload: &Value) -> Self {
        let mut config = Self::default();
        if let Some(n) = payload.get("max_entries").and_then(Value::as_u64) {
            config.max_entries = (n as usize).max(1);
        }
        if let Some(b) = payload.get("include_think").and_then(Value::as_bool) {
            config.include_think = b;
        }
        if let Some(b) = payload.get("include_http").and_then(Value::as_bool) {
            config.include_http = b;
        }
        if let Some(b) = payload.get("include_exec").and_then(Value::as_bool) {
            config.include_exec = b;
        }
        if let Some(agents) = payload.get("filter_agents").and_then(Value::as_array) {
            config.filter_agents = agents
                .iter()
                .filter_map(Value::as_u64)
                .map(|id| AgentId(id as u32))
                .collect();
        }
        config
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionEntry {
    pub sequence_id: u64,
    pub timestamp: DateTime<Utc>,
    pub agent_id: AgentId,
    pub opcode: u8,
    pub payload: String,
    pub response: String,
    pub duration_us: u64,
    pub success: bool,
}

impl ExecutionEntry {
    pub fn to_json(&self) -> Value {
        json!({
            "sequence_id": self.sequence_id,
            "ts": self.timestamp.to_rfc3339(),
            "agent_id": self.agent_id,
            "opcode": self.opcode,
            "opcode_name": SyscallOp::name(self.opcode),
            "payload": self.payload,
            "response": self.response,
            "duration_us": self.duration_us,
            "success": self.success,
        })
    }

    pub fn from_json(v: &Value) -> Option<ExecutionEntry> {
        Some(ExecutionEntry {
            sequence_id: v.get("sequence_id")?.as_u64()?,
            timestamp: v
                .get("ts")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(Utc::now),
            agent_id: AgentId(v.get("agent_id")?.as_u64()? as u32),
            opcode: v.get("opcode")?.as_u64()? as u8,
            payload: v.get("payload")?.as_str()?.to_string(),
            response: v.get("response")?.as_str()?.to_string(),
            duration_us: v.get("duration_us").and_then(Value::as_u64).unwrap_or(0),
            success: v.get("success").and_then(Value::as_bool).unwrap_or(true),
        })
    }
}

/// Read-only syscalls that never produce an execution entry.
fn is_read_only(opcode: u8) -> bool {
    matches!(
        SyscallOp::from_u8(opcode),
        Some(
            SyscallOp::List
                | SyscallOp::GetPerms
                | SyscallOp::Keys
                | SyscallOp::PollEvents
                | SyscallOp::MetricsSystem
                | SyscallOp::MetricsAgent
                | SyscallOp::MetricsAllAgents
                | SyscallOp::MetricsCgroup
                | SyscallOp::GetAuditLog
                | SyscallOp::TunnelStatus
                | SyscallOp::TunnelListRemotes
                | SyscallOp::WorldList
                | SyscallOp::WorldState
        )
    )
}

pub struct ExecutionLogger {
    config: RecordingConfig,
    entries: VecDeque<ExecutionEntry>,
    recording_state: RecordingState,
    next_sequence_id: u64,

    replay_entries: Vec<ExecutionEntry>,
    replay_state: ReplayState,
    replay_index: usize,
    entries_replayed: u64,
    entries_skipped: u64,
    replay_error: Option<String>,
}

impl ExecutionLogger {
    pub fn new(config: RecordingConfig) -> Self {
        Self {
            config,
            entries: VecDeque::new(),
            recording_state: RecordingState::Idle,
            next_sequence_id: 1,
            replay_entries: Vec::new(),
            replay_state: ReplayState::Idle,
            replay_index: 0,
            entries_replayed: 0,
            entries_skipped: 0,
            replay_error: None,
        }
    }

    // --- recording -------------------------------------------------------

    pub fn recording_state(&self) -> RecordingState {
        self.recording_state
    }

    pub fn config(&self) -> &RecordingConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: RecordingConfig) {
        self.config = config;
    }

    pub fn start_recording(&mut self) -> bool {
        match self.recording_state {
            RecordingState::Idle | RecordingState::Paused => {
                self.recording_state = RecordingState::Recording;
                true
            }
            RecordingState::Recording => false,
        }
    }

    pub fn stop_recording(&mut self) -> bool {
        match self.recording_state {
            RecordingState::Recording | RecordingState::Paused => {
                self.recording_state = RecordingState::Idle;
                true
            }
            RecordingState::Idle => false,
        }
    }

    pub fn pause_recording(&mut self) -> bool {
        if self.recording_state == RecordingState::Recording {
            self.recording_state = RecordingState::Paused;
            true
        } else {
            false
        }
    }

    fn should_record(&self, agent_id: AgentId, opcode: u8) -> bool {
        if self.recording_state != RecordingState::Recording {
            return false;
        }
        if !self.config.filter_agents.is_empty()
            && !self.config.filter_agents.contains(&agent_id)
        {
            return false;
        }
        match SyscallOp::from_u8(opcode) {
            Some(SyscallOp::Think) if !self.config.include_think => return false,
            Some(SyscallOp::Http) if !self.config.include_http => return false,
            Some(SyscallOp::Exec) if !self.config.include_exec => return false,
            _ => {}
        }
        !is_read_only(opcode)
    }

    /// Append one syscall observation, applying the recording filter.
    pub fn log_syscall(
        &mut self,
        agent_id: AgentId,
        opcode: u8,
        payload: &str,
        response: &str,
        duration_us: u64,
        success: bool,
    ) {
        if !self.should_record(agent_id, opcode) {
            return;
        }
        if self.entries.len() >= self.config.max_entries {
            self.entries.pop_front();
        }
        let entry = ExecutionEntry {
            sequence_id: self.next_sequence_id,
            timestamp: Utc::now(),
            agent_id,
            opcode,
            payload: payload.to_string(),
            response: response.to_string(),
            duration_us,
            success,
        };
        self.next_sequence_id += 1;
        self.entries.push_back(entry);
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn last_sequence_id(&self) -> u64 {
        self.next_sequence_id - 1
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Export the recorded session as a JSON array.
    pub fn export_recording(&self) -> Value {
        Value::Array(self.entries.iter().map(ExecutionEntry::to_json).collect())
    }

    // --- replay ----------------------------------------------------------

    /// Replace the replay buffer with a previously exported session.
    pub fn import_recording(&mut self, data: &Value) -> Result<usize, String> {
        let array = data.as_array().ok_or("recording must be a JSON array")?;
        let mut imported = Vec::with_capacity(array.len());
        for (i, item) in array.iter().enumerate() {
            let entry = ExecutionEntry::from_json(item)
                .ok_or_else(|| format!("malformed entry at index {i}"))?;
            imported.push(entry);
        }
        self.replay_entries = imported;
        self.replay_state = ReplayState::Idle;
        self.replay_index = 0;
        self.entries_replayed = 0;
        self.entries_skipped = 0;
        self.replay_error = None;
        Ok(self.replay_entries.len())
    }

    pub fn replay_state(&self) -> ReplayState {
        self.replay_state
    }

    pub fn start_replay(&mut self) -> Result<(), String> {
        if self.replay_entries.is_empty() {
            self.replay_state = ReplayState::Error;
            let msg = "no recording imported".to_string();
            self.replay_error = Some(msg.clone());
            return Err(msg);
        }
        self.replay_state = ReplayState::Running;
        self.replay_index = 0;
        self.entries_replayed = 0;
        self.entries_skipped = 0;
        self.replay_error = None;
        Ok(())
    }

    pub fn pause_replay(&mut self) -> bool {
        if self.replay_state == ReplayState::Running {
            self.replay_state = ReplayState::Paused;
            true
        } else {
            false
        }
    }

    pub fn resume_replay(&mut self) -> bool {
        if self.replay_state == ReplayState::Paused {
            self.replay_state = ReplayState::Running;
            true
        } else {
            false
        }
    }

    pub fn stop_replay(&mut self) {
        self.replay_state = ReplayState::Idle;
        self.replay_index = 0;
    }

    /// Peek the entry under the cursor. Only surfaces entries; the caller
    /// decides how to re-inject them.
    pub fn next_replay_entry(&self) -> Option<&ExecutionEntry> {
        if self.replay_state != ReplayState::Running {
            return None;
        }
        self.replay_entries.get(self.replay_index)
    }

    /// Move the cursor forward; reaching the end completes the replay.
    pub fn advance_replay(&mut self, skipped: bool) {
        if self.replay_state != ReplayState::Running {
            return;
        }
        if skipped {
            self.entries_skipped += 1;
        } else {
            self.entries_replayed += 1;
        }
        self.replay_index += 1;
        if self.replay_index >= self.replay_entries.len() {
            self.replay_state = ReplayState::Completed;
        }
    }

    pub fn replay_progress(&self) -> Value {
        json!({
            "state": self.replay_state.as_str(),
            "total_entries": self.replay_entries.len(),
            "current_entry": self.replay_index,
            "entries_replayed": self.entries_replayed,
            "entries_skipped": self.entries_skipped,
            "last_error": self.replay_error,
        })
    }

    pub fn recording_status(&self) -> Value {
        json!({
            "state": self.recording_state.as_str(),
            "entry_count": self.entries.len(),
            "last_sequence_id": self.last_sequence_id(),
            "include_think": self.config.include_think,
            "include_http": self.config.include_http,
            "include_exec": self.config.include_exec,
            "filter_agents": self.config.filter_agents,
        })
    }
}

impl Default for ExecutionLogger {
    fn default() -> Self {
        Self::new(RecordingConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn log_one(logger: &mut ExecutionLogger, op: SyscallOp) {
        logger.log_syscall(AgentId(1), op as u8, "{}", "{}", 5, true);
    }

    #[test]
    fn idle_logger_records_nothing() {
        let mut logger = ExecutionLogger::default();
        log_one(&mut logger, SyscallOp::Store);
        assert_eq!(logger.entry_count(), 0);
    }

    #[test]
    fn read_only_syscalls_never_record() {
        let mut logger = ExecutionLogger::default();
        logger.start_recording();
        log_one(&mut logger, SyscallOp::List);
        log_one(&mut logger, SyscallOp::GetPerms);
        log_one(&mut logger, SyscallOp::Keys);
        log_one(&mut logger, SyscallOp::PollEvents);
        log_one(&mut logger, SyscallOp::MetricsSystem);
        assert_eq!(logger.entry_count(), 0);

        log_one(&mut logger, SyscallOp::Store);
        assert_eq!(logger.entry_count(), 1);
    }

    #[test]
    fn non_deterministic_syscalls_need_opt_in() {
        let mut logger = ExecutionLogger::default();
        logger.start_recording();
        log_one(&mut logger, SyscallOp::Think);
        log_one(&mut logger, SyscallOp::Http);
        log_one(&mut logger, SyscallOp::Exec);
        assert_eq!(logger.entry_count(), 0);

        let mut config = RecordingConfig::default();
        config.include_think = true;
        logger.set_config(config);
        log_one(&mut logger, SyscallOp::Think);
        log_one(&mut logger, SyscallOp::Http);
        assert_eq!(logger.entry_count(), 1);
    }

    #[test]
    fn agent_filter_limits_recording() {
        let mut config = RecordingConfig::default();
        config.filter_agents = vec![AgentId(7)];
        let mut logger = ExecutionLogger::new(config);
        logger.start_recording();
        logger.log_syscall(AgentId(1), SyscallOp::Store as u8, "{}", "{}", 1, true);
        logger.log_syscall(AgentId(7), SyscallOp::Store as u8, "{}", "{}", 1, true);
        assert_eq!(logger.entry_count(), 1);
    }

    #[test]
    fn pause_suspends_recording() {
        let mut logger = ExecutionLogger::default();
        logger.start_recording();
        log_one(&mut logger, SyscallOp::Store);
        assert!(logger.pause_recording());
        log_one(&mut logger, SyscallOp::Store);
        assert_eq!(logger.entry_count(), 1);
        // Resume via start (Paused → Recording).
        assert!(logger.start_recording());
        log_one(&mut logger, SyscallOp::Store);
        assert_eq!(logger.entry_count(), 2);
    }

    #[test]
    fn export_import_replay_cursor() {
        let mut logger = ExecutionLogger::default();
        logger.start_recording();
        log_one(&mut logger, SyscallOp::Store);
        log_one(&mut logger, SyscallOp::Send);
        log_one(&mut logger, SyscallOp::Register);
        logger.stop_recording();

        let exported = logger.export_recording();
        let count = logger.import_recording(&exported).unwrap();
        assert_eq!(count, 3);

        logger.start_replay().unwrap();
        assert_eq!(logger.replay_state(), ReplayState::Running);

        let first = logger.next_replay_entry().unwrap();
        assert_eq!(first.opcode, SyscallOp::Store as u8);
        logger.advance_replay(false);
        logger.advance_replay(true);
        logger.advance_replay(false);
        assert_eq!(logger.replay_state(), ReplayState::Completed);

        let progress = logger.replay_progress();
        assert_eq!(progress["entries_replayed"], 2);
        assert_eq!(progress["entries_skipped"], 1);
        assert_eq!(progress["state"], "completed");
    }

    #[test]
    fn replay_without_import_errors() {
        let mut logger = ExecutionLogger::default();
        assert!(logger.start_replay().is_err());
        assert_eq!(logger.replay_state(), ReplayState::Error);
    }

    #[test]
    fn malformed_import_is_rejected() {
        let mut logger = ExecutionLogger::default();
        assert!(logger.import_recording(&json!({"not": "array"})).is_err());
        assert!(logger
            .import_recording(&json!([{"sequence_id": 1}]))
            .is_err());
    }
}
