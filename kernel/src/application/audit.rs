// Copyright (c) 2026 clove project
// SPDX-License-Identifier: AGPL-3.0

//! Audit log: a bounded ring of categorised events for compliance and debug.
//!
//! Categories are individually switchable; a disabled category drops the log
//! call outright. Insert is O(1) and overflow pops the oldest entry. Entries
//! serialize as single-line JSON; the full log exports as JSONL.

use crate::domain::agent::AgentId;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditCategory {
    /// Permission denials, blocked commands.
    Security,
    /// Spawn, kill, pause, resume, restart.
    AgentLifecycle,
    /// Send, recv, broadcast, register.
    Ipc,
    /// Store, fetch, delete.
    StateStore,
    /// Quota exhaustion, resource warnings.
    Resource,
    /// Every syscall (verbose).
    Syscall,
    /// HTTP requests, tunnel events.
    Network,
    /// World simulation events.
    World,
}

impl AuditCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditCategory::Security => "SECURITY",
            AuditCategory::AgentLifecycle => "AGENT_LIFECYCLE",
            AuditCategory::Ipc => "IPC",
            AuditCategory::StateStore => "STATE_STORE",
            AuditCategory::Resource => "RESOURCE",
            AuditCategory::Syscall => "SYSCALL",
            AuditCategory::Network => "NETWORK",
            AuditCategory::World => "WORLD",
        }
    }

    pub fn parse(s: &str) -> Option<AuditCategory> {
        match s {
            "SECURITY" => Some(AuditCategory::Security),
            "AGENT_LIFECYCLE" => Some(AuditCategory::AgentLifecycle),
            "IPC" => Some(AuditCategory::Ipc),
            "STATE_STORE" => Some(AuditCategory::StateStore),
            "RESOURCE" => Some(AuditCategory::Resource),
            "SYSCALL" => Some(AuditCategory::Syscall),
            "NETWORK" => Some(AuditCategory::Network),
            "WORLD" => Some(AuditCategory::World),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub max_entries: usize,
    pub log_security: bool,
    pub log_lifecycle: bool,
    pub log_ipc: bool,
    pub log_state: bool,
    pub log_resource: bool,
    pub log_syscalls: bool,
    pub log_network: bool,
    pub log_world: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            log_security: true,
            log_lifecycle: true,
            log_ipc: false,
            log_state: false,
            log_resource: true,
            log_syscalls: false,
            log_network: false,
            log_world: false,
        }
    }
}

impl AuditConfig {
    pub fn is_enabled(&self, category: AuditCategory) -> bool {
        match category {
            AuditCategory::Security => self.log_security,
            AuditCategory::AgentLifecycle => self.log_lifecycle,
            AuditCategory::Ipc => self.log_ipc,
            AuditCategory::StateStore => self.log_state,
            AuditCategory::Resource => self.log_resource,
            AuditCategory::Syscall => self.log_syscalls,
            AuditCategory::Network => self.log_network,
            AuditCategory::World => self.log_world,
        }
    }

    /// Merge `{"categories": {"IPC": true, ...}, "max_entries": n}`.
    pub fn apply_json(&mut self, patch: &Value) {
        if let Some(n) = patch.get("max_entries").and_then(Value::as_u64) {
            self.max_entries = (n as usize).max(1);
        }
        if let Some(categories) = patch.get("categories").and_then(Value::as_object) {
            for (name, enabled) in categories {
                let Some(enabled) = enabled.as_bool() else {
                    continue;
                };
                match AuditCategory::parse(name) {
                    Some(AuditCategory::Security) => self.log_security = enabled,
                    Some(AuditCategory::AgentLifecycle) => self.log_lifecycle = enabled,
                    Some(AuditCategory::Ipc) => self.log_ipc = enabled,
                    Some(AuditCategory::StateStore) => self.log_state = enabled,
                    Some(AuditCategory::Resource) => self.log_resource = enabled,
                    Some(AuditCategory::Syscall) => self.log_syscalls = enabled,
                    Some(AuditCategory::Network) => self.log_network = enabled,
                    Some(AuditCategory::World) => self.log_world = enabled,
                    None => {}
                }
            }
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "max_entries": self.max_entries,
            "categories": {
                "SECURITY": self.log_security,
                "AGENT_LIFECYCLE": self.log_lifecycle,
                "IPC": self.log_ipc,
                "STATE_STORE": self.log_state,
                "RESOURCE": self.log_resource,
                "SYSCALL": self.log_syscalls,
                "NETWORK": self.log_network,
                "WORLD": self.log_world,
            },
        })
    }
}

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub category: AuditCategory,
    pub event_type: String,
    pub agent_id: AgentId,
    pub agent_name: Option<String>,
    pub details: Value,
    pub success: bool,
}

impl AuditEntry {
    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "ts": self.timestamp.to_rfc3339(),
            "category": self.category.as_str(),
            "event_type": self.event_type,
            "agent_id": self.agent_id,
            "agent_name": self.agent_name,
            "details": self.details,
            "success": self.success,
        })
    }

    pub fn to_jsonl(&self) -> String {
        self.to_json().to_string()
    }
}

pub struct AuditLogger {
    config: AuditConfig,
    entries: VecDeque<AuditEntry>,
    next_id: u64,
}

impl AuditLogger {
    pub fn new(config: AuditConfig) -> Self {
        Self {
            config,
            entries: VecDeque::new(),
            next_id: 1,
        }
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: AuditConfig) {
        while self.entries.len() > config.max_entries {
            self.entries.pop_front();
        }
        self.config = config;
    }

    /// Record an event; dropped when the category is disabled.
    pub fn log(
        &mut self,
        category: AuditCategory,
        event_type: &str,
        agent_id: AgentId,
        agent_name: Option<&str>,
        details: Value,
        success: bool,
    ) {
        if !self.config.is_enabled(category) {
            return;
        }
        if self.entries.len() >= self.config.max_entries {
            self.entries.pop_front();
        }
        let entry = AuditEntry {
            id: self.next_id,
            timestamp: Utc::now(),
            category,
            event_type: event_type.to_string(),
            agent_id,
            agent_name: agent_name.map(str::to_string),
            details,
            success,
        };
        self.next_id += 1;
        self.entries.push_back(entry);
    }

    pub fn log_security(
        &mut self,
        event_type: &str,
        agent_id: AgentId,
        agent_name: Option<&str>,
        details: Value,
    ) {
        self.log(AuditCategory::Security, event_type, agent_id, agent_name, details, false);
    }

    pub fn log_lifecycle(
        &mut self,
        event_type: &str,
        agent_id: AgentId,
        agent_name: Option<&str>,
        details: Value,
    ) {
        self.log(
            AuditCategory::AgentLifecycle,
            event_type,
            agent_id,
            agent_name,
            details,
            true,
        );
    }

    /// Filtered query. Results come back in chronological order; when more
    /// than `limit` entries match, the oldest are trimmed so the most recent
    /// `limit` survive.
    pub fn query(
        &self,
        category: Option<AuditCategory>,
        agent_id: Option<AgentId>,
        since_id: u64,
        limit: usize,
    ) -> Vec<&AuditEntry> {
        let matching: Vec<&AuditEntry> = self
            .entries
            .iter()
            .filter(|e| e.id > since_id)
            .filter(|e| category.map_or(true, |c| e.category == c))
            .filter(|e| agent_id.map_or(true, |id| e.agent_id == id))
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).collect()
    }

    /// Entire retained log as JSONL, oldest first. `limit` of zero means all.
    pub fn export_jsonl(&self, limit: usize) -> String {
        let skip = if limit == 0 {
            0
        } else {
            self.entries.len().saturating_sub(limit)
        };
        let mut out = String::new();
        for entry in self.entries.iter().skip(skip) {
            out.push_str(&entry.to_jsonl());
            out.push('\n');
        }
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_id(&self) -> u64 {
        self.next_id - 1
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new(AuditConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn disabled_category_drops_entries() {
        let mut log = AuditLogger::default();
        // IPC is disabled by default.
        log.log(AuditCategory::Ipc, "SEND", AgentId(1), None, json!({}), true);
        assert!(log.is_empty());

        log.log_security("PERMISSION_DENIED", AgentId(1), None, json!({"rule": "exec"}));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn ring_evicts_oldest() {
        let mut config = AuditConfig::default();
        config.max_entries = 3;
        let mut log = AuditLogger::new(config);
        for i in 0..5 {
            log.log_lifecycle("SPAWN", AgentId(i), None, json!({"i": i}));
        }
        assert_eq!(log.len(), 3);
        let entries = log.query(None, None, 0, 10);
        assert_eq!(entries[0].details["i"], 2, "oldest two evicted");
        // Ids keep climbing even across eviction.
        assert_eq!(log.last_id(), 5);
    }

    #[test]
    fn query_filters_and_caps_to_most_recent() {
        let mut log = AuditLogger::default();
        for i in 0..10 {
            log.log_lifecycle("SPAWN", AgentId(1), Some("w"), json!({"i": i}));
        }
        log.log_security("DENIED", AgentId(2), None, json!({}));

        let security = log.query(Some(AuditCategory::Security), None, 0, 100);
        assert_eq!(security.len(), 1);
        assert_eq!(security[0].agent_id, AgentId(2));

        let by_agent = log.query(None, Some(AgentId(1)), 0, 100);
        assert_eq!(by_agent.len(), 10);

        let capped = log.query(None, Some(AgentId(1)), 0, 3);
        assert_eq!(capped.len(), 3);
        assert_eq!(capped[0].details["i"], 7, "most recent three, in order");
        assert_eq!(capped[2].details["i"], 9);

        let since = log.query(None, None, log.last_id() - 1, 100);
        assert_eq!(since.len(), 1);
    }

    #[test]
    fn jsonl_export_is_one_line_per_entry() {
        let mut log = AuditLogger::default();
        log.log_lifecycle("SPAWN", AgentId(1), Some("alpha"), json!({"pid": 7}));
        log.log_security("DENIED", AgentId(2), None, json!({}));
        let jsonl = log.export_jsonl(0);
        let lines: Vec<&str> = jsonl.trim_end().split('\n').collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event_type"], "SPAWN");
        assert_eq!(first["agent_name"], "alpha");
    }

    #[test]
    fn config_patch_toggles_categories() {
        let mut config = AuditConfig::default();
        config.apply_json(&json!({
            "categories": {"IPC": true, "SECURITY": false},
            "max_entries": 50,
        }));
        assert!(config.is_enabled(AuditCategory::Ipc));
        assert!(!config.is_enabled(AuditCategory::Security));
        assert_eq!(config.max_entries, 50);
    }
}
