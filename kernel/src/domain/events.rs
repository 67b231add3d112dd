// Copyright (c) 2026 clove project
// SPDX-License-Identifier: AGPL-3.0

//! Kernel event vocabulary for the pub/sub bus.
//!
//! Lifecycle events are emitted by the supervisor and the dispatcher; agents
//! themselves may only emit `Custom`.

use crate::domain::agent::AgentId;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KernelEventType {
    AgentSpawned,
    AgentExited,
    AgentPaused,
    AgentResumed,
    AgentRestarting,
    AgentEscalated,
    MessageReceived,
    StateChanged,
    SyscallBlocked,
    ResourceWarning,
    Custom,
}

impl KernelEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KernelEventType::AgentSpawned => "AGENT_SPAWNED",
            KernelEventType::AgentExited => "AGENT_EXITED",
            KernelEventType::AgentPaused => "AGENT_PAUSED",
            KernelEventType::AgentResumed => "AGENT_RESUMED",
            KernelEventType::AgentRestarting => "AGENT_RESTARTING",
            KernelEventType::AgentEscalated => "AGENT_ESCALATED",
            KernelEventType::MessageReceived => "MESSAGE_RECEIVED",
            KernelEventType::StateChanged => "STATE_CHANGED",
            KernelEventType::SyscallBlocked => "SYSCALL_BLOCKED",
            KernelEventType::ResourceWarning => "RESOURCE_WARNING",
            KernelEventType::Custom => "CUSTOM",
        }
    }

    pub fn parse(s: &str) -> Option<KernelEventType> {
        match s {
            "AGENT_SPAWNED" => Some(KernelEventType::AgentSpawned),
            "AGENT_EXITED" => Some(KernelEventType::AgentExited),
            "AGENT_PAUSED" => Some(KernelEventType::AgentPaused),
            "AGENT_RESUMED" => Some(KernelEventType::AgentResumed),
            "AGENT_RESTARTING" => Some(KernelEventType::AgentRestarting),
            "AGENT_ESCALATED" => Some(KernelEventType::AgentEscalated),
            "MESSAGE_RECEIVED" => Some(KernelEventType::MessageReceived),
            "STATE_CHANGED" => Some(KernelEventType::StateChanged),
            "SYSCALL_BLOCKED" => Some(KernelEventType::SyscallBlocked),
            "RESOURCE_WARNING" => Some(KernelEventType::ResourceWarning),
            "CUSTOM" => Some(KernelEventType::Custom),
            _ => None,
        }
    }
}

/// One event as delivered to a subscriber's queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelEvent {
    pub event_type: KernelEventType,
    pub data: Value,
    /// Unix milliseconds at emit time.
    pub timestamp_ms: i64,
    /// Agent that caused the event; `AgentId::KERNEL` for kernel-originated.
    pub source_id: AgentId,
}

impl KernelEvent {
    pub fn new(event_type: KernelEventType, data: Value, source_id: AgentId) -> Self {
        Self {
            event_type,
            data,
            timestamp_ms: Utc::now().timestamp_millis(),
            source_id,
        }
    }

    /// Wire shape used by `POLL_EVENTS` responses.
    pub fn to_wire(&self) -> Value {
        serde_json::json!({
            "type": self.event_type.as_str(),
            "data": self.data,
            "source_id": self.source_id,
            "timestamp": self.timestamp_ms,
        })
    }
}
