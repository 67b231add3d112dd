// Copyright (c) 2026 clove project
// SPDX-License-Identifier: AGPL-3.0

//! World registry: an optional overlay that intercepts filesystem and
//! network syscalls for agents that have joined a world.
//!
//! A world is an in-memory record holding a virtual filesystem overlay,
//! canned HTTP responses and an injected-event log. The dispatcher asks the
//! world for an interception decision before performing the real operation,
//! so worlds stay orthogonal to the kernel core. The full simulation engine
//! (economies, schedules, fault models) lives outside the kernel; this is
//! the complete syscall surface for it.

use crate::domain::agent::AgentId;
use crate::error::KernelError;
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

pub struct World {
    pub id: String,
    pub name: String,
    pub config: Value,
    pub members: HashSet<AgentId>,
    /// Path prefixes this world claims; reads/writes under a mount never
    /// reach the real filesystem.
    pub mounts: Vec<String>,
    /// Virtual file contents keyed by absolute path.
    pub vfs: HashMap<String, String>,
    /// Canned HTTP responses keyed by host.
    pub http_mocks: HashMap<String, Value>,
    /// Injected chaos events, oldest first.
    pub events: Vec<Value>,
    /// Extra per-syscall latency armed by a `latency` chaos event.
    pub latency_ms: u64,
    pub created_at_ms: i64,
}

impl World {
    fn from_config(id: String, name: String, config: Value) -> Self {
        let mounts = config
            .get("mounts")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let vfs = config
            .get("vfs")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        let http_mocks = config
            .get("http_mocks")
            .and_then(Value::as_object)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        Self {
            id,
            name,
            config,
            members: HashSet::new(),
            mounts,
            vfs,
            http_mocks,
            events: Vec::new(),
            latency_ms: 0,
            created_at_ms: Utc::now().timestamp_millis(),
        }
    }

    pub fn intercepts_path(&self, path: &str) -> bool {
        self.mounts.iter().any(|m| path.starts_with(m.as_str()))
    }

    pub fn read(&self, path: &str) -> Option<&str> {
        self.vfs.get(path).map(String::as_str)
    }

    pub fn write(&mut self, path: &str, content: String) {
        self.vfs.insert(path.to_string(), content);
    }

    pub fn http_response(&self, host: &str) -> Option<&Value> {
        self.http_mocks.get(host)
    }

    pub fn inject_event(&mut self, event_type: &str, params: &Value) {
        if event_type == "latency" {
            self.latency_ms = params.get("ms").and_then(Value::as_u64).unwrap_or(0);
        }
        self.events.push(json!({
            "event_type": event_type,
            "params": params,
            "ts": Utc::now().timestamp_millis(),
        }));
    }

    pub fn state(&self) -> Value {
        json!({
            "world_id": self.id,
            "name": self.name,
            "members": self.members.iter().copied().collect::<Vec<_>>(),
            "member_count": self.members.len(),
            "vfs_entries": self.vfs.len(),
            "mounts": self.mounts,
            "events_injected": self.events.len(),
            "latency_ms": self.latency_ms,
            "created_at_ms": self.created_at_ms,
        })
    }

    pub fn snapshot(&self) -> Value {
        let vfs: Map<String, Value> = self
            .vfs
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        json!({
            "world_id": self.id,
            "name": self.name,
            "config": self.config,
            "vfs": Value::Object(vfs),
            "http_mocks": self.http_mocks,
            "events": self.events,
            "latency_ms": self.latency_ms,
            "snapshot_ts": Utc::now().timestamp_millis(),
        })
    }
}

#[derive(Default)]
pub struct WorldRegistry {
    worlds: HashMap<String, World>,
    memberships: HashMap<AgentId, String>,
}

impl WorldRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, name: &str, config: Value) -> String {
        let id = format!("world-{}", &Uuid::new_v4().simple().to_string()[..12]);
        let world = World::from_config(id.clone(), name.to_string(), config);
        self.worlds.insert(id.clone(), world);
        id
    }

    /// Destroy a world. With members still joined, requires `force`, which
    /// evicts them.
    pub fn destroy(&mut self, world_id: &str, force: bool) -> Result<(), KernelError> {
        let world = self
            .worlds
            .get(world_id)
            .ok_or_else(|| KernelError::NotFound("world not found".to_string()))?;
        if !world.members.is_empty() && !force {
            return Err(KernelError::InvalidRequest(format!(
                "world has {} member(s); pass force to destroy",
                world.members.len()
            )));
        }
        let world = self.worlds.remove(world_id).expect("checked above");
        for member in world.members {
            self.memberships.remove(&member);
        }
        Ok(())
    }

    pub fn list(&self) -> Vec<Value> {
        let mut worlds: Vec<&World> = self.worlds.values().collect();
        worlds.sort_by_key(|w| w.created_at_ms);
        worlds.iter().map(|w| w.state()).collect()
    }

    pub fn join(&mut self, agent: AgentId, world_id: &str) -> Result<(), KernelError> {
        if !self.worlds.contains_key(world_id) {
            return Err(KernelError::NotFound("world not found".to_string()));
        }
        // Leaving any previous world first keeps membership single-valued.
        self.leave(agent);
        self.worlds
            .get_mut(world_id)
            .expect("checked above")
            .members
            .insert(agent);
        self.memberships.insert(agent, world_id.to_string());
        Ok(())
    }

    /// Returns the world the agent left, if any.
    pub fn leave(&mut self, agent: AgentId) -> Option<String> {
        let world_id = self.memberships.remove(&agent)?;
        if let Some(world) = self.worlds.get_mut(&world_id) {
            world.members.remove(&agent);
        }
        Some(world_id)
    }

    pub fn get(&self, world_id: &str) -> Option<&World> {
        self.worlds.get(world_id)
    }

    pub fn get_mut(&mut self, world_id: &str) -> Option<&mut World> {
        self.worlds.get_mut(world_id)
    }

    /// The world an agent has joined, if any.
    pub fn world_of(&self, agent: AgentId) -> Option<&World> {
        self.memberships
            .get(&agent)
            .and_then(|id| self.worlds.get(id))
    }

    pub fn world_of_mut(&mut self, agent: AgentId) -> Option<&mut World> {
        let id = self.memberships.get(&agent)?.clone();
        self.worlds.get_mut(&id)
    }

    /// Recreate a world from a snapshot, optionally under a new id.
    pub fn restore(
        &mut self,
        snapshot: &Value,
        new_world_id: Option<&str>,
    ) -> Result<String, KernelError> {
        let name = snapshot
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| KernelError::InvalidRequest("snapshot missing name".to_string()))?
            .to_string();
        let config = snapshot.get("config").cloned().unwrap_or(json!({}));
        let id = match new_world_id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => snapshot
                .get("world_id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("world-{}", &Uuid::new_v4().simple().to_string()[..12])),
        };
        if self.worlds.contains_key(&id) {
            return Err(KernelError::InvalidRequest(format!(
                "world '{id}' already exists"
            )));
        }

        let mut world = World::from_config(id.clone(), name, config);
        if let Some(vfs) = snapshot.get("vfs").and_then(Value::as_object) {
            world.vfs = vfs
                .iter()
                .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                .collect();
        }
        if let Some(mocks) = snapshot.get("http_mocks").and_then(Value::as_object) {
            world.http_mocks = mocks.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        }
        if let Some(events) = snapshot.get("events").and_then(Value::as_array) {
            world.events = events.clone();
        }
        world.latency_ms = snapshot
            .get("latency_ms")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        self.worlds.insert(id.clone(), world);
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.worlds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.worlds.is_empty()
    }
}
