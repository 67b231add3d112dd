// Copyright (c) 2026 clove project
// SPDX-License-Identifier: AGPL-3.0

//! Inter-agent messaging: per-agent FIFO mailboxes and the name registry.
//!
//! Delivery is at-most-once per send, in-memory only, never across kernels.
//! A name belongs to exactly one agent at a time; re-registration under the
//! same id is idempotent, re-registration by a different id fails.

use crate::domain::agent::AgentId;
use crate::error::KernelError;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;
use tracing::debug;

/// One queued message.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: AgentId,
    pub from_name: Option<String>,
    pub message: Value,
    pub enqueued_at: Instant,
}

#[derive(Default)]
pub struct MailboxService {
    mailboxes: HashMap<AgentId, VecDeque<Envelope>>,
    names: HashMap<String, AgentId>,
    ids_to_names: HashMap<AgentId, String>,
}

impl MailboxService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `id`. Fails if another live agent owns the name.
    pub fn register(&mut self, id: AgentId, name: &str) -> Result<(), KernelError> {
        match self.names.get(name) {
            Some(owner) if *owner == id => Ok(()),
            Some(owner) => Err(KernelError::InvalidRequest(format!(
                "name '{name}' is already registered to agent {owner}"
            ))),
            None => {
                // Drop any previous name this agent held.
                if let Some(old) = self.ids_to_names.remove(&id) {
                    self.names.remove(&old);
                }
                self.names.insert(name.to_string(), id);
                self.ids_to_names.insert(id, name.to_string());
                debug!("agent {id} registered as '{name}'");
                Ok(())
            }
        }
    }

    pub fn resolve_name(&self, name: &str) -> Option<AgentId> {
        self.names.get(name).copied()
    }

    pub fn name_of(&self, id: AgentId) -> Option<&str> {
        self.ids_to_names.get(&id).map(String::as_str)
    }

    /// Remove an agent's name binding and drop its queued mail.
    pub fn forget(&mut self, id: AgentId) {
        if let Some(name) = self.ids_to_names.remove(&id) {
            self.names.remove(&name);
        }
        self.mailboxes.remove(&id);
    }

    /// Enqueue a message for `to`. The target does not have to be registered;
    /// any accepted connection id is a valid destination.
    pub fn send(&mut self, from: AgentId, to: AgentId, message: Value) {
        let envelope = Envelope {
            from,
            from_name: self.name_of(from).map(str::to_string),
            message,
            enqueued_at: Instant::now(),
        };
        self.mailboxes.entry(to).or_default().push_back(envelope);
    }

    /// Resolve a destination by id or name.
    pub fn resolve_target(
        &self,
        to: Option<AgentId>,
        to_name: Option<&str>,
    ) -> Result<AgentId, KernelError> {
        if let Some(id) = to {
            return Ok(id);
        }
        if let Some(name) = to_name {
            return self
                .resolve_name(name)
                .ok_or_else(|| KernelError::NotFound(format!("agent '{name}' not found")));
        }
        Err(KernelError::missing_field("to or to_name"))
    }

    /// Dequeue up to `max` messages for `id`. Never blocks.
    pub fn recv(&mut self, id: AgentId, max: usize) -> Vec<Envelope> {
        let Some(queue) = self.mailboxes.get_mut(&id) else {
            return Vec::new();
        };
        let n = queue.len().min(max);
        queue.drain(..n).collect()
    }

    pub fn pending(&self, id: AgentId) -> usize {
        self.mailboxes.get(&id).map(VecDeque::len).unwrap_or(0)
    }

    /// Deliver one copy to every registered agent. Returns the recipient ids.
    pub fn broadcast(&mut self, from: AgentId, message: &Value, include_self: bool) -> Vec<AgentId> {
        let targets: Vec<AgentId> = self
            .names
            .values()
            .copied()
            .filter(|id| include_self || *id != from)
            .collect();
        for target in &targets {
            self.send(from, *target, message.clone());
        }
        targets
    }

    pub fn registered_names(&self) -> impl Iterator<Item = (&str, AgentId)> {
        self.names.iter().map(|(name, id)| (name.as_str(), *id))
    }
}
