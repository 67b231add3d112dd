// Copyright (c) 2026 clove project
// SPDX-License-Identifier: AGPL-3.0

//! Shared key/value store with visibility scopes and lazy TTL expiry.
//!
//! Scopes: `global` (readable by anyone), `agent` (readable only by the
//! owner; keys are internally prefixed `agent:<owner_id>:<key>` and the
//! prefix is stripped on read/list), `session` (readable by every agent of
//! the current kernel session). Expiration is lazy: any access touching an
//! expired entry evicts it. Nothing survives a kernel restart.

use crate::domain::agent::AgentId;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Global,
    Agent,
    Session,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Agent => "agent",
            Scope::Session => "session",
        }
    }

    pub fn parse(s: &str) -> Option<Scope> {
        match s {
            "global" => Some(Scope::Global),
            "agent" => Some(Scope::Agent),
            "session" => Some(Scope::Session),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: Value,
    owner: AgentId,
    scope: Scope,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|t| now > t)
    }
}

/// Result of a fetch, shaped for the syscall response.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub exists: bool,
    pub value: Option<Value>,
    pub scope: Option<Scope>,
}

#[derive(Default)]
pub struct StateStore {
    entries: HashMap<String, StoredValue>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn agent_key(owner: AgentId, key: &str) -> String {
        format!("agent:{owner}:{key}")
    }

    /// Write a value. Returns true when the write was a `global` store, which
    /// the dispatcher turns into a `STATE_CHANGED` event.
    pub fn store(
        &mut self,
        owner: AgentId,
        key: &str,
        value: Value,
        scope: Scope,
        ttl: Option<Duration>,
    ) -> bool {
        let stored_key = match scope {
            Scope::Agent => Self::agent_key(owner, key),
            _ => key.to_string(),
        };
        self.entries.insert(
            stored_key,
            StoredValue {
                value,
                owner,
                scope,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        scope == Scope::Global
    }

    /// Agent-scoped key first, then the plain key; expired entries are
    /// evicted on contact; access rules applied.
    pub fn fetch(&mut self, caller: AgentId, key: &str) -> FetchResult {
        let now = Instant::now();
        for candidate in [Self::agent_key(caller, key), key.to_string()] {
            if let Some(entry) = self.entries.get(&candidate) {
                if entry.expired(now) {
                    self.entries.remove(&candidate);
                    continue;
                }
                if !Self::readable(entry, caller) {
                    continue;
                }
                return FetchResult {
                    exists: true,
                    value: Some(entry.value.clone()),
                    scope: Some(entry.scope),
                };
            }
        }
        FetchResult {
            exists: false,
            value: None,
            scope: None,
        }
    }

    fn readable(entry: &StoredValue, caller: AgentId) -> bool {
        match entry.scope {
            Scope::Global | Scope::Session => true,
            Scope::Agent => entry.owner == caller,
        }
    }

    /// Erase iff the caller owns the entry or the scope is global.
    pub fn delete(&mut self, caller: AgentId, key: &str) -> bool {
        let now = Instant::now();
        for candidate in [Self::agent_key(caller, key), key.to_string()] {
            if let Some(entry) = self.entries.get(&candidate) {
                if entry.expired(now) {
                    self.entries.remove(&candidate);
                    continue;
                }
                let allowed = entry.scope == Scope::Global || entry.owner == caller;
                if allowed {
                    self.entries.remove(&candidate);
                    return true;
                }
                return false;
            }
        }
        false
    }

    /// Sweep all entries, evicting the expired, and return the user-visible
    /// keys the caller may read, optionally filtered by prefix.
    pub fn keys(&mut self, caller: AgentId, prefix: Option<&str>) -> Vec<String> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, v)| v.expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.entries.remove(&key);
        }

        let own_prefix = format!("agent:{caller}:");
        let mut visible: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, v)| Self::readable(v, caller))
            .filter_map(|(k, v)| match v.scope {
                Scope::Agent => k.strip_prefix(&own_prefix).map(str::to_string),
                _ => Some(k.clone()),
            })
            .filter(|k| prefix.map_or(true, |p| k.starts_with(p)))
            .collect();
        visible.sort();
        visible
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything an agent owned in `agent` scope. Global and session
    /// values outlive their writer.
    pub fn purge_agent(&mut self, id: AgentId) {
        self.entries
            .retain(|_, v| !(v.scope == Scope::Agent && v.owner == id));
    }
}
