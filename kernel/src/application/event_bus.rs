// Copyright (c) 2026 clove project
// SPDX-License-Identifier: AGPL-3.0

//! Pub/sub event bus.
//!
//! Each agent holds a subscription set of [`KernelEventType`]s and a FIFO
//! event queue. An emit snapshots the subscriber set for that type and pushes
//! the event into every matching queue, so delivery order per subscriber is
//! emit order. Agents may only emit `Custom` directly; the kernel's lifecycle
//! hooks emit the rest.

use crate::domain::agent::AgentId;
use crate::domain::events::{KernelEvent, KernelEventType};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};

/// Queues are bounded so a subscriber that never polls cannot grow without
/// limit; overflow drops the oldest event.
const MAX_QUEUED_EVENTS: usize = 1_000;

#[derive(Default)]
pub struct EventBus {
    subscriptions: HashMap<AgentId, HashSet<KernelEventType>>,
    queues: HashMap<AgentId, VecDeque<KernelEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `types` to the caller's subscription set. Returns the full set
    /// after the change, for the response payload.
    pub fn subscribe(&mut self, id: AgentId, types: &[KernelEventType]) -> Vec<KernelEventType> {
        let set = self.subscriptions.entry(id).or_default();
        for t in types {
            set.insert(*t);
        }
        let mut all: Vec<KernelEventType> = set.iter().copied().collect();
        all.sort_by_key(|t| t.as_str());
        all
    }

    /// Remove `types`; `None` clears everything.
    pub fn unsubscribe(
        &mut self,
        id: AgentId,
        types: Option<&[KernelEventType]>,
    ) -> Vec<KernelEventType> {
        if let Some(set) = self.subscriptions.get_mut(&id) {
            match types {
                Some(types) => {
                    for t in types {
                        set.remove(t);
                    }
                }
                None => set.clear(),
            }
        }
        let mut remaining: Vec<KernelEventType> = self
            .subscriptions
            .get(&id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        remaining.sort_by_key(|t| t.as_str());
        remaining
    }

    pub fn is_subscribed(&self, id: AgentId, event_type: KernelEventType) -> bool {
        self.subscriptions
            .get(&id)
            .is_some_and(|s| s.contains(&event_type))
    }

    /// Push `event_type` to every subscriber's queue. Returns how many
    /// queues received it.
    pub fn emit(&mut self, event_type: KernelEventType, data: Value, source: AgentId) -> usize {
        let subscribers: Vec<AgentId> = self
            .subscriptions
            .iter()
            .filter(|(_, set)| set.contains(&event_type))
            .map(|(id, _)| *id)
            .collect();
        for id in &subscribers {
            let queue = self.queues.entry(*id).or_default();
            if queue.len() >= MAX_QUEUED_EVENTS {
                queue.pop_front();
            }
            queue.push_back(KernelEvent::new(event_type, data.clone(), source));
        }
        subscribers.len()
    }

    /// Drain up to `max` events from the caller's queue, oldest first.
    pub fn poll(&mut self, id: AgentId, max: usize) -> Vec<KernelEvent> {
        let Some(queue) = self.queues.get_mut(&id) else {
            return Vec::new();
        };
        let n = queue.len().min(max);
        queue.drain(..n).collect()
    }

    /// Drop an agent's subscriptions and queued events.
    pub fn forget(&mut self, id: AgentId) {
        self.subscriptions.remove(&id);
        self.queues.remove(&id);
    }
}
