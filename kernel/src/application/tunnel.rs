// Copyright (c) 2026 clove project
// SPDX-License-Identifier: AGPL-3.0

//! Tunnel surface for remote connectivity.
//!
//! The relay transport itself is an external collaborator; the kernel keeps
//! the configuration and connection state and answers the tunnel syscalls.
//! Without a transport wired in, `CONNECT` reports a structured backend
//! error instead of pretending to connect.

use crate::error::KernelError;
use chrono::Utc;
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Disconnected,
    Connected,
}

impl TunnelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelState::Disconnected => "disconnected",
            TunnelState::Connected => "connected",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TunnelConfig {
    pub relay_url: Option<String>,
    pub machine_id: Option<String>,
    pub token: Option<String>,
    pub reconnect_interval_sec: Option<u64>,
}

pub struct TunnelManager {
    config: TunnelConfig,
    state: TunnelState,
    connected_at_ms: Option<i64>,
    last_error: Option<String>,
}

impl TunnelManager {
    pub fn new() -> Self {
        Self {
            config: TunnelConfig::default(),
            state: TunnelState::Disconnected,
            connected_at_ms: None,
            last_error: None,
        }
    }

    pub fn apply_config(&mut self, payload: &Value) {
        if let Some(url) = payload.get("relay_url").and_then(Value::as_str) {
            if !url.is_empty() {
                self.config.relay_url = Some(url.to_string());
            }
        }
        if let Some(id) = payload.get("machine_id").and_then(Value::as_str) {
            if !id.is_empty() {
                self.config.machine_id = Some(id.to_string());
            }
        }
        if let Some(token) = payload.get("token").and_then(Value::as_str) {
            if !token.is_empty() {
                self.config.token = Some(token.to_string());
            }
        }
        if let Some(n) = payload.get("reconnect_interval").and_then(Value::as_u64) {
            self.config.reconnect_interval_sec = Some(n);
        }
    }

    pub fn connect(&mut self, payload: &Value) -> Result<Value, KernelError> {
        self.apply_config(payload);
        if self.config.relay_url.is_none() {
            return Err(KernelError::missing_field("relay_url"));
        }
        let error = "relay transport not available in this build".to_string();
        self.last_error = Some(error.clone());
        Err(KernelError::Backend(error))
    }

    pub fn disconnect(&mut self) -> Value {
        let was_connected = self.state == TunnelState::Connected;
        self.state = TunnelState::Disconnected;
        self.connected_at_ms = None;
        json!({"success": true, "was_connected": was_connected})
    }

    pub fn status(&self) -> Value {
        json!({
            "success": true,
            "state": self.state.as_str(),
            "relay_url": self.config.relay_url,
            "machine_id": self.config.machine_id,
            "connected_at_ms": self.connected_at_ms,
            "last_error": self.last_error,
            "checked_at_ms": Utc::now().timestamp_millis(),
        })
    }

    pub fn list_remotes(&self) -> Value {
        json!({"success": true, "agents": [], "count": 0})
    }

    pub fn is_connected(&self) -> bool {
        self.state == TunnelState::Connected
    }

    /// Loop hook: drain transport events. The null transport has none.
    pub fn process_events(&mut self) {}
}

impl Default for TunnelManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn connect_without_relay_url_is_invalid() {
        let mut tunnel = TunnelManager::new();
        assert!(matches!(
            tunnel.connect(&json!({})),
            Err(KernelError::InvalidRequest(_))
        ));
    }

    #[test]
    fn connect_without_transport_reports_backend_error() {
        let mut tunnel = TunnelManager::new();
        let err = tunnel
            .connect(&json!({"relay_url": "wss://relay.example.com"}))
            .unwrap_err();
        assert!(matches!(err, KernelError::Backend(_)));
        // The configuration sticks and status reflects the failure.
        let status = tunnel.status();
        assert_eq!(status["state"], "disconnected");
        assert_eq!(status["relay_url"], "wss://relay.example.com");
        assert!(status["last_error"].is_string());
    }

    #[test]
    fn config_merges_fields() {
        let mut tunnel = TunnelManager::new();
        tunnel.apply_config(&json!({"machine_id": "m1", "reconnect_interval": 15}));
        tunnel.apply_config(&json!({"relay_url": "wss://r"}));
        let status = tunnel.status();
        assert_eq!(status["machine_id"], "m1");
        assert_eq!(status["relay_url"], "wss://r");
    }
}
