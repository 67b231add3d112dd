// Copyright (c) 2026 clove project
// SPDX-License-Identifier: AGPL-3.0

//! LLM completion backend.
//!
//! The backend is an opaque helper subprocess speaking a line protocol: one
//! JSON request per line on stdin, one JSON response per line on stdout. The
//! kernel does not model the provider beyond `{success, content, tokens,
//! error}`. The helper is spawned lazily on first use; excessive latency or
//! a closed pipe is a fatal subprocess error and the helper is respawned on
//! the next call.

use crate::error::KernelError;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// API key handed to the helper; empty means "not configured".
    pub api_key: String,
    pub model: String,
    /// Helper program and arguments.
    pub helper_command: Vec<String>,
    /// Per-request deadline. The loop treats a slower helper as failed.
    pub timeout_seconds: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gemini-2.0-flash".to_string(),
            helper_command: vec!["clove-llm".to_string()],
            timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub success: bool,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub error: Option<String>,
}

pub struct LlmClient {
    config: LlmConfig,
    child: Option<Child>,
    /// Unread bytes from the helper's stdout (partial lines).
    pending: Vec<u8>,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            config,
            child: None,
            pending: Vec::new(),
        }
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    pub fn is_configured(&self) -> bool {
        !self.config.api_key.is_empty()
    }

    /// Run one completion round trip. `payload` is the agent-supplied THINK
    /// request; model and key defaults are merged in before forwarding.
    pub fn complete(&mut self, payload: &Value) -> Result<LlmResponse, KernelError> {
        if !self.is_configured() {
            return Err(KernelError::Backend(
                "LLM not configured (set GEMINI_API_KEY)".to_string(),
            ));
        }
        self.ensure_helper()?;

        let mut request = payload.clone();
        if let Value::Object(map) = &mut request {
            map.entry("model")
                .or_insert_with(|| Value::String(self.config.model.clone()));
        }
        let mut line = serde_json::to_string(&request)
            .map_err(|e| KernelError::InvalidRequest(format!("unserializable request: {e}")))?;
        line.push('\n');

        let result = self.round_trip(line.as_bytes());
        if result.is_err() {
            // The helper is in an unknown state; drop it and respawn lazily.
            self.kill_helper();
        }
        result
    }

    fn round_trip(&mut self, request: &[u8]) -> Result<LlmResponse, KernelError> {
        let child = self.child.as_mut().expect("helper running");
        let stdin = child
            .stdin
            .as_mut()
            .ok_or_else(|| KernelError::Backend("LLM helper stdin closed".to_string()))?;
        stdin
            .write_all(request)
            .and_then(|()| stdin.flush())
            .map_err(|e| KernelError::Backend(format!("LLM helper write failed: {e}")))?;

        let deadline = Instant::now() + Duration::from_secs(self.config.timeout_seconds);
        let line = self.read_line(deadline)?;
        let response: LlmResponse = serde_json::from_str(line.trim()).map_err(|e| {
            KernelError::Backend(format!("malformed LLM helper response: {e}"))
        })?;
        debug!(
            "llm helper replied: success={} tokens={}",
            response.success, response.tokens
        );
        Ok(response)
    }

    /// Read one `\n`-terminated line from the helper, polling its stdout so
    /// a stalled helper cannot wedge the event loop past the deadline.
    fn read_line(&mut self, deadline: Instant) -> Result<String, KernelError> {
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.pending.drain(..=pos).collect();
                return String::from_utf8(line)
                    .map_err(|_| KernelError::Backend("non-UTF-8 LLM helper output".to_string()));
            }

            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| {
                    KernelError::Timeout(format!(
                        "LLM helper did not respond within {}s",
                        self.config.timeout_seconds
                    ))
                })?;

            let child = self.child.as_mut().expect("helper running");
            let stdout = child
                .stdout
                .as_mut()
                .ok_or_else(|| KernelError::Backend("LLM helper stdout closed".to_string()))?;

            let millis = remaining.as_millis().min(u16::MAX as u128) as u16;
            let mut fds = [PollFd::new(stdout.as_fd(), PollFlags::POLLIN)];
            let n = poll(&mut fds, PollTimeout::from(millis))
                .map_err(|e| KernelError::Backend(format!("poll on LLM helper failed: {e}")))?;
            if n == 0 {
                continue; // deadline re-checked at loop top
            }

            let mut chunk = [0u8; 4096];
            match stdout.read(&mut chunk) {
                Ok(0) => {
                    return Err(KernelError::Backend(
                        "LLM helper closed its stdout".to_string(),
                    ))
                }
                Ok(read) => self.pending.extend_from_slice(&chunk[..read]),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(KernelError::Backend(format!(
                        "read from LLM helper failed: {e}"
                    )))
                }
            }
        }
    }

    fn ensure_helper(&mut self) -> Result<(), KernelError> {
        if let Some(child) = self.child.as_mut() {
            match child.try_wait() {
                Ok(None) => return Ok(()),
                Ok(Some(status)) => {
                    warn!("LLM helper exited ({status}); respawning");
                    self.child = None;
                    self.pending.clear();
                }
                Err(e) => {
                    warn!("LLM helper state unknown ({e}); respawning");
                    self.kill_helper();
                }
            }
        }

        let (program, args) = self
            .config
            .helper_command
            .split_first()
            .ok_or_else(|| KernelError::Backend("empty LLM helper command".to_string()))?;
        let child = Command::new(program)
            .args(args)
            .env("GEMINI_API_KEY", &self.config.api_key)
            .env("GEMINI_MODEL", &self.config.model)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| KernelError::Backend(format!("failed to start LLM helper: {e}")))?;
        info!("LLM helper started: {}", self.config.helper_command.join(" "));
        self.child = Some(child);
        self.pending.clear();
        Ok(())
    }

    fn kill_helper(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.pending.clear();
    }
}

impl Drop for LlmClient {
    fn drop(&mut self) {
        self.kill_helper();
    }
}
