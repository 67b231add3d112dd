// Copyright (c) 2026 clove project
// SPDX-License-Identifier: AGPL-3.0

//! Kernel error taxonomy.
//!
//! Every error that crosses the syscall boundary is reported to the client as
//! `{"success": false, "error": "..."}` on the same opcode. Framing errors
//! never produce a response frame; they are swallowed by the codec layer's
//! byte-drop recovery. The kernel itself never terminates because a handler
//! failed.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KernelError {
    /// Header magic or size violation. Recovered at the framing layer.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Capability or quota violation. Emits `SYSCALL_BLOCKED` and a SECURITY
    /// audit entry; the message names the rule that fired.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Unknown agent id/name, unknown world, unknown key.
    #[error("{0}")]
    NotFound(String),

    /// JSON parse error or missing required field.
    #[error("{0}")]
    InvalidRequest(String),

    /// Bounded wait exceeded (exec wall clock, sandbox stop).
    #[error("timeout: {0}")]
    Timeout(String),

    /// LLM or HTTP backend reported failure.
    #[error("{0}")]
    Backend(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl KernelError {
    pub fn invalid_json() -> Self {
        KernelError::InvalidRequest("invalid JSON payload".to_string())
    }

    pub fn missing_field(field: &str) -> Self {
        KernelError::InvalidRequest(format!("missing required field: {field}"))
    }
}
