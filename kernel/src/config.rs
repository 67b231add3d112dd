// Copyright (c) 2026 clove project
// SPDX-License-Identifier: AGPL-3.0

//! Kernel configuration.
//!
//! Precedence, lowest to highest: built-in defaults, `.env` files (working
//! directory or any ancestor, then next to the executable), process
//! environment. Variables already present in the process environment always
//! win over `.env` contents.

use crate::domain::agent::ResourceLimits;
use crate::infrastructure::llm::LlmConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/clove.sock";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    pub socket_path: PathBuf,
    /// When false, agents spawn without namespaces or cgroups and the
    /// degraded mode is reported on every spawn.
    pub enable_sandboxing: bool,
    pub llm: LlmConfig,
    /// Limits applied to spawned agents that do not override them.
    pub default_limits: ResourceLimits,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            enable_sandboxing: true,
            llm: LlmConfig::default(),
            default_limits: ResourceLimits::default(),
        }
    }
}

impl KernelConfig {
    /// Defaults, then `.env` discovery, then environment overrides.
    pub fn load() -> Self {
        load_dotenv_files();
        let mut config = Self::default();
        config.apply_env();
        config
    }

    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            self.llm.api_key = key;
        } else if let Ok(key) = std::env::var("GOOGLE_API_KEY") {
            self.llm.api_key = key;
        }
        if let Ok(model) = std::env::var("GEMINI_MODEL") {
            if !model.is_empty() {
                self.llm.model = model;
            }
        }
        if let Ok(helper) = std::env::var("CLOVE_LLM_HELPER") {
            let parts: Vec<String> = helper.split_whitespace().map(str::to_string).collect();
            if !parts.is_empty() {
                self.llm.helper_command = parts;
            }
        }
        if let Ok(path) = std::env::var("CLOVE_SOCKET") {
            if !path.is_empty() {
                self.socket_path = PathBuf::from(path);
            }
        }
        if std::env::var("CLOVE_NO_SANDBOX").is_ok() {
            self.enable_sandboxing = false;
        }
    }
}

/// Parse `.env` files without overriding variables already set in the
/// process environment. The working directory and its ancestors are searched
/// first, then the directory holding the executable.
fn load_dotenv_files() {
    match dotenvy::dotenv() {
        Ok(path) => debug!("loaded environment from {}", path.display()),
        Err(_) => {}
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let candidate = dir.join(".env");
            if candidate.exists() {
                if dotenvy::from_path(&candidate).is_ok() {
                    debug!("loaded environment from {}", candidate.display());
                }
            }
        }
    }
}
