// Copyright (c) 2026 clove project
// SPDX-License-Identifier: AGPL-3.0

//! # Clove Agent Kernel
//!
//! A single long-lived process that spawns untrusted agents inside OS-level
//! isolation (namespaces + cgroups v2), mediates their privileged operations
//! through a binary syscall protocol over a Unix domain socket, and provides
//! kernel-managed services: inter-agent messaging, a shared key/value store,
//! a pub/sub event bus, permission enforcement, resource accounting,
//! supervised restart, and deterministic syscall recording/replay.
//!
//! ## Architecture
//!
//! - **domain**: pure types and policy (agents, permissions, kernel events)
//! - **infrastructure**: OS plumbing (wire codec, epoll reactor, socket
//!   server, sandbox, LLM subprocess, HTTP fetcher, metrics collection)
//! - **application**: kernel services and the syscall dispatcher, wired
//!   together by the [`application::kernel::Kernel`] façade

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;

pub use application::kernel::Kernel;
pub use config::KernelConfig;
pub use error::KernelError;
