// Copyright (c) 2026 clove project
// SPDX-License-Identifier: AGPL-3.0

//! Resource metrics collection.
//!
//! System figures come from `/proc`; per-agent figures from the agent's
//! cgroup directory. Everything here is best-effort: a missing file reads as
//! zero rather than failing the syscall.

use serde_json::{json, Value};
use std::path::Path;

/// System-wide snapshot for `METRICS_SYSTEM`.
pub fn system_metrics() -> Value {
    let (mem_total_kb, mem_available_kb) = read_meminfo();
    let loadavg = read_loadavg();
    let uptime_secs = read_uptime();
    json!({
        "memory_total_kb": mem_total_kb,
        "memory_available_kb": mem_available_kb,
        "memory_used_kb": mem_total_kb.saturating_sub(mem_available_kb),
        "load_1m": loadavg.0,
        "load_5m": loadavg.1,
        "load_15m": loadavg.2,
        "uptime_seconds": uptime_secs,
        "num_cpus": num_cpus(),
    })
}

/// Cgroup snapshot for one sandboxed process. Returns zeros when the
/// directory does not exist (degraded isolation or already torn down).
pub fn cgroup_metrics(cgroup_path: &Path) -> Value {
    let memory_current = read_u64(&cgroup_path.join("memory.current"));
    let memory_peak = read_u64(&cgroup_path.join("memory.peak"));
    let pids_current = read_u64(&cgroup_path.join("pids.current"));
    let cpu_usage_us = read_cpu_stat_usage(&cgroup_path.join("cpu.stat"));
    json!({
        "cgroup_path": cgroup_path.to_string_lossy(),
        "exists": cgroup_path.exists(),
        "memory_current_bytes": memory_current,
        "memory_peak_bytes": memory_peak,
        "pids_current": pids_current,
        "cpu_usage_us": cpu_usage_us,
    })
}

pub fn read_u64(path: &Path) -> u64 {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

/// `usage_usec` from a cgroup v2 `cpu.stat` file.
pub fn read_cpu_stat_usage(path: &Path) -> u64 {
    let Ok(content) = std::fs::read_to_string(path) else {
        return 0;
    };
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("usage_usec ") {
            return rest.trim().parse().unwrap_or(0);
        }
    }
    0
}

fn read_meminfo() -> (u64, u64) {
    let Ok(content) = std::fs::read_to_string("/proc/meminfo") else {
        return (0, 0);
    };
    let mut total = 0;
    let mut available = 0;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = parse_kb(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = parse_kb(rest);
        }
    }
    (total, available)
}

fn parse_kb(s: &str) -> u64 {
    s.trim()
        .split_whitespace()
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

fn read_loadavg() -> (f64, f64, f64) {
    let Ok(content) = std::fs::read_to_string("/proc/loadavg") else {
        return (0.0, 0.0, 0.0);
    };
    let mut parts = content.split_whitespace();
    let one = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0.0);
    let five = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0.0);
    let fifteen = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0.0);
    (one, five, fifteen)
}

fn read_uptime() -> u64 {
    std::fs::read_to_string("/proc/uptime")
        .ok()
        .and_then(|s| {
            s.split_whitespace()
                .next()
                .and_then(|n| n.parse::<f64>().ok())
        })
        .map(|secs| secs as u64)
        .unwrap_or(0)
}

fn num_cpus() -> u64 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u64)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn system_metrics_reads_proc() {
        let metrics = system_metrics();
        assert!(metrics["memory_total_kb"].as_u64().unwrap() > 0);
        assert!(metrics["num_cpus"].as_u64().unwrap() >= 1);
    }

    #[test]
    fn missing_cgroup_reads_as_zeros() {
        let metrics = cgroup_metrics(Path::new("/sys/fs/cgroup/clove/definitely-absent"));
        assert_eq!(metrics["exists"], false);
        assert_eq!(metrics["memory_current_bytes"], 0);
    }

    #[test]
    fn cpu_stat_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpu.stat");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "usage_usec 123456\nuser_usec 100\nsystem_usec 23").unwrap();
        assert_eq!(read_cpu_stat_usage(&path), 123_456);
    }
}
