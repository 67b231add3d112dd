// Copyright (c) 2026 clove project
// SPDX-License-Identifier: AGPL-3.0

//! Per-agent permission model.
//!
//! Each agent gets a permission set on first sight, seeded from the
//! `Standard` preset. All checks are pure functions of the set and the
//! inputs. Matching rules:
//!
//! - paths: glob patterns (`~` expands to `$HOME`); deny list first, then an
//!   empty allow list accepts, otherwise any allow glob must match
//! - commands: deny list matches by substring anywhere, allow list strictly
//!   by prefix; the two are never conflated
//! - domains: exact match, or `*.suffix` wildcard; an empty allow list denies
//! - LLM: call and token quotas with running totals

use glob::Pattern;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Permission presets, ordered from most to least restrictive below
/// `Unrestricted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    Unrestricted,
    Standard,
    Sandboxed,
    Readonly,
    Minimal,
}

impl PermissionLevel {
    pub fn parse(s: &str) -> Option<PermissionLevel> {
        match s {
            "unrestricted" => Some(PermissionLevel::Unrestricted),
            "standard" => Some(PermissionLevel::Standard),
            "sandboxed" => Some(PermissionLevel::Sandboxed),
            "readonly" => Some(PermissionLevel::Readonly),
            "minimal" => Some(PermissionLevel::Minimal),
            _ => None,
        }
    }
}

/// Security-sensitive paths denied by default at every level except
/// `Unrestricted`.
pub const DEFAULT_BLOCKED_PATHS: &[&str] = &[
    "/etc/shadow",
    "/etc/passwd",
    "~/.ssh/**",
    "~/.gnupg/**",
    "~/.aws/**",
    "~/.config/gcloud/**",
    "**/.env",
    "**/.git/config",
    "**/credentials*",
    "**/secrets*",
    "**/*token*",
    "**/*password*",
];

/// Dangerous command fragments denied by default (substring match).
pub const DEFAULT_BLOCKED_COMMANDS: &[&str] = &[
    "rm -rf /",
    "rm -rf ~",
    "rm -rf /*",
    "sudo",
    "su ",
    "chmod 777",
    "curl | bash",
    "wget | bash",
    "> /dev/sd",
    "dd if=",
    "mkfs",
    ":(){:|:&};:",
    "shutdown",
    "reboot",
    "init 0",
    "poweroff",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPermissions {
    pub can_exec: bool,
    pub can_read: bool,
    pub can_write: bool,
    pub can_think: bool,
    pub can_spawn: bool,
    pub can_http: bool,

    /// Glob patterns; empty = all paths readable (minus blocked).
    pub allowed_read_paths: Vec<String>,
    /// Glob patterns; empty = all paths writable (minus blocked).
    pub allowed_write_paths: Vec<String>,
    /// Always-deny glob patterns, checked first.
    pub blocked_paths: Vec<String>,

    /// Command prefixes; empty = all commands (minus blocked).
    pub allowed_commands: Vec<String>,
    /// Always-deny substrings, checked first.
    pub blocked_commands: Vec<String>,

    /// Domains for HTTP; empty = deny all. `*.example.com` matches any
    /// subdomain.
    pub allowed_domains: Vec<String>,

    /// 0 = unlimited.
    pub max_llm_tokens: u64,
    /// 0 = unlimited.
    pub max_llm_calls: u32,
    /// Wall clock budget per EXEC command.
    pub max_exec_time_ms: u64,

    pub llm_tokens_used: u64,
    pub llm_calls_made: u32,
}

impl Default for AgentPermissions {
    fn default() -> Self {
        AgentPermissions::from_level(PermissionLevel::Standard)
    }
}

impl AgentPermissions {
    pub fn from_level(level: PermissionLevel) -> Self {
        let mut perms = Self {
            can_exec: true,
            can_read: true,
            can_write: true,
            can_think: true,
            can_spawn: false,
            can_http: false,
            allowed_read_paths: Vec::new(),
            allowed_write_paths: Vec::new(),
            blocked_paths: DEFAULT_BLOCKED_PATHS.iter().map(|s| s.to_string()).collect(),
            allowed_commands: Vec::new(),
            blocked_commands: DEFAULT_BLOCKED_COMMANDS.iter().map(|s| s.to_string()).collect(),
            allowed_domains: Vec::new(),
            max_llm_tokens: 0,
            max_llm_calls: 0,
            max_exec_time_ms: 30_000,
            llm_tokens_used: 0,
            llm_calls_made: 0,
        };

        match level {
            PermissionLevel::Unrestricted => {
                perms.can_spawn = true;
                perms.can_http = true;
                perms.blocked_paths.clear();
                perms.blocked_commands.clear();
            }
            PermissionLevel::Standard => {}
            PermissionLevel::Sandboxed => {
                perms.allowed_read_paths = vec!["/tmp/**".into(), "/home/**".into()];
                perms.allowed_write_paths = vec!["/tmp/**".into()];
            }
            PermissionLevel::Readonly => {
                perms.can_exec = false;
                perms.can_write = false;
            }
            PermissionLevel::Minimal => {
                perms.can_exec = false;
                perms.can_read = false;
                perms.can_write = false;
            }
        }

        perms
    }

    /// Merge fields present in `patch` onto this set. The JSON layout matches
    /// what `to_json` produces, so a round trip is lossless.
    pub fn apply_json(&mut self, patch: &Value) {
        let get_bool = |v: &Value, key: &str| v.get(key).and_then(Value::as_bool);
        if let Some(b) = get_bool(patch, "can_exec") {
            self.can_exec = b;
        }
        if let Some(b) = get_bool(patch, "can_read") {
            self.can_read = b;
        }
        if let Some(b) = get_bool(patch, "can_write") {
            self.can_write = b;
        }
        if let Some(b) = get_bool(patch, "can_think") {
            self.can_think = b;
        }
        if let Some(b) = get_bool(patch, "can_spawn") {
            self.can_spawn = b;
        }
        if let Some(b) = get_bool(patch, "can_http") {
            self.can_http = b;
        }

        if let Some(fs) = patch.get("filesystem") {
            if let Some(list) = string_list(fs.get("read")) {
                self.allowed_read_paths = list;
            }
            if let Some(list) = string_list(fs.get("write")) {
                self.allowed_write_paths = list;
            }
            if let Some(list) = string_list(fs.get("blocked")) {
                self.blocked_paths = list;
            }
        }

        if let Some(list) = string_list(patch.get("exec")) {
            self.allowed_commands = list;
        }
        if let Some(list) = string_list(patch.get("blocked_commands")) {
            self.blocked_commands = list;
        }
        if let Some(list) = string_list(patch.get("network")) {
            if !list.is_empty() {
                self.can_http = true;
            }
            self.allowed_domains = list;
        }

        if let Some(llm) = patch.get("llm") {
            if let Some(n) = llm.get("max_tokens").and_then(Value::as_u64) {
                self.max_llm_tokens = n;
            }
            if let Some(n) = llm.get("max_calls").and_then(Value::as_u64) {
                self.max_llm_calls = n as u32;
            }
        }
        if let Some(n) = patch.get("max_exec_time_ms").and_then(Value::as_u64) {
            self.max_exec_time_ms = n;
        }
    }

    /// Wire shape for `GET_PERMS`.
    pub fn to_json(&self) -> Value {
        json!({
            "can_exec": self.can_exec,
            "can_read": self.can_read,
            "can_write": self.can_write,
            "can_think": self.can_think,
            "can_spawn": self.can_spawn,
            "can_http": self.can_http,
            "filesystem": {
                "read": self.allowed_read_paths,
                "write": self.allowed_write_paths,
                "blocked": self.blocked_paths,
            },
            "exec": self.allowed_commands,
            "blocked_commands": self.blocked_commands,
            "network": self.allowed_domains,
            "llm": {
                "max_tokens": self.max_llm_tokens,
                "max_calls": self.max_llm_calls,
                "tokens_used": self.llm_tokens_used,
                "calls_made": self.llm_calls_made,
            },
            "max_exec_time_ms": self.max_exec_time_ms,
        })
    }

    pub fn can_read_path(&self, path: &str) -> bool {
        if !self.can_read {
            return false;
        }
        let normalized = normalize_read_path(path);
        self.path_allowed(&normalized, &self.allowed_read_paths)
    }

    pub fn can_write_path(&self, path: &str) -> bool {
        if !self.can_write {
            return false;
        }
        let normalized = normalize_write_path(path);
        self.path_allowed(&normalized, &self.allowed_write_paths)
    }

    fn path_allowed(&self, path: &str, allow: &[String]) -> bool {
        if self.blocked_paths.iter().any(|p| path_matches(path, p)) {
            return false;
        }
        if allow.is_empty() {
            return true;
        }
        allow.iter().any(|p| path_matches(path, p))
    }

    pub fn can_execute_command(&self, command: &str) -> bool {
        if !self.can_exec {
            return false;
        }
        // Deny list: substring anywhere ("sudo rm -rf /" trips on "sudo").
        if self.blocked_commands.iter().any(|b| command.contains(b.as_str())) {
            return false;
        }
        if self.allowed_commands.is_empty() {
            return true;
        }
        // Allow list: strictly prefix.
        self.allowed_commands.iter().any(|a| command.starts_with(a.as_str()))
    }

    pub fn can_access_domain(&self, domain: &str) -> bool {
        if !self.can_http {
            return false;
        }
        if self.allowed_domains.is_empty() {
            return false;
        }
        self.allowed_domains.iter().any(|p| domain_matches(domain, p))
    }

    pub fn can_use_llm(&self, estimated_tokens: u64) -> bool {
        if !self.can_think {
            return false;
        }
        if self.max_llm_calls > 0 && self.llm_calls_made >= self.max_llm_calls {
            return false;
        }
        if self.max_llm_tokens > 0
            && self.llm_tokens_used + estimated_tokens > self.max_llm_tokens
        {
            return false;
        }
        true
    }

    pub fn record_llm_usage(&mut self, tokens: u64) {
        self.llm_calls_made += 1;
        self.llm_tokens_used += tokens;
    }
}

/// Per-agent permission sets, created on first sight with the Standard
/// preset.
#[derive(Default)]
pub struct PermissionRegistry {
    sets: std::collections::HashMap<crate::domain::agent::AgentId, AgentPermissions>,
}

impl PermissionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, id: crate::domain::agent::AgentId) -> &mut AgentPermissions {
        self.sets.entry(id).or_default()
    }

    pub fn get(&self, id: crate::domain::agent::AgentId) -> Option<&AgentPermissions> {
        self.sets.get(&id)
    }

    pub fn set(&mut self, id: crate::domain::agent::AgentId, perms: AgentPermissions) {
        self.sets.insert(id, perms);
    }

    pub fn forget(&mut self, id: crate::domain::agent::AgentId) {
        self.sets.remove(&id);
    }
}

fn string_list(v: Option<&Value>) -> Option<Vec<String>> {
    let arr = v?.as_array()?;
    Some(
        arr.iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
    )
}

/// Glob match with `~` expanded to `$HOME` in the pattern.
pub fn path_matches(path: &str, pattern: &str) -> bool {
    let expanded;
    let pattern = if let Some(rest) = pattern.strip_prefix('~') {
        match std::env::var("HOME") {
            Ok(home) => {
                expanded = format!("{home}{rest}");
                expanded.as_str()
            }
            Err(_) => pattern,
        }
    } else {
        pattern
    };
    match Pattern::new(pattern) {
        Ok(p) => p.matches(path),
        Err(_) => false,
    }
}

/// Canonicalize an existing path so symlinks cannot dodge the glob rules.
fn normalize_read_path(path: &str) -> String {
    std::fs::canonicalize(path)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| path.to_string())
}

/// For writes the file may not exist yet: canonicalize the parent and
/// reattach the file name.
fn normalize_write_path(path: &str) -> String {
    let p = std::path::Path::new(path);
    match (p.parent(), p.file_name()) {
        (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => {
            match std::fs::canonicalize(parent) {
                Ok(canon) => canon.join(name).to_string_lossy().into_owned(),
                Err(_) => path.to_string(),
            }
        }
        _ => path.to_string(),
    }
}

/// Extract the host from a URL: strip scheme, path and port.
pub fn extract_domain(url: &str) -> String {
    let rest = match url.find("://") {
        Some(idx) => &url[idx + 3..],
        None => url,
    };
    let rest = rest.split('/').next().unwrap_or(rest);
    rest.split(':').next().unwrap_or(rest).to_string()
}

/// Exact match, or `*.suffix` wildcard covering any subdomain.
pub fn domain_matches(domain: &str, pattern: &str) -> bool {
    if domain == pattern {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        if suffix.starts_with('.') && domain.len() > suffix.len() {
            return domain.ends_with(suffix);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_blocks_dangerous_commands() {
        let perms = AgentPermissions::from_level(PermissionLevel::Standard);
        assert!(!perms.can_execute_command("sudo rm -rf /"));
        assert!(!perms.can_execute_command("echo hi && rm -rf /"));
        assert!(!perms.can_execute_command("dd if=/dev/zero of=/dev/sda"));
        assert!(perms.can_execute_command("ls -la /tmp"));
    }

    #[test]
    fn allow_list_is_prefix_only() {
        let mut perms = AgentPermissions::from_level(PermissionLevel::Standard);
        perms.allowed_commands = vec!["git ".to_string(), "ls".to_string()];
        assert!(perms.can_execute_command("git status"));
        assert!(perms.can_execute_command("ls -la"));
        // "cat foo | git apply" contains but does not start with "git ".
        assert!(!perms.can_execute_command("cat foo.patch | git apply"));
    }

    #[test]
    fn blocked_paths_win_over_allow() {
        let mut perms = AgentPermissions::from_level(PermissionLevel::Standard);
        perms.allowed_read_paths = vec!["/tmp/**".to_string()];
        perms.blocked_paths = vec!["/tmp/secret/**".to_string()];
        assert!(perms.can_read_path("/tmp/data/notes.txt"));
        assert!(!perms.can_read_path("/tmp/secret/key.pem"));
        assert!(!perms.can_read_path("/var/log/syslog"));
    }

    #[test]
    fn env_files_blocked_by_default() {
        let perms = AgentPermissions::from_level(PermissionLevel::Standard);
        assert!(!perms.can_read_path("/home/user/project/.env"));
        assert!(!perms.can_read_path("/srv/app/credentials.json"));
    }

    #[test]
    fn domain_wildcards() {
        assert!(domain_matches("api.example.com", "*.example.com"));
        assert!(domain_matches("example.com", "example.com"));
        assert!(!domain_matches("example.com", "*.example.com"));
        assert!(!domain_matches("evilexample.com", "*.example.com"));
    }

    #[test]
    fn extract_domain_strips_scheme_path_port() {
        assert_eq!(extract_domain("https://api.example.com:8443/v1/x"), "api.example.com");
        assert_eq!(extract_domain("example.com/path"), "example.com");
        assert_eq!(extract_domain("http://localhost:3000"), "localhost");
    }

    #[test]
    fn http_denied_without_domains() {
        let mut perms = AgentPermissions::from_level(PermissionLevel::Standard);
        perms.can_http = true;
        assert!(!perms.can_access_domain("example.com"));
        perms.allowed_domains = vec!["example.com".to_string()];
        assert!(perms.can_access_domain("example.com"));
    }

    #[test]
    fn llm_quotas() {
        let mut perms = AgentPermissions::from_level(PermissionLevel::Standard);
        perms.max_llm_calls = 2;
        perms.max_llm_tokens = 100;
        assert!(perms.can_use_llm(50));
        perms.record_llm_usage(60);
        // 60 + 50 > 100
        assert!(!perms.can_use_llm(50));
        assert!(perms.can_use_llm(40));
        perms.record_llm_usage(10);
        // call quota reached
        assert!(!perms.can_use_llm(0));
    }

    #[test]
    fn preset_monotonicity() {
        // Anything a narrower preset accepts, its widening accepts too.
        // Readonly and Sandboxed restrict different axes (verbs vs paths),
        // so the subset pairs route both through Standard.
        let pairs = [
            (PermissionLevel::Minimal, PermissionLevel::Readonly),
            (PermissionLevel::Readonly, PermissionLevel::Standard),
            (PermissionLevel::Sandboxed, PermissionLevel::Standard),
            (PermissionLevel::Standard, PermissionLevel::Unrestricted),
        ];
        let commands = ["ls /tmp", "python3 run.py"];
        let paths = ["/tmp/work/a.txt", "/opt/data.csv"];
        for (narrow_level, wide_level) in pairs {
            let narrow = AgentPermissions::from_level(narrow_level);
            let wide = AgentPermissions::from_level(wide_level);
            for cmd in commands {
                if narrow.can_execute_command(cmd) {
                    assert!(wide.can_execute_command(cmd), "{cmd} regressed at {wide_level:?}");
                }
            }
            for path in paths {
                if narrow.can_read_path(path) {
                    assert!(wide.can_read_path(path), "{path} regressed at {wide_level:?}");
                }
                if narrow.can_write_path(path) {
                    assert!(wide.can_write_path(path), "{path} write regressed at {wide_level:?}");
                }
            }
            if narrow.can_use_llm(10) {
                assert!(wide.can_use_llm(10));
            }
        }
    }

    #[test]
    fn json_round_trip_preserves_rules() {
        let mut perms = AgentPermissions::from_level(PermissionLevel::Sandboxed);
        perms.allowed_domains = vec!["*.example.com".to_string()];
        perms.max_llm_tokens = 5_000;
        let encoded = perms.to_json();

        let mut decoded = AgentPermissions::from_level(PermissionLevel::Standard);
        decoded.apply_json(&encoded);
        assert_eq!(decoded.allowed_read_paths, perms.allowed_read_paths);
        assert_eq!(decoded.allowed_domains, perms.allowed_domains);
        assert_eq!(decoded.max_llm_tokens, 5_000);
        assert!(decoded.can_http, "network list implies can_http");
    }
}
