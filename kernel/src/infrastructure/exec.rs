// Copyright (c) 2026 clove project
// SPDX-License-Identifier: AGPL-3.0

//! Bounded command execution for the EXEC syscall.
//!
//! Commands are tokenized with a quote-aware splitter and run through an
//! argv vector, never a shell, so allow-list prefixes cannot be abused for
//! injection. stdout and stderr are captured separately. The wall clock is
//! enforced by polling the pipes; on expiry the child is killed and the
//! partial output returned.

use crate::error::KernelError;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::io::Read;
use std::os::fd::AsFd;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const MAX_CAPTURED_BYTES: usize = 512 * 1024;

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

/// Split a command line into argv tokens, honoring single and double quotes
/// and backslash escapes outside single quotes.
pub fn shell_words(command: &str) -> Result<Vec<String>, KernelError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut chars = command.chars().peekable();
    let mut in_word = false;

    while let Some(c) = chars.next() {
        match c {
            ' ' | '\t' | '\n' => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(inner) => current.push(inner),
                        None => {
                            return Err(KernelError::InvalidRequest(
                                "unterminated single quote in command".to_string(),
                            ))
                        }
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped @ ('"' | '\\' | '$' | '`')) => current.push(escaped),
                            Some(other) => {
                                current.push('\\');
                                current.push(other);
                            }
                            None => {
                                return Err(KernelError::InvalidRequest(
                                    "trailing backslash in command".to_string(),
                                ))
                            }
                        },
                        Some(inner) => current.push(inner),
                        None => {
                            return Err(KernelError::InvalidRequest(
                                "unterminated double quote in command".to_string(),
                            ))
                        }
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(escaped) => current.push(escaped),
                    None => {
                        return Err(KernelError::InvalidRequest(
                            "trailing backslash in command".to_string(),
                        ))
                    }
                }
            }
            other => {
                in_word = true;
                current.push(other);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    if words.is_empty() {
        return Err(KernelError::InvalidRequest("empty command".to_string()));
    }
    Ok(words)
}

/// Run `argv` with a wall-clock budget, draining stdout/stderr as the child
/// produces them so a chatty process cannot deadlock on a full pipe.
pub fn run_with_timeout(
    argv: &[String],
    cwd: Option<&str>,
    timeout: Duration,
) -> Result<ExecResult, KernelError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| KernelError::InvalidRequest("empty command".to_string()))?;

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    debug!("exec: {argv:?} (timeout {}ms)", timeout.as_millis());
    let mut child = command
        .spawn()
        .map_err(|e| KernelError::Backend(format!("failed to start command: {e}")))?;

    let mut stdout_pipe = child.stdout.take().expect("stdout piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr piped");
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut stdout_open = true;
    let mut stderr_open = true;

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;

    while stdout_open || stderr_open {
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            timed_out = true;
            break;
        };
        let wait_ms = remaining.as_millis().min(100) as u16;

        // Poll both pipes; read whichever is ready.
        let mut ready_out = false;
        let mut ready_err = false;
        {
            let mut fds = Vec::with_capacity(2);
            if stdout_open {
                fds.push(PollFd::new(stdout_pipe.as_fd(), PollFlags::POLLIN));
            }
            if stderr_open {
                fds.push(PollFd::new(stderr_pipe.as_fd(), PollFlags::POLLIN));
            }
            match poll(&mut fds, PollTimeout::from(wait_ms)) {
                Ok(0) => {}
                Ok(_) => {
                    let mut idx = 0;
                    if stdout_open {
                        ready_out = fds[idx]
                            .revents()
                            .is_some_and(|r| !r.is_empty());
                        idx += 1;
                    }
                    if stderr_open {
                        ready_err = fds[idx]
                            .revents()
                            .is_some_and(|r| !r.is_empty());
                    }
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(KernelError::Backend(format!("poll failed: {e}")));
                }
            }
        }

        let mut chunk = [0u8; 8192];
        if ready_out {
            match stdout_pipe.read(&mut chunk) {
                Ok(0) => stdout_open = false,
                Ok(n) => append_capped(&mut stdout, &chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(_) => stdout_open = false,
            }
        }
        if ready_err {
            match stderr_pipe.read(&mut chunk) {
                Ok(0) => stderr_open = false,
                Ok(n) => append_capped(&mut stderr, &chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(_) => stderr_open = false,
            }
        }
    }

    // A child may close its pipes and keep running (daemonize); the exit
    // wait is bounded by the same deadline.
    let mut exit_code = -1;
    if !timed_out {
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    exit_code = status.code().unwrap_or(-1);
                    break;
                }
                Ok(None) => {
                    if Instant::now() >= deadline {
                        timed_out = true;
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(KernelError::Backend(format!("wait failed: {e}"))),
            }
        }
    }
    if timed_out {
        warn!("command timed out after {}ms, killing", timeout.as_millis());
        let _ = child.kill();
        let _ = child.wait();
        exit_code = -1;
    }

    Ok(ExecResult {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code,
        timed_out,
    })
}

fn append_capped(buf: &mut Vec<u8>, chunk: &[u8]) {
    let room = MAX_CAPTURED_BYTES.saturating_sub(buf.len());
    buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
}
