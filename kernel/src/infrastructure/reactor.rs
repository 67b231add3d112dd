// Copyright (c) 2026 clove project
// SPDX-License-Identifier: AGPL-3.0

//! Single-threaded, level-triggered I/O multiplexer over nonblocking file
//! descriptors.
//!
//! Registrations carry a [`HandlerKind`] tag instead of stored closures, so
//! the dispatch table stays introspectable and the kernel loop matches on the
//! tag to route readiness. Handlers must never block; anything that needs to
//! wait delegates to a helper subprocess and returns immediately.

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use std::collections::HashMap;
use std::io;
use std::os::fd::{BorrowedFd, RawFd};

/// What a registered descriptor is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// The listening Unix socket: readiness means pending accepts.
    Listener,
    /// A connected client: readable frames in, writable flushes out.
    Client,
    /// The self-pipe written by the signal handlers: readable means a
    /// shutdown request.
    SignalPipe,
}

/// Requested readiness interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READ: Interest = Interest {
        readable: true,
        writable: false,
    };
    pub const READ_WRITE: Interest = Interest {
        readable: true,
        writable: true,
    };

    fn to_flags(self) -> EpollFlags {
        let mut flags = EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP;
        if self.readable {
            flags |= EpollFlags::EPOLLIN;
        }
        if self.writable {
            flags |= EpollFlags::EPOLLOUT;
        }
        flags
    }
}

/// Observed readiness for one descriptor.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
}

impl Readiness {
    fn from_flags(flags: EpollFlags) -> Self {
        Self {
            readable: flags.contains(EpollFlags::EPOLLIN),
            writable: flags.contains(EpollFlags::EPOLLOUT),
            error: flags.contains(EpollFlags::EPOLLERR),
            hangup: flags.contains(EpollFlags::EPOLLHUP),
        }
    }

    pub fn closed(&self) -> bool {
        self.error || self.hangup
    }
}

const MAX_EVENTS: usize = 64;

pub struct Reactor {
    epoll: Epoll,
    handlers: HashMap<RawFd, HandlerKind>,
    events: Vec<EpollEvent>,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(io::Error::from)?;
        Ok(Self {
            epoll,
            handlers: HashMap::new(),
            events: vec![EpollEvent::empty(); MAX_EVENTS],
        })
    }

    pub fn add(&mut self, fd: RawFd, interest: Interest, kind: HandlerKind) -> io::Result<()> {
        let event = EpollEvent::new(interest.to_flags(), fd as u64);
        // SAFETY: the caller keeps the fd open for as long as it is registered.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll.add(borrowed, event).map_err(io::Error::from)?;
        self.handlers.insert(fd, kind);
        Ok(())
    }

    pub fn modify(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut event = EpollEvent::new(interest.to_flags(), fd as u64);
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll
            .modify(borrowed, &mut event)
            .map_err(io::Error::from)
    }

    pub fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        self.handlers.remove(&fd);
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll.delete(borrowed).map_err(io::Error::from)
    }

    pub fn registered(&self, fd: RawFd) -> Option<HandlerKind> {
        self.handlers.get(&fd).copied()
    }

    /// Wait up to `timeout_ms` and collect ready descriptors with their
    /// handler tags. EINTR (a signal landed) is reported as zero events so
    /// the caller's loop can observe the signal pipe.
    pub fn poll(
        &mut self,
        timeout_ms: u16,
        out: &mut Vec<(RawFd, HandlerKind, Readiness)>,
    ) -> io::Result<usize> {
        out.clear();
        let n = match self.epoll.wait(&mut self.events, timeout_ms) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => 0,
            Err(e) => return Err(io::Error::from(e)),
        };
        for event in &self.events[..n] {
            let fd = event.data() as RawFd;
            if let Some(kind) = self.handlers.get(&fd) {
                out.push((fd, *kind, Readiness::from_flags(event.events())));
            }
        }
        Ok(n)
    }
}
