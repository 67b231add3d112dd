// Copyright (c) 2026 clove project
// SPDX-License-Identifier: AGPL-3.0

//! Kernel façade: owns every subsystem and drives the event loop.
//!
//! The loop is single-threaded and cooperative: one reactor poll, then the
//! per-tick housekeeping (tunnel events, dead-agent reaping, pending
//! restarts). Shutdown uses the self-pipe trick: the SIGINT/SIGTERM
//! handlers write one byte into a pipe the reactor watches, and the loop
//! treats it as an ordinary readable event. No global kernel pointer exists.

use crate::application::dispatcher::{self, KernelServices};
use crate::config::KernelConfig;
use crate::error::KernelError;
use crate::infrastructure::reactor::{HandlerKind, Interest, Reactor, Readiness};
use crate::infrastructure::socket_server::SocketServer;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Write end of the shutdown self-pipe, published for the signal handlers.
static SIGNAL_PIPE_WRITE: AtomicI32 = AtomicI32::new(-1);

extern "C" fn request_shutdown(_signum: nix::libc::c_int) {
    let fd = SIGNAL_PIPE_WRITE.load(Ordering::Relaxed);
    if fd >= 0 {
        // async-signal-safe; the pipe is nonblocking so a full pipe is a
        // no-op rather than a hang.
        unsafe {
            nix::libc::write(fd, b"x".as_ptr().cast(), 1);
        }
    }
}

pub struct Kernel {
    services: KernelServices,
    reactor: Reactor,
    server: SocketServer,
    signal_rx: Option<OwnedFd>,
    signal_tx: Option<OwnedFd>,
    running: bool,
}

impl Kernel {
    pub fn new(config: KernelConfig) -> Result<Self, KernelError> {
        let reactor = Reactor::new()?;
        let server = SocketServer::new(config.socket_path.clone());
        Ok(Self {
            services: KernelServices::new(config),
            reactor,
            server,
            signal_rx: None,
            signal_tx: None,
            running: false,
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.services.config
    }

    pub fn services(&self) -> &KernelServices {
        &self.services
    }

    pub fn llm_model(&self) -> &str {
        &self.services.config.llm.model
    }

    pub fn llm_configured(&self) -> bool {
        self.services.llm.is_configured()
    }

    /// Bind the socket, register the listener and the shutdown pipe, install
    /// signal handlers. Failure here leaves the kernel unable to accept
    /// connections and is fatal.
    pub fn init(&mut self) -> Result<(), KernelError> {
        info!("initializing clove kernel");
        self.server.bind()?;
        let listener_fd = self
            .server
            .listener_fd()
            .expect("listener bound in bind()");
        self.reactor
            .add(listener_fd, Interest::READ, HandlerKind::Listener)?;

        let (rx, tx) = nix::unistd::pipe2(
            nix::fcntl::OFlag::O_NONBLOCK | nix::fcntl::OFlag::O_CLOEXEC,
        )
        .map_err(std::io::Error::from)?;
        SIGNAL_PIPE_WRITE.store(tx.as_raw_fd(), Ordering::Relaxed);
        self.reactor
            .add(rx.as_raw_fd(), Interest::READ, HandlerKind::SignalPipe)?;
        self.signal_rx = Some(rx);
        self.signal_tx = Some(tx);

        let action = SigAction::new(
            SigHandler::Handler(request_shutdown),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        // SAFETY: the handler only touches an atomic and write(2).
        unsafe {
            sigaction(Signal::SIGINT, &action).map_err(std::io::Error::from)?;
            sigaction(Signal::SIGTERM, &action).map_err(std::io::Error::from)?;
        }

        info!(
            "kernel initialized (socket={}, sandboxing={}, llm={})",
            self.services.config.socket_path.display(),
            self.services.config.enable_sandboxing,
            if self.services.llm.is_configured() {
                "configured"
            } else {
                "not configured"
            }
        );
        Ok(())
    }

    /// Run until a shutdown request arrives, then tear everything down.
    pub fn run(&mut self) {
        self.running = true;
        info!(
            "clove kernel running on {}",
            self.services.config.socket_path.display()
        );

        let mut ready: Vec<(RawFd, HandlerKind, Readiness)> = Vec::new();
        while self.running {
            if let Err(e) = self.reactor.poll(100, &mut ready) {
                error!("reactor poll failed: {e}");
                break;
            }
            // Drain the current batch before the per-tick housekeeping.
            let batch: Vec<(RawFd, HandlerKind, Readiness)> = ready.drain(..).collect();
            for (fd, kind, readiness) in batch {
                match kind {
                    HandlerKind::Listener => self.on_listener_ready(),
                    HandlerKind::Client => self.on_client_ready(fd, readiness),
                    HandlerKind::SignalPipe => self.on_signal_pipe(fd),
                }
            }

            self.services.tunnel.process_events();

            let now = Instant::now();
            let reaped = self.services.supervisor.reap_and_restart(now);
            if !reaped.is_empty() {
                self.services.publish_supervisor_events(reaped);
            }
            let restarted = self
                .services
                .supervisor
                .process_pending_restarts(now, &mut self.services.ids);
            if !restarted.is_empty() {
                self.services.publish_supervisor_events(restarted);
            }
        }

        self.teardown();
    }

    /// Ask the loop to exit after the current tick.
    pub fn shutdown(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    fn on_listener_ready(&mut self) {
        for fd in self.server.accept_pending(&mut self.services.ids) {
            if let Err(e) = self.reactor.add(fd, Interest::READ, HandlerKind::Client) {
                warn!("failed to register client fd {fd}: {e}");
                self.server.remove_client(fd);
            }
        }
    }

    fn on_client_ready(&mut self, fd: RawFd, readiness: Readiness) {
        if readiness.closed() {
            self.drop_client(fd);
            return;
        }

        if readiness.readable {
            match self.server.handle_readable(fd) {
                Ok(frames) => {
                    for frame in frames {
                        let response = dispatcher::dispatch(&mut self.services, &frame);
                        self.server.queue_response(fd, &response);
                    }
                }
                Err(_) => {
                    self.drop_client(fd);
                    return;
                }
            }
        }

        if readiness.writable {
            if self.server.flush(fd).is_err() {
                self.drop_client(fd);
                return;
            }
        }

        // Opportunistic flush: most responses fit the socket buffer, so the
        // write interest usually never needs to be armed.
        if self.server.wants_write(fd) {
            if self.server.flush(fd).is_err() {
                self.drop_client(fd);
                return;
            }
        }
        let interest = if self.server.wants_write(fd) {
            Interest::READ_WRITE
        } else {
            Interest::READ
        };
        if let Err(e) = self.reactor.modify(fd, interest) {
            debug!("failed to update interest for fd {fd}: {e}");
            self.drop_client(fd);
        }
    }

    fn drop_client(&mut self, fd: RawFd) {
        let _ = self.reactor.remove(fd);
        self.server.remove_client(fd);
    }

    fn on_signal_pipe(&mut self, fd: RawFd) {
        // Drain whatever accumulated; one byte is enough to stop.
        let mut buf = [0u8; 16];
        while nix::unistd::read(fd, &mut buf).is_ok_and(|n| n > 0) {}
        info!("shutdown requested by signal");
        self.running = false;
    }

    fn teardown(&mut self) {
        info!("kernel shutting down");
        self.services.supervisor.stop_all();
        for fd in self.server.client_fds() {
            let _ = self.reactor.remove(fd);
        }
        if let Some(fd) = self.server.listener_fd() {
            let _ = self.reactor.remove(fd);
        }
        self.server.stop();
        SIGNAL_PIPE_WRITE.store(-1, Ordering::Relaxed);
        if let Some(rx) = self.signal_rx.take() {
            let _ = self.reactor.remove(rx.as_raw_fd());
        }
        self.signal_tx = None;
        info!("kernel stopped");
    }
}
