// Copyright (c) 2026 clove project
// SPDX-License-Identifier: AGPL-3.0

//! Unix domain socket server.
//!
//! Accepts connections on the kernel socket, assigns each client a fresh
//! agent id, and maintains per-client receive/send buffers. Frames are
//! extracted as soon as they are complete; the client-supplied agent id in
//! the header is always overwritten with the accepted id (clients may send
//! zero). For a single connection, responses are queued in the same order
//! their requests were decoded.
//!
//! Recovery on a corrupted header drops exactly one header's worth of bytes
//! and resumes scanning; the connection stays up.

use crate::domain::agent::AgentId;
use crate::infrastructure::codec::{self, CodecError, Frame, HEADER_SIZE};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Monotonic agent id source shared by the socket server and the supervisor.
/// Ids are never reused within a kernel lifetime; zero is the kernel.
#[derive(Debug)]
pub struct AgentIdAllocator {
    next: u32,
}

impl AgentIdAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn next(&mut self) -> AgentId {
        let id = AgentId(self.next);
        self.next += 1;
        id
    }
}

impl Default for AgentIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

struct ClientConn {
    stream: UnixStream,
    agent_id: AgentId,
    recv_buf: Vec<u8>,
    send_buf: Vec<u8>,
    want_write: bool,
}

pub struct SocketServer {
    path: PathBuf,
    listener: Option<UnixListener>,
    clients: HashMap<RawFd, ClientConn>,
}

impl SocketServer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            listener: None,
            clients: HashMap::new(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    /// Bind the listening socket, replacing any stale socket file.
    pub fn bind(&mut self) -> io::Result<()> {
        let _ = std::fs::remove_file(&self.path);
        let listener = UnixListener::bind(&self.path)?;
        listener.set_nonblocking(true)?;
        info!("socket server listening on {}", self.path.display());
        self.listener = Some(listener);
        Ok(())
    }

    pub fn listener_fd(&self) -> Option<RawFd> {
        self.listener.as_ref().map(|l| l.as_raw_fd())
    }

    /// Accept every pending connection, assigning ids from `ids`.
    /// Returns the new client fds so the caller can register them.
    pub fn accept_pending(&mut self, ids: &mut AgentIdAllocator) -> Vec<RawFd> {
        let mut accepted = Vec::new();
        let Some(listener) = self.listener.as_ref() else {
            return accepted;
        };
        loop {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!("failed to set client nonblocking: {e}");
                        continue;
                    }
                    let fd = stream.as_raw_fd();
                    let agent_id = ids.next();
                    info!("agent {agent_id} connected (fd={fd})");
                    self.clients.insert(
                        fd,
                        ClientConn {
                            stream,
                            agent_id,
                            recv_buf: Vec::new(),
                            send_buf: Vec::new(),
                            want_write: false,
                        },
                    );
                    accepted.push(fd);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            }
        }
        accepted
    }

    pub fn client_agent_id(&self, fd: RawFd) -> Option<AgentId> {
        self.clients.get(&fd).map(|c| c.agent_id)
    }

    /// Drain the socket into the receive buffer and extract every complete
    /// frame. Returns the decoded requests with their agent id overwritten by
    /// the accepted id. An `Err` means the connection is gone and the caller
    /// must remove the client.
    pub fn handle_readable(&mut self, fd: RawFd) -> io::Result<Vec<Frame>> {
        let client = self
            .clients
            .get_mut(&fd)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown client fd"))?;

        let mut chunk = [0u8; 4096];
        loop {
            match client.stream.read(&mut chunk) {
                Ok(0) => {
                    info!("agent {} disconnected (fd={fd})", client.agent_id);
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "client closed connection",
                    ));
                }
                Ok(n) => client.recv_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("read error for agent {}: {e}", client.agent_id);
                    return Err(e);
                }
            }
        }

        let mut frames = Vec::new();
        loop {
            match codec::peek_frame_len(&client.recv_buf) {
                Ok(None) => break,
                Ok(Some(total)) => {
                    if client.recv_buf.len() < total {
                        break;
                    }
                    match codec::decode_frame(&client.recv_buf, total) {
                        Ok(mut frame) => {
                            client.recv_buf.drain(..total);
                            frame.agent_id = client.agent_id;
                            debug!(
                                "agent {} -> {} ({}B payload)",
                                client.agent_id,
                                codec::SyscallOp::name(frame.opcode),
                                frame.payload.len()
                            );
                            frames.push(frame);
                        }
                        Err(e) => {
                            warn!("frame decode failed for agent {}: {e}", client.agent_id);
                            client.recv_buf.drain(..HEADER_SIZE);
                        }
                    }
                }
                Err(CodecError::InvalidMagic(magic)) => {
                    warn!(
                        "invalid magic 0x{magic:08x} from agent {}, resyncing",
                        client.agent_id
                    );
                    client.recv_buf.drain(..HEADER_SIZE);
                }
                Err(CodecError::PayloadTooLarge(size)) => {
                    warn!(
                        "oversized payload ({size}B) from agent {}, resyncing",
                        client.agent_id
                    );
                    client.recv_buf.drain(..HEADER_SIZE);
                }
                Err(CodecError::ShortRead { .. }) => break,
            }
        }
        Ok(frames)
    }

    /// Append a serialized response for later flushing.
    pub fn queue_response(&mut self, fd: RawFd, frame: &Frame) {
        if let Some(client) = self.clients.get_mut(&fd) {
            debug!(
                "agent {} <- {} ({}B payload)",
                client.agent_id,
                codec::SyscallOp::name(frame.opcode),
                frame.payload.len()
            );
            client.send_buf.extend_from_slice(&frame.encode());
            client.want_write = true;
        }
    }

    /// Write as much of the send buffer as the socket accepts. An `Err`
    /// means the connection is gone.
    pub fn flush(&mut self, fd: RawFd) -> io::Result<()> {
        let client = self
            .clients
            .get_mut(&fd)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown client fd"))?;

        while !client.send_buf.is_empty() {
            match client.stream.write(&client.send_buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "client write returned zero",
                    ))
                }
                Ok(n) => {
                    client.send_buf.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        client.want_write = !client.send_buf.is_empty();
        Ok(())
    }

    pub fn wants_write(&self, fd: RawFd) -> bool {
        self.clients.get(&fd).map(|c| c.want_write).unwrap_or(false)
    }

    /// Drop a client; its socket closes with the stream. Unsent bytes and
    /// undecoded inbound bytes are discarded (no per-syscall cancellation).
    pub fn remove_client(&mut self, fd: RawFd) {
        self.clients.remove(&fd);
    }

    pub fn client_fds(&self) -> Vec<RawFd> {
        self.clients.keys().copied().collect()
    }

    /// Close every client and the listener, and unlink the socket path.
    pub fn stop(&mut self) {
        self.clients.clear();
        self.listener = None;
        let _ = std::fs::remove_file(&self.path);
        info!("socket server stopped");
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::codec::SyscallOp;
    use std::io::Write as _;
    use std::os::unix::net::UnixStream as ClientStream;

    fn temp_socket_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("clove-test-{tag}-{}.sock", std::process::id()))
    }

    #[test]
    fn accept_assigns_monotonic_ids() {
        let path = temp_socket_path("accept");
        let mut server = SocketServer::new(&path);
        server.bind().unwrap();
        let mut ids = AgentIdAllocator::new();

        let _c1 = ClientStream::connect(&path).unwrap();
        let _c2 = ClientStream::connect(&path).unwrap();
        // Nonblocking accept may race the connects; retry briefly.
        let mut fds = Vec::new();
        for _ in 0..50 {
            fds.extend(server.accept_pending(&mut ids));
            if fds.len() == 2 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(fds.len(), 2);
        let a = server.client_agent_id(fds[0]).unwrap();
        let b = server.client_agent_id(fds[1]).unwrap();
        assert!(b > a);
        server.stop();
    }

    #[test]
    fn resync_drops_exactly_one_header() {
        let path = temp_socket_path("resync");
        let mut server = SocketServer::new(&path);
        server.bind().unwrap();
        let mut ids = AgentIdAllocator::new();

        let mut client = ClientStream::connect(&path).unwrap();
        let mut fds = Vec::new();
        for _ in 0..50 {
            fds.extend(server.accept_pending(&mut ids));
            if !fds.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        let fd = fds[0];

        // 17 bytes of garbage, then a valid frame.
        let garbage = [0u8; HEADER_SIZE];
        let valid = Frame::new(AgentId(0), SyscallOp::Noop, b"hi".to_vec()).encode();
        client.write_all(&garbage).unwrap();
        client.write_all(&valid).unwrap();
        client.flush().unwrap();

        let mut frames = Vec::new();
        for _ in 0..50 {
            match server.handle_readable(fd) {
                Ok(mut f) => frames.append(&mut f),
                Err(_) => break,
            }
            if !frames.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, b"hi");
        // Server overwrote the wire id with the accepted id.
        assert_eq!(Some(frames[0].agent_id), server.client_agent_id(fd));
        server.stop();
    }
}
