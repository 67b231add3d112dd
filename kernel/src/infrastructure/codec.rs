// Copyright (c) 2026 clove project
// SPDX-License-Identifier: AGPL-3.0

//! Wire protocol framing.
//!
//! A frame is a fixed 17-byte header followed by `payload_size` bytes:
//!
//! ```text
//! magic:u32 | agent_id:u32 | opcode:u8 | payload_size:u64
//! ```
//!
//! All fields little-endian, packed, no alignment padding. Magic is
//! `0x41474E54` ("AGNT"); payloads are capped at 1 MiB. On a corrupted magic
//! the socket server drops exactly [`HEADER_SIZE`] bytes and resumes at the
//! next candidate header, never the whole connection.

use crate::domain::agent::AgentId;
use thiserror::Error;

pub const MAGIC: u32 = 0x4147_4E54;
pub const HEADER_SIZE: usize = 17;
pub const MAX_PAYLOAD_SIZE: u64 = 1024 * 1024;

/// Syscall opcodes. The wire carries a raw `u8`; unknown values are kept and
/// echoed back by the dispatcher for protocol probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SyscallOp {
    Noop = 0x00,
    Think = 0x01,
    Exec = 0x02,
    Read = 0x03,
    Write = 0x04,

    Spawn = 0x10,
    Kill = 0x11,
    List = 0x12,
    Pause = 0x14,
    Resume = 0x15,

    Send = 0x20,
    Recv = 0x21,
    Broadcast = 0x22,
    Register = 0x23,

    Store = 0x30,
    Fetch = 0x31,
    Delete = 0x32,
    Keys = 0x33,

    GetPerms = 0x40,
    SetPerms = 0x41,

    Http = 0x50,

    Subscribe = 0x60,
    Unsubscribe = 0x61,
    PollEvents = 0x62,
    Emit = 0x63,

    RecordStart = 0x70,
    RecordStop = 0x71,
    RecordStatus = 0x72,
    ReplayStart = 0x73,
    ReplayStatus = 0x74,
    GetAuditLog = 0x76,
    SetAuditConfig = 0x77,

    WorldCreate = 0xA0,
    WorldDestroy = 0xA1,
    WorldList = 0xA2,
    WorldJoin = 0xA3,
    WorldLeave = 0xA4,
    WorldEvent = 0xA5,
    WorldState = 0xA6,
    WorldSnapshot = 0xA7,
    WorldRestore = 0xA8,

    TunnelConnect = 0xB0,
    TunnelDisconnect = 0xB1,
    TunnelStatus = 0xB2,
    TunnelListRemotes = 0xB3,
    TunnelConfig = 0xB4,

    MetricsSystem = 0xC0,
    MetricsAgent = 0xC1,
    MetricsAllAgents = 0xC2,
    MetricsCgroup = 0xC3,

    Exit = 0xFF,
}

impl SyscallOp {
    pub fn from_u8(op: u8) -> Option<SyscallOp> {
        Some(match op {
            0x00 => SyscallOp::Noop,
            0x01 => SyscallOp::Think,
            0x02 => SyscallOp::Exec,
            0x03 => SyscallOp::Read,
            0x04 => SyscallOp::Write,
            0x10 => SyscallOp::Spawn,
            0x11 => SyscallOp::Kill,
            0x12 => SyscallOp::List,
            0x14 => SyscallOp::Pause,
            0x15 => SyscallOp::Resume,
            0x20 => SyscallOp::Send,
            0x21 => SyscallOp::Recv,
            0x22 => SyscallOp::Broadcast,
            0x23 => SyscallOp::Register,
            0x30 => SyscallOp::Store,
            0x31 => SyscallOp::Fetch,
            0x32 => SyscallOp::Delete,
            0x33 => SyscallOp::Keys,
            0x40 => SyscallOp::GetPerms,
            0x41 => SyscallOp::SetPerms,
            0x50 => SyscallOp::Http,
            0x60 => SyscallOp::Subscribe,
            0x61 => SyscallOp::Unsubscribe,
            0x62 => SyscallOp::PollEvents,
            0x63 => SyscallOp::Emit,
            0x70 => SyscallOp::RecordStart,
            0x71 => SyscallOp::RecordStop,
            0x72 => SyscallOp::RecordStatus,
            0x73 => SyscallOp::ReplayStart,
            0x74 => SyscallOp::ReplayStatus,
            0x76 => SyscallOp::GetAuditLog,
            0x77 => SyscallOp::SetAuditConfig,
            0xA0 => SyscallOp::WorldCreate,
            0xA1 => SyscallOp::WorldDestroy,
            0xA2 => SyscallOp::WorldList,
            0xA3 => SyscallOp::WorldJoin,
            0xA4 => SyscallOp::WorldLeave,
            0xA5 => SyscallOp::WorldEvent,
            0xA6 => SyscallOp::WorldState,
            0xA7 => SyscallOp::WorldSnapshot,
            0xA8 => SyscallOp::WorldRestore,
            0xB0 => SyscallOp::TunnelConnect,
            0xB1 => SyscallOp::TunnelDisconnect,
            0xB2 => SyscallOp::TunnelStatus,
            0xB3 => SyscallOp::TunnelListRemotes,
            0xB4 => SyscallOp::TunnelConfig,
            0xC0 => SyscallOp::MetricsSystem,
            0xC1 => SyscallOp::MetricsAgent,
            0xC2 => SyscallOp::MetricsAllAgents,
            0xC3 => SyscallOp::MetricsCgroup,
            0xFF => SyscallOp::Exit,
            _ => return None,
        })
    }

    pub fn name(op: u8) -> &'static str {
        match SyscallOp::from_u8(op) {
            Some(SyscallOp::Noop) => "NOOP",
            Some(SyscallOp::Think) => "THINK",
            Some(SyscallOp::Exec) => "EXEC",
            Some(SyscallOp::Read) => "READ",
            Some(SyscallOp::Write) => "WRITE",
            Some(SyscallOp::Spawn) => "SPAWN",
            Some(SyscallOp::Kill) => "KILL",
            Some(SyscallOp::List) => "LIST",
            Some(SyscallOp::Pause) => "PAUSE",
            Some(SyscallOp::Resume) => "RESUME",
            Some(SyscallOp::Send) => "SEND",
            Some(SyscallOp::Recv) => "RECV",
            Some(SyscallOp::Broadcast) => "BROADCAST",
            Some(SyscallOp::Register) => "REGISTER",
            Some(SyscallOp::Store) => "STORE",
            Some(SyscallOp::Fetch) => "FETCH",
            Some(SyscallOp::Delete) => "DELETE",
            Some(SyscallOp::Keys) => "KEYS",
            Some(SyscallOp::GetPerms) => "GET_PERMS",
            Some(SyscallOp::SetPerms) => "SET_PERMS",
            Some(SyscallOp::Http) => "HTTP",
            Some(SyscallOp::Subscribe) => "SUBSCRIBE",
            Some(SyscallOp::Unsubscribe) => "UNSUBSCRIBE",
            Some(SyscallOp::PollEvents) => "POLL_EVENTS",
            Some(SyscallOp::Emit) => "EMIT",
            Some(SyscallOp::RecordStart) => "RECORD_START",
            Some(SyscallOp::RecordStop) => "RECORD_STOP",
            Some(SyscallOp::RecordStatus) => "RECORD_STATUS",
            Some(SyscallOp::ReplayStart) => "REPLAY_START",
            Some(SyscallOp::ReplayStatus) => "REPLAY_STATUS",
            Some(SyscallOp::GetAuditLog) => "GET_AUDIT_LOG",
            Some(SyscallOp::SetAuditConfig) => "SET_AUDIT_CONFIG",
            Some(SyscallOp::WorldCreate) => "WORLD_CREATE",
            Some(SyscallOp::WorldDestroy) => "WORLD_DESTROY",
            Some(SyscallOp::WorldList) => "WORLD_LIST",
            Some(SyscallOp::WorldJoin) => "WORLD_JOIN",
            Some(SyscallOp::WorldLeave) => "WORLD_LEAVE",
            Some(SyscallOp::WorldEvent) => "WORLD_EVENT",
            Some(SyscallOp::WorldState) => "WORLD_STATE",
            Some(SyscallOp::WorldSnapshot) => "WORLD_SNAPSHOT",
            Some(SyscallOp::WorldRestore) => "WORLD_RESTORE",
            Some(SyscallOp::TunnelConnect) => "TUNNEL_CONNECT",
            Some(SyscallOp::TunnelDisconnect) => "TUNNEL_DISCONNECT",
            Some(SyscallOp::TunnelStatus) => "TUNNEL_STATUS",
            Some(SyscallOp::TunnelListRemotes) => "TUNNEL_LIST_REMOTES",
            Some(SyscallOp::TunnelConfig) => "TUNNEL_CONFIG",
            Some(SyscallOp::MetricsSystem) => "METRICS_SYSTEM",
            Some(SyscallOp::MetricsAgent) => "METRICS_AGENT",
            Some(SyscallOp::MetricsAllAgents) => "METRICS_ALL_AGENTS",
            Some(SyscallOp::MetricsCgroup) => "METRICS_CGROUP",
            Some(SyscallOp::Exit) => "EXIT",
            None => "UNKNOWN",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid magic bytes 0x{0:08x}")]
    InvalidMagic(u32),
    #[error("payload size {0} exceeds maximum {MAX_PAYLOAD_SIZE}")]
    PayloadTooLarge(u64),
    #[error("short read: need {need} bytes, have {have}")]
    ShortRead { need: usize, have: usize },
}

/// A decoded request or response frame. The opcode stays raw so unknown
/// values survive the round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub agent_id: AgentId,
    pub opcode: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(agent_id: AgentId, opcode: SyscallOp, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            agent_id,
            opcode: opcode as u8,
            payload: payload.into(),
        }
    }

    pub fn raw(agent_id: AgentId, opcode: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            agent_id,
            opcode,
            payload: payload.into(),
        }
    }

    pub fn op(&self) -> Option<SyscallOp> {
        SyscallOp::from_u8(self.opcode)
    }

    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Serialize to wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&MAGIC.to_le_bytes());
        buf.extend_from_slice(&self.agent_id.0.to_le_bytes());
        buf.push(self.opcode);
        buf.extend_from_slice(&(self.payload.len() as u64).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Validate the header at the front of `buf` and return the total frame
/// length once at least a full header is present. `Ok(None)` means "need more
/// bytes".
pub fn peek_frame_len(buf: &[u8]) -> Result<Option<usize>, CodecError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }
    let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != MAGIC {
        return Err(CodecError::InvalidMagic(magic));
    }
    let payload_size = u64::from_le_bytes([
        buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15], buf[16],
    ]);
    if payload_size > MAX_PAYLOAD_SIZE {
        return Err(CodecError::PayloadTooLarge(payload_size));
    }
    Ok(Some(HEADER_SIZE + payload_size as usize))
}

/// Decode the frame at the front of `buf`. `total` must come from
/// [`peek_frame_len`]; fewer available bytes is a [`CodecError::ShortRead`].
pub fn decode_frame(buf: &[u8], total: usize) -> Result<Frame, CodecError> {
    if buf.len() < total {
        return Err(CodecError::ShortRead {
            need: total,
            have: buf.len(),
        });
    }
    let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != MAGIC {
        return Err(CodecError::InvalidMagic(magic));
    }
    let agent_id = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let opcode = buf[8];
    Ok(Frame {
        agent_id: AgentId(agent_id),
        opcode,
        payload: buf[HEADER_SIZE..total].to_vec(),
    })
}
