//! Header written at the start of every task I/O stream connection.
//!
//! Each task opens two connections back to the submitting client. The
//! `InOut` stream carries stdout towards the client and stdin towards the
//! task; the `SigErr` stream carries stderr towards the client and 4-byte
//! big-endian signal numbers towards the task.

use crate::message::{PROTOCOL_VERSION, ProtocolError};
use crate::pack::Unpacker;

/// Encoded size of [`IoStreamHeader`].
pub const IO_HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum StreamKind {
    InOut = 0,
    SigErr = 1,
}

impl StreamKind {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(StreamKind::InOut),
            1 => Some(StreamKind::SigErr),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoStreamHeader {
    pub kind: StreamKind,
    pub job_id: u32,
    pub step_id: u32,
    pub task_id: u32,
}

impl IoStreamHeader {
    pub fn encode(&self) -> [u8; IO_HEADER_LEN] {
        let mut out = [0u8; IO_HEADER_LEN];
        out[0..2].copy_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        out[2..4].copy_from_slice(&(self.kind as u16).to_be_bytes());
        out[4..8].copy_from_slice(&self.job_id.to_be_bytes());
        out[8..12].copy_from_slice(&self.step_id.to_be_bytes());
        out[12..16].copy_from_slice(&self.task_id.to_be_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let mut u = Unpacker::new(buf);
        let version = u.unpack16()?;
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: version,
            });
        }
        let raw_kind = u.unpack16()?;
        let kind = StreamKind::from_u16(raw_kind).ok_or(ProtocolError::UnknownType(raw_kind))?;
        Ok(Self {
            kind,
            job_id: u.unpack32()?,
            step_id: u.unpack32()?,
            task_id: u.unpack32()?,
        })
    }
}

/// Encode a signal number for the `SigErr` stream.
pub fn encode_signal(signo: u32) -> [u8; 4] {
    signo.to_be_bytes()
}

pub fn decode_signal(buf: [u8; 4]) -> u32 {
    u32::from_be_bytes(buf)
}
