//! Message header and typed message bodies.
//!
//! Every datagram is a fixed 10-byte header followed by exactly
//! `payload_length` bytes of body:
//!
//! ```text
//! +---------+---------+---------+----------------+
//! | version |  type   |  flags  | payload_length |
//! |   u16   |   u16   |   u16   |      u32       |
//! +---------+---------+---------+----------------+
//! ```

use crate::pack::{PackError, Packer, Unpacker};
use crate::rc::ReturnCode;
use std::net::SocketAddr;
use thiserror::Error;

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u16 = 2;

/// Size of the fixed header.
pub const HEADER_LEN: usize = 10;

/// Largest message (header included) that fits in one datagram.
pub const MAX_MESSAGE_SIZE: usize = 65_507;

/// Notification that must not be answered.
pub const FLAG_NO_REPLY: u16 = 0x0001;

/// Errors raised while decoding a message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("short header: {0} bytes")]
    ShortHeader(usize),

    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u16, actual: u16 },

    #[error("payload length mismatch: header declares {declared}, {available} available")]
    LengthMismatch { declared: usize, available: usize },

    #[error("unknown message type {0}")]
    UnknownType(u16),

    #[error("{0} trailing bytes after message body")]
    TrailingBytes(usize),

    #[error("invalid task state {0}")]
    InvalidState(u16),

    #[error("codec error: {0}")]
    Pack(#[from] PackError),
}

/// Enumerated message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MsgType {
    RequestPing = 1001,
    RequestLaunchTasks = 1002,
    RequestKillTasks = 1003,
    RequestReleaseJobStep = 1004,
    RequestStepStatus = 1005,
    ResponseReturnCode = 2001,
    ResponseStepStatus = 2002,
    MessageTaskExit = 3001,
}

impl MsgType {
    pub fn from_u16(value: u16) -> Option<Self> {
        let ty = match value {
            1001 => MsgType::RequestPing,
            1002 => MsgType::RequestLaunchTasks,
            1003 => MsgType::RequestKillTasks,
            1004 => MsgType::RequestReleaseJobStep,
            1005 => MsgType::RequestStepStatus,
            2001 => MsgType::ResponseReturnCode,
            2002 => MsgType::ResponseStepStatus,
            3001 => MsgType::MessageTaskExit,
            _ => return None,
        };
        Some(ty)
    }

    /// Requests expect an answer, everything else is one-way.
    pub fn is_request(self) -> bool {
        (self as u16) < 2000
    }
}

/// Decoded fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u16,
    pub msg_type: u16,
    pub flags: u16,
    pub payload_length: u32,
}

impl Header {
    pub fn new(msg_type: MsgType, flags: u16, payload_length: usize) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            msg_type: msg_type as u16,
            flags,
            payload_length: payload_length as u32,
        }
    }

    pub fn pack(&self, p: &mut Packer) -> Result<(), PackError> {
        p.pack16(self.version)?;
        p.pack16(self.msg_type)?;
        p.pack16(self.flags)?;
        p.pack32(self.payload_length)
    }

    /// Parse the header without interpreting the payload.
    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_LEN {
            return Err(ProtocolError::ShortHeader(buf.len()));
        }
        let mut u = Unpacker::new(&buf[..HEADER_LEN]);
        Ok(Self {
            version: u.unpack16()?,
            msg_type: u.unpack16()?,
            flags: u.unpack16()?,
            payload_length: u.unpack32()?,
        })
    }

    /// Check version and declared length against the bytes that arrived.
    pub fn validate(&self, available: usize) -> Result<MsgType, ProtocolError> {
        if self.version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: self.version,
            });
        }
        let declared = self.payload_length as usize;
        if declared != available {
            return Err(ProtocolError::LengthMismatch {
                declared,
                available,
            });
        }
        MsgType::from_u16(self.msg_type).ok_or(ProtocolError::UnknownType(self.msg_type))
    }
}

/// Lifecycle state of a task as reported on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum TaskState {
    Requested = 0,
    Forked = 1,
    Execed = 2,
    Running = 3,
    Exited = 4,
    Killed = 5,
}

impl TaskState {
    pub fn from_u16(value: u16) -> Option<Self> {
        let state = match value {
            0 => TaskState::Requested,
            1 => TaskState::Forked,
            2 => TaskState::Execed,
            3 => TaskState::Running,
            4 => TaskState::Exited,
            5 => TaskState::Killed,
            _ => return None,
        };
        Some(state)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Exited | TaskState::Killed)
    }

    /// States in which a process exists and may be signalled.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            TaskState::Forked | TaskState::Execed | TaskState::Running
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Requested => "requested",
            TaskState::Forked => "forked",
            TaskState::Execed => "execed",
            TaskState::Running => "running",
            TaskState::Exited => "exited",
            TaskState::Killed => "killed",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn unpack_state(u: &mut Unpacker<'_>) -> Result<TaskState, ProtocolError> {
    let raw = u.unpack16()?;
    TaskState::from_u16(raw).ok_or(ProtocolError::InvalidState(raw))
}

/// Launch one or more tasks of a job step on this node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LaunchTasksRequest {
    pub job_id: u32,
    pub step_id: u32,
    pub uid: u32,
    pub gid: u32,
    pub credential: Vec<u8>,
    pub argv: Vec<String>,
    pub env: Vec<String>,
    pub cwd: Option<String>,
    /// Global task ids, one per task to start here.
    pub global_task_ids: Vec<u32>,
    /// Where relay threads connect their I/O streams.
    pub io_addr: Option<SocketAddr>,
    /// Where task exit notifications are sent in addition to the controller.
    pub resp_addr: Option<SocketAddr>,
}

impl LaunchTasksRequest {
    pub fn task_count(&self) -> usize {
        self.global_task_ids.len()
    }

    fn pack(&self, p: &mut Packer) -> Result<(), PackError> {
        p.pack32(self.job_id)?;
        p.pack32(self.step_id)?;
        p.pack32(self.uid)?;
        p.pack32(self.gid)?;
        p.packmem(&self.credential)?;
        p.packstr_array(&self.argv)?;
        p.packstr_array(&self.env)?;
        p.packstr(self.cwd.as_deref())?;
        p.pack32_array(&self.global_task_ids)?;
        p.pack_addr(self.io_addr.as_ref())?;
        p.pack_addr(self.resp_addr.as_ref())
    }

    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, PackError> {
        Ok(Self {
            job_id: u.unpack32()?,
            step_id: u.unpack32()?,
            uid: u.unpack32()?,
            gid: u.unpack32()?,
            credential: u.unpackmem()?,
            argv: u.unpackstr_array()?,
            env: u.unpackstr_array()?,
            cwd: u.unpackstr()?,
            global_task_ids: u.unpack32_array()?,
            io_addr: u.unpack_addr()?,
            resp_addr: u.unpack_addr()?,
        })
    }
}

/// Deliver a signal to every live task of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KillTasksRequest {
    pub job_id: u32,
    pub step_id: u32,
    pub signal: u32,
}

/// Identifies a step for release and status requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepId {
    pub job_id: u32,
    pub step_id: u32,
}

impl StepId {
    fn pack(&self, p: &mut Packer) -> Result<(), PackError> {
        p.pack32(self.job_id)?;
        p.pack32(self.step_id)
    }

    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, PackError> {
        Ok(Self {
            job_id: u.unpack32()?,
            step_id: u.unpack32()?,
        })
    }
}

/// One task row of a step status response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskStatusEntry {
    pub task_id: u32,
    pub pid: u32,
    pub state: TaskState,
    pub exit_code: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepStatusResponse {
    pub node_name: String,
    pub job_id: u32,
    pub step_id: u32,
    pub capacity: u32,
    pub tasks: Vec<TaskStatusEntry>,
}

impl StepStatusResponse {
    fn pack(&self, p: &mut Packer) -> Result<(), PackError> {
        p.packstr(Some(&self.node_name))?;
        p.pack32(self.job_id)?;
        p.pack32(self.step_id)?;
        p.pack32(self.capacity)?;
        p.pack32(self.tasks.len() as u32)?;
        for t in &self.tasks {
            p.pack32(t.task_id)?;
            p.pack32(t.pid)?;
            p.pack16(t.state as u16)?;
            p.pack_i32(t.exit_code)?;
        }
        Ok(())
    }

    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, ProtocolError> {
        let node_name = u.unpackstr()?.unwrap_or_default();
        let job_id = u.unpack32()?;
        let step_id = u.unpack32()?;
        let capacity = u.unpack32()?;
        let count = u.unpack32()? as usize;
        // 14 bytes per entry.
        if count.saturating_mul(14) > u.remaining() {
            return Err(PackError::Truncated {
                needed: count.saturating_mul(14),
                remaining: u.remaining(),
            }
            .into());
        }
        let mut tasks = Vec::with_capacity(count);
        for _ in 0..count {
            tasks.push(TaskStatusEntry {
                task_id: u.unpack32()?,
                pid: u.unpack32()?,
                state: unpack_state(u)?,
                exit_code: u.unpack_i32()?,
            });
        }
        Ok(Self {
            node_name,
            job_id,
            step_id,
            capacity,
            tasks,
        })
    }
}

/// Terminal status of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskExitMsg {
    pub job_id: u32,
    pub step_id: u32,
    pub task_id: u32,
    pub state: TaskState,
    pub exit_code: i32,
    /// Terminating signal, 0 when the task exited on its own.
    pub signal: u32,
    /// Setup errno when the task never reached exec, otherwise 0.
    pub errno: i32,
}

impl TaskExitMsg {
    fn pack(&self, p: &mut Packer) -> Result<(), PackError> {
        p.pack32(self.job_id)?;
        p.pack32(self.step_id)?;
        p.pack32(self.task_id)?;
        p.pack16(self.state as u16)?;
        p.pack_i32(self.exit_code)?;
        p.pack32(self.signal)?;
        p.pack_i32(self.errno)
    }

    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            job_id: u.unpack32()?,
            step_id: u.unpack32()?,
            task_id: u.unpack32()?,
            state: unpack_state(u)?,
            exit_code: u.unpack_i32()?,
            signal: u.unpack32()?,
            errno: u.unpack_i32()?,
        })
    }
}

/// All messages understood by the node agent and its peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Ping,
    LaunchTasks(LaunchTasksRequest),
    KillTasks(KillTasksRequest),
    ReleaseJobStep(StepId),
    StepStatus(StepId),
    ReturnCode(ReturnCode),
    StepStatusResponse(StepStatusResponse),
    TaskExit(TaskExitMsg),
}

impl Message {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Message::Ping => MsgType::RequestPing,
            Message::LaunchTasks(_) => MsgType::RequestLaunchTasks,
            Message::KillTasks(_) => MsgType::RequestKillTasks,
            Message::ReleaseJobStep(_) => MsgType::RequestReleaseJobStep,
            Message::StepStatus(_) => MsgType::RequestStepStatus,
            Message::ReturnCode(_) => MsgType::ResponseReturnCode,
            Message::StepStatusResponse(_) => MsgType::ResponseStepStatus,
            Message::TaskExit(_) => MsgType::MessageTaskExit,
        }
    }

    fn flags(&self) -> u16 {
        match self {
            Message::TaskExit(_) => FLAG_NO_REPLY,
            _ => 0,
        }
    }

    /// Encode the body only.
    pub fn pack_body(&self, p: &mut Packer) -> Result<(), PackError> {
        match self {
            Message::Ping => Ok(()),
            Message::LaunchTasks(req) => req.pack(p),
            Message::KillTasks(req) => {
                p.pack32(req.job_id)?;
                p.pack32(req.step_id)?;
                p.pack32(req.signal)
            }
            Message::ReleaseJobStep(id) | Message::StepStatus(id) => id.pack(p),
            Message::ReturnCode(rc) => p.pack_i32(rc.code()),
            Message::StepStatusResponse(resp) => resp.pack(p),
            Message::TaskExit(msg) => msg.pack(p),
        }
    }

    /// Encode header and body into one datagram.
    pub fn encode(&self) -> Result<Vec<u8>, PackError> {
        let mut body = Packer::with_limit(MAX_MESSAGE_SIZE - HEADER_LEN);
        self.pack_body(&mut body)?;

        let mut out = Packer::with_limit(MAX_MESSAGE_SIZE);
        Header::new(self.msg_type(), self.flags(), body.len()).pack(&mut out)?;
        let mut bytes = out.into_inner();
        bytes.extend_from_slice(body.as_bytes());
        Ok(bytes)
    }

    /// Decode a complete datagram.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let header = Header::parse(buf)?;
        let msg_type = header.validate(buf.len() - HEADER_LEN)?;
        Self::decode_body(msg_type, &buf[HEADER_LEN..])
    }

    /// Decode a body whose header was already validated.
    pub fn decode_body(msg_type: MsgType, body: &[u8]) -> Result<Self, ProtocolError> {
        let mut u = Unpacker::new(body);
        let msg = match msg_type {
            MsgType::RequestPing => Message::Ping,
            MsgType::RequestLaunchTasks => Message::LaunchTasks(LaunchTasksRequest::unpack(&mut u)?),
            MsgType::RequestKillTasks => Message::KillTasks(KillTasksRequest {
                job_id: u.unpack32()?,
                step_id: u.unpack32()?,
                signal: u.unpack32()?,
            }),
            MsgType::RequestReleaseJobStep => Message::ReleaseJobStep(StepId::unpack(&mut u)?),
            MsgType::RequestStepStatus => Message::StepStatus(StepId::unpack(&mut u)?),
            MsgType::ResponseReturnCode => {
                Message::ReturnCode(ReturnCode::from_code(u.unpack_i32()?))
            }
            MsgType::ResponseStepStatus => {
                Message::StepStatusResponse(StepStatusResponse::unpack(&mut u)?)
            }
            MsgType::MessageTaskExit => Message::TaskExit(TaskExitMsg::unpack(&mut u)?),
        };
        if u.remaining() != 0 {
            return Err(ProtocolError::TrailingBytes(u.remaining()));
        }
        Ok(msg)
    }
}
