//! Error types for the node agent.

use nagent_proto::{ReturnCode, TaskState, TransportError};
use nix::errno::Errno;
use std::io;
use thiserror::Error;

/// Task registry errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No free slot left in the named table.
    #[error("no free {0} slots")]
    CapacityExceeded(&'static str),

    #[error("job step {job_id}.{step_id} already exists")]
    StepExists { job_id: u32, step_id: u32 },

    #[error("unknown job step {job_id}.{step_id}")]
    UnknownStep { job_id: u32, step_id: u32 },

    #[error("job step {job_id}.{step_id} still has {active} active tasks")]
    StepBusy {
        job_id: u32,
        step_id: u32,
        active: usize,
    },

    #[error("task {task_id} already exists in job step {job_id}.{step_id}")]
    TaskExists {
        job_id: u32,
        step_id: u32,
        task_id: u32,
    },

    /// The handle refers to a slot that has since been freed.
    #[error("stale registry handle")]
    StaleHandle,

    #[error("invalid task transition {from} -> {to}")]
    InvalidTransition { from: TaskState, to: TaskState },
}

impl RegistryError {
    pub fn return_code(&self) -> ReturnCode {
        match self {
            RegistryError::CapacityExceeded(_) => ReturnCode::NoSlots,
            RegistryError::StepExists { .. } => ReturnCode::StepExists,
            RegistryError::UnknownStep { .. } => ReturnCode::UnknownStep,
            RegistryError::StepBusy { .. } => ReturnCode::StepBusy,
            RegistryError::TaskExists { .. } => ReturnCode::InvalidRequest,
            RegistryError::StaleHandle | RegistryError::InvalidTransition { .. } => {
                ReturnCode::InvalidRequest
            }
        }
    }
}

/// Errors starting a task.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("empty command")]
    EmptyCommand,

    #[error("launch request names no tasks")]
    NoTasks,

    #[error("argument contains an interior NUL byte: {0:?}")]
    InvalidArgument(String),

    #[error("failed to create pipe: {0}")]
    Pipe(Errno),

    #[error("fork failed: {0}")]
    Fork(Errno),

    #[error("failed to spawn thread: {0}")]
    Thread(io::Error),
}

impl LaunchError {
    pub fn return_code(&self) -> ReturnCode {
        match self {
            LaunchError::Registry(e) => e.return_code(),
            LaunchError::EmptyCommand | LaunchError::NoTasks | LaunchError::InvalidArgument(_) => {
                ReturnCode::InvalidRequest
            }
            LaunchError::Pipe(_) | LaunchError::Fork(_) | LaunchError::Thread(_) => {
                ReturnCode::ForkFailed
            }
        }
    }
}

/// Top-level node agent error.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, NodeError>;
