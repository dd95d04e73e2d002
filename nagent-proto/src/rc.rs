//! Return codes carried by `ResponseReturnCode`.
//!
//! Zero is success; negative values are domain error codes.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnCode {
    Success,
    ProtocolError,
    InvalidCredential,
    NoSlots,
    ForkFailed,
    UnknownStep,
    StepExists,
    StepBusy,
    InvalidRequest,
    /// A code this build does not know about.
    Other(i32),
}

impl ReturnCode {
    pub fn code(self) -> i32 {
        match self {
            ReturnCode::Success => 0,
            ReturnCode::ProtocolError => -1,
            ReturnCode::InvalidCredential => -2001,
            ReturnCode::NoSlots => -2002,
            ReturnCode::ForkFailed => -2003,
            ReturnCode::UnknownStep => -2004,
            ReturnCode::StepExists => -2005,
            ReturnCode::StepBusy => -2006,
            ReturnCode::InvalidRequest => -2007,
            ReturnCode::Other(code) => code,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ReturnCode::Success,
            -1 => ReturnCode::ProtocolError,
            -2001 => ReturnCode::InvalidCredential,
            -2002 => ReturnCode::NoSlots,
            -2003 => ReturnCode::ForkFailed,
            -2004 => ReturnCode::UnknownStep,
            -2005 => ReturnCode::StepExists,
            -2006 => ReturnCode::StepBusy,
            -2007 => ReturnCode::InvalidRequest,
            other => ReturnCode::Other(other),
        }
    }

    pub fn is_success(self) -> bool {
        self == ReturnCode::Success
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReturnCode::Success => write!(f, "success"),
            ReturnCode::ProtocolError => write!(f, "protocol error"),
            ReturnCode::InvalidCredential => write!(f, "invalid job credential"),
            ReturnCode::NoSlots => write!(f, "no free task slots"),
            ReturnCode::ForkFailed => write!(f, "fork failed"),
            ReturnCode::UnknownStep => write!(f, "unknown job step"),
            ReturnCode::StepExists => write!(f, "job step already exists"),
            ReturnCode::StepBusy => write!(f, "job step has active tasks"),
            ReturnCode::InvalidRequest => write!(f, "invalid request"),
            ReturnCode::Other(code) => write!(f, "error code {code}"),
        }
    }
}
