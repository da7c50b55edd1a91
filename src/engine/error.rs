use std::fmt;

use thiserror::Error;

use super::registry::DecoderId;
use crate::state::FlowId;

/// Recoverable failure while decoding one message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("insufficient data: needed {needed} bytes, {available} available")]
    InsufficientData { needed: usize, available: usize },
    #[error("malformed {protocol} message: {reason}")]
    Malformed {
        protocol: &'static str,
        reason: &'static str,
    },
    #[error("declared message length {declared} exceeds limit {limit}")]
    Oversized { declared: usize, limit: usize },
    #[error("flow state does not belong to {expected}")]
    StateMismatch { expected: &'static str },
}

impl DecodeError {
    pub fn malformed(protocol: &'static str, reason: &'static str) -> Self {
        DecodeError::Malformed { protocol, reason }
    }

    pub fn is_insufficient(&self) -> bool {
        matches!(self, DecodeError::InsufficientData { .. })
    }
}

/// Unrecoverable engine fault. Aborts processing of the current frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("frame {frame} was already analyzed on a first pass")]
    MemoViolation { frame: u64 },
    #[error("unknown flow {0}")]
    UnknownFlow(FlowId),
    #[error("no decoder registered for {0:?}")]
    UnknownDecoder(DecoderId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WarningCode {
    UnmatchedReply,
    DuplicateRequest,
    DuplicateReply,
    Truncated,
    Malformed,
    NotVisited,
    PayloadCarryover,
    FlowLimit,
    /// The flow is bound to a decoder the session does not carry.
    UnknownDecoder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeWarning {
    pub code: WarningCode,
    pub message: String,
    pub offset: Option<usize>,
}

impl DecodeWarning {
    pub fn new(code: WarningCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            offset: None,
        }
    }

    pub fn at(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }
}

impl fmt::Display for DecodeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.offset {
            Some(offset) => write!(f, "{:?} at {}: {}", self.code, offset, self.message),
            None => write!(f, "{:?}: {}", self.code, self.message),
        }
    }
}
