//! Stateful decoders built on the flow engine.
//!
//! | Module  | Protocol                     | Well-known ports |
//! |---------|------------------------------|------------------|
//! | `socks` | SOCKS v4/v4a/v5, UDP relay   | 1080/tcp         |
//! | `rpc`   | ONC RPC, portmapper          | 111, 2049        |
//! | `beep`  | BEEP/BXXP session framing    | 10288/tcp        |

pub mod beep;
pub mod rpc;
pub mod socks;

use crate::engine::error::{DecodeError, DecodeWarning, WarningCode};
use crate::engine::registry::Outcome;
use crate::engine::session::FrameStatus;
use crate::engine::tree::FieldTree;

/// Per-flow state block, one variant per decoder.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolState {
    Socks(socks::SocksFlow),
    SocksUdp(socks::UdpRelay),
    Rpc(rpc::RpcFlow),
    Beep(beep::BeepFlow),
}

/// Request metadata kept in the transaction table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallInfo {
    Rpc(rpc::RpcCall),
    Beep(beep::BeepCall),
}

/// Decoder-private facts recorded in the frame memo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameDetail {
    None,
    Socks(socks::SocksFacts),
    Rpc(rpc::RpcFacts),
    Beep(beep::BeepFacts),
}

/// Outcome for a flow whose state block belongs to another decoder.
pub(crate) fn state_mismatch(expected: &'static str) -> Outcome {
    let error = DecodeError::StateMismatch { expected };
    tracing::debug!(%error, "flow state mismatch");
    Outcome::new(FrameStatus::Malformed, FrameDetail::None)
}

/// Status for a message that ran past the end of the frame.
pub(crate) fn incomplete(desegment: bool, resume_at: u64, additional: usize) -> FrameStatus {
    if desegment {
        FrameStatus::NeedMoreBytes {
            resume_at,
            additional,
        }
    } else {
        FrameStatus::Truncated
    }
}

pub(crate) fn incomplete_from(desegment: bool, resume_at: u64, error: &DecodeError) -> FrameStatus {
    match error {
        DecodeError::InsufficientData { needed, available } => {
            incomplete(desegment, resume_at, needed.saturating_sub(*available).max(1))
        }
        _ => FrameStatus::Malformed,
    }
}

pub(crate) fn malformed_warning(error: &DecodeError, offset: usize) -> DecodeWarning {
    DecodeWarning::new(WarningCode::Malformed, error.to_string()).at(offset)
}

/// Closing line for a frame whose last message did not fit.
pub(crate) fn push_status(
    tree: &mut FieldTree,
    protocol: &'static str,
    status: FrameStatus,
    offset: usize,
    len: usize,
) {
    match status {
        FrameStatus::NeedMoreBytes { additional, .. } => tree.push(
            protocol,
            offset,
            len.saturating_sub(offset),
            format!("[Incomplete message, {additional} more bytes needed]"),
        ),
        FrameStatus::Truncated => tree.push(
            protocol,
            offset,
            len.saturating_sub(offset),
            "[Truncated message]",
        ),
        FrameStatus::Malformed => tree.push(
            protocol,
            offset,
            len.saturating_sub(offset),
            "[Malformed message]",
        ),
        _ => {}
    }
}
