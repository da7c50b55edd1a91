//! Stateful flow tracking and cross-packet correlation for protocol decoders.
//!
//! A [`Session`] owns everything one loaded capture needs: the flow registry,
//! the transaction table, the per-frame memo and the decoders' private state.
//! Frames are handed in with [`Session::deliver`]; the first pass over a frame
//! runs its decoder exactly once, and every later pass renders the same field
//! tree from the memo.

pub mod engine;
pub mod packet;
pub mod protocols;
pub mod state;

pub use engine::{
    DecodeError, DecodeWarning, EngineConfig, EngineError, FieldTree, FrameReport, FrameStatus,
    Session, ShardedSession, WarningCode,
};
pub use packet::Packet;
pub use state::{Address, Direction, Endpoint, FlowId, FlowKey, Transport};
