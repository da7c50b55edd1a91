pub mod constants;
pub mod context;
pub mod cursor;
pub mod error;
pub mod framing;
pub mod machine;
pub mod registry;
pub mod session;
pub mod shard;
pub mod tree;

pub use context::{Correlation, Effect, EngineConfig, FlowContext, ProbeContext, ReplayContext};
pub use cursor::{Cursor, Endian};
pub use error::{DecodeError, DecodeWarning, EngineError, WarningCode};
pub use framing::{Carryover, LengthPrefixed, Need, SegmentController, Split, Tail};
pub use machine::{Advance, Machine, MachineState};
pub use registry::{DecoderId, DecoderRegistry, FlowDecoder, Outcome, ProbeResult};
pub use session::{FrameFacts, FrameReport, FrameStatus, Session};
pub use shard::ShardedSession;
pub use tree::{Field, FieldTree};
