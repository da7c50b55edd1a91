pub mod flow_key;
pub mod flow_table;
pub mod memo;
pub mod segments;
pub mod transactions;

pub use flow_key::{Address, Endpoint, FlowKey, Transport};
pub use flow_table::{Direction, Flow, FlowId, FlowRegistry};
pub use memo::{AlreadyRecorded, FrameMemo};
pub use segments::{SegmentBuffer, SegmentEvent, Truncated};
pub use transactions::{Completion, OpenOutcome, Transaction, TransactionKey, TransactionTable};
