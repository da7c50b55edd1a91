use super::constants::{DEFAULT_MAX_MESSAGE_LEN, port};
use super::error::{DecodeWarning, WarningCode};
use super::framing::SegmentController;
use super::registry::DecoderId;
use crate::protocols::rpc::PortMap;
use crate::protocols::{CallInfo, ProtocolState};
use crate::state::{
    Direction, Flow, FlowId, FlowKey, OpenOutcome, Transaction, TransactionKey, TransactionTable,
    Transport,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Largest message a framer will wait for before declaring it malformed.
    pub max_message_len: usize,
    /// Ask the transport layer for more bytes when a message spans segments.
    /// When disabled, partial messages are reported as truncated.
    pub desegment: bool,
    pub max_flows: usize,
    pub socks_ports: Vec<u16>,
    pub rpc_ports: Vec<u16>,
    pub beep_ports: Vec<u16>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            desegment: true,
            max_flows: 1_000_000,
            socks_ports: vec![port::SOCKS],
            rpc_ports: vec![port::SUNRPC, port::NFS],
            beep_ports: vec![port::BEEP],
        }
    }
}

impl EngineConfig {
    pub fn controller(&self) -> SegmentController {
        SegmentController::new(self.max_message_len)
    }
}

/// Global side effect requested by a decoder, applied by the session after the
/// decoder returns.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Track a negotiated channel and hand it to `decoder`.
    OpenFlow {
        key: FlowKey,
        decoder: DecoderId,
        state: Option<ProtocolState>,
    },
    /// A portmapper told us where an RPC program listens.
    LearnRpcPort {
        transport: Transport,
        port: u16,
        program: u32,
        version: u32,
    },
}

/// How a request or reply related to the transaction table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    Opened,
    DuplicateRequest { original_frame: u64 },
    Matched { request_frame: u64 },
    DuplicateReply { request_frame: u64, first_reply: u64 },
    Unmatched,
}

impl Correlation {
    pub fn request_frame(&self) -> Option<u64> {
        match self {
            Correlation::Matched { request_frame }
            | Correlation::DuplicateReply { request_frame, .. } => Some(*request_frame),
            _ => None,
        }
    }

    pub fn label(&self) -> String {
        match self {
            Correlation::Opened => "Request".to_string(),
            Correlation::DuplicateRequest { original_frame } => {
                format!("Duplicate request (original in frame {original_frame})")
            }
            Correlation::Matched { request_frame } => {
                format!("Reply to request in frame {request_frame}")
            }
            Correlation::DuplicateReply {
                request_frame,
                first_reply,
            } => format!(
                "Duplicate reply to request in frame {request_frame} (first reply in frame {first_reply})"
            ),
            Correlation::Unmatched => "Reply to unseen request".to_string(),
        }
    }
}

pub struct ProbeContext<'s> {
    pub config: &'s EngineConfig,
    pub key: &'s FlowKey,
    pub ports: &'s PortMap,
}

/// First-pass view of a flow handed to its decoder.
pub struct FlowContext<'s> {
    pub config: &'s EngineConfig,
    pub frame: u64,
    pub flow: FlowId,
    pub key: &'s FlowKey,
    pub direction: Direction,
    pub state: &'s mut Option<ProtocolState>,
    pub ports: &'s PortMap,
    transactions: &'s mut TransactionTable<CallInfo>,
    effects: Vec<Effect>,
    warnings: Vec<DecodeWarning>,
}

impl<'s> FlowContext<'s> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &'s EngineConfig,
        frame: u64,
        flow: FlowId,
        key: &'s FlowKey,
        direction: Direction,
        state: &'s mut Option<ProtocolState>,
        transactions: &'s mut TransactionTable<CallInfo>,
        ports: &'s PortMap,
    ) -> Self {
        Self {
            config,
            frame,
            flow,
            key,
            direction,
            state,
            ports,
            transactions,
            effects: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn controller(&self) -> SegmentController {
        self.config.controller()
    }

    pub fn open_transaction(&mut self, id: u64, metadata: CallInfo) -> Correlation {
        match self.transactions.open(self.flow, id, self.frame, metadata) {
            OpenOutcome::Opened(_) => Correlation::Opened,
            OpenOutcome::Duplicate { original_frame, .. } => {
                self.warn(DecodeWarning::new(
                    WarningCode::DuplicateRequest,
                    format!("request {id:#x} first seen in frame {original_frame}"),
                ));
                Correlation::DuplicateRequest { original_frame }
            }
        }
    }

    pub fn complete_transaction(&mut self, id: u64) -> Correlation {
        let correlation = match self.transactions.complete(self.flow, id, self.frame) {
            None => Correlation::Unmatched,
            Some(completion) => {
                let request_frame = completion.transaction.request_frame;
                match completion.transaction.reply_frame {
                    Some(first_reply) if completion.duplicate => Correlation::DuplicateReply {
                        request_frame,
                        first_reply,
                    },
                    _ => Correlation::Matched { request_frame },
                }
            }
        };

        match correlation {
            Correlation::Unmatched => self.warn(DecodeWarning::new(
                WarningCode::UnmatchedReply,
                format!("no request with id {id:#x} on this flow"),
            )),
            Correlation::DuplicateReply { first_reply, .. } => self.warn(DecodeWarning::new(
                WarningCode::DuplicateReply,
                format!("reply {id:#x} already seen in frame {first_reply}"),
            )),
            _ => {}
        }
        correlation
    }

    pub fn peek_transaction(&self, id: u64) -> Option<&Transaction<CallInfo>> {
        self.transactions.peek(self.flow, id)
    }

    pub fn effect(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    pub fn warn(&mut self, warning: DecodeWarning) {
        self.warnings.push(warning);
    }

    pub fn finish(self) -> (Vec<Effect>, Vec<DecodeWarning>) {
        (self.effects, self.warnings)
    }
}

/// Read-only view used to render a frame.
pub struct ReplayContext<'s> {
    pub config: &'s EngineConfig,
    pub flow: Option<&'s Flow<ProtocolState>>,
    pub transactions: &'s TransactionTable<CallInfo>,
}

impl ReplayContext<'_> {
    pub fn transaction(&self, id: u64) -> Option<&Transaction<CallInfo>> {
        let flow = self.flow?.id();
        self.transactions.get(&TransactionKey { flow, id })
    }
}
