use super::context::{FlowContext, ProbeContext, ReplayContext};
use super::session::{FrameFacts, FrameStatus};
use super::tree::FieldTree;
use crate::packet::Packet;
use crate::protocols::FrameDetail;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecoderId {
    Socks,
    SocksUdp,
    Rpc,
    Beep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    NoMatch,
    Match { priority: u8 },
}

/// What the first pass of a decoder concluded about one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub status: FrameStatus,
    pub detail: FrameDetail,
}

impl Outcome {
    pub fn new(status: FrameStatus, detail: FrameDetail) -> Self {
        Self { status, detail }
    }
}

/// A stateful protocol decoder bound to flows.
///
/// `dissect` runs once per frame, on the first pass, and is the only place a
/// decoder may touch flow state, the transaction table or request effects.
/// `render` builds the field tree from the packet bytes and the recorded facts
/// alone; the session calls it on every pass so output never depends on which
/// pass produced it.
pub trait FlowDecoder: Send + Sync {
    fn id(&self) -> DecoderId;

    fn name(&self) -> &'static str;

    fn probe(&self, packet: &Packet<'_>, context: &ProbeContext<'_>) -> ProbeResult;

    fn dissect(&self, packet: &Packet<'_>, context: &mut FlowContext<'_>) -> Outcome;

    fn render(
        &self,
        packet: &Packet<'_>,
        facts: &FrameFacts,
        context: &ReplayContext<'_>,
    ) -> FieldTree;
}

#[derive(Default)]
pub struct DecoderRegistry {
    decoders: Vec<Box<dyn FlowDecoder>>,
}

impl DecoderRegistry {
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        registry.register(crate::protocols::socks::SocksDecoder);
        registry.register(crate::protocols::socks::SocksUdpDecoder);
        registry.register(crate::protocols::rpc::RpcDecoder);
        registry.register(crate::protocols::beep::BeepDecoder);
        registry
    }

    /// Adds a decoder, replacing any previously registered one with the same id.
    pub fn register<D>(&mut self, decoder: D)
    where
        D: FlowDecoder + 'static,
    {
        self.decoders.retain(|existing| existing.id() != decoder.id());
        self.decoders.push(Box::new(decoder));
    }

    pub fn get(&self, id: DecoderId) -> Option<&dyn FlowDecoder> {
        self.decoders
            .iter()
            .find(|decoder| decoder.id() == id)
            .map(|decoder| decoder.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Highest-priority decoder claiming the packet; ties go to the earliest registered.
    pub fn best_match(
        &self,
        packet: &Packet<'_>,
        context: &ProbeContext<'_>,
    ) -> Option<DecoderId> {
        let mut best: Option<(u8, DecoderId)> = None;

        for decoder in &self.decoders {
            if let ProbeResult::Match { priority } = decoder.probe(packet, context) {
                match best {
                    Some((best_priority, _)) if best_priority >= priority => {}
                    _ => best = Some((priority, decoder.id())),
                }
            }
        }

        best.map(|(_, id)| id)
    }
}
