use tracing::{debug, instrument, trace};

use super::context::{Effect, EngineConfig, FlowContext, ProbeContext, ReplayContext};
use super::error::{DecodeWarning, EngineError, WarningCode};
use super::registry::{DecoderId, DecoderRegistry};
use super::tree::FieldTree;
use crate::packet::Packet;
use crate::protocols::rpc::PortMap;
use crate::protocols::{CallInfo, FrameDetail, ProtocolState};
use crate::state::{Direction, Flow, FlowId, FlowKey, FlowRegistry, FrameMemo, TransactionTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Decoded,
    /// The frame ends inside a message; redeliver from `resume_at` once
    /// `additional` more bytes are available.
    NeedMoreBytes { resume_at: u64, additional: usize },
    Truncated,
    Malformed,
    Opaque,
    /// Replay of a frame that never had a first pass.
    NotVisited,
}

/// Everything the first pass decided about a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameFacts {
    pub flow: Option<FlowId>,
    pub decoder: Option<DecoderId>,
    pub direction: Direction,
    pub status: FrameStatus,
    pub warnings: Vec<DecodeWarning>,
    pub detail: FrameDetail,
}

impl FrameFacts {
    fn opaque(flow: Option<FlowId>, direction: Direction, warnings: Vec<DecodeWarning>) -> Self {
        Self {
            flow,
            decoder: None,
            direction,
            status: FrameStatus::Opaque,
            warnings,
            detail: FrameDetail::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
    pub frame: u64,
    pub flow: Option<FlowId>,
    pub decoder: Option<&'static str>,
    pub status: FrameStatus,
    pub tree: FieldTree,
    pub warnings: Vec<DecodeWarning>,
}

/// All state of one loaded capture: flows, transactions, the frame memo and the
/// decoders' private stores. Built fresh per capture and thrown away as a unit.
pub struct Session {
    config: EngineConfig,
    decoders: DecoderRegistry,
    flows: FlowRegistry<ProtocolState>,
    transactions: TransactionTable<CallInfo>,
    memo: FrameMemo<FrameFacts>,
    ports: PortMap,
    route: Option<ShardRoute>,
    outbox: Vec<Effect>,
}

/// Which flows a session owns when it is one shard of many.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ShardRoute {
    pub index: usize,
    pub count: usize,
}

impl ShardRoute {
    pub(crate) fn owns(&self, key: &FlowKey) -> bool {
        shard_of(key, self.count) == self.index
    }

    /// This shard's part of a session-wide flow cap. The parts sum to `max_flows`.
    pub(crate) fn flow_share(&self, max_flows: usize) -> usize {
        let base = max_flows / self.count;
        if self.index < max_flows % self.count {
            base + 1
        } else {
            base
        }
    }

    fn registry(&self, max_flows: usize) -> FlowRegistry<ProtocolState> {
        FlowRegistry::with_id_space(
            self.index as u64 + 1,
            self.count as u64,
            self.flow_share(max_flows),
        )
    }
}

pub(crate) fn shard_of(key: &FlowKey, count: usize) -> usize {
    (key.address_hash() % count.max(1) as u64) as usize
}

impl Default for Session {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Session {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_decoders(config, DecoderRegistry::builtin())
    }

    pub fn with_decoders(config: EngineConfig, decoders: DecoderRegistry) -> Self {
        let flows = FlowRegistry::new(config.max_flows);
        Self {
            config,
            decoders,
            flows,
            transactions: TransactionTable::default(),
            memo: FrameMemo::default(),
            ports: PortMap::default(),
            route: None,
            outbox: Vec::new(),
        }
    }

    pub(crate) fn shard(config: EngineConfig, route: ShardRoute) -> Self {
        let mut session = Self::new(config);
        session.flows = route.registry(session.config.max_flows);
        session.route = Some(route);
        session
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn flows(&self) -> &FlowRegistry<ProtocolState> {
        &self.flows
    }

    /// Registry access for callers that bind flows themselves.
    pub fn flows_mut(&mut self) -> &mut FlowRegistry<ProtocolState> {
        &mut self.flows
    }

    pub fn transactions(&self) -> &TransactionTable<CallInfo> {
        &self.transactions
    }

    pub fn memo(&self) -> &FrameMemo<FrameFacts> {
        &self.memo
    }

    pub fn ports(&self) -> &PortMap {
        &self.ports
    }

    /// Drops every flow, transaction, memo entry and learned port at once.
    pub fn reset(&mut self) {
        debug!(
            flows = self.flows.len(),
            transactions = self.transactions.len(),
            frames = self.memo.len(),
            "resetting session"
        );
        self.flows.clear();
        self.transactions.clear();
        self.memo.clear();
        self.ports.clear();
        self.outbox.clear();
    }

    /// New decode options invalidate everything decided so far.
    pub fn reconfigure(&mut self, config: EngineConfig) {
        self.reset();
        self.flows = match self.route {
            Some(route) => route.registry(config.max_flows),
            None => FlowRegistry::new(config.max_flows),
        };
        self.config = config;
    }

    /// Entry point for every frame.
    ///
    /// On the first pass the bound decoder runs and its conclusions are stored in
    /// the frame memo. Later passes only render from the memo. The only error is an
    /// exactly-once violation; every other problem is reported in the frame report.
    #[instrument(skip_all, level = "trace", fields(frame = packet.frame))]
    pub fn deliver(&mut self, packet: &Packet<'_>) -> Result<FrameReport, EngineError> {
        if packet.first_pass {
            self.first_pass(packet)
        } else {
            Ok(self.redisplay(packet))
        }
    }

    fn first_pass(&mut self, packet: &Packet<'_>) -> Result<FrameReport, EngineError> {
        let frame = packet.frame;
        if self.memo.contains(frame) {
            return Err(EngineError::MemoViolation { frame });
        }

        let key = packet.key();
        let Some(flow_id) = self.flows.find_or_create(&key) else {
            let warning = DecodeWarning::new(WarningCode::FlowLimit, "flow registry is full");
            let facts = FrameFacts::opaque(None, Direction::Originator, vec![warning]);
            return self.commit(packet, facts);
        };

        let flow = self
            .flows
            .get_mut(flow_id)
            .ok_or(EngineError::UnknownFlow(flow_id))?;
        let direction = flow.observe(frame, &packet.source, packet.len());

        let decoder_id = match flow.decoder() {
            Some(id) => Some(id),
            None => {
                let probe = ProbeContext {
                    config: &self.config,
                    key: &key,
                    ports: &self.ports,
                };
                let best = self.decoders.best_match(packet, &probe);
                if let Some(id) = best {
                    flow.bind(id);
                }
                best
            }
        };

        let Some(decoder_id) = decoder_id else {
            trace!(flow = %flow_id, "no decoder claims flow");
            let facts = FrameFacts::opaque(Some(flow_id), direction, Vec::new());
            return self.commit(packet, facts);
        };

        let Some(decoder) = self.decoders.get(decoder_id) else {
            debug!(flow = %flow_id, ?decoder_id, "flow bound to an unregistered decoder");
            let warning = DecodeWarning::new(
                WarningCode::UnknownDecoder,
                format!("no decoder registered for {decoder_id:?}"),
            );
            let facts = FrameFacts::opaque(Some(flow_id), direction, vec![warning]);
            return self.commit(packet, facts);
        };
        let flow_key = flow.key().clone();
        let mut context = FlowContext::new(
            &self.config,
            frame,
            flow_id,
            &flow_key,
            direction,
            &mut flow.state,
            &mut self.transactions,
            &self.ports,
        );
        let outcome = decoder.dissect(packet, &mut context);
        let (effects, warnings) = context.finish();
        trace!(flow = %flow_id, ?direction, status = ?outcome.status, "dissected");

        for effect in effects {
            self.apply_effect(effect);
        }

        let facts = FrameFacts {
            flow: Some(flow_id),
            decoder: Some(decoder_id),
            direction,
            status: outcome.status,
            warnings,
            detail: outcome.detail,
        };
        self.commit(packet, facts)
    }

    fn commit(
        &mut self,
        packet: &Packet<'_>,
        facts: FrameFacts,
    ) -> Result<FrameReport, EngineError> {
        let report = self.render(packet, &facts);
        self.memo
            .record(packet.frame, facts)
            .map_err(|err| EngineError::MemoViolation { frame: err.0 })?;
        Ok(report)
    }

    /// Renders a frame again from the memo without touching any state.
    pub fn redisplay(&self, packet: &Packet<'_>) -> FrameReport {
        match self.memo.lookup(packet.frame) {
            Some(facts) => self.render(packet, facts),
            None => {
                let warning = DecodeWarning::new(
                    WarningCode::NotVisited,
                    "frame was not analyzed on a first pass",
                );
                FrameReport {
                    frame: packet.frame,
                    flow: None,
                    decoder: None,
                    status: FrameStatus::NotVisited,
                    tree: opaque_tree(packet),
                    warnings: vec![warning],
                }
            }
        }
    }

    fn render(&self, packet: &Packet<'_>, facts: &FrameFacts) -> FrameReport {
        let decoder = facts.decoder.and_then(|id| self.decoders.get(id));
        let tree = match decoder {
            Some(decoder) => {
                let context = ReplayContext {
                    config: &self.config,
                    flow: facts.flow.and_then(|id| self.flows.get(id)),
                    transactions: &self.transactions,
                };
                decoder.render(packet, facts, &context)
            }
            None => opaque_tree(packet),
        };

        FrameReport {
            frame: packet.frame,
            flow: facts.flow,
            decoder: decoder.map(|decoder| decoder.name()),
            status: facts.status,
            tree,
            warnings: facts.warnings.clone(),
        }
    }

    /// Applies an effect here, or parks it in the outbox when another shard
    /// owns it. Learned ports concern every shard.
    pub(crate) fn apply_effect(&mut self, effect: Effect) {
        let local = match (&self.route, &effect) {
            (None, _) => true,
            (Some(route), Effect::OpenFlow { key, .. }) => route.owns(key),
            (Some(_), Effect::LearnRpcPort { .. }) => false,
        };
        if local {
            self.apply_local(effect);
        } else {
            self.outbox.push(effect);
        }
    }

    pub(crate) fn apply_local(&mut self, effect: Effect) {
        match effect {
            Effect::OpenFlow {
                key,
                decoder,
                state,
            } => {
                let Some(id) = self.flows.find_or_create(&key) else {
                    debug!(%key, "cannot open negotiated flow, registry full");
                    return;
                };
                if let Some(flow) = self.flows.get_mut(id) {
                    flow.bind(decoder);
                    if state.is_some() {
                        flow.state = state;
                    }
                }
            }
            Effect::LearnRpcPort {
                transport,
                port,
                program,
                version,
            } => self.ports.learn(transport, port, program, version),
        }
    }

    pub(crate) fn take_outbox(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.outbox)
    }

    pub fn flow(&self, id: FlowId) -> Option<&Flow<ProtocolState>> {
        self.flows.get(id)
    }
}

fn opaque_tree(packet: &Packet<'_>) -> FieldTree {
    let mut tree = FieldTree::default();
    if !packet.is_empty() {
        tree.push("data", 0, packet.len(), format!("Data ({} bytes)", packet.len()));
    }
    tree
}
