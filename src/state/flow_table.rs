use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use super::flow_key::{Endpoint, FlowKey};
use crate::engine::registry::DecoderId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowId(pub u64);

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flow#{}", self.0)
    }
}

/// Packet direction relative to the endpoint that sent the first packet of the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Originator,
    Responder,
}

impl Direction {
    pub fn index(self) -> usize {
        match self {
            Direction::Originator => 0,
            Direction::Responder => 1,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Direction::Originator => Direction::Responder,
            Direction::Responder => Direction::Originator,
        }
    }
}

/// A tracked conversation. `S` is the decoder-owned state block.
#[derive(Debug, Clone, PartialEq)]
pub struct Flow<S> {
    id: FlowId,
    key: FlowKey,
    decoder: Option<DecoderId>,
    initiator: Option<Endpoint>,
    pub state: Option<S>,
    pub first_frame: Option<u64>,
    pub last_frame: Option<u64>,
    pub packet_count: u64,
    pub byte_count: u64,
}

impl<S> Flow<S> {
    fn new(id: FlowId, key: FlowKey) -> Self {
        Self {
            id,
            key,
            decoder: None,
            initiator: None,
            state: None,
            first_frame: None,
            last_frame: None,
            packet_count: 0,
            byte_count: 0,
        }
    }

    pub fn id(&self) -> FlowId {
        self.id
    }

    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    pub fn decoder(&self) -> Option<DecoderId> {
        self.decoder
    }

    pub fn initiator(&self) -> Option<&Endpoint> {
        self.initiator.as_ref()
    }

    /// Hands the flow to `decoder`. Rebinding to a different decoder discards the
    /// previous decoder's state block, since only its owner can interpret it.
    pub fn bind(&mut self, decoder: DecoderId) {
        if self.decoder == Some(decoder) {
            return;
        }
        if let Some(previous) = self.decoder {
            debug!(flow = %self.id, ?previous, ?decoder, "rebinding flow");
            self.state = None;
        } else {
            debug!(flow = %self.id, ?decoder, "binding flow");
        }
        self.decoder = Some(decoder);
    }

    pub fn direction_of(&self, source: &Endpoint) -> Direction {
        match &self.initiator {
            Some(initiator) if initiator != source => Direction::Responder,
            _ => Direction::Originator,
        }
    }

    /// Updates counters for a first-pass packet and returns its direction.
    pub fn observe(&mut self, frame: u64, source: &Endpoint, bytes: usize) -> Direction {
        if self.initiator.is_none() {
            self.initiator = Some(source.clone());
        }
        self.first_frame.get_or_insert(frame);
        self.last_frame = Some(frame);
        self.packet_count += 1;
        self.byte_count += bytes as u64;
        self.direction_of(source)
    }
}

/// Owns every flow of one analysis session.
#[derive(Debug)]
pub struct FlowRegistry<S> {
    by_key: HashMap<FlowKey, FlowId>,
    flows: HashMap<FlowId, Flow<S>>,
    first_id: u64,
    next_id: u64,
    id_stride: u64,
    max_flows: usize,
}

impl<S> FlowRegistry<S> {
    pub fn new(max_flows: usize) -> Self {
        Self::with_id_space(1, 1, max_flows)
    }

    /// Registry whose identifiers are `first, first + stride, ...`, so several
    /// registries can hand out identifiers without colliding.
    pub fn with_id_space(first: u64, stride: u64, max_flows: usize) -> Self {
        Self {
            by_key: HashMap::new(),
            flows: HashMap::new(),
            first_id: first,
            next_id: first,
            id_stride: stride.max(1),
            max_flows,
        }
    }

    /// Direction-agnostic lookup without creation. A concrete key also matches a
    /// flow registered with a wildcard port.
    pub fn find(&self, key: &FlowKey) -> Option<FlowId> {
        if let Some(id) = self.by_key.get(key) {
            return Some(*id);
        }
        key.wildcard_candidates()
            .find_map(|candidate| self.by_key.get(&candidate).copied())
    }

    /// Returns the flow for `key`, creating an unbound one if needed. A wildcard
    /// match is completed: the flow is re-keyed to the concrete key.
    ///
    /// Returns `None` only when the registry is at capacity.
    pub fn find_or_create(&mut self, key: &FlowKey) -> Option<FlowId> {
        if let Some(id) = self.by_key.get(key) {
            return Some(*id);
        }

        if !key.has_wildcard()
            && let Some((wildcard, id)) = key.wildcard_candidates().find_map(|candidate| {
                let id = self.by_key.get(&candidate).copied()?;
                Some((candidate, id))
            })
        {
            self.by_key.remove(&wildcard);
            self.by_key.insert(key.clone(), id);
            if let Some(flow) = self.flows.get_mut(&id) {
                debug!(flow = %id, from = %wildcard, to = %key, "completed wildcard flow");
                flow.key = key.clone();
            }
            return Some(id);
        }

        self.create(key)
    }

    fn create(&mut self, key: &FlowKey) -> Option<FlowId> {
        if self.flows.len() >= self.max_flows {
            debug!(%key, max_flows = self.max_flows, "flow registry full");
            return None;
        }

        let id = FlowId(self.next_id);
        self.next_id += self.id_stride;
        self.by_key.insert(key.clone(), id);
        self.flows.insert(id, Flow::new(id, key.clone()));
        debug!(flow = %id, %key, "created flow");
        Some(id)
    }

    pub fn bind(&mut self, id: FlowId, decoder: DecoderId) -> bool {
        match self.flows.get_mut(&id) {
            Some(flow) => {
                flow.bind(decoder);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: FlowId) -> Option<&Flow<S>> {
        self.flows.get(&id)
    }

    pub fn get_mut(&mut self, id: FlowId) -> Option<&mut Flow<S>> {
        self.flows.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Flow<S>> {
        self.flows.values()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn capacity(&self) -> usize {
        self.max_flows
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Drops every flow and restarts identifier allocation.
    pub fn clear(&mut self) {
        self.by_key.clear();
        self.flows.clear();
        self.next_id = self.first_id;
    }
}
