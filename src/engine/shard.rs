use parking_lot::Mutex;
use tracing::{debug, instrument};

use super::context::{Effect, EngineConfig};
use super::error::EngineError;
use super::session::{FrameReport, Session, ShardRoute, shard_of};
use crate::packet::Packet;
use crate::state::FlowKey;

/// A session split into independently locked shards.
///
/// Flows are assigned by a hash of their addresses and transport only, so both
/// directions of a conversation and any negotiated channel between the same
/// hosts meet in one shard. Flow ids are interleaved across shards and stay
/// unique. `max_flows` is a session-wide cap split evenly between the shards.
/// Effects that concern another shard are forwarded after the delivering
/// shard's lock is released.
pub struct ShardedSession {
    shards: Vec<Mutex<Session>>,
}

impl ShardedSession {
    pub fn new(config: EngineConfig, count: usize) -> Self {
        let count = count.max(1);
        let shards = (0..count)
            .map(|index| {
                let route = ShardRoute { index, count };
                Mutex::new(Session::shard(config.clone(), route))
            })
            .collect();
        Self { shards }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_for(&self, key: &FlowKey) -> usize {
        shard_of(key, self.shards.len())
    }

    #[instrument(skip_all, level = "trace", fields(frame = packet.frame))]
    pub fn deliver(&self, packet: &Packet<'_>) -> Result<FrameReport, EngineError> {
        let index = self.shard_for(&packet.key());
        let (report, outbox) = {
            let mut shard = self.shards[index].lock();
            let report = shard.deliver(packet)?;
            (report, shard.take_outbox())
        };
        self.forward(outbox);
        Ok(report)
    }

    fn forward(&self, effects: Vec<Effect>) {
        for effect in effects {
            match &effect {
                Effect::OpenFlow { key, .. } => {
                    let index = self.shard_for(key);
                    debug!(%key, shard = index, "forwarding negotiated flow");
                    self.shards[index].lock().apply_local(effect);
                }
                Effect::LearnRpcPort { .. } => {
                    for shard in &self.shards {
                        shard.lock().apply_local(effect.clone());
                    }
                }
            }
        }
    }

    /// Runs `f` against one shard while holding its lock.
    pub fn with_shard<R>(&self, index: usize, f: impl FnOnce(&Session) -> R) -> Option<R> {
        self.shards.get(index).map(|shard| f(&shard.lock()))
    }

    pub fn flow_count(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().flows().len()).sum()
    }

    /// Stops the world: every shard is locked before any is cleared.
    pub fn reset(&self) {
        let mut guards: Vec<_> = self.shards.iter().map(|shard| shard.lock()).collect();
        for guard in &mut guards {
            guard.reset();
        }
    }

    pub fn reconfigure(&self, config: EngineConfig) {
        let mut guards: Vec<_> = self.shards.iter().map(|shard| shard.lock()).collect();
        for guard in &mut guards {
            guard.reconfigure(config.clone());
        }
    }
}
