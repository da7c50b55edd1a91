use std::collections::BTreeMap;

use crate::engine::constants::DEFAULT_MAX_MESSAGE_LEN;

/// What the transport caller should do with a segment after pushing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentEvent {
    /// Deliver `data`, which starts at absolute `stream_offset`.
    Ready { stream_offset: u64, data: Vec<u8> },
    /// Bytes were held; `missing` more are needed before delivery.
    Pending { missing: usize },
    Gap { expected: u64, got: u64 },
    Duplicate { offset: u64 },
    /// An early segment that would take parked bytes past the limit. It was
    /// discarded and has to be delivered again.
    Dropped { offset: u64, len: usize },
}

/// A request for more bytes that the stream ended before satisfying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Truncated {
    pub resume_at: u64,
    pub held: usize,
    pub missing: usize,
}

#[derive(Debug)]
struct Held {
    resume_at: u64,
    data: Vec<u8>,
    required: usize,
}

/// Buffers one direction of a stream on behalf of a decoder that answered
/// `NeedMoreBytes`.
///
/// Early segments are parked until the gap before them fills. Parked bytes
/// never exceed `limit`, and nothing ending more than `limit` bytes past the
/// expected offset is parked at all.
#[derive(Debug)]
pub struct SegmentBuffer {
    held: Option<Held>,
    next_offset: Option<u64>,
    out_of_order: BTreeMap<u64, Vec<u8>>,
    parked: usize,
    limit: usize,
}

impl Default for SegmentBuffer {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_MESSAGE_LEN)
    }
}

impl SegmentBuffer {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            held: None,
            next_offset: None,
            out_of_order: BTreeMap::new(),
            parked: 0,
            limit,
        }
    }

    /// Bytes waiting for a gap to fill.
    pub fn parked(&self) -> usize {
        self.parked
    }

    /// Keeps `tail` (the delivered bytes from `resume_at` on) until `additional`
    /// further bytes arrive.
    pub fn hold(&mut self, resume_at: u64, tail: &[u8], additional: usize) {
        self.next_offset = Some(resume_at + tail.len() as u64);
        self.held = Some(Held {
            resume_at,
            data: tail.to_vec(),
            required: tail.len() + additional,
        });
    }

    pub fn is_holding(&self) -> bool {
        self.held.is_some()
    }

    pub fn push(&mut self, offset: u64, payload: &[u8]) -> SegmentEvent {
        let expected = match self.next_offset {
            Some(expected) => expected,
            None => {
                self.next_offset = Some(offset + payload.len() as u64);
                return SegmentEvent::Ready {
                    stream_offset: offset,
                    data: payload.to_vec(),
                };
            }
        };

        if offset < expected {
            return SegmentEvent::Duplicate { offset };
        }

        if offset > expected {
            return self.park(expected, offset, payload);
        }

        let mut data = payload.to_vec();
        let mut next = expected + payload.len() as u64;
        while let Some(chunk) = self.out_of_order.remove(&next) {
            self.parked -= chunk.len();
            next += chunk.len() as u64;
            data.extend_from_slice(&chunk);
        }
        self.next_offset = Some(next);

        let Some(mut held) = self.held.take() else {
            return SegmentEvent::Ready {
                stream_offset: offset,
                data,
            };
        };

        held.data.extend_from_slice(&data);
        if held.data.len() < held.required {
            let missing = held.required - held.data.len();
            self.held = Some(held);
            return SegmentEvent::Pending { missing };
        }

        SegmentEvent::Ready {
            stream_offset: held.resume_at,
            data: held.data,
        }
    }

    fn park(&mut self, expected: u64, offset: u64, payload: &[u8]) -> SegmentEvent {
        let reach = offset - expected + payload.len() as u64;
        let replaced = self.out_of_order.get(&offset).map_or(0, Vec::len);
        if reach > self.limit as u64 || self.parked - replaced + payload.len() > self.limit {
            return SegmentEvent::Dropped {
                offset,
                len: payload.len(),
            };
        }
        self.parked = self.parked - replaced + payload.len();
        self.out_of_order.insert(offset, payload.to_vec());
        SegmentEvent::Gap {
            expected,
            got: offset,
        }
    }

    /// The stream ended. Any outstanding request is reported as truncated.
    pub fn close(&mut self) -> Option<Truncated> {
        self.next_offset = None;
        self.out_of_order.clear();
        self.parked = 0;
        let held = self.held.take()?;
        Some(Truncated {
            resume_at: held.resume_at,
            held: held.data.len(),
            missing: held.required.saturating_sub(held.data.len()),
        })
    }
}
