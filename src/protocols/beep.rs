//! BEEP (RFC 3080, formerly BXXP) channel framing.
//!
//! A frame is an ASCII header line, `size` payload bytes and the `END\r\n`
//! trailer. Payloads run across segment boundaries freely, so each direction of
//! a flow remembers how much payload (and trailer) the next packet starts with.

use std::collections::BTreeSet;
use std::str::Split;

use tracing::debug;

use super::{CallInfo, FrameDetail, ProtocolState, incomplete, malformed_warning, push_status};
use crate::engine::context::{Correlation, FlowContext, ProbeContext, ReplayContext};
use crate::engine::error::{DecodeError, DecodeWarning, WarningCode};
use crate::engine::framing::Carryover;
use crate::engine::registry::{DecoderId, FlowDecoder, Outcome, ProbeResult};
use crate::engine::session::{FrameFacts, FrameStatus};
use crate::engine::tree::FieldTree;
use crate::packet::Packet;
use crate::state::{Direction, Transport};

const PROTO: &str = "beep";
const TRAILER: &[u8] = b"END\r\n";
const MAX_HEADER_LEN: usize = 128;
const MAX_CHANNEL: u32 = 0x7fff_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Msg,
    Rpy,
    Err,
    Ans,
    Nul,
    Seq,
}

impl Keyword {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "MSG" => Some(Keyword::Msg),
            "RPY" => Some(Keyword::Rpy),
            "ERR" => Some(Keyword::Err),
            "ANS" => Some(Keyword::Ans),
            "NUL" => Some(Keyword::Nul),
            "SEQ" => Some(Keyword::Seq),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Keyword::Msg => "MSG",
            Keyword::Rpy => "RPY",
            Keyword::Err => "ERR",
            Keyword::Ans => "ANS",
            Keyword::Nul => "NUL",
            Keyword::Seq => "SEQ",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DataHeader {
    keyword: Keyword,
    channel: u32,
    msgno: u32,
    more: bool,
    seqno: u32,
    size: usize,
    ansno: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Header {
    Data(DataHeader),
    Seq { channel: u32, ackno: u32, window: u32 },
}

/// Bytes of an unfinished frame that the next packet of a direction starts with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pending {
    pub payload: usize,
    /// Trailer bytes still expected, 0 to 5.
    pub trailer: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BeepFlow {
    payload: [Carryover; 2],
    trailer: [usize; 2],
    /// MSG frames whose last frame carried the `*` continuation indicator.
    continuing: BTreeSet<u64>,
    replying: BTreeSet<u64>,
    pub frames: u64,
}

impl BeepFlow {
    pub fn pending(&self, direction: Direction) -> Pending {
        let side = direction.index();
        Pending {
            payload: self.payload[side].remaining(),
            trailer: self.trailer[side],
        }
    }

    fn set_pending(&mut self, direction: Direction, pending: Pending) {
        let side = direction.index();
        self.payload[side].set(pending.payload, 0);
        self.trailer[side] = pending.trailer;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeepCall {
    pub channel: u32,
    pub msgno: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderFacts {
    pub offset: usize,
    pub correlation: Option<Correlation>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BeepFacts {
    pub entry: Pending,
    pub headers: Vec<HeaderFacts>,
}

impl BeepFacts {
    fn correlation_at(&self, offset: usize) -> Option<Correlation> {
        self.headers
            .iter()
            .find(|header| header.offset == offset)
            .and_then(|header| header.correlation)
    }
}

/// Each peer numbers its own MSGs, so the key carries the requesting side.
/// Channel numbers stay below 2^31, leaving the top bit for the direction.
fn transaction_key(requester: Direction, channel: u32, msgno: u32) -> u64 {
    ((requester.index() as u64) << 63) | (u64::from(channel) << 32) | u64::from(msgno)
}

fn number(tokens: &mut Split<'_, char>) -> Result<u32, DecodeError> {
    tokens
        .next()
        .and_then(|token| token.parse().ok())
        .ok_or(DecodeError::malformed(PROTO, "bad numeric header field"))
}

fn parse_header(rest: &[u8]) -> Result<(Header, usize), DecodeError> {
    let window = &rest[..rest.len().min(MAX_HEADER_LEN)];
    let Some(end) = window.windows(2).position(|pair| pair == b"\r\n") else {
        if rest.len() < MAX_HEADER_LEN {
            return Err(DecodeError::InsufficientData {
                needed: rest.len() + 1,
                available: rest.len(),
            });
        }
        return Err(DecodeError::malformed(PROTO, "header line too long"));
    };
    let line = std::str::from_utf8(&window[..end])
        .map_err(|_| DecodeError::malformed(PROTO, "header is not ASCII"))?;

    let mut tokens = line.split(' ');
    let keyword = tokens
        .next()
        .and_then(Keyword::parse)
        .ok_or(DecodeError::malformed(PROTO, "unknown header keyword"))?;
    let channel = number(&mut tokens)?;
    if channel > MAX_CHANNEL {
        return Err(DecodeError::malformed(PROTO, "channel number out of range"));
    }

    let header = if keyword == Keyword::Seq {
        Header::Seq {
            channel,
            ackno: number(&mut tokens)?,
            window: number(&mut tokens)?,
        }
    } else {
        let msgno = number(&mut tokens)?;
        let more = match tokens.next() {
            Some(".") => false,
            Some("*") => true,
            _ => return Err(DecodeError::malformed(PROTO, "bad continuation indicator")),
        };
        let seqno = number(&mut tokens)?;
        let size = number(&mut tokens)? as usize;
        let ansno = match keyword {
            Keyword::Ans => Some(number(&mut tokens)?),
            _ => None,
        };
        Header::Data(DataHeader {
            keyword,
            channel,
            msgno,
            more,
            seqno,
            size,
            ansno,
        })
    };

    if tokens.next().is_some() {
        return Err(DecodeError::malformed(PROTO, "trailing header fields"));
    }
    Ok((header, end + 2))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Payload {
        offset: usize,
        len: usize,
        carried: bool,
    },
    Trailer {
        offset: usize,
        len: usize,
    },
    Header {
        offset: usize,
        len: usize,
        header: Header,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Stop {
    End,
    /// A header line is cut off at the end of the packet.
    NeedHeader { offset: usize, additional: usize },
    Malformed { offset: usize, error: DecodeError },
    /// No header where one should start: the rest of the packet is payload.
    Valve { offset: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Scan {
    pieces: Vec<Piece>,
    exit: Pending,
    stop: Stop,
}

/// Consumes as much of the expected trailer as `rest` holds.
fn take_trailer(rest: &[u8], expected: usize) -> Result<usize, DecodeError> {
    let wanted = &TRAILER[TRAILER.len() - expected..];
    let len = wanted.len().min(rest.len());
    if rest[..len] != wanted[..len] {
        return Err(DecodeError::malformed(PROTO, "missing END trailer"));
    }
    Ok(len)
}

/// Splits a packet into header, payload and trailer pieces. Pure, so the first
/// pass and every replay see the same pieces for the same entry state.
fn scan(data: &[u8], entry: Pending, max_message_len: usize) -> Scan {
    let mut pieces = Vec::new();
    let mut pending = entry;
    let mut offset = 0;

    if pending.payload > 0 {
        let mut carry = Carryover::default();
        carry.set(pending.payload, 0);
        let split = carry.take(data.len());
        pieces.push(Piece::Payload {
            offset: 0,
            len: split.payload,
            carried: true,
        });
        offset = split.payload;
        pending.payload = carry.remaining();
        if !split.header_allowed {
            return Scan {
                pieces,
                exit: pending,
                stop: Stop::End,
            };
        }
    }

    while offset < data.len() {
        if pending.trailer > 0 {
            match take_trailer(&data[offset..], pending.trailer) {
                Ok(len) => {
                    pieces.push(Piece::Trailer { offset, len });
                    offset += len;
                    pending.trailer -= len;
                    continue;
                }
                Err(error) => {
                    pending.trailer = 0;
                    let stop = Stop::Malformed { offset, error };
                    return Scan { pieces, exit: pending, stop };
                }
            }
        }

        let (header, header_len) = match parse_header(&data[offset..]) {
            Ok(parsed) => parsed,
            Err(DecodeError::InsufficientData { needed, available }) => {
                let stop = Stop::NeedHeader {
                    offset,
                    additional: needed - available,
                };
                return Scan { pieces, exit: pending, stop };
            }
            Err(_) => {
                let stop = Stop::Valve { offset };
                return Scan { pieces, exit: pending, stop };
            }
        };

        pieces.push(Piece::Header {
            offset,
            len: header_len,
            header,
        });
        offset += header_len;

        let Header::Data(data_header) = header else {
            continue;
        };
        if data_header.size > max_message_len {
            let error = DecodeError::Oversized {
                declared: data_header.size,
                limit: max_message_len,
            };
            return Scan { pieces, exit: pending, stop: Stop::Malformed { offset, error } };
        }

        let present = data_header.size.min(data.len() - offset);
        if present > 0 {
            pieces.push(Piece::Payload {
                offset,
                len: present,
                carried: false,
            });
        }
        offset += present;
        pending = Pending {
            payload: data_header.size - present,
            trailer: TRAILER.len(),
        };
    }

    Scan {
        pieces,
        exit: pending,
        stop: Stop::End,
    }
}

fn take_flow(context: &mut FlowContext<'_>) -> Option<BeepFlow> {
    match context.state.take() {
        None => Some(BeepFlow::default()),
        Some(ProtocolState::Beep(flow)) => Some(flow),
        Some(other) => {
            *context.state = Some(other);
            None
        }
    }
}

/// Records `key` as continuing when `more` is set. Returns whether this is the
/// first frame of its message.
fn track_continuation(set: &mut BTreeSet<u64>, key: u64, more: bool) -> bool {
    let first = !set.contains(&key);
    if more {
        set.insert(key);
    } else {
        set.remove(&key);
    }
    first
}

fn correlate(
    flow: &mut BeepFlow,
    context: &mut FlowContext<'_>,
    header: &DataHeader,
) -> Option<Correlation> {
    let requester = match header.keyword {
        Keyword::Msg => context.direction,
        _ => context.direction.opposite(),
    };
    let key = transaction_key(requester, header.channel, header.msgno);
    match header.keyword {
        Keyword::Msg => track_continuation(&mut flow.continuing, key, header.more).then(|| {
            let call = BeepCall {
                channel: header.channel,
                msgno: header.msgno,
            };
            context.open_transaction(key, CallInfo::Beep(call))
        }),
        Keyword::Rpy | Keyword::Err | Keyword::Nul => {
            track_continuation(&mut flow.replying, key, header.more)
                .then(|| context.complete_transaction(key))
        }
        // One MSG may have many ANS frames; only NUL closes it.
        Keyword::Ans => Some(match context.peek_transaction(key) {
            Some(transaction) => Correlation::Matched {
                request_frame: transaction.request_frame,
            },
            None => {
                context.warn(DecodeWarning::new(
                    WarningCode::UnmatchedReply,
                    format!(
                        "answer on channel {} for unseen message {}",
                        header.channel, header.msgno
                    ),
                ));
                Correlation::Unmatched
            }
        }),
        Keyword::Seq => None,
    }
}

fn describe_header(
    tree: &mut FieldTree,
    offset: usize,
    len: usize,
    header: &Header,
    correlation: Option<Correlation>,
) {
    match header {
        Header::Seq {
            channel,
            ackno,
            window,
        } => {
            tree.open(PROTO, offset, len, format!("SEQ channel {channel}"));
            tree.push(PROTO, offset, len, format!("Acknowledgement: {ackno}"));
            tree.push(PROTO, offset, len, format!("Window: {window}"));
            tree.close();
        }
        Header::Data(header) => {
            tree.open(
                PROTO,
                offset,
                len,
                format!(
                    "{} channel {} message {}",
                    header.keyword.as_str(),
                    header.channel,
                    header.msgno
                ),
            );
            tree.push(PROTO, offset, 3, format!("Command: {}", header.keyword.as_str()));
            let more = if header.more {
                "Intermediate (*)"
            } else {
                "Complete (.)"
            };
            tree.push(PROTO, offset, len, format!("More: {more}"));
            tree.push(PROTO, offset, len, format!("Sequence number: {}", header.seqno));
            tree.push(PROTO, offset, len, format!("Payload size: {}", header.size));
            if let Some(ansno) = header.ansno {
                tree.push(PROTO, offset, len, format!("Answer number: {ansno}"));
            }
            if let Some(correlation) = correlation {
                tree.push(PROTO, offset, 0, correlation.label());
            }
            tree.close();
        }
    }
}

fn looks_like_header(data: &[u8]) -> bool {
    data.get(..4)
        .and_then(|head| std::str::from_utf8(&head[..3]).ok().filter(|_| head[3] == b' '))
        .and_then(Keyword::parse)
        .is_some()
}

pub struct BeepDecoder;

impl FlowDecoder for BeepDecoder {
    fn id(&self) -> DecoderId {
        DecoderId::Beep
    }

    fn name(&self) -> &'static str {
        PROTO
    }

    fn probe(&self, packet: &Packet<'_>, context: &ProbeContext<'_>) -> ProbeResult {
        if packet.transport != Transport::Tcp || !looks_like_header(packet.data) {
            return ProbeResult::NoMatch;
        }
        if packet.involves_port(&context.config.beep_ports) {
            ProbeResult::Match { priority: 20 }
        } else if parse_header(packet.data).is_ok() {
            ProbeResult::Match { priority: 5 }
        } else {
            ProbeResult::NoMatch
        }
    }

    fn dissect(&self, packet: &Packet<'_>, context: &mut FlowContext<'_>) -> Outcome {
        let Some(mut flow) = take_flow(context) else {
            return super::state_mismatch(PROTO);
        };
        let direction = context.direction;
        let entry = flow.pending(direction);
        let scan = scan(packet.data, entry, context.config.max_message_len);

        let mut facts = BeepFacts {
            entry,
            headers: Vec::new(),
        };
        for piece in &scan.pieces {
            if let Piece::Header { offset, header, .. } = piece {
                flow.frames += 1;
                let correlation = match header {
                    Header::Data(header) => correlate(&mut flow, context, header),
                    Header::Seq { .. } => None,
                };
                facts.headers.push(HeaderFacts {
                    offset: *offset,
                    correlation,
                });
            }
        }
        flow.set_pending(direction, scan.exit);

        let status = match scan.stop {
            Stop::End => FrameStatus::Decoded,
            Stop::NeedHeader { offset, additional } => incomplete(
                context.config.desegment,
                packet.stream_offset + offset as u64,
                additional,
            ),
            Stop::Malformed { offset, error } => {
                debug!(%error, offset, "beep frame abandoned");
                context.warn(malformed_warning(&error, offset));
                FrameStatus::Malformed
            }
            Stop::Valve { offset } => {
                context.warn(
                    DecodeWarning::new(
                        WarningCode::PayloadCarryover,
                        "no frame header, rest of packet treated as payload",
                    )
                    .at(offset),
                );
                FrameStatus::Decoded
            }
        };

        *context.state = Some(ProtocolState::Beep(flow));
        Outcome::new(status, FrameDetail::Beep(facts))
    }

    fn render(
        &self,
        packet: &Packet<'_>,
        facts: &FrameFacts,
        context: &ReplayContext<'_>,
    ) -> FieldTree {
        let mut tree = FieldTree::default();
        let FrameDetail::Beep(beep) = &facts.detail else {
            return tree;
        };
        let data = packet.data;
        let scan = scan(data, beep.entry, context.config.max_message_len);

        for piece in &scan.pieces {
            match piece {
                Piece::Payload {
                    offset,
                    len,
                    carried: true,
                } => tree.push(
                    PROTO,
                    *offset,
                    *len,
                    format!("Payload continued from previous frame ({len} bytes)"),
                ),
                Piece::Payload { offset, len, .. } => {
                    tree.push(PROTO, *offset, *len, format!("Payload ({len} bytes)"))
                }
                Piece::Trailer { offset, len } if *len == TRAILER.len() => {
                    tree.push(PROTO, *offset, *len, "Trailer: END")
                }
                Piece::Trailer { offset, len } => {
                    tree.push(PROTO, *offset, *len, format!("Trailer (partial, {len} bytes)"))
                }
                Piece::Header {
                    offset,
                    len,
                    header,
                } => {
                    let correlation = beep.correlation_at(*offset);
                    describe_header(&mut tree, *offset, *len, header, correlation)
                }
            }
        }

        match scan.stop {
            Stop::End => {}
            Stop::NeedHeader { offset, .. } => {
                push_status(&mut tree, PROTO, facts.status, offset, data.len())
            }
            Stop::Malformed { offset, .. } => {
                push_status(&mut tree, PROTO, FrameStatus::Malformed, offset, data.len())
            }
            Stop::Valve { offset } => tree.push(
                PROTO,
                offset,
                data.len() - offset,
                format!("Payload ({} bytes, no frame header)", data.len() - offset),
            ),
        }
        tree
    }
}
