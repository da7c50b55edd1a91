//! ONC RPC (RFC 5531) with record marking over streams, and the portmapper
//! procedures that teach the session where other programs listen.

use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use super::{CallInfo, FrameDetail, ProtocolState, malformed_warning, push_status};
use crate::engine::context::{Correlation, Effect, FlowContext, ProbeContext, ReplayContext};
use crate::engine::cursor::{Cursor, Endian};
use crate::engine::error::DecodeError;
use crate::engine::framing::{LengthPrefixed, Need, SegmentController};
use crate::engine::registry::{DecoderId, FlowDecoder, Outcome, ProbeResult};
use crate::engine::session::{FrameFacts, FrameStatus};
use crate::engine::tree::FieldTree;
use crate::packet::Packet;
use crate::state::Transport;

const PROTO: &str = "rpc";

const RPC_VERSION: u32 = 2;
const MSG_CALL: u32 = 0;
const MSG_REPLY: u32 = 1;
const MAX_AUTH_LEN: usize = 400;

pub const PMAP_PROGRAM: u32 = 100_000;
const PMAPPROC_GETPORT: u32 = 3;
const PMAPPROC_CALLIT: u32 = 5;

const LAST_FRAGMENT: u8 = 0x80;
const RECORD_MARK: LengthPrefixed = LengthPrefixed {
    header_len: 4,
    length_offset: 0,
    length_width: 4,
    endian: Endian::Big,
    length_mask: 0x7fff_ffff,
    includes_header: false,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramPort {
    pub program: u32,
    pub version: u32,
}

/// Ports learned from portmapper replies during this session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortMap {
    entries: HashMap<(Transport, u16), ProgramPort>,
}

impl PortMap {
    pub fn learn(&mut self, transport: Transport, port: u16, program: u32, version: u32) {
        let previous = self
            .entries
            .insert((transport, port), ProgramPort { program, version });
        if previous.is_none() {
            debug!(?transport, port, program, version, "learned rpc program port");
        }
    }

    pub fn lookup(&self, transport: Transport, port: u16) -> Option<ProgramPort> {
        self.entries.get(&(transport, port)).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpcFlow {
    pub calls: u64,
    pub replies: u64,
    pub programs: BTreeSet<u32>,
}

/// Portmapper GETPORT argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub program: u32,
    pub version: u32,
    pub protocol: u32,
}

/// Target of a portmapper CALLIT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndirectCall {
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
}

/// What a reply needs to know about its call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcCall {
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
    pub mapping: Option<Mapping>,
    pub indirect: Option<IndirectCall>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageFacts {
    /// Offset of the message (or of its record marker) in the frame.
    pub offset: usize,
    pub xid: u32,
    pub correlation: Correlation,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpcFacts {
    pub messages: Vec<MessageFacts>,
}

impl RpcFacts {
    fn at(&self, offset: usize) -> Option<&MessageFacts> {
        self.messages.iter().find(|message| message.offset == offset)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Auth {
    flavor: u32,
    len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptStatus {
    Success,
    ProgUnavail,
    ProgMismatch { low: u32, high: u32 },
    ProcUnavail,
    GarbageArgs,
    SystemErr,
    Unknown(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    RpcMismatch { low: u32, high: u32 },
    AuthError(u32),
    Unknown(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
    Accepted {
        verifier: Auth,
        status: AcceptStatus,
        results: usize,
    },
    Denied(Rejection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Body {
    Call {
        rpc_version: u32,
        program: u32,
        version: u32,
        procedure: u32,
        credentials: Auth,
        verifier: Auth,
        params: usize,
    },
    Reply(Reply),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Message {
    xid: u32,
    body: Body,
}

fn read_u32(cursor: &mut Cursor<'_>) -> Result<u32, DecodeError> {
    cursor.read_u32(Endian::Big)
}

fn read_auth(cursor: &mut Cursor<'_>) -> Result<Auth, DecodeError> {
    let flavor = read_u32(cursor)?;
    let len = read_u32(cursor)? as usize;
    if len > MAX_AUTH_LEN {
        return Err(DecodeError::malformed(PROTO, "auth body longer than 400 bytes"));
    }
    cursor.advance(len.div_ceil(4) * 4)?;
    Ok(Auth { flavor, len })
}

fn parse_reply(cursor: &mut Cursor<'_>) -> Result<Reply, DecodeError> {
    match read_u32(cursor)? {
        0 => {
            let verifier = read_auth(cursor)?;
            let status = match read_u32(cursor)? {
                0 => AcceptStatus::Success,
                1 => AcceptStatus::ProgUnavail,
                2 => AcceptStatus::ProgMismatch {
                    low: read_u32(cursor)?,
                    high: read_u32(cursor)?,
                },
                3 => AcceptStatus::ProcUnavail,
                4 => AcceptStatus::GarbageArgs,
                5 => AcceptStatus::SystemErr,
                other => AcceptStatus::Unknown(other),
            };
            Ok(Reply::Accepted {
                verifier,
                status,
                results: cursor.pos(),
            })
        }
        1 => {
            let rejection = match read_u32(cursor)? {
                0 => Rejection::RpcMismatch {
                    low: read_u32(cursor)?,
                    high: read_u32(cursor)?,
                },
                1 => Rejection::AuthError(read_u32(cursor)?),
                other => Rejection::Unknown(other),
            };
            Ok(Reply::Denied(rejection))
        }
        _ => Err(DecodeError::malformed(PROTO, "unknown reply status")),
    }
}

fn parse_message(body: &[u8]) -> Result<Message, DecodeError> {
    let mut cursor = Cursor::new(body);
    let xid = read_u32(&mut cursor)?;
    let body = match read_u32(&mut cursor)? {
        MSG_CALL => {
            let rpc_version = read_u32(&mut cursor)?;
            if rpc_version != RPC_VERSION {
                return Err(DecodeError::malformed(PROTO, "unsupported RPC version"));
            }
            let program = read_u32(&mut cursor)?;
            let version = read_u32(&mut cursor)?;
            let procedure = read_u32(&mut cursor)?;
            let credentials = read_auth(&mut cursor)?;
            let verifier = read_auth(&mut cursor)?;
            Body::Call {
                rpc_version,
                program,
                version,
                procedure,
                credentials,
                verifier,
                params: cursor.pos(),
            }
        }
        MSG_REPLY => Body::Reply(parse_reply(&mut cursor)?),
        _ => return Err(DecodeError::malformed(PROTO, "unknown message type")),
    };
    Ok(Message { xid, body })
}

fn parse_mapping(params: &[u8]) -> Result<Mapping, DecodeError> {
    let mut cursor = Cursor::new(params);
    Ok(Mapping {
        program: read_u32(&mut cursor)?,
        version: read_u32(&mut cursor)?,
        protocol: read_u32(&mut cursor)?,
    })
}

fn parse_indirect(params: &[u8]) -> Result<(IndirectCall, usize), DecodeError> {
    let mut cursor = Cursor::new(params);
    let call = IndirectCall {
        program: read_u32(&mut cursor)?,
        version: read_u32(&mut cursor)?,
        procedure: read_u32(&mut cursor)?,
    };
    let args = read_u32(&mut cursor)? as usize;
    Ok((call, args))
}

fn call_info(program: u32, version: u32, procedure: u32, params: &[u8]) -> RpcCall {
    let portmap = program == PMAP_PROGRAM;
    RpcCall {
        program,
        version,
        procedure,
        mapping: (portmap && procedure == PMAPPROC_GETPORT)
            .then(|| parse_mapping(params).ok())
            .flatten(),
        indirect: (portmap && procedure == PMAPPROC_CALLIT)
            .then(|| parse_indirect(params).ok().map(|(call, _)| call))
            .flatten(),
    }
}

/// The port a successful portmapper reply announced, if any.
fn learned_port(call: &RpcCall, results: &[u8], transport: Transport) -> Option<Effect> {
    if call.program != PMAP_PROGRAM {
        return None;
    }
    let port = Cursor::new(results).peek_u32(0, Endian::Big).ok()?;
    let port = u16::try_from(port).ok().filter(|port| *port != 0)?;
    match (call.procedure, call.mapping, call.indirect) {
        (PMAPPROC_GETPORT, Some(mapping), _) => Some(Effect::LearnRpcPort {
            transport: Transport::from(u8::try_from(mapping.protocol).ok()?),
            port,
            program: mapping.program,
            version: mapping.version,
        }),
        // The indirect call ran over the same transport as CALLIT.
        (PMAPPROC_CALLIT, _, Some(target)) => Some(Effect::LearnRpcPort {
            transport,
            port,
            program: target.program,
            version: target.version,
        }),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fragment {
    offset: usize,
    len: usize,
    last: bool,
}

#[derive(Debug)]
struct Record<'a> {
    offset: usize,
    len: usize,
    fragments: Vec<Fragment>,
    body: Cow<'a, [u8]>,
}

#[derive(Debug, PartialEq, Eq)]
enum RecordTail {
    Empty,
    Incomplete {
        offset: usize,
        resume_at: u64,
        additional: usize,
    },
    Malformed {
        offset: usize,
        error: DecodeError,
    },
}

enum Framed<'a> {
    Record(Record<'a>),
    Incomplete { resume_at: u64, additional: usize },
}

/// Collects the fragments of the record starting at `start`. The whole record,
/// every fragment header included, counts against the message cap.
fn next_record<'a>(
    controller: &SegmentController,
    data: &'a [u8],
    start: usize,
    stream_offset: u64,
) -> Result<Framed<'a>, DecodeError> {
    let resume_at = stream_offset + start as u64;
    let available = data.len() - start;
    let mut fragments = Vec::new();
    let mut pos = start;

    loop {
        let rest = &data[pos..];
        let declared = match rest.get(..RECORD_MARK.header_len) {
            Some(header) => pos - start + RECORD_MARK.declared_len(header)?,
            None => pos - start + RECORD_MARK.header_len,
        };
        if let Need::NeedMoreBytes {
            resume_at,
            additional,
        } = controller.need_at(resume_at, available, declared)?
        {
            return Ok(Framed::Incomplete {
                resume_at,
                additional,
            });
        }

        let last = rest[0] & LAST_FRAGMENT != 0;
        fragments.push(Fragment {
            offset: pos,
            len: declared - (pos - start) - RECORD_MARK.header_len,
            last,
        });
        pos = start + declared;
        if last {
            break;
        }
    }

    let payload = move |fragment: &Fragment| -> &'a [u8] {
        let body = fragment.offset + RECORD_MARK.header_len;
        &data[body..body + fragment.len]
    };
    let body = match fragments.as_slice() {
        [single] => Cow::Borrowed(payload(single)),
        many => Cow::Owned(many.iter().flat_map(payload).copied().collect()),
    };
    Ok(Framed::Record(Record {
        offset: start,
        len: pos - start,
        fragments,
        body,
    }))
}

fn records<'a>(
    controller: &SegmentController,
    data: &'a [u8],
    stream_offset: u64,
) -> (Vec<Record<'a>>, RecordTail) {
    let mut found = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        match next_record(controller, data, offset, stream_offset) {
            Ok(Framed::Record(record)) => {
                offset += record.len;
                found.push(record);
            }
            Ok(Framed::Incomplete {
                resume_at,
                additional,
            }) => {
                let tail = RecordTail::Incomplete {
                    offset,
                    resume_at,
                    additional,
                };
                return (found, tail);
            }
            Err(error) => return (found, RecordTail::Malformed { offset, error }),
        }
    }
    (found, RecordTail::Empty)
}

fn program_name(program: u32) -> &'static str {
    match program {
        PMAP_PROGRAM => "Portmap",
        100_001 => "RSTAT",
        100_003 => "NFS",
        100_005 => "MOUNT",
        100_021 => "NLM",
        100_024 => "STAT",
        100_227 => "NFS_ACL",
        _ => "Unknown",
    }
}

fn procedure_name(program: u32, procedure: u32) -> &'static str {
    match (program, procedure) {
        (_, 0) => "NULL",
        (PMAP_PROGRAM, 1) => "SET",
        (PMAP_PROGRAM, 2) => "UNSET",
        (PMAP_PROGRAM, PMAPPROC_GETPORT) => "GETPORT",
        (PMAP_PROGRAM, 4) => "DUMP",
        (PMAP_PROGRAM, PMAPPROC_CALLIT) => "CALLIT",
        _ => "Unknown",
    }
}

fn flavor_name(flavor: u32) -> &'static str {
    match flavor {
        0 => "AUTH_NULL",
        1 => "AUTH_UNIX",
        2 => "AUTH_SHORT",
        3 => "AUTH_DES",
        6 => "RPCSEC_GSS",
        _ => "Unknown",
    }
}

fn auth_status_name(status: u32) -> &'static str {
    match status {
        1 => "bad credential",
        2 => "rejected credential",
        3 => "bad verifier",
        4 => "rejected verifier",
        5 => "too weak",
        _ => "unknown",
    }
}

fn describe_call(tree: &mut FieldTree, base: usize, body: &[u8], message: &Message) {
    let Body::Call {
        rpc_version,
        program,
        version,
        procedure,
        credentials,
        verifier,
        params,
    } = message.body
    else {
        return;
    };

    tree.push(PROTO, base + 8, 4, format!("RPC Version: {rpc_version}"));
    tree.push(
        PROTO,
        base + 12,
        4,
        format!("Program: {} ({program})", program_name(program)),
    );
    tree.push(PROTO, base + 16, 4, format!("Program Version: {version}"));
    tree.push(
        PROTO,
        base + 20,
        4,
        format!("Procedure: {} ({procedure})", procedure_name(program, procedure)),
    );
    tree.push(
        PROTO,
        base + 24,
        8 + credentials.len,
        format!(
            "Credentials: {} ({}), {} bytes",
            flavor_name(credentials.flavor),
            credentials.flavor,
            credentials.len
        ),
    );
    tree.push(
        PROTO,
        base + params - 8 - verifier.len.div_ceil(4) * 4,
        8 + verifier.len,
        format!("Verifier: {} ({})", flavor_name(verifier.flavor), verifier.flavor),
    );

    let args = &body[params..];
    let call = call_info(program, version, procedure, args);
    if let Some(mapping) = call.mapping {
        tree.push(
            PROTO,
            base + params,
            16,
            format!(
                "Mapping: {} ({}) version {} over {}",
                program_name(mapping.program),
                mapping.program,
                mapping.version,
                protocol_name(mapping.protocol)
            ),
        );
    } else if let Some(target) = call.indirect
        && let Ok((_, len)) = parse_indirect(args)
    {
        tree.push(
            PROTO,
            base + params,
            16 + len,
            format!(
                "Indirect call: {} ({}) version {} procedure {}, {len} argument bytes",
                program_name(target.program),
                target.program,
                target.version,
                target.procedure
            ),
        );
    } else if !args.is_empty() {
        tree.push(
            PROTO,
            base + params,
            args.len(),
            format!("Parameters ({} bytes)", args.len()),
        );
    }
}

fn protocol_name(protocol: u32) -> String {
    match u8::try_from(protocol).map(Transport::from) {
        Ok(Transport::Tcp) => "TCP".to_string(),
        Ok(Transport::Udp) => "UDP".to_string(),
        _ => format!("protocol {protocol}"),
    }
}

fn describe_results(tree: &mut FieldTree, base: usize, results: &[u8], call: Option<&RpcCall>) {
    if results.is_empty() {
        return;
    }
    let cursor = Cursor::new(results);
    match call {
        Some(call) if call.program == PMAP_PROGRAM && call.procedure == PMAPPROC_GETPORT => {
            if let Ok(port) = cursor.peek_u32(0, Endian::Big) {
                tree.push(PROTO, base, 4, format!("Port: {port}"));
            }
        }
        Some(RpcCall {
            indirect: Some(target),
            ..
        }) => {
            if let Ok(port) = cursor.peek_u32(0, Endian::Big) {
                let len = cursor.peek_u32(4, Endian::Big).unwrap_or(0);
                tree.push(
                    PROTO,
                    base,
                    results.len(),
                    format!(
                        "Indirect reply from {} ({}) procedure {} on port {port}, {len} result bytes",
                        program_name(target.program),
                        target.program,
                        target.procedure
                    ),
                );
            }
        }
        _ => tree.push(
            PROTO,
            base,
            results.len(),
            format!("Results ({} bytes)", results.len()),
        ),
    }
}

fn describe_reply(
    tree: &mut FieldTree,
    base: usize,
    body: &[u8],
    reply: Reply,
    call: Option<&RpcCall>,
) {
    if let Some(call) = call {
        tree.push(
            PROTO,
            base,
            0,
            format!(
                "Program: {} ({}) version {}, procedure {} ({})",
                program_name(call.program),
                call.program,
                call.version,
                procedure_name(call.program, call.procedure),
                call.procedure
            ),
        );
    }

    match reply {
        Reply::Accepted {
            verifier,
            status,
            results,
        } => {
            tree.push(PROTO, base + 8, 4, "Reply State: accepted (0)");
            tree.push(
                PROTO,
                base + 12,
                8 + verifier.len,
                format!("Verifier: {} ({})", flavor_name(verifier.flavor), verifier.flavor),
            );
            let status_at = base + 20 + verifier.len.div_ceil(4) * 4;
            let label = match status {
                AcceptStatus::Success => "Accept State: RPC executed successfully (0)".to_string(),
                AcceptStatus::ProgUnavail => {
                    "Accept State: remote can't support program (1)".to_string()
                }
                AcceptStatus::ProgMismatch { low, high } => {
                    format!("Accept State: program version mismatch (2), supported {low}-{high}")
                }
                AcceptStatus::ProcUnavail => "Accept State: procedure unavailable (3)".to_string(),
                AcceptStatus::GarbageArgs => "Accept State: garbage arguments (4)".to_string(),
                AcceptStatus::SystemErr => "Accept State: system error (5)".to_string(),
                AcceptStatus::Unknown(value) => format!("Accept State: unknown ({value})"),
            };
            tree.push(PROTO, status_at, results - (status_at - base), label);
            if status == AcceptStatus::Success {
                describe_results(tree, base + results, &body[results..], call);
            }
        }
        Reply::Denied(rejection) => {
            tree.push(PROTO, base + 8, 4, "Reply State: denied (1)");
            let label = match rejection {
                Rejection::RpcMismatch { low, high } => {
                    format!("Reject State: RPC version mismatch (0), supported {low}-{high}")
                }
                Rejection::AuthError(status) => format!(
                    "Reject State: authentication error (1), {} ({status})",
                    auth_status_name(status)
                ),
                Rejection::Unknown(value) => format!("Reject State: unknown ({value})"),
            };
            tree.push(PROTO, base + 12, body.len().saturating_sub(12), label);
        }
    }
}

/// Renders one RPC message located at `base` in the frame.
fn describe(
    tree: &mut FieldTree,
    base: usize,
    body: &[u8],
    facts: Option<&MessageFacts>,
    context: &ReplayContext<'_>,
) {
    let Ok(message) = parse_message(body) else {
        push_status(tree, PROTO, FrameStatus::Malformed, base, base + body.len());
        return;
    };

    let kind = match message.body {
        Body::Call { .. } => "Call",
        Body::Reply(_) => "Reply",
    };
    tree.open(
        PROTO,
        base,
        body.len(),
        format!("Remote Procedure Call, Type: {kind} XID: {:#010x}", message.xid),
    );
    tree.push(PROTO, base, 4, format!("XID: {:#010x} ({})", message.xid, message.xid));
    let type_value = if kind == "Call" { MSG_CALL } else { MSG_REPLY };
    tree.push(PROTO, base + 4, 4, format!("Message Type: {kind} ({type_value})"));
    if let Some(facts) = facts {
        tree.push(PROTO, base, 0, facts.correlation.label());
    }

    match message.body {
        Body::Call { .. } => describe_call(tree, base, body, &message),
        Body::Reply(reply) => {
            // Only trust the table when the first pass matched this very request.
            let call = facts
                .and_then(|facts| facts.correlation.request_frame())
                .and_then(|request_frame| {
                    context
                        .transaction(u64::from(message.xid))
                        .filter(|transaction| transaction.request_frame == request_frame)
                })
                .and_then(|transaction| match &transaction.metadata {
                    CallInfo::Rpc(call) => Some(call),
                    CallInfo::Beep(_) => None,
                });
            describe_reply(tree, base, body, reply, call);
        }
    }
    tree.close();
}

fn take_flow(context: &mut FlowContext<'_>) -> Option<RpcFlow> {
    match context.state.take() {
        None => Some(RpcFlow::default()),
        Some(ProtocolState::Rpc(flow)) => Some(flow),
        Some(other) => {
            *context.state = Some(other);
            None
        }
    }
}

/// Correlates one message and queues the side effects of portmapper replies.
fn observe(
    flow: &mut RpcFlow,
    context: &mut FlowContext<'_>,
    transport: Transport,
    body: &[u8],
    message: &Message,
) -> Correlation {
    let xid = u64::from(message.xid);
    match message.body {
        Body::Call {
            program,
            version,
            procedure,
            params,
            ..
        } => {
            flow.calls += 1;
            flow.programs.insert(program);
            let call = call_info(program, version, procedure, &body[params..]);
            let correlation = context.open_transaction(xid, CallInfo::Rpc(call));
            debug!(xid = message.xid, program, procedure, ?correlation, "rpc call");
            correlation
        }
        Body::Reply(reply) => {
            flow.replies += 1;
            let correlation = context.complete_transaction(xid);
            debug!(xid = message.xid, ?correlation, "rpc reply");

            if let Correlation::Matched { .. } = correlation
                && let Reply::Accepted {
                    status: AcceptStatus::Success,
                    results,
                    ..
                } = reply
                && let Some(CallInfo::Rpc(call)) = context
                    .peek_transaction(xid)
                    .map(|transaction| transaction.metadata.clone())
                && let Some(effect) = learned_port(&call, &body[results..], transport)
            {
                context.effect(effect);
            }
            correlation
        }
    }
}

pub struct RpcDecoder;

impl RpcDecoder {
    fn dissect_stream(
        packet: &Packet<'_>,
        context: &mut FlowContext<'_>,
        flow: &mut RpcFlow,
        facts: &mut RpcFacts,
    ) -> FrameStatus {
        let controller = context.controller();
        let (found, tail) = records(&controller, packet.data, packet.stream_offset);
        let mut status = FrameStatus::Decoded;

        for record in &found {
            match parse_message(&record.body) {
                Ok(message) => {
                    let correlation =
                        observe(flow, context, packet.transport, &record.body, &message);
                    facts.messages.push(MessageFacts {
                        offset: record.offset,
                        xid: message.xid,
                        correlation,
                    });
                }
                // The record boundary is known; the next record still parses.
                Err(error) => {
                    context.warn(malformed_warning(&error, record.offset));
                    status = FrameStatus::Malformed;
                }
            }
        }

        match tail {
            RecordTail::Empty => status,
            RecordTail::Incomplete {
                resume_at,
                additional,
                ..
            } => super::incomplete(context.config.desegment, resume_at, additional),
            RecordTail::Malformed { offset, error } => {
                debug!(%error, offset, "abandoning rpc stream frame");
                context.warn(malformed_warning(&error, offset));
                FrameStatus::Malformed
            }
        }
    }

    fn dissect_datagram(
        packet: &Packet<'_>,
        context: &mut FlowContext<'_>,
        flow: &mut RpcFlow,
        facts: &mut RpcFacts,
    ) -> FrameStatus {
        match parse_message(packet.data) {
            Ok(message) => {
                let correlation = observe(flow, context, packet.transport, packet.data, &message);
                facts.messages.push(MessageFacts {
                    offset: 0,
                    xid: message.xid,
                    correlation,
                });
                FrameStatus::Decoded
            }
            Err(error) => {
                context.warn(malformed_warning(&error, 0));
                FrameStatus::Malformed
            }
        }
    }
}

fn looks_like_message(message: &[u8]) -> (bool, bool) {
    let cursor = Cursor::new(message);
    let word = |offset| cursor.peek_u32(offset, Endian::Big).ok();
    let call = word(4) == Some(MSG_CALL) && word(8) == Some(RPC_VERSION);
    let reply = word(4) == Some(MSG_REPLY) && matches!(word(8), Some(0 | 1));
    (call, reply)
}

impl FlowDecoder for RpcDecoder {
    fn id(&self) -> DecoderId {
        DecoderId::Rpc
    }

    fn name(&self) -> &'static str {
        PROTO
    }

    fn probe(&self, packet: &Packet<'_>, context: &ProbeContext<'_>) -> ProbeResult {
        let message = match packet.transport {
            Transport::Tcp => packet.data.get(RECORD_MARK.header_len..),
            Transport::Udp => Some(packet.data),
            Transport::Other(_) => None,
        };
        let Some(message) = message else {
            return ProbeResult::NoMatch;
        };

        let (call, reply) = looks_like_message(message);
        let (src, dst) = packet.ports();
        let learned = [src, dst]
            .into_iter()
            .flatten()
            .any(|port| context.ports.lookup(packet.transport, port).is_some());

        match (call || reply, call) {
            (true, _) if learned => ProbeResult::Match { priority: 30 },
            (true, _) if packet.involves_port(&context.config.rpc_ports) => {
                ProbeResult::Match { priority: 20 }
            }
            (_, true) => ProbeResult::Match { priority: 5 },
            _ => ProbeResult::NoMatch,
        }
    }

    fn dissect(&self, packet: &Packet<'_>, context: &mut FlowContext<'_>) -> Outcome {
        let Some(mut flow) = take_flow(context) else {
            return super::state_mismatch(PROTO);
        };
        let mut facts = RpcFacts::default();

        let status = if packet.transport.is_stream() {
            Self::dissect_stream(packet, context, &mut flow, &mut facts)
        } else {
            Self::dissect_datagram(packet, context, &mut flow, &mut facts)
        };

        *context.state = Some(ProtocolState::Rpc(flow));
        Outcome::new(status, FrameDetail::Rpc(facts))
    }

    fn render(
        &self,
        packet: &Packet<'_>,
        facts: &FrameFacts,
        context: &ReplayContext<'_>,
    ) -> FieldTree {
        let mut tree = FieldTree::default();
        let FrameDetail::Rpc(rpc) = &facts.detail else {
            return tree;
        };
        let data = packet.data;

        if !packet.transport.is_stream() {
            describe(&mut tree, 0, data, rpc.at(0), context);
            return tree;
        }

        let (found, tail) = records(&context.config.controller(), data, packet.stream_offset);
        for record in &found {
            for fragment in &record.fragments {
                let kind = if fragment.last { "Last" } else { "More" };
                tree.push(
                    PROTO,
                    fragment.offset,
                    RECORD_MARK.header_len,
                    format!("Fragment header: {kind} fragment, {} bytes", fragment.len),
                );
            }
            // Fields of a multi-fragment record are placed relative to its first fragment.
            let base = record.offset + RECORD_MARK.header_len;
            describe(&mut tree, base, &record.body, rpc.at(record.offset), context);
        }

        match tail {
            RecordTail::Empty => {}
            RecordTail::Incomplete { offset, .. } => {
                push_status(&mut tree, PROTO, facts.status, offset, data.len())
            }
            RecordTail::Malformed { offset, .. } => {
                push_status(&mut tree, PROTO, FrameStatus::Malformed, offset, data.len())
            }
        }
        tree
    }
}

#[cfg(test)]
mod tests {
    use super::{
        AcceptStatus, Body, Framed, PortMap, RecordTail, Rejection, Reply, learned_port,
        next_record, parse_message, records,
    };
    use crate::engine::constants::DEFAULT_MAX_MESSAGE_LEN;
    use crate::engine::context::Effect;
    use crate::engine::error::DecodeError;
    use crate::engine::framing::SegmentController;
    use crate::state::Transport;

    fn words(values: &[u32]) -> Vec<u8> {
        values.iter().flat_map(|value| value.to_be_bytes()).collect()
    }

    // xid 7, CALL, rpcvers 2, portmap v2 GETPORT, AUTH_NULL cred and verf,
    // mapping { NFS, v3, TCP, 0 }
    fn getport_call() -> Vec<u8> {
        words(&[7, 0, 2, 100_000, 2, 3, 0, 0, 0, 0, 100_003, 3, 6, 0])
    }

    // xid 7, REPLY, accepted, AUTH_NULL verf, SUCCESS, port 2049
    fn getport_reply() -> Vec<u8> {
        words(&[7, 1, 0, 0, 0, 0, 2049])
    }

    fn controller() -> SegmentController {
        SegmentController::new(DEFAULT_MAX_MESSAGE_LEN)
    }

    #[test]
    fn parses_call_header() {
        let message = parse_message(&getport_call()).expect("valid call");
        assert_eq!(message.xid, 7);
        let Body::Call {
            program,
            procedure,
            params,
            ..
        } = message.body
        else {
            panic!("call expected");
        };
        assert_eq!((program, procedure, params), (100_000, 3, 40));
    }

    #[test]
    fn parses_accepted_and_denied_replies() {
        let message = parse_message(&getport_reply()).expect("valid reply");
        assert_eq!(
            message.body,
            Body::Reply(Reply::Accepted {
                verifier: super::Auth { flavor: 0, len: 0 },
                status: AcceptStatus::Success,
                results: 24,
            })
        );

        let denied = parse_message(&words(&[9, 1, 1, 0, 2, 2])).expect("valid reply");
        assert_eq!(
            denied.body,
            Body::Reply(Reply::Denied(Rejection::RpcMismatch { low: 2, high: 2 }))
        );
    }

    #[test]
    fn oversized_auth_is_malformed() {
        let err = parse_message(&words(&[1, 0, 2, 100_003, 3, 0, 1, 4096]))
            .expect_err("auth too long");
        assert!(matches!(err, DecodeError::Malformed { .. }));
    }

    #[test]
    fn getport_reply_teaches_the_port() {
        let message = parse_message(&getport_call()).expect("valid call");
        let Body::Call { params, .. } = message.body else {
            panic!("call expected");
        };
        let call = super::call_info(100_000, 2, 3, &getport_call()[params..]);
        let effect = learned_port(&call, &2049u32.to_be_bytes(), Transport::Udp);
        assert_eq!(
            effect,
            Some(Effect::LearnRpcPort {
                transport: Transport::Tcp,
                port: 2049,
                program: 100_003,
                version: 3,
            })
        );
        assert_eq!(learned_port(&call, &0u32.to_be_bytes(), Transport::Udp), None);
    }

    #[test]
    fn multi_fragment_record_is_joined() {
        let body = getport_call();
        let (head, rest) = body.split_at(20);
        let mut stream = Vec::new();
        stream.extend_from_slice(&(head.len() as u32).to_be_bytes());
        stream.extend_from_slice(head);
        stream.extend_from_slice(&(0x8000_0000 | rest.len() as u32).to_be_bytes());
        stream.extend_from_slice(rest);

        let Ok(Framed::Record(record)) = next_record(&controller(), &stream, 0, 0) else {
            panic!("complete record expected");
        };
        assert_eq!(record.fragments.len(), 2);
        assert_eq!(record.len, stream.len());
        assert_eq!(record.body.as_ref(), body.as_slice());
    }

    #[test]
    fn partial_record_reports_what_is_missing() {
        let mut stream = (0x8000_0000u32 | 100).to_be_bytes().to_vec();
        stream.extend_from_slice(&[0; 40]);
        let (found, tail) = records(&controller(), &stream, 1000);
        assert!(found.is_empty());
        assert_eq!(
            tail,
            RecordTail::Incomplete {
                offset: 0,
                resume_at: 1000,
                additional: 60,
            }
        );
    }

    #[test]
    fn ten_mebibyte_record_is_rejected() {
        let stream = (0x8000_0000u32 | (10 << 20)).to_be_bytes();
        let (_, tail) = records(&controller(), &stream, 0);
        assert!(matches!(
            tail,
            RecordTail::Malformed {
                error: DecodeError::Oversized { .. },
                ..
            }
        ));
    }

    #[test]
    fn port_map_lookup() {
        let mut ports = PortMap::default();
        ports.learn(Transport::Tcp, 2049, 100_003, 3);
        assert_eq!(ports.lookup(Transport::Tcp, 2049).map(|p| p.program), Some(100_003));
        assert_eq!(ports.lookup(Transport::Udp, 2049), None);
        ports.clear();
        assert!(ports.is_empty());
    }
}
