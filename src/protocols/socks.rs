//! SOCKS v4, v4a and v5 proxy negotiation, plus the v5 UDP relay encapsulation.
//!
//! The control connection runs through
//! `AwaitingVersion -> Negotiating -> AwaitingCommand -> AwaitingReply ->
//! (BindAwaitingSecondReply) -> Done`. Version 4 has no negotiation and goes
//! straight from its request to `AwaitingReply`. Once `Done`, everything on the
//! flow is proxied application data.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tracing::debug;

use super::{FrameDetail, ProtocolState, incomplete_from, malformed_warning, push_status};
use crate::engine::context::{Effect, FlowContext, ProbeContext, ReplayContext};
use crate::engine::cursor::{Cursor, Endian};
use crate::engine::error::DecodeError;
use crate::engine::machine::{Advance, Machine, MachineState};
use crate::engine::registry::{DecoderId, FlowDecoder, Outcome, ProbeResult};
use crate::engine::session::{FrameFacts, FrameStatus};
use crate::engine::tree::FieldTree;
use crate::packet::Packet;
use crate::state::{Address, Direction, Endpoint, FlowKey, Transport};

const PROTO: &str = "socks";
const UDP_PROTO: &str = "socks-udp";
const MAX_USER_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    MethodSelection,
    UserPassRequest,
    UserPassReply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksState {
    AwaitingVersion,
    Negotiating(Negotiation),
    AwaitingCommand,
    AwaitingReply,
    BindAwaitingSecondReply,
    Done,
}

impl MachineState for SocksState {
    fn initial() -> Self {
        SocksState::AwaitingVersion
    }

    fn is_terminal(&self) -> bool {
        matches!(self, SocksState::Done)
    }
}

impl SocksState {
    fn sender(self) -> Option<Direction> {
        match self {
            SocksState::AwaitingVersion
            | SocksState::Negotiating(Negotiation::UserPassRequest)
            | SocksState::AwaitingCommand => Some(Direction::Originator),
            SocksState::Negotiating(_)
            | SocksState::AwaitingReply
            | SocksState::BindAwaitingSecondReply => Some(Direction::Responder),
            SocksState::Done => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
    Unknown(u8),
}

impl From<u8> for Command {
    fn from(value: u8) -> Self {
        match value {
            1 => Command::Connect,
            2 => Command::Bind,
            3 => Command::UdpAssociate,
            other => Command::Unknown(other),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Connect => f.write_str("Connect"),
            Command::Bind => f.write_str("Bind"),
            Command::UdpAssociate => f.write_str("UDP Associate"),
            Command::Unknown(value) => write!(f, "Unknown ({value})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocksAddr {
    Ip(IpAddr),
    Domain(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub addr: SocksAddr,
    pub port: u16,
}

impl Target {
    fn ip(&self) -> Option<IpAddr> {
        match self.addr {
            SocksAddr::Ip(ip) => Some(ip),
            SocksAddr::Domain(_) => None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.addr {
            SocksAddr::Ip(IpAddr::V6(ip)) => write!(f, "[{ip}]:{}", self.port),
            SocksAddr::Ip(ip) => write!(f, "{ip}:{}", self.port),
            SocksAddr::Domain(name) => write!(f, "{name}:{}", self.port),
        }
    }
}

/// Control-connection state of one proxied conversation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SocksFlow {
    pub machine: Machine<SocksState>,
    pub version: Option<u8>,
    pub command: Option<Command>,
    pub user: Option<String>,
    pub requested: Option<Target>,
    pub bound: Option<Target>,
    /// Peer the proxied bytes travel to once negotiation is over.
    pub remote: Option<Target>,
}

impl SocksFlow {
    /// State for a data channel that a BIND negotiated on another flow.
    pub fn relay(remote: Option<Target>) -> Self {
        Self {
            machine: Machine::at(SocksState::Done),
            version: Some(5),
            command: Some(Command::Bind),
            remote,
            ..Self::default()
        }
    }
}

/// State of a UDP ASSOCIATE relay flow.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UdpRelay {
    pub control: Option<FlowKey>,
    pub datagrams: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksFacts {
    pub entry: SocksState,
    pub version: Option<u8>,
    pub command: Option<Command>,
    pub remote: Option<Target>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Message {
    V4Request {
        command: Command,
        target: Target,
        user: String,
        user_len: usize,
    },
    V4Reply {
        status: u8,
        target: Target,
    },
    Greeting {
        methods: Vec<u8>,
    },
    MethodChoice {
        method: u8,
    },
    AuthRequest {
        user: String,
        password_len: usize,
    },
    AuthReply {
        status: u8,
    },
    V5Request {
        command: Command,
        target: Target,
    },
    V5Reply {
        status: u8,
        target: Target,
    },
}

impl Message {
    fn succeeded(&self) -> bool {
        match self {
            Message::V4Reply { status, .. } => *status == 90,
            Message::V5Reply { status, .. } => *status == 0,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Step {
    next: SocksState,
    message: Message,
    len: usize,
}

fn read_ipv4(cursor: &mut Cursor<'_>) -> Result<IpAddr, DecodeError> {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(cursor.read_bytes(4)?);
    Ok(IpAddr::V4(Ipv4Addr::from(raw)))
}

fn read_v5_target(cursor: &mut Cursor<'_>) -> Result<Target, DecodeError> {
    let addr = match cursor.read_u8()? {
        1 => SocksAddr::Ip(read_ipv4(cursor)?),
        3 => {
            let len = usize::from(cursor.read_u8()?);
            let name = cursor.read_bytes(len)?;
            SocksAddr::Domain(String::from_utf8_lossy(name).into_owned())
        }
        4 => {
            let mut raw = [0u8; 16];
            raw.copy_from_slice(cursor.read_bytes(16)?);
            SocksAddr::Ip(IpAddr::V6(Ipv6Addr::from(raw)))
        }
        _ => return Err(DecodeError::malformed(PROTO, "unknown address type")),
    };
    let port = cursor.read_u16(Endian::Big)?;
    Ok(Target { addr, port })
}

fn expect_version(cursor: &mut Cursor<'_>, expected: u8) -> Result<(), DecodeError> {
    if cursor.read_u8()? != expected {
        return Err(DecodeError::malformed(PROTO, "unexpected version byte"));
    }
    Ok(())
}

fn v4_request(cursor: &mut Cursor<'_>) -> Result<Message, DecodeError> {
    let command = Command::from(cursor.read_u8()?);
    let port = cursor.read_u16(Endian::Big)?;
    let ip = read_ipv4(cursor)?;
    let user_bytes = cursor.read_cstring(MAX_USER_LEN)?;
    let user = String::from_utf8_lossy(user_bytes).into_owned();
    let user_len = user_bytes.len();
    // v4a: 0.0.0.x with x != 0 means a host name follows the user id.
    let addr = match ip {
        IpAddr::V4(v4) if v4.octets()[..3] == [0, 0, 0] && v4.octets()[3] != 0 => {
            let host = cursor.read_cstring(MAX_USER_LEN)?;
            SocksAddr::Domain(String::from_utf8_lossy(host).into_owned())
        }
        other => SocksAddr::Ip(other),
    };
    Ok(Message::V4Request {
        command,
        target: Target { addr, port },
        user,
        user_len,
    })
}

fn user_pass_request(cursor: &mut Cursor<'_>) -> Result<Message, DecodeError> {
    expect_version(cursor, 1)?;
    let user_len = usize::from(cursor.read_u8()?);
    let user = String::from_utf8_lossy(cursor.read_bytes(user_len)?).into_owned();
    let password_len = usize::from(cursor.read_u8()?);
    cursor.advance(password_len)?;
    Ok(Message::AuthRequest { user, password_len })
}

fn reply(cursor: &mut Cursor<'_>, version: Option<u8>) -> Result<Message, DecodeError> {
    if version == Some(4) {
        expect_version(cursor, 0)?;
        let status = cursor.read_u8()?;
        let port = cursor.read_u16(Endian::Big)?;
        let ip = read_ipv4(cursor)?;
        return Ok(Message::V4Reply {
            status,
            target: Target {
                addr: SocksAddr::Ip(ip),
                port,
            },
        });
    }
    expect_version(cursor, 5)?;
    let status = cursor.read_u8()?;
    cursor.advance(1)?;
    let target = read_v5_target(cursor)?;
    Ok(Message::V5Reply { status, target })
}

/// The transition function: parses the message `state` expects and names the next state.
fn step(
    state: SocksState,
    version: Option<u8>,
    command: Option<Command>,
    bytes: &[u8],
) -> Result<Step, DecodeError> {
    let mut cursor = Cursor::new(bytes);
    let (next, message) = match state {
        SocksState::AwaitingVersion => match cursor.read_u8()? {
            4 => (SocksState::AwaitingReply, v4_request(&mut cursor)?),
            5 => {
                let count = usize::from(cursor.read_u8()?);
                let methods = cursor.read_bytes(count)?.to_vec();
                (
                    SocksState::Negotiating(Negotiation::MethodSelection),
                    Message::Greeting { methods },
                )
            }
            _ => return Err(DecodeError::malformed(PROTO, "unsupported SOCKS version")),
        },
        SocksState::Negotiating(Negotiation::MethodSelection) => {
            expect_version(&mut cursor, 5)?;
            let method = cursor.read_u8()?;
            let next = match method {
                0x02 => SocksState::Negotiating(Negotiation::UserPassRequest),
                0xff => SocksState::Done,
                _ => SocksState::AwaitingCommand,
            };
            (next, Message::MethodChoice { method })
        }
        SocksState::Negotiating(Negotiation::UserPassRequest) => (
            SocksState::Negotiating(Negotiation::UserPassReply),
            user_pass_request(&mut cursor)?,
        ),
        SocksState::Negotiating(Negotiation::UserPassReply) => {
            expect_version(&mut cursor, 1)?;
            let status = cursor.read_u8()?;
            let next = if status == 0 {
                SocksState::AwaitingCommand
            } else {
                SocksState::Done
            };
            (next, Message::AuthReply { status })
        }
        SocksState::AwaitingCommand => {
            expect_version(&mut cursor, 5)?;
            let command = Command::from(cursor.read_u8()?);
            cursor.advance(1)?;
            let target = read_v5_target(&mut cursor)?;
            (
                SocksState::AwaitingReply,
                Message::V5Request { command, target },
            )
        }
        SocksState::AwaitingReply | SocksState::BindAwaitingSecondReply => {
            let message = reply(&mut cursor, version)?;
            // A granted BIND answers twice: once listening, once connected.
            let next = if message.succeeded()
                && state == SocksState::AwaitingReply
                && command == Some(Command::Bind)
            {
                SocksState::BindAwaitingSecondReply
            } else {
                SocksState::Done
            };
            (next, message)
        }
        SocksState::Done => {
            return Err(DecodeError::malformed(PROTO, "negotiation already finished"));
        }
    };

    Ok(Step {
        next,
        message,
        len: cursor.pos(),
    })
}

fn learn(message: &Message, version: &mut Option<u8>, command: &mut Option<Command>) {
    match message {
        Message::V4Request { command: cmd, .. } => {
            *version = Some(4);
            *command = Some(*cmd);
        }
        Message::Greeting { .. } => *version = Some(5),
        Message::V5Request { command: cmd, .. } => *command = Some(*cmd),
        _ => {}
    }
}

/// Where a pure re-parse of a frame stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Stop {
    End,
    Payload(usize),
    Failed(usize),
}

fn parse_frame(
    entry: SocksState,
    direction: Direction,
    mut version: Option<u8>,
    mut command: Option<Command>,
    data: &[u8],
) -> (Vec<(usize, SocksState, Step)>, Stop) {
    let mut steps = Vec::new();
    let mut state = entry;
    let mut offset = 0;

    while offset < data.len() {
        if state.sender() != Some(direction) {
            return (steps, Stop::Payload(offset));
        }
        match step(state, version, command, &data[offset..]) {
            Ok(parsed) => {
                learn(&parsed.message, &mut version, &mut command);
                let from = state;
                state = parsed.next;
                let len = parsed.len;
                steps.push((offset, from, parsed));
                offset += len;
            }
            Err(_) => return (steps, Stop::Failed(offset)),
        }
    }
    (steps, Stop::End)
}

fn method_name(method: u8) -> &'static str {
    match method {
        0x00 => "No authentication",
        0x01 => "GSSAPI",
        0x02 => "Username/password",
        0xff => "No acceptable methods",
        _ => "Unknown",
    }
}

fn reply_name(version: u8, status: u8) -> &'static str {
    match (version, status) {
        (4, 90) => "Request granted",
        (4, 91) => "Request rejected or failed",
        (4, 92) => "Rejected, identd unreachable",
        (4, 93) => "Rejected, identd user mismatch",
        (5, 0) => "Succeeded",
        (5, 1) => "General SOCKS server failure",
        (5, 2) => "Connection not allowed by ruleset",
        (5, 3) => "Network unreachable",
        (5, 4) => "Host unreachable",
        (5, 5) => "Connection refused",
        (5, 6) => "TTL expired",
        (5, 7) => "Command not supported",
        (5, 8) => "Address type not supported",
        _ => "Unknown",
    }
}

fn describe(tree: &mut FieldTree, base: usize, from: SocksState, step: &Step) {
    let len = step.len;
    match &step.message {
        Message::V4Request {
            command,
            target,
            user,
            user_len,
        } => {
            tree.open(PROTO, base, len, format!("SOCKS v4 {command} request"));
            tree.push(PROTO, base, 1, "Version: 4");
            tree.push(PROTO, base + 1, 1, format!("Command: {command}"));
            tree.push(PROTO, base + 2, 2, format!("Remote port: {}", target.port));
            tree.push(PROTO, base + 4, 4, "Remote address");
            tree.push(PROTO, base + 8, user_len + 1, format!("User id: {user}"));
            if let SocksAddr::Domain(name) = &target.addr {
                let host_at = base + 9 + user_len;
                tree.push(PROTO, host_at, base + len - host_at, format!("Remote host: {name}"));
            }
            tree.push(PROTO, base, len, format!("Requested target: {target}"));
            tree.close();
        }
        Message::V4Reply { status, target } => {
            let second = if from == SocksState::BindAwaitingSecondReply {
                " (second)"
            } else {
                ""
            };
            tree.open(PROTO, base, len, format!("SOCKS v4 reply{second}"));
            tree.push(PROTO, base, 1, "Version: 0");
            tree.push(
                PROTO,
                base + 1,
                1,
                format!("Status: {} ({status})", reply_name(4, *status)),
            );
            tree.push(PROTO, base + 2, 6, format!("Address: {target}"));
            tree.close();
        }
        Message::Greeting { methods } => {
            tree.open(PROTO, base, len, "SOCKS v5 method negotiation");
            tree.push(PROTO, base, 1, "Version: 5");
            tree.push(PROTO, base + 1, 1, format!("Methods: {}", methods.len()));
            for (index, method) in methods.iter().enumerate() {
                tree.push(
                    PROTO,
                    base + 2 + index,
                    1,
                    format!("Method: {} ({method:#04x})", method_name(*method)),
                );
            }
            tree.close();
        }
        Message::MethodChoice { method } => {
            tree.open(PROTO, base, len, "SOCKS v5 method selection");
            tree.push(PROTO, base, 1, "Version: 5");
            tree.push(
                PROTO,
                base + 1,
                1,
                format!("Accepted method: {} ({method:#04x})", method_name(*method)),
            );
            tree.close();
        }
        Message::AuthRequest { user, password_len } => {
            tree.open(PROTO, base, len, "SOCKS v5 username/password authentication");
            tree.push(PROTO, base + 1, 1 + user.len(), format!("Username: {user}"));
            tree.push(
                PROTO,
                base + len - password_len - 1,
                password_len + 1,
                format!("Password: ({password_len} bytes)"),
            );
            tree.close();
        }
        Message::AuthReply { status } => {
            let result = if *status == 0 { "success" } else { "failure" };
            tree.push(
                PROTO,
                base,
                len,
                format!("SOCKS v5 authentication {result} ({status})"),
            );
        }
        Message::V5Request { command, target } => {
            tree.open(PROTO, base, len, format!("SOCKS v5 {command} request"));
            tree.push(PROTO, base, 1, "Version: 5");
            tree.push(PROTO, base + 1, 1, format!("Command: {command}"));
            let address = addr_text(&target.addr);
            tree.push(PROTO, base + 3, len - 5, format!("Remote address: {address}"));
            tree.push(PROTO, base + len - 2, 2, format!("Remote port: {}", target.port));
            tree.close();
        }
        Message::V5Reply { status, target } => {
            let second = if from == SocksState::BindAwaitingSecondReply {
                " (second)"
            } else {
                ""
            };
            tree.open(PROTO, base, len, format!("SOCKS v5 reply{second}"));
            tree.push(PROTO, base, 1, "Version: 5");
            tree.push(
                PROTO,
                base + 1,
                1,
                format!("Status: {} ({status})", reply_name(5, *status)),
            );
            let address = addr_text(&target.addr);
            tree.push(PROTO, base + 3, len - 5, format!("Bound address: {address}"));
            tree.push(PROTO, base + len - 2, 2, format!("Bound port: {}", target.port));
            tree.close();
        }
    }
}

fn addr_text(addr: &SocksAddr) -> String {
    match addr {
        SocksAddr::Ip(ip) => ip.to_string(),
        SocksAddr::Domain(name) => name.clone(),
    }
}

fn take_flow(context: &mut FlowContext<'_>) -> Option<SocksFlow> {
    match context.state.take() {
        None => Some(SocksFlow::default()),
        Some(ProtocolState::Socks(flow)) => Some(flow),
        Some(other) => {
            *context.state = Some(other);
            None
        }
    }
}

fn or_responder(ip: Option<IpAddr>, responder: &Address) -> Address {
    match ip {
        Some(ip) if !ip.is_unspecified() => Address::Ip(ip),
        _ => responder.clone(),
    }
}

/// Side effects of a completed message. Only ever called on the first pass.
fn apply(
    flow: &mut SocksFlow,
    from: SocksState,
    message: &Message,
    packet: &Packet<'_>,
    context: &mut FlowContext<'_>,
) {
    match message {
        Message::V4Request { target, user, .. } => {
            flow.requested = Some(target.clone());
            flow.user = Some(user.clone());
        }
        Message::AuthRequest { user, .. } => flow.user = Some(user.clone()),
        Message::V5Request { target, .. } => flow.requested = Some(target.clone()),
        Message::V4Reply { target, .. } | Message::V5Reply { target, .. }
            if message.succeeded() =>
        {
            if from == SocksState::BindAwaitingSecondReply {
                flow.remote = Some(target.clone());
                return;
            }
            flow.bound = Some(target.clone());
            match flow.command {
                Some(Command::Connect) => flow.remote = flow.requested.clone(),
                Some(Command::Bind) => open_bind_channel(flow, target, packet, context),
                Some(Command::UdpAssociate) => open_udp_relay(target, packet, context),
                _ => {}
            }
        }
        _ => {}
    }
}

fn open_bind_channel(
    flow: &SocksFlow,
    bound: &Target,
    packet: &Packet<'_>,
    context: &mut FlowContext<'_>,
) {
    let Some(remote_ip) = flow.requested.as_ref().and_then(Target::ip) else {
        debug!("BIND target is not an address, data channel not tracked");
        return;
    };
    let listen = Endpoint {
        address: or_responder(bound.ip(), &packet.source.address),
        port: Some(bound.port),
    };
    let key = FlowKey::new(listen, Endpoint::any_port(remote_ip), Transport::Tcp);
    debug!(%key, "tracking BIND data channel");
    context.effect(Effect::OpenFlow {
        key,
        decoder: DecoderId::Socks,
        state: Some(ProtocolState::Socks(SocksFlow::relay(flow.requested.clone()))),
    });
}

fn open_udp_relay(bound: &Target, packet: &Packet<'_>, context: &mut FlowContext<'_>) {
    let relay = Endpoint {
        address: or_responder(bound.ip(), &packet.source.address),
        port: Some(bound.port),
    };
    let client = Endpoint::any_port(packet.destination.address.clone());
    let key = FlowKey::new(relay, client, Transport::Udp);
    debug!(%key, "tracking UDP relay");
    context.effect(Effect::OpenFlow {
        key,
        decoder: DecoderId::SocksUdp,
        state: Some(ProtocolState::SocksUdp(UdpRelay {
            control: Some(context.key.clone()),
            datagrams: 0,
        })),
    });
}

fn looks_like_request(data: &[u8]) -> bool {
    match data {
        [5, count, methods @ ..] => *count > 0 && methods.len() == usize::from(*count),
        [4, 1 | 2, _, _, _, _, _, _, rest @ ..] => rest.contains(&0),
        _ => false,
    }
}

pub struct SocksDecoder;

impl FlowDecoder for SocksDecoder {
    fn id(&self) -> DecoderId {
        DecoderId::Socks
    }

    fn name(&self) -> &'static str {
        PROTO
    }

    fn probe(&self, packet: &Packet<'_>, context: &ProbeContext<'_>) -> ProbeResult {
        if packet.transport != Transport::Tcp || !looks_like_request(packet.data) {
            return ProbeResult::NoMatch;
        }
        if packet.involves_port(&context.config.socks_ports) {
            ProbeResult::Match { priority: 20 }
        } else {
            ProbeResult::Match { priority: 5 }
        }
    }

    fn dissect(&self, packet: &Packet<'_>, context: &mut FlowContext<'_>) -> Outcome {
        let Some(mut flow) = take_flow(context) else {
            return super::state_mismatch(PROTO);
        };

        let (entry, version, command) = (flow.machine.state(), flow.version, flow.command);

        let data = packet.data;
        let mut offset = 0;
        let mut status = FrameStatus::Decoded;
        while offset < data.len() {
            if flow.machine.state().sender() != Some(context.direction) {
                break;
            }
            let (version, command) = (flow.version, flow.command);
            let window = &data[offset..];
            match flow.machine.advance(context.frame, |state| {
                let parsed = step(state, version, command, window)?;
                Ok((parsed.next, parsed))
            }) {
                Ok(Advance::Moved { from, output, .. }) => {
                    learn(&output.message, &mut flow.version, &mut flow.command);
                    apply(&mut flow, from, &output.message, packet, context);
                    offset += output.len;
                }
                Ok(Advance::Halted(_)) => break,
                Err(error) if error.is_insufficient() => {
                    status = incomplete_from(
                        context.config.desegment,
                        packet.stream_offset + offset as u64,
                        &error,
                    );
                    break;
                }
                Err(error) => {
                    context.warn(malformed_warning(&error, offset));
                    status = FrameStatus::Malformed;
                    break;
                }
            }
        }

        // Proxied bytes in this frame follow every message parsed above.
        let facts = SocksFacts {
            entry,
            version,
            command,
            remote: flow.remote.clone(),
        };
        *context.state = Some(ProtocolState::Socks(flow));
        Outcome::new(status, FrameDetail::Socks(facts))
    }

    fn render(
        &self,
        packet: &Packet<'_>,
        facts: &FrameFacts,
        _context: &ReplayContext<'_>,
    ) -> FieldTree {
        let mut tree = FieldTree::default();
        let FrameDetail::Socks(socks) = &facts.detail else {
            return tree;
        };

        let data = packet.data;
        let (steps, stop) = parse_frame(
            socks.entry,
            facts.direction,
            socks.version,
            socks.command,
            data,
        );
        for (offset, from, step) in &steps {
            describe(&mut tree, *offset, *from, step);
        }

        match stop {
            Stop::End => {}
            Stop::Payload(offset) => {
                let len = data.len() - offset;
                let label = match &socks.remote {
                    Some(remote) => format!("Proxied data to {remote} ({len} bytes)"),
                    None => format!("Data ({len} bytes)"),
                };
                tree.push(PROTO, offset, data.len() - offset, label);
            }
            Stop::Failed(offset) => push_status(&mut tree, PROTO, facts.status, offset, data.len()),
        }
        tree
    }
}

/// Header of a relayed datagram: `RSV(2) FRAG(1) address port`.
fn udp_header(data: &[u8]) -> Result<(u8, Target, usize), DecodeError> {
    let mut cursor = Cursor::new(data);
    cursor.advance(2)?;
    let fragment = cursor.read_u8()?;
    let target = read_v5_target(&mut cursor)?;
    Ok((fragment, target, cursor.pos()))
}

pub struct SocksUdpDecoder;

impl FlowDecoder for SocksUdpDecoder {
    fn id(&self) -> DecoderId {
        DecoderId::SocksUdp
    }

    fn name(&self) -> &'static str {
        UDP_PROTO
    }

    fn probe(&self, _packet: &Packet<'_>, _context: &ProbeContext<'_>) -> ProbeResult {
        // Only reachable through a negotiated UDP ASSOCIATE.
        ProbeResult::NoMatch
    }

    fn dissect(&self, packet: &Packet<'_>, context: &mut FlowContext<'_>) -> Outcome {
        let mut relay = match context.state.take() {
            None => UdpRelay::default(),
            Some(ProtocolState::SocksUdp(relay)) => relay,
            Some(other) => {
                *context.state = Some(other);
                return super::state_mismatch(UDP_PROTO);
            }
        };
        relay.datagrams += 1;
        *context.state = Some(ProtocolState::SocksUdp(relay));

        let status = match udp_header(packet.data) {
            Ok(_) => FrameStatus::Decoded,
            Err(error) => {
                context.warn(malformed_warning(&error, 0));
                FrameStatus::Malformed
            }
        };
        Outcome::new(status, FrameDetail::None)
    }

    fn render(
        &self,
        packet: &Packet<'_>,
        facts: &FrameFacts,
        _context: &ReplayContext<'_>,
    ) -> FieldTree {
        let mut tree = FieldTree::default();
        let data = packet.data;
        let Ok((fragment, target, header)) = udp_header(data) else {
            push_status(&mut tree, UDP_PROTO, facts.status, 0, data.len());
            return tree;
        };

        let role = match facts.direction {
            Direction::Originator => "Destination",
            Direction::Responder => "Source",
        };
        tree.open(UDP_PROTO, 0, header, "SOCKS v5 UDP relay header");
        tree.push(UDP_PROTO, 2, 1, format!("Fragment: {fragment}"));
        tree.push(UDP_PROTO, 3, header - 3, format!("{role}: {target}"));
        tree.close();
        if header < data.len() {
            tree.push(
                UDP_PROTO,
                header,
                data.len() - header,
                format!("Relayed data ({} bytes)", data.len() - header),
            );
        }
        tree
    }
}
