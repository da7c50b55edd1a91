use std::net::{IpAddr, Ipv4Addr};

use flowscope::engine::framing::{LengthPrefixed, Need, SegmentController};
use flowscope::engine::{Correlation, DecodeError, Endian};
use flowscope::protocols::{CallInfo, ProtocolState};
use flowscope::protocols::rpc::RpcCall;
use flowscope::state::{FlowRegistry, SegmentBuffer, SegmentEvent, TransactionKey};
use flowscope::{Endpoint, FlowKey, FrameStatus, Packet, Session, ShardedSession, Transport};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn ep(a: u8, b: u8, c: u8, d: u8, port: u16) -> Endpoint {
    Endpoint::new(IpAddr::V4(Ipv4Addr::new(a, b, c, d)), port)
}

fn words(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|value| value.to_be_bytes()).collect()
}

fn record(body: &[u8]) -> Vec<u8> {
    let mut out = (0x8000_0000 | body.len() as u32).to_be_bytes().to_vec();
    out.extend_from_slice(body);
    out
}

#[test]
fn flow_lookup_is_symmetric() {
    let mut flows = FlowRegistry::<()>::new(16);
    let a = ep(10, 0, 0, 1, 40000);
    let b = ep(10, 0, 0, 2, 80);
    let forward = flows
        .find_or_create(&FlowKey::new(a.clone(), b.clone(), Transport::Tcp))
        .expect("capacity");
    let backward = flows
        .find_or_create(&FlowKey::new(b, a, Transport::Tcp))
        .expect("capacity");
    assert_eq!(forward, backward);
    assert_eq!(flows.len(), 1);
}

#[test]
fn reply_on_reversed_tuple_completes_the_call() {
    init_tracing();
    let client = ep(10, 0, 0, 1, 700);
    let server = ep(10, 0, 0, 9, 111);
    // xid 7, CALL, portmap v2 GETPORT, AUTH_NULL, mapping { NFS v3 over TCP }
    let call = words(&[7, 0, 2, 100_000, 2, 3, 0, 0, 0, 0, 100_003, 3, 6, 0]);
    // xid 7, REPLY, accepted, AUTH_NULL, SUCCESS, port 2049
    let reply = words(&[7, 1, 0, 0, 0, 0, 2049]);

    let mut session = Session::default();
    let first = session
        .deliver(&Packet::new(1, &call, client.clone(), server.clone(), Transport::Udp))
        .expect("first pass");
    let second = session
        .deliver(&Packet::new(2, &reply, server, client, Transport::Udp))
        .expect("first pass");
    assert_eq!(first.flow, second.flow);
    assert!(second.tree.contains_label("Reply to request in frame 1"));
    assert!(second.tree.contains_label("Port: 2049"));

    let flow = second.flow.expect("tracked");
    let transaction = session
        .transactions()
        .get(&TransactionKey { flow, id: 7 })
        .expect("transaction opened by the call");
    assert_eq!(transaction.request_frame, 1);
    assert_eq!(transaction.reply_frame, Some(2));
    let CallInfo::Rpc(RpcCall {
        program, procedure, ..
    }) = &transaction.metadata
    else {
        panic!("rpc metadata expected");
    };
    assert_eq!((*program, *procedure), (100_000, 3));

    let learned = session
        .ports()
        .lookup(Transport::Tcp, 2049)
        .expect("GETPORT reply learned");
    assert_eq!(learned.program, 100_003);
}

#[test]
fn replay_changes_nothing_and_renders_the_same() {
    let client = ep(10, 0, 0, 1, 700);
    let server = ep(10, 0, 0, 9, 111);
    let call = words(&[9, 0, 2, 100_000, 2, 0, 0, 0, 0, 0]);
    let reply = words(&[9, 1, 0, 0, 0, 0]);
    let packets = [
        Packet::new(1, &call, client.clone(), server.clone(), Transport::Udp),
        Packet::new(2, &reply, server, client, Transport::Udp),
    ];

    let mut session = Session::default();
    let first: Vec<_> = packets
        .iter()
        .map(|packet| session.deliver(packet).expect("first pass"))
        .collect();
    let flow = first[0].flow.expect("tracked");
    let transactions: Vec<_> = session.transactions().for_flow(flow).cloned().collect();
    let state = session.flow(flow).map(|flow| flow.state.clone());

    for (packet, original) in packets.iter().zip(&first) {
        let again = session
            .deliver(&packet.clone().replay())
            .expect("replay never faults");
        assert_eq!(&again, original);
    }

    let after: Vec<_> = session.transactions().for_flow(flow).cloned().collect();
    assert_eq!(after, transactions);
    assert_eq!(session.flow(flow).map(|flow| flow.state.clone()), state);
    assert_eq!(session.memo().len(), 2);
}

#[test]
fn duplicate_reply_is_flagged_not_rematched() {
    let client = ep(10, 0, 0, 1, 700);
    let server = ep(10, 0, 0, 9, 111);
    let call = words(&[3, 0, 2, 100_000, 2, 0, 0, 0, 0, 0]);
    let reply = words(&[3, 1, 0, 0, 0, 0]);

    let mut session = Session::default();
    session
        .deliver(&Packet::new(1, &call, client.clone(), server.clone(), Transport::Udp))
        .expect("first pass");
    session
        .deliver(&Packet::new(2, &reply, server.clone(), client.clone(), Transport::Udp))
        .expect("first pass");
    let duplicate = session
        .deliver(&Packet::new(3, &reply, server, client, Transport::Udp))
        .expect("first pass");
    assert!(duplicate.tree.contains_label("first reply in frame 2"));
    assert_eq!(
        duplicate.warnings[0].code,
        flowscope::WarningCode::DuplicateReply
    );
}

#[test]
fn five_byte_header_asks_for_the_rest() {
    let framing = LengthPrefixed {
        header_len: 5,
        length_offset: 1,
        length_width: 4,
        endian: Endian::Big,
        length_mask: u32::MAX,
        includes_header: true,
    };
    let mut buffer = vec![0x01, 0x00, 0x00, 0x03, 0xe8];
    buffer.resize(40, 0xaa);
    let need = framing
        .frame(&SegmentController::new(2 << 20), &buffer, 0)
        .expect("valid header");
    assert_eq!(
        need,
        Need::NeedMoreBytes {
            resume_at: 0,
            additional: 960
        }
    );
}

#[test]
fn ten_mebibytes_is_never_buffered() {
    let controller = SegmentController::new(2 << 20);
    assert_eq!(
        controller.need(40, 10 << 20),
        Err(DecodeError::Oversized {
            declared: 10 << 20,
            limit: 2 << 20
        })
    );
}

#[test]
fn rpc_record_split_across_segments() {
    let client = ep(10, 0, 0, 1, 900);
    let server = ep(10, 0, 0, 9, 2049);
    // xid 0x42, CALL, NFS v3 NULL, AUTH_NULL
    let stream = record(&words(&[0x42, 0, 2, 100_003, 3, 0, 0, 0, 0, 0]));
    let (head, tail) = stream.split_at(20);

    let mut session = Session::default();
    let mut buffer = SegmentBuffer::default();
    let first = session
        .deliver(&Packet::new(1, head, client.clone(), server.clone(), Transport::Tcp))
        .expect("first pass");
    let FrameStatus::NeedMoreBytes {
        resume_at,
        additional,
    } = first.status
    else {
        panic!("partial record expected, got {:?}", first.status);
    };
    assert_eq!((resume_at, additional), (0, 24));
    buffer.hold(resume_at, &head[resume_at as usize..], additional);

    let SegmentEvent::Ready {
        stream_offset,
        data,
    } = buffer.push(20, tail)
    else {
        panic!("held bytes complete the record");
    };
    let packet =
        Packet::new(2, &data, client, server, Transport::Tcp).at_stream_offset(stream_offset);
    let second = session.deliver(&packet).expect("first pass");
    assert_eq!(second.status, FrameStatus::Decoded);
    assert!(second.tree.contains_label("Program: NFS (100003)"));
    assert!(second.tree.contains_label("Last fragment, 40 bytes"));
}

#[test]
fn learned_port_claims_a_mid_stream_reply() {
    let client = ep(10, 0, 0, 1, 700);
    let portmapper = ep(10, 0, 0, 9, 111);
    let mount_client = ep(10, 0, 0, 1, 801);
    let mount = ep(10, 0, 0, 9, 635);
    // GETPORT { MOUNT v3 over TCP } answered with 635
    let call = words(&[11, 0, 2, 100_000, 2, 3, 0, 0, 0, 0, 100_005, 3, 6, 0]);
    let reply = words(&[11, 1, 0, 0, 0, 0, 635]);
    // A MOUNT reply whose call predates the capture.
    let orphan = record(&words(&[99, 1, 0, 0, 0, 0]));

    let mut fresh = Session::default();
    let report = fresh
        .deliver(&Packet::new(1, &orphan, mount.clone(), mount_client.clone(), Transport::Tcp))
        .expect("first pass");
    assert_eq!(report.status, FrameStatus::Opaque);

    let mut session = Session::default();
    session
        .deliver(&Packet::new(1, &call, client.clone(), portmapper.clone(), Transport::Udp))
        .expect("first pass");
    session
        .deliver(&Packet::new(2, &reply, portmapper, client, Transport::Udp))
        .expect("first pass");
    let report = session
        .deliver(&Packet::new(3, &orphan, mount, mount_client, Transport::Tcp))
        .expect("first pass");
    assert_eq!(report.decoder, Some("rpc"));
    assert!(report.tree.contains_label("Reply to unseen request"));
}

/// Full SOCKS v5 BIND exchange followed by the inbound data connection.
fn socks_bind_packets() -> Vec<(Endpoint, Endpoint, Vec<u8>)> {
    let client = ep(10, 0, 0, 1, 40000);
    let proxy = ep(10, 0, 0, 2, 1080);
    let remote = ep(192, 0, 2, 7, 5000);
    let listen = ep(10, 0, 0, 2, 8080);
    vec![
        // greeting: one method, no authentication
        (client.clone(), proxy.clone(), vec![5, 1, 0]),
        (proxy.clone(), client.clone(), vec![5, 0]),
        // BIND 192.0.2.7:21
        (client.clone(), proxy.clone(), vec![5, 2, 0, 1, 192, 0, 2, 7, 0, 21]),
        // listening on 10.0.0.2:8080
        (proxy.clone(), client.clone(), vec![5, 0, 0, 1, 10, 0, 0, 2, 0x1f, 0x90]),
        // 192.0.2.7:5000 connected
        (proxy, client, vec![5, 0, 0, 1, 192, 0, 2, 7, 0x13, 0x88]),
        (remote, listen, b"220 ready\r\n".to_vec()),
    ]
}

#[test]
fn socks_bind_opens_the_data_channel() {
    init_tracing();
    let mut session = Session::default();
    let mut reports = Vec::new();
    for (frame, (source, destination, data)) in socks_bind_packets().into_iter().enumerate() {
        let packet = Packet::new(frame as u64 + 1, &data, source, destination, Transport::Tcp);
        reports.push(session.deliver(&packet).expect("first pass"));
    }

    assert!(reports[2].tree.contains_label("SOCKS v5 Bind request"));
    assert!(reports[4].tree.contains_label("SOCKS v5 reply (second)"));
    let data = &reports[5];
    assert_eq!(data.decoder, Some("socks"));
    assert!(data.tree.contains_label("Proxied data to 192.0.2.7:21 (11 bytes)"));
    // The wildcard flow was completed, not duplicated.
    assert_eq!(session.flows().len(), 2);
    assert_ne!(data.flow, reports[0].flow);
}

#[test]
fn sharded_session_forwards_the_data_channel() {
    let sessions = ShardedSession::new(flowscope::EngineConfig::default(), 8);
    let mut last = None;
    for (frame, (source, destination, data)) in socks_bind_packets().into_iter().enumerate() {
        let packet = Packet::new(frame as u64 + 1, &data, source, destination, Transport::Tcp);
        last = Some(sessions.deliver(&packet).expect("first pass"));
    }
    let last = last.expect("packets delivered");
    assert_eq!(last.decoder, Some("socks"));
    assert_eq!(sessions.flow_count(), 2);
}

#[test]
fn beep_payload_and_correlation_span_packets() {
    let client = ep(10, 0, 0, 1, 50000);
    let server = ep(10, 0, 0, 2, 10288);
    let packets = [
        Packet::new(1, b"MSG 1 1 . 0 12\r\nhello ", client.clone(), server.clone(), Transport::Tcp),
        Packet::new(2, b"world!END\r\n", client.clone(), server.clone(), Transport::Tcp),
        Packet::new(3, b"RPY 1 1 . 0 2\r\nokEND\r\n", server, client, Transport::Tcp),
    ];

    let mut session = Session::default();
    let reports: Vec<_> = packets
        .iter()
        .map(|packet| session.deliver(packet).expect("first pass"))
        .collect();
    assert!(reports[1]
        .tree
        .contains_label("Payload continued from previous frame (6 bytes)"));
    assert!(reports[1].tree.contains_label("Trailer: END"));
    assert!(reports[2].tree.contains_label("Reply to request in frame 1"));

    let replayed = session
        .deliver(&packets[1].clone().replay())
        .expect("replay");
    assert_eq!(replayed, reports[1]);

    let flow = reports[0].flow.expect("tracked");
    let key = (1u64 << 32) | 1;
    let transaction = session
        .transactions()
        .get(&TransactionKey { flow, id: key })
        .expect("MSG opened a transaction");
    assert_eq!(transaction.reply_frame, Some(3));
}

#[test]
fn correlation_labels() {
    assert_eq!(Correlation::Opened.label(), "Request");
    assert_eq!(
        Correlation::Matched { request_frame: 4 }.request_frame(),
        Some(4)
    );
}

#[test]
fn beep_peers_number_their_messages_independently() {
    let a = ep(10, 0, 0, 1, 50000);
    let b = ep(10, 0, 0, 2, 10288);
    let empty = |keyword: &str| format!("{keyword} 0 1 . 0 0\r\nEND\r\n").into_bytes();
    let (msg, rpy) = (empty("MSG"), empty("RPY"));
    let packets = [
        Packet::new(1, &msg, a.clone(), b.clone(), Transport::Tcp),
        Packet::new(2, &msg, b.clone(), a.clone(), Transport::Tcp),
        Packet::new(3, &rpy, b.clone(), a.clone(), Transport::Tcp),
        Packet::new(4, &rpy, a, b, Transport::Tcp),
    ];

    let mut session = Session::default();
    let reports: Vec<_> = packets
        .iter()
        .map(|packet| session.deliver(packet).expect("first pass"))
        .collect();
    assert!(reports.iter().all(|report| report.warnings.is_empty()));
    assert!(reports[1].tree.contains_label("Request"));
    assert!(!reports[1].tree.contains_label("Duplicate"));
    assert!(reports[2].tree.contains_label("Reply to request in frame 1"));
    assert!(reports[3].tree.contains_label("Reply to request in frame 2"));
}

#[test]
fn beep_answers_peek_and_nul_completes() {
    let client = ep(10, 0, 0, 1, 50000);
    let server = ep(10, 0, 0, 2, 10288);
    let (to_server, to_client) = ((client.clone(), server.clone()), (server, client));
    let frames: [(&[u8], &(Endpoint, Endpoint)); 4] = [
        (&b"MSG 3 7 . 0 3\r\nabcEND\r\n"[..], &to_server),
        (&b"ANS 3 7 . 0 2 0\r\nokEND\r\n"[..], &to_client),
        (&b"ANS 3 7 . 2 2 1\r\nokEND\r\n"[..], &to_client),
        (&b"NUL 3 7 . 4 0\r\nEND\r\n"[..], &to_client),
    ];
    let packets: Vec<_> = frames
        .iter()
        .enumerate()
        .map(|(index, (data, (source, destination)))| {
            let frame = index as u64 + 1;
            Packet::new(frame, data, source.clone(), destination.clone(), Transport::Tcp)
        })
        .collect();

    let mut session = Session::default();
    let key = TransactionKey {
        flow: session
            .deliver(&packets[0])
            .expect("first pass")
            .flow
            .expect("tracked"),
        id: (3u64 << 32) | 7,
    };
    for packet in &packets[1..3] {
        let report = session.deliver(packet).expect("first pass");
        assert!(report.tree.contains_label("Answer number"));
        assert!(report.tree.contains_label("Reply to request in frame 1"));
        let transaction = session.transactions().get(&key).expect("still open");
        assert_eq!(transaction.reply_frame, None);
    }

    let nul = session.deliver(&packets[3]).expect("first pass");
    assert!(nul.tree.contains_label("Reply to request in frame 1"));
    let transaction = session.transactions().get(&key).expect("transaction kept");
    assert_eq!(transaction.reply_frame, Some(4));
}

#[test]
fn partial_messages_are_truncated_without_desegmentation() {
    let config = flowscope::EngineConfig {
        desegment: false,
        ..flowscope::EngineConfig::default()
    };
    let mut session = Session::new(config);

    let client = ep(10, 0, 0, 1, 50000);
    let server = ep(10, 0, 0, 2, 10288);
    let beep = Packet::new(1, b"MSG 0 1 . 0 0\r\nEND\r\nMSG 0 2", client, server, Transport::Tcp);
    let report = session.deliver(&beep).expect("first pass");
    assert_eq!(report.status, FrameStatus::Truncated);
    assert!(report.tree.contains_label("[Truncated message]"));

    let stream = record(&words(&[0x42, 0, 2, 100_003, 3, 0, 0, 0, 0, 0]));
    let (nfs_client, nfs) = (ep(10, 0, 0, 1, 900), ep(10, 0, 0, 9, 2049));
    let rpc = Packet::new(2, &stream[..20], nfs_client, nfs, Transport::Tcp);
    let report = session.deliver(&rpc).expect("first pass");
    assert_eq!(report.status, FrameStatus::Truncated);
    assert!(report.tree.contains_label("[Truncated message]"));
}

#[test]
fn portmapper_callit_reply_uses_the_indirect_call() {
    let client = ep(10, 0, 0, 1, 700);
    let portmapper = ep(10, 0, 0, 9, 111);
    // CALLIT { STAT v1 procedure 1, no arguments }
    let call = words(&[21, 0, 2, 100_000, 2, 5, 0, 0, 0, 0, 100_024, 1, 1, 0]);
    // accepted, SUCCESS, port 32768, no result bytes
    let reply = words(&[21, 1, 0, 0, 0, 0, 32768, 0]);

    let mut session = Session::default();
    let request = session
        .deliver(&Packet::new(1, &call, client.clone(), portmapper.clone(), Transport::Udp))
        .expect("first pass");
    assert!(request.tree.contains_label("CALLIT"));
    let answer = session
        .deliver(&Packet::new(2, &reply, portmapper, client, Transport::Udp))
        .expect("first pass");
    assert!(answer.tree.contains_label("Reply to request in frame 1"));
    assert!(answer.tree.contains_label(
        "Indirect reply from STAT (100024) procedure 1 on port 32768, 0 result bytes"
    ));

    let learned = session
        .ports()
        .lookup(Transport::Udp, 32768)
        .expect("CALLIT reply learned");
    assert_eq!((learned.program, learned.version), (100_024, 1));

    let again = Packet::new(2, &reply, ep(10, 0, 0, 9, 111), ep(10, 0, 0, 1, 700), Transport::Udp);
    let replayed = session.deliver(&again.replay()).expect("replay");
    assert_eq!(replayed, answer);
}

#[test]
fn sharded_session_learns_ports_everywhere() {
    let sessions = ShardedSession::new(flowscope::EngineConfig::default(), 4);
    let client = ep(10, 0, 0, 1, 700);
    let portmapper = ep(10, 0, 0, 9, 111);
    let call = words(&[11, 0, 2, 100_000, 2, 3, 0, 0, 0, 0, 100_005, 3, 6, 0]);
    let reply = words(&[11, 1, 0, 0, 0, 0, 635]);
    sessions
        .deliver(&Packet::new(1, &call, client.clone(), portmapper.clone(), Transport::Udp))
        .expect("first pass");
    sessions
        .deliver(&Packet::new(2, &reply, portmapper, client, Transport::Udp))
        .expect("first pass");

    for index in 0..sessions.shard_count() {
        let learned = sessions.with_shard(index, |shard| {
            shard.ports().lookup(Transport::Tcp, 635).map(|port| port.program)
        });
        assert_eq!(learned, Some(Some(100_005)));
    }

    // A MOUNT reply between other hosts is claimed in whichever shard owns it.
    let orphan = record(&words(&[99, 1, 0, 0, 0, 0]));
    let report = sessions
        .deliver(&Packet::new(
            3,
            &orphan,
            ep(172, 16, 0, 5, 635),
            ep(172, 16, 0, 6, 801),
            Transport::Tcp,
        ))
        .expect("first pass");
    assert_eq!(report.decoder, Some("rpc"));
}

fn deliver_all(
    session: &mut Session,
    packets: Vec<(Endpoint, Endpoint, Vec<u8>)>,
    transport: Transport,
) -> Vec<flowscope::FrameReport> {
    packets
        .into_iter()
        .enumerate()
        .map(|(frame, (source, destination, data))| {
            let packet = Packet::new(frame as u64 + 1, &data, source, destination, transport);
            session.deliver(&packet).expect("first pass")
        })
        .collect()
}

#[test]
fn socks_v4_connect_end_to_end() {
    let client = ep(10, 0, 0, 1, 40000);
    let proxy = ep(10, 0, 0, 2, 1080);
    let mut session = Session::default();
    let reports = deliver_all(
        &mut session,
        vec![
            // CONNECT 192.0.2.7:80 as user "bob"
            (client.clone(), proxy.clone(), vec![4, 1, 0, 80, 192, 0, 2, 7, b'b', b'o', b'b', 0]),
            (proxy.clone(), client.clone(), vec![0, 90, 0, 0, 0, 0, 0, 0]),
            (client, proxy, b"GET /".to_vec()),
        ],
        Transport::Tcp,
    );

    assert_eq!(reports[0].decoder, Some("socks"));
    assert!(reports[0].tree.contains_label("SOCKS v4 Connect request"));
    assert!(reports[0].tree.contains_label("User id: bob"));
    assert!(reports[0].tree.contains_label("Requested target: 192.0.2.7:80"));
    assert!(reports[1].tree.contains_label("Status: Request granted (90)"));
    assert!(reports[2].tree.contains_label("Proxied data to 192.0.2.7:80 (5 bytes)"));
}

#[test]
fn socks_v5_username_password_negotiation() {
    let client = ep(10, 0, 0, 1, 40001);
    let proxy = ep(10, 0, 0, 2, 1080);
    let mut auth = vec![1, 5];
    auth.extend_from_slice(b"alice");
    auth.push(6);
    auth.extend_from_slice(b"secret");

    let mut session = Session::default();
    let reports = deliver_all(
        &mut session,
        vec![
            (client.clone(), proxy.clone(), vec![5, 1, 2]),
            (proxy.clone(), client.clone(), vec![5, 2]),
            (client.clone(), proxy.clone(), auth),
            (proxy.clone(), client.clone(), vec![1, 0]),
            (client, proxy, vec![5, 1, 0, 1, 192, 0, 2, 7, 0, 80]),
        ],
        Transport::Tcp,
    );

    assert!(reports[1].tree.contains_label("Accepted method: Username/password"));
    assert!(reports[2].tree.contains_label("Username: alice"));
    assert!(reports[2].tree.contains_label("Password: (6 bytes)"));
    assert!(reports[3].tree.contains_label("SOCKS v5 authentication success (0)"));
    assert!(reports[4].tree.contains_label("SOCKS v5 Connect request"));
    assert!(reports.iter().all(|report| report.status == FrameStatus::Decoded));

    let flow = session.flow(reports[0].flow.expect("tracked")).expect("flow");
    let Some(ProtocolState::Socks(socks)) = &flow.state else {
        panic!("socks state expected");
    };
    assert_eq!(socks.user.as_deref(), Some("alice"));
}

#[test]
fn socks_reply_and_first_proxied_bytes_in_one_segment() {
    let client = ep(10, 0, 0, 1, 40002);
    let proxy = ep(10, 0, 0, 2, 1080);
    let mut reply = vec![5, 0, 0, 1, 10, 0, 0, 2, 0x9c, 0x40];
    reply.extend_from_slice(b"HTTP/1.1 200 OK\r\n");

    let mut session = Session::default();
    let reports = deliver_all(
        &mut session,
        vec![
            (client.clone(), proxy.clone(), vec![5, 1, 0]),
            (proxy.clone(), client.clone(), vec![5, 0]),
            (client.clone(), proxy.clone(), vec![5, 1, 0, 1, 192, 0, 2, 7, 0, 80]),
            (proxy, client, reply),
        ],
        Transport::Tcp,
    );
    assert!(reports[3].tree.contains_label("SOCKS v5 reply"));
    assert!(reports[3].tree.contains_label("Proxied data to 192.0.2.7:80 (17 bytes)"));
}

#[test]
fn socks_udp_associate_opens_the_relay() {
    let client = ep(10, 0, 0, 1, 40003);
    let proxy = ep(10, 0, 0, 2, 1080);
    let mut session = Session::default();
    let control = deliver_all(
        &mut session,
        vec![
            (client.clone(), proxy.clone(), vec![5, 1, 0]),
            (proxy.clone(), client.clone(), vec![5, 0]),
            (client.clone(), proxy.clone(), vec![5, 3, 0, 1, 0, 0, 0, 0, 0, 0]),
            // relay at 10.0.0.2:8080
            (proxy.clone(), client, vec![5, 0, 0, 1, 10, 0, 0, 2, 0x1f, 0x90]),
        ],
        Transport::Tcp,
    );
    assert!(control[2].tree.contains_label("SOCKS v5 UDP Associate request"));

    let mut query = vec![0, 0, 0, 1, 192, 0, 2, 7, 0, 53];
    query.extend_from_slice(b"query");
    let mut answer = vec![0, 0, 0, 1, 192, 0, 2, 7, 0, 53];
    answer.extend_from_slice(b"answer");
    let udp_client = ep(10, 0, 0, 1, 5353);
    let relay = ep(10, 0, 0, 2, 8080);

    let outbound = session
        .deliver(&Packet::new(5, &query, udp_client.clone(), relay.clone(), Transport::Udp))
        .expect("first pass");
    assert_eq!(outbound.decoder, Some("socks-udp"));
    assert!(outbound.tree.contains_label("SOCKS v5 UDP relay header"));
    assert!(outbound.tree.contains_label("Destination: 192.0.2.7:53"));
    assert!(outbound.tree.contains_label("Relayed data (5 bytes)"));

    let inbound = session
        .deliver(&Packet::new(6, &answer, relay, udp_client, Transport::Udp))
        .expect("first pass");
    assert_eq!(inbound.flow, outbound.flow);
    assert!(inbound.tree.contains_label("Source: 192.0.2.7:53"));
    assert!(inbound.tree.contains_label("Relayed data (6 bytes)"));

    let flow = session.flow(outbound.flow.expect("tracked")).expect("flow");
    let Some(ProtocolState::SocksUdp(state)) = &flow.state else {
        panic!("relay state expected");
    };
    assert_eq!(state.datagrams, 2);
    assert_eq!(state.control, Some(FlowKey::new(ep(10, 0, 0, 1, 40003), proxy, Transport::Tcp)));
}
