// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// End-to-end scenarios: a client Session talking to an XrceAgent on its own
// thread over an in-process (or UDP) link, with a loopback middleware
// behind the agent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::agent::XrceAgent;
use crate::config::{ReliabilityConfig, SessionConfig, XrceAgentConfig};
use crate::error::XrceError;
use crate::protocol::*;
use crate::session::Session;
use crate::test_util::*;
use crate::transport::{
    MemoryAgentTransport, MemoryClientTransport, UdpClientTransport, UdpTransport,
};

const KEY: ClientKey = ClientKey([0x11, 0x22, 0x33, 0x44]);
const TIMEOUT: Duration = Duration::from_secs(5);

type TestSession = Session<LossyLink<MemoryClientTransport>>;

struct Fixture {
    session: TestSession,
    out: StreamId,
    input: StreamId,
    bridge: Arc<LoopbackBridge>,
    agent: AgentThread,
}

fn fixture_with(config: XrceAgentConfig) -> Fixture {
    fixture_configs(config, fast_session_config())
}

fn fixture_configs(config: XrceAgentConfig, session: SessionConfig) -> Fixture {
    let bridge = LoopbackBridge::new();
    let (agent, mut links) = AgentThread::start(config, bridge.clone(), 1);
    let link = LossyLink::new(links.remove(0), 0x5EED, 0.2, 0.1, 0.1);
    let mut session = Session::new(link, KEY, session).unwrap();
    assert_eq!(session.create_session(TIMEOUT).unwrap(), StatusCode::Ok);
    let out = session
        .create_output_stream(StreamKind::Reliable, 8 * 512, 8)
        .unwrap();
    let input = session
        .create_input_stream(StreamKind::Reliable, 16)
        .unwrap();
    Fixture {
        session,
        out,
        input,
        bridge,
        agent,
    }
}

fn fixture() -> Fixture {
    fixture_with(fast_agent_config())
}

fn participant() -> ObjectId {
    ObjectId::new(0x0001, ObjectKind::Participant)
}

fn topic() -> ObjectId {
    ObjectId::new(0x0001, ObjectKind::Topic)
}

fn publisher() -> ObjectId {
    ObjectId::new(0x0001, ObjectKind::Publisher)
}

fn writer() -> ObjectId {
    ObjectId::new(0x0001, ObjectKind::DataWriter)
}

fn subscriber() -> ObjectId {
    ObjectId::new(0x0001, ObjectKind::Subscriber)
}

fn reader() -> ObjectId {
    ObjectId::new(0x0001, ObjectKind::DataReader)
}

fn reference(name: &str) -> Representation {
    Representation::Reference(name.into())
}

/// participant -> topic, publisher -> writer, subscriber -> reader.
fn build_graph(f: &mut Fixture) {
    let (s, out) = (&mut f.session, f.out);
    let mode = CreationMode::default();
    let requests = vec![
        s.create_participant(out, participant(), 0, reference("default_participant"), mode)
            .unwrap(),
        s.create_topic(out, topic(), participant(), reference("HelloWorldTopic"), mode)
            .unwrap(),
        s.create_publisher(out, publisher(), participant(), Representation::Xml("<publisher/>".into()), mode)
            .unwrap(),
        s.create_datawriter(out, writer(), publisher(), reference("HelloWorldWriter"), mode)
            .unwrap(),
        s.create_subscriber(out, subscriber(), participant(), Representation::Xml("<subscriber/>".into()), mode)
            .unwrap(),
        s.create_datareader(out, reader(), subscriber(), reference("HelloWorldReader"), mode)
            .unwrap(),
    ];
    let statuses = s.run_until_all_status(&requests, TIMEOUT).unwrap();
    assert!(
        statuses.iter().all(|st| *st == StatusCode::Ok),
        "{:?}",
        statuses
    );
    // Leave the whole output window to the test.
    s.run_until_confirm_delivery(TIMEOUT).unwrap();
}

fn collect_data(s: &mut TestSession) -> Arc<Mutex<Vec<Vec<u8>>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    s.set_topic_callback(Box::new(move |_object, _request, _stream, data| {
        sink.lock().push(data.to_vec());
    }));
    seen
}

fn collect_status(s: &mut TestSession) -> Arc<Mutex<Vec<(ObjectId, RequestId, StatusCode)>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    s.set_status_callback(Box::new(move |object, request, status| {
        sink.lock().push((object, request, status));
    }));
    seen
}

/// Write, running the session while the window is full.
fn write_blocking(s: &mut TestSession, out: StreamId, payload: &[u8]) {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        match s.write(out, writer(), payload) {
            Ok(_) => return,
            Err(XrceError::BufferExhausted) if Instant::now() < deadline => {
                s.run(Duration::from_millis(5)).unwrap();
            }
            Err(e) => panic!("write failed: {}", e),
        }
    }
}

// -----------------------------------------------------------------------
// 1. CREATE participant: OK, then ALREADY_EXISTS without creation flags
// -----------------------------------------------------------------------
#[test]
fn test_create_participant_then_duplicate() {
    let mut f = fixture();
    let (s, out) = (&mut f.session, f.out);
    let first = s
        .create_participant(out, participant(), 0, reference("default_participant"), CreationMode::default())
        .unwrap();
    assert_eq!(
        s.run_until_all_status(&[first], TIMEOUT).unwrap(),
        vec![StatusCode::Ok]
    );

    let second = s
        .create_participant(out, participant(), 0, reference("default_participant"), CreationMode::default())
        .unwrap();
    assert_ne!(first, second);
    assert_eq!(
        s.run_until_all_status(&[second], TIMEOUT).unwrap(),
        vec![StatusCode::ErrAlreadyExists]
    );
    // Collected statuses are no longer tracked.
    assert_eq!(s.status_of(first), None);
    assert_eq!(f.bridge.live_of(ObjectKind::Participant), 1);
    assert_eq!(f.agent.agent.object_count(KEY), Some(1));
}

// -----------------------------------------------------------------------
// 2. Creation modes: REUSE / REPLACE over the wire
// -----------------------------------------------------------------------
#[test]
fn test_creation_mode_matrix() {
    let mut f = fixture();
    let (s, out) = (&mut f.session, f.out);
    let reuse = CreationMode {
        reuse: true,
        replace: false,
    };
    let replace = CreationMode {
        reuse: false,
        replace: true,
    };
    let both = CreationMode {
        reuse: true,
        replace: true,
    };
    let cases = [
        (CreationMode::default(), "a", StatusCode::Ok),
        (CreationMode::default(), "a", StatusCode::ErrAlreadyExists),
        (reuse, "a", StatusCode::OkMatched),
        (reuse, "b", StatusCode::ErrAlreadyExists),
        (replace, "b", StatusCode::Ok),
        (both, "b", StatusCode::OkMatched),
        (both, "c", StatusCode::Ok),
    ];
    for (mode, profile, expected) in cases {
        let request = s
            .create_participant(out, participant(), 0, reference(profile), mode)
            .unwrap();
        let got = s.run_until_all_status(&[request], TIMEOUT).unwrap();
        assert_eq!(got, vec![expected], "mode {:?} profile {}", mode, profile);
    }
    // Replacements deleted the old middleware entity each time.
    assert_eq!(f.bridge.live_of(ObjectKind::Participant), 1);
    assert_eq!(f.bridge.deleted().len(), 2);
}

// -----------------------------------------------------------------------
// 3. Cascading DELETE: one STATUS per removed object, children first
// -----------------------------------------------------------------------
#[test]
fn test_cascade_delete_reports_children_first() {
    let mut f = fixture();
    let (s, out) = (&mut f.session, f.out);
    let mode = CreationMode::default();
    let requests = vec![
        s.create_participant(out, participant(), 0, reference("p"), mode).unwrap(),
        s.create_topic(out, topic(), participant(), reference("t"), mode).unwrap(),
        s.create_publisher(out, publisher(), participant(), reference("pub"), mode).unwrap(),
        s.create_datawriter(out, writer(), publisher(), reference("w"), mode).unwrap(),
    ];
    s.run_until_all_status(&requests, TIMEOUT).unwrap();
    assert_eq!(f.bridge.live_count(), 4);

    let seen = collect_status(s);
    let request = s.delete_entity(out, participant()).unwrap();
    s.run_until(|_| seen.lock().len() >= 4, TIMEOUT).unwrap();

    let seen = seen.lock().clone();
    assert!(seen.iter().all(|(_, r, st)| *r == request && *st == StatusCode::Ok));
    let order: Vec<ObjectId> = seen.iter().map(|(id, _, _)| *id).collect();
    assert_eq!(order, vec![writer(), publisher(), topic(), participant()]);
    assert_eq!(f.bridge.live_count(), 0);
    assert_eq!(f.agent.agent.object_count(KEY), Some(0));
}

// -----------------------------------------------------------------------
// 4. Reliable output backpressure at history + 1
// -----------------------------------------------------------------------
#[test]
fn test_reliable_output_backpressure() {
    let mut f = fixture();
    build_graph(&mut f);
    let s = &mut f.session;
    let narrow = s
        .create_output_stream(StreamKind::Reliable, 4 * 512, 4)
        .unwrap();

    for i in 0..4u8 {
        s.write(narrow, writer(), &[i]).unwrap();
    }
    assert_eq!(
        s.write(narrow, writer(), &[4]).unwrap_err(),
        XrceError::BufferExhausted
    );

    s.run_until_confirm_delivery(TIMEOUT).unwrap();
    s.write(narrow, writer(), &[4]).unwrap();
    s.run_until_confirm_delivery(TIMEOUT).unwrap();
    assert_eq!(
        f.bridge.written(),
        (0..5u8).map(|i| vec![i]).collect::<Vec<_>>()
    );
}

// -----------------------------------------------------------------------
// 5. Timeouts against an agent that never answers
// -----------------------------------------------------------------------
#[test]
fn test_silent_agent_times_out() {
    let silent = MemoryAgentTransport::new(512);
    let mut s = Session::new(silent.connect(), KEY, fast_session_config()).unwrap();

    let start = Instant::now();
    assert_eq!(
        s.create_session(Duration::from_millis(150)).unwrap_err(),
        XrceError::TimedOut
    );
    assert!(start.elapsed() >= Duration::from_millis(150));
    assert!(!s.is_established());

    let start = Instant::now();
    assert_eq!(
        s.run_until(|_| false, Duration::from_millis(100)).unwrap_err(),
        XrceError::TimedOut
    );
    assert!(start.elapsed() >= Duration::from_millis(100));
}

// -----------------------------------------------------------------------
// 6. Ordered exactly-once delivery under loss, duplication and reordering
// -----------------------------------------------------------------------
#[test]
fn test_reliable_delivery_over_impaired_link() {
    const COUNT: u32 = 100;
    let mut f = fixture();
    build_graph(&mut f);
    let (out, input) = (f.out, f.input);
    let s = &mut f.session;
    let received = collect_data(s);
    let request = s.request_data(out, reader(), input, None).unwrap();

    s.transport_mut().set_enabled(true);
    for i in 0..COUNT {
        write_blocking(s, out, &i.to_le_bytes());
    }
    s.run_until(|_| received.lock().len() >= COUNT as usize, Duration::from_secs(30))
        .unwrap();
    s.run_until_confirm_delivery(Duration::from_secs(30)).unwrap();
    s.run_for(Duration::from_millis(200)).unwrap();

    let expected: Vec<Vec<u8>> = (0..COUNT).map(|i| i.to_le_bytes().to_vec()).collect();
    // Client -> agent: every sample reached the middleware once, in order.
    assert_eq!(f.bridge.written(), expected);
    // Agent -> client: the loopback echo came back once, in order.
    assert_eq!(*received.lock(), expected);
    assert_eq!(s.status_of(request), Some(StatusCode::Ok));
}

// -----------------------------------------------------------------------
// 7. Fragmentation: a payload larger than the MTU, both directions
// -----------------------------------------------------------------------
#[test]
fn test_large_sample_is_fragmented_end_to_end() {
    let mut f = fixture();
    build_graph(&mut f);
    let (out, input) = (f.out, f.input);
    let s = &mut f.session;
    let received = collect_data(s);
    s.request_data(out, reader(), input, None).unwrap();

    let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
    s.write(out, writer(), &payload).unwrap();
    assert!(s.streams().output_reliable(out.raw()).unwrap().in_flight() > 1);

    s.run_until(|_| !received.lock().is_empty(), TIMEOUT).unwrap();
    assert_eq!(f.bridge.written(), vec![payload.clone()]);
    assert_eq!(*received.lock(), vec![payload]);
}

// -----------------------------------------------------------------------
// 8. CREATE_CLIENT with a key held by another address is denied
// -----------------------------------------------------------------------
#[test]
fn test_client_key_collision_is_denied() {
    let bridge = LoopbackBridge::new();
    let (agent, mut links) = AgentThread::start(fast_agent_config(), bridge, 2);
    let mut second = Session::new(links.remove(1), KEY, fast_session_config()).unwrap();
    let mut first = Session::new(links.remove(0), KEY, fast_session_config()).unwrap();

    assert_eq!(first.create_session(TIMEOUT).unwrap(), StatusCode::Ok);
    assert_eq!(second.create_session(TIMEOUT).unwrap(), StatusCode::ErrDenied);
    assert!(first.is_established());
    assert!(!second.is_established());
    assert_eq!(agent.agent.client_count(), 1);
}

// -----------------------------------------------------------------------
// 9. Liveliness: a silent client is evicted with all its entities
// -----------------------------------------------------------------------
#[test]
fn test_silent_client_is_evicted() {
    let mut f = fixture_with(XrceAgentConfig {
        session_timeout_ms: 150,
        ..fast_agent_config()
    });
    build_graph(&mut f);
    assert_eq!(f.bridge.live_count(), 6);

    // The client stops running; nothing reaches the agent any more.
    let agent = Arc::clone(&f.agent.agent);
    assert!(wait_for(TIMEOUT, || agent.client_count() == 0));
    assert_eq!(f.bridge.live_count(), 0);
    assert_eq!(f.bridge.deleted().len(), 6);
}

// -----------------------------------------------------------------------
// 10. READ_DATA with max_samples N delivers exactly N samples
// -----------------------------------------------------------------------
#[test]
fn test_read_data_respects_max_samples() {
    let mut f = fixture();
    build_graph(&mut f);
    for i in 0..5u8 {
        f.bridge.inject(&[0xD0 + i]);
    }
    let (out, input) = (f.out, f.input);
    let s = &mut f.session;
    let received = collect_data(s);
    let request = s.request_data(out, reader(), input, Some(3)).unwrap();

    s.run_until(|_| received.lock().len() >= 3, TIMEOUT).unwrap();
    s.run_for(Duration::from_millis(150)).unwrap();
    assert_eq!(*received.lock(), vec![vec![0xD0], vec![0xD1], vec![0xD2]]);
    assert_eq!(s.status_of(request), Some(StatusCode::Ok));
    assert_eq!(f.bridge.queued(), 2);
}

// -----------------------------------------------------------------------
// 11. READ_DATA on an unknown reader
// -----------------------------------------------------------------------
#[test]
fn test_read_data_unknown_reader() {
    let mut f = fixture();
    let (out, input) = (f.out, f.input);
    let s = &mut f.session;
    let request = s.request_data(out, reader(), input, Some(1)).unwrap();
    assert_eq!(
        s.run_until_all_status(&[request], TIMEOUT).unwrap(),
        vec![StatusCode::ErrUnknownReference]
    );
}

// -----------------------------------------------------------------------
// 12. delete_session tears everything down on both ends
// -----------------------------------------------------------------------
#[test]
fn test_delete_session() {
    let mut f = fixture();
    build_graph(&mut f);
    let s = &mut f.session;
    assert_eq!(s.delete_session(TIMEOUT).unwrap(), StatusCode::Ok);
    assert!(!s.is_established());
    assert_eq!(
        s.run(Duration::from_millis(10)).unwrap_err(),
        XrceError::SessionClosed
    );
    assert!(!f.agent.agent.has_client(KEY));
    assert_eq!(f.bridge.live_count(), 0);
}

// -----------------------------------------------------------------------
// 13. run_until_confirm_delivery returns once everything is acknowledged
// -----------------------------------------------------------------------
#[test]
fn test_confirm_delivery() {
    let mut f = fixture();
    build_graph(&mut f);
    let s = &mut f.session;
    for i in 0..6u8 {
        s.write(f.out, writer(), &[i; 16]).unwrap();
    }
    assert!(!s.streams().all_acked());
    s.run_until_confirm_delivery(TIMEOUT).unwrap();
    assert!(s.streams().all_acked());
    assert_eq!(f.bridge.written().len(), 6);
}

// -----------------------------------------------------------------------
// 14. Best-effort streams: write, and a failed write reported by STATUS
// -----------------------------------------------------------------------
#[test]
fn test_best_effort_write_and_error_status() {
    let mut f = fixture();
    build_graph(&mut f);
    let s = &mut f.session;
    let be_out = s.create_output_stream(StreamKind::BestEffort, 512, 1).unwrap();
    s.create_input_stream(StreamKind::BestEffort, 1).unwrap();

    s.write(be_out, writer(), b"fire-and-forget").unwrap();
    let bogus = s
        .write(be_out, ObjectId::new(9, ObjectKind::DataWriter), b"lost")
        .unwrap();
    let seen = collect_status(s);
    s.run_until(|_| !seen.lock().is_empty(), TIMEOUT).unwrap();

    assert_eq!(f.bridge.written(), vec![b"fire-and-forget".to_vec()]);
    let seen = seen.lock().clone();
    assert_eq!(
        seen,
        vec![(
            ObjectId::new(9, ObjectKind::DataWriter),
            bogus,
            StatusCode::ErrUnknownReference
        )]
    );
}

// -----------------------------------------------------------------------
// 15. Keyed sessions (session id < 0x80) carry the key in every header
// -----------------------------------------------------------------------
#[test]
fn test_keyed_session() {
    let bridge = LoopbackBridge::new();
    let (agent, mut links) = AgentThread::start(fast_agent_config(), bridge.clone(), 1);
    let config = crate::config::SessionConfig {
        session_id: 0x01,
        ..fast_session_config()
    };
    let mut s = Session::new(links.remove(0), KEY, config).unwrap();
    assert_eq!(s.create_session(TIMEOUT).unwrap(), StatusCode::Ok);
    let out = s
        .create_output_stream(StreamKind::Reliable, 8 * 512, 8)
        .unwrap();
    s.create_input_stream(StreamKind::Reliable, 16).unwrap();
    let request = s
        .create_participant(out, participant(), 0, reference("p"), CreationMode::default())
        .unwrap();
    assert_eq!(
        s.run_until_all_status(&[request], TIMEOUT).unwrap(),
        vec![StatusCode::Ok]
    );
    assert_eq!(agent.agent.object_count(KEY), Some(1));
    assert_eq!(bridge.live_count(), 1);
}

// -----------------------------------------------------------------------
// 16. The same exchange over real UDP sockets
// -----------------------------------------------------------------------
#[test]
fn test_udp_round_trip() {
    let bridge = LoopbackBridge::new();
    let agent = Arc::new(XrceAgent::new(fast_agent_config(), bridge.clone()).unwrap());
    let mut transport = UdpTransport::bind_addr("127.0.0.1:0".parse().unwrap()).unwrap();
    let agent_addr = transport.local_addr().unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let server = {
        let agent = Arc::clone(&agent);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || agent.serve(&mut transport, &stop))
    };

    let link = UdpClientTransport::connect(agent_addr).unwrap();
    let mut s = Session::new(link, KEY, fast_session_config()).unwrap();
    assert_eq!(s.create_session(TIMEOUT).unwrap(), StatusCode::Ok);
    let out = s
        .create_output_stream(StreamKind::Reliable, 8 * 512, 8)
        .unwrap();
    s.create_input_stream(StreamKind::Reliable, 16).unwrap();
    let request = s
        .create_participant(out, participant(), 0, reference("p"), CreationMode::default())
        .unwrap();
    assert_eq!(
        s.run_until_all_status(&[request], TIMEOUT).unwrap(),
        vec![StatusCode::Ok]
    );
    assert_eq!(s.delete_session(TIMEOUT).unwrap(), StatusCode::Ok);
    assert_eq!(bridge.live_count(), 0);

    stop.store(true, Ordering::Release);
    server.join().unwrap().unwrap();
}

// -----------------------------------------------------------------------
// 17. A rebooted client reconnects with the same key and session id
// -----------------------------------------------------------------------
#[test]
fn test_rebooted_client_reconnects_with_same_session() {
    let bridge = LoopbackBridge::new();
    let (agent, mut links) = AgentThread::start(fast_agent_config(), bridge.clone(), 1);
    let create = |s: &mut Session<MemoryClientTransport>,
                  out: StreamId,
                  ids: std::ops::RangeInclusive<u16>| {
        let requests: Vec<RequestId> = ids
            .map(|i| {
                let id = ObjectId::new(i, ObjectKind::Participant);
                s.create_participant(out, id, 0, reference("p"), CreationMode::default())
                    .unwrap()
            })
            .collect();
        s.run_until_all_status(&requests, TIMEOUT).unwrap()
    };

    let mut before = Session::new(links.remove(0), KEY, fast_session_config()).unwrap();
    assert_eq!(before.create_session(TIMEOUT).unwrap(), StatusCode::Ok);
    let out = before
        .create_output_stream(StreamKind::Reliable, 8 * 512, 8)
        .unwrap();
    before.create_input_stream(StreamKind::Reliable, 16).unwrap();
    assert_eq!(create(&mut before, out, 1..=3), vec![StatusCode::Ok; 3]);

    // All client state is lost; only the link survives.
    let link = before.into_transport();
    let mut after = Session::new(link, KEY, fast_session_config()).unwrap();
    assert_eq!(after.create_session(TIMEOUT).unwrap(), StatusCode::Ok);
    let out = after
        .create_output_stream(StreamKind::Reliable, 8 * 512, 8)
        .unwrap();
    after.create_input_stream(StreamKind::Reliable, 16).unwrap();
    assert_eq!(create(&mut after, out, 9..=9), vec![StatusCode::Ok]);
    assert_eq!(agent.agent.object_count(KEY), Some(4));
    assert_eq!(create(&mut after, out, 10..=13), vec![StatusCode::Ok; 4]);
    assert_eq!(agent.agent.object_count(KEY), Some(8));
    assert_eq!(bridge.live_of(ObjectKind::Participant), 8);
}

// -----------------------------------------------------------------------
// 18. A stream that exhausts its retries fails, then recovers
// -----------------------------------------------------------------------
#[test]
fn test_failed_stream_is_reported_and_recovers() {
    let session = SessionConfig {
        reliability: ReliabilityConfig {
            max_retries: 3,
            ..fast_reliability()
        },
        ..fast_session_config()
    };
    let mut f = fixture_configs(fast_agent_config(), session);
    build_graph(&mut f);
    let (s, out) = (&mut f.session, f.out);

    s.transport_mut().set_loss(1.0);
    s.transport_mut().set_enabled(true);
    s.write(out, writer(), &[1]).unwrap();
    assert_eq!(
        s.run_until_confirm_delivery(TIMEOUT).unwrap_err(),
        XrceError::StreamFailed(out.raw())
    );
    assert_eq!(s.streams().failed_stream(), Some(out.raw()));

    s.transport_mut().set_enabled(false);
    s.write(out, writer(), &[2]).unwrap();
    s.run_until_confirm_delivery(TIMEOUT).unwrap();
    assert_eq!(s.streams().failed_stream(), None);
    assert_eq!(f.bridge.written(), vec![vec![1], vec![2]]);
}

// -----------------------------------------------------------------------
// 19. A representation too long for its u16 length prefix
// -----------------------------------------------------------------------
#[test]
fn test_oversized_representation_is_rejected_by_the_caller() {
    let mut f = fixture();
    let (s, out) = (&mut f.session, f.out);
    let xml = format!("<topic>{}</topic>", "x".repeat(70_000));
    let err = s
        .create_topic(out, topic(), participant(), Representation::Xml(xml), CreationMode::default())
        .unwrap_err();
    assert!(
        matches!(err, XrceError::ExceedsMaxMessageSize { max: 65535, .. }),
        "{:?}",
        err
    );
    // Nothing was queued.
    assert!(s.streams().all_acked());
    assert_eq!(s.streams().output_reliable(out.raw()).unwrap().in_flight(), 0);
}
