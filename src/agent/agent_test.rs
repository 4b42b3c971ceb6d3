use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use bytes::BytesMut;
use stun::agent::TransactionId;
use stun::attributes::ATTR_USERNAME;
use stun::fingerprint::FINGERPRINT;
use stun::integrity::MessageIntegrity;
use stun::message::*;
use stun::textattrs::Username;
use stun::xoraddr::XorMappedAddress;

use super::*;
use crate::attributes::control::AttrControlling;
use crate::attributes::priority::PriorityAttr;
use crate::candidate::candidate_pair::CandidatePairState;
use crate::candidate::*;
use crate::error::Result;

fn inbound(local: SocketAddr, peer: SocketAddr, raw: &[u8], now: Instant) -> TaggedBytesMut {
    TaggedBytesMut {
        now,
        transport: TransportContext {
            local_addr: local,
            peer_addr: peer,
            protocol: TransportProtocol::UDP,
        },
        message: BytesMut::from(raw),
    }
}

fn host_candidate(address: &str, port: u16, component: u16) -> Candidate {
    CandidateHostConfig {
        base_config: CandidateConfig {
            address: address.to_owned(),
            port,
            component,
            ..Default::default()
        },
    }
    .new_candidate_host()
    .unwrap()
}

struct TestPeers {
    a: Agent,
    b: Agent,
    a_addr: SocketAddr,
    b_addr: SocketAddr,
    a_stream: usize,
    b_stream: usize,
    now: Instant,
    a_events: Vec<Event>,
    b_events: Vec<Event>,
}

/// Builds two agents on distinct loopback ports and exchanges credentials
/// and candidate lines the way a signalling layer would.
fn pipe(
    config_a: AgentConfig,
    config_b: AgentConfig,
    a_port: u16,
    b_port: u16,
) -> Result<TestPeers> {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut a = Agent::new(config_a)?;
    let mut b = Agent::new(config_b)?;

    let a_addr = SocketAddr::from_str(&format!("127.0.0.1:{a_port}"))?;
    let b_addr = SocketAddr::from_str(&format!("127.0.0.1:{b_port}"))?;
    a.add_local_address(a_addr)?;
    b.add_local_address(b_addr)?;

    let a_stream = a.add_stream(1)?;
    let b_stream = b.add_stream(1)?;

    exchange(&mut a, &mut b, a_stream, b_stream)?;

    Ok(TestPeers {
        a,
        b,
        a_addr,
        b_addr,
        a_stream,
        b_stream,
        now: Instant::now(),
        a_events: vec![],
        b_events: vec![],
    })
}

fn exchange(a: &mut Agent, b: &mut Agent, a_stream: usize, b_stream: usize) -> Result<()> {
    let a_credentials = a.get_local_credentials(a_stream)?;
    let b_credentials = b.get_local_credentials(b_stream)?;
    a.set_remote_credentials(a_stream, b_credentials.ufrag, b_credentials.pwd)?;
    b.set_remote_credentials(b_stream, a_credentials.ufrag, a_credentials.pwd)?;

    for c in a.local_candidates(a_stream, 1)? {
        b.add_remote_candidate(b_stream, unmarshal_candidate(&c.marshal())?)?;
    }
    for c in b.local_candidates(b_stream, 1)? {
        a.add_remote_candidate(a_stream, unmarshal_candidate(&c.marshal())?)?;
    }
    Ok(())
}

impl TestPeers {
    /// Advances both agents tick by tick, ferrying datagrams between their
    /// two addresses. Transmits to any other destination are black-holed.
    fn drive(&mut self, ticks: usize) {
        for _ in 0..ticks {
            self.now += Duration::from_millis(20);
            self.a.handle_timeout(self.now);
            self.b.handle_timeout(self.now);

            loop {
                let mut moved = false;
                while let Some(t) = self.a.poll_transmit() {
                    if t.transport.peer_addr == self.b_addr {
                        let msg = inbound(
                            t.transport.peer_addr,
                            t.transport.local_addr,
                            &t.message,
                            self.now,
                        );
                        let _ = self.b.handle_read(msg);
                        moved = true;
                    }
                }
                while let Some(t) = self.b.poll_transmit() {
                    if t.transport.peer_addr == self.a_addr {
                        let msg = inbound(
                            t.transport.peer_addr,
                            t.transport.local_addr,
                            &t.message,
                            self.now,
                        );
                        let _ = self.a.handle_read(msg);
                        moved = true;
                    }
                }
                if !moved {
                    break;
                }
            }

            while let Some(e) = self.a.poll_event() {
                self.a_events.push(e);
            }
            while let Some(e) = self.b.poll_event() {
                self.b_events.push(e);
            }
        }
    }
}

fn assert_states_monotonic(events: &[Event]) {
    let mut last: Option<ComponentState> = None;
    for e in events {
        if let Event::ComponentStateChanged { state, .. } = e {
            if let Some(prev) = last {
                assert!(
                    *state > prev,
                    "component state went backwards: {prev} -> {state}"
                );
            }
            last = Some(*state);
        }
    }
}

#[test]
fn test_gathering_host_candidates() -> Result<()> {
    let mut a = Agent::new(AgentConfig::default())?;
    a.add_local_address(SocketAddr::from_str("127.0.0.1:5600")?)?;
    let stream_id = a.add_stream(1)?;

    let candidates = a.local_candidates(stream_id, 1)?;
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].candidate_type(), CandidateType::Host);
    assert_eq!(candidates[0].addr(), candidates[0].base_addr());
    assert_eq!(candidates[0].component(), 1);

    let mut events = vec![];
    while let Some(e) = a.poll_event() {
        events.push(e);
    }
    assert!(matches!(
        events[0],
        Event::ComponentStateChanged {
            state: ComponentState::Gathering,
            ..
        }
    ));
    assert!(matches!(events[1], Event::NewCandidate { .. }));
    // no STUN server configured, gathering completes immediately
    assert!(events.contains(&Event::CandidateGatheringDone));

    a.close()?;
    Ok(())
}

#[test]
fn test_gathering_server_reflexive() -> Result<()> {
    let server_addr = SocketAddr::from_str("203.0.113.5:3478")?;
    let mut a = Agent::new(AgentConfig {
        stun_server: Some(server_addr),
        ..Default::default()
    })?;
    let host_addr = SocketAddr::from_str("127.0.0.1:5601")?;
    a.add_local_address(host_addr)?;
    let stream_id = a.add_stream(1)?;

    let mut events = vec![];
    while let Some(e) = a.poll_event() {
        events.push(e);
    }
    assert!(
        !events.contains(&Event::CandidateGatheringDone),
        "gathering must wait for the discovery"
    );

    let mut now = Instant::now();
    now += Duration::from_millis(20);
    a.handle_timeout(now);

    let t = a.poll_transmit().expect("no discovery request sent");
    assert_eq!(t.transport.peer_addr, server_addr);
    assert_eq!(t.transport.local_addr, host_addr);

    let mut request = Message::new();
    request.write(&t.message)?;
    assert_eq!(request.typ, BINDING_REQUEST);

    let mapped = SocketAddr::from_str("198.51.100.2:7000")?;
    let mut response = Message::new();
    response.build(&[
        Box::new(BINDING_SUCCESS),
        Box::new(request.transaction_id),
        Box::new(XorMappedAddress {
            ip: mapped.ip(),
            port: mapped.port(),
        }),
        Box::new(FINGERPRINT),
    ])?;

    a.handle_read(inbound(host_addr, server_addr, &response.raw, now))?;

    let candidates = a.local_candidates(stream_id, 1)?;
    assert_eq!(candidates.len(), 2, "expected host + srflx");
    let srflx = &candidates[1];
    assert_eq!(srflx.candidate_type(), CandidateType::ServerReflexive);
    assert_eq!(srflx.addr(), mapped);
    assert_eq!(srflx.base_addr(), host_addr, "srflx base must be the host");

    let mut events = vec![];
    while let Some(e) = a.poll_event() {
        events.push(e);
    }
    assert!(events.iter().any(|e| matches!(e, Event::NewCandidate { .. })));
    assert!(events.contains(&Event::CandidateGatheringDone));

    a.close()?;
    Ok(())
}

#[test]
fn test_connectivity_loopback() -> Result<()> {
    let mut p = pipe(
        AgentConfig {
            is_controlling: true,
            ..Default::default()
        },
        AgentConfig::default(),
        5610,
        5611,
    )?;

    p.drive(60);

    assert_eq!(
        p.a.component_state(p.a_stream, 1)?,
        ComponentState::Ready,
        "controlling side never reached ready"
    );
    assert_eq!(
        p.b.component_state(p.b_stream, 1)?,
        ComponentState::Ready,
        "controlled side never reached ready"
    );

    let selected_count = |events: &[Event]| {
        events
            .iter()
            .filter(|e| matches!(e, Event::NewSelectedPair { .. }))
            .count()
    };
    assert_eq!(selected_count(&p.a_events), 1);
    assert_eq!(selected_count(&p.b_events), 1);

    // pair event precedes the ready event
    for events in [&p.a_events, &p.b_events] {
        let pair_at = events
            .iter()
            .position(|e| matches!(e, Event::NewSelectedPair { .. }))
            .unwrap();
        let ready_at = events
            .iter()
            .position(|e| {
                matches!(
                    e,
                    Event::ComponentStateChanged {
                        state: ComponentState::Ready,
                        ..
                    }
                )
            })
            .unwrap();
        assert!(pair_at < ready_at);
        assert_states_monotonic(events);
    }

    // foundations in the event are well-formed and match the candidates
    if let Some(Event::NewSelectedPair {
        local_foundation,
        remote_foundation,
        ..
    }) = p
        .a_events
        .iter()
        .find(|e| matches!(e, Event::NewSelectedPair { .. }))
    {
        assert!(!local_foundation.is_empty() && local_foundation.len() <= 32);
        assert!(!remote_foundation.is_empty() && remote_foundation.len() <= 32);
        let (local, remote) = p.a.selected_pair(p.a_stream, 1).unwrap();
        assert_eq!(&local.foundation(), local_foundation);
        assert_eq!(&remote.foundation(), remote_foundation);
        assert_eq!(local.addr(), p.a_addr);
        assert_eq!(remote.addr(), p.b_addr);
    } else {
        panic!("no NewSelectedPair event");
    }

    assert!(p
        .a_events
        .contains(&Event::InitialBindingRequestReceived { stream_id: p.a_stream }));
    assert!(p
        .b_events
        .contains(&Event::InitialBindingRequestReceived { stream_id: p.b_stream }));

    Ok(())
}

#[test]
fn test_role_conflict_resolved_by_tie_breaker() -> Result<()> {
    let mut p = pipe(
        AgentConfig {
            is_controlling: true,
            ..Default::default()
        },
        AgentConfig {
            is_controlling: true,
            ..Default::default()
        },
        5620,
        5621,
    )?;
    p.a.tie_breaker = u64::MAX;
    p.b.tie_breaker = 1;

    p.drive(60);

    assert!(p.a.is_controlling, "larger tie-breaker must keep its role");
    assert!(!p.b.is_controlling, "smaller tie-breaker must switch");
    assert!(p.a.stats().role_conflicts > 0 || p.b.stats().role_conflicts > 0);

    assert_eq!(p.a.component_state(p.a_stream, 1)?, ComponentState::Ready);
    assert_eq!(p.b.component_state(p.b_stream, 1)?, ComponentState::Ready);

    let selected_count = |events: &[Event]| {
        events
            .iter()
            .filter(|e| matches!(e, Event::NewSelectedPair { .. }))
            .count()
    };
    assert_eq!(selected_count(&p.a_events), 1);
    assert_eq!(selected_count(&p.b_events), 1);

    Ok(())
}

#[test]
fn test_handle_peer_reflexive_remote() -> Result<()> {
    let mut a = Agent::new(AgentConfig::default())?;
    let local_addr = SocketAddr::from_str("127.0.0.1:5630")?;
    a.add_local_address(local_addr)?;
    let stream_id = a.add_stream(1)?;

    let remote_ufrag = "remoteUfragValue".to_owned();
    let remote_pwd = "remotePasswordTwentyTwo!".to_owned();
    a.set_remote_credentials(stream_id, remote_ufrag.clone(), remote_pwd)?;
    while a.poll_event().is_some() {}

    let credentials = a.get_local_credentials(stream_id)?;
    let peer_addr = SocketAddr::from_str("172.17.0.3:999")?;
    let peer_priority: u32 = (110 << 24) + (65535 << 8) + 255;

    let mut request = Message::new();
    request.build(&[
        Box::new(BINDING_REQUEST),
        Box::new(TransactionId::new()),
        Box::new(Username::new(
            ATTR_USERNAME,
            format!("{}:{}", credentials.ufrag, remote_ufrag),
        )),
        Box::new(AttrControlling(4321)),
        Box::new(PriorityAttr(peer_priority)),
        Box::new(MessageIntegrity::new_short_term_integrity(
            credentials.pwd.clone(),
        )),
        Box::new(FINGERPRINT),
    ])?;

    let now = Instant::now();
    a.handle_read(inbound(local_addr, peer_addr, &request.raw, now))?;

    // a peer-reflexive remote was synthesised
    let remotes = a.remote_candidates(stream_id, 1)?;
    assert_eq!(remotes.len(), 1, "no remote candidate synthesised");
    assert_eq!(remotes[0].candidate_type(), CandidateType::PeerReflexive);
    assert_eq!(remotes[0].addr(), peer_addr);
    assert_eq!(remotes[0].priority(), peer_priority);

    let mut events = vec![];
    while let Some(e) = a.poll_event() {
        events.push(e);
    }
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::NewRemoteCandidate { .. })));
    assert!(events.contains(&Event::InitialBindingRequestReceived { stream_id }));

    // the success response echoes the source as XOR-MAPPED-ADDRESS
    let t = a.poll_transmit().expect("no binding success sent");
    assert_eq!(t.transport.peer_addr, peer_addr);
    let mut response = Message::new();
    response.write(&t.message)?;
    assert_eq!(response.typ, BINDING_SUCCESS);
    let mut xor_addr = XorMappedAddress::default();
    xor_addr.get_from(&response)?;
    assert_eq!(SocketAddr::new(xor_addr.ip, xor_addr.port), peer_addr);

    // the derived pair runs as a triggered check on the next tick
    a.handle_timeout(now + Duration::from_millis(20));
    let t = a.poll_transmit().expect("no triggered check sent");
    assert_eq!(t.transport.peer_addr, peer_addr);
    let mut check = Message::new();
    check.write(&t.message)?;
    assert_eq!(check.typ, BINDING_REQUEST);

    a.close()?;
    Ok(())
}

#[test]
fn test_handle_peer_reflexive_local() -> Result<()> {
    let mut a = Agent::new(AgentConfig {
        is_controlling: true,
        ..Default::default()
    })?;
    let local_addr = SocketAddr::from_str("127.0.0.1:5640")?;
    a.add_local_address(local_addr)?;
    let stream_id = a.add_stream(1)?;

    let remote_ufrag = "peerUfrag".to_owned();
    let remote_pwd = "peerPasswordIsTwentyTwo!".to_owned();
    a.set_remote_credentials(stream_id, remote_ufrag, remote_pwd.clone())?;

    let remote_addr = SocketAddr::from_str("127.0.0.1:5641")?;
    a.add_remote_candidate(stream_id, host_candidate("127.0.0.1", 5641, 1))?;

    let mut now = Instant::now();
    now += Duration::from_millis(20);
    a.handle_timeout(now);

    let t = a.poll_transmit().expect("no check sent");
    assert_eq!(t.transport.peer_addr, remote_addr);
    let mut request = Message::new();
    request.write(&t.message)?;

    // the peer saw us from an address we do not know
    let mapped = SocketAddr::from_str("5.6.7.8:5640")?;
    let mut response = Message::new();
    response.build(&[
        Box::new(BINDING_SUCCESS),
        Box::new(request.transaction_id),
        Box::new(XorMappedAddress {
            ip: mapped.ip(),
            port: mapped.port(),
        }),
        Box::new(MessageIntegrity::new_short_term_integrity(remote_pwd)),
        Box::new(FINGERPRINT),
    ])?;
    a.handle_read(inbound(local_addr, remote_addr, &response.raw, now))?;

    let locals = a.local_candidates(stream_id, 1)?;
    assert_eq!(locals.len(), 2, "prflx local not synthesised");
    let prflx = &locals[1];
    assert_eq!(prflx.candidate_type(), CandidateType::PeerReflexive);
    assert_eq!(prflx.addr(), mapped);
    assert_eq!(prflx.base_addr(), local_addr);

    let mut events = vec![];
    while let Some(e) = a.poll_event() {
        events.push(e);
    }
    assert!(
        events.iter().any(|e| matches!(e, Event::NewCandidate { .. })),
        "prflx local must be announced"
    );

    // the pair is valid and re-keyed to the discovered local
    let pair = &a.streams[0].check_list[0];
    assert_eq!(pair.state(), CandidatePairState::Succeeded);
    assert_eq!(pair.local_index, 1);
    assert_eq!(a.component_state(stream_id, 1)?, ComponentState::Connected);

    a.close()?;
    Ok(())
}

#[test]
fn test_retransmit_then_fail() -> Result<()> {
    let mut a = Agent::new(AgentConfig {
        is_controlling: true,
        rto_initial: Some(Duration::from_millis(10)),
        ..Default::default()
    })?;
    a.add_local_address(SocketAddr::from_str("127.0.0.1:5650")?)?;
    let stream_id = a.add_stream(1)?;
    a.set_remote_credentials(
        stream_id,
        "blackholeUfrag".to_owned(),
        "blackholePasswordTwenty22".to_owned(),
    )?;

    // TEST-NET address, nothing will ever answer
    let blackhole = SocketAddr::from_str("192.0.2.7:7777")?;
    a.add_remote_candidate(stream_id, host_candidate("192.0.2.7", 7777, 1))?;

    let mut now = Instant::now();
    let mut requests_sent = 0;
    for _ in 0..80 {
        now += Duration::from_millis(20);
        a.handle_timeout(now);
        while let Some(t) = a.poll_transmit() {
            if t.transport.peer_addr == blackhole {
                requests_sent += 1;
            }
        }
    }

    assert_eq!(
        requests_sent, 7,
        "expected exactly Rc=7 requests before giving up"
    );
    assert_eq!(
        a.component_state(stream_id, 1)?,
        ComponentState::Failed,
        "only pair failed, component must fail"
    );

    let mut events = vec![];
    while let Some(e) = a.poll_event() {
        events.push(e);
    }
    assert!(events.contains(&Event::ComponentStateChanged {
        stream_id,
        component_id: 1,
        state: ComponentState::Failed
    }));
    assert_states_monotonic(&events);

    a.close()?;
    Ok(())
}

#[test]
fn test_keepalive_on_selected_pair() -> Result<()> {
    let keepalive = Duration::from_millis(200);
    let mut p = pipe(
        AgentConfig {
            is_controlling: true,
            keepalive_interval: Some(keepalive),
            ..Default::default()
        },
        AgentConfig {
            keepalive_interval: Some(keepalive),
            ..Default::default()
        },
        5660,
        5661,
    )?;

    p.drive(60);
    assert_eq!(p.a.component_state(p.a_stream, 1)?, ComponentState::Ready);

    // watch the wire for indications while ferrying them across
    let mut indications = 0;
    for _ in 0..30 {
        p.now += Duration::from_millis(20);
        p.a.handle_timeout(p.now);
        p.b.handle_timeout(p.now);
        while let Some(t) = p.a.poll_transmit() {
            let mut m = Message::new();
            if m.write(&t.message).is_ok()
                && m.typ.method == METHOD_BINDING
                && m.typ.class == CLASS_INDICATION
            {
                indications += 1;
            }
            if t.transport.peer_addr == p.b_addr {
                let msg = inbound(
                    t.transport.peer_addr,
                    t.transport.local_addr,
                    &t.message,
                    p.now,
                );
                let _ = p.b.handle_read(msg);
            }
        }
        while p.b.poll_transmit().is_some() {}
    }

    // 600 ms window, 200 ms cadence
    assert!(
        (2..=4).contains(&indications),
        "expected ~3 keepalives, saw {indications}"
    );

    // keepalives change nothing
    assert_eq!(p.a.component_state(p.a_stream, 1)?, ComponentState::Ready);
    assert_eq!(p.b.component_state(p.b_stream, 1)?, ComponentState::Ready);
    while let Some(e) = p.a.poll_event() {
        p.a_events.push(e);
    }
    while let Some(e) = p.b.poll_event() {
        p.b_events.push(e);
    }
    assert_states_monotonic(&p.a_events);
    assert_states_monotonic(&p.b_events);

    Ok(())
}

#[test]
fn test_remove_stream_mid_check() -> Result<()> {
    let mut p = pipe(
        AgentConfig {
            is_controlling: true,
            ..Default::default()
        },
        AgentConfig::default(),
        5670,
        5671,
    )?;

    // A starts a check
    p.now += Duration::from_millis(20);
    p.a.handle_timeout(p.now);
    let request = p.a.poll_transmit().expect("no check sent");
    assert_eq!(request.transport.peer_addr, p.b_addr);

    // B answers it
    p.b.handle_read(inbound(
        request.transport.peer_addr,
        request.transport.local_addr,
        &request.message,
        p.now,
    ))?;
    let response = p
        .b
        .poll_transmit()
        .expect("no binding success from the peer");

    // the stream disappears while the transaction is in flight
    p.a.remove_stream(p.a_stream)?;

    // the late response lands without effect
    p.a.handle_read(inbound(
        response.transport.peer_addr,
        response.transport.local_addr,
        &response.message,
        p.now,
    ))?;

    assert!(p.a.stats().unroutable_dropped >= 1);
    while let Some(e) = p.a.poll_event() {
        assert_ne!(
            e.stream_id(),
            Some(p.a_stream),
            "no events for a removed stream may fire"
        );
    }
    assert!(p.a.get_local_credentials(p.a_stream).is_err());

    Ok(())
}

#[test]
fn test_set_remote_candidates_idempotent() -> Result<()> {
    let mut a = Agent::new(AgentConfig::default())?;
    a.add_local_address(SocketAddr::from_str("127.0.0.1:5680")?)?;
    let stream_id = a.add_stream(1)?;
    a.set_remote_credentials(
        stream_id,
        "someRemoteUfrag".to_owned(),
        "someRemotePasswordTwenty22".to_owned(),
    )?;

    let list = vec![
        host_candidate("10.0.0.1", 4000, 1),
        host_candidate("10.0.0.2", 4000, 1),
    ];

    let n = a.set_remote_candidates(stream_id, 1, list.clone())?;
    assert_eq!(n, 2);

    let snapshot: Vec<(u64, usize, usize, CandidatePairState)> = a.streams[0]
        .check_list
        .iter()
        .map(|p| (p.id, p.local_index, p.remote_index, p.state()))
        .collect();
    assert_eq!(snapshot.len(), 2);

    let n = a.set_remote_candidates(stream_id, 1, list)?;
    assert_eq!(n, 2);

    let after: Vec<(u64, usize, usize, CandidatePairState)> = a.streams[0]
        .check_list
        .iter()
        .map(|p| (p.id, p.local_index, p.remote_index, p.state()))
        .collect();
    assert_eq!(snapshot, after, "idempotent call must not rebuild the list");

    a.close()?;
    Ok(())
}

#[test]
fn test_receive_path_classifier() -> Result<()> {
    let mut a = Agent::new(AgentConfig::default())?;
    let local_addr = SocketAddr::from_str("127.0.0.1:5690")?;
    a.add_local_address(local_addr)?;
    let stream_id = a.add_stream(1)?;
    let peer_addr = SocketAddr::from_str("127.0.0.1:5691")?;
    let now = Instant::now();

    // RTP-looking bytes go straight to the application
    let rtp = [0x80u8, 0x60, 0x00, 0x01, 0xde, 0xad, 0xbe, 0xef];
    a.handle_read(inbound(local_addr, peer_addr, &rtp, now))?;
    assert_eq!(
        a.recv(stream_id, 1)?.as_deref(),
        Some(&rtp[..]),
        "media must be delivered"
    );

    // not RTP, not STUN: still the application's problem
    let junk = [0x01u8, 0x02, 0x03];
    a.handle_read(inbound(local_addr, peer_addr, &junk, now))?;
    assert_eq!(a.recv(stream_id, 1)?.as_deref(), Some(&junk[..]));

    // STUN magic cookie with a lying length is dropped and counted
    let mut fake = vec![0x00u8, 0x01, 0x00, 0x08];
    fake.extend_from_slice(&0x2112_A442u32.to_be_bytes());
    fake.extend_from_slice(&[0u8; 12]);
    a.handle_read(inbound(local_addr, peer_addr, &fake, now))?;
    assert_eq!(a.recv(stream_id, 1)?, None);
    assert_eq!(a.stats().malformed_stun_dropped, 1);

    // datagrams for unknown sockets are counted, not delivered
    let elsewhere = SocketAddr::from_str("127.0.0.1:50000")?;
    a.handle_read(inbound(elsewhere, peer_addr, &rtp, now))?;
    assert_eq!(a.stats().unroutable_dropped, 1);

    a.close()?;
    Ok(())
}

#[test]
fn test_send_and_recv_media() -> Result<()> {
    let mut p = pipe(
        AgentConfig {
            is_controlling: true,
            ..Default::default()
        },
        AgentConfig::default(),
        5700,
        5701,
    )?;
    p.drive(60);
    assert_eq!(p.a.component_state(p.a_stream, 1)?, ComponentState::Ready);

    // STUN payloads are rejected as application data
    let mut stun_like = Message::new();
    stun_like.build(&[Box::new(BINDING_REQUEST), Box::new(TransactionId::new())])?;
    assert_eq!(
        p.a.send(p.a_stream, 1, &stun_like.raw),
        Err(Error::ErrWriteStunMessage)
    );

    let payload = [0x80u8, 0x11, 0x22, 0x33];
    let n = p.a.send(p.a_stream, 1, &payload)?;
    assert_eq!(n, payload.len());

    let t = p.a.poll_transmit().expect("media never hit the wire");
    assert_eq!(t.transport.peer_addr, p.b_addr);
    p.b.handle_read(inbound(
        t.transport.peer_addr,
        t.transport.local_addr,
        &t.message,
        p.now,
    ))?;
    assert_eq!(p.b.recv(p.b_stream, 1)?.as_deref(), Some(&payload[..]));

    Ok(())
}

#[test]
fn test_check_list_pair_priorities_follow_rfc() -> Result<()> {
    let mut p = pipe(
        AgentConfig {
            is_controlling: true,
            ..Default::default()
        },
        AgentConfig::default(),
        5710,
        5711,
    )?;

    for (agent, controlling) in [(&p.a, true), (&p.b, false)] {
        for stream in &agent.streams {
            for pair in &stream.check_list {
                let component = stream.component(pair.component_id).unwrap();
                let local = component.local_candidates[pair.local_index].priority();
                let remote = component.remote_candidates[pair.remote_index].priority();
                let (g, d) = if controlling {
                    (local, remote)
                } else {
                    (remote, local)
                };
                let expected = ((1u64 << 32) - 1) * u64::from(g.min(d))
                    + 2 * u64::from(g.max(d))
                    + u64::from(g > d);
                assert_eq!(pair.priority(), expected);
            }
        }
    }

    // both sides agree on the pair priority
    assert_eq!(
        p.a.streams[0].check_list[0].priority(),
        p.b.streams[0].check_list[0].priority()
    );

    Ok(())
}

#[test]
fn test_foundation_grouping_freezes_siblings() -> Result<()> {
    let mut a = Agent::new(AgentConfig {
        is_controlling: true,
        ..Default::default()
    })?;
    let mut b = Agent::new(AgentConfig::default())?;

    let a_addr = SocketAddr::from_str("127.0.0.1:5720")?;
    a.add_local_address(a_addr)?;
    // two sockets on the same interface: same foundation, two candidates
    let b_addr1 = SocketAddr::from_str("127.0.0.1:5721")?;
    let b_addr2 = SocketAddr::from_str("127.0.0.1:5722")?;
    b.add_local_address(b_addr1)?;
    b.add_local_address(b_addr2)?;

    let a_stream = a.add_stream(1)?;
    let b_stream = b.add_stream(1)?;
    exchange(&mut a, &mut b, a_stream, b_stream)?;

    // one Waiting per foundation, the sibling stays Frozen
    let states: Vec<CandidatePairState> =
        a.streams[0].check_list.iter().map(|p| p.state()).collect();
    assert_eq!(states.len(), 2);
    assert_eq!(
        states
            .iter()
            .filter(|s| **s == CandidatePairState::Waiting)
            .count(),
        1
    );
    assert_eq!(
        states
            .iter()
            .filter(|s| **s == CandidatePairState::Frozen)
            .count(),
        1
    );

    // drive manually, asserting the single-in-progress property per
    // foundation at every step
    let mut now = Instant::now();
    for _ in 0..60 {
        now += Duration::from_millis(20);
        a.handle_timeout(now);
        b.handle_timeout(now);

        for agent in [&a, &b] {
            for stream in &agent.streams {
                let mut in_progress: Vec<String> = vec![];
                for pair in &stream.check_list {
                    if pair.state() == CandidatePairState::InProgress {
                        let foundation = stream.pair_foundation(pair);
                        assert!(
                            !in_progress.contains(&foundation),
                            "two checks in progress for one foundation"
                        );
                        in_progress.push(foundation);
                    }
                }
            }
        }

        loop {
            let mut moved = false;
            while let Some(t) = a.poll_transmit() {
                if t.transport.peer_addr == b_addr1 || t.transport.peer_addr == b_addr2 {
                    let _ = b.handle_read(inbound(
                        t.transport.peer_addr,
                        t.transport.local_addr,
                        &t.message,
                        now,
                    ));
                    moved = true;
                }
            }
            while let Some(t) = b.poll_transmit() {
                if t.transport.peer_addr == a_addr {
                    let _ = a.handle_read(inbound(
                        t.transport.peer_addr,
                        t.transport.local_addr,
                        &t.message,
                        now,
                    ));
                    moved = true;
                }
            }
            if !moved {
                break;
            }
        }
    }

    assert_eq!(a.component_state(a_stream, 1)?, ComponentState::Ready);
    assert_eq!(b.component_state(b_stream, 1)?, ComponentState::Ready);

    Ok(())
}

#[test]
fn test_config_validation() -> Result<()> {
    assert_eq!(
        Agent::new(AgentConfig {
            lite: true,
            is_controlling: true,
            ..Default::default()
        })
        .err(),
        Some(Error::ErrLiteControlling)
    );
    assert_eq!(
        Agent::new(AgentConfig {
            lite: true,
            stun_server: Some(SocketAddr::from_str("203.0.113.5:3478")?),
            ..Default::default()
        })
        .err(),
        Some(Error::ErrLiteUsingNonHostCandidates)
    );

    let mut a = Agent::new(AgentConfig::default())?;
    assert_eq!(
        a.add_local_address(SocketAddr::from_str("127.0.0.1:0")?),
        Err(Error::ErrPortZero)
    );
    assert_eq!(a.add_stream(1).err(), Some(Error::ErrNoLocalAddress));

    a.add_local_address(SocketAddr::from_str("127.0.0.1:5730")?)?;
    assert_eq!(a.add_stream(0).err(), Some(Error::ErrNoComponents));
    let stream_id = a.add_stream(1)?;

    assert_eq!(
        a.set_remote_credentials(stream_id, "abc".to_owned(), "x".repeat(22)),
        Err(Error::ErrRemoteUfragInvalid)
    );
    assert_eq!(
        a.set_remote_credentials(stream_id, "abcd".to_owned(), "short".to_owned()),
        Err(Error::ErrRemotePwdInvalid)
    );
    a.set_remote_credentials(stream_id, "abcd".to_owned(), "x".repeat(22))?;

    assert_eq!(
        a.get_local_credentials(999).err(),
        Some(Error::ErrUnknownStream)
    );
    assert_eq!(a.recv(stream_id, 9).err(), Some(Error::ErrUnknownComponent));
    assert_eq!(
        a.send(stream_id, 1, &[0x80, 0x00]).err(),
        Some(Error::ErrNoCandidatePairs)
    );

    a.close()?;
    assert_eq!(a.add_stream(1).err(), Some(Error::ErrClosed));
    Ok(())
}

#[test]
fn test_lite_agent_answers_but_never_checks() -> Result<()> {
    let mut full = Agent::new(AgentConfig {
        is_controlling: true,
        aggressive_nomination: true,
        ..Default::default()
    })?;
    let mut lite = Agent::new(AgentConfig {
        lite: true,
        ..Default::default()
    })?;

    let full_addr = SocketAddr::from_str("127.0.0.1:5740")?;
    let lite_addr = SocketAddr::from_str("127.0.0.1:5741")?;
    full.add_local_address(full_addr)?;
    lite.add_local_address(lite_addr)?;
    let full_stream = full.add_stream(1)?;
    let lite_stream = lite.add_stream(1)?;
    exchange(&mut full, &mut lite, full_stream, lite_stream)?;

    let mut now = Instant::now();
    for _ in 0..60 {
        now += Duration::from_millis(20);
        full.handle_timeout(now);
        lite.handle_timeout(now);

        loop {
            let mut moved = false;
            while let Some(t) = full.poll_transmit() {
                if t.transport.peer_addr == lite_addr {
                    let _ = lite.handle_read(inbound(
                        t.transport.peer_addr,
                        t.transport.local_addr,
                        &t.message,
                        now,
                    ));
                    moved = true;
                }
            }
            while let Some(t) = lite.poll_transmit() {
                // a lite agent only ever answers
                let mut m = Message::new();
                m.write(&t.message)?;
                assert_ne!(
                    m.typ, BINDING_REQUEST,
                    "lite agents must not originate checks"
                );
                if t.transport.peer_addr == full_addr {
                    let _ = full.handle_read(inbound(
                        t.transport.peer_addr,
                        t.transport.local_addr,
                        &t.message,
                        now,
                    ));
                    moved = true;
                }
            }
            if !moved {
                break;
            }
        }
    }

    assert_eq!(
        full.component_state(full_stream, 1)?,
        ComponentState::Ready,
        "full agent must nominate against a lite peer"
    );
    assert_eq!(
        lite.component_state(lite_stream, 1)?,
        ComponentState::Ready,
        "lite agent must install the nominated pair"
    );

    Ok(())
}
