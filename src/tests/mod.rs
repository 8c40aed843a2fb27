//! End-to-end scenarios driven through the in-memory datapath.


use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;

use crate::binding::Binding;
use crate::connection::Connection;
use crate::datapath::{RecvDatagram, SendContext, TestDatapathHooks};
use crate::listener::{Listener, NewConnectionInfo, Session};
use crate::packet::{ParsedDatagram, RecvPacket};
use crate::shared::ConnectionId;
use crate::token::RETRY_TOKEN_LENGTH;
use crate::{
    is_version_reserved, MAX_BINDING_STATELESS_OPERATIONS, MIN_STATELESS_RESET_PACKET_LENGTH,
    STATELESS_OPERATION_EXPIRATION_MS, STATELESS_RESET_TOKEN_LENGTH, SUPPORTED_VERSIONS,
    VERSION_1,
};

use self::util::{
    handshake_datagram, initial_datagram, parse_retry, short_datagram, test_env, TestEnv,
};

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

fn remote(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn server_binding(env: &TestEnv) -> Arc<Binding> {
    Binding::initialize(
        env.library.clone(),
        true,
        true,
        Some(remote("127.0.0.1:4433")),
        None,
    )
    .unwrap()
}

fn client_binding(env: &TestEnv) -> Arc<Binding> {
    Binding::initialize(
        env.library.clone(),
        true,
        false,
        Some(remote("127.0.0.1:5533")),
        None,
    )
    .unwrap()
}

fn listener(alpn: &str) -> Arc<Listener> {
    Listener::new(Session::new([alpn]), None)
}

//
// Version negotiation.
//

#[test]
fn version_negotiation_payload() {
    let env = test_env();
    let binding = server_binding(&env);
    let udp = env.datapath.last_binding();
    assert!(binding.register_listener(&listener("h3")));

    let client = remote("10.1.1.1:50000");
    udp.deliver_one(
        handshake_datagram(0xabcd_1234, &[0xa1, 0xa2], &[0xb1, 0xb2, 0xb3], 24),
        client,
    );

    let sent = udp.wait_for_sends(1, SEND_TIMEOUT);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].remote, client);
    assert_eq!(sent[0].local, Some(binding.local_address()));

    let vn = &sent[0].datagrams[0];
    assert_eq!(vn[0] & 0x80, 0x80);
    assert_eq!(&vn[1..5], &[0, 0, 0, 0]);
    // CIDs echoed swapped: our destination is their source.
    assert_eq!(&vn[5..9], &[0x03, 0xb1, 0xb2, 0xb3]);
    assert_eq!(&vn[9..12], &[0x02, 0xa1, 0xa2]);
    let reserved = u32::from_le_bytes(vn[12..16].try_into().unwrap());
    assert_eq!(reserved, binding.random_reserved_version());
    assert!(is_version_reserved(reserved));
    let mut offset = 16;
    for &version in SUPPORTED_VERSIONS {
        assert_eq!(&vn[offset..offset + 4], version.to_le_bytes());
        offset += 4;
    }
    assert_eq!(offset, vn.len());

    assert!(binding.stateless_tracker_consistent());
    assert_eq!(binding.stateless_operation_count(), 1);
}

#[test]
fn unknown_version_without_listener_drops() {
    let env = test_env();
    let _binding = server_binding(&env);
    let udp = env.datapath.last_binding();

    udp.deliver_one(
        handshake_datagram(0xabcd_1234, &[0xa1, 0xa2], &[0xb1], 24),
        remote("10.1.1.1:50000"),
    );

    env.library.wait_workers_idle();
    assert!(udp.sent().is_empty());
    assert_eq!(udp.returned_datagrams(), 1);
}

#[test]
fn binding_ref_returns_after_stateless_operation() {
    let env = test_env();
    let binding = server_binding(&env);
    let udp = env.datapath.last_binding();
    assert!(binding.register_listener(&listener("h3")));
    assert_eq!(binding.ref_count(), 1);

    udp.deliver_one(
        handshake_datagram(0xdead_0001, &[0xa1, 0xa2], &[0xb1], 24),
        remote("10.1.1.2:50000"),
    );

    udp.wait_for_sends(1, SEND_TIMEOUT);
    env.library.wait_workers_idle();
    assert_eq!(binding.ref_count(), 1);
    assert!(binding.stateless_tracker_consistent());
}

//
// Stateless reset.
//

#[test]
fn reset_token_stable_and_binding_independent() {
    let env = test_env();
    let binding_a = server_binding(&env);
    let binding_b = server_binding(&env);
    let cid = ConnectionId::new(&[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);

    let token_1 = binding_a.generate_stateless_reset_token(&cid);
    let token_2 = binding_a.generate_stateless_reset_token(&cid);
    assert_eq!(token_1, token_2);

    let other = binding_b.generate_stateless_reset_token(&cid);
    assert_ne!(token_1, other);
}

#[test]
fn stateless_reset_shape_and_token() {
    let env = test_env();
    let binding = server_binding(&env);
    let udp = env.datapath.last_binding();

    let cid = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];
    let recv_len = 100;
    udp.deliver_one(short_datagram(&cid, recv_len, true), remote("10.2.2.2:41000"));

    let sent = udp.wait_for_sends(1, SEND_TIMEOUT);
    let sr = &sent[0].datagrams[0];
    assert!(sr.len() >= MIN_STATELESS_RESET_PACKET_LENGTH);
    assert!(sr.len() < recv_len);
    assert_eq!(sr[0] & 0x80, 0, "short header form");
    assert_eq!(sr[0] & 0x40, 0x40, "fixed bit");
    assert_eq!(sr[0] & 0x04, 0x04, "key phase copied");

    let expected = binding.generate_stateless_reset_token(&ConnectionId::new(&cid));
    assert_eq!(
        &sr[sr.len() - STATELESS_RESET_TOKEN_LENGTH..],
        &expected.as_bytes()[..]
    );
}

#[test]
fn stateless_reset_clamps_below_inciting_packet() {
    let env = test_env();
    let _binding = server_binding(&env);
    let udp = env.datapath.last_binding();

    // Randomized length always lands at or above 41, so a 41-byte packet
    // forces the clamp to exactly one byte less.
    udp.deliver_one(short_datagram(&[9; 8], 41, false), remote("10.2.2.3:41000"));
    let sent = udp.wait_for_sends(1, SEND_TIMEOUT);
    assert_eq!(sent[0].datagrams[0].len(), 40);
}

#[test]
fn stateless_reset_requires_min_inciting_length() {
    let env = test_env();
    let _binding = server_binding(&env);
    let udp = env.datapath.last_binding();

    udp.deliver_one(
        short_datagram(&[9; 8], MIN_STATELESS_RESET_PACKET_LENGTH, false),
        remote("10.2.2.4:41000"),
    );
    env.library.wait_workers_idle();
    assert!(udp.sent().is_empty());
    assert_eq!(udp.returned_datagrams(), 1);
}

//
// Stateless operation tracker: saturation, dedup, aging.
//

#[test]
fn stateless_operations_saturate_and_age_out() {
    let env = test_env();
    let binding = server_binding(&env);
    let udp = env.datapath.last_binding();

    for i in 0..MAX_BINDING_STATELESS_OPERATIONS {
        let port = 40_000 + i as u16;
        udp.deliver_one(
            short_datagram(&[7; 8], 100, false),
            remote(&format!("10.3.0.1:{port}")),
        );
    }
    assert_eq!(
        binding.stateless_operation_count(),
        MAX_BINDING_STATELESS_OPERATIONS
    );
    assert!(binding.stateless_tracker_consistent());

    // At the cap, a fresh remote is refused.
    udp.deliver_one(short_datagram(&[7; 8], 100, false), remote("10.3.0.2:9"));
    assert_eq!(
        binding.stateless_operation_count(),
        MAX_BINDING_STATELESS_OPERATIONS
    );

    // Expiry empties the whole set and admits it again.
    env.clock.advance_ms(STATELESS_OPERATION_EXPIRATION_MS);
    udp.deliver_one(short_datagram(&[7; 8], 100, false), remote("10.3.0.2:9"));
    assert_eq!(binding.stateless_operation_count(), 1);
    assert!(binding.stateless_tracker_consistent());
}

#[test]
fn stateless_operation_dedup_until_expiration() {
    let env = test_env();
    let binding = server_binding(&env);
    let udp = env.datapath.last_binding();
    let peer = remote("10.3.1.1:40000");

    udp.deliver_one(short_datagram(&[7; 8], 100, false), peer);
    assert_eq!(binding.stateless_operation_count(), 1);
    udp.wait_for_sends(1, SEND_TIMEOUT);

    // One millisecond short of expiration the remote is still suppressed.
    env.clock.advance_ms(STATELESS_OPERATION_EXPIRATION_MS - 1);
    udp.deliver_one(short_datagram(&[7; 8], 100, false), peer);
    assert_eq!(binding.stateless_operation_count(), 1);
    env.library.wait_workers_idle();
    assert_eq!(udp.sent().len(), 1);

    // At expiration the old context ages out and a new response goes out.
    env.clock.advance_ms(1);
    udp.deliver_one(short_datagram(&[7; 8], 100, false), peer);
    assert_eq!(binding.stateless_operation_count(), 1);
    let sent = udp.wait_for_sends(2, SEND_TIMEOUT);
    assert_eq!(sent.len(), 2);
    assert!(binding.stateless_tracker_consistent());
}

//
// Retry.
//

#[test]
fn retry_roundtrip_and_tamper_rejection() {
    let env = test_env();
    let binding = server_binding(&env);
    let udp = env.datapath.last_binding();
    assert!(binding.register_listener(&listener("h3")));

    let threshold = env.library.retry_memory_threshold();
    env.library.set_handshake_memory(threshold);

    let client = remote("10.4.0.1:55000");
    let dcid = [0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7, 0xa8];
    let scid = [0xb1, 0xb2, 0xb3, 0xb4, 0xb5];

    // No token while over the memory limit: ask the client to prove
    // return routability.
    udp.deliver_one(initial_datagram(VERSION_1, &dcid, &scid, &[], 1200), client);
    let sent = udp.wait_for_sends(1, SEND_TIMEOUT);
    let retry = parse_retry(&sent[0].datagrams[0]);
    assert_eq!(retry.version, VERSION_1);
    assert_eq!(retry.dst_cid, scid);
    assert_eq!(retry.orig_dst_cid, dcid);
    assert_eq!(
        retry.src_cid.len(),
        env.library.config().cid_total_length as usize
    );
    assert_eq!(retry.token.len(), RETRY_TOKEN_LENGTH);

    // Replay echoing the server-chosen CID and carrying the token: the
    // connection is admitted despite the memory pressure.
    udp.deliver_one(
        initial_datagram(VERSION_1, &retry.src_cid, &scid, &retry.token, 1200),
        client,
    );
    let conn = binding
        .lookup()
        .find_by_remote_hash(client, &ConnectionId::new(&scid))
        .expect("connection created after valid token");
    env.library.wait_workers_idle();
    assert_eq!(conn.connection().processed_datagrams(), 1);
    assert_eq!(conn.connection().validated_datagrams(), 1);
    drop(conn);

    // Same replay with one flipped token byte: AEAD failure, silent drop,
    // no connection.
    let mut tampered = retry.token.clone();
    *tampered.last_mut().unwrap() ^= 0x01;
    let other_scid = [0xc1, 0xc2, 0xc3, 0xc4, 0xc5];
    let returned_before = udp.returned_datagrams();
    udp.deliver_one(
        initial_datagram(VERSION_1, &retry.src_cid, &other_scid, &tampered, 1200),
        client,
    );
    env.library.wait_workers_idle();
    assert!(binding
        .lookup()
        .find_by_remote_hash(client, &ConnectionId::new(&other_scid))
        .is_none());
    assert_eq!(udp.returned_datagrams(), returned_before + 1);
}

#[test]
fn retry_threshold_boundary() {
    let env = test_env();
    let binding = server_binding(&env);
    let udp = env.datapath.last_binding();
    assert!(binding.register_listener(&listener("h3")));
    let threshold = env.library.retry_memory_threshold();

    // One byte under the limit: connection created immediately.
    env.library.set_handshake_memory(threshold - 1);
    let client_a = remote("10.4.1.1:55000");
    let scid_a = [0xd1, 0xd2, 0xd3, 0xd4];
    udp.deliver_one(
        initial_datagram(VERSION_1, &[0xa1; 8], &scid_a, &[], 1200),
        client_a,
    );
    assert!(binding
        .lookup()
        .find_by_remote_hash(client_a, &ConnectionId::new(&scid_a))
        .is_some());
    assert!(udp.sent().is_empty());

    // Exactly at the limit: retry instead.
    env.library.set_handshake_memory(threshold);
    let client_b = remote("10.4.1.2:55000");
    udp.deliver_one(
        initial_datagram(VERSION_1, &[0xa2; 8], &[0xd5, 0xd6], &[], 1200),
        client_b,
    );
    let sent = udp.wait_for_sends(1, SEND_TIMEOUT);
    assert_eq!(sent[0].remote, client_b);
    let retry = parse_retry(&sent[0].datagrams[0]);
    assert_eq!(retry.orig_dst_cid, [0xa2; 8]);
}

#[test]
fn undersized_initial_dropped() {
    let env = test_env();
    let binding = server_binding(&env);
    let udp = env.datapath.last_binding();
    assert!(binding.register_listener(&listener("h3")));

    let client = remote("10.4.2.1:55000");
    udp.deliver_one(
        initial_datagram(VERSION_1, &[0xa1; 8], &[0xb1; 5], &[], 600),
        client,
    );
    env.library.wait_workers_idle();
    assert_eq!(udp.returned_datagrams(), 1);
    assert!(binding
        .lookup()
        .find_by_remote_hash(client, &ConnectionId::new(&[0xb1; 5]))
        .is_none());
}

#[test]
fn initial_without_listener_dropped() {
    let env = test_env();
    let _binding = server_binding(&env);
    let udp = env.datapath.last_binding();

    udp.deliver_one(
        initial_datagram(VERSION_1, &[0xa1; 8], &[0xb1; 5], &[], 1200),
        remote("10.4.3.1:55000"),
    );
    env.library.wait_workers_idle();
    assert!(udp.sent().is_empty());
    assert_eq!(udp.returned_datagrams(), 1);
}

//
// Connection creation and collision.
//

#[test]
fn concurrent_create_collision_deduplicates() {
    let env = test_env();
    let binding = server_binding(&env);
    let udp = env.datapath.last_binding();
    assert!(binding.register_listener(&listener("h3")));

    let client = remote("10.5.0.1:56000");
    let buf = initial_datagram(VERSION_1, &[0xa1; 8], &[0xee; 8], &[], 1200);
    let parse = |datagram: RecvDatagram| ParsedDatagram {
        packet: RecvPacket::decode_invariant(&datagram.buffer, 8).unwrap(),
        datagram,
    };
    let first = parse(udp.datagram(buf.clone(), client));
    let second = parse(udp.datagram(buf, client));

    let memory_before = env.library.current_handshake_memory();
    let winner = binding.create_connection(&first).expect("first create");
    assert_eq!(binding.ref_count(), 2);

    // The loser finds the winner already in the remote-hash table, hands
    // it back, and dismantles itself through its pre-allocated shutdown
    // operation; nothing leaks.
    let loser_result = binding.create_connection(&second).expect("collision result");
    assert!(Arc::ptr_eq(winner.connection(), loser_result.connection()));

    env.library.wait_workers_idle();
    assert_eq!(binding.ref_count(), 2, "loser returned its binding ref");
    assert_eq!(
        env.library.current_handshake_memory(),
        memory_before + crate::connection::HANDSHAKE_CONNECTION_ESTIMATE,
        "loser returned its memory charge"
    );

    let conn = winner.connection().clone();
    drop(winner);
    drop(loser_result);
    conn.shutdown_silent();
    env.library.wait_workers_idle();
    assert_eq!(binding.ref_count(), 1);
}

//
// Exclusive bindings.
//

#[test]
fn exclusive_binding_routes_all_short_packets_to_its_connection() {
    let env = test_env();
    let binding = Binding::initialize(
        env.library.clone(),
        false,
        false,
        Some(remote("127.0.0.1:6001")),
        Some(remote("10.6.0.1:443")),
    )
    .unwrap();
    let udp = env.datapath.last_binding();
    assert!(binding.is_exclusive());
    assert!(binding.is_connected());

    let conn = Connection::connect(
        &env.library,
        env.library.unregistered_session(),
        binding.local_address(),
        remote("10.6.0.1:443"),
    );
    // Exclusive bindings use zero-length CIDs.
    assert!(binding.add_source_connection_id(&conn, ConnectionId::new(&[])));

    udp.deliver_one(short_datagram(&[], 60, false), remote("10.6.0.1:443"));
    assert_eq!(conn.queued_chain_lengths(), vec![1]);
}

#[test]
fn exclusive_binding_drops_unknown_long_header() {
    let env = test_env();
    let binding = Binding::initialize(
        env.library.clone(),
        false,
        false,
        Some(remote("127.0.0.1:6002")),
        Some(remote("10.6.0.2:443")),
    )
    .unwrap();
    let udp = env.datapath.last_binding();

    let conn = Connection::connect(
        &env.library,
        env.library.unregistered_session(),
        binding.local_address(),
        remote("10.6.0.2:443"),
    );
    assert!(binding.add_source_connection_id(&conn, ConnectionId::new(&[])));

    // A long header naming a CID we never issued misses the connection,
    // and exclusive bindings never answer statelessly.
    udp.deliver_one(
        handshake_datagram(VERSION_1, &[0x99; 8], &[0x88; 4], 64),
        remote("10.6.0.2:443"),
    );
    env.library.wait_workers_idle();
    assert!(udp.sent().is_empty());
    assert_eq!(udp.returned_datagrams(), 1);
    assert!(conn.queued_chain_lengths().is_empty());
}

//
// Subchain grouping and ordering.
//

#[test]
fn identical_dest_cids_form_one_subchain() {
    let env = test_env();
    let binding = client_binding(&env);
    let udp = env.datapath.last_binding();

    let conn = Connection::connect(
        &env.library,
        env.library.unregistered_session(),
        binding.local_address(),
        remote("10.7.0.1:443"),
    );
    let cid = [0x41; 8];
    assert!(binding.add_source_connection_id(&conn, ConnectionId::new(&cid)));

    let client = remote("10.7.0.1:443");
    udp.deliver(vec![
        udp.datagram(short_datagram(&cid, 60, false), client),
        udp.datagram(short_datagram(&cid, 61, false), client),
        udp.datagram(short_datagram(&cid, 62, false), client),
    ]);

    assert_eq!(conn.queued_chain_lengths(), vec![3]);
}

#[test]
fn distinct_dest_cids_split_subchains() {
    let env = test_env();
    let binding = client_binding(&env);
    let udp = env.datapath.last_binding();

    let session = env.library.unregistered_session();
    let peer = remote("10.7.1.1:443");
    let conn_a = Connection::connect(&env.library, session.clone(), binding.local_address(), peer);
    let conn_b = Connection::connect(&env.library, session, binding.local_address(), peer);
    let cid_a = [0x41; 8];
    let cid_b = [0x42; 8];
    assert!(binding.add_source_connection_id(&conn_a, ConnectionId::new(&cid_a)));
    assert!(binding.add_source_connection_id(&conn_b, ConnectionId::new(&cid_b)));

    // a, a, b, a: three subchains, per-subchain order preserved, total
    // length conserved.
    udp.deliver(vec![
        udp.datagram(short_datagram(&cid_a, 60, false), peer),
        udp.datagram(short_datagram(&cid_a, 60, false), peer),
        udp.datagram(short_datagram(&cid_b, 60, false), peer),
        udp.datagram(short_datagram(&cid_a, 60, false), peer),
    ]);

    assert_eq!(conn_a.queued_chain_lengths(), vec![2, 1]);
    assert_eq!(conn_b.queued_chain_lengths(), vec![1]);
}

#[test]
fn handshake_packets_sort_to_subchain_front() {
    let env = test_env();
    let binding = client_binding(&env);
    let udp = env.datapath.last_binding();

    let conn = Connection::connect(
        &env.library,
        env.library.unregistered_session(),
        binding.local_address(),
        remote("10.7.2.1:443"),
    );
    let cid = [0x43; 8];
    assert!(binding.add_source_connection_id(&conn, ConnectionId::new(&cid)));

    let peer = remote("10.7.2.1:443");
    udp.deliver(vec![
        udp.datagram(short_datagram(&cid, 60, false), peer),
        udp.datagram(handshake_datagram(VERSION_1, &cid, &[0x44; 4], 32), peer),
    ]);

    // Long header delivered ahead of the short one despite arriving last.
    assert_eq!(conn.queued_packet_shapes(), vec![vec![false, true]]);
}

//
// Listener registry.
//

#[test]
fn listener_list_sorted_family_then_specificity() {
    let env = test_env();
    let binding = server_binding(&env);

    let unspec = Listener::new(Session::new(["a"]), None);
    let v4_wild = Listener::new(Session::new(["b"]), Some(remote("0.0.0.0:443")));
    let v6_wild = Listener::new(Session::new(["c"]), Some(remote("[::]:443")));
    let v4_spec = Listener::new(Session::new(["d"]), Some(remote("127.0.0.1:443")));
    let v6_spec = Listener::new(Session::new(["e"]), Some(remote("[::1]:443")));

    for listener in [&unspec, &v4_wild, &v6_wild, &v4_spec, &v6_spec] {
        assert!(binding.register_listener(listener));
    }

    let order: Vec<_> = binding
        .listener_snapshot()
        .iter()
        .map(|l| l.local_address())
        .collect();
    assert_eq!(
        order,
        vec![
            Some(remote("[::1]:443")),
            Some(remote("[::]:443")),
            Some(remote("127.0.0.1:443")),
            Some(remote("0.0.0.0:443")),
            None,
        ]
    );

    // Same slot, non-overlapping ALPN: appended after its peer.
    let v4_spec_2 = Listener::new(Session::new(["f"]), Some(remote("127.0.0.1:443")));
    assert!(binding.register_listener(&v4_spec_2));
    let order: Vec<_> = binding
        .listener_snapshot()
        .iter()
        .map(|l| l.session().clone())
        .collect();
    assert!(order[2].has_alpn_overlap(&Session::new(["d"])));
    assert!(order[3].has_alpn_overlap(&Session::new(["f"])));

    // Same slot with ALPN overlap: rejected.
    let overlapping = Listener::new(Session::new(["d", "z"]), Some(remote("127.0.0.1:443")));
    assert!(!binding.register_listener(&overlapping));

    // Overlap across different slots is fine.
    let overlapping_elsewhere = Listener::new(Session::new(["d"]), Some(remote("10.0.0.8:443")));
    assert!(binding.register_listener(&overlapping_elsewhere));

    for listener in binding.listener_snapshot() {
        listener.shutdown();
        binding.unregister_listener(&listener);
    }
    assert!(!binding.has_listener_registered());
}

#[test]
fn first_listener_partitions_the_lookup() {
    let env = test_env();
    let binding = server_binding(&env);
    assert!(!binding.lookup().is_partitioned());
    assert!(binding.register_listener(&listener("h3")));
    assert!(binding.lookup().is_partitioned());
}

#[test]
fn get_listener_prefers_specific_address_and_checks_alpn() {
    let env = test_env();
    let binding = server_binding(&env);

    let specific = Listener::new(Session::new(["h3"]), Some(remote("127.0.0.1:4433")));
    let wild = Listener::new(Session::new(["h3"]), Some(remote("0.0.0.0:4433")));
    assert!(binding.register_listener(&specific));
    assert!(binding.register_listener(&wild));

    let info = NewConnectionInfo {
        local_address: remote("127.0.0.1:4433"),
        remote_address: remote("10.8.0.1:55000"),
        client_alpns: vec![b"h3".to_vec()],
        server_name: None,
    };
    let matched = binding.get_listener(&info).expect("match");
    assert!(!matched.is_wildcard());
    drop(matched);

    let elsewhere = NewConnectionInfo {
        local_address: remote("192.0.2.5:4433"),
        ..info.clone()
    };
    let matched = binding.get_listener(&elsewhere).expect("wildcard match");
    assert!(matched.is_wildcard());
    drop(matched);

    let wrong_alpn = NewConnectionInfo {
        client_alpns: vec![b"smtp".to_vec()],
        ..info.clone()
    };
    assert!(binding.get_listener(&wrong_alpn).is_none());

    // The first ALPN match ends the search even when it can no longer be
    // referenced.
    specific.shutdown();
    assert!(binding.get_listener(&info).is_none());
}

//
// Teardown.
//

#[test]
fn uninitialize_blocks_until_receive_callbacks_drain() {
    let env = test_env();
    let binding = server_binding(&env);
    let udp = env.datapath.last_binding();
    udp.set_receive_delay(Duration::from_millis(150));

    let delivery = {
        let udp = udp.clone();
        std::thread::spawn(move || {
            // Malformed on purpose: the callback dwells, then drops it.
            udp.deliver_one(vec![0x40], remote("10.9.0.1:50000"));
        })
    };
    std::thread::sleep(Duration::from_millis(30));

    let start = Instant::now();
    env.library.release_binding(&binding);
    assert!(
        start.elapsed() >= Duration::from_millis(50),
        "delete returned while a receive callback was in flight"
    );
    assert!(udp.was_deleted());
    delivery.join().unwrap();
}

//
// Misc plumbing.
//

#[test]
fn unreachable_signals_matching_connection() {
    let env = test_env();
    let binding = server_binding(&env);
    let peer = remote("10.10.0.1:443");

    let conn = Connection::connect(
        &env.library,
        env.library.unregistered_session(),
        binding.local_address(),
        peer,
    );
    assert_matches!(
        binding
            .lookup()
            .add_remote_hash(conn.clone(), peer, ConnectionId::new(&[1; 8])),
        crate::lookup::AddRemoteHashResult::Inserted
    );

    binding.unreachable(peer);
    assert_eq!(conn.unreachable_events(), vec![peer]);

    binding.unreachable(remote("10.99.0.1:1"));
    assert_eq!(conn.unreachable_events(), vec![peer]);
}

struct DropEverything;

impl TestDatapathHooks for DropEverything {
    fn receive(&self, _datagram: &mut RecvDatagram) -> bool {
        true
    }

    fn send(
        &self,
        _remote: &mut SocketAddr,
        _local: Option<&mut SocketAddr>,
        _ctx: &SendContext,
    ) -> bool {
        true
    }
}

#[test]
fn test_hooks_intercept_both_directions() {
    let env = test_env();
    let binding = server_binding(&env);
    let udp = env.datapath.last_binding();
    env.library.set_test_hooks(Some(Arc::new(DropEverything)));

    udp.deliver_one(short_datagram(&[7; 8], 100, false), remote("10.11.0.1:1"));
    assert_eq!(udp.returned_datagrams(), 1);
    assert_eq!(binding.stateless_operation_count(), 0);

    // A hook-dropped send still reports success.
    let mut ctx = SendContext::new();
    ctx.push(vec![0xab; 32]);
    binding.send_to(remote("10.11.0.1:1"), ctx).unwrap();
    assert!(udp.sent().is_empty());

    env.library.set_test_hooks(None);
}
