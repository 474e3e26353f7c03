//! End-to-end scenarios over the simulated airwaves.

use burlap::config::ProtocolConfig;
use burlap::dtn::{BundleFlags, BundlePriority, BundleStatus};
use burlap::emergency::EmergencyKind;
use burlap::geo::{GeocastRegion, Position};
use burlap::link::LinkState;
use burlap::packet::{self, NodeAddress, PacketType};
use burlap::stack::SendError;
use burlap_sim::SimNet;

const A: u32 = 0x0000_00A1;
const B: u32 = 0x0000_00B2;
const C: u32 = 0x0000_00C3;
const D: u32 = 0x0000_00D4;

/// Beacon exchange so everyone knows their direct neighbors.
fn warmup(net: &mut SimNet) {
    net.run_ms(3_000);
}

#[test]
fn direct_message_with_ack() {
    let mut net = SimNet::new();
    let a = net.add_node(A);
    let b = net.add_node(B);
    net.connect(a, b);
    warmup(&mut net);

    net.node(a)
        .stack
        .send_message(NodeAddress::new(B), b"hi neighbor", true)
        .unwrap();
    net.run_ms(5_000);

    let received = &net.node(b).host.messages;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0, NodeAddress::new(A));
    assert_eq!(received[0].1, b"hi neighbor");
    // The ACK made it back: no failure was ever reported.
    assert!(net.node(a).host.delivery_failures.is_empty());
}

#[test]
fn three_hop_delivery_with_discovery() {
    let mut net = SimNet::new();
    let mut cfg = ProtocolConfig::default();
    cfg.max_ttl = 4;
    let a = net.add_node_with(A, cfg);
    let b = net.add_node(B);
    let c = net.add_node(C);
    let d = net.add_node(D);
    net.connect(a, b);
    net.connect(b, c);
    net.connect(c, d);
    warmup(&mut net);

    // No route yet: the send fails and kicks off a discovery.
    assert_eq!(
        net.node(a)
            .stack
            .send_message(NodeAddress::new(D), b"over the hills", false),
        Err(SendError::NoRoute)
    );
    net.run_ms(10_000);

    // The reply installed the route; the retry goes through.
    net.node(a)
        .stack
        .send_message(NodeAddress::new(D), b"over the hills", false)
        .unwrap();
    net.run_ms(10_000);

    let received = &net.node(d).host.messages;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].1, b"over the hills");

    // The frame traversed exactly three radio hops.
    let entry = net.node(d).stack.history().get(0).unwrap();
    assert_eq!(entry.hop_count, 3);
    assert_eq!(entry.source, NodeAddress::new(A));
}

#[test]
fn broadcast_reaches_everyone_exactly_once() {
    let mut net = SimNet::new();
    let a = net.add_node(A);
    let b = net.add_node(B);
    let c = net.add_node(C);
    // Triangle: every rebroadcast loops straight back.
    net.connect(a, b);
    net.connect(b, c);
    net.connect(a, c);
    warmup(&mut net);

    net.node(a).stack.send_broadcast(b"to all").unwrap();
    net.run_ms(5_000);

    for idx in [b, c] {
        let broadcasts: Vec<_> = net
            .node(idx)
            .host
            .messages
            .iter()
            .filter(|(_, data)| data == b"to all")
            .collect();
        assert_eq!(broadcasts.len(), 1, "node {} saw duplicates", idx);
    }
}

#[test]
fn ttl_bounds_broadcast_flood() {
    let mut net = SimNet::new();
    let mut cfg = ProtocolConfig::default();
    cfg.max_ttl = 2;
    let a = net.add_node_with(A, cfg);
    let b = net.add_node(B);
    let c = net.add_node(C);
    let d = net.add_node(D);
    // A chain: the flood must die after two hops.
    net.connect(a, b);
    net.connect(b, c);
    net.connect(c, d);
    warmup(&mut net);

    net.node(a).stack.send_broadcast(b"short fuse").unwrap();
    net.run_ms(5_000);

    let got = |net: &mut SimNet, i| {
        net.node(i)
            .host
            .messages
            .iter()
            .any(|(_, data)| data == b"short fuse")
    };
    assert!(got(&mut net, b));
    assert!(got(&mut net, c));
    assert!(!got(&mut net, d), "ttl=2 must not reach the third hop");
}

#[test]
fn retransmits_then_reports_failure() {
    let mut net = SimNet::new();
    let a = net.add_node(A);
    let b = net.add_node(B);
    net.connect(a, b);
    warmup(&mut net);

    // B vanishes, but remains in A's neighbor table until the route timeout.
    net.disconnect(a, b);
    let id = net
        .node(a)
        .stack
        .send_message(NodeAddress::new(B), b"anyone there?", true)
        .unwrap();

    // ack_timeout(5s) * (3 retries + 1) plus slack.
    net.run_ms(25_000);

    let failures = &net.node(a).host.delivery_failures;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0], (id, NodeAddress::new(B)));
    assert!(net.node(b).host.messages.is_empty());
}

#[test]
fn link_handshake_and_encrypted_data() {
    let mut net = SimNet::new();
    let a = net.add_node(A);
    let b = net.add_node(B);
    net.connect(a, b);
    warmup(&mut net);

    net.node(a).stack.request_link(NodeAddress::new(B)).unwrap();
    net.run_ms(3_000);

    assert_eq!(
        net.node(a).stack.link_state(NodeAddress::new(B)),
        LinkState::Active
    );
    assert_eq!(
        net.node(b).stack.link_state(NodeAddress::new(A)),
        LinkState::Active
    );
    assert_eq!(net.node(a).host.links_established, vec![NodeAddress::new(B)]);
    assert_eq!(net.node(b).host.links_established, vec![NodeAddress::new(A)]);

    net.node(a)
        .stack
        .send_link_data(NodeAddress::new(B), b"ratchet hello")
        .unwrap();
    net.node(b)
        .stack
        .send_link_data(NodeAddress::new(A), b"ratchet reply")
        .unwrap();
    net.run_ms(3_000);

    assert_eq!(
        net.node(b).host.link_data,
        vec![(NodeAddress::new(A), b"ratchet hello".to_vec())]
    );
    assert_eq!(
        net.node(a).host.link_data,
        vec![(NodeAddress::new(B), b"ratchet reply".to_vec())]
    );

    // Nothing that went over the air contains the plaintext.
    for frame in &net.air_log {
        assert!(
            !frame
                .windows(b"ratchet hello".len())
                .any(|w| w == b"ratchet hello"),
            "plaintext leaked on air"
        );
    }
}

#[test]
fn group_messages_deliver_once_despite_flooding() {
    let mut net = SimNet::new();
    let a = net.add_node(A);
    let b = net.add_node(B);
    let c = net.add_node(C);
    net.connect(a, b);
    net.connect(b, c);
    net.connect(a, c);
    warmup(&mut net);

    let key = [0x11; 32];
    let gid = net.node(a).stack.create_group("chat", Some(&key)).unwrap();
    assert_eq!(net.node(b).stack.join_group("chat", &key).unwrap(), gid);
    // C is not a member and must see nothing.

    net.node(a).stack.send_group_message(gid, b"first").unwrap();
    net.run_ms(2_000);
    net.node(a).stack.send_group_message(gid, b"second").unwrap();
    net.run_ms(2_000);

    let got: Vec<_> = net
        .node(b)
        .host
        .group_messages
        .iter()
        .map(|(g, from, data)| (*g, *from, data.clone()))
        .collect();
    assert_eq!(
        got,
        vec![
            (gid, NodeAddress::new(A), b"first".to_vec()),
            (gid, NodeAddress::new(A), b"second".to_vec()),
        ]
    );
    assert!(net.node(c).host.group_messages.is_empty());
}

#[test]
fn group_frame_replay_is_rejected() {
    let mut net = SimNet::new();
    let a = net.add_node(A);
    let b = net.add_node(B);
    net.connect(a, b);
    warmup(&mut net);

    let key = [0x11; 32];
    let gid = net.node(a).stack.create_group("chat", Some(&key)).unwrap();
    net.node(b).stack.join_group("chat", &key).unwrap();

    net.node(a).stack.send_group_message(gid, b"genuine").unwrap();
    net.run_ms(2_000);
    assert_eq!(net.node(b).host.group_messages.len(), 1);

    // Replay the captured group frame straight into B's receive path.
    let replayed: Vec<Vec<u8>> = net
        .air_log
        .iter()
        .filter(|f| matches!(packet::decode(f.as_slice()), Ok((h, _)) if h.ty == PacketType::Group))
        .cloned()
        .collect();
    assert!(!replayed.is_empty());
    for frame in replayed {
        net.inject(b, &frame, -70, 8);
    }
    net.run_ms(1_000);

    // The watermark (and the outer dedup) held: still exactly one delivery.
    assert_eq!(net.node(b).host.group_messages.len(), 1);
}

#[test]
fn custody_handoff_frees_the_originator() {
    let mut net = SimNet::new();
    let a = net.add_node(A);
    let b = net.add_node(B);
    net.connect(a, b);
    warmup(&mut net);

    // D is nowhere in sight; B accepts custody and carries the bundle onward.
    let id = net
        .node(a)
        .stack
        .queue_bundle(
            NodeAddress::new(D),
            b"carry this for me",
            BundlePriority::Normal,
            None,
            BundleFlags::CUSTODY,
        )
        .unwrap();
    net.run_ms(5_000);

    // A's slot is free; B now holds the bundle.
    assert_eq!(net.node(a).stack.bundle_status(id), None);
    assert!(net
        .node(a)
        .host
        .bundle_statuses
        .iter()
        .any(|&(bid, status)| bid == id && status == BundleStatus::Delivered));
    assert!(matches!(
        net.node(b).stack.bundle_status(id),
        Some(BundleStatus::Pending) | Some(BundleStatus::CustodyWait)
    ));
}

#[test]
fn bundle_delivered_end_to_end_when_destination_appears() {
    let mut net = SimNet::new();
    let a = net.add_node(A);
    let d = net.add_node(D);
    warmup(&mut net);

    let id = net
        .node(a)
        .stack
        .queue_bundle(
            NodeAddress::new(D),
            b"delayed delivery",
            BundlePriority::Normal,
            None,
            BundleFlags::empty(),
        )
        .unwrap();
    net.run_ms(10_000);
    assert_eq!(net.node(a).stack.bundle_status(id), Some(BundleStatus::Pending));

    // The destination drifts into range.
    net.connect(a, d);
    net.run_ms(40_000);

    let delivered = &net.node(d).host.bundles_delivered;
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].0, id);
    assert_eq!(delivered[0].1, NodeAddress::new(A));
    assert_eq!(delivered[0].2, b"delayed delivery");
}

#[test]
fn sos_is_tracked_and_cleared() {
    let mut net = SimNet::new();
    let a = net.add_node(A);
    let b = net.add_node(B);
    net.connect(a, b);
    warmup(&mut net);

    net.node(a)
        .stack
        .activate_sos(EmergencyKind::Rescue, b"lost near ridge")
        .unwrap();
    net.run_ms(2_000);

    let seen = &net.node(b).host.sos_received;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, NodeAddress::new(A));
    assert_eq!(seen[0].1.message.as_slice(), &b"lost near ridge"[..]);

    net.node(b).stack.acknowledge_sos(NodeAddress::new(A)).unwrap();
    net.run_ms(2_000);

    net.node(a).stack.cancel_sos();
    net.run_ms(2_000);
    assert_eq!(net.node(b).host.sos_cleared, vec![NodeAddress::new(A)]);
}

#[test]
fn geocast_respects_region_and_envelope() {
    let mut net = SimNet::new();
    // Sender well outside; one node inside the region, one in the 2r fringe, one beyond.
    let base = Position {
        latitude: 390_000_000,
        longitude: -1_200_000_000,
    };
    let north = |centidegrees: i32| Position {
        latitude: base.latitude + centidegrees * 100_000,
        longitude: base.longitude,
    };

    let s = net.add_node(A);
    let inside = net.add_node(B);
    let fringe = net.add_node(C);
    let beyond = net.add_node(D);
    net.connect(s, inside);
    net.connect(inside, fringe);
    net.connect(fringe, beyond);
    warmup(&mut net);

    // Center 5.5 km north of base, radius 1 km.
    let region = GeocastRegion {
        center: north(5),
        radius_m: 1000,
    };
    net.node(s).stack.set_position(base.latitude, base.longitude, 0);
    {
        let p = north(5);
        net.node(inside).stack.set_position(p.latitude, p.longitude, 0);
    }
    {
        let p = north(6); // ~1.1 km from center: relays, no delivery
        net.node(fringe).stack.set_position(p.latitude, p.longitude, 0);
    }
    {
        let p = north(8); // ~3.3 km: outside the 2r envelope
        net.node(beyond).stack.set_position(p.latitude, p.longitude, 0);
    }

    net.node(s)
        .stack
        .send_geocast(region, b"flash flood warning")
        .unwrap();
    net.run_ms(5_000);

    assert_eq!(net.node(inside).host.geocasts.len(), 1);
    assert_eq!(net.node(inside).host.geocasts[0].1, b"flash flood warning");
    assert!(net.node(fringe).host.geocasts.is_empty());
    assert!(net.node(beyond).host.geocasts.is_empty());
}

#[test]
fn names_learned_from_beacons() {
    let mut net = SimNet::new();
    let a = net.add_node(A);
    let b = net.add_node(B);
    net.connect(a, b);

    net.node(a).stack.set_name("ridge-7").unwrap();
    // Beacons repeat on the beacon interval; give one a chance to flow.
    net.run_ms(35_000);

    assert_eq!(
        net.node(b).stack.resolve_name("ridge-7"),
        Some(NodeAddress::new(A))
    );
    let shown = format!("{}", net.node(b).stack.name_of(NodeAddress::new(A)));
    assert_eq!(shown, "ridge-7");
}

#[test]
fn telemetry_report_round_trip() {
    let mut net = SimNet::new();
    let a = net.add_node(A);
    let b = net.add_node(B);
    net.connect(a, b);
    warmup(&mut net);

    net.node(a).stack.set_battery_level(73);
    net.node(a).stack.set_temperature(215);
    net.node(a).stack.send_telemetry(NodeAddress::new(B)).unwrap();
    net.run_ms(3_000);

    let reports = &net.node(b).host.telemetry;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0, NodeAddress::new(A));
    assert_eq!(reports[0].1.battery, 73);
    assert_eq!(reports[0].1.temperature, 215);
}
