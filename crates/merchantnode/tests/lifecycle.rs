use merchantnode::bitcoin::secp256k1::Secp256k1;
use merchantnode::testing::{private_key, TestNode, BLOCK_INTERVAL};
use merchantnode::{
    ChainView, Error, Merchantnode, MessageKind, Ping, Registry, State, EXPIRATION_SECONDS,
    MIN_ANNOUNCE_SECONDS, MIN_PING_SECONDS, POSE_BAN_MAX_SCORE,
};
use std::net::SocketAddr;

fn signed_ping(node: &TestNode, record: &Merchantnode, service: u8) -> Ping {
    let mut ping = Ping::new(record.outpoint, &node.context()).unwrap();
    ping.sign(&private_key(service), &node.clock).unwrap();
    ping
}

#[test]
fn check_is_stable_within_recheck_window() {
    let node = TestNode::new(100);
    let (_, mut record) = node.announced_record(&private_key(1), &private_key(2));
    let ctx = node.context();

    record.check(true, &ctx);
    let before = record.clone();
    record.check(false, &ctx);
    assert_eq!(record, before);
}

#[test]
fn spent_collateral_is_terminal() {
    let node = TestNode::new(100);
    let collateral = private_key(1);
    let (_, mut record) = node.announced_record(&collateral, &private_key(2));
    let ctx = node.context();

    node.chain().spend(&record.outpoint);
    record.check(true, &ctx);
    assert_eq!(record.state, State::OutpointSpent);

    // even if the output shows up again
    let amount = node.params.collateral_amount;
    node.chain()
        .add_coin(record.outpoint, amount, TestNode::COLLATERAL_HEIGHT, Default::default());
    for _ in 0..3 {
        node.clock.advance(MIN_PING_SECONDS);
        record.check(true, &ctx);
        assert_eq!(record.state, State::OutpointSpent);
    }
}

#[test]
fn pose_ban_lasts_one_payment_cycle() {
    let node = TestNode::new(100);
    node.registry.set_size(7);
    let (_, mut record) = node.announced_record(&private_key(1), &private_key(2));
    let ctx = node.context();

    for _ in 0..POSE_BAN_MAX_SCORE {
        record.increase_pose_ban_score();
    }
    record.check(true, &ctx);
    assert_eq!(record.state, State::PoseBan);
    assert_eq!(record.pose_ban_height, 107);

    node.chain().advance(6);
    record.check(true, &ctx);
    assert_eq!(record.state, State::PoseBan);
    assert_eq!(record.pose_ban_score, POSE_BAN_MAX_SCORE);

    node.chain().advance(1);
    record.check(true, &ctx);
    assert_eq!(record.state, State::PreEnabled);
    assert_eq!(record.pose_ban_score, POSE_BAN_MAX_SCORE - 1);

    // one more strike bans it again
    record.increase_pose_ban_score();
    record.check(true, &ctx);
    assert_eq!(record.state, State::PoseBan);
    assert_eq!(record.pose_ban_height, 114);
}

#[test]
fn older_announcement_is_always_rejected() {
    let node = TestNode::new(100);
    let collateral = private_key(1);
    let (mut announcement, _) = node.announced_record(&collateral, &private_key(2));

    node.clock.advance(1);
    let mut newer = announcement.clone();
    newer.sign(&collateral, &node.clock).unwrap();
    let mut record = Merchantnode::from(&newer);

    announcement.signature = vec![0; 65];
    let err = announcement.update(&mut record, &node.context()).unwrap_err();
    assert!(matches!(err, Error::StaleAnnouncement { .. }));
    assert_eq!(err.misbehavior(), 0);
    assert_eq!(record.sig_time, newer.sig_time);
}

#[test]
fn equal_sig_time_needs_recovery_flag() {
    let node = TestNode::new(100);
    let (announcement, mut record) = node.announced_record(&private_key(1), &private_key(2));
    node.clock.advance(MIN_ANNOUNCE_SECONDS);
    let ctx = node.context();

    let before = record.clone();
    assert!(matches!(
        announcement.update(&mut record, &ctx),
        Err(Error::DuplicateAnnouncement)
    ));
    assert_eq!(record, before);

    let mut recovery = announcement.clone();
    recovery.recovery = true;
    assert!(recovery.update(&mut record, &ctx).unwrap());
    assert!(node
        .relay
        .relayed()
        .iter()
        .any(|inv| inv.kind == MessageKind::Announce && inv.hash == announcement.hash()));
}

#[test]
fn out_of_order_announcements_converge() {
    let node = TestNode::new(100);
    let collateral = private_key(1);
    let first = node.announce(&collateral, &private_key(2));
    let t = first.sig_time;

    node.clock.set(t + 1);
    let mut second = first.clone();
    second.addr = "10.0.0.2:19999".parse::<SocketAddr>().unwrap();
    second.sign(&collateral, &node.clock).unwrap();
    node.clock.set(t + MIN_ANNOUNCE_SECONDS + 100);
    let ctx = node.context();

    // newest first: the late older one is ignored
    let mut record = Merchantnode::from(&second);
    assert!(first.update(&mut record, &ctx).is_err());
    assert_eq!(record.sig_time, t + 1);
    assert_eq!(record.addr, second.addr);

    // in order: the newer one replaces the fields
    let mut record = Merchantnode::from(&first);
    assert!(second.update(&mut record, &ctx).unwrap());
    assert_eq!(record.sig_time, t + 1);
    assert_eq!(record.addr, second.addr);
    assert_eq!(record.signature, second.signature);
}

#[test]
fn stale_ping_block_is_rejected() {
    let node = TestNode::new(100);
    let (_, mut record) = node.announced_record(&private_key(1), &private_key(2));
    node.clock.advance(MIN_PING_SECONDS);

    let mut ping = signed_ping(&node, &record, 2);
    // the ping block is 12 deep, 13 more blocks make it 25 deep
    node.chain().advance(13);
    let err = ping
        .check_and_update(Some(&mut record), false, &node.context())
        .unwrap_err();
    assert!(matches!(err, Error::PingBlockTooOld(_)));

    ping.block_hash = node.chain().block_at(113 - 24);
    ping.sign(&private_key(2), &node.clock).unwrap();
    assert!(ping
        .check_and_update(Some(&mut record), false, &node.context())
        .unwrap());
}

#[test]
fn collateral_needs_min_confirmations() {
    let mut node = TestNode::new(93);
    node.params.min_confirmations = 15;
    node.clock.advance(BLOCK_INTERVAL);
    let collateral = private_key(1);

    let pubkey = collateral.public_key(&Secp256k1::new());
    let amount = node.params.collateral_amount;
    let outpoint = node.chain().add_collateral(amount, 80, &pubkey);
    let mut announcement = merchantnode::Announcement::create(
        outpoint,
        merchantnode::testing::TEST_ADDR,
        &collateral,
        &private_key(2),
        &node.context(),
    )
    .unwrap();
    node.registry
        .seen_announcements()
        .insert(announcement.hash(), announcement.clone());

    let err = announcement.check_outpoint(&node.context()).unwrap_err();
    assert!(matches!(
        err,
        Error::InsufficientConfirmations { have: 14, need: 15 }
    ));
    assert!(err.is_transient());
    assert!(node
        .registry
        .seen_announcements()
        .get(&announcement.hash())
        .is_none());

    node.chain().advance(1);
    announcement.check_outpoint(&node.context()).unwrap();
    assert_eq!(
        announcement.collateral_min_conf_block_hash,
        node.chain().block_hash(94).unwrap()
    );
}

#[test]
fn expired_record_recovers_with_ping() {
    let node = TestNode::new(100);
    let (_, mut record) = node.announced_record(&private_key(1), &private_key(2));
    let ctx = node.context();

    node.clock.advance(EXPIRATION_SECONDS);
    record.check(false, &ctx);
    assert_eq!(record.state, State::Expired);

    let ping = signed_ping(&node, &record, 2);
    assert!(ping.check_and_update(Some(&mut record), false, &ctx).unwrap());
    assert_eq!(record.state, State::Enabled);
    assert_eq!(node.relay.relayed().last().unwrap().hash, ping.hash());
}

#[test]
fn forged_ping_is_penalized() {
    let node = TestNode::new(100);
    let (_, mut record) = node.announced_record(&private_key(1), &private_key(2));
    node.clock.advance(MIN_PING_SECONDS);

    let ping = signed_ping(&node, &record, 3);
    let err = ping
        .check_and_update(Some(&mut record), false, &node.context())
        .unwrap_err();
    assert_eq!(err.misbehavior(), 33);
    assert_ne!(record.last_ping.as_ref(), Some(&ping));
}

#[test]
fn nothing_is_relayed_before_sync() {
    let node = TestNode::new(100);
    node.registry.set_list_synced(false);
    let (_, mut record) = node.announced_record(&private_key(1), &private_key(2));
    node.clock.advance(MIN_PING_SECONDS);

    let ping = signed_ping(&node, &record, 2);
    assert!(ping
        .check_and_update(Some(&mut record), false, &node.context())
        .unwrap());
    assert!(node.relay.relayed().is_empty());
}

#[test]
fn own_outdated_node_requires_update() {
    let mut node = TestNode::new(100);
    let service = private_key(2);
    let (_, mut record) = node.announced_record(&private_key(1), &service);
    node.set_local(record.outpoint, &service);
    record.protocol_version -= 1;
    let ctx = node.context();

    record.check(true, &ctx);
    assert_eq!(record.state, State::UpdateRequired);

    node.clock.advance(MIN_PING_SECONDS);
    let ping = signed_ping(&node, &record, 2);
    assert!(matches!(
        ping.check_and_update(Some(&mut record), false, &ctx),
        Err(Error::UpdateRequired)
    ));
}

#[test]
fn own_announcement_activates_local_node() {
    let mut node = TestNode::new(100);
    let collateral = private_key(1);
    let service = private_key(2);
    let (announcement, mut record) = node.announced_record(&collateral, &service);
    node.set_local(record.outpoint, &service);

    node.clock.advance(MIN_PING_SECONDS);
    let mut newer = announcement.clone();
    newer.last_ping = Some(signed_ping(&node, &record, 2));
    newer.sign(&collateral, &node.clock).unwrap();
    assert!(record.update_from_new_broadcast(&newer, &node.context()));
    assert_eq!(record.pose_ban_score, -POSE_BAN_MAX_SCORE);
    assert_eq!(record.last_ping, newer.last_ping);

    node.clock.advance(MIN_PING_SECONDS);
    let mut outdated = newer.clone();
    outdated.protocol_version += 1;
    outdated.sign(&collateral, &node.clock).unwrap();
    assert!(!record.update_from_new_broadcast(&outdated, &node.context()));
}

#[test]
fn score_ranks_merchantnodes_per_block() {
    let node = TestNode::new(100);
    let (_, a) = node.announced_record(&private_key(1), &private_key(2));
    let (_, b) = node.announced_record(&private_key(3), &private_key(4));
    let block = node.chain().block_at(100);

    assert_eq!(a.score(&block), a.clone().score(&block));
    assert_ne!(a.score(&block), b.score(&block));
}
