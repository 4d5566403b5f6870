mod common;

use common::logging::init_test_logging;
use common::test_node::TestNode;
use common::test_node::TIMEOUT;
use p2p_gossip::models::channel::OutboundParcel;
use p2p_gossip::models::channel::TargetSelector;
use p2p_gossip::models::peer::endpoint::BanTarget;
use p2p_gossip::models::peer::parcel::Parcel;

#[tokio::test(flavor = "multi_thread")]
pub async fn two_nodes_connect_and_exchange_parcels() -> anyhow::Result<()> {
    init_test_logging();

    let mut alice = TestNode::start_node(TestNode::default_args("alice")).await?;
    let alice_address = alice.local_addr().unwrap();
    let mut bob =
        TestNode::start_node_with_seed(TestNode::default_args("bob"), alice_address).await?;

    TestNode::wait_for_peers(&alice, 1).await?;
    TestNode::wait_for_peers(&bob, 1).await?;

    let bob_as_seen_by_alice = alice.peers().pop().unwrap();
    assert!(bob_as_seen_by_alice.incoming);
    assert_eq!(bob.local_addr().unwrap().port(), bob_as_seen_by_alice.endpoint.port);
    assert_eq!(bob.args().node_id, Some(bob_as_seen_by_alice.node_id));

    let alice_as_seen_by_bob = bob.peers().pop().unwrap();
    assert!(!alice_as_seen_by_bob.incoming);
    assert_eq!(alice_address.port(), alice_as_seen_by_bob.endpoint.port);

    bob.to_network()
        .send(OutboundParcel::new(
            TargetSelector::Broadcast,
            Parcel::message(b"hello alice".to_vec()),
        ))
        .await?;
    let received = tokio::time::timeout(TIMEOUT, alice.from_network().recv())
        .await?
        .unwrap();
    assert_eq!(b"hello alice".to_vec(), received.parcel.payload);
    assert_eq!(bob_as_seen_by_alice.hash, received.origin);
    assert_eq!(bob_as_seen_by_alice.hash, received.parcel.header.target_peer);

    alice
        .to_network()
        .send(OutboundParcel::reply(
            &received,
            Parcel::message(b"hello bob".to_vec()),
        ))
        .await?;
    let reply = tokio::time::timeout(TIMEOUT, bob.from_network().recv())
        .await?
        .unwrap();
    assert_eq!(b"hello bob".to_vec(), reply.parcel.payload);
    assert_eq!(alice_as_seen_by_bob.hash, reply.origin);

    bob.stop().await?;
    TestNode::wait_for_peers(&alice, 0).await?;
    alice.stop().await?;

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
pub async fn ban_disconnects_peer() -> anyhow::Result<()> {
    init_test_logging();

    let mut alice = TestNode::start_node(TestNode::default_args("alice")).await?;
    let mut bob = TestNode::start_node_with_seed(
        TestNode::default_args("bob"),
        alice.local_addr().unwrap(),
    )
    .await?;
    TestNode::wait_for_peers(&alice, 1).await?;

    alice.ban(BanTarget::Ip(bob.local_addr().unwrap().ip()))?;

    TestNode::wait_for_peers(&alice, 0).await?;
    TestNode::wait_for_peers(&bob, 0).await?;

    bob.stop().await?;
    alice.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
pub async fn state_is_persisted_on_stop() -> anyhow::Result<()> {
    init_test_logging();

    let mut alice = TestNode::start_node(TestNode::default_args("alice")).await?;
    let alice_address = alice.local_addr().unwrap();

    let persist_file = TestNode::persist_file();
    let mut bob_args = TestNode::default_args("bob");
    bob_args.persist_file = Some(persist_file.clone());
    bob_args.ban = vec!["10.1.2.3".parse()?];
    let mut bob = TestNode::start_node_with_seed(bob_args, alice_address).await?;
    TestNode::wait_for_peers(&bob, 1).await?;

    bob.stop().await?;
    alice.stop().await?;

    let persisted: serde_json::Value = serde_json::from_slice(&std::fs::read(&persist_file)?)?;
    std::fs::remove_file(&persist_file)?;

    let bootstrap = persisted["bootstrap"].as_array().unwrap();
    assert_eq!(1, bootstrap.len());
    assert_eq!(u64::from(alice_address.port()), bootstrap[0]["port"]);
    assert!(persisted["bans"].get("10.1.2.3").is_some());

    Ok(())
}
