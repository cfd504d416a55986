//! End-to-end cluster scenarios: convergence, delivery, failover, handoff.
//!
//! Every test runs a real cluster on loopback TCP: several member nodes
//! (and sometimes an external client) with a static peer directory standing
//! in for DNS.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::time::Instant;

use dnsbus::cluster::StaticDirectory;
use dnsbus::prelude::*;

/// Unique ports across tests in this binary.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(43100);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn local(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().expect("loopback addr")
}

fn member(priority: u8, coordination_port: u16, peers: &[SocketAddr]) -> Node {
    let mut config = NodeConfig::new("test.cluster");
    config.election_priority = priority;
    config.coordination_port = coordination_port;
    config.external_updates_port = next_port();
    // generous deadline: loopback, but CI schedulers stall
    config.vote_timeout = Duration::from_millis(500);
    Node::with_directory(config, Arc::new(StaticDirectory::new(peers.to_vec())))
        .expect("member node")
}

fn external(peers: &[SocketAddr]) -> Node {
    let mut config = NodeConfig::new("test.cluster");
    config.external = true;
    config.coordination_port = next_port();
    config.external_updates_port = next_port();
    Node::with_directory(config, Arc::new(StaticDirectory::new(peers.to_vec())))
        .expect("external node")
}

/// Activate a cluster of member nodes with the given election priorities.
async fn converged_cluster(priorities: &[u8]) -> (Vec<Node>, Vec<SocketAddr>) {
    let ports: Vec<u16> = priorities.iter().map(|_| next_port()).collect();
    let peers: Vec<SocketAddr> = ports.iter().map(|port| local(*port)).collect();

    let nodes: Vec<Node> = priorities
        .iter()
        .zip(&ports)
        .map(|(priority, port)| member(*priority, *port, &peers))
        .collect();

    for node in &nodes {
        node.activate().await.expect("activate");
    }
    assert!(
        wait_for(Duration::from_secs(15), || {
            nodes.iter().all(|node| node.is_ready())
        })
        .await,
        "cluster did not converge"
    );
    (nodes, peers)
}

async fn wait_for(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}

/// Drain events until a bus message on `channel` arrives.
async fn expect_message(
    events: &mut broadcast::Receiver<NodeEvent>,
    channel: &str,
    deadline: Duration,
) -> Vec<Bytes> {
    let end = Instant::now() + deadline;
    loop {
        let remaining = end.saturating_duration_since(Instant::now());
        let event = tokio::time::timeout(remaining, events.recv())
            .await
            .unwrap_or_else(|_| panic!("no message on '{channel}' in time"))
            .expect("event stream open");
        if let NodeEvent::Message {
            channel: received,
            parts,
        } = event
        {
            if received == channel {
                return parts;
            }
        }
    }
}

// ============================================================================
// Convergence
// ============================================================================

#[tokio::test]
async fn test_three_members_converge_on_the_lowest_priority() {
    let (nodes, _) = converged_cluster(&[0, 1, 2]).await;

    let master_name = nodes[0].name().to_string();
    assert!(nodes[0].is_master());
    assert!(!nodes[1].is_master());
    assert!(!nodes[2].is_master());
    for node in &nodes {
        assert!(node.is_ready());
        assert_eq!(
            node.master().expect("master known").name,
            master_name,
            "every member follows the same master"
        );
    }

    for node in nodes {
        node.deactivate().await;
    }
}

#[tokio::test]
async fn test_single_member_elects_itself() {
    let port = next_port();
    let peers = vec![local(port)];
    let node = member(0, port, &peers);
    let mut events = node.events();

    node.activate().await.expect("activate");
    assert!(
        wait_for(Duration::from_secs(10), || node.is_ready()).await,
        "lone member did not become ready"
    );
    assert!(node.is_master());

    // let the event dispatcher catch up before draining
    tokio::time::sleep(Duration::from_millis(300)).await;

    // boundary events fired exactly once on the way up
    let mut ready = 0;
    let mut connect = 0;
    let mut not_ready = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            NodeEvent::Ready => ready += 1,
            NodeEvent::Connect => connect += 1,
            NodeEvent::NotReady => not_ready += 1,
            _ => {}
        }
    }
    assert_eq!(ready, 1);
    assert_eq!(connect, 1);
    assert_eq!(not_ready, 0);

    node.deactivate().await;
}

#[tokio::test]
async fn test_activate_is_idempotent() {
    let port = next_port();
    let peers = vec![local(port)];
    let node = member(0, port, &peers);

    node.activate().await.expect("first");
    node.activate().await.expect("second is a no-op");
    assert!(wait_for(Duration::from_secs(10), || node.is_ready()).await);
    node.deactivate().await;
    node.deactivate().await;
}

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test]
async fn test_messages_route_through_the_master() {
    let (nodes, _) = converged_cluster(&[0, 1, 2]).await;

    nodes[1].subscribe(["updates"]);
    let mut events = nodes[1].events();
    // let the live filter reach the subscribe socket
    tokio::time::sleep(Duration::from_millis(200)).await;

    nodes[2].publish("updates", [Bytes::from_static(b"through the bus")]);

    let parts = expect_message(&mut events, "updates", Duration::from_secs(5)).await;
    assert_eq!(parts, vec![Bytes::from_static(b"through the bus")]);

    for node in nodes {
        node.deactivate().await;
    }
}

#[tokio::test]
async fn test_publisher_receives_its_own_messages_when_subscribed() {
    let (nodes, _) = converged_cluster(&[0, 1]).await;

    nodes[0].subscribe(["loopback"]);
    let mut events = nodes[0].events();
    tokio::time::sleep(Duration::from_millis(200)).await;

    nodes[0].publish("loopback", [Bytes::from_static(b"echo")]);
    let parts = expect_message(&mut events, "loopback", Duration::from_secs(5)).await;
    assert_eq!(parts, vec![Bytes::from_static(b"echo")]);

    for node in nodes {
        node.deactivate().await;
    }
}

#[tokio::test]
async fn test_reserved_channels_never_reach_the_application() {
    let (nodes, _) = converged_cluster(&[0, 1]).await;

    // neither call crashes, subscribes, nor publishes
    nodes[1].subscribe(["heartbeats", "newmaster"]);
    assert!(nodes[1].subscribed_channels().is_empty());

    let mut events = nodes[1].events();
    nodes[0].publish("newmaster", [Bytes::from_static(b"forged")]);

    // heartbeats keep flowing, but no application message may surface
    tokio::time::sleep(Duration::from_secs(1)).await;
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, NodeEvent::Message { .. }),
            "reserved-channel data leaked to the application"
        );
    }

    for node in nodes {
        node.deactivate().await;
    }
}

// ============================================================================
// External nodes
// ============================================================================

#[tokio::test]
async fn test_external_node_follows_and_receives() {
    let (nodes, peers) = converged_cluster(&[0, 1]).await;

    let edge = external(&peers);
    edge.activate().await.expect("activate");
    assert!(
        wait_for(Duration::from_secs(10), || edge.is_ready()).await,
        "external node did not connect"
    );
    assert_eq!(edge.node_type(), NodeType::External);
    assert!(!edge.is_master());
    assert_eq!(
        edge.master().expect("master known").name,
        nodes[0].name(),
        "external node follows the member master"
    );

    edge.subscribe(["updates"]);
    let mut events = edge.events();
    tokio::time::sleep(Duration::from_millis(200)).await;

    nodes[1].publish("updates", [Bytes::from_static(b"to the edge")]);
    let parts = expect_message(&mut events, "updates", Duration::from_secs(5)).await;
    assert_eq!(parts, vec![Bytes::from_static(b"to the edge")]);

    edge.deactivate().await;
    for node in nodes {
        node.deactivate().await;
    }
}

// ============================================================================
// Failover and handoff
// ============================================================================

#[tokio::test]
async fn test_graceful_handoff_elects_the_next_priority() {
    let (nodes, _) = converged_cluster(&[0, 1, 2]).await;
    let mut nodes = nodes.into_iter();
    let master = nodes.next().expect("master");
    let second = nodes.next().expect("second");
    let third = nodes.next().expect("third");

    assert!(master.is_master());
    master.deactivate().await;

    assert!(
        wait_for(Duration::from_secs(20), || {
            second.is_master()
                && second.is_ready()
                && third.is_ready()
                && third
                    .master()
                    .is_some_and(|record| record.name == second.name())
        })
        .await,
        "cluster did not converge on the successor"
    );
    assert!(!master.is_ready());

    second.deactivate().await;
    third.deactivate().await;
}

#[tokio::test]
async fn test_silent_master_death_triggers_reelection() {
    let (nodes, _) = converged_cluster(&[0, 1, 2]).await;
    let mut nodes = nodes.into_iter();
    let master = nodes.next().expect("master");
    let second = nodes.next().expect("second");
    let third = nodes.next().expect("third");

    // no goodbye: the master process is simply gone
    drop(master);

    assert!(
        wait_for(Duration::from_secs(20), || {
            second.is_master() && second.is_ready() && third.is_ready()
        })
        .await,
        "survivors did not re-elect after master silence"
    );
    assert_eq!(
        third.master().expect("master known").name,
        second.name()
    );

    second.deactivate().await;
    third.deactivate().await;
}

#[tokio::test]
async fn test_subscriptions_survive_failover() {
    let (nodes, _) = converged_cluster(&[0, 1, 2]).await;
    let mut nodes = nodes.into_iter();
    let master = nodes.next().expect("master");
    let second = nodes.next().expect("second");
    let third = nodes.next().expect("third");

    third.subscribe(["updates"]);
    tokio::time::sleep(Duration::from_millis(200)).await;

    master.deactivate().await;
    assert!(
        wait_for(Duration::from_secs(20), || {
            second.is_master() && second.is_ready() && third.is_ready()
        })
        .await,
        "cluster did not converge on the successor"
    );
    assert_eq!(third.subscribed_channels(), vec!["updates".to_string()]);

    let mut events = third.events();
    // publish after failover: the subscription must still be live
    tokio::time::sleep(Duration::from_millis(300)).await;
    second.publish("updates", [Bytes::from_static(b"after failover")]);

    let parts = expect_message(&mut events, "updates", Duration::from_secs(5)).await;
    assert_eq!(parts, vec![Bytes::from_static(b"after failover")]);

    second.deactivate().await;
    third.deactivate().await;
}
