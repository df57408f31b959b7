use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use lan_group_chat::{
    EngineConfig, GroupChatError, GroupEvent, MembershipEngine, ReceivedMessage, Role, Username,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn free_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Two engines whose discovery channels talk to each other over loopback.
fn pair(
    first: &str,
    second: &str,
) -> (
    (MembershipEngine, mpsc::UnboundedReceiver<GroupEvent>),
    (MembershipEngine, mpsc::UnboundedReceiver<GroupEvent>),
) {
    let (port_a, port_b) = (free_port(), free_port());
    let config = |local: u16, remote: u16| {
        EngineConfig::new()
            .discovery_port(local)
            .broadcast_destination(SocketAddrV4::new(Ipv4Addr::LOCALHOST, remote))
            .local_address(Ipv4Addr::LOCALHOST)
    };
    let a = MembershipEngine::new(Username::new(first).unwrap(), config(port_a, port_b)).unwrap();
    let b = MembershipEngine::new(Username::new(second).unwrap(), config(port_b, port_a)).unwrap();
    (a, b)
}

async fn next_message(events: &mut mpsc::UnboundedReceiver<GroupEvent>) -> ReceivedMessage {
    loop {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for a chat message")
            .expect("event stream closed");
        if let GroupEvent::Message(message) = event {
            return message;
        }
    }
}

async fn wait_for_pending(engine: &MembershipEngine, count: usize) {
    timeout(Duration::from_secs(5), async {
        while engine.pending_join_requests() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("join request never arrived");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn creator_admits_joiner_and_announces_it() {
    let ((mut alice, mut alice_events), (mut bob, _bob_events)) = pair("alice", "bob");
    let group = Ipv4Addr::new(239, 1, 1, 1);
    let group_port = free_port();

    let endpoint = alice.create_group("book-club", group, group_port).unwrap();
    assert_eq!(alice.role(), Role::Creator);

    let joiner = tokio::spawn(async move {
        let joined = bob.join_group("book-club", Duration::from_secs(5)).await;
        (bob, joined)
    });

    wait_for_pending(&alice, 1).await;
    assert_eq!(
        alice_events.recv().await,
        Some(GroupEvent::JoinRequestsPending { count: 1 })
    );

    let decisions = alice.process_join_requests(|_, _| true).await.unwrap();
    assert_eq!(decisions.len(), 1);
    assert!(decisions[0].accepted);
    assert_eq!(decisions[0].request.username.as_str(), "bob");
    assert_eq!(decisions[0].request.group_id, "book-club");

    let (bob, joined) = joiner.await.unwrap();
    assert_eq!(joined.unwrap(), endpoint);
    assert_eq!(bob.role(), Role::Participant);
    assert_eq!(bob.group_id(), Some("book-club"));
    assert_eq!(bob.group_endpoint(), Some(endpoint));

    // Alice is a member of her own group and hears the announcement once.
    let announcement = next_message(&mut alice_events).await;
    assert_eq!(announcement.group_id, "book-club");
    assert_eq!(announcement.username.as_str(), "alice");
    assert_eq!(announcement.text, "bob joined book-club");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(alice_events.try_recv().is_err());

    bob.send_message("hello, book club").await.unwrap();
    let greeting = next_message(&mut alice_events).await;
    assert_eq!(greeting.username.as_str(), "bob");
    assert_eq!(greeting.text, "hello, book club");
    assert_eq!(greeting.group_id, "book-club");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn creator_can_deny_a_joiner() {
    let ((mut alice, _alice_events), (mut bob, _bob_events)) = pair("alice", "bob");
    alice
        .create_group("chess-club", Ipv4Addr::new(239, 1, 1, 2), free_port())
        .unwrap();

    let joiner = tokio::spawn(async move {
        let joined = bob.join_group("chess-club", Duration::from_secs(5)).await;
        (bob, joined)
    });

    wait_for_pending(&alice, 1).await;
    let decisions = alice.process_join_requests(|_, _| false).await.unwrap();
    assert_eq!(decisions.len(), 1);
    assert!(!decisions[0].accepted);

    let (bob, joined) = joiner.await.unwrap();
    assert!(matches!(joined, Err(GroupChatError::JoinDenied { .. })));
    assert_eq!(bob.role(), Role::None);
    assert!(bob.group_endpoint().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn requests_for_unknown_groups_time_out() {
    let ((mut alice, _alice_events), (mut bob, _bob_events)) = pair("alice", "bob");
    alice
        .create_group("book-club", Ipv4Addr::new(239, 1, 1, 3), free_port())
        .unwrap();

    let joined = bob.join_group("no-such-group", Duration::from_millis(300)).await;

    assert!(matches!(joined, Err(GroupChatError::JoinTimeout { .. })));
    assert_eq!(bob.role(), Role::None);
    assert_eq!(alice.pending_join_requests(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abandoned_join_does_not_consume_a_late_response() {
    let ((mut alice, _alice_events), (mut bob, _bob_events)) = pair("alice", "bob");
    alice
        .create_group("book-club", Ipv4Addr::new(239, 1, 1, 4), free_port())
        .unwrap();

    // Give up on the handshake before the creator gets to answer.
    let abandoned = timeout(
        Duration::from_millis(100),
        bob.join_group("book-club", Duration::from_secs(30)),
    )
    .await;
    assert!(abandoned.is_err());

    wait_for_pending(&alice, 1).await;
    alice.process_join_requests(|_, _| true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(bob.role(), Role::None);
    assert!(bob.group_id().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn groups_sharing_a_port_do_not_hear_each_other() {
    let ((mut alice, mut alice_events), (mut carol, mut carol_events)) = pair("alice", "carol");
    let port = free_port();
    alice
        .create_group("book-club", Ipv4Addr::new(239, 1, 1, 10), port)
        .unwrap();
    carol
        .create_group("chess-club", Ipv4Addr::new(239, 1, 1, 11), port)
        .unwrap();

    alice.send_message("book talk").await.unwrap();
    let own = next_message(&mut alice_events).await;
    assert_eq!(own.text, "book talk");
    assert_eq!(own.group_id, "book-club");

    carol.send_message("chess talk").await.unwrap();
    let own = next_message(&mut carol_events).await;
    assert_eq!(own.text, "chess talk");
    assert_eq!(own.group_id, "chess-club");

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(alice_events.try_recv().is_err());
    assert!(carol_events.try_recv().is_err());
}
