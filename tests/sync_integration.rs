//! End-to-end tests for the document sync channel.

use futures_util::{SinkExt, StreamExt};
use huddle_collab::sync::feed::{DocFeed, FeedConfig, FeedEvent, FeedStatus};
use huddle_collab::sync::hub::{HubConfig, SyncHub};
use huddle_collab::sync::wire::{PeerProfile, SyncKind, SyncMessage};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_hub() -> u16 {
    let port = free_port().await;
    let config = HubConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        channel_capacity: 64,
        backlog_capacity: 256,
        evict_empty_rooms: false,
    };
    let hub = SyncHub::new(config);
    tokio::spawn(async move {
        hub.run().await.unwrap();
    });
    sleep(Duration::from_millis(50)).await;
    port
}

fn feed_config(port: u16, room: &str, name: &str) -> FeedConfig {
    let mut config = FeedConfig::new(format!("ws://127.0.0.1:{port}"), room, name);
    config.reconnect_delay = Duration::from_millis(200);
    config
}

async fn expect_feed_event<T>(
    events: &mut tokio::sync::mpsc::Receiver<FeedEvent>,
    pick: impl Fn(FeedEvent) -> Option<T>,
) -> T {
    timeout(Duration::from_secs(3), async {
        loop {
            let event = events.recv().await.expect("feed event channel closed");
            if let Some(value) = pick(event) {
                return value;
            }
        }
    })
    .await
    .expect("expected feed event did not arrive in time")
}

#[tokio::test]
async fn test_plain_http_gets_health_response() {
    let port = start_hub().await;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    timeout(Duration::from_secs(2), stream.read_to_end(&mut response))
        .await
        .expect("health response timed out")
        .unwrap();

    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200 OK"), "got: {text}");
    assert!(text.ends_with("okay"), "got: {text}");
}

#[tokio::test]
async fn test_websocket_upgrade_still_works() {
    let port = start_hub().await;
    let url = format!("ws://127.0.0.1:{port}");
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "upgrade request should reach the bus");
}

#[tokio::test]
async fn test_backlog_replayed_to_late_subscriber() {
    let port = start_hub().await;
    let url = format!("ws://127.0.0.1:{port}");

    // First peer publishes two fragments, then leaves.
    let early = PeerProfile::new("Early");
    let (mut ws_a, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let join = SyncMessage::join("doc-room", &early);
    ws_a.send(Message::Binary(join.encode().unwrap().into()))
        .await
        .unwrap();
    for payload in [vec![1u8, 2, 3], vec![4u8]] {
        let update = SyncMessage::update(early.peer_id, "doc-room", payload);
        ws_a.send(Message::Binary(update.encode().unwrap().into()))
            .await
            .unwrap();
    }
    sleep(Duration::from_millis(100)).await;
    drop(ws_a);

    // A peer arriving later still receives the buffered fragments.
    let late = PeerProfile::new("Late");
    let (mut ws_b, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let join = SyncMessage::join("doc-room", &late);
    ws_b.send(Message::Binary(join.encode().unwrap().into()))
        .await
        .unwrap();

    let mut payloads = Vec::new();
    let _ = timeout(Duration::from_millis(500), async {
        while payloads.len() < 2 {
            if let Some(Ok(Message::Binary(data))) = ws_b.next().await {
                let bytes: Vec<u8> = data.into();
                let msg = SyncMessage::decode(&bytes).unwrap();
                if msg.kind == SyncKind::Update {
                    payloads.push(msg.payload);
                }
            } else {
                break;
            }
        }
    })
    .await;

    assert_eq!(payloads, vec![vec![1, 2, 3], vec![4]]);
}

#[tokio::test]
async fn test_two_feeds_converge_through_hub() {
    let port = start_hub().await;

    let mut alice = DocFeed::new(feed_config(port, "doc-room", "Alice"));
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await;
    expect_feed_event(&mut alice_events, |e| match e {
        FeedEvent::StatusChanged(FeedStatus::Connected) => Some(()),
        _ => None,
    })
    .await;

    let mut bob = DocFeed::new(feed_config(port, "doc-room", "Bob"));
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await;
    expect_feed_event(&mut bob_events, |e| match e {
        FeedEvent::StatusChanged(FeedStatus::Connected) => Some(()),
        _ => None,
    })
    .await;
    sleep(Duration::from_millis(150)).await;

    alice.insert(0, "hello ").await;
    sleep(Duration::from_millis(150)).await;
    bob.insert(0, "world ").await;

    // Both replicas settle on identical content containing both edits.
    timeout(Duration::from_secs(3), async {
        loop {
            let a = alice.contents();
            let b = bob.contents();
            if a == b && a.contains("hello") && a.contains("world") {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("replicas never converged");

    alice.disconnect().await;
    bob.disconnect().await;
}

#[tokio::test]
async fn test_offline_edits_drain_on_connect() {
    let port = start_hub().await;

    // Bob is online first and will observe Alice's catch-up.
    let mut bob = DocFeed::new(feed_config(port, "doc-room", "Bob"));
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await;
    expect_feed_event(&mut bob_events, |e| match e {
        FeedEvent::StatusChanged(FeedStatus::Connected) => Some(()),
        _ => None,
    })
    .await;

    // Alice edits before ever connecting; edits apply locally and queue.
    let alice = DocFeed::new(feed_config(port, "doc-room", "Alice"));
    alice.insert(0, "offline").await;
    alice.insert(7, " first").await;
    assert_eq!(alice.offline_len().await, 2);
    assert_eq!(alice.contents(), "offline first");

    alice.connect().await;

    timeout(Duration::from_secs(3), async {
        loop {
            if alice.offline_len().await == 0 && bob.contents() == "offline first" {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("queued edits never reached the other peer");

    alice.disconnect().await;
    bob.disconnect().await;
}

#[tokio::test]
async fn test_awareness_entries_disappear_on_disconnect() {
    let port = start_hub().await;

    let mut alice = DocFeed::new(feed_config(port, "doc-room", "Alice"));
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await;
    expect_feed_event(&mut alice_events, |e| match e {
        FeedEvent::StatusChanged(FeedStatus::Connected) => Some(()),
        _ => None,
    })
    .await;

    let mut bob = DocFeed::new(feed_config(port, "doc-room", "Bob"));
    let bob_peer = bob.profile().peer_id;
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await;
    expect_feed_event(&mut bob_events, |e| match e {
        FeedEvent::StatusChanged(FeedStatus::Connected) => Some(()),
        _ => None,
    })
    .await;

    // Alice sees Bob join...
    let joined = expect_feed_event(&mut alice_events, |e| match e {
        FeedEvent::PeerJoined(profile) => Some(profile),
        _ => None,
    })
    .await;
    assert_eq!(joined.peer_id, bob_peer);
    assert_eq!(joined.name, "Bob");
    assert_eq!(alice.peers().await.len(), 1);

    // ...and sees the hub-synthesized leave when Bob's transport drops.
    bob.disconnect().await;
    let left = expect_feed_event(&mut alice_events, |e| match e {
        FeedEvent::PeerLeft(peer_id) => Some(peer_id),
        _ => None,
    })
    .await;
    assert_eq!(left, bob_peer);
    assert!(alice.peers().await.is_empty());

    alice.disconnect().await;
}

#[tokio::test]
async fn test_cursors_fan_out_but_are_not_buffered() {
    let port = start_hub().await;

    let mut alice = DocFeed::new(feed_config(port, "doc-room", "Alice"));
    let alice_peer = alice.profile().peer_id;
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await;
    expect_feed_event(&mut alice_events, |e| match e {
        FeedEvent::StatusChanged(FeedStatus::Connected) => Some(()),
        _ => None,
    })
    .await;

    let mut bob = DocFeed::new(feed_config(port, "doc-room", "Bob"));
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await;
    expect_feed_event(&mut bob_events, |e| match e {
        FeedEvent::StatusChanged(FeedStatus::Connected) => Some(()),
        _ => None,
    })
    .await;
    sleep(Duration::from_millis(150)).await;

    alice.send_cursor(2, 7).await;

    let (peer_id, cursor) = expect_feed_event(&mut bob_events, |e| match e {
        FeedEvent::RemoteCursor { peer_id, cursor } => Some((peer_id, cursor)),
        _ => None,
    })
    .await;
    assert_eq!(peer_id, alice_peer);
    assert_eq!(cursor.anchor, 2);
    assert_eq!(cursor.head, 7);

    // A later subscriber replays the backlog but no cursor frames.
    let mut carol = DocFeed::new(feed_config(port, "doc-room", "Carol"));
    let mut carol_events = carol.take_event_rx().unwrap();
    carol.connect().await;
    let stray_cursor = timeout(Duration::from_millis(400), async {
        loop {
            if let Some(FeedEvent::RemoteCursor { .. }) = carol_events.recv().await {
                return;
            }
        }
    })
    .await;
    assert!(stray_cursor.is_err(), "cursor frames must not be buffered");

    alice.disconnect().await;
    bob.disconnect().await;
    carol.disconnect().await;
}

#[tokio::test]
async fn test_feed_status_error_when_hub_unreachable() {
    // Dial a port nothing listens on: local editing keeps working and
    // the status is Error, not a panic or a dead session.
    let port = free_port().await;
    let mut feed = DocFeed::new(feed_config(port, "doc-room", "Alice"));
    let mut events = feed.take_event_rx().unwrap();
    feed.connect().await;

    expect_feed_event(&mut events, |e| match e {
        FeedEvent::StatusChanged(FeedStatus::Error) => Some(()),
        _ => None,
    })
    .await;

    feed.insert(0, "still editable").await;
    assert_eq!(feed.contents(), "still editable");

    feed.disconnect().await;
}
