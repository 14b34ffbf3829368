mod common;

use async_trait::async_trait;
use common::{start_node, wait_for};
use mockall::mock;
use network::{protocol, Binding, Connector, LinkEvent, MemoryNetwork};
use room::{spawn_session, SessionConfig};
use room_core::{CanvasId, CanvasUpdate, Envelope, Error, PeerId, SessionEvent};
use std::sync::Arc;
use std::time::Duration;

mock! {
    pub Transport {}

    #[async_trait]
    impl Connector for Transport {
        async fn bind(&self, local: PeerId) -> Result<Binding, Error>;
    }
}

#[tokio::test(start_paused = true)]
async fn stuck_pending_connection_is_discarded_and_retried_once() {
    let network = MemoryNetwork::new();
    let silent = PeerId::new("silent");
    network.hold(&silent);

    let a = start_node(&network, "Alice", &[&silent]).await;
    assert_eq!(network.dial_count(&silent), 1);

    tokio::time::sleep(Duration::from_secs(9)).await;
    assert_eq!(network.dial_count(&silent), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(network.dial_count(&silent), 2);

    // The retry times out too, and that is the end of it
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(network.dial_count(&silent), 2);

    let snapshot = a.handle.snapshot().await.unwrap();
    assert!(snapshot.open_peers.is_empty());
    assert!(snapshot.status.contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn unreachable_peer_backs_off_three_then_five_seconds() {
    let network = MemoryNetwork::new();
    let gone = PeerId::new("gone");

    let _a = start_node(&network, "Alice", &[&gone]).await;
    assert_eq!(network.dial_count(&gone), 1);

    tokio::time::sleep(Duration::from_millis(2_900)).await;
    assert_eq!(network.dial_count(&gone), 1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(network.dial_count(&gone), 2);

    tokio::time::sleep(Duration::from_millis(4_800)).await;
    assert_eq!(network.dial_count(&gone), 2);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(network.dial_count(&gone), 3);

    // Given up until rediscovered
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(network.dial_count(&gone), 3);
}

#[tokio::test(start_paused = true)]
async fn full_sync_request_is_repeated_twice_when_unanswered() {
    let network = MemoryNetwork::new();
    let a = start_node(&network, "Alice", &[]).await;

    // A hand-driven peer that never answers canvas requests
    let quiet = network.bind(PeerId::new("quiet")).await.unwrap();
    let mut link = quiet.dialer.dial(&a.id).unwrap();
    assert_eq!(link.events.recv().await, Some(LinkEvent::Open));

    tokio::time::sleep(Duration::from_secs(30)).await;

    let mut requests = 0;
    while let Ok(event) = link.events.try_recv() {
        if let LinkEvent::Message(bytes) = event {
            if let Ok(Envelope::RequestAllCanvasData(request)) = protocol::decode(&bytes) {
                assert_eq!(request.requester_id, a.id);
                requests += 1;
            }
        }
    }
    assert_eq!(requests, 3);

    let snapshot = a.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.open_peers, vec![PeerId::new("quiet")]);
}

#[tokio::test(start_paused = true)]
async fn answered_full_sync_is_not_repeated() {
    let network = MemoryNetwork::new();
    let a = start_node(&network, "Alice", &[]).await;

    let chatty = network.bind(PeerId::new("chatty")).await.unwrap();
    let mut link = chatty.dialer.dial(&a.id).unwrap();
    assert_eq!(link.events.recv().await, Some(LinkEvent::Open));

    let answer = Envelope::CanvasUpdate(CanvasUpdate {
        canvas_id: CanvasId::new("north-1"),
        image_data: b"hello".to_vec(),
        updated_at_millis: 10,
    });
    link.handle.send(protocol::encode(&answer).unwrap()).unwrap();
    wait_for(&a.handle, "canvas from chatty", |s| {
        s.canvas(&CanvasId::new("north-1")).map(|c| c.updated_at_millis) == Some(10)
    })
    .await;

    tokio::time::sleep(Duration::from_secs(30)).await;

    let mut requests = 0;
    while let Ok(event) = link.events.try_recv() {
        if let LinkEvent::Message(bytes) = event {
            if let Ok(Envelope::RequestAllCanvasData(_)) = protocol::decode(&bytes) {
                requests += 1;
            }
        }
    }
    assert_eq!(requests, 1);
}

#[test_log::test(tokio::test)]
async fn failing_transport_leaves_a_usable_offline_session() {
    let mut transport = MockTransport::new();
    transport
        .expect_bind()
        .times(1)
        .returning(|_| Err(Error::Transport("relay unreachable".to_string())));

    let config = SessionConfig {
        bootstrap: vec![PeerId::new("someone")],
        ..SessionConfig::default()
    };
    let (handle, mut events, _task) = spawn_session(Arc::new(transport), None, config);

    let id = tokio_test::assert_ok!(handle.start("Solo").await);

    match events.recv().await {
        Some(SessionEvent::Status(status)) => assert!(status.contains("Offline")),
        other => panic!("Expected an offline status, got {:?}", other),
    }
    assert_eq!(events.recv().await, Some(SessionEvent::SelfReady(id)));

    let canvas = CanvasId::new("south-0");
    handle
        .commit_draw(canvas.clone(), b"alone".to_vec())
        .await
        .unwrap();
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.canvas(&canvas).unwrap().image, b"alone".to_vec());
    assert!(snapshot.open_peers.is_empty());
}
