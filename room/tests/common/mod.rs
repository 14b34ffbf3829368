#![allow(dead_code)]

use network::MemoryNetwork;
use room::{spawn_session, SessionConfig, SessionHandle};
use room_core::{PeerId, SessionEvent, SessionSnapshot};
use settings_manager::CanvasCache;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub struct Node {
    pub id: PeerId,
    pub handle: SessionHandle,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub task: JoinHandle<()>,
}

pub async fn start_node(network: &MemoryNetwork, name: &str, bootstrap: &[&PeerId]) -> Node {
    start_node_with_cache(network, name, bootstrap, None).await
}

pub async fn start_node_with_cache(
    network: &MemoryNetwork,
    name: &str,
    bootstrap: &[&PeerId],
    cache: Option<CanvasCache>,
) -> Node {
    let config = SessionConfig {
        bootstrap: bootstrap.iter().map(|peer| (*peer).clone()).collect(),
        ..SessionConfig::default()
    };
    let (handle, events, task) = spawn_session(Arc::new(network.clone()), cache, config);
    let id = handle.start(name).await.expect("start failed");
    Node {
        id,
        handle,
        events,
        task,
    }
}

/// Poll snapshots until `check` holds
pub async fn wait_for<F>(handle: &SessionHandle, what: &str, check: F) -> SessionSnapshot
where
    F: Fn(&SessionSnapshot) -> bool,
{
    for _ in 0..500 {
        let snapshot = handle.snapshot().await.expect("snapshot failed");
        if check(&snapshot) {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let snapshot = handle.snapshot().await.expect("snapshot failed");
    panic!("Timed out waiting for {}: {:?}", what, snapshot);
}

/// Receive events until one matches `check`
pub async fn wait_for_event<F>(events: &mut mpsc::UnboundedReceiver<SessionEvent>, check: F) -> SessionEvent
where
    F: Fn(&SessionEvent) -> bool,
{
    let found = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            if check(&event) {
                return Some(event);
            }
        }
        None
    })
    .await;

    match found {
        Ok(Some(event)) => event,
        Ok(None) => panic!("Event stream ended"),
        Err(_) => panic!("Timed out waiting for an event"),
    }
}

pub async fn wait_connected(a: &Node, b: &Node) {
    let b_id = b.id.clone();
    wait_for(&a.handle, "connection", |s| s.open_peers.contains(&b_id)).await;
    let a_id = a.id.clone();
    wait_for(&b.handle, "connection", |s| s.open_peers.contains(&a_id)).await;
}
