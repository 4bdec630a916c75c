//! End-to-end behaviour of hub, rooms and sessions over in-memory connections.

use std::sync::Arc;
use std::time::Duration;

use scribe_core::{
    Hub, HubConfig, HubHandle, Identity, Lifecycle, Session, SessionConfig, SessionId,
    SessionOutcome, SessionState,
};
use scribe_protocol::{Envelope, MessageKind};
use scribe_transport::memory::{self, MemoryPeer};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

struct Client {
    id: SessionId,
    peer: MemoryPeer,
    state: Arc<SessionState>,
    task: JoinHandle<SessionOutcome>,
}

impl Client {
    async fn send(&self, envelope: Envelope) {
        self.peer.send(&envelope).await.unwrap();
    }

    async fn expect(&mut self) -> Envelope {
        timeout(WAIT, self.peer.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("connection closed")
    }

    async fn outcome(self) -> SessionOutcome {
        timeout(WAIT, self.task)
            .await
            .expect("session did not finish")
            .unwrap()
    }
}

async fn connect_with(
    hub: &HubHandle,
    document: &str,
    user: &str,
    config: SessionConfig,
    peer_buffer: usize,
) -> Client {
    let (conn, peer) = memory::pair(peer_buffer);
    let session = Session::new(document, Identity::new(user), config);
    let id = session.id();
    let state = session.state();
    let task = tokio::spawn(session.run(hub.clone(), Box::new(conn)));

    wait_until_joined(hub, id).await;
    Client {
        id,
        peer,
        state,
        task,
    }
}

async fn connect(hub: &HubHandle, document: &str, user: &str) -> Client {
    connect_with(hub, document, user, SessionConfig::default(), 64).await
}

async fn wait_until_joined(hub: &HubHandle, id: SessionId) {
    timeout(WAIT, async {
        while hub.document_of(id).await.unwrap().is_none() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("session never joined");
}

async fn wait_for_room_size(hub: &HubHandle, document: &str, expected: Option<usize>) {
    timeout(WAIT, async {
        while hub.room_size(document).await.unwrap() != expected {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("room never reached expected size");
}

#[tokio::test]
async fn test_isolation_between_documents() {
    let (hub, _hub_task) = Hub::spawn(HubConfig::default());
    let mut alice = connect(&hub, "doc-1", "alice").await;
    let mut bob = connect(&hub, "doc-2", "bob").await;

    alice.send(Envelope::patch("doc-1", b"for doc-1".to_vec())).await;

    // Alice's own echo proves the publish was processed.
    assert_eq!(alice.expect().await.payload, b"for doc-1".to_vec());
    hub.stats().await.unwrap();
    assert!(bob.peer.try_recv().is_none());
}

#[tokio::test]
async fn test_fan_out_reaches_every_member_including_sender() {
    let (hub, _hub_task) = Hub::spawn(HubConfig::default());
    let mut clients = Vec::new();
    for i in 0..5 {
        clients.push(connect(&hub, "shared", &format!("user-{i}")).await);
    }

    clients[0]
        .send(Envelope::cursor("shared", b"12:3".to_vec()))
        .await;

    for client in &mut clients {
        let envelope = client.expect().await;
        assert_eq!(envelope.kind, MessageKind::Cursor);
        assert_eq!(envelope.document_id, "shared");
        assert_eq!(envelope.payload, b"12:3".to_vec());
    }

    hub.stats().await.unwrap();
    for client in &mut clients {
        assert!(client.peer.try_recv().is_none(), "delivered more than once");
    }
}

#[tokio::test]
async fn test_exclude_sender_flag_skips_author() {
    let (hub, _hub_task) = Hub::spawn(HubConfig::default());
    let mut author = connect(&hub, "doc", "author").await;
    let mut reader = connect(&hub, "doc", "reader").await;

    author
        .send(Envelope::presence("doc", b"typing".to_vec()).excluding_sender())
        .await;
    author.send(Envelope::patch("doc", b"edit".to_vec())).await;

    assert_eq!(reader.expect().await.payload, b"typing".to_vec());
    assert_eq!(reader.expect().await.payload, b"edit".to_vec());
    // The first thing the author sees is the second, non-excluded message.
    assert_eq!(author.expect().await.payload, b"edit".to_vec());
}

#[tokio::test]
async fn test_room_removed_after_last_member_and_recreated() {
    let (hub, _hub_task) = Hub::spawn(HubConfig::default());
    let mut first = connect(&hub, "notes", "ana").await;
    let mut second = connect(&hub, "notes", "ben").await;
    assert_eq!(hub.room_size("notes").await.unwrap(), Some(2));

    first.peer.hang_up();
    second.peer.hang_up();
    assert_eq!(first.outcome().await, SessionOutcome::Closed);
    assert_eq!(second.outcome().await, SessionOutcome::Closed);

    assert_eq!(hub.room_size("notes").await.unwrap(), None);
    assert_eq!(hub.stats().await.unwrap().room_count, 0);

    let mut third = connect(&hub, "notes", "cleo").await;
    assert_eq!(hub.room_size("notes").await.unwrap(), Some(1));

    third.send(Envelope::patch("notes", b"fresh".to_vec())).await;
    assert_eq!(third.expect().await.payload, b"fresh".to_vec());
}

#[tokio::test]
async fn test_slow_consumer_is_evicted_and_room_keeps_working() {
    let (hub, _hub_task) = Hub::spawn(HubConfig::default());
    let roomy = SessionConfig {
        queue_capacity: 64,
        ..SessionConfig::default()
    };
    let mut a = connect_with(&hub, "doc1", "a", roomy.clone(), 64).await;
    // B never reads: one envelope fits in its connection, two in its queue.
    let b = connect_with(
        &hub,
        "doc1",
        "b",
        SessionConfig {
            queue_capacity: 2,
            ..SessionConfig::default()
        },
        1,
    )
    .await;
    let mut c = connect_with(&hub, "doc1", "c", roomy, 64).await;

    for i in 0..20u8 {
        a.send(Envelope::patch("doc1", vec![i])).await;
    }

    // C receives every message exactly once, in publish order.
    for i in 0..20u8 {
        assert_eq!(c.expect().await.payload, vec![i]);
    }
    for i in 0..20u8 {
        assert_eq!(a.expect().await.payload, vec![i]);
    }

    let b_state = Arc::clone(&b.state);
    assert_eq!(b.outcome().await, SessionOutcome::Evicted);
    assert!(b_state.is_evicted());
    assert_eq!(b_state.lifecycle(), Lifecycle::Closed);
    assert_eq!(hub.room_size("doc1").await.unwrap(), Some(2));

    // A and C keep exchanging messages after the eviction.
    c.send(Envelope::patch("doc1", b"after".to_vec())).await;
    assert_eq!(a.expect().await.payload, b"after".to_vec());
    assert_eq!(c.expect().await.payload, b"after".to_vec());

    let stats = hub.stats().await.unwrap();
    assert_eq!(stats.sessions_evicted, 1);
    assert_eq!(stats.session_count, 2);
}

#[tokio::test]
async fn test_close_twice_tears_down_once() {
    let (hub, _hub_task) = Hub::spawn(HubConfig::default());
    let mut stay = connect(&hub, "doc", "stay").await;
    let go = connect(&hub, "doc", "go").await;
    let go_id = go.id;

    assert!(go.state.request_close());
    assert!(!go.state.request_close());
    let go_state = Arc::clone(&go.state);
    assert_eq!(go.outcome().await, SessionOutcome::Closed);
    assert_eq!(go_state.lifecycle(), Lifecycle::Closed);
    assert!(!go_state.begin_leaving());

    // A late explicit leave changes nothing.
    hub.leave(go_id).await.unwrap();
    assert_eq!(hub.room_size("doc").await.unwrap(), Some(1));

    stay.send(Envelope::control("doc", b"ping".to_vec())).await;
    assert_eq!(stay.expect().await.payload, b"ping".to_vec());
}

#[tokio::test]
async fn test_malformed_frame_ends_only_that_session() {
    let (hub, _hub_task) = Hub::spawn(HubConfig::default());
    let mut good = connect(&hub, "doc", "good").await;
    let bad = connect(&hub, "doc", "bad").await;

    bad.peer
        .send_raw(vec![0u8, 0, 0, 3, 0xc1, 0xc1, 0xc1])
        .await
        .unwrap();
    assert_eq!(bad.outcome().await, SessionOutcome::ProtocolViolation);
    wait_for_room_size(&hub, "doc", Some(1)).await;

    good.send(Envelope::patch("doc", b"still here".to_vec())).await;
    assert_eq!(good.expect().await.payload, b"still here".to_vec());
}

#[tokio::test]
async fn test_envelope_for_other_document_is_rejected() {
    let (hub, _hub_task) = Hub::spawn(HubConfig::default());
    let mut other = connect(&hub, "doc-b", "other").await;
    let intruder = connect(&hub, "doc-a", "intruder").await;

    intruder
        .send(Envelope::patch("doc-b", b"sneaky".to_vec()))
        .await;
    assert_eq!(intruder.outcome().await, SessionOutcome::ProtocolViolation);

    assert_eq!(hub.room_size("doc-a").await.unwrap(), None);
    hub.stats().await.unwrap();
    assert!(other.peer.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_idle_timeout_closes_quiet_session() {
    let (hub, _hub_task) = Hub::spawn(HubConfig::default());
    let config = SessionConfig {
        idle_timeout: Some(Duration::from_secs(30)),
        ..SessionConfig::default()
    };
    let (conn, _peer) = memory::pair(8);
    let session = Session::new("doc", Identity::new("sleepy"), config);
    let task = tokio::spawn(session.run(hub.clone(), Box::new(conn)));

    assert_eq!(task.await.unwrap(), SessionOutcome::IdleTimeout);
    assert_eq!(hub.room_size("doc").await.unwrap(), None);
}

#[tokio::test]
async fn test_hub_shutdown_closes_every_session() {
    let (hub, hub_task) = Hub::spawn(HubConfig::default());
    let mut first = connect(&hub, "doc-1", "one").await;
    let mut second = connect(&hub, "doc-2", "two").await;

    hub.shutdown().await.unwrap();
    hub_task.await.unwrap();

    // Write halves close their connections once the queues are released.
    assert!(timeout(WAIT, first.peer.recv()).await.unwrap().is_none());
    assert!(timeout(WAIT, second.peer.recv()).await.unwrap().is_none());
    assert_eq!(first.outcome().await, SessionOutcome::Closed);
    assert_eq!(second.outcome().await, SessionOutcome::Closed);
}

#[tokio::test]
async fn test_session_against_stopped_hub() {
    let (hub, hub_task) = Hub::spawn(HubConfig::default());
    hub.shutdown().await.unwrap();
    hub_task.await.unwrap();

    let (conn, mut peer) = memory::pair(4);
    let session = Session::new("doc", Identity::new("late"), SessionConfig::default());
    let state = session.state();

    let outcome = session.run(hub, Box::new(conn)).await;
    assert_eq!(outcome, SessionOutcome::HubUnavailable);
    assert_eq!(state.lifecycle(), Lifecycle::Closed);
    assert!(peer.recv().await.is_none());
}
