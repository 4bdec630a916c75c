//! Fixtures shared by the Scribe benchmarks.

use scribe_core::{Hub, HubConfig, HubHandle, SessionHandle, SessionId, SessionQueue};

/// Document every benchmark publishes to.
pub const DOCUMENT: &str = "bench-doc";

/// A payload of `size` bytes.
#[must_use]
pub fn payload(size: usize) -> Vec<u8> {
    vec![0x5a; size]
}

/// `members` fresh session handles with their queues.
#[must_use]
pub fn sessions(members: usize, capacity: usize) -> Vec<(SessionHandle, SessionQueue)> {
    (0..members)
        .map(|_| SessionHandle::new(SessionId::next(), capacity))
        .collect()
}

/// Spawn a hub with `members` sessions joined to [`DOCUMENT`].
///
/// Returns once every join has been applied.
pub async fn populated_hub(members: usize, capacity: usize) -> (HubHandle, Vec<SessionQueue>) {
    let (hub, _task) = Hub::spawn(HubConfig::default());
    let mut queues = Vec::with_capacity(members);

    for (handle, queue) in sessions(members, capacity) {
        hub.join(handle, DOCUMENT).await.expect("hub stopped");
        queues.push(queue);
    }
    // Commands are applied in order, so the reply follows every join.
    let stats = hub.stats().await.expect("hub stopped");
    assert_eq!(stats.session_count, members);

    (hub, queues)
}
