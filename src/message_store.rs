use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::primitives::BroadcastMessage;

/// Stores every broadcast message this node has ever seen. The store only
/// grows: a message that was recorded once stays recorded.
#[derive(Debug)]
pub(crate) struct MessageStore {
    node_broadcast_msgs: HashSet<BroadcastMessage>,
}

impl MessageStore {
    pub(crate) fn new() -> Self {
        Self {
            node_broadcast_msgs: HashSet::with_capacity(1024),
        }
    }

    /// Records a [BroadcastMessage], returning `true` if it had not been seen
    /// before.
    pub(crate) fn record(
        &mut self,
        broadcast_msg: BroadcastMessage,
    ) -> bool {
        self.node_broadcast_msgs.insert(broadcast_msg)
    }

    /// Records all given messages and returns the ones that were new, in the
    /// order they were given. Repeats within `broadcast_msgs` count once.
    pub(crate) fn record_all(
        &mut self,
        broadcast_msgs: impl IntoIterator<Item = BroadcastMessage>,
    ) -> Vec<BroadcastMessage> {
        broadcast_msgs
            .into_iter()
            .filter(|msg| self.node_broadcast_msgs.insert(*msg))
            .collect()
    }

    /// Gets all broadcast messages this node has stored, in no particular
    /// order.
    pub(crate) fn msgs(&self) -> Vec<BroadcastMessage> {
        self.node_broadcast_msgs.iter().copied().collect()
    }
}

/// A shareable handle to a [MessageStore]. Each operation takes the lock
/// once, so a check-and-insert can never interleave with another caller.
#[derive(Debug, Clone)]
pub(crate) struct MessageStoreHandle {
    inner: Arc<RwLock<MessageStore>>,
}

impl MessageStoreHandle {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(MessageStore::new())),
        }
    }

    pub(crate) async fn record(
        &self,
        broadcast_msg: BroadcastMessage,
    ) -> bool {
        self.inner.write().await.record(broadcast_msg)
    }

    pub(crate) async fn record_all(
        &self,
        broadcast_msgs: impl IntoIterator<Item = BroadcastMessage>,
    ) -> Vec<BroadcastMessage> {
        self.inner.write().await.record_all(broadcast_msgs)
    }

    /// A point-in-time copy of all stored messages.
    pub(crate) async fn snapshot(&self) -> Vec<BroadcastMessage> {
        self.inner.read().await.msgs()
    }
}
