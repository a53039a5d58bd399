use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use tokio::sync::RwLock;
use tracing::debug;
use tracing::info;

use crate::broadcast::Broadcast;
use crate::config::TopologyStrategy;
use crate::dispatch::BatchDispatchHandle;
use crate::errors::Error;
use crate::message_store::MessageStoreHandle;
use crate::primitives::BroadcastMessage;
use crate::primitives::NodeId;
use crate::topology::Topology;

/// A handle for interacting with batched gossip.
#[derive(Debug, Clone)]
pub(crate) struct GossipHandle {
    inner: Arc<Gossip>,
}

impl GossipHandle {
    pub(crate) fn new(
        message_store: MessageStoreHandle,
        msg_dispatch: BatchDispatchHandle,
        strategy: TopologyStrategy,
        leader: Option<NodeId>,
    ) -> Self {
        Self {
            inner: Arc::new(Gossip {
                node_id: OnceCell::new(),
                strategy,
                leader,
                topology: RwLock::new(None),
                message_store,
                msg_dispatch,
            }),
        }
    }
}

/// Leader assisted gossip over a fixed topology. A message is passed on at
/// most once per node, the first time the node sees it; that alone stops
/// messages from circling through cyclic topologies.
#[derive(Debug)]
struct Gossip {
    node_id: OnceCell<NodeId>,
    strategy: TopologyStrategy,
    // Configured leader, overriding the default choice
    leader: Option<NodeId>,
    // Set on init, neighbours are filled in by topology messages
    topology: RwLock<Option<Topology>>,
    message_store: MessageStoreHandle,
    msg_dispatch: BatchDispatchHandle,
}

impl Gossip {
    fn node_id(&self) -> Result<&NodeId, Error> {
        self.node_id.get().ok_or(Error::Uninitialised)
    }

    async fn enqueue_all(
        &self,
        targets: &[NodeId],
        msgs: &[BroadcastMessage],
    ) {
        for msg in msgs {
            for target in targets {
                self.msg_dispatch.enqueue(target.clone(), *msg).await;
            }
        }
    }
}

#[async_trait]
impl Broadcast for GossipHandle {
    async fn init(
        &self,
        node_id: NodeId,
        node_ids: Vec<NodeId>,
    ) -> Result<(), Error> {
        if let Err(node_id) = self.inner.node_id.set(node_id) {
            let current = self.inner.node_id()?;
            if *current == node_id {
                debug!("Repeated init for {node_id}");
                return Ok(());
            }
            return Err(Error::AlreadyInitialised(current.clone()));
        }
        let node_id = self.inner.node_id()?.clone();
        let topology = Topology::new(node_id.clone(), &node_ids, self.inner.leader.clone());
        info!(
            "Node id set to {node_id}, leader is {} ({:?})",
            topology.leader_id(),
            topology.role()
        );
        *self.inner.topology.write().await = Some(topology);
        Ok(())
    }

    async fn update_topology(
        &self,
        topology: HashMap<NodeId, Vec<NodeId>>,
    ) -> Result<(), Error> {
        self.inner.node_id()?;
        let mut lock = self.inner.topology.write().await;
        let current = lock.as_mut().ok_or(Error::Uninitialised)?;
        current.assign(topology, self.inner.strategy);
        info!(
            "Using neighbours {:?}, leader {}",
            current.neighbours(),
            current.leader_id()
        );
        Ok(())
    }

    async fn broadcast(
        &self,
        msg: BroadcastMessage,
    ) -> Result<Vec<NodeId>, Error> {
        self.inner.node_id()?;
        if !self.inner.message_store.record(msg).await {
            debug!("Already seen {msg:?}");
            return Ok(Vec::new());
        }
        let targets = self
            .inner
            .topology
            .read()
            .await
            .as_ref()
            .map(Topology::client_fanout)
            .unwrap_or_default();
        self.inner.enqueue_all(&targets, &[msg]).await;
        Ok(targets)
    }

    async fn receive(
        &self,
        sender: &NodeId,
        msgs: Vec<BroadcastMessage>,
    ) -> Result<Vec<BroadcastMessage>, Error> {
        self.inner.node_id()?;
        let n_received = msgs.len();
        let new_msgs = self.inner.message_store.record_all(msgs).await;
        if new_msgs.is_empty() {
            debug!("All {n_received} messages from {sender} already seen");
            return Ok(new_msgs);
        }
        let targets = self
            .inner
            .topology
            .read()
            .await
            .as_ref()
            .map(|topology| topology.peer_fanout(sender))
            .unwrap_or_default();
        debug!(
            "{} of {n_received} messages from {sender} are new, passing them on to {targets:?}",
            new_msgs.len()
        );
        self.inner.enqueue_all(&targets, &new_msgs).await;
        Ok(new_msgs)
    }

    async fn messages(&self) -> Result<Vec<BroadcastMessage>, Error> {
        self.inner.node_id()?;
        Ok(self.inner.message_store.snapshot().await)
    }
}
