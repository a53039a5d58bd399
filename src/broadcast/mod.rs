use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc::channel;
use tokio::sync::mpsc::Receiver;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use crate::config::Config;
use crate::dispatch::BatchDispatchHandle;
use crate::dispatch::FlushEvent;
use crate::dispatch::FlushTimer;
use crate::errors::Error;
use crate::message_store::MessageStoreHandle;
use crate::primitives::BroadcastMessage;
use crate::primitives::NodeId;
use crate::retry::policy::ExponentialBackOff;
use crate::retry::DeliveryRetrier;
use crate::transport::Rpc;

pub(crate) mod gossip;

use gossip::GossipHandle;

// Flushed batches waiting to be handed to their delivery lane
const FLUSH_QUEUE_CAPACITY: usize = 1024;

/// Broadcast messages to other nodes in the network.
#[async_trait]
pub(crate) trait Broadcast: Send + Sync + Clone {
    /// Sets this node's id. Everything else fails until this has happened.
    async fn init(
        &self,
        node_id: NodeId,
        node_ids: Vec<NodeId>,
    ) -> Result<(), Error>;

    /// Update the topology
    async fn update_topology(
        &self,
        topology: HashMap<NodeId, Vec<NodeId>>,
    ) -> Result<(), Error>;

    /// Broadcast a message a client sent us. Returns the nodes it was queued
    /// for, which is nobody if the message was already known.
    async fn broadcast(
        &self,
        msg: BroadcastMessage,
    ) -> Result<Vec<NodeId>, Error>;

    /// Take in a batch from a peer. Returns the messages that were new.
    async fn receive(
        &self,
        sender: &NodeId,
        msgs: Vec<BroadcastMessage>,
    ) -> Result<Vec<BroadcastMessage>, Error>;

    /// Get this node's broadcast messages
    async fn messages(&self) -> Result<Vec<BroadcastMessage>, Error>;
}

/// Gossip together with the background tasks that move its batches to peers.
#[derive(Debug)]
pub(crate) struct BroadcastService {
    gossip: GossipHandle,
    flush_timer: FlushTimer,
    deliveries: JoinHandle<()>,
}

impl BroadcastService {
    pub(crate) fn start<R: Rpc>(
        config: &Config,
        rpc: R,
    ) -> Self {
        let msg_dispatch = BatchDispatchHandle::new();
        let (flush_tx, flush_rx) = channel(FLUSH_QUEUE_CAPACITY);
        let flush_timer = msg_dispatch.spawn_flush_timer(config.flush_interval, flush_tx);
        let retrier = DeliveryRetrier::new(rpc, config.backoff, config.rpc_timeout);
        let deliveries = tokio::spawn(forward_flushes(flush_rx, retrier));
        let gossip = GossipHandle::new(
            MessageStoreHandle::new(),
            msg_dispatch,
            config.topology,
            config.leader.clone(),
        );
        Self {
            gossip,
            flush_timer,
            deliveries,
        }
    }

    pub(crate) fn gossip(&self) -> GossipHandle {
        self.gossip.clone()
    }

    /// Stops the flush timer, then waits for the flush channel to drain.
    /// Deliveries still being retried are abandoned.
    pub(crate) async fn shutdown(self) {
        self.flush_timer.stop().await;
        if let Err(e) = self.deliveries.await {
            warn!("Delivery forwarding ended abnormally: {e:?}");
        }
        debug!("Broadcast service stopped");
    }
}

async fn forward_flushes<R: Rpc>(
    mut flush_rx: Receiver<FlushEvent>,
    retrier: DeliveryRetrier<R, ExponentialBackOff>,
) {
    while let Some(event) = flush_rx.recv().await {
        retrier.deliver(event.dest, event.messages).await;
    }
    debug!("Flush channel closed");
}
