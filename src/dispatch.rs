use std::collections::HashMap;
use std::collections::HashSet;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::warn;

use crate::primitives::BroadcastMessage;
use crate::primitives::NodeId;

/// All messages queued for one peer since the previous flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FlushEvent {
    pub dest: NodeId,
    pub messages: Vec<BroadcastMessage>,
}

/// A handle for queueing broadcast messages per destination. Queued messages
/// leave in batches, see [BatchDispatchHandle::spawn_flush_timer].
#[derive(Debug, Clone)]
pub(crate) struct BatchDispatchHandle {
    pending: Arc<Mutex<HashMap<NodeId, HashSet<BroadcastMessage>>>>,
}

impl BatchDispatchHandle {
    pub(crate) fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::with_capacity(32))),
        }
    }

    /// Queues `msg` for `dest`. Queueing the same message twice before a
    /// flush sends it once.
    pub(crate) async fn enqueue(
        &self,
        dest: NodeId,
        msg: BroadcastMessage,
    ) {
        self.pending.lock().await.entry(dest).or_default().insert(msg);
    }

    /// Takes every non-empty batch out of the dispatcher.
    pub(crate) async fn flush(&self) -> Vec<FlushEvent> {
        let batches = mem::take(&mut *self.pending.lock().await);
        batches
            .into_iter()
            .filter(|(_, msgs)| !msgs.is_empty())
            .map(|(dest, msgs)| FlushEvent {
                dest,
                messages: msgs.into_iter().sorted().collect(),
            })
            .collect()
    }

    /// Flushes every `period` into `flush_tx` until the returned timer is
    /// stopped.
    pub(crate) fn spawn_flush_timer(
        &self,
        period: Duration,
        flush_tx: Sender<FlushEvent>,
    ) -> FlushTimer {
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_flush_timer(self.clone(), period, flush_tx, stop_rx));
        FlushTimer {
            stop_tx: Some(stop_tx),
            task,
        }
    }
}

/// The running periodic flush.
#[derive(Debug)]
pub(crate) struct FlushTimer {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl FlushTimer {
    /// Stops flushing. The flush channel is closed once this returns, so
    /// consumers see the end of the stream instead of waiting forever.
    pub(crate) async fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!("Flush timer ended abnormally: {e:?}");
        }
    }
}

async fn run_flush_timer(
    dispatch: BatchDispatchHandle,
    period: Duration,
    flush_tx: Sender<FlushEvent>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    debug!("Running flush timer every {period:?}");
    let mut interval = interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;
    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            _ = interval.tick() => {
                for event in dispatch.flush().await {
                    debug!("Flushing {} messages to {}", event.messages.len(), event.dest);
                    if flush_tx.send(event).await.is_err() {
                        warn!("Flush receiver is gone, stopping flush timer");
                        return;
                    }
                }
            }
        }
    }
    debug!("Flush timer stopped");
}
