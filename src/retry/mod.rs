pub(crate) mod policy;

use std::collections::HashMap;
use std::collections::HashSet;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use tokio::sync::Mutex;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::debug;
use tracing::instrument;
use tracing::warn;

use crate::errors::RpcError;
use crate::primitives::BroadcastMessage;
use crate::primitives::NodeId;
use crate::protocol::Payload;
use crate::retry::policy::RetryPolicy;
use crate::transport::Rpc;

/// Delivers batches to peers, retrying until each batch is acknowledged.
///
/// Every destination gets one delivery lane with a single worker task. A batch
/// that arrives while the lane is busy is merged into the lane's pending set
/// and goes out with the next delivery, so a partitioned peer costs one task
/// and at most one copy of each message.
#[derive(Debug)]
pub(crate) struct DeliveryRetrier<R, P> {
    rpc: Arc<R>,
    policy: P,
    timeout: Duration,
    lanes: Mutex<HashMap<NodeId, Arc<Lane>>>,
}

#[derive(Debug, Default)]
struct Lane {
    pending: Mutex<HashSet<BroadcastMessage>>,
    notify: Notify,
}

impl<R, P> DeliveryRetrier<R, P>
where
    R: Rpc,
    P: RetryPolicy + Copy + Send + Sync + 'static,
{
    pub(crate) fn new(
        rpc: R,
        policy: P,
        timeout: Duration,
    ) -> Self {
        Self {
            rpc: Arc::new(rpc),
            policy,
            timeout,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    /// Schedules `messages` for delivery to `dest` and returns right away.
    pub(crate) async fn deliver(
        &self,
        dest: NodeId,
        messages: Vec<BroadcastMessage>,
    ) {
        if messages.is_empty() {
            return;
        }
        let lane = {
            let mut lanes = self.lanes.lock().await;
            match lanes.get(&dest) {
                Some(lane) => lane.clone(),
                None => {
                    let lane = Arc::new(Lane::default());
                    lanes.insert(dest.clone(), lane.clone());
                    tokio::spawn(run_lane(
                        dest,
                        lane.clone(),
                        self.rpc.clone(),
                        self.policy,
                        self.timeout,
                    ));
                    lane
                }
            }
        };
        lane.pending.lock().await.extend(messages);
        lane.notify.notify_one();
    }
}

async fn run_lane<R: Rpc, P: RetryPolicy>(
    dest: NodeId,
    lane: Arc<Lane>,
    rpc: Arc<R>,
    policy: P,
    timeout: Duration,
) {
    debug!("Running delivery lane to {dest}");
    loop {
        lane.notify.notified().await;
        let batch = mem::take(&mut *lane.pending.lock().await);
        if batch.is_empty() {
            continue;
        }
        let messages = batch.into_iter().sorted().collect_vec();
        let n_msgs = messages.len();
        let attempts = deliver_until_acked(rpc.as_ref(), &policy, &dest, messages, timeout).await;
        debug!("Delivered {n_msgs} messages to {dest} after {attempts} attempts");
    }
}

/// Sends one batch to `dest` until it is acknowledged, sleeping according to
/// `policy` between attempts. Returns the number of attempts made.
#[instrument(skip(rpc, policy, messages), fields(n_msgs = messages.len()))]
pub(crate) async fn deliver_until_acked<R: Rpc + ?Sized, P: RetryPolicy>(
    rpc: &R,
    policy: &P,
    dest: &NodeId,
    messages: Vec<BroadcastMessage>,
    timeout: Duration,
) -> u32 {
    let mut attempts = 0;
    loop {
        attempts += 1;
        let payload = Payload::BroadcastInternal {
            messages: messages.clone(),
        };
        let err = match rpc.rpc(dest, payload, timeout).await {
            Ok(Payload::BroadcastInternalOk) => return attempts,
            Ok(Payload::Error { code, text }) => RpcError::Remote {
                node: dest.clone(),
                code,
                text,
            },
            Ok(other) => RpcError::UnexpectedReply(other.kind()),
            Err(e) => e,
        };
        let delay = policy.delay(attempts);
        warn!("Delivery attempt {attempts} to {dest} failed, retrying in {delay:?}: {err}");
        sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::*;
    use crate::protocol::ErrorCode;
    use crate::retry::policy::ExponentialBackOff;

    /// Fails the first `failures` calls in different ways, then acknowledges.
    #[derive(Debug, Default)]
    struct FlakyRpc {
        failures: u32,
        calls: std::sync::Mutex<Vec<(Instant, Vec<BroadcastMessage>)>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        n_calls: AtomicU32,
    }

    impl FlakyRpc {
        fn failing(failures: u32) -> Self {
            Self {
                failures,
                ..Default::default()
            }
        }

        fn delivered(&self) -> Vec<BroadcastMessage> {
            let calls = self.calls.lock().unwrap();
            let n_calls = calls.len();
            calls
                .iter()
                .skip(self.failures.min(n_calls as u32) as usize)
                .flat_map(|(_, msgs)| msgs.iter().copied())
                .sorted()
                .collect()
        }
    }

    #[async_trait]
    impl Rpc for FlakyRpc {
        async fn rpc(
            &self,
            dest: &NodeId,
            payload: Payload,
            _timeout: Duration,
        ) -> Result<Payload, RpcError> {
            let messages = match payload {
                Payload::BroadcastInternal { messages } => messages,
                other => return Err(RpcError::UnexpectedReply(other.kind())),
            };
            let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
            self.calls.lock().unwrap().push((Instant::now(), messages));
            // Give other deliveries a chance to overlap with this one.
            sleep(Duration::from_millis(1)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let n = self.n_calls.fetch_add(1, Ordering::SeqCst);
            if n >= self.failures {
                return Ok(Payload::BroadcastInternalOk);
            }
            match n % 3 {
                0 => Err(RpcError::Timeout(dest.clone())),
                1 => Ok(Payload::error(ErrorCode::Crash, "boom")),
                _ => Ok(Payload::Read),
            }
        }
    }

    fn msgs(values: &[i64]) -> Vec<BroadcastMessage> {
        values.iter().copied().map(BroadcastMessage::new).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_retries_until_acked_with_backoff() {
        let rpc = FlakyRpc::failing(11);
        let policy = ExponentialBackOff::default();

        let attempts = deliver_until_acked(
            &rpc,
            &policy,
            &"n2".into(),
            msgs(&[1, 2]),
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(attempts, 12);

        let calls = rpc.calls.lock().unwrap();
        assert_eq!(calls.len(), 12);
        for (i, window) in calls.windows(2).enumerate() {
            let n_failures = i as u32 + 1;
            let gap = window[1].0 - window[0].0;
            assert!(
                gap >= policy.backoff(n_failures),
                "gap {gap:?} after {n_failures} failures is shorter than the backoff"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_delivery_takes_one_attempt() {
        let rpc = FlakyRpc::failing(0);
        let attempts = deliver_until_acked(
            &rpc,
            &ExponentialBackOff::default(),
            &"n2".into(),
            msgs(&[1]),
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lane_merges_batches_and_delivers_one_at_a_time() {
        let retrier = DeliveryRetrier::new(
            FlakyRpc::failing(5),
            ExponentialBackOff::default(),
            Duration::from_secs(1),
        );
        retrier.deliver("n2".into(), msgs(&[1, 2])).await;
        sleep(Duration::from_millis(2)).await;
        retrier.deliver("n2".into(), msgs(&[3])).await;
        retrier.deliver("n2".into(), msgs(&[2, 4])).await;
        retrier.deliver("n2".into(), vec![]).await;

        sleep(Duration::from_secs(10)).await;

        let rpc = retrier.rpc.clone();
        assert_eq!(rpc.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(rpc.delivered(), msgs(&[1, 2, 2, 3, 4]));
        // One batch retried until acknowledged, then one merged batch.
        assert_eq!(rpc.calls.lock().unwrap().len(), 7);
    }
}
