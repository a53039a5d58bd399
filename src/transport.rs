use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::errors::RpcError;
use crate::primitives::MessageId;
use crate::primitives::NodeId;
use crate::protocol::Body;
use crate::protocol::Message;
use crate::protocol::Payload;

/// A request/response exchange with another node.
#[async_trait]
pub(crate) trait Rpc: Send + Sync + 'static {
    /// Sends `payload` to `dest` and waits at most `timeout` for the reply.
    async fn rpc(
        &self,
        dest: &NodeId,
        payload: Payload,
        timeout: Duration,
    ) -> Result<Payload, RpcError>;
}

/// Sends messages as JSON lines through a single writer task and correlates
/// replies with the requests that are waiting for them.
#[derive(Debug, Clone)]
pub(crate) struct StdioTransport {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    node_id: OnceCell<NodeId>,
    // Counter for message ids, monotonically increasing
    msg_counter: AtomicU64,
    pending_replies: Mutex<HashMap<MessageId, oneshot::Sender<Body>>>,
    outbound: UnboundedSender<Message>,
}

impl StdioTransport {
    /// Creates a new transport. Everything it sends ends up in the returned
    /// receiver, see [write_messages].
    pub(crate) fn new() -> (Self, UnboundedReceiver<Message>) {
        let (outbound, rx) = unbounded_channel();
        let inner = Inner {
            node_id: OnceCell::new(),
            msg_counter: AtomicU64::new(0),
            pending_replies: Mutex::new(HashMap::new()),
            outbound,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// Sets the id this node sends its own requests from.
    pub(crate) fn set_node_id(
        &self,
        node_id: NodeId,
    ) {
        if let Err(node_id) = self.inner.node_id.set(node_id) {
            debug!("Transport already has a node id, ignoring {node_id}");
        }
    }

    fn next_message_id(&self) -> MessageId {
        MessageId::new(self.inner.msg_counter.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn node_id(&self) -> Result<&NodeId, RpcError> {
        self.inner.node_id.get().ok_or(RpcError::NoNodeId)
    }

    fn enqueue(
        &self,
        msg: Message,
    ) -> Result<()> {
        self.inner
            .outbound
            .send(msg)
            .map_err(|_| anyhow!("outbound message queue is closed"))
    }

    /// Replies to `request`. Requests without a message id expect no reply
    /// and are skipped.
    pub(crate) fn reply(
        &self,
        request: &Message,
        payload: Payload,
    ) -> Result<()> {
        self.reply_to(&request.src, &request.dest, request.id(), payload)
    }

    /// Replies to a request from `requester` that was addressed to
    /// `addressee`.
    pub(crate) fn reply_to(
        &self,
        requester: &NodeId,
        addressee: &NodeId,
        in_reply_to: Option<MessageId>,
        payload: Payload,
    ) -> Result<()> {
        let Some(in_reply_to) = in_reply_to else {
            debug!("Not replying to {requester}, the request has no message id");
            return Ok(());
        };
        self.enqueue(Message {
            src: addressee.clone(),
            dest: requester.clone(),
            body: Body {
                msg_id: Some(self.next_message_id()),
                in_reply_to: Some(in_reply_to),
                payload,
            },
        })
    }

    /// Hands a reply to the request waiting for it. Returns the message back
    /// if nothing is waiting for it.
    pub(crate) async fn resolve(
        &self,
        msg: Message,
    ) -> Option<Message> {
        let Some(in_reply_to) = msg.body.in_reply_to else {
            return Some(msg);
        };
        let waiting = self.inner.pending_replies.lock().await.remove(&in_reply_to);
        match waiting {
            Some(tx) => {
                // The requester may have timed out in the meantime.
                let _ = tx.send(msg.body);
                None
            }
            None => Some(msg),
        }
    }
}

#[async_trait]
impl Rpc for StdioTransport {
    async fn rpc(
        &self,
        dest: &NodeId,
        payload: Payload,
        timeout: Duration,
    ) -> Result<Payload, RpcError> {
        let msg_id = self.next_message_id();
        let msg = Message {
            src: self.node_id()?.clone(),
            dest: dest.clone(),
            body: Body {
                msg_id: Some(msg_id),
                in_reply_to: None,
                payload,
            },
        };

        let (tx, rx) = oneshot::channel();
        self.inner.pending_replies.lock().await.insert(msg_id, tx);
        if self.enqueue(msg).is_err() {
            self.inner.pending_replies.lock().await.remove(&msg_id);
            return Err(RpcError::Closed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(body)) => Ok(body.payload),
            Ok(Err(_)) => Err(RpcError::Closed),
            Err(_) => {
                self.inner.pending_replies.lock().await.remove(&msg_id);
                Err(RpcError::Timeout(dest.clone()))
            }
        }
    }
}

/// Serialises messages one line at a time until every sender is gone or
/// `stop` fires. Once stopped, messages that are already queued are still
/// written but no new ones are accepted.
pub(crate) async fn write_messages<W: AsyncWrite + Unpin>(
    mut outbound: UnboundedReceiver<Message>,
    mut writer: W,
    mut stop: oneshot::Receiver<()>,
) -> Result<()> {
    let mut stopping = false;
    loop {
        let msg = tokio::select! {
            msg = outbound.recv() => msg,
            _ = &mut stop, if !stopping => {
                debug!("Draining outbound message queue");
                outbound.close();
                stopping = true;
                continue;
            }
        };
        let Some(msg) = msg else {
            break;
        };
        write_line(&mut writer, &msg).await?;
    }
    if stopping {
        info!("Outbound message queue drained");
    } else {
        warn!("Outbound message queue closed");
    }
    Ok(())
}

async fn write_line<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Message,
) -> Result<()> {
    let mut line = match serde_json::to_vec(msg) {
        Ok(line) => line,
        Err(e) => {
            error!("Could not serialize message {msg:?}: {e}");
            return Ok(());
        }
    };
    line.push(b'\n');
    debug!("Sending {} message from {} to {}", msg.body.payload.kind(), msg.src, msg.dest);
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::BroadcastMessage;

    fn request(
        src: &str,
        dest: &str,
        msg_id: u64,
        payload: Payload,
    ) -> Message {
        Message {
            src: src.into(),
            dest: dest.into(),
            body: Body {
                msg_id: Some(MessageId::new(msg_id)),
                in_reply_to: None,
                payload,
            },
        }
    }

    #[tokio::test]
    async fn test_reply_swaps_src_and_dest() {
        let (transport, mut rx) = StdioTransport::new();
        let req = request("c1", "n1", 7, Payload::Read);

        transport.reply(&req, Payload::ReadOk { messages: vec![] }).unwrap();

        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.src, NodeId::from("n1"));
        assert_eq!(sent.dest, NodeId::from("c1"));
        assert_eq!(sent.body.in_reply_to, Some(MessageId::new(7)));
        assert_eq!(sent.body.payload, Payload::ReadOk { messages: vec![] });
    }

    #[tokio::test]
    async fn test_rpc_completes_with_matching_reply() {
        let (transport, mut rx) = StdioTransport::new();
        transport.set_node_id("n1".into());

        let caller = transport.clone();
        let call = tokio::spawn(async move {
            caller
                .rpc(
                    &"n2".into(),
                    Payload::BroadcastInternal {
                        messages: vec![BroadcastMessage::new(1)],
                    },
                    Duration::from_secs(5),
                )
                .await
        });

        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.dest, NodeId::from("n2"));
        let reply = Message {
            src: "n2".into(),
            dest: "n1".into(),
            body: Body {
                msg_id: Some(MessageId::new(1)),
                in_reply_to: sent.id(),
                payload: Payload::BroadcastInternalOk,
            },
        };
        assert!(transport.resolve(reply).await.is_none());
        assert_eq!(call.await.unwrap().unwrap(), Payload::BroadcastInternalOk);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rpc_times_out_and_forgets_the_request() {
        let (transport, mut rx) = StdioTransport::new();
        transport.set_node_id("n1".into());

        let res = transport
            .rpc(&"n2".into(), Payload::Read, Duration::from_millis(100))
            .await;
        assert!(matches!(res, Err(RpcError::Timeout(_))));

        // A late reply is no longer routed to anyone.
        let sent = rx.recv().await.unwrap();
        let late = Message {
            src: "n2".into(),
            dest: "n1".into(),
            body: Body {
                msg_id: None,
                in_reply_to: sent.id(),
                payload: Payload::ReadOk { messages: vec![] },
            },
        };
        assert!(transport.resolve(late).await.is_some());
    }

    #[tokio::test]
    async fn test_written_messages_are_json_lines() {
        let (transport, rx) = StdioTransport::new();
        let req = request("c1", "n1", 1, Payload::Broadcast {
            message: BroadcastMessage::new(5),
        });
        transport.reply(&req, Payload::BroadcastOk).unwrap();
        drop(transport);

        let (_stop_tx, stop) = oneshot::channel();
        let mut out = Vec::new();
        write_messages(rx, &mut out, stop).await.unwrap();

        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 1);
        let value: serde_json::Value = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(value["body"]["type"], "broadcast_ok");
        assert_eq!(value["body"]["in_reply_to"], 1);
    }

    #[tokio::test]
    async fn test_stopped_writer_drains_queue_while_senders_are_alive() {
        let (transport, rx) = StdioTransport::new();
        // Outlives the writer, like the retry lanes holding the transport.
        let lane = transport.clone();
        for msg_id in 1..=3 {
            let req = request("c1", "n1", msg_id, Payload::Read);
            transport.reply(&req, Payload::ReadOk { messages: vec![] }).unwrap();
        }

        let (stop_tx, stop) = oneshot::channel();
        stop_tx.send(()).unwrap();
        let mut out = Vec::new();
        write_messages(rx, &mut out, stop).await.unwrap();

        let text = String::from_utf8(out).unwrap();
        let replied_to: Vec<_> = text
            .lines()
            .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap())
            .map(|value| value["body"]["in_reply_to"].as_u64().unwrap())
            .collect();
        assert_eq!(replied_to, vec![1, 2, 3]);

        // Nothing is accepted after the queue is drained.
        let req = request("c1", "n1", 4, Payload::Read);
        assert!(lane.reply(&req, Payload::ReadOk { messages: vec![] }).is_err());
    }

    #[tokio::test]
    async fn test_running_writer_finishes_after_stop() {
        let (transport, rx) = StdioTransport::new();
        let (stop_tx, stop) = oneshot::channel();
        let (mut reader, out) = tokio::io::duplex(1024);
        let writer = tokio::spawn(write_messages(rx, out, stop));

        let req = request("c1", "n1", 1, Payload::Read);
        transport.reply(&req, Payload::ReadOk { messages: vec![] }).unwrap();
        stop_tx.send(()).unwrap();
        writer.await.unwrap().unwrap();

        let mut text = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut reader, &mut text)
            .await
            .unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.contains("read_ok"));
    }
}
