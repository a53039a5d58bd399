use tracing::debug;
use tracing::instrument;
use tracing::warn;

use crate::broadcast::Broadcast;
use crate::protocol::Message;
use crate::protocol::Payload;

/// Handle incoming messages and return the payload of the reply, if any.
/// Failures are turned into error replies.
#[instrument(skip_all, fields(src = %message.src, kind = message.body.payload.kind()))]
pub(crate) async fn handle_message<B: Broadcast>(
    message: &Message,
    broadcast: &B,
) -> Option<Payload> {
    let src = &message.src;
    let res = match &message.body.payload {
        Payload::Init { node_id, node_ids } => {
            debug!("Received Init msg from {src}");
            broadcast
                .init(node_id.clone(), node_ids.clone())
                .await
                .map(|()| Some(Payload::InitOk))
        }
        Payload::Topology { topology } => {
            debug!("Received Topology msg {topology:?} from {src}");
            broadcast
                .update_topology(topology.clone())
                .await
                .map(|()| Some(Payload::TopologyOk))
        }
        Payload::Broadcast { message } => {
            debug!("Received Broadcast msg from {src}");
            // The client is acknowledged no matter how far the message got.
            broadcast
                .broadcast(*message)
                .await
                .map(|_| Some(Payload::BroadcastOk))
        }
        Payload::BroadcastInternal { messages } => {
            debug!("Received {} broadcast messages from {src}", messages.len());
            broadcast
                .receive(src, messages.clone())
                .await
                .map(|_| Some(Payload::BroadcastInternalOk))
        }
        Payload::Read => {
            debug!("Received Read msg from {src}");
            broadcast
                .messages()
                .await
                .map(|messages| Some(Payload::ReadOk { messages }))
        }
        Payload::InitOk
        | Payload::TopologyOk
        | Payload::BroadcastOk
        | Payload::BroadcastInternalOk
        | Payload::ReadOk { .. } => {
            debug!("Received stray acknowledgement from {src}");
            Ok(None)
        }
        Payload::Error { code, text } => {
            warn!("Received error {code:?} from {src}: {text}");
            Ok(None)
        }
    };
    match res {
        Ok(reply) => reply,
        Err(e) => {
            warn!("Could not handle message from {src}: {e}");
            Some(Payload::error(e.code(), e.to_string()))
        }
    }
}
