use anyhow::Result;
use serde_json::Value;
use tokio::io::AsyncBufRead;
use tokio::io::AsyncBufReadExt;
use tokio::task::JoinError;
use tokio::task::JoinSet;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::broadcast::Broadcast;
use crate::errors::Error;
use crate::message_handling::handle_message;
use crate::primitives::MessageId;
use crate::primitives::NodeId;
use crate::protocol::Message;
use crate::protocol::Payload;
use crate::protocol::KNOWN_KINDS;
use crate::transport::StdioTransport;

/// A node representing a server
#[derive(Debug)]
pub(crate) struct Node<B> {
    transport: StdioTransport,
    broadcast: B,
}

impl<B: Broadcast + 'static> Node<B> {
    pub(crate) fn new(
        transport: StdioTransport,
        broadcast: B,
    ) -> Self {
        Self {
            transport,
            broadcast,
        }
    }

    /// Reads messages line by line until the input is closed. Init messages
    /// are handled in line so that everything after them sees an initialised
    /// node; every other request is handled on its own task. Returns once the
    /// input is closed and every request has been answered.
    pub(crate) async fn run<I: AsyncBufRead + Unpin>(
        &self,
        input: I,
    ) -> Result<()> {
        let mut lines = input.lines();
        let mut handlers = JoinSet::new();
        loop {
            let line = tokio::select! {
                line = lines.next_line() => line?,
                Some(res) = handlers.join_next(), if !handlers.is_empty() => {
                    log_handler_exit(res);
                    continue;
                }
            };
            let Some(line) = line else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            debug!("Received message. Raw input: {line:?}");
            let msg: Message = match serde_json::from_str(&line) {
                Ok(msg) => msg,
                Err(e) => {
                    self.reject(&line, e);
                    continue;
                }
            };
            let Some(msg) = self.transport.resolve(msg).await else {
                continue;
            };
            info!("Message received from {:?}", msg.src);

            if let Payload::Init { node_id, .. } = &msg.body.payload {
                self.transport.set_node_id(node_id.clone());
                handle_and_reply(msg, &self.broadcast, &self.transport).await;
                continue;
            }
            let broadcast = self.broadcast.clone();
            let transport = self.transport.clone();
            handlers.spawn(async move { handle_and_reply(msg, &broadcast, &transport).await });
        }
        info!("Input closed, waiting for {} request handlers", handlers.len());
        while let Some(res) = handlers.join_next().await {
            log_handler_exit(res);
        }
        Ok(())
    }

    /// Answers a line that could not be parsed with an error, as long as the
    /// sender can be made out.
    fn reject(
        &self,
        line: &str,
        err: serde_json::Error,
    ) {
        warn!("Could not parse message {line:?}: {err}");
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            return;
        };
        let (Some(src), Some(dest)) = (value["src"].as_str(), value["dest"].as_str()) else {
            return;
        };
        let body = &value["body"];
        let msg_id = body["msg_id"].as_u64().map(MessageId::new);
        let e = match body["type"].as_str() {
            Some(kind) if !KNOWN_KINDS.contains(&kind) => Error::Unsupported(kind.to_string()),
            _ => Error::Malformed(err.to_string()),
        };
        let payload = Payload::error(e.code(), e.to_string());
        if let Err(e) = self
            .transport
            .reply_to(&NodeId::from(src), &NodeId::from(dest), msg_id, payload)
        {
            error!("Could not reply to malformed message: {e}");
        }
    }
}

fn log_handler_exit(res: Result<(), JoinError>) {
    if let Err(e) = res {
        error!("Request handler failed: {e}");
    }
}

async fn handle_and_reply<B: Broadcast>(
    msg: Message,
    broadcast: &B,
    transport: &StdioTransport,
) {
    if let Some(reply) = handle_message(&msg, broadcast).await {
        if let Err(e) = transport.reply(&msg, reply) {
            error!("Could not reply to {}: {e}", msg.src);
        }
    }
}
