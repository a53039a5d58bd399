use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

use crate::primitives::BroadcastMessage;
use crate::primitives::MessageId;
use crate::primitives::NodeId;

/// A message as it travels over the wire, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Message {
    pub src: NodeId,
    pub dest: NodeId,
    pub body: Body,
}

impl Message {
    /// The id of this message if it was sent as a request.
    pub(crate) fn id(&self) -> Option<MessageId> {
        self.body.msg_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Body {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<MessageId>,
    #[serde(flatten)]
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub(crate) enum Payload {
    Init {
        node_id: NodeId,
        node_ids: Vec<NodeId>,
    },
    InitOk,
    Topology {
        topology: HashMap<NodeId, Vec<NodeId>>,
    },
    TopologyOk,
    Broadcast {
        message: BroadcastMessage,
    },
    BroadcastOk,
    BroadcastInternal {
        messages: Vec<BroadcastMessage>,
    },
    BroadcastInternalOk,
    Read,
    ReadOk {
        messages: Vec<BroadcastMessage>,
    },
    Error {
        code: ErrorCode,
        text: String,
    },
}

/// Every message type this node understands.
pub(crate) const KNOWN_KINDS: [&str; 11] = [
    "init",
    "init_ok",
    "topology",
    "topology_ok",
    "broadcast",
    "broadcast_ok",
    "broadcast_internal",
    "broadcast_internal_ok",
    "read",
    "read_ok",
    "error",
];

impl Payload {
    /// The wire name of this payload.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Payload::Init { .. } => "init",
            Payload::InitOk => "init_ok",
            Payload::Topology { .. } => "topology",
            Payload::TopologyOk => "topology_ok",
            Payload::Broadcast { .. } => "broadcast",
            Payload::BroadcastOk => "broadcast_ok",
            Payload::BroadcastInternal { .. } => "broadcast_internal",
            Payload::BroadcastInternalOk => "broadcast_internal_ok",
            Payload::Read => "read",
            Payload::ReadOk { .. } => "read_ok",
            Payload::Error { .. } => "error",
        }
    }

    pub(crate) fn error(
        code: ErrorCode,
        text: impl Into<String>,
    ) -> Self {
        Payload::Error {
            code,
            text: text.into(),
        }
    }
}

/// Maelstrom error codes. Unknown codes are kept as they are.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub(crate) enum ErrorCode {
    Timeout,
    NotSupported,
    TemporarilyUnavailable,
    MalformedRequest,
    Crash,
    Abort,
    Other(u32),
}

impl From<u32> for ErrorCode {
    fn from(code: u32) -> Self {
        match code {
            0 => ErrorCode::Timeout,
            10 => ErrorCode::NotSupported,
            11 => ErrorCode::TemporarilyUnavailable,
            12 => ErrorCode::MalformedRequest,
            13 => ErrorCode::Crash,
            14 => ErrorCode::Abort,
            other => ErrorCode::Other(other),
        }
    }
}

impl From<ErrorCode> for u32 {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::Timeout => 0,
            ErrorCode::NotSupported => 10,
            ErrorCode::TemporarilyUnavailable => 11,
            ErrorCode::MalformedRequest => 12,
            ErrorCode::Crash => 13,
            ErrorCode::Abort => 14,
            ErrorCode::Other(other) => other,
        }
    }
}
