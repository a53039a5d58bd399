use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Identifies a node in the cluster, e.g. `n1`, or a client, e.g. `c3`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub(crate) struct NodeId(String);

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for NodeId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The value a client asks to be broadcast. Equal values are the same logical
/// message no matter which node they arrive from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub(crate) struct BroadcastMessage(i64);

impl BroadcastMessage {
    pub(crate) fn new(value: i64) -> Self {
        Self(value)
    }
}

/// The protocol level id of a request, used to correlate replies.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub(crate) struct MessageId(u64);

impl MessageId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }
}
