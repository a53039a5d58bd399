use thiserror::Error;

use crate::primitives::NodeId;
use crate::protocol::ErrorCode;

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("node has not received an init message yet")]
    Uninitialised,
    #[error("node was already initialised as `{0}`")]
    AlreadyInitialised(NodeId),
    #[error("cannot handle message of type `{0}`")]
    Unsupported(String),
    #[error("malformed message: {0}")]
    Malformed(String),
}

impl Error {
    /// The protocol error code a client receives for this error.
    pub(crate) fn code(&self) -> ErrorCode {
        match self {
            Error::Uninitialised => ErrorCode::TemporarilyUnavailable,
            Error::AlreadyInitialised(_) => ErrorCode::MalformedRequest,
            Error::Unsupported(_) => ErrorCode::NotSupported,
            Error::Malformed(_) => ErrorCode::MalformedRequest,
        }
    }
}

/// Reasons a single request/response exchange with a peer did not succeed.
#[derive(Debug, Error)]
pub(crate) enum RpcError {
    #[error("no reply from `{0}` within the timeout")]
    Timeout(NodeId),
    #[error("`{node}` replied with error {code:?}: {text}")]
    Remote {
        node: NodeId,
        code: ErrorCode,
        text: String,
    },
    #[error("unexpected reply of type `{0}`")]
    UnexpectedReply(&'static str),
    #[error("no node id to send from yet")]
    NoNodeId,
    #[error("transport closed")]
    Closed,
}

#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    #[error("environment variable `{name}` has invalid value `{value}`")]
    InvalidValue { name: &'static str, value: String },
}
