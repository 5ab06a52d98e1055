//! Bridge Errors
//!
//! Two families: `BridgeError` for failures of the bridge machinery itself,
//! and `CallError` for the outcome of a single correlated call.

use serde_json::Value;
use std::time::Duration;

use super::envelope::ObjectId;

/// Failures raised by the underlying transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("channel closed")]
    Closed,
    #[error("synchronous round trip is not supported by this transport")]
    SyncUnsupported,
    #[error("transport failure: {0}")]
    Other(String),
}

/// Failures of the binary envelope codec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("binary calls require a binding object id greater than zero")]
    MissingObjectId,
    #[error("binary payload expected, got a structured value")]
    NonBinaryPayload,
    #[error("frame truncated at offset {offset} (need {needed} bytes, have {available})")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("negative length {0} in frame")]
    NegativeLength(i32),
    #[error("negative callback id {0} in frame")]
    InvalidCallbackId(i32),
    #[error("field is not valid UTF-8")]
    InvalidUtf8,
    #[error("object id field `{0}` is not a decimal integer")]
    InvalidObjectId(String),
}

/// Errors surfaced by bridge operations.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("synchronous call `{0}` issued from inside a message handler")]
    SyncInHandler(String),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("bridge has been dropped")]
    Detached,
    #[error("binding object {0} is not live")]
    UnknownObject(ObjectId),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Outcome of a correlated call that did not succeed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    /// The native side reported a failure. The payload is passed through
    /// uninterpreted.
    #[error("native call failed: {0}")]
    Remote(Value),
    #[error("call timed out after {0:?}")]
    TimedOut(Duration),
    /// The continuation was dropped without being completed.
    #[error("call abandoned before a reply arrived")]
    Abandoned,
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("failed to send call: {0}")]
    SendFailed(String),
    #[error("reply kind does not match the call")]
    UnexpectedReply,
    #[error("reply has an unexpected shape: {0}")]
    InvalidReply(String),
}

impl CallError {
    /// Native error payload, if this is a remote failure.
    pub fn remote_payload(&self) -> Option<&Value> {
        match self {
            CallError::Remote(value) => Some(value),
            _ => None,
        }
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
