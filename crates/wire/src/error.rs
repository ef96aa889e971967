//! Error types shared by both ends of the link.

use thiserror::Error;

/// A frame that cannot be interpreted as a protocol envelope.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("envelope is not a JSON object")]
    NotAnObject,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid peer address '{0}': expected 16 hex digits")]
pub struct PeerParseError(pub String);
