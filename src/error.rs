use thiserror::Error;

use crate::protocol::{RemoteClientId, RequestId};

/// Failures of the byte transport under the signaling client.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("transport channel closed")]
    ChannelClosed,
    #[error("transport timed out")]
    Timeout,
}

/// Failures sealing or opening an encrypted signaling payload.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SealError {
    #[error("sealed payload too short to carry a nonce")]
    Truncated,
    #[error("aead failure: wrong key or corrupted payload")]
    Aead,
    #[error("invalid hex payload: {0}")]
    Hex(String),
    #[error("message key derivation failed")]
    KeyDerivation,
}

/// Failures interpreting relay wire messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed wire message: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Seal(#[from] SealError),
    #[error("payload does not decode as a {0} primitive")]
    PayloadMismatch(&'static str),
}

#[derive(Debug, Error)]
pub enum SignalingError {
    /// The relay reported that the target client is not connected.
    #[error("no remote client to talk to: {0}")]
    NoRemoteClientToTalkTo(RemoteClientId),
    /// The relay rejected the request as invalid.
    #[error("relay rejected request {0}")]
    RequestRejected(RequestId),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Failures surfaced by a peer connection port implementation.
#[derive(Debug, Error)]
pub enum PortError {
    #[error("peer connection setup failed: {0}")]
    Setup(String),
    #[error("sdp operation failed: {0}")]
    Sdp(String),
    #[error("ice candidate rejected: {0}")]
    Ice(String),
    #[error("data channel failure: {0}")]
    DataChannel(String),
    #[error("peer connection closed")]
    Closed,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("message too large to chunk: {0} bytes")]
    MessageTooLarge(usize),
    #[error("chunk frame too large: {0} bytes")]
    ChunkTooLarge(usize),
    #[error("malformed chunk frame: {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Error)]
pub enum DataChannelError {
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error(transparent)]
    Port(#[from] PortError),
    #[error("data channel closed")]
    Closed,
}

/// Reasons a single negotiation ends without a peer connection client.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error(transparent)]
    Port(#[from] PortError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("signaling events ended before negotiation completed")]
    SignalingClosed,
    #[error("negotiation timed out")]
    Timeout,
}

/// Terminal failure emitted on the negotiation results stream. Carries the
/// client id so callers can tell which peer the failure belongs to.
#[derive(Debug, Error)]
#[error("failed to create peer connection with {remote_client_id}: {source}")]
pub struct FailedToCreatePeerConnectionError {
    pub remote_client_id: RemoteClientId,
    #[source]
    pub source: NegotiationError,
}
