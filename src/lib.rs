//! Peer connection negotiation over an encrypted signaling relay.
//!
//! The relay only routes opaque envelopes between client ids; SDP and ICE
//! payloads are sealed end to end with a pre-shared connection key. On top
//! of that sit a multiplexed [`signaling::SignalingClient`], the
//! [`negotiator::PeerConnectionNegotiator`] driving any number of
//! concurrent negotiations, and one [`PeerConnectionClient`] per peer
//! carrying chunked messages over a WebRTC data channel.

pub mod chunking;
pub mod data_channel;
pub mod error;
pub mod negotiator;
pub mod peer_connection;
pub mod port;
pub mod protocol;
pub mod sealbox;
pub mod signaling;
pub mod transport;
pub mod webrtc_port;

pub use error::{
    ChunkError, DataChannelError, FailedToCreatePeerConnectionError, NegotiationError,
    PortError, ProtocolError, SealError, SignalingError, TransportError,
};
pub use negotiator::{NegotiationResult, NegotiatorConfig, PeerConnectionNegotiator};
pub use peer_connection::PeerConnectionClient;
pub use protocol::{RemoteClientId, RequestId, Sdp};
pub use sealbox::EncryptionKey;
pub use signaling::SignalingClient;
pub use transport::WebSocketTransport;
pub use webrtc_port::{WebRtcConfig, WebRtcPortFactory};
