//! Peer connection port: the seam between negotiation logic and the WebRTC
//! engine. The negotiator only ever talks to these traits, so everything
//! above this line is testable without an engine.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use crate::error::PortError;
use crate::protocol::{IceCandidate, RemoteClientId, Sdp};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: Sdp,
}

impl SessionDescription {
    pub fn offer(sdp: Sdp) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp,
        }
    }

    pub fn answer(sdp: Sdp) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp,
        }
    }
}

/// Reliable ordered message pipe a port hands out once the data channel is
/// negotiated. Raw frames only; chunking lives above this.
#[async_trait]
pub trait DataChannelHandle: Send + Sync {
    async fn send(&self, frame: Bytes) -> Result<(), PortError>;
    /// The inbound frame stream. Single consumer; `None` after the first
    /// call.
    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<Bytes>>;
    async fn close(&self);
}

/// One peer connection, reduced to the operations negotiation needs.
///
/// Event subscriptions are broadcast receivers: subscribe before invoking
/// the operation that makes the event fire.
#[async_trait]
pub trait PeerConnectionPort: Send + Sync {
    async fn create_data_channel(&self) -> Result<Arc<dyn DataChannelHandle>, PortError>;
    async fn create_local_offer(&self) -> Result<Sdp, PortError>;
    async fn create_local_answer(&self) -> Result<Sdp, PortError>;
    async fn set_local_description(&self, description: SessionDescription)
    -> Result<(), PortError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PortError>;
    async fn add_remote_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PortError>;
    async fn close(&self);

    fn negotiation_needed(&self) -> broadcast::Receiver<()>;
    fn ice_connection_states(&self) -> broadcast::Receiver<IceConnectionState>;
    fn generated_ice_candidates(&self) -> broadcast::Receiver<IceCandidate>;
    fn signaling_states(&self) -> broadcast::Receiver<SignalingState>;
}

#[async_trait]
pub trait PeerConnectionPortFactory: Send + Sync {
    async fn make_port(
        &self,
        remote_client_id: &RemoteClientId,
    ) -> Result<Arc<dyn PeerConnectionPort>, PortError>;
}
