//! webrtc-rs backed implementation of the peer connection port.
//!
//! Engine callbacks are bridged into broadcast channels so the negotiator
//! can subscribe with plain receivers instead of registering closures.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use crate::error::PortError;
use crate::port::{
    DataChannelHandle, IceConnectionState, PeerConnectionPort, PeerConnectionPortFactory, SdpKind,
    SessionDescription, SignalingState,
};
use crate::protocol::{IceCandidate, RemoteClientId, Sdp};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Debug)]
pub struct WebRtcConfig {
    pub ice_server_urls: Vec<String>,
    pub data_channel_label: String,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_server_urls: vec!["stun:stun.l.google.com:19302".to_string()],
            data_channel_label: "data".to_string(),
        }
    }
}

pub struct WebRtcPortFactory {
    config: WebRtcConfig,
}

impl WebRtcPortFactory {
    pub fn new(config: WebRtcConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PeerConnectionPortFactory for WebRtcPortFactory {
    async fn make_port(
        &self,
        remote_client_id: &RemoteClientId,
    ) -> Result<Arc<dyn PeerConnectionPort>, PortError> {
        let port = WebRtcPort::new(&self.config).await?;
        tracing::debug!(
            target: "causeway::webrtc",
            remote_client_id = %remote_client_id,
            "created peer connection"
        );
        Ok(Arc::new(port))
    }
}

fn build_api() -> Result<API, PortError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;
    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn to_setup_error(err: webrtc::Error) -> PortError {
    PortError::Setup(err.to_string())
}

pub struct WebRtcPort {
    pc: Arc<RTCPeerConnection>,
    data_channel_label: String,
    negotiation_needed_tx: broadcast::Sender<()>,
    ice_state_tx: broadcast::Sender<IceConnectionState>,
    candidate_tx: broadcast::Sender<IceCandidate>,
    signaling_state_tx: broadcast::Sender<SignalingState>,
}

impl WebRtcPort {
    pub async fn new(config: &WebRtcConfig) -> Result<Self, PortError> {
        let api = build_api()?;
        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: config.ice_server_urls.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(to_setup_error)?,
        );

        let (negotiation_needed_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (ice_state_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (candidate_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (signaling_state_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let needed = negotiation_needed_tx.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let _ = needed.send(());
            Box::pin(async move {})
        }));

        let ice_states = ice_state_tx.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            tracing::trace!(target: "causeway::webrtc", state = ?state, "ice connection state");
            if let Some(mapped) = map_ice_state(state) {
                let _ = ice_states.send(mapped);
            }
            Box::pin(async move {})
        }));

        let candidates = candidate_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = candidates.send(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        });
                    }
                    Err(err) => {
                        tracing::warn!(
                            target: "causeway::webrtc",
                            error = %err,
                            "failed to serialize local ice candidate"
                        );
                    }
                }
            }
            Box::pin(async move {})
        }));

        let signaling_states = signaling_state_tx.clone();
        pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
            if let Some(mapped) = map_signaling_state(state) {
                let _ = signaling_states.send(mapped);
            }
            Box::pin(async move {})
        }));

        Ok(Self {
            pc,
            data_channel_label: config.data_channel_label.clone(),
            negotiation_needed_tx,
            ice_state_tx,
            candidate_tx,
            signaling_state_tx,
        })
    }

    fn description(&self, description: SessionDescription) -> Result<RTCSessionDescription, PortError> {
        let sdp = description.sdp.into_string();
        let result = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp),
            SdpKind::Answer => RTCSessionDescription::answer(sdp),
        };
        result.map_err(|err| PortError::Sdp(err.to_string()))
    }
}

#[async_trait]
impl PeerConnectionPort for WebRtcPort {
    async fn create_data_channel(&self) -> Result<Arc<dyn DataChannelHandle>, PortError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(&self.data_channel_label, Some(init))
            .await
            .map_err(|err| PortError::DataChannel(err.to_string()))?;
        Ok(Arc::new(WebRtcDataChannel::new(dc)))
    }

    async fn create_local_offer(&self) -> Result<Sdp, PortError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|err| PortError::Sdp(err.to_string()))?;
        Ok(Sdp::new(offer.sdp))
    }

    async fn create_local_answer(&self) -> Result<Sdp, PortError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| PortError::Sdp(err.to_string()))?;
        Ok(Sdp::new(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PortError> {
        let description = self.description(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(|err| PortError::Sdp(err.to_string()))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PortError> {
        let description = self.description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|err| PortError::Sdp(err.to_string()))
    }

    async fn add_remote_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PortError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| PortError::Ice(err.to_string()))
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            tracing::warn!(
                target: "causeway::webrtc",
                error = %err,
                "error closing peer connection"
            );
        }
    }

    fn negotiation_needed(&self) -> broadcast::Receiver<()> {
        self.negotiation_needed_tx.subscribe()
    }

    fn ice_connection_states(&self) -> broadcast::Receiver<IceConnectionState> {
        self.ice_state_tx.subscribe()
    }

    fn generated_ice_candidates(&self) -> broadcast::Receiver<IceCandidate> {
        self.candidate_tx.subscribe()
    }

    fn signaling_states(&self) -> broadcast::Receiver<SignalingState> {
        self.signaling_state_tx.subscribe()
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    match state {
        RTCIceConnectionState::New => Some(IceConnectionState::New),
        RTCIceConnectionState::Checking => Some(IceConnectionState::Checking),
        RTCIceConnectionState::Connected => Some(IceConnectionState::Connected),
        RTCIceConnectionState::Completed => Some(IceConnectionState::Completed),
        RTCIceConnectionState::Failed => Some(IceConnectionState::Failed),
        RTCIceConnectionState::Disconnected => Some(IceConnectionState::Disconnected),
        RTCIceConnectionState::Closed => Some(IceConnectionState::Closed),
        RTCIceConnectionState::Unspecified => None,
    }
}

fn map_signaling_state(state: RTCSignalingState) -> Option<SignalingState> {
    match state {
        RTCSignalingState::Stable => Some(SignalingState::Stable),
        RTCSignalingState::HaveLocalOffer => Some(SignalingState::HaveLocalOffer),
        RTCSignalingState::HaveRemoteOffer => Some(SignalingState::HaveRemoteOffer),
        RTCSignalingState::HaveLocalPranswer => Some(SignalingState::HaveLocalPranswer),
        RTCSignalingState::HaveRemotePranswer => Some(SignalingState::HaveRemotePranswer),
        RTCSignalingState::Closed => Some(SignalingState::Closed),
        RTCSignalingState::Unspecified => None,
    }
}

struct WebRtcDataChannel {
    dc: Arc<RTCDataChannel>,
    incoming_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
}

impl WebRtcDataChannel {
    fn new(dc: Arc<RTCDataChannel>) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        dc.on_message(Box::new(move |message| {
            let _ = incoming_tx.send(message.data);
            Box::pin(async move {})
        }));
        let label = dc.label().to_string();
        dc.on_open(Box::new({
            let label = label.clone();
            move || {
                tracing::debug!(target: "causeway::webrtc", label = %label, "data channel open");
                Box::pin(async move {})
            }
        }));
        dc.on_close(Box::new(move || {
            tracing::debug!(target: "causeway::webrtc", label = %label, "data channel closed");
            Box::pin(async move {})
        }));

        Self {
            dc,
            incoming_rx: AsyncMutex::new(Some(incoming_rx)),
        }
    }
}

#[async_trait]
impl DataChannelHandle for WebRtcDataChannel {
    async fn send(&self, frame: Bytes) -> Result<(), PortError> {
        self.dc
            .send(&frame)
            .await
            .map(|_| ())
            .map_err(|err| PortError::DataChannel(err.to_string()))
    }

    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        self.incoming_rx
            .try_lock()
            .ok()
            .and_then(|mut guard| guard.take())
    }

    async fn close(&self) {
        if let Err(err) = self.dc.close().await {
            tracing::warn!(
                target: "causeway::webrtc",
                error = %err,
                "error closing data channel"
            );
        }
    }
}
