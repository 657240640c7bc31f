//! Signaling client: request/ack correlation on the way out, decrypt-once
//! fan-out on the way in.
//!
//! One reader task owns the transport's inbound side. Acks resolve pending
//! requests by id; forwarded primitives are opened once and multicast to
//! every subscribed event stream. A message that fails to parse or decrypt
//! is logged and dropped; it never ends the streams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{SignalingError, TransportError};
use crate::protocol::{
    self, IdentifiedAnswer, IdentifiedIceCandidate, IdentifiedOffer, IdentifiedPrimitive,
    RelayMessage, RemoteClientId, RemoteClientState, RequestId, RtcPrimitive,
};
use crate::sealbox::EncryptionKey;
use crate::transport::SignalingTransport;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Everything the relay pushes at us, already decrypted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SignalingEvent {
    Primitive(IdentifiedPrimitive),
    RemoteClientState(RemoteClientState),
    /// Sentinel broadcast once when the transport disconnects.
    Closed,
}

enum RelayReply {
    Confirmed,
    MissingRemoteClient,
    Rejected,
}

type PendingAcks = Arc<Mutex<HashMap<RequestId, oneshot::Sender<RelayReply>>>>;

pub struct SignalingClient {
    transport: Arc<dyn SignalingTransport>,
    key: EncryptionKey,
    events_tx: broadcast::Sender<SignalingEvent>,
    pending: PendingAcks,
    closed: Arc<AtomicBool>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingClient {
    pub fn new(transport: Arc<dyn SignalingTransport>, key: EncryptionKey) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader_task = tokio::spawn(read_loop(
            transport.clone(),
            key.clone(),
            events_tx.clone(),
            pending.clone(),
            closed.clone(),
        ));

        Arc::new(Self {
            transport,
            key,
            events_tx,
            pending,
            closed,
            reader_task: Mutex::new(Some(reader_task)),
        })
    }

    /// Seals `primitive` for `target` and sends it, then waits for the
    /// relay's acknowledgement of the request.
    pub async fn send_to_remote(
        &self,
        target: RemoteClientId,
        primitive: RtcPrimitive,
    ) -> Result<RequestId, SignalingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed.into());
        }
        let request = protocol::pack_primitive(&self.key, &target, &primitive)
            .map_err(SignalingError::Protocol)?;
        let request_id = request.request_id;
        let bytes = serde_json::to_vec(&request)
            .map_err(|err| SignalingError::Protocol(err.into()))?;

        let (ack_tx, ack_rx) = oneshot::channel();
        lock(&self.pending).insert(request_id, ack_tx);

        if let Err(err) = self.transport.send(bytes).await {
            lock(&self.pending).remove(&request_id);
            return Err(err.into());
        }
        tracing::debug!(
            target: "causeway::signaling",
            request_id = %request_id,
            target_client = %target,
            method = %request.method,
            "sent signaling request"
        );

        match ack_rx.await {
            Ok(RelayReply::Confirmed) => Ok(request_id),
            Ok(RelayReply::MissingRemoteClient) => {
                Err(SignalingError::NoRemoteClientToTalkTo(target))
            }
            Ok(RelayReply::Rejected) => Err(SignalingError::RequestRejected(request_id)),
            Err(_) => Err(TransportError::ChannelClosed.into()),
        }
    }

    pub fn on_offer(&self) -> EventStream<IdentifiedOffer> {
        self.subscribe(|event| match event {
            SignalingEvent::Primitive(IdentifiedPrimitive {
                remote_client_id,
                primitive: RtcPrimitive::Offer(sdp),
            }) => Some(IdentifiedOffer {
                remote_client_id,
                sdp,
            }),
            _ => None,
        })
    }

    pub fn on_answer(&self) -> EventStream<IdentifiedAnswer> {
        self.subscribe(|event| match event {
            SignalingEvent::Primitive(IdentifiedPrimitive {
                remote_client_id,
                primitive: RtcPrimitive::Answer(sdp),
            }) => Some(IdentifiedAnswer {
                remote_client_id,
                sdp,
            }),
            _ => None,
        })
    }

    pub fn on_ice_candidate(&self) -> EventStream<IdentifiedIceCandidate> {
        self.subscribe(|event| match event {
            SignalingEvent::Primitive(IdentifiedPrimitive {
                remote_client_id,
                primitive: RtcPrimitive::IceCandidate(candidate),
            }) => Some(IdentifiedIceCandidate {
                remote_client_id,
                candidate,
            }),
            _ => None,
        })
    }

    pub fn on_remote_client_state(&self) -> EventStream<RemoteClientState> {
        self.subscribe(|event| match event {
            SignalingEvent::RemoteClientState(state) => Some(state),
            _ => None,
        })
    }

    /// All events, unfiltered.
    pub fn events(&self) -> EventStream<SignalingEvent> {
        self.subscribe(Some)
    }

    fn subscribe<T>(&self, filter: fn(SignalingEvent) -> Option<T>) -> EventStream<T> {
        EventStream {
            rx: self.events_tx.subscribe(),
            closed: self.closed.clone(),
            filter,
        }
    }

    /// Tears the client down: ends every event stream, fails pending
    /// requests and closes the transport. Idempotent.
    pub async fn cancel(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.events_tx.send(SignalingEvent::Closed);
        if let Some(task) = lock(&self.reader_task).take() {
            task.abort();
        }
        lock(&self.pending).clear();
        self.transport.close().await;
        tracing::debug!(target: "causeway::signaling", "signaling client cancelled");
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.reader_task).take() {
            task.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn read_loop(
    transport: Arc<dyn SignalingTransport>,
    key: EncryptionKey,
    events_tx: broadcast::Sender<SignalingEvent>,
    pending: PendingAcks,
    closed: Arc<AtomicBool>,
) {
    while let Some(bytes) = transport.recv().await {
        let message = match serde_json::from_slice::<RelayMessage>(&bytes) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(
                    target: "causeway::signaling",
                    error = %err,
                    "dropping unparseable relay message"
                );
                continue;
            }
        };
        handle_relay_message(message, &key, &events_tx, &pending);
    }

    // Transport gone: in-flight sends fail, event streams end.
    closed.store(true, Ordering::SeqCst);
    lock(&pending).clear();
    let _ = events_tx.send(SignalingEvent::Closed);
    tracing::debug!(target: "causeway::signaling", "signaling transport disconnected");
}

fn handle_relay_message(
    message: RelayMessage,
    key: &EncryptionKey,
    events_tx: &broadcast::Sender<SignalingEvent>,
    pending: &PendingAcks,
) {
    match message {
        RelayMessage::Confirmation { request_id } => {
            resolve_ack(pending, request_id, RelayReply::Confirmed);
        }
        RelayMessage::MissingRemoteClientError { request_id } => {
            resolve_ack(pending, request_id, RelayReply::MissingRemoteClient);
        }
        RelayMessage::ValidationError { request_id } => {
            resolve_ack(pending, request_id, RelayReply::Rejected);
        }
        RelayMessage::RemoteData {
            remote_client_id,
            data,
            ..
        } => match protocol::extract_primitive(key, remote_client_id, &data) {
            Ok(identified) => {
                tracing::trace!(
                    target: "causeway::signaling",
                    remote_client_id = %identified.remote_client_id,
                    method = %data.method,
                    "received remote primitive"
                );
                let _ = events_tx.send(SignalingEvent::Primitive(identified));
            }
            Err(err) => {
                tracing::warn!(
                    target: "causeway::signaling",
                    error = %err,
                    method = %data.method,
                    "dropping undecryptable remote primitive"
                );
            }
        },
        RelayMessage::RemoteClientJustConnected { remote_client_id }
        | RelayMessage::RemoteClientIsAlreadyConnected { remote_client_id } => {
            let _ = events_tx.send(SignalingEvent::RemoteClientState(
                RemoteClientState::Connected(remote_client_id),
            ));
        }
        RelayMessage::RemoteClientDisconnected { remote_client_id } => {
            let _ = events_tx.send(SignalingEvent::RemoteClientState(
                RemoteClientState::Disconnected(remote_client_id),
            ));
        }
    }
}

fn resolve_ack(pending: &PendingAcks, request_id: RequestId, reply: RelayReply) {
    match lock(pending).remove(&request_id) {
        Some(ack_tx) => {
            let _ = ack_tx.send(reply);
        }
        None => {
            tracing::debug!(
                target: "causeway::signaling",
                request_id = %request_id,
                "ack for unknown request"
            );
        }
    }
}

/// Filtered multi-subscriber view of the signaling event feed. Each stream
/// sees every matching event from its subscription point on.
pub struct EventStream<T> {
    rx: broadcast::Receiver<SignalingEvent>,
    closed: Arc<AtomicBool>,
    filter: fn(SignalingEvent) -> Option<T>,
}

impl<T> EventStream<T> {
    /// Next matching event, `None` once the client has shut down.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return self.drain_after_close();
            }
            match self.rx.recv().await {
                Ok(SignalingEvent::Closed) => return None,
                Ok(event) => {
                    if let Some(item) = (self.filter)(event) {
                        return Some(item);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        target: "causeway::signaling",
                        skipped,
                        "event stream lagged"
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    // A subscriber created (or still draining) after closure must not block
    // on a Closed sentinel it never received.
    fn drain_after_close(&mut self) -> Option<T> {
        loop {
            match self.rx.try_recv() {
                Ok(SignalingEvent::Closed) => return None,
                Ok(event) => {
                    if let Some(item) = (self.filter)(event) {
                        return Some(item);
                    }
                }
                Err(TryRecvError::Lagged(_)) => {}
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ClientRequest, Sdp};
    use async_trait::async_trait;
    use tokio::sync::Mutex as AsyncMutex;
    use tokio::sync::mpsc;

    /// In-memory transport: outbound messages land in a channel the test
    /// reads, inbound messages are injected by the test.
    struct ChannelTransport {
        outbound_tx: mpsc::UnboundedSender<Vec<u8>>,
        inbound_rx: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    }

    struct TestRelay {
        outbound_rx: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
        inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    }

    fn channel_transport() -> (Arc<ChannelTransport>, TestRelay) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        (
            Arc::new(ChannelTransport {
                outbound_tx,
                inbound_rx: AsyncMutex::new(inbound_rx),
            }),
            TestRelay {
                outbound_rx: AsyncMutex::new(outbound_rx),
                inbound_tx,
            },
        )
    }

    #[async_trait]
    impl SignalingTransport for ChannelTransport {
        async fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
            self.outbound_tx
                .send(data)
                .map_err(|_| TransportError::ChannelClosed)
        }

        async fn recv(&self) -> Option<Vec<u8>> {
            self.inbound_rx.lock().await.recv().await
        }

        async fn close(&self) {}
    }

    impl TestRelay {
        async fn next_request(&self) -> ClientRequest {
            let bytes = self.outbound_rx.lock().await.recv().await.unwrap();
            serde_json::from_slice(&bytes).unwrap()
        }

        fn inject(&self, message: &RelayMessage) {
            self.inbound_tx
                .send(serde_json::to_vec(message).unwrap())
                .unwrap();
        }

        fn inject_raw(&self, bytes: &[u8]) {
            self.inbound_tx.send(bytes.to_vec()).unwrap();
        }
    }

    fn key() -> EncryptionKey {
        EncryptionKey::from_bytes([9u8; 32])
    }

    #[tokio::test]
    async fn send_resolves_on_confirmation() {
        let (transport, relay) = channel_transport();
        let client = SignalingClient::new(transport, key());

        let send = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .send_to_remote(
                        RemoteClientId::from("peer"),
                        RtcPrimitive::Offer(Sdp::new("v=0")),
                    )
                    .await
            }
        });

        let request = relay.next_request().await;
        assert_eq!(request.target_client_id, RemoteClientId::from("peer"));
        relay.inject(&RelayMessage::Confirmation {
            request_id: request.request_id,
        });

        let request_id = send.await.unwrap().unwrap();
        assert_eq!(request_id, request.request_id);
    }

    #[tokio::test]
    async fn missing_remote_client_maps_to_typed_error() {
        let (transport, relay) = channel_transport();
        let client = SignalingClient::new(transport, key());

        let send = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .send_to_remote(
                        RemoteClientId::from("gone"),
                        RtcPrimitive::Answer(Sdp::new("v=0")),
                    )
                    .await
            }
        });

        let request = relay.next_request().await;
        relay.inject(&RelayMessage::MissingRemoteClientError {
            request_id: request.request_id,
        });

        let err = send.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            SignalingError::NoRemoteClientToTalkTo(id) if id == RemoteClientId::from("gone")
        ));
    }

    #[tokio::test]
    async fn remote_data_fans_out_decrypted() {
        let (transport, relay) = channel_transport();
        let client = SignalingClient::new(transport, key());
        let mut offers = client.on_offer();
        let mut candidates = client.on_ice_candidate();
        let mut states = client.on_remote_client_state();

        let from_peer = RemoteClientId::from("peer-7");
        let offer_request = protocol::pack_primitive(
            &key(),
            &RemoteClientId::from("me"),
            &RtcPrimitive::Offer(Sdp::new("v=0 offer")),
        )
        .unwrap();
        relay.inject(&RelayMessage::RemoteData {
            request_id: RequestId::fresh(),
            remote_client_id: from_peer.clone(),
            data: offer_request,
        });

        let offer = offers.recv().await.unwrap();
        assert_eq!(offer.remote_client_id, from_peer);
        assert_eq!(offer.sdp, Sdp::new("v=0 offer"));

        // The candidate stream must not have consumed the offer.
        relay.inject(&RelayMessage::RemoteClientDisconnected {
            remote_client_id: from_peer.clone(),
        });
        assert_eq!(
            states.recv().await,
            Some(RemoteClientState::Disconnected(from_peer))
        );
        drop(candidates);
    }

    #[tokio::test]
    async fn garbage_is_dropped_without_ending_streams() {
        let (transport, relay) = channel_transport();
        let client = SignalingClient::new(transport, key());
        let mut states = client.on_remote_client_state();

        relay.inject_raw(b"not json at all");
        // Validly framed but sealed under a different key.
        let foreign = protocol::pack_primitive(
            &EncryptionKey::from_bytes([1u8; 32]),
            &RemoteClientId::from("me"),
            &RtcPrimitive::Offer(Sdp::new("v=0")),
        )
        .unwrap();
        relay.inject(&RelayMessage::RemoteData {
            request_id: RequestId::fresh(),
            remote_client_id: RemoteClientId::from("mallory"),
            data: foreign,
        });
        relay.inject(&RelayMessage::RemoteClientJustConnected {
            remote_client_id: RemoteClientId::from("alice"),
        });

        assert_eq!(
            states.recv().await,
            Some(RemoteClientState::Connected(RemoteClientId::from("alice")))
        );
    }

    #[tokio::test]
    async fn already_connected_counts_as_connected() {
        let (transport, relay) = channel_transport();
        let client = SignalingClient::new(transport, key());
        let mut states = client.on_remote_client_state();

        relay.inject(&RelayMessage::RemoteClientIsAlreadyConnected {
            remote_client_id: RemoteClientId::from("bob"),
        });
        assert_eq!(
            states.recv().await,
            Some(RemoteClientState::Connected(RemoteClientId::from("bob")))
        );
    }

    #[tokio::test]
    async fn transport_disconnect_ends_streams_and_fails_sends() {
        let (transport, relay) = channel_transport();
        let client = SignalingClient::new(transport, key());
        let mut offers = client.on_offer();

        let send = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .send_to_remote(
                        RemoteClientId::from("peer"),
                        RtcPrimitive::Offer(Sdp::new("v=0")),
                    )
                    .await
            }
        });
        let _ = relay.next_request().await;

        drop(relay);

        assert!(offers.recv().await.is_none());
        let err = send.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            SignalingError::Transport(TransportError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn cancel_ends_streams() {
        let (transport, _relay) = channel_transport();
        let client = SignalingClient::new(transport, key());
        let mut events = client.events();
        client.cancel().await;
        assert!(events.recv().await.is_none());
        // Streams opened after cancellation end immediately too.
        assert!(client.on_answer().recv().await.is_none());
    }
}
