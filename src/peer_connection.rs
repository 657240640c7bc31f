//! The artifact a successful negotiation hands back: one live peer
//! connection with its message-level data channel.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use crate::data_channel::DataChannelClient;
use crate::error::{ChunkError, DataChannelError};
use crate::port::{IceConnectionState, PeerConnectionPort};
use crate::protocol::RemoteClientId;

pub struct PeerConnectionClient {
    remote_client_id: RemoteClientId,
    port: Arc<dyn PeerConnectionPort>,
    data_channel: DataChannelClient,
    closed: AtomicBool,
}

impl PeerConnectionClient {
    pub(crate) fn new(
        remote_client_id: RemoteClientId,
        port: Arc<dyn PeerConnectionPort>,
        data_channel: DataChannelClient,
    ) -> Self {
        Self {
            remote_client_id,
            port,
            data_channel,
            closed: AtomicBool::new(false),
        }
    }

    pub fn remote_client_id(&self) -> &RemoteClientId {
        &self.remote_client_id
    }

    pub async fn send_message(&self, payload: &[u8]) -> Result<(), DataChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DataChannelError::Closed);
        }
        self.data_channel.send_message(payload).await
    }

    /// Reassembled inbound messages. Single consumer; `None` after the
    /// first call.
    pub fn messages(&self) -> Option<mpsc::UnboundedReceiver<Result<Bytes, ChunkError>>> {
        self.data_channel.messages()
    }

    /// Connection state changes after negotiation, for liveness monitoring.
    pub fn ice_connection_states(&self) -> broadcast::Receiver<IceConnectionState> {
        self.port.ice_connection_states()
    }

    /// Closes the data channel and the underlying peer connection.
    /// Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.data_channel.close().await;
        self.port.close().await;
        tracing::debug!(
            target: "causeway::peer_connection",
            remote_client_id = %self.remote_client_id,
            "peer connection closed"
        );
    }
}

impl fmt::Debug for PeerConnectionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnectionClient")
            .field("remote_client_id", &self.remote_client_id)
            .finish_non_exhaustive()
    }
}
