//! Whole-message view over a raw data channel: chunking on the way out,
//! reassembly on the way in.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::chunking::{self, ChunkConfig, Reassembler};
use crate::error::{ChunkError, DataChannelError};
use crate::port::DataChannelHandle;

pub struct DataChannelClient {
    handle: Arc<dyn DataChannelHandle>,
    config: ChunkConfig,
    messages_rx: Mutex<Option<mpsc::UnboundedReceiver<Result<Bytes, ChunkError>>>>,
    inbound_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl DataChannelClient {
    pub fn new(handle: Arc<dyn DataChannelHandle>, config: ChunkConfig) -> Self {
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let inbound_task = handle.take_incoming().map(|mut incoming| {
            tokio::spawn(async move {
                let mut reassembler = Reassembler::new(config);
                while let Some(raw) = incoming.recv().await {
                    let outcome = chunking::decode_chunk(&raw, &config)
                        .and_then(|frame| reassembler.ingest(frame));
                    match outcome {
                        Ok(Some(message)) => {
                            if messages_tx.send(Ok(message)).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        // Surface the error but keep the stream alive; only
                        // the offending message id was dropped.
                        Err(err) => {
                            tracing::warn!(
                                target: "causeway::data_channel",
                                error = %err,
                                "bad inbound chunk frame"
                            );
                            if messages_tx.send(Err(err)).is_err() {
                                break;
                            }
                        }
                    }
                }
            })
        });

        Self {
            handle,
            config,
            messages_rx: Mutex::new(Some(messages_rx)),
            inbound_task: Mutex::new(inbound_task),
            closed: AtomicBool::new(false),
        }
    }

    /// Splits `payload` into chunk frames and sends them in order.
    pub async fn send_message(&self, payload: &[u8]) -> Result<(), DataChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DataChannelError::Closed);
        }
        let msg_id = Uuid::new_v4().as_u128();
        let frames = chunking::split_message(payload, msg_id, &self.config)?;
        let total = frames.len();
        for frame in &frames {
            self.handle.send(chunking::encode_chunk(frame)).await?;
        }
        tracing::trace!(
            target: "causeway::data_channel",
            bytes = payload.len(),
            chunks = total,
            "sent message"
        );
        Ok(())
    }

    /// The reassembled inbound message stream. Single consumer; `None`
    /// after the first call.
    pub fn messages(&self) -> Option<mpsc::UnboundedReceiver<Result<Bytes, ChunkError>>> {
        lock(&self.messages_rx).take()
    }

    /// Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = lock(&self.inbound_task).take() {
            task.abort();
        }
        self.handle.close().await;
    }
}

impl Drop for DataChannelClient {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.inbound_task).take() {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PortError;
    use async_trait::async_trait;

    struct LoopbackChannel {
        // Frames sent by the client, for assertions.
        sent_tx: mpsc::UnboundedSender<Bytes>,
        incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    }

    struct LoopbackRemote {
        sent_rx: mpsc::UnboundedReceiver<Bytes>,
        incoming_tx: mpsc::UnboundedSender<Bytes>,
    }

    fn loopback() -> (Arc<LoopbackChannel>, LoopbackRemote) {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        (
            Arc::new(LoopbackChannel {
                sent_tx,
                incoming_rx: Mutex::new(Some(incoming_rx)),
            }),
            LoopbackRemote {
                sent_rx,
                incoming_tx,
            },
        )
    }

    #[async_trait]
    impl DataChannelHandle for LoopbackChannel {
        async fn send(&self, frame: Bytes) -> Result<(), PortError> {
            self.sent_tx.send(frame).map_err(|_| PortError::Closed)
        }

        fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
            lock(&self.incoming_rx).take()
        }

        async fn close(&self) {}
    }

    fn small_config() -> ChunkConfig {
        ChunkConfig {
            max_chunk_bytes: 25 + 4,
            max_message_bytes: 4096,
        }
    }

    #[tokio::test]
    async fn outbound_messages_are_chunked_in_order() {
        let (handle, mut remote) = loopback();
        let client = DataChannelClient::new(handle, small_config());

        let payload: Vec<u8> = (0..10u8).collect();
        client.send_message(&payload).await.unwrap();

        let config = small_config();
        let mut rebuilt = Reassembler::new(config);
        let mut seqs = Vec::new();
        let mut message = None;
        while message.is_none() {
            let raw = remote.sent_rx.recv().await.unwrap();
            let frame = chunking::decode_chunk(&raw, &config).unwrap();
            seqs.push(frame.seq);
            message = rebuilt.ingest(frame).unwrap();
        }
        assert_eq!(message.unwrap().as_ref(), payload.as_slice());
        assert_eq!(seqs, (0..seqs.len() as u32).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn inbound_frames_are_reassembled() {
        let (handle, remote) = loopback();
        let client = DataChannelClient::new(handle, small_config());
        let mut messages = client.messages().unwrap();

        let config = small_config();
        let payload: Vec<u8> = (0..50u8).collect();
        for frame in chunking::split_message(&payload, 3, &config).unwrap() {
            remote.incoming_tx.send(chunking::encode_chunk(&frame)).unwrap();
        }

        let message = messages.recv().await.unwrap().unwrap();
        assert_eq!(message.as_ref(), payload.as_slice());
    }

    #[tokio::test]
    async fn bad_frame_surfaces_error_without_ending_stream() {
        let (handle, remote) = loopback();
        let client = DataChannelClient::new(handle, small_config());
        let mut messages = client.messages().unwrap();

        remote.incoming_tx.send(Bytes::from_static(b"junk")).unwrap();
        let config = small_config();
        for frame in chunking::split_message(b"still works", 4, &config).unwrap() {
            remote.incoming_tx.send(chunking::encode_chunk(&frame)).unwrap();
        }

        assert!(messages.recv().await.unwrap().is_err());
        let message = messages.recv().await.unwrap().unwrap();
        assert_eq!(message.as_ref(), b"still works");
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (handle, _remote) = loopback();
        let client = DataChannelClient::new(handle, small_config());
        client.close().await;
        client.close().await; // idempotent
        let err = client.send_message(b"late").await.unwrap_err();
        assert!(matches!(err, DataChannelError::Closed));
    }
}
