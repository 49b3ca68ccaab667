//! BLOB persistence and stream fan-out.
//!
//! Each `oneBLOB` in a set message drives the same pipeline: decode the
//! base64 payload, persist it under `<device>_<property>_<value><format>`,
//! and hand the decoded bytes to every live subscriber of that value. The
//! subscriber registry is its own concurrent map, deliberately outside the
//! catalog lock, so registration never contends with a large decode.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{IndiError, IndiResult};
use crate::message::BlobItem;
use crate::transport::BlobStorage;

type StreamKey = (String, String, String);
type Subscribers = HashMap<Uuid, mpsc::Sender<Bytes>>;

/// Decodes, persists, and fans out BLOB payloads.
pub struct BlobSink {
    storage: Arc<dyn BlobStorage>,
    streams: DashMap<StreamKey, Subscribers>,
    stream_buffer: usize,
}

impl BlobSink {
    pub fn new(storage: Arc<dyn BlobStorage>, stream_buffer: usize) -> Self {
        Self {
            storage,
            streams: DashMap::new(),
            stream_buffer,
        }
    }

    /// Register a subscriber for the (device, property, value) triple.
    /// Returns the read endpoint and the id used to unsubscribe.
    pub(crate) fn subscribe(&self, device: &str, property: &str, value: &str) -> (BlobStream, Uuid) {
        let (tx, rx) = mpsc::channel(self.stream_buffer);
        let id = Uuid::new_v4();
        self.streams
            .entry(key(device, property, value))
            .or_default()
            .insert(id, tx);
        (BlobStream { rx }, id)
    }

    /// Close a subscriber's write endpoint and drop its registration.
    /// Unknown ids are ignored.
    pub(crate) fn unsubscribe(&self, device: &str, property: &str, value: &str, id: Uuid) {
        if let Some(mut entry) = self.streams.get_mut(&key(device, property, value)) {
            entry.remove(&id);
        }
    }

    /// Drop every subscriber. Called on disconnect.
    pub(crate) fn clear(&self) {
        self.streams.clear();
    }

    /// Run one payload through the pipeline. Returns the stored file name and
    /// the number of bytes written.
    pub(crate) async fn store(
        &self,
        device: &str,
        property: &str,
        item: &BlobItem,
    ) -> IndiResult<(String, u64)> {
        let file_name = format!("{}_{}_{}{}", device, property, item.name, item.format);

        // Servers wrap long base64 bodies; the decoder wants it contiguous.
        let encoded: Vec<u8> = item
            .value
            .bytes()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        let data = BASE64
            .decode(encoded)
            .map_err(|e| IndiError::Parse(format!("invalid base64 payload: {e}")))?;

        let mut file = self.storage.create(&file_name).await?;
        file.write_all(&data).await?;
        file.shutdown().await?;

        let written = data.len() as u64;
        self.fan_out(&key(device, property, &item.name), Bytes::from(data));

        tracing::debug!(file = %file_name, bytes = written, "stored blob");
        Ok((file_name, written))
    }

    /// Deliver a decoded payload to every subscriber of the key. Delivery
    /// never blocks: a subscriber whose buffer is full, or whose read
    /// endpoint is gone, is dropped from the registry.
    fn fan_out(&self, key: &StreamKey, payload: Bytes) {
        let Some(mut entry) = self.streams.get_mut(key) else {
            return;
        };
        entry.retain(|id, tx| match tx.try_send(payload.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(subscriber = %id, "dropping slow blob subscriber");
                false
            }
        });
    }
}

/// Read endpoint of a BLOB subscription. Each armed payload arrives as one
/// [`Bytes`] chunk; `None` means the subscription was closed.
pub struct BlobStream {
    rx: mpsc::Receiver<Bytes>,
}

impl BlobStream {
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

fn key(device: &str, property: &str, value: &str) -> StreamKey {
    (device.to_string(), property.to_string(), value.to_string())
}
