//! INDI client facade.
//!
//! [`IndiClient`] owns a connection's three long-running tasks:
//!
//! - the reader loop, sole consumer of the inbound byte stream, which decodes
//!   typed messages and forwards them to the dispatcher;
//! - the dispatcher loop, which applies each message to the catalog in wire
//!   order under the exclusive lock;
//! - the writer loop, which serializes queued commands and writes them to the
//!   transport.
//!
//! Set operations follow the protocol's synchronization contract: the
//! property is marked Busy locally, the command is queued, and the call
//! returns only after the dispatcher observes the server resolve the property
//! to Ok (success) or Alert (failure), or the configured wait expires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::blob::{BlobSink, BlobStream};
use crate::catalog::{Catalog, Device, LightValue, NumberValue, SwitchValue, TextValue};
use crate::error::{IndiError, IndiResult};
use crate::message::{BlobPayload, Command, ServerMessage};
use crate::transport::{BlobStorage, Connection, Dialer, LocalStorage, TcpDialer};
use crate::wire::{encode, MessageReader};
use crate::{BlobEnable, ClientConfig, PropertyKind, PropertyState, SwitchState};

/// Client for one INDI server connection.
pub struct IndiClient {
    dialer: Arc<dyn Dialer>,
    storage: Arc<dyn BlobStorage>,
    config: ClientConfig,
    catalog: Arc<Catalog>,
    sink: Arc<BlobSink>,
    connected: Arc<AtomicBool>,
    cmd_tx: Option<mpsc::Sender<Command>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl IndiClient {
    /// Create a client over the given transport dialer and BLOB storage.
    pub fn new(dialer: Arc<dyn Dialer>, storage: Arc<dyn BlobStorage>, config: ClientConfig) -> Self {
        let sink = Arc::new(BlobSink::new(storage.clone(), config.stream_buffer));
        Self {
            dialer,
            storage,
            config,
            catalog: Arc::new(Catalog::new()),
            sink,
            connected: Arc::new(AtomicBool::new(false)),
            cmd_tx: None,
            shutdown_tx: None,
        }
    }

    /// Dial the server and start the reader, dispatcher, and writer loops.
    ///
    /// The catalog is purged and fresh queues of the configured capacity are
    /// allocated. Guarding against double-connect is the caller's concern.
    pub async fn connect(&mut self, network: &str, address: &str) -> IndiResult<()> {
        let stream = self.dialer.dial(network, address).await?;

        self.catalog.purge().await;

        let (read_half, write_half) = tokio::io::split(stream);
        let (msg_tx, msg_rx) = mpsc::channel(self.config.channel_capacity);
        let (cmd_tx, cmd_rx) = mpsc::channel(self.config.channel_capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(reader_loop(
            read_half,
            msg_tx,
            shutdown_rx,
            self.catalog.clone(),
            self.sink.clone(),
            self.connected.clone(),
        ));
        tokio::spawn(dispatcher_loop(msg_rx, self.catalog.clone(), self.sink.clone()));
        tokio::spawn(writer_loop(write_half, cmd_rx));

        self.cmd_tx = Some(cmd_tx);
        self.shutdown_tx = Some(shutdown_tx);
        self.connected.store(true, Ordering::SeqCst);

        Ok(())
    }

    /// Purge the catalog, drop every BLOB subscriber, close the transport,
    /// and stop the loops. Safe to call when already disconnected.
    pub async fn disconnect(&mut self) -> IndiResult<()> {
        self.catalog.purge().await;
        self.sink.clear();

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        // Dropping the sender lets the writer drain and exit, which closes
        // the write half of the transport.
        self.cmd_tx = None;
        self.connected.store(false, Ordering::SeqCst);

        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Snapshot of the known device names.
    pub async fn devices(&self) -> Vec<String> {
        self.catalog.device_names().await
    }

    /// Snapshot of one device's full state, if known.
    pub async fn device(&self, name: &str) -> Option<Device> {
        self.catalog.device(name).await
    }

    // =========================================================================
    // COMMANDS
    // =========================================================================

    /// Ask the server for property definitions. Both arguments are optional;
    /// an empty device requests the full catalog. Naming a property without a
    /// device is rejected.
    pub async fn get_properties(&self, device: &str, property: &str) -> IndiResult<()> {
        if !property.is_empty() && device.is_empty() {
            return Err(IndiError::PropertyWithoutDevice);
        }
        self.send(Command::GetProperties {
            device: device.to_string(),
            name: property.to_string(),
        })
        .await
    }

    /// Change whether the server sends BLOBs on this connection. The device
    /// must already exist in the local catalog.
    pub async fn enable_blob(
        &self,
        device: &str,
        property: &str,
        mode: BlobEnable,
    ) -> IndiResult<()> {
        if !self.catalog.has_device(device).await {
            return Err(IndiError::DeviceNotFound(device.to_string()));
        }
        self.send(Command::EnableBlob {
            device: device.to_string(),
            name: property.to_string(),
            mode,
        })
        .await
    }

    // =========================================================================
    // READERS
    // =========================================================================

    pub async fn get_text(&self, device: &str, property: &str, value: &str) -> IndiResult<TextValue> {
        self.catalog.get_text(device, property, value).await
    }

    pub async fn get_number(
        &self,
        device: &str,
        property: &str,
        value: &str,
    ) -> IndiResult<NumberValue> {
        self.catalog.get_number(device, property, value).await
    }

    pub async fn get_switch(
        &self,
        device: &str,
        property: &str,
        value: &str,
    ) -> IndiResult<SwitchValue> {
        self.catalog.get_switch(device, property, value).await
    }

    pub async fn get_light(
        &self,
        device: &str,
        property: &str,
        value: &str,
    ) -> IndiResult<LightValue> {
        self.catalog.get_light(device, property, value).await
    }

    pub async fn text_property_set(&self, device: &str, property: &str) -> bool {
        self.catalog.has_property(PropertyKind::Text, device, property).await
    }

    pub async fn number_property_set(&self, device: &str, property: &str) -> bool {
        self.catalog.has_property(PropertyKind::Number, device, property).await
    }

    pub async fn switch_property_set(&self, device: &str, property: &str) -> bool {
        self.catalog.has_property(PropertyKind::Switch, device, property).await
    }

    pub async fn blob_property_set(&self, device: &str, property: &str) -> bool {
        self.catalog.has_property(PropertyKind::Blob, device, property).await
    }

    // =========================================================================
    // SET OPERATIONS
    // =========================================================================

    /// Change values of a text vector. Blocks until the server resolves the
    /// property to Ok or Alert.
    pub async fn set_text(
        &self,
        device: &str,
        property: &str,
        names: &[&str],
        values: &[&str],
    ) -> IndiResult<()> {
        check_lengths(names.len(), values.len())?;
        self.catalog.begin_set_text(device, property, names).await?;
        self.send(Command::NewText {
            device: device.to_string(),
            name: property.to_string(),
            items: pair(names, values.iter().map(|v| v.to_string())),
        })
        .await?;
        self.await_resolution(PropertyKind::Text, device, property).await
    }

    /// Change values of a number vector. Values are passed as strings so the
    /// caller controls the precision that goes on the wire.
    pub async fn set_number(
        &self,
        device: &str,
        property: &str,
        names: &[&str],
        values: &[&str],
    ) -> IndiResult<()> {
        check_lengths(names.len(), values.len())?;
        self.catalog.begin_set_number(device, property, names).await?;
        self.send(Command::NewNumber {
            device: device.to_string(),
            name: property.to_string(),
            items: pair(names, values.iter().map(|v| v.to_string())),
        })
        .await?;
        self.await_resolution(PropertyKind::Number, device, property).await
    }

    /// Change values of a switch vector. Usually the desired switch is set On
    /// and the device decides how to switch the others off.
    pub async fn set_switch(
        &self,
        device: &str,
        property: &str,
        names: &[&str],
        values: &[SwitchState],
    ) -> IndiResult<()> {
        check_lengths(names.len(), values.len())?;
        self.catalog.begin_set_switch(device, property, names).await?;
        self.send(Command::NewSwitch {
            device: device.to_string(),
            name: property.to_string(),
            items: pair(names, values.iter().copied()),
        })
        .await?;
        self.await_resolution(PropertyKind::Switch, device, property).await
    }

    /// Send a BLOB to the server. The payload is base64-encoded on the wire.
    pub async fn set_blob(
        &self,
        device: &str,
        property: &str,
        value: &str,
        data: &[u8],
        format: &str,
    ) -> IndiResult<()> {
        self.catalog.begin_set_blob(device, property, &[value]).await?;
        self.send(Command::NewBlob {
            device: device.to_string(),
            name: property.to_string(),
            blob: BlobPayload {
                name: value.to_string(),
                format: format.to_string(),
                data: Bytes::copy_from_slice(data),
            },
        })
        .await?;
        self.await_resolution(PropertyKind::Blob, device, property).await
    }

    // =========================================================================
    // BLOB RETRIEVAL
    // =========================================================================

    /// Consume an armed BLOB: a reader over the stored file, the file's base
    /// name, and its length in bytes. The value resets to empty, so each
    /// received artifact can be read once.
    pub async fn get_blob(
        &self,
        device: &str,
        property: &str,
        value: &str,
    ) -> IndiResult<(Box<dyn AsyncRead + Send + Unpin>, String, u64)> {
        let (reader, path, size) = self
            .catalog
            .take_blob(self.storage.as_ref(), device, property, value)
            .await?;
        Ok((reader, self.storage.base_name(&path), size))
    }

    /// Non-destructive check whether a BLOB value is armed.
    pub async fn blob_available(&self, device: &str, property: &str, value: &str) -> bool {
        self.catalog.blob_available(device, property, value).await
    }

    /// Subscribe to a BLOB value. Every payload the sink persists for it is
    /// also delivered to the returned stream until [`Self::close_blob_stream`]
    /// or disconnect.
    pub async fn get_blob_stream(
        &self,
        device: &str,
        property: &str,
        value: &str,
    ) -> IndiResult<(BlobStream, Uuid)> {
        self.catalog.ensure_blob_value(device, property, value).await?;
        Ok(self.sink.subscribe(device, property, value))
    }

    /// Tear down a subscription created by [`Self::get_blob_stream`].
    pub async fn close_blob_stream(
        &self,
        device: &str,
        property: &str,
        value: &str,
        id: Uuid,
    ) -> IndiResult<()> {
        self.catalog.ensure_blob_value(device, property, value).await?;
        self.sink.unsubscribe(device, property, value, id);
        Ok(())
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    async fn send(&self, cmd: Command) -> IndiResult<()> {
        let tx = self.cmd_tx.as_ref().ok_or(IndiError::NotConnected)?;
        tx.send(cmd).await.map_err(|_| IndiError::ConnectionClosed)
    }

    /// Poll the catalog until the property leaves Busy for a terminal state.
    /// Idle means no resolution yet and keeps the wait alive; a purge (for
    /// example on disconnect) surfaces as a lookup error and fails the call.
    async fn await_resolution(
        &self,
        kind: PropertyKind,
        device: &str,
        property: &str,
    ) -> IndiResult<()> {
        let deadline = tokio::time::Instant::now() + self.config.set_timeout();
        loop {
            match self.catalog.property_state(kind, device, property).await? {
                PropertyState::Ok => return Ok(()),
                PropertyState::Alert => {
                    return Err(IndiError::PropertyAlert {
                        device: device.to_string(),
                        property: property.to_string(),
                    })
                }
                PropertyState::Idle | PropertyState::Busy => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(IndiError::SetTimeout {
                    device: device.to_string(),
                    property: property.to_string(),
                    seconds: self.config.set_timeout_secs,
                });
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }
}

impl Default for IndiClient {
    /// TCP transport, BLOBs in the working directory, default knobs.
    fn default() -> Self {
        Self::new(
            Arc::new(TcpDialer),
            Arc::new(LocalStorage::default()),
            ClientConfig::default(),
        )
    }
}

fn check_lengths(names: usize, values: usize) -> IndiResult<()> {
    if names != values {
        return Err(IndiError::LengthMismatch { names, values });
    }
    Ok(())
}

fn pair<V>(names: &[&str], values: impl Iterator<Item = V>) -> Vec<(String, V)> {
    names
        .iter()
        .map(|n| n.to_string())
        .zip(values)
        .collect()
}

/// Reader loop: sole consumer of the inbound byte stream.
///
/// Decodes messages and forwards them in wire order. Parse errors are logged
/// and decoding resumes at the next token; end of stream and transport
/// failures tear the connection state down the same way a disconnect would.
async fn reader_loop(
    read_half: ReadHalf<Box<dyn Connection>>,
    msg_tx: mpsc::Sender<ServerMessage>,
    mut shutdown_rx: oneshot::Receiver<()>,
    catalog: Arc<Catalog>,
    sink: Arc<BlobSink>,
    connected: Arc<AtomicBool>,
) {
    let mut reader = MessageReader::new(read_half);
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                tracing::debug!("reader stopping on shutdown signal");
                return;
            }
            decoded = reader.next() => match decoded {
                Ok(Some(msg)) => {
                    if msg_tx.send(msg).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    tracing::debug!("server closed the connection");
                    connected.store(false, Ordering::SeqCst);
                    catalog.purge().await;
                    sink.clear();
                    return;
                }
                Err(IndiError::Stream(error)) => {
                    tracing::warn!(%error, "inbound stream failed");
                    connected.store(false, Ordering::SeqCst);
                    catalog.purge().await;
                    sink.clear();
                    return;
                }
                Err(error) => {
                    tracing::error!(%error, "could not decode element");
                }
            }
        }
    }
}

/// Dispatcher loop: applies messages strictly serially so later messages
/// observe earlier mutations.
async fn dispatcher_loop(
    mut msg_rx: mpsc::Receiver<ServerMessage>,
    catalog: Arc<Catalog>,
    sink: Arc<BlobSink>,
) {
    while let Some(msg) = msg_rx.recv().await {
        tracing::debug!(element = msg.element(), "got message");
        catalog.apply(msg, &sink).await;
    }
}

/// Writer loop: serializes queued commands and writes them out. A command
/// that fails to marshal or write is logged and dropped; the consumer notices
/// through subsequent operation failures or the connection state.
async fn writer_loop(mut write_half: WriteHalf<Box<dyn Connection>>, mut cmd_rx: mpsc::Receiver<Command>) {
    while let Some(cmd) = cmd_rx.recv().await {
        let xml = match encode(&cmd) {
            Ok(xml) => xml,
            Err(error) => {
                tracing::error!(element = cmd.element(), %error, "could not marshal command");
                continue;
            }
        };
        tracing::debug!(cmd = %xml, "sending command");
        if let Err(error) = write_half.write_all(xml.as_bytes()).await {
            tracing::error!(%error, "could not write command");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::sync::Mutex;

    /// Dialer over an in-memory pipe; the far end plays the server.
    struct MemoryDialer {
        client_half: Mutex<Option<DuplexStream>>,
    }

    #[async_trait]
    impl Dialer for MemoryDialer {
        async fn dial(&self, _network: &str, _address: &str) -> IndiResult<Box<dyn Connection>> {
            self.client_half
                .lock()
                .await
                .take()
                .map(|s| Box::new(s) as Box<dyn Connection>)
                .ok_or_else(|| {
                    IndiError::Dial(std::io::Error::new(
                        std::io::ErrorKind::ConnectionRefused,
                        "pipe already taken",
                    ))
                })
        }
    }

    struct Harness {
        client: IndiClient,
        server: DuplexStream,
        dir: tempfile::TempDir,
    }

    async fn connected_client() -> Harness {
        let (client_half, server) = tokio::io::duplex(64 * 1024);
        let dialer = Arc::new(MemoryDialer {
            client_half: Mutex::new(Some(client_half)),
        });
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalStorage::new(dir.path()));
        let config = ClientConfig {
            poll_interval_ms: 5,
            set_timeout_secs: 5,
            ..ClientConfig::default()
        };
        let mut client = IndiClient::new(dialer, storage, config);
        client.connect("tcp", "mem").await.unwrap();
        Harness { client, server, dir }
    }

    async fn inject(server: &mut DuplexStream, xml: &str) {
        server.write_all(xml.as_bytes()).await.unwrap();
    }

    /// Poll a condition until it holds or a generous deadline passes.
    macro_rules! eventually {
        ($cond:expr) => {{
            let mut held = false;
            for _ in 0..400 {
                if $cond {
                    held = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            held
        }};
    }

    /// Read outbound bytes until the pattern shows up.
    async fn read_until(server: &mut DuplexStream, pattern: &str) -> String {
        let mut out = String::new();
        let mut buf = [0u8; 4096];
        loop {
            match tokio::time::timeout(Duration::from_secs(2), server.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    out.push_str(&String::from_utf8_lossy(&buf[..n]));
                    if out.contains(pattern) {
                        break;
                    }
                }
                _ => break,
            }
        }
        out
    }

    /// Assert nothing is written outbound within a short window.
    async fn assert_no_outbound(server: &mut DuplexStream) {
        let mut buf = [0u8; 256];
        let read = tokio::time::timeout(Duration::from_millis(100), server.read(&mut buf)).await;
        assert!(read.is_err(), "unexpected outbound bytes");
    }

    const CONNECTION_DEF: &str = r#"<defSwitchVector device="Telescope Simulator" name="CONNECTION" label="Connection" group="Main Control" state="Idle" perm="rw" rule="OneOfMany" timeout="60"><defSwitch name="CONNECT" label="Connect">Off</defSwitch><defSwitch name="DISCONNECT" label="Disconnect">On</defSwitch></defSwitchVector>"#;

    const BLOB_DEF: &str = r#"<defBLOBVector device="cam" name="CCD1" label="Image" group="Main" state="Idle" perm="ro" timeout="60"><defBLOB name="CCD1" label="Image"/></defBLOBVector>"#;

    // AQIDBAU= is bytes 01 02 03 04 05.
    const BLOB_SET: &str = r#"<setBLOBVector device="cam" name="CCD1" state="Ok"><oneBLOB name="CCD1" size="5" format=".bin">AQIDBAU=</oneBLOB></setBLOBVector>"#;

    #[tokio::test]
    async fn test_device_discovery() {
        let mut h = connected_client().await;

        h.client.get_properties("", "").await.unwrap();
        let sent = read_until(&mut h.server, "getProperties").await;
        assert!(sent.contains(r#"<getProperties version="1.7"/>"#));

        inject(&mut h.server, CONNECTION_DEF).await;
        assert!(eventually!(
            h.client.devices().await == vec!["Telescope Simulator".to_string()]
        ));
        assert!(h.client.switch_property_set("Telescope Simulator", "CONNECTION").await);
        let connect = h
            .client
            .get_switch("Telescope Simulator", "CONNECTION", "CONNECT")
            .await
            .unwrap();
        assert_eq!(connect.value, SwitchState::Off);
    }

    #[tokio::test]
    async fn test_set_and_resolve() {
        let mut h = connected_client().await;
        inject(&mut h.server, CONNECTION_DEF).await;
        assert!(eventually!(
            h.client.switch_property_set("Telescope Simulator", "CONNECTION").await
        ));

        let client = Arc::new(h.client);
        let setter = client.clone();
        let handle = tokio::spawn(async move {
            setter
                .set_switch(
                    "Telescope Simulator",
                    "CONNECTION",
                    &["CONNECT"],
                    &[SwitchState::On],
                )
                .await
        });

        let sent = read_until(&mut h.server, "</newSwitchVector>").await;
        assert_eq!(sent.matches("<newSwitchVector").count(), 1);
        assert!(sent.contains(r#"<oneSwitch name="CONNECT">On</oneSwitch>"#));
        assert_no_outbound(&mut h.server).await;

        inject(
            &mut h.server,
            r#"<setSwitchVector device="Telescope Simulator" name="CONNECTION" state="Ok"><oneSwitch name="CONNECT">On</oneSwitch><oneSwitch name="DISCONNECT">Off</oneSwitch></setSwitchVector>"#,
        )
        .await;

        handle.await.unwrap().unwrap();
        let connect = client
            .get_switch("Telescope Simulator", "CONNECTION", "CONNECT")
            .await
            .unwrap();
        assert_eq!(connect.value, SwitchState::On);
    }

    #[tokio::test]
    async fn test_failure_resolution() {
        let mut h = connected_client().await;
        inject(&mut h.server, CONNECTION_DEF).await;
        assert!(eventually!(
            h.client.switch_property_set("Telescope Simulator", "CONNECTION").await
        ));

        let client = Arc::new(h.client);
        let setter = client.clone();
        let handle = tokio::spawn(async move {
            setter
                .set_switch(
                    "Telescope Simulator",
                    "CONNECTION",
                    &["CONNECT"],
                    &[SwitchState::On],
                )
                .await
        });

        read_until(&mut h.server, "</newSwitchVector>").await;
        inject(
            &mut h.server,
            r#"<setSwitchVector device="Telescope Simulator" name="CONNECTION" state="Alert"><oneSwitch name="CONNECT">Off</oneSwitch></setSwitchVector>"#,
        )
        .await;

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(IndiError::PropertyAlert { .. })));
    }

    #[tokio::test]
    async fn test_blob_capture() {
        let mut h = connected_client().await;
        inject(&mut h.server, BLOB_DEF).await;
        assert!(eventually!(h.client.blob_property_set("cam", "CCD1").await));

        inject(&mut h.server, BLOB_SET).await;
        assert!(eventually!(h.client.blob_available("cam", "CCD1", "CCD1").await));

        let stored = std::fs::read(h.dir.path().join("cam_CCD1_CCD1.bin")).unwrap();
        assert_eq!(stored, [1, 2, 3, 4, 5]);

        let (mut reader, file_name, length) = h.client.get_blob("cam", "CCD1", "CCD1").await.unwrap();
        assert_eq!(file_name, "cam_CCD1_CCD1.bin");
        assert_eq!(length, 5);
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).await.unwrap();
        assert_eq!(bytes, [1, 2, 3, 4, 5]);

        // Consumption resets the arming; a second read finds nothing.
        assert!(!h.client.blob_available("cam", "CCD1", "CCD1").await);
        assert!(matches!(
            h.client.get_blob("cam", "CCD1", "CCD1").await,
            Err(IndiError::BlobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_blob_fan_out() {
        let mut h = connected_client().await;
        inject(&mut h.server, BLOB_DEF).await;
        assert!(eventually!(h.client.blob_property_set("cam", "CCD1").await));

        let (mut sub_a, _id_a) = h.client.get_blob_stream("cam", "CCD1", "CCD1").await.unwrap();
        let (mut sub_b, id_b) = h.client.get_blob_stream("cam", "CCD1", "CCD1").await.unwrap();

        inject(&mut h.server, BLOB_SET).await;
        assert_eq!(sub_a.recv().await.unwrap().as_ref(), &[1, 2, 3, 4, 5][..]);
        assert_eq!(sub_b.recv().await.unwrap().as_ref(), &[1, 2, 3, 4, 5][..]);
        assert!(h.dir.path().join("cam_CCD1_CCD1.bin").exists());

        h.client.close_blob_stream("cam", "CCD1", "CCD1", id_b).await.unwrap();

        // Re-arm with different bytes: CgsMDQ4= is 0a 0b 0c 0d 0e.
        inject(
            &mut h.server,
            r#"<setBLOBVector device="cam" name="CCD1" state="Ok"><oneBLOB name="CCD1" size="5" format=".bin">CgsMDQ4=</oneBLOB></setBLOBVector>"#,
        )
        .await;

        assert_eq!(sub_a.recv().await.unwrap().as_ref(), &[10, 11, 12, 13, 14][..]);
        assert!(sub_b.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_purge_on_disconnect() {
        let mut h = connected_client().await;
        inject(&mut h.server, CONNECTION_DEF).await;
        inject(
            &mut h.server,
            r#"<defSwitchVector device="CCD Simulator" name="CONNECTION" state="Idle" perm="rw"><defSwitch name="CONNECT">Off</defSwitch></defSwitchVector>"#,
        )
        .await;
        assert!(eventually!(h.client.devices().await.len() == 2));

        h.client.disconnect().await.unwrap();
        assert!(h.client.devices().await.is_empty());
        assert!(!h.client.is_connected());

        // Disconnecting again is a no-op.
        h.client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_set_against_busy_property_fails_without_enqueueing() {
        let mut h = connected_client().await;
        inject(
            &mut h.server,
            r#"<defSwitchVector device="D" name="P" state="Busy" perm="rw"><defSwitch name="S">Off</defSwitch></defSwitchVector>"#,
        )
        .await;
        assert!(eventually!(h.client.switch_property_set("D", "P").await));

        let result = h.client.set_switch("D", "P", &["S"], &[SwitchState::On]).await;
        assert!(matches!(result, Err(IndiError::PropertyBusy { .. })));
        assert_no_outbound(&mut h.server).await;
    }

    #[tokio::test]
    async fn test_set_against_read_only_property_fails_without_enqueueing() {
        let mut h = connected_client().await;
        inject(
            &mut h.server,
            r#"<defSwitchVector device="D" name="P" state="Idle" perm="ro"><defSwitch name="S">Off</defSwitch></defSwitchVector>"#,
        )
        .await;
        assert!(eventually!(h.client.switch_property_set("D", "P").await));

        let result = h.client.set_switch("D", "P", &["S"], &[SwitchState::On]).await;
        assert!(matches!(result, Err(IndiError::PropertyReadOnly { .. })));
        assert_no_outbound(&mut h.server).await;
    }

    #[tokio::test]
    async fn test_set_with_mismatched_lengths_fails_without_enqueueing() {
        let mut h = connected_client().await;
        inject(&mut h.server, CONNECTION_DEF).await;
        assert!(eventually!(
            h.client.switch_property_set("Telescope Simulator", "CONNECTION").await
        ));

        let result = h
            .client
            .set_switch(
                "Telescope Simulator",
                "CONNECTION",
                &["CONNECT", "DISCONNECT"],
                &[SwitchState::On],
            )
            .await;
        assert!(matches!(result, Err(IndiError::LengthMismatch { names: 2, values: 1 })));
        assert_no_outbound(&mut h.server).await;

        // The property was not marked busy by the rejected call.
        let state = h
            .client
            .catalog
            .property_state(PropertyKind::Switch, "Telescope Simulator", "CONNECTION")
            .await
            .unwrap();
        assert_eq!(state, PropertyState::Idle);
    }

    #[tokio::test]
    async fn test_get_properties_rejects_property_without_device() {
        let h = connected_client().await;
        let result = h.client.get_properties("", "CONNECTION").await;
        assert!(matches!(result, Err(IndiError::PropertyWithoutDevice)));
    }

    #[tokio::test]
    async fn test_enable_blob_requires_known_device() {
        let mut h = connected_client().await;
        let result = h.client.enable_blob("cam", "", BlobEnable::Also).await;
        assert!(matches!(result, Err(IndiError::DeviceNotFound(_))));

        inject(&mut h.server, BLOB_DEF).await;
        assert!(eventually!(h.client.blob_property_set("cam", "CCD1").await));
        h.client.enable_blob("cam", "", BlobEnable::Also).await.unwrap();
        let sent = read_until(&mut h.server, "</enableBLOB>").await;
        assert!(sent.contains(r#"<enableBLOB device="cam">Also</enableBLOB>"#));
    }

    #[tokio::test]
    async fn test_unknown_inbound_element_does_not_disturb_later_messages() {
        let mut h = connected_client().await;
        inject(
            &mut h.server,
            r#"<mysteryElement foo="bar"><child/></mysteryElement>"#,
        )
        .await;
        inject(&mut h.server, CONNECTION_DEF).await;
        assert!(eventually!(
            h.client.devices().await == vec!["Telescope Simulator".to_string()]
        ));
    }

    #[tokio::test]
    async fn test_del_property_with_empty_device_purges_all() {
        let mut h = connected_client().await;
        inject(&mut h.server, CONNECTION_DEF).await;
        inject(&mut h.server, BLOB_DEF).await;
        assert!(eventually!(h.client.devices().await.len() == 2));

        inject(&mut h.server, "<delProperty/>").await;
        assert!(eventually!(h.client.devices().await.is_empty()));
    }

    #[tokio::test]
    async fn test_server_close_purges_and_fails_in_flight_set() {
        let mut h = connected_client().await;
        inject(&mut h.server, CONNECTION_DEF).await;
        assert!(eventually!(
            h.client.switch_property_set("Telescope Simulator", "CONNECTION").await
        ));

        let client = Arc::new(h.client);
        let setter = client.clone();
        let handle = tokio::spawn(async move {
            setter
                .set_switch(
                    "Telescope Simulator",
                    "CONNECTION",
                    &["CONNECT"],
                    &[SwitchState::On],
                )
                .await
        });
        read_until(&mut h.server, "</newSwitchVector>").await;

        // The server goes away: the reader purges the catalog and the
        // in-flight set observes the cleared state and fails.
        drop(h.server);
        let result = handle.await.unwrap();
        assert!(result.is_err());
        assert!(eventually!(!client.is_connected()));
        assert!(client.devices().await.is_empty());
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let client = IndiClient::new(
            Arc::new(MemoryDialer {
                client_half: Mutex::new(None),
            }),
            Arc::new(LocalStorage::default()),
            ClientConfig::default(),
        );
        assert!(!client.is_connected());
        assert!(matches!(
            client.get_properties("", "").await,
            Err(IndiError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_number_set_preserves_precision() {
        let mut h = connected_client().await;
        inject(
            &mut h.server,
            r#"<defNumberVector device="D" name="P" state="Idle" perm="rw"><defNumber name="N" format="%.9f" min="0" max="10" step="0">1</defNumber></defNumberVector>"#,
        )
        .await;
        assert!(eventually!(h.client.number_property_set("D", "P").await));

        let client = Arc::new(h.client);
        let setter = client.clone();
        let handle = tokio::spawn(async move {
            setter.set_number("D", "P", &["N"], &["3.141592653589793"]).await
        });

        let sent = read_until(&mut h.server, "</newNumberVector>").await;
        assert!(sent.contains(r#"<oneNumber name="N">3.141592653589793</oneNumber>"#));

        inject(
            &mut h.server,
            r#"<setNumberVector device="D" name="P" state="Ok"><oneNumber name="N">3.141592653589793</oneNumber></setNumberVector>"#,
        )
        .await;
        handle.await.unwrap().unwrap();
        assert_eq!(
            client.get_number("D", "P", "N").await.unwrap().value,
            "3.141592653589793"
        );
    }
}
