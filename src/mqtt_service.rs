//! Device connection manager: one MQTT client per configured device, kept in line
//! with the device roster by `reconcile`.

use crate::models::{Device, DeviceStatus, Viewer};
use crate::pipeline::{DeviceContext, IngestionPipeline};
use crate::storage::{Storage, StorageError};
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use url::Url;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("invalid broker url '{0}': {1}")]
    InvalidUrl(String, url::ParseError),
    #[error("unsupported broker scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("broker url '{0}' has no host")]
    MissingHost(String),
}

#[derive(Debug, Error)]
enum PollError {
    #[error("{0}")]
    Connection(#[from] ConnectionError),
    #[error("connect attempt timed out after {0:?}")]
    Timeout(Duration),
}

/// Builds the broker URL for a device. Values that already carry a scheme are used
/// verbatim; bare `host[:port]` values get a scheme derived from `protocol`.
pub fn broker_url(broker: &str, protocol: Option<&str>) -> String {
    if broker.contains("://") {
        return broker.to_string();
    }

    let mut parts = broker.split(':');
    let host = parts.next().unwrap_or_default();
    let port = parts.next().filter(|p| !p.is_empty());

    let protocol = protocol.unwrap_or("mqtt").to_lowercase();
    let prefix = match protocol.as_str() {
        "mqtts" => "mqtts://",
        "websocket" | "ws" => "ws://",
        "websocket secure" | "wss" => "wss://",
        _ => "mqtt://",
    };

    match port {
        Some(port) => format!("{}{}:{}", prefix, host, port),
        None => format!("{}{}", prefix, host),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Mqtt,
    Mqtts,
    Ws,
    Wss,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub url: String,
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl BrokerEndpoint {
    pub fn parse(raw: &str) -> Result<Self, EndpointError> {
        let parsed = Url::parse(raw).map_err(|e| EndpointError::InvalidUrl(raw.to_string(), e))?;
        let (scheme, default_port) = match parsed.scheme() {
            "mqtt" | "tcp" => (Scheme::Mqtt, 1883),
            "mqtts" | "ssl" => (Scheme::Mqtts, 8883),
            "ws" => (Scheme::Ws, 80),
            "wss" => (Scheme::Wss, 443),
            other => return Err(EndpointError::UnsupportedScheme(other.to_string())),
        };
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| EndpointError::MissingHost(raw.to_string()))?
            .to_string();
        let path = match parsed.path() {
            "" | "/" => "/mqtt".to_string(),
            path => path.to_string(),
        };

        Ok(Self {
            url: raw.to_string(),
            scheme,
            port: parsed.port().unwrap_or(default_port),
            host,
            path,
        })
    }

    fn mqtt_options(&self, client_id: &str, keep_alive: Duration) -> MqttOptions {
        let mut options = match self.scheme {
            Scheme::Mqtt | Scheme::Mqtts => MqttOptions::new(client_id, &self.host, self.port),
            Scheme::Ws | Scheme::Wss => {
                let prefix = if self.scheme == Scheme::Ws { "ws" } else { "wss" };
                let address = format!("{}://{}:{}{}", prefix, self.host, self.port, self.path);
                MqttOptions::new(client_id, address, self.port)
            }
        };
        match self.scheme {
            Scheme::Mqtt => {}
            Scheme::Mqtts => {
                options.set_transport(Transport::tls_with_default_config());
            }
            Scheme::Ws => {
                options.set_transport(Transport::Ws);
            }
            Scheme::Wss => {
                options.set_transport(Transport::wss_with_default_config());
            }
        }
        options.set_keep_alive(keep_alive);
        options.set_clean_session(true);
        options
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub reconnect_interval: Duration,
    pub connect_timeout: Duration,
    pub keep_alive: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub device_id: i64,
    pub url: String,
    pub topic: String,
}

struct LiveConnection {
    url: String,
    topic: String,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl LiveConnection {
    /// Signals the device task to disconnect and exit.
    fn close(self) -> JoinHandle<()> {
        let _ = self.stop.send(());
        self.task
    }
}

pub struct ConnectionManager {
    storage: Arc<dyn Storage>,
    pipeline: Arc<IngestionPipeline>,
    options: ConnectionOptions,
    connections: Mutex<HashMap<i64, LiveConnection>>,
}

impl ConnectionManager {
    pub fn new(
        storage: Arc<dyn Storage>,
        pipeline: Arc<IngestionPipeline>,
        options: ConnectionOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            pipeline,
            options,
            connections: Mutex::new(HashMap::new()),
        })
    }

    /// Loads the full roster and reconciles against it.
    pub async fn sync(&self) -> Result<(), StorageError> {
        let devices = self.storage.get_devices(&Viewer::system()).await?;
        self.reconcile(&devices).await;
        Ok(())
    }

    /// Brings live connections in line with `devices`. Safe to call repeatedly and
    /// concurrently: a device is opened at most once and closed exactly once.
    pub async fn reconcile(&self, devices: &[Device]) {
        for device in devices.iter().filter(|d| d.status != DeviceStatus::Offline) {
            set_status(self.storage.as_ref(), device.id, DeviceStatus::Offline).await;
        }

        let roster: HashSet<i64> = devices.iter().map(|d| d.id).collect();
        let mut failed = Vec::new();
        let mut removed = Vec::new();
        {
            let mut connections = self.lock();

            for device in devices {
                let Some((broker, topic)) = device.connection_target() else {
                    continue;
                };
                if connections.contains_key(&device.id) {
                    continue;
                }
                match self.open(device, broker, topic) {
                    Ok(connection) => {
                        connections.insert(device.id, connection);
                    }
                    Err(e) => {
                        error!("Failed to connect MQTT for device {}: {}", device.id, e);
                        failed.push(device.id);
                    }
                }
            }

            let stale: Vec<i64> = connections
                .keys()
                .filter(|id| !roster.contains(id))
                .copied()
                .collect();
            for id in stale {
                if let Some(connection) = connections.remove(&id) {
                    removed.push((id, connection));
                }
            }
        }

        for (id, connection) in removed {
            info!("Closing MQTT connection of removed device {} ({}).", id, connection.url);
            connection.close();
        }
        for id in failed {
            set_status(self.storage.as_ref(), id, DeviceStatus::Error).await;
        }
    }

    /// Tears down the connection of one device. Returns false when none was open.
    pub fn disconnect(&self, device_id: i64) -> bool {
        let connection = self.lock().remove(&device_id);
        match connection {
            Some(connection) => {
                info!("Closing MQTT connection of device {} ({}).", device_id, connection.url);
                connection.close();
                true
            }
            None => false,
        }
    }

    /// Closes every connection and waits briefly for the device tasks to finish.
    pub async fn shutdown(&self) {
        let connections: Vec<LiveConnection> = self.lock().drain().map(|(_, c)| c).collect();
        info!("Closing {} MQTT connection(s)...", connections.len());
        for task in connections.into_iter().map(LiveConnection::close) {
            if timeout(Duration::from_secs(2), task).await.is_err() {
                warn!("MQTT connection did not close in time.");
            }
        }
    }

    pub fn live_connections(&self) -> Vec<ConnectionInfo> {
        let mut live: Vec<ConnectionInfo> = self
            .lock()
            .iter()
            .map(|(id, c)| ConnectionInfo {
                device_id: *id,
                url: c.url.clone(),
                topic: c.topic.clone(),
            })
            .collect();
        live.sort_by_key(|c| c.device_id);
        live
    }

    fn open(&self, device: &Device, broker: &str, topic: &str) -> Result<LiveConnection, EndpointError> {
        let url = broker_url(broker, device.protocol.as_deref());
        let endpoint = BrokerEndpoint::parse(&url)?;
        let client_id = format!("tf_{}_{}", device.id, &Uuid::new_v4().simple().to_string()[..8]);

        let mut mqtt_options = endpoint.mqtt_options(&client_id, self.options.keep_alive);
        if let Some(username) = device.username.as_deref().filter(|u| !u.is_empty()) {
            mqtt_options.set_credentials(username, device.password.clone().unwrap_or_default());
        }

        info!("Connecting device {} ({}) -> {}", device.id, device.name, url);
        let (client, eventloop) = AsyncClient::new(mqtt_options, 10);
        let (stop_tx, stop_rx) = oneshot::channel();

        let link = DeviceLink {
            device: DeviceContext {
                id: device.id,
                owner_id: device.owner_id.clone(),
            },
            topic: topic.to_string(),
            client,
            storage: Arc::clone(&self.storage),
            pipeline: Arc::clone(&self.pipeline),
            options: self.options.clone(),
        };
        let task = tokio::spawn(link.run(eventloop, stop_rx));

        Ok(LiveConnection {
            url,
            topic: topic.to_string(),
            stop: stop_tx,
            task,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, LiveConnection>> {
        self.connections.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Best-effort status write; a device deleted in the meantime is not an error.
async fn set_status(storage: &dyn Storage, device_id: i64, status: DeviceStatus) {
    match storage.update_device_status(device_id, status).await {
        Ok(Some(_)) => debug!("Device {} is now {}.", device_id, status),
        Ok(None) => debug!("Device {} vanished before status '{}' was recorded.", device_id, status),
        Err(e) => error!("Failed to record status '{}' for device {}: {}", status, device_id, e),
    }
}

/// State owned by the task that drives one device's event loop.
struct DeviceLink {
    device: DeviceContext,
    topic: String,
    client: AsyncClient,
    storage: Arc<dyn Storage>,
    pipeline: Arc<IngestionPipeline>,
    options: ConnectionOptions,
}

impl DeviceLink {
    async fn run(self, mut eventloop: EventLoop, mut stop: oneshot::Receiver<()>) {
        let mut connected = false;

        loop {
            let polled = tokio::select! {
                biased;
                _ = &mut stop => {
                    self.disconnect(&mut eventloop, connected).await;
                    return;
                }
                polled = self.poll(&mut eventloop, connected) => polled,
            };

            match polled {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    connected = true;
                    info!("MQTT connected: device {}, subscribing to '{}'.", self.device.id, self.topic);
                    if let Err(e) = self.client.try_subscribe(self.topic.as_str(), QoS::AtLeastOnce) {
                        error!("Failed to subscribe device {} to '{}': {}", self.device.id, self.topic, e);
                    }
                    set_status(self.storage.as_ref(), self.device.id, DeviceStatus::Connected).await;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.pipeline.handle_message(&self.device, &publish.payload).await;
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    connected = false;
                    info!("Broker closed the connection of device {}.", self.device.id);
                    set_status(self.storage.as_ref(), self.device.id, DeviceStatus::Offline).await;
                }
                Ok(_) => {}
                Err(e) => {
                    // Losing an established session is a close; failing to get one is an error.
                    let status = if connected {
                        info!("MQTT connection of device {} closed: {}", self.device.id, e);
                        DeviceStatus::Offline
                    } else {
                        warn!("MQTT error for device {}: {}", self.device.id, e);
                        DeviceStatus::Error
                    };
                    connected = false;
                    set_status(self.storage.as_ref(), self.device.id, status).await;

                    tokio::select! {
                        _ = &mut stop => return,
                        _ = sleep(self.options.reconnect_interval) => {}
                    }
                }
            }
        }
    }

    async fn poll(&self, eventloop: &mut EventLoop, connected: bool) -> Result<Event, PollError> {
        if connected {
            return Ok(eventloop.poll().await?);
        }
        match timeout(self.options.connect_timeout, eventloop.poll()).await {
            Ok(event) => Ok(event?),
            Err(_) => Err(PollError::Timeout(self.options.connect_timeout)),
        }
    }

    async fn disconnect(&self, eventloop: &mut EventLoop, connected: bool) {
        if !connected || self.client.try_disconnect().is_err() {
            return;
        }
        // Drive the loop until the DISCONNECT packet is on the wire.
        let flush = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        let _ = timeout(Duration::from_secs(1), flush).await;
        debug!("Device {} disconnected.", self.device.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Hub;
    use crate::inference::HeuristicInference;
    use crate::metadata::{Enricher, MetadataCache};
    use crate::models::NewDevice;
    use crate::storage::MemoryStorage;

    #[test]
    fn bare_host_port_gets_protocol_prefix() {
        assert_eq!(broker_url("host:1883", Some("mqtt")), "mqtt://host:1883");
        assert_eq!(broker_url("host:8883", Some("MQTTS")), "mqtts://host:8883");
        assert_eq!(broker_url("host:9001", Some("websocket")), "ws://host:9001");
        assert_eq!(broker_url("host:9001", Some("ws")), "ws://host:9001");
        assert_eq!(broker_url("host:443", Some("websocket secure")), "wss://host:443");
        assert_eq!(broker_url("host:443", Some("wss")), "wss://host:443");
        assert_eq!(broker_url("host:1", Some("carrier-pigeon")), "mqtt://host:1");
        assert_eq!(broker_url("host:1883", None), "mqtt://host:1883");
    }

    #[test]
    fn port_is_reattached_only_when_present() {
        assert_eq!(broker_url("broker.local", Some("mqtt")), "mqtt://broker.local");
        assert_eq!(broker_url("broker.local:", Some("ws")), "ws://broker.local");
    }

    #[test]
    fn urls_with_scheme_are_used_verbatim() {
        assert_eq!(broker_url("wss://b.example/mqtt", Some("mqtt")), "wss://b.example/mqtt");
    }

    #[test]
    fn endpoints_resolve_default_ports_and_paths() {
        let tcp = BrokerEndpoint::parse("mqtt://host").unwrap();
        assert_eq!((tcp.scheme, tcp.port), (Scheme::Mqtt, 1883));

        let tls = BrokerEndpoint::parse("mqtts://host").unwrap();
        assert_eq!((tls.scheme, tls.port), (Scheme::Mqtts, 8883));

        let ws = BrokerEndpoint::parse("ws://host:9001").unwrap();
        assert_eq!((ws.scheme, ws.port, ws.path.as_str()), (Scheme::Ws, 9001, "/mqtt"));

        let wss = BrokerEndpoint::parse("wss://host/custom").unwrap();
        assert_eq!((wss.scheme, wss.port, wss.path.as_str()), (Scheme::Wss, 443, "/custom"));

        assert!(matches!(
            BrokerEndpoint::parse("http://host"),
            Err(EndpointError::UnsupportedScheme(_))
        ));
        assert!(BrokerEndpoint::parse("not a url").is_err());
    }

    struct Harness {
        manager: Arc<ConnectionManager>,
        hub: Arc<Hub>,
        cache: Arc<MetadataCache>,
    }

    fn harness(storage: Arc<MemoryStorage>, reconnect_interval: Duration) -> Harness {
        let hub = Arc::new(Hub::new(8));
        let cache = Arc::new(MetadataCache::in_memory());
        let enricher = Enricher::new(cache.clone(), Arc::new(HeuristicInference));
        let pipeline = Arc::new(IngestionPipeline::new(storage.clone(), enricher, hub.clone()));
        let manager = ConnectionManager::new(
            storage,
            pipeline,
            ConnectionOptions {
                reconnect_interval,
                connect_timeout: Duration::from_millis(200),
                keep_alive: Duration::from_secs(5),
            },
        );
        Harness { manager, hub, cache }
    }

    fn manager(storage: Arc<MemoryStorage>) -> Arc<ConnectionManager> {
        harness(storage, Duration::from_millis(50)).manager
    }

    async fn add_device(storage: &MemoryStorage, owner: &str, broker: Option<&str>) -> Device {
        storage
            .create_device(
                owner,
                NewDevice {
                    name: format!("{}-device", owner),
                    broker: broker.map(str::to_string),
                    protocol: Some("mqtt".into()),
                    topic: Some("t".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let storage = Arc::new(MemoryStorage::new(10));
        let d1 = add_device(&storage, "u1", Some("127.0.0.1:1")).await;
        let manager = manager(storage.clone());

        manager.sync().await.unwrap();
        manager.sync().await.unwrap();

        assert_eq!(
            manager.live_connections(),
            vec![ConnectionInfo {
                device_id: d1.id,
                url: "mqtt://127.0.0.1:1".into(),
                topic: "t".into(),
            }]
        );
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn removed_devices_are_disconnected() {
        let storage = Arc::new(MemoryStorage::new(10));
        let d1 = add_device(&storage, "u1", Some("127.0.0.1:1")).await;
        let d2 = add_device(&storage, "u2", Some("127.0.0.1:1")).await;
        let manager = manager(storage.clone());
        manager.sync().await.unwrap();
        assert_eq!(manager.live_connections().len(), 2);

        storage.delete_device(d1.id).await.unwrap();
        manager.sync().await.unwrap();
        manager.sync().await.unwrap();

        let live = manager.live_connections();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].device_id, d2.id);

        storage.delete_device(d2.id).await.unwrap();
        manager.sync().await.unwrap();
        assert!(manager.live_connections().is_empty());
    }

    #[tokio::test]
    async fn reconcile_resets_stale_status_and_skips_incomplete_devices() {
        let storage = Arc::new(MemoryStorage::new(10));
        let d = add_device(&storage, "u1", None).await;
        storage.update_device_status(d.id, DeviceStatus::Connected).await.unwrap();
        let manager = manager(storage.clone());

        manager.sync().await.unwrap();

        assert!(manager.live_connections().is_empty());
        let after = storage.get_device(d.id).await.unwrap().unwrap();
        assert_eq!(after.status, DeviceStatus::Offline);
    }

    #[tokio::test]
    async fn unreachable_broker_marks_device_error() {
        let storage = Arc::new(MemoryStorage::new(10));
        let d = add_device(&storage, "u1", Some("127.0.0.1:1")).await;
        let manager = manager(storage.clone());
        manager.sync().await.unwrap();

        let mut status = DeviceStatus::Offline;
        for _ in 0..100 {
            status = storage.get_device(d.id).await.unwrap().unwrap().status;
            if status == DeviceStatus::Error {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, DeviceStatus::Error);
        assert_eq!(manager.live_connections().len(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_broker_url_sets_error_without_connection() {
        let storage = Arc::new(MemoryStorage::new(10));
        let d = add_device(&storage, "u1", Some("http://example.com")).await;
        let manager = manager(storage.clone());
        manager.sync().await.unwrap();

        assert!(manager.live_connections().is_empty());
        let after = storage.get_device(d.id).await.unwrap().unwrap();
        assert_eq!(after.status, DeviceStatus::Error);
    }

    #[tokio::test]
    async fn disconnect_closes_exactly_once() {
        let storage = Arc::new(MemoryStorage::new(10));
        let d = add_device(&storage, "u1", Some("127.0.0.1:1")).await;
        let manager = manager(storage.clone());
        manager.sync().await.unwrap();

        assert!(manager.disconnect(d.id));
        assert!(!manager.disconnect(d.id));
        manager.sync().await.unwrap();
        assert_eq!(manager.live_connections().len(), 1);
        manager.shutdown().await;
        assert!(manager.live_connections().is_empty());
    }

    /// Minimal MQTT 3.1.1 broker side: accepts one client, acknowledges CONNECT and
    /// SUBSCRIBE, and returns the stream with the subscribed topic.
    mod broker {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::{TcpListener, TcpStream};

        async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
            let header = stream.read_u8().await?;
            let mut len = 0usize;
            let mut shift = 0;
            loop {
                let byte = stream.read_u8().await?;
                len |= ((byte & 0x7f) as usize) << shift;
                if byte & 0x80 == 0 {
                    break;
                }
                shift += 7;
            }
            let mut body = vec![0; len];
            stream.read_exact(&mut body).await?;
            Ok((header, body))
        }

        pub async fn accept(listener: &TcpListener) -> (TcpStream, String) {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (header, _) = read_packet(&mut stream).await.unwrap();
            assert_eq!(header >> 4, 1, "expected CONNECT");
            stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

            let body = loop {
                let (header, body) = read_packet(&mut stream).await.unwrap();
                if header >> 4 == 8 {
                    break body;
                }
            };
            let topic_len = u16::from_be_bytes([body[2], body[3]]) as usize;
            let topic = String::from_utf8(body[4..4 + topic_len].to_vec()).unwrap();
            stream.write_all(&[0x90, 0x03, body[0], body[1], 0x01]).await.unwrap();
            (stream, topic)
        }

        pub async fn publish(stream: &mut TcpStream, topic: &str, payload: &[u8]) -> std::io::Result<()> {
            let mut packet = vec![0x30, (2 + topic.len() + payload.len()) as u8];
            packet.extend_from_slice(&(topic.len() as u16).to_be_bytes());
            packet.extend_from_slice(topic.as_bytes());
            packet.extend_from_slice(payload);
            stream.write_all(&packet).await
        }
    }

    async fn wait_for_status(storage: &MemoryStorage, id: i64, expected: DeviceStatus) -> DeviceStatus {
        let mut status = DeviceStatus::Offline;
        for _ in 0..200 {
            status = storage.get_device(id).await.unwrap().unwrap().status;
            if status == expected {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        status
    }

    async fn next_event(rx: &mut tokio::sync::mpsc::Receiver<Arc<str>>) -> serde_json::Value {
        let msg = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        serde_json::from_str(&msg).unwrap()
    }

    fn admin() -> crate::broadcast::Identity {
        crate::broadcast::Identity {
            user_id: "root".into(),
            role: crate::models::Role::Admin,
        }
    }

    #[tokio::test]
    async fn live_session_ingests_and_goes_offline_when_broker_closes() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let storage = Arc::new(MemoryStorage::new(10));
        let d = add_device(&storage, "u1", Some(addr.as_str())).await;
        let h = harness(storage.clone(), Duration::from_secs(10));
        let (sub, mut rx) = h.hub.open();
        h.hub.register(sub, admin());

        h.manager.sync().await.unwrap();
        let (mut stream, topic) = broker::accept(&listener).await;
        assert_eq!(topic, "t");
        assert_eq!(
            wait_for_status(&storage, d.id, DeviceStatus::Connected).await,
            DeviceStatus::Connected
        );

        broker::publish(&mut stream, "t", br#"{"temp": 23.5, "ok": true}"#).await.unwrap();
        let raw = next_event(&mut rx).await;
        assert_eq!(raw["deviceId"], d.id);
        assert_eq!(raw["data"]["raw"]["temp"], 23.5);
        for _ in 0..2 {
            assert!(next_event(&mut rx).await["data"]["reading"].is_object());
        }

        let mut stored: Vec<(String, f64)> = storage
            .get_readings(d.id, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.kind, r.value))
            .collect();
        stored.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(stored, vec![("ok".to_string(), 1.0), ("temp".to_string(), 23.5)]);
        assert!(h.cache.has("temp") && h.cache.has("ok"));

        drop(stream);
        assert_eq!(
            wait_for_status(&storage, d.id, DeviceStatus::Offline).await,
            DeviceStatus::Offline
        );
        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn deleted_device_stops_broadcasting() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let storage = Arc::new(MemoryStorage::new(10));
        let d = add_device(&storage, "u1", Some(addr.as_str())).await;
        let h = harness(storage.clone(), Duration::from_secs(10));
        let (sub, mut rx) = h.hub.open();
        h.hub.register(sub, admin());

        h.manager.sync().await.unwrap();
        let (mut stream, _) = broker::accept(&listener).await;
        wait_for_status(&storage, d.id, DeviceStatus::Connected).await;
        broker::publish(&mut stream, "t", br#"{"temp": 1}"#).await.unwrap();
        next_event(&mut rx).await;
        next_event(&mut rx).await;

        storage.delete_device(d.id).await.unwrap();
        h.manager.sync().await.unwrap();
        assert!(h.manager.live_connections().is_empty());

        let _ = broker::publish(&mut stream, "t", br#"{"temp": 2}"#).await;
        sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
        assert!(storage.get_recent_readings(&Viewer::system(), 10).await.unwrap().is_empty());
    }
}
