//! Java Discovery Protocol network discovery
//!
//! JVMs started with `-Dcom.sun.management.jdp.enable=true` periodically
//! multicast a small packet announcing their JMX service URL. A
//! [`JdpSource`] turns those packets into found/lost events; the
//! [`JdpPlatformClient`] re-emits them one to one as discovery events.
//!
//! Packet layout: magic `0xC0FFEE42` (u32, big endian), protocol version
//! (u16), then repeated key/value pairs, each a u16 length followed by that
//! many bytes of UTF-8.

use super::{DiscoveryListener, EnvironmentNode, EventKind, NodeType, PlatformClient, TargetDiscoveryEvent};
use crate::config::JdpConfig;
use crate::error::{CryostatError, Result};
use crate::events::{ListenerId, Listeners};
use crate::target::{parse_host_port, AnnotationKey, ServiceRef};
use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Realm name of network discovery
pub const REALM: &str = "JDP";

/// Packet magic
pub const JDP_MAGIC: u32 = 0xC0FF_EE42;
/// Supported protocol version
pub const JDP_VERSION: u16 = 1;

const KEY_SESSION_UUID: &str = "DISCOVERABLE_SESSION_UUID";
const KEY_MAIN_CLASS: &str = "MAIN_CLASS";
const KEY_JMX_SERVICE_URL: &str = "JMX_SERVICE_URL";
const KEY_INSTANCE_NAME: &str = "INSTANCE_NAME";
const KEY_PROCESS_ID: &str = "PROCESS_ID";
const KEY_BROADCAST_INTERVAL: &str = "BROADCAST_INTERVAL";

const DEFAULT_BROADCAST_INTERVAL: Duration = Duration::from_millis(5000);
const MAX_PACKET_SIZE: usize = 65_535;

/// Decodes one JDP packet into its key/value payload
///
/// # Errors
///
/// Returns `CryostatError::Discovery` for a wrong magic, an unsupported
/// version, truncated entries or invalid UTF-8.
pub fn decode_packet(data: &[u8]) -> Result<BTreeMap<String, String>> {
    let malformed = |msg: &str| CryostatError::discovery(REALM, format!("malformed packet: {}", msg));

    if data.len() < 6 {
        return Err(malformed("too short").into());
    }
    let magic = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    if magic != JDP_MAGIC {
        return Err(malformed("bad magic").into());
    }
    let version = u16::from_be_bytes([data[4], data[5]]);
    if version != JDP_VERSION {
        return Err(malformed(&format!("unsupported version {}", version)).into());
    }

    let mut pos = 6;
    let read_str = |pos: &mut usize| -> Result<String> {
        if *pos + 2 > data.len() {
            return Err(malformed("truncated length").into());
        }
        let len = u16::from_be_bytes([data[*pos], data[*pos + 1]]) as usize;
        *pos += 2;
        if *pos + len > data.len() {
            return Err(malformed("truncated value").into());
        }
        let s = std::str::from_utf8(&data[*pos..*pos + len])
            .map_err(|_| malformed("invalid utf-8"))?
            .to_string();
        *pos += len;
        Ok(s)
    };

    let mut entries = BTreeMap::new();
    while pos < data.len() {
        let key = read_str(&mut pos)?;
        let value = read_str(&mut pos)?;
        entries.insert(key, value);
    }
    Ok(entries)
}

/// Encodes a key/value payload as a JDP packet
pub fn encode_packet(entries: &BTreeMap<String, String>) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(&JDP_MAGIC.to_be_bytes());
    out.extend_from_slice(&JDP_VERSION.to_be_bytes());
    for (key, value) in entries {
        for s in [key, value] {
            let len = s.len().min(u16::MAX as usize);
            out.extend_from_slice(&(len as u16).to_be_bytes());
            out.extend_from_slice(&s.as_bytes()[..len]);
        }
    }
    out
}

/// One announced JVM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JdpRecord {
    /// Discoverable session id; unique per JVM run
    pub session_id: String,
    /// JMX service URL
    pub jmx_service_url: String,
    /// Main class or jar
    pub main_class: Option<String>,
    /// Instance name set via `com.sun.management.jdp.name`
    pub instance_name: Option<String>,
    /// Process id
    pub pid: Option<String>,
    /// Announced broadcast interval
    pub broadcast_interval: Duration,
}

impl JdpRecord {
    /// Builds a record from a decoded payload. Payloads without a session id
    /// or a JMX service URL are not announcements of a manageable JVM.
    pub fn from_entries(entries: &BTreeMap<String, String>) -> Option<Self> {
        let session_id = entries.get(KEY_SESSION_UUID)?.clone();
        let jmx_service_url = entries.get(KEY_JMX_SERVICE_URL)?.clone();
        let broadcast_interval = entries
            .get(KEY_BROADCAST_INTERVAL)
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_BROADCAST_INTERVAL);
        Some(Self {
            session_id,
            jmx_service_url,
            main_class: entries.get(KEY_MAIN_CLASS).cloned(),
            instance_name: entries.get(KEY_INSTANCE_NAME).cloned(),
            pid: entries.get(KEY_PROCESS_ID).cloned(),
            broadcast_interval,
        })
    }

    /// Converts the record into a target reference
    pub fn to_service_ref(&self) -> ServiceRef {
        let mut target = ServiceRef::new(&self.jmx_service_url)
            .with_cryostat_annotation(AnnotationKey::Realm, REALM);
        if let Some(alias) = self.instance_name.as_ref().or(self.main_class.as_ref()) {
            target = target.with_alias(alias.clone());
        }
        if let Some(main) = &self.main_class {
            target = target.with_cryostat_annotation(AnnotationKey::JavaMain, main.clone());
        }
        if let Some(pid) = &self.pid {
            target = target.with_cryostat_annotation(AnnotationKey::Pid, pid.clone());
        }
        if let Some((host, port)) = parse_host_port(&self.jmx_service_url) {
            target = target
                .with_cryostat_annotation(AnnotationKey::Host, host)
                .with_cryostat_annotation(AnnotationKey::Port, port.to_string());
        }
        target
    }
}

/// Change reported by a [`JdpSource`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JdpEvent {
    /// First packet of a session
    Found(JdpRecord),
    /// Session stopped broadcasting
    Lost(JdpRecord),
}

/// Tracks announced sessions and expires silent ones
#[derive(Debug)]
pub struct JdpTracker {
    missed_broadcasts: u32,
    sessions: HashMap<String, (JdpRecord, Instant)>,
}

impl JdpTracker {
    /// Creates a tracker losing sessions after `missed_broadcasts` silent intervals
    pub fn new(missed_broadcasts: u32) -> Self {
        Self {
            missed_broadcasts: missed_broadcasts.max(1),
            sessions: HashMap::new(),
        }
    }

    /// Records a packet; returns FOUND for a new session
    pub fn observe(&mut self, record: JdpRecord, now: Instant) -> Option<JdpEvent> {
        match self.sessions.get_mut(&record.session_id) {
            Some((_, last_seen)) => {
                *last_seen = now;
                None
            }
            None => {
                self.sessions
                    .insert(record.session_id.clone(), (record.clone(), now));
                Some(JdpEvent::Found(record))
            }
        }
    }

    /// Removes sessions silent for too long; returns LOST for each
    pub fn expire(&mut self, now: Instant) -> Vec<JdpEvent> {
        let missed = self.missed_broadcasts;
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, (record, last_seen))| {
                now.saturating_duration_since(*last_seen) > record.broadcast_interval * missed
            })
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.sessions.remove(&id))
            .map(|(record, _)| JdpEvent::Lost(record))
            .collect()
    }
}

/// Push-based source of JDP found/lost events
#[async_trait::async_trait]
pub trait JdpSource: Send + Sync {
    /// Starts producing events into `tx` until `token` is cancelled
    async fn run(&self, tx: mpsc::UnboundedSender<JdpEvent>, token: CancellationToken) -> Result<JoinHandle<()>>;
}

/// Multicast UDP listener
pub struct UdpJdpSource {
    config: JdpConfig,
}

impl UdpJdpSource {
    /// Creates a listener for the configured group and port
    pub fn new(config: JdpConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl JdpSource for UdpJdpSource {
    async fn run(&self, tx: mpsc::UnboundedSender<JdpEvent>, token: CancellationToken) -> Result<JoinHandle<()>> {
        let group: Ipv4Addr = self.config.multicast_address.parse().map_err(|e| {
            CryostatError::Startup(format!(
                "invalid JDP multicast address {}: {}",
                self.config.multicast_address, e
            ))
        })?;
        let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.config.port)))
            .await
            .map_err(|e| CryostatError::Startup(format!("JDP bind failed: {}", e)))?;
        socket
            .join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
            .map_err(|e| CryostatError::Startup(format!("JDP multicast join failed: {}", e)))?;

        info!(group = %group, port = self.config.port, "JDP listener started");
        let mut tracker = JdpTracker::new(self.config.lost_after_missed_broadcasts);

        Ok(tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_PACKET_SIZE];
            let mut sweep = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sweep.tick() => {
                        for event in tracker.expire(Instant::now()) {
                            if tx.send(event).is_err() {
                                return;
                            }
                        }
                    }
                    received = socket.recv_from(&mut buf) => {
                        let (len, from) = match received {
                            Ok(r) => r,
                            Err(e) => {
                                warn!(error = %e, "JDP receive failed");
                                continue;
                            }
                        };
                        let record = match decode_packet(&buf[..len]) {
                            Ok(entries) => JdpRecord::from_entries(&entries),
                            Err(e) => {
                                debug!(from = %from, error = %e, "Ignoring JDP packet");
                                None
                            }
                        };
                        if let Some(event) = record.and_then(|r| tracker.observe(r, Instant::now())) {
                            if tx.send(event).is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            debug!("JDP listener stopped");
        }))
    }
}

#[derive(Default)]
struct JdpState {
    services: Mutex<BTreeMap<String, ServiceRef>>,
    listeners: Listeners<TargetDiscoveryEvent>,
}

impl JdpState {
    fn apply(&self, event: JdpEvent) {
        let discovery_event = {
            let mut services = self.services.lock().unwrap_or_else(PoisonError::into_inner);
            match event {
                JdpEvent::Found(record) => {
                    let target = record.to_service_ref();
                    services.insert(record.session_id, target.clone());
                    TargetDiscoveryEvent::new(EventKind::Found, target)
                }
                JdpEvent::Lost(record) => {
                    let target = services
                        .remove(&record.session_id)
                        .unwrap_or_else(|| record.to_service_ref());
                    TargetDiscoveryEvent::new(EventKind::Lost, target)
                }
            }
        };
        debug!(kind = %discovery_event.kind, target = %discovery_event.service_ref, "JDP event");
        self.listeners.emit(&discovery_event);
    }
}

/// Discovery backend wrapping a [`JdpSource`]
pub struct JdpPlatformClient {
    source: Arc<dyn JdpSource>,
    state: Arc<JdpState>,
    running: tokio::sync::Mutex<Option<(CancellationToken, Vec<JoinHandle<()>>)>>,
}

impl JdpPlatformClient {
    /// Creates a backend over an arbitrary source
    pub fn new(source: Arc<dyn JdpSource>) -> Self {
        Self {
            source,
            state: Arc::new(JdpState::default()),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Creates a backend listening on the configured multicast group
    pub fn udp(config: JdpConfig) -> Self {
        Self::new(Arc::new(UdpJdpSource::new(config)))
    }
}

#[async_trait::async_trait]
impl PlatformClient for JdpPlatformClient {
    fn realm(&self) -> &str {
        REALM
    }

    async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }
        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let source_task = self.source.run(tx, token.clone()).await?;

        let state = self.state.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                state.apply(event);
            }
        });
        *running = Some((token, vec![source_task, pump]));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some((token, _tasks)) = self.running.lock().await.take() {
            token.cancel();
            info!("JDP discovery stopped");
        }
        Ok(())
    }

    async fn list_discoverable_services(&self) -> Result<Vec<ServiceRef>> {
        Ok(self
            .state
            .services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect())
    }

    async fn discovery_tree(&self) -> Result<EnvironmentNode> {
        let mut realm = EnvironmentNode::realm(REALM);
        for target in self.list_discoverable_services().await? {
            realm.add_target(NodeType::Jvm, target);
        }
        realm.sort_recursive();
        Ok(realm)
    }

    fn add_listener(&self, listener: DiscoveryListener) -> ListenerId {
        self.state.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.state.listeners.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(session: &str, url: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (KEY_SESSION_UUID.to_string(), session.to_string()),
            (KEY_JMX_SERVICE_URL.to_string(), url.to_string()),
            (KEY_MAIN_CLASS.to_string(), "com.example.Main".to_string()),
            (KEY_PROCESS_ID.to_string(), "4242".to_string()),
            (KEY_BROADCAST_INTERVAL.to_string(), "1000".to_string()),
        ])
    }

    #[test]
    fn test_decode_encoded_packet() {
        let payload = entries("s-1", "service:jmx:rmi:///jndi/rmi://host:9091/jmxrmi");
        let decoded = decode_packet(&encode_packet(&payload)).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_decode_rejects_bad_magic_and_truncation() {
        assert!(decode_packet(&[0, 0, 0, 0, 0, 1]).is_err());
        let mut packet = encode_packet(&entries("s", "u"));
        packet.truncate(packet.len() - 1);
        assert!(decode_packet(&packet).is_err());
    }

    #[test]
    fn test_record_to_service_ref() {
        let record =
            JdpRecord::from_entries(&entries("s-1", "service:jmx:rmi:///jndi/rmi://host:9091/jmxrmi")).unwrap();
        assert_eq!(record.broadcast_interval, Duration::from_millis(1000));
        let target = record.to_service_ref();
        assert_eq!(target.alias.as_deref(), Some("com.example.Main"));
        assert_eq!(target.cryostat_annotation(AnnotationKey::Pid), Some("4242"));
        assert_eq!(target.cryostat_annotation(AnnotationKey::Host), Some("host"));
        assert_eq!(target.cryostat_annotation(AnnotationKey::Realm), Some(REALM));
    }

    #[test]
    fn test_record_requires_url() {
        let mut payload = entries("s", "u");
        payload.remove(KEY_JMX_SERVICE_URL);
        assert!(JdpRecord::from_entries(&payload).is_none());
    }

    #[test]
    fn test_tracker_found_once_then_lost_after_silence() {
        let record = JdpRecord::from_entries(&entries("s-1", "u")).unwrap();
        let mut tracker = JdpTracker::new(3);
        let t0 = Instant::now();

        assert!(matches!(tracker.observe(record.clone(), t0), Some(JdpEvent::Found(_))));
        assert!(tracker.observe(record.clone(), t0 + Duration::from_millis(900)).is_none());
        assert!(tracker.expire(t0 + Duration::from_millis(2000)).is_empty());
        let lost = tracker.expire(t0 + Duration::from_millis(4000));
        assert_eq!(lost, vec![JdpEvent::Lost(record)]);
    }

    struct ChannelSource {
        events: Mutex<Vec<JdpEvent>>,
    }

    #[async_trait::async_trait]
    impl JdpSource for ChannelSource {
        async fn run(&self, tx: mpsc::UnboundedSender<JdpEvent>, token: CancellationToken) -> Result<JoinHandle<()>> {
            let events: Vec<JdpEvent> = self.events.lock().unwrap().drain(..).collect();
            Ok(tokio::spawn(async move {
                for event in events {
                    let _ = tx.send(event);
                }
                token.cancelled().await;
            }))
        }
    }

    #[tokio::test]
    async fn test_platform_client_translates_events() {
        let record = JdpRecord::from_entries(&entries("s-1", "service:jmx:rmi:///jndi/rmi://h:1/jmxrmi")).unwrap();
        let source = Arc::new(ChannelSource {
            events: Mutex::new(vec![JdpEvent::Found(record.clone()), JdpEvent::Lost(record)]),
        });
        let client = JdpPlatformClient::new(source);
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        client.add_listener(Arc::new(move |e: &TargetDiscoveryEvent| {
            let _ = seen_tx.send(e.kind);
        }));

        client.start().await.unwrap();
        client.start().await.unwrap();
        assert_eq!(seen_rx.recv().await, Some(EventKind::Found));
        assert_eq!(seen_rx.recv().await, Some(EventKind::Lost));
        assert!(client.list_discoverable_services().await.unwrap().is_empty());
        client.stop().await.unwrap();
        client.stop().await.unwrap();
    }
}
