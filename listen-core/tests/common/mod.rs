//! In-memory relay and transports for driving peers without a network
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Url;
use tokio::sync::{mpsc, watch};

use listen_core::config::{BackendConfig, Timing};
use listen_core::metadata::{AudioInfo, MemoryMetadataCache, MetadataCache};
use listen_core::network::{
    CredentialProvider, IceCandidate, IceConfiguration, PeerError, PeerOptions, PeerTransport,
    RelayConnector, RelayFrame, RelaySocket, SdpType, SessionDescription, SignalingError,
    SignalingOptions, SignalingState, TransportError, TransportEvent, TransportFactory,
    TransportState, TurnCredentials,
};
use listen_core::PeerContext;

/// Generous upper bound for anything a test waits on
pub const WAIT: Duration = Duration::from_secs(60);

/// Await `future`, failing the test if it takes longer than [`WAIT`]
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("timed out")
}

/// Wait until the watched value satisfies `f`
pub async fn wait_for<T: Clone>(rx: &mut watch::Receiver<T>, f: impl FnMut(&T) -> bool) -> T {
    let value = within(rx.wait_for(f)).await.expect("watch closed");
    T::clone(&value)
}

/// Poll `f` until it holds, yielding to other tasks in between
pub async fn eventually(mut f: impl FnMut() -> bool) {
    within(async {
        while !f() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

pub fn backend_config() -> BackendConfig {
    let mut config = BackendConfig::default().with_backend_host("relay.test");
    config.signaling_port = 8080;
    config.signaling_secure = false;
    config.turn_username = Some("static-user".to_string());
    config.turn_password = Some("static-pass".to_string());
    config.invitation_base_url = Some("https://listen.test/join/".to_string());
    config
}

pub fn signaling_options(peer_id: &str) -> SignalingOptions {
    SignalingOptions::from_config(peer_id, &backend_config(), &Timing::default())
}

pub fn peer_options(remote_id: &str) -> PeerOptions {
    PeerOptions::from_config(remote_id, &backend_config(), Timing::default(), None)
}

pub fn context(relay: &MemoryRelay, network: &MemoryNetwork) -> PeerContext {
    PeerContext::new(
        backend_config(),
        Arc::new(relay.clone()),
        Arc::new(network.clone()),
        Arc::new(MemoryMetadataCache::new()),
    )
}

/// `ctx` answering audio info requests with `entries`
pub fn with_metadata(mut ctx: PeerContext, entries: &[AudioInfo]) -> PeerContext {
    let cache = MemoryMetadataCache::new();
    for info in entries {
        cache.insert(info.clone());
    }
    let cache: Arc<dyn MetadataCache> = Arc::new(cache);
    ctx.metadata = cache;
    ctx
}

pub fn audio_info(uri: &str, title: &str) -> AudioInfo {
    AudioInfo {
        uri: uri.to_string(),
        title: title.to_string(),
        artist: "Artist".to_string(),
        album: "Album".to_string(),
        duration: 180.0,
        cover: None,
    }
}

// Relay

#[derive(Default)]
struct RelayState {
    /// Claimed ids and the registration that claimed them
    clients: HashMap<String, (u64, mpsc::UnboundedSender<RelayFrame>)>,
    next_registration: u64,
    offline: bool,
    connects: usize,
    forwarded: Vec<serde_json::Value>,
    /// Clients whose frames are taken off the socket but not written
    stalled: HashSet<String>,
    held: HashMap<String, Vec<String>>,
}

/// Relay that forwards frames to the claimed id in `to`, verbatim
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse new connections
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.state.lock().clients.contains_key(peer_id)
    }

    /// Connection attempts so far, refused ones included
    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    /// Every frame the relay forwarded or dropped, in order
    pub fn forwarded(&self) -> Vec<serde_json::Value> {
        self.state.lock().forwarded.clone()
    }

    /// Drop a client's socket without a close frame
    pub fn drop_connection(&self, peer_id: &str) {
        self.close_connection(peer_id, 1006);
    }

    pub fn close_connection(&self, peer_id: &str, code: u16) {
        let mut state = self.state.lock();
        state.stalled.remove(peer_id);
        let unsent = state.held.remove(peer_id).unwrap_or_default();
        if let Some((_, tx)) = state.clients.remove(peer_id) {
            let _ = tx.send(RelayFrame::Closed {
                code,
                reason: String::new(),
                unsent,
            });
        }
    }

    /// Stop writing a client's frames, as a socket that is about to die
    pub fn stall(&self, peer_id: &str) {
        self.state.lock().stalled.insert(peer_id.to_string());
    }

    /// Frames taken from a stalled client and not written
    pub fn held(&self, peer_id: &str) -> usize {
        self.state.lock().held.get(peer_id).map_or(0, Vec::len)
    }

    /// Deliver a raw frame to a client
    pub fn inject(&self, to: &str, text: &str) {
        if let Some((_, tx)) = self.state.lock().clients.get(to) {
            let _ = tx.send(RelayFrame::Text(text.to_string()));
        }
    }

    fn rejected(code: u16) -> RelaySocket {
        let (outbound, _) = mpsc::unbounded_channel();
        let (in_tx, inbound) = mpsc::unbounded_channel();
        let _ = in_tx.send(RelayFrame::Closed {
            code,
            reason: String::new(),
            unsent: Vec::new(),
        });
        RelaySocket { outbound, inbound }
    }
}

#[async_trait]
impl RelayConnector for MemoryRelay {
    async fn connect(&self, url: &str) -> Result<RelaySocket, SignalingError> {
        let url = Url::parse(url).map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;
        let id = url
            .query_pairs()
            .find(|(key, _)| key == "id")
            .map(|(_, value)| value.into_owned())
            .unwrap_or_default();

        let mut state = self.state.lock();
        state.connects += 1;
        if state.offline {
            return Err(SignalingError::Connect("relay offline".to_string()));
        }
        if id.is_empty() {
            return Ok(Self::rejected(4001));
        }
        if state.clients.contains_key(&id) {
            return Ok(Self::rejected(4000));
        }

        let registration = state.next_registration;
        state.next_registration += 1;
        let (in_tx, inbound) = mpsc::unbounded_channel();
        let (outbound, mut out_rx) = mpsc::unbounded_channel::<String>();
        state.clients.insert(id.clone(), (registration, in_tx));
        drop(state);

        let relay = self.state.clone();
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                let mut state = relay.lock();
                let current = state.clients.get(&id).map(|(r, _)| *r) == Some(registration);
                if !current {
                    continue;
                }
                if state.stalled.contains(&id) {
                    state.held.entry(id.clone()).or_default().push(text);
                    continue;
                }
                let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
                    continue;
                };
                if let Some(to) = value["to"].as_str() {
                    if let Some((_, tx)) = state.clients.get(to) {
                        let _ = tx.send(RelayFrame::Text(text.clone()));
                    }
                }
                state.forwarded.push(value);
            }

            let mut state = relay.lock();
            if state.clients.get(&id).map(|(r, _)| *r) == Some(registration) {
                state.clients.remove(&id);
            }
        });

        Ok(RelaySocket { outbound, inbound })
    }
}

// Transports

/// What one in-memory transport has been through
#[derive(Debug, Clone, Default)]
pub struct EndpointStats {
    pub id: u64,
    pub has_channel: bool,
    pub connected: bool,
    pub channel_open: bool,
    pub closed: bool,
    pub offers: usize,
    pub remote_offers: usize,
    pub rollbacks: usize,
    pub candidates: usize,
    pub config_updates: usize,
    pub turn_username: Option<String>,
}

struct Endpoint {
    stats: EndpointStats,
    events: mpsc::UnboundedSender<TransportEvent>,
    signaling: SignalingState,
    remote: Option<u64>,
    failed: bool,
}

impl Endpoint {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

#[derive(Default)]
struct NetworkState {
    endpoints: BTreeMap<u64, Endpoint>,
    next_id: u64,
    eager_offers: bool,
}

impl NetworkState {
    fn endpoint(&mut self, id: u64) -> Result<&mut Endpoint, TransportError> {
        match self.endpoints.get_mut(&id) {
            Some(endpoint) if !endpoint.stats.closed => Ok(endpoint),
            _ => Err(TransportError::Closed),
        }
    }

    /// Connect two endpoints once each has applied the other's description
    /// and both are stable
    fn try_connect(&mut self, id: u64) {
        let Some(remote) = self.endpoints.get(&id).and_then(|e| e.remote) else {
            return;
        };
        let ready = |endpoint: Option<&Endpoint>, other: u64| {
            endpoint.is_some_and(|e| {
                e.remote == Some(other) && e.signaling == SignalingState::Stable && !e.stats.closed
            })
        };
        if !ready(self.endpoints.get(&id), remote) || !ready(self.endpoints.get(&remote), id) {
            return;
        }

        let with_channel = [id, remote]
            .iter()
            .any(|e| self.endpoints.get(e).is_some_and(|e| e.stats.has_channel));
        for endpoint_id in [id, remote] {
            let Some(endpoint) = self.endpoints.get_mut(&endpoint_id) else {
                continue;
            };
            if !endpoint.stats.connected {
                endpoint.stats.connected = true;
                endpoint.emit(TransportEvent::StateChanged(TransportState::Connecting));
                endpoint.emit(TransportEvent::StateChanged(TransportState::Connected));
            } else if endpoint.failed {
                endpoint.failed = false;
                endpoint.emit(TransportEvent::StateChanged(TransportState::Connected));
            }
            if with_channel && !endpoint.stats.channel_open {
                endpoint.stats.channel_open = true;
                endpoint.emit(TransportEvent::ChannelOpen);
            }
        }
    }
}

/// Transports that connect to each other through descriptions of the form
/// `memory:<endpoint>`
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every transport asks for negotiation as soon as it exists, so two
    /// peers created together make colliding offers
    pub fn with_eager_offers(self) -> Self {
        self.state.lock().eager_offers = true;
        self
    }

    pub fn endpoints(&self) -> Vec<EndpointStats> {
        self.state
            .lock()
            .endpoints
            .values()
            .map(|e| e.stats.clone())
            .collect()
    }

    /// The endpoint that created the data channel
    pub fn caller_endpoint(&self) -> Option<EndpointStats> {
        self.endpoints().into_iter().find(|e| e.has_channel)
    }

    /// Report ICE failure on `id`; the next completed negotiation recovers it
    pub fn fail(&self, id: u64) {
        let mut state = self.state.lock();
        if let Some(endpoint) = state.endpoints.get_mut(&id) {
            endpoint.failed = true;
            endpoint.emit(TransportEvent::StateChanged(TransportState::Failed));
        }
    }
}

#[async_trait]
impl TransportFactory for MemoryNetwork {
    async fn create(
        &self,
        config: IceConfiguration,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;

        let endpoint = Endpoint {
            stats: EndpointStats {
                id,
                turn_username: turn_username(&config),
                ..Default::default()
            },
            events,
            signaling: SignalingState::Stable,
            remote: None,
            failed: false,
        };
        if state.eager_offers {
            endpoint.emit(TransportEvent::NegotiationNeeded);
        }
        state.endpoints.insert(id, endpoint);

        Ok(Box::new(MemoryTransport {
            id,
            network: self.state.clone(),
        }))
    }
}

fn turn_username(config: &IceConfiguration) -> Option<String> {
    config.ice_servers.get(1).and_then(|s| s.username.clone())
}

fn candidate(id: u64) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{} 1 UDP 1 192.0.2.{} 5000 typ host", id, id),
        sdp_mid: Some("0".to_string()),
        sdp_m_line_index: Some(0),
        username_fragment: None,
    }
}

struct MemoryTransport {
    id: u64,
    network: Arc<Mutex<NetworkState>>,
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    fn signaling_state(&self) -> SignalingState {
        self.network
            .lock()
            .endpoints
            .get(&self.id)
            .map(|e| e.signaling)
            .unwrap_or(SignalingState::Closed)
    }

    async fn create_data_channel(&self) -> Result<(), TransportError> {
        let mut network = self.network.lock();
        let eager = network.eager_offers;
        let endpoint = network.endpoint(self.id)?;
        endpoint.stats.has_channel = true;
        if !eager {
            endpoint.emit(TransportEvent::NegotiationNeeded);
        }
        Ok(())
    }

    async fn set_local_description(&self) -> Result<SessionDescription, TransportError> {
        let mut network = self.network.lock();
        let endpoint = network.endpoint(self.id)?;
        let sdp = format!("memory:{}", self.id);
        let description = match endpoint.signaling {
            SignalingState::HaveRemoteOffer => {
                endpoint.signaling = SignalingState::Stable;
                SessionDescription::answer(sdp)
            }
            _ => {
                endpoint.signaling = SignalingState::HaveLocalOffer;
                endpoint.stats.offers += 1;
                SessionDescription::offer(sdp)
            }
        };
        endpoint.emit(TransportEvent::IceCandidate(candidate(self.id)));
        if description.sdp_type == SdpType::Answer {
            network.try_connect(self.id);
        }
        Ok(description)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let remote: u64 = description
            .sdp
            .strip_prefix("memory:")
            .and_then(|id| id.parse().ok())
            .ok_or_else(|| TransportError::Negotiation(format!("bad sdp {:?}", description.sdp)))?;

        let mut network = self.network.lock();
        let endpoint = network.endpoint(self.id)?;
        match description.sdp_type {
            SdpType::Offer => {
                if endpoint.signaling == SignalingState::HaveLocalOffer {
                    endpoint.signaling = SignalingState::Stable;
                    endpoint.stats.rollbacks += 1;
                }
                if endpoint.signaling != SignalingState::Stable {
                    return Err(TransportError::Negotiation(
                        "offer in wrong state".to_string(),
                    ));
                }
                endpoint.remote = Some(remote);
                endpoint.signaling = SignalingState::HaveRemoteOffer;
                endpoint.stats.remote_offers += 1;
            }
            SdpType::Answer => {
                if endpoint.signaling != SignalingState::HaveLocalOffer {
                    return Err(TransportError::Negotiation(
                        "answer without offer".to_string(),
                    ));
                }
                endpoint.remote = Some(remote);
                endpoint.signaling = SignalingState::Stable;
                network.try_connect(self.id);
            }
            other => {
                return Err(TransportError::Negotiation(format!(
                    "unsupported {:?}",
                    other
                )))
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), TransportError> {
        let mut network = self.network.lock();
        let endpoint = network.endpoint(self.id)?;
        if endpoint.remote.is_none() {
            return Err(TransportError::Candidate(
                "no remote description".to_string(),
            ));
        }
        endpoint.stats.candidates += 1;
        Ok(())
    }

    async fn restart_ice(&self) -> Result<(), TransportError> {
        let mut network = self.network.lock();
        network
            .endpoint(self.id)?
            .emit(TransportEvent::NegotiationNeeded);
        Ok(())
    }

    async fn set_configuration(&self, config: IceConfiguration) -> Result<(), TransportError> {
        let mut network = self.network.lock();
        let endpoint = network.endpoint(self.id)?;
        endpoint.stats.config_updates += 1;
        endpoint.stats.turn_username = turn_username(&config);
        Ok(())
    }

    async fn send(&self, text: String) -> Result<(), TransportError> {
        let mut network = self.network.lock();
        let endpoint = network.endpoint(self.id)?;
        if !endpoint.stats.channel_open {
            return Err(TransportError::ChannelNotOpen);
        }
        let remote = endpoint.remote;
        if let Some(remote) = remote.and_then(|id| network.endpoints.get(&id)) {
            if remote.stats.channel_open && !remote.stats.closed {
                remote.emit(TransportEvent::ChannelMessage(text));
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut network = self.network.lock();
        let Ok(endpoint) = network.endpoint(self.id) else {
            return Ok(());
        };
        endpoint.stats.closed = true;
        endpoint.stats.channel_open = false;
        endpoint.signaling = SignalingState::Closed;
        endpoint.emit(TransportEvent::StateChanged(TransportState::Closed));
        let remote = endpoint.remote;

        if let Some(remote) = remote.and_then(|id| network.endpoints.get_mut(&id)) {
            if remote.stats.channel_open && !remote.stats.closed {
                remote.stats.channel_open = false;
                remote.emit(TransportEvent::ChannelClosed);
            }
        }
        Ok(())
    }
}

// Credentials

/// Hands out numbered credentials and counts how often it was asked
pub struct CountingCredentials {
    fetches: AtomicUsize,
    ttl: u64,
    fail: bool,
}

impl CountingCredentials {
    pub fn new(ttl: u64) -> Self {
        Self {
            fetches: AtomicUsize::new(0),
            ttl,
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(0)
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialProvider for CountingCredentials {
    async fn fetch(&self) -> Result<TurnCredentials, PeerError> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail {
            return Err(PeerError::Credentials("service unavailable".to_string()));
        }
        Ok(TurnCredentials {
            username: format!("user-{}", n),
            password: format!("pass-{}", n),
            ttl: self.ttl,
        })
    }
}
