//! Signaling via a relay
//!
//! A [`SignalingConnection`] claims one peer id on the relay and exchanges
//! small JSON control messages (session descriptions and ICE candidates)
//! with other claimed ids. It runs as a background task:
//! - outbound messages are queued while the socket is not open and flushed
//!   in order once it opens, including after a reconnect
//! - inbound messages without a `from` field, or that fail to parse, are
//!   logged and dropped
//! - the relay's close code decides between stopping, failing and
//!   reconnecting after a fixed delay

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::relay::{RelayConnector, RelayFrame, RelaySocket};
use super::transport::{IceCandidate, SessionDescription};
use crate::config::{BackendConfig, Timing, SIGNALING_PROTOCOL_VERSION};
use crate::sync::PeerId;

/// Normal closure, sent when the connection is closed on purpose
pub const CLOSE_NORMAL: u16 = 1000;
/// Closed without a status code
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Connection dropped without a close frame
pub const CLOSE_ABNORMAL: u16 = 1006;
/// The requested peer id is already claimed
pub const CLOSE_ID_TAKEN: u16 = 4000;
/// No peer id was given
pub const CLOSE_MISSING_ID: u16 = 4001;
/// The peer id is not acceptable to the relay
pub const CLOSE_INVALID_ID: u16 = 4002;

/// Close codes caused by the network or a restarting relay
const TRANSIENT_CLOSE_CODES: &[u16] = &[1001, CLOSE_NO_STATUS, CLOSE_ABNORMAL, 1011, 1012, 1013, 1014];

/// Unclaimed messages kept per sender until a route for it is registered
const MAX_BACKLOG_PER_PEER: usize = 32;
/// Distinct senders with unclaimed messages
const MAX_BACKLOG_PEERS: usize = 16;

/// Signaling errors
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("Failed to connect to relay: {0}")]
    Connect(String),

    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to encode signaling message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Signaling connection closed")]
    Closed,
}

/// Why a signaling connection gave up for good
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingFailure {
    IdTaken,
    MissingId,
    InvalidId,
    /// Closed with a code that is neither normal nor known to be transient
    Unexpected(u16),
}

/// Observable state of a [`SignalingConnection`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingStatus {
    Connecting,
    Open,
    /// Waiting to reconnect after a transient closure
    Reconnecting,
    Closed,
    Failed(SignalingFailure),
}

/// What to do after the relay closed the socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseAction {
    /// Normal closure, nothing more to do
    Stop,
    Reconnect,
    Fail(SignalingFailure),
}

/// Classify a relay close code
///
/// `registered` is true once the relay has accepted our id at least once.
/// An id that is taken after that is most likely our own stale
/// registration, so that case is retried; before it is a real conflict.
pub fn classify_close(code: u16, registered: bool) -> CloseAction {
    match code {
        CLOSE_NORMAL => CloseAction::Stop,
        CLOSE_ID_TAKEN if registered => CloseAction::Reconnect,
        CLOSE_ID_TAKEN => CloseAction::Fail(SignalingFailure::IdTaken),
        CLOSE_MISSING_ID => CloseAction::Fail(SignalingFailure::MissingId),
        CLOSE_INVALID_ID => CloseAction::Fail(SignalingFailure::InvalidId),
        code if TRANSIENT_CLOSE_CODES.contains(&code) => CloseAction::Reconnect,
        code => CloseAction::Fail(SignalingFailure::Unexpected(code)),
    }
}

/// Kind of payload in a [`SignalingMessage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalingKind {
    Description,
    IceCandidate,
}

/// Control message relayed between two claimed peer ids
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub kind: SignalingKind,
    /// Filled in on send, required on receive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<PeerId>,
    pub to: PeerId,
    pub data: serde_json::Value,
}

impl SignalingMessage {
    pub fn description(
        to: &str,
        description: &SessionDescription,
    ) -> Result<Self, SignalingError> {
        Ok(Self {
            kind: SignalingKind::Description,
            from: None,
            to: to.to_string(),
            data: serde_json::to_value(description)?,
        })
    }

    pub fn ice_candidate(to: &str, candidate: &IceCandidate) -> Result<Self, SignalingError> {
        Ok(Self {
            kind: SignalingKind::IceCandidate,
            from: None,
            to: to.to_string(),
            data: serde_json::to_value(candidate)?,
        })
    }

    /// Payload as a session description, if it is one
    pub fn as_description(&self) -> Option<SessionDescription> {
        match self.kind {
            SignalingKind::Description => serde_json::from_value(self.data.clone()).ok(),
            SignalingKind::IceCandidate => None,
        }
    }

    /// Payload as an ICE candidate, if it is one
    pub fn as_ice_candidate(&self) -> Option<IceCandidate> {
        match self.kind {
            SignalingKind::IceCandidate => serde_json::from_value(self.data.clone()).ok(),
            SignalingKind::Description => None,
        }
    }
}

/// Where a signaling connection goes
#[derive(Debug, Clone)]
pub struct SignalingOptions {
    pub peer_id: PeerId,
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub reconnect_delay: Duration,
}

impl SignalingOptions {
    pub fn from_config(peer_id: &str, config: &BackendConfig, timing: &Timing) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            host: config.signaling_host.clone(),
            port: config.signaling_port,
            secure: config.signaling_secure,
            reconnect_delay: timing.signaling_reconnect,
        }
    }

    /// Relay URL carrying the protocol version and our id
    pub fn url(&self) -> Result<String, SignalingError> {
        let scheme = if self.secure { "wss" } else { "ws" };
        let mut url = Url::parse(&format!("{}://{}:{}/", scheme, self.host, self.port))
            .map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("version", &SIGNALING_PROTOCOL_VERSION.to_string())
            .append_pair("id", &self.peer_id);
        Ok(url.into())
    }
}

/// Fan-out of inbound messages to subscribers
#[derive(Default)]
struct Router {
    /// Receivers of every message
    all: Vec<mpsc::UnboundedSender<SignalingMessage>>,
    /// Receivers of messages from one sender
    routes: HashMap<PeerId, mpsc::UnboundedSender<SignalingMessage>>,
    /// Messages from senders nobody has claimed yet
    backlog: HashMap<PeerId, VecDeque<SignalingMessage>>,
    backlog_order: VecDeque<PeerId>,
}

impl Router {
    fn dispatch(&mut self, from: &str, msg: SignalingMessage) {
        self.all.retain(|tx| tx.send(msg.clone()).is_ok());

        if let Some(route) = self.routes.get(from) {
            if route.send(msg.clone()).is_ok() {
                return;
            }
            self.routes.remove(from);
        }
        self.keep_unclaimed(from, msg);
    }

    fn keep_unclaimed(&mut self, from: &str, msg: SignalingMessage) {
        if !self.backlog.contains_key(from) {
            if self.backlog_order.len() >= MAX_BACKLOG_PEERS {
                if let Some(oldest) = self.backlog_order.pop_front() {
                    self.backlog.remove(&oldest);
                }
            }
            self.backlog_order.push_back(from.to_string());
        }
        let queue = self.backlog.entry(from.to_string()).or_default();
        if queue.len() >= MAX_BACKLOG_PER_PEER {
            queue.pop_front();
        }
        queue.push_back(msg);
    }

    fn route(&mut self, from: &str) -> mpsc::UnboundedReceiver<SignalingMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(pending) = self.take_backlog(from) {
            for msg in pending {
                let _ = tx.send(msg);
            }
        }
        self.routes.insert(from.to_string(), tx);
        rx
    }

    fn take_backlog(&mut self, from: &str) -> Option<VecDeque<SignalingMessage>> {
        self.backlog_order.retain(|id| id != from);
        self.backlog.remove(from)
    }
}

enum SignalingCommand {
    Send(String),
    Close,
}

/// Handle to a running signaling connection
#[derive(Clone)]
pub struct SignalingConnection {
    peer_id: PeerId,
    command_tx: mpsc::UnboundedSender<SignalingCommand>,
    router: Arc<Mutex<Router>>,
    status_rx: watch::Receiver<SignalingStatus>,
}

impl SignalingConnection {
    /// Start connecting to the relay in the background
    pub fn connect(
        options: SignalingOptions,
        connector: Arc<dyn RelayConnector>,
    ) -> Result<Self, SignalingError> {
        let url = options.url()?;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SignalingStatus::Connecting);
        let router = Arc::new(Mutex::new(Router::default()));

        info!("Signaling: connecting {} to {}", options.peer_id, url);

        let actor = SignalingActor {
            peer_id: options.peer_id.clone(),
            url,
            connector,
            router: router.clone(),
            status_tx,
            queue: VecDeque::new(),
            registered: false,
            reconnect_delay: options.reconnect_delay,
        };
        tokio::spawn(actor.run(command_rx));

        Ok(Self {
            peer_id: options.peer_id,
            command_tx,
            router,
            status_rx,
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn status(&self) -> SignalingStatus {
        self.status_rx.borrow().clone()
    }

    pub fn status_watch(&self) -> watch::Receiver<SignalingStatus> {
        self.status_rx.clone()
    }

    /// Send `msg`, queueing it while the socket is not open
    pub fn send_message(&self, mut msg: SignalingMessage) -> Result<(), SignalingError> {
        msg.from = Some(self.peer_id.clone());
        let text = serde_json::to_string(&msg)?;
        self.command_tx
            .send(SignalingCommand::Send(text))
            .map_err(|_| SignalingError::Closed)
    }

    /// Every valid inbound message
    pub fn messages(&self) -> mpsc::UnboundedReceiver<SignalingMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.router.lock().all.push(tx);
        rx
    }

    /// Inbound messages from `peer_id`
    ///
    /// Messages from that peer that arrived before anyone asked for them are
    /// delivered first, in arrival order. Replaces any earlier route for the
    /// same peer.
    pub fn messages_from(&self, peer_id: &str) -> mpsc::UnboundedReceiver<SignalingMessage> {
        self.router.lock().route(peer_id)
    }

    /// Forget unclaimed messages from `peer_id`
    pub fn discard_backlog(&self, peer_id: &str) {
        let mut router = self.router.lock();
        router.take_backlog(peer_id);
        router.routes.remove(peer_id);
    }

    /// Close the connection for good
    pub fn close(&self) {
        let _ = self.command_tx.send(SignalingCommand::Close);
    }
}

/// How a served socket ended
enum SocketEnd {
    Closed(u16),
    Shutdown,
}

struct SignalingActor {
    peer_id: PeerId,
    url: String,
    connector: Arc<dyn RelayConnector>,
    router: Arc<Mutex<Router>>,
    status_tx: watch::Sender<SignalingStatus>,
    /// Outbound messages waiting for an open socket
    queue: VecDeque<String>,
    /// The relay accepted our id on an earlier socket
    registered: bool,
    reconnect_delay: Duration,
}

impl SignalingActor {
    async fn run(mut self, mut command_rx: mpsc::UnboundedReceiver<SignalingCommand>) {
        loop {
            let connector = self.connector.clone();
            let url = self.url.clone();
            let connect = async move { connector.connect(&url).await };
            tokio::pin!(connect);

            let result = loop {
                tokio::select! {
                    result = &mut connect => break result,
                    cmd = command_rx.recv() => {
                        if !self.handle_offline_command(cmd) {
                            return;
                        }
                    }
                }
            };

            let code = match result {
                Ok(socket) => match self.serve(socket, &mut command_rx).await {
                    SocketEnd::Closed(code) => {
                        // Anything but an id rejection means the relay took our id
                        if !matches!(code, CLOSE_ID_TAKEN | CLOSE_MISSING_ID | CLOSE_INVALID_ID) {
                            self.registered = true;
                        }
                        code
                    }
                    SocketEnd::Shutdown => {
                        self.finish(SignalingStatus::Closed);
                        return;
                    }
                },
                Err(e) => {
                    warn!("Signaling: {} could not reach relay: {}", self.peer_id, e);
                    CLOSE_ABNORMAL
                }
            };

            match classify_close(code, self.registered) {
                CloseAction::Stop => {
                    info!("Signaling: connection for {} closed", self.peer_id);
                    self.finish(SignalingStatus::Closed);
                    return;
                }
                CloseAction::Fail(failure) => {
                    match &failure {
                        SignalingFailure::Unexpected(code) => error!(
                            "Signaling: connection for {} closed with code {}",
                            self.peer_id, code
                        ),
                        _ => error!(
                            "Signaling: connection for {} closed because peer id is either taken, missing or invalid (code {})",
                            self.peer_id, code
                        ),
                    }
                    self.finish(SignalingStatus::Failed(failure));
                    return;
                }
                CloseAction::Reconnect => {
                    warn!(
                        "Signaling: connection for {} lost (code {}), reconnecting in {:?}",
                        self.peer_id, code, self.reconnect_delay
                    );
                    self.status_tx.send_replace(SignalingStatus::Reconnecting);

                    let delay = tokio::time::sleep(self.reconnect_delay);
                    tokio::pin!(delay);
                    loop {
                        tokio::select! {
                            _ = &mut delay => break,
                            cmd = command_rx.recv() => {
                                if !self.handle_offline_command(cmd) {
                                    return;
                                }
                            }
                        }
                    }

                    self.status_tx.send_replace(SignalingStatus::Connecting);
                }
            }
        }
    }

    /// Returns false once the connection should shut down
    fn handle_offline_command(&mut self, cmd: Option<SignalingCommand>) -> bool {
        match cmd {
            Some(SignalingCommand::Send(text)) => {
                debug!("Signaling: queueing message while offline");
                self.queue.push_back(text);
                true
            }
            Some(SignalingCommand::Close) | None => {
                self.finish(SignalingStatus::Closed);
                false
            }
        }
    }

    async fn serve(
        &mut self,
        mut socket: RelaySocket,
        command_rx: &mut mpsc::UnboundedReceiver<SignalingCommand>,
    ) -> SocketEnd {
        info!("Signaling: connection for {} open", self.peer_id);
        self.status_tx.send_replace(SignalingStatus::Open);

        if !self.queue.is_empty() {
            debug!("Signaling: flushing {} queued message(s)", self.queue.len());
        }
        while let Some(text) = self.queue.pop_front() {
            if let Err(mpsc::error::SendError(text)) = socket.outbound.send(text) {
                self.queue.push_front(text);
                break;
            }
        }

        loop {
            tokio::select! {
                frame = socket.inbound.recv() => match frame {
                    Some(RelayFrame::Text(text)) => self.receive(&text),
                    Some(RelayFrame::Closed { code, reason, unsent }) => {
                        debug!("Signaling: relay closed socket with {} ({})", code, reason);
                        if !unsent.is_empty() {
                            debug!("Signaling: requeueing {} unsent message(s)", unsent.len());
                        }
                        for text in unsent.into_iter().rev() {
                            self.queue.push_front(text);
                        }
                        return SocketEnd::Closed(code);
                    }
                    None => return SocketEnd::Closed(CLOSE_ABNORMAL),
                },
                cmd = command_rx.recv() => match cmd {
                    Some(SignalingCommand::Send(text)) => {
                        if let Err(mpsc::error::SendError(text)) = socket.outbound.send(text) {
                            self.queue.push_back(text);
                        }
                    }
                    // Dropping the socket closes it normally
                    Some(SignalingCommand::Close) | None => return SocketEnd::Shutdown,
                },
            }
        }
    }

    fn receive(&self, text: &str) {
        let msg: SignalingMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Signaling: received malformed message ({}): {}", e, text);
                return;
            }
        };
        let Some(from) = msg.from.clone() else {
            warn!("Signaling: received message without 'from': {}", text);
            return;
        };
        debug!("Signaling: {:?} from {}", msg.kind, from);
        self.router.lock().dispatch(&from, msg);
    }

    fn finish(&self, status: SignalingStatus) {
        self.status_tx.send_replace(status);
        let mut router = self.router.lock();
        router.all.clear();
        router.routes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(from: &str, n: u64) -> SignalingMessage {
        SignalingMessage {
            kind: SignalingKind::IceCandidate,
            from: Some(from.to_string()),
            to: "me".to_string(),
            data: json!(n),
        }
    }

    #[test]
    fn test_classify_close() {
        assert_eq!(classify_close(CLOSE_NORMAL, false), CloseAction::Stop);
        assert_eq!(
            classify_close(CLOSE_ID_TAKEN, false),
            CloseAction::Fail(SignalingFailure::IdTaken)
        );
        assert_eq!(classify_close(CLOSE_ID_TAKEN, true), CloseAction::Reconnect);
        assert_eq!(
            classify_close(CLOSE_MISSING_ID, true),
            CloseAction::Fail(SignalingFailure::MissingId)
        );
        assert_eq!(
            classify_close(CLOSE_INVALID_ID, false),
            CloseAction::Fail(SignalingFailure::InvalidId)
        );
        assert_eq!(classify_close(CLOSE_ABNORMAL, false), CloseAction::Reconnect);
        assert_eq!(classify_close(1001, true), CloseAction::Reconnect);
        assert_eq!(
            classify_close(1008, false),
            CloseAction::Fail(SignalingFailure::Unexpected(1008))
        );
    }

    #[test]
    fn test_wire_format() {
        let out = SignalingMessage::ice_candidate(
            "remote",
            &IceCandidate {
                candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
                username_fragment: None,
            },
        )
        .unwrap();
        let value = serde_json::to_value(&out).unwrap();
        assert_eq!(value["type"], "icecandidate");
        assert_eq!(value["to"], "remote");
        assert!(value.get("from").is_none());
        assert_eq!(value["data"]["sdpMLineIndex"], 0);
        assert!(out.as_description().is_none());
        assert!(out.as_ice_candidate().is_some());

        let inbound: SignalingMessage = serde_json::from_value(json!({
            "type": "description",
            "from": "remote",
            "to": "me",
            "data": {"type": "offer", "sdp": "v=0"}
        }))
        .unwrap();
        assert_eq!(inbound.from.as_deref(), Some("remote"));
        assert_eq!(inbound.as_description().unwrap().sdp, "v=0");
    }

    #[test]
    fn test_url_carries_version_and_id() {
        let options = SignalingOptions {
            peer_id: "ab c".to_string(),
            host: "relay.example.org".to_string(),
            port: 8443,
            secure: true,
            reconnect_delay: Duration::from_secs(15),
        };
        assert_eq!(
            options.url().unwrap(),
            "wss://relay.example.org:8443/?version=1&id=ab+c"
        );
    }

    #[test]
    fn test_backlog_is_drained_into_new_route() {
        let mut router = Router::default();
        router.dispatch("a", msg("a", 1));
        router.dispatch("a", msg("a", 2));

        let mut rx = router.route("a");
        router.dispatch("a", msg("a", 3));

        for n in 1..=3 {
            assert_eq!(rx.try_recv().unwrap().data, json!(n));
        }
        assert!(router.backlog.is_empty());
    }

    #[test]
    fn test_dropped_route_falls_back_to_backlog() {
        let mut router = Router::default();
        drop(router.route("a"));
        router.dispatch("a", msg("a", 1));
        assert!(!router.routes.contains_key("a"));
        assert_eq!(router.backlog["a"].len(), 1);
    }

    #[test]
    fn test_backlog_is_bounded() {
        let mut router = Router::default();
        for n in 0..(MAX_BACKLOG_PER_PEER as u64 + 5) {
            router.dispatch("a", msg("a", n));
        }
        assert_eq!(router.backlog["a"].len(), MAX_BACKLOG_PER_PEER);
        assert_eq!(router.backlog["a"][0].data, json!(5));

        for p in 0..MAX_BACKLOG_PEERS + 1 {
            router.dispatch(&format!("p{}", p), msg("x", 0));
        }
        assert_eq!(router.backlog.len(), MAX_BACKLOG_PEERS);
        assert!(!router.backlog.contains_key("a"));
    }

    #[test]
    fn test_every_message_reaches_general_subscribers() {
        let mut router = Router::default();
        let (tx, mut all) = mpsc::unbounded_channel();
        router.all.push(tx);
        let mut from_a = router.route("a");

        router.dispatch("a", msg("a", 1));
        router.dispatch("b", msg("b", 2));

        assert_eq!(all.try_recv().unwrap().data, json!(1));
        assert_eq!(all.try_recv().unwrap().data, json!(2));
        assert_eq!(from_a.try_recv().unwrap().data, json!(1));
        assert!(from_a.try_recv().is_err());
    }
}
