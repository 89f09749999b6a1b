//! Peer-to-peer connection with one data channel
//!
//! A [`PeerConnection`] negotiates a transport with one remote peer over a
//! [`SignalingConnection`] using perfect negotiation, so both ends may
//! start (re)negotiating at any time. The caller opens the data channel and
//! is the impolite side; the callee accepts the channel and is polite.
//!
//! Messages are JSON on the wire. Anything sent before the channel opens is
//! queued and flushed in order on open.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::lifecycle::{Lifecycle, LifecycleEffect};
use super::negotiation::{DescriptionAction, Negotiator, Politeness};
use super::signaling::{SignalingConnection, SignalingError, SignalingKind, SignalingMessage};
use super::transport::{
    IceConfiguration, PeerTransport, SessionDescription, TransportError, TransportEvent,
    TransportFactory,
};
use super::turn::{refresh_delay, CredentialProvider, TurnCredentials};
use crate::config::{BackendConfig, Timing};
use crate::sync::PeerId;

/// Peer connection errors
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Failed to fetch TURN credentials: {0}")]
    Credentials(String),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Peer connection closed")]
    Closed,
}

/// Which end of the connection we are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Initiates the connection and opens the data channel
    Caller,
    /// Answers a connection attempt
    Callee,
}

impl PeerRole {
    pub fn politeness(self) -> Politeness {
        match self {
            PeerRole::Caller => Politeness::Impolite,
            PeerRole::Callee => Politeness::Polite,
        }
    }
}

/// Events emitted by a [`PeerConnection`]
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// Connected for the first time
    Connected,
    /// Connected again after a disconnect or ICE restart
    Reconnected,
    /// The data channel is open
    Open,
    /// A message arrived on the data channel
    Message(serde_json::Value),
    /// The connection is gone; always the last event
    Closed,
}

/// Where and how to reach a remote peer
#[derive(Clone)]
pub struct PeerOptions {
    pub remote_id: PeerId,
    pub stun_host: String,
    pub stun_port: u16,
    pub turn_host: String,
    pub turn_port: u16,
    pub turn_username: Option<String>,
    pub turn_password: Option<String>,
    /// Short-lived TURN credentials, fetched before connecting and
    /// refreshed before they expire
    pub credentials: Option<Arc<dyn CredentialProvider>>,
    pub timing: Timing,
}

impl PeerOptions {
    pub fn from_config(
        remote_id: &str,
        config: &BackendConfig,
        timing: Timing,
        credentials: Option<Arc<dyn CredentialProvider>>,
    ) -> Self {
        Self {
            remote_id: remote_id.to_string(),
            stun_host: config.stun_host.clone(),
            stun_port: config.stun_port,
            turn_host: config.turn_host.clone(),
            turn_port: config.turn_port,
            turn_username: config.turn_username.clone(),
            turn_password: config.turn_password.clone(),
            credentials,
            timing,
        }
    }

    /// ICE servers, using `credentials` for TURN when given
    pub fn ice_configuration(&self, credentials: Option<&TurnCredentials>) -> IceConfiguration {
        let (username, password) = match credentials {
            Some(c) => (Some(c.username.clone()), Some(c.password.clone())),
            None => (self.turn_username.clone(), self.turn_password.clone()),
        };
        IceConfiguration::new(
            &self.stun_host,
            self.stun_port,
            &self.turn_host,
            self.turn_port,
            username,
            password,
        )
    }
}

enum PeerCommand {
    Send(String),
    Close,
}

/// Handle to a running peer connection
#[derive(Clone)]
pub struct PeerConnection {
    local_id: PeerId,
    remote_id: PeerId,
    role: PeerRole,
    command_tx: mpsc::UnboundedSender<PeerCommand>,
}

impl PeerConnection {
    /// Connect to `options.remote_id`, opening the data channel
    pub fn caller(
        signaling: &SignalingConnection,
        options: PeerOptions,
        transports: Arc<dyn TransportFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        Self::start(PeerRole::Caller, signaling, options, transports)
    }

    /// Accept a connection attempt from `options.remote_id`
    ///
    /// Signaling messages the remote sent before this call (usually its
    /// offer) are picked up from the signaling backlog.
    pub fn callee(
        signaling: &SignalingConnection,
        options: PeerOptions,
        transports: Arc<dyn TransportFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        Self::start(PeerRole::Callee, signaling, options, transports)
    }

    fn start(
        role: PeerRole,
        signaling: &SignalingConnection,
        options: PeerOptions,
        transports: Arc<dyn TransportFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        // Registered before spawning so nothing from the remote is missed
        let signaling_rx = signaling.messages_from(&options.remote_id);

        let handle = Self {
            local_id: signaling.peer_id().to_string(),
            remote_id: options.remote_id.clone(),
            role,
            command_tx,
        };

        let actor = PeerActor {
            local_id: handle.local_id.clone(),
            remote_id: options.remote_id.clone(),
            role,
            signaling: signaling.clone(),
            options,
            transports,
            event_tx,
            negotiator: Negotiator::new(role.politeness()),
            lifecycle: Lifecycle::new(),
            outbox: VecDeque::new(),
            channel_open: false,
        };
        tokio::spawn(actor.run(signaling_rx, command_rx));

        (handle, event_rx)
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    /// Send `message` as JSON, queueing it until the data channel is open
    pub fn send_message<T: Serialize>(&self, message: &T) -> Result<(), PeerError> {
        let text = serde_json::to_string(message)?;
        self.command_tx
            .send(PeerCommand::Send(text))
            .map_err(|_| PeerError::Closed)
    }

    pub fn close(&self) {
        let _ = self.command_tx.send(PeerCommand::Close);
    }

    /// Whether the connection task has stopped
    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }
}

struct PeerActor {
    local_id: PeerId,
    remote_id: PeerId,
    role: PeerRole,
    signaling: SignalingConnection,
    options: PeerOptions,
    transports: Arc<dyn TransportFactory>,
    event_tx: mpsc::UnboundedSender<PeerEvent>,
    negotiator: Negotiator,
    lifecycle: Lifecycle,
    /// Messages waiting for the data channel to open
    outbox: VecDeque<String>,
    channel_open: bool,
}

impl PeerActor {
    async fn run(
        mut self,
        mut signaling_rx: mpsc::UnboundedReceiver<SignalingMessage>,
        mut command_rx: mpsc::UnboundedReceiver<PeerCommand>,
    ) {
        // Credentials come first. Signaling messages wait in their channel
        // until the transport exists.
        let mut refresh_at = None;
        let mut credentials = None;
        if let Some(provider) = self.options.credentials.clone() {
            let fetch = provider.fetch();
            tokio::pin!(fetch);
            let result = loop {
                tokio::select! {
                    result = &mut fetch => break result,
                    cmd = command_rx.recv() => match cmd {
                        Some(PeerCommand::Send(text)) => self.outbox.push_back(text),
                        Some(PeerCommand::Close) | None => {
                            self.finish();
                            return;
                        }
                    },
                }
            };
            match result {
                Ok(fetched) => {
                    debug!("Fetched TURN credentials (ttl {}s)", fetched.ttl);
                    refresh_at = Some(self.refresh_deadline(fetched.ttl));
                    credentials = Some(fetched);
                }
                Err(e) => {
                    warn!("{}, using static TURN credentials", e);
                    refresh_at = Some(Instant::now() + self.options.timing.turn_retry);
                }
            }
        }

        let config = self.options.ice_configuration(credentials.as_ref());
        let (transport_tx, mut transport_rx) = mpsc::unbounded_channel();
        let transport = match self.setup_transport(config, transport_tx).await {
            Ok(transport) => transport,
            Err(e) => {
                error!(
                    "Peer connection ({}<->{}) setup failed: {}",
                    self.local_id, self.remote_id, e
                );
                self.finish();
                return;
            }
        };

        let (refresh_tx, mut refresh_rx) = mpsc::unbounded_channel();
        let mut signaling_open = true;

        loop {
            let deadline = refresh_at;
            let refresh = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                Some(event) = transport_rx.recv() => {
                    if !self.handle_transport_event(transport.as_ref(), event).await {
                        break;
                    }
                }
                msg = signaling_rx.recv(), if signaling_open => match msg {
                    Some(msg) => self.handle_signaling(transport.as_ref(), msg).await,
                    None => {
                        debug!("Peer connection ({}<->{}) lost its signaling route", self.local_id, self.remote_id);
                        signaling_open = false;
                    }
                },
                cmd = command_rx.recv() => match cmd {
                    Some(PeerCommand::Send(text)) => self.send_or_queue(transport.as_ref(), text).await,
                    Some(PeerCommand::Close) | None => break,
                },
                _ = refresh => {
                    refresh_at = None;
                    if let Some(provider) = self.options.credentials.clone() {
                        let refresh_tx = refresh_tx.clone();
                        tokio::spawn(async move {
                            let _ = refresh_tx.send(provider.fetch().await);
                        });
                    }
                }
                Some(result) = refresh_rx.recv() => {
                    refresh_at = Some(self.apply_credentials(transport.as_ref(), result).await);
                }
            }
        }

        if let Err(e) = transport.close().await {
            debug!("Closing transport failed: {}", e);
        }
        self.finish();
    }

    async fn setup_transport(
        &self,
        config: IceConfiguration,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn PeerTransport>, PeerError> {
        let transport = self.transports.create(config, events).await?;
        if self.role == PeerRole::Caller {
            transport.create_data_channel().await?;
        }
        Ok(transport)
    }

    fn refresh_deadline(&self, ttl: u64) -> Instant {
        Instant::now() + refresh_delay(ttl, self.options.timing.turn_refresh_margin)
    }

    /// Swap in refreshed credentials, returning when to refresh next
    async fn apply_credentials(
        &self,
        transport: &dyn PeerTransport,
        result: Result<TurnCredentials, PeerError>,
    ) -> Instant {
        match result {
            Ok(credentials) => {
                debug!(
                    "Refreshed TURN credentials for ({}<->{})",
                    self.local_id, self.remote_id
                );
                let config = self.options.ice_configuration(Some(&credentials));
                if let Err(e) = transport.set_configuration(config).await {
                    warn!("Failed to apply refreshed TURN credentials: {}", e);
                }
                self.refresh_deadline(credentials.ttl)
            }
            Err(e) => {
                warn!("{}, keeping previous TURN credentials", e);
                Instant::now() + self.options.timing.turn_retry
            }
        }
    }

    /// Returns false once the connection is over
    async fn handle_transport_event(
        &mut self,
        transport: &dyn PeerTransport,
        event: TransportEvent,
    ) -> bool {
        match event {
            TransportEvent::NegotiationNeeded => self.negotiate(transport).await,
            TransportEvent::IceCandidate(candidate) => {
                let sent = SignalingMessage::ice_candidate(&self.remote_id, &candidate)
                    .and_then(|msg| self.signaling.send_message(msg));
                if let Err(e) = sent {
                    warn!("Failed to send ICE candidate: {}", e);
                }
            }
            TransportEvent::StateChanged(state) => match self.lifecycle.on_transport_state(state) {
                LifecycleEffect::Connected => {
                    info!(
                        "Peer connection ({}<->{}) connected",
                        self.local_id, self.remote_id
                    );
                    let _ = self.event_tx.send(PeerEvent::Connected);
                }
                LifecycleEffect::Reconnected => {
                    info!(
                        "Peer connection ({}<->{}) reconnected",
                        self.local_id, self.remote_id
                    );
                    let _ = self.event_tx.send(PeerEvent::Reconnected);
                }
                LifecycleEffect::RestartIce => {
                    debug!(
                        "Peer connection ({}<->{}) failed, restarting ICE",
                        self.local_id, self.remote_id
                    );
                    if let Err(e) = transport.restart_ice().await {
                        warn!("ICE restart failed: {}", e);
                    }
                }
                LifecycleEffect::Closed => {
                    debug!(
                        "Peer connection ({}<->{}) closed",
                        self.local_id, self.remote_id
                    );
                    return false;
                }
                LifecycleEffect::None => {}
            },
            TransportEvent::ChannelOpen => {
                self.channel_open = true;
                while let Some(text) = self.outbox.pop_front() {
                    debug!(
                        "Sending queued message on data channel ({}<->{})",
                        self.local_id, self.remote_id
                    );
                    if let Err(e) = transport.send(text).await {
                        warn!("Failed to send queued message: {}", e);
                    }
                }
                let _ = self.event_tx.send(PeerEvent::Open);
            }
            TransportEvent::ChannelMessage(text) => match serde_json::from_str(&text) {
                Ok(value) => {
                    let _ = self.event_tx.send(PeerEvent::Message(value));
                }
                Err(_) => warn!(
                    "Received malformed message on data channel ({}<->{}): {}",
                    self.local_id, self.remote_id, text
                ),
            },
            TransportEvent::ChannelClosed => {
                if self.channel_open {
                    debug!(
                        "Data channel ({}<->{}) closed by remote",
                        self.local_id, self.remote_id
                    );
                    return false;
                }
            }
        }
        true
    }

    async fn negotiate(&mut self, transport: &dyn PeerTransport) {
        if !self.negotiator.begin_offer() {
            return;
        }
        match transport.set_local_description().await {
            Ok(description) => {
                self.negotiator.offer_sent(description.sdp_type);
                self.send_description(&description);
            }
            Err(e) => {
                self.negotiator.offer_failed();
                error!(
                    "WebRTC negotiation error (for connection {}<->{}): {}",
                    self.local_id, self.remote_id, e
                );
            }
        }
    }

    async fn handle_signaling(&mut self, transport: &dyn PeerTransport, msg: SignalingMessage) {
        match msg.kind {
            SignalingKind::Description => {
                let Some(description) = msg.as_description() else {
                    warn!("Ignoring malformed description from {}", self.remote_id);
                    return;
                };
                if let Err(e) = self.apply_description(transport, description).await {
                    error!(
                        "WebRTC negotiation error (for connection {}<->{}): {}",
                        self.local_id, self.remote_id, e
                    );
                }
            }
            SignalingKind::IceCandidate => {
                // Browsers signal the end of candidates with a null candidate
                let Some(candidate) = msg.as_ice_candidate() else {
                    return;
                };
                if let Err(e) = transport.add_ice_candidate(candidate).await {
                    if self.negotiator.should_report_candidate_errors() {
                        error!(
                            "WebRTC negotiation error (for connection {}<->{}): {}",
                            self.local_id, self.remote_id, e
                        );
                    }
                }
            }
        }
    }

    async fn apply_description(
        &mut self,
        transport: &dyn PeerTransport,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let action = self
            .negotiator
            .on_remote_description(description.sdp_type, transport.signaling_state());
        match action {
            DescriptionAction::Ignore => {
                debug!(
                    "Ignoring colliding offer from {} ({}<->{})",
                    self.remote_id, self.local_id, self.remote_id
                );
                Ok(())
            }
            DescriptionAction::Apply => {
                let result = transport.set_remote_description(description).await;
                self.negotiator.remote_applied();
                result
            }
            DescriptionAction::ApplyAndAnswer => {
                transport.set_remote_description(description).await?;
                let answer = transport.set_local_description().await?;
                self.send_description(&answer);
                Ok(())
            }
        }
    }

    fn send_description(&self, description: &SessionDescription) {
        let sent = SignalingMessage::description(&self.remote_id, description)
            .and_then(|msg| self.signaling.send_message(msg));
        if let Err(e) = sent {
            warn!("Failed to send description: {}", e);
        }
    }

    async fn send_or_queue(&mut self, transport: &dyn PeerTransport, text: String) {
        if !self.channel_open {
            debug!(
                "Queued message for data channel ({}<->{})",
                self.local_id, self.remote_id
            );
            self.outbox.push_back(text);
            return;
        }
        if let Err(e) = transport.send(text).await {
            warn!(
                "Failed to send on data channel ({}<->{}): {}",
                self.local_id, self.remote_id, e
            );
        }
    }

    fn finish(&mut self) {
        self.lifecycle.close();
        if !self.outbox.is_empty() {
            debug!(
                "Dropping {} unsent message(s) for {}",
                self.outbox.len(),
                self.remote_id
            );
        }
        let _ = self.event_tx.send(PeerEvent::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_is_impolite() {
        assert_eq!(PeerRole::Caller.politeness(), Politeness::Impolite);
        assert_eq!(PeerRole::Callee.politeness(), Politeness::Polite);
    }

    #[test]
    fn test_fetched_credentials_replace_static_ones() {
        let mut config = BackendConfig::default();
        config.turn_username = Some("static".to_string());
        config.turn_password = Some("pw".to_string());
        let options = PeerOptions::from_config("remote", &config, Timing::default(), None);

        let ice = options.ice_configuration(None);
        assert_eq!(ice.ice_servers[1].username.as_deref(), Some("static"));

        let fetched = TurnCredentials {
            username: "1700000000:x".to_string(),
            password: "secret".to_string(),
            ttl: 3600,
        };
        let ice = options.ice_configuration(Some(&fetched));
        assert_eq!(ice.ice_servers[1].username.as_deref(), Some("1700000000:x"));
        assert_eq!(ice.ice_servers[1].credential.as_deref(), Some("secret"));
    }
}
