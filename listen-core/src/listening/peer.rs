//! Host and listener peers
//!
//! A [`ListeningPeer`] owns one signaling connection and any number of peer
//! connections keyed by remote id. Its role decides the topology:
//!
//! - a host accepts inbound connections from anyone (star topology), keeps
//!   `listeners` up to date and forwards every local state change to all
//!   connected listeners, sending newcomers a snapshot right away
//! - a listener connects to its host only, applies the host's sync messages
//!   and tracks whether the host is reachable
//!
//! Both roles answer `audioinforequest` messages from the metadata cache.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::context::PeerContext;
use super::identity::random_peer_id;
use crate::metadata::AudioInfo;
use crate::network::{
    PeerConnection, PeerEvent, PeerRole, ScheduledTask, SignalingConnection, SignalingError,
    SignalingMessage, SignalingStatus,
};
use crate::sync::{AudioUri, PeerId, PeerMessage, SyncMessage, SyncableListeningState};

/// Reachability of a listener's host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostConnectionState {
    Connecting,
    Connected,
    /// The connection to the host ended after it was established
    Closed,
    /// The host could not be reached in time
    Error,
}

/// Role of a [`ListeningPeer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListeningRole {
    Host,
    Listener { host_id: PeerId },
}

enum ListeningCommand {
    ConnectTo(PeerId),
    CloseConnections,
    Close,
    ConnectedPeers(oneshot::Sender<Vec<PeerId>>),
    RequestAudioInfo {
        uri: AudioUri,
        reply: oneshot::Sender<Option<AudioInfo>>,
    },
}

enum TimerEvent {
    HostDeadline,
}

/// Handle to a running host or listener
#[derive(Clone)]
pub struct ListeningPeer {
    id: PeerId,
    role: ListeningRole,
    state: SyncableListeningState,
    signaling: SignalingConnection,
    command_tx: mpsc::UnboundedSender<ListeningCommand>,
    host_connection: Option<watch::Receiver<HostConnectionState>>,
    audio_info_timeout: Duration,
    invitation_url: Option<String>,
}

impl ListeningPeer {
    /// Host a session under a fresh random id
    pub fn host(ctx: &PeerContext, state: SyncableListeningState) -> Result<Self, SignalingError> {
        Self::host_with_id(ctx, random_peer_id(), state)
    }

    pub fn host_with_id(
        ctx: &PeerContext,
        id: PeerId,
        state: SyncableListeningState,
    ) -> Result<Self, SignalingError> {
        Self::start(ctx, id, ListeningRole::Host, state)
    }

    /// Join the session hosted by `host_id` under a fresh random id
    pub fn listener(
        ctx: &PeerContext,
        host_id: &str,
        state: SyncableListeningState,
    ) -> Result<Self, SignalingError> {
        Self::listener_with_id(ctx, random_peer_id(), host_id, state)
    }

    pub fn listener_with_id(
        ctx: &PeerContext,
        id: PeerId,
        host_id: &str,
        state: SyncableListeningState,
    ) -> Result<Self, SignalingError> {
        let role = ListeningRole::Listener {
            host_id: host_id.to_string(),
        };
        Self::start(ctx, id, role, state)
    }

    fn start(
        ctx: &PeerContext,
        id: PeerId,
        role: ListeningRole,
        state: SyncableListeningState,
    ) -> Result<Self, SignalingError> {
        let signaling = SignalingConnection::connect(ctx.signaling_options(&id), ctx.relay.clone())?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (peer_events_tx, peer_events_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        let signaling_rx = signaling.messages();
        let status_rx = signaling.status_watch();

        let (policy, local_rx, host_connection, invitation_url) = match &role {
            ListeningRole::Host => {
                info!("Hosting session as {}", id);
                // Only the host turns local changes into sync messages
                let local_rx = state.local_changes();
                (
                    RolePolicy::Host,
                    Some(local_rx),
                    None,
                    ctx.config.invitation_url(&id),
                )
            }
            ListeningRole::Listener { host_id } => {
                info!("Joining session of {} as {}", host_id, id);
                let (state_tx, state_rx) = watch::channel(HostConnectionState::Connecting);
                let policy = RolePolicy::Listener(ListenerPolicy {
                    host_id: host_id.clone(),
                    state_tx,
                    deadline: None,
                    pending: HashMap::new(),
                });
                (
                    policy,
                    None,
                    Some(state_rx),
                    ctx.config.invitation_url(host_id),
                )
            }
        };

        let actor = ListeningActor {
            id: id.clone(),
            ctx: ctx.clone(),
            state: state.clone(),
            signaling: signaling.clone(),
            policy,
            connections: HashMap::new(),
            next_generation: 0,
            peer_events_tx,
            timer_tx,
        };
        tokio::spawn(actor.run(
            command_rx,
            peer_events_rx,
            timer_rx,
            signaling_rx,
            status_rx,
            local_rx,
        ));

        Ok(Self {
            id,
            role,
            state,
            signaling,
            command_tx,
            host_connection,
            audio_info_timeout: ctx.timing.audio_info_timeout,
            invitation_url,
        })
    }

    /// Our peer id on the relay
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> &ListeningRole {
        &self.role
    }

    pub fn is_host(&self) -> bool {
        self.role == ListeningRole::Host
    }

    pub fn state(&self) -> &SyncableListeningState {
        &self.state
    }

    pub fn signaling_status(&self) -> SignalingStatus {
        self.signaling.status()
    }

    /// Open an outbound connection to `peer_id`, replacing any existing one
    ///
    /// A listener only ever dials its host; other ids are ignored.
    pub fn connect_to_peer(&self, peer_id: &str) {
        let _ = self
            .command_tx
            .send(ListeningCommand::ConnectTo(peer_id.to_string()));
    }

    /// Close every peer connection but stay on the relay
    pub fn close_connections(&self) {
        let _ = self.command_tx.send(ListeningCommand::CloseConnections);
    }

    /// Close every connection and leave the relay
    pub fn close(&self) {
        let _ = self.command_tx.send(ListeningCommand::Close);
    }

    /// Remote ids with an established connection
    pub async fn connected_peers(&self) -> Vec<PeerId> {
        let (tx, rx) = oneshot::channel();
        if self
            .command_tx
            .send(ListeningCommand::ConnectedPeers(tx))
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Reachability of the host; `None` when we are the host
    pub fn host_connection_state(&self) -> Option<HostConnectionState> {
        self.host_connection.as_ref().map(|rx| *rx.borrow())
    }

    pub fn host_connection_watch(&self) -> Option<watch::Receiver<HostConnectionState>> {
        self.host_connection.clone()
    }

    /// Ask the host for metadata about `uri`
    ///
    /// Yields `None` if we are the host, the host has no metadata for it,
    /// or no reply arrives in time.
    pub async fn request_audio_info_from_host(&self, uri: &str) -> Option<AudioInfo> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(ListeningCommand::RequestAudioInfo {
                uri: uri.to_string(),
                reply: tx,
            })
            .ok()?;
        match tokio::time::timeout(self.audio_info_timeout, rx).await {
            Ok(Ok(info)) => info,
            Ok(Err(_)) => None,
            Err(_) => {
                debug!("Audio info request for {} timed out", uri);
                None
            }
        }
    }

    /// Share link for this session
    pub fn invitation_url(&self) -> Option<&str> {
        self.invitation_url.as_deref()
    }
}

/// Role-specific state of the actor
enum RolePolicy {
    Host,
    Listener(ListenerPolicy),
}

struct ListenerPolicy {
    host_id: PeerId,
    state_tx: watch::Sender<HostConnectionState>,
    deadline: Option<ScheduledTask>,
    /// Outstanding audio info requests by uri
    pending: HashMap<AudioUri, Vec<oneshot::Sender<Option<AudioInfo>>>>,
}

impl ListenerPolicy {
    fn host_state(&self) -> HostConnectionState {
        *self.state_tx.borrow()
    }

    fn set_host_state(&self, state: HostConnectionState) {
        if self.host_state() != state {
            info!("Connection to host {}: {:?}", self.host_id, state);
            self.state_tx.send_replace(state);
        }
    }

    fn cancel_deadline(&mut self) {
        if let Some(mut deadline) = self.deadline.take() {
            deadline.cancel();
        }
    }

    fn resolve_pending(&mut self) {
        for (_, replies) in self.pending.drain() {
            for reply in replies {
                let _ = reply.send(None);
            }
        }
    }
}

struct Connection {
    handle: PeerConnection,
    /// Tells events of this connection apart from a replaced one's
    generation: u64,
    connected: bool,
}

struct ListeningActor {
    id: PeerId,
    ctx: PeerContext,
    state: SyncableListeningState,
    signaling: SignalingConnection,
    policy: RolePolicy,
    connections: HashMap<PeerId, Connection>,
    next_generation: u64,
    peer_events_tx: mpsc::UnboundedSender<(PeerId, u64, PeerEvent)>,
    timer_tx: mpsc::UnboundedSender<TimerEvent>,
}

async fn next_local_change(
    rx: &mut Option<mpsc::UnboundedReceiver<SyncMessage>>,
) -> Option<SyncMessage> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl ListeningActor {
    async fn run(
        mut self,
        mut command_rx: mpsc::UnboundedReceiver<ListeningCommand>,
        mut peer_events_rx: mpsc::UnboundedReceiver<(PeerId, u64, PeerEvent)>,
        mut timer_rx: mpsc::UnboundedReceiver<TimerEvent>,
        mut signaling_rx: mpsc::UnboundedReceiver<SignalingMessage>,
        mut status_rx: watch::Receiver<SignalingStatus>,
        mut local_rx: Option<mpsc::UnboundedReceiver<SyncMessage>>,
    ) {
        self.start_listening();

        let initial = status_rx.borrow_and_update().clone();
        self.handle_signaling_status(initial);
        let mut watching_status = true;

        loop {
            tokio::select! {
                cmd = command_rx.recv() => match cmd {
                    Some(ListeningCommand::Close) | None => break,
                    Some(cmd) => self.handle_command(cmd),
                },
                Some((remote, generation, event)) = peer_events_rx.recv() => {
                    self.handle_peer_event(remote, generation, event);
                }
                Some(msg) = signaling_rx.recv() => self.handle_signaling(msg),
                Some(msg) = next_local_change(&mut local_rx) => self.forward(msg),
                Some(TimerEvent::HostDeadline) = timer_rx.recv() => self.host_deadline(),
                changed = status_rx.changed(), if watching_status => match changed {
                    Ok(()) => {
                        let status = status_rx.borrow_and_update().clone();
                        self.handle_signaling_status(status);
                    }
                    Err(_) => watching_status = false,
                },
            }
        }

        self.shutdown();
    }

    /// A listener connects to its host straight away; signaling queues the
    /// offer until the relay is reachable
    fn start_listening(&mut self) {
        let RolePolicy::Listener(listener) = &self.policy else {
            return;
        };
        let host_id = listener.host_id.clone();
        let timer_tx = self.timer_tx.clone();
        let deadline = ScheduledTask::after(self.ctx.timing.host_connect_timeout, move || {
            let _ = timer_tx.send(TimerEvent::HostDeadline);
        });
        if let RolePolicy::Listener(listener) = &mut self.policy {
            listener.deadline = Some(deadline);
        }
        self.open_connection(host_id, PeerRole::Caller);
    }

    fn handle_command(&mut self, cmd: ListeningCommand) {
        match cmd {
            ListeningCommand::ConnectTo(peer_id) => {
                if let RolePolicy::Listener(listener) = &self.policy {
                    if listener.host_id != peer_id {
                        warn!(
                            "Not connecting to {}: a listener only connects to its host {}",
                            peer_id, listener.host_id
                        );
                        return;
                    }
                }
                self.open_connection(peer_id, PeerRole::Caller);
            }
            ListeningCommand::CloseConnections => {
                debug!("Closing {} peer connection(s)", self.connections.len());
                for connection in self.connections.values() {
                    connection.handle.close();
                }
            }
            ListeningCommand::ConnectedPeers(reply) => {
                let peers = self
                    .connections
                    .iter()
                    .filter(|(_, c)| c.connected)
                    .map(|(id, _)| id.clone())
                    .collect();
                let _ = reply.send(peers);
            }
            ListeningCommand::RequestAudioInfo { uri, reply } => self.request_audio_info(uri, reply),
            // Handled by the run loop
            ListeningCommand::Close => {}
        }
    }

    fn open_connection(&mut self, remote: PeerId, role: PeerRole) {
        if let Some(old) = self.connections.remove(&remote) {
            debug!("Replacing connection to {}", remote);
            old.handle.close();
        }

        let options = self.ctx.peer_options(&remote);
        let transports = self.ctx.transports.clone();
        let (handle, mut events) = match role {
            PeerRole::Caller => PeerConnection::caller(&self.signaling, options, transports),
            PeerRole::Callee => PeerConnection::callee(&self.signaling, options, transports),
        };

        let generation = self.next_generation;
        self.next_generation += 1;

        let tx = self.peer_events_tx.clone();
        let id = remote.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send((id.clone(), generation, event)).is_err() {
                    break;
                }
            }
        });

        self.connections.insert(
            remote,
            Connection {
                handle,
                generation,
                connected: false,
            },
        );
    }

    fn handle_signaling(&mut self, msg: SignalingMessage) {
        let Some(from) = msg.from.clone() else {
            return;
        };
        if self.connections.contains_key(&from) {
            // Routed to the connection itself
            return;
        }

        let is_offer = msg.as_description().is_some_and(|d| d.is_offer());
        match self.policy {
            RolePolicy::Host if is_offer => {
                info!("Incoming connection from {}", from);
                self.open_connection(from, PeerRole::Callee);
            }
            _ => {
                debug!("Discarding unsolicited {:?} from {}", msg.kind, from);
                self.signaling.discard_backlog(&from);
            }
        }
    }

    fn handle_signaling_status(&mut self, status: SignalingStatus) {
        match (&self.policy, status) {
            (RolePolicy::Host, SignalingStatus::Open) => {
                let id = self.id.clone();
                self.state.apply_local_change(|state| {
                    if !state.listeners.contains(&id) {
                        state.listeners = vec![id];
                    }
                });
            }
            (RolePolicy::Listener(listener), SignalingStatus::Failed(failure)) => {
                if listener.host_state() == HostConnectionState::Connecting {
                    warn!("Cannot reach host {}: signaling failed ({:?})", listener.host_id, failure);
                    listener.set_host_state(HostConnectionState::Error);
                }
            }
            _ => {}
        }
    }

    fn handle_peer_event(&mut self, remote: PeerId, generation: u64, event: PeerEvent) {
        let Some(connection) = self.connections.get_mut(&remote) else {
            return;
        };
        if connection.generation != generation {
            return;
        }

        match event {
            PeerEvent::Connected => {
                connection.connected = true;
                self.peer_connected(&remote);
            }
            PeerEvent::Reconnected => {
                connection.connected = true;
                debug!("Connection to {} recovered", remote);
            }
            PeerEvent::Open => debug!("Data channel to {} open", remote),
            PeerEvent::Message(value) => self.peer_message(&remote, value),
            PeerEvent::Closed => {
                self.connections.remove(&remote);
                self.signaling.discard_backlog(&remote);
                self.peer_closed(&remote);
            }
        }
    }

    fn peer_connected(&mut self, remote: &str) {
        match &mut self.policy {
            RolePolicy::Host => {
                info!("Listener {} connected", remote);
                // Optimistically a listener from now on; the channel opens shortly
                let id = remote.to_string();
                self.state.apply_local_change(|state| {
                    if !state.listeners.contains(&id) {
                        state.listeners.push(id);
                    }
                });

                let snapshot = self.state.snapshot();
                self.send_to(remote, &PeerMessage::from(SyncMessage::playlist_of(&snapshot)));
                self.send_to(remote, &PeerMessage::from(SyncMessage::playback_of(&snapshot)));
            }
            RolePolicy::Listener(listener) if listener.host_id == remote => {
                match listener.host_state() {
                    HostConnectionState::Connecting => {
                        listener.cancel_deadline();
                        listener.set_host_state(HostConnectionState::Connected);
                    }
                    HostConnectionState::Error => {
                        warn!(
                            "Connection to host {} completed after the deadline, discarding it",
                            remote
                        );
                        if let Some(connection) = self.connections.get(remote) {
                            connection.handle.close();
                        }
                    }
                    HostConnectionState::Connected | HostConnectionState::Closed => {}
                }
            }
            RolePolicy::Listener(_) => info!("Connected to {}", remote),
        }
    }

    fn peer_closed(&mut self, remote: &str) {
        match &mut self.policy {
            RolePolicy::Host => {
                info!("Listener {} left", remote);
                self.state.apply_local_change(|state| {
                    state.listeners.retain(|id| id != remote);
                });
            }
            RolePolicy::Listener(listener) if listener.host_id == remote => {
                listener.cancel_deadline();
                listener.resolve_pending();
                if listener.host_state() != HostConnectionState::Error {
                    listener.set_host_state(HostConnectionState::Closed);
                }
            }
            RolePolicy::Listener(_) => debug!("Connection to {} closed", remote),
        }
    }

    fn peer_message(&mut self, remote: &str, value: serde_json::Value) {
        let msg: PeerMessage = match serde_json::from_value(value) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Received malformed message from {}: {}", remote, e);
                return;
            }
        };

        match msg {
            PeerMessage::AudioInfoRequest(uri) => self.answer_audio_info(remote, &uri),
            PeerMessage::AudioInfo(info) => match &mut self.policy {
                RolePolicy::Listener(listener) if listener.host_id == remote => {
                    match listener.pending.remove(&info.uri) {
                        Some(replies) => {
                            for reply in replies {
                                let _ = reply.send(Some(info.clone()));
                            }
                        }
                        None => debug!("Ignoring unrequested audio info for {}", info.uri),
                    }
                }
                _ => debug!("Ignoring audio info from {}", remote),
            },
            msg => {
                let Some(sync) = msg.as_sync() else {
                    return;
                };
                match &self.policy {
                    RolePolicy::Listener(listener) if listener.host_id == remote => {
                        debug!("Received sync message: {:?}", sync);
                        self.state.apply_sync_message(&sync);
                    }
                    _ => warn!("Ignoring sync message from {}, which is not the host", remote),
                }
            }
        }
    }

    fn answer_audio_info(&self, remote: &str, uri: &str) {
        match self.ctx.metadata.audio_info(uri) {
            Some(info) => self.send_to(remote, &PeerMessage::AudioInfo(info)),
            None => debug!("No audio info for {} requested by {}", uri, remote),
        }
    }

    fn request_audio_info(&mut self, uri: AudioUri, reply: oneshot::Sender<Option<AudioInfo>>) {
        let RolePolicy::Listener(listener) = &mut self.policy else {
            let _ = reply.send(None);
            return;
        };
        let Some(host) = self.connections.get(&listener.host_id) else {
            let _ = reply.send(None);
            return;
        };

        if let Err(e) = host
            .handle
            .send_message(&PeerMessage::AudioInfoRequest(uri.clone()))
        {
            warn!("Failed to request audio info: {}", e);
            let _ = reply.send(None);
            return;
        }
        let replies = listener.pending.entry(uri).or_default();
        replies.retain(|r| !r.is_closed());
        replies.push(reply);
    }

    fn host_deadline(&mut self) {
        let RolePolicy::Listener(listener) = &mut self.policy else {
            return;
        };
        listener.deadline = None;
        if listener.host_state() == HostConnectionState::Connecting {
            warn!(
                "Connection to host {} not established within {:?}",
                listener.host_id, self.ctx.timing.host_connect_timeout
            );
            listener.set_host_state(HostConnectionState::Error);
        }
    }

    /// Send a local change to every connected listener
    fn forward(&self, msg: SyncMessage) {
        let msg = PeerMessage::from(msg);
        for (remote, connection) in &self.connections {
            if connection.connected {
                self.send_to(remote, &msg);
            }
        }
    }

    fn send_to(&self, remote: &str, msg: &PeerMessage) {
        let Some(connection) = self.connections.get(remote) else {
            return;
        };
        if let Err(e) = connection.handle.send_message(msg) {
            warn!("Failed to send to {}: {}", remote, e);
        }
    }

    fn shutdown(&mut self) {
        info!("Closing peer {}", self.id);
        for (_, connection) in self.connections.drain() {
            connection.handle.close();
        }
        if let RolePolicy::Listener(listener) = &mut self.policy {
            listener.cancel_deadline();
            listener.resolve_pending();
        }
        self.signaling.close();
    }
}
