//! Listening session
//!
//! The user-facing side of a listening: owns the replicated state and the
//! current peer, and offers the operations of a media session (play, pause,
//! seek, skip, ...) as changes to the shared state.
//!
//! Only the host may change the shared state. A listener session that loses
//! its host turns itself into a host session with the state it has, so
//! playback can continue (and be controlled) locally.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::listening::{HostConnectionState, ListeningPeer, ListeningRole, PeerContext};
use crate::metadata::AudioInfo;
use crate::network::SignalingError;
use crate::sync::{
    current_time_ms, AudioUri, ListeningState, PeerId, StateCallback, StatePath, SubscriptionId,
    SyncableListeningState,
};

/// Seconds jumped by [`ListeningSession::replay`] and [`ListeningSession::forward`]
const SEEK_STEP_SECS: f64 = 30.0;

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Not the host")]
    NotHost,

    #[error("Audio is not in the playlist: {0}")]
    NotInPlaylist(AudioUri),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Session is closed")]
    Closed,
}

/// Callback interface for session events
pub trait SessionCallback: Send + Sync {
    /// The session switched roles (a listener became host)
    fn on_role_changed(&self, _role: ListeningRole) {}
    fn on_host_connection_changed(&self, _state: HostConnectionState) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayAction {
    Play,
    Pause,
}

/// Entry of the participant list shown to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerInfo {
    pub id: PeerId,
    pub name: String,
}

struct SessionInner {
    ctx: PeerContext,
    state: SyncableListeningState,
    peer: RwLock<ListeningPeer>,
    callback: RwLock<Option<Arc<dyn SessionCallback>>>,
    closed: AtomicBool,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// A hosted or joined listening session
#[derive(Clone)]
pub struct ListeningSession {
    inner: Arc<SessionInner>,
}

impl ListeningSession {
    /// Host a new session
    pub fn create_host(ctx: PeerContext) -> Result<Self, SessionError> {
        let state = SyncableListeningState::new();
        let peer = ListeningPeer::host(&ctx, state.clone())?;
        Ok(Self::with_peer(ctx, state, peer))
    }

    /// Join the session hosted by `host_id`
    ///
    /// Falls back to hosting when the host connection ends or cannot be
    /// established.
    pub fn create_listener(ctx: PeerContext, host_id: &str) -> Result<Self, SessionError> {
        let state = SyncableListeningState::new();
        let peer = ListeningPeer::listener(&ctx, host_id, state.clone())?;
        let host_connection = peer.host_connection_watch();

        let session = Self::with_peer(ctx, state, peer);
        if let Some(rx) = host_connection {
            let supervisor = supervise(Arc::downgrade(&session.inner), rx);
            *session.inner.supervisor.lock() = Some(supervisor);
        }
        Ok(session)
    }

    fn with_peer(ctx: PeerContext, state: SyncableListeningState, peer: ListeningPeer) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                ctx,
                state,
                peer: RwLock::new(peer),
                callback: RwLock::new(None),
                closed: AtomicBool::new(false),
                supervisor: Mutex::new(None),
            }),
        }
    }

    pub fn set_callback(&self, callback: Arc<dyn SessionCallback>) {
        *self.inner.callback.write() = Some(callback);
    }

    fn notify(&self, f: impl FnOnce(&dyn SessionCallback)) {
        let callback = self.inner.callback.read().clone();
        if let Some(callback) = callback {
            f(callback.as_ref());
        }
    }

    /// Current peer (replaced when a listener becomes host)
    pub fn peer(&self) -> ListeningPeer {
        self.inner.peer.read().clone()
    }

    pub fn role(&self) -> ListeningRole {
        self.inner.peer.read().role().clone()
    }

    pub fn is_host(&self) -> bool {
        self.inner.peer.read().is_host()
    }

    pub fn state(&self) -> &SyncableListeningState {
        &self.inner.state
    }

    pub fn snapshot(&self) -> ListeningState {
        self.inner.state.snapshot()
    }

    pub fn host_connection_state(&self) -> Option<HostConnectionState> {
        self.inner.peer.read().host_connection_state()
    }

    pub fn invitation_url(&self) -> Option<String> {
        self.inner.peer.read().invitation_url().map(str::to_string)
    }

    pub fn subscribe(&self, paths: Vec<StatePath>, callback: StateCallback) -> SubscriptionId {
        self.inner.state.subscribe(paths, callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.state.unsubscribe(id)
    }

    /// Turn a listener session into a host session
    ///
    /// The replicated state is kept, everything else (signaling, peer
    /// connections, our id) is replaced. Does nothing for a host session.
    pub fn transform_to_host(&self) -> Result<(), SessionError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }

        let old = self.peer();
        if old.is_host() {
            return Ok(());
        }
        // Signaling may still be open, so close it cleanly
        old.close();

        let host = ListeningPeer::host(&self.inner.ctx, self.inner.state.clone())?;
        info!("Listener {} is now hosting as {}", old.id(), host.id());
        *self.inner.peer.write() = host;

        self.notify(|cb| cb.on_role_changed(ListeningRole::Host));
        Ok(())
    }

    fn ensure_host(&self) -> Result<(), SessionError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }
        if !self.is_host() {
            return Err(SessionError::NotHost);
        }
        Ok(())
    }

    /// Append `audio` to the playlist, starting it if nothing is playing
    pub fn add_audio(&self, audio: &str) -> Result<(), SessionError> {
        self.ensure_host()?;
        let state = &self.inner.state;
        if state.playlist().iter().any(|a| a == audio) {
            debug!("Ignored request to add audio which is already in playlist: {}", audio);
            return Ok(());
        }

        state.apply_local_change(|s| s.playlist.push(audio.to_string()));

        if state.playback().current_audio.is_none() {
            self.play_audio(audio)?;
        }
        Ok(())
    }

    pub fn remove_audio(&self, audio: &str) -> Result<(), SessionError> {
        self.ensure_host()?;
        self.inner
            .state
            .apply_local_change(|s| s.playlist.retain(|a| a != audio));
        Ok(())
    }

    /// Play `audio` from the start
    pub fn play_audio(&self, audio: &str) -> Result<(), SessionError> {
        self.ensure_host()?;
        if !self.inner.state.playlist().iter().any(|a| a == audio) {
            warn!("Ignored request to play audio which is not in playlist: {}", audio);
            return Err(SessionError::NotInPlaylist(audio.to_string()));
        }

        let now = current_time_ms();
        self.inner.state.apply_local_change(|s| {
            s.playback.current_audio = Some(audio.to_string());
            s.playback.audio_time = 0.0;
            s.playback.reference_time = now;
        });
        Ok(())
    }

    /// Play, pause, or flip between the two when `action` is `None`
    pub fn toggle_play(&self, action: Option<PlayAction>) -> Result<(), SessionError> {
        self.ensure_host()?;
        let now = current_time_ms();
        self.inner.state.apply_local_change(|s| {
            let position = s.playback.position_at(now);
            s.playback.paused = match action {
                Some(PlayAction::Play) => false,
                Some(PlayAction::Pause) => true,
                None => !s.playback.paused,
            };
            s.playback.audio_time = position;
            s.playback.reference_time = now;
        });
        Ok(())
    }

    /// Jump to `seconds` into the current audio
    pub fn seek(&self, seconds: f64) -> Result<(), SessionError> {
        self.ensure_host()?;
        let now = current_time_ms();
        self.inner.state.apply_local_change(|s| {
            s.playback.audio_time = seconds.max(0.0);
            s.playback.reference_time = now;
        });
        Ok(())
    }

    /// Current position in seconds, extrapolated from the shared state
    pub fn position(&self) -> f64 {
        self.inner.state.playback().position_at(current_time_ms())
    }

    pub fn replay(&self) -> Result<(), SessionError> {
        self.seek(self.position() - SEEK_STEP_SECS)
    }

    pub fn forward(&self) -> Result<(), SessionError> {
        self.seek(self.position() + SEEK_STEP_SECS)
    }

    pub fn skip_previous(&self) -> Result<(), SessionError> {
        self.ensure_host()?;
        let snapshot = self.inner.state.snapshot();
        let previous = current_index(&snapshot)
            .and_then(|i| i.checked_sub(1))
            .and_then(|i| snapshot.playlist.get(i));
        match previous {
            Some(audio) => self.play_audio(audio),
            None => Ok(()),
        }
    }

    pub fn skip_next(&self) -> Result<(), SessionError> {
        self.ensure_host()?;
        let snapshot = self.inner.state.snapshot();
        let next = current_index(&snapshot).and_then(|i| snapshot.playlist.get(i + 1));
        match next {
            Some(audio) => self.play_audio(audio),
            None => Ok(()),
        }
    }

    pub fn stop(&self) -> Result<(), SessionError> {
        self.toggle_play(Some(PlayAction::Pause))
    }

    /// Everyone in the session, from our point of view
    pub fn listeners(&self) -> Vec<ListenerInfo> {
        let peer = self.peer();
        let mut infos = Vec::new();
        let mut exclude = vec![peer.id().to_string()];

        match peer.role() {
            ListeningRole::Listener { host_id } => {
                infos.push(ListenerInfo {
                    id: host_id.clone(),
                    name: "Host".to_string(),
                });
                infos.push(ListenerInfo {
                    id: peer.id().to_string(),
                    name: "+You".to_string(),
                });
                exclude.push(host_id.clone());
            }
            ListeningRole::Host => infos.push(ListenerInfo {
                id: peer.id().to_string(),
                name: "You".to_string(),
            }),
        }

        infos.extend(
            self.inner
                .state
                .listeners()
                .into_iter()
                .filter(|id| !exclude.contains(id))
                .map(|id| ListenerInfo {
                    id,
                    name: "+1".to_string(),
                }),
        );
        infos
    }

    /// Metadata for `uri`, from the local cache or else from the host
    pub async fn request_audio_info(&self, uri: &str) -> Option<AudioInfo> {
        if let Some(info) = self.inner.ctx.metadata.audio_info(uri) {
            return Some(info);
        }
        let peer = self.peer();
        if peer.is_host() {
            return None;
        }
        peer.request_audio_info_from_host(uri).await
    }

    /// Leave the session
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(supervisor) = self.inner.supervisor.lock().take() {
            supervisor.abort();
        }
        self.peer().close();
        info!("Session closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

fn current_index(state: &ListeningState) -> Option<usize> {
    let current = state.playback.current_audio.as_ref()?;
    state.playlist.iter().position(|a| a == current)
}

/// Watch a listener's host connection, falling back to hosting when it
/// ends
fn supervise(
    session: Weak<SessionInner>,
    mut rx: watch::Receiver<HostConnectionState>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let state = *rx.borrow_and_update();
            let Some(inner) = session.upgrade() else {
                return;
            };
            let session = ListeningSession { inner };
            if session.is_closed() {
                return;
            }

            session.notify(|cb| cb.on_host_connection_changed(state));

            if matches!(
                state,
                HostConnectionState::Closed | HostConnectionState::Error
            ) {
                info!("Lost host ({:?}), continuing as host", state);
                if let Err(e) = session.transform_to_host() {
                    warn!("Failed to become host: {}", e);
                }
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::PlaybackState;

    #[test]
    fn test_current_index() {
        let mut state = ListeningState {
            playlist: vec!["a".to_string(), "b".to_string()],
            ..Default::default()
        };
        assert_eq!(current_index(&state), None);

        state.playback = PlaybackState {
            current_audio: Some("b".to_string()),
            ..Default::default()
        };
        assert_eq!(current_index(&state), Some(1));

        state.playback.current_audio = Some("gone".to_string());
        assert_eq!(current_index(&state), None);
    }
}
