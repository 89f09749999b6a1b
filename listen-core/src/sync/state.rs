//! Replicated listening state
//!
//! A [`SyncableListeningState`] is a cheap cloneable handle to one replica.
//! Local mutations are diffed against the previous value, subscribers whose
//! paths intersect the diff are notified, and one whole-section
//! [`SyncMessage`] per touched section is pushed to every `local_changes`
//! receiver. Inbound sync messages replace a section and notify, but never
//! produce outbound messages.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::path::{diff, Section, StateDiff, StatePath};
use super::protocol::{AudioUri, ListeningState, PeerId, PlaybackState, SyncMessage};

/// Callback invoked with the post-change state
pub type StateCallback = Arc<dyn Fn(&ListeningState) + Send + Sync>;

/// Returned by [`SyncableListeningState::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    paths: Vec<StatePath>,
    callback: StateCallback,
}

#[derive(Default)]
struct Replica {
    state: ListeningState,
    subscriptions: Vec<Subscription>,
    next_subscription: u64,
    outbound: Vec<mpsc::UnboundedSender<SyncMessage>>,
}

impl Replica {
    /// Callbacks interested in `diff`, each at most once
    fn interested(&self, diff: &StateDiff) -> Vec<StateCallback> {
        let mut fired: Vec<StateCallback> = Vec::new();
        for sub in &self.subscriptions {
            if !diff.touches(&sub.paths) {
                continue;
            }
            let already = fired
                .iter()
                .any(|cb| Arc::as_ptr(cb) as *const () == Arc::as_ptr(&sub.callback) as *const ());
            if !already {
                fired.push(sub.callback.clone());
            }
        }
        fired
    }
}

/// Handle to a replicated [`ListeningState`]
#[derive(Clone, Default)]
pub struct SyncableListeningState {
    inner: Arc<Mutex<Replica>>,
}

impl SyncableListeningState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: ListeningState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Replica {
                state,
                ..Default::default()
            })),
        }
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> ListeningState {
        self.inner.lock().state.clone()
    }

    pub fn playback(&self) -> PlaybackState {
        self.inner.lock().state.playback.clone()
    }

    pub fn playlist(&self) -> Vec<AudioUri> {
        self.inner.lock().state.playlist.clone()
    }

    pub fn listeners(&self) -> Vec<PeerId> {
        self.inner.lock().state.listeners.clone()
    }

    /// Register `callback` for changes intersecting any of `paths`
    pub fn subscribe(&self, paths: Vec<StatePath>, callback: StateCallback) -> SubscriptionId {
        let mut replica = self.inner.lock();
        let id = SubscriptionId(replica.next_subscription);
        replica.next_subscription += 1;
        replica.subscriptions.push(Subscription {
            id,
            paths,
            callback,
        });
        id
    }

    /// Returns false if `id` was not registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut replica = self.inner.lock();
        let before = replica.subscriptions.len();
        replica.subscriptions.retain(|sub| sub.id != id);
        replica.subscriptions.len() != before
    }

    /// Stream of outbound sync messages produced by local changes
    pub fn local_changes(&self) -> mpsc::UnboundedReceiver<SyncMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().outbound.push(tx);
        rx
    }

    /// Mutate the state locally
    ///
    /// `mutator` runs while the replica is locked and must not call back
    /// into this handle. Subscribers run after the lock is released.
    pub fn apply_local_change<F>(&self, mutator: F) -> StateDiff
    where
        F: FnOnce(&mut ListeningState),
    {
        let (diff, callbacks, snapshot) = {
            let mut replica = self.inner.lock();
            let mut next = replica.state.clone();
            mutator(&mut next);
            let diff = diff(&replica.state, &next);
            if diff.is_empty() {
                return diff;
            }
            replica.state = next;

            for section in diff.sections() {
                let msg = section_message(&replica.state, section);
                replica.outbound.retain(|tx| tx.send(msg.clone()).is_ok());
            }

            let callbacks = replica.interested(&diff);
            (diff, callbacks, replica.state.clone())
        };

        debug!("Local change touched {} path(s)", diff.changes().len());
        for callback in callbacks {
            callback(&snapshot);
        }
        diff
    }

    /// Replace the section named by `msg` with its payload
    pub fn apply_sync_message(&self, msg: &SyncMessage) -> StateDiff {
        let (diff, callbacks, snapshot) = {
            let mut replica = self.inner.lock();
            let mut next = replica.state.clone();
            msg.apply_to(&mut next);
            let diff = diff(&replica.state, &next);
            if diff.is_empty() {
                return diff;
            }
            replica.state = next;
            let callbacks = replica.interested(&diff);
            (diff, callbacks, replica.state.clone())
        };

        for callback in callbacks {
            callback(&snapshot);
        }
        diff
    }
}

fn section_message(state: &ListeningState, section: Section) -> SyncMessage {
    match section {
        Section::Playback => SyncMessage::playback_of(state),
        Section::Playlist => SyncMessage::playlist_of(state),
        Section::Listeners => SyncMessage::listeners_of(state),
    }
}
