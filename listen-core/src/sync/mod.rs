//! Replicated state and the sync protocol carried over peer channels

mod path;
mod protocol;
mod state;

pub use path::{
    diff, Change, ItemChange, ListSection, PlaybackChange, PlaybackField, Section, StateDiff,
    StatePath,
};
pub use protocol::{
    current_time_ms, AudioUri, ListeningState, PeerId, PeerMessage, PlaybackState, SyncMessage,
};
pub use state::{StateCallback, SubscriptionId, SyncableListeningState};
