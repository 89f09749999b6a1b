//! Listen Together - Core Library
//!
//! This library provides the core of listening together: peers discover
//! each other through a signaling relay, negotiate direct WebRTC data
//! channels, and replicate the playback state of one host to all its
//! listeners.

pub mod config;
pub mod listening;
pub mod logging;
pub mod metadata;
pub mod network;
pub mod session;
pub mod sync;

// Re-exports for convenience
pub use config::{BackendConfig, Settings, Timing};
pub use listening::{HostConnectionState, ListeningPeer, ListeningRole, PeerContext};
pub use metadata::{AudioInfo, MemoryMetadataCache, MetadataCache};
pub use session::{ListeningSession, PlayAction, SessionCallback, SessionError};
pub use sync::{ListeningState, PlaybackState, SyncMessage, SyncableListeningState};
