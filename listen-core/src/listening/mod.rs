//! Listening peers: the host/listener star on top of peer connections

mod context;
mod identity;
mod peer;

pub use context::PeerContext;
pub use identity::{parse_peer_id, random_peer_id, PEER_ID_LENGTH};
pub use peer::{HostConnectionState, ListeningPeer, ListeningRole};
