//! Peer id generation and parsing

use rand::Rng;

use crate::sync::PeerId;

/// Characters used in generated ids (lowercase base 36)
const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generated id length (36^8, about 2.8 trillion ids)
pub const PEER_ID_LENGTH: usize = 8;

/// Generate a random peer id
pub fn random_peer_id() -> PeerId {
    let mut rng = rand::thread_rng();
    (0..PEER_ID_LENGTH)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Parse a peer id from user input
///
/// Accepts a bare id or an invitation URL (`https://.../#<id>`). Surrounding
/// whitespace is ignored and the id is lowercased.
pub fn parse_peer_id(input: &str) -> Option<PeerId> {
    let input = input.trim();
    let id = match input.rsplit_once('#') {
        Some((_, fragment)) => fragment,
        None => input,
    };
    let id = id.trim().to_ascii_lowercase();

    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(id)
}
