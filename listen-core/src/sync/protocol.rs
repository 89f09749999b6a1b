//! Sync Protocol Messages
//!
//! Everything in here travels over the peer data channel as JSON of the
//! shape `{ "type": ..., "data": ... }`.

use serde::{Deserialize, Serialize};

use crate::metadata::AudioInfo;

/// Opaque identity of a signaling/connection endpoint
pub type PeerId = String;

/// Identifier of a piece of audio shared in a session
pub type AudioUri = String;

/// Current playback state
///
/// `reference_time` and `audio_time` together say where in the track we
/// were at that wall-clock instant, so every peer can extrapolate the
/// current position without polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    /// Audio currently loaded, if any
    pub current_audio: Option<AudioUri>,
    /// Wall-clock timestamp (ms since the Unix epoch) `audio_time` refers to
    pub reference_time: f64,
    /// Position in seconds at `reference_time`
    pub audio_time: f64,
    pub playback_rate: f64,
    pub paused: bool,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            current_audio: None,
            reference_time: 0.0,
            audio_time: 0.0,
            playback_rate: 1.0,
            paused: true,
        }
    }
}

impl PlaybackState {
    /// Position in seconds at wall-clock time `now_ms`
    pub fn position_at(&self, now_ms: f64) -> f64 {
        if self.paused {
            return self.audio_time;
        }
        let elapsed = (now_ms - self.reference_time).max(0.0) / 1000.0;
        self.audio_time + elapsed * self.playback_rate
    }
}

/// The replicated document every peer converges on
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListeningState {
    pub playback: PlaybackState,
    pub playlist: Vec<AudioUri>,
    pub listeners: Vec<PeerId>,
}

/// Whole-section replacement of the replicated state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum SyncMessage {
    Playback(PlaybackState),
    Playlist(Vec<AudioUri>),
    Listeners(Vec<PeerId>),
}

impl SyncMessage {
    /// Snapshot of one section of `state`
    pub fn playback_of(state: &ListeningState) -> Self {
        SyncMessage::Playback(state.playback.clone())
    }

    pub fn playlist_of(state: &ListeningState) -> Self {
        SyncMessage::Playlist(state.playlist.clone())
    }

    pub fn listeners_of(state: &ListeningState) -> Self {
        SyncMessage::Listeners(state.listeners.clone())
    }

    /// Replace the matching section of `state` with this message's payload
    pub fn apply_to(&self, state: &mut ListeningState) {
        match self {
            SyncMessage::Playback(playback) => state.playback = playback.clone(),
            SyncMessage::Playlist(playlist) => state.playlist = playlist.clone(),
            SyncMessage::Listeners(listeners) => state.listeners = listeners.clone(),
        }
    }
}

/// Every message that can appear on a peer data channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum PeerMessage {
    Playback(PlaybackState),
    Playlist(Vec<AudioUri>),
    Listeners(Vec<PeerId>),
    /// Ask the other side for metadata about an audio
    AudioInfoRequest(AudioUri),
    /// Answer to an `audioinforequest`
    AudioInfo(AudioInfo),
}

impl PeerMessage {
    /// The state section carried by this message, if it is a sync message
    pub fn as_sync(&self) -> Option<SyncMessage> {
        match self {
            PeerMessage::Playback(p) => Some(SyncMessage::Playback(p.clone())),
            PeerMessage::Playlist(p) => Some(SyncMessage::Playlist(p.clone())),
            PeerMessage::Listeners(l) => Some(SyncMessage::Listeners(l.clone())),
            PeerMessage::AudioInfoRequest(_) | PeerMessage::AudioInfo(_) => None,
        }
    }
}

impl From<SyncMessage> for PeerMessage {
    fn from(msg: SyncMessage) -> Self {
        match msg {
            SyncMessage::Playback(p) => PeerMessage::Playback(p),
            SyncMessage::Playlist(p) => PeerMessage::Playlist(p),
            SyncMessage::Listeners(l) => PeerMessage::Listeners(l),
        }
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn current_time_ms() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_playback_wire_format() {
        let msg = SyncMessage::Playback(PlaybackState {
            current_audio: Some("file:///a.mp3".to_string()),
            reference_time: 1000.0,
            audio_time: 12.5,
            playback_rate: 1.0,
            paused: false,
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "playback",
                "data": {
                    "currentAudio": "file:///a.mp3",
                    "referenceTime": 1000.0,
                    "audioTime": 12.5,
                    "playbackRate": 1.0,
                    "paused": false
                }
            })
        );
    }

    #[test]
    fn test_peer_message_type_tags() {
        let request: PeerMessage =
            serde_json::from_value(json!({"type": "audioinforequest", "data": "a"})).unwrap();
        assert_eq!(request, PeerMessage::AudioInfoRequest("a".to_string()));

        let listeners: PeerMessage =
            serde_json::from_value(json!({"type": "listeners", "data": ["h", "l"]})).unwrap();
        assert_eq!(
            listeners.as_sync(),
            Some(SyncMessage::Listeners(vec!["h".to_string(), "l".to_string()]))
        );
        assert!(request.as_sync().is_none());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let result = serde_json::from_value::<PeerMessage>(json!({"type": "nope", "data": 1}));
        assert!(result.is_err());
    }

    #[test]
    fn test_position_extrapolation() {
        let mut playback = PlaybackState {
            current_audio: Some("a".to_string()),
            reference_time: 10_000.0,
            audio_time: 5.0,
            playback_rate: 2.0,
            paused: false,
        };
        assert_eq!(playback.position_at(11_000.0), 7.0);

        playback.paused = true;
        assert_eq!(playback.position_at(11_000.0), 5.0);
    }

    #[test]
    fn test_apply_replaces_whole_section() {
        let mut state = ListeningState {
            playlist: vec!["a".to_string(), "b".to_string()],
            ..Default::default()
        };
        SyncMessage::Playlist(vec!["c".to_string()]).apply_to(&mut state);
        assert_eq!(state.playlist, vec!["c".to_string()]);
        assert_eq!(state.playback, PlaybackState::default());
    }
}
