//! Audio metadata exchanged between peers
//!
//! Extracting metadata from audio files is not done here. Peers answer
//! `audioinforequest` messages from whatever [`MetadataCache`] the
//! embedding application hands in.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::sync::AudioUri;

/// Cover art for an audio
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Inline image as a `data:` URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_url: Option<String>,
    /// MIME type of the image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// Metadata about a piece of audio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioInfo {
    pub uri: AudioUri,
    pub title: String,
    pub artist: String,
    pub album: String,
    /// Duration in seconds
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover: Option<CoverInfo>,
}

/// Lookup of audio metadata
pub trait MetadataCache: Send + Sync {
    fn audio_info(&self, uri: &str) -> Option<AudioInfo>;
}

/// In-memory [`MetadataCache`]
#[derive(Debug, Default)]
pub struct MemoryMetadataCache {
    entries: RwLock<HashMap<AudioUri, AudioInfo>>,
}

impl MemoryMetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `info.uri`
    pub fn insert(&self, info: AudioInfo) {
        self.entries.write().insert(info.uri.clone(), info);
    }

    pub fn remove(&self, uri: &str) -> Option<AudioInfo> {
        self.entries.write().remove(uri)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl MetadataCache for MemoryMetadataCache {
    fn audio_info(&self, uri: &str) -> Option<AudioInfo> {
        self.entries.read().get(uri).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(uri: &str) -> AudioInfo {
        AudioInfo {
            uri: uri.to_string(),
            title: "Title".to_string(),
            artist: "Artist".to_string(),
            album: "Album".to_string(),
            duration: 215.5,
            cover: None,
        }
    }

    #[test]
    fn test_memory_cache() {
        let cache = MemoryMetadataCache::new();
        assert!(cache.audio_info("a").is_none());

        cache.insert(info("a"));
        assert_eq!(cache.audio_info("a"), Some(info("a")));
        assert_eq!(cache.len(), 1);

        assert!(cache.remove("a").is_some());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cover_wire_format() {
        let mut with_cover = info("a");
        with_cover.cover = Some(CoverInfo {
            data_url: Some("data:image/png;base64,AAAA".to_string()),
            format: Some("image/png".to_string()),
            ..Default::default()
        });
        let value = serde_json::to_value(&with_cover).unwrap();
        assert_eq!(value["cover"]["dataUrl"], "data:image/png;base64,AAAA");
        assert!(value["cover"].get("url").is_none());
        assert!(serde_json::to_value(info("b")).unwrap().get("cover").is_none());
    }
}
