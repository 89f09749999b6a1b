//! Typed paths into the replicated state and structural diffs over it

use std::fmt;

use super::protocol::{AudioUri, ListeningState, PlaybackState};

/// Top-level section of the replicated state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Section {
    Playback,
    Playlist,
    Listeners,
}

impl Section {
    pub const ALL: [Section; 3] = [Section::Playback, Section::Playlist, Section::Listeners];

    pub fn as_str(&self) -> &'static str {
        match self {
            Section::Playback => "playback",
            Section::Playlist => "playlist",
            Section::Listeners => "listeners",
        }
    }
}

/// Leaf fields of [`PlaybackState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaybackField {
    CurrentAudio,
    ReferenceTime,
    AudioTime,
    PlaybackRate,
    Paused,
}

impl PlaybackField {
    fn as_str(&self) -> &'static str {
        match self {
            PlaybackField::CurrentAudio => "currentAudio",
            PlaybackField::ReferenceTime => "referenceTime",
            PlaybackField::AudioTime => "audioTime",
            PlaybackField::PlaybackRate => "playbackRate",
            PlaybackField::Paused => "paused",
        }
    }
}

/// The two list-valued sections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListSection {
    Playlist,
    Listeners,
}

impl ListSection {
    fn list<'a>(&self, state: &'a ListeningState) -> &'a Vec<String> {
        match self {
            ListSection::Playlist => &state.playlist,
            ListSection::Listeners => &state.listeners,
        }
    }

    fn list_mut<'a>(&self, state: &'a mut ListeningState) -> &'a mut Vec<String> {
        match self {
            ListSection::Playlist => &mut state.playlist,
            ListSection::Listeners => &mut state.listeners,
        }
    }
}

impl From<ListSection> for Section {
    fn from(list: ListSection) -> Self {
        match list {
            ListSection::Playlist => Section::Playlist,
            ListSection::Listeners => Section::Listeners,
        }
    }
}

/// A location in [`ListeningState`]
///
/// Section paths cover every path below them, so subscribing to
/// `StatePath::Playlist` fires for any playlist item change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatePath {
    Playback,
    PlaybackField(PlaybackField),
    Playlist,
    PlaylistItem(usize),
    Listeners,
    Listener(usize),
}

impl StatePath {
    pub fn section(&self) -> Section {
        match self {
            StatePath::Playback | StatePath::PlaybackField(_) => Section::Playback,
            StatePath::Playlist | StatePath::PlaylistItem(_) => Section::Playlist,
            StatePath::Listeners | StatePath::Listener(_) => Section::Listeners,
        }
    }

    fn is_section(&self) -> bool {
        matches!(
            self,
            StatePath::Playback | StatePath::Playlist | StatePath::Listeners
        )
    }

    /// Whether `other` equals this path or lies below it
    pub fn covers(&self, other: &StatePath) -> bool {
        self == other || (self.is_section() && self.section() == other.section())
    }

    /// Whether either path lies below the other
    pub fn intersects(&self, other: &StatePath) -> bool {
        self.covers(other) || other.covers(self)
    }
}

impl From<Section> for StatePath {
    fn from(section: Section) -> Self {
        match section {
            Section::Playback => StatePath::Playback,
            Section::Playlist => StatePath::Playlist,
            Section::Listeners => StatePath::Listeners,
        }
    }
}

impl fmt::Display for StatePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatePath::PlaybackField(field) => write!(f, "playback.{}", field.as_str()),
            StatePath::PlaylistItem(i) => write!(f, "playlist.{}", i),
            StatePath::Listener(i) => write!(f, "listeners.{}", i),
            section => write!(f, "{}", section.section().as_str()),
        }
    }
}

/// New value of a single playback field
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackChange {
    CurrentAudio(Option<AudioUri>),
    ReferenceTime(f64),
    AudioTime(f64),
    PlaybackRate(f64),
    Paused(bool),
}

/// What happened to one list slot
#[derive(Debug, Clone, PartialEq)]
pub enum ItemChange {
    Added(String),
    Updated(String),
    Deleted,
}

/// One leaf-level difference between two states
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Playback(PlaybackChange),
    Item {
        list: ListSection,
        index: usize,
        change: ItemChange,
    },
}

impl Change {
    pub fn path(&self) -> StatePath {
        match self {
            Change::Playback(change) => StatePath::PlaybackField(match change {
                PlaybackChange::CurrentAudio(_) => PlaybackField::CurrentAudio,
                PlaybackChange::ReferenceTime(_) => PlaybackField::ReferenceTime,
                PlaybackChange::AudioTime(_) => PlaybackField::AudioTime,
                PlaybackChange::PlaybackRate(_) => PlaybackField::PlaybackRate,
                PlaybackChange::Paused(_) => PlaybackField::Paused,
            }),
            Change::Item {
                list: ListSection::Playlist,
                index,
                ..
            } => StatePath::PlaylistItem(*index),
            Change::Item {
                list: ListSection::Listeners,
                index,
                ..
            } => StatePath::Listener(*index),
        }
    }
}

/// Ordered set of leaf changes turning one state into another
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDiff {
    changes: Vec<Change>,
}

impl StateDiff {
    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = StatePath> + '_ {
        self.changes.iter().map(Change::path)
    }

    /// Sections touched by this diff, in canonical order
    pub fn sections(&self) -> Vec<Section> {
        Section::ALL
            .into_iter()
            .filter(|section| self.paths().any(|p| p.section() == *section))
            .collect()
    }

    /// Whether any changed path intersects any of `paths`
    pub fn touches(&self, paths: &[StatePath]) -> bool {
        self.paths()
            .any(|changed| paths.iter().any(|p| p.intersects(&changed)))
    }

    /// Replay the changes onto `state`
    pub fn apply(&self, state: &mut ListeningState) {
        for change in &self.changes {
            match change {
                Change::Playback(change) => apply_playback(&mut state.playback, change),
                Change::Item {
                    list,
                    index,
                    change,
                } => {
                    let items = list.list_mut(state);
                    match change {
                        ItemChange::Updated(value) => {
                            if let Some(slot) = items.get_mut(*index) {
                                *slot = value.clone();
                            }
                        }
                        ItemChange::Added(value) => {
                            if *index <= items.len() {
                                items.insert(*index, value.clone());
                            }
                        }
                        // Deletions only ever form a tail
                        ItemChange::Deleted => items.truncate(*index),
                    }
                }
            }
        }
    }
}

fn apply_playback(playback: &mut PlaybackState, change: &PlaybackChange) {
    match change {
        PlaybackChange::CurrentAudio(v) => playback.current_audio = v.clone(),
        PlaybackChange::ReferenceTime(v) => playback.reference_time = *v,
        PlaybackChange::AudioTime(v) => playback.audio_time = *v,
        PlaybackChange::PlaybackRate(v) => playback.playback_rate = *v,
        PlaybackChange::Paused(v) => playback.paused = *v,
    }
}

/// Structural equality for floats, treating NaN as equal to itself
fn same_f64(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

/// Leaf-level structural diff between `old` and `new`
pub fn diff(old: &ListeningState, new: &ListeningState) -> StateDiff {
    let mut changes = Vec::new();

    let (a, b) = (&old.playback, &new.playback);
    if a.current_audio != b.current_audio {
        changes.push(Change::Playback(PlaybackChange::CurrentAudio(
            b.current_audio.clone(),
        )));
    }
    if !same_f64(a.reference_time, b.reference_time) {
        changes.push(Change::Playback(PlaybackChange::ReferenceTime(b.reference_time)));
    }
    if !same_f64(a.audio_time, b.audio_time) {
        changes.push(Change::Playback(PlaybackChange::AudioTime(b.audio_time)));
    }
    if !same_f64(a.playback_rate, b.playback_rate) {
        changes.push(Change::Playback(PlaybackChange::PlaybackRate(b.playback_rate)));
    }
    if a.paused != b.paused {
        changes.push(Change::Playback(PlaybackChange::Paused(b.paused)));
    }

    for list in [ListSection::Playlist, ListSection::Listeners] {
        diff_list(list, list.list(old), list.list(new), &mut changes);
    }

    StateDiff { changes }
}

fn diff_list(list: ListSection, old: &[String], new: &[String], changes: &mut Vec<Change>) {
    for (index, (a, b)) in old.iter().zip(new).enumerate() {
        if a != b {
            changes.push(Change::Item {
                list,
                index,
                change: ItemChange::Updated(b.clone()),
            });
        }
    }
    for (index, value) in new.iter().enumerate().skip(old.len()) {
        changes.push(Change::Item {
            list,
            index,
            change: ItemChange::Added(value.clone()),
        });
    }
    for index in new.len()..old.len() {
        changes.push(Change::Item {
            list,
            index,
            change: ItemChange::Deleted,
        });
    }
}
