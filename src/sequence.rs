use std::collections::VecDeque;

use serde::Serialize;

/// Sentinel for "no note at this position".
pub const REST: i32 = -1;
pub const LOWEST_NOTE: i32 = 53;
pub const HIGHEST_NOTE: i32 = 71;

/// Number of generated note vectors remembered for anti-repetition.
pub const HISTORY_CAPACITY: usize = 5;

/// KantanPlay function of each playable note: (note, label, description).
/// Notes 53-59 are chord modifiers, 60-71 scale degrees relative to the root.
const NOTE_TABLE: [(i32, &str, &str); 18] = [
    (53, "dim", "diminished"),
    (55, "7", "dominant 7th"),
    (56, "sus4", "suspended 4th"),
    (57, "~", "swap"),
    (58, "Add9", "add 9th"),
    (59, "M7", "major 7th"),
    (60, "1", "root note"),
    (61, "2b", "flat 2nd"),
    (62, "2", "2nd"),
    (63, "3b", "flat 3rd"),
    (64, "3", "3rd"),
    (65, "4", "4th"),
    (66, "5b", "flat 5th"),
    (67, "5", "5th"),
    (68, "6b", "flat 6th"),
    (69, "6", "6th"),
    (70, "7b", "flat 7th"),
    (71, "7", "7th"),
];

/// True for the rest sentinel and every note in the playable window.
pub fn is_valid_note(note: i32) -> bool {
    note == REST || (LOWEST_NOTE..=HIGHEST_NOTE).contains(&note)
}

pub fn note_label(note: i32) -> &'static str {
    if note == REST {
        return "-";
    }
    NOTE_TABLE
        .iter()
        .find(|(n, _, _)| *n == note)
        .map(|(_, label, _)| *label)
        .unwrap_or("?")
}

pub fn note_description(note: i32) -> &'static str {
    if note == REST {
        return "rest";
    }
    NOTE_TABLE
        .iter()
        .find(|(n, _, _)| *n == note)
        .map(|(_, _, description)| *description)
        .unwrap_or("unknown")
}

/// Space-separated labels, for logs.
pub fn describe_notes(notes: &[i32]) -> String {
    notes.iter().map(|n| note_label(*n)).collect::<Vec<_>>().join(" ")
}

/// Notes with per-position durations (ms) and velocities. All three vectors
/// always have the same length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MusicSequence {
    notes: Vec<i32>,
    durations: Vec<u32>,
    velocities: Vec<u32>,
}

impl MusicSequence {
    pub fn new(notes: Vec<i32>, durations: Vec<u32>, velocities: Vec<u32>) -> Self {
        assert_eq!(notes.len(), durations.len(), "durations must match notes");
        assert_eq!(notes.len(), velocities.len(), "velocities must match notes");
        Self { notes, durations, velocities }
    }

    pub fn notes(&self) -> &[i32] {
        &self.notes
    }

    pub fn durations(&self) -> &[u32] {
        &self.durations
    }

    pub fn velocities(&self) -> &[u32] {
        &self.velocities
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn summary(&self) -> SequenceSummary {
        let sounding = self.notes.iter().copied().filter(|n| *n != REST);
        let average_velocity = if self.velocities.is_empty() {
            0.0
        } else {
            self.velocities.iter().map(|v| f64::from(*v)).sum::<f64>()
                / self.velocities.len() as f64
        };
        SequenceSummary {
            lowest: sounding.clone().min(),
            highest: sounding.max(),
            rests: self.notes.iter().filter(|n| **n == REST).count(),
            average_velocity,
            total_duration_ms: self.durations.iter().map(|d| u64::from(*d)).sum(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SequenceSummary {
    pub lowest: Option<i32>,
    pub highest: Option<i32>,
    pub rests: usize,
    pub average_velocity: f64,
    pub total_duration_ms: u64,
}

/// Bounded FIFO of the most recent generated note vectors.
#[derive(Debug, Clone, Default)]
pub struct RecentSequenceHistory {
    entries: VecDeque<Vec<i32>>,
}

impl RecentSequenceHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, notes: Vec<i32>) {
        if self.entries.len() == HISTORY_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(notes);
    }

    pub fn contains(&self, notes: &[i32]) -> bool {
        self.entries.iter().any(|entry| entry.as_slice() == notes)
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Vec<i32>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
