use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::midi::ControlEvent;

pub const MIN_TEMPO: u32 = 20;
pub const MAX_TEMPO: u32 = 300;
pub const MIN_COMPLEXITY: u32 = 1;
pub const MAX_COMPLEXITY: u32 = 10;
pub const MIN_SEQUENCE_LENGTH: u32 = 4;
pub const MAX_SEQUENCE_LENGTH: u32 = 16;

/// The twelve pitch classes a sequence can be anchored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Key {
    C,
    #[serde(rename = "C#")]
    CSharp,
    D,
    #[serde(rename = "D#")]
    DSharp,
    E,
    F,
    #[serde(rename = "F#")]
    FSharp,
    G,
    #[serde(rename = "G#")]
    GSharp,
    A,
    #[serde(rename = "A#")]
    ASharp,
    B,
}

impl Key {
    pub const ALL: [Key; 12] = [
        Key::C,
        Key::CSharp,
        Key::D,
        Key::DSharp,
        Key::E,
        Key::F,
        Key::FSharp,
        Key::G,
        Key::GSharp,
        Key::A,
        Key::ASharp,
        Key::B,
    ];

    /// Semitones above C.
    pub fn offset(self) -> i32 {
        Self::ALL.iter().position(|k| *k == self).unwrap_or(0) as i32
    }

    pub fn name(self) -> &'static str {
        match self {
            Key::C => "C",
            Key::CSharp => "C#",
            Key::D => "D",
            Key::DSharp => "D#",
            Key::E => "E",
            Key::F => "F",
            Key::FSharp => "F#",
            Key::G => "G",
            Key::GSharp => "G#",
            Key::A => "A",
            Key::ASharp => "A#",
            Key::B => "B",
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Key {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('♯', "#");
        let key = match normalized.as_str() {
            "C" | "B#" => Key::C,
            "C#" | "DB" => Key::CSharp,
            "D" => Key::D,
            "D#" | "EB" => Key::DSharp,
            "E" | "FB" => Key::E,
            "F" | "E#" => Key::F,
            "F#" | "GB" => Key::FSharp,
            "G" => Key::G,
            "G#" | "AB" => Key::GSharp,
            "A" => Key::A,
            "A#" | "BB" => Key::ASharp,
            "B" | "CB" => Key::B,
            _ => return Err(format!("unknown key '{s}'")),
        };
        Ok(key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mood {
    Happy,
    Sad,
    Energetic,
    Calm,
    Mysterious,
    Dramatic,
}

impl Mood {
    /// Selector order for the mood controller.
    pub const ALL: [Mood; 6] = [
        Mood::Happy,
        Mood::Sad,
        Mood::Energetic,
        Mood::Calm,
        Mood::Mysterious,
        Mood::Dramatic,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Mood::Happy => "happy",
            Mood::Sad => "sad",
            Mood::Energetic => "energetic",
            Mood::Calm => "calm",
            Mood::Mysterious => "mysterious",
            Mood::Dramatic => "dramatic",
        }
    }

    /// Moods that read better over a minor scale.
    pub fn is_minor(self) -> bool {
        matches!(self, Mood::Sad | Mood::Mysterious | Mood::Dramatic)
    }
}

impl fmt::Display for Mood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Mood {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Mood::ALL
            .into_iter()
            .find(|mood| mood.name() == lower)
            .ok_or_else(|| format!("unknown mood '{s}'"))
    }
}

/// Complete set of musical parameters. Always handed out by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MusicParameters {
    pub tempo: u32,
    pub key: Key,
    pub mood: Mood,
    pub complexity: u32,
    pub sequence_length: u32,
}

impl Default for MusicParameters {
    fn default() -> Self {
        Self {
            tempo: 120,
            key: Key::C,
            mood: Mood::Happy,
            complexity: 5,
            sequence_length: 8,
        }
    }
}

impl MusicParameters {
    /// Clamps every numeric field into its playable range.
    pub fn sanitized(self) -> Self {
        Self {
            tempo: self.tempo.clamp(MIN_TEMPO, MAX_TEMPO),
            complexity: self.complexity.clamp(MIN_COMPLEXITY, MAX_COMPLEXITY),
            sequence_length: self
                .sequence_length
                .clamp(MIN_SEQUENCE_LENGTH, MAX_SEQUENCE_LENGTH),
            ..self
        }
    }

    /// Milliseconds per beat at the current tempo.
    pub fn beat_ms(&self) -> f64 {
        60_000.0 / self.tempo.max(1) as f64
    }

    /// Names of the fields that differ from `previous`.
    pub fn changed_fields(&self, previous: &MusicParameters) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.tempo != previous.tempo {
            changed.push("tempo");
        }
        if self.key != previous.key {
            changed.push("key");
        }
        if self.mood != previous.mood {
            changed.push("mood");
        }
        if self.complexity != previous.complexity {
            changed.push("complexity");
        }
        if self.sequence_length != previous.sequence_length {
            changed.push("sequence_length");
        }
        changed
    }
}

impl fmt::Display for MusicParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} BPM, key {}, {}, complexity {}/10, {} notes",
            self.tempo, self.key, self.mood, self.complexity, self.sequence_length
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    Tempo,
    Complexity,
    SequenceLength,
    Mood,
}

/// One controller-to-parameter row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterMapping {
    pub controller: u8,
    pub parameter: ParameterKind,
    pub min: f64,
    pub max: f64,
}

/// Knob layout of the X-Touch Mini.
pub const CONTROLLER_MAPPING: [ParameterMapping; 4] = [
    ParameterMapping { controller: 1, parameter: ParameterKind::Tempo, min: 60.0, max: 180.0 },
    ParameterMapping { controller: 2, parameter: ParameterKind::Complexity, min: 1.0, max: 10.0 },
    ParameterMapping {
        controller: 3,
        parameter: ParameterKind::SequenceLength,
        min: 4.0,
        max: 16.0,
    },
    ParameterMapping { controller: 4, parameter: ParameterKind::Mood, min: 0.0, max: 5.0 },
];

/// Sole owner of the live [`MusicParameters`].
#[derive(Debug)]
pub struct ParameterStore {
    params: MusicParameters,
    mapping: &'static [ParameterMapping],
}

impl ParameterStore {
    pub fn new(initial: MusicParameters) -> Self {
        Self::with_mapping(initial, &CONTROLLER_MAPPING)
    }

    pub fn with_mapping(initial: MusicParameters, mapping: &'static [ParameterMapping]) -> Self {
        Self { params: initial.sanitized(), mapping }
    }

    pub fn snapshot(&self) -> MusicParameters {
        self.params
    }

    /// Applies one control event. Returns the full updated parameter set, or
    /// `None` when the controller is not mapped.
    pub fn apply(&mut self, event: ControlEvent) -> Option<MusicParameters> {
        let Some(mapping) = self.mapping.iter().find(|m| m.controller == event.controller) else {
            debug!("no mapping for CC{}", event.controller);
            return None;
        };

        let normalized = f64::from(event.value.min(127)) / 127.0;
        let scaled = mapping.min + normalized * (mapping.max - mapping.min);
        let rounded = scaled.round().max(0.0) as u32;

        match mapping.parameter {
            ParameterKind::Tempo => self.params.tempo = rounded,
            ParameterKind::Complexity => self.params.complexity = rounded,
            ParameterKind::SequenceLength => self.params.sequence_length = rounded,
            ParameterKind::Mood => {
                let last = Mood::ALL.len() - 1;
                let index = ((normalized * Mood::ALL.len() as f64).floor() as usize).min(last);
                self.params.mood = Mood::ALL[index];
            }
        }

        debug!("CC{} -> {:?}: {}", event.controller, mapping.parameter, self.params);
        Some(self.params)
    }

    /// Replaces the whole parameter set, e.g. from a UI push.
    pub fn replace(&mut self, params: MusicParameters) -> MusicParameters {
        self.params = params.sanitized();
        debug!("parameters replaced externally: {}", self.params);
        self.params
    }
}
