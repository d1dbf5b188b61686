use std::time::Duration;

use anyhow::{anyhow, Context};
use midir::{MidiOutput, MidiOutputConnection};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::sequence::{describe_notes, REST};
use crate::BoxFuture;

const NOTE_ON: u8 = 0x90;
const NOTE_OFF: u8 = 0x80;
const PLAYBACK_VELOCITY: u8 = 100;

/// Something that can sound a phrase of notes at a tempo.
pub trait PlaybackTransport: Send + Sync {
    /// Hands a phrase to the transport. Returning does not imply the phrase
    /// has finished sounding.
    fn play_sequence<'a>(
        &'a self,
        tempo: u32,
        notes: &'a [i32],
    ) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// Dry-run transport that only logs what it would play.
#[derive(Debug, Default)]
pub struct LogTransport;

impl PlaybackTransport for LogTransport {
    fn play_sequence<'a>(
        &'a self,
        tempo: u32,
        notes: &'a [i32],
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            info!("(dry run) {} BPM: [{}]", tempo, describe_notes(notes));
            Ok(())
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Phrase {
    tempo: u32,
    notes: Vec<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Send([u8; 3]),
    Wait(Duration),
}

/// Flattens a phrase into note on, hold for one beat, note off. Rests hold
/// silence for one beat.
fn render_phrase(phrase: &Phrase, channel: u8) -> Vec<Step> {
    let beat = Duration::from_secs_f64(60.0 / f64::from(phrase.tempo.max(1)));
    let mut steps = Vec::with_capacity(phrase.notes.len() * 3);
    for &note in &phrase.notes {
        match u8::try_from(note) {
            Ok(key) if note != REST && key < 0x80 => {
                steps.push(Step::Send([NOTE_ON | channel, key, PLAYBACK_VELOCITY]));
                steps.push(Step::Wait(beat));
                steps.push(Step::Send([NOTE_OFF | channel, key, 0]));
            }
            _ => steps.push(Step::Wait(beat)),
        }
    }
    steps
}

/// Plays phrases on a local MIDI output port. Phrases are queued to a player
/// task and sound one after another.
pub struct MidiOutTransport {
    phrases: mpsc::UnboundedSender<Phrase>,
    port_name: String,
}

impl MidiOutTransport {
    pub fn connect(port_index: usize) -> anyhow::Result<Self> {
        let midi_out =
            MidiOutput::new("kantan-host output").context("failed to create MIDI output")?;
        let ports = midi_out.ports();
        let port = ports
            .get(port_index)
            .ok_or_else(|| {
                anyhow!("MIDI output port {port_index} does not exist ({} available)", ports.len())
            })?;
        let port_name = midi_out.port_name(port).unwrap_or_else(|_| "Unknown".to_string());

        let connection = midi_out
            .connect(port, "kantan-host")
            .map_err(|err| anyhow!("failed to connect to MIDI output {port_name}: {err}"))?;
        info!("Using MIDI output: {}", port_name);

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_player(connection, rx));
        Ok(Self { phrases: tx, port_name })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

impl PlaybackTransport for MidiOutTransport {
    fn play_sequence<'a>(
        &'a self,
        tempo: u32,
        notes: &'a [i32],
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        let queued = self
            .phrases
            .send(Phrase { tempo, notes: notes.to_vec() })
            .map_err(|_| anyhow!("MIDI player for {} has stopped", self.port_name));
        Box::pin(async move { queued })
    }
}

async fn run_player(
    mut connection: MidiOutputConnection,
    mut phrases: mpsc::UnboundedReceiver<Phrase>,
) {
    while let Some(phrase) = phrases.recv().await {
        debug!("playing {} notes at {} BPM", phrase.notes.len(), phrase.tempo);
        for step in render_phrase(&phrase, 0) {
            match step {
                Step::Send(message) => {
                    if let Err(err) = connection.send(&message) {
                        error!("failed to send MIDI message {:?}: {}", message, err);
                    }
                }
                Step::Wait(duration) => tokio::time::sleep(duration).await,
            }
        }
    }
    debug!("MIDI player stopped");
    let _ = connection.close();
}

/// Names of the available MIDI output ports, in index order.
pub fn list_output_ports() -> anyhow::Result<Vec<String>> {
    let midi_out = MidiOutput::new("kantan-host scanner").context("failed to create MIDI output")?;
    Ok(midi_out
        .ports()
        .iter()
        .map(|port| midi_out.port_name(port).unwrap_or_else(|_| "Unknown".to_string()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phrase_renders_note_pairs_and_silent_rests() {
        let phrase = Phrase { tempo: 120, notes: vec![60, REST, 64] };
        let beat = Duration::from_millis(500);
        assert_eq!(
            render_phrase(&phrase, 0),
            vec![
                Step::Send([0x90, 60, PLAYBACK_VELOCITY]),
                Step::Wait(beat),
                Step::Send([0x80, 60, 0]),
                Step::Wait(beat),
                Step::Send([0x90, 64, PLAYBACK_VELOCITY]),
                Step::Wait(beat),
                Step::Send([0x80, 64, 0]),
            ]
        );
    }

    #[test]
    fn render_uses_channel_nibble() {
        let phrase = Phrase { tempo: 60, notes: vec![53] };
        let steps = render_phrase(&phrase, 3);
        assert_eq!(steps[0], Step::Send([0x93, 53, PLAYBACK_VELOCITY]));
        assert_eq!(steps[1], Step::Wait(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn log_transport_always_accepts() {
        assert!(LogTransport.play_sequence(90, &[60, -1, 67]).await.is_ok());
    }
}
