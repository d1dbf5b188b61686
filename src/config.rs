use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::ollama::{DEFAULT_BASE_URL, DEFAULT_MODEL};
use crate::session::SessionConfig;
use crate::state::{Key, Mood, MusicParameters};

#[derive(Debug, Clone, Parser)]
#[command(name = "kantan-host", version, about = "Knob-driven KantanPlay sequence host")]
pub struct Args {
    /// Ollama server used to propose note sequences
    #[arg(long, env = "OLLAMA_URL", default_value = DEFAULT_BASE_URL)]
    pub ollama_url: String,

    #[arg(long, env = "OLLAMA_MODEL", default_value = DEFAULT_MODEL)]
    pub ollama_model: String,

    #[arg(long, env = "PROPOSAL_TIMEOUT_SECS", default_value_t = 30)]
    pub proposal_timeout_secs: u64,

    #[arg(long, env = "SEND_TIMEOUT_SECS", default_value_t = 10)]
    pub send_timeout_secs: u64,

    /// MIDI input port index for the controller
    #[arg(long, env = "MIDI_INPUT_PORT", conflicts_with = "raw_device")]
    pub midi_input_port: Option<usize>,

    /// Raw MIDI character device, e.g. /dev/midi1
    #[arg(long, env = "RAW_MIDI_DEVICE")]
    pub raw_device: Option<PathBuf>,

    /// MIDI output port index for direct playback
    #[arg(long, env = "MIDI_OUTPUT_PORT")]
    pub midi_output_port: Option<usize>,

    /// MCP MIDI server executable; takes precedence over --midi-output-port
    #[arg(long, env = "MCP_MIDI_SERVER_PATH")]
    pub mcp_command: Option<String>,

    #[arg(long = "mcp-arg", allow_hyphen_values = true)]
    pub mcp_args: Vec<String>,

    #[arg(long, env = "MCP_PYTHON_SERVER_PATH")]
    pub mcp_cwd: Option<PathBuf>,

    /// Log the available MIDI ports and exit
    #[arg(long)]
    pub list_ports: bool,

    #[arg(long)]
    pub skip_health_check: bool,

    /// Fixed seed for the fallback generator
    #[arg(long)]
    pub seed: Option<u64>,

    #[arg(long, default_value_t = 120)]
    pub tempo: u32,

    #[arg(long, default_value_t = Key::C)]
    pub key: Key,

    #[arg(long, default_value_t = Mood::Happy)]
    pub mood: Mood,

    #[arg(long, default_value_t = 5)]
    pub complexity: u32,

    #[arg(long, default_value_t = 8)]
    pub length: u32,
}

/// Where generated sequences are played.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportChoice {
    Mcp { command: String, args: Vec<String>, cwd: Option<PathBuf> },
    MidiOut { port: usize },
    Log,
}

/// Where control changes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputChoice {
    Raw(PathBuf),
    Port(usize),
    None,
}

impl Args {
    pub fn transport(&self) -> TransportChoice {
        if let Some(command) = &self.mcp_command {
            TransportChoice::Mcp {
                command: command.clone(),
                args: self.mcp_args.clone(),
                cwd: self.mcp_cwd.clone(),
            }
        } else if let Some(port) = self.midi_output_port {
            TransportChoice::MidiOut { port }
        } else {
            TransportChoice::Log
        }
    }

    pub fn input(&self) -> InputChoice {
        match (&self.raw_device, self.midi_input_port) {
            (Some(path), _) => InputChoice::Raw(path.clone()),
            (None, Some(port)) => InputChoice::Port(port),
            (None, None) => InputChoice::None,
        }
    }

    /// Starting parameters, clamped into their valid ranges.
    pub fn initial_parameters(&self) -> MusicParameters {
        MusicParameters {
            tempo: self.tempo,
            key: self.key,
            mood: self.mood,
            complexity: self.complexity,
            sequence_length: self.length,
        }
        .sanitized()
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            proposal_timeout: Duration::from_secs(self.proposal_timeout_secs),
            send_timeout: Duration::from_secs(self.send_timeout_secs),
            seed: self.seed,
        }
    }
}
