use tokio::sync::broadcast;

use crate::sequence::MusicSequence;
use crate::state::MusicParameters;

const DEFAULT_CAPACITY: usize = 64;

/// Where a played sequence came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceSource {
    Proposed,
    Fallback,
}

/// Everything observers of a running session can see.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ParametersChanged(MusicParameters),
    SequenceGenerated {
        params: MusicParameters,
        sequence: MusicSequence,
        source: SequenceSource,
    },
    PlaybackStarted(MusicParameters),
    PlaybackStopped,
    ProposalFailed(String),
    TransportFailed(String),
}

/// Fan-out of [`SessionEvent`]s. Emitting never blocks and never fails; with
/// no subscribers the event is dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
