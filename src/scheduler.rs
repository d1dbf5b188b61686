use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::{EventBus, SessionEvent};
use crate::generator::SequenceGenerator;
use crate::sequence::MusicSequence;
use crate::state::MusicParameters;
use crate::transport::PlaybackTransport;

/// Identifies one armed timer. A token that no longer matches the pending
/// timer is stale and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CycleToken(u64);

#[derive(Debug)]
pub struct TimerHandle {
    token: CycleToken,
    due_in: Duration,
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn token(&self) -> CycleToken {
        self.token
    }

    pub fn due_in(&self) -> Duration {
        self.due_in
    }

    fn cancel(self) {
        self.task.abort();
    }
}

#[derive(Debug, Default)]
pub struct PlaybackState {
    pub is_playing: bool,
    pub current: Option<MusicSequence>,
    pub active_params: Option<MusicParameters>,
    pub pending_timer: Option<TimerHandle>,
}

/// Time until the next cycle: two nominal beats per note.
pub fn cycle_interval(note_count: usize, tempo: u32) -> Duration {
    let beat_ms = 60_000.0 / f64::from(tempo.max(1));
    Duration::from_secs_f64(note_count as f64 * beat_ms * 2.0 / 1000.0)
}

/// Play/stop state machine driving a self-rearming timer.
///
/// Timer expiry is delivered as a [`CycleToken`] on the channel given to
/// [`PlaybackScheduler::new`]; the owner passes it back to
/// [`PlaybackScheduler::on_cycle_due`] so all state changes stay on one task.
pub struct PlaybackScheduler {
    generator: SequenceGenerator,
    transport: Arc<dyn PlaybackTransport>,
    events: EventBus,
    state: PlaybackState,
    due_tx: mpsc::UnboundedSender<CycleToken>,
    next_token: u64,
    send_timeout: Duration,
}

impl PlaybackScheduler {
    pub fn new(
        generator: SequenceGenerator,
        transport: Arc<dyn PlaybackTransport>,
        events: EventBus,
        due_tx: mpsc::UnboundedSender<CycleToken>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            generator,
            transport,
            events,
            state: PlaybackState::default(),
            due_tx,
            next_token: 0,
            send_timeout,
        }
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    pub fn is_playing(&self) -> bool {
        self.state.is_playing
    }

    pub async fn start(&mut self, params: MusicParameters) {
        if self.state.is_playing {
            debug!("restarting playback");
            self.stop();
        }

        self.state.is_playing = true;
        self.state.active_params = Some(params);
        info!("playback started: {}", params);
        self.events.emit(SessionEvent::PlaybackStarted(params));

        self.regenerate(params).await;
        self.run_cycle().await;
    }

    pub fn stop(&mut self) {
        let was_playing = self.state.is_playing;
        self.state.is_playing = false;
        if let Some(timer) = self.state.pending_timer.take() {
            timer.cancel();
        }
        if was_playing {
            info!("playback stopped");
            self.events.emit(SessionEvent::PlaybackStopped);
        }
    }

    /// Records new parameters. While playing, a fresh sequence replaces the
    /// current one and is picked up by the already armed timer.
    pub async fn update_parameters(&mut self, params: MusicParameters) {
        if let Some(previous) = self.state.active_params {
            let changed = params.changed_fields(&previous);
            if !changed.is_empty() {
                info!("parameters changed: {}", changed.join(", "));
            }
        }
        self.state.active_params = Some(params);

        if self.state.is_playing {
            self.regenerate(params).await;
        }
    }

    /// Runs one cycle if `token` belongs to the currently armed timer.
    pub async fn on_cycle_due(&mut self, token: CycleToken) {
        let armed = self.state.pending_timer.as_ref().map(TimerHandle::token);
        if armed != Some(token) {
            debug!("ignoring stale timer {:?}", token);
            return;
        }
        self.state.pending_timer = None;
        self.run_cycle().await;
    }

    async fn regenerate(&mut self, params: MusicParameters) {
        let generated = self.generator.generate(&params).await;
        self.events.emit(SessionEvent::SequenceGenerated {
            params,
            sequence: generated.sequence.clone(),
            source: generated.source,
        });
        self.state.current = Some(generated.sequence);
    }

    async fn run_cycle(&mut self) {
        if !self.state.is_playing {
            return;
        }
        let (Some(sequence), Some(params)) = (&self.state.current, self.state.active_params) else {
            warn!("no sequence to play");
            return;
        };
        let tempo = params.tempo;
        let note_count = sequence.len();

        info!("playing {} notes at {} BPM", note_count, tempo);
        let sent = tokio::time::timeout(
            self.send_timeout,
            self.transport.play_sequence(tempo, sequence.notes()),
        )
        .await;
        let failure = match sent {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(format!("playback send failed: {err:#}")),
            Err(_) => Some(format!("playback send timed out after {:?}", self.send_timeout)),
        };
        if let Some(failure) = failure {
            warn!("{failure}");
            self.events.emit(SessionEvent::TransportFailed(failure));
        }

        if self.state.is_playing {
            self.arm_timer(cycle_interval(note_count, tempo));
        }
    }

    fn arm_timer(&mut self, due_in: Duration) {
        if let Some(previous) = self.state.pending_timer.take() {
            previous.cancel();
        }
        self.next_token += 1;
        let token = CycleToken(self.next_token);
        let due_tx = self.due_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(due_in).await;
            let _ = due_tx.send(token);
        });
        debug!("next cycle in {:?}", due_in);
        self.state.pending_timer = Some(TimerHandle { token, due_in, task });
    }
}
