use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::events::{EventBus, SessionEvent};
use crate::generator::{NoteProposer, SequenceGenerator};
use crate::midi::ControlEvent;
use crate::scheduler::{CycleToken, PlaybackScheduler};
use crate::sequence::MusicSequence;
use crate::state::{MusicParameters, ParameterStore};
use crate::transport::PlaybackTransport;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub proposal_timeout: Duration,
    pub send_timeout: Duration,
    /// Fixed RNG seed for reproducible fallback sequences.
    pub seed: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            proposal_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(10),
            seed: None,
        }
    }
}

#[derive(Debug)]
enum SessionCommand {
    Start,
    Stop,
    ReplaceParameters(MusicParameters),
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Shutdown,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub parameters: MusicParameters,
    pub is_playing: bool,
    pub active_params: Option<MusicParameters>,
    pub current: Option<MusicSequence>,
}

/// Cheap, cloneable front door to a running [`Session`].
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    controls: mpsc::UnboundedSender<ControlEvent>,
    events: EventBus,
}

impl SessionHandle {
    fn send(&self, command: SessionCommand) -> anyhow::Result<()> {
        self.commands.send(command).map_err(|_| anyhow!("session has shut down"))
    }

    pub fn start(&self) -> anyhow::Result<()> {
        self.send(SessionCommand::Start)
    }

    pub fn stop(&self) -> anyhow::Result<()> {
        self.send(SessionCommand::Stop)
    }

    /// Pushes a complete parameter set, as a UI would.
    pub fn replace_parameters(&self, params: MusicParameters) -> anyhow::Result<()> {
        self.send(SessionCommand::ReplaceParameters(params))
    }

    pub fn shutdown(&self) -> anyhow::Result<()> {
        self.send(SessionCommand::Shutdown)
    }

    pub async fn snapshot(&self) -> anyhow::Result<SessionSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Snapshot(tx))?;
        rx.await.context("session dropped snapshot request")
    }

    /// Channel control devices feed parsed Control Change events into.
    pub fn control_sender(&self) -> mpsc::UnboundedSender<ControlEvent> {
        self.controls.clone()
    }

    /// Parameter changes, generated sequences, playback transitions and
    /// collaborator failures.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

/// Owns the parameter store and scheduler; every mutation happens on the
/// single task started by [`Session::spawn`].
pub struct Session {
    store: ParameterStore,
    scheduler: PlaybackScheduler,
    events: EventBus,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    controls: mpsc::UnboundedReceiver<ControlEvent>,
    due: mpsc::UnboundedReceiver<CycleToken>,
}

impl Session {
    pub fn new(
        initial: MusicParameters,
        proposer: Arc<dyn NoteProposer>,
        transport: Arc<dyn PlaybackTransport>,
        config: SessionConfig,
    ) -> (Self, SessionHandle) {
        let events = EventBus::new();
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let generator =
            SequenceGenerator::with_rng(proposer, config.proposal_timeout, events.clone(), rng);

        let (due_tx, due_rx) = mpsc::unbounded_channel();
        let scheduler = PlaybackScheduler::new(
            generator,
            transport,
            events.clone(),
            due_tx,
            config.send_timeout,
        );

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let session = Self {
            store: ParameterStore::new(initial),
            scheduler,
            events: events.clone(),
            commands: command_rx,
            controls: control_rx,
            due: due_rx,
        };
        let handle = SessionHandle { commands: command_tx, controls: control_tx, events };
        (session, handle)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!("session running with {}", self.store.snapshot());
        loop {
            tokio::select! {
                Some(event) = self.controls.recv() => self.on_controls(event).await,
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => self.on_command(command).await,
                },
                Some(token) = self.due.recv() => self.scheduler.on_cycle_due(token).await,
            }
        }
        self.scheduler.stop();
        info!("session stopped");
    }

    /// Applies `first` and everything already queued behind it in arrival
    /// order, then regenerates once from the final snapshot.
    async fn on_controls(&mut self, first: ControlEvent) {
        let mut latest = self.apply_control(first);
        while let Ok(event) = self.controls.try_recv() {
            latest = self.apply_control(event).or(latest);
        }
        if let Some(params) = latest {
            self.scheduler.update_parameters(params).await;
        }
    }

    fn apply_control(&mut self, event: ControlEvent) -> Option<MusicParameters> {
        let params = self.store.apply(event)?;
        self.events.emit(SessionEvent::ParametersChanged(params));
        Some(params)
    }

    async fn on_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Start => {
                let params = self.store.snapshot();
                self.scheduler.start(params).await;
            }
            SessionCommand::Stop => self.scheduler.stop(),
            SessionCommand::ReplaceParameters(params) => {
                let params = self.store.replace(params);
                self.publish(params).await;
            }
            SessionCommand::Snapshot(reply) => {
                if let Ok(event) = self.controls.try_recv() {
                    self.on_controls(event).await;
                }
                let state = self.scheduler.state();
                let snapshot = SessionSnapshot {
                    parameters: self.store.snapshot(),
                    is_playing: state.is_playing,
                    active_params: state.active_params,
                    current: state.current.clone(),
                };
                if reply.send(snapshot).is_err() {
                    debug!("snapshot requester went away");
                }
            }
            SessionCommand::Shutdown => {}
        }
    }

    async fn publish(&mut self, params: MusicParameters) {
        self.events.emit(SessionEvent::ParametersChanged(params));
        self.scheduler.update_parameters(params).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::state::{Mood, MAX_COMPLEXITY};
    use crate::BoxFuture;

    struct OfflineProposer;

    impl NoteProposer for OfflineProposer {
        fn propose<'a>(
            &'a self,
            _params: &'a MusicParameters,
            _recent: &'a [Vec<i32>],
        ) -> BoxFuture<'a, anyhow::Result<Vec<i32>>> {
            Box::pin(async { Err::<Vec<i32>, _>(anyhow!("offline")) })
        }
    }

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(u32, usize)>>,
    }

    impl PlaybackTransport for RecordingTransport {
        fn play_sequence<'a>(
            &'a self,
            tempo: u32,
            notes: &'a [i32],
        ) -> BoxFuture<'a, anyhow::Result<()>> {
            self.sent.lock().unwrap().push((tempo, notes.len()));
            Box::pin(async { Ok::<_, anyhow::Error>(()) })
        }
    }

    fn spawn_session() -> (SessionHandle, Arc<RecordingTransport>, JoinHandle<()>) {
        let transport = Arc::new(RecordingTransport::default());
        let config = SessionConfig { seed: Some(3), ..SessionConfig::default() };
        let (session, handle) = Session::new(
            MusicParameters::default(),
            Arc::new(OfflineProposer),
            transport.clone(),
            config,
        );
        (handle, transport, session.spawn())
    }

    fn cc(controller: u8, value: u8) -> ControlEvent {
        ControlEvent { controller, value }
    }

    #[tokio::test(start_paused = true)]
    async fn control_change_while_playing_reaches_next_cycle() {
        let (handle, transport, _task) = spawn_session();
        handle.start().unwrap();
        let started = handle.snapshot().await.unwrap();
        assert!(started.is_playing);
        assert_eq!(started.current.as_ref().map(|s| s.len()), Some(8));

        handle.control_sender().send(cc(1, 127)).unwrap();
        handle.control_sender().send(cc(3, 0)).unwrap();
        let updated = handle.snapshot().await.unwrap();
        assert_eq!(updated.parameters.tempo, 180);
        assert_eq!(updated.parameters.sequence_length, 4);
        assert_eq!(updated.active_params, Some(updated.parameters));
        assert_eq!(updated.current.as_ref().map(|s| s.len()), Some(4));
        assert_eq!(*transport.sent.lock().unwrap(), vec![(120, 8)]);

        // First cycle armed 8 notes * 500 ms * 2.
        tokio::time::sleep(Duration::from_millis(8_100)).await;
        handle.snapshot().await.unwrap();
        assert_eq!(*transport.sent.lock().unwrap(), vec![(120, 8), (180, 4)]);
    }

    #[tokio::test(start_paused = true)]
    async fn observers_see_mapped_changes_only() {
        let (handle, _transport, _task) = spawn_session();
        let mut events = handle.subscribe();

        handle.control_sender().send(cc(20, 5)).unwrap();
        handle.control_sender().send(cc(4, 127)).unwrap();
        handle.snapshot().await.unwrap();

        match events.try_recv().unwrap() {
            SessionEvent::ParametersChanged(params) => assert_eq!(params.mood, Mood::Dramatic),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn replacement_is_sanitized_and_published() {
        let (handle, transport, _task) = spawn_session();
        let mut events = handle.subscribe();

        let pushed = MusicParameters { complexity: 99, ..MusicParameters::default() };
        handle.replace_parameters(pushed).unwrap();
        let snapshot = handle.snapshot().await.unwrap();

        assert_eq!(snapshot.parameters.complexity, MAX_COMPLEXITY);
        assert!(!snapshot.is_playing);
        assert!(snapshot.current.is_none());
        assert!(transport.sent.lock().unwrap().is_empty());
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::ParametersChanged(snapshot.parameters)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_halts_cycles_and_keeps_sequence() {
        let (handle, transport, _task) = spawn_session();
        handle.start().unwrap();
        handle.stop().unwrap();
        let snapshot = handle.snapshot().await.unwrap();
        assert!(!snapshot.is_playing);
        assert!(snapshot.current.is_some());

        tokio::time::sleep(Duration::from_secs(120)).await;
        handle.snapshot().await.unwrap();
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_ends_the_task() {
        let (handle, _transport, task) = spawn_session();
        handle.start().unwrap();
        handle.shutdown().unwrap();
        task.await.unwrap();
        assert!(handle.start().is_err());
        assert!(handle.snapshot().await.is_err());
    }

    /// Takes two seconds per proposal, like a busy model server.
    #[derive(Default)]
    struct SlowProposer {
        calls: AtomicUsize,
    }

    impl NoteProposer for SlowProposer {
        fn propose<'a>(
            &'a self,
            params: &'a MusicParameters,
            _recent: &'a [Vec<i32>],
        ) -> BoxFuture<'a, anyhow::Result<Vec<i32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let notes = vec![60; params.sequence_length as usize];
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok::<_, anyhow::Error>(notes)
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn knob_sweep_regenerates_once_and_stop_is_prompt() {
        let proposer = Arc::new(SlowProposer::default());
        let (session, handle) = Session::new(
            MusicParameters::default(),
            proposer.clone(),
            Arc::new(RecordingTransport::default()),
            SessionConfig { seed: Some(5), ..SessionConfig::default() },
        );
        let _task = session.spawn();
        let mut events = handle.subscribe();

        let began = tokio::time::Instant::now();
        handle.start().unwrap();
        for value in 0..30 {
            handle.control_sender().send(cc(1, value * 4)).unwrap();
        }
        handle.stop().unwrap();
        let snapshot = handle.snapshot().await.unwrap();

        assert!(!snapshot.is_playing);
        assert!(began.elapsed() < Duration::from_secs(5), "{:?}", began.elapsed());
        assert!(proposer.calls.load(Ordering::SeqCst) <= 2);
        // Last knob value 116: 60 + 116/127 * 120 = 169.6
        assert_eq!(snapshot.parameters.tempo, 170);

        let mut changes = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SessionEvent::ParametersChanged(_)) {
                changes += 1;
            }
        }
        assert_eq!(changes, 30);
    }
}
