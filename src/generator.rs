use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::events::{EventBus, SequenceSource, SessionEvent};
use crate::sequence::{
    describe_notes, is_valid_note, MusicSequence, RecentSequenceHistory, HIGHEST_NOTE,
    LOWEST_NOTE, REST,
};
use crate::state::{Key, MusicParameters};
use crate::BoxFuture;

const MAJOR_STEPS: [i32; 7] = [0, 2, 4, 5, 7, 9, 11];
const MINOR_STEPS: [i32; 7] = [0, 2, 3, 5, 7, 8, 10];
const SCALE_ROOT: i32 = 60;

/// Extra fallback draws allowed when a draw repeats a recent sequence.
const FALLBACK_REDRAWS: usize = 3;

const BASE_VELOCITY: f64 = 80.0;
const MIN_VELOCITY: f64 = 40.0;
const MAX_VELOCITY: f64 = 127.0;

/// External source of candidate notes, typically a language model.
pub trait NoteProposer: Send + Sync {
    /// Proposes `params.sequence_length` notes. `recent` holds the latest
    /// generated note vectors, oldest first, so the source can avoid them.
    fn propose<'a>(
        &'a self,
        params: &'a MusicParameters,
        recent: &'a [Vec<i32>],
    ) -> BoxFuture<'a, anyhow::Result<Vec<i32>>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Generated {
    pub sequence: MusicSequence,
    pub source: SequenceSource,
}

/// Turns a parameter snapshot into a playable sequence. Never fails: any
/// problem with the proposer falls back to a locally drawn sequence.
pub struct SequenceGenerator {
    proposer: Arc<dyn NoteProposer>,
    history: RecentSequenceHistory,
    rng: StdRng,
    proposal_timeout: Duration,
    events: EventBus,
}

impl SequenceGenerator {
    pub fn new(
        proposer: Arc<dyn NoteProposer>,
        proposal_timeout: Duration,
        events: EventBus,
    ) -> Self {
        Self::with_rng(proposer, proposal_timeout, events, StdRng::from_entropy())
    }

    pub fn with_rng(
        proposer: Arc<dyn NoteProposer>,
        proposal_timeout: Duration,
        events: EventBus,
        rng: StdRng,
    ) -> Self {
        Self {
            proposer,
            history: RecentSequenceHistory::new(),
            rng,
            proposal_timeout,
            events,
        }
    }

    pub fn history(&self) -> &RecentSequenceHistory {
        &self.history
    }

    pub async fn generate(&mut self, params: &MusicParameters) -> Generated {
        let length = params.sequence_length as usize;
        debug!("generating sequence: {}", params);

        let candidates = self.request_candidates(params).await;
        let valid: Vec<i32> = candidates.iter().copied().filter(|n| is_valid_note(*n)).collect();
        if valid.len() < candidates.len() {
            debug!("dropped {} out-of-range notes", candidates.len() - valid.len());
        }

        let (notes, source) = if valid.is_empty() {
            (self.fallback_notes(params), SequenceSource::Fallback)
        } else {
            (fit_length(valid, length), SequenceSource::Proposed)
        };

        self.history.push(notes.clone());

        let durations = self.durations(params, notes.len());
        let velocities = self.velocities(params, notes.len());
        let sequence = MusicSequence::new(notes, durations, velocities);

        let summary = sequence.summary();
        info!(
            "{:?} sequence [{}] range {:?}..{:?}, {} rests, {} ms",
            source,
            describe_notes(sequence.notes()),
            summary.lowest,
            summary.highest,
            summary.rests,
            summary.total_duration_ms
        );

        Generated { sequence, source }
    }

    async fn request_candidates(&mut self, params: &MusicParameters) -> Vec<i32> {
        let recent: Vec<Vec<i32>> = self.history.iter().cloned().collect();
        let proposal = tokio::time::timeout(
            self.proposal_timeout,
            self.proposer.propose(params, &recent),
        )
        .await;

        let failure = match proposal {
            Ok(Ok(notes)) if notes.iter().any(|n| is_valid_note(*n)) => return notes,
            Ok(Ok(notes)) => format!("proposal had no usable notes ({} candidates)", notes.len()),
            Ok(Err(err)) => format!("note proposal failed: {err:#}"),
            Err(_) => format!("note proposal timed out after {:?}", self.proposal_timeout),
        };
        warn!("{failure}, using fallback sequence");
        self.events.emit(SessionEvent::ProposalFailed(failure));
        Vec::new()
    }

    fn fallback_notes(&mut self, params: &MusicParameters) -> Vec<i32> {
        let scale = scale_for(params);
        let rest_chance = rest_probability(params.complexity);
        let length = params.sequence_length as usize;

        let mut notes = self.draw(&scale, rest_chance, length);
        for _ in 0..FALLBACK_REDRAWS {
            if !self.history.contains(&notes) {
                break;
            }
            debug!("fallback repeated a recent sequence, redrawing");
            notes = self.draw(&scale, rest_chance, length);
        }
        notes
    }

    fn draw(&mut self, scale: &[i32], rest_chance: f64, length: usize) -> Vec<i32> {
        (0..length)
            .map(|_| {
                if rest_chance > 0.0 && self.rng.gen_bool(rest_chance) {
                    REST
                } else {
                    scale.choose(&mut self.rng).copied().unwrap_or(SCALE_ROOT)
                }
            })
            .collect()
    }

    fn durations(&mut self, params: &MusicParameters, length: usize) -> Vec<u32> {
        let beat = params.beat_ms();
        (0..length)
            .map(|_| (beat * self.rng.gen_range(0.75..=1.25)).round().max(1.0) as u32)
            .collect()
    }

    fn velocities(&mut self, params: &MusicParameters, length: usize) -> Vec<u32> {
        let spread = f64::from(params.complexity) * 5.0;
        (0..length)
            .map(|_| {
                let velocity = BASE_VELOCITY + self.rng.gen_range(-1.0..=1.0) * spread;
                velocity.clamp(MIN_VELOCITY, MAX_VELOCITY).round() as u32
            })
            .collect()
    }
}

/// Truncates, or repeats the existing pattern cyclically, to exactly `length`.
pub fn fit_length(mut notes: Vec<i32>, length: usize) -> Vec<i32> {
    if notes.len() >= length {
        notes.truncate(length);
        return notes;
    }
    let pattern_len = notes.len();
    if pattern_len == 0 {
        return notes;
    }
    for i in pattern_len..length {
        notes.push(notes[i % pattern_len]);
    }
    notes
}

fn rest_probability(complexity: u32) -> f64 {
    match complexity {
        0..=3 => 0.25,
        4..=6 => 0.10,
        _ => 0.0,
    }
}

/// Diatonic scale on the key, major or natural minor depending on mood,
/// folded by octaves into the playable window.
fn scale_for(params: &MusicParameters) -> Vec<i32> {
    let steps = if params.mood.is_minor() { MINOR_STEPS } else { MAJOR_STEPS };
    diatonic_scale(params.key, &steps)
}

fn diatonic_scale(key: Key, steps: &[i32]) -> Vec<i32> {
    let mut scale: Vec<i32> = steps
        .iter()
        .map(|step| {
            let mut note = SCALE_ROOT + key.offset() + step;
            while note > HIGHEST_NOTE {
                note -= 12;
            }
            while note < LOWEST_NOTE {
                note += 12;
            }
            note
        })
        .collect();
    scale.sort_unstable();
    scale.dedup();
    scale
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::state::Mood;

    struct FailingProposer;

    impl NoteProposer for FailingProposer {
        fn propose<'a>(
            &'a self,
            _params: &'a MusicParameters,
            _recent: &'a [Vec<i32>],
        ) -> BoxFuture<'a, anyhow::Result<Vec<i32>>> {
            Box::pin(async { Err::<Vec<i32>, _>(anyhow::anyhow!("backend offline")) })
        }
    }

    /// Returns a fixed answer and records the history it was shown.
    struct FixedProposer {
        notes: Vec<i32>,
        seen_recent: Mutex<Vec<usize>>,
    }

    impl FixedProposer {
        fn new(notes: Vec<i32>) -> Arc<Self> {
            Arc::new(Self { notes, seen_recent: Mutex::new(Vec::new()) })
        }
    }

    impl NoteProposer for FixedProposer {
        fn propose<'a>(
            &'a self,
            _params: &'a MusicParameters,
            recent: &'a [Vec<i32>],
        ) -> BoxFuture<'a, anyhow::Result<Vec<i32>>> {
            self.seen_recent.lock().unwrap().push(recent.len());
            let notes = self.notes.clone();
            Box::pin(async move { Ok::<_, anyhow::Error>(notes) })
        }
    }

    struct StalledProposer;

    impl NoteProposer for StalledProposer {
        fn propose<'a>(
            &'a self,
            _params: &'a MusicParameters,
            _recent: &'a [Vec<i32>],
        ) -> BoxFuture<'a, anyhow::Result<Vec<i32>>> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<_, anyhow::Error>(vec![60])
            })
        }
    }

    fn generator(proposer: Arc<dyn NoteProposer>, events: EventBus) -> SequenceGenerator {
        SequenceGenerator::with_rng(
            proposer,
            Duration::from_secs(5),
            events,
            StdRng::seed_from_u64(7),
        )
    }

    fn assert_sequence_invariant(params: &MusicParameters, sequence: &MusicSequence) {
        let length = params.sequence_length as usize;
        assert_eq!(sequence.notes().len(), length);
        assert_eq!(sequence.durations().len(), length);
        assert_eq!(sequence.velocities().len(), length);
        assert!(sequence.notes().iter().all(|n| is_valid_note(*n)), "{:?}", sequence.notes());
        assert!(sequence.durations().iter().all(|d| *d > 0));
        assert!(sequence.velocities().iter().all(|v| (40..=127).contains(v)));
    }

    #[tokio::test]
    async fn fallback_holds_invariant_across_many_calls() {
        let events = EventBus::with_capacity(128);
        let mut rx = events.subscribe();
        let mut generator = generator(Arc::new(FailingProposer), events);
        let mut param_rng = StdRng::seed_from_u64(99);

        for _ in 0..100 {
            let params = MusicParameters {
                tempo: param_rng.gen_range(60..=180),
                key: *Key::ALL.choose(&mut param_rng).unwrap(),
                mood: *Mood::ALL.choose(&mut param_rng).unwrap(),
                complexity: param_rng.gen_range(1..=10),
                sequence_length: param_rng.gen_range(4..=16),
            };
            let generated = generator.generate(&params).await;
            assert_eq!(generated.source, SequenceSource::Fallback);
            assert_sequence_invariant(&params, &generated.sequence);
        }

        assert!(matches!(rx.try_recv(), Ok(SessionEvent::ProposalFailed(_))));
    }

    #[tokio::test]
    async fn proposal_is_filtered_then_repeated_to_length() {
        let proposer = FixedProposer::new(vec![60, 99, -1, 40, 64]);
        let mut generator = generator(proposer, EventBus::new());
        let params = MusicParameters { sequence_length: 8, ..MusicParameters::default() };

        let generated = generator.generate(&params).await;
        assert_eq!(generated.source, SequenceSource::Proposed);
        assert_eq!(generated.sequence.notes(), &[60, -1, 64, 60, -1, 64, 60, -1]);
        assert_sequence_invariant(&params, &generated.sequence);
    }

    #[tokio::test]
    async fn long_proposal_is_truncated() {
        let proposer = FixedProposer::new((53..=71).collect());
        let mut generator = generator(proposer, EventBus::new());
        let params = MusicParameters { sequence_length: 4, ..MusicParameters::default() };

        let generated = generator.generate(&params).await;
        assert_eq!(generated.sequence.notes(), &[53, 54, 55, 56]);
    }

    #[tokio::test]
    async fn unusable_proposal_falls_back() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let mut generator = generator(FixedProposer::new(vec![0, 12, 127, -5]), events);
        let params = MusicParameters::default();

        let generated = generator.generate(&params).await;
        assert_eq!(generated.source, SequenceSource::Fallback);
        assert_sequence_invariant(&params, &generated.sequence);
        assert!(matches!(rx.try_recv(), Ok(SessionEvent::ProposalFailed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_proposal_times_out_into_fallback() {
        let mut generator = generator(Arc::new(StalledProposer), EventBus::new());
        let params = MusicParameters::default();

        let generated = generator.generate(&params).await;
        assert_eq!(generated.source, SequenceSource::Fallback);
        assert_sequence_invariant(&params, &generated.sequence);
    }

    #[tokio::test]
    async fn history_is_bounded_and_shown_to_proposer() {
        let proposer = FixedProposer::new(vec![60, 62]);
        let mut generator = generator(proposer.clone(), EventBus::new());
        let params = MusicParameters::default();

        for _ in 0..7 {
            generator.generate(&params).await;
        }
        assert_eq!(generator.history().len(), 5);
        assert_eq!(*proposer.seen_recent.lock().unwrap(), vec![0, 1, 2, 3, 4, 5, 5]);
    }

    #[tokio::test]
    async fn high_complexity_fallback_has_no_rests_and_stays_in_scale() {
        let mut generator = generator(Arc::new(FailingProposer), EventBus::new());
        let params = MusicParameters {
            key: Key::D,
            mood: Mood::Happy,
            complexity: 9,
            sequence_length: 16,
            ..MusicParameters::default()
        };
        let scale = scale_for(&params);

        for _ in 0..20 {
            let generated = generator.generate(&params).await;
            assert!(generated.sequence.notes().iter().all(|n| scale.contains(n)));
        }
    }

    #[tokio::test]
    async fn durations_and_velocities_are_humanized_within_bounds() {
        let mut generator = generator(Arc::new(FailingProposer), EventBus::new());
        let params = MusicParameters {
            tempo: 120,
            complexity: 10,
            sequence_length: 16,
            ..MusicParameters::default()
        };

        let generated = generator.generate(&params).await;
        let durations = generated.sequence.durations();
        assert!(durations.iter().all(|d| (375..=625).contains(d)), "{durations:?}");
        assert!(durations.iter().any(|d| *d != durations[0]));
        assert!(generated.sequence.velocities().iter().all(|v| (40..=127).contains(v)));
    }

    #[test]
    fn fit_length_never_invents_notes() {
        assert_eq!(fit_length(vec![60, 64, 67], 7), vec![60, 64, 67, 60, 64, 67, 60]);
        assert_eq!(fit_length(vec![60, 64, 67], 2), vec![60, 64]);
        assert_eq!(fit_length(vec![60], 3), vec![60, 60, 60]);
        assert!(fit_length(Vec::new(), 3).is_empty());
    }

    #[test]
    fn scales_fold_into_window() {
        assert_eq!(diatonic_scale(Key::C, &MAJOR_STEPS), vec![60, 62, 64, 65, 67, 69, 71]);
        let b_major = diatonic_scale(Key::B, &MAJOR_STEPS);
        assert_eq!(b_major.len(), 7);
        assert!(b_major.iter().all(|n| (LOWEST_NOTE..=HIGHEST_NOTE).contains(n)));
        assert_eq!(diatonic_scale(Key::A, &MINOR_STEPS), vec![60, 62, 64, 65, 67, 69, 71]);
    }

    #[test]
    fn rest_chance_steps_down_with_complexity() {
        assert_eq!(rest_probability(1), 0.25);
        assert_eq!(rest_probability(3), 0.25);
        assert_eq!(rest_probability(6), 0.10);
        assert_eq!(rest_probability(7), 0.0);
    }
}
