//! Whisper decoding grammar, enforced per beam per decode step.
//!
//! ## Rules (first match wins)
//!
//! ```text
//! last == SOT                 → only language tags
//! penultimate == SOT          → force the task token
//! otherwise                   → suppress <|notimestamps|>, then
//!   ts, ts                    → no timestamps (zero-length segment)
//!   text, ts  (single segment)→ force end-of-text
//!   text, ts                  → no text, no timestamp below the last one   ┐ timestamp
//!   …, text                   → no timestamp below (prior timestamp + 1)   ┘ mass check
//! ```
//!
//! The timestamp mass check suppresses every non-timestamp token when the
//! summed probability of all timestamps beats the best single other token.
//!
//! Each beam is handled from its own history. The registry is consulted
//! once per step; when the request is unknown only the history-based rules
//! run. Nothing here returns an error or panics: bad input leaves rows
//! untouched.

use std::sync::Arc;

use ndarray::ArrayViewMut2;
use tracing::debug;

use crate::inference::RequestId;
use crate::vocab::{TokenId, Vocabulary};

use super::logits::BeamScores;
use super::registry::{DecodeContext, RequestRegistry};
use super::DecodeHook;

#[derive(Debug)]
pub struct DecodeConstraints {
    vocab: Vocabulary,
    registry: Arc<RequestRegistry>,
}

impl DecodeConstraints {
    pub fn new(vocab: Vocabulary, registry: Arc<RequestRegistry>) -> Self {
        Self { vocab, registry }
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocab
    }

    pub fn registry(&self) -> &Arc<RequestRegistry> {
        &self.registry
    }

    /// Entry point for the inference engine: dispatch on the bound hook.
    pub fn apply<H: AsRef<[TokenId]>>(
        &self,
        hook: DecodeHook,
        id: RequestId,
        scores: ArrayViewMut2<'_, f32>,
        histories: &[H],
    ) {
        match hook {
            DecodeHook::LanguageDetect => self.detect_language(scores),
            DecodeHook::Transcribe => self.process(id, scores, histories, false),
            DecodeHook::TranscribeSegment => self.process(id, scores, histories, true),
        }
    }

    /// Restrict every beam to language tags, whatever its history.
    pub fn detect_language(&self, mut scores: ArrayViewMut2<'_, f32>) {
        for row in scores.rows_mut() {
            BeamScores::new(row).allow_only(self.vocab.languages.clone());
        }
    }

    /// Apply the transcription grammar to every beam.
    pub fn process<H: AsRef<[TokenId]>>(
        &self,
        id: RequestId,
        mut scores: ArrayViewMut2<'_, f32>,
        histories: &[H],
        stop_on_timestamps: bool,
    ) {
        let context = self.registry.record_step(id);
        if context.is_none() {
            debug!(request = %id, "no decode context; using history-only rules");
        }
        if scores.nrows() != histories.len() {
            debug!(
                request = %id,
                rows = scores.nrows(),
                histories = histories.len(),
                "beam count mismatch; extra rows left untouched"
            );
        }

        let stop = stop_on_timestamps
            || context.is_some_and(|c| c.stop_after_first_segment);

        for (row, history) in scores.rows_mut().into_iter().zip(histories) {
            self.constrain_beam(BeamScores::new(row), history.as_ref(), context.as_ref(), stop);
        }
    }

    fn constrain_beam(
        &self,
        mut scores: BeamScores<'_>,
        history: &[TokenId],
        context: Option<&DecodeContext>,
        stop_on_timestamps: bool,
    ) {
        let vocab = &self.vocab;
        let Some(&last) = history.last() else {
            return;
        };
        let penultimate = history.len().checked_sub(2).map(|i| history[i]);

        // 1. language tag follows start-of-transcript
        if last == vocab.start_of_transcript {
            scores.allow_only(vocab.languages.clone());
            return;
        }
        // 2. task token follows the language tag
        if penultimate == Some(vocab.start_of_transcript) {
            scores.force(vocab.transcribe);
            return;
        }

        // 3. text / timestamp alternation
        scores.suppress(vocab.no_timestamps);

        if let Some(ctx) = context {
            if last == vocab.transcribe && history.len() == ctx.prompt_len {
                self.constrain_first_text(&mut scores, ctx);
            }
        }

        let last_was_timestamp = vocab.is_timestamp(last);
        let penultimate_was_timestamp = match penultimate {
            Some(t) => vocab.is_timestamp(t) || t == vocab.transcribe,
            None => false,
        };

        if last_was_timestamp && penultimate_was_timestamp {
            scores.suppress_range(vocab.timestamps.clone());
            return;
        }

        if last_was_timestamp {
            if stop_on_timestamps {
                scores.force(vocab.end_of_text);
                return;
            }
            scores.suppress_range(0..vocab.end_of_text);
            scores.suppress_range(vocab.timestamps.start..last);
        } else {
            let floor = context.map_or(0, |c| c.prompt_len);
            if let Some(prior) = self.prior_timestamp(history, floor) {
                scores.suppress_range(vocab.timestamps.start..prior + 1);
            }
        }

        self.apply_timestamp_mass(&mut scores);
    }

    fn constrain_first_text(&self, scores: &mut BeamScores<'_>, ctx: &DecodeContext) {
        let vocab = &self.vocab;
        if ctx.suppress_blank {
            scores.suppress(vocab.space);
            scores.suppress(vocab.end_of_text);
        }
        if let Some(max_initial) = ctx.max_initial_timestamp {
            let first_banned = vocab.timestamps.start.saturating_add(max_initial).saturating_add(1);
            scores.suppress_range(first_banned..vocab.timestamps.end);
        }
    }

    /// Most recent timestamp in `history[floor..]`, not looking past the
    /// most recent task token.
    fn prior_timestamp(&self, history: &[TokenId], floor: usize) -> Option<TokenId> {
        history
            .get(floor.min(history.len())..)?
            .iter()
            .rev()
            .take_while(|&&t| t != self.vocab.transcribe)
            .find(|&&t| self.vocab.is_timestamp(t))
            .copied()
    }

    fn apply_timestamp_mass(&self, scores: &mut BeamScores<'_>) {
        let vocab = &self.vocab;
        let timestamp_mass = scores.logsumexp(vocab.timestamps.clone());
        let best_other = scores.max(0..vocab.timestamps.start);
        if timestamp_mass > best_other {
            scores.suppress_range(0..vocab.timestamps.start);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    // text 0..10, eot 10, sot 11, languages 12..16, transcribe 16,
    // startofprev 17, notimestamps 18, timestamps 19..40
    fn vocab() -> Vocabulary {
        Vocabulary {
            space: 0,
            end_of_text: 10,
            start_of_transcript: 11,
            languages: 12..16,
            transcribe: 16,
            start_of_prev: 17,
            no_timestamps: 18,
            timestamps: 19..40,
        }
    }

    const TS: TokenId = 19;
    const ID: RequestId = RequestId(1);

    fn engine() -> DecodeConstraints {
        let v = vocab();
        v.validate().unwrap();
        DecodeConstraints::new(v, Arc::new(RequestRegistry::new()))
    }

    /// Text tokens dominate; timestamps carry a small uniform score.
    fn text_heavy(beams: usize) -> Array2<f32> {
        Array2::from_shape_fn((beams, 40), |(_, t)| if t < 19 { 2.0 } else { -4.0 })
    }

    fn finite(row: ndarray::ArrayView1<'_, f32>) -> Vec<usize> {
        row.iter()
            .enumerate()
            .filter(|(_, v)| v.is_finite())
            .map(|(i, _)| i)
            .collect()
    }

    fn run(engine: &DecodeConstraints, scores: &mut Array2<f32>, history: &[TokenId], stop: bool) {
        engine.process(ID, scores.view_mut(), &[history.to_vec()], stop);
    }

    #[test]
    fn start_of_transcript_gates_language_tags() {
        let e = engine();
        let mut scores = text_heavy(1);
        run(&e, &mut scores, &[11], false);
        assert_eq!(finite(scores.row(0)), vec![12, 13, 14, 15]);
        assert_eq!(scores[[0, 12]], 2.0, "language scores are preserved");
    }

    #[test]
    fn language_tag_forces_task_token() {
        let e = engine();
        let mut scores = text_heavy(1);
        run(&e, &mut scores, &[17, 3, 11, 13], false);
        assert_eq!(finite(scores.row(0)), vec![16]);
    }

    #[test]
    fn no_timestamps_token_is_always_suppressed_mid_sequence() {
        let e = engine();
        let mut scores = text_heavy(1);
        run(&e, &mut scores, &[11, 13, 16, TS, 4], false);
        assert_eq!(scores[[0, 18]], f32::NEG_INFINITY);
        assert!(scores[[0, 4]].is_finite());
    }

    #[test]
    fn consecutive_timestamps_suppress_all_timestamps() {
        let e = engine();
        let mut scores = text_heavy(1);
        run(&e, &mut scores, &[11, 13, 16, TS, 3, TS + 5, TS + 5], false);
        for t in 19..40 {
            assert_eq!(scores[[0, t]], f32::NEG_INFINITY, "timestamp {t}");
        }
        assert!(scores[[0, 3]].is_finite());
    }

    #[test]
    fn first_timestamp_after_task_token_counts_as_pair() {
        let e = engine();
        let mut scores = text_heavy(1);
        run(&e, &mut scores, &[11, 13, 16, TS], false);
        assert!((19..40).all(|t| scores[[0, t]] == f32::NEG_INFINITY));
    }

    #[test]
    fn single_segment_mode_forces_end_of_text_after_close() {
        let e = engine();
        let mut scores = text_heavy(1);
        run(&e, &mut scores, &[11, 13, 16, TS, 3, 4, TS + 7], true);
        assert_eq!(finite(scores.row(0)), vec![10]);
    }

    #[test]
    fn stop_flag_from_registry_enables_single_segment_mode() {
        let e = engine();
        let mut ctx = DecodeContext::new(3);
        ctx.stop_after_first_segment = true;
        e.registry().register_context(ID, ctx);
        let mut scores = text_heavy(1);
        run(&e, &mut scores, &[11, 13, 16, TS, 3, TS + 7], false);
        assert_eq!(finite(scores.row(0)), vec![10]);
    }

    #[test]
    fn closed_segment_bans_text_and_earlier_timestamps() {
        let e = engine();
        let mut scores = text_heavy(1);
        run(&e, &mut scores, &[11, 13, 16, TS, 3, TS + 7], false);
        let allowed = finite(scores.row(0));
        assert!(allowed.contains(&10), "end-of-text stays available");
        assert!(allowed.contains(&(TS as usize + 7)), "equal timestamp allowed");
        assert!(!allowed.contains(&(TS as usize + 6)));
        assert!(!allowed.iter().any(|&t| t < 10), "text suppressed");
    }

    #[test]
    fn open_segment_requires_timestamp_after_prior() {
        let e = engine();
        let mut scores = text_heavy(1);
        run(&e, &mut scores, &[11, 13, 16, TS, 3, TS + 4, TS + 4, 5, 6], false);
        for t in 19..=(TS + 4) as usize {
            assert_eq!(scores[[0, t]], f32::NEG_INFINITY, "timestamp {t}");
        }
        assert!(scores[[0, TS as usize + 5]].is_finite());
        assert!(scores[[0, 5]].is_finite(), "text wins the mass check here");
    }

    #[test]
    fn backward_scan_stops_at_task_token() {
        let e = engine();
        let mut scores = text_heavy(1);
        // Timestamp before the task token belongs to a previous prompt.
        run(&e, &mut scores, &[17, TS + 9, 11, 13, 16, 3], false);
        assert!(scores[[0, 19]].is_finite());
    }

    #[test]
    fn backward_scan_respects_prompt_len_when_registered() {
        let e = engine();
        e.registry().register(ID, 4);
        let mut scores = text_heavy(1);
        // Prompt without a task token; the timestamp lies inside it.
        run(&e, &mut scores, &[17, TS + 9, 11, 13, 3], false);
        assert!(scores[[0, 19]].is_finite());
    }

    #[test]
    fn timestamp_mass_beats_best_text_token() {
        let e = engine();
        // Every timestamp slightly below the best text token, but summed
        // over 21 of them the timestamp range dominates.
        let mut scores = Array2::from_shape_fn((1, 40), |(_, t)| if t < 19 { 0.0 } else { -0.5 });
        run(&e, &mut scores, &[11, 13, 16, TS, 3], false);
        let allowed = finite(scores.row(0));
        assert!(allowed.iter().all(|&t| t >= 19), "only timestamps remain: {allowed:?}");
        assert!(allowed.contains(&(TS as usize + 1)));
    }

    #[test]
    fn beams_are_constrained_independently() {
        let e = engine();
        let mut scores = text_heavy(3);
        let histories = vec![vec![11], vec![11, 13], vec![11, 13, 16, TS, 3, TS + 2, TS + 2]];
        e.process(ID, scores.view_mut(), &histories, false);
        assert_eq!(finite(scores.row(0)), vec![12, 13, 14, 15]);
        assert_eq!(finite(scores.row(1)), vec![16]);
        assert!((19..40).all(|t| scores[[2, t]] == f32::NEG_INFINITY));
        assert!(scores[[2, 0]].is_finite());
    }

    #[test]
    fn suppress_blank_and_max_initial_timestamp_apply_at_first_text_position() {
        let e = engine();
        let mut ctx = DecodeContext::new(3);
        ctx.suppress_blank = true;
        ctx.max_initial_timestamp = Some(2);
        e.registry().register_context(ID, ctx);

        let mut scores = text_heavy(1);
        run(&e, &mut scores, &[11, 13, 16], false);
        assert_eq!(scores[[0, 0]], f32::NEG_INFINITY, "space");
        assert_eq!(scores[[0, 10]], f32::NEG_INFINITY, "end-of-text");
        assert!(scores[[0, 21]].is_finite());
        assert!((22..40).all(|t| scores[[0, t]] == f32::NEG_INFINITY));
        assert_eq!(e.registry().lookup(ID).unwrap().steps, 1);
    }

    #[test]
    fn missing_context_skips_refinements_without_failing() {
        let e = engine();
        let mut scores = text_heavy(1);
        run(&e, &mut scores, &[11, 13, 16], false);
        assert!(scores[[0, 0]].is_finite());
        assert!(scores[[0, 39]].is_finite());
        assert!(e.registry().is_empty());
    }

    #[test]
    fn malformed_inputs_degrade_without_panicking() {
        let e = engine();

        // Empty history: row untouched.
        let mut scores = text_heavy(1);
        let before = scores.clone();
        e.process(ID, scores.view_mut(), &[Vec::<TokenId>::new()], false);
        assert_eq!(scores, before);

        // More rows than histories: extra rows untouched.
        let mut scores = text_heavy(2);
        e.process(ID, scores.view_mut(), &[vec![11u32]], false);
        assert_eq!(finite(scores.row(0)), vec![12, 13, 14, 15]);
        assert_eq!(scores.row(1), text_heavy(1).row(0));

        // Short row: ranges clamp, forced token out of range is a no-op.
        let mut short = Array2::<f32>::zeros((1, 12));
        e.process(ID, short.view_mut(), &[vec![11u32, 13]], false);
        assert_eq!(short, Array2::<f32>::zeros((1, 12)));

        // Token ids far outside the vocabulary.
        let mut scores = text_heavy(1);
        e.process(ID, scores.view_mut(), &[vec![u32::MAX, u32::MAX - 1]], false);
        assert_eq!(scores[[0, 18]], f32::NEG_INFINITY);
    }

    #[test]
    fn fully_masked_row_stays_masked() {
        let e = engine();
        let mut scores = Array2::from_elem((1, 40), f32::NEG_INFINITY);
        run(&e, &mut scores, &[11, 13, 16, TS, 3], false);
        assert!(scores.iter().all(|v| *v == f32::NEG_INFINITY));
    }

    #[test]
    fn language_detect_hook_ignores_history() {
        let e = engine();
        let mut scores = text_heavy(2);
        e.apply(
            DecodeHook::LanguageDetect,
            ID,
            scores.view_mut(),
            &[vec![3u32, 4], vec![]],
        );
        for r in 0..2 {
            assert_eq!(finite(scores.row(r)), vec![12, 13, 14, 15]);
        }
    }

    #[test]
    fn transcribe_segment_hook_threads_stop_flag() {
        let e = engine();
        let mut scores = text_heavy(1);
        e.apply(
            DecodeHook::TranscribeSegment,
            ID,
            scores.view_mut(),
            &[vec![11u32, 13, 16, TS, 3, TS + 1]],
        );
        assert_eq!(finite(scores.row(0)), vec![10]);
    }
}
