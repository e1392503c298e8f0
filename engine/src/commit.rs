//! The central state machine (§4.4): one iteration pops the pending buffer, runs it past the
//! optional VAD gate, decodes it, classifies the resulting segments, picks a commit point, emits
//! transcripts for the useful ones, and splices the buffer for the next iteration.
//!
//! Split in two so the handle (`engine::handle`) can run `decode()` without holding the shared
//! mutex (§5): `prepare()` takes the lock to snapshot a decode window and run the VAD gate,
//! `finish()` takes it again afterwards to classify, emit, and splice. Nothing here calls
//! `decode()` directly; that's the handle's job, unlocked.

use crate::buffer::SlidingBuffer;
use crate::hallucination::{self, Classification, ModelHash};
use crate::model::{DecodeParams, Segment};
use crate::pcm;
use crate::transcript::{Transcript, TranscriptToken, TranscriptVariant};
use crate::vad_gate::{self, VadSource};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Static per-engine configuration threaded into every decode call.
pub struct CommitConfig {
    pub language: Option<String>,
    pub translate: bool,
    pub diarize: bool,
    /// `<= 0.0` disables the VAD gate entirely.
    pub vad_threshold: f32,
    pub model_hash: ModelHash,
}

/// The tail segment of the previous iteration, kept to detect silent-tail-attachment artifacts.
struct LastSegment {
    text: String,
    start_ms: i64,
    end_ms: i64,
}

/// A decode window ready to go through the acoustic model, handed out by `prepare()` and handed
/// back to `finish()` once decode has run.
pub(crate) struct DecodeJob {
    pub(crate) window_start_bytes: u64,
    pub(crate) decoded: Vec<u8>,
    pub(crate) params: DecodeParams,
}

/// Everything the writer and the decoder worker share: the buffer and the cross-iteration
/// decision state. Guarded by a mutex the worker holds only for `prepare()` and `finish()`,
/// never across the synchronous `decode()` call in between (§5).
pub struct CommitState {
    buffer: SlidingBuffer,
    vad: Box<dyn VadSource>,
    config: CommitConfig,
    last_segment: Option<LastSegment>,
    is_first_speaker_speaking: bool,
    no_useful_iterations: u32,
    vad_voice_found_at: Option<Duration>,
    decode_iterations: u64,
}

impl CommitState {
    pub fn new(vad: Box<dyn VadSource>, config: CommitConfig) -> Self {
        Self {
            buffer: SlidingBuffer::new(),
            vad,
            config,
            last_segment: None,
            is_first_speaker_speaking: true,
            no_useful_iterations: 0,
            vad_voice_found_at: None,
            decode_iterations: 0,
        }
    }

    pub fn append(&mut self, frame: &[u8]) {
        self.buffer.append(frame);
    }

    pub fn committed_pos_bytes(&self) -> u64 {
        self.buffer.committed_pos_bytes()
    }

    /// Snapshot phase: checks the required-frame threshold, drains the pending buffer, and runs
    /// the VAD gate. Returns `None` when the tick has nothing to decode (too little audio, a
    /// silent window, or an all-silence trim). Takes the lock only for its own duration.
    pub(crate) fn prepare(&mut self) -> Option<DecodeJob> {
        if (self.buffer.pending_len() as u64) < pcm::REQUIRED_FRAME_BYTES {
            return None;
        }

        let mut window_start_bytes = self.buffer.committed_pos_bytes();

        if self.config.vad_threshold > 0.0 {
            let outcome = vad_gate::apply(
                self.vad.as_ref(),
                self.config.vad_threshold,
                window_start_bytes,
                self.buffer.pending(),
                &mut self.vad_voice_found_at,
            );
            match outcome {
                vad_gate::GateOutcome::Silence => {
                    debug!("VAD gate: window is silence, discarding");
                    let decoded = self.buffer.take_pending_for_decode();
                    self.buffer.discard_decoded_keeping_tail(&decoded, pcm::bytes_for_duration(pcm::PRESERVE_HEADING));
                    return None;
                }
                vad_gate::GateOutcome::TrimHead(n) => {
                    let cut = self.buffer.cut_front(n);
                    window_start_bytes += cut;
                }
            }
        }

        let decoded = self.buffer.take_pending_for_decode();
        if decoded.is_empty() {
            return None;
        }

        let params = DecodeParams {
            language: self.config.language.clone(),
            translate: self.config.translate,
            token_timestamps: true,
            diarize: self.config.diarize,
        };

        Some(DecodeJob { window_start_bytes, decoded, params })
    }

    /// Splice phase: warm-up/no-useful-streak handling, classification, commit-point selection,
    /// emission, and buffer splicing. Runs entirely on already-decoded segments; the lock it
    /// needs is only ever held for this CPU-only bookkeeping, never for `decode()` itself.
    pub(crate) fn finish(&mut self, job: DecodeJob, segments: Vec<Segment>, language: String) -> Vec<Transcript> {
        let DecodeJob { window_start_bytes, decoded, .. } = job;

        self.decode_iterations += 1;
        if self.decode_iterations <= 2 {
            debug!(iteration = self.decode_iterations, "warm-up iteration, discarding");
            self.buffer.discard_decoded_keeping_tail(&decoded, pcm::bytes_for_duration(pcm::PRESERVE_HEADING));
            return Vec::new();
        }

        let n = segments.len();
        if n == 0 {
            self.no_useful_iterations += 1;
            if self.no_useful_iterations >= pcm::DISCARD_IF_NO_USEFUL {
                self.buffer.discard_decoded_keeping_tail(&decoded, pcm::bytes_for_duration(pcm::PRESERVE_HEADING));
                self.no_useful_iterations = 0;
                self.last_segment = None;
            } else {
                self.buffer.splice_after_commit(&decoded, 0);
            }
            return Vec::new();
        }

        let last_idx = n - 1;
        let window_end_ms = pcm::duration_for_bytes(decoded.len() as u64).as_millis() as i64;

        let mut last_end_ms = last_timestamp_ms(&segments[last_idx]);
        let mut tail_corrected = false;
        if let Some(prev) = &self.last_segment {
            let first_ms = first_timestamp_ms(&segments[last_idx]);
            if (first_ms - pcm::SILENT_TAIL_CORRECTION.as_millis() as i64) < prev.start_ms
                && segments[last_idx].text.chars().count() <= prev.text.chars().count()
            {
                last_end_ms = prev.end_ms;
                tail_corrected = true;
            }
        }

        let tail_gap_ms = window_end_ms - last_end_ms;
        let mut commit_idx: i64 =
            if tail_gap_ms >= pcm::GAP_TO_COMMIT.as_millis() as i64 { last_idx as i64 } else { last_idx as i64 - 1 };

        let mut hang_seen = false;
        for (i, seg) in segments.iter().enumerate() {
            if hallucination::classify(&self.config.model_hash, seg) == Classification::Hanging {
                hang_seen = true;
                if i as i64 > commit_idx {
                    commit_idx = i as i64;
                }
            }
        }

        let window_start = pcm::duration_for_bytes(window_start_bytes);
        let mut transcripts = Vec::with_capacity(n);
        let mut any_useful = false;

        for (i, seg) in segments.iter().enumerate() {
            let classification = hallucination::classify(&self.config.model_hash, seg);
            if classification != Classification::Useful {
                continue;
            }
            any_useful = true;

            // Only segments that clear classification flip the speaker; a hallucination or
            // hanging segment carrying a stray marker must not toggle it.
            if seg.speaker_turn {
                self.is_first_speaker_speaking = !self.is_first_speaker_speaking;
            }

            let speaker = if self.is_first_speaker_speaking { ">" } else { "<" };
            let tokens = seg
                .tokens
                .iter()
                .map(|t| TranscriptToken {
                    start: window_start + Duration::from_millis(t.start_ms.max(0) as u64),
                    end: window_start + Duration::from_millis(t.end_ms.max(0) as u64),
                    text: t.text.clone(),
                    confidence: t.probability,
                    speaker,
                })
                .collect();

            transcripts.push(Transcript {
                variants: vec![TranscriptVariant { text: seg.text.clone(), tokens, confidence: 1.0 - seg.no_speech_probability }],
                is_final: i as i64 <= commit_idx,
                no_speech_probability: seg.no_speech_probability,
                language: language.clone(),
                channel_count: 1,
            });
        }

        if any_useful {
            self.no_useful_iterations = 0;
        } else {
            self.no_useful_iterations += 1;
        }

        if !any_useful && (self.no_useful_iterations >= pcm::DISCARD_IF_NO_USEFUL || hang_seen) {
            info!(no_useful_iterations = self.no_useful_iterations, hang_seen, "discarding stalled window");
            self.buffer.discard_decoded_keeping_tail(&decoded, pcm::bytes_for_duration(pcm::PRESERVE_HEADING));
            self.no_useful_iterations = 0;
            self.last_segment = None;
        } else {
            let bytes_diff = if commit_idx >= 0 {
                let ts = last_timestamp_ms(&segments[commit_idx as usize]).max(0);
                pcm::bytes_for_duration(Duration::from_millis(ts as u64))
            } else {
                0
            };
            if bytes_diff >= decoded.len() as u64 {
                warn!("commit point landed at or past the decoded window; holding instead");
            } else {
                self.buffer.splice_after_commit(&decoded, bytes_diff);
                // Preserve the prior tail reference when the silent-tail correction fired above;
                // only the uncorrected case advances what the next iteration compares against.
                if !tail_corrected {
                    self.last_segment = Some(LastSegment {
                        text: segments[last_idx].text.clone(),
                        start_ms: first_timestamp_ms(&segments[last_idx]),
                        end_ms: last_end_ms,
                    });
                }
            }
        }

        transcripts
    }
}

/// `t0` of the first token whose span isn't zero-width; `0` if none qualify.
fn first_timestamp_ms(segment: &Segment) -> i64 {
    segment.tokens.iter().find(|t| t.start_ms != t.end_ms).map(|t| t.start_ms).unwrap_or(0)
}

/// `t1` of the last token whose span isn't zero-width; `0` if none qualify.
fn last_timestamp_ms(segment: &Segment) -> i64 {
    segment.tokens.iter().rev().find(|t| t.start_ms != t.end_ms).map(|t| t.end_ms).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_support::ScriptedModel;
    use crate::model::{AcousticModel, Token};

    fn token(text: &str, start_ms: i64, end_ms: i64) -> Token {
        Token { text: text.to_string(), start_ms, end_ms, probability: 0.9 }
    }

    fn useful_segment(text: &str, tokens: Vec<Token>) -> Segment {
        Segment { text: text.to_string(), tokens, no_speech_probability: 0.05, speaker_turn: false }
    }

    /// Drives `CommitState::prepare`/`finish` synchronously, the way `engine::handle`'s worker
    /// drives them across the lock/decode/lock boundary, but without the tokio machinery.
    struct TestEngine {
        state: CommitState,
        model: Box<dyn AcousticModel>,
    }

    fn engine_with(batches: Vec<Vec<Segment>>) -> TestEngine {
        let model = Box::new(ScriptedModel::new(batches));
        let vad = Box::new(vad_gate::DummyVad);
        let config = CommitConfig {
            language: None,
            translate: false,
            diarize: false,
            vad_threshold: 0.0,
            model_hash: hallucination::MODEL_HASH_LARGE_V3,
        };
        TestEngine { state: CommitState::new(vad, config), model }
    }

    impl TestEngine {
        fn append(&mut self, frame: &[u8]) {
            self.state.append(frame);
        }

        fn committed_pos_bytes(&self) -> u64 {
            self.state.committed_pos_bytes()
        }

        fn run_iteration(&mut self) -> Result<Vec<Transcript>, crate::error::EngineError> {
            let Some(job) = self.state.prepare() else { return Ok(Vec::new()) };
            let samples = pcm::bytes_to_f32_samples(&job.decoded);
            self.model.decode(&job.params, &samples)?;
            let n = self.model.num_segments();
            let segments: Vec<Segment> = (0..n).map(|i| self.model.segment(i)).collect();
            let language = self.model.default_lang_str();
            Ok(self.state.finish(job, segments, language))
        }
    }

    fn fill_window(engine: &mut TestEngine, seconds: u64) {
        engine.append(&vec![0u8; (seconds * pcm::BYTES_PER_SECOND) as usize]);
    }

    #[test]
    fn empty_input_never_decodes() {
        let mut engine = engine_with(vec![]);
        assert!(engine.run_iteration().unwrap().is_empty());
        assert_eq!(engine.committed_pos_bytes(), 0);
    }

    #[test]
    fn below_required_frame_skips_iteration() {
        let mut engine = engine_with(vec![]);
        engine.append(&vec![0u8; (pcm::REQUIRED_FRAME_BYTES - 4) as usize]);
        assert!(engine.run_iteration().unwrap().is_empty());
        assert_eq!(engine.committed_pos_bytes(), 0);
    }

    #[test]
    fn first_two_decode_iterations_are_warmup() {
        let batch = vec![useful_segment("hello there", vec![token("hello", 0, 400), token("there", 400, 800)])];
        let mut engine = engine_with(vec![batch.clone(), batch.clone(), batch]);

        fill_window(&mut engine, 3);
        assert!(engine.run_iteration().unwrap().is_empty());
        fill_window(&mut engine, 3);
        assert!(engine.run_iteration().unwrap().is_empty());
        fill_window(&mut engine, 3);
        let out = engine.run_iteration().unwrap();
        assert!(!out.is_empty(), "third decode should emit after warm-up");
    }

    #[test]
    fn tail_gap_commits_both_segments_final() {
        let mut engine = engine_with(vec![vec![], vec![]]);
        fill_window(&mut engine, 3);
        engine.run_iteration().unwrap();
        fill_window(&mut engine, 3);
        engine.run_iteration().unwrap();

        let segs = vec![
            useful_segment("first segment", vec![token("first", 0, 1500), token("segment", 1500, 2000)]),
            useful_segment("second segment", vec![token("second", 2500, 3800), token("segment", 3800, 4000)]),
        ];
        let mut engine = swap_model(engine, vec![segs]);
        fill_window(&mut engine, 6); // 6500ms window -> trimmed by pcm rounding to whole seconds in this test
        let out = engine.run_iteration().unwrap();
        assert_eq!(out.len(), 2);
        assert!(out[0].is_final);
        assert!(out[1].is_final);
    }

    #[test]
    fn tail_gap_holds_final_segment_tentative() {
        let mut engine = engine_with(vec![vec![], vec![]]);
        fill_window(&mut engine, 3);
        engine.run_iteration().unwrap();
        fill_window(&mut engine, 3);
        engine.run_iteration().unwrap();

        let segs = vec![
            useful_segment("first segment", vec![token("first", 0, 1500), token("segment", 1500, 2000)]),
            useful_segment("second segment", vec![token("second", 2500, 6000), token("segment", 6000, 6200)]),
        ];
        let mut engine = swap_model(engine, vec![segs]);
        fill_window(&mut engine, 7);
        let out = engine.run_iteration().unwrap();
        assert_eq!(out.len(), 2);
        assert!(out[0].is_final);
        assert!(!out[1].is_final);
    }

    #[test]
    fn hanging_segment_forces_commit_past_it() {
        let mut engine = engine_with(vec![vec![], vec![]]);
        fill_window(&mut engine, 3);
        engine.run_iteration().unwrap();
        fill_window(&mut engine, 3);
        engine.run_iteration().unwrap();

        let hang = Segment {
            text: "!!!".to_string(),
            tokens: vec![token("!", 1800, 2800), token("!", 2800, 3600)],
            no_speech_probability: 0.9,
            speaker_turn: false,
        };
        let segs = vec![
            useful_segment("real words here", vec![token("real", 0, 1000), token("words", 1000, 1800)]),
            hang,
        ];
        let mut engine = swap_model(engine, vec![segs]);
        fill_window(&mut engine, 3);
        let before = engine.committed_pos_bytes();
        engine.run_iteration().unwrap();
        assert!(engine.committed_pos_bytes() > before, "hang override should force forward progress");
    }

    #[test]
    fn speaker_flip_only_applies_to_useful_segments() {
        // A leading hanging segment with `speaker_turn` set must not flip the speaker; only the
        // trailing useful segment (no flag) should, so both come out on the initial `"<"` side.
        let hang = Segment {
            text: "!!!".to_string(),
            tokens: vec![token("!", 0, 800)],
            no_speech_probability: 0.9,
            speaker_turn: true,
        };
        let mut engine = engine_with(vec![vec![], vec![], vec![hang, useful_segment(
            "ok then",
            vec![token("ok", 1000, 1600), token("then", 1600, 2200)],
        )]]);
        fill_window(&mut engine, 3);
        engine.run_iteration().unwrap();
        fill_window(&mut engine, 3);
        engine.run_iteration().unwrap();
        fill_window(&mut engine, 3);
        let out = engine.run_iteration().unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].variants[0].tokens[0].speaker, "<");
    }

    /// Test helper: rebuilds an engine with the same warmed-up counters but a fresh scripted
    /// model, since `ScriptedModel`'s batches are consumed in order.
    fn swap_model(mut old: TestEngine, batches: Vec<Vec<Segment>>) -> TestEngine {
        old.model = Box::new(ScriptedModel::new(batches));
        old
    }
}
