use earshot::Detector;
use std::time::Duration;

const EARSHOT_FRAME: usize = 256; // 16ms at 16kHz
const EARSHOT_MS: usize = 16;

/// Sample rate this VAD's `earshot` detector requires.
pub const NATIVE_SAMPLE_RATE: u32 = 16_000;
/// Channel count this VAD's detector requires.
pub const NATIVE_CHANNELS: u16 = 1;
/// Bytes per sample in the PCM format this VAD consumes (signed 16-bit).
pub const NATIVE_SAMPLE_SIZE_BYTES: u32 = 2;

pub struct Vad {
    detector: Detector,
    probabilities: Vec<f32>, // for earshot-native 16ms chunks
    leftovers: Vec<i16>,     // samples not yet divisible by 16ms
}

impl Default for Vad {
    fn default() -> Self {
        Self::new()
    }
}

impl Vad {
    pub fn new() -> Self {
        Self {
            detector: Detector::default(),
            probabilities: Vec::new(),
            leftovers: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.detector = Detector::default();
        self.probabilities.clear();
        self.leftovers.clear();
    }

    pub fn consume(&mut self, samples: &[i16]) {
        let mut pos = 0;

        if !self.leftovers.is_empty() {
            let need = EARSHOT_FRAME - self.leftovers.len();
            if samples.len() < need {
                self.leftovers.extend_from_slice(samples);
                return; // still not enough
            }
            self.leftovers.extend_from_slice(&samples[..need]);
            self.probabilities
                .push(self.detector.predict_i16(&self.leftovers));
            self.leftovers.clear();
            pos = need;
        }

        while pos + EARSHOT_FRAME <= samples.len() {
            let chunk = &samples[pos..(pos + EARSHOT_FRAME)];
            self.probabilities.push(self.detector.predict_i16(chunk));
            pos += EARSHOT_FRAME;
        }

        if pos < samples.len() {
            self.leftovers.extend_from_slice(&samples[pos..]);
        }
    }

    pub fn probability_at_cs(&self, cs: i64) -> f32 {
        let t_ms = cs as f32 * 10.0;
        let probabilities_pos: f32 = t_ms / (EARSHOT_MS as f32);

        if self.probabilities.is_empty() {
            return 0.0;
        }

        if probabilities_pos <= 0.0 {
            return self.probabilities[0];
        }

        let lo = probabilities_pos.floor() as usize;
        if lo >= self.probabilities.len() - 1 {
            return self.end_p();
        }
        let lo_val = self.probabilities[lo];
        let hi_val = self.probabilities[lo + 1];
        let hi_weight = probabilities_pos - lo as f32;
        hi_val * hi_weight + lo_val * (1. - hi_weight)
    }

    pub fn end_p(&self) -> f32 {
        self.probabilities.last().copied().unwrap_or(0.0)
    }

    pub fn end_cs(&self) -> i64 {
        let t_ms = self.probabilities.len() * EARSHOT_MS;
        (t_ms as f32 / 10.).floor() as i64
    }
}

/// Scans `samples` (mono, 16kHz, i16) with a fresh detector for the earliest contiguous run of
/// frames at or above `threshold` lasting at least `min_duration`. Returns the highest
/// probability seen anywhere in `samples` and the offset where that run starts; if no run of
/// that length ever clears `threshold`, the offset is 0 and callers are expected to gate on the
/// confidence value instead (an all-silence window never qualifies regardless of offset).
///
/// Stateless by design: callers that already hold a running [`Vad`] use `consume`/`probability_at_cs`
/// instead; this is for one-shot "is there voice in this chunk" queries over a detached buffer.
pub fn find_next_voice(samples: &[i16], threshold: f32, min_duration: Duration) -> (f32, Duration) {
    let mut detector = Detector::default();
    let min_frames = ((min_duration.as_millis() as usize) + EARSHOT_MS - 1) / EARSHOT_MS;
    let min_frames = min_frames.max(1);

    let mut max_confidence = 0.0f32;
    let mut run_start: Option<usize> = None;
    let mut run_len = 0usize;
    let mut qualifying_start: Option<usize> = None;

    let frame_count = samples.len() / EARSHOT_FRAME;
    for frame_idx in 0..frame_count {
        let start = frame_idx * EARSHOT_FRAME;
        let chunk = &samples[start..start + EARSHOT_FRAME];
        let p = detector.predict_i16(chunk);
        if p > max_confidence {
            max_confidence = p;
        }

        if p >= threshold {
            if run_start.is_none() {
                run_start = Some(frame_idx);
            }
            run_len += 1;
            if qualifying_start.is_none() && run_len >= min_frames {
                qualifying_start = run_start;
            }
        } else {
            run_start = None;
            run_len = 0;
        }
    }

    let offset_ms = qualifying_start.unwrap_or(0) * EARSHOT_MS;
    (max_confidence, Duration::from_millis(offset_ms as u64))
}
