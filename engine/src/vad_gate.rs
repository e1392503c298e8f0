//! Resamples the pending window to the VAD's declared format and asks it where the next voice
//! region starts, trimming silence from the head of the window before it reaches the model (§4.3).

use crate::pcm;
use std::time::Duration;

/// Minimum contiguous voiced run the gate requires before trusting a window as speech.
pub const MIN_VOICE_DURATION: Duration = Duration::from_millis(150);

/// The external VAD primitive this crate treats as a black box (§6): `encoding()`/`channels()`
/// describe the format callers must resample to; `find_next_voice` reports the strongest
/// confidence seen and where a qualifying voiced run begins.
pub trait VadSource: Send {
    fn encoding(&self) -> &'static str;
    fn channels(&self) -> u16;
    fn find_next_voice(&self, samples: &[i16], threshold: f32, min_duration: Duration) -> (f32, Duration);
}

/// Always reports full-confidence voice at offset zero. Used in tests and whenever the caller
/// passes `vad_threshold <= 0.0`, i.e. the gate is disabled.
pub struct DummyVad;

impl VadSource for DummyVad {
    fn encoding(&self) -> &'static str {
        "pcm_s16le"
    }
    fn channels(&self) -> u16 {
        1
    }
    fn find_next_voice(&self, _samples: &[i16], _threshold: f32, _min_duration: Duration) -> (f32, Duration) {
        (1.0, Duration::ZERO)
    }
}

/// Backed by `shared_vad`'s `earshot`-based detector. The engine's native format (16kHz mono)
/// already matches what `shared_vad` requires, so the "resample" step below is the identity
/// float32-to-i16 conversion; a future VAD backend with a different declared rate would need a
/// real resampler behind this same trait.
pub struct EarshotVad;

impl VadSource for EarshotVad {
    fn encoding(&self) -> &'static str {
        "pcm_s16le"
    }
    fn channels(&self) -> u16 {
        shared_vad::NATIVE_CHANNELS
    }
    fn find_next_voice(&self, samples: &[i16], threshold: f32, min_duration: Duration) -> (f32, Duration) {
        shared_vad::find_next_voice(samples, threshold, min_duration)
    }
}

/// Converts native f32 samples (range roughly [-1, 1]) to the VAD's i16 format.
pub fn to_vad_samples(f32_samples: &[f32]) -> Vec<i16> {
    f32_samples.iter().map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16).collect()
}

/// What the commitment engine should do with the pending window before decoding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// Trim this many bytes from the head of the window before decode.
    TrimHead(u64),
    /// The whole window is silence; caller discards it, keeping only the preserve-heading tail.
    Silence,
}

/// Applies the gate to a pending window about to be decoded. `window_start_bytes` is the
/// absolute byte offset (since engine start) of `pending_bytes[0]`. `vad_voice_found_at` is the
/// cached absolute time of the last confirmed voice onset; if the window starts at or before it,
/// the gate is a no-op (already-confirmed voice doesn't need rescanning).
pub fn apply(
    vad: &dyn VadSource,
    threshold: f32,
    window_start_bytes: u64,
    pending_bytes: &[u8],
    vad_voice_found_at: &mut Option<Duration>,
) -> GateOutcome {
    let window_start = pcm::duration_for_bytes(window_start_bytes);
    if let Some(found_at) = *vad_voice_found_at {
        if window_start <= found_at {
            return GateOutcome::TrimHead(0);
        }
    }

    let samples = pcm::bytes_to_f32_samples(pending_bytes);
    let i16_samples = to_vad_samples(&samples);
    let (max_confidence, offset_into_window) = vad.find_next_voice(&i16_samples, threshold, MIN_VOICE_DURATION);

    if max_confidence <= threshold {
        return GateOutcome::Silence;
    }

    let found_at = window_start + offset_into_window;
    *vad_voice_found_at = Some(found_at);

    let preserve_from = found_at.saturating_sub(pcm::PRESERVE_HEADING);
    let trim_relative = preserve_from.saturating_sub(window_start);
    GateOutcome::TrimHead(pcm::bytes_for_duration(trim_relative))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dummy_vad_never_gates() {
        let vad = DummyVad;
        let mut found_at = None;
        let pending = vec![0u8; pcm::BYTES_PER_SECOND as usize * 2];
        let outcome = apply(&vad, 0.0, 0, &pending, &mut found_at);
        assert_eq!(outcome, GateOutcome::TrimHead(0));
    }

    #[test]
    fn cached_voice_found_before_window_skips_rescan() {
        struct PanicsIfCalled;
        impl VadSource for PanicsIfCalled {
            fn encoding(&self) -> &'static str {
                "pcm_s16le"
            }
            fn channels(&self) -> u16 {
                1
            }
            fn find_next_voice(&self, _: &[i16], _: f32, _: Duration) -> (f32, Duration) {
                panic!("should not rescan")
            }
        }
        let vad = PanicsIfCalled;
        let mut found_at = Some(Duration::from_secs(10));
        let pending = vec![0u8; pcm::BYTES_PER_SECOND as usize];
        let outcome = apply(&vad, 0.5, pcm::bytes_for_duration(Duration::from_secs(5)), &pending, &mut found_at);
        assert_eq!(outcome, GateOutcome::TrimHead(0));
    }

    #[test]
    fn silence_below_threshold_is_reported() {
        struct AlwaysSilent;
        impl VadSource for AlwaysSilent {
            fn encoding(&self) -> &'static str {
                "pcm_s16le"
            }
            fn channels(&self) -> u16 {
                1
            }
            fn find_next_voice(&self, _: &[i16], _: f32, _: Duration) -> (f32, Duration) {
                (0.1, Duration::ZERO)
            }
        }
        let vad = AlwaysSilent;
        let mut found_at = None;
        let pending = vec![0u8; pcm::BYTES_PER_SECOND as usize];
        let outcome = apply(&vad, 0.5, 0, &pending, &mut found_at);
        assert_eq!(outcome, GateOutcome::Silence);
        assert!(found_at.is_none());
    }

    #[test]
    fn voiced_window_trims_to_preserve_heading() {
        struct VoiceAt2s;
        impl VadSource for VoiceAt2s {
            fn encoding(&self) -> &'static str {
                "pcm_s16le"
            }
            fn channels(&self) -> u16 {
                1
            }
            fn find_next_voice(&self, _: &[i16], _: f32, _: Duration) -> (f32, Duration) {
                (0.9, Duration::from_secs(2))
            }
        }
        let vad = VoiceAt2s;
        let mut found_at = None;
        let pending = vec![0u8; pcm::BYTES_PER_SECOND as usize * 4];
        let outcome = apply(&vad, 0.5, 0, &pending, &mut found_at);
        // voice found at 2s, preserve 1s heading => trim to 1s => 1 * BYTES_PER_SECOND
        assert_eq!(outcome, GateOutcome::TrimHead(pcm::BYTES_PER_SECOND));
        assert_eq!(found_at, Some(Duration::from_secs(2)));
    }
}
