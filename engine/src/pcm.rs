//! Byte <-> wall-clock conversions for the engine's fixed native encoding:
//! 32-bit float, little-endian, mono, 16 000 Hz.

use std::time::Duration;

/// Bytes per sample (f32 LE).
pub const BYTES_PER_SAMPLE: u64 = 4;
/// Native sample rate.
pub const SAMPLE_RATE: u64 = 16_000;
/// Bytes/second at the native encoding.
pub const BYTES_PER_SECOND: u64 = SAMPLE_RATE * BYTES_PER_SAMPLE;

/// Ring-buffer hard ceiling: 120s worth of audio.
pub const BUFFER_LIMIT_BYTES: u64 = 120 * BYTES_PER_SECOND;
/// Minimum pending bytes required before an iteration decodes.
pub const REQUIRED_FRAME_BYTES: u64 = 2 * BYTES_PER_SECOND;
/// Lead-in kept when the engine discards a window for silence or stalls.
pub const PRESERVE_HEADING: Duration = Duration::from_secs(1);
/// Tail-silence length after which the final segment of a window is trusted.
pub const GAP_TO_COMMIT: Duration = Duration::from_secs(2);
/// Consecutive useless iterations before a forced discard.
pub const DISCARD_IF_NO_USEFUL: u32 = 4;
/// Cadence of the commitment engine's background worker.
pub const ITERATION_INTERVAL: Duration = Duration::from_secs(1);
/// Silent-tail-attachment correction window (see DESIGN.md open question).
pub const SILENT_TAIL_CORRECTION: Duration = Duration::from_millis(500);

/// Converts a duration to a byte offset, rounding toward zero, always sample-aligned.
pub fn bytes_for_duration(d: Duration) -> u64 {
    let bytes = (d.as_nanos() * BYTES_PER_SECOND as u128) / 1_000_000_000u128;
    let bytes = bytes as u64;
    bytes - (bytes % BYTES_PER_SAMPLE)
}

/// Converts a byte offset to a duration. Exact integer math; no drift.
pub fn duration_for_bytes(bytes: u64) -> Duration {
    Duration::from_nanos(bytes * 1_000_000_000 / BYTES_PER_SECOND)
}

/// True iff `n` is a whole number of samples.
pub fn is_sample_aligned(n: u64) -> bool {
    n % BYTES_PER_SAMPLE == 0
}

/// Reinterprets a sample-aligned byte buffer as `f32` samples (copying, never transmuting in
/// place -- the decoding slot and the sample slice have decoupled lifetimes once decode is
/// offloaded to a blocking thread).
pub fn bytes_to_f32_samples(bytes: &[u8]) -> Vec<f32> {
    debug_assert!(is_sample_aligned(bytes.len() as u64));
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_is_exact_at_second_boundaries() {
        for secs in 0..130 {
            let bytes = bytes_for_duration(Duration::from_secs(secs));
            assert_eq!(bytes, secs * BYTES_PER_SECOND);
            assert_eq!(duration_for_bytes(bytes), Duration::from_secs(secs));
        }
    }

    #[test]
    fn bytes_for_duration_rounds_toward_zero_and_stays_aligned() {
        let d = Duration::from_nanos(1_234_567);
        let bytes = bytes_for_duration(d);
        assert!(is_sample_aligned(bytes));
    }

    #[test]
    fn samples_round_trip() {
        let samples = [0.0f32, 0.5, -0.5, 1.0];
        let mut bytes = Vec::new();
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        assert_eq!(bytes_to_f32_samples(&bytes), samples);
    }
}
