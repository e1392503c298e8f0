//! The single mutable PCM buffer split into a committed (discarded) prefix and a pending tail.

use crate::pcm::{is_sample_aligned, BUFFER_LIMIT_BYTES};
use tracing::debug;

/// Holds the audio not yet finalised. `committed_pos_bytes` is the cumulative count of bytes
/// that have been spliced away; it only ever grows.
#[derive(Default)]
pub struct SlidingBuffer {
    pending: Vec<u8>,
    committed_pos_bytes: u64,
}

impl SlidingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn committed_pos_bytes(&self) -> u64 {
        self.committed_pos_bytes
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Read-only view of the pending tail, for the VAD gate to analyze before it decides how
    /// much (if any) to trim off the front.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Appends audio bytes; enforces the hard ceiling (§4.4 "Hard ceiling") by halving the
    /// buffer and advancing `committed_pos_bytes` when the result would exceed it.
    pub fn append(&mut self, frame: &[u8]) {
        self.pending.extend_from_slice(frame);
        debug_assert!(is_sample_aligned(self.pending.len() as u64));

        if self.pending.len() as u64 > BUFFER_LIMIT_BYTES {
            let half = (BUFFER_LIMIT_BYTES / 2) as usize;
            let half = half - (half % 4);
            self.pending.drain(0..half);
            self.committed_pos_bytes += half as u64;
            debug!(new_committed = self.committed_pos_bytes, "buffer halved on overflow");
        }
    }

    /// Drains `pending` into a decoding slot; new writes keep accumulating into a fresh,
    /// empty `pending` while the caller decodes the returned slot.
    pub fn take_pending_for_decode(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }

    /// After a successful commit: keeps `decoded[bytes_diff..]`, concatenated with whatever
    /// arrived in `pending` while decode was running, as the new `pending`.
    pub fn splice_after_commit(&mut self, decoded: &[u8], bytes_diff: u64) {
        assert!(bytes_diff <= decoded.len() as u64, "commit point past decoded window");
        assert!(is_sample_aligned(bytes_diff), "commit point not sample-aligned");

        let mut spliced = Vec::with_capacity(decoded.len() - bytes_diff as usize + self.pending.len());
        spliced.extend_from_slice(&decoded[bytes_diff as usize..]);
        spliced.extend_from_slice(&self.pending);
        self.pending = spliced;
        self.committed_pos_bytes += bytes_diff;

        debug_assert!(is_sample_aligned(self.pending.len() as u64));
    }

    /// Discards the decoded window wholesale, keeping only its last `keep_bytes` (used by
    /// warm-up discard, the no-useful streak, and the VAD silence path).
    pub fn discard_decoded_keeping_tail(&mut self, decoded: &[u8], keep_bytes: u64) {
        let keep_bytes = keep_bytes.min(decoded.len() as u64) as usize;
        let keep_bytes = keep_bytes - (keep_bytes % 4);
        let discarded = decoded.len() - keep_bytes;

        let mut spliced = Vec::with_capacity(keep_bytes + self.pending.len());
        spliced.extend_from_slice(&decoded[discarded..]);
        spliced.extend_from_slice(&self.pending);
        self.pending = spliced;
        self.committed_pos_bytes += discarded as u64;
    }

    /// Drops up to `n` bytes from the front of `pending`, advancing `committed_pos_bytes` by
    /// however many were actually removed (used by the VAD gate to trim silence from the head
    /// of the window before decode, §4.3). Returns the amount actually dropped.
    pub fn cut_front(&mut self, n: u64) -> u64 {
        let n = (n as usize).min(self.pending.len());
        self.pending.drain(0..n);
        self.committed_pos_bytes += n as u64;
        n as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcm::BYTES_PER_SECOND;

    #[test]
    fn append_accumulates() {
        let mut buf = SlidingBuffer::new();
        buf.append(&[0u8; 8]);
        buf.append(&[0u8; 8]);
        assert_eq!(buf.pending_len(), 16);
        assert_eq!(buf.committed_pos_bytes(), 0);
    }

    #[test]
    fn overflow_halves_and_advances_commit() {
        let mut buf = SlidingBuffer::new();
        let chunk = vec![0u8; BUFFER_LIMIT_BYTES as usize + 4];
        buf.append(&chunk);
        assert!((buf.pending_len() as u64) <= BUFFER_LIMIT_BYTES);
        assert!(buf.committed_pos_bytes() > 0);
        assert_eq!(buf.committed_pos_bytes() % 4, 0);
    }

    #[test]
    fn take_pending_empties_buffer() {
        let mut buf = SlidingBuffer::new();
        buf.append(&[1, 2, 3, 4]);
        let slot = buf.take_pending_for_decode();
        assert_eq!(slot, vec![1, 2, 3, 4]);
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn splice_keeps_tail_and_new_arrivals() {
        let mut buf = SlidingBuffer::new();
        let decoded = vec![0u8; BYTES_PER_SECOND as usize];
        buf.append(&[9, 9, 9, 9]); // arrived during decode
        buf.splice_after_commit(&decoded, BYTES_PER_SECOND - 4);
        assert_eq!(buf.pending_len(), 4 + 4);
        assert_eq!(buf.committed_pos_bytes(), BYTES_PER_SECOND - 4);
    }

    #[test]
    fn cut_front_trims_and_advances_commit() {
        let mut buf = SlidingBuffer::new();
        buf.append(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let cut = buf.cut_front(4);
        assert_eq!(cut, 4);
        assert_eq!(buf.pending(), &[5, 6, 7, 8]);
        assert_eq!(buf.committed_pos_bytes(), 4);
    }

    #[test]
    fn cut_front_clamps_to_pending_len() {
        let mut buf = SlidingBuffer::new();
        buf.append(&[1, 2]);
        let cut = buf.cut_front(100);
        assert_eq!(cut, 2);
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn discard_keeps_only_requested_tail() {
        let mut buf = SlidingBuffer::new();
        let decoded = vec![0u8; BYTES_PER_SECOND as usize];
        buf.discard_decoded_keeping_tail(&decoded, 100);
        assert!(buf.pending_len() <= 100);
        assert_eq!(buf.pending_len() as u64 + buf.committed_pos_bytes(), BYTES_PER_SECOND);
    }
}
