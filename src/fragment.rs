//! Outbound payload fragmentation
//!
//! Splits a message into pieces that each fit in one ATT write.

use std::num::NonZeroUsize;

/// Split `payload` into consecutive chunks of at most `max_chunk` bytes.
///
/// An empty payload produces no chunks. Every chunk except possibly the last
/// is exactly `max_chunk` bytes long.
pub fn split(payload: &[u8], max_chunk: NonZeroUsize) -> Fragments<'_> {
    Fragments {
        remaining: payload,
        max_chunk: max_chunk.get(),
    }
}

/// Lazy, single-pass iterator returned by [`split`].
#[derive(Debug)]
pub struct Fragments<'a> {
    remaining: &'a [u8],
    max_chunk: usize,
}

impl<'a> Iterator for Fragments<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining.is_empty() {
            return None;
        }
        let take = self.remaining.len().min(self.max_chunk);
        let (chunk, rest) = self.remaining.split_at(take);
        self.remaining = rest;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining.len().div_ceil(self.max_chunk);
        (n, Some(n))
    }
}

impl ExactSizeIterator for Fragments<'_> {}

impl std::iter::FusedIterator for Fragments<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn nz(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn test_empty_payload_yields_nothing() {
        let mut chunks = split(&[], nz(20));
        assert_eq!(chunks.len(), 0);
        assert!(chunks.next().is_none());
    }

    #[test]
    fn test_single_short_chunk() {
        let chunks: Vec<&[u8]> = split(b"Hello\r\n", nz(20)).collect();
        assert_eq!(chunks, vec![&b"Hello\r\n"[..]]);
    }

    #[test]
    fn test_exact_multiple_has_no_empty_tail() {
        let payload = [7u8; 40];
        let chunks: Vec<&[u8]> = split(&payload, nz(20)).collect();
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.len() == 20));
    }

    #[test]
    fn test_forty_seven_bytes_in_three_chunks() {
        let payload: Vec<u8> = (0..47).collect();
        let fragments = split(&payload, nz(20));
        assert_eq!(fragments.len(), 3);

        let lens: Vec<usize> = fragments.map(<[u8]>::len).collect();
        assert_eq!(lens, vec![20, 20, 7]);
    }

    #[test]
    fn test_concatenation_reproduces_payload() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        for k in [1, 3, 20, 244, 999, 1000, 4096] {
            let chunks: Vec<&[u8]> = split(&payload, nz(k)).collect();
            let (last, body) = chunks.split_last().unwrap();
            assert!(body.iter().all(|c| c.len() == k), "chunk size {}", k);
            assert!(!last.is_empty() && last.len() <= k);
            assert_eq!(chunks.concat(), payload);
        }
    }
}
