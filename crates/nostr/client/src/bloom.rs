//! Seeded bloom filter with lock-free inserts.
//!
//! The bit array only ever has bits turned on (`fetch_or`), so any number of
//! tasks may insert and query concurrently through `&self`.
//!
//! Positions come from one 128-bit MurmurHash3 per element, split into two
//! 64-bit halves and combined with double hashing: `h(i) = h1 + i * h2`.
//! The caller supplied seed is the murmur seed, so the same element inserted
//! under two seeds sets independent bit patterns.

use std::f64::consts::LN_2;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const WORD_BITS: usize = 64;

/// Fixed-size probabilistic set.
#[derive(Debug)]
pub struct BloomFilter {
    words: Box<[AtomicU64]>,
    size_bits: usize,
    hash_rounds: usize,
    inserted: AtomicUsize,
}

impl BloomFilter {
    /// Create a filter with `size_bits` bits and `hash_rounds` positions per
    /// element.
    pub fn new(size_bits: usize, hash_rounds: usize) -> Self {
        let size_bits = size_bits.max(WORD_BITS);
        let word_count = size_bits.div_ceil(WORD_BITS);
        let words = (0..word_count).map(|_| AtomicU64::new(0)).collect();
        Self {
            words,
            size_bits,
            hash_rounds: hash_rounds.max(1),
            inserted: AtomicUsize::new(0),
        }
    }

    /// Create a filter sized for `expected_elements` at a fixed number of
    /// hash rounds, using the bit count that is optimal for that round count:
    /// `m = k * n / ln 2`.
    pub fn with_capacity(expected_elements: usize, hash_rounds: usize) -> Self {
        let n = expected_elements.max(1) as f64;
        let k = hash_rounds.max(1) as f64;
        let size_bits = (k * n / LN_2).ceil() as usize;
        Self::new(size_bits, hash_rounds)
    }

    /// Insert `element` under `seed`.
    pub fn insert(&self, element: &[u8], seed: u32) {
        for pos in self.positions(element, seed) {
            let mask = 1u64 << (pos % WORD_BITS);
            self.words[pos / WORD_BITS].fetch_or(mask, Ordering::Relaxed);
        }
        self.inserted.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether `element` may have been inserted under `seed`.
    ///
    /// Never returns `false` for an element that was inserted with the same
    /// seed.
    pub fn contains(&self, element: &[u8], seed: u32) -> bool {
        self.positions(element, seed).all(|pos| {
            let mask = 1u64 << (pos % WORD_BITS);
            self.words[pos / WORD_BITS].load(Ordering::Relaxed) & mask != 0
        })
    }

    fn positions(&self, element: &[u8], seed: u32) -> impl Iterator<Item = usize> + use<> {
        let hash = murmur3::murmur3_x64_128(&mut Cursor::new(element), seed).unwrap_or(0);
        let h1 = hash as u64;
        // An even h2 would cycle through fewer positions on power-of-two sizes.
        let h2 = ((hash >> 64) as u64) | 1;
        let m = self.size_bits as u64;
        (0..self.hash_rounds as u64)
            .map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % m) as usize)
    }

    /// Size in bits.
    pub fn size_bits(&self) -> usize {
        self.size_bits
    }

    /// Hash rounds per element.
    pub fn hash_rounds(&self) -> usize {
        self.hash_rounds
    }

    /// Number of insert calls so far, duplicates included.
    pub fn inserted(&self) -> usize {
        self.inserted.load(Ordering::Relaxed)
    }

    /// Number of bits currently set.
    pub fn bits_set(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    /// Estimated false positive rate at the current fill:
    /// `(1 - e^(-kn/m))^k`.
    pub fn estimated_false_positive_rate(&self) -> f64 {
        let k = self.hash_rounds as f64;
        let n = self.inserted() as f64;
        let m = self.size_bits as f64;
        (1.0 - (-k * n / m).exp()).powf(k)
    }
}
