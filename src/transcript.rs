//! Fiat–Shamir transcript for the transparent proof system.
//!
//! A [`Transcript`] records `u64` words and derives weights from a
//! domain-separated BLAKE2b-256 expansion of everything absorbed so far.  Every
//! weight is absorbed back into the transcript, so later weights depend
//! on earlier ones.  The transparent proof draws its batch-verification
//! weights here, after the trace they weight has been absorbed.

use blake2::digest::{consts::U32, Digest as _};

use crate::types::Digest;

type Blake2b256 = blake2::Blake2b<U32>;

const CHALLENGE_DOMAIN: &[u8] = b"QBRIDGE_CHALLENGE";
const STREAM_DOMAIN: &[u8] = b"QBRIDGE_STREAM";

/// Stateful weight derivation.
#[derive(Debug, Clone)]
pub struct Transcript {
    domain_tag: &'static [u8],
    words: Vec<u64>,
    counter: u64,
}

impl Transcript {
    /// Creates an empty transcript bound to `domain_tag`.
    pub fn new(domain_tag: &'static [u8]) -> Self {
        Self {
            domain_tag,
            words: Vec::new(),
            counter: 0,
        }
    }

    /// Absorbs a single word.
    pub fn append(&mut self, value: u64) {
        self.words.push(value);
    }

    /// Absorbs every word of `values`.
    pub fn append_slice(&mut self, values: &[u64]) {
        self.words.extend_from_slice(values);
    }

    /// Absorbs a 32-byte digest as four big-endian words.
    pub fn append_digest(&mut self, digest: &Digest) {
        for chunk in digest.chunks_exact(8) {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            self.words.push(u64::from_be_bytes(word));
        }
    }

    /// Derives the next 128-bit weight.  Never zero.
    pub fn weight(&mut self) -> u128 {
        let high = self.squeeze();
        let low = self.squeeze();
        self.words.push(high);
        self.words.push(low);
        (((high as u128) << 64) | low as u128).max(1)
    }

    /// Derives `count` weights.
    pub fn weights(&mut self, count: usize) -> Vec<u128> {
        (0..count).map(|_| self.weight()).collect()
    }

    fn squeeze(&mut self) -> u64 {
        let mut hasher = Blake2b256::new();
        hasher.update(CHALLENGE_DOMAIN);
        hasher.update((self.domain_tag.len() as u64).to_be_bytes());
        hasher.update(self.domain_tag);
        hasher.update(self.counter.to_be_bytes());
        hasher.update((self.words.len() as u64).to_be_bytes());
        for word in &self.words {
            hasher.update(word.to_be_bytes());
        }
        let seed = hasher.finalize();

        let mut stream = Blake2b256::new();
        stream.update(STREAM_DOMAIN);
        stream.update(seed);
        let out = stream.finalize();
        let mut chunk = [0u8; 8];
        chunk.copy_from_slice(&out[..8]);
        self.counter = self.counter.wrapping_add(1);
        u64::from_be_bytes(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_are_deterministic() {
        let mut a = Transcript::new(b"test");
        let mut b = Transcript::new(b"test");
        a.append_slice(&[1, 2, 3]);
        b.append_slice(&[1, 2, 3]);
        assert_eq!(a.weights(4), b.weights(4));
    }

    #[test]
    fn domain_and_history_separate_weights() {
        let mut a = Transcript::new(b"left");
        let mut b = Transcript::new(b"right");
        assert_ne!(a.weight(), b.weight());

        let mut c = Transcript::new(b"left");
        c.append_digest(&[7; 32]);
        let mut d = Transcript::new(b"left");
        d.append_digest(&[8; 32]);
        assert_ne!(c.weight(), d.weight());
    }

    #[test]
    fn successive_weights_differ() {
        let mut t = Transcript::new(b"seq");
        let weights = t.weights(16);
        for (i, w) in weights.iter().enumerate() {
            assert!(*w != 0);
            assert!(!weights[i + 1..].contains(w));
        }
    }
}
