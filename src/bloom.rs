//! Bloom filter for table probes.
//!
//! Sized from an expected element count and a target false-positive rate.
//! Membership tests never report a false negative. The filter is not yet
//! consulted by SSTable reads; wiring it in will extend the table format
//! with a metaindex block.

use xxhash_rust::xxh3::xxh3_128;

struct BitArray {
    bits: Vec<u8>,
}

impl BitArray {
    fn new(size: u64) -> Self {
        Self {
            bits: vec![0u8; ((size + 7) / 8) as usize],
        }
    }

    fn set(&mut self, idx: u64) {
        self.bits[(idx / 8) as usize] |= 1 << (idx % 8);
    }

    fn get(&self, idx: u64) -> bool {
        self.bits[(idx / 8) as usize] & (1 << (idx % 8)) != 0
    }
}

pub struct Bloom {
    bits: BitArray,
    /// Number of probes per key.
    k: u64,
    /// Bit array length.
    m: u64,
}

impl Bloom {
    /// Create a filter for `n` expected elements at false-positive rate `p`.
    pub fn new(n: u64, p: f64) -> Self {
        let m = (-(n as f64 * p.ln()) / (2f64.ln() * 2f64.ln())).ceil() as u64;
        let m = m.max(8);
        let k = ((m as f64 / n as f64) * 2f64.ln()).round() as u64;
        let k = k.clamp(1, 30);
        Self {
            bits: BitArray::new(m),
            k,
            m,
        }
    }

    /// Probe indexes via double hashing over the two halves of xxh3-128.
    fn probes(&self, key: &[u8]) -> impl Iterator<Item = u64> + '_ {
        let hash = xxh3_128(key);
        let h1 = hash as u64;
        let h2 = (hash >> 64) as u64;
        (0..self.k).map(move |i| (h1.wrapping_add(i.wrapping_mul(h2))) % self.m)
    }

    pub fn add(&mut self, key: &[u8]) {
        let indexes: Vec<u64> = self.probes(key).collect();
        for idx in indexes {
            self.bits.set(idx);
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.probes(key).all(|idx| self.bits.get(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_false_negatives() {
        let mut bloom = Bloom::new(1000, 0.01);
        let keys: Vec<Vec<u8>> = (0..1000).map(|i| format!("key-{i}").into_bytes()).collect();
        for key in &keys {
            bloom.add(key);
        }
        for key in &keys {
            assert!(bloom.contains(key));
        }
    }

    #[test]
    fn test_false_positive_rate_is_bounded() {
        let mut bloom = Bloom::new(10_000, 0.01);
        for i in 0..10_000 {
            bloom.add(format!("member-{i}").as_bytes());
        }

        let mut false_positives = 0;
        let trials = 10_000;
        for i in 0..trials {
            if bloom.contains(format!("absent-{i}").as_bytes()) {
                false_positives += 1;
            }
        }
        // Allow generous slack over the 1% target.
        assert!(
            false_positives < trials / 20,
            "false positive rate too high: {false_positives}/{trials}"
        );
    }

    #[test]
    fn test_empty_filter_rejects() {
        let bloom = Bloom::new(100, 0.01);
        assert!(!bloom.contains(b"anything"));
    }
}
