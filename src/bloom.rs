//! Bloom filter gating sorted-run point lookups.
//!
//! Each sorted run carries a filter over all of its keys. A negative answer
//! is authoritative (no false negatives), so a miss skips the run without
//! touching its data blocks. Sizing follows the standard optimum for a
//! target false-positive rate `p` and capacity `n`:
//!
//! ```text
//! m = -n * ln(p) / (ln 2)^2      total bits
//! k = (m / n) * ln 2             hash functions
//! ```
//!
//! The k probe positions are derived with double hashing from a single
//! 128-bit xxh3 hash split into two 64-bit halves:
//! `h_i = h1 + i * h2 (mod m)`.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use xxhash_rust::xxh3::xxh3_128;

use crate::error::{Error, Result};

pub const DEFAULT_FP_RATE: f64 = 0.01;

#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Create a filter sized for `expected_keys` at the given false-positive
    /// rate. The rate must be in (0, 1); a zero capacity is clamped to one.
    pub fn new(expected_keys: usize, fp_rate: f64) -> Self {
        let n = expected_keys.max(1) as f64;
        let rate = fp_rate.clamp(f64::MIN_POSITIVE, 0.5);

        let ln2 = std::f64::consts::LN_2;
        let num_bits = ((-n * rate.ln()) / (ln2 * ln2)).ceil().max(64.0) as u64;
        let num_hashes = ((num_bits as f64 / n) * ln2).ceil().max(1.0) as u32;

        let words = num_bits.div_ceil(64) as usize;
        Self {
            bits: vec![0u64; words],
            num_bits,
            num_hashes,
        }
    }

    /// Record a key. Called once per unique key while a run is built.
    pub fn add(&mut self, key: &[u8]) {
        let (h1, h2) = Self::hash(key);
        for i in 0..self.num_hashes {
            let pos = self.position(h1, h2, i);
            self.bits[(pos / 64) as usize] |= 1 << (pos % 64);
        }
    }

    /// false means the key is definitely absent; true means possibly present.
    pub fn might_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = Self::hash(key);
        for i in 0..self.num_hashes {
            let pos = self.position(h1, h2, i);
            if self.bits[(pos / 64) as usize] >> (pos % 64) & 1 == 0 {
                return false;
            }
        }
        true
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Serialized layout: `[num_bits: u64][num_hashes: u32][word_count: u32]`
    /// followed by `word_count` big-endian u64 words.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.bits.len() * 8);
        buf.write_u64::<BigEndian>(self.num_bits).unwrap();
        buf.write_u32::<BigEndian>(self.num_hashes).unwrap();
        buf.write_u32::<BigEndian>(self.bits.len() as u32).unwrap();
        for word in &self.bits {
            buf.write_u64::<BigEndian>(*word).unwrap();
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(buf);
        let num_bits = cursor.read_u64::<BigEndian>()?;
        let num_hashes = cursor.read_u32::<BigEndian>()?;
        let word_count = cursor.read_u32::<BigEndian>()? as u64;

        if word_count != num_bits.div_ceil(64) {
            return Err(Error::Corruption(format!(
                "bloom filter word count {} does not match {} bits",
                word_count, num_bits
            )));
        }
        if buf.len() != 16 + word_count as usize * 8 {
            return Err(Error::Corruption(format!(
                "bloom filter length {} does not match header",
                buf.len()
            )));
        }

        let mut bits = Vec::with_capacity(word_count as usize);
        for _ in 0..word_count {
            bits.push(cursor.read_u64::<BigEndian>()?);
        }

        Ok(Self {
            bits,
            num_bits,
            num_hashes,
        })
    }

    fn hash(key: &[u8]) -> (u64, u64) {
        let h = xxh3_128(key);
        (h as u64, (h >> 64) as u64)
    }

    fn position(&self, h1: u64, h2: u64, i: u32) -> u64 {
        h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership() {
        let mut filter = BloomFilter::new(100, 0.01);
        filter.add(b"apple");
        filter.add(b"banana");

        assert!(filter.might_contain(b"apple"));
        assert!(filter.might_contain(b"banana"));
        assert!(!filter.might_contain(b"cherry"));
    }

    #[test]
    fn test_no_false_negatives() {
        let mut filter = BloomFilter::new(1000, 0.01);
        let keys: Vec<Vec<u8>> = (0..1000)
            .map(|i| format!("key_{:04}", i).into_bytes())
            .collect();

        for key in &keys {
            filter.add(key);
        }
        for key in &keys {
            assert!(filter.might_contain(key), "false negative for {:?}", key);
        }
    }

    #[test]
    fn test_false_positive_rate_near_target() {
        let mut filter = BloomFilter::new(10_000, 0.01);
        for i in 0..10_000 {
            filter.add(format!("present_{:05}", i).as_bytes());
        }

        let mut false_positives = 0;
        let probes = 10_000;
        for i in 0..probes {
            if filter.might_contain(format!("absent_{:05}", i).as_bytes()) {
                false_positives += 1;
            }
        }

        // 1% target; allow generous slack to keep the test deterministic-ish.
        assert!(
            false_positives < probes / 20,
            "false positive rate too high: {}/{}",
            false_positives,
            probes
        );
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut filter = BloomFilter::new(500, 0.01);
        for i in 0..500 {
            filter.add(format!("key_{}", i).as_bytes());
        }

        let decoded = BloomFilter::decode(&filter.encode()).expect("decode failed");
        assert_eq!(decoded.num_bits(), filter.num_bits());
        assert_eq!(decoded.num_hashes(), filter.num_hashes());
        for i in 0..500 {
            assert!(decoded.might_contain(format!("key_{}", i).as_bytes()));
        }
    }

    #[test]
    fn test_decode_truncated() {
        let mut filter = BloomFilter::new(100, 0.01);
        filter.add(b"key");
        let mut buf = filter.encode();
        buf.truncate(buf.len() - 4);

        assert!(matches!(
            BloomFilter::decode(&buf),
            Err(crate::Error::Corruption(_))
        ));
    }

    #[test]
    fn test_sizing_formulas() {
        let filter = BloomFilter::new(1000, 0.01);
        // m = -1000 * ln(0.01) / ln(2)^2 ~ 9586, k = m/n * ln 2 ~ 7
        assert!(filter.num_bits() >= 9585 && filter.num_bits() <= 9600);
        assert_eq!(filter.num_hashes(), 7);
    }
}
