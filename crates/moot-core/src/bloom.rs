//! Fixed-capacity Bloom filter for anti-entropy windows
//!
//! Classic counting-free Bloom filter. The bit count `m` and hash count `k`
//! are derived from the target capacity `n` and false-positive rate `p`
//! with the standard formulas; the `k` indexes are produced by double
//! hashing over the two 64-bit stripes of a BLAKE3 digest.

use crate::error::{Error, Result};

/// Upper bound accepted when deserializing a peer's filter.
const MAX_BITS: u32 = 1 << 24;

/// A fixed-capacity Bloom filter over packet bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u32,
    num_hashes: u32,
    capacity: u32,
    count: u32,
}

impl BloomFilter {
    /// Create a filter sized for `capacity` items at `error_rate` false
    /// positives.
    pub fn new(capacity: u32, error_rate: f64) -> Self {
        let capacity = capacity.max(1);
        let error_rate = error_rate.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;
        // m = -n ln p / (ln 2)^2, k = (m / n) ln 2
        let num_bits = ((-(capacity as f64) * error_rate.ln()) / (ln2 * ln2)).ceil() as u32;
        let num_bits = num_bits.max(8);
        let num_hashes = (((num_bits as f64 / capacity as f64) * ln2).round() as u32).max(1);
        Self {
            bits: vec![0u8; num_bits.div_ceil(8) as usize],
            num_bits,
            num_hashes,
            capacity,
            count: 0,
        }
    }

    fn stripes(item: &[u8]) -> (u64, u64) {
        let digest = blake3::hash(item);
        let bytes = digest.as_bytes();
        let mut first = [0u8; 8];
        let mut second = [0u8; 8];
        first.copy_from_slice(&bytes[0..8]);
        second.copy_from_slice(&bytes[8..16]);
        (u64::from_le_bytes(first), u64::from_le_bytes(second))
    }

    fn set_bit(&mut self, index: u32) {
        self.bits[(index / 8) as usize] |= 1 << (index % 8);
    }

    fn bit(&self, index: u32) -> bool {
        self.bits[(index / 8) as usize] & (1 << (index % 8)) != 0
    }

    /// Insert an item. The bits are always set; once the insert count
    /// exceeds the configured capacity the soft `Saturated` error reports
    /// that the caller should have opened a new window.
    pub fn add(&mut self, item: &[u8]) -> Result<()> {
        let (h1, h2) = Self::stripes(item);
        for i in 0..self.num_hashes as u64 {
            let index = (h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits as u64) as u32;
            self.set_bit(index);
        }
        self.count += 1;
        if self.count > self.capacity {
            return Err(Error::Saturated {
                count: self.count as usize,
                capacity: self.capacity as usize,
            });
        }
        Ok(())
    }

    /// Membership test; false positives are possible, false negatives not.
    pub fn contains(&self, item: &[u8]) -> bool {
        let (h1, h2) = Self::stripes(item);
        (0..self.num_hashes as u64).all(|i| {
            let index = (h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits as u64) as u32;
            self.bit(index)
        })
    }

    pub fn is_saturated(&self) -> bool {
        self.count > self.capacity
    }

    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Serialize: `num_bits ‖ num_hashes ‖ capacity ‖ count ‖ bit array`,
    /// all integers big-endian u32.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.bits.len());
        out.extend_from_slice(&self.num_bits.to_be_bytes());
        out.extend_from_slice(&self.num_hashes.to_be_bytes());
        out.extend_from_slice(&self.capacity.to_be_bytes());
        out.extend_from_slice(&self.count.to_be_bytes());
        out.extend_from_slice(&self.bits);
        out
    }

    /// Deserialize a peer's filter, validating the header against the bit
    /// array length.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 16 {
            return Err(Error::MalformedFilter(format!("{} header bytes", data.len())));
        }
        let mut word = [0u8; 4];
        word.copy_from_slice(&data[0..4]);
        let num_bits = u32::from_be_bytes(word);
        word.copy_from_slice(&data[4..8]);
        let num_hashes = u32::from_be_bytes(word);
        word.copy_from_slice(&data[8..12]);
        let capacity = u32::from_be_bytes(word);
        word.copy_from_slice(&data[12..16]);
        let count = u32::from_be_bytes(word);

        if num_bits == 0 || num_bits > MAX_BITS {
            return Err(Error::MalformedFilter(format!("{} bits", num_bits)));
        }
        if num_hashes == 0 || num_hashes > 64 {
            return Err(Error::MalformedFilter(format!("{} hashes", num_hashes)));
        }
        let bits = data[16..].to_vec();
        if bits.len() != num_bits.div_ceil(8) as usize {
            return Err(Error::MalformedFilter(format!(
                "{} bit-array bytes for {} bits",
                bits.len(),
                num_bits
            )));
        }
        Ok(Self {
            bits,
            num_bits,
            num_hashes,
            capacity: capacity.max(1),
            count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_false_negatives() {
        let mut filter = BloomFilter::new(100, 0.01);
        for i in 0u32..100 {
            filter.add(&i.to_be_bytes()).unwrap();
        }
        for i in 0u32..100 {
            assert!(filter.contains(&i.to_be_bytes()));
        }
    }

    #[test]
    fn test_mostly_negative_for_absent_items() {
        let mut filter = BloomFilter::new(100, 0.01);
        for i in 0u32..100 {
            filter.add(&i.to_be_bytes()).unwrap();
        }
        let false_positives = (1000u32..2000)
            .filter(|i| filter.contains(&i.to_be_bytes()))
            .count();
        // Target rate is 1%; leave generous slack for hash variance.
        assert!(false_positives < 50, "{} false positives", false_positives);
    }

    #[test]
    fn test_saturation_is_soft() {
        let mut filter = BloomFilter::new(2, 0.01);
        filter.add(b"a").unwrap();
        filter.add(b"b").unwrap();
        let result = filter.add(b"c");
        assert!(matches!(result, Err(Error::Saturated { .. })));
        // Reads still work after saturation.
        assert!(filter.contains(b"c"));
        assert!(filter.is_saturated());
    }

    #[test]
    fn test_serialization_round_trip() {
        let mut filter = BloomFilter::new(50, 0.001);
        filter.add(b"packet-one").unwrap();
        filter.add(b"packet-two").unwrap();
        let restored = BloomFilter::from_bytes(&filter.to_bytes()).unwrap();
        assert_eq!(restored, filter);
        assert!(restored.contains(b"packet-one"));
        assert!(restored.contains(b"packet-two"));
    }

    #[test]
    fn test_malformed_rejected() {
        assert!(BloomFilter::from_bytes(&[1, 2, 3]).is_err());
        let mut data = BloomFilter::new(10, 0.01).to_bytes();
        data.pop();
        assert!(BloomFilter::from_bytes(&data).is_err());
    }
}
