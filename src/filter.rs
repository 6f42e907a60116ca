//! C1 — MembershipFilter: a bit-packed Bloom filter over task fingerprints.
//!
//! False positives are permitted; false negatives are forbidden. The filter
//! never removes bits (Bloom filters can't decrement) — see
//! [`MembershipFilter::rebuild_from`].

use parking_lot::RwLock;
use xxhash_rust::xxh3::xxh3_64_with_seed;

const SEED_A: u64 = 0;
const SEED_B: u64 = 0x9E37_79B9_7F4A_7C15;

/// Bit-packed membership filter sized from an expected cardinality and a
/// target false-positive rate.
pub struct MembershipFilter {
    bits: RwLock<Vec<u64>>,
    m: usize,
    k: usize,
}

impl MembershipFilter {
    /// Size a filter for `expected_n` items at false-positive rate `p`
    /// using the standard optimal `m`/`k` formulas.
    pub fn new(expected_n: usize, p_false_positive: f64) -> Self {
        let (m, k) = Self::size(expected_n, p_false_positive);
        Self::with_params(m, k)
    }

    fn size(expected_n: usize, p: f64) -> (usize, usize) {
        let n = (expected_n.max(1)) as f64;
        let p = p.clamp(1e-6, 0.5);
        let m = (-n * p.ln() / (std::f64::consts::LN_2 * std::f64::consts::LN_2)).ceil();
        let m = (m as usize).max(64);
        let k = ((m as f64 / n) * std::f64::consts::LN_2).ceil() as usize;
        let k = k.clamp(1, 32);
        (m, k)
    }

    fn with_params(m: usize, k: usize) -> Self {
        let words = m.div_ceil(64).max(1);
        Self {
            bits: RwLock::new(vec![0u64; words]),
            m: words * 64,
            k,
        }
    }

    fn positions(&self, fp: &str) -> impl Iterator<Item = usize> + '_ {
        let bytes = fp.as_bytes();
        let h_a = xxh3_64_with_seed(bytes, SEED_A);
        let h_b = xxh3_64_with_seed(bytes, SEED_B);
        let m = self.m as u64;
        (0..self.k).map(move |i| (h_a.wrapping_add((i as u64).wrapping_mul(h_b)) % m) as usize)
    }

    /// Insert a fingerprint.
    pub fn add(&self, fp: &str) {
        let mut bits = self.bits.write();
        for pos in self.positions(fp) {
            bits[pos / 64] |= 1u64 << (pos % 64);
        }
    }

    /// `maybe_present` (`true`) or `definitely_absent` (`false`).
    pub fn contains(&self, fp: &str) -> bool {
        let bits = self.bits.read();
        self.positions(fp).all(|pos| bits[pos / 64] & (1u64 << (pos % 64)) != 0)
    }

    /// Reset all bits to zero.
    pub fn clear(&self) {
        let mut bits = self.bits.write();
        bits.iter_mut().for_each(|w| *w = 0);
    }

    /// Rebuild this filter in place from the current live fingerprint set.
    /// The only way to drop stale bits, since Bloom filters can't remove
    /// a single entry without risking false negatives for its neighbours.
    pub fn rebuild_from<'a>(&self, fingerprints: impl Iterator<Item = &'a str>) {
        self.clear();
        for fp in fingerprints {
            self.add(fp);
        }
    }

    /// Fraction of bits currently set, used to decide whether a rebuild is
    /// due.
    pub fn fill_ratio(&self) -> f64 {
        let bits = self.bits.read();
        let set: u32 = bits.iter().map(|w| w.count_ones()).sum();
        set as f64 / self.m as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_false_negatives() {
        let filter = MembershipFilter::new(1000, 0.01);
        for i in 0..500 {
            filter.add(&format!("fp-{i}"));
        }
        for i in 0..500 {
            assert!(filter.contains(&format!("fp-{i}")));
        }
    }

    #[test]
    fn absent_fingerprint_is_usually_rejected() {
        let filter = MembershipFilter::new(1000, 0.01);
        for i in 0..500 {
            filter.add(&format!("present-{i}"));
        }
        let false_positives = (0..2000)
            .filter(|i| filter.contains(&format!("absent-{i}")))
            .count();
        // Target false-positive rate is 1%; allow generous slack since
        // sizing rounds up and this is a statistical property, not exact.
        assert!(
            false_positives < 200,
            "false positive rate too high: {false_positives}/2000"
        );
    }

    #[test]
    fn clear_resets_all_bits() {
        let filter = MembershipFilter::new(100, 0.01);
        filter.add("fp1");
        assert!(filter.contains("fp1"));
        filter.clear();
        assert!(!filter.contains("fp1"));
        assert_eq!(filter.fill_ratio(), 0.0);
    }

    #[test]
    fn rebuild_from_reflects_new_set() {
        let filter = MembershipFilter::new(100, 0.01);
        filter.add("stale");
        let live = vec!["fresh-1", "fresh-2"];
        filter.rebuild_from(live.into_iter());
        assert!(filter.contains("fresh-1"));
        assert!(filter.contains("fresh-2"));
    }
}
