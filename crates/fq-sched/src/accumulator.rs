/// Running sum of `latency * transactions` products that never overflows.
///
/// When the next term does not fit, the stored total and all later terms are
/// shifted right by one more bit. The true sum is approximately
/// `total() << lost_bits()`; [`ScaledSum::error_bound`] bounds how far below
/// the exact sum [`ScaledSum::value`] can be.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScaledSum {
    total: u64,
    lost_bits: u32,
    terms: u32,
}

impl ScaledSum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_product(&mut self, a: u64, b: u64) {
        self.add(u128::from(a) * u128::from(b));
    }

    pub fn add(&mut self, value: u128) {
        self.terms = self.terms.saturating_add(1);
        loop {
            let scaled = value >> self.lost_bits;
            if let Some(total) = u64::try_from(scaled)
                .ok()
                .and_then(|scaled| self.total.checked_add(scaled))
            {
                self.total = total;
                return;
            }
            self.lost_bits += 1;
            self.total >>= 1;
        }
    }

    /// Sum in units of `2^lost_bits`.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn lost_bits(&self) -> u32 {
        self.lost_bits
    }

    /// Sum in original units.
    pub fn value(&self) -> u128 {
        u128::from(self.total) << self.lost_bits
    }

    /// Maximum amount by which [`ScaledSum::value`] undershoots the exact sum.
    ///
    /// Each term truncates less than one unit and each extra lost bit drops at
    /// most one more.
    pub fn error_bound(&self) -> u128 {
        (u128::from(self.terms) + u128::from(self.lost_bits)) << self.lost_bits
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn small_sums_are_exact() {
        let mut sum = ScaledSum::new();
        sum.add_product(998, 1000);
        sum.add_product(499, 1000);
        assert_eq!(sum.lost_bits(), 0);
        assert_eq!(sum.total(), 1_497_000);
        assert_eq!(sum.value(), 1_497_000);
    }

    #[test]
    fn overflow_shifts_instead_of_wrapping() {
        let mut sum = ScaledSum::new();
        let mut exact: u128 = 0;
        for i in 0..32u64 {
            let latency = u64::MAX / 3 - i;
            let transactions = 1_000 + i;
            sum.add_product(latency, transactions);
            exact += u128::from(latency) * u128::from(transactions);
        }
        assert!(sum.lost_bits() > 0);
        assert!(sum.value() <= exact);
        assert!(exact - sum.value() < sum.error_bound());
    }

    #[test]
    fn single_huge_term_fits_after_shifting() {
        let mut sum = ScaledSum::new();
        sum.add_product(u64::MAX, u64::MAX);
        let exact = u128::from(u64::MAX) * u128::from(u64::MAX);
        assert_eq!(sum.lost_bits(), 64);
        assert!(exact - sum.value() < sum.error_bound());
    }
}
