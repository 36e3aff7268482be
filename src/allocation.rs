use rust_decimal::{Decimal, RoundingStrategy};

/// One payee's stake used by the allocation math: `factor` weighted shares
/// plus a fixed `extra`, both in the smallest currency unit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShareEntry {
    pub factor: i64,
    pub extra: i64,
}

// Rounding down keeps the sum of allocated shares from ever exceeding the
// remaining income.
fn floor2(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::ToNegativeInfinity)
}

/// Per-unit share once extras and the saving target are taken out of the
/// income. A factor sum of zero is treated as one so the portion stays
/// defined even when every entry is extra-only.
pub fn compute_portion(saving: Decimal, entries: &[ShareEntry], income: Decimal) -> Decimal {
    let mut factor_sum: Decimal = entries.iter().map(|e| Decimal::from(e.factor)).sum();
    if factor_sum.is_zero() {
        factor_sum = Decimal::ONE;
    }
    let extra_sum: Decimal = entries.iter().map(|e| Decimal::from(e.extra)).sum();
    let remaining = income - extra_sum - saving;
    floor2(remaining / factor_sum)
}

/// Inverse of [`compute_portion`]: the saving implied by a chosen portion.
pub fn compute_saving(portion: Decimal, entries: &[ShareEntry], income: Decimal) -> Decimal {
    let total_sum: Decimal = entries
        .iter()
        .map(|e| compute_total(portion, e.factor, e.extra))
        .sum();
    floor2(income - total_sum)
}

/// Amount one payee owes for an event.
pub fn compute_total(portion: Decimal, factor: i64, extra: i64) -> Decimal {
    portion * Decimal::from(factor) + Decimal::from(extra)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn entry(factor: i64, extra: i64) -> ShareEntry {
        ShareEntry { factor, extra }
    }

    #[test]
    fn even_two_way_split_consumes_the_whole_income() {
        let entries = vec![entry(1, 0), entry(1, 0)];
        let portion = compute_portion(dec!(0), &entries, dec!(1000));
        assert_eq!(portion, dec!(500.00));
        let totals: Vec<_> = entries
            .iter()
            .map(|e| compute_total(portion, e.factor, e.extra))
            .collect();
        assert_eq!(totals, vec![dec!(500.00), dec!(500.00)]);
        assert_eq!(totals.iter().sum::<Decimal>(), dec!(1000.00));
    }

    #[test]
    fn extras_come_off_the_top_before_the_weighted_split() {
        let entries = vec![entry(1, 100), entry(1, 0)];
        let portion = compute_portion(dec!(0), &entries, dec!(1000));
        assert_eq!(portion, dec!(450.00));
        assert_eq!(compute_total(portion, 1, 100), dec!(550.00));
        assert_eq!(compute_total(portion, 1, 0), dec!(450.00));
        assert_eq!(
            compute_total(portion, 1, 100) + compute_total(portion, 1, 0),
            dec!(1000.00)
        );
    }

    #[test]
    fn portion_truncates_down_to_two_decimals() {
        let entries = vec![entry(1, 0), entry(1, 0), entry(1, 0)];
        let portion = compute_portion(dec!(0), &entries, dec!(1000));
        assert_eq!(portion, dec!(333.33));
        // the truncated remainder ends up as implied saving
        assert_eq!(compute_saving(portion, &entries, dec!(1000)), dec!(0.01));
    }

    #[test]
    fn zero_factor_sum_falls_back_to_one_unit() {
        let entries = vec![entry(0, 300), entry(0, 200)];
        let portion = compute_portion(dec!(100), &entries, dec!(1000));
        assert_eq!(portion, dec!(400.00));
    }

    #[test]
    fn total_with_zero_factor_is_the_extra_alone() {
        for extra in [0, 1, 250, 99999] {
            assert_eq!(
                compute_total(dec!(123.45), 0, extra),
                Decimal::from(extra)
            );
        }
    }

    #[test]
    fn saving_round_trips_within_one_minor_unit_step() {
        let entries = vec![entry(3, 150), entry(2, 0), entry(1, 25)];
        for income in [600i64, 777, 1000, 5000, 123457] {
            for saving in [0i64, 1, 99, 175] {
                if saving > income {
                    continue;
                }
                let portion = compute_portion(Decimal::from(saving), &entries, Decimal::from(income));
                if portion < Decimal::ZERO {
                    continue;
                }
                let back = compute_saving(portion, &entries, Decimal::from(income));
                let drift = Decimal::from(saving) - back;
                assert!(
                    drift.abs() < dec!(0.06),
                    "income {income} saving {saving} came back as {back}"
                );
                // truncation only ever leaves money behind, never allocates extra
                assert!(back >= Decimal::from(saving) - dec!(0.06));
            }
        }
    }

    #[test]
    fn pairwise_split_round_trips_within_a_single_step() {
        let entries = vec![entry(1, 40), entry(1, 0)];
        for income in 100i64..400 {
            let saving = dec!(17);
            let portion = compute_portion(saving, &entries, Decimal::from(income));
            let back = compute_saving(portion, &entries, Decimal::from(income));
            assert!((saving - back).abs() <= dec!(0.01));
        }
    }

    #[test]
    fn portion_is_monotone_in_saving_and_income() {
        let entries = vec![entry(2, 50), entry(3, 0)];
        let mut last = compute_portion(dec!(0), &entries, dec!(2000));
        for saving in 1..200i64 {
            let portion = compute_portion(Decimal::from(saving), &entries, dec!(2000));
            assert!(portion <= last, "portion grew when saving rose to {saving}");
            last = portion;
        }
        let mut last = compute_portion(dec!(100), &entries, dec!(0));
        for income in 1..200i64 {
            let portion = compute_portion(dec!(100), &entries, Decimal::from(income));
            assert!(portion >= last, "portion shrank when income rose to {income}");
            last = portion;
        }
    }

    #[test]
    fn oversized_saving_drives_the_portion_negative() {
        let entries = vec![entry(1, 0)];
        let portion = compute_portion(dec!(600), &entries, dec!(500));
        assert_eq!(portion, dec!(-100.00));
    }
}
