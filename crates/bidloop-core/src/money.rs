//! Exact decimal helpers for ledger arithmetic
//!
//! Balances, prices and rates are `rust_decimal::Decimal` everywhere. Nothing in
//! the ledger goes through `f64`.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// `amount × percent / 100`
pub fn percent_of(amount: Decimal, percent: Decimal) -> Decimal {
    amount * percent / Decimal::ONE_HUNDRED
}

/// Clamp a balance result at zero
pub fn non_negative(value: Decimal) -> Decimal {
    value.max(Decimal::ZERO)
}

/// True when two amounts agree within `epsilon`
pub fn within_epsilon(a: Decimal, b: Decimal, epsilon: Decimal) -> bool {
    (a - b).abs() <= epsilon
}

/// `floor(units × factor)` as a unit count, saturating on overflow
pub fn scale_units(units: u32, factor: Decimal) -> u32 {
    (Decimal::from(units) * factor)
        .floor()
        .to_u32()
        .unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_percent_of() {
        assert_eq!(percent_of(dec!(100), dec!(5)), dec!(5.00));
        assert_eq!(percent_of(dec!(60), dec!(2)), dec!(1.2));
    }

    #[test]
    fn test_scale_units_floors() {
        assert_eq!(scale_units(5, dec!(1.3)), 6);
        assert_eq!(scale_units(6, dec!(1.3)), 7);
        assert_eq!(scale_units(10, dec!(1.3)), 13);
    }

    #[test]
    fn test_epsilon() {
        assert!(within_epsilon(dec!(60), dec!(60.0005), dec!(0.001)));
        assert!(!within_epsilon(dec!(60), dec!(61), dec!(0.001)));
    }

    #[test]
    fn test_non_negative() {
        assert_eq!(non_negative(dec!(-0.01)), Decimal::ZERO);
        assert_eq!(non_negative(dec!(3)), dec!(3));
    }

    proptest::proptest! {
        #[test]
        fn prop_growth_never_shrinks(units in 1u32..100_000) {
            proptest::prop_assert!(scale_units(units, dec!(1.3)) >= units);
        }

        #[test]
        fn prop_non_negative_is_idempotent(cents in -1_000_000i64..1_000_000) {
            let v = Decimal::new(cents, 2);
            proptest::prop_assert_eq!(non_negative(non_negative(v)), non_negative(v));
        }
    }
}
