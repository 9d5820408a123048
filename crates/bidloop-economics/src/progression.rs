//! Unit progression
//!
//! Cycle `0` has [`BASE_UNITS`](crate::constants::BASE_UNITS) units; each later
//! cycle has `floor(previous × growth_rate)`.
//!
//! | Index | Units (1.3×) |
//! |-------|--------------|
//! | 0 | 5 |
//! | 1 | 6 |
//! | 2 | 7 |
//! | 3 | 9 |
//! | 4 | 11 |

use crate::constants::{BASE_UNITS, GROWTH_RATE};
use bidloop_core::money::scale_units;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnitProgressionTable {
    base_units: u32,
    growth_rate: Decimal,
}

impl UnitProgressionTable {
    pub fn new(base_units: u32, growth_rate: Decimal) -> Self {
        Self {
            base_units: base_units.max(1),
            growth_rate: growth_rate.max(Decimal::ONE),
        }
    }

    pub fn base_units(&self) -> u32 {
        self.base_units
    }

    pub fn growth_rate(&self) -> Decimal {
        self.growth_rate
    }

    /// Capacity of the cycle at `index`
    pub fn lookup(&self, index: u32) -> u32 {
        let mut units = self.base_units;
        for _ in 0..index {
            let next = self.next_capacity(units);
            if next == units && units == u32::MAX {
                break;
            }
            units = next;
        }
        units
    }

    /// Capacity following `current`
    pub fn next_capacity(&self, current: u32) -> u32 {
        scale_units(current, self.growth_rate)
    }

    /// `(index, units)` for the first `count` cycles
    pub fn table(&self, count: u32) -> Vec<(u32, u32)> {
        let mut rows = Vec::with_capacity(count as usize);
        let mut units = self.base_units;
        for index in 0..count {
            rows.push((index, units));
            units = self.next_capacity(units);
        }
        rows
    }
}

impl Default for UnitProgressionTable {
    fn default() -> Self {
        Self::new(BASE_UNITS, Decimal::new(GROWTH_RATE.0, GROWTH_RATE.1))
    }
}
