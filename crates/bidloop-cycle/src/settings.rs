//! Settings for the cycle, purchase and distribution components

use bidloop_bridge::SettlementSettings;
use bidloop_core::prelude::*;
use bidloop_economics::{RankTable, ReferralRates, UnitProgressionTable};
use chrono::NaiveTime;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Cycle schedule and growth
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CycleSettings {
    /// Local timezone as minutes east of UTC
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,

    /// Local wall-clock time a daily cycle opens, `HH:MM:SS`
    #[serde(default = "default_open_time")]
    pub open_time: String,

    /// Days per cycle group for the progression index
    #[serde(default = "default_group_days")]
    pub group_days: i64,

    /// Capacity of the first cycle
    #[serde(default = "default_base_units")]
    pub base_units: u32,

    /// Capacity multiplier between cycles
    #[serde(default = "default_growth_rate")]
    pub growth_rate: Decimal,

    #[serde(default = "default_true")]
    pub only_open_when_filled: bool,

    #[serde(default = "default_true")]
    pub auto_close_when_filled: bool,

    /// Informational daily profit rate
    #[serde(default = "default_profit_distribution_day")]
    pub profit_distribution_day: Decimal,
}

fn default_utc_offset_minutes() -> i32 {
    330
}

fn default_open_time() -> String {
    "08:10:00".to_string()
}

fn default_group_days() -> i64 {
    5
}

fn default_base_units() -> u32 {
    5
}

fn default_growth_rate() -> Decimal {
    dec!(1.3)
}

fn default_true() -> bool {
    true
}

fn default_profit_distribution_day() -> Decimal {
    dec!(0.006)
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self {
            utc_offset_minutes: default_utc_offset_minutes(),
            open_time: default_open_time(),
            group_days: default_group_days(),
            base_units: default_base_units(),
            growth_rate: default_growth_rate(),
            only_open_when_filled: true,
            auto_close_when_filled: true,
            profit_distribution_day: default_profit_distribution_day(),
        }
    }
}

impl CycleSettings {
    pub fn parsed_open_time(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(&self.open_time, "%H:%M:%S")
            .map_err(|e| BidError::Config(format!("invalid open_time {:?}: {e}", self.open_time)))
    }

    pub fn schedule(&self) -> LocalSchedule {
        LocalSchedule::from_offset_minutes(self.utc_offset_minutes)
    }

    pub fn progression(&self) -> UnitProgressionTable {
        UnitProgressionTable::new(self.base_units, self.growth_rate)
    }

    pub fn growth_config(&self) -> GrowthConfig {
        GrowthConfig {
            growth_rate: self.growth_rate,
            only_open_when_filled: self.only_open_when_filled,
            auto_close_when_filled: self.auto_close_when_filled,
            profit_distribution_day: self.profit_distribution_day,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.parsed_open_time()?;
        if self.group_days < 1 {
            return Err(BidError::Config("group_days must be at least 1".into()));
        }
        if self.base_units == 0 {
            return Err(BidError::Config("base_units must be positive".into()));
        }
        if self.growth_rate < Decimal::ONE {
            return Err(BidError::Config(format!(
                "growth_rate {} would shrink cycles",
                self.growth_rate
            )));
        }
        if self.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(BidError::Config("utc_offset_minutes out of range".into()));
        }
        Ok(())
    }
}

/// Purchase pricing and limits
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PurchaseSettings {
    /// Price of one unit
    #[serde(default = "default_unit_price")]
    pub unit_price: Decimal,

    /// Caller amounts further than this from the computed cost are ignored
    #[serde(default = "default_amount_epsilon")]
    pub amount_epsilon: Decimal,

    /// Days until a unit matures
    #[serde(default = "default_maturity_days")]
    pub maturity_days: i64,

    /// Cap each user's units per cycle by their own progression
    #[serde(default)]
    pub enforce_user_progression: bool,
}

fn default_unit_price() -> Decimal {
    dec!(20)
}

fn default_amount_epsilon() -> Decimal {
    dec!(0.001)
}

fn default_maturity_days() -> i64 {
    5
}

impl Default for PurchaseSettings {
    fn default() -> Self {
        Self {
            unit_price: default_unit_price(),
            amount_epsilon: default_amount_epsilon(),
            maturity_days: default_maturity_days(),
            enforce_user_progression: false,
        }
    }
}

impl PurchaseSettings {
    pub fn validate(&self) -> Result<()> {
        if self.unit_price <= Decimal::ZERO {
            return Err(BidError::Config("unit_price must be positive".into()));
        }
        if self.maturity_days < 0 {
            return Err(BidError::Config("maturity_days cannot be negative".into()));
        }
        Ok(())
    }
}

/// Fee, return and reward settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DistributionSettings {
    /// Profit on a matured unit; paid amount is `amount × (1 + rate)`
    #[serde(default = "default_return_rate")]
    pub return_rate: Decimal,

    /// Platform fee percent of each deposit/investment
    #[serde(default = "default_admin_fee_percent")]
    pub admin_fee_percent: Decimal,

    /// Rewards pool allocation percent
    #[serde(default = "default_rewards_pool_percent")]
    pub rewards_pool_percent: Decimal,

    #[serde(default)]
    pub admin_fee_address: Option<String>,

    #[serde(default)]
    pub rewards_pool_address: Option<String>,

    /// Active direct legs needed to accrue team volume
    #[serde(default = "default_min_active_legs")]
    pub min_active_legs_for_team_volume: u32,

    #[serde(default)]
    pub referral_rates: ReferralRates,

    #[serde(default)]
    pub team_ranks: RankTable,
}

fn default_return_rate() -> Decimal {
    dec!(0.15)
}

fn default_admin_fee_percent() -> Decimal {
    dec!(2)
}

fn default_rewards_pool_percent() -> Decimal {
    dec!(8)
}

fn default_min_active_legs() -> u32 {
    bidloop_economics::constants::MIN_ACTIVE_LEGS_FOR_TEAM_VOLUME
}

impl Default for DistributionSettings {
    fn default() -> Self {
        Self {
            return_rate: default_return_rate(),
            admin_fee_percent: default_admin_fee_percent(),
            rewards_pool_percent: default_rewards_pool_percent(),
            admin_fee_address: None,
            rewards_pool_address: None,
            min_active_legs_for_team_volume: default_min_active_legs(),
            referral_rates: ReferralRates::default(),
            team_ranks: RankTable::default(),
        }
    }
}

impl DistributionSettings {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("return_rate", self.return_rate),
            ("admin_fee_percent", self.admin_fee_percent),
            ("rewards_pool_percent", self.rewards_pool_percent),
        ] {
            if value.is_sign_negative() {
                return Err(BidError::Config(format!("{name} cannot be negative")));
            }
        }
        self.referral_rates.validate()?;
        self.team_ranks.validate()
    }
}

/// Everything the core services need
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CoreSettings {
    #[serde(default)]
    pub cycle: CycleSettings,
    #[serde(default)]
    pub purchase: PurchaseSettings,
    #[serde(default)]
    pub distribution: DistributionSettings,
    #[serde(default)]
    pub settlement: SettlementSettings,
}

impl CoreSettings {
    pub fn validate(&self) -> Result<()> {
        self.cycle.validate()?;
        self.purchase.validate()?;
        self.distribution.validate()?;
        if self.settlement.max_retries == 0 {
            return Err(BidError::Config("settlement.max_retries must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(CoreSettings::default().validate().is_ok());
    }

    #[test]
    fn test_bad_open_time_rejected() {
        let settings = CycleSettings {
            open_time: "25:00".into(),
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(BidError::Config(_))));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let settings: CoreSettings =
            serde_json::from_str(r#"{"purchase": {"unit_price": "25"}}"#).unwrap();
        assert_eq!(settings.purchase.unit_price, dec!(25));
        assert_eq!(settings.purchase.maturity_days, 5);
        assert_eq!(settings.cycle.base_units, 5);
        assert_eq!(settings.distribution.referral_rates.percent_for(1), dec!(5));
    }
}
