//! Referral commissions
//!
//! Every funded unit pays a percentage of its amount to each ancestor up to
//! twelve levels. Held ancestors still get an earning, recorded as pending.
//!
//! `distribute` skips levels that already have an earning for the same
//! source, so a retried distribution only pays what is missing.

use crate::constants::MAX_UPLINE_LEVELS;
use crate::hold::LedgerHold;
use crate::upline::walk_upline;
use bidloop_core::money::percent_of;
use bidloop_core::prelude::*;
use bidloop_storage::Store;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Commission percent per upline level, index 0 being level 1
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferralRates(pub Vec<Decimal>);

impl ReferralRates {
    /// Percent for `level` (1-based); zero beyond the table
    pub fn percent_for(&self, level: u8) -> Decimal {
        level
            .checked_sub(1)
            .and_then(|i| self.0.get(i as usize))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub fn levels(&self) -> u8 {
        self.0.len().min(MAX_UPLINE_LEVELS as usize) as u8
    }

    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() || self.0.len() > MAX_UPLINE_LEVELS as usize {
            return Err(BidError::Config(format!(
                "referral rates must cover 1 to {MAX_UPLINE_LEVELS} levels, got {}",
                self.0.len()
            )));
        }
        if let Some(bad) = self.0.iter().find(|r| r.is_sign_negative() || **r > Decimal::ONE_HUNDRED) {
            return Err(BidError::Config(format!(
                "referral rate {bad}% is outside 0..=100"
            )));
        }
        Ok(())
    }
}

impl Default for ReferralRates {
    fn default() -> Self {
        Self(vec![
            dec!(5),
            dec!(3),
            dec!(2),
            dec!(1),
            dec!(1),
            dec!(0.5),
            dec!(0.5),
            dec!(0.5),
            dec!(0.25),
            dec!(0.25),
            dec!(0.25),
            dec!(0.25),
        ])
    }
}

/// What one `distribute` call produced
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReferralOutcome {
    pub credited: Vec<Earning>,
    pub held: Vec<Earning>,
    /// Ancestors that could not be paid (missing account)
    pub skipped: Vec<UserId>,
    pub loop_detected: bool,
}

impl ReferralOutcome {
    pub fn total_credited(&self) -> Decimal {
        self.credited.iter().map(|e| e.amount).sum()
    }

    pub fn total_held(&self) -> Decimal {
        self.held.iter().map(|e| e.amount).sum()
    }
}

pub struct ReferralCommissionEngine {
    store: Arc<dyn Store>,
    hold: Arc<LedgerHold>,
    clock: Arc<dyn Clock>,
    rates: ReferralRates,
}

impl ReferralCommissionEngine {
    pub fn new(
        store: Arc<dyn Store>,
        hold: Arc<LedgerHold>,
        clock: Arc<dyn Clock>,
        rates: ReferralRates,
    ) -> Self {
        Self {
            store,
            hold,
            clock,
            rates,
        }
    }

    pub fn rates(&self) -> &ReferralRates {
        &self.rates
    }

    /// Pay commissions on `invested` up the upline of `user`
    ///
    /// `source_id` identifies the investment on the resulting earnings.
    pub fn distribute(
        &self,
        user: &UserId,
        invested: Decimal,
        source_id: &str,
    ) -> Result<ReferralOutcome> {
        let now = self.clock.now();
        let upline = walk_upline(self.store.as_ref(), user, self.rates.levels());
        let mut outcome = ReferralOutcome {
            loop_detected: upline.loop_detected,
            ..Default::default()
        };

        if upline.loop_detected {
            warn!(user_id = %user, "Referral chain loops back on itself, walk truncated");
            self.store.append_event(SystemEvent::error(
                now,
                EventKind::ConsistencyViolation,
                user,
                "referral chain contains a loop",
            ));
        }

        for (level, ancestor) in upline.ancestors {
            let commission = percent_of(invested, self.rates.percent_for(level));
            if commission <= Decimal::ZERO {
                continue;
            }
            if self
                .store
                .has_earning(source_id, EarningKind::Referral, Some(level))
            {
                debug!(beneficiary = %ancestor, level, source_id, "Commission already recorded");
                continue;
            }

            let status = if self.hold.is_referral_eligible(&ancestor) {
                EarningStatus::Processed
            } else {
                EarningStatus::Pending
            };
            let earning = Earning::new(
                ancestor.clone(),
                source_id,
                commission,
                EarningKind::Referral,
                Some(level),
                status,
                now,
            );

            match self.store.record_earning(earning) {
                Ok(earning) if status == EarningStatus::Processed => {
                    debug!(beneficiary = %ancestor, level, amount = %commission, "Referral commission credited");
                    outcome.credited.push(earning);
                }
                Ok(earning) => {
                    debug!(beneficiary = %ancestor, level, amount = %commission, "Referral commission held");
                    outcome.held.push(earning);
                }
                Err(e) => {
                    warn!(beneficiary = %ancestor, level, error = %e, "Referral commission skipped");
                    outcome.skipped.push(ancestor);
                }
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bidloop_storage::{AccountRepository, EarningRepository, MemoryStore, NetworkRepository};
    use chrono::Utc;

    struct Fixture {
        store: Arc<MemoryStore>,
        engine: ReferralCommissionEngine,
    }

    fn fixture(rates: ReferralRates) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let hold = Arc::new(LedgerHold::new(store.clone(), clock.clone()));
        let engine = ReferralCommissionEngine::new(store.clone(), hold, clock, rates);
        Fixture { store, engine }
    }

    fn user(store: &MemoryStore, name: &str, referrer: Option<&str>) -> UserId {
        let id = UserId::new(name);
        store
            .create_account(Account {
                user_id: id.clone(),
                balance: Decimal::ZERO,
                payout_address: None,
                created_at: Utc::now(),
            })
            .unwrap();
        if let Some(r) = referrer {
            store
                .insert_link(UplineLink {
                    user_id: id.clone(),
                    referrer_id: UserId::new(r),
                    depth: 1,
                })
                .unwrap();
        }
        id
    }

    #[test]
    fn test_level_one_commission_credited() {
        let f = fixture(ReferralRates(vec![dec!(5)]));
        let sponsor = user(&f.store, "sponsor", None);
        let buyer = user(&f.store, "buyer", Some("sponsor"));

        let outcome = f.engine.distribute(&buyer, dec!(100), "p-1").unwrap();
        assert_eq!(outcome.credited.len(), 1);
        assert_eq!(outcome.credited[0].amount, dec!(5.00));
        assert_eq!(outcome.credited[0].status, EarningStatus::Processed);
        assert_eq!(f.store.balance(&sponsor).unwrap(), dec!(5.00));
    }

    #[test]
    fn test_held_sponsor_gets_pending_earning() {
        let f = fixture(ReferralRates(vec![dec!(5)]));
        let sponsor = user(&f.store, "sponsor", None);
        let buyer = user(&f.store, "buyer", Some("sponsor"));
        f.store
            .modify_income_hold(&sponsor, &mut |h| h.referral_on_hold = true);

        let outcome = f.engine.distribute(&buyer, dec!(100), "p-1").unwrap();
        assert!(outcome.credited.is_empty());
        assert_eq!(outcome.held.len(), 1);
        assert_eq!(outcome.held[0].amount, dec!(5.00));
        assert_eq!(outcome.held[0].status, EarningStatus::Pending);
        assert_eq!(f.store.balance(&sponsor).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn test_zero_rate_levels_are_skipped() {
        let f = fixture(ReferralRates(vec![dec!(5), dec!(0), dec!(1)]));
        user(&f.store, "a", None);
        user(&f.store, "b", Some("a"));
        user(&f.store, "c", Some("b"));
        let d = user(&f.store, "d", Some("c"));

        let outcome = f.engine.distribute(&d, dec!(200), "p-9").unwrap();
        let levels: Vec<Option<u8>> = outcome.credited.iter().map(|e| e.level).collect();
        assert_eq!(levels, vec![Some(1), Some(3)]);
        assert_eq!(f.store.earnings_for(&UserId::new("b")).len(), 0);
        assert_eq!(outcome.total_credited(), dec!(12));
    }

    #[test]
    fn test_missing_ancestor_account_is_skipped() {
        let f = fixture(ReferralRates::default());
        let buyer = user(&f.store, "buyer", Some("ghost"));
        let outcome = f.engine.distribute(&buyer, dec!(100), "p-1").unwrap();
        assert_eq!(outcome.skipped, vec![UserId::new("ghost")]);
        assert!(outcome.credited.is_empty());
    }

    #[test]
    fn test_retry_pays_only_missing_levels() {
        let f = fixture(ReferralRates(vec![dec!(5), dec!(3)]));
        let sponsor = user(&f.store, "sponsor", Some("grand"));
        let buyer = user(&f.store, "buyer", Some("sponsor"));

        // level 2 has no account yet
        let first = f.engine.distribute(&buyer, dec!(20), "p-1").unwrap();
        assert_eq!(first.credited.len(), 1);
        assert_eq!(first.skipped, vec![UserId::new("grand")]);

        let grand = user(&f.store, "grand", None);
        let second = f.engine.distribute(&buyer, dec!(20), "p-1").unwrap();
        assert_eq!(second.credited.len(), 1);
        assert_eq!(second.credited[0].level, Some(2));
        assert_eq!(f.store.balance(&sponsor).unwrap(), dec!(1));
        assert_eq!(f.store.balance(&grand).unwrap(), dec!(0.6));

        let third = f.engine.distribute(&buyer, dec!(20), "p-1").unwrap();
        assert!(third.credited.is_empty());
        assert_eq!(f.store.balance(&sponsor).unwrap(), dec!(1));
    }

    #[test]
    fn test_default_rates_validate() {
        let rates = ReferralRates::default();
        assert!(rates.validate().is_ok());
        assert_eq!(rates.percent_for(1), dec!(5));
        assert_eq!(rates.percent_for(13), Decimal::ZERO);
        assert!(ReferralRates(vec![]).validate().is_err());
        assert!(ReferralRates(vec![dec!(-1)]).validate().is_err());
    }
}
