//! Income holds
//!
//! A user whose active unit count falls below the highest count they have
//! held (the baseline) has referral and team income suspended. Earnings keep
//! being recorded as `pending`; they are credited once the user buys back up
//! to the baseline.

use bidloop_core::prelude::*;
use bidloop_storage::Store;
use std::sync::Arc;
use tracing::{info, warn};

/// Earning kinds that a hold suspends
const HELD_KINDS: [EarningKind; 2] = [EarningKind::Referral, EarningKind::TeamReward];

/// Result of re-evaluating a user's hold
#[derive(Clone, Debug, PartialEq)]
pub enum HoldChange {
    Unchanged,
    /// Income is now suspended
    Applied,
    /// Income flows again; these held earnings were credited
    Released(Vec<Earning>),
}

pub struct LedgerHold {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl LedgerHold {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn status(&self, user: &UserId) -> IncomeHold {
        self.store.income_hold(user)
    }

    pub fn is_referral_eligible(&self, user: &UserId) -> bool {
        !self.store.income_hold(user).referral_on_hold
    }

    pub fn is_team_eligible(&self, user: &UserId) -> bool {
        !self.store.income_hold(user).team_reward_on_hold
    }

    /// Stamp a purchase and re-evaluate
    pub fn record_purchase(&self, user: &UserId) -> Result<HoldChange> {
        let now = self.clock.now();
        self.store
            .modify_income_hold(user, &mut |hold| hold.last_purchase_at = Some(now));
        self.refresh(user)
    }

    /// Compare the user's active units against their baseline
    pub fn refresh(&self, user: &UserId) -> Result<HoldChange> {
        let active = self.store.active_units(user);
        let now = self.clock.now();

        let mut was_held = false;
        let hold = self.store.modify_income_hold(user, &mut |hold| {
            was_held = hold.any_hold();
            if active < hold.baseline_unit_count {
                hold.referral_on_hold = true;
                hold.team_reward_on_hold = true;
            } else {
                hold.referral_on_hold = false;
                hold.team_reward_on_hold = false;
                hold.baseline_unit_count = hold.baseline_unit_count.max(active);
            }
        });

        if hold.any_hold() {
            if was_held {
                return Ok(HoldChange::Unchanged);
            }
            warn!(
                user_id = %user,
                active_units = active,
                baseline = hold.baseline_unit_count,
                "Income placed on hold"
            );
            self.store.append_event(SystemEvent::warning(
                now,
                EventKind::HoldApplied,
                user,
                format!(
                    "active units {active} below baseline {}",
                    hold.baseline_unit_count
                ),
            ));
            return Ok(HoldChange::Applied);
        }

        // release anything recorded while held, including earnings that raced a release
        let released = self.store.release_pending(user, &HELD_KINDS, now)?;
        if !was_held && released.is_empty() {
            return Ok(HoldChange::Unchanged);
        }
        let total: Decimal = released.iter().map(|e| e.amount).sum();
        info!(
            user_id = %user,
            released = released.len(),
            total = %total,
            "Income hold released"
        );
        self.store.append_event(SystemEvent::info(
            now,
            EventKind::HoldReleased,
            user,
            format!("released {} held earnings totalling {total}", released.len()),
        ));
        Ok(HoldChange::Released(released))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bidloop_storage::{AccountRepository, EarningRepository, MemoryStore, NetworkRepository};
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn setup() -> (Arc<MemoryStore>, LedgerHold, UserId) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap(),
        ));
        let user = UserId::new("holder");
        store
            .create_account(Account {
                user_id: user.clone(),
                balance: Decimal::ZERO,
                payout_address: None,
                created_at: clock.now(),
            })
            .unwrap();
        let hold = LedgerHold::new(store.clone(), clock);
        (store, hold, user)
    }

    #[test]
    fn test_new_user_is_eligible() {
        let (_, hold, user) = setup();
        assert!(hold.is_referral_eligible(&user));
        assert!(hold.is_team_eligible(&user));
        assert_eq!(hold.refresh(&user).unwrap(), HoldChange::Unchanged);
    }

    #[test]
    fn test_drop_below_baseline_applies_hold() {
        let (store, hold, user) = setup();
        store.modify_income_hold(&user, &mut |h| h.baseline_unit_count = 3);

        assert_eq!(hold.refresh(&user).unwrap(), HoldChange::Applied);
        assert!(!hold.is_referral_eligible(&user));
        assert!(!hold.is_team_eligible(&user));
        // still held, nothing new
        assert_eq!(hold.refresh(&user).unwrap(), HoldChange::Unchanged);
    }

    #[test]
    fn test_release_credits_pending_earnings() {
        let (store, hold, user) = setup();
        store.modify_income_hold(&user, &mut |h| {
            h.referral_on_hold = true;
            h.team_reward_on_hold = true;
        });
        store
            .record_earning(Earning::new(
                user.clone(),
                "p1",
                dec!(5),
                EarningKind::Referral,
                Some(1),
                EarningStatus::Pending,
                Utc::now(),
            ))
            .unwrap();

        // baseline 0, active 0: nothing keeps the hold in place
        match hold.refresh(&user).unwrap() {
            HoldChange::Released(earnings) => assert_eq!(earnings.len(), 1),
            other => panic!("expected release, got {other:?}"),
        }
        assert_eq!(store.balance(&user).unwrap(), dec!(5));
        assert!(hold.is_referral_eligible(&user));
    }
}
