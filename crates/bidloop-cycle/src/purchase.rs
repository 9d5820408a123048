//! Purchase settlement
//!
//! The only path that fills a cycle. Validation happens here; the capacity
//! check, debit, unit creation and `filled` increment are one conditional
//! update in the store. A purchase that fills its cycle closes it inline, so
//! the caller returns only after the next cycle is open.

use crate::manager::{CycleManager, Rollover};
use crate::settings::PurchaseSettings;
use bidloop_core::prelude::*;
use bidloop_economics::{LedgerHold, ReferralNetwork};
use bidloop_storage::Store;
use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A committed purchase
#[derive(Clone, Debug)]
pub struct PurchaseOutcome {
    pub receipt: PurchaseReceipt,
    pub total_cost: Decimal,
    /// Present when this purchase filled the cycle
    pub rollover: Option<Rollover>,
    pub message: String,
}

pub struct PurchaseSettlement {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    manager: Arc<CycleManager>,
    hold: Arc<LedgerHold>,
    network: Arc<ReferralNetwork>,
    settings: PurchaseSettings,
}

impl PurchaseSettlement {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        manager: Arc<CycleManager>,
        hold: Arc<LedgerHold>,
        network: Arc<ReferralNetwork>,
        settings: PurchaseSettings,
    ) -> Self {
        Self {
            store,
            clock,
            manager,
            hold,
            network,
            settings,
        }
    }

    pub fn unit_price(&self) -> Decimal {
        self.settings.unit_price
    }

    /// Buy on whatever cycle is currently open
    pub fn purchase_current(
        &self,
        user: &UserId,
        quantity: i64,
        expected_amount: Option<Decimal>,
    ) -> Result<PurchaseOutcome> {
        if quantity <= 0 {
            return Err(BidError::InvalidQuantity(quantity));
        }
        let cycle = self.manager.get_or_create_current_cycle()?;
        self.purchase(user, &cycle.id, quantity, expected_amount)
    }

    /// Buy `quantity` units of `cycle_id` for `user`
    ///
    /// `expected_amount` is the caller's idea of the total; it is only
    /// compared against the computed cost and never charged.
    pub fn purchase(
        &self,
        user: &UserId,
        cycle_id: &CycleId,
        quantity: i64,
        expected_amount: Option<Decimal>,
    ) -> Result<PurchaseOutcome> {
        let result = self.try_purchase(user, cycle_id, quantity, expected_amount);
        if let Err(e) = &result {
            if e.is_client_error() {
                debug!(user_id = %user, cycle_id = %cycle_id, quantity, reason = %e, "Purchase rejected");
            } else {
                error!(user_id = %user, cycle_id = %cycle_id, quantity, error = %e, "Purchase failed");
            }
        }
        result
    }

    fn try_purchase(
        &self,
        user: &UserId,
        cycle_id: &CycleId,
        quantity: i64,
        expected_amount: Option<Decimal>,
    ) -> Result<PurchaseOutcome> {
        if quantity <= 0 {
            return Err(BidError::InvalidQuantity(quantity));
        }
        let units = u32::try_from(quantity).map_err(|_| BidError::InvalidQuantity(quantity))?;

        // always a fresh read; the store re-checks under its lock anyway
        let cycle = self.store.cycle(cycle_id)?;
        if cycle.status != CycleStatus::Open {
            return Err(BidError::CycleNotOpen {
                cycle_id: cycle.id,
                status: cycle.status,
            });
        }
        if units > cycle.remaining() {
            return Err(BidError::CapacityExceeded {
                available: cycle.remaining(),
            });
        }

        let total_cost = self.settings.unit_price * Decimal::from(units);
        if let Some(expected) = expected_amount {
            if !money::within_epsilon(expected, total_cost, self.settings.amount_epsilon) {
                warn!(
                    user_id = %user,
                    expected = %expected,
                    computed = %total_cost,
                    "Client amount disagrees with computed cost, using computed"
                );
            }
        }

        let rollup = self.user_limit(user, &cycle, units)?;

        let now = self.clock.now();
        let order = PurchaseOrder {
            user_id: user.clone(),
            cycle_id: cycle.id,
            quantity: units,
            unit_price: self.settings.unit_price,
            total_cost,
            activation_time: now,
            completion_time: now + Duration::days(self.settings.maturity_days),
        };
        let receipt = self.store.commit_purchase(&order)?;

        info!(
            user_id = %user,
            cycle_id = %receipt.cycle.id,
            units,
            total = %total_cost,
            filled = receipt.cycle.filled,
            capacity = receipt.cycle.capacity,
            "Purchase committed"
        );
        self.store.append_event(SystemEvent::info(
            now,
            EventKind::PurchaseCommitted,
            receipt.cycle.id,
            format!(
                "{user} bought {units} units ({}..={}) for {total_cost}",
                receipt.purchases.first().map(|p| p.order).unwrap_or_default(),
                receipt.purchases.last().map(|p| p.order).unwrap_or_default(),
            ),
        ));

        self.after_commit(user, &receipt, rollup, units, total_cost);

        let rollover = if receipt.filled_cycle() {
            self.manager.close_if_filled(&receipt.cycle.id)?
        } else {
            None
        };

        Ok(PurchaseOutcome {
            receipt,
            total_cost,
            rollover,
            message: "Purchase successful".to_string(),
        })
    }

    /// Seed for the user's rollup in this cycle, checking the progression
    /// ceiling when it is enforced
    fn user_limit(&self, user: &UserId, cycle: &Cycle, units: u32) -> Result<UserCycle> {
        let rollups = self.store.user_cycles(user);
        let prior = rollups.iter().filter(|uc| uc.cycle_id != cycle.id).count();
        let prior = u32::try_from(prior).unwrap_or(u32::MAX);
        let allowed = self.manager.progression().lookup(prior);

        if self.settings.enforce_user_progression {
            let bought = rollups
                .iter()
                .find(|uc| uc.cycle_id == cycle.id)
                .map(|uc| uc.units_bought)
                .unwrap_or(0);
            let max = allowed.saturating_sub(bought);
            if units > max {
                return Err(BidError::UserLimitExceeded { max });
            }
        }

        Ok(UserCycle {
            user_id: user.clone(),
            cycle_id: cycle.id,
            cycle_number: prior.saturating_add(1),
            units_allowed: allowed,
            units_bought: 0,
            amount: Decimal::ZERO,
            status: UserCycleStatus::Active,
        })
    }

    /// Per-user bookkeeping once value has moved. Failures here never undo
    /// the purchase.
    fn after_commit(
        &self,
        user: &UserId,
        receipt: &PurchaseReceipt,
        seed: UserCycle,
        units: u32,
        total_cost: Decimal,
    ) {
        self.store.modify_user_cycle(seed, &mut |rollup| {
            rollup.units_bought += units;
            rollup.amount += total_cost;
            rollup.status = UserCycleStatus::Active;
        });

        let after = self.store.active_units(user);
        self.network
            .on_active_units_changed(user, after.saturating_sub(units), after);

        if let Err(e) = self.hold.record_purchase(user) {
            warn!(user_id = %user, cycle_id = %receipt.cycle.id, error = %e, "Hold refresh after purchase failed");
        }
    }
}
