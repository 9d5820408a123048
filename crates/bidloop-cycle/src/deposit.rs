//! Confirmed external deposits

use bidloop_core::prelude::*;
use bidloop_economics::{HoldChange, LedgerHold};
use bidloop_storage::Store;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Effect of one confirmed deposit
#[derive(Clone, Debug, PartialEq)]
pub struct DepositReceipt {
    /// `None` when the reference was already recorded
    pub entry: Option<LedgerEntry>,
    pub balance: Decimal,
    /// Held earnings credited because the deposit changed the user's standing
    pub released: Vec<Earning>,
}

pub struct DepositService {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    hold: Arc<LedgerHold>,
}

impl DepositService {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, hold: Arc<LedgerHold>) -> Self {
        Self { store, clock, hold }
    }

    /// Credit a confirmed deposit, once per external reference
    pub fn record_deposit(
        &self,
        user: &UserId,
        amount: Decimal,
        reference: &str,
    ) -> Result<DepositReceipt> {
        if amount <= Decimal::ZERO {
            return Err(BidError::InvalidAmount(amount));
        }
        let now = self.clock.now();
        let entry = self.store.record_deposit(user, amount, reference, now)?;
        let balance = self.store.balance(user)?;

        let Some(entry) = entry else {
            debug!(user_id = %user, reference, "Duplicate deposit ignored");
            return Ok(DepositReceipt {
                entry: None,
                balance,
                released: Vec::new(),
            });
        };

        info!(user_id = %user, amount = %amount, reference, balance = %balance, "Deposit credited");
        self.store.append_event(SystemEvent::info(
            now,
            EventKind::DepositRecorded,
            entry.id,
            format!("{user} deposited {amount} ({reference})"),
        ));

        let released = match self.hold.refresh(user) {
            Ok(HoldChange::Released(released)) => released,
            Ok(_) => Vec::new(),
            Err(e) => {
                warn!(user_id = %user, error = %e, "Hold refresh after deposit failed");
                Vec::new()
            }
        };
        let balance = if released.is_empty() {
            balance
        } else {
            self.store.balance(user)?
        };

        Ok(DepositReceipt {
            entry: Some(entry),
            balance,
            released,
        })
    }
}
