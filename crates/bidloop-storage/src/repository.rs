//! Repository interfaces
//!
//! Components receive an `Arc<dyn Store>` at construction. Every method is one
//! atomic unit: conditional updates (`commit_purchase`, `close_if_filled`,
//! the `claim_*` family) check and mutate under the same guard so concurrent
//! callers never observe a half-applied change.

use bidloop_core::prelude::*;
use chrono::{DateTime, Utc};

/// Cycle counts grouped by status
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CycleCounts {
    pub total: usize,
    pub pending: usize,
    pub open: usize,
    pub closed: usize,
}

pub trait CycleRepository: Send + Sync {
    fn cycle(&self, id: &CycleId) -> Result<Cycle>;

    /// The open cycle, if any. When the invariant is broken the most recent wins.
    fn open_cycle(&self) -> Option<Cycle>;

    fn open_cycles(&self) -> Vec<Cycle>;

    /// Most recently created pending cycle
    fn latest_pending(&self) -> Option<Cycle>;

    /// Earliest cycle ever created
    fn first_cycle(&self) -> Option<Cycle>;

    /// Cycle with the highest index
    fn latest_cycle(&self) -> Option<Cycle>;

    /// All cycles ordered by index then creation time
    fn cycles(&self) -> Vec<Cycle>;

    fn cycle_counts(&self) -> CycleCounts;

    /// Insert a new cycle. Inserting an open cycle while another is open fails.
    fn insert_cycle(&self, cycle: Cycle) -> Result<Cycle>;

    /// pending → open. `Ok(None)` when the cycle is not pending.
    fn open_pending(&self, id: &CycleId, now: DateTime<Utc>) -> Result<Option<Cycle>>;

    /// open ∧ filled ≥ capacity → closed. `Ok(None)` when the condition does not hold.
    fn close_if_filled(&self, id: &CycleId, now: DateTime<Utc>) -> Result<Option<Cycle>>;

    /// closed ∧ filled < capacity → open, clearing the close time
    fn reopen(&self, id: &CycleId) -> Result<Cycle>;
}

pub trait AccountRepository: Send + Sync {
    fn create_account(&self, account: Account) -> Result<()>;

    fn account(&self, user: &UserId) -> Result<Account>;

    fn accounts(&self) -> Vec<Account>;

    fn balance(&self, user: &UserId) -> Result<Decimal> {
        self.account(user).map(|a| a.balance)
    }

    fn set_payout_address(&self, user: &UserId, address: Option<String>) -> Result<()>;

    /// Atomic increment; returns the new balance
    fn credit(&self, user: &UserId, amount: Decimal) -> Result<Decimal>;

    /// Credit a confirmed deposit once per reference. `Ok(None)` for duplicates.
    fn record_deposit(
        &self,
        user: &UserId,
        amount: Decimal,
        reference: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<LedgerEntry>>;

    /// Deposit and investment entries the fee stage has not seen
    fn unprocessed_entries(&self) -> Vec<LedgerEntry>;

    /// Mark an entry fee-processed. Only the first caller gets `true`.
    fn claim_fee_processing(&self, id: &EntryId) -> bool;

    /// Undo a fee claim so the next run retries the entry
    fn release_fee_processing(&self, id: &EntryId);

    fn ledger_entries(&self, user: &UserId) -> Vec<LedgerEntry>;
}

pub trait EarningRepository: Send + Sync {
    /// Store an earning. A processed earning credits the balance in the same step.
    fn record_earning(&self, earning: Earning) -> Result<Earning>;

    /// Store an earning without touching the balance (paid out externally)
    fn insert_earning(&self, earning: Earning) -> Result<Earning>;

    fn earnings_for(&self, user: &UserId) -> Vec<Earning>;

    fn earnings(&self) -> Vec<Earning>;

    /// Whether an earning of `kind` (and `level`, when given) exists for `source_id`
    fn has_earning(&self, source_id: &str, kind: EarningKind, level: Option<u8>) -> bool;

    /// Credit and mark processed every pending earning of `user` whose kind is listed
    fn release_pending(
        &self,
        user: &UserId,
        kinds: &[EarningKind],
        now: DateTime<Utc>,
    ) -> Result<Vec<Earning>>;
}

pub trait PurchaseRepository: Send + Sync {
    /// Capacity check, balance check, debit, unit creation and the filled
    /// increment as one conditional update. Nothing changes on error.
    fn commit_purchase(&self, order: &PurchaseOrder) -> Result<PurchaseReceipt>;

    fn purchase(&self, id: &PurchaseId) -> Option<Purchase>;

    fn purchases_for_cycle(&self, cycle: &CycleId) -> Vec<Purchase>;

    fn purchases_for_user(&self, user: &UserId) -> Vec<Purchase>;

    /// Active purchases whose completion time has passed
    fn matured_purchases(&self, now: DateTime<Utc>) -> Vec<Purchase>;

    /// active → completed. `None` if someone else already completed it.
    fn complete_purchase(&self, id: &PurchaseId, now: DateTime<Utc>) -> Option<Purchase>;

    /// completed → active, for a return that could not be paid
    fn reactivate_purchase(&self, id: &PurchaseId) -> bool;

    fn undistributed_referrals(&self) -> Vec<Purchase>;

    fn claim_referral(&self, id: &PurchaseId) -> bool;

    fn release_referral(&self, id: &PurchaseId);

    fn unevaluated_team_volume(&self) -> Vec<Purchase>;

    fn claim_team_volume(&self, id: &PurchaseId) -> bool;

    /// Units of `user` still active
    fn active_units(&self, user: &UserId) -> u32;
}

pub trait NetworkRepository: Send + Sync {
    fn upline_link(&self, user: &UserId) -> Option<UplineLink>;

    fn insert_link(&self, link: UplineLink) -> Result<()>;

    fn direct_referrals(&self, user: &UserId) -> Vec<UserId>;

    fn legs(&self, user: &UserId) -> LegsCounter;

    /// Saturating adjustment of both leg counts
    fn adjust_legs(&self, user: &UserId, total_delta: i32, active_delta: i32) -> LegsCounter;

    fn team_business(&self, user: &UserId) -> Option<TeamBusiness>;

    /// Read-modify-write of a user's team business under the table lock
    fn modify_team_business(
        &self,
        user: &UserId,
        f: &mut dyn FnMut(&mut TeamBusiness),
    ) -> TeamBusiness;

    fn income_hold(&self, user: &UserId) -> IncomeHold;

    fn modify_income_hold(&self, user: &UserId, f: &mut dyn FnMut(&mut IncomeHold)) -> IncomeHold;

    fn user_cycles(&self, user: &UserId) -> Vec<UserCycle>;

    /// Upsert the rollup for (user, cycle); `seed` is used when none exists
    fn modify_user_cycle(
        &self,
        seed: UserCycle,
        f: &mut dyn FnMut(&mut UserCycle),
    ) -> UserCycle;
}

pub trait TransferRepository: Send + Sync {
    fn enqueue_transfer(&self, transfer: PendingTransfer) -> Result<()>;

    fn transfer(&self, id: &TransferId) -> Result<PendingTransfer>;

    fn transfers(&self, status: Option<TransferStatus>) -> Vec<PendingTransfer>;

    /// Whether a transfer of `kind` was ever queued for `reference_id`, archived ones included
    fn has_transfer(&self, reference_id: &str, kind: TransferKind) -> bool;

    /// Move up to `limit` oldest pending transfers to processing
    fn claim_pending(&self, limit: usize, now: DateTime<Utc>) -> Vec<PendingTransfer>;

    /// Return processing transfers last touched before `stale_before` to pending.
    /// Used at startup for batches interrupted by a shutdown.
    fn requeue_stale(&self, stale_before: DateTime<Utc>, now: DateTime<Utc>) -> usize;

    fn complete_transfer(
        &self,
        id: &TransferId,
        tx_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<PendingTransfer>;

    /// Count a failed attempt; pending again until `max_retries`, then failed
    fn fail_transfer(
        &self,
        id: &TransferId,
        reason: &str,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<PendingTransfer>;

    /// Move terminal transfers last touched before `cutoff` into the archive
    fn archive_terminal(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Vec<ArchivedTransfer>;

    fn archived_transfers(&self) -> Vec<ArchivedTransfer>;
}

pub trait EventRepository: Send + Sync {
    fn append_event(&self, event: SystemEvent);

    /// Newest first, at or above `min_severity`
    fn recent_events(&self, min_severity: Severity, limit: usize) -> Vec<SystemEvent>;
}

/// Everything the core needs from persistence
pub trait Store:
    CycleRepository
    + AccountRepository
    + EarningRepository
    + PurchaseRepository
    + NetworkRepository
    + TransferRepository
    + EventRepository
{
}

impl<T> Store for T where
    T: CycleRepository
        + AccountRepository
        + EarningRepository
        + PurchaseRepository
        + NetworkRepository
        + TransferRepository
        + EventRepository
{
}
