//! Ledger records
//!
//! These are the persisted shapes. Components never hold them across a storage
//! call; they re-read what they need so concurrent writers are always observed.
//!
//! ```text
//!   Cycle ──1:N──► Purchase ──matures──► Earning(return)
//!     │                │
//!     │                ├──► Earning(referral) × upline levels
//!     │                └──► TeamBusiness volume ──rank up──► Earning(team_reward)
//!     │
//!     └──fill──► DistributionPipeline ──► PendingTransfer (outbox)
//! ```

use crate::types::{CycleId, EarningId, EntryId, PurchaseId, TransferId, UserId};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Cycles
// ---------------------------------------------------------------------------

/// Lifecycle of a bid cycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleStatus {
    Pending,
    Open,
    Closed,
}

impl fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Open => "open",
            Self::Closed => "closed",
        })
    }
}

/// Trigger and growth settings captured on each cycle when it is created
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GrowthConfig {
    /// Capacity multiplier between consecutive cycles
    pub growth_rate: Decimal,
    /// Next cycle only opens once the current one has filled
    pub only_open_when_filled: bool,
    /// Close as soon as `filled == capacity`
    pub auto_close_when_filled: bool,
    /// Informational daily profit rate shown with the cycle
    pub profit_distribution_day: Decimal,
}

impl Default for GrowthConfig {
    fn default() -> Self {
        Self {
            growth_rate: Decimal::new(13, 1),
            only_open_when_filled: true,
            auto_close_when_filled: true,
            profit_distribution_day: Decimal::new(6, 3),
        }
    }
}

/// A capacity-limited round of purchasable units
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cycle {
    pub id: CycleId,
    /// Progression index; the first ever cycle is 0
    pub index: u32,
    /// Local calendar date the cycle was created for
    pub date: NaiveDate,
    pub capacity: u32,
    pub filled: u32,
    pub status: CycleStatus,
    pub open_time: DateTime<Utc>,
    pub close_time: Option<DateTime<Utc>>,
    pub growth: GrowthConfig,
    pub created_at: DateTime<Utc>,
}

impl Cycle {
    /// Units still available
    pub fn remaining(&self) -> u32 {
        self.capacity.saturating_sub(self.filled)
    }

    pub fn is_full(&self) -> bool {
        self.filled >= self.capacity
    }

    pub fn is_open(&self) -> bool {
        self.status == CycleStatus::Open
    }

    /// Closed while units were still available
    pub fn is_improperly_closed(&self) -> bool {
        self.status == CycleStatus::Closed && self.filled < self.capacity
    }
}

// ---------------------------------------------------------------------------
// Purchases
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurchaseStatus {
    Pending,
    Active,
    Completed,
}

/// One purchased unit
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Purchase {
    pub id: PurchaseId,
    pub user_id: UserId,
    pub cycle_id: CycleId,
    /// Unit price at the time of purchase
    pub amount: Decimal,
    /// 1-based position within the cycle
    pub order: u32,
    pub status: PurchaseStatus,
    pub activation_time: DateTime<Utc>,
    /// Maturity instant
    pub completion_time: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Referral commissions have been propagated for this unit
    #[serde(default)]
    pub referral_distributed: bool,
    /// Team volume has been credited for this unit
    #[serde(default)]
    pub team_evaluated: bool,
}

impl Purchase {
    pub fn is_matured(&self, now: DateTime<Utc>) -> bool {
        self.status == PurchaseStatus::Active && self.completion_time <= now
    }
}

/// A validated purchase ready for the atomic commit
#[derive(Clone, Debug)]
pub struct PurchaseOrder {
    pub user_id: UserId,
    pub cycle_id: CycleId,
    pub quantity: u32,
    pub unit_price: Decimal,
    pub total_cost: Decimal,
    pub activation_time: DateTime<Utc>,
    pub completion_time: DateTime<Utc>,
}

/// What the atomic commit produced
#[derive(Clone, Debug)]
pub struct PurchaseReceipt {
    pub cycle: Cycle,
    pub purchases: Vec<Purchase>,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub ledger_entry: EntryId,
}

impl PurchaseReceipt {
    pub fn filled_cycle(&self) -> bool {
        self.cycle.is_full()
    }
}

// ---------------------------------------------------------------------------
// Accounts & ledger
// ---------------------------------------------------------------------------

/// User account with its internal balance
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub user_id: UserId,
    pub balance: Decimal,
    /// External address for payouts; internal credit when absent
    pub payout_address: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Deposit,
    Investment,
}

/// Money moving into the platform; the fee stage consumes these
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub user_id: UserId,
    pub amount: Decimal,
    pub kind: EntryKind,
    /// External reference (deposit tx hash, cycle id)
    pub reference: String,
    pub fee_processed: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Earnings
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EarningKind {
    Referral,
    Return,
    TeamReward,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EarningStatus {
    /// Held while the beneficiary is on income hold
    Pending,
    /// Credited to the balance
    Processed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Earning {
    pub id: EarningId,
    pub user_id: UserId,
    /// Purchase id, rank level or other origin of the earning
    pub source_id: String,
    pub amount: Decimal,
    pub kind: EarningKind,
    /// Upline level for referral, rank level for team rewards
    pub level: Option<u8>,
    pub status: EarningStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Earning {
    pub fn new(
        user_id: UserId,
        source_id: impl Into<String>,
        amount: Decimal,
        kind: EarningKind,
        level: Option<u8>,
        status: EarningStatus,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EarningId::new(),
            user_id,
            source_id: source_id.into(),
            amount,
            kind,
            level,
            status,
            created_at: now,
            processed_at: (status == EarningStatus::Processed).then_some(now),
        }
    }
}

// ---------------------------------------------------------------------------
// Referral network
// ---------------------------------------------------------------------------

/// Edge from a user to the person who referred them
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UplineLink {
    pub user_id: UserId,
    pub referrer_id: UserId,
    /// Distance from the root of the referrer's tree
    pub depth: u32,
}

/// Direct-referral legs of a user
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegsCounter {
    pub user_id: UserId,
    pub total_legs: u32,
    /// Direct referrals that currently hold an active unit
    pub active_legs: u32,
}

impl LegsCounter {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            total_legs: 0,
            active_legs: 0,
        }
    }
}

/// Accumulated team volume and achieved rank
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TeamBusiness {
    pub user_id: UserId,
    pub volume: Decimal,
    pub rank_level: u8,
    pub last_calculated_at: Option<DateTime<Utc>>,
}

impl TeamBusiness {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            volume: Decimal::ZERO,
            rank_level: 0,
            last_calculated_at: None,
        }
    }
}

/// Income suspension flags
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomeHold {
    pub user_id: UserId,
    pub referral_on_hold: bool,
    pub team_reward_on_hold: bool,
    /// Highest active unit count seen; dropping below it puts income on hold
    pub baseline_unit_count: u32,
    pub last_purchase_at: Option<DateTime<Utc>>,
}

impl IncomeHold {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            referral_on_hold: false,
            team_reward_on_hold: false,
            baseline_unit_count: 0,
            last_purchase_at: None,
        }
    }

    pub fn any_hold(&self) -> bool {
        self.referral_on_hold || self.team_reward_on_hold
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserCycleStatus {
    Active,
    Completed,
}

/// Per-user participation in one cycle
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserCycle {
    pub user_id: UserId,
    pub cycle_id: CycleId,
    pub cycle_number: u32,
    /// Per-purchase ceiling derived from the user's own progression
    pub units_allowed: u32,
    pub units_bought: u32,
    pub amount: Decimal,
    pub status: UserCycleStatus,
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    AdminFee,
    RewardsPool,
    Return,
    Referral,
    TeamReward,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AdminFee => "admin_fee",
            Self::RewardsPool => "rewards_pool",
            Self::Return => "return",
            Self::Referral => "referral",
            Self::TeamReward => "team_reward",
        })
    }
}

/// Value leaving the system through the settlement network
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingTransfer {
    pub id: TransferId,
    pub source_wallet_id: String,
    pub destination_address: String,
    pub amount: Decimal,
    pub kind: TransferKind,
    /// Id of the entity that produced the transfer
    pub reference_id: String,
    pub status: TransferStatus,
    pub retry_count: u32,
    pub tx_hash: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PendingTransfer {
    pub fn new(
        source_wallet_id: impl Into<String>,
        destination_address: impl Into<String>,
        amount: Decimal,
        kind: TransferKind,
        reference_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TransferId::new(),
            source_wallet_id: source_wallet_id.into(),
            destination_address: destination_address.into(),
            amount,
            kind,
            reference_id: reference_id.into(),
            status: TransferStatus::Pending,
            retry_count: 0,
            tx_hash: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Terminal transfer moved out of the active outbox
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArchivedTransfer {
    pub transfer: PendingTransfer,
    pub archived_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn cycle(capacity: u32, filled: u32, status: CycleStatus) -> Cycle {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        Cycle {
            id: CycleId::new(),
            index: 0,
            date: now.date_naive(),
            capacity,
            filled,
            status,
            open_time: now,
            close_time: None,
            growth: GrowthConfig::default(),
            created_at: now,
        }
    }

    #[test]
    fn test_cycle_remaining() {
        assert_eq!(cycle(5, 3, CycleStatus::Open).remaining(), 2);
        assert!(cycle(5, 5, CycleStatus::Open).is_full());
        assert!(!cycle(5, 4, CycleStatus::Open).is_full());
    }

    #[test]
    fn test_improperly_closed() {
        assert!(cycle(5, 3, CycleStatus::Closed).is_improperly_closed());
        assert!(!cycle(5, 5, CycleStatus::Closed).is_improperly_closed());
        assert!(!cycle(5, 3, CycleStatus::Open).is_improperly_closed());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&CycleStatus::Open).unwrap(),
            "\"open\""
        );
        assert_eq!(
            serde_json::to_string(&EarningKind::TeamReward).unwrap(),
            "\"team_reward\""
        );
    }

    #[test]
    fn test_processed_earning_is_stamped() {
        let now = Utc::now();
        let e = Earning::new(
            UserId::new("a"),
            "p1",
            Decimal::ONE,
            EarningKind::Referral,
            Some(1),
            EarningStatus::Processed,
            now,
        );
        assert_eq!(e.processed_at, Some(now));

        let held = Earning::new(
            UserId::new("a"),
            "p1",
            Decimal::ONE,
            EarningKind::Referral,
            Some(1),
            EarningStatus::Pending,
            now,
        );
        assert!(held.processed_at.is_none());
    }
}
