//! In-memory store
//!
//! All tables sit behind a single `RwLock` so a repository call that touches
//! several of them (a purchase debits an account, appends units, bumps the
//! cycle and writes a ledger entry) commits as one unit.

use crate::repository::*;
use bidloop_core::money;
use bidloop_core::prelude::*;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Events retained in memory
const MAX_EVENTS: usize = 10_000;

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct Tables {
    pub(crate) cycles: HashMap<CycleId, Cycle>,
    pub(crate) purchases: HashMap<PurchaseId, Purchase>,
    pub(crate) accounts: HashMap<UserId, Account>,
    pub(crate) ledger: HashMap<EntryId, LedgerEntry>,
    pub(crate) earnings: HashMap<EarningId, Earning>,
    pub(crate) links: HashMap<UserId, UplineLink>,
    pub(crate) legs: HashMap<UserId, LegsCounter>,
    pub(crate) team: HashMap<UserId, TeamBusiness>,
    pub(crate) holds: HashMap<UserId, IncomeHold>,
    pub(crate) user_cycles: Vec<UserCycle>,
    pub(crate) transfers: HashMap<TransferId, PendingTransfer>,
    pub(crate) archive: Vec<ArchivedTransfer>,
    pub(crate) events: VecDeque<SystemEvent>,
}

impl Tables {
    fn sorted_cycles(&self) -> Vec<Cycle> {
        let mut cycles: Vec<Cycle> = self.cycles.values().cloned().collect();
        cycles.sort_by(|a, b| a.index.cmp(&b.index).then(a.created_at.cmp(&b.created_at)));
        cycles
    }

    fn other_open(&self, except: &CycleId) -> Option<CycleId> {
        self.cycles
            .values()
            .find(|c| c.status == CycleStatus::Open && c.id != *except)
            .map(|c| c.id)
    }
}

/// Thread-safe in-memory implementation of every repository
#[derive(Debug, Default)]
pub struct MemoryStore {
    pub(crate) tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_tables(tables: Tables) -> Self {
        Self {
            tables: RwLock::new(tables),
        }
    }
}

impl CycleRepository for MemoryStore {
    fn cycle(&self, id: &CycleId) -> Result<Cycle> {
        self.tables
            .read()
            .cycles
            .get(id)
            .cloned()
            .ok_or(BidError::CycleNotFound(*id))
    }

    fn open_cycle(&self) -> Option<Cycle> {
        self.open_cycles().pop()
    }

    fn open_cycles(&self) -> Vec<Cycle> {
        self.tables
            .read()
            .sorted_cycles()
            .into_iter()
            .filter(|c| c.status == CycleStatus::Open)
            .collect()
    }

    fn latest_pending(&self) -> Option<Cycle> {
        self.tables
            .read()
            .sorted_cycles()
            .into_iter()
            .filter(|c| c.status == CycleStatus::Pending)
            .last()
    }

    fn first_cycle(&self) -> Option<Cycle> {
        self.tables
            .read()
            .cycles
            .values()
            .min_by_key(|c| c.created_at)
            .cloned()
    }

    fn latest_cycle(&self) -> Option<Cycle> {
        self.tables.read().sorted_cycles().pop()
    }

    fn cycles(&self) -> Vec<Cycle> {
        self.tables.read().sorted_cycles()
    }

    fn cycle_counts(&self) -> CycleCounts {
        let tables = self.tables.read();
        let mut counts = CycleCounts {
            total: tables.cycles.len(),
            ..Default::default()
        };
        for cycle in tables.cycles.values() {
            match cycle.status {
                CycleStatus::Pending => counts.pending += 1,
                CycleStatus::Open => counts.open += 1,
                CycleStatus::Closed => counts.closed += 1,
            }
        }
        counts
    }

    fn insert_cycle(&self, cycle: Cycle) -> Result<Cycle> {
        let mut tables = self.tables.write();
        if cycle.status == CycleStatus::Open {
            if let Some(open) = tables.other_open(&cycle.id) {
                return Err(BidError::ConsistencyViolation(format!(
                    "cannot open cycle {}: cycle {} is already open",
                    cycle.id, open
                )));
            }
        }
        if cycle.filled > cycle.capacity {
            return Err(BidError::ConsistencyViolation(format!(
                "cycle {} filled {} exceeds capacity {}",
                cycle.id, cycle.filled, cycle.capacity
            )));
        }
        tables.cycles.insert(cycle.id, cycle.clone());
        Ok(cycle)
    }

    fn open_pending(&self, id: &CycleId, now: DateTime<Utc>) -> Result<Option<Cycle>> {
        let mut tables = self.tables.write();
        let status = tables
            .cycles
            .get(id)
            .map(|c| c.status)
            .ok_or(BidError::CycleNotFound(*id))?;
        if status != CycleStatus::Pending {
            return Ok(None);
        }
        if let Some(open) = tables.other_open(id) {
            return Err(BidError::ConsistencyViolation(format!(
                "cannot open cycle {id}: cycle {open} is already open"
            )));
        }
        let cycle = tables
            .cycles
            .get_mut(id)
            .ok_or(BidError::CycleNotFound(*id))?;
        cycle.status = CycleStatus::Open;
        if cycle.open_time > now {
            cycle.open_time = now;
        }
        Ok(Some(cycle.clone()))
    }

    fn close_if_filled(&self, id: &CycleId, now: DateTime<Utc>) -> Result<Option<Cycle>> {
        let mut tables = self.tables.write();
        let cycle = tables
            .cycles
            .get_mut(id)
            .ok_or(BidError::CycleNotFound(*id))?;
        if cycle.status != CycleStatus::Open || cycle.filled < cycle.capacity {
            return Ok(None);
        }
        cycle.status = CycleStatus::Closed;
        cycle.close_time = Some(now);
        Ok(Some(cycle.clone()))
    }

    fn reopen(&self, id: &CycleId) -> Result<Cycle> {
        let mut tables = self.tables.write();
        if let Some(open) = tables.other_open(id) {
            return Err(BidError::ConsistencyViolation(format!(
                "cannot reopen cycle {id}: cycle {open} is already open"
            )));
        }
        let cycle = tables
            .cycles
            .get_mut(id)
            .ok_or(BidError::CycleNotFound(*id))?;
        if !cycle.is_improperly_closed() {
            return Err(BidError::NothingToRecover);
        }
        cycle.status = CycleStatus::Open;
        cycle.close_time = None;
        Ok(cycle.clone())
    }
}

impl AccountRepository for MemoryStore {
    fn create_account(&self, account: Account) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.accounts.contains_key(&account.user_id) {
            return Err(BidError::UserExists(account.user_id));
        }
        tables.accounts.insert(account.user_id.clone(), account);
        Ok(())
    }

    fn account(&self, user: &UserId) -> Result<Account> {
        self.tables
            .read()
            .accounts
            .get(user)
            .cloned()
            .ok_or_else(|| BidError::UserNotFound(user.clone()))
    }

    fn accounts(&self) -> Vec<Account> {
        self.tables.read().accounts.values().cloned().collect()
    }

    fn set_payout_address(&self, user: &UserId, address: Option<String>) -> Result<()> {
        let mut tables = self.tables.write();
        let account = tables
            .accounts
            .get_mut(user)
            .ok_or_else(|| BidError::UserNotFound(user.clone()))?;
        account.payout_address = address;
        Ok(())
    }

    fn credit(&self, user: &UserId, amount: Decimal) -> Result<Decimal> {
        let mut tables = self.tables.write();
        let account = tables
            .accounts
            .get_mut(user)
            .ok_or_else(|| BidError::UserNotFound(user.clone()))?;
        account.balance = money::non_negative(account.balance + amount);
        Ok(account.balance)
    }

    fn record_deposit(
        &self,
        user: &UserId,
        amount: Decimal,
        reference: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<LedgerEntry>> {
        let mut tables = self.tables.write();
        let duplicate = tables
            .ledger
            .values()
            .any(|e| e.kind == EntryKind::Deposit && e.reference == reference);
        if duplicate {
            return Ok(None);
        }
        let account = tables
            .accounts
            .get_mut(user)
            .ok_or_else(|| BidError::UserNotFound(user.clone()))?;
        account.balance += amount;

        let entry = LedgerEntry {
            id: EntryId::new(),
            user_id: user.clone(),
            amount,
            kind: EntryKind::Deposit,
            reference: reference.to_string(),
            fee_processed: false,
            created_at: now,
        };
        tables.ledger.insert(entry.id, entry.clone());
        Ok(Some(entry))
    }

    fn unprocessed_entries(&self) -> Vec<LedgerEntry> {
        let mut entries: Vec<LedgerEntry> = self
            .tables
            .read()
            .ledger
            .values()
            .filter(|e| !e.fee_processed)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.created_at);
        entries
    }

    fn claim_fee_processing(&self, id: &EntryId) -> bool {
        match self.tables.write().ledger.get_mut(id) {
            Some(entry) if !entry.fee_processed => {
                entry.fee_processed = true;
                true
            }
            _ => false,
        }
    }

    fn release_fee_processing(&self, id: &EntryId) {
        if let Some(entry) = self.tables.write().ledger.get_mut(id) {
            entry.fee_processed = false;
        }
    }

    fn ledger_entries(&self, user: &UserId) -> Vec<LedgerEntry> {
        let mut entries: Vec<LedgerEntry> = self
            .tables
            .read()
            .ledger
            .values()
            .filter(|e| &e.user_id == user)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.created_at);
        entries
    }
}

impl EarningRepository for MemoryStore {
    fn record_earning(&self, earning: Earning) -> Result<Earning> {
        let mut tables = self.tables.write();
        let account = tables
            .accounts
            .get_mut(&earning.user_id)
            .ok_or_else(|| BidError::UserNotFound(earning.user_id.clone()))?;
        if earning.status == EarningStatus::Processed {
            account.balance += earning.amount;
        }
        tables.earnings.insert(earning.id, earning.clone());
        Ok(earning)
    }

    fn insert_earning(&self, earning: Earning) -> Result<Earning> {
        let mut tables = self.tables.write();
        if !tables.accounts.contains_key(&earning.user_id) {
            return Err(BidError::UserNotFound(earning.user_id.clone()));
        }
        tables.earnings.insert(earning.id, earning.clone());
        Ok(earning)
    }

    fn earnings_for(&self, user: &UserId) -> Vec<Earning> {
        let mut earnings: Vec<Earning> = self
            .tables
            .read()
            .earnings
            .values()
            .filter(|e| &e.user_id == user)
            .cloned()
            .collect();
        earnings.sort_by_key(|e| e.created_at);
        earnings
    }

    fn earnings(&self) -> Vec<Earning> {
        let mut earnings: Vec<Earning> = self.tables.read().earnings.values().cloned().collect();
        earnings.sort_by_key(|e| e.created_at);
        earnings
    }

    fn has_earning(&self, source_id: &str, kind: EarningKind, level: Option<u8>) -> bool {
        self.tables.read().earnings.values().any(|e| {
            e.source_id == source_id && e.kind == kind && (level.is_none() || e.level == level)
        })
    }

    fn release_pending(
        &self,
        user: &UserId,
        kinds: &[EarningKind],
        now: DateTime<Utc>,
    ) -> Result<Vec<Earning>> {
        let mut guard = self.tables.write();
        let tables = &mut *guard;
        let account = tables
            .accounts
            .get_mut(user)
            .ok_or_else(|| BidError::UserNotFound(user.clone()))?;

        let mut released = Vec::new();
        for earning in tables.earnings.values_mut() {
            if &earning.user_id == user
                && earning.status == EarningStatus::Pending
                && kinds.contains(&earning.kind)
            {
                earning.status = EarningStatus::Processed;
                earning.processed_at = Some(now);
                account.balance += earning.amount;
                released.push(earning.clone());
            }
        }
        released.sort_by_key(|e| e.created_at);
        Ok(released)
    }
}

impl PurchaseRepository for MemoryStore {
    fn commit_purchase(&self, order: &PurchaseOrder) -> Result<PurchaseReceipt> {
        let mut guard = self.tables.write();
        let tables = &mut *guard;

        let cycle = tables
            .cycles
            .get_mut(&order.cycle_id)
            .ok_or(BidError::CycleNotFound(order.cycle_id))?;
        if cycle.status != CycleStatus::Open {
            return Err(BidError::CycleNotOpen {
                cycle_id: cycle.id,
                status: cycle.status,
            });
        }
        if order.quantity == 0 {
            return Err(BidError::InvalidQuantity(0));
        }
        let available = cycle.remaining();
        if order.quantity > available {
            return Err(BidError::CapacityExceeded { available });
        }
        let new_filled = cycle.filled.saturating_add(order.quantity);
        if new_filled > cycle.capacity {
            return Err(BidError::ConsistencyViolation(format!(
                "purchase would overfill cycle {}: {} > {}",
                cycle.id, new_filled, cycle.capacity
            )));
        }

        let account = tables
            .accounts
            .get_mut(&order.user_id)
            .ok_or_else(|| BidError::UserNotFound(order.user_id.clone()))?;
        let balance_before = account.balance;
        if balance_before < order.total_cost {
            return Err(BidError::InsufficientBalance {
                required: order.total_cost,
                available: balance_before,
            });
        }

        // every check passed; apply
        account.balance = money::non_negative(balance_before - order.total_cost);
        let balance_after = account.balance;

        let mut purchases = Vec::with_capacity(order.quantity as usize);
        for i in 0..order.quantity {
            let purchase = Purchase {
                id: PurchaseId::new(),
                user_id: order.user_id.clone(),
                cycle_id: cycle.id,
                amount: order.unit_price,
                order: cycle.filled + i + 1,
                status: PurchaseStatus::Active,
                activation_time: order.activation_time,
                completion_time: order.completion_time,
                completed_at: None,
                referral_distributed: false,
                team_evaluated: false,
            };
            tables.purchases.insert(purchase.id, purchase.clone());
            purchases.push(purchase);
        }
        cycle.filled = new_filled;
        let cycle = cycle.clone();

        let entry = LedgerEntry {
            id: EntryId::new(),
            user_id: order.user_id.clone(),
            amount: order.total_cost,
            kind: EntryKind::Investment,
            reference: cycle.id.to_string(),
            fee_processed: false,
            created_at: order.activation_time,
        };
        let ledger_entry = entry.id;
        tables.ledger.insert(entry.id, entry);

        Ok(PurchaseReceipt {
            cycle,
            purchases,
            balance_before,
            balance_after,
            ledger_entry,
        })
    }

    fn purchase(&self, id: &PurchaseId) -> Option<Purchase> {
        self.tables.read().purchases.get(id).cloned()
    }

    fn purchases_for_cycle(&self, cycle: &CycleId) -> Vec<Purchase> {
        let mut purchases: Vec<Purchase> = self
            .tables
            .read()
            .purchases
            .values()
            .filter(|p| &p.cycle_id == cycle)
            .cloned()
            .collect();
        purchases.sort_by_key(|p| p.order);
        purchases
    }

    fn purchases_for_user(&self, user: &UserId) -> Vec<Purchase> {
        let mut purchases: Vec<Purchase> = self
            .tables
            .read()
            .purchases
            .values()
            .filter(|p| &p.user_id == user)
            .cloned()
            .collect();
        purchases.sort_by(|a, b| a.activation_time.cmp(&b.activation_time).then(a.order.cmp(&b.order)));
        purchases
    }

    fn matured_purchases(&self, now: DateTime<Utc>) -> Vec<Purchase> {
        let mut purchases: Vec<Purchase> = self
            .tables
            .read()
            .purchases
            .values()
            .filter(|p| p.is_matured(now))
            .cloned()
            .collect();
        purchases.sort_by_key(|p| p.completion_time);
        purchases
    }

    fn complete_purchase(&self, id: &PurchaseId, now: DateTime<Utc>) -> Option<Purchase> {
        let mut tables = self.tables.write();
        let purchase = tables.purchases.get_mut(id)?;
        if purchase.status != PurchaseStatus::Active {
            return None;
        }
        purchase.status = PurchaseStatus::Completed;
        purchase.completed_at = Some(now);
        Some(purchase.clone())
    }

    fn reactivate_purchase(&self, id: &PurchaseId) -> bool {
        match self.tables.write().purchases.get_mut(id) {
            Some(p) if p.status == PurchaseStatus::Completed => {
                p.status = PurchaseStatus::Active;
                p.completed_at = None;
                true
            }
            _ => false,
        }
    }

    fn undistributed_referrals(&self) -> Vec<Purchase> {
        let mut purchases: Vec<Purchase> = self
            .tables
            .read()
            .purchases
            .values()
            .filter(|p| !p.referral_distributed)
            .cloned()
            .collect();
        purchases.sort_by_key(|p| p.activation_time);
        purchases
    }

    fn claim_referral(&self, id: &PurchaseId) -> bool {
        match self.tables.write().purchases.get_mut(id) {
            Some(p) if !p.referral_distributed => {
                p.referral_distributed = true;
                true
            }
            _ => false,
        }
    }

    fn release_referral(&self, id: &PurchaseId) {
        if let Some(p) = self.tables.write().purchases.get_mut(id) {
            p.referral_distributed = false;
        }
    }

    fn unevaluated_team_volume(&self) -> Vec<Purchase> {
        let mut purchases: Vec<Purchase> = self
            .tables
            .read()
            .purchases
            .values()
            .filter(|p| !p.team_evaluated)
            .cloned()
            .collect();
        purchases.sort_by_key(|p| p.activation_time);
        purchases
    }

    fn claim_team_volume(&self, id: &PurchaseId) -> bool {
        match self.tables.write().purchases.get_mut(id) {
            Some(p) if !p.team_evaluated => {
                p.team_evaluated = true;
                true
            }
            _ => false,
        }
    }

    fn active_units(&self, user: &UserId) -> u32 {
        self.tables
            .read()
            .purchases
            .values()
            .filter(|p| &p.user_id == user && p.status == PurchaseStatus::Active)
            .count() as u32
    }
}

impl NetworkRepository for MemoryStore {
    fn upline_link(&self, user: &UserId) -> Option<UplineLink> {
        self.tables.read().links.get(user).cloned()
    }

    fn insert_link(&self, link: UplineLink) -> Result<()> {
        let mut tables = self.tables.write();
        // walking up from the referrer must never reach the new user
        let mut cursor = Some(link.referrer_id.clone());
        let mut steps = 0usize;
        while let Some(current) = cursor {
            if current == link.user_id {
                return Err(BidError::ReferralLoop {
                    user: link.user_id.clone(),
                    referrer: link.referrer_id.clone(),
                });
            }
            steps += 1;
            if steps > tables.links.len() {
                break;
            }
            cursor = tables.links.get(&current).map(|l| l.referrer_id.clone());
        }
        tables.links.insert(link.user_id.clone(), link);
        Ok(())
    }

    fn direct_referrals(&self, user: &UserId) -> Vec<UserId> {
        let mut referrals: Vec<UserId> = self
            .tables
            .read()
            .links
            .values()
            .filter(|l| &l.referrer_id == user)
            .map(|l| l.user_id.clone())
            .collect();
        referrals.sort();
        referrals
    }

    fn legs(&self, user: &UserId) -> LegsCounter {
        self.tables
            .read()
            .legs
            .get(user)
            .cloned()
            .unwrap_or_else(|| LegsCounter::new(user.clone()))
    }

    fn adjust_legs(&self, user: &UserId, total_delta: i32, active_delta: i32) -> LegsCounter {
        let mut tables = self.tables.write();
        let legs = tables
            .legs
            .entry(user.clone())
            .or_insert_with(|| LegsCounter::new(user.clone()));
        legs.total_legs = legs.total_legs.saturating_add_signed(total_delta);
        legs.active_legs = legs.active_legs.saturating_add_signed(active_delta);
        legs.active_legs = legs.active_legs.min(legs.total_legs);
        legs.clone()
    }

    fn team_business(&self, user: &UserId) -> Option<TeamBusiness> {
        self.tables.read().team.get(user).cloned()
    }

    fn modify_team_business(
        &self,
        user: &UserId,
        f: &mut dyn FnMut(&mut TeamBusiness),
    ) -> TeamBusiness {
        let mut tables = self.tables.write();
        let business = tables
            .team
            .entry(user.clone())
            .or_insert_with(|| TeamBusiness::new(user.clone()));
        f(business);
        business.clone()
    }

    fn income_hold(&self, user: &UserId) -> IncomeHold {
        self.tables
            .read()
            .holds
            .get(user)
            .cloned()
            .unwrap_or_else(|| IncomeHold::new(user.clone()))
    }

    fn modify_income_hold(&self, user: &UserId, f: &mut dyn FnMut(&mut IncomeHold)) -> IncomeHold {
        let mut tables = self.tables.write();
        let hold = tables
            .holds
            .entry(user.clone())
            .or_insert_with(|| IncomeHold::new(user.clone()));
        f(hold);
        hold.clone()
    }

    fn user_cycles(&self, user: &UserId) -> Vec<UserCycle> {
        let mut rollups: Vec<UserCycle> = self
            .tables
            .read()
            .user_cycles
            .iter()
            .filter(|uc| &uc.user_id == user)
            .cloned()
            .collect();
        rollups.sort_by_key(|uc| uc.cycle_number);
        rollups
    }

    fn modify_user_cycle(
        &self,
        seed: UserCycle,
        f: &mut dyn FnMut(&mut UserCycle),
    ) -> UserCycle {
        let mut tables = self.tables.write();
        let pos = tables
            .user_cycles
            .iter()
            .position(|uc| uc.user_id == seed.user_id && uc.cycle_id == seed.cycle_id);
        let rollup = match pos {
            Some(i) => &mut tables.user_cycles[i],
            None => {
                tables.user_cycles.push(seed);
                let last = tables.user_cycles.len() - 1;
                &mut tables.user_cycles[last]
            }
        };
        f(rollup);
        rollup.clone()
    }
}

impl TransferRepository for MemoryStore {
    fn enqueue_transfer(&self, transfer: PendingTransfer) -> Result<()> {
        if transfer.amount <= Decimal::ZERO {
            return Err(BidError::Internal(format!(
                "refusing to queue non-positive transfer {}",
                transfer.id
            )));
        }
        self.tables.write().transfers.insert(transfer.id, transfer);
        Ok(())
    }

    fn transfer(&self, id: &TransferId) -> Result<PendingTransfer> {
        self.tables
            .read()
            .transfers
            .get(id)
            .cloned()
            .ok_or(BidError::TransferNotFound(*id))
    }

    fn transfers(&self, status: Option<TransferStatus>) -> Vec<PendingTransfer> {
        let mut transfers: Vec<PendingTransfer> = self
            .tables
            .read()
            .transfers
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        transfers.sort_by_key(|t| t.created_at);
        transfers
    }

    fn has_transfer(&self, reference_id: &str, kind: TransferKind) -> bool {
        let tables = self.tables.read();
        tables
            .transfers
            .values()
            .chain(tables.archive.iter().map(|a| &a.transfer))
            .any(|t| t.reference_id == reference_id && t.kind == kind)
    }

    fn claim_pending(&self, limit: usize, now: DateTime<Utc>) -> Vec<PendingTransfer> {
        let mut tables = self.tables.write();
        let mut ids: Vec<(DateTime<Utc>, TransferId)> = tables
            .transfers
            .values()
            .filter(|t| t.status == TransferStatus::Pending)
            .map(|t| (t.created_at, t.id))
            .collect();
        ids.sort();
        ids.truncate(limit);

        let mut claimed = Vec::with_capacity(ids.len());
        for (_, id) in ids {
            if let Some(t) = tables.transfers.get_mut(&id) {
                t.status = TransferStatus::Processing;
                t.updated_at = now;
                claimed.push(t.clone());
            }
        }
        claimed
    }

    fn requeue_stale(&self, stale_before: DateTime<Utc>, now: DateTime<Utc>) -> usize {
        let mut tables = self.tables.write();
        let mut requeued = 0;
        for t in tables.transfers.values_mut() {
            if t.status == TransferStatus::Processing && t.updated_at < stale_before {
                t.status = TransferStatus::Pending;
                t.updated_at = now;
                requeued += 1;
            }
        }
        requeued
    }

    fn complete_transfer(
        &self,
        id: &TransferId,
        tx_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<PendingTransfer> {
        let mut tables = self.tables.write();
        let t = tables
            .transfers
            .get_mut(id)
            .ok_or(BidError::TransferNotFound(*id))?;
        t.status = TransferStatus::Completed;
        t.tx_hash = Some(tx_hash.to_string());
        t.last_error = None;
        t.updated_at = now;
        Ok(t.clone())
    }

    fn fail_transfer(
        &self,
        id: &TransferId,
        reason: &str,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<PendingTransfer> {
        let mut tables = self.tables.write();
        let t = tables
            .transfers
            .get_mut(id)
            .ok_or(BidError::TransferNotFound(*id))?;
        if t.status.is_terminal() {
            return Ok(t.clone());
        }
        t.retry_count += 1;
        t.last_error = Some(reason.to_string());
        t.status = if t.retry_count >= max_retries {
            TransferStatus::Failed
        } else {
            TransferStatus::Pending
        };
        t.updated_at = now;
        Ok(t.clone())
    }

    fn archive_terminal(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Vec<ArchivedTransfer> {
        let mut tables = self.tables.write();
        let expired: Vec<TransferId> = tables
            .transfers
            .values()
            .filter(|t| t.status.is_terminal() && t.updated_at < cutoff)
            .map(|t| t.id)
            .collect();

        let mut archived = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(transfer) = tables.transfers.remove(&id) {
                let record = ArchivedTransfer {
                    transfer,
                    archived_at: now,
                };
                tables.archive.push(record.clone());
                archived.push(record);
            }
        }
        archived
    }

    fn archived_transfers(&self) -> Vec<ArchivedTransfer> {
        self.tables.read().archive.clone()
    }
}

impl EventRepository for MemoryStore {
    fn append_event(&self, event: SystemEvent) {
        let mut tables = self.tables.write();
        tables.events.push_back(event);
        while tables.events.len() > MAX_EVENTS {
            tables.events.pop_front();
        }
    }

    fn recent_events(&self, min_severity: Severity, limit: usize) -> Vec<SystemEvent> {
        self.tables
            .read()
            .events
            .iter()
            .rev()
            .filter(|e| e.severity >= min_severity)
            .take(limit)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 1, 3, 0, 0).unwrap()
    }

    fn open_cycle(store: &MemoryStore, capacity: u32, filled: u32) -> Cycle {
        let cycle = Cycle {
            id: CycleId::new(),
            index: 0,
            date: now().date_naive(),
            capacity,
            filled,
            status: CycleStatus::Open,
            open_time: now(),
            close_time: None,
            growth: GrowthConfig::default(),
            created_at: now(),
        };
        store.insert_cycle(cycle).unwrap()
    }

    fn account(store: &MemoryStore, user: &str, balance: Decimal) -> UserId {
        let id = UserId::new(user);
        store
            .create_account(Account {
                user_id: id.clone(),
                balance,
                payout_address: None,
                created_at: now(),
            })
            .unwrap();
        id
    }

    fn order(user: &UserId, cycle: &Cycle, quantity: u32) -> PurchaseOrder {
        PurchaseOrder {
            user_id: user.clone(),
            cycle_id: cycle.id,
            quantity,
            unit_price: dec!(20),
            total_cost: dec!(20) * Decimal::from(quantity),
            activation_time: now(),
            completion_time: now() + Duration::days(5),
        }
    }

    #[test]
    fn test_commit_purchase_assigns_orders() {
        let store = MemoryStore::new();
        let cycle = open_cycle(&store, 5, 0);
        let user = account(&store, "alice", dec!(100));

        let receipt = store.commit_purchase(&order(&user, &cycle, 3)).unwrap();
        let orders: Vec<u32> = receipt.purchases.iter().map(|p| p.order).collect();
        assert_eq!(orders, vec![1, 2, 3]);
        assert_eq!(receipt.cycle.filled, 3);
        assert_eq!(receipt.balance_after, dec!(40));
        assert_eq!(store.unprocessed_entries().len(), 1);
    }

    #[test]
    fn test_commit_purchase_rejects_without_side_effects() {
        let store = MemoryStore::new();
        let cycle = open_cycle(&store, 5, 3);
        let user = account(&store, "bob", dec!(1000));

        let err = store.commit_purchase(&order(&user, &cycle, 3)).unwrap_err();
        assert_eq!(err, BidError::CapacityExceeded { available: 2 });
        assert_eq!(store.cycle(&cycle.id).unwrap().filled, 3);
        assert_eq!(store.balance(&user).unwrap(), dec!(1000));
        assert!(store.purchases_for_cycle(&cycle.id).is_empty());

        let poor = account(&store, "carol", dec!(10));
        let err = store.commit_purchase(&order(&poor, &cycle, 1)).unwrap_err();
        assert!(matches!(err, BidError::InsufficientBalance { .. }));
        assert_eq!(store.cycle(&cycle.id).unwrap().filled, 3);
    }

    #[test]
    fn test_last_unit_race_has_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let cycle = open_cycle(&store, 5, 4);
        let users: Vec<UserId> = (0..8)
            .map(|i| account(&store, &format!("racer-{i}"), dec!(20)))
            .collect();

        let handles: Vec<_> = users
            .into_iter()
            .map(|user| {
                let store = Arc::clone(&store);
                let o = order(&user, &cycle, 1);
                std::thread::spawn(move || store.commit_purchase(&o))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let wins = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(wins, 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| *e == BidError::CapacityExceeded { available: 0 }));
        assert_eq!(store.cycle(&cycle.id).unwrap().filled, 5);
    }

    #[test]
    fn test_single_open_cycle_enforced() {
        let store = MemoryStore::new();
        open_cycle(&store, 5, 0);
        let second = Cycle {
            id: CycleId::new(),
            index: 1,
            date: now().date_naive(),
            capacity: 6,
            filled: 0,
            status: CycleStatus::Open,
            open_time: now(),
            close_time: None,
            growth: GrowthConfig::default(),
            created_at: now(),
        };
        assert!(matches!(
            store.insert_cycle(second),
            Err(BidError::ConsistencyViolation(_))
        ));
        assert_eq!(store.cycle_counts().open, 1);
    }

    #[test]
    fn test_close_if_filled_is_conditional() {
        let store = MemoryStore::new();
        let partial = open_cycle(&store, 5, 4);
        assert!(store.close_if_filled(&partial.id, now()).unwrap().is_none());

        let store = MemoryStore::new();
        let full = open_cycle(&store, 5, 5);
        let closed = store.close_if_filled(&full.id, now()).unwrap().unwrap();
        assert_eq!(closed.status, CycleStatus::Closed);
        assert_eq!(closed.close_time, Some(now()));
        // second call is a no-op
        assert!(store.close_if_filled(&full.id, now()).unwrap().is_none());
    }

    #[test]
    fn test_reopen_requires_improper_close() {
        let store = MemoryStore::new();
        let full = open_cycle(&store, 5, 5);
        store.close_if_filled(&full.id, now()).unwrap();
        assert_eq!(store.reopen(&full.id).unwrap_err(), BidError::NothingToRecover);

        let partial = open_cycle(&store, 5, 2);
        store.tables.write().cycles.get_mut(&partial.id).unwrap().status = CycleStatus::Closed;
        let reopened = store.reopen(&partial.id).unwrap();
        assert_eq!(reopened.status, CycleStatus::Open);
        assert!(reopened.close_time.is_none());
    }

    #[test]
    fn test_transfer_retry_then_fail() {
        let store = MemoryStore::new();
        let t = PendingTransfer::new("treasury", "0xabc", dec!(5), TransferKind::Return, "p1", now());
        let id = t.id;
        store.enqueue_transfer(t).unwrap();

        for attempt in 1..=3 {
            let claimed = store.claim_pending(10, now());
            assert_eq!(claimed.len(), 1);
            let t = store.fail_transfer(&id, "timeout", 3, now()).unwrap();
            assert_eq!(t.retry_count, attempt);
        }
        assert_eq!(store.transfer(&id).unwrap().status, TransferStatus::Failed);
        assert!(store.claim_pending(10, now()).is_empty());
    }

    #[test]
    fn test_requeue_stale_leaves_fresh_claims() {
        let store = MemoryStore::new();
        let old = PendingTransfer::new("treasury", "0xa", dec!(1), TransferKind::Return, "p1", now());
        let old_id = old.id;
        store.enqueue_transfer(old).unwrap();
        store.claim_pending(10, now());

        let later = now() + Duration::minutes(5);
        let fresh = PendingTransfer::new("treasury", "0xb", dec!(1), TransferKind::Return, "p2", later);
        let fresh_id = fresh.id;
        store.enqueue_transfer(fresh).unwrap();
        store.claim_pending(10, later);

        assert_eq!(store.requeue_stale(later, later), 1);
        assert_eq!(store.transfer(&old_id).unwrap().status, TransferStatus::Pending);
        assert_eq!(store.transfer(&fresh_id).unwrap().status, TransferStatus::Processing);
    }

    #[test]
    fn test_reactivate_completed_purchase() {
        let store = MemoryStore::new();
        let cycle = open_cycle(&store, 5, 0);
        let user = account(&store, "alice", dec!(20));
        let receipt = store.commit_purchase(&order(&user, &cycle, 1)).unwrap();
        let id = receipt.purchases[0].id;
        let matured = now() + Duration::days(5);

        assert!(store.complete_purchase(&id, matured).is_some());
        assert_eq!(store.active_units(&user), 0);
        assert!(store.reactivate_purchase(&id));
        assert!(!store.reactivate_purchase(&id));
        assert_eq!(store.active_units(&user), 1);
        assert_eq!(store.matured_purchases(matured).len(), 1);
    }

    #[test]
    fn test_has_transfer_sees_archived() {
        let store = MemoryStore::new();
        let t = PendingTransfer::new("treasury", "0xa", dec!(2), TransferKind::AdminFee, "e1", now());
        let id = t.id;
        store.enqueue_transfer(t).unwrap();
        store.complete_transfer(&id, "0xhash", now()).unwrap();
        store.archive_terminal(now() + Duration::days(1), now() + Duration::days(1));

        assert!(store.transfers(None).is_empty());
        assert!(store.has_transfer("e1", TransferKind::AdminFee));
        assert!(!store.has_transfer("e1", TransferKind::RewardsPool));
    }

    #[test]
    fn test_archive_terminal_after_retention() {
        let store = MemoryStore::new();
        let t = PendingTransfer::new("treasury", "0xabc", dec!(5), TransferKind::AdminFee, "e1", now());
        let id = t.id;
        store.enqueue_transfer(t).unwrap();
        store.complete_transfer(&id, "0xhash", now()).unwrap();

        assert!(store.archive_terminal(now(), now()).is_empty());
        let later = now() + Duration::days(8);
        let archived = store.archive_terminal(later - Duration::days(7), later);
        assert_eq!(archived.len(), 1);
        assert!(store.transfer(&id).is_err());
        assert_eq!(store.archived_transfers()[0].transfer.id, id);
    }

    #[test]
    fn test_release_pending_credits_balance() {
        let store = MemoryStore::new();
        let user = account(&store, "dora", dec!(0));
        store
            .record_earning(Earning::new(
                user.clone(),
                "p1",
                dec!(5),
                EarningKind::Referral,
                Some(1),
                EarningStatus::Pending,
                now(),
            ))
            .unwrap();
        assert_eq!(store.balance(&user).unwrap(), dec!(0));

        let released = store
            .release_pending(&user, &[EarningKind::Referral, EarningKind::TeamReward], now())
            .unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(store.balance(&user).unwrap(), dec!(5));
        assert!(store
            .release_pending(&user, &[EarningKind::Referral], now())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_referral_loop_rejected() {
        let store = MemoryStore::new();
        let a = UserId::new("a");
        let b = UserId::new("b");
        store
            .insert_link(UplineLink {
                user_id: b.clone(),
                referrer_id: a.clone(),
                depth: 1,
            })
            .unwrap();
        let err = store
            .insert_link(UplineLink {
                user_id: a.clone(),
                referrer_id: b.clone(),
                depth: 2,
            })
            .unwrap_err();
        assert!(matches!(err, BidError::ReferralLoop { .. }));
    }

    #[test]
    fn test_duplicate_deposit_ignored() {
        let store = MemoryStore::new();
        let user = account(&store, "eve", dec!(0));
        assert!(store.record_deposit(&user, dec!(50), "tx-1", now()).unwrap().is_some());
        assert!(store.record_deposit(&user, dec!(50), "tx-1", now()).unwrap().is_none());
        assert_eq!(store.balance(&user).unwrap(), dec!(50));
    }

    #[test]
    fn test_events_newest_first() {
        let store = MemoryStore::new();
        store.append_event(SystemEvent::info(now(), EventKind::CycleOpened, "c1", "opened"));
        store.append_event(SystemEvent::error(now(), EventKind::TransferFailed, "t1", "boom"));
        let all = store.recent_events(Severity::Info, 10);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].kind, EventKind::TransferFailed);
        assert_eq!(store.recent_events(Severity::Warning, 10).len(), 1);
    }
}
