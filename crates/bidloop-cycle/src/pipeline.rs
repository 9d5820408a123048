//! Distribution pipeline
//!
//! Runs after a cycle fills (inline, from the purchase that filled it) and
//! from the daily scheduler job as a catch-up. Stages always run in this
//! order:
//!
//! ```text
//!   fees ─► returns ─► referrals ─► team rewards ─► rollover
//! ```
//!
//! Every stage claims its work item in the store before acting on it and
//! releases the claim when the payout fails, so the next run retries it.
//! Payouts already made for an item are looked up first and never repeated.
//! An error on one entity is logged and recorded in the event log; the stage
//! moves on to the next one.

use crate::manager::{CycleManager, FillHook};
use crate::settings::DistributionSettings;
use bidloop_bridge::SettlementTransport;
use bidloop_core::prelude::*;
use bidloop_economics::{LedgerHold, ReferralCommissionEngine, ReferralNetwork, TeamRewardEngine};
use bidloop_storage::Store;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fees,
    Returns,
    Referrals,
    TeamRewards,
    Rollover,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fees => "fees",
            Self::Returns => "returns",
            Self::Referrals => "referrals",
            Self::TeamRewards => "team_rewards",
            Self::Rollover => "rollover",
        })
    }
}

/// Items handled by one stage
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub processed: usize,
    pub failed: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct PipelineReport {
    /// Cycle whose fill triggered the run; `None` for scheduled runs
    pub trigger: Option<CycleId>,
    pub started_at: DateTime<Utc>,
    pub fees: StageReport,
    pub returns: StageReport,
    pub referrals: StageReport,
    pub team_rewards: StageReport,
    /// Cycle opened by the rollover stage
    pub opened: Option<CycleId>,
}

impl PipelineReport {
    pub fn failures(&self) -> usize {
        self.fees.failed + self.returns.failed + self.referrals.failed + self.team_rewards.failed
    }
}

pub struct DistributionPipeline {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    manager: Arc<CycleManager>,
    hold: Arc<LedgerHold>,
    network: Arc<ReferralNetwork>,
    referral: Arc<ReferralCommissionEngine>,
    team: Arc<TeamRewardEngine>,
    transport: Arc<SettlementTransport>,
    settings: DistributionSettings,
    /// One run at a time
    running: Mutex<()>,
}

impl DistributionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        manager: Arc<CycleManager>,
        hold: Arc<LedgerHold>,
        network: Arc<ReferralNetwork>,
        referral: Arc<ReferralCommissionEngine>,
        team: Arc<TeamRewardEngine>,
        transport: Arc<SettlementTransport>,
        settings: DistributionSettings,
    ) -> Self {
        Self {
            store,
            clock,
            manager,
            hold,
            network,
            referral,
            team,
            transport,
            settings,
            running: Mutex::new(()),
        }
    }

    /// Run every stage after `cycle` filled
    pub fn run_for_filled_cycle(&self, cycle: &Cycle) -> PipelineReport {
        self.run(Some(cycle.id))
    }

    /// Scheduled catch-up run
    pub fn run_catch_up(&self) -> PipelineReport {
        self.run(None)
    }

    fn run(&self, trigger: Option<CycleId>) -> PipelineReport {
        let _guard = self.running.lock();
        let started_at = self.clock.now();
        info!(trigger = ?trigger, "Distribution pipeline started");

        let mut report = PipelineReport {
            trigger,
            started_at,
            fees: self.collect_fees(),
            returns: StageReport::default(),
            referrals: StageReport::default(),
            team_rewards: StageReport::default(),
            opened: None,
        };
        report.returns = self.pay_returns();
        report.referrals = self.propagate_referrals();
        report.team_rewards = self.evaluate_team_volume();
        report.opened = self.rollover();

        info!(
            trigger = ?trigger,
            fees = report.fees.processed,
            returns = report.returns.processed,
            referrals = report.referrals.processed,
            team_rewards = report.team_rewards.processed,
            failures = report.failures(),
            "Distribution pipeline finished"
        );
        report
    }

    /// Platform fee and rewards pool share of each new deposit or investment
    fn collect_fees(&self) -> StageReport {
        let mut report = StageReport::default();
        for entry in self.store.unprocessed_entries() {
            if !self.store.claim_fee_processing(&entry.id) {
                continue;
            }
            let shares = [
                (
                    TransferKind::AdminFee,
                    self.settings.admin_fee_percent,
                    self.settings.admin_fee_address.as_deref(),
                ),
                (
                    TransferKind::RewardsPool,
                    self.settings.rewards_pool_percent,
                    self.settings.rewards_pool_address.as_deref(),
                ),
            ];

            let mut ok = true;
            for (kind, percent, address) in shares {
                let amount = money::percent_of(entry.amount, percent);
                if amount <= Decimal::ZERO {
                    continue;
                }
                let Some(address) = address else {
                    debug!(entry_id = %entry.id, %kind, %amount, "No address configured, share stays in treasury");
                    continue;
                };
                if self.store.has_transfer(&entry.id.to_string(), kind) {
                    continue;
                }
                if let Err(e) = self
                    .transport
                    .enqueue_payout(address, amount, kind, entry.id.to_string())
                {
                    ok = false;
                    self.entity_failed(Stage::Fees, entry.id, &e);
                }
            }
            if ok {
                report.processed += 1;
            } else {
                self.store.release_fee_processing(&entry.id);
                report.failed += 1;
            }
        }
        report
    }

    /// Complete matured units and pay `amount × (1 + return_rate)`
    fn pay_returns(&self) -> StageReport {
        let mut report = StageReport::default();
        let now = self.clock.now();
        for purchase in self.store.matured_purchases(now) {
            let Some(done) = self.store.complete_purchase(&purchase.id, now) else {
                continue;
            };
            match self.pay_return(&done, now) {
                Ok(()) => {
                    report.processed += 1;
                    self.after_maturity(&done);
                }
                Err(e) => {
                    self.store.reactivate_purchase(&done.id);
                    report.failed += 1;
                    self.entity_failed(Stage::Returns, done.id, &e);
                }
            }
        }
        report
    }

    fn pay_return(&self, purchase: &Purchase, now: DateTime<Utc>) -> Result<()> {
        let source = purchase.id.to_string();
        if self.store.has_earning(&source, EarningKind::Return, None) {
            return Ok(());
        }
        let maturity = purchase.amount * (Decimal::ONE + self.settings.return_rate);
        if maturity <= Decimal::ZERO {
            return Err(BidError::InvalidAmount(maturity));
        }
        let earning = Earning::new(
            purchase.user_id.clone(),
            purchase.id.to_string(),
            maturity,
            EarningKind::Return,
            None,
            EarningStatus::Processed,
            now,
        );
        let account = self.store.account(&purchase.user_id)?;
        match account.payout_address.as_deref() {
            Some(address) => {
                if !self.store.has_transfer(&source, TransferKind::Return) {
                    self.transport
                        .enqueue_payout(address, maturity, TransferKind::Return, source.as_str())?;
                }
                self.store.insert_earning(earning)?;
            }
            None => {
                self.store.record_earning(earning)?;
            }
        }
        debug!(
            purchase_id = %purchase.id,
            user_id = %purchase.user_id,
            amount = %maturity,
            external = account.payout_address.is_some(),
            "Return paid"
        );
        Ok(())
    }

    /// Per-user bookkeeping after a unit completes
    fn after_maturity(&self, purchase: &Purchase) {
        let user = &purchase.user_id;
        let after = self.store.active_units(user);
        self.network.on_active_units_changed(user, after + 1, after);

        let cycle_done = self
            .store
            .purchases_for_cycle(&purchase.cycle_id)
            .iter()
            .filter(|p| &p.user_id == user)
            .all(|p| p.status == PurchaseStatus::Completed);
        if cycle_done {
            let rollups = self.store.user_cycles(user);
            if let Some(seed) = rollups.into_iter().find(|uc| uc.cycle_id == purchase.cycle_id) {
                self.store
                    .modify_user_cycle(seed, &mut |uc| uc.status = UserCycleStatus::Completed);
            }
        }

        if let Err(e) = self.hold.refresh(user) {
            warn!(user_id = %user, error = %e, "Hold refresh after maturity failed");
        }
    }

    /// Upline commissions, once per purchased unit
    fn propagate_referrals(&self) -> StageReport {
        let mut report = StageReport::default();
        for purchase in self.store.undistributed_referrals() {
            if !self.store.claim_referral(&purchase.id) {
                continue;
            }
            match self
                .referral
                .distribute(&purchase.user_id, purchase.amount, &purchase.id.to_string())
            {
                Ok(outcome) => {
                    report.processed += 1;
                    if !outcome.skipped.is_empty() {
                        warn!(
                            purchase_id = %purchase.id,
                            skipped = outcome.skipped.len(),
                            "Some referral commissions were skipped"
                        );
                    }
                }
                Err(e) => {
                    self.store.release_referral(&purchase.id);
                    report.failed += 1;
                    self.entity_failed(Stage::Referrals, purchase.id, &e);
                }
            }
        }
        report
    }

    /// Team volume for qualifying ancestors, once per purchased unit
    fn evaluate_team_volume(&self) -> StageReport {
        let mut report = StageReport::default();
        for purchase in self.store.unevaluated_team_volume() {
            if !self.store.claim_team_volume(&purchase.id) {
                continue;
            }
            let evaluations = self
                .team
                .credit_upline_volume(&purchase.user_id, purchase.amount);
            let advanced = evaluations.iter().filter(|e| e.rank_changed()).count();
            if advanced > 0 {
                debug!(purchase_id = %purchase.id, advanced, "Rank advancements from purchase");
            }
            report.processed += 1;
        }
        report
    }

    /// Make sure a cycle is available to buy into
    fn rollover(&self) -> Option<CycleId> {
        if self.store.open_cycle().is_some() || self.store.latest_pending().is_some() {
            return None;
        }
        match self.manager.open_next() {
            Ok(cycle) => Some(cycle.id),
            Err(e) => {
                self.entity_failed(Stage::Rollover, "next-cycle", &e);
                None
            }
        }
    }

    fn entity_failed(&self, stage: Stage, entity: impl fmt::Display, e: &BidError) {
        error!(%stage, entity = %entity, error = %e, "Pipeline stage failed for entity");
        self.store.append_event(SystemEvent::error(
            self.clock.now(),
            EventKind::PipelineStageFailed,
            &entity,
            format!("{stage}: {e}"),
        ));
    }
}

impl FillHook for DistributionPipeline {
    fn run_for_filled_cycle(&self, cycle: &Cycle) {
        let report = self.run(Some(cycle.id));
        if report.failures() > 0 {
            warn!(
                cycle_id = %cycle.id,
                failures = report.failures(),
                "Distribution after fill finished with failures"
            );
        }
    }
}
