//! Component wiring
//!
//! Builds every component once, around one store and one clock, and hands
//! out shared handles. The node and the CLI both start here.

use crate::deposit::DepositService;
use crate::diagnostics::{self, DiagnosticsReport};
use crate::manager::{CycleManager, FillHook};
use crate::pipeline::DistributionPipeline;
use crate::purchase::PurchaseSettlement;
use crate::settings::CoreSettings;
use bidloop_bridge::{SettlementTransport, TransferGateway};
use bidloop_core::prelude::*;
use bidloop_economics::{LedgerHold, ReferralCommissionEngine, ReferralNetwork, TeamRewardEngine};
use bidloop_storage::Store;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct CycleServices {
    pub store: Arc<dyn Store>,
    pub clock: Arc<dyn Clock>,
    pub settings: CoreSettings,
    pub manager: Arc<CycleManager>,
    pub purchases: Arc<PurchaseSettlement>,
    pub pipeline: Arc<DistributionPipeline>,
    pub deposits: Arc<DepositService>,
    pub network: Arc<ReferralNetwork>,
    pub hold: Arc<LedgerHold>,
    pub transport: Arc<SettlementTransport>,
}

impl CycleServices {
    pub fn build(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        gateway: Arc<dyn TransferGateway>,
        settings: CoreSettings,
    ) -> Result<Self> {
        settings.validate()?;

        let manager = Arc::new(CycleManager::new(
            store.clone(),
            clock.clone(),
            settings.cycle.clone(),
        )?);
        let hold = Arc::new(LedgerHold::new(store.clone(), clock.clone()));
        let network = Arc::new(ReferralNetwork::new(store.clone(), clock.clone()));
        let referral = Arc::new(ReferralCommissionEngine::new(
            store.clone(),
            hold.clone(),
            clock.clone(),
            settings.distribution.referral_rates.clone(),
        ));
        let team = Arc::new(TeamRewardEngine::new(
            store.clone(),
            hold.clone(),
            clock.clone(),
            settings.distribution.team_ranks.clone(),
            settings.distribution.min_active_legs_for_team_volume,
        ));
        let transport = Arc::new(SettlementTransport::new(
            store.clone(),
            gateway,
            clock.clone(),
            settings.settlement.clone(),
        ));
        let pipeline = Arc::new(DistributionPipeline::new(
            store.clone(),
            clock.clone(),
            manager.clone(),
            hold.clone(),
            network.clone(),
            referral,
            team,
            transport.clone(),
            settings.distribution.clone(),
        ));
        let hook: Arc<dyn FillHook> = pipeline.clone();
        manager.set_fill_hook(Arc::downgrade(&hook));

        let purchases = Arc::new(PurchaseSettlement::new(
            store.clone(),
            clock.clone(),
            manager.clone(),
            hold.clone(),
            network.clone(),
            settings.purchase.clone(),
        ));
        let deposits = Arc::new(DepositService::new(store.clone(), clock.clone(), hold.clone()));

        info!(
            gateway = transport.gateway_name(),
            unit_price = %settings.purchase.unit_price,
            base_units = settings.cycle.base_units,
            "Cycle services ready"
        );

        Ok(Self {
            store,
            clock,
            settings,
            manager,
            purchases,
            pipeline,
            deposits,
            network,
            hold,
            transport,
        })
    }

    pub fn diagnose(&self) -> DiagnosticsReport {
        diagnostics::diagnose(
            self.store.as_ref(),
            self.manager.progression(),
            self.clock.now(),
        )
    }
}
