//! Request handlers behind the JSON-RPC surface
//!
//! Each handler takes a deserialized request and returns a serializable
//! response or an [`ApiError`] carrying the domain error code and the
//! user-facing reason.

use crate::metrics::NodeMetrics;
use bidloop_core::prelude::*;
use bidloop_cycle::{CycleServices, CycleSummary, DiagnosticsReport};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Error returned to API callers
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ApiError {
    pub code: i64,
    pub message: String,
    /// The caller can fix the request and retry
    pub client_error: bool,
}

impl ApiError {
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
            client_error: true,
        }
    }
}

impl From<BidError> for ApiError {
    fn from(e: BidError) -> Self {
        Self {
            code: e.code() as i64,
            client_error: e.is_client_error(),
            message: e.to_string(),
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Clone, Debug, Deserialize)]
pub struct PurchaseRequest {
    pub user_id: String,
    #[serde(alias = "units")]
    pub quantity: i64,
    /// Caller's expected total, only compared against the computed cost
    #[serde(default)]
    pub amount: Option<Decimal>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PurchaseResponse {
    pub success: bool,
    pub message: String,
    pub orders: Vec<u32>,
    pub total_cost: Decimal,
    pub balance: Decimal,
    pub cycle: CycleSummary,
    /// Set when this purchase filled the cycle and the next one opened
    pub next_cycle: Option<CycleSummary>,
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusResponse {
    pub cycle: CycleSummary,
}

#[derive(Clone, Debug, Serialize)]
pub struct ReopenResponse {
    pub success: bool,
    pub message: String,
    pub cycle: CycleSummary,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DepositRequest {
    pub user_id: String,
    pub amount: Decimal,
    /// External reference, e.g. the confirming transaction hash
    pub reference: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct DepositResponse {
    pub credited: bool,
    pub balance: Decimal,
    pub released_earnings: usize,
    pub released_amount: Decimal,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BalanceRequest {
    pub user_id: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct BalanceResponse {
    pub user_id: UserId,
    pub balance: Decimal,
    pub active_units: u32,
    pub pending_earnings: Decimal,
    pub referral_on_hold: bool,
    pub team_reward_on_hold: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RegisterRequest {
    pub user_id: String,
    #[serde(default)]
    pub referrer: Option<String>,
    #[serde(default)]
    pub payout_address: Option<String>,
}

fn user_id(raw: &str) -> ApiResult<UserId> {
    let user = UserId::new(raw.trim());
    if !user.is_valid() {
        return Err(ApiError::invalid_params("user_id must not be empty"));
    }
    Ok(user)
}

/// Handlers shared by every connection
#[derive(Clone)]
pub struct ApiHandlers {
    services: CycleServices,
    metrics: Arc<NodeMetrics>,
}

impl ApiHandlers {
    pub fn new(services: CycleServices, metrics: Arc<NodeMetrics>) -> Self {
        Self { services, metrics }
    }

    pub fn services(&self) -> &CycleServices {
        &self.services
    }

    /// Current cycle, creating today's pending one if none exists
    pub fn status(&self) -> ApiResult<StatusResponse> {
        let cycle = self.services.manager.get_or_create_current_cycle()?;
        Ok(StatusResponse {
            cycle: CycleSummary::from(&cycle),
        })
    }

    pub fn purchase(&self, request: PurchaseRequest) -> ApiResult<PurchaseResponse> {
        let user = user_id(&request.user_id)?;
        let result =
            self.services
                .purchases
                .purchase_current(&user, request.quantity, request.amount);
        self.metrics.record_purchase(&result);
        self.metrics.observe(&self.services);

        let outcome = result?;
        let next_cycle = outcome
            .rollover
            .as_ref()
            .and_then(|r| r.next.as_ref())
            .map(CycleSummary::from);
        Ok(PurchaseResponse {
            success: true,
            message: outcome.message.clone(),
            orders: outcome.receipt.purchases.iter().map(|p| p.order).collect(),
            total_cost: outcome.total_cost,
            balance: outcome.receipt.balance_after,
            cycle: CycleSummary::from(&outcome.receipt.cycle),
            next_cycle,
        })
    }

    /// Operator recovery for a cycle closed before it filled
    pub fn reopen_closed(&self) -> ApiResult<ReopenResponse> {
        let cycle = self.services.manager.recover_improperly_closed_cycles()?;
        info!(cycle_id = %cycle.id, "Cycle reopened by operator");
        Ok(ReopenResponse {
            success: true,
            message: format!(
                "Cycle {} reopened with {} units remaining",
                cycle.index,
                cycle.remaining()
            ),
            cycle: CycleSummary::from(&cycle),
        })
    }

    pub fn diagnose(&self) -> DiagnosticsReport {
        self.services.diagnose()
    }

    pub fn deposit(&self, request: DepositRequest) -> ApiResult<DepositResponse> {
        let user = user_id(&request.user_id)?;
        if request.reference.trim().is_empty() {
            return Err(ApiError::invalid_params("reference must not be empty"));
        }
        let receipt = self
            .services
            .deposits
            .record_deposit(&user, request.amount, request.reference.trim())?;
        Ok(DepositResponse {
            credited: receipt.entry.is_some(),
            balance: receipt.balance,
            released_earnings: receipt.released.len(),
            released_amount: receipt.released.iter().map(|e| e.amount).sum(),
        })
    }

    pub fn balance(&self, request: BalanceRequest) -> ApiResult<BalanceResponse> {
        let user = user_id(&request.user_id)?;
        let store = &self.services.store;
        let balance = store.balance(&user)?;
        let pending_earnings = store
            .earnings_for(&user)
            .iter()
            .filter(|e| e.status == EarningStatus::Pending)
            .map(|e| e.amount)
            .sum();
        let hold = self.services.hold.status(&user);
        Ok(BalanceResponse {
            active_units: store.active_units(&user),
            user_id: user,
            balance,
            pending_earnings,
            referral_on_hold: hold.referral_on_hold,
            team_reward_on_hold: hold.team_reward_on_hold,
        })
    }

    pub fn register(&self, request: RegisterRequest) -> ApiResult<Account> {
        let user = user_id(&request.user_id)?;
        let referrer = request.referrer.as_deref().map(user_id).transpose()?;
        let payout_address = request
            .payout_address
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty());
        Ok(self
            .services
            .network
            .register_user(&user, referrer.as_ref(), payout_address)?)
    }
}
