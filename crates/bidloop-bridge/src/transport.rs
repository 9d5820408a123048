//! Pending transfer outbox processing

use crate::gateway::{GatewayError, TransferGateway, TransferRequest};
use bidloop_core::prelude::*;
use bidloop_storage::Store;
use chrono::Duration as ChronoDuration;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Outbox processing settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SettlementSettings {
    /// Attempts before a transfer is marked failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Transfers claimed per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Upper bound on a single gateway call
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Days a terminal transfer stays in the active outbox
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,

    /// Wallet debited for outgoing payouts
    #[serde(default = "default_treasury_wallet")]
    pub treasury_wallet: String,
}

fn default_max_retries() -> u32 {
    3
}

fn default_batch_size() -> usize {
    10
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_retention_days() -> i64 {
    7
}

fn default_treasury_wallet() -> String {
    "treasury".to_string()
}

impl Default for SettlementSettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            batch_size: default_batch_size(),
            timeout_ms: default_timeout_ms(),
            retention_days: default_retention_days(),
            treasury_wallet: default_treasury_wallet(),
        }
    }
}

/// Outcome of one `process_batch` call
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub claimed: usize,
    pub completed: usize,
    /// Failed attempts that went back to pending
    pub retried: usize,
    /// Transfers that exhausted their retries
    pub failed: usize,
}

/// Running totals since start
#[derive(Clone, Debug, Default, Serialize)]
pub struct TransportStats {
    pub batches: u64,
    pub enqueued: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub archived: u64,
}

pub struct SettlementTransport {
    store: Arc<dyn Store>,
    gateway: Arc<dyn TransferGateway>,
    clock: Arc<dyn Clock>,
    settings: SettlementSettings,
    stats: RwLock<TransportStats>,
}

impl SettlementTransport {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn TransferGateway>,
        clock: Arc<dyn Clock>,
        settings: SettlementSettings,
    ) -> Self {
        Self {
            store,
            gateway,
            clock,
            settings,
            stats: RwLock::new(TransportStats::default()),
        }
    }

    pub fn settings(&self) -> &SettlementSettings {
        &self.settings
    }

    pub fn gateway_name(&self) -> &str {
        self.gateway.name()
    }

    pub fn stats(&self) -> TransportStats {
        self.stats.read().clone()
    }

    /// Queue a transfer for the next batch
    pub fn enqueue(&self, transfer: PendingTransfer) -> Result<TransferId> {
        let id = transfer.id;
        debug!(
            transfer_id = %id,
            kind = %transfer.kind,
            amount = %transfer.amount,
            "Transfer queued"
        );
        self.store.enqueue_transfer(transfer)?;
        self.stats.write().enqueued += 1;
        Ok(id)
    }

    /// Build and queue a payout from the treasury wallet
    pub fn enqueue_payout(
        &self,
        destination: &str,
        amount: Decimal,
        kind: TransferKind,
        reference_id: impl Into<String>,
    ) -> Result<TransferId> {
        let transfer = PendingTransfer::new(
            self.settings.treasury_wallet.clone(),
            destination,
            amount,
            kind,
            reference_id,
            self.clock.now(),
        );
        self.enqueue(transfer)
    }

    /// Attempt up to `n` pending transfers
    pub async fn process_batch(&self, n: usize) -> BatchReport {
        let claimed = self.store.claim_pending(n, self.clock.now());
        let mut report = BatchReport {
            claimed: claimed.len(),
            ..Default::default()
        };
        let limit = Duration::from_millis(self.settings.timeout_ms);

        // one batch goes out concurrently; outcomes are recorded in claim order
        let attempts = join_all(claimed.iter().map(|transfer| async move {
            let request = TransferRequest::from(transfer);
            tokio::time::timeout(limit, self.gateway.submit_transfer(&request))
                .await
                .unwrap_or(Err(GatewayError::Timeout))
        }))
        .await;

        for (transfer, attempt) in claimed.iter().zip(attempts) {
            match attempt {
                Ok(tx_hash) => match self.mark_complete(&transfer.id, &tx_hash) {
                    Ok(_) => report.completed += 1,
                    Err(e) => error!(transfer_id = %transfer.id, error = %e, "Could not record completion"),
                },
                Err(gateway_error) => {
                    let reason = BidError::TransportFailure(gateway_error.to_string()).to_string();
                    match self.mark_failed(&transfer.id, &reason) {
                        Ok(t) if t.status == TransferStatus::Failed => report.failed += 1,
                        Ok(_) => report.retried += 1,
                        Err(e) => error!(transfer_id = %transfer.id, error = %e, "Could not record failure"),
                    }
                }
            }
        }

        {
            let mut stats = self.stats.write();
            stats.batches += 1;
            stats.retried += report.retried as u64;
        }
        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                completed = report.completed,
                retried = report.retried,
                failed = report.failed,
                gateway = self.gateway.name(),
                "Transfer batch processed"
            );
        }
        report
    }

    pub fn mark_complete(&self, id: &TransferId, tx_hash: &str) -> Result<PendingTransfer> {
        let transfer = self.store.complete_transfer(id, tx_hash, self.clock.now())?;
        self.stats.write().completed += 1;
        debug!(transfer_id = %id, tx_hash, "Transfer completed");
        Ok(transfer)
    }

    /// Record a failed attempt; terminal once retries are exhausted
    pub fn mark_failed(&self, id: &TransferId, reason: &str) -> Result<PendingTransfer> {
        let now = self.clock.now();
        let transfer = self
            .store
            .fail_transfer(id, reason, self.settings.max_retries, now)?;

        if transfer.status == TransferStatus::Failed {
            self.stats.write().failed += 1;
            error!(
                transfer_id = %id,
                retries = transfer.retry_count,
                reason,
                "Transfer permanently failed"
            );
            self.store.append_event(SystemEvent::error(
                now,
                EventKind::TransferFailed,
                id,
                format!(
                    "{} of {} to {} failed after {} attempts: {reason}",
                    transfer.kind, transfer.amount, transfer.destination_address, transfer.retry_count
                ),
            ));
        } else {
            warn!(
                transfer_id = %id,
                retry = transfer.retry_count,
                max_retries = self.settings.max_retries,
                reason,
                "Transfer attempt failed, will retry"
            );
        }
        Ok(transfer)
    }

    /// Put transfers claimed by a batch that never finished back in the queue.
    ///
    /// Call once at startup, before the first batch: every processing transfer
    /// found then belongs to a run that was cut short. The interrupted attempt
    /// does not count against `max_retries`.
    pub fn recover_interrupted(&self) -> usize {
        let now = self.clock.now();
        let requeued = self.store.requeue_stale(now, now);
        if requeued > 0 {
            warn!(count = requeued, "Requeued transfers left processing by an interrupted batch");
            self.store.append_event(SystemEvent::new(
                now,
                Severity::Warning,
                EventKind::TransferRequeued,
                None,
                format!("requeued {requeued} interrupted transfers"),
            ));
        }
        requeued
    }

    /// Archive terminal transfers older than the retention window
    pub fn archive_expired(&self) -> usize {
        let now = self.clock.now();
        let cutoff = now - ChronoDuration::days(self.settings.retention_days);
        let archived = self.store.archive_terminal(cutoff, now);
        if !archived.is_empty() {
            self.stats.write().archived += archived.len() as u64;
            info!(count = archived.len(), "Archived settled transfers");
            self.store.append_event(SystemEvent::new(
                now,
                Severity::Info,
                EventKind::TransferArchived,
                None,
                format!("archived {} transfers", archived.len()),
            ));
        }
        archived.len()
    }

    /// Pending plus processing transfers
    pub fn backlog(&self) -> usize {
        self.store.transfers(Some(TransferStatus::Pending)).len()
            + self.store.transfers(Some(TransferStatus::Processing)).len()
    }
}
