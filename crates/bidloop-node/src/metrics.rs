//! Prometheus metrics server

use crate::config::MetricsConfig;
use bidloop_bridge::BatchReport;
use bidloop_core::prelude::*;
use bidloop_cycle::{CycleServices, PurchaseOutcome};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Counters and gauges the node exports
pub struct NodeMetrics {
    registry: Registry,
    pub purchases_committed: IntCounter,
    pub units_sold: IntCounter,
    pub purchases_rejected: IntCounterVec,
    pub cycles_closed: IntCounter,
    pub transfers_completed: IntCounter,
    pub transfers_failed: IntCounter,
    pub open_cycle_remaining: IntGauge,
    pub pending_transfers: IntGauge,
}

impl NodeMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let purchases_committed =
            IntCounter::new("bidloop_purchases_committed_total", "Committed purchases")?;
        let units_sold = IntCounter::new("bidloop_units_sold_total", "Units sold across cycles")?;
        let purchases_rejected = IntCounterVec::new(
            Opts::new("bidloop_purchases_rejected_total", "Rejected purchases by reason"),
            &["reason"],
        )?;
        let cycles_closed = IntCounter::new("bidloop_cycles_closed_total", "Cycles closed on fill")?;
        let transfers_completed =
            IntCounter::new("bidloop_transfers_completed_total", "Transfers confirmed by the gateway")?;
        let transfers_failed =
            IntCounter::new("bidloop_transfers_failed_total", "Transfers that exhausted retries")?;
        let open_cycle_remaining =
            IntGauge::new("bidloop_open_cycle_remaining_units", "Units left in the open cycle")?;
        let pending_transfers =
            IntGauge::new("bidloop_pending_transfers", "Transfers waiting in the outbox")?;

        registry.register(Box::new(purchases_committed.clone()))?;
        registry.register(Box::new(units_sold.clone()))?;
        registry.register(Box::new(purchases_rejected.clone()))?;
        registry.register(Box::new(cycles_closed.clone()))?;
        registry.register(Box::new(transfers_completed.clone()))?;
        registry.register(Box::new(transfers_failed.clone()))?;
        registry.register(Box::new(open_cycle_remaining.clone()))?;
        registry.register(Box::new(pending_transfers.clone()))?;

        Ok(Self {
            registry,
            purchases_committed,
            units_sold,
            purchases_rejected,
            cycles_closed,
            transfers_completed,
            transfers_failed,
            open_cycle_remaining,
            pending_transfers,
        })
    }

    pub fn record_purchase(&self, result: &Result<PurchaseOutcome>) {
        match result {
            Ok(outcome) => {
                self.purchases_committed.inc();
                self.units_sold.inc_by(outcome.receipt.purchases.len() as u64);
                if outcome.rollover.is_some() {
                    self.cycles_closed.inc();
                }
            }
            Err(e) => self
                .purchases_rejected
                .with_label_values(&[rejection_reason(e)])
                .inc(),
        }
    }

    pub fn record_batch(&self, report: &BatchReport) {
        self.transfers_completed.inc_by(report.completed as u64);
        self.transfers_failed.inc_by(report.failed as u64);
    }

    /// Refresh gauges from the current store state
    pub fn observe(&self, services: &CycleServices) {
        let remaining = services
            .store
            .open_cycle()
            .map(|c| c.remaining() as i64)
            .unwrap_or(0);
        self.open_cycle_remaining.set(remaining);
        self.pending_transfers.set(services.transport.backlog() as i64);
    }

    /// Text exposition format
    pub fn encode(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

fn rejection_reason(e: &BidError) -> &'static str {
    match e {
        BidError::InvalidQuantity(_) => "invalid_quantity",
        BidError::CycleNotOpen { .. } | BidError::NoActiveCycle => "cycle_not_open",
        BidError::CapacityExceeded { .. } => "capacity_exceeded",
        BidError::InsufficientBalance { .. } => "insufficient_balance",
        BidError::UserLimitExceeded { .. } => "user_limit",
        BidError::UserNotFound(_) => "unknown_user",
        _ => "internal",
    }
}

/// Metrics server
pub struct MetricsServer {
    /// Configuration
    config: MetricsConfig,
    metrics: Arc<NodeMetrics>,
}

impl MetricsServer {
    pub fn new(config: &MetricsConfig, metrics: Arc<NodeMetrics>) -> Self {
        Self {
            config: config.clone(),
            metrics,
        }
    }

    /// Run the metrics server
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr: SocketAddr = self.config.prometheus_addr.parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Metrics server listening on {}", addr);

        loop {
            let (mut stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                    continue;
                }
            };
            let metrics = self.metrics.clone();

            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let n = match stream.read(&mut buf).await {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::debug!("Metrics read from {} failed: {}", peer, e);
                        return;
                    }
                };
                let request = String::from_utf8_lossy(&buf[..n]);
                let response = render(&request, &metrics);
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    }
}

fn render(request: &str, metrics: &NodeMetrics) -> String {
    if request.starts_with("GET /metrics") {
        match metrics.encode() {
            Ok(body) => format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            ),
            Err(e) => {
                tracing::error!("Metrics encoding failed: {}", e);
                "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n".to_string()
            }
        }
    } else if request.starts_with("GET /health") {
        let body = "{\"status\":\"healthy\"}";
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        )
    } else {
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_string()
    }
}
