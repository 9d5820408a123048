//! Background jobs
//!
//! Three loops share one task: the cycle check opens/closes cycles on time,
//! the transfer job drains and archives the outbox, and the daily job runs a
//! catch-up distribution at a fixed local wall-clock time.

use crate::config::SchedulerConfig;
use crate::metrics::NodeMetrics;
use bidloop_bridge::BatchReport;
use bidloop_core::prelude::*;
use bidloop_cycle::{CycleServices, PipelineReport};
use chrono::{DateTime, NaiveTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct Scheduler {
    services: CycleServices,
    metrics: Arc<NodeMetrics>,
    config: SchedulerConfig,
    daily_time: NaiveTime,
}

impl Scheduler {
    pub fn new(
        services: CycleServices,
        metrics: Arc<NodeMetrics>,
        config: SchedulerConfig,
    ) -> anyhow::Result<Self> {
        let daily_time = config.daily_time()?;
        Ok(Self {
            services,
            metrics,
            config,
            daily_time,
        })
    }

    /// Ensure a cycle exists and is opened or rolled over when due
    pub fn run_cycle_check(&self) -> Result<Cycle> {
        let cycle = self.services.manager.tick()?;
        self.metrics.observe(&self.services);
        debug!(
            cycle_id = %cycle.id,
            status = %cycle.status,
            remaining = cycle.remaining(),
            "Cycle check"
        );
        Ok(cycle)
    }

    /// Submit one batch of pending transfers, then archive old terminal ones
    pub async fn run_transfers(&self) -> BatchReport {
        let transport = &self.services.transport;
        let report = transport.process_batch(transport.settings().batch_size).await;
        let archived = transport.archive_expired();
        self.metrics.record_batch(&report);
        self.metrics.observe(&self.services);
        if report.claimed > 0 || archived > 0 {
            info!(
                claimed = report.claimed,
                completed = report.completed,
                retried = report.retried,
                failed = report.failed,
                archived,
                "Transfer job finished"
            );
        }
        report
    }

    /// Catch-up pass over everything the fill-triggered runs left behind
    pub fn run_daily_distribution(&self) -> PipelineReport {
        let report = self.services.pipeline.run_catch_up();
        if report.failures() > 0 {
            warn!(failures = report.failures(), "Daily distribution finished with failures");
        } else {
            info!("Daily distribution finished");
        }
        report
    }

    /// Next daily distribution instant at or after `now`
    pub fn next_daily_run(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.services
            .manager
            .schedule()
            .next_occurrence(now, self.daily_time)
    }

    /// Run the daily distribution if `next_at` has passed, then move
    /// `next_at` to the first boundary after now.
    ///
    /// The deadline only advances here, so a boundary that passes while
    /// another job is busy still triggers a run on the next poll.
    pub fn poll_daily(&self, next_at: &mut DateTime<Utc>) -> Option<PipelineReport> {
        let now = self.services.clock.now();
        if now < *next_at {
            return None;
        }
        let late = now - *next_at;
        if late > chrono::Duration::seconds(1) {
            debug!(late_secs = late.num_seconds(), "Daily distribution running late");
        }
        let report = self.run_daily_distribution();
        while *next_at <= now {
            *next_at += chrono::Duration::days(1);
        }
        Some(report)
    }

    fn until(&self, at: DateTime<Utc>) -> Duration {
        (at - self.services.clock.now())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Run every job until a shutdown message arrives
    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) {
        info!(
            "Starting scheduler (cycle check: {}s, transfers: {}s, daily distribution: {})",
            self.config.cycle_check_secs,
            self.config.transfer_interval_secs,
            self.config.daily_distribution_time
        );

        let mut cycle_check = tokio::time::interval(self.config.cycle_check_interval());
        let mut transfers = tokio::time::interval(self.config.transfer_interval());
        cycle_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        transfers.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut next_daily_at = self.next_daily_run(self.services.clock.now());
        let daily = tokio::time::sleep(self.until(next_daily_at));
        tokio::pin!(daily);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Scheduler shutting down");
                    break;
                }
                _ = cycle_check.tick() => {
                    if let Err(e) = self.run_cycle_check() {
                        warn!("Cycle check failed: {}", e);
                    }
                }
                _ = transfers.tick() => {
                    self.run_transfers().await;
                }
                _ = &mut daily => {
                    self.poll_daily(&mut next_daily_at);
                    daily
                        .as_mut()
                        .reset(tokio::time::Instant::now() + self.until(next_daily_at));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bidloop_bridge::DryRunGateway;
    use bidloop_cycle::CoreSettings;
    use bidloop_storage::MemoryStore;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn scheduler(at: DateTime<Utc>) -> (Scheduler, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(at));
        let mut settings = CoreSettings::default();
        settings.cycle.utc_offset_minutes = 0;
        settings.cycle.open_time = "08:00:00".into();
        let services = CycleServices::build(
            Arc::new(MemoryStore::new()),
            clock.clone(),
            Arc::new(DryRunGateway),
            settings,
        )
        .unwrap();
        let scheduler = Scheduler::new(
            services,
            Arc::new(NodeMetrics::new().unwrap()),
            SchedulerConfig::default(),
        )
        .unwrap();
        (scheduler, clock)
    }

    #[test]
    fn test_cycle_check_opens_when_due() {
        let (scheduler, clock) = scheduler(Utc.with_ymd_and_hms(2026, 6, 1, 7, 0, 0).unwrap());
        let early = scheduler.run_cycle_check().unwrap();
        assert_eq!(early.status, CycleStatus::Pending);

        clock.advance(chrono::Duration::hours(2));
        let opened = scheduler.run_cycle_check().unwrap();
        assert_eq!(opened.id, early.id);
        assert_eq!(opened.status, CycleStatus::Open);
        assert_eq!(scheduler.metrics.open_cycle_remaining.get(), 5);
    }

    #[test]
    fn test_next_daily_run() {
        let (scheduler, _) = scheduler(Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap());
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 2, 0, 0).unwrap();
        assert_eq!(
            scheduler.next_daily_run(now),
            Utc.with_ymd_and_hms(2026, 6, 1, 3, 0, 0).unwrap()
        );
        let later = Utc.with_ymd_and_hms(2026, 6, 1, 3, 0, 1).unwrap();
        assert_eq!(
            scheduler.next_daily_run(later),
            Utc.with_ymd_and_hms(2026, 6, 2, 3, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_daily_boundary_passed_while_busy_still_runs() {
        let start = Utc.with_ymd_and_hms(2026, 6, 1, 2, 59, 55).unwrap();
        let (scheduler, clock) = scheduler(start);
        let mut next_at = scheduler.next_daily_run(start);
        assert!(scheduler.poll_daily(&mut next_at).is_none());

        // a transfer batch holds the loop across 03:00:00
        clock.advance(chrono::Duration::seconds(10));
        assert!(scheduler.poll_daily(&mut next_at).is_some());
        assert_eq!(next_at, Utc.with_ymd_and_hms(2026, 6, 2, 3, 0, 0).unwrap());
        assert!(scheduler.poll_daily(&mut next_at).is_none());
    }

    #[test]
    fn test_daily_run_after_downtime_runs_once() {
        let start = Utc.with_ymd_and_hms(2026, 6, 1, 1, 0, 0).unwrap();
        let (scheduler, clock) = scheduler(start);
        let mut next_at = scheduler.next_daily_run(start);

        clock.advance(chrono::Duration::days(3));
        assert!(scheduler.poll_daily(&mut next_at).is_some());
        assert_eq!(next_at, Utc.with_ymd_and_hms(2026, 6, 4, 3, 0, 0).unwrap());
        assert!(scheduler.poll_daily(&mut next_at).is_none());
    }

    #[tokio::test]
    async fn test_transfer_job_drains_payouts() {
        let (scheduler, _) = scheduler(Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap());
        let transport = &scheduler.services.transport;
        transport
            .enqueue_payout("0xadmin", dec!(2), TransferKind::AdminFee, "entry-1")
            .unwrap();
        assert_eq!(transport.backlog(), 1);

        let report = scheduler.run_transfers().await;
        assert_eq!(report.completed, 1);
        assert_eq!(transport.backlog(), 0);
        assert_eq!(scheduler.metrics.transfers_completed.get(), 1);
        assert_eq!(scheduler.metrics.pending_transfers.get(), 0);
    }

    #[test]
    fn test_daily_distribution_is_quiet_when_idle() {
        let (scheduler, _) = scheduler(Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap());
        let report = scheduler.run_daily_distribution();
        assert_eq!(report.failures(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (scheduler, _) = scheduler(Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap());
        let (tx, rx) = mpsc::channel(1);
        tx.send(()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), scheduler.run(rx))
            .await
            .unwrap();
    }
}
