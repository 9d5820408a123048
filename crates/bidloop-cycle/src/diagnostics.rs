//! Consistency report over the stored cycles
//!
//! Read-only. Findings come from the stored state and the event log; fixing
//! anything is left to the operator (`recover_improperly_closed_cycles`).

use bidloop_core::prelude::*;
use bidloop_economics::UnitProgressionTable;
use bidloop_storage::{CycleCounts, Store};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

/// Rows of the progression table included in a report
const PROGRESSION_ROWS: u32 = 12;

/// Warning and error events included in a report
const RECENT_EVENTS: usize = 20;

/// Public view of a cycle
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CycleSummary {
    pub id: CycleId,
    pub index: u32,
    pub date: NaiveDate,
    pub total_units: u32,
    pub filled_units: u32,
    pub remaining_units: u32,
    pub status: CycleStatus,
    pub open_time: DateTime<Utc>,
    pub close_time: Option<DateTime<Utc>>,
}

impl From<&Cycle> for CycleSummary {
    fn from(cycle: &Cycle) -> Self {
        Self {
            id: cycle.id,
            index: cycle.index,
            date: cycle.date,
            total_units: cycle.capacity,
            filled_units: cycle.filled,
            remaining_units: cycle.remaining(),
            status: cycle.status,
            open_time: cycle.open_time,
            close_time: cycle.close_time,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProgressionRow {
    pub cycle_number: u32,
    pub units_allowed: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct DiagnosticsReport {
    pub generated_at: DateTime<Utc>,
    pub counts: CycleCounts,
    pub current_open_cycle: Option<CycleSummary>,
    pub improperly_closed_cycles: Vec<CycleSummary>,
    pub progression: Vec<ProgressionRow>,
    pub pending_transfers: usize,
    pub failed_transfers: usize,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
    pub action_steps: Vec<String>,
    pub recent_events: Vec<SystemEvent>,
}

impl DiagnosticsReport {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

pub fn diagnose(
    store: &dyn Store,
    progression: &UnitProgressionTable,
    now: DateTime<Utc>,
) -> DiagnosticsReport {
    let counts = store.cycle_counts();
    let cycles = store.cycles();
    let open: Vec<&Cycle> = cycles.iter().filter(|c| c.is_open()).collect();
    let improperly_closed: Vec<CycleSummary> = cycles
        .iter()
        .filter(|c| c.is_improperly_closed())
        .map(CycleSummary::from)
        .collect();
    let overfilled = cycles.iter().filter(|c| c.filled > c.capacity).count();
    let pending_transfers = store.transfers(Some(TransferStatus::Pending)).len()
        + store.transfers(Some(TransferStatus::Processing)).len();
    let failed_transfers = store.transfers(Some(TransferStatus::Failed)).len();

    let mut issues = Vec::new();
    let mut recommendations = Vec::new();

    if open.len() > 1 {
        issues.push(format!("Multiple open cycles found: {}", open.len()));
        recommendations.push("Close every open cycle except the most recent one".to_string());
    }
    if open.is_empty() && counts.pending == 0 && counts.total > 0 {
        issues.push("No open or pending cycle; purchases are blocked".to_string());
        recommendations.push("Run the cycle check job or wait for the next scheduled tick".to_string());
    }
    if overfilled > 0 {
        issues.push(format!("Found {overfilled} cycles filled beyond capacity"));
        recommendations.push("Audit the purchases of the overfilled cycles".to_string());
    }
    if !improperly_closed.is_empty() {
        issues.push(format!(
            "Found {} improperly closed cycles with unsold units",
            improperly_closed.len()
        ));
        recommendations.push("Reopen the most recent one with cycle_reopenClosed".to_string());
    }
    if failed_transfers > 0 {
        issues.push(format!("{failed_transfers} transfers failed permanently"));
        recommendations.push("Review failed transfers and settle them manually".to_string());
    }

    let action_steps = if issues.is_empty() {
        vec!["No issues found. The system appears to be working correctly.".to_string()]
    } else {
        recommendations
            .iter()
            .enumerate()
            .map(|(i, r)| format!("{}. {r}", i + 1))
            .collect()
    };

    DiagnosticsReport {
        generated_at: now,
        counts,
        current_open_cycle: open.last().map(|c| CycleSummary::from(*c)),
        improperly_closed_cycles: improperly_closed,
        progression: progression
            .table(PROGRESSION_ROWS)
            .into_iter()
            .map(|(cycle_number, units_allowed)| ProgressionRow {
                cycle_number,
                units_allowed,
            })
            .collect(),
        pending_transfers,
        failed_transfers,
        issues,
        recommendations,
        action_steps,
        recent_events: store.recent_events(Severity::Warning, RECENT_EVENTS),
    }
}
