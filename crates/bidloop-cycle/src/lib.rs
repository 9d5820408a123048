//! # bidloop cycle
//!
//! The bid cycle lifecycle and everything that happens when a cycle fills.
//!
//! ```text
//!   PurchaseSettlement ──fill──► CycleManager::close_if_filled
//!                                     │
//!                                     ├─► DistributionPipeline
//!                                     │     fees ─► returns ─► referrals ─► team
//!                                     │
//!                                     └─► CycleManager::open_next
//! ```
//!
//! The purchase that fills a cycle runs the pipeline and the rollover before
//! it returns, so there is never a moment without an open cycle. The
//! scheduler runs the same pipeline daily to catch up on maturities.

pub mod deposit;
pub mod diagnostics;
pub mod manager;
pub mod pipeline;
pub mod purchase;
pub mod services;
pub mod settings;

pub use deposit::{DepositReceipt, DepositService};
pub use diagnostics::{diagnose, CycleSummary, DiagnosticsReport, ProgressionRow};
pub use manager::{CycleManager, FillHook, Rollover};
pub use pipeline::{DistributionPipeline, PipelineReport, Stage, StageReport};
pub use purchase::{PurchaseOutcome, PurchaseSettlement};
pub use services::CycleServices;
pub use settings::{CoreSettings, CycleSettings, DistributionSettings, PurchaseSettings};
