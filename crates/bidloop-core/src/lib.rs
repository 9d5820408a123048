//! # bidloop core
//!
//! Shared records for the bid cycle platform.
//!
//! - [`Cycle`] - a capacity-limited round of purchasable units
//! - [`Purchase`] - one unit bought in a cycle, maturing into a return
//! - [`Earning`] - referral, return and team reward income
//! - [`PendingTransfer`] - value leaving the system through the outbox
//!
//! ## Cycle lifecycle
//!
//! ```text
//!   pending ──openIfDue──► open ──closeIfFilled──► closed
//!                            ▲                        │
//!                            └──── openNext (new) ◄───┘
//! ```
//!
//! Money is `rust_decimal::Decimal` throughout.

pub mod clock;
pub mod error;
pub mod event;
pub mod money;
pub mod records;
pub mod types;

pub use clock::*;
pub use error::*;
pub use event::*;
pub use records::*;
pub use types::*;

pub use rust_decimal::Decimal;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::clock::{Clock, LocalSchedule, ManualClock, SystemClock};
    pub use crate::error::{BidError, Result};
    pub use crate::event::{EventKind, Severity, SystemEvent};
    pub use crate::money;
    pub use crate::records::*;
    pub use crate::types::*;
    pub use rust_decimal::Decimal;
}
