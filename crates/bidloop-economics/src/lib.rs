//! # bidloop economics
//!
//! The money rules around a bid cycle: how big each cycle is, who earns what
//! when a unit is bought, and when a user's income is suspended.
//!
//! ## Components
//!
//! | Component | Role |
//! |-----------|------|
//! | [`UnitProgressionTable`] | cycle index → capacity, ~30% growth per cycle |
//! | [`LedgerHold`] | referral/team income suspension per user |
//! | [`ReferralCommissionEngine`] | per-level commissions up to 12 levels |
//! | [`TeamRewardEngine`] | business volume and rank-up rewards |
//! | [`ReferralNetwork`] | upline registration and leg counts |
//!
//! ## Upline walk
//!
//! ```text
//!   buyer ──► L1 ──► L2 ──► ... ──► L12
//!             5%     3%              0.25%
//! ```
//!
//! The walk is iterative, stops at the first missing link, never exceeds
//! [`constants::MAX_UPLINE_LEVELS`] and aborts if an ancestor repeats.

pub mod hold;
pub mod network;
pub mod progression;
pub mod referral;
pub mod team;
pub mod upline;

pub use hold::{HoldChange, LedgerHold};
pub use network::ReferralNetwork;
pub use progression::UnitProgressionTable;
pub use referral::{ReferralCommissionEngine, ReferralOutcome, ReferralRates};
pub use team::{RankTable, RankTier, TeamEvaluation, TeamRewardEngine};
pub use upline::{walk_upline, Upline};

/// Platform constants
pub mod constants {
    /// Deepest upline level that earns commission or team volume
    pub const MAX_UPLINE_LEVELS: u8 = 12;

    /// Capacity of the first ever cycle
    pub const BASE_UNITS: u32 = 5;

    /// Capacity multiplier between cycles, as a `(mantissa, scale)` decimal
    pub const GROWTH_RATE: (i64, u32) = (13, 1);

    /// Active direct legs needed before a user accrues team volume
    pub const MIN_ACTIVE_LEGS_FOR_TEAM_VOLUME: u32 = 5;
}
