//! Error types for bidloop operations

use crate::records::CycleStatus;
use crate::types::{CycleId, TransferId, UserId};
use rust_decimal::Decimal;
use thiserror::Error;

/// Result type alias for bidloop operations
pub type Result<T> = std::result::Result<T, BidError>;

/// Errors that can occur across the cycle and settlement core
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BidError {
    // === Purchase (client-correctable) ===
    /// Quantity must be a positive unit count
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(i64),

    /// Purchases are only accepted on an open cycle
    #[error("Cycle {cycle_id} is not open for purchases (status: {status})")]
    CycleNotOpen { cycle_id: CycleId, status: CycleStatus },

    /// Not enough units left in the cycle
    #[error("Only {available} units available for purchase")]
    CapacityExceeded { available: u32 },

    /// Balance does not cover the total cost
    #[error("Insufficient balance. You need {required} USDT but only have {available} USDT.")]
    InsufficientBalance { required: Decimal, available: Decimal },

    /// Money amounts must be positive
    #[error("Invalid amount: {0}")]
    InvalidAmount(Decimal),

    /// Per-user progression ceiling
    #[error("You can only purchase up to {max} units in this cycle")]
    UserLimitExceeded { max: u32 },

    // === Lookup ===
    #[error("Cycle not found: {0}")]
    CycleNotFound(CycleId),

    #[error("No active cycle available")]
    NoActiveCycle,

    #[error("User not found: {0}")]
    UserNotFound(UserId),

    #[error("User already exists: {0}")]
    UserExists(UserId),

    #[error("Transfer not found: {0}")]
    TransferNotFound(TransferId),

    /// Linking would make a user their own ancestor
    #[error("Referral link {user} -> {referrer} would create a loop")]
    ReferralLoop { user: UserId, referrer: UserId },

    /// Nothing matched a recovery request
    #[error("No improperly closed cycles found")]
    NothingToRecover,

    // === Settlement ===
    /// External transfer failed; retried by the outbox
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// Stored state breaks an invariant (overfill, two open cycles)
    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),

    // === Infrastructure ===
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BidError {
    /// Stable code for API responses
    pub fn code(&self) -> u32 {
        match self {
            Self::InvalidQuantity(_) => 1001,
            Self::CycleNotOpen { .. } | Self::NoActiveCycle => 1002,
            Self::CapacityExceeded { .. } => 1003,
            Self::InsufficientBalance { .. } => 1004,
            Self::UserLimitExceeded { .. } => 1005,
            Self::CycleNotFound(_) | Self::UserNotFound(_) | Self::TransferNotFound(_) => 1006,
            Self::UserExists(_) | Self::ReferralLoop { .. } => 1007,
            Self::NothingToRecover => 1008,
            Self::InvalidAmount(_) => 1009,
            Self::TransportFailure(_) => 2001,
            Self::ConsistencyViolation(_) => 2002,
            _ => 9999,
        }
    }

    /// Worth retrying later without operator action
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::TransportFailure(_) | Self::Storage(_))
    }

    /// Caller can fix the request and try again
    pub fn is_client_error(&self) -> bool {
        (1000..2000).contains(&self.code())
    }
}

impl From<serde_json::Error> for BidError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_error_codes() {
        assert_eq!(BidError::CapacityExceeded { available: 2 }.code(), 1003);
        assert_eq!(BidError::InvalidQuantity(0).code(), 1001);
        assert_eq!(BidError::ConsistencyViolation("x".into()).code(), 2002);
    }

    #[test]
    fn test_error_display_carries_reason() {
        let msg = BidError::CapacityExceeded { available: 2 }.to_string();
        assert!(msg.contains("Only 2 units available"));

        let msg = BidError::InsufficientBalance {
            required: dec!(60),
            available: dec!(40),
        }
        .to_string();
        assert_eq!(
            msg,
            "Insufficient balance. You need 60 USDT but only have 40 USDT."
        );
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(BidError::TransportFailure("timeout".into()).is_recoverable());
        assert!(!BidError::InvalidQuantity(-1).is_recoverable());
        assert!(BidError::InvalidQuantity(-1).is_client_error());
        assert!(!BidError::Storage("io".into()).is_client_error());
    }
}
