//! Error types for the marketplace order engine
//!
//! The error taxonomy distinguishes domain rejections (the caller violated a
//! precondition and must not retry), transient infrastructure failures (safe
//! to retry), and fatal inconsistencies that require manual reconciliation.

use thiserror::Error;

/// Main error type for marketplace operations
#[derive(Error, Debug)]
pub enum MarketplaceError {
    /// Caller violated a business precondition (listing unavailable,
    /// escrow not refundable, buyer purchasing their own listing)
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Caller is not the actor this operation belongs to
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Requested entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// State machine transition errors
    #[error("Invalid state transition: {from_state} -> {to_state}: {reason}")]
    StateTransition {
        from_state: String,
        to_state: String,
        reason: String,
    },

    /// Payment gateway unreachable or rejected the call; safe to retry
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Stored records contradict each other; surfaced for manual
    /// reconciliation, never silently swallowed
    #[error("Inconsistency: {0}")]
    Inconsistency(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MarketplaceError {
    /// Create an invalid operation error
    pub fn invalid_operation<S: Into<String>>(msg: S) -> Self {
        Self::InvalidOperation(msg.into())
    }

    /// Create a forbidden error
    pub fn forbidden<S: Into<String>>(msg: S) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a state transition error
    pub fn state_transition<S: Into<String>>(from_state: S, to_state: S, reason: S) -> Self {
        Self::StateTransition {
            from_state: from_state.into(),
            to_state: to_state.into(),
            reason: reason.into(),
        }
    }

    /// Create a gateway error
    pub fn gateway<S: Into<String>>(msg: S) -> Self {
        Self::Gateway(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create an inconsistency error
    pub fn inconsistency<S: Into<String>>(msg: S) -> Self {
        Self::Inconsistency(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// True when the failure is infrastructure-level and the same call can be
    /// retried without violating any invariant
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Gateway(_))
    }

    /// True when the caller broke a precondition and retrying is pointless
    pub fn is_domain_rejection(&self) -> bool {
        matches!(
            self,
            Self::InvalidOperation(_)
                | Self::Forbidden(_)
                | Self::NotFound(_)
                | Self::StateTransition { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_gateway_failures_as_transient() {
        assert!(MarketplaceError::gateway("timeout").is_transient());
        assert!(!MarketplaceError::gateway("timeout").is_domain_rejection());
    }

    #[test]
    fn classifies_precondition_failures_as_domain_rejections() {
        assert!(MarketplaceError::forbidden("not the buyer").is_domain_rejection());
        assert!(MarketplaceError::invalid_operation("listing sold").is_domain_rejection());
        assert!(
            MarketplaceError::state_transition("Completed", "Shipped", "terminal")
                .is_domain_rejection()
        );
        assert!(!MarketplaceError::inconsistency("orphan escrow").is_domain_rejection());
    }
}
