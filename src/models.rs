//! Core data models for the marketplace order engine
//!
//! This module contains the Order, Escrow and Transaction entities, their
//! closed status sets, and the transition tables that reject invalid moves.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::MarketplaceResult;
use crate::error::MarketplaceError;

/// Order state machine enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Order created, payment intent open, funds not yet captured
    PendingPayment,
    /// Payment captured, seller proceeds held in escrow
    EscrowHeld,
    /// Seller has dispatched the item
    Shipped,
    /// Escrow released to the seller
    Completed,
    /// Escrow returned to the buyer
    Refunded,
    /// Checkout abandoned or payment definitively failed
    Cancelled,
}

impl OrderStatus {
    /// Check if this is a terminal state (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Refunded | Self::Cancelled)
    }

    /// Check if the seller may mark the order shipped
    pub fn can_ship(&self) -> bool {
        matches!(self, Self::EscrowHeld)
    }

    /// Check if the order can still complete (escrow release path).
    /// Release never required shipment; auto-release completes unshipped
    /// orders too.
    pub fn can_complete(&self) -> bool {
        matches!(self, Self::EscrowHeld | Self::Shipped)
    }

    /// Check if the buyer may still be made whole (escrow refund path)
    pub fn can_refund(&self) -> bool {
        matches!(self, Self::EscrowHeld | Self::Shipped)
    }
}

/// Escrow state machine enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscrowStatus {
    /// Funds held pending release or refund
    Held,
    /// Funds credited to the seller
    Released,
    /// Funds returned to the buyer
    Refunded,
    /// Under dispute; auto-release frozen
    Disputed,
}

impl EscrowStatus {
    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Released | Self::Refunded)
    }

    /// Check if the escrow can be released to the seller
    pub fn can_release(&self) -> bool {
        matches!(self, Self::Held)
    }

    /// Check if the escrow can be refunded to the buyer
    pub fn can_refund(&self) -> bool {
        matches!(self, Self::Held)
    }

    /// Check if a dispute can be opened
    pub fn can_dispute(&self) -> bool {
        matches!(self, Self::Held)
    }
}

/// Journal entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    /// Buyer charge for a subscription tier upgrade
    SubscriptionUpgrade,
    /// Buyer charge for a marketplace order
    MarketplacePurchase,
    /// Seller credit when escrow is released
    EscrowRelease,
    /// Buyer credit when escrow is refunded
    Refund,
    /// Platform fee retained on a sale
    Commission,
}

/// Journal entry status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Awaiting gateway confirmation
    Pending,
    /// Money moved; entry is immutable from here on
    Completed,
    /// Gateway reported a definitive failure
    Failed,
    /// Abandoned before any money moved
    Cancelled,
}

impl TransactionStatus {
    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// One purchase attempt for one listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub listing_id: Uuid,
    pub buyer_id: Uuid,
    pub seller_id: Uuid,

    // Money split, computed once at creation and immutable thereafter
    pub total_amount: Decimal,
    pub platform_fee: Decimal,
    pub seller_amount: Decimal,
    pub currency: String,

    pub status: OrderStatus,

    // References
    pub transaction_id: Option<Uuid>,
    pub escrow_id: Option<Uuid>,

    // Fulfilment
    pub shipping_address: String,
    pub tracking_number: Option<String>,
    pub notes: Option<String>,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Order {
    /// Create a new order in `PendingPayment` with a precomputed fee split.
    /// Invariant: `platform_fee + seller_amount == total_amount`.
    pub fn new(
        listing_id: Uuid,
        buyer_id: Uuid,
        seller_id: Uuid,
        total_amount: Decimal,
        platform_fee: Decimal,
        seller_amount: Decimal,
        currency: String,
        shipping_address: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            listing_id,
            buyer_id,
            seller_id,
            total_amount,
            platform_fee,
            seller_amount,
            currency,
            status: OrderStatus::PendingPayment,
            transaction_id: None,
            escrow_id: None,
            shipping_address,
            tracking_number: None,
            notes: None,
            created_at: Utc::now(),
            shipped_at: None,
            confirmed_at: None,
            completed_at: None,
        }
    }

    /// Validate a state transition against the order transition table
    pub fn validate_transition(&self, to_status: OrderStatus) -> MarketplaceResult<()> {
        use OrderStatus::*;

        let valid = matches!(
            (self.status, to_status),
            (PendingPayment, EscrowHeld)
                | (PendingPayment, Cancelled)
                | (EscrowHeld, Shipped)
                | (EscrowHeld, Completed)
                | (EscrowHeld, Refunded)
                | (Shipped, Completed)
                | (Shipped, Refunded)
        );

        if valid {
            Ok(())
        } else {
            Err(MarketplaceError::state_transition(
                format!("{:?}", self.status),
                format!("{:?}", to_status),
                "Invalid order state transition".to_string(),
            ))
        }
    }
}

/// Custody record for one order's held seller proceeds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escrow {
    pub id: Uuid,
    pub order_id: Uuid,

    // Payout parties, captured at hold time so the ledger can journal
    // credits without resolving the order again
    pub seller_id: Uuid,
    pub buyer_id: Uuid,

    /// Always equals the order's seller amount
    pub amount: Decimal,
    pub currency: String,

    pub status: EscrowStatus,

    // Timestamps and reasons
    pub held_at: DateTime<Utc>,
    pub auto_release_date: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub release_reason: Option<String>,
    pub refund_reason: Option<String>,
    pub dispute_reason: Option<String>,
}

impl Escrow {
    /// Create a held escrow for an order's seller proceeds
    pub fn new(order: &Order, now: DateTime<Utc>, holding_period_days: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id: order.id,
            seller_id: order.seller_id,
            buyer_id: order.buyer_id,
            amount: order.seller_amount,
            currency: order.currency.clone(),
            status: EscrowStatus::Held,
            held_at: now,
            auto_release_date: now + chrono::Duration::days(holding_period_days),
            released_at: None,
            refunded_at: None,
            release_reason: None,
            refund_reason: None,
            dispute_reason: None,
        }
    }

    /// Validate a state transition against the escrow transition table.
    /// Exactly one terminal transition may ever occur, and only from `Held`;
    /// `Disputed` is a side branch that returns to `Held` on resolution.
    pub fn validate_transition(&self, to_status: EscrowStatus) -> MarketplaceResult<()> {
        use EscrowStatus::*;

        let valid = matches!(
            (self.status, to_status),
            (Held, Released) | (Held, Refunded) | (Held, Disputed) | (Disputed, Held)
        );

        if valid {
            Ok(())
        } else {
            Err(MarketplaceError::state_transition(
                format!("{:?}", self.status),
                format!("{:?}", to_status),
                "Invalid escrow state transition".to_string(),
            ))
        }
    }

    /// Check if the auto-release sweep should pick this escrow up
    pub fn due_for_auto_release(&self, now: DateTime<Utc>) -> bool {
        self.status == EscrowStatus::Held && self.auto_release_date <= now
    }
}

/// Immutable append-only journal entry for one money movement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    /// Whose money moved
    pub user_id: Uuid,
    pub order_id: Option<Uuid>,
    pub kind: TransactionType,
    pub amount: Decimal,
    pub currency: String,
    pub status: TransactionStatus,

    // External gateway references
    pub gateway_intent_id: Option<String>,
    pub gateway_charge_id: Option<String>,

    pub description: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub failure_reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Transaction {
    /// Create a `Pending` entry referencing an open payment intent
    pub fn pending(
        user_id: Uuid,
        order_id: Option<Uuid>,
        kind: TransactionType,
        amount: Decimal,
        currency: String,
        gateway_intent_id: String,
        description: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            order_id,
            kind,
            amount,
            currency,
            status: TransactionStatus::Pending,
            gateway_intent_id: Some(gateway_intent_id),
            gateway_charge_id: None,
            description: Some(description),
            metadata: None,
            failure_reason: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Create an already-`Completed` entry for an internal ledger movement
    /// (escrow release, refund credit)
    pub fn completed(
        user_id: Uuid,
        order_id: Option<Uuid>,
        kind: TransactionType,
        amount: Decimal,
        currency: String,
        description: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            order_id,
            kind,
            amount,
            currency,
            status: TransactionStatus::Completed,
            gateway_intent_id: None,
            gateway_charge_id: None,
            description: Some(description),
            metadata: None,
            failure_reason: None,
            created_at: now,
            completed_at: Some(now),
        }
    }

    /// Attach free-form metadata
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_order() -> Order {
        Order::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            dec!(100.00),
            dec!(5.00),
            dec!(95.00),
            "GBP".to_string(),
            "1 High Street".to_string(),
        )
    }

    #[test]
    fn order_transition_table_accepts_lifecycle_path() {
        let mut order = sample_order();
        order.validate_transition(OrderStatus::EscrowHeld).unwrap();
        order.status = OrderStatus::EscrowHeld;
        order.validate_transition(OrderStatus::Shipped).unwrap();
        order.status = OrderStatus::Shipped;
        order.validate_transition(OrderStatus::Completed).unwrap();
    }

    #[test]
    fn order_transition_table_rejects_skips_and_reversals() {
        let mut order = sample_order();
        assert!(order.validate_transition(OrderStatus::Shipped).is_err());
        assert!(order.validate_transition(OrderStatus::Completed).is_err());

        order.status = OrderStatus::Completed;
        assert!(order.validate_transition(OrderStatus::Refunded).is_err());
        assert!(order.validate_transition(OrderStatus::EscrowHeld).is_err());
        assert!(order.status.is_terminal());
    }

    #[test]
    fn refund_reachable_from_held_and_shipped_only() {
        assert!(OrderStatus::EscrowHeld.can_refund());
        assert!(OrderStatus::Shipped.can_refund());
        assert!(!OrderStatus::PendingPayment.can_refund());
        assert!(!OrderStatus::Completed.can_refund());
    }

    #[test]
    fn escrow_allows_one_terminal_transition() {
        let order = sample_order();
        let mut escrow = Escrow::new(&order, Utc::now(), 14);
        assert_eq!(escrow.amount, dec!(95.00));

        escrow.validate_transition(EscrowStatus::Released).unwrap();
        escrow.status = EscrowStatus::Released;
        assert!(escrow.validate_transition(EscrowStatus::Refunded).is_err());
        assert!(escrow.validate_transition(EscrowStatus::Held).is_err());
        assert!(escrow.status.is_terminal());
    }

    #[test]
    fn disputed_escrow_returns_to_held_before_settling() {
        let order = sample_order();
        let mut escrow = Escrow::new(&order, Utc::now(), 14);

        escrow.validate_transition(EscrowStatus::Disputed).unwrap();
        escrow.status = EscrowStatus::Disputed;
        assert!(escrow.validate_transition(EscrowStatus::Released).is_err());
        assert!(escrow.validate_transition(EscrowStatus::Refunded).is_err());
        escrow.validate_transition(EscrowStatus::Held).unwrap();
    }

    #[test]
    fn auto_release_due_only_when_held_past_date() {
        let order = sample_order();
        let now = Utc::now();
        let mut escrow = Escrow::new(&order, now, 14);

        assert!(!escrow.due_for_auto_release(now));
        assert!(escrow.due_for_auto_release(now + chrono::Duration::days(15)));

        escrow.status = EscrowStatus::Disputed;
        assert!(!escrow.due_for_auto_release(now + chrono::Duration::days(15)));
    }
}
