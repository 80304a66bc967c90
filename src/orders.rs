//! Order Lifecycle Manager - orchestrates the end-to-end order state machine
//!
//! Composes the fee calculator, payment gateway, transaction journal, escrow
//! ledger and listing registry to drive an order from creation through
//! payment, escrow, shipment and delivery (or refund) to a terminal state.
//! Gateway calls never happen while a store lock is held; correctness under
//! races comes from status-check-then-transition inside one critical section.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::MarketplaceResult;
use crate::error::MarketplaceError;
use crate::escrow::{EscrowLedger, SweepSummary};
use crate::fees::{self, FeeCalculator};
use crate::gateway::{IntentStatus, OpenIntentRequest, PaymentGateway};
use crate::journal::{ClaimOutcome, TransactionJournal};
use crate::listings::{ListingRegistry, ListingStatus};
use crate::models::{Escrow, Order, OrderStatus, Transaction, TransactionType};

/// Purchase request from an authenticated buyer
#[derive(Debug, Clone)]
pub struct CreateOrderRequest {
    pub buyer_id: Uuid,
    pub listing_id: Uuid,
    pub shipping_address: String,
}

/// Shipment notice from the seller
#[derive(Debug, Clone)]
pub struct ShipOrderRequest {
    pub order_id: Uuid,
    pub seller_id: Uuid,
    pub tracking_number: String,
}

/// Refund request from the buyer
#[derive(Debug, Clone)]
pub struct RefundRequest {
    pub order_id: Uuid,
    pub buyer_id: Uuid,
    pub reason: String,
}

/// How an operator settles a dispute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisputeResolution {
    ReleaseToSeller,
    RefundToBuyer,
}

/// A freshly created order plus the client-facing payment handle
#[derive(Debug, Clone)]
pub struct Checkout {
    pub order: Order,
    pub client_secret: String,
}

/// Main lifecycle manager; owns the order store
pub struct OrderLifecycleManager {
    orders: Arc<RwLock<HashMap<Uuid, Order>>>,
    fees: FeeCalculator,
    gateway: Arc<dyn PaymentGateway>,
    journal: Arc<TransactionJournal>,
    ledger: Arc<EscrowLedger>,
    listings: Arc<dyn ListingRegistry>,
}

impl OrderLifecycleManager {
    pub fn new(
        fees: FeeCalculator,
        gateway: Arc<dyn PaymentGateway>,
        journal: Arc<TransactionJournal>,
        ledger: Arc<EscrowLedger>,
        listings: Arc<dyn ListingRegistry>,
    ) -> Self {
        Self {
            orders: Arc::new(RwLock::new(HashMap::new())),
            fees,
            gateway,
            journal,
            ledger,
            listings,
        }
    }

    /// Create an order for an active listing and open the payment intent.
    ///
    /// The listing stays `Active` until payment is confirmed, so abandoned
    /// checkouts never take an item off the market. If the gateway call
    /// fails, nothing is persisted.
    pub async fn create_order(&self, request: CreateOrderRequest) -> MarketplaceResult<Checkout> {
        let listing = self
            .listings
            .listing(request.listing_id)
            .await?
            .filter(|listing| listing.status == ListingStatus::Active)
            .ok_or_else(|| MarketplaceError::invalid_operation("Listing not available"))?;

        if listing.seller_id == request.buyer_id {
            return Err(MarketplaceError::invalid_operation(
                "Cannot purchase your own listing",
            ));
        }

        let split = self.fees.split(listing.price);
        let mut order = Order::new(
            listing.id,
            request.buyer_id,
            listing.seller_id,
            listing.price,
            split.platform_fee,
            split.seller_amount,
            listing.currency.clone(),
            request.shipping_address,
        );

        // Gateway first, store second: a failed intent leaves no
        // half-created order behind
        let mut metadata = HashMap::new();
        metadata.insert("order_id".to_string(), order.id.to_string());
        metadata.insert("buyer_id".to_string(), request.buyer_id.to_string());
        metadata.insert("seller_id".to_string(), listing.seller_id.to_string());
        metadata.insert("listing_id".to_string(), listing.id.to_string());

        let intent = self
            .gateway
            .open_intent(OpenIntentRequest {
                amount_minor: fees::to_minor_units(
                    order.total_amount,
                    self.fees.minor_unit_scale(),
                )?,
                currency: order.currency.clone(),
                description: format!("Purchase: {}", listing.title),
                idempotency_key: order.id.to_string(),
                metadata,
            })
            .await?;

        let transaction = self
            .journal
            .append(Transaction::pending(
                request.buyer_id,
                Some(order.id),
                TransactionType::MarketplacePurchase,
                order.total_amount,
                order.currency.clone(),
                intent.intent_id.clone(),
                format!("Purchase: {}", listing.title),
            ))
            .await?;

        order.transaction_id = Some(transaction.id);
        self.orders.write().await.insert(order.id, order.clone());

        info!(
            order_id = %order.id,
            total = %order.total_amount,
            fee = %order.platform_fee,
            "order created, awaiting payment"
        );

        Ok(Checkout {
            order,
            client_secret: intent.client_secret,
        })
    }

    /// Process a payment confirmation event for an intent.
    ///
    /// Safe to call any number of times for the same intent: unknown intents
    /// and not-yet-succeeded payments return `false` without mutating
    /// anything, and a replay of an already-processed confirmation returns
    /// `true` without creating a second escrow.
    pub async fn confirm_purchase(&self, intent_id: &str) -> MarketplaceResult<bool> {
        let Some(transaction) = self.journal.find_by_intent_id(intent_id).await else {
            // Stray or duplicate webhook for an intent we never opened
            return Ok(false);
        };

        let charge_id = match self.gateway.intent_status(intent_id).await? {
            IntentStatus::Pending => return Ok(false),
            IntentStatus::Failed { reason } => {
                self.abandon_payment(&transaction, &reason).await?;
                return Ok(false);
            }
            IntentStatus::Succeeded { charge_id } => charge_id,
        };

        match self
            .journal
            .complete_if_pending(transaction.id, charge_id)
            .await?
        {
            ClaimOutcome::Claimed => {}
            // Replay of a confirmation that already ran its side effects
            ClaimOutcome::AlreadyCompleted => return Ok(true),
            ClaimOutcome::NotClaimable(status) => {
                warn!(intent_id, ?status, "confirmation for finalized transaction ignored");
                return Ok(false);
            }
        }

        let order_id = transaction.order_id.ok_or_else(|| {
            MarketplaceError::inconsistency(format!(
                "purchase transaction {} has no order reference",
                transaction.id
            ))
        })?;
        let order = self.order_snapshot(order_id).await?;

        let now = Utc::now();
        let escrow = self.ledger.hold(&order, now).await?;

        self.update_order(order_id, |order| {
            order.validate_transition(OrderStatus::EscrowHeld)?;
            order.status = OrderStatus::EscrowHeld;
            order.escrow_id = Some(escrow.id);
            order.confirmed_at = Some(now);
            Ok(())
        })
        .await?;

        self.listings
            .mark_sold(order.listing_id, order.buyer_id, now)
            .await?;

        info!(order_id = %order_id, "payment confirmed, funds held in escrow");
        Ok(true)
    }

    /// Mark an order shipped. Seller only, and only from `EscrowHeld`.
    pub async fn ship_order(&self, request: ShipOrderRequest) -> MarketplaceResult<Order> {
        let updated = self
            .update_order(request.order_id, |order| {
                ensure_seller(order, request.seller_id)?;
                order.validate_transition(OrderStatus::Shipped)?;
                order.status = OrderStatus::Shipped;
                order.tracking_number = Some(request.tracking_number.clone());
                order.shipped_at = Some(Utc::now());
                Ok(())
            })
            .await?;

        info!(order_id = %updated.id, tracking = %request.tracking_number, "order shipped");
        Ok(updated)
    }

    /// Buyer confirms delivery: escrow is released to the seller and the
    /// order completes.
    pub async fn confirm_delivery(
        &self,
        order_id: Uuid,
        buyer_id: Uuid,
    ) -> MarketplaceResult<Order> {
        let order = self.order_snapshot(order_id).await?;
        ensure_buyer(&order, buyer_id)?;
        if !order.status.can_complete() {
            return Err(MarketplaceError::state_transition(
                format!("{:?}", order.status),
                format!("{:?}", OrderStatus::Completed),
                "order is not awaiting delivery".to_string(),
            ));
        }

        let released = self
            .ledger
            .release(order_id, "Buyer confirmed delivery")
            .await?;
        if released.is_none() {
            return Err(MarketplaceError::invalid_operation(
                "escrow is not releasable",
            ));
        }

        let now = Utc::now();
        let updated = self
            .update_order(order_id, |order| {
                order.validate_transition(OrderStatus::Completed)?;
                order.status = OrderStatus::Completed;
                order.confirmed_at = Some(now);
                order.completed_at = Some(now);
                Ok(())
            })
            .await?;

        info!(order_id = %order_id, "delivery confirmed, payment released to seller");
        Ok(updated)
    }

    /// Buyer requests a refund while the escrow is still held. The charge is
    /// reversed at the gateway, the escrow refunded, and the listing put
    /// back on the market. A gateway failure leaves the order visibly in
    /// `EscrowHeld` so the buyer knows no refund occurred.
    pub async fn request_refund(&self, request: RefundRequest) -> MarketplaceResult<Order> {
        let order = self.order_snapshot(request.order_id).await?;
        ensure_buyer(&order, request.buyer_id)?;
        if !order.status.can_refund() {
            return Err(MarketplaceError::state_transition(
                format!("{:?}", order.status),
                format!("{:?}", OrderStatus::Refunded),
                "order is not refundable".to_string(),
            ));
        }

        let refunded = self.ledger.refund(&order, &request.reason).await?;
        if refunded.is_none() {
            return Err(MarketplaceError::invalid_operation(
                "escrow is not refundable",
            ));
        }

        let updated = self
            .update_order(request.order_id, |order| {
                order.validate_transition(OrderStatus::Refunded)?;
                order.status = OrderStatus::Refunded;
                order.notes = Some(request.reason.clone());
                Ok(())
            })
            .await?;

        self.listings.reactivate(order.listing_id).await?;

        info!(order_id = %updated.id, "order refunded, listing reactivated");
        Ok(updated)
    }

    /// Buyer abandons a checkout that was never paid
    pub async fn cancel_order(&self, order_id: Uuid, buyer_id: Uuid) -> MarketplaceResult<Order> {
        let updated = self
            .update_order(order_id, |order| {
                ensure_buyer(order, buyer_id)?;
                order.validate_transition(OrderStatus::Cancelled)?;
                order.status = OrderStatus::Cancelled;
                Ok(())
            })
            .await?;

        if let Some(transaction_id) = updated.transaction_id {
            self.journal.mark_cancelled(transaction_id).await?;
        }

        info!(order_id = %order_id, "order cancelled");
        Ok(updated)
    }

    /// Buyer opens a dispute, freezing auto-release until it is resolved
    pub async fn open_dispute(
        &self,
        order_id: Uuid,
        buyer_id: Uuid,
        reason: &str,
    ) -> MarketplaceResult<Escrow> {
        let order = self.order_snapshot(order_id).await?;
        ensure_buyer(&order, buyer_id)?;
        if !order.status.can_refund() {
            return Err(MarketplaceError::invalid_operation(
                "order has no held escrow to dispute",
            ));
        }

        self.ledger.mark_disputed(order_id, reason).await
    }

    /// Operator settles a dispute in favor of one party. The escrow returns
    /// to `Held` and the ordinary release or refund path runs from there.
    pub async fn resolve_dispute(
        &self,
        order_id: Uuid,
        resolution: DisputeResolution,
        reason: &str,
    ) -> MarketplaceResult<Order> {
        self.ledger.reinstate(order_id).await?;

        match resolution {
            DisputeResolution::ReleaseToSeller => {
                let released = self.ledger.release(order_id, reason).await?;
                if released.is_none() {
                    return Err(MarketplaceError::invalid_operation(
                        "escrow is not releasable",
                    ));
                }
                let now = Utc::now();
                self.update_order(order_id, |order| {
                    order.validate_transition(OrderStatus::Completed)?;
                    order.status = OrderStatus::Completed;
                    order.completed_at = Some(now);
                    Ok(())
                })
                .await
            }
            DisputeResolution::RefundToBuyer => {
                let order = self.order_snapshot(order_id).await?;
                let refunded = self.ledger.refund(&order, reason).await?;
                if refunded.is_none() {
                    return Err(MarketplaceError::invalid_operation(
                        "escrow is not refundable",
                    ));
                }
                let updated = self
                    .update_order(order_id, |order| {
                        order.validate_transition(OrderStatus::Refunded)?;
                        order.status = OrderStatus::Refunded;
                        order.notes = Some(reason.to_string());
                        Ok(())
                    })
                    .await?;
                self.listings.reactivate(order.listing_id).await?;
                Ok(updated)
            }
        }
    }

    /// Scheduler entry point: sweep due escrows, then complete the owning
    /// orders. A released escrow whose order cannot complete is logged for
    /// reconciliation, never silently dropped.
    pub async fn sweep_auto_release(
        &self,
        now: DateTime<Utc>,
    ) -> MarketplaceResult<SweepSummary> {
        let summary = self.ledger.sweep_auto_release(now).await?;

        for &order_id in &summary.released {
            let completed = self
                .update_order(order_id, |order| {
                    order.validate_transition(OrderStatus::Completed)?;
                    order.status = OrderStatus::Completed;
                    order.completed_at = Some(Utc::now());
                    Ok(())
                })
                .await;

            if let Err(e) = completed {
                error!(order_id = %order_id, "escrow released but order not completed: {e}");
            }
        }

        Ok(summary)
    }

    /// Fetch one order; only the buyer or seller may look
    pub async fn order(&self, order_id: Uuid, caller: Uuid) -> MarketplaceResult<Order> {
        let order = self.order_snapshot(order_id).await?;
        if order.buyer_id != caller && order.seller_id != caller {
            return Err(MarketplaceError::forbidden(
                "Only the buyer or seller can view an order",
            ));
        }
        Ok(order)
    }

    /// Orders where the user is buyer or seller, newest first
    pub async fn orders_for_user(&self, user_id: Uuid) -> Vec<Order> {
        let orders = self.orders.read().await;
        let mut result: Vec<Order> = orders
            .values()
            .filter(|order| order.buyer_id == user_id || order.seller_id == user_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        result
    }

    /// Journal entries for a user, newest first
    pub async fn transactions_for_user(&self, user_id: Uuid) -> Vec<Transaction> {
        self.journal.list_for_user(user_id).await
    }

    async fn order_snapshot(&self, order_id: Uuid) -> MarketplaceResult<Order> {
        self.orders
            .read()
            .await
            .get(&order_id)
            .cloned()
            .ok_or_else(|| MarketplaceError::not_found(format!("order {order_id}")))
    }

    /// Apply a transition under the order store's write lock. The closure
    /// runs inside the critical section so status checks and mutations are
    /// atomic per order.
    async fn update_order<F>(&self, order_id: Uuid, apply: F) -> MarketplaceResult<Order>
    where
        F: FnOnce(&mut Order) -> MarketplaceResult<()>,
    {
        let mut orders = self.orders.write().await;
        let order = orders
            .get_mut(&order_id)
            .ok_or_else(|| MarketplaceError::not_found(format!("order {order_id}")))?;
        apply(order)?;
        Ok(order.clone())
    }

    /// Finalize a definitively failed payment: the journal entry fails and
    /// the never-paid order is cancelled.
    async fn abandon_payment(
        &self,
        transaction: &Transaction,
        reason: &str,
    ) -> MarketplaceResult<()> {
        if !self.journal.mark_failed(transaction.id, reason).await? {
            return Ok(());
        }

        if let Some(order_id) = transaction.order_id {
            match self
                .update_order(order_id, |order| {
                    order.validate_transition(OrderStatus::Cancelled)?;
                    order.status = OrderStatus::Cancelled;
                    order.notes = Some(format!("Payment failed: {reason}"));
                    Ok(())
                })
                .await
            {
                Ok(_) => {}
                // Already moved on (e.g. cancelled by the buyer first)
                Err(e) if e.is_domain_rejection() => {}
                Err(e) => return Err(e),
            }
        }

        warn!(transaction_id = %transaction.id, reason, "payment failed at gateway");
        Ok(())
    }
}

fn ensure_buyer(order: &Order, user_id: Uuid) -> MarketplaceResult<()> {
    if order.buyer_id != user_id {
        return Err(MarketplaceError::forbidden(
            "Only the buyer can perform this action",
        ));
    }
    Ok(())
}

fn ensure_seller(order: &Order, user_id: Uuid) -> MarketplaceResult<()> {
    if order.seller_id != user_id {
        return Err(MarketplaceError::forbidden(
            "Only the seller can perform this action",
        ));
    }
    Ok(())
}
