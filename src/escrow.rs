//! Escrow Ledger - custody of held seller proceeds
//!
//! Owns the escrow state machine (Held/Released/Refunded/Disputed) and the
//! auto-release sweep. Every transition is a check-and-set inside a single
//! write critical section, so two concurrent callers can never both observe
//! `Held` and double-credit the seller. Gateway calls happen outside any
//! lock; the refund path re-checks the status afterwards and fails closed.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::MarketplaceResult;
use crate::config::EscrowPolicy;
use crate::error::MarketplaceError;
use crate::gateway::PaymentGateway;
use crate::journal::TransactionJournal;
use crate::models::{Escrow, EscrowStatus, Order, Transaction, TransactionType};

/// Release reason recorded by the auto-release sweep
pub const AUTO_RELEASE_REASON: &str = "Auto-released after holding period";

/// Result of one auto-release sweep
#[derive(Debug, Clone, Default)]
pub struct SweepSummary {
    /// Order ids whose escrow was released this sweep
    pub released: Vec<Uuid>,
    /// Escrows that errored; the sweep carried on past them
    pub failed: u32,
    /// Escrows that left `Held` between selection and release
    pub skipped: u32,
    /// True when a stop request halted the sweep early
    pub stopped: bool,
}

/// Ledger of escrows, keyed by owning order (1:1)
pub struct EscrowLedger {
    policy: EscrowPolicy,
    escrows: Arc<RwLock<HashMap<Uuid, Escrow>>>,
    journal: Arc<TransactionJournal>,
    gateway: Arc<dyn PaymentGateway>,
    stop_requested: AtomicBool,
}

impl EscrowLedger {
    pub fn new(
        policy: EscrowPolicy,
        journal: Arc<TransactionJournal>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        Self {
            policy,
            escrows: Arc::new(RwLock::new(HashMap::new())),
            journal,
            gateway,
            stop_requested: AtomicBool::new(false),
        }
    }

    /// Take custody of an order's seller proceeds. Created exactly once per
    /// order, at payment confirmation.
    pub async fn hold(&self, order: &Order, now: DateTime<Utc>) -> MarketplaceResult<Escrow> {
        let mut escrows = self.escrows.write().await;
        if escrows.contains_key(&order.id) {
            return Err(MarketplaceError::inconsistency(format!(
                "order {} already has an escrow",
                order.id
            )));
        }

        let escrow = Escrow::new(order, now, self.policy.holding_period_days);
        escrows.insert(order.id, escrow.clone());

        info!(
            order_id = %order.id,
            amount = %escrow.amount,
            auto_release_date = %escrow.auto_release_date,
            "escrow held"
        );

        Ok(escrow)
    }

    pub async fn escrow_for_order(&self, order_id: Uuid) -> Option<Escrow> {
        self.escrows.read().await.get(&order_id).cloned()
    }

    /// Release held funds to the seller and journal the payout.
    ///
    /// Returns `Ok(None)` when there is nothing to do (no escrow, or the
    /// escrow already left `Held`), so callers can tell "no-op" from a hard
    /// error. The status check and transition share one write critical
    /// section; the losing side of any race lands in the `None` arm.
    pub async fn release(&self, order_id: Uuid, reason: &str) -> MarketplaceResult<Option<Escrow>> {
        let released = {
            let mut escrows = self.escrows.write().await;
            let Some(escrow) = escrows.get_mut(&order_id) else {
                return Ok(None);
            };
            if !escrow.status.can_release() {
                return Ok(None);
            }

            escrow.validate_transition(EscrowStatus::Released)?;
            escrow.status = EscrowStatus::Released;
            escrow.released_at = Some(Utc::now());
            escrow.release_reason = Some(reason.to_string());
            escrow.clone()
        };

        self.journal
            .append(Transaction::completed(
                released.seller_id,
                Some(order_id),
                TransactionType::EscrowRelease,
                released.amount,
                released.currency.clone(),
                format!("Payment received for order #{order_id}"),
            ))
            .await?;

        info!(order_id = %order_id, amount = %released.amount, reason, "escrow released");

        Ok(Some(released))
    }

    /// Reverse the buyer's charge at the gateway and refund the escrow.
    ///
    /// Requires the originating transaction to have recorded a gateway charge
    /// reference; a payment that never reached "charged" cannot be refunded
    /// and is rejected outright. On gateway failure nothing changes locally.
    pub async fn refund(&self, order: &Order, reason: &str) -> MarketplaceResult<Option<Escrow>> {
        {
            let escrows = self.escrows.read().await;
            let Some(escrow) = escrows.get(&order.id) else {
                return Ok(None);
            };
            if !escrow.status.can_refund() {
                return Ok(None);
            }
        }

        let charge_id = self.charge_reference(order).await?;

        // Network call with no lock held; a slow gateway must not block
        // unrelated escrows. Failure leaves escrow and order untouched.
        self.gateway.refund_charge(&charge_id, reason).await?;

        let refunded = {
            let mut escrows = self.escrows.write().await;
            let escrow = escrows.get_mut(&order.id).ok_or_else(|| {
                MarketplaceError::inconsistency(format!(
                    "escrow for order {} vanished during refund",
                    order.id
                ))
            })?;

            // Fail closed: if the sweep or a concurrent release won the race
            // while the gateway call was in flight, the money has now moved
            // twice and only manual reconciliation can fix it.
            if !escrow.status.can_refund() {
                error!(
                    order_id = %order.id,
                    status = ?escrow.status,
                    "charge refunded at gateway but escrow already settled; manual reconciliation required"
                );
                return Err(MarketplaceError::inconsistency(format!(
                    "refund for order {} settled at gateway but escrow was already {:?}",
                    order.id, escrow.status
                )));
            }

            escrow.validate_transition(EscrowStatus::Refunded)?;
            escrow.status = EscrowStatus::Refunded;
            escrow.refunded_at = Some(Utc::now());
            escrow.refund_reason = Some(reason.to_string());
            escrow.clone()
        };

        // Buyer is made whole for the full order total, fee included
        self.journal
            .append(Transaction::completed(
                refunded.buyer_id,
                Some(order.id),
                TransactionType::Refund,
                order.total_amount,
                order.currency.clone(),
                format!("Refund for order #{}: {reason}", order.id),
            ))
            .await?;

        info!(order_id = %order.id, amount = %order.total_amount, "escrow refunded");

        Ok(Some(refunded))
    }

    /// Freeze auto-release while a dispute is open
    pub async fn mark_disputed(&self, order_id: Uuid, reason: &str) -> MarketplaceResult<Escrow> {
        let mut escrows = self.escrows.write().await;
        let escrow = escrows
            .get_mut(&order_id)
            .ok_or_else(|| MarketplaceError::not_found(format!("escrow for order {order_id}")))?;

        escrow.validate_transition(EscrowStatus::Disputed)?;
        escrow.status = EscrowStatus::Disputed;
        escrow.dispute_reason = Some(reason.to_string());

        warn!(order_id = %order_id, reason, "escrow disputed; auto-release frozen");

        Ok(escrow.clone())
    }

    /// Return a disputed escrow to `Held` so the normal release or refund
    /// path can settle it
    pub async fn reinstate(&self, order_id: Uuid) -> MarketplaceResult<Escrow> {
        let mut escrows = self.escrows.write().await;
        let escrow = escrows
            .get_mut(&order_id)
            .ok_or_else(|| MarketplaceError::not_found(format!("escrow for order {order_id}")))?;

        escrow.validate_transition(EscrowStatus::Held)?;
        escrow.status = EscrowStatus::Held;

        Ok(escrow.clone())
    }

    /// Ask an in-flight sweep to halt before its next release
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Release every held escrow whose auto-release date has passed.
    ///
    /// Each escrow is released independently: one failure is logged and
    /// counted, and the sweep carries on. Safe to invoke repeatedly and
    /// concurrently with manual releases; `release` is a no-op once an
    /// escrow leaves `Held`.
    pub async fn sweep_auto_release(&self, now: DateTime<Utc>) -> MarketplaceResult<SweepSummary> {
        let due: Vec<Uuid> = {
            let escrows = self.escrows.read().await;
            escrows
                .values()
                .filter(|escrow| escrow.due_for_auto_release(now))
                .map(|escrow| escrow.order_id)
                .collect()
        };

        let mut summary = SweepSummary::default();

        for order_id in due {
            if self.stop_requested.swap(false, Ordering::SeqCst) {
                summary.stopped = true;
                warn!(
                    released = summary.released.len(),
                    "auto-release sweep stopped on request"
                );
                break;
            }

            match self.release(order_id, AUTO_RELEASE_REASON).await {
                Ok(Some(_)) => summary.released.push(order_id),
                Ok(None) => summary.skipped += 1,
                Err(e) => {
                    summary.failed += 1;
                    error!(order_id = %order_id, "auto-release failed: {e}");
                }
            }
        }

        // A request that arrived too late to stop anything is spent either way
        self.stop_requested.store(false, Ordering::SeqCst);

        info!(
            released = summary.released.len(),
            skipped = summary.skipped,
            failed = summary.failed,
            "auto-release sweep finished"
        );

        Ok(summary)
    }

    async fn charge_reference(&self, order: &Order) -> MarketplaceResult<String> {
        let transaction_id = order.transaction_id.ok_or_else(|| {
            MarketplaceError::invalid_operation(format!(
                "order {} has no capturing transaction to refund",
                order.id
            ))
        })?;

        let transaction = self.journal.find(transaction_id).await.ok_or_else(|| {
            MarketplaceError::inconsistency(format!(
                "order {} references missing transaction {transaction_id}",
                order.id
            ))
        })?;

        transaction.gateway_charge_id.ok_or_else(|| {
            MarketplaceError::invalid_operation(format!(
                "payment for order {} was never charged; nothing to refund",
                order.id
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::InMemoryGateway;
    use crate::journal::ClaimOutcome;
    use crate::models::{TransactionStatus, TransactionType};
    use rust_decimal_macros::dec;

    struct Harness {
        ledger: EscrowLedger,
        journal: Arc<TransactionJournal>,
        gateway: Arc<InMemoryGateway>,
    }

    fn harness() -> Harness {
        let journal = Arc::new(TransactionJournal::new());
        let gateway = Arc::new(InMemoryGateway::new());
        let ledger = EscrowLedger::new(
            EscrowPolicy::default(),
            Arc::clone(&journal),
            gateway.clone() as Arc<dyn PaymentGateway>,
        );
        Harness {
            ledger,
            journal,
            gateway,
        }
    }

    fn order() -> Order {
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

    /// Journal a completed purchase with a charge reference, wiring the
    /// order to it the way confirmation does
    async fn charged_order(h: &Harness) -> Order {
        let mut order = order();
        let tx = h
            .journal
            .append(Transaction::pending(
                order.buyer_id,
                Some(order.id),
                TransactionType::MarketplacePurchase,
                order.total_amount,
                order.currency.clone(),
                format!("pi_{}", order.id.simple()),
                "Purchase: test".to_string(),
            ))
            .await
            .unwrap();
        let outcome = h
            .journal
            .complete_if_pending(tx.id, Some("ch_test".to_string()))
            .await
            .unwrap();
        assert_eq!(outcome, ClaimOutcome::Claimed);
        order.transaction_id = Some(tx.id);
        order
    }

    #[tokio::test]
    async fn release_credits_seller_once() {
        let h = harness();
        let order = order();
        h.ledger.hold(&order, Utc::now()).await.unwrap();

        let released = h.ledger.release(order.id, "delivered").await.unwrap();
        assert_eq!(released.unwrap().status, EscrowStatus::Released);

        // Second release is a no-op, and no second payout is journaled
        let again = h.ledger.release(order.id, "delivered").await.unwrap();
        assert!(again.is_none());

        let payouts = h.journal.list_for_user(order.seller_id).await;
        assert_eq!(payouts.len(), 1);
        assert_eq!(payouts[0].kind, TransactionType::EscrowRelease);
        assert_eq!(payouts[0].amount, dec!(95.00));
        assert_eq!(payouts[0].status, TransactionStatus::Completed);
    }

    #[tokio::test]
    async fn release_without_escrow_is_a_noop() {
        let h = harness();
        let outcome = h.ledger.release(Uuid::new_v4(), "nothing").await.unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn duplicate_hold_is_rejected() {
        let h = harness();
        let order = order();
        h.ledger.hold(&order, Utc::now()).await.unwrap();
        assert!(h.ledger.hold(&order, Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn refund_reverses_charge_and_credits_buyer() {
        let h = harness();
        let order = charged_order(&h).await;
        h.ledger.hold(&order, Utc::now()).await.unwrap();

        let refunded = h.ledger.refund(&order, "item damaged").await.unwrap();
        assert_eq!(refunded.unwrap().status, EscrowStatus::Refunded);

        let refunds = h.gateway.refunds().await;
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0].charge_id, "ch_test");

        let credits = h.journal.list_for_user(order.buyer_id).await;
        let refund_entry = credits
            .iter()
            .find(|t| t.kind == TransactionType::Refund)
            .unwrap();
        assert_eq!(refund_entry.amount, dec!(100.00));
    }

    #[tokio::test]
    async fn refund_gateway_failure_leaves_escrow_held() {
        let h = harness();
        let order = charged_order(&h).await;
        h.ledger.hold(&order, Utc::now()).await.unwrap();
        h.gateway.set_refunds_fail(true).await;

        let result = h.ledger.refund(&order, "item damaged").await;
        assert!(matches!(result, Err(MarketplaceError::Gateway(_))));

        let escrow = h.ledger.escrow_for_order(order.id).await.unwrap();
        assert_eq!(escrow.status, EscrowStatus::Held);
        assert!(
            h.journal
                .list_for_user(order.buyer_id)
                .await
                .iter()
                .all(|t| t.kind != TransactionType::Refund)
        );
    }

    #[tokio::test]
    async fn refund_without_charge_reference_is_rejected() {
        let h = harness();
        let mut order = order();
        let tx = h
            .journal
            .append(Transaction::pending(
                order.buyer_id,
                Some(order.id),
                TransactionType::MarketplacePurchase,
                order.total_amount,
                order.currency.clone(),
                "pi_uncharged".to_string(),
                "Purchase: test".to_string(),
            ))
            .await
            .unwrap();
        order.transaction_id = Some(tx.id);
        h.ledger.hold(&order, Utc::now()).await.unwrap();

        let result = h.ledger.refund(&order, "cold feet").await;
        assert!(matches!(result, Err(MarketplaceError::InvalidOperation(_))));
        assert!(h.gateway.refunds().await.is_empty());
    }

    #[tokio::test]
    async fn sweep_releases_exactly_the_due_escrows() {
        let h = harness();
        let now = Utc::now();

        let due = order();
        let fresh = order();
        let disputed = order();
        h.ledger.hold(&due, now - chrono::Duration::days(15)).await.unwrap();
        h.ledger.hold(&fresh, now).await.unwrap();
        h.ledger
            .hold(&disputed, now - chrono::Duration::days(20))
            .await
            .unwrap();
        h.ledger.mark_disputed(disputed.id, "not as described").await.unwrap();

        let summary = h.ledger.sweep_auto_release(now).await.unwrap();
        assert_eq!(summary.released, vec![due.id]);
        assert_eq!(summary.failed, 0);
        assert!(!summary.stopped);

        assert_eq!(
            h.ledger.escrow_for_order(due.id).await.unwrap().status,
            EscrowStatus::Released
        );
        assert_eq!(
            h.ledger.escrow_for_order(fresh.id).await.unwrap().status,
            EscrowStatus::Held
        );
        assert_eq!(
            h.ledger.escrow_for_order(disputed.id).await.unwrap().status,
            EscrowStatus::Disputed
        );

        // Repeating the sweep finds nothing new to do
        let again = h.ledger.sweep_auto_release(now).await.unwrap();
        assert!(again.released.is_empty());
    }

    #[tokio::test]
    async fn stop_request_halts_sweep_before_first_release() {
        let h = harness();
        let now = Utc::now();
        let order = order();
        h.ledger.hold(&order, now - chrono::Duration::days(15)).await.unwrap();

        h.ledger.request_stop();
        let summary = h.ledger.sweep_auto_release(now).await.unwrap();
        assert!(summary.stopped);
        assert!(summary.released.is_empty());
        assert_eq!(
            h.ledger.escrow_for_order(order.id).await.unwrap().status,
            EscrowStatus::Held
        );

        // The stop request is consumed; the next sweep proceeds
        let summary = h.ledger.sweep_auto_release(now).await.unwrap();
        assert_eq!(summary.released, vec![order.id]);
    }

    #[tokio::test]
    async fn reinstated_dispute_can_settle() {
        let h = harness();
        let order = order();
        h.ledger.hold(&order, Utc::now()).await.unwrap();
        h.ledger.mark_disputed(order.id, "wrong colour").await.unwrap();

        // Frozen: no release while disputed
        assert!(h.ledger.release(order.id, "x").await.unwrap().is_none());

        h.ledger.reinstate(order.id).await.unwrap();
        let released = h.ledger.release(order.id, "resolved for seller").await.unwrap();
        assert_eq!(released.unwrap().status, EscrowStatus::Released);
    }
}
