//! Marketplace engine - wires every component from one configuration
//!
//! The facade the transport layer (controllers, schedulers) talks to. The
//! gateway, listing registry and account directory are injected so the same
//! wiring serves production (HTTP gateway) and tests (in-memory fakes).

use std::sync::Arc;

use crate::MarketplaceResult;
use crate::config::EngineConfig;
use crate::escrow::EscrowLedger;
use crate::fees::FeeCalculator;
use crate::gateway::PaymentGateway;
use crate::journal::TransactionJournal;
use crate::listings::ListingRegistry;
use crate::orders::OrderLifecycleManager;
use crate::subscriptions::{AccountDirectory, SubscriptionService};
use crate::worker::AutoReleaseWorker;

/// Main engine that owns the journal, ledger and lifecycle manager
pub struct MarketplaceEngine {
    config: EngineConfig,
    journal: Arc<TransactionJournal>,
    ledger: Arc<EscrowLedger>,
    orders: Arc<OrderLifecycleManager>,
    subscriptions: Arc<SubscriptionService>,
}

impl MarketplaceEngine {
    pub fn new(
        config: EngineConfig,
        gateway: Arc<dyn PaymentGateway>,
        listings: Arc<dyn ListingRegistry>,
        accounts: Arc<dyn AccountDirectory>,
    ) -> MarketplaceResult<Self> {
        config.fees.validate()?;

        let journal = Arc::new(TransactionJournal::new());
        let ledger = Arc::new(EscrowLedger::new(
            config.escrow.clone(),
            Arc::clone(&journal),
            Arc::clone(&gateway),
        ));
        let orders = Arc::new(OrderLifecycleManager::new(
            FeeCalculator::new(config.fees.clone()),
            Arc::clone(&gateway),
            Arc::clone(&journal),
            Arc::clone(&ledger),
            listings,
        ));
        let subscriptions = Arc::new(SubscriptionService::new(
            config.pricing.clone(),
            gateway,
            Arc::clone(&journal),
            accounts,
        ));

        Ok(Self {
            config,
            journal,
            ledger,
            orders,
            subscriptions,
        })
    }

    /// Order lifecycle operations
    pub fn orders(&self) -> &Arc<OrderLifecycleManager> {
        &self.orders
    }

    /// Subscription billing operations
    pub fn subscriptions(&self) -> &Arc<SubscriptionService> {
        &self.subscriptions
    }

    /// Money-movement journal
    pub fn journal(&self) -> &Arc<TransactionJournal> {
        &self.journal
    }

    /// Escrow ledger
    pub fn ledger(&self) -> &Arc<EscrowLedger> {
        &self.ledger
    }

    /// Build the periodic auto-release worker for this engine
    pub fn auto_release_worker(&self) -> AutoReleaseWorker {
        AutoReleaseWorker::new(self.config.worker.clone(), Arc::clone(&self.orders))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::InMemoryGateway;
    use crate::listings::{InMemoryListingRegistry, ListingRecord};
    use crate::models::{EscrowStatus, OrderStatus};
    use crate::orders::{CreateOrderRequest, ShipOrderRequest};
    use crate::subscriptions::InMemoryAccountDirectory;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    #[tokio::test]
    async fn full_purchase_flow_through_the_facade() {
        let gateway = Arc::new(InMemoryGateway::new());
        let listings = Arc::new(InMemoryListingRegistry::new());
        let accounts = Arc::new(InMemoryAccountDirectory::new());
        let engine = MarketplaceEngine::new(
            EngineConfig::default(),
            gateway.clone() as Arc<dyn PaymentGateway>,
            listings.clone() as Arc<dyn ListingRegistry>,
            accounts as Arc<dyn AccountDirectory>,
        )
        .unwrap();

        let seller_id = Uuid::new_v4();
        let buyer_id = Uuid::new_v4();
        let listing_id = listings
            .insert(ListingRecord::active(seller_id, "Laptop", dec!(500.00), "GBP"))
            .await;

        let checkout = engine
            .orders()
            .create_order(CreateOrderRequest {
                buyer_id,
                listing_id,
                shipping_address: "3 Mill Lane".to_string(),
            })
            .await
            .unwrap();

        let transaction = engine
            .journal()
            .find(checkout.order.transaction_id.unwrap())
            .await
            .unwrap();
        let intent_id = transaction.gateway_intent_id.unwrap();
        gateway.settle(&intent_id).await.unwrap();
        assert!(engine.orders().confirm_purchase(&intent_id).await.unwrap());

        engine
            .orders()
            .ship_order(ShipOrderRequest {
                order_id: checkout.order.id,
                seller_id,
                tracking_number: "TRK-500".to_string(),
            })
            .await
            .unwrap();

        let completed = engine
            .orders()
            .confirm_delivery(checkout.order.id, buyer_id)
            .await
            .unwrap();
        assert_eq!(completed.status, OrderStatus::Completed);
        assert_eq!(
            engine
                .ledger()
                .escrow_for_order(checkout.order.id)
                .await
                .unwrap()
                .status,
            EscrowStatus::Released
        );

        // 5% of 500.00 stays with the platform
        let payout = engine
            .journal()
            .list_for_user(seller_id)
            .await
            .into_iter()
            .next()
            .unwrap();
        assert_eq!(payout.amount, dec!(475.00));
    }
}
