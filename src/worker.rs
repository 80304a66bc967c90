//! Auto-release worker - periodic scheduler for the escrow sweep
//!
//! Runs the auto-release sweep on a fixed interval until asked to stop.
//! Retries belong here, not in the lifecycle manager: a failed sweep is
//! logged and simply tried again on the next tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::config::WorkerConfig;
use crate::orders::OrderLifecycleManager;

/// Periodic driver for [`OrderLifecycleManager::sweep_auto_release`]
pub struct AutoReleaseWorker {
    config: WorkerConfig,
    manager: Arc<OrderLifecycleManager>,
}

impl AutoReleaseWorker {
    pub fn new(config: WorkerConfig, manager: Arc<OrderLifecycleManager>) -> Self {
        Self { config, manager }
    }

    /// Run until the shutdown channel flips to `true` or its sender drops.
    /// Shutdown is honored between sweeps; an in-flight sweep finishes its
    /// current escrow first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval_secs = self.config.sweep_interval_secs.max(1);
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs, "auto-release worker started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.manager.sweep_auto_release(Utc::now()).await {
                        Ok(summary) => {
                            if !summary.released.is_empty() || summary.failed > 0 {
                                info!(
                                    released = summary.released.len(),
                                    failed = summary.failed,
                                    "auto-release sweep finished"
                                );
                            }
                        }
                        Err(e) => warn!("auto-release sweep failed: {e}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("auto-release worker stopping");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EscrowPolicy, FeePolicy};
    use crate::escrow::EscrowLedger;
    use crate::fees::FeeCalculator;
    use crate::gateway::{InMemoryGateway, PaymentGateway};
    use crate::journal::TransactionJournal;
    use crate::listings::{InMemoryListingRegistry, ListingRecord, ListingRegistry};
    use crate::models::OrderStatus;
    use crate::orders::CreateOrderRequest;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    /// Manager with a zero-day holding period so escrows are due as soon as
    /// they are held
    async fn manager_with_due_order() -> (Arc<OrderLifecycleManager>, Uuid, Uuid) {
        let gateway = Arc::new(InMemoryGateway::new());
        let journal = Arc::new(TransactionJournal::new());
        let ledger = Arc::new(EscrowLedger::new(
            EscrowPolicy {
                holding_period_days: 0,
            },
            Arc::clone(&journal),
            gateway.clone() as Arc<dyn PaymentGateway>,
        ));
        let listings = Arc::new(InMemoryListingRegistry::new());
        let manager = Arc::new(OrderLifecycleManager::new(
            FeeCalculator::new(FeePolicy::default()),
            gateway.clone() as Arc<dyn PaymentGateway>,
            Arc::clone(&journal),
            ledger,
            listings.clone() as Arc<dyn ListingRegistry>,
        ));

        let seller_id = Uuid::new_v4();
        let buyer_id = Uuid::new_v4();
        let listing_id = listings
            .insert(ListingRecord::active(seller_id, "Tablet", dec!(80.00), "GBP"))
            .await;
        let checkout = manager
            .create_order(CreateOrderRequest {
                buyer_id,
                listing_id,
                shipping_address: "2 Low Road".to_string(),
            })
            .await
            .unwrap();

        let transaction = journal.find(checkout.order.transaction_id.unwrap()).await.unwrap();
        let intent_id = transaction.gateway_intent_id.unwrap();
        gateway.settle(&intent_id).await.unwrap();
        assert!(manager.confirm_purchase(&intent_id).await.unwrap());

        (manager, checkout.order.id, buyer_id)
    }

    #[tokio::test]
    async fn first_tick_sweeps_due_escrows() {
        let (manager, order_id, buyer_id) = manager_with_due_order().await;
        let worker = AutoReleaseWorker::new(
            WorkerConfig {
                sweep_interval_secs: 1,
            },
            Arc::clone(&manager),
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(stop_rx).await });

        // The interval's first tick fires immediately
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker did not stop")
            .unwrap();

        let order = manager.order(order_id, buyer_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Completed);
    }

    #[tokio::test]
    async fn stops_when_sender_drops() {
        let (manager, _, _) = manager_with_due_order().await;
        let worker = AutoReleaseWorker::new(
            WorkerConfig {
                sweep_interval_secs: 3600,
            },
            manager,
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(stop_rx).await });

        drop(stop_tx);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }
}
