//! Subscription upgrade billing
//!
//! Tier upgrades are sold through the same gateway and journal as
//! marketplace purchases: open an intent, journal a pending charge, apply
//! the tier on the first successful confirmation. Identity itself lives
//! elsewhere; only the tier-application seam is modeled here.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::MarketplaceResult;
use crate::config::SubscriptionPricing;
use crate::error::MarketplaceError;
use crate::fees::{self, DEFAULT_MINOR_UNIT_SCALE};
use crate::gateway::{IntentStatus, OpenIntentRequest, PaymentGateway};
use crate::journal::{ClaimOutcome, TransactionJournal};
use crate::models::{Transaction, TransactionType};

/// Paid subscription tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionTier {
    Free,
    Basic,
    Premium,
    Enterprise,
}

impl SubscriptionPricing {
    /// Price of a tier; `Free` costs nothing and cannot be purchased
    pub fn price(&self, tier: SubscriptionTier) -> Decimal {
        match tier {
            SubscriptionTier::Free => Decimal::ZERO,
            SubscriptionTier::Basic => self.basic,
            SubscriptionTier::Premium => self.premium,
            SubscriptionTier::Enterprise => self.enterprise,
        }
    }
}

/// Port to the account subsystem that owns user records
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn apply_tier(&self, user_id: Uuid, tier: SubscriptionTier) -> MarketplaceResult<()>;
}

/// In-memory account directory for development and tests
#[derive(Default)]
pub struct InMemoryAccountDirectory {
    tiers: Arc<RwLock<HashMap<Uuid, SubscriptionTier>>>,
    applications: Arc<RwLock<Vec<(Uuid, SubscriptionTier)>>>,
}

impl InMemoryAccountDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn tier(&self, user_id: Uuid) -> Option<SubscriptionTier> {
        self.tiers.read().await.get(&user_id).copied()
    }

    /// Every tier application seen, in order
    pub async fn applications(&self) -> Vec<(Uuid, SubscriptionTier)> {
        self.applications.read().await.clone()
    }
}

#[async_trait]
impl AccountDirectory for InMemoryAccountDirectory {
    async fn apply_tier(&self, user_id: Uuid, tier: SubscriptionTier) -> MarketplaceResult<()> {
        self.tiers.write().await.insert(user_id, tier);
        self.applications.write().await.push((user_id, tier));
        Ok(())
    }
}

/// A started upgrade plus the client-facing payment handle
#[derive(Debug, Clone)]
pub struct UpgradeCheckout {
    pub transaction: Transaction,
    pub client_secret: String,
}

/// Sells subscription tier upgrades
pub struct SubscriptionService {
    pricing: SubscriptionPricing,
    gateway: Arc<dyn PaymentGateway>,
    journal: Arc<TransactionJournal>,
    accounts: Arc<dyn AccountDirectory>,
}

impl SubscriptionService {
    pub fn new(
        pricing: SubscriptionPricing,
        gateway: Arc<dyn PaymentGateway>,
        journal: Arc<TransactionJournal>,
        accounts: Arc<dyn AccountDirectory>,
    ) -> Self {
        Self {
            pricing,
            gateway,
            journal,
            accounts,
        }
    }

    /// Open a payment intent for a tier upgrade and journal the pending
    /// charge. Nothing is persisted when the gateway call fails.
    pub async fn start_upgrade(
        &self,
        user_id: Uuid,
        tier: SubscriptionTier,
    ) -> MarketplaceResult<UpgradeCheckout> {
        let price = self.pricing.price(tier);
        if price <= Decimal::ZERO {
            return Err(MarketplaceError::invalid_operation(format!(
                "tier {tier:?} has no charge"
            )));
        }

        // The journal entry id doubles as the gateway idempotency key for
        // this logical operation
        let reference = Uuid::new_v4();

        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());
        metadata.insert("type".to_string(), "subscription".to_string());
        metadata.insert("tier".to_string(), format!("{tier:?}"));

        let intent = self
            .gateway
            .open_intent(OpenIntentRequest {
                amount_minor: fees::to_minor_units(price, DEFAULT_MINOR_UNIT_SCALE)?,
                currency: self.pricing.currency.clone(),
                description: format!("Subscription upgrade to {tier:?}"),
                idempotency_key: reference.to_string(),
                metadata,
            })
            .await?;

        let mut transaction = Transaction::pending(
            user_id,
            None,
            TransactionType::SubscriptionUpgrade,
            price,
            self.pricing.currency.clone(),
            intent.intent_id.clone(),
            format!("Upgrade to {tier:?} subscription"),
        )
        .with_metadata(serde_json::json!({ "target_tier": tier }));
        transaction.id = reference;

        let transaction = self.journal.append(transaction).await?;

        info!(user_id = %user_id, ?tier, "subscription upgrade started");

        Ok(UpgradeCheckout {
            transaction,
            client_secret: intent.client_secret,
        })
    }

    /// Process a payment confirmation for an upgrade intent. Idempotent the
    /// same way order confirmation is: only the first successful call
    /// applies the tier.
    pub async fn confirm_upgrade(&self, intent_id: &str) -> MarketplaceResult<bool> {
        let Some(transaction) = self.journal.find_by_intent_id(intent_id).await else {
            return Ok(false);
        };

        let charge_id = match self.gateway.intent_status(intent_id).await? {
            IntentStatus::Pending => return Ok(false),
            IntentStatus::Failed { reason } => {
                self.journal.mark_failed(transaction.id, &reason).await?;
                warn!(intent_id, reason, "subscription payment failed");
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
            ClaimOutcome::AlreadyCompleted => return Ok(true),
            ClaimOutcome::NotClaimable(_) => return Ok(false),
        }

        let tier: SubscriptionTier = transaction
            .metadata
            .as_ref()
            .and_then(|metadata| metadata.get("target_tier").cloned())
            .map(serde_json::from_value)
            .transpose()?
            .ok_or_else(|| {
                MarketplaceError::inconsistency(format!(
                    "upgrade transaction {} has no target tier",
                    transaction.id
                ))
            })?;

        self.accounts.apply_tier(transaction.user_id, tier).await?;

        info!(user_id = %transaction.user_id, ?tier, "subscription upgraded");
        Ok(true)
    }
}
