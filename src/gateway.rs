//! Payment Gateway Adapter - the system's only network-facing money mover
//!
//! `PaymentGateway` abstracts a hosted card-payment processor: open a payment
//! intent, fetch its current status, reverse a captured charge. All calls are
//! network operations that may fail or time out; callers must treat failure
//! as "no state change occurred remotely". Deduplication is the caller's job
//! via a per-operation idempotency key (the order or transaction id).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::MarketplaceResult;
use crate::config::GatewayConfig;
use crate::error::MarketplaceError;

/// Request to open a payment intent
#[derive(Debug, Clone)]
pub struct OpenIntentRequest {
    /// Amount in the currency's minor units
    pub amount_minor: i64,
    pub currency: String,
    pub description: String,
    /// Caller-supplied deduplication key for this logical operation
    pub idempotency_key: String,
    pub metadata: HashMap<String, String>,
}

/// Gateway-side handle for an opened intent
#[derive(Debug, Clone)]
pub struct PaymentIntent {
    pub intent_id: String,
    /// Client-facing secret the buyer's browser completes the charge with
    pub client_secret: String,
}

/// Current state of a payment intent at the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntentStatus {
    /// Charge captured; the charge reference is needed for later refunds
    Succeeded { charge_id: Option<String> },
    /// Still awaiting buyer action or settlement
    Pending,
    /// Definitively failed or cancelled at the gateway
    Failed { reason: String },
}

/// Capability set of the external payment processor
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn open_intent(&self, request: OpenIntentRequest) -> MarketplaceResult<PaymentIntent>;

    async fn intent_status(&self, intent_id: &str) -> MarketplaceResult<IntentStatus>;

    /// Reverse a captured charge. Success means the money is on its way back
    /// to the buyer; failure means nothing changed remotely.
    async fn refund_charge(&self, charge_id: &str, reason: &str) -> MarketplaceResult<()>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// Wire representation of a payment intent resource
#[derive(Debug, Deserialize)]
struct IntentResource {
    id: String,
    status: String,
    client_secret: Option<String>,
    latest_charge: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefundResource {
    #[allow(dead_code)]
    id: String,
    status: String,
}

/// REST client for a Stripe-style hosted payment processor
pub struct HttpPaymentGateway {
    config: GatewayConfig,
    client: reqwest::Client,
}

impl HttpPaymentGateway {
    pub fn new(config: GatewayConfig) -> MarketplaceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| MarketplaceError::gateway(e.to_string()))?;

        Ok(Self { config, client })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.config.api_base.trim_end_matches('/'))
    }

    fn map_status(resource: &IntentResource) -> IntentStatus {
        match resource.status.as_str() {
            "succeeded" => IntentStatus::Succeeded {
                charge_id: resource.latest_charge.clone(),
            },
            "canceled" => IntentStatus::Failed {
                reason: "intent cancelled at gateway".to_string(),
            },
            "payment_failed" => IntentStatus::Failed {
                reason: "payment failed at gateway".to_string(),
            },
            // requires_payment_method, requires_confirmation, processing, ...
            _ => IntentStatus::Pending,
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn open_intent(&self, request: OpenIntentRequest) -> MarketplaceResult<PaymentIntent> {
        let mut form: Vec<(String, String)> = vec![
            ("amount".to_string(), request.amount_minor.to_string()),
            ("currency".to_string(), request.currency.to_lowercase()),
            ("description".to_string(), request.description.clone()),
        ];
        for (key, value) in &request.metadata {
            form.push((format!("metadata[{key}]"), value.clone()));
        }

        let resource: IntentResource = self
            .client
            .post(self.endpoint("/v1/payment_intents"))
            .bearer_auth(&self.config.secret_key)
            .header("Idempotency-Key", &request.idempotency_key)
            .form(&form)
            .send()
            .await
            .map_err(|e| MarketplaceError::gateway(e.to_string()))?
            .error_for_status()
            .map_err(|e| MarketplaceError::gateway(e.to_string()))?
            .json()
            .await
            .map_err(|e| MarketplaceError::gateway(e.to_string()))?;

        let client_secret = resource.client_secret.clone().ok_or_else(|| {
            MarketplaceError::gateway(format!("intent {} returned no client secret", resource.id))
        })?;

        info!(intent_id = %resource.id, "opened payment intent");

        Ok(PaymentIntent {
            intent_id: resource.id,
            client_secret,
        })
    }

    async fn intent_status(&self, intent_id: &str) -> MarketplaceResult<IntentStatus> {
        let resource: IntentResource = self
            .client
            .get(self.endpoint(&format!("/v1/payment_intents/{intent_id}")))
            .bearer_auth(&self.config.secret_key)
            .send()
            .await
            .map_err(|e| MarketplaceError::gateway(e.to_string()))?
            .error_for_status()
            .map_err(|e| MarketplaceError::gateway(e.to_string()))?
            .json()
            .await
            .map_err(|e| MarketplaceError::gateway(e.to_string()))?;

        Ok(Self::map_status(&resource))
    }

    async fn refund_charge(&self, charge_id: &str, reason: &str) -> MarketplaceResult<()> {
        let form = [
            ("charge".to_string(), charge_id.to_string()),
            ("reason".to_string(), "requested_by_customer".to_string()),
            ("metadata[detail]".to_string(), reason.to_string()),
        ];

        let resource: RefundResource = self
            .client
            .post(self.endpoint("/v1/refunds"))
            .bearer_auth(&self.config.secret_key)
            .header("Idempotency-Key", format!("refund-{charge_id}"))
            .form(&form)
            .send()
            .await
            .map_err(|e| MarketplaceError::gateway(e.to_string()))?
            .error_for_status()
            .map_err(|e| MarketplaceError::gateway(e.to_string()))?
            .json()
            .await
            .map_err(|e| MarketplaceError::gateway(e.to_string()))?;

        if resource.status == "failed" {
            return Err(MarketplaceError::gateway(format!(
                "refund for charge {charge_id} failed at gateway"
            )));
        }

        info!(charge_id, "charge refunded");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct SimulatedIntent {
    status: IntentStatus,
}

/// One refund recorded by the simulator
#[derive(Debug, Clone)]
pub struct RefundRecord {
    pub charge_id: String,
    pub reason: String,
}

/// Deterministic gateway simulator for development and tests.
///
/// Intents open in `Pending` and are advanced explicitly with
/// [`InMemoryGateway::settle`] / [`InMemoryGateway::fail`], standing in for
/// the buyer completing (or abandoning) the charge in their browser.
#[derive(Default)]
pub struct InMemoryGateway {
    intents: Arc<RwLock<HashMap<String, SimulatedIntent>>>,
    refunds: Arc<RwLock<Vec<RefundRecord>>>,
    refunds_fail: Arc<RwLock<bool>>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the buyer completing the charge
    pub async fn settle(&self, intent_id: &str) -> MarketplaceResult<()> {
        let mut intents = self.intents.write().await;
        let intent = intents.get_mut(intent_id).ok_or_else(|| {
            MarketplaceError::not_found(format!("intent {intent_id} not found"))
        })?;
        intent.status = IntentStatus::Succeeded {
            charge_id: Some(format!("ch_{}", Uuid::new_v4().simple())),
        };
        Ok(())
    }

    /// Simulate the charge failing at the gateway
    pub async fn fail(&self, intent_id: &str) -> MarketplaceResult<()> {
        let mut intents = self.intents.write().await;
        let intent = intents.get_mut(intent_id).ok_or_else(|| {
            MarketplaceError::not_found(format!("intent {intent_id} not found"))
        })?;
        intent.status = IntentStatus::Failed {
            reason: "card declined".to_string(),
        };
        Ok(())
    }

    /// Make subsequent refund calls fail, for exercising the no-partial-state
    /// guarantee on the refund path
    pub async fn set_refunds_fail(&self, fail: bool) {
        *self.refunds_fail.write().await = fail;
    }

    /// Refunds issued so far
    pub async fn refunds(&self) -> Vec<RefundRecord> {
        self.refunds.read().await.clone()
    }
}

#[async_trait]
impl PaymentGateway for InMemoryGateway {
    async fn open_intent(&self, request: OpenIntentRequest) -> MarketplaceResult<PaymentIntent> {
        if request.amount_minor <= 0 {
            return Err(MarketplaceError::gateway(
                "amount must be greater than 0".to_string(),
            ));
        }

        let intent_id = format!("pi_{}", Uuid::new_v4().simple());
        let client_secret = format!("{intent_id}_secret_{}", Uuid::new_v4().simple());

        self.intents.write().await.insert(
            intent_id.clone(),
            SimulatedIntent {
                status: IntentStatus::Pending,
            },
        );

        Ok(PaymentIntent {
            intent_id,
            client_secret,
        })
    }

    async fn intent_status(&self, intent_id: &str) -> MarketplaceResult<IntentStatus> {
        let intents = self.intents.read().await;
        intents
            .get(intent_id)
            .map(|intent| intent.status.clone())
            .ok_or_else(|| MarketplaceError::gateway(format!("unknown intent {intent_id}")))
    }

    async fn refund_charge(&self, charge_id: &str, reason: &str) -> MarketplaceResult<()> {
        if *self.refunds_fail.read().await {
            return Err(MarketplaceError::gateway(
                "refund rejected by gateway".to_string(),
            ));
        }

        self.refunds.write().await.push(RefundRecord {
            charge_id: charge_id.to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(amount_minor: i64) -> OpenIntentRequest {
        OpenIntentRequest {
            amount_minor,
            currency: "GBP".to_string(),
            description: "Purchase: test listing".to_string(),
            idempotency_key: Uuid::new_v4().to_string(),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn simulated_intent_settles() {
        let gateway = InMemoryGateway::new();
        let intent = gateway.open_intent(request(10000)).await.unwrap();

        assert_eq!(
            gateway.intent_status(&intent.intent_id).await.unwrap(),
            IntentStatus::Pending
        );

        gateway.settle(&intent.intent_id).await.unwrap();
        match gateway.intent_status(&intent.intent_id).await.unwrap() {
            IntentStatus::Succeeded { charge_id } => assert!(charge_id.is_some()),
            other => panic!("expected succeeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejects_non_positive_amounts() {
        let gateway = InMemoryGateway::new();
        assert!(gateway.open_intent(request(0)).await.is_err());
    }

    #[tokio::test]
    async fn refund_failure_records_nothing() {
        let gateway = InMemoryGateway::new();
        gateway.set_refunds_fail(true).await;

        let result = gateway.refund_charge("ch_123", "changed my mind").await;
        assert!(result.is_err());
        assert!(gateway.refunds().await.is_empty());
    }

    #[test]
    fn maps_gateway_status_strings() {
        let succeeded = IntentResource {
            id: "pi_1".to_string(),
            status: "succeeded".to_string(),
            client_secret: None,
            latest_charge: Some("ch_1".to_string()),
        };
        assert_eq!(
            HttpPaymentGateway::map_status(&succeeded),
            IntentStatus::Succeeded {
                charge_id: Some("ch_1".to_string())
            }
        );

        let processing = IntentResource {
            id: "pi_2".to_string(),
            status: "processing".to_string(),
            client_secret: None,
            latest_charge: None,
        };
        assert_eq!(
            HttpPaymentGateway::map_status(&processing),
            IntentStatus::Pending
        );

        let cancelled = IntentResource {
            id: "pi_3".to_string(),
            status: "canceled".to_string(),
            client_secret: None,
            latest_charge: None,
        };
        assert!(matches!(
            HttpPaymentGateway::map_status(&cancelled),
            IntentStatus::Failed { .. }
        ));
    }
}
