//! Configuration for the marketplace order engine
//!
//! Every component takes an explicit config struct at construction; nothing
//! reads global state. `EngineConfig::load` layers an optional config file
//! and `MARKET_`-prefixed environment variables over the defaults.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

use crate::{MarketplaceResult, error::MarketplaceError};

/// Fee split policy for marketplace purchases
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeePolicy {
    /// Platform cut as a fraction of the order total
    pub percentage: Decimal,
    /// Decimal places of the currency's minor unit
    pub minor_unit_scale: u32,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            percentage: dec!(0.05),
            minor_unit_scale: 2,
        }
    }
}

impl FeePolicy {
    /// Reject percentages that would produce a negative or empty seller cut
    pub fn validate(&self) -> MarketplaceResult<()> {
        if self.percentage < Decimal::ZERO || self.percentage >= Decimal::ONE {
            return Err(MarketplaceError::config(format!(
                "fee percentage {} must be in [0, 1)",
                self.percentage
            )));
        }
        Ok(())
    }
}

/// Escrow holding policy
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EscrowPolicy {
    /// Days a held escrow waits before the sweep may auto-release it
    pub holding_period_days: i64,
}

impl Default for EscrowPolicy {
    fn default() -> Self {
        Self {
            holding_period_days: 14,
        }
    }
}

/// Connection settings for the hosted payment gateway
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Base URL of the gateway REST API
    pub api_base: String,
    /// Secret API key used as the bearer credential
    pub secret_key: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.stripe.com".to_string(),
            secret_key: "sk_test_dummy".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Subscription tier price list
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubscriptionPricing {
    pub currency: String,
    pub basic: Decimal,
    pub premium: Decimal,
    pub enterprise: Decimal,
}

impl Default for SubscriptionPricing {
    fn default() -> Self {
        Self {
            currency: "GBP".to_string(),
            basic: dec!(4.99),
            premium: dec!(9.99),
            enterprise: dec!(49.99),
        }
    }
}

/// Auto-release worker schedule
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Seconds between auto-release sweeps
    pub sweep_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 3600,
        }
    }
}

/// Aggregated configuration for the whole engine
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub fees: FeePolicy,
    pub escrow: EscrowPolicy,
    pub gateway: GatewayConfig,
    pub pricing: SubscriptionPricing,
    pub worker: WorkerConfig,
}

impl EngineConfig {
    /// Load configuration from `marketplace.toml` (optional) and
    /// `MARKET_`-prefixed environment variables, over the defaults
    pub fn load() -> MarketplaceResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("marketplace").required(false))
            .add_source(config::Environment::with_prefix("MARKET").separator("__"))
            .build()
            .map_err(|e| MarketplaceError::config(e.to_string()))?;

        let loaded: Self = settings
            .try_deserialize()
            .map_err(|e| MarketplaceError::config(e.to_string()))?;

        loaded.fees.validate()?;
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_marketplace_policy() {
        let config = EngineConfig::default();
        assert_eq!(config.fees.percentage, dec!(0.05));
        assert_eq!(config.escrow.holding_period_days, 14);
        assert_eq!(config.worker.sweep_interval_secs, 3600);
        assert_eq!(config.pricing.premium, dec!(9.99));
    }

    #[test]
    fn rejects_confiscatory_fee() {
        let policy = FeePolicy {
            percentage: dec!(1.5),
            ..FeePolicy::default()
        };
        assert!(policy.validate().is_err());

        let policy = FeePolicy {
            percentage: dec!(-0.01),
            ..FeePolicy::default()
        };
        assert!(policy.validate().is_err());
    }
}
