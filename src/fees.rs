//! Fee Calculator - splits a listing price into platform fee and seller cut
//!
//! Pure arithmetic, no I/O. The platform fee is a fixed percentage of the
//! total, rounded to the currency's minor unit; the seller receives the
//! remainder, so the two parts always sum back to the total.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal::prelude::ToPrimitive;

use crate::MarketplaceResult;
use crate::config::FeePolicy;
use crate::error::MarketplaceError;

/// Minor-unit scale for the two-decimal currencies the marketplace trades in
pub const DEFAULT_MINOR_UNIT_SCALE: u32 = 2;

/// Result of splitting an order total
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSplit {
    pub platform_fee: Decimal,
    pub seller_amount: Decimal,
}

/// Pure fee calculator configured with the platform's cut
#[derive(Debug, Clone)]
pub struct FeeCalculator {
    policy: FeePolicy,
}

impl FeeCalculator {
    pub fn new(policy: FeePolicy) -> Self {
        Self { policy }
    }

    /// Split a total into (platform fee, seller amount).
    /// Invariant: `platform_fee + seller_amount == total`.
    pub fn split(&self, total: Decimal) -> FeeSplit {
        let platform_fee = (total * self.policy.percentage).round_dp_with_strategy(
            self.policy.minor_unit_scale,
            RoundingStrategy::MidpointAwayFromZero,
        );

        FeeSplit {
            platform_fee,
            seller_amount: total - platform_fee,
        }
    }

    /// Minor-unit scale this calculator rounds to
    pub fn minor_unit_scale(&self) -> u32 {
        self.policy.minor_unit_scale
    }
}

/// Convert a major-unit amount to gateway minor units (e.g. pounds to pence)
pub fn to_minor_units(amount: Decimal, scale: u32) -> MarketplaceResult<i64> {
    let factor = Decimal::from(10i64.pow(scale));
    (amount * factor)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| {
            MarketplaceError::internal(format!("amount {amount} out of minor-unit range"))
        })
}
