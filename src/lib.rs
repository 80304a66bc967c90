//! Escrow-mediated marketplace order engine
//!
//! This crate implements the money-moving core of a peer-to-peer device
//! marketplace: once a buyer commits to a listing, funds are captured through
//! an external payment gateway, held in an internal escrow ledger, and
//! released to the seller or refunded to the buyer based on delivery
//! confirmation, dispute, or a time-based auto-release policy.

pub mod config;
pub mod engine;
pub mod error;
pub mod escrow;
pub mod fees;
pub mod gateway;
pub mod journal;
pub mod listings;
pub mod models;
pub mod orders;
pub mod subscriptions;
pub mod worker;

use error::MarketplaceError;

/// Result type alias for marketplace operations
pub type MarketplaceResult<T> = Result<T, MarketplaceError>;
