//! Listing Registry - contract with the marketplace listing collaborator
//!
//! Listings are owned elsewhere (CRUD, search and photos are not this
//! crate's concern); the order lifecycle only reads a snapshot at checkout
//! and flips the status as a side effect of confirmation and refund.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::MarketplaceResult;
use crate::error::MarketplaceError;

/// Listing availability state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListingStatus {
    Active,
    Sold,
    Expired,
    Removed,
}

/// Read view of a listing at checkout time
#[derive(Debug, Clone)]
pub struct ListingSnapshot {
    pub id: Uuid,
    pub seller_id: Uuid,
    pub title: String,
    pub price: Decimal,
    pub currency: String,
    pub status: ListingStatus,
}

/// Port to the listing subsystem
#[async_trait]
pub trait ListingRegistry: Send + Sync {
    async fn listing(&self, id: Uuid) -> MarketplaceResult<Option<ListingSnapshot>>;

    /// Flip the listing to sold, recording the buyer and sale time
    async fn mark_sold(
        &self,
        id: Uuid,
        buyer_id: Uuid,
        sold_at: DateTime<Utc>,
    ) -> MarketplaceResult<()>;

    /// Put the listing back on the market after a refund; buyer and sale
    /// time are cleared
    async fn reactivate(&self, id: Uuid) -> MarketplaceResult<()>;
}

/// Full listing record kept by the in-memory registry
#[derive(Debug, Clone)]
pub struct ListingRecord {
    pub id: Uuid,
    pub seller_id: Uuid,
    pub title: String,
    pub price: Decimal,
    pub currency: String,
    pub status: ListingStatus,
    pub buyer_id: Option<Uuid>,
    pub sold_at: Option<DateTime<Utc>>,
}

impl ListingRecord {
    pub fn active(seller_id: Uuid, title: &str, price: Decimal, currency: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            seller_id,
            title: title.to_string(),
            price,
            currency: currency.to_string(),
            status: ListingStatus::Active,
            buyer_id: None,
            sold_at: None,
        }
    }
}

/// In-memory listing registry for development and tests
#[derive(Default)]
pub struct InMemoryListingRegistry {
    listings: Arc<RwLock<HashMap<Uuid, ListingRecord>>>,
}

impl InMemoryListingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: ListingRecord) -> Uuid {
        let id = record.id;
        self.listings.write().await.insert(id, record);
        id
    }

    pub async fn record(&self, id: Uuid) -> Option<ListingRecord> {
        self.listings.read().await.get(&id).cloned()
    }
}

#[async_trait]
impl ListingRegistry for InMemoryListingRegistry {
    async fn listing(&self, id: Uuid) -> MarketplaceResult<Option<ListingSnapshot>> {
        let listings = self.listings.read().await;
        Ok(listings.get(&id).map(|record| ListingSnapshot {
            id: record.id,
            seller_id: record.seller_id,
            title: record.title.clone(),
            price: record.price,
            currency: record.currency.clone(),
            status: record.status,
        }))
    }

    async fn mark_sold(
        &self,
        id: Uuid,
        buyer_id: Uuid,
        sold_at: DateTime<Utc>,
    ) -> MarketplaceResult<()> {
        let mut listings = self.listings.write().await;
        let record = listings
            .get_mut(&id)
            .ok_or_else(|| MarketplaceError::not_found(format!("listing {id}")))?;

        record.status = ListingStatus::Sold;
        record.buyer_id = Some(buyer_id);
        record.sold_at = Some(sold_at);
        Ok(())
    }

    async fn reactivate(&self, id: Uuid) -> MarketplaceResult<()> {
        let mut listings = self.listings.write().await;
        let record = listings
            .get_mut(&id)
            .ok_or_else(|| MarketplaceError::not_found(format!("listing {id}")))?;

        record.status = ListingStatus::Active;
        record.buyer_id = None;
        record.sold_at = None;
        Ok(())
    }
}
