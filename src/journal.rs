//! Transaction Journal - append-only ledger of money movements
//!
//! Entries are never deleted or edited in place; corrections are made by
//! appending an offsetting entry. The only status mutations allowed are the
//! Pending -> Completed/Failed/Cancelled finalizations, and the claim to
//! `Completed` is an atomic check-and-set so duplicate gateway confirmations
//! cannot apply side effects twice.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::MarketplaceResult;
use crate::error::MarketplaceError;
use crate::models::{Transaction, TransactionStatus};

/// Outcome of attempting to claim a pending entry as completed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller performed the Pending -> Completed transition
    Claimed,
    /// Another caller already completed the entry; side effects already ran
    AlreadyCompleted,
    /// Entry was finalized as failed or cancelled; nothing to confirm
    NotClaimable(TransactionStatus),
}

/// Append-only journal with an index by gateway intent id
#[derive(Default)]
pub struct TransactionJournal {
    entries: Arc<RwLock<HashMap<Uuid, Transaction>>>,
    by_intent: Arc<RwLock<HashMap<String, Uuid>>>,
}

impl TransactionJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a new entry. Duplicate ids or intent references are rejected;
    /// the journal is the system of record for "one entry per intent".
    pub async fn append(&self, transaction: Transaction) -> MarketplaceResult<Transaction> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&transaction.id) {
            return Err(MarketplaceError::inconsistency(format!(
                "journal entry {} already exists",
                transaction.id
            )));
        }

        if let Some(ref intent_id) = transaction.gateway_intent_id {
            let mut by_intent = self.by_intent.write().await;
            if by_intent.contains_key(intent_id) {
                return Err(MarketplaceError::inconsistency(format!(
                    "intent {intent_id} is already journaled"
                )));
            }
            by_intent.insert(intent_id.clone(), transaction.id);
        }

        entries.insert(transaction.id, transaction.clone());
        info!(transaction_id = %transaction.id, kind = ?transaction.kind, "journaled");

        Ok(transaction)
    }

    pub async fn find(&self, id: Uuid) -> Option<Transaction> {
        self.entries.read().await.get(&id).cloned()
    }

    /// Indexed lookup by the gateway's payment intent id
    pub async fn find_by_intent_id(&self, intent_id: &str) -> Option<Transaction> {
        let id = *self.by_intent.read().await.get(intent_id)?;
        self.entries.read().await.get(&id).cloned()
    }

    /// Atomically claim a pending entry as completed, recording the gateway
    /// charge reference. Only the first caller gets `Claimed`; concurrent
    /// duplicate confirmations observe `AlreadyCompleted`.
    pub async fn complete_if_pending(
        &self,
        id: Uuid,
        charge_id: Option<String>,
    ) -> MarketplaceResult<ClaimOutcome> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&id)
            .ok_or_else(|| MarketplaceError::not_found(format!("journal entry {id}")))?;

        match entry.status {
            TransactionStatus::Pending => {
                entry.status = TransactionStatus::Completed;
                entry.completed_at = Some(Utc::now());
                entry.gateway_charge_id = charge_id;
                Ok(ClaimOutcome::Claimed)
            }
            TransactionStatus::Completed => Ok(ClaimOutcome::AlreadyCompleted),
            status => Ok(ClaimOutcome::NotClaimable(status)),
        }
    }

    /// Finalize a pending entry as failed. Returns false when the entry has
    /// already left `Pending`; completed entries are immutable.
    pub async fn mark_failed(&self, id: Uuid, reason: &str) -> MarketplaceResult<bool> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&id)
            .ok_or_else(|| MarketplaceError::not_found(format!("journal entry {id}")))?;

        if entry.status != TransactionStatus::Pending {
            return Ok(false);
        }

        entry.status = TransactionStatus::Failed;
        entry.failure_reason = Some(reason.to_string());
        Ok(true)
    }

    /// Finalize a pending entry as cancelled (checkout abandoned)
    pub async fn mark_cancelled(&self, id: Uuid) -> MarketplaceResult<bool> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&id)
            .ok_or_else(|| MarketplaceError::not_found(format!("journal entry {id}")))?;

        if entry.status != TransactionStatus::Pending {
            return Ok(false);
        }

        entry.status = TransactionStatus::Cancelled;
        Ok(true)
    }

    /// All entries where the user's money moved, newest first
    pub async fn list_for_user(&self, user_id: Uuid) -> Vec<Transaction> {
        let entries = self.entries.read().await;
        let mut result: Vec<Transaction> = entries
            .values()
            .filter(|entry| entry.user_id == user_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        result
    }
}
