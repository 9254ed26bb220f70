//! Transaction journal
//!
//! Append-only audit trail of balance-affecting events. Entries that move a
//! balance are staged into the same batch as the account write (see
//! [`crate::accounts::AccountService`]); the plain `record*` calls only
//! append and never touch an account.

use crate::store::{Batch, Collection, Gateway};
use crate::types::{JournalEntry, Transaction, TransactionKind, TransactionStatus, UserId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Journal service
#[derive(Debug, Clone)]
pub struct Journal {
    gateway: Gateway,
}

impl Journal {
    /// Create journal
    pub fn new(gateway: Gateway) -> Self {
        Self { gateway }
    }

    /// Append a transaction to `batch`
    pub(crate) fn stage(
        &self,
        batch: &mut Batch,
        user_id: &UserId,
        entry: JournalEntry,
        amount: i64,
        status: TransactionStatus,
        occurred_at: DateTime<Utc>,
    ) -> Result<Transaction> {
        let transaction = Transaction {
            transaction_id: entry.transaction_id,
            user_id: user_id.clone(),
            kind: entry.kind,
            amount,
            metadata: entry.metadata,
            occurred_at,
            status,
        };
        batch.create(
            Collection::Transactions,
            &transaction.transaction_id.to_string(),
            &transaction,
        )?;
        Ok(transaction)
    }

    /// Record a completed transaction
    pub async fn record(
        &self,
        user_id: &UserId,
        kind: TransactionKind,
        amount: i64,
        metadata: BTreeMap<String, String>,
    ) -> Result<Transaction> {
        self.record_with_status(user_id, kind, amount, metadata, TransactionStatus::Completed)
            .await
    }

    /// Record a transaction with an explicit status
    pub async fn record_with_status(
        &self,
        user_id: &UserId,
        kind: TransactionKind,
        amount: i64,
        metadata: BTreeMap<String, String>,
        status: TransactionStatus,
    ) -> Result<Transaction> {
        let mut entry = JournalEntry::new(kind);
        entry.metadata = metadata;
        self.record_entry(user_id, entry, amount, status).await
    }

    pub(crate) async fn record_entry(
        &self,
        user_id: &UserId,
        entry: JournalEntry,
        amount: i64,
        status: TransactionStatus,
    ) -> Result<Transaction> {
        let mut batch = Batch::new();
        let transaction = self.stage(&mut batch, user_id, entry, amount, status, Utc::now())?;
        self.gateway.commit(batch).await?;

        tracing::debug!(
            user_id = %user_id,
            transaction_id = %transaction.transaction_id,
            kind = %transaction.kind,
            amount,
            "Transaction recorded"
        );
        Ok(transaction)
    }

    /// Get transaction by ID
    pub async fn get(&self, transaction_id: Uuid) -> Result<Transaction> {
        self.find(transaction_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Transaction {}", transaction_id)))
    }

    pub(crate) async fn find(&self, transaction_id: Uuid) -> Result<Option<Transaction>> {
        Ok(self
            .gateway
            .load::<Transaction>(Collection::Transactions, &transaction_id.to_string())
            .await?
            .map(|(transaction, _)| transaction))
    }

    /// Newest transactions of one user
    pub async fn list_for_user(&self, user_id: &UserId, limit: usize) -> Result<Vec<Transaction>> {
        self.gateway
            .query(
                Collection::Transactions,
                |tx: &Transaction| &tx.user_id == user_id,
                newest_first,
                Some(limit),
            )
            .await
    }

    /// Newest transactions across all users
    pub async fn list_recent(&self, limit: usize) -> Result<Vec<Transaction>> {
        self.gateway
            .query(
                Collection::Transactions,
                |_: &Transaction| true,
                newest_first,
                Some(limit),
            )
            .await
    }

    /// Every transaction of one user, oldest first
    pub async fn history(&self, user_id: &UserId) -> Result<Vec<Transaction>> {
        self.gateway
            .query(
                Collection::Transactions,
                |tx: &Transaction| &tx.user_id == user_id,
                |a, b| newest_first(b, a),
                None,
            )
            .await
    }

    /// Sum of completed amounts for a user
    pub async fn net_amount_for_user(&self, user_id: &UserId) -> Result<i64> {
        let transactions: Vec<Transaction> = self
            .gateway
            .query(
                Collection::Transactions,
                |tx: &Transaction| &tx.user_id == user_id && tx.is_completed(),
                |_, _| Ordering::Equal,
                None,
            )
            .await?;
        Ok(transactions.iter().map(|tx| tx.amount).sum())
    }

    /// Number of completed transactions of a kind
    pub async fn count_completed(&self, kind: TransactionKind) -> Result<u64> {
        let transactions: Vec<Transaction> = self
            .gateway
            .query(
                Collection::Transactions,
                |tx: &Transaction| tx.kind == kind && tx.is_completed(),
                |_, _| Ordering::Equal,
                None,
            )
            .await?;
        Ok(transactions.len() as u64)
    }
}

fn newest_first(a: &Transaction, b: &Transaction) -> Ordering {
    b.occurred_at
        .cmp(&a.occurred_at)
        .then_with(|| b.transaction_id.cmp(&a.transaction_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use std::sync::Arc;
    use tokio::time::Duration;

    fn journal() -> Journal {
        Journal::new(Gateway::new(
            Arc::new(MemoryStore::default()),
            Duration::from_secs(1),
        ))
    }

    #[tokio::test]
    async fn test_record_and_get() {
        let journal = journal();
        let user = UserId::new("u1");
        let metadata = BTreeMap::from([("token".to_string(), "MOONSHOT".to_string())]);

        let tx = journal
            .record(&user, TransactionKind::Vote, -10, metadata.clone())
            .await
            .unwrap();

        let loaded = journal.get(tx.transaction_id).await.unwrap();
        assert_eq!(loaded, tx);
        assert_eq!(loaded.metadata, metadata);
        assert_eq!(loaded.status, TransactionStatus::Completed);
    }

    #[tokio::test]
    async fn test_missing_transaction() {
        let journal = journal();
        let result = journal.get(Uuid::now_v7()).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_for_user_newest_first() {
        let journal = journal();
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        for amount in [1, 2, 3] {
            journal
                .record(&alice, TransactionKind::AdminGrant, amount, BTreeMap::new())
                .await
                .unwrap();
        }
        journal
            .record(&bob, TransactionKind::AdminGrant, 99, BTreeMap::new())
            .await
            .unwrap();

        let listed = journal.list_for_user(&alice, 2).await.unwrap();
        let amounts: Vec<i64> = listed.iter().map(|tx| tx.amount).collect();
        assert_eq!(amounts, vec![3, 2]);

        let recent = journal.list_recent(10).await.unwrap();
        assert_eq!(recent.len(), 4);
        assert_eq!(recent[0].amount, 99);
    }

    #[tokio::test]
    async fn test_net_amount_skips_failed() {
        let journal = journal();
        let user = UserId::new("u1");

        journal
            .record(&user, TransactionKind::Purchase, 500, BTreeMap::new())
            .await
            .unwrap();
        journal
            .record(&user, TransactionKind::Vote, -10, BTreeMap::new())
            .await
            .unwrap();
        journal
            .record_with_status(
                &user,
                TransactionKind::Purchase,
                1000,
                BTreeMap::new(),
                TransactionStatus::Failed,
            )
            .await
            .unwrap();

        assert_eq!(journal.net_amount_for_user(&user).await.unwrap(), 490);
        assert_eq!(
            journal.count_completed(TransactionKind::Purchase).await.unwrap(),
            1
        );
    }
}
