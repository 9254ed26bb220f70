//! Account service
//!
//! Owns user accounts and every write to a balance. A balance change is
//! always committed together with its journal entry, so
//! `points = starting_points + Σ completed amounts` holds after every commit.

use crate::journal::Journal;
use crate::metrics::LedgerMetrics;
use crate::retry::RetryStrategy;
use crate::settings::SettingsService;
use crate::store::{Batch, Collection, Gateway};
use crate::types::{
    Account, Identity, JournalEntry, Posting, Transaction, TransactionKind, TransactionStatus,
    UserId,
};
use crate::{Error, Result};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Namespace for purchase transaction IDs derived from payment references
const PURCHASE_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a8e_43b1_4c0d_9a57_e1d2_b3c4_a5f6);

/// Account after adding `delta`, or `InsufficientBalance` if it would go negative
pub(crate) fn with_delta(account: &Account, delta: i64) -> Result<Account> {
    let points = account
        .points
        .checked_add(delta)
        .ok_or_else(|| Error::InvalidArgument(format!("Points overflow for {}", account.id)))?;
    if points < 0 {
        return Err(Error::InsufficientBalance {
            required: -delta,
            available: account.points,
        });
    }

    let mut updated = account.clone();
    updated.points = points;
    if delta < 0 {
        updated.total_points_spent += -delta;
    }
    Ok(updated)
}

/// Transaction ID for a purchase, stable per user and payment reference
pub fn purchase_transaction_id(user_id: &UserId, payment_reference: &str) -> Uuid {
    let name = format!("purchase:{}:{}", user_id, payment_reference);
    Uuid::new_v5(&PURCHASE_NAMESPACE, name.as_bytes())
}

/// Account service
#[derive(Debug, Clone)]
pub struct AccountService {
    gateway: Gateway,
    settings: SettingsService,
    journal: Journal,
    retry: RetryStrategy,
    metrics: LedgerMetrics,
}

impl AccountService {
    /// Create service
    pub fn new(
        gateway: Gateway,
        settings: SettingsService,
        journal: Journal,
        retry: RetryStrategy,
        metrics: LedgerMetrics,
    ) -> Self {
        Self {
            gateway,
            settings,
            journal,
            retry,
            metrics,
        }
    }

    /// Create the account on first sign-in, otherwise refresh `last_login_at`
    ///
    /// Points are never reset. Concurrent first sign-ins race on an
    /// `Absent` precondition; the loser retries and takes the update path.
    pub async fn bootstrap(&self, identity: &Identity) -> Result<Account> {
        if identity.id.as_str().trim().is_empty() {
            return Err(Error::InvalidArgument("Empty user id".to_string()));
        }

        self.retry
            .execute("bootstrap", move |_| async move {
                let now = Utc::now();
                let mut batch = Batch::new();

                match self.load(&identity.id).await? {
                    Some((mut account, version)) => {
                        account.last_login_at = now;
                        batch.update(Collection::Users, identity.id.as_str(), &account, version)?;
                        self.metrics.observe_commit(self.gateway.commit(batch).await)?;
                        debug!(user_id = %account.id, "Account signed in");
                        Ok(account)
                    }
                    None => {
                        let settings = self.settings.current().await?;
                        let account =
                            Account::open(identity, settings.default_starting_points, now);
                        batch.create(Collection::Users, identity.id.as_str(), &account)?;
                        self.metrics.observe_commit(self.gateway.commit(batch).await)?;
                        info!(
                            user_id = %account.id,
                            login_method = ?account.login_method,
                            starting_points = account.starting_points,
                            "Account created"
                        );
                        Ok(account)
                    }
                }
            })
            .await
    }

    /// Account with its stored version
    pub(crate) async fn load(&self, user_id: &UserId) -> Result<Option<(Account, u64)>> {
        self.gateway
            .load::<Account>(Collection::Users, user_id.as_str())
            .await
    }

    pub(crate) async fn load_existing(&self, user_id: &UserId) -> Result<(Account, u64)> {
        self.load(user_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Account {}", user_id)))
    }

    /// Get account
    pub async fn get_account(&self, user_id: &UserId) -> Result<Account> {
        Ok(self.load_existing(user_id).await?.0)
    }

    /// Current balance
    pub async fn get_balance(&self, user_id: &UserId) -> Result<i64> {
        Ok(self.get_account(user_id).await?.points)
    }

    /// All accounts in key order
    pub async fn list_accounts(&self) -> Result<Vec<Account>> {
        self.gateway
            .query(
                Collection::Users,
                |_: &Account| true,
                |a, b| a.id.cmp(&b.id),
                None,
            )
            .await
    }

    /// Accounts that voted, most votes first
    pub async fn top_voters(&self, limit: usize) -> Result<Vec<Account>> {
        self.gateway
            .query(
                Collection::Users,
                |account: &Account| account.total_votes_cast > 0,
                |a, b| {
                    b.total_votes_cast
                        .cmp(&a.total_votes_cast)
                        .then_with(|| b.total_points_spent.cmp(&a.total_points_spent))
                        .then_with(|| a.id.cmp(&b.id))
                },
                Some(limit),
            )
            .await
    }

    /// Stage a replacement of an account read at `version`
    pub(crate) fn stage(&self, batch: &mut Batch, account: &Account, version: u64) -> Result<()> {
        batch.update(Collection::Users, account.id.as_str(), account, version)
    }

    /// Atomically add `delta` to a balance and journal it
    ///
    /// The journal entry's ID doubles as an idempotency key: a retry that
    /// finds it already committed returns the committed posting. Metrics
    /// count the posting only if this call's own commit applied it, so a
    /// concurrent duplicate of a purchase is not credited twice.
    pub(crate) async fn apply_points_delta(
        &self,
        user_id: &UserId,
        delta: i64,
        entry: JournalEntry,
    ) -> Result<Posting> {
        let entry = &entry;
        // Set once a commit failed without telling whether it applied
        let unacknowledged = AtomicBool::new(false);
        let unacknowledged = &unacknowledged;

        let (posting, applied_here) = self
            .retry
            .execute("apply_points_delta", move |attempt| async move {
                if attempt > 0 {
                    if let Some(posting) = self.already_applied(user_id, entry.transaction_id).await? {
                        return Ok((posting, unacknowledged.load(Ordering::SeqCst)));
                    }
                }

                let (account, version) = self.load_existing(user_id).await?;
                let updated = with_delta(&account, delta)?;

                let mut batch = Batch::new();
                self.stage(&mut batch, &updated, version)?;
                let transaction = self.journal.stage(
                    &mut batch,
                    user_id,
                    entry.clone(),
                    delta,
                    TransactionStatus::Completed,
                    Utc::now(),
                )?;
                match self.metrics.observe_commit(self.gateway.commit(batch).await) {
                    Ok(()) => {}
                    Err(e @ Error::StoreUnavailable(_)) => {
                        unacknowledged.store(true, Ordering::SeqCst);
                        return Err(e);
                    }
                    Err(e) => return Err(e),
                }

                let posting = Posting {
                    account: updated,
                    transaction,
                };
                Ok((posting, true))
            })
            .await?;

        if applied_here {
            self.metrics.record_points_credited(delta);
            info!(
                user_id = %user_id,
                kind = %posting.transaction.kind,
                delta,
                balance = posting.account.points,
                "Balance changed"
            );
        } else {
            debug!(
                user_id = %user_id,
                transaction_id = %posting.transaction.transaction_id,
                "Posting committed by another caller"
            );
        }
        Ok(posting)
    }

    async fn already_applied(&self, user_id: &UserId, transaction_id: Uuid) -> Result<Option<Posting>> {
        match self.journal.find(transaction_id).await? {
            Some(transaction) if &transaction.user_id == user_id => {
                let account = self.get_account(user_id).await?;
                debug!(user_id = %user_id, %transaction_id, "Transaction already committed");
                Ok(Some(Posting {
                    account,
                    transaction,
                }))
            }
            Some(_) => Err(Error::InvalidArgument(format!(
                "Transaction {} belongs to another account",
                transaction_id
            ))),
            None => Ok(None),
        }
    }

    /// Enable or disable an account
    pub async fn set_active(&self, user_id: &UserId, active: bool) -> Result<Account> {
        let account = self
            .retry
            .execute("set_account_active", move |_| async move {
                let (mut account, version) = self.load_existing(user_id).await?;
                if account.active == active {
                    return Ok(account);
                }
                account.active = active;

                let mut batch = Batch::new();
                self.stage(&mut batch, &account, version)?;
                self.metrics.observe_commit(self.gateway.commit(batch).await)?;
                Ok(account)
            })
            .await?;

        info!(user_id = %user_id, active, "Account activation changed");
        Ok(account)
    }

    /// Operator grant of `amount > 0` points
    pub async fn grant_points(&self, user_id: &UserId, amount: i64, operator: &str) -> Result<Posting> {
        if amount <= 0 {
            return Err(Error::InvalidArgument(format!(
                "Grant amount must be positive, got {}",
                amount
            )));
        }
        let entry = JournalEntry::new(TransactionKind::AdminGrant).with("operator", operator);
        self.apply_points_delta(user_id, amount, entry).await
    }

    /// Operator correction of either sign; cannot drive a balance negative
    pub async fn adjust_points(
        &self,
        user_id: &UserId,
        delta: i64,
        reason: &str,
        operator: &str,
    ) -> Result<Posting> {
        if delta == 0 {
            return Err(Error::InvalidArgument("Adjustment of zero points".to_string()));
        }
        let entry = JournalEntry::new(TransactionKind::AdminAdjustment)
            .with("operator", operator)
            .with("reason", reason);
        self.apply_points_delta(user_id, delta, entry).await
    }

    /// Credit points bought through the payment collaborator
    ///
    /// Crediting the same `payment_reference` twice returns the first posting.
    pub async fn credit_purchase(
        &self,
        user_id: &UserId,
        points: i64,
        payment_reference: &str,
    ) -> Result<Posting> {
        if points <= 0 {
            return Err(Error::InvalidArgument(format!(
                "Purchased points must be positive, got {}",
                points
            )));
        }
        if payment_reference.trim().is_empty() {
            return Err(Error::InvalidArgument("Empty payment reference".to_string()));
        }

        let transaction_id = purchase_transaction_id(user_id, payment_reference);
        if let Some(posting) = self.already_applied(user_id, transaction_id).await? {
            warn!(
                user_id = %user_id,
                payment_reference,
                "Purchase already credited"
            );
            return Ok(posting);
        }

        let entry = JournalEntry::new(TransactionKind::Purchase)
            .with_id(transaction_id)
            .with("payment_reference", payment_reference);
        self.apply_points_delta(user_id, points, entry).await
    }

    /// Journal a purchase the payment collaborator reported as failed
    pub async fn record_failed_purchase(
        &self,
        user_id: &UserId,
        points: i64,
        payment_reference: &str,
        reason: &str,
    ) -> Result<Transaction> {
        self.load_existing(user_id).await?;
        let entry = JournalEntry::new(TransactionKind::Purchase)
            .with("payment_reference", payment_reference)
            .with("reason", reason);
        let transaction = self
            .journal
            .record_entry(user_id, entry, points, TransactionStatus::Failed)
            .await?;
        warn!(user_id = %user_id, payment_reference, reason, "Purchase failed");
        Ok(transaction)
    }

    /// Compare the stored balance with its journal
    pub async fn verify_conservation(&self, user_id: &UserId) -> Result<bool> {
        let account = self.get_account(user_id).await?;
        let net = self.journal.net_amount_for_user(user_id).await?;
        let expected = account.starting_points + net;
        if account.points != expected {
            warn!(
                user_id = %user_id,
                points = account.points,
                expected,
                "Balance does not match journal"
            );
        }
        Ok(account.points == expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerDefaults;
    use crate::store::memory::MemoryStore;
    use std::sync::Arc;
    use tokio::time::Duration;

    fn service() -> AccountService {
        let gateway = Gateway::new(Arc::new(MemoryStore::default()), Duration::from_secs(1));
        let retry = RetryStrategy::with_defaults();
        let settings =
            SettingsService::new(gateway.clone(), LedgerDefaults::default(), retry.clone());
        AccountService::new(
            gateway.clone(),
            settings,
            Journal::new(gateway),
            retry,
            LedgerMetrics::new().unwrap(),
        )
    }

    #[test]
    fn test_with_delta_floor() {
        let account = Account::open(&Identity::oauth("u1", "U"), 5, Utc::now());
        let result = with_delta(&account, -10);
        assert!(matches!(
            result,
            Err(Error::InsufficientBalance {
                required: 10,
                available: 5
            })
        ));

        let debited = with_delta(&account, -5).unwrap();
        assert_eq!(debited.points, 0);
        assert_eq!(debited.total_points_spent, 5);

        let credited = with_delta(&account, 7).unwrap();
        assert_eq!(credited.points, 12);
        assert_eq!(credited.total_points_spent, 0);
    }

    #[tokio::test]
    async fn test_bootstrap_is_idempotent() {
        let accounts = service();
        let identity = Identity::wallet("0x1234567890abcdef");

        let first = accounts.bootstrap(&identity).await.unwrap();
        assert_eq!(first.points, 1000);

        accounts
            .grant_points(&identity.id, 50, "ops")
            .await
            .unwrap();
        let second = accounts.bootstrap(&identity).await.unwrap();

        assert_eq!(second.points, 1050);
        assert_eq!(second.joined_at, first.joined_at);
        assert!(second.last_login_at >= first.last_login_at);
        assert_eq!(accounts.list_accounts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_account() {
        let accounts = service();
        let result = accounts.get_balance(&UserId::new("ghost")).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_adjust_cannot_go_negative() {
        let accounts = service();
        let identity = Identity::oauth("u1", "Alice");
        accounts.bootstrap(&identity).await.unwrap();

        let result = accounts
            .adjust_points(&identity.id, -1001, "chargeback", "ops")
            .await;
        assert!(matches!(result, Err(Error::InsufficientBalance { .. })));
        assert_eq!(accounts.get_balance(&identity.id).await.unwrap(), 1000);

        let posting = accounts
            .adjust_points(&identity.id, -1000, "chargeback", "ops")
            .await
            .unwrap();
        assert_eq!(posting.account.points, 0);
        assert_eq!(posting.transaction.kind, TransactionKind::AdminAdjustment);
        assert!(accounts.verify_conservation(&identity.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_purchase_credited_once() {
        let accounts = service();
        let identity = Identity::oauth("u1", "Alice");
        accounts.bootstrap(&identity).await.unwrap();

        let first = accounts
            .credit_purchase(&identity.id, 500, "pay_123")
            .await
            .unwrap();
        let second = accounts
            .credit_purchase(&identity.id, 500, "pay_123")
            .await
            .unwrap();

        assert_eq!(first.transaction.transaction_id, second.transaction.transaction_id);
        assert_eq!(accounts.get_balance(&identity.id).await.unwrap(), 1500);
        assert!(accounts.verify_conservation(&identity.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_purchase_has_no_balance_effect() {
        let accounts = service();
        let identity = Identity::oauth("u1", "Alice");
        accounts.bootstrap(&identity).await.unwrap();

        let tx = accounts
            .record_failed_purchase(&identity.id, 500, "pay_9", "card declined")
            .await
            .unwrap();

        assert_eq!(tx.status, TransactionStatus::Failed);
        assert_eq!(accounts.get_balance(&identity.id).await.unwrap(), 1000);
        assert!(accounts.verify_conservation(&identity.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_grant_rejects_non_positive() {
        let accounts = service();
        let identity = Identity::oauth("u1", "Alice");
        accounts.bootstrap(&identity).await.unwrap();

        let result = accounts.grant_points(&identity.id, 0, "ops").await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }
}
