//! Voting engine
//!
//! A vote is one atomic commit of five operations:
//!
//! 1. account update at its read version (debit, counters)
//! 2. vote record create (must be absent)
//! 3. journal entry create (must be absent)
//! 4. token update at its read version (`total_votes += 1`)
//! 5. settings row check (cost, switch and epoch unchanged)
//!
//! A stale precondition aborts the whole commit and the attempt is retried
//! from fresh reads. The vote ID is minted once per call, so a retry after
//! an ambiguous commit failure finds the committed vote instead of voting
//! twice.

use crate::accounts::{with_delta, AccountService};
use crate::journal::Journal;
use crate::metrics::LedgerMetrics;
use crate::registry::TokenRegistry;
use crate::retry::RetryStrategy;
use crate::settings::SettingsService;
use crate::store::{Batch, Collection, Gateway, ScanDirection};
use crate::types::{
    JournalEntry, TokenName, TransactionKind, TransactionStatus, UserId, VoteRecord,
};
use crate::{Error, Result};
use chrono::{DateTime, SubsecRound, Utc};
use std::cmp::Ordering;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::{NoContext, Timestamp, Uuid};

/// Vote ID and cast time minted together, so key order matches `cast_at`
///
/// `cast_at` is truncated to the millisecond carried in the UUIDv7 prefix.
fn mint_vote_id() -> (Uuid, DateTime<Utc>) {
    let cast_at = Utc::now().trunc_subsecs(3);
    let timestamp = Timestamp::from_unix(
        NoContext,
        cast_at.timestamp().max(0) as u64,
        cast_at.timestamp_subsec_nanos(),
    );
    (Uuid::new_v7(timestamp), cast_at)
}

/// Voting engine
#[derive(Debug, Clone)]
pub struct VotingEngine {
    gateway: Gateway,
    settings: SettingsService,
    accounts: AccountService,
    registry: TokenRegistry,
    journal: Journal,
    retry: RetryStrategy,
    metrics: LedgerMetrics,
}

impl VotingEngine {
    /// Create engine
    pub fn new(
        gateway: Gateway,
        settings: SettingsService,
        accounts: AccountService,
        registry: TokenRegistry,
        journal: Journal,
        retry: RetryStrategy,
        metrics: LedgerMetrics,
    ) -> Self {
        Self {
            gateway,
            settings,
            accounts,
            registry,
            journal,
            retry,
            metrics,
        }
    }

    /// Spend `vote_cost` points on one vote for `token_name`
    ///
    /// `requested_cost` is the cost the caller displayed; if given it must
    /// match the current cost or the vote is rejected with `CostMismatch`.
    pub async fn cast_vote(
        &self,
        user_id: &UserId,
        token_name: &str,
        requested_cost: Option<i64>,
    ) -> Result<VoteRecord> {
        let started = Instant::now();
        let (vote_id, cast_at) = mint_vote_id();

        let result = self
            .retry
            .execute("cast_vote", move |attempt| {
                self.attempt_vote(vote_id, cast_at, user_id, token_name, requested_cost, attempt)
            })
            .await;

        match &result {
            Ok(vote) => {
                self.metrics
                    .record_vote_committed(started.elapsed().as_secs_f64());
                info!(
                    %vote_id,
                    user_id = %user_id,
                    token = %vote.token_name,
                    cost = vote.points_cost,
                    epoch = vote.epoch,
                    "Vote committed"
                );
            }
            Err(e) => {
                self.metrics.record_vote_failed(e);
                if e.is_rejection() {
                    debug!(user_id = %user_id, token = token_name, reason = e.reason(), "Vote rejected");
                } else {
                    warn!(user_id = %user_id, token = token_name, error = %e, "Vote failed");
                }
            }
        }
        result
    }

    async fn attempt_vote(
        &self,
        vote_id: Uuid,
        cast_at: DateTime<Utc>,
        user_id: &UserId,
        token_name: &str,
        requested_cost: Option<i64>,
        attempt: u32,
    ) -> Result<VoteRecord> {
        if attempt > 0 {
            if let Some(vote) = self.find_vote(vote_id).await? {
                debug!(%vote_id, "Vote already committed by an earlier attempt");
                return Ok(vote);
            }
        }

        let snapshot = self.settings.snapshot().await?;
        let settings = &snapshot.settings;
        if !settings.voting_enabled {
            return Err(Error::VotingDisabled);
        }

        let name = TokenName::parse(token_name)
            .ok_or_else(|| Error::UnknownToken(token_name.to_string()))?;
        let (token, token_version) = self
            .registry
            .load(&name)
            .await?
            .ok_or_else(|| Error::UnknownToken(name.to_string()))?;
        if !token.active {
            return Err(Error::TokenInactive(name.to_string()));
        }

        let cost = settings.vote_cost;
        if let Some(requested) = requested_cost {
            if requested != cost {
                return Err(Error::CostMismatch {
                    requested,
                    current: cost,
                });
            }
        }

        let (account, account_version) = self.accounts.load_existing(user_id).await?;
        if !account.active {
            return Err(Error::AccountInactive(user_id.to_string()));
        }
        let mut debited = with_delta(&account, -cost)?;
        debited.total_votes_cast += 1;

        let vote = VoteRecord {
            vote_id,
            user_id: user_id.clone(),
            token_name: name.clone(),
            points_cost: cost,
            epoch: settings.tally_epoch,
            cast_at,
        };
        let entry = JournalEntry::new(TransactionKind::Vote)
            .with("token", name.as_str())
            .with("vote_id", vote_id.to_string());

        let mut batch = Batch::new();
        self.accounts.stage(&mut batch, &debited, account_version)?;
        batch.create(Collection::Votes, &vote_id.to_string(), &vote)?;
        self.journal.stage(
            &mut batch,
            user_id,
            entry,
            -cost,
            TransactionStatus::Completed,
            cast_at,
        )?;
        self.registry
            .stage_increment(&mut batch, &token, token_version, 1)?;
        self.settings.stage_guard(&mut batch, &snapshot);

        self.metrics
            .observe_commit(self.gateway.commit(batch).await)?;
        Ok(vote)
    }

    /// Vote by ID, if committed
    pub async fn find_vote(&self, vote_id: Uuid) -> Result<Option<VoteRecord>> {
        Ok(self
            .gateway
            .load::<VoteRecord>(Collection::Votes, &vote_id.to_string())
            .await?
            .map(|(vote, _)| vote))
    }

    /// Newest votes first
    pub async fn recent_votes(&self, limit: usize) -> Result<Vec<VoteRecord>> {
        self.gateway
            .scan(Collection::Votes, ScanDirection::Reverse, Some(limit))
            .await
    }

    /// Every vote of one user, oldest first
    pub async fn votes_for_user(&self, user_id: &UserId) -> Result<Vec<VoteRecord>> {
        self.gateway
            .query(
                Collection::Votes,
                |vote: &VoteRecord| &vote.user_id == user_id,
                |a, b| a.vote_id.cmp(&b.vote_id),
                None,
            )
            .await
    }

    /// Votes cast in one tally epoch
    pub async fn votes_in_epoch(&self, epoch: u64) -> Result<Vec<VoteRecord>> {
        self.gateway
            .query(
                Collection::Votes,
                |vote: &VoteRecord| vote.epoch == epoch,
                |_, _| Ordering::Equal,
                None,
            )
            .await
    }

    /// Number of votes ever committed
    pub async fn count_votes(&self) -> Result<u64> {
        let votes: Vec<VoteRecord> = self
            .gateway
            .scan(Collection::Votes, ScanDirection::Forward, None)
            .await?;
        Ok(votes.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerDefaults;
    use crate::store::memory::MemoryStore;
    use crate::types::{Identity, TokenSpec};
    use std::sync::Arc;
    use tokio::time::Duration;

    struct Fixture {
        engine: VotingEngine,
        accounts: AccountService,
        registry: TokenRegistry,
        settings: SettingsService,
        journal: Journal,
    }

    async fn fixture() -> Fixture {
        let gateway = Gateway::new(Arc::new(MemoryStore::default()), Duration::from_secs(1));
        let retry = RetryStrategy::with_defaults();
        let metrics = LedgerMetrics::new().unwrap();
        let settings =
            SettingsService::new(gateway.clone(), LedgerDefaults::default(), retry.clone());
        settings.initialize().await.unwrap();
        let journal = Journal::new(gateway.clone());
        let accounts = AccountService::new(
            gateway.clone(),
            settings.clone(),
            journal.clone(),
            retry.clone(),
            metrics.clone(),
        );
        let registry = TokenRegistry::new(gateway.clone(), settings.clone(), retry.clone());
        let engine = VotingEngine::new(
            gateway,
            settings.clone(),
            accounts.clone(),
            registry.clone(),
            journal.clone(),
            retry,
            metrics,
        );
        Fixture {
            engine,
            accounts,
            registry,
            settings,
            journal,
        }
    }

    #[test]
    fn test_vote_id_carries_cast_time() {
        let (vote_id, cast_at) = mint_vote_id();
        let (seconds, nanos) = vote_id.get_timestamp().unwrap().to_unix();
        assert_eq!(seconds as i64, cast_at.timestamp());
        assert_eq!(nanos / 1_000_000, cast_at.timestamp_subsec_millis());
        assert_eq!(cast_at.timestamp_subsec_nanos() % 1_000_000, 0);
    }

    #[tokio::test]
    async fn test_vote_applies_everything() {
        let f = fixture().await;
        let alice = Identity::oauth("alice", "Alice");
        f.accounts.bootstrap(&alice).await.unwrap();
        f.registry
            .add_token(TokenSpec::new("MOONSHOT", "🚀", "blue"))
            .await
            .unwrap();

        let vote = f
            .engine
            .cast_vote(&alice.id, "moonshot", Some(10))
            .await
            .unwrap();
        assert_eq!(vote.points_cost, 10);
        assert_eq!(vote.epoch, 0);

        let account = f.accounts.get_account(&alice.id).await.unwrap();
        assert_eq!(account.points, 990);
        assert_eq!(account.total_votes_cast, 1);
        assert_eq!(account.total_points_spent, 10);
        assert_eq!(f.registry.get_token("MOONSHOT").await.unwrap().total_votes, 1);

        let txs = f.journal.list_for_user(&alice.id, 10).await.unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].amount, -10);
        assert_eq!(txs[0].metadata.get("vote_id"), Some(&vote.vote_id.to_string()));
        assert_eq!(f.engine.find_vote(vote.vote_id).await.unwrap(), Some(vote));
    }

    #[tokio::test]
    async fn test_rejections_leave_state_untouched() {
        let f = fixture().await;
        let alice = Identity::oauth("alice", "Alice");
        f.accounts.bootstrap(&alice).await.unwrap();
        f.registry
            .add_token(TokenSpec::new("FIRE", "🔥", "red"))
            .await
            .unwrap();
        f.registry
            .add_token(TokenSpec::new("STAR", "⭐", "orange"))
            .await
            .unwrap();
        f.registry.set_active("STAR", false).await.unwrap();

        let unknown = f.engine.cast_vote(&alice.id, "NOPE", None).await;
        assert!(matches!(unknown, Err(Error::UnknownToken(_))));

        let inactive = f.engine.cast_vote(&alice.id, "STAR", None).await;
        assert!(matches!(inactive, Err(Error::TokenInactive(_))));

        let mismatch = f.engine.cast_vote(&alice.id, "FIRE", Some(5)).await;
        assert!(matches!(
            mismatch,
            Err(Error::CostMismatch {
                requested: 5,
                current: 10
            })
        ));

        let ghost = f.engine.cast_vote(&UserId::new("ghost"), "FIRE", None).await;
        assert!(matches!(ghost, Err(Error::NotFound(_))));

        f.settings
            .modify("disable", |s| {
                s.voting_enabled = false;
                Ok(())
            })
            .await
            .unwrap();
        let disabled = f.engine.cast_vote(&alice.id, "FIRE", None).await;
        assert!(matches!(disabled, Err(Error::VotingDisabled)));

        assert_eq!(f.accounts.get_balance(&alice.id).await.unwrap(), 1000);
        assert_eq!(f.engine.count_votes().await.unwrap(), 0);
        assert!(f.journal.list_recent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_insufficient_balance() {
        let f = fixture().await;
        let bob = Identity::oauth("bob", "Bob");
        f.accounts.bootstrap(&bob).await.unwrap();
        f.accounts
            .adjust_points(&bob.id, -995, "test", "ops")
            .await
            .unwrap();
        f.registry
            .add_token(TokenSpec::new("FIRE", "🔥", "red"))
            .await
            .unwrap();

        let result = f.engine.cast_vote(&bob.id, "FIRE", None).await;
        assert!(matches!(
            result,
            Err(Error::InsufficientBalance {
                required: 10,
                available: 5
            })
        ));
        assert_eq!(f.registry.get_token("FIRE").await.unwrap().total_votes, 0);
    }

    #[tokio::test]
    async fn test_inactive_account_cannot_vote() {
        let f = fixture().await;
        let carol = Identity::oauth("carol", "Carol");
        f.accounts.bootstrap(&carol).await.unwrap();
        f.accounts.set_active(&carol.id, false).await.unwrap();
        f.registry
            .add_token(TokenSpec::new("FIRE", "🔥", "red"))
            .await
            .unwrap();

        let result = f.engine.cast_vote(&carol.id, "FIRE", None).await;
        assert!(matches!(result, Err(Error::AccountInactive(_))));
    }

    #[tokio::test]
    async fn test_recent_votes_newest_first() {
        let f = fixture().await;
        let alice = Identity::oauth("alice", "Alice");
        f.accounts.bootstrap(&alice).await.unwrap();
        f.registry.seed_defaults().await.unwrap();

        for token in ["FIRE", "STAR", "DIAMOND"] {
            f.engine.cast_vote(&alice.id, token, None).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let recent = f.engine.recent_votes(2).await.unwrap();
        let names: Vec<&str> = recent.iter().map(|v| v.token_name.as_str()).collect();
        assert_eq!(names, vec!["DIAMOND", "STAR"]);
        assert_eq!(f.engine.votes_for_user(&alice.id).await.unwrap().len(), 3);
        assert_eq!(f.engine.votes_in_epoch(0).await.unwrap().len(), 3);
    }
}
