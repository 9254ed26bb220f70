//! Live feed projector
//!
//! Read-only projections of the vote log, the token leaderboard and single
//! accounts, with subscriptions that re-deliver a fresh snapshot whenever it
//! changes.
//!
//! # Delivery
//!
//! ```text
//!   store commit ──► change stream ──┐
//!                                     ├──► watcher task ──► reload ──► on_update
//!   poll ticker (poll mode/fallback) ─┘        ▲
//!                                              │ shutdown (oneshot)
//!                                        Subscription
//! ```
//!
//! In push mode the watcher reloads on every change notification for its
//! collection (or its one key, for account subscriptions). In poll mode, for backends without a change stream, or once
//! the stream closes, it reloads every `poll_interval_ms` and delivers only
//! when the snapshot differs. A lagged stream triggers an immediate reload.

use crate::accounts::AccountService;
use crate::config::{FeedConfig, FeedMode};
use crate::engine::VotingEngine;
use crate::metrics::LedgerMetrics;
use crate::registry::TokenRegistry;
use crate::store::{ChangeStream, Collection, Gateway, StreamSignal};
use crate::types::{Account, FeedEntry, Token, UserId, VoteRecord};
use crate::Result;
use parking_lot::Mutex;
use prometheus::IntGauge;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

type Callback<S> = Box<dyn Fn(S) + Send + Sync>;

/// Feed projector
#[derive(Debug, Clone)]
pub struct FeedProjector {
    gateway: Gateway,
    engine: VotingEngine,
    registry: TokenRegistry,
    accounts: AccountService,
    config: FeedConfig,
    metrics: LedgerMetrics,
}

impl FeedProjector {
    /// Create projector
    pub fn new(
        gateway: Gateway,
        engine: VotingEngine,
        registry: TokenRegistry,
        accounts: AccountService,
        config: FeedConfig,
        metrics: LedgerMetrics,
    ) -> Self {
        Self {
            gateway,
            engine,
            registry,
            accounts,
            config,
            metrics,
        }
    }

    /// Default snapshot size
    pub fn default_limit(&self) -> usize {
        self.config.default_limit
    }

    /// Newest votes first, at most `limit`
    pub async fn recent_votes(&self, limit: usize) -> Result<Vec<FeedEntry>> {
        let votes = self.engine.recent_votes(limit).await?;
        Ok(to_entries(&votes))
    }

    /// Deliver the current feed to `on_update`, then again after every vote
    ///
    /// The first delivery happens before this returns. Dropping the
    /// subscription unsubscribes.
    pub async fn subscribe<F>(&self, limit: usize, on_update: F) -> Result<Subscription>
    where
        F: Fn(Vec<FeedEntry>) + Send + Sync + 'static,
    {
        let engine = self.engine.clone();
        let load = move || {
            let engine = engine.clone();
            async move { engine.recent_votes(limit).await.map(|votes| to_entries(&votes)) }
        };
        self.watch("votes", Collection::Votes, None, load, Box::new(on_update))
            .await
    }

    /// Deliver the active-token leaderboard on every token change
    pub async fn subscribe_leaderboard<F>(&self, on_update: F) -> Result<Subscription>
    where
        F: Fn(Vec<Token>) + Send + Sync + 'static,
    {
        let registry = self.registry.clone();
        let load = move || {
            let registry = registry.clone();
            async move { registry.list_active().await }
        };
        self.watch("leaderboard", Collection::Tokens, None, load, Box::new(on_update))
            .await
    }

    /// Deliver one account's state now and after every change to it
    ///
    /// Fails with `NotFound` if the account does not exist yet.
    pub async fn subscribe_account<F>(
        &self,
        user_id: &UserId,
        on_update: F,
    ) -> Result<Subscription>
    where
        F: Fn(Account) + Send + Sync + 'static,
    {
        let accounts = self.accounts.clone();
        let id = user_id.clone();
        let load = move || {
            let accounts = accounts.clone();
            let id = id.clone();
            async move { accounts.get_account(&id).await }
        };
        let key = Some(user_id.as_str().to_string());
        self.watch("account", Collection::Users, key, load, Box::new(on_update))
            .await
    }

    async fn watch<S, L, Fut>(
        &self,
        label: &'static str,
        collection: Collection,
        key: Option<String>,
        load: L,
        on_update: Callback<S>,
    ) -> Result<Subscription>
    where
        S: Clone + PartialEq + Send + 'static,
        L: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S>> + Send + 'static,
    {
        // Subscribe before the first load so nothing committed in between is missed
        let stream = match self.config.mode {
            FeedMode::Push => self.gateway.subscribe(collection),
            FeedMode::Poll => None,
        };

        let snapshot = load().await?;
        on_update(snapshot.clone());

        let id = Uuid::new_v4();
        let gate = Arc::new(Mutex::new(true));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let watcher = Watcher {
            id,
            label,
            key,
            stream,
            load,
            last: snapshot,
            gate: gate.clone(),
            on_update,
            poll_interval: Duration::from_millis(self.config.poll_interval_ms),
            shutdown: shutdown_rx,
        };
        debug!(
            subscription = %id,
            feed = label,
            push = watcher.stream.is_some(),
            "Feed subscription opened"
        );
        tokio::spawn(watcher.run());

        self.metrics.feed_subscribers.inc();
        Ok(Subscription {
            id,
            gate,
            shutdown: Mutex::new(Some(shutdown_tx)),
            subscribers: self.metrics.feed_subscribers.clone(),
        })
    }
}

/// Handle to a live subscription
///
/// `unsubscribe` is idempotent. Once it returns, no further delivery starts.
/// The callback must not call `unsubscribe` on its own subscription.
pub struct Subscription {
    id: Uuid,
    gate: Arc<Mutex<bool>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    subscribers: IntGauge,
}

impl Subscription {
    /// Subscription ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether updates are still delivered
    pub fn is_active(&self) -> bool {
        *self.gate.lock()
    }

    /// Stop all future deliveries
    pub fn unsubscribe(&self) {
        {
            let mut active = self.gate.lock();
            if !*active {
                return;
            }
            *active = false;
        }
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(());
        }
        self.subscribers.dec();
        debug!(subscription = %self.id, "Feed subscription closed");
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

struct Watcher<S, L> {
    id: Uuid,
    label: &'static str,
    key: Option<String>,
    stream: Option<ChangeStream>,
    load: L,
    last: S,
    gate: Arc<Mutex<bool>>,
    on_update: Callback<S>,
    poll_interval: Duration,
    shutdown: oneshot::Receiver<()>,
}

impl<S, L, Fut> Watcher<S, L>
where
    S: Clone + PartialEq + Send + 'static,
    L: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<S>> + Send + 'static,
{
    async fn run(mut self) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = &mut self.shutdown => break,

                signal = next_signal(&mut self.stream) => match signal {
                    StreamSignal::Changed(event) => {
                        if self.watches(&event.key) {
                            self.refresh().await;
                        }
                    }
                    StreamSignal::Lagged(missed) => {
                        debug!(subscription = %self.id, missed, "Change stream lagged");
                        self.refresh().await;
                    }
                    StreamSignal::Closed => {
                        warn!(
                            subscription = %self.id,
                            feed = self.label,
                            "Change stream closed, falling back to polling"
                        );
                        self.stream = None;
                    }
                },

                _ = ticker.tick(), if self.stream.is_none() => self.refresh().await,
            }
        }

        debug!(subscription = %self.id, feed = self.label, "Feed watcher stopped");
    }

    fn watches(&self, key: &str) -> bool {
        self.key.as_deref().map_or(true, |watched| watched == key)
    }

    async fn refresh(&mut self) {
        let snapshot = match (self.load)().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(subscription = %self.id, feed = self.label, error = %e, "Feed reload failed");
                return;
            }
        };
        if snapshot == self.last {
            return;
        }
        self.last = snapshot.clone();

        let active = self.gate.lock();
        if *active {
            (self.on_update)(snapshot);
        }
    }
}

fn to_entries(votes: &[VoteRecord]) -> Vec<FeedEntry> {
    votes.iter().map(FeedEntry::from).collect()
}

async fn next_signal(stream: &mut Option<ChangeStream>) -> StreamSignal {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::ledger::Ledger;
    use crate::types::{Identity, TokenSpec};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    async fn ledger(mode: FeedMode) -> Ledger {
        let mut config = Config::in_memory();
        config.feed.mode = mode;
        config.feed.poll_interval_ms = 20;
        Ledger::open(config).await.unwrap()
    }

    async fn prepare(ledger: &Ledger) -> Identity {
        let alice = Identity::oauth("alice", "Alice");
        ledger.accounts().bootstrap(&alice).await.unwrap();
        ledger
            .registry()
            .add_token(TokenSpec::new("FIRE", "🔥", "red"))
            .await
            .unwrap();
        alice
    }

    async fn check_delivery(mode: FeedMode) {
        let ledger = ledger(mode).await;
        let alice = prepare(&ledger).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = ledger
            .feed()
            .subscribe(5, move |entries| {
                let _ = tx.send(entries);
            })
            .await
            .unwrap();

        // Initial snapshot arrives before subscribe returns
        assert!(rx.try_recv().unwrap().is_empty());

        let vote = ledger
            .engine()
            .cast_vote(&alice.id, "FIRE", None)
            .await
            .unwrap();
        let update = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.len(), 1);
        assert_eq!(update[0].vote_id, vote.vote_id);

        subscription.unsubscribe();
        subscription.unsubscribe();
        assert!(!subscription.is_active());

        ledger
            .engine()
            .cast_vote(&alice.id, "FIRE", None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_push_delivery() {
        check_delivery(FeedMode::Push).await;
    }

    #[tokio::test]
    async fn test_poll_delivery() {
        check_delivery(FeedMode::Poll).await;
    }

    #[tokio::test]
    async fn test_recent_votes_bounded() {
        let ledger = ledger(FeedMode::Push).await;
        let alice = prepare(&ledger).await;
        for _ in 0..4 {
            ledger
                .engine()
                .cast_vote(&alice.id, "FIRE", None)
                .await
                .unwrap();
        }

        let entries = ledger.feed().recent_votes(3).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries.windows(2).all(|w| w[0].vote_id > w[1].vote_id));
    }

    #[tokio::test]
    async fn test_subscriber_gauge() {
        let ledger = ledger(FeedMode::Push).await;
        let subscription = ledger.feed().subscribe(5, |_| {}).await.unwrap();
        assert_eq!(ledger.metrics().feed_subscribers.get(), 1);
        drop(subscription);
        assert_eq!(ledger.metrics().feed_subscribers.get(), 0);
    }

    #[tokio::test]
    async fn test_leaderboard_updates() {
        let ledger = ledger(FeedMode::Push).await;
        let alice = prepare(&ledger).await;
        ledger
            .registry()
            .add_token(TokenSpec::new("STAR", "⭐", "orange"))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _subscription = ledger
            .feed()
            .subscribe_leaderboard(move |tokens| {
                let _ = tx.send(tokens);
            })
            .await
            .unwrap();
        let initial = rx.try_recv().unwrap();
        assert_eq!(initial[0].name.as_str(), "FIRE");

        ledger
            .engine()
            .cast_vote(&alice.id, "STAR", None)
            .await
            .unwrap();
        let update = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update[0].name.as_str(), "STAR");
        assert_eq!(update[0].total_votes, 1);
    }

    async fn check_account_delivery(mode: FeedMode) {
        let ledger = ledger(mode).await;
        let alice = prepare(&ledger).await;
        let bob = Identity::oauth("bob", "Bob");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _subscription = ledger
            .feed()
            .subscribe_account(&alice.id, move |account| {
                let _ = tx.send(account);
            })
            .await
            .unwrap();
        let initial = rx.try_recv().unwrap();
        assert_eq!(initial.points, 1000);
        assert_eq!(initial.total_votes_cast, 0);

        ledger
            .engine()
            .cast_vote(&alice.id, "FIRE", None)
            .await
            .unwrap();
        let update = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.points, 990);
        assert_eq!(update.total_votes_cast, 1);

        // Other accounts changing is not a change to this one
        ledger.accounts().bootstrap(&bob).await.unwrap();
        ledger
            .engine()
            .cast_vote(&bob.id, "FIRE", None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_account_push_delivery() {
        check_account_delivery(FeedMode::Push).await;
    }

    #[tokio::test]
    async fn test_account_poll_delivery() {
        check_account_delivery(FeedMode::Poll).await;
    }

    #[tokio::test]
    async fn test_account_subscription_requires_account() {
        let ledger = ledger(FeedMode::Push).await;
        let result = ledger
            .feed()
            .subscribe_account(&UserId::new("ghost"), |_| {})
            .await;
        assert!(matches!(result, Err(crate::Error::NotFound(_))));
        assert_eq!(ledger.metrics().feed_subscribers.get(), 0);
    }
}
