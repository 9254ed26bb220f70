//! Main ledger orchestration layer
//!
//! Opens the configured store, wires the services together and exposes the
//! consistency checks over the stored state.
//!
//! # Example
//!
//! ```no_run
//! use points_ledger::{Config, Identity, Ledger};
//!
//! #[tokio::main]
//! async fn main() -> points_ledger::Result<()> {
//!     let ledger = Ledger::open(Config::in_memory()).await?;
//!
//!     let session = ledger.sign_in(Identity::oauth("google-42", "Alice")).await?;
//!     let vote = session.cast_vote("MOONSHOT", Some(10)).await?;
//!     println!("voted {} for {}", vote.points_cost, vote.token_name);
//!
//!     Ok(())
//! }
//! ```

use crate::{
    accounts::AccountService,
    admin::AdminConsole,
    config::StoreBackend,
    engine::VotingEngine,
    feed::FeedProjector,
    journal::Journal,
    metrics::LedgerMetrics,
    registry::TokenRegistry,
    reports::Reports,
    retry::RetryStrategy,
    session::Session,
    settings::SettingsService,
    store::{memory::MemoryStore, rocks::RocksStore, Gateway, LedgerStore},
    types::{Identity, UserId},
    Config, Error, Result,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Duration;

/// A token whose stored tally disagrees with its vote records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TallyMismatch {
    /// Token name
    pub token: String,
    /// Stored `total_votes`
    pub stored: u64,
    /// Votes recorded in the current epoch
    pub counted: u64,
}

/// Main ledger interface
#[derive(Debug, Clone)]
pub struct Ledger {
    config: Config,
    gateway: Gateway,
    settings: SettingsService,
    journal: Journal,
    accounts: AccountService,
    registry: TokenRegistry,
    engine: VotingEngine,
    feed: FeedProjector,
    reports: Reports,
    metrics: LedgerMetrics,
}

impl Ledger {
    /// Open ledger with configuration
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let store: Arc<dyn LedgerStore> = match config.store.backend {
            StoreBackend::RocksDb => Arc::new(RocksStore::open(&config)?),
            StoreBackend::Memory => {
                tracing::warn!("Using in-memory store, data is lost on exit");
                Arc::new(MemoryStore::new(config.store.change_buffer))
            }
        };

        Self::with_store(config, store).await
    }

    /// Open ledger on an existing store
    pub async fn with_store(config: Config, store: Arc<dyn LedgerStore>) -> Result<Self> {
        config.validate()?;

        let backend = store.backend_name();
        let gateway = Gateway::new(store, Duration::from_millis(config.store.op_timeout_ms));
        let retry = RetryStrategy::new(config.retry.clone());
        let metrics = LedgerMetrics::new()
            .map_err(|e| Error::Other(format!("Failed to create metrics: {}", e)))?;

        let settings =
            SettingsService::new(gateway.clone(), config.ledger.clone(), retry.clone());
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
            gateway.clone(),
            settings.clone(),
            accounts.clone(),
            registry.clone(),
            journal.clone(),
            retry,
            metrics.clone(),
        );
        let feed = FeedProjector::new(
            gateway.clone(),
            engine.clone(),
            registry.clone(),
            accounts.clone(),
            config.feed.clone(),
            metrics.clone(),
        );
        let reports = Reports::new(
            settings.clone(),
            accounts.clone(),
            engine.clone(),
            journal.clone(),
        );

        let current = settings.initialize().await?;
        if config.ledger.seed_default_tokens {
            registry.seed_defaults().await?;
        }

        tracing::info!(
            service = %config.service_name,
            backend,
            vote_cost = current.vote_cost,
            voting_enabled = current.voting_enabled,
            tally_epoch = current.tally_epoch,
            "Ledger opened"
        );

        Ok(Self {
            config,
            gateway,
            settings,
            journal,
            accounts,
            registry,
            engine,
            feed,
            reports,
            metrics,
        })
    }

    /// Bootstrap the account for `identity` and return its session
    pub async fn sign_in(&self, identity: Identity) -> Result<Session> {
        self.accounts.bootstrap(&identity).await?;
        Ok(Session::new(
            identity,
            self.accounts.clone(),
            self.engine.clone(),
            self.journal.clone(),
        ))
    }

    /// Operator console acting as `operator`
    pub fn admin(&self, operator: impl Into<String>) -> AdminConsole {
        AdminConsole::new(
            operator,
            self.settings.clone(),
            self.accounts.clone(),
            self.registry.clone(),
        )
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Store backend name
    pub fn backend_name(&self) -> &'static str {
        self.gateway.store().backend_name()
    }

    /// Settings service
    pub fn settings(&self) -> &SettingsService {
        &self.settings
    }

    /// Transaction journal
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Account service
    pub fn accounts(&self) -> &AccountService {
        &self.accounts
    }

    /// Token registry
    pub fn registry(&self) -> &TokenRegistry {
        &self.registry
    }

    /// Voting engine
    pub fn engine(&self) -> &VotingEngine {
        &self.engine
    }

    /// Live feed
    pub fn feed(&self) -> &FeedProjector {
        &self.feed
    }

    /// Reports
    pub fn reports(&self) -> &Reports {
        &self.reports
    }

    /// Metrics
    pub fn metrics(&self) -> &LedgerMetrics {
        &self.metrics
    }

    /// Whether a balance equals its starting points plus completed journal amounts
    pub async fn verify_conservation(&self, user_id: &UserId) -> Result<bool> {
        self.accounts.verify_conservation(user_id).await
    }

    /// Tokens whose tally differs from the current epoch's vote records
    pub async fn verify_tallies(&self) -> Result<Vec<TallyMismatch>> {
        let settings = self.settings.current().await?;
        let mut counted: HashMap<String, u64> = HashMap::new();
        for vote in self.engine.votes_in_epoch(settings.tally_epoch).await? {
            *counted.entry(vote.token_name.to_string()).or_default() += 1;
        }

        let mismatches: Vec<TallyMismatch> = self
            .registry
            .list_all()
            .await?
            .into_iter()
            .filter_map(|token| {
                let name = token.name.to_string();
                let votes = counted.get(&name).copied().unwrap_or(0);
                (votes != token.total_votes).then_some(TallyMismatch {
                    token: name,
                    stored: token.total_votes,
                    counted: votes,
                })
            })
            .collect();

        for mismatch in &mismatches {
            tracing::warn!(
                token = %mismatch.token,
                stored = mismatch.stored,
                counted = mismatch.counted,
                "Tally does not match vote records"
            );
        }
        Ok(mismatches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TokenSpec;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_in_memory() {
        let ledger = Ledger::open(Config::in_memory()).await.unwrap();
        assert_eq!(ledger.backend_name(), "memory");
        let settings = ledger.settings().current().await.unwrap();
        assert_eq!(settings.vote_cost, 10);
        assert_eq!(settings.tally_epoch, 0);
    }

    #[tokio::test]
    async fn test_seed_on_open() {
        let mut config = Config::in_memory();
        config.ledger.seed_default_tokens = true;
        let ledger = Ledger::open(config).await.unwrap();
        assert_eq!(ledger.registry().list_active().await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_rocksdb_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.rocksdb.sync_writes = false;

        let alice = Identity::oauth("alice", "Alice");
        {
            let ledger = Ledger::open(config.clone()).await.unwrap();
            assert_eq!(ledger.backend_name(), "rocksdb");
            ledger
                .registry()
                .add_token(TokenSpec::new("FIRE", "🔥", "red"))
                .await
                .unwrap();
            let session = ledger.sign_in(alice.clone()).await.unwrap();
            session.cast_vote("FIRE", None).await.unwrap();
        }

        let ledger = Ledger::open(config).await.unwrap();
        let session = ledger.sign_in(alice).await.unwrap();
        assert_eq!(session.balance().await.unwrap(), 990);
        assert_eq!(ledger.registry().get_token("FIRE").await.unwrap().total_votes, 1);
        assert!(ledger.verify_conservation(session.user_id()).await.unwrap());
        assert!(ledger.verify_tallies().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = Config::in_memory();
        config.ledger.vote_cost = 0;
        assert!(matches!(Ledger::open(config).await, Err(Error::Config(_))));
    }
}
