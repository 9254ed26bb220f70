//! Read-only reports over the ledger

use crate::accounts::AccountService;
use crate::engine::VotingEngine;
use crate::journal::Journal;
use crate::settings::SettingsService;
use crate::types::{Account, Transaction, TransactionKind, UserId, VoteRecord};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ledger-wide counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalStats {
    /// Accounts ever created
    pub total_users: u64,
    /// Votes ever committed
    pub total_votes: u64,
    /// Votes in the current tally epoch
    pub current_epoch_votes: u64,
    /// Completed purchases
    pub total_purchases: u64,
    /// Current tally epoch
    pub tally_epoch: u64,
}

/// Everything the ledger holds about one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserExport {
    /// Account
    pub account: Account,
    /// Votes, oldest first
    pub votes: Vec<VoteRecord>,
    /// Transactions, oldest first
    pub transactions: Vec<Transaction>,
    /// Export time
    pub exported_at: DateTime<Utc>,
}

impl UserExport {
    /// Pretty JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Report builder
#[derive(Debug, Clone)]
pub struct Reports {
    settings: SettingsService,
    accounts: AccountService,
    engine: VotingEngine,
    journal: Journal,
}

impl Reports {
    /// Create reports
    pub fn new(
        settings: SettingsService,
        accounts: AccountService,
        engine: VotingEngine,
        journal: Journal,
    ) -> Self {
        Self {
            settings,
            accounts,
            engine,
            journal,
        }
    }

    /// Ledger-wide counters
    pub async fn global_stats(&self) -> Result<GlobalStats> {
        let settings = self.settings.current().await?;
        Ok(GlobalStats {
            total_users: self.accounts.list_accounts().await?.len() as u64,
            total_votes: self.engine.count_votes().await?,
            current_epoch_votes: self.engine.votes_in_epoch(settings.tally_epoch).await?.len()
                as u64,
            total_purchases: self.journal.count_completed(TransactionKind::Purchase).await?,
            tally_epoch: settings.tally_epoch,
        })
    }

    /// Accounts with the most votes
    pub async fn top_voters(&self, limit: usize) -> Result<Vec<Account>> {
        self.accounts.top_voters(limit).await
    }

    /// Full data export for one user
    pub async fn export_user(&self, user_id: &UserId) -> Result<UserExport> {
        let account = self.accounts.get_account(user_id).await?;
        let votes = self.engine.votes_for_user(user_id).await?;
        let transactions = self.journal.history(user_id).await?;
        tracing::debug!(user_id = %user_id, votes = votes.len(), "User data exported");
        Ok(UserExport {
            account,
            votes,
            transactions,
            exported_at: Utc::now(),
        })
    }
}
