//! Signed-in user context
//!
//! A [`Session`] is returned by [`crate::Ledger::sign_in`] and carries the
//! caller's identity explicitly; nothing about "the current user" lives in
//! shared state.

use crate::accounts::AccountService;
use crate::engine::VotingEngine;
use crate::journal::Journal;
use crate::types::{Account, Identity, Transaction, UserId, VoteRecord};
use crate::Result;

/// Per-user context
#[derive(Debug, Clone)]
pub struct Session {
    identity: Identity,
    accounts: AccountService,
    engine: VotingEngine,
    journal: Journal,
}

impl Session {
    pub(crate) fn new(
        identity: Identity,
        accounts: AccountService,
        engine: VotingEngine,
        journal: Journal,
    ) -> Self {
        Self {
            identity,
            accounts,
            engine,
            journal,
        }
    }

    /// Signed-in user
    pub fn user_id(&self) -> &UserId {
        &self.identity.id
    }

    /// Identity the session was opened with
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Fresh copy of the account
    pub async fn account(&self) -> Result<Account> {
        self.accounts.get_account(&self.identity.id).await
    }

    /// Current balance
    pub async fn balance(&self) -> Result<i64> {
        self.accounts.get_balance(&self.identity.id).await
    }

    /// Vote for a token as this user
    pub async fn cast_vote(&self, token_name: &str, requested_cost: Option<i64>) -> Result<VoteRecord> {
        self.engine
            .cast_vote(&self.identity.id, token_name, requested_cost)
            .await
    }

    /// Newest transactions of this user
    pub async fn transactions(&self, limit: usize) -> Result<Vec<Transaction>> {
        self.journal.list_for_user(&self.identity.id, limit).await
    }

    /// Every vote of this user, oldest first
    pub async fn votes(&self) -> Result<Vec<VoteRecord>> {
        self.engine.votes_for_user(&self.identity.id).await
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::types::{Identity, TokenSpec, TransactionKind};
    use crate::Ledger;

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let ledger = Ledger::open(Config::in_memory()).await.unwrap();
        ledger
            .registry()
            .add_token(TokenSpec::new("FIRE", "🔥", "red"))
            .await
            .unwrap();

        let alice = ledger
            .sign_in(Identity::wallet("0xaaaaaaaaaaaa"))
            .await
            .unwrap();
        let bob = ledger
            .sign_in(Identity::oauth("bob", "Bob"))
            .await
            .unwrap();

        alice.cast_vote("FIRE", Some(10)).await.unwrap();

        assert_eq!(alice.balance().await.unwrap(), 990);
        assert_eq!(bob.balance().await.unwrap(), 1000);
        assert_eq!(alice.account().await.unwrap().display_name, "User0xaaaaaa");

        let txs = alice.transactions(10).await.unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].kind, TransactionKind::Vote);
        assert!(bob.transactions(10).await.unwrap().is_empty());
        assert_eq!(alice.votes().await.unwrap().len(), 1);
    }
}
