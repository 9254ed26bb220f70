//! Operator control surface
//!
//! Every mutation is logged with the operator name and goes through the same
//! services the user-facing paths use, so balances stay backed by the journal
//! and tallies stay backed by vote records.

use crate::accounts::AccountService;
use crate::registry::TokenRegistry;
use crate::settings::SettingsService;
use crate::types::{
    Account, Posting, PrimaryToken, SystemSettings, Token, TokenDetails, TokenSpec, UserId,
};
use crate::{Error, Result};
use tracing::info;

/// Privileged operations, bound to one operator
#[derive(Debug, Clone)]
pub struct AdminConsole {
    operator: String,
    settings: SettingsService,
    accounts: AccountService,
    registry: TokenRegistry,
}

impl AdminConsole {
    /// Console acting as `operator`
    pub fn new(
        operator: impl Into<String>,
        settings: SettingsService,
        accounts: AccountService,
        registry: TokenRegistry,
    ) -> Self {
        Self {
            operator: operator.into(),
            settings,
            accounts,
            registry,
        }
    }

    /// Operator name
    pub fn operator(&self) -> &str {
        &self.operator
    }

    /// Register a token
    pub async fn add_token(&self, spec: TokenSpec) -> Result<Token> {
        let token = self.registry.add_token(spec).await?;
        info!(operator = %self.operator, token = %token.name, "Admin added token");
        Ok(token)
    }

    /// Enable or disable voting for a token
    pub async fn set_token_active(&self, name: &str, active: bool) -> Result<Token> {
        let token = self.registry.set_active(name, active).await?;
        info!(operator = %self.operator, token = %token.name, active, "Admin changed token activation");
        Ok(token)
    }

    /// Soft delete: the token stops accepting votes, its record and votes stay
    pub async fn remove_token(&self, name: &str) -> Result<Token> {
        let token = self.registry.set_active(name, false).await?;
        info!(operator = %self.operator, token = %token.name, "Admin removed token");
        Ok(token)
    }

    /// Edit display fields of a token
    pub async fn update_token(&self, name: &str, details: TokenDetails) -> Result<Token> {
        let token = self.registry.update_details(name, details).await?;
        info!(operator = %self.operator, token = %token.name, "Admin updated token");
        Ok(token)
    }

    /// Zero every tally and start a new epoch
    pub async fn reset_all_tallies(&self) -> Result<u64> {
        let epoch = self.registry.reset_all_tallies().await?;
        info!(operator = %self.operator, epoch, "Admin reset tallies");
        Ok(epoch)
    }

    /// Turn voting on or off
    pub async fn set_voting_enabled(&self, enabled: bool) -> Result<SystemSettings> {
        let settings = self
            .settings
            .modify("set_voting_enabled", |s| {
                s.voting_enabled = enabled;
                Ok(())
            })
            .await?;
        info!(operator = %self.operator, enabled, "Admin toggled voting");
        Ok(settings)
    }

    /// Change the points charged per vote
    pub async fn set_vote_cost(&self, cost: i64) -> Result<SystemSettings> {
        if cost <= 0 {
            return Err(Error::InvalidArgument(format!(
                "Vote cost must be positive, got {}",
                cost
            )));
        }
        let settings = self
            .settings
            .modify("set_vote_cost", |s| {
                s.vote_cost = cost;
                Ok(())
            })
            .await?;
        info!(operator = %self.operator, cost, "Admin changed vote cost");
        Ok(settings)
    }

    /// Feature a token in system settings, or clear it with `None`
    pub async fn set_primary_token(
        &self,
        token: Option<PrimaryToken>,
    ) -> Result<SystemSettings> {
        let token = match token {
            Some(mut token) => {
                token.name = token.name.trim().to_string();
                if token.name.is_empty() {
                    return Err(Error::InvalidArgument(
                        "Primary token name is empty".to_string(),
                    ));
                }
                Some(token)
            }
            None => None,
        };
        let name = token.as_ref().map(|t| t.name.clone());
        let token = &token;
        let settings = self
            .settings
            .modify("set_primary_token", |s| {
                s.primary_token = token.clone();
                Ok(())
            })
            .await?;
        info!(operator = %self.operator, primary_token = ?name, "Admin changed primary token");
        Ok(settings)
    }

    /// Change the balance granted to accounts created from now on
    pub async fn set_default_starting_points(&self, points: i64) -> Result<SystemSettings> {
        if points < 0 {
            return Err(Error::InvalidArgument(format!(
                "Starting points cannot be negative, got {}",
                points
            )));
        }
        let settings = self
            .settings
            .modify("set_default_starting_points", |s| {
                s.default_starting_points = points;
                Ok(())
            })
            .await?;
        info!(operator = %self.operator, points, "Admin changed starting points");
        Ok(settings)
    }

    /// Grant points to a user
    pub async fn grant_points(&self, user_id: &UserId, amount: i64) -> Result<Posting> {
        self.accounts
            .grant_points(user_id, amount, &self.operator)
            .await
    }

    /// Correct a balance by `delta` points, either sign
    pub async fn adjust_points(&self, user_id: &UserId, delta: i64, reason: &str) -> Result<Posting> {
        self.accounts
            .adjust_points(user_id, delta, reason, &self.operator)
            .await
    }

    /// Enable or disable an account
    pub async fn set_account_active(&self, user_id: &UserId, active: bool) -> Result<Account> {
        let account = self.accounts.set_active(user_id, active).await?;
        info!(operator = %self.operator, user_id = %user_id, active, "Admin changed account activation");
        Ok(account)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::types::{Identity, PrimaryToken, TokenSpec, TransactionKind};
    use crate::{Error, Ledger};

    async fn ledger() -> Ledger {
        Ledger::open(Config::in_memory()).await.unwrap()
    }

    #[tokio::test]
    async fn test_remove_token_is_soft() {
        let ledger = ledger().await;
        let admin = ledger.admin("ops");
        admin
            .add_token(TokenSpec::new("FIRE", "🔥", "red"))
            .await
            .unwrap();

        let removed = admin.remove_token("fire").await.unwrap();
        assert!(!removed.active);
        assert_eq!(ledger.registry().list_all().await.unwrap().len(), 1);
        assert!(ledger.registry().list_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_primary_token_round_trip() {
        let ledger = ledger().await;
        let admin = ledger.admin("ops");
        assert!(ledger.settings().current().await.unwrap().primary_token.is_none());

        let wonk = PrimaryToken {
            name: "  WONK ".to_string(),
            contract_address: Some("0xabc123".to_string()),
            description: Some("House token".to_string()),
        };
        admin.set_primary_token(Some(wonk)).await.unwrap();
        let stored = ledger.settings().current().await.unwrap().primary_token.unwrap();
        assert_eq!(stored.name, "WONK");
        assert_eq!(stored.contract_address.as_deref(), Some("0xabc123"));

        let blank = PrimaryToken {
            name: " ".to_string(),
            contract_address: None,
            description: None,
        };
        assert!(matches!(
            admin.set_primary_token(Some(blank)).await,
            Err(Error::InvalidArgument(_))
        ));

        admin.set_primary_token(None).await.unwrap();
        assert!(ledger.settings().current().await.unwrap().primary_token.is_none());
    }

    #[tokio::test]
    async fn test_vote_cost_validation() {
        let ledger = ledger().await;
        let admin = ledger.admin("ops");

        assert!(matches!(
            admin.set_vote_cost(0).await,
            Err(Error::InvalidArgument(_))
        ));
        let settings = admin.set_vote_cost(25).await.unwrap();
        assert_eq!(settings.vote_cost, 25);
        assert_eq!(ledger.settings().current().await.unwrap().vote_cost, 25);
    }

    #[tokio::test]
    async fn test_starting_points_affect_new_accounts_only() {
        let ledger = ledger().await;
        let admin = ledger.admin("ops");

        let early = ledger
            .sign_in(Identity::oauth("early", "Early"))
            .await
            .unwrap();
        admin.set_default_starting_points(200).await.unwrap();
        let late = ledger
            .sign_in(Identity::oauth("late", "Late"))
            .await
            .unwrap();

        assert_eq!(early.balance().await.unwrap(), 1000);
        assert_eq!(late.balance().await.unwrap(), 200);
        assert!(ledger.verify_conservation(early.user_id()).await.unwrap());
        assert!(ledger.verify_conservation(late.user_id()).await.unwrap());
    }

    #[tokio::test]
    async fn test_grant_is_journaled_with_operator() {
        let ledger = ledger().await;
        let session = ledger
            .sign_in(Identity::oauth("u1", "Alice"))
            .await
            .unwrap();

        let posting = ledger
            .admin("ops")
            .grant_points(session.user_id(), 50)
            .await
            .unwrap();
        assert_eq!(posting.account.points, 1050);
        assert_eq!(posting.transaction.kind, TransactionKind::AdminGrant);
        assert_eq!(
            posting.transaction.metadata.get("operator").map(String::as_str),
            Some("ops")
        );
    }

    #[tokio::test]
    async fn test_voting_switch() {
        let ledger = ledger().await;
        let admin = ledger.admin("ops");
        admin
            .add_token(TokenSpec::new("FIRE", "🔥", "red"))
            .await
            .unwrap();
        let session = ledger
            .sign_in(Identity::oauth("u1", "Alice"))
            .await
            .unwrap();

        admin.set_voting_enabled(false).await.unwrap();
        assert!(matches!(
            session.cast_vote("FIRE", None).await,
            Err(Error::VotingDisabled)
        ));

        admin.set_voting_enabled(true).await.unwrap();
        assert!(session.cast_vote("FIRE", None).await.is_ok());
    }
}
