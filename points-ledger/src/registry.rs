//! Token registry
//!
//! Voteable tokens keyed by normalized name. Tallies only move inside a vote
//! commit or a tally reset; there is no direct setter.

use crate::retry::RetryStrategy;
use crate::settings::SettingsService;
use crate::store::{Batch, Collection, Expect, Gateway, ScanDirection};
use crate::types::{Token, TokenDetails, TokenName, TokenSpec};
use crate::{Error, Result};
use chrono::Utc;
use std::cmp::Ordering;
use tracing::{debug, info};

/// Tokens added by [`TokenRegistry::seed_defaults`]: name, icon, color
pub const DEFAULT_TOKENS: [(&str, &str, &str); 6] = [
    ("MOONSHOT", "🚀", "blue"),
    ("DIAMOND", "💎", "green"),
    ("LIGHTNING", "⚡", "purple"),
    ("ROCKET", "🌙", "yellow"),
    ("FIRE", "🔥", "red"),
    ("STAR", "⭐", "orange"),
];

/// Leaderboard order: most votes, then oldest, then name
pub fn leaderboard_order(a: &Token, b: &Token) -> Ordering {
    b.total_votes
        .cmp(&a.total_votes)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.name.cmp(&b.name))
}

/// Token registry
#[derive(Debug, Clone)]
pub struct TokenRegistry {
    gateway: Gateway,
    settings: SettingsService,
    retry: RetryStrategy,
}

impl TokenRegistry {
    /// Create registry
    pub fn new(gateway: Gateway, settings: SettingsService, retry: RetryStrategy) -> Self {
        Self {
            gateway,
            settings,
            retry,
        }
    }

    fn parse_name(raw: &str) -> Result<TokenName> {
        TokenName::parse(raw)
            .ok_or_else(|| Error::InvalidArgument("Token name is empty".to_string()))
    }

    /// Register a token with zero votes
    ///
    /// The commit also rewrites the settings row, so a tally reset that
    /// scanned the token set before this token existed aborts and rescans.
    pub async fn add_token(&self, spec: TokenSpec) -> Result<Token> {
        let name = Self::parse_name(&spec.name)?;
        let token = Token {
            name: name.clone(),
            icon: spec.icon,
            color_tag: spec.color_tag,
            description: spec.description,
            total_votes: 0,
            active: true,
            contract_ref: spec.contract_ref,
            created_at: Utc::now(),
        };
        let candidate = &token;

        let token = self
            .retry
            .execute("add_token", move |attempt| async move {
                match self.load(&candidate.name).await? {
                    // Committed by an earlier attempt whose result was lost
                    Some((existing, _)) if attempt > 0 && existing == *candidate => {
                        return Ok(existing)
                    }
                    Some(_) => return Err(Error::DuplicateName(candidate.name.to_string())),
                    None => {}
                }

                let snapshot = self.settings.snapshot().await?;
                let mut settings = snapshot.settings.clone();
                settings.updated_at = Utc::now();

                let mut batch = Batch::new();
                batch.create(Collection::Tokens, candidate.name.as_str(), candidate)?;
                self.settings.stage_write(&mut batch, &snapshot, &settings)?;
                self.gateway.commit(batch).await?;
                Ok(candidate.clone())
            })
            .await?;

        info!(token = %name, icon = %token.icon, "Token added");
        Ok(token)
    }

    /// Token with its stored version
    pub(crate) async fn load(&self, name: &TokenName) -> Result<Option<(Token, u64)>> {
        self.gateway
            .load::<Token>(Collection::Tokens, name.as_str())
            .await
    }

    async fn load_existing(&self, name: &TokenName) -> Result<(Token, u64)> {
        self.load(name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Token {}", name)))
    }

    /// Get token by name (case and surrounding whitespace ignored)
    pub async fn get_token(&self, name: &str) -> Result<Token> {
        let name = Self::parse_name(name)?;
        Ok(self.load_existing(&name).await?.0)
    }

    /// Every token, active or not, by name
    pub async fn list_all(&self) -> Result<Vec<Token>> {
        self.gateway
            .scan(Collection::Tokens, ScanDirection::Forward, None)
            .await
    }

    /// Active tokens in leaderboard order
    pub async fn list_active(&self) -> Result<Vec<Token>> {
        self.gateway
            .query(
                Collection::Tokens,
                |token: &Token| token.active,
                leaderboard_order,
                None,
            )
            .await
    }

    /// Enable or disable voting for a token
    pub async fn set_active(&self, name: &str, active: bool) -> Result<Token> {
        let name = Self::parse_name(name)?;
        let token = self
            .modify("set_token_active", &name, |token| token.active = active)
            .await?;
        info!(token = %name, active, "Token activation changed");
        Ok(token)
    }

    /// Edit display fields; `None` fields stay unchanged
    pub async fn update_details(&self, name: &str, details: TokenDetails) -> Result<Token> {
        let name = Self::parse_name(name)?;
        let details = &details;
        let token = self
            .modify("update_token", &name, |token| {
                if let Some(icon) = &details.icon {
                    token.icon = icon.clone();
                }
                if let Some(color_tag) = &details.color_tag {
                    token.color_tag = color_tag.clone();
                }
                if let Some(description) = &details.description {
                    token.description = Some(description.clone());
                }
                if let Some(contract_ref) = &details.contract_ref {
                    token.contract_ref = Some(contract_ref.clone());
                }
            })
            .await?;
        debug!(token = %name, "Token details updated");
        Ok(token)
    }

    async fn modify<F>(&self, operation: &str, name: &TokenName, change: F) -> Result<Token>
    where
        F: Fn(&mut Token),
    {
        let change = &change;
        self.retry
            .execute(operation, move |_| async move {
                let (mut token, version) = self.load_existing(name).await?;
                change(&mut token);

                let mut batch = Batch::new();
                batch.update(Collection::Tokens, name.as_str(), &token, version)?;
                self.gateway.commit(batch).await?;
                Ok(token)
            })
            .await
    }

    /// Stage `total_votes += by` for a token read at `version`
    pub(crate) fn stage_increment(
        &self,
        batch: &mut Batch,
        token: &Token,
        version: u64,
        by: u64,
    ) -> Result<Token> {
        let mut updated = token.clone();
        updated.total_votes += by;
        batch.update(Collection::Tokens, token.name.as_str(), &updated, version)?;
        Ok(updated)
    }

    /// Start a new tally epoch: every token back to zero votes
    ///
    /// Vote records are kept and stay tagged with the epoch they were cast
    /// in. Returns the new epoch.
    pub async fn reset_all_tallies(&self) -> Result<u64> {
        let epoch = self
            .retry
            .execute("reset_all_tallies", move |_| async move {
                let snapshot = self.settings.snapshot().await?;
                let tokens = self
                    .gateway
                    .scan_versioned::<Token>(Collection::Tokens, ScanDirection::Forward, None)
                    .await?;

                let mut settings = snapshot.settings.clone();
                settings.tally_epoch += 1;
                settings.updated_at = Utc::now();

                let mut batch = Batch::new();
                self.settings.stage_write(&mut batch, &snapshot, &settings)?;
                for (token, version) in tokens {
                    if token.total_votes == 0 {
                        batch.check(Collection::Tokens, token.name.as_str(), Expect::Version(version));
                    } else {
                        let mut reset = token.clone();
                        reset.total_votes = 0;
                        batch.update(Collection::Tokens, token.name.as_str(), &reset, version)?;
                    }
                }
                self.gateway.commit(batch).await?;
                Ok(settings.tally_epoch)
            })
            .await?;

        info!(epoch, "Tallies reset");
        Ok(epoch)
    }

    /// Add the default token set; existing names are left alone
    pub async fn seed_defaults(&self) -> Result<Vec<Token>> {
        let mut added = Vec::new();
        for (name, icon, color) in DEFAULT_TOKENS {
            match self.add_token(TokenSpec::new(name, icon, color)).await {
                Ok(token) => added.push(token),
                Err(Error::DuplicateName(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if !added.is_empty() {
            info!(count = added.len(), "Default tokens seeded");
        }
        Ok(added)
    }
}
