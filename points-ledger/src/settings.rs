//! Singleton system settings row
//!
//! Stored at `settings/system`. Until first written, reads fall back to the
//! configured [`LedgerDefaults`]; staged writes then use an `Absent`
//! precondition instead of a version.

use crate::config::LedgerDefaults;
use crate::retry::RetryStrategy;
use crate::store::{Batch, Collection, Expect, Gateway};
use crate::types::SystemSettings;
use crate::Result;
use chrono::Utc;

/// Key of the settings row
pub const SETTINGS_KEY: &str = "system";

/// Settings row plus the version it was read at (`None` = not yet stored)
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsSnapshot {
    /// Settings
    pub settings: SystemSettings,
    /// Stored version
    pub version: Option<u64>,
}

impl SettingsSnapshot {
    /// Precondition that pins this snapshot in a commit
    pub fn expect(&self) -> Expect {
        match self.version {
            Some(version) => Expect::Version(version),
            None => Expect::Absent,
        }
    }
}

/// Reads and writes the settings row
#[derive(Debug, Clone)]
pub struct SettingsService {
    gateway: Gateway,
    defaults: LedgerDefaults,
    retry: RetryStrategy,
}

impl SettingsService {
    /// Create service
    pub fn new(gateway: Gateway, defaults: LedgerDefaults, retry: RetryStrategy) -> Self {
        Self {
            gateway,
            defaults,
            retry,
        }
    }

    fn default_settings(&self) -> SystemSettings {
        SystemSettings {
            vote_cost: self.defaults.vote_cost,
            default_starting_points: self.defaults.starting_points,
            voting_enabled: self.defaults.voting_enabled,
            tally_epoch: 0,
            primary_token: None,
            updated_at: Utc::now(),
        }
    }

    /// Current settings
    pub async fn current(&self) -> Result<SystemSettings> {
        Ok(self.snapshot().await?.settings)
    }

    /// Current settings with version
    pub async fn snapshot(&self) -> Result<SettingsSnapshot> {
        match self
            .gateway
            .load::<SystemSettings>(Collection::Settings, SETTINGS_KEY)
            .await?
        {
            Some((settings, version)) => Ok(SettingsSnapshot {
                settings,
                version: Some(version),
            }),
            None => Ok(SettingsSnapshot {
                settings: self.default_settings(),
                version: None,
            }),
        }
    }

    /// Persist defaults if the row does not exist yet
    pub async fn initialize(&self) -> Result<SystemSettings> {
        let snapshot = self.snapshot().await?;
        if snapshot.version.is_some() {
            return Ok(snapshot.settings);
        }

        let mut batch = Batch::new();
        batch.create(Collection::Settings, SETTINGS_KEY, &snapshot.settings)?;
        match self.gateway.commit(batch).await {
            Ok(()) => {
                tracing::info!(
                    vote_cost = snapshot.settings.vote_cost,
                    starting_points = snapshot.settings.default_starting_points,
                    "Settings initialized"
                );
                Ok(snapshot.settings)
            }
            // Another instance initialized first
            Err(crate::Error::ConcurrentConflict(_)) => self.current().await,
            Err(e) => Err(e),
        }
    }

    /// Stage a replacement of the row read in `snapshot`
    pub(crate) fn stage_write(
        &self,
        batch: &mut Batch,
        snapshot: &SettingsSnapshot,
        settings: &SystemSettings,
    ) -> Result<()> {
        match snapshot.version {
            Some(version) => batch.update(Collection::Settings, SETTINGS_KEY, settings, version),
            None => batch.create(Collection::Settings, SETTINGS_KEY, settings),
        }
    }

    /// Stage a check that the row is unchanged since `snapshot`
    pub(crate) fn stage_guard(&self, batch: &mut Batch, snapshot: &SettingsSnapshot) {
        batch.check(Collection::Settings, SETTINGS_KEY, snapshot.expect());
    }

    /// Read-modify-write the row with optimistic retry
    pub(crate) async fn modify<F>(&self, operation: &str, change: F) -> Result<SystemSettings>
    where
        F: Fn(&mut SystemSettings) -> Result<()>,
    {
        let change = &change;
        self.retry
            .execute(operation, move |_| async move {
                let snapshot = self.snapshot().await?;
                let mut settings = snapshot.settings.clone();
                change(&mut settings)?;
                settings.updated_at = Utc::now();

                let mut batch = Batch::new();
                self.stage_write(&mut batch, &snapshot, &settings)?;
                self.gateway.commit(batch).await?;
                Ok(settings)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use std::sync::Arc;
    use tokio::time::Duration;

    fn service() -> SettingsService {
        let gateway = Gateway::new(Arc::new(MemoryStore::default()), Duration::from_secs(1));
        SettingsService::new(gateway, LedgerDefaults::default(), RetryStrategy::with_defaults())
    }

    #[tokio::test]
    async fn test_defaults_before_initialize() {
        let settings = service();
        let snapshot = settings.snapshot().await.unwrap();
        assert_eq!(snapshot.version, None);
        assert_eq!(snapshot.settings.vote_cost, 10);
        assert_eq!(snapshot.settings.default_starting_points, 1000);
        assert!(snapshot.settings.voting_enabled);
        assert_eq!(snapshot.expect(), Expect::Absent);
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let settings = service();
        settings.initialize().await.unwrap();
        settings.initialize().await.unwrap();
        let snapshot = settings.snapshot().await.unwrap();
        assert_eq!(snapshot.version, Some(1));
    }

    #[tokio::test]
    async fn test_modify() {
        let settings = service();
        settings.initialize().await.unwrap();

        let updated = settings
            .modify("set_vote_cost", |s| {
                s.vote_cost = 25;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(updated.vote_cost, 25);
        assert_eq!(settings.current().await.unwrap().vote_cost, 25);
        assert_eq!(settings.snapshot().await.unwrap().version, Some(2));
    }
}
