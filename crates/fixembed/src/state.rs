use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::database::SettingsStore;
use crate::error::{StoreError, StoreResult};
use crate::service::ServiceSet;

/// In-memory mirror of channel toggles and the enabled-services set.
///
/// Reads never touch the store. Every mutation is persisted first and only
/// then published, so a failed write leaves the previous value in place.
/// Writers are serialized by `write_lock`; readers never wait on it.
pub struct StateCache {
    store: Arc<dyn SettingsStore>,
    channels: DashMap<u64, bool>,
    services: RwLock<ServiceSet>,
    write_lock: Mutex<()>,
}

/// Result of a bulk toggle that stopped partway.
#[derive(Debug)]
pub struct PartialToggle {
    pub committed: usize,
    pub failed_channel: u64,
    pub error: StoreError,
}

impl StateCache {
    /// An empty cache with every service enabled. Use [`StateCache::load`]
    /// to start from what the store holds.
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self {
            store,
            channels: DashMap::new(),
            services: RwLock::new(ServiceSet::default()),
            write_lock: Mutex::new(()),
        }
    }

    /// Build the cache from every stored row.
    pub async fn load(store: Arc<dyn SettingsStore>) -> StoreResult<Self> {
        let channel_rows = store.load_channel_states().await?;
        let services = store.load_enabled_services().await?;

        let cache = Self::new(store);
        for (channel_id, enabled) in channel_rows {
            cache.channels.insert(channel_id, enabled);
        }
        if let Some(services) = services {
            *cache.write_services() = services;
        }

        tracing::info!(
            channels = cache.channels.len(),
            services = %cache.enabled_services(),
            "State cache loaded"
        );
        Ok(cache)
    }

    /// Record channels with no stored row as enabled, in memory only.
    pub fn seed_channels(&self, channel_ids: impl IntoIterator<Item = u64>) -> usize {
        let mut seeded = 0;
        for channel_id in channel_ids {
            self.channels.entry(channel_id).or_insert_with(|| {
                seeded += 1;
                true
            });
        }
        seeded
    }

    pub fn is_channel_enabled(&self, channel_id: u64) -> bool {
        self.channels.get(&channel_id).map(|e| *e).unwrap_or(true)
    }

    /// True when every listed channel is enabled (vacuously true for none).
    pub fn all_enabled(&self, channel_ids: &[u64]) -> bool {
        channel_ids.iter().all(|id| self.is_channel_enabled(*id))
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn enabled_services(&self) -> ServiceSet {
        match self.services.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub async fn set_channel_enabled(&self, channel_id: u64, enabled: bool) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        self.store.save_channel_state(channel_id, enabled).await?;
        self.channels.insert(channel_id, enabled);
        tracing::info!(channel_id, enabled, "Channel toggled");
        Ok(())
    }

    pub async fn set_enabled_services(&self, services: ServiceSet) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        self.store.save_enabled_services(&services).await?;
        tracing::info!(services = %services, "Enabled services updated");
        *self.write_services() = services;
        Ok(())
    }

    /// Toggle many channels, one committed write each. Stops at the first
    /// failure; channels written before it stay written.
    pub async fn set_channels_enabled(
        &self,
        channel_ids: &[u64],
        enabled: bool,
    ) -> Result<usize, PartialToggle> {
        for (committed, channel_id) in channel_ids.iter().copied().enumerate() {
            if let Err(error) = self.set_channel_enabled(channel_id, enabled).await {
                return Err(PartialToggle {
                    committed,
                    failed_channel: channel_id,
                    error,
                });
            }
        }
        Ok(channel_ids.len())
    }

    fn write_services(&self) -> std::sync::RwLockWriteGuard<'_, ServiceSet> {
        match self.services.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
