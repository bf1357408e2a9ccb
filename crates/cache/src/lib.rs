//! In-memory cache of active delivery zones, with thread-safe access
//! and async population from the database.
//!
//! Zones are admin-managed and read on every keystroke of the postcode
//! field, so checkout reads a shared snapshot instead of hitting Postgres.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use model::DeliveryZone;
use repository::ZonesRepository;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, error, info};

/// Thread-safe in-memory zone snapshot.
#[derive(Debug)]
pub struct ZoneCache {
    inner: RwLock<Arc<[DeliveryZone]>>,
}

impl Default for ZoneCache {
    fn default() -> Self {
        Self::with_zones(Vec::new())
    }
}

impl ZoneCache {
    /// Create a new, empty zone cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cache pre-filled with the given zones.
    pub fn with_zones(zones: Vec<DeliveryZone>) -> Self {
        Self {
            inner: RwLock::new(zones.into()),
        }
    }

    /// Load all active zones from the repository, replacing the snapshot.
    ///
    /// On error the previous snapshot is kept.
    pub async fn load_from_db<R>(&self, zones_repo: &R) -> Result<usize>
    where
        R: ZonesRepository + ?Sized,
    {
        let zones = zones_repo.list_active().await?;
        let count = zones.len();
        self.set(zones).await;
        debug!(zones = count, "Delivery zone cache reloaded");
        Ok(count)
    }

    /// Current snapshot. Cheap to clone and safe to hold across awaits.
    pub async fn snapshot(&self) -> Arc<[DeliveryZone]> {
        self.inner.read().await.clone()
    }

    /// Replace the snapshot.
    pub async fn set(&self, zones: Vec<DeliveryZone>) {
        let mut guard = self.inner.write().await;
        *guard = zones.into();
    }
}

/// Reloads the cache every `interval` until `shutdown` fires.
pub async fn run_refresh<R>(
    cache: Arc<ZoneCache>,
    zones_repo: Arc<R>,
    interval: Duration,
    shutdown: Arc<Notify>,
) where
    R: ZonesRepository + ?Sized,
{
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately; the initial load happens at start-up.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = cache.load_from_db(zones_repo.as_ref()).await {
                    error!("Failed to refresh delivery zones: {e}");
                }
            }
            _ = shutdown.notified() => {
                info!("Zone refresh task received shutdown signal.");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repository::MemoryZonesRepository;
    use rust_decimal_macros::dec;

    fn zone(id: i64, prefix: &str, active: bool) -> DeliveryZone {
        DeliveryZone {
            id,
            postcode_prefix: prefix.to_string(),
            area_name: format!("Area {prefix}"),
            fee: dec!(5.00),
            active,
        }
    }

    #[tokio::test]
    async fn test_empty_cache() {
        let cache = ZoneCache::new();
        assert!(cache.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_load_from_db_keeps_only_active_zones() {
        let repo = MemoryZonesRepository::new(vec![zone(1, "HU", true), zone(2, "YO", false)]);
        let cache = ZoneCache::new();
        let loaded = cache.load_from_db(&repo).await.unwrap();
        assert_eq!(loaded, 1);
        assert_eq!(cache.snapshot().await[0].postcode_prefix, "HU");
    }

    #[tokio::test]
    async fn test_snapshot_survives_reload() {
        let repo = MemoryZonesRepository::new(vec![zone(1, "HU", true)]);
        let cache = ZoneCache::new();
        cache.load_from_db(&repo).await.unwrap();
        let before = cache.snapshot().await;

        repo.set(vec![zone(1, "HU", true), zone(3, "HU1", true)]).await;
        cache.load_from_db(&repo).await.unwrap();

        assert_eq!(before.len(), 1);
        assert_eq!(cache.snapshot().await.len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_task_stops_on_shutdown() {
        let cache = Arc::new(ZoneCache::new());
        let repo = Arc::new(MemoryZonesRepository::new(vec![zone(1, "HU", true)]));
        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn(run_refresh(
            cache.clone(),
            repo,
            Duration::from_millis(10),
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.notify_one();
        task.await.unwrap();
        assert_eq!(cache.snapshot().await.len(), 1);
    }
}
