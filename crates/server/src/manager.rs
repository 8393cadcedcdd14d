//! Asset registry
//!
//! [`AssetManager`] owns every live asset, keyed by `(id, type)`. Each asset
//! sits behind its own mutex, which serializes its lifecycle transitions; the
//! registry lock is never held while an asset is being started or stopped.

use crate::assets::{Asset, AssetKey};
use crate::error::{AssetError, AssetResult};
use common::Publisher;
use parking_lot::{Mutex, RwLock};
use protocol::{AssetState, AssetType};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub type SharedAsset = Arc<Mutex<Box<dyn Asset>>>;

/// Publishes the catalog on the asset-state port
///
/// Every publish runs on its own short-lived thread: bind, wait for the
/// settle delay while subscribers connect, send once, unbind. Publishes are
/// serialized so two of them never fight over the port.
#[derive(Clone)]
pub struct CatalogPublisher {
    addr: Option<SocketAddr>,
    settle: Duration,
    lock: Arc<Mutex<()>>,
    published: Arc<AtomicUsize>,
}

impl CatalogPublisher {
    pub fn new(addr: SocketAddr, settle: Duration) -> Self {
        Self {
            addr: Some(addr),
            settle,
            lock: Arc::new(Mutex::new(())),
            published: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A publisher that only counts publish requests
    pub fn disabled() -> Self {
        Self {
            addr: None,
            settle: Duration::ZERO,
            lock: Arc::new(Mutex::new(())),
            published: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of publishes requested so far
    pub fn published(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }

    /// Fire-and-forget publish of `catalog`
    pub fn publish(&self, catalog: String) {
        self.published.fetch_add(1, Ordering::SeqCst);
        let Some(addr) = self.addr else {
            return;
        };
        let settle = self.settle;
        let lock = self.lock.clone();
        let spawned = thread::Builder::new()
            .name("assets-state-publisher".to_string())
            .spawn(move || {
                let _guard = lock.lock();
                let mut publisher = match Publisher::bind(addr) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("Cannot bind asset-state port {}: {}", addr, e);
                        return;
                    }
                };
                let deadline = Instant::now() + settle;
                while Instant::now() < deadline {
                    publisher.poll_subscribers();
                    thread::sleep(Duration::from_millis(20));
                }
                match publisher.send_line(&catalog) {
                    Ok(n) => debug!("Published asset catalog to {} subscribers", n),
                    Err(e) => warn!("Failed to publish asset catalog: {}", e),
                }
            });
        if let Err(e) = spawned {
            error!("Failed to spawn asset-state publisher: {}", e);
        }
    }
}

pub struct AssetManager {
    assets: RwLock<HashMap<AssetKey, SharedAsset>>,
    catalog: CatalogPublisher,
}

impl AssetManager {
    pub fn new(catalog: CatalogPublisher) -> Self {
        Self {
            assets: RwLock::new(HashMap::new()),
            catalog,
        }
    }

    pub fn catalog_publisher(&self) -> &CatalogPublisher {
        &self.catalog
    }

    /// Register `asset`; an existing asset with the same key is kept
    pub fn add_asset(&self, asset: Box<dyn Asset>) -> AssetResult<()> {
        let key = asset.key().clone();
        let advertised = asset.advertised();
        {
            let mut assets = self.assets.write();
            if assets.contains_key(&key) {
                warn!("Refusing duplicate asset {}", key);
                return Err(AssetError::DuplicateAsset(key.to_string()));
            }
            assets.insert(key.clone(), Arc::new(Mutex::new(asset)));
        }
        info!("Added asset {}", key);
        if advertised {
            self.publish_asset_state();
        }
        Ok(())
    }

    /// Evict, stop and destroy an asset; absent keys are a no-op
    ///
    /// Returns whether an asset was removed.
    pub fn remove_asset(&self, id: &str, asset_type: AssetType) -> bool {
        let key = AssetKey::new(id, asset_type);
        let Some(shared) = self.assets.write().remove(&key) else {
            debug!("Remove of unknown asset {} ignored", key);
            return false;
        };

        let advertised = {
            let mut asset = shared.lock();
            if asset.state() == AssetState::Streaming {
                if let Err(e) = asset.stop() {
                    warn!("Stopping {} during removal failed: {}", key, e);
                }
            }
            asset.destroy();
            asset.advertised()
        };
        info!("Removed asset {}", key);
        if advertised {
            self.publish_asset_state();
        }
        true
    }

    pub fn get(&self, id: &str, asset_type: AssetType) -> AssetResult<SharedAsset> {
        let key = AssetKey::new(id, asset_type);
        self.assets
            .read()
            .get(&key)
            .cloned()
            .ok_or_else(|| AssetError::NotFound(key.to_string()))
    }

    pub fn contains(&self, id: &str, asset_type: AssetType) -> bool {
        self.assets
            .read()
            .contains_key(&AssetKey::new(id, asset_type))
    }

    pub fn len(&self) -> usize {
        self.assets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.read().is_empty()
    }

    pub fn keys(&self) -> Vec<AssetKey> {
        let mut keys: Vec<AssetKey> = self.assets.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn with_asset<T>(
        &self,
        id: &str,
        asset_type: AssetType,
        f: impl FnOnce(&mut Box<dyn Asset>) -> AssetResult<T>,
    ) -> AssetResult<T> {
        let shared = self.get(id, asset_type)?;
        let mut asset = shared.lock();
        f(&mut asset)
    }

    pub fn start_asset(&self, id: &str, asset_type: AssetType) -> AssetResult<()> {
        self.with_asset(id, asset_type, |asset| asset.start())
    }

    pub fn stop_asset(&self, id: &str, asset_type: AssetType) -> AssetResult<()> {
        self.with_asset(id, asset_type, |asset| asset.stop())
    }

    pub fn update_asset_config(
        &self,
        id: &str,
        asset_type: AssetType,
        config: &crate::assets::AssetConfig,
    ) -> AssetResult<()> {
        self.with_asset(id, asset_type, |asset| asset.update_config(config))
    }

    /// Apply wire overrides to the current config, then start
    ///
    /// Runs under the asset's lock so no other start/stop interleaves. An
    /// invalid override leaves the config untouched.
    pub fn configure_and_start(
        &self,
        id: &str,
        asset_type: AssetType,
        overrides: &Map<String, Value>,
    ) -> AssetResult<()> {
        self.with_asset(id, asset_type, |asset| {
            asset.core().ensure_idle()?;
            if !overrides.is_empty() {
                let mut config = asset.config().clone();
                config.apply_overrides(overrides)?;
                asset.update_config(&config)?;
            }
            asset.start()
        })
    }

    pub fn asset_state(&self, id: &str, asset_type: AssetType) -> AssetResult<AssetState> {
        self.with_asset(id, asset_type, |asset| Ok(asset.state()))
    }

    pub fn data_plane_threads(&self, id: &str, asset_type: AssetType) -> AssetResult<usize> {
        self.with_asset(id, asset_type, |asset| Ok(asset.data_plane_threads()))
    }

    fn snapshot(&self) -> Vec<SharedAsset> {
        self.assets.read().values().cloned().collect()
    }

    /// Descriptors grouped by type alias; types without assets are omitted
    pub fn catalog(&self) -> Map<String, Value> {
        let mut grouped: HashMap<AssetType, Vec<(String, Map<String, Value>)>> = HashMap::new();
        for shared in self.snapshot() {
            let asset = shared.lock();
            grouped
                .entry(asset.asset_type())
                .or_default()
                .push((asset.id().to_string(), asset.desc()));
        }

        let mut catalog = Map::new();
        for asset_type in AssetType::ALL {
            if let Some(mut entries) = grouped.remove(&asset_type) {
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                let descs = entries.into_iter().map(|(_, d)| Value::Object(d)).collect();
                catalog.insert(asset_type.alias().to_string(), Value::Array(descs));
            }
        }
        catalog
    }

    pub fn catalog_json(&self) -> String {
        Value::Object(self.catalog()).to_string()
    }

    /// Publish the current catalog in the background
    pub fn publish_asset_state(&self) {
        self.catalog.publish(self.catalog_json());
    }

    /// Stop every streaming asset; returns how many were stopped
    pub fn stop_all(&self) -> usize {
        let mut stopped = 0;
        for shared in self.snapshot() {
            let mut asset = shared.lock();
            if asset.state() == AssetState::Streaming {
                match asset.stop() {
                    Ok(()) => stopped += 1,
                    Err(e) => warn!("Failed to stop {}: {}", asset.name(), e),
                }
            }
        }
        stopped
    }

    /// Stop and destroy every asset and empty the registry
    pub fn shutdown(&self) {
        let drained: Vec<(AssetKey, SharedAsset)> = self.assets.write().drain().collect();
        for (key, shared) in drained {
            let mut asset = shared.lock();
            if asset.state() == AssetState::Streaming {
                if let Err(e) = asset.stop() {
                    warn!("Failed to stop {}: {}", key, e);
                }
            }
            asset.destroy();
        }
        info!("Asset manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::imu::DEFAULT_IMU_ID;
    use crate::assets::{GnssAsset, ImuAsset};
    use crate::hardware::mock::{MockNmeaSource, MockSensorSource};
    use common::test_utils::free_port;
    use serde_json::json;
    use std::net::{IpAddr, Ipv4Addr};

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn imu(id: &str) -> Box<dyn Asset> {
        Box::new(ImuAsset::new(
            id,
            free_port(),
            Box::new(MockSensorSource::default()),
            LOCALHOST,
        ))
    }

    #[test]
    fn test_duplicate_add_keeps_first() {
        let manager = AssetManager::new(CatalogPublisher::disabled());
        manager.add_asset(imu(DEFAULT_IMU_ID)).unwrap();
        assert!(matches!(
            manager.add_asset(imu(DEFAULT_IMU_ID)),
            Err(AssetError::DuplicateAsset(_))
        ));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_concurrent_starts_spawn_once() {
        let manager = Arc::new(AssetManager::new(CatalogPublisher::disabled()));
        manager.add_asset(imu(DEFAULT_IMU_ID)).unwrap();

        let callers = 8;
        let barrier = Arc::new(std::sync::Barrier::new(callers));
        let handles: Vec<_> = (0..callers)
            .map(|_| {
                let manager = manager.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    manager.start_asset(DEFAULT_IMU_ID, AssetType::Imu)
                })
            })
            .collect();
        let results: Vec<AssetResult<()>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(
            results
                .iter()
                .filter(|r| r.is_err())
                .all(|r| matches!(r, Err(AssetError::AlreadyStreaming(_))))
        );
        assert_eq!(
            manager.data_plane_threads(DEFAULT_IMU_ID, AssetType::Imu),
            Ok(1)
        );

        manager.stop_asset(DEFAULT_IMU_ID, AssetType::Imu).unwrap();
        assert_eq!(
            manager.data_plane_threads(DEFAULT_IMU_ID, AssetType::Imu),
            Ok(0)
        );
    }

    #[test]
    fn test_missing_asset_is_not_found() {
        let manager = AssetManager::new(CatalogPublisher::disabled());
        assert_eq!(
            manager.start_asset("nope", AssetType::Imu),
            Err(AssetError::NotFound("imu-nope".to_string()))
        );
        assert!(!manager.remove_asset("nope", AssetType::Imu));
    }

    #[test]
    fn test_catalog_groups_by_alias() {
        let manager = AssetManager::new(CatalogPublisher::disabled());
        manager.add_asset(imu(DEFAULT_IMU_ID)).unwrap();
        manager
            .add_asset(Box::new(GnssAsset::new(
                "gnss0",
                free_port(),
                Box::new(MockNmeaSource::default()),
                LOCALHOST,
            )))
            .unwrap();

        let catalog = Value::Object(manager.catalog());
        assert_eq!(
            catalog,
            json!({
                "imu": [{"id": "in72e", "fps": [1, 2, 5, 10, 15, 25, 30, 60, 75, 100, 125, 150, 200]}],
                "gnss": [{"id": "gnss0"}],
            })
        );
    }

    #[test]
    fn test_topology_changes_republish() {
        let manager = AssetManager::new(CatalogPublisher::disabled());
        manager.add_asset(imu(DEFAULT_IMU_ID)).unwrap();
        assert_eq!(manager.catalog_publisher().published(), 1);
        manager.remove_asset(DEFAULT_IMU_ID, AssetType::Imu);
        assert_eq!(manager.catalog_publisher().published(), 2);
        assert!(manager.catalog().is_empty());
    }

    #[test]
    fn test_configure_and_start_rejects_bad_override_without_change() {
        let manager = AssetManager::new(CatalogPublisher::disabled());
        manager.add_asset(imu(DEFAULT_IMU_ID)).unwrap();
        let overrides = json!({"fps": 7}).as_object().unwrap().clone();

        assert!(matches!(
            manager.configure_and_start(DEFAULT_IMU_ID, AssetType::Imu, &overrides),
            Err(AssetError::InvalidConfig(_))
        ));
        assert_eq!(
            manager.asset_state(DEFAULT_IMU_ID, AssetType::Imu),
            Ok(AssetState::Idle)
        );
    }

    #[test]
    fn test_remove_stops_streaming_asset() {
        let manager = AssetManager::new(CatalogPublisher::disabled());
        manager.add_asset(imu(DEFAULT_IMU_ID)).unwrap();
        manager.start_asset(DEFAULT_IMU_ID, AssetType::Imu).unwrap();

        let shared = manager.get(DEFAULT_IMU_ID, AssetType::Imu).unwrap();
        assert!(manager.remove_asset(DEFAULT_IMU_ID, AssetType::Imu));
        let asset = shared.lock();
        assert_eq!(asset.state(), AssetState::Idle);
        assert_eq!(asset.data_plane_threads(), 0);
    }
}
