//! Hot-plug to asset bridge
//!
//! A [`DeviceWatcher`] owns the port pool of one device category. Attach
//! allocates the smallest free offset, derives the asset's ports from it and
//! registers a new asset whose id is the offset. Detach removes the asset
//! and returns the offset to the pool.

use super::{AttachedDevice, DeviceCategory, DeviceEvent};
use crate::assets::{Asset, CameraAsset, UsbSerialAsset};
use crate::error::{AssetError, AssetResult};
use crate::hardware::{CameraBackend, SerialOpener};
use crate::manager::AssetManager;
use crate::ports::PortPool;
use protocol::AssetType;
use std::collections::HashMap;
use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Builds the asset for a freshly attached device
pub trait AssetFactory: Send + Sync {
    fn asset_type(&self) -> AssetType;

    fn create(
        &self,
        device: &AttachedDevice,
        id: &str,
        port_pub: u16,
        port_sub: u16,
    ) -> AssetResult<Box<dyn Asset>>;
}

pub struct SerialAssetFactory {
    opener: Arc<dyn SerialOpener>,
    bind_host: IpAddr,
}

impl SerialAssetFactory {
    pub fn new(opener: Arc<dyn SerialOpener>, bind_host: IpAddr) -> Self {
        Self { opener, bind_host }
    }
}

impl AssetFactory for SerialAssetFactory {
    fn asset_type(&self) -> AssetType {
        AssetType::UsbSerial
    }

    fn create(
        &self,
        device: &AttachedDevice,
        id: &str,
        port_pub: u16,
        port_sub: u16,
    ) -> AssetResult<Box<dyn Asset>> {
        let asset = UsbSerialAsset::new(
            id,
            device.path.clone(),
            port_pub,
            port_sub,
            self.opener.clone(),
            self.bind_host,
        )?;
        Ok(Box::new(asset))
    }
}

pub struct CameraAssetFactory {
    backend: Arc<dyn CameraBackend>,
    bind_host: IpAddr,
}

impl CameraAssetFactory {
    pub fn new(backend: Arc<dyn CameraBackend>, bind_host: IpAddr) -> Self {
        Self { backend, bind_host }
    }
}

impl AssetFactory for CameraAssetFactory {
    fn asset_type(&self) -> AssetType {
        AssetType::Camera
    }

    fn create(
        &self,
        device: &AttachedDevice,
        id: &str,
        port_pub: u16,
        _port_sub: u16,
    ) -> AssetResult<Box<dyn Asset>> {
        let transport = self.backend.open(&device.path)?;
        Ok(Box::new(CameraAsset::new(
            id,
            port_pub,
            transport,
            self.bind_host,
        )))
    }
}

/// `(port_pub, port_sub)` of the asset at pool offset `offset`
pub fn data_ports(base: u16, offset: u16) -> (u16, u16) {
    let port_pub = base.saturating_add(offset.saturating_mul(2));
    (port_pub, port_pub.saturating_add(1))
}

pub struct DeviceWatcher {
    category: DeviceCategory,
    base: u16,
    pool: PortPool<String>,
    manager: Arc<AssetManager>,
    factory: Box<dyn AssetFactory>,
}

impl DeviceWatcher {
    pub fn new(
        category: DeviceCategory,
        offsets: RangeInclusive<u16>,
        base: u16,
        manager: Arc<AssetManager>,
        factory: Box<dyn AssetFactory>,
    ) -> Self {
        Self {
            category,
            base,
            pool: PortPool::new(category.to_string(), offsets),
            manager,
            factory,
        }
    }

    pub fn category(&self) -> DeviceCategory {
        self.category
    }

    pub fn pool(&self) -> &PortPool<String> {
        &self.pool
    }

    /// Register an asset for `device`; returns the allocated offset
    ///
    /// A repeated attach for a key that already holds an offset is refused
    /// without touching the pool or the registry.
    pub fn on_attach(&self, device: &AttachedDevice) -> AssetResult<u16> {
        if let Some(offset) = self.pool.port_of(&device.key) {
            warn!(
                "{}: duplicate attach of {} ignored (already at offset {})",
                self.category, device.key, offset
            );
            return Err(AssetError::DuplicateAsset(device.key.clone()));
        }

        let offset = self.pool.allocate(device.key.clone()).ok_or_else(|| {
            AssetError::HardwareUnavailable(format!("{}: no free port", self.category))
        })?;
        let id = offset.to_string();
        let (port_pub, port_sub) = data_ports(self.base, offset);

        let registered = self
            .factory
            .create(device, &id, port_pub, port_sub)
            .and_then(|asset| self.manager.add_asset(asset));
        if let Err(e) = registered {
            self.pool.release(&device.key);
            warn!("{}: failed to register {}: {}", self.category, device.key, e);
            return Err(e);
        }

        info!(
            "{}: attached {} ({:04x}:{:04x}) as {} id {} on ports {}/{}",
            self.category,
            device.path,
            device.vendor_id,
            device.product_id,
            self.factory.asset_type(),
            id,
            port_pub,
            port_sub
        );
        Ok(offset)
    }

    /// Remove the asset of `key`; unknown keys are a logged no-op
    pub fn on_detach(&self, key: &str) -> bool {
        let key = key.to_string();
        let Some(offset) = self.pool.port_of(&key) else {
            debug!("{}: detach of unregistered {} ignored", self.category, key);
            return false;
        };
        self.manager
            .remove_asset(&offset.to_string(), self.factory.asset_type());
        self.pool.release(&key);
        info!("{}: detached {} (offset {} released)", self.category, key, offset);
        true
    }

    /// Remove every asset this watcher created
    pub fn detach_all(&self) {
        for (key, _) in self.pool.allocations() {
            self.on_detach(&key);
        }
    }

    pub fn handle(&self, event: &DeviceEvent) {
        match event {
            DeviceEvent::Attached(device) => {
                let _ = self.on_attach(device);
            }
            DeviceEvent::Detached { key, .. } => {
                self.on_detach(key);
            }
            DeviceEvent::Shutdown => {}
        }
    }
}

/// Route device events to the watcher of their category
///
/// Runs until a [`DeviceEvent::Shutdown`] arrives or every sender is gone.
/// A panic while handling one event is logged and the loop continues.
pub fn spawn_dispatcher(
    events: async_channel::Receiver<DeviceEvent>,
    watchers: Vec<Arc<DeviceWatcher>>,
) -> std::io::Result<JoinHandle<()>> {
    let watchers: HashMap<DeviceCategory, Arc<DeviceWatcher>> = watchers
        .into_iter()
        .map(|w| (w.category(), w))
        .collect();

    thread::Builder::new()
        .name("device-dispatcher".to_string())
        .spawn(move || {
            info!("Device event dispatcher started");
            while let Ok(event) = events.recv_blocking() {
                let category = match &event {
                    DeviceEvent::Attached(device) => device.category,
                    DeviceEvent::Detached { category, .. } => *category,
                    DeviceEvent::Shutdown => break,
                };
                let Some(watcher) = watchers.get(&category) else {
                    debug!("No watcher for {} events", category);
                    continue;
                };
                if catch_unwind(AssertUnwindSafe(|| watcher.handle(&event))).is_err() {
                    error!("Panic while handling {:?}", event);
                }
            }
            info!("Device event dispatcher stopped");
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockCameraBackend, MockSerialOpener};
    use crate::manager::CatalogPublisher;
    use protocol::AssetState;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn adapter(key: &str) -> AttachedDevice {
        AttachedDevice {
            key: key.to_string(),
            category: DeviceCategory::Serial,
            path: key.to_string(),
            vendor_id: 0x1a86,
            product_id: 0x7523,
            label: None,
        }
    }

    fn serial_watcher(manager: Arc<AssetManager>, serial: MockSerialOpener) -> DeviceWatcher {
        DeviceWatcher::new(
            DeviceCategory::Serial,
            2..=4,
            31000,
            manager,
            Box::new(SerialAssetFactory::new(Arc::new(serial), LOCALHOST)),
        )
    }

    #[test]
    fn test_data_ports() {
        assert_eq!(data_ports(11000, 2), (11004, 11005));
        assert_eq!(data_ports(11000, 0), (11000, 11001));
    }

    #[test]
    fn test_attach_detach_reuses_offset() {
        let manager = Arc::new(AssetManager::new(CatalogPublisher::disabled()));
        let watcher = serial_watcher(manager.clone(), MockSerialOpener::default());

        assert_eq!(watcher.on_attach(&adapter("/dev/ttyUSB0")), Ok(2));
        assert_eq!(
            manager.asset_state("2", AssetType::UsbSerial),
            Ok(AssetState::Idle)
        );

        assert!(watcher.on_detach("/dev/ttyUSB0"));
        assert!(!manager.contains("2", AssetType::UsbSerial));
        assert_eq!(watcher.pool().free_count(), 3);

        assert_eq!(watcher.on_attach(&adapter("/dev/ttyUSB1")), Ok(2));
    }

    #[test]
    fn test_duplicate_attach_allocates_once() {
        let manager = Arc::new(AssetManager::new(CatalogPublisher::disabled()));
        let watcher = serial_watcher(manager.clone(), MockSerialOpener::default());

        watcher.on_attach(&adapter("/dev/ttyUSB0")).unwrap();
        assert!(matches!(
            watcher.on_attach(&adapter("/dev/ttyUSB0")),
            Err(AssetError::DuplicateAsset(_))
        ));
        assert_eq!(watcher.pool().allocated_count(), 1);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_unknown_detach_is_noop() {
        let manager = Arc::new(AssetManager::new(CatalogPublisher::disabled()));
        let watcher = serial_watcher(manager, MockSerialOpener::default());
        assert!(!watcher.on_detach("/dev/ttyUSB9"));
        assert_eq!(watcher.pool().free_count(), 3);
    }

    #[test]
    fn test_exhausted_pool_refuses_attach() {
        let manager = Arc::new(AssetManager::new(CatalogPublisher::disabled()));
        let watcher = serial_watcher(manager.clone(), MockSerialOpener::default());
        for n in 0..3 {
            watcher.on_attach(&adapter(&format!("/dev/ttyUSB{}", n))).unwrap();
        }
        assert!(matches!(
            watcher.on_attach(&adapter("/dev/ttyUSB3")),
            Err(AssetError::HardwareUnavailable(_))
        ));
        assert_eq!(manager.len(), 3);
    }

    #[test]
    fn test_camera_factory_opens_backend() {
        let manager = Arc::new(AssetManager::new(CatalogPublisher::disabled()));
        let camera = MockCameraBackend::default();
        let watcher = DeviceWatcher::new(
            DeviceCategory::Camera,
            2..=3,
            32000,
            manager.clone(),
            Box::new(CameraAssetFactory::new(Arc::new(camera.clone()), LOCALHOST)),
        );
        let device = AttachedDevice {
            key: "1-4".to_string(),
            category: DeviceCategory::Camera,
            path: "/dev/bus/usb/001/004".to_string(),
            vendor_id: 0x046d,
            product_id: 0x0825,
            label: None,
        };

        assert_eq!(watcher.on_attach(&device), Ok(2));
        assert!(camera.is_open("/dev/bus/usb/001/004"));
        assert!(manager.contains("2", AssetType::Camera));

        watcher.detach_all();
        assert!(!camera.is_open("/dev/bus/usb/001/004"));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_dispatcher_routes_and_stops() {
        let manager = Arc::new(AssetManager::new(CatalogPublisher::disabled()));
        let watcher = Arc::new(serial_watcher(manager.clone(), MockSerialOpener::default()));
        let (tx, rx) = super::super::event_channel();
        let handle = spawn_dispatcher(rx, vec![watcher.clone()]).unwrap();

        tx.try_send(DeviceEvent::Attached(adapter("/dev/ttyUSB0"))).unwrap();
        tx.try_send(DeviceEvent::Detached {
            category: DeviceCategory::Camera,
            key: "/dev/ttyUSB0".to_string(),
        })
        .unwrap();
        tx.try_send(DeviceEvent::Shutdown).unwrap();
        handle.join().unwrap();

        assert!(manager.contains("2", AssetType::UsbSerial));
        assert_eq!(watcher.pool().allocated_count(), 1);
    }
}
