//! Service context
//!
//! [`HermesService`] is built once at start-up and owns every long-lived
//! component: the asset registry, the hot-plug watchers and their event
//! sources, the dispatcher and the control plane. Nothing is global;
//! components receive what they need through their constructors.

use crate::assets::{GnssAsset, ImuAsset};
use crate::comms::{ControlContext, Session, SocketManager, standard_bindings};
use crate::config::ServerConfig;
use crate::hardware::Hardware;
use crate::manager::{AssetManager, CatalogPublisher};
use crate::usb::hotplug::CameraMonitor;
use crate::usb::scanner::SerialScanner;
use crate::usb::watcher::{CameraAssetFactory, SerialAssetFactory};
use crate::usb::{DeviceCategory, DeviceEvent, DeviceWatcher, event_channel, spawn_dispatcher};
use anyhow::{Context, Result};
use common::ThreadGroup;
use protocol::Identity;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, info, warn};

pub struct HermesService {
    manager: Arc<AssetManager>,
    session: Arc<Session>,
    watchers: Vec<Arc<DeviceWatcher>>,
    events: async_channel::Sender<DeviceEvent>,
    monitors: ThreadGroup,
    dispatcher: Option<JoinHandle<()>>,
    sockets: Option<SocketManager>,
}

impl HermesService {
    /// Register built-in assets, start hot-plug handling and the control plane
    pub fn start(config: &ServerConfig, hardware: Hardware) -> Result<Self> {
        let bind_host = config.server.bind_host;
        let ports = &config.ports;

        let catalog = CatalogPublisher::new(
            SocketAddr::new(bind_host, ports.asset_state),
            config.server.state_settle(),
        );
        let manager = Arc::new(AssetManager::new(catalog));
        let session = Arc::new(Session::new(config.server.require_subscription));

        let Hardware {
            imu,
            gnss,
            serial,
            serial_lister,
            camera,
            camera_hotplug,
            device,
        } = hardware;

        if let (true, Some(source)) = (config.imu.enabled, imu) {
            manager.add_asset(Box::new(ImuAsset::new(
                config.imu.id.clone(),
                ports.imu_pub,
                source,
                bind_host,
            )))?;
        }
        if let (true, Some(source)) = (config.gnss.enabled, gnss) {
            manager.add_asset(Box::new(GnssAsset::new(
                config.gnss.id.clone(),
                ports.gnss_pub,
                source,
                bind_host,
            )))?;
        }

        let (events, receiver) = event_channel();
        let mut watchers = Vec::new();
        if config.serial.enabled {
            watchers.push(Arc::new(DeviceWatcher::new(
                DeviceCategory::Serial,
                config.serial.first_offset..=config.serial.last_offset,
                ports.serial_base,
                manager.clone(),
                Box::new(SerialAssetFactory::new(serial, bind_host)),
            )));
        }
        if config.camera.enabled {
            watchers.push(Arc::new(DeviceWatcher::new(
                DeviceCategory::Camera,
                config.camera.first_offset..=config.camera.last_offset,
                ports.camera_base,
                manager.clone(),
                Box::new(CameraAssetFactory::new(camera, bind_host)),
            )));
        }
        let dispatcher = spawn_dispatcher(receiver, watchers.clone())
            .context("Failed to spawn device dispatcher")?;

        let mut service = Self {
            manager: manager.clone(),
            session: session.clone(),
            watchers,
            events: events.clone(),
            monitors: ThreadGroup::new("usb-monitors"),
            dispatcher: Some(dispatcher),
            sockets: None,
        };

        if config.serial.enabled {
            if let Some(lister) = serial_lister {
                SerialScanner::new(lister, events.clone())
                    .spawn(&mut service.monitors, config.serial.poll_interval())
                    .context("Failed to spawn USB-serial scanner")?;
            }
        }
        if config.camera.enabled && camera_hotplug {
            let monitor = CameraMonitor::new(Vec::new(), events.clone())
                .and_then(|monitor| monitor.spawn(&mut service.monitors));
            if let Err(e) = monitor {
                warn!("USB camera hot-plug disabled: {}", e);
            }
        }

        let ctx = Arc::new(ControlContext {
            manager,
            session,
            device,
            identity: Identity {
                name: config.device.name.clone(),
                id: config.device.id.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                state_port: ports.asset_state,
            },
        });
        let sockets = SocketManager::start(
            bind_host,
            config.server.control_idle(),
            standard_bindings(ctx, ports),
        )
        .context("Failed to start control plane");
        match sockets {
            Ok(sockets) => service.sockets = Some(sockets),
            Err(e) => {
                service.shutdown();
                return Err(e);
            }
        }

        info!(
            "Service started with {} assets on {}",
            service.manager.len(),
            bind_host
        );
        Ok(service)
    }

    pub fn manager(&self) -> &Arc<AssetManager> {
        &self.manager
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Inject a device event as if a hot-plug source had reported it
    pub fn events(&self) -> &async_channel::Sender<DeviceEvent> {
        &self.events
    }

    pub fn watcher(&self, category: DeviceCategory) -> Option<&Arc<DeviceWatcher>> {
        self.watchers.iter().find(|w| w.category() == category)
    }

    /// Address of a control loop by operation name
    pub fn control_addr(&self, name: &str) -> Option<SocketAddr> {
        self.sockets.as_ref()?.local_addr(name)
    }

    /// Stop event sources, the dispatcher, the control plane, then every asset
    pub fn shutdown(&mut self) {
        let panicked = self.monitors.shutdown();
        if panicked > 0 {
            error!("{} hot-plug monitors panicked", panicked);
        }

        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = self.events.try_send(DeviceEvent::Shutdown);
            if dispatcher.join().is_err() {
                error!("Device dispatcher panicked");
            }
        }

        if let Some(mut sockets) = self.sockets.take() {
            sockets.shutdown();
        }

        for watcher in &self.watchers {
            watcher.detach_all();
        }
        self.manager.shutdown();
        info!("Service stopped");
    }
}

impl Drop for HermesService {
    fn drop(&mut self) {
        if self.dispatcher.is_some() || self.sockets.is_some() {
            self.shutdown();
        }
    }
}
