//! USB video-class discovery through libusb hot-plug
//!
//! Devices exposing a video interface (class 0x0E) are reported as camera
//! attach events keyed by `"{bus}-{address}"`. Departures are reported for
//! every device; the camera watcher ignores keys it never registered.

use super::{AttachedDevice, DeviceCategory, DeviceEvent, check_filter};
use crate::error::{AssetError, AssetResult};
use common::ThreadGroup;
use rusb::{Context, Device, Hotplug, HotplugBuilder, UsbContext};
use std::time::Duration;
use tracing::{debug, info, warn};

/// USB class code of video devices
pub const VIDEO_CLASS: u8 = 0x0e;

const EVENT_POLL: Duration = Duration::from_millis(100);

pub fn device_key(bus: u8, address: u8) -> String {
    format!("{}-{}", bus, address)
}

/// Describe `device` if it is a video device passing `filters`
fn describe<T: UsbContext>(device: &Device<T>, filters: &[String]) -> Option<AttachedDevice> {
    let descriptor = device.device_descriptor().ok()?;
    if !check_filter(descriptor.vendor_id(), descriptor.product_id(), filters) {
        return None;
    }

    let is_video = descriptor.class_code() == VIDEO_CLASS
        || device.active_config_descriptor().is_ok_and(|config| {
            config.interfaces().any(|interface| {
                interface
                    .descriptors()
                    .any(|alt| alt.class_code() == VIDEO_CLASS)
            })
        });
    if !is_video {
        return None;
    }

    let (bus, address) = (device.bus_number(), device.address());
    Some(AttachedDevice {
        key: device_key(bus, address),
        category: DeviceCategory::Camera,
        path: format!("/dev/bus/usb/{:03}/{:03}", bus, address),
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        label: None,
    })
}

struct CameraHotplug {
    filters: Vec<String>,
    events: async_channel::Sender<DeviceEvent>,
}

impl<T: UsbContext> Hotplug<T> for CameraHotplug {
    fn device_arrived(&mut self, device: Device<T>) {
        if let Some(camera) = describe(&device, &self.filters) {
            debug!("Hot-plug: camera arrived at {}", camera.key);
            if let Err(e) = self.events.try_send(DeviceEvent::Attached(camera)) {
                warn!("Dropping camera attach event: {}", e);
            }
        }
    }

    fn device_left(&mut self, device: Device<T>) {
        let key = device_key(device.bus_number(), device.address());
        debug!("Hot-plug: device left {}", key);
        let event = DeviceEvent::Detached {
            category: DeviceCategory::Camera,
            key,
        };
        if let Err(e) = self.events.try_send(event) {
            warn!("Dropping camera detach event: {}", e);
        }
    }
}

/// Watches the USB bus for video devices
pub struct CameraMonitor {
    context: Context,
    filters: Vec<String>,
    events: async_channel::Sender<DeviceEvent>,
}

impl CameraMonitor {
    pub fn new(
        filters: Vec<String>,
        events: async_channel::Sender<DeviceEvent>,
    ) -> AssetResult<Self> {
        if !rusb::has_hotplug() {
            return Err(AssetError::HardwareUnavailable(
                "libusb has no hot-plug support on this platform".to_string(),
            ));
        }
        let context = Context::new()
            .map_err(|e| AssetError::HardwareUnavailable(format!("libusb context: {}", e)))?;
        Ok(Self {
            context,
            filters,
            events,
        })
    }

    /// Report cameras already connected, in key order
    pub fn enumerate(&self) -> AssetResult<usize> {
        let devices = self
            .context
            .devices()
            .map_err(|e| AssetError::HardwareUnavailable(format!("list USB devices: {}", e)))?;

        let mut cameras: Vec<AttachedDevice> = devices
            .iter()
            .filter_map(|device| describe(&device, &self.filters))
            .collect();
        cameras.sort_by(|a, b| a.key.cmp(&b.key));

        let found = cameras.len();
        for camera in cameras {
            self.events
                .try_send(DeviceEvent::Attached(camera))
                .map_err(|e| AssetError::Internal(format!("device event channel: {}", e)))?;
        }
        debug!("Enumerated {} USB cameras", found);
        Ok(found)
    }

    /// Enumerate, register the hot-plug callback and pump libusb events on a
    /// thread of `group`
    pub fn spawn(self, group: &mut ThreadGroup) -> AssetResult<()> {
        self.enumerate()?;

        let callback = CameraHotplug {
            filters: self.filters.clone(),
            events: self.events.clone(),
        };
        let context = self.context;
        group
            .spawn("usb-camera-hotplug", move |token| {
                let registration = match HotplugBuilder::new()
                    .enumerate(false)
                    .register::<Context, _>(&context, Box::new(callback))
                {
                    Ok(registration) => registration,
                    Err(e) => {
                        warn!("Failed to register USB hot-plug callback: {}", e);
                        return;
                    }
                };
                info!("USB camera hot-plug monitor started");
                while !token.is_cancelled() {
                    if let Err(e) = context.handle_events(Some(EVENT_POLL)) {
                        warn!("libusb event handling failed: {}", e);
                        if token.wait_timeout(EVENT_POLL) {
                            break;
                        }
                    }
                }
                drop(registration);
                info!("USB camera hot-plug monitor stopped");
            })
            .map_err(|e| AssetError::Internal(format!("spawn hot-plug thread: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_key() {
        assert_eq!(device_key(1, 4), "1-4");
        assert_eq!(device_key(3, 112), "3-112");
    }
}
