//! USB subsystem
//!
//! Turns hot-plug activity into asset registrations:
//! - [`scanner`] polls the serial-port list for USB-serial adapters
//! - [`hotplug`] receives libusb hot-plug callbacks for video-class devices
//! - [`watcher`] maps attach/detach events onto ports and assets
//! - [`worker`] serializes open/close of one serial device
//!
//! Both event sources feed one [`DeviceEvent`] channel that a single
//! dispatcher thread drains, so attach and detach handling never race each
//! other.

pub mod hotplug;
pub mod scanner;
pub mod watcher;
pub mod worker;

pub use watcher::{AssetFactory, DeviceWatcher, spawn_dispatcher};
pub use worker::{DeviceCommand, DeviceWorkerHandle, SharedLink};

use std::fmt;

/// Hot-pluggable device category, one [`DeviceWatcher`] each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceCategory {
    Serial,
    Camera,
}

impl fmt::Display for DeviceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceCategory::Serial => f.write_str("usb-serial"),
            DeviceCategory::Camera => f.write_str("usb-camera"),
        }
    }
}

/// A physical device that just appeared
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedDevice {
    /// Stable identifier of the physical device (port name, bus-address)
    pub key: String,
    pub category: DeviceCategory,
    /// Path used to open the device
    pub path: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Attached(AttachedDevice),
    Detached { category: DeviceCategory, key: String },
    Shutdown,
}

/// Create the device event channel
pub fn event_channel() -> (
    async_channel::Sender<DeviceEvent>,
    async_channel::Receiver<DeviceEvent>,
) {
    async_channel::unbounded()
}

/// Check if a VID/PID pair is allowed by the filters
///
/// Filter format: `"0xVID:0xPID"`, either side may be `*`. No filters allow
/// every device. Filters are validated by the config loader.
pub fn check_filter(vid: u16, pid: u16, filters: &[String]) -> bool {
    if filters.is_empty() {
        return true;
    }

    let matches = |pattern: &str, value: u16| {
        pattern == "*"
            || u16::from_str_radix(pattern.trim_start_matches("0x").trim_start_matches("0X"), 16)
                .map(|v| v == value)
                .unwrap_or(false)
    };

    filters.iter().any(|filter| match filter.split_once(':') {
        Some((f_vid, f_pid)) => matches(f_vid, vid) && matches(f_pid, pid),
        None => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_logic() {
        let filters = vec![
            "0x1a86:0x7523".to_string(), // Exact match
            "0x0403:*".to_string(),      // Wildcard PID
        ];

        assert!(check_filter(0x1a86, 0x7523, &filters));
        assert!(check_filter(0x0403, 0x6001, &filters));
        assert!(check_filter(0x0403, 0x6015, &filters));

        assert!(!check_filter(0x1a86, 0x5523, &filters));
        assert!(!check_filter(0x10c4, 0x7523, &filters));

        assert!(check_filter(0x1234, 0x5678, &[]));
    }

    #[test]
    fn test_category_display() {
        assert_eq!(DeviceCategory::Serial.to_string(), "usb-serial");
        assert_eq!(DeviceCategory::Camera.to_string(), "usb-camera");
    }
}
