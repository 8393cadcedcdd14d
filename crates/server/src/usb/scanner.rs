//! USB-serial discovery by polling the serial-port list
//!
//! Each poll diffs the current list against the previous one by port name.
//! Vanished ports become detach events and new ports become attach events, in
//! port-name order.

use super::{AttachedDevice, DeviceCategory, DeviceEvent, check_filter};
use crate::error::{AssetError, AssetResult};
use common::ThreadGroup;
use serialport::SerialPortType;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Enumerates currently connected USB-serial adapters
pub trait PortLister: Send {
    fn list(&self) -> AssetResult<Vec<AttachedDevice>>;
}

/// Lists adapters through `serialport::available_ports`
pub struct SystemPortLister {
    filters: Vec<String>,
}

impl SystemPortLister {
    pub fn new(filters: Vec<String>) -> Self {
        Self { filters }
    }
}

impl PortLister for SystemPortLister {
    fn list(&self) -> AssetResult<Vec<AttachedDevice>> {
        let ports = serialport::available_ports()
            .map_err(|e| AssetError::HardwareUnavailable(format!("list serial ports: {}", e)))?;

        Ok(ports
            .into_iter()
            .filter_map(|port| match port.port_type {
                SerialPortType::UsbPort(info) if check_filter(info.vid, info.pid, &self.filters) => {
                    Some(AttachedDevice {
                        key: port.port_name.clone(),
                        category: DeviceCategory::Serial,
                        path: port.port_name,
                        vendor_id: info.vid,
                        product_id: info.pid,
                        label: info.product,
                    })
                }
                _ => None,
            })
            .collect())
    }
}

pub struct SerialScanner {
    lister: Box<dyn PortLister>,
    known: BTreeMap<String, AttachedDevice>,
    events: async_channel::Sender<DeviceEvent>,
}

impl SerialScanner {
    pub fn new(lister: Box<dyn PortLister>, events: async_channel::Sender<DeviceEvent>) -> Self {
        Self {
            lister,
            known: BTreeMap::new(),
            events,
        }
    }

    /// Diff the port list once; returns the number of events sent
    pub fn poll_once(&mut self) -> AssetResult<usize> {
        let current: BTreeMap<String, AttachedDevice> = self
            .lister
            .list()?
            .into_iter()
            .map(|device| (device.key.clone(), device))
            .collect();

        let mut events = Vec::new();
        for (key, device) in &self.known {
            // A different adapter on the same port name is a replug
            if current.get(key) != Some(device) {
                events.push(DeviceEvent::Detached {
                    category: DeviceCategory::Serial,
                    key: key.clone(),
                });
            }
        }
        for (key, device) in &current {
            if self.known.get(key) != Some(device) {
                events.push(DeviceEvent::Attached(device.clone()));
            }
        }

        let sent = events.len();
        for event in events {
            debug!("Serial scanner: {:?}", event);
            self.events
                .try_send(event)
                .map_err(|e| AssetError::Internal(format!("device event channel: {}", e)))?;
        }
        self.known = current;
        Ok(sent)
    }

    /// Run the scanner on a thread of `group`
    pub fn spawn(mut self, group: &mut ThreadGroup, interval: Duration) -> std::io::Result<()> {
        group.spawn("usb-serial-scanner", move |token| {
            info!("USB-serial scanner started ({:?} interval)", interval);
            loop {
                if let Err(e) = self.poll_once() {
                    warn!("Serial port scan failed: {}", e);
                    if self.events.is_closed() {
                        break;
                    }
                }
                if token.wait_timeout(interval) {
                    break;
                }
            }
            info!("USB-serial scanner stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockPortLister;

    fn adapter(name: &str, pid: u16) -> AttachedDevice {
        AttachedDevice {
            key: name.to_string(),
            category: DeviceCategory::Serial,
            path: name.to_string(),
            vendor_id: 0x1a86,
            product_id: pid,
            label: None,
        }
    }

    #[test]
    fn test_attach_and_detach_are_diffed() {
        let lister = MockPortLister::default();
        let (tx, rx) = async_channel::unbounded();
        let mut scanner = SerialScanner::new(Box::new(lister.clone()), tx);

        lister.set(vec![adapter("/dev/ttyUSB1", 1), adapter("/dev/ttyUSB0", 1)]);
        assert_eq!(scanner.poll_once().unwrap(), 2);
        // Sorted by port name
        assert_eq!(
            rx.try_recv().unwrap(),
            DeviceEvent::Attached(adapter("/dev/ttyUSB0", 1))
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            DeviceEvent::Attached(adapter("/dev/ttyUSB1", 1))
        );

        assert_eq!(scanner.poll_once().unwrap(), 0);

        lister.set(vec![adapter("/dev/ttyUSB1", 1)]);
        assert_eq!(scanner.poll_once().unwrap(), 1);
        assert_eq!(
            rx.try_recv().unwrap(),
            DeviceEvent::Detached {
                category: DeviceCategory::Serial,
                key: "/dev/ttyUSB0".to_string()
            }
        );
    }

    #[test]
    fn test_replug_of_different_adapter() {
        let lister = MockPortLister::default();
        let (tx, rx) = async_channel::unbounded();
        let mut scanner = SerialScanner::new(Box::new(lister.clone()), tx);

        lister.set(vec![adapter("/dev/ttyUSB0", 1)]);
        scanner.poll_once().unwrap();
        rx.try_recv().unwrap();

        lister.set(vec![adapter("/dev/ttyUSB0", 2)]);
        assert_eq!(scanner.poll_once().unwrap(), 2);
        assert!(matches!(rx.try_recv().unwrap(), DeviceEvent::Detached { .. }));
        assert!(matches!(rx.try_recv().unwrap(), DeviceEvent::Attached(_)));
    }
}
