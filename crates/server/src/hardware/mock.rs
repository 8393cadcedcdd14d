//! In-memory hardware doubles
//!
//! Each double is cheaply cloneable: the service owns one clone and the test
//! keeps another to inject readings, bytes, frames and hot-plug changes.

use super::{
    CameraBackend, CameraTransport, Frame, FrameCallback, Hardware, NmeaListener, NmeaSource,
    SensorListener, SensorReading, SensorSource, SerialLink, SerialOpener, Stream,
    serial::READ_TIMEOUT, sim::synthetic_streams,
};
use crate::device::DeviceControl;
use crate::error::{AssetError, AssetResult};
use crate::usb::AttachedDevice;
use crate::usb::scanner::PortLister;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::Arc;
use std::thread;

/// Sensor source whose readings are pushed by the test
#[derive(Clone, Default)]
pub struct MockSensorSource {
    listener: Arc<Mutex<Option<SensorListener>>>,
}

impl MockSensorSource {
    /// Deliver a reading; returns false when nothing is registered
    pub fn emit(&self, reading: SensorReading) -> bool {
        let listener = self.listener.lock().clone();
        match listener {
            Some(listener) => {
                listener(reading);
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.listener.lock().is_some()
    }
}

impl SensorSource for MockSensorSource {
    fn register(&mut self, listener: SensorListener) -> AssetResult<()> {
        *self.listener.lock() = Some(listener);
        Ok(())
    }

    fn unregister(&mut self) {
        self.listener.lock().take();
    }
}

/// NMEA source whose sentences are pushed by the test
#[derive(Clone, Default)]
pub struct MockNmeaSource {
    listener: Arc<Mutex<Option<NmeaListener>>>,
}

impl MockNmeaSource {
    pub fn emit(&self, sentence: &str) -> bool {
        let listener = self.listener.lock().clone();
        match listener {
            Some(listener) => {
                listener(sentence.to_string());
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.listener.lock().is_some()
    }
}

impl NmeaSource for MockNmeaSource {
    fn register(&mut self, listener: NmeaListener) -> AssetResult<()> {
        *self.listener.lock() = Some(listener);
        Ok(())
    }

    fn unregister(&mut self) {
        self.listener.lock().take();
    }
}

#[derive(Default)]
struct SerialDeviceState {
    incoming: VecDeque<u8>,
    written: Vec<u8>,
    open: bool,
    baud: Option<u32>,
}

#[derive(Default)]
struct SerialBus {
    devices: HashMap<String, SerialDeviceState>,
    unavailable: HashSet<String>,
}

/// Serial devices backed by in-memory buffers
#[derive(Clone, Default)]
pub struct MockSerialOpener {
    bus: Arc<Mutex<SerialBus>>,
}

impl MockSerialOpener {
    /// Queue bytes for the device to "receive" from the wire
    pub fn inject(&self, path: &str, bytes: &[u8]) {
        let mut bus = self.bus.lock();
        bus.devices
            .entry(path.to_string())
            .or_default()
            .incoming
            .extend(bytes);
    }

    /// Everything written to the device so far
    pub fn written(&self, path: &str) -> Vec<u8> {
        self.bus
            .lock()
            .devices
            .get(path)
            .map(|d| d.written.clone())
            .unwrap_or_default()
    }

    pub fn is_open(&self, path: &str) -> bool {
        self.bus.lock().devices.get(path).is_some_and(|d| d.open)
    }

    pub fn baud(&self, path: &str) -> Option<u32> {
        self.bus.lock().devices.get(path).and_then(|d| d.baud)
    }

    /// Make every future open of `path` fail
    pub fn set_unavailable(&self, path: &str) {
        self.bus.lock().unavailable.insert(path.to_string());
    }
}

impl SerialOpener for MockSerialOpener {
    fn open(&self, path: &str, baud: u32) -> AssetResult<Box<dyn SerialLink>> {
        let mut bus = self.bus.lock();
        if bus.unavailable.contains(path) {
            return Err(AssetError::HardwareUnavailable(format!(
                "{}: no such device",
                path
            )));
        }
        let device = bus.devices.entry(path.to_string()).or_default();
        if device.open {
            return Err(AssetError::HardwareUnavailable(format!("{}: busy", path)));
        }
        device.open = true;
        device.baud = Some(baud);
        Ok(Box::new(MockSerialLink {
            path: path.to_string(),
            bus: self.bus.clone(),
        }))
    }
}

struct MockSerialLink {
    path: String,
    bus: Arc<Mutex<SerialBus>>,
}

impl SerialLink for MockSerialLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = {
            let mut bus = self.bus.lock();
            let device = bus.devices.entry(self.path.clone()).or_default();
            let n = buf.len().min(device.incoming.len());
            for (slot, byte) in buf.iter_mut().zip(device.incoming.drain(..n)) {
                *slot = byte;
            }
            n
        };
        if read == 0 {
            thread::sleep(READ_TIMEOUT);
        }
        Ok(read)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut bus = self.bus.lock();
        bus.devices
            .entry(self.path.clone())
            .or_default()
            .written
            .extend_from_slice(data);
        Ok(())
    }
}

impl Drop for MockSerialLink {
    fn drop(&mut self) {
        if let Some(device) = self.bus.lock().devices.get_mut(&self.path) {
            device.open = false;
        }
    }
}

#[derive(Default)]
struct CameraRig {
    previews: HashMap<String, FrameCallback>,
    opened: HashSet<String>,
}

/// Cameras whose frames are pushed by the test
#[derive(Clone, Default)]
pub struct MockCameraBackend {
    rig: Arc<Mutex<CameraRig>>,
}

impl MockCameraBackend {
    /// Deliver a frame to the preview running on `path`
    pub fn emit(&self, path: &str, frame: Frame) -> bool {
        let mut rig = self.rig.lock();
        match rig.previews.get_mut(path) {
            Some(callback) => {
                callback(frame);
                true
            }
            None => false,
        }
    }

    pub fn is_previewing(&self, path: &str) -> bool {
        self.rig.lock().previews.contains_key(path)
    }

    pub fn is_open(&self, path: &str) -> bool {
        self.rig.lock().opened.contains(path)
    }
}

impl CameraBackend for MockCameraBackend {
    fn open(&self, path: &str) -> AssetResult<Box<dyn CameraTransport>> {
        self.rig.lock().opened.insert(path.to_string());
        Ok(Box::new(MockCamera {
            path: path.to_string(),
            rig: self.rig.clone(),
        }))
    }
}

struct MockCamera {
    path: String,
    rig: Arc<Mutex<CameraRig>>,
}

impl CameraTransport for MockCamera {
    fn supported_streams(&self) -> Vec<Stream> {
        synthetic_streams()
    }

    fn start_preview(
        &mut self,
        stream: &Stream,
        _quality: u8,
        callback: FrameCallback,
    ) -> AssetResult<()> {
        if !self.supported_streams().contains(stream) {
            return Err(AssetError::HardwareUnavailable("unsupported stream".to_string()));
        }
        self.rig.lock().previews.insert(self.path.clone(), callback);
        Ok(())
    }

    fn stop_preview(&mut self) {
        self.rig.lock().previews.remove(&self.path);
    }

    fn close(&mut self) {
        let mut rig = self.rig.lock();
        rig.previews.remove(&self.path);
        rig.opened.remove(&self.path);
    }
}

/// Serial adapter list controlled by the test
#[derive(Clone, Default)]
pub struct MockPortLister {
    devices: Arc<Mutex<Vec<AttachedDevice>>>,
}

impl MockPortLister {
    pub fn set(&self, devices: Vec<AttachedDevice>) {
        *self.devices.lock() = devices;
    }
}

impl PortLister for MockPortLister {
    fn list(&self) -> AssetResult<Vec<AttachedDevice>> {
        Ok(self.devices.lock().clone())
    }
}

/// Records device-control requests instead of running them
#[derive(Clone, Default)]
pub struct MockDevice {
    signals: Arc<Mutex<Vec<i32>>>,
    unbound: Arc<Mutex<Vec<i32>>>,
    networks: Arc<Mutex<Vec<String>>>,
}

impl MockDevice {
    pub fn signals(&self) -> Vec<i32> {
        self.signals.lock().clone()
    }

    pub fn networks(&self) -> Vec<String> {
        self.networks.lock().clone()
    }

    /// Make `signal` unknown; every other code is accepted
    pub fn unbind_signal(&self, signal: i32) {
        self.unbound.lock().push(signal);
    }
}

impl DeviceControl for MockDevice {
    fn knows_signal(&self, signal: i32) -> bool {
        !self.unbound.lock().contains(&signal)
    }

    fn invoke_signal(&self, signal: i32) -> AssetResult<()> {
        if !self.knows_signal(signal) {
            return Err(AssetError::BadRequest(format!("unknown signal {}", signal)));
        }
        self.signals.lock().push(signal);
        Ok(())
    }

    fn connect_wifi(&self, ssid: &str, _password: &str) -> AssetResult<()> {
        if ssid.is_empty() {
            return Err(AssetError::BadRequest("ssid must not be empty".to_string()));
        }
        self.networks.lock().push(ssid.to_string());
        Ok(())
    }
}

/// Test-side handles to every double in a mock [`Hardware`]
#[derive(Clone, Default)]
pub struct MockRig {
    pub imu: MockSensorSource,
    pub gnss: MockNmeaSource,
    pub serial: MockSerialOpener,
    pub ports: MockPortLister,
    pub camera: MockCameraBackend,
    pub device: MockDevice,
}

impl MockRig {
    /// Hardware wired to this rig's doubles
    pub fn hardware(&self) -> Hardware {
        Hardware {
            imu: Some(Box::new(self.imu.clone())),
            gnss: Some(Box::new(self.gnss.clone())),
            serial: Arc::new(self.serial.clone()),
            serial_lister: Some(Box::new(self.ports.clone())),
            camera: Arc::new(self.camera.clone()),
            camera_hotplug: false,
            device: Arc::new(self.device.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_serial_loopback() {
        let serial = MockSerialOpener::default();
        serial.inject("/dev/ttyUSB0", b"ok\n");

        let mut link = serial.open("/dev/ttyUSB0", 9600).unwrap();
        assert!(serial.is_open("/dev/ttyUSB0"));
        assert!(serial.open("/dev/ttyUSB0", 9600).is_err());

        let mut buf = [0u8; 16];
        assert_eq!(link.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"ok\n");
        assert_eq!(link.read(&mut buf).unwrap(), 0);

        link.write_all(b"AT\n").unwrap();
        assert_eq!(serial.written("/dev/ttyUSB0"), b"AT\n");

        drop(link);
        assert!(!serial.is_open("/dev/ttyUSB0"));
    }

    #[test]
    fn test_mock_sensor_requires_registration() {
        let mut source = MockSensorSource::default();
        assert!(!source.emit(SensorReading::MagneticField([0.0; 3])));
        source.register(Arc::new(|_: SensorReading| {})).unwrap();
        assert!(source.emit(SensorReading::MagneticField([0.0; 3])));
        source.unregister();
        assert!(!source.is_registered());
    }
}
