//! Hardware contracts consumed by the asset layer
//!
//! Assets never talk to drivers directly. Each kind of peripheral is reached
//! through one of the traits below, so the same asset code runs against a
//! real device, a simulated one or a test double from [`mock`].

pub mod mock;
pub mod serial;
pub mod sim;

use crate::config::{CameraBackendKind, ImuSource, ServerConfig};
use crate::device::{DeviceControl, HostDevice};
use crate::error::AssetResult;
use crate::usb::scanner::{PortLister, SystemPortLister};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::Arc;

/// One reading delivered by a sensor source
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorReading {
    LinearAcceleration([f64; 3]),
    AngularVelocity([f64; 3]),
    /// Orientation quaternion `[x, y, z, w]`
    RotationVector([f64; 4]),
    RawAcceleration([f64; 3]),
    RawAngularVelocity([f64; 3]),
    MagneticField([f64; 3]),
}

pub type SensorListener = Arc<dyn Fn(SensorReading) + Send + Sync>;

/// Asynchronous source of inertial readings
pub trait SensorSource: Send {
    /// Start delivering readings to `listener` on the source's own thread
    fn register(&mut self, listener: SensorListener) -> AssetResult<()>;

    /// Stop delivering readings. Must not return while the listener can
    /// still be invoked.
    fn unregister(&mut self);
}

pub type NmeaListener = Arc<dyn Fn(String) + Send + Sync>;

/// Source of NMEA sentences from a GNSS receiver
pub trait NmeaSource: Send {
    fn register(&mut self, listener: NmeaListener) -> AssetResult<()>;
    fn unregister(&mut self);
}

/// An opened byte-stream device
pub trait SerialLink: Send {
    /// Read available bytes; `Ok(0)` when the read timeout expired
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
}

/// Opens serial devices by path
pub trait SerialOpener: Send + Sync {
    fn open(&self, path: &str, baud: u32) -> AssetResult<Box<dyn SerialLink>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Mjpeg,
    Yuyv,
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelFormat::Mjpeg => f.write_str("mjpeg"),
            PixelFormat::Yuyv => f.write_str("yuyv"),
        }
    }
}

/// A camera stream format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stream {
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
}

impl Default for Stream {
    fn default() -> Self {
        Self {
            fps: 30,
            width: 640,
            height: 480,
            pixel_format: PixelFormat::Mjpeg,
        }
    }
}

/// One captured frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub data: Vec<u8>,
}

/// Called on the camera's own thread for every frame; must not block
pub type FrameCallback = Box<dyn FnMut(Frame) + Send>;

/// An opened camera
pub trait CameraTransport: Send {
    fn supported_streams(&self) -> Vec<Stream>;

    fn start_preview(
        &mut self,
        stream: &Stream,
        quality: u8,
        callback: FrameCallback,
    ) -> AssetResult<()>;

    /// Stop delivering frames. No callback runs after this returns.
    fn stop_preview(&mut self);

    fn close(&mut self);
}

/// Opens cameras by device path
pub trait CameraBackend: Send + Sync {
    fn open(&self, path: &str) -> AssetResult<Box<dyn CameraTransport>>;
}

/// Every hardware collaborator the service needs
pub struct Hardware {
    /// Built-in IMU, if the host has one
    pub imu: Option<Box<dyn SensorSource>>,
    /// GNSS receiver, if configured
    pub gnss: Option<Box<dyn NmeaSource>>,
    pub serial: Arc<dyn SerialOpener>,
    /// Enumerates USB-serial adapters; `None` disables the scanner
    pub serial_lister: Option<Box<dyn PortLister>>,
    pub camera: Arc<dyn CameraBackend>,
    /// Watch for USB video devices through libusb hot-plug
    pub camera_hotplug: bool,
    pub device: Arc<dyn DeviceControl>,
}

impl Hardware {
    /// Build the real collaborators selected by the configuration
    pub fn from_config(config: &ServerConfig) -> Self {
        let imu: Option<Box<dyn SensorSource>> = match config.imu.source {
            ImuSource::Simulated => Some(Box::new(sim::SimulatedImu::new(config.imu.rate_hz))),
            ImuSource::None => None,
        };

        let gnss = config.gnss.device.as_ref().map(|path| {
            let path = shellexpand::tilde(path).into_owned();
            Box::new(serial::SerialNmeaSource::new(path, config.gnss.baud)) as Box<dyn NmeaSource>
        });

        let camera: Arc<dyn CameraBackend> = match config.camera.backend {
            CameraBackendKind::Synthetic => Arc::new(sim::SyntheticCameraBackend),
        };

        Self {
            imu,
            gnss,
            serial: Arc::new(serial::SystemSerial),
            serial_lister: Some(Box::new(SystemPortLister::new(config.serial.filters.clone()))),
            camera,
            camera_hotplug: true,
            device: Arc::new(HostDevice::from_config(config)),
        }
    }
}
