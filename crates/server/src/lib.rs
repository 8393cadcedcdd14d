//! hermes device service
//!
//! Exposes a device's onboard and hot-plugged peripherals as independently
//! controllable assets. Each asset streams on its own data-plane port; a
//! remote controller drives them through six fixed control ports.

pub mod assets;
pub mod comms;
pub mod config;
pub mod device;
pub mod error;
pub mod hardware;
pub mod manager;
pub mod ports;
pub mod service;
pub mod usb;

pub use error::{AssetError, AssetResult};
pub use manager::{AssetManager, CatalogPublisher};
pub use service::HermesService;
