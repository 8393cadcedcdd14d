//! Asset abstraction
//!
//! An asset is one controllable peripheral instance. Every kind shares an
//! [`AssetCore`] (identity, state, config) and implements [`Asset`] for its
//! data plane. Lifecycle:
//!
//! ```text
//! IDLE --start()--> STREAMING --stop()--> IDLE
//!   \______________ destroy() from either state ______________/
//! ```
//!
//! `start` spawns the asset's data-plane threads; `stop` cancels and joins
//! all of them before returning, so a following `start` can rebind the same
//! ports.

pub mod camera;
pub mod config;
pub mod gnss;
pub mod imu;
pub mod serial;

pub use camera::CameraAsset;
pub use config::{AssetConfig, ConfigField, FieldDescriptor, KindConfig};
pub use gnss::GnssAsset;
pub use imu::ImuAsset;
pub use serial::UsbSerialAsset;

use crate::error::{AssetError, AssetResult};
use common::ThreadGroup;
use protocol::{AssetState, AssetType};
use serde_json::{Map, Value};
use std::fmt;
use tracing::info;

/// Registry key of an asset
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetKey {
    pub asset_type: AssetType,
    pub id: String,
}

impl AssetKey {
    pub fn new(id: impl Into<String>, asset_type: AssetType) -> Self {
        Self {
            asset_type,
            id: id.into(),
        }
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.asset_type.alias(), self.id)
    }
}

/// State shared by every asset kind
#[derive(Debug, Clone)]
pub struct AssetCore {
    key: AssetKey,
    state: AssetState,
    config: AssetConfig,
}

impl AssetCore {
    pub fn new(id: impl Into<String>, config: AssetConfig) -> Self {
        Self {
            key: AssetKey::new(id, config.asset_type()),
            state: AssetState::Idle,
            config,
        }
    }

    pub fn key(&self) -> &AssetKey {
        &self.key
    }

    /// `"{alias}-{id}"`, also the prefix of the asset's thread names
    pub fn name(&self) -> String {
        self.key.to_string()
    }

    pub fn state(&self) -> AssetState {
        self.state
    }

    pub fn config(&self) -> &AssetConfig {
        &self.config
    }

    pub fn update_config(&mut self, config: &AssetConfig) -> AssetResult<()> {
        self.config.copy_from(config)?;
        info!("Updated config of {}", self.name());
        Ok(())
    }

    pub fn ensure_idle(&self) -> AssetResult<()> {
        match self.state {
            AssetState::Idle => Ok(()),
            AssetState::Streaming => Err(AssetError::AlreadyStreaming(self.name())),
        }
    }

    pub fn ensure_streaming(&self) -> AssetResult<()> {
        match self.state {
            AssetState::Streaming => Ok(()),
            AssetState::Idle => Err(AssetError::NotStreaming(self.name())),
        }
    }

    pub fn set_state(&mut self, state: AssetState) {
        if self.state != state {
            info!("{}: {} -> {}", self.name(), self.state, state);
            self.state = state;
        }
    }

    pub fn thread_group(&self) -> ThreadGroup {
        ThreadGroup::new(self.name())
    }

    pub fn thread_name(&self, role: &str) -> String {
        format!("{}-{}", self.name(), role)
    }
}

/// One controllable peripheral
pub trait Asset: Send {
    fn core(&self) -> &AssetCore;

    fn core_mut(&mut self) -> &mut AssetCore;

    fn key(&self) -> &AssetKey {
        self.core().key()
    }

    fn id(&self) -> &str {
        &self.core().key().id
    }

    fn asset_type(&self) -> AssetType {
        self.core().key().asset_type
    }

    fn name(&self) -> String {
        self.core().name()
    }

    fn state(&self) -> AssetState {
        self.core().state()
    }

    fn config(&self) -> &AssetConfig {
        self.core().config()
    }

    /// `{"id": id}` plus `{field: range}` for every config field
    fn desc(&self) -> Map<String, Value> {
        self.config().descriptor(self.id())
    }

    /// Copy `config` into this asset; a running stream is not restarted
    fn update_config(&mut self, config: &AssetConfig) -> AssetResult<()> {
        self.core_mut().update_config(config)
    }

    /// Start streaming. Fails with `AlreadyStreaming` when not IDLE.
    fn start(&mut self) -> AssetResult<()>;

    /// Stop streaming and join every data-plane thread
    fn stop(&mut self) -> AssetResult<()>;

    /// Release hardware; safe from either state and after `stop`
    fn destroy(&mut self);

    /// Data-plane threads still running
    fn data_plane_threads(&self) -> usize;

    /// Whether adding or removing this asset republishes the catalog
    fn advertised(&self) -> bool {
        true
    }
}

impl fmt::Debug for dyn Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Asset")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

/// Stop `threads` if present; returns how many panicked
pub(crate) fn join_threads(threads: &mut Option<ThreadGroup>) -> usize {
    threads.take().map(|mut group| group.shutdown()).unwrap_or(0)
}
