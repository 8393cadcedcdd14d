//! Inertial measurement unit asset
//!
//! The sensor source pushes readings on its own thread into a shared
//! snapshot; the publisher thread samples that snapshot at the configured
//! rate. A tick without new readings re-sends the previous values.

use super::config::{AssetConfig, ImuConfig, KindConfig};
use super::{Asset, AssetCore, join_threads};
use crate::error::{AssetError, AssetResult};
use crate::hardware::{SensorReading, SensorSource};
use common::{Publisher, ThreadGroup};
use parking_lot::Mutex;
use protocol::{AssetState, ImuRecord};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_IMU_ID: &str = "in72e";

/// Latest value of every channel
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImuSnapshot {
    pub a: [f64; 3],
    pub w: [f64; 3],
    pub mu: [f64; 4],
    pub a_raw: Option<[f64; 3]>,
    pub w_raw: Option<[f64; 3]>,
    pub m: Option<[f64; 3]>,
}

impl ImuSnapshot {
    pub fn apply(&mut self, reading: SensorReading) {
        match reading {
            SensorReading::LinearAcceleration(v) => self.a = v,
            SensorReading::AngularVelocity(v) => self.w = v,
            SensorReading::RotationVector(q) => self.mu = q,
            SensorReading::RawAcceleration(v) => self.a_raw = Some(v),
            SensorReading::RawAngularVelocity(v) => self.w_raw = Some(v),
            SensorReading::MagneticField(v) => self.m = Some(v),
        }
    }

    pub fn record(&self) -> ImuRecord {
        ImuRecord {
            a: self.a,
            w: self.w,
            mu: self.mu,
            a_raw: self.a_raw,
            w_raw: self.w_raw,
            m: self.m,
        }
    }
}

pub struct ImuAsset {
    core: AssetCore,
    source: Box<dyn SensorSource>,
    bind_host: IpAddr,
    snapshot: Arc<Mutex<ImuSnapshot>>,
    threads: Option<ThreadGroup>,
}

impl ImuAsset {
    pub fn new(
        id: impl Into<String>,
        port_pub: u16,
        source: Box<dyn SensorSource>,
        bind_host: IpAddr,
    ) -> Self {
        let config = AssetConfig::new(KindConfig::Imu(ImuConfig::default()), port_pub, None);
        Self {
            core: AssetCore::new(id, config),
            source,
            bind_host,
            snapshot: Arc::new(Mutex::new(ImuSnapshot::default())),
            threads: None,
        }
    }

    pub fn snapshot(&self) -> ImuSnapshot {
        self.snapshot.lock().clone()
    }

    fn fps(&self) -> AssetResult<u32> {
        match &self.core.config().kind {
            KindConfig::Imu(c) => Ok(*c.fps.value()),
            _ => Err(AssetError::UnknownConfigType),
        }
    }
}

impl Asset for ImuAsset {
    fn core(&self) -> &AssetCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut AssetCore {
        &mut self.core
    }

    fn start(&mut self) -> AssetResult<()> {
        self.core.ensure_idle()?;
        let fps = self.fps()?.max(1);
        let port = self.core.config().port_pub;

        let mut publisher = Publisher::bind((self.bind_host, port)).map_err(|e| {
            AssetError::Transport(format!("{}: bind port {}: {}", self.core.name(), port, e))
        })?;

        let sink = self.snapshot.clone();
        self.source
            .register(Arc::new(move |reading: SensorReading| sink.lock().apply(reading)))?;

        let period = Duration::from_secs_f64(1.0 / f64::from(fps));
        let snapshot = self.snapshot.clone();
        let name = self.core.name();
        let mut group = self.core.thread_group();
        let spawned = group.spawn(self.core.thread_name("publisher"), move |token| {
            debug!("{} publishing every {:?}", name, period);
            while !token.wait_timeout(period) {
                let record = snapshot.lock().record();
                if let Err(e) = publisher.send(&record) {
                    warn!("{}: publish failed: {}", name, e);
                }
            }
        });
        if let Err(e) = spawned {
            self.source.unregister();
            return Err(AssetError::Internal(format!("spawn publisher: {}", e)));
        }

        self.threads = Some(group);
        self.core.set_state(AssetState::Streaming);
        info!("{} streaming on port {} at {} Hz", self.core.name(), port, fps);
        Ok(())
    }

    fn stop(&mut self) -> AssetResult<()> {
        self.core.ensure_streaming()?;
        self.source.unregister();
        join_threads(&mut self.threads);
        self.core.set_state(AssetState::Idle);
        Ok(())
    }

    fn destroy(&mut self) {
        if self.core.state() == AssetState::Streaming {
            let _ = self.stop();
        }
        self.source.unregister();
        *self.snapshot.lock() = ImuSnapshot::default();
    }

    fn data_plane_threads(&self) -> usize {
        self.threads.as_ref().map_or(0, ThreadGroup::live_count)
    }
}
