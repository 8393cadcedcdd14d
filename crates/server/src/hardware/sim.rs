//! Simulated sensors for hosts without the real hardware
//!
//! The simulated IMU reports a device lying flat (gravity on Z) with
//! gaussian sensor noise and a slowly drifting heading. The synthetic camera
//! renders a moving YUYV test pattern.

use super::{
    CameraBackend, CameraTransport, Frame, FrameCallback, PixelFormat, SensorListener,
    SensorReading, SensorSource, Stream,
};
use crate::error::{AssetError, AssetResult};
use common::ThreadGroup;
use rand::prelude::*;
use rand::rngs::SmallRng;
use rand_distr::StandardNormal;
use std::time::Duration;
use tracing::{debug, info};

const GRAVITY: f64 = 9.80665;
const ACCEL_NOISE: f64 = 0.02;
const GYRO_NOISE: f64 = 0.002;
const MAG_NOISE: f64 = 0.3;
const YAW_DRIFT_PER_SAMPLE: f64 = 0.0005;
/// Roughly the earth's field at mid latitudes, in µT
const MAG_FIELD: [f64; 3] = [22.0, 5.0, -42.0];
const ACCEL_BIAS: [f64; 3] = [0.05, -0.03, 0.08];

/// Gaussian noise source with optional fixed seed
pub struct Noise {
    rng: SmallRng,
}

impl Noise {
    /// Seed 0 draws entropy from the OS
    pub fn new(seed: u64) -> Self {
        let rng = if seed == 0 {
            SmallRng::from_os_rng()
        } else {
            SmallRng::seed_from_u64(seed)
        };
        Self { rng }
    }

    pub fn gaussian(&mut self, stddev: f64) -> f64 {
        if stddev == 0.0 {
            return 0.0;
        }
        let n: f64 = self.rng.sample(StandardNormal);
        n * stddev
    }

    fn vec3(&mut self, base: [f64; 3], stddev: f64) -> [f64; 3] {
        [
            base[0] + self.gaussian(stddev),
            base[1] + self.gaussian(stddev),
            base[2] + self.gaussian(stddev),
        ]
    }
}

/// IMU that synthesizes readings on its own thread
pub struct SimulatedImu {
    rate_hz: u32,
    seed: u64,
    threads: Option<ThreadGroup>,
}

impl SimulatedImu {
    pub fn new(rate_hz: u32) -> Self {
        Self::with_seed(rate_hz, 0)
    }

    pub fn with_seed(rate_hz: u32, seed: u64) -> Self {
        Self {
            rate_hz: rate_hz.max(1),
            seed,
            threads: None,
        }
    }
}

impl SensorSource for SimulatedImu {
    fn register(&mut self, listener: SensorListener) -> AssetResult<()> {
        self.unregister();

        let period = Duration::from_secs_f64(1.0 / f64::from(self.rate_hz));
        let seed = self.seed;
        let mut group = ThreadGroup::new("imu-simulator");
        group
            .spawn("imu-simulator", move |token| {
                let mut noise = Noise::new(seed);
                let mut yaw: f64 = 0.0;
                while !token.wait_timeout(period) {
                    yaw += YAW_DRIFT_PER_SAMPLE;
                    let accel = noise.vec3([0.0, 0.0, GRAVITY], ACCEL_NOISE);
                    let gyro = noise.vec3([0.0, 0.0, 0.0], GYRO_NOISE);
                    let half = yaw / 2.0;

                    listener(SensorReading::LinearAcceleration(accel));
                    listener(SensorReading::AngularVelocity(gyro));
                    listener(SensorReading::RotationVector([0.0, 0.0, half.sin(), half.cos()]));
                    listener(SensorReading::RawAcceleration([
                        accel[0] + ACCEL_BIAS[0],
                        accel[1] + ACCEL_BIAS[1],
                        accel[2] + ACCEL_BIAS[2],
                    ]));
                    listener(SensorReading::RawAngularVelocity(gyro));
                    listener(SensorReading::MagneticField(noise.vec3(MAG_FIELD, MAG_NOISE)));
                }
            })
            .map_err(|e| AssetError::Internal(format!("spawn imu simulator: {}", e)))?;

        debug!("Simulated IMU running at {} Hz", self.rate_hz);
        self.threads = Some(group);
        Ok(())
    }

    fn unregister(&mut self) {
        if let Some(mut group) = self.threads.take() {
            group.shutdown();
        }
    }
}

/// Streams offered by every synthetic camera
pub fn synthetic_streams() -> Vec<Stream> {
    [(160, 120, 5), (160, 120, 15), (160, 120, 30), (320, 240, 5), (320, 240, 15)]
        .into_iter()
        .map(|(width, height, fps)| Stream {
            fps,
            width,
            height,
            pixel_format: PixelFormat::Yuyv,
        })
        .collect()
}

/// Render one YUYV frame: a vertical luma bar sweeping left to right
pub fn test_pattern(width: u32, height: u32, seq: u64) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let bar = (seq as usize * 4) % w.max(1);
    let mut data = Vec::with_capacity(w * h * 2);
    for _ in 0..h {
        for pair in 0..w / 2 {
            let x = pair * 2;
            let y = if x.abs_diff(bar) < 8 { 235 } else { 16 + (x * 200 / w.max(1)) as u8 };
            data.extend_from_slice(&[y, 128, y, 128]);
        }
    }
    data
}

/// Backend producing [`SyntheticCamera`]s for any device path
pub struct SyntheticCameraBackend;

impl CameraBackend for SyntheticCameraBackend {
    fn open(&self, path: &str) -> AssetResult<Box<dyn CameraTransport>> {
        info!("Opened synthetic camera for {}", path);
        Ok(Box::new(SyntheticCamera::new(path)))
    }
}

pub struct SyntheticCamera {
    name: String,
    closed: bool,
    threads: Option<ThreadGroup>,
}

impl SyntheticCamera {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            closed: false,
            threads: None,
        }
    }
}

impl CameraTransport for SyntheticCamera {
    fn supported_streams(&self) -> Vec<Stream> {
        synthetic_streams()
    }

    fn start_preview(
        &mut self,
        stream: &Stream,
        _quality: u8,
        mut callback: FrameCallback,
    ) -> AssetResult<()> {
        if self.closed {
            return Err(AssetError::HardwareUnavailable(format!(
                "camera {} is closed",
                self.name
            )));
        }
        if !synthetic_streams().contains(stream) {
            return Err(AssetError::HardwareUnavailable(format!(
                "camera {} does not support {}x{}@{} {}",
                self.name, stream.width, stream.height, stream.fps, stream.pixel_format
            )));
        }
        self.stop_preview();

        let stream = *stream;
        let period = Duration::from_secs_f64(1.0 / f64::from(stream.fps.max(1)));
        let mut group = ThreadGroup::new(format!("camera-{}", self.name));
        group
            .spawn(format!("camera-{}-capture", self.name), move |token| {
                let mut seq = 0u64;
                while !token.wait_timeout(period) {
                    callback(Frame {
                        width: stream.width,
                        height: stream.height,
                        pixel_format: stream.pixel_format,
                        data: test_pattern(stream.width, stream.height, seq),
                    });
                    seq += 1;
                }
            })
            .map_err(|e| AssetError::Internal(format!("spawn camera capture: {}", e)))?;
        self.threads = Some(group);
        Ok(())
    }

    fn stop_preview(&mut self) {
        if let Some(mut group) = self.threads.take() {
            group.shutdown();
        }
    }

    fn close(&mut self) {
        self.stop_preview();
        self.closed = true;
    }
}
