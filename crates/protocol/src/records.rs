//! Data-plane records published by streaming assets

use serde::{Deserialize, Serialize};

/// Snapshot of the IMU channels
///
/// `a` is linear acceleration, `w` angular velocity and `mu` the orientation
/// quaternion `[x, y, z, w]`. The raw/uncalibrated channels and the magnetic
/// field are only present once the sensor has reported them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImuRecord {
    pub a: [f64; 3],
    pub w: [f64; 3],
    pub mu: [f64; 4],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub a_raw: Option<[f64; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub w_raw: Option<[f64; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub m: Option<[f64; 3]>,
}

/// Raw passthrough record, used for serial frames and NMEA sentences
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub data: String,
}

impl RawRecord {
    pub fn new(data: impl Into<String>) -> Self {
        Self { data: data.into() }
    }
}

/// One camera frame, payload base64-encoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub seq: u64,
    pub width: u32,
    pub height: u32,
    pub pixel_format: String,
    pub data: String,
}
