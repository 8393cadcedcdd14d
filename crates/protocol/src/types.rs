//! Asset type definitions shared by the device and its controllers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of a controllable peripheral
///
/// Every variant has a stable alias that is used in wire messages, in the
/// asset catalog and in asset/thread names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum AssetType {
    Imu,
    Gnss,
    UsbSerial,
    Camera,
    ClassicBt,
    Ble,
    Speaker,
    Mic,
    Phone,
    Unknown,
}

impl AssetType {
    /// All asset types in catalog order
    pub const ALL: [AssetType; 10] = [
        AssetType::Imu,
        AssetType::Gnss,
        AssetType::UsbSerial,
        AssetType::Camera,
        AssetType::ClassicBt,
        AssetType::Ble,
        AssetType::Speaker,
        AssetType::Mic,
        AssetType::Phone,
        AssetType::Unknown,
    ];

    /// Wire alias of this type
    pub fn alias(self) -> &'static str {
        match self {
            AssetType::Imu => "imu",
            AssetType::Gnss => "gnss",
            AssetType::UsbSerial => "usb_serial",
            AssetType::Camera => "cam",
            AssetType::ClassicBt => "classic_bt",
            AssetType::Ble => "ble",
            AssetType::Speaker => "speaker",
            AssetType::Mic => "mic",
            AssetType::Phone => "phone",
            AssetType::Unknown => "unknown",
        }
    }

    /// Resolve an alias; anything unrecognised maps to [`AssetType::Unknown`]
    pub fn from_alias(alias: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|t| t.alias() == alias)
            .unwrap_or(AssetType::Unknown)
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.alias())
    }
}

impl From<AssetType> for String {
    fn from(value: AssetType) -> Self {
        value.alias().to_string()
    }
}

impl From<String> for AssetType {
    fn from(value: String) -> Self {
        AssetType::from_alias(&value)
    }
}

/// Lifecycle state of an asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetState {
    /// Initial state, and the state after every stop
    #[default]
    Idle,
    /// Data-plane threads are running
    Streaming,
}

impl fmt::Display for AssetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetState::Idle => f.write_str("idle"),
            AssetState::Streaming => f.write_str("streaming"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_lookup() {
        for asset_type in AssetType::ALL {
            assert_eq!(AssetType::from_alias(asset_type.alias()), asset_type);
        }
        assert_eq!(AssetType::from_alias("lidar"), AssetType::Unknown);
        assert_eq!(AssetType::from_alias(""), AssetType::Unknown);
    }

    #[test]
    fn test_asset_type_serializes_as_alias() {
        let json = serde_json::to_string(&AssetType::UsbSerial).unwrap();
        assert_eq!(json, "\"usb_serial\"");

        let parsed: AssetType = serde_json::from_str("\"cam\"").unwrap();
        assert_eq!(parsed, AssetType::Camera);

        let unknown: AssetType = serde_json::from_str("\"toaster\"").unwrap();
        assert_eq!(unknown, AssetType::Unknown);
    }

    #[test]
    fn test_state_default_is_idle() {
        assert_eq!(AssetState::default(), AssetState::Idle);
        assert_eq!(AssetState::Streaming.to_string(), "streaming");
    }
}
