//! Control-plane request and reply shapes
//!
//! Every control socket answers with exactly one reply per request. Most
//! replies use [`StandardResponse`]; get-identity extends it with the
//! device identity.

use crate::AssetType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key for the publish port inside a start request's `config` object
pub const CONFIG_PORT_PUB: &str = "port_pub";
/// Key for the subscribe port inside a start request's `config` object
pub const CONFIG_PORT_SUB: &str = "port_sub";
/// Key for the connected controller address inside a start request's `config` object
pub const CONFIG_IP: &str = "ip";

/// Standard `{"success": bool, "message": string?}` reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandardResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StandardResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

/// Controller session request sent to the subscribe port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub subscribe: bool,
}

/// Start an asset, optionally reconfiguring it first
///
/// `config` maps field names (as advertised in the catalog) to the chosen
/// value, plus the optional `port_pub`, `port_sub` and `ip` keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartAssetRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub asset_type: AssetType,
    #[serde(default)]
    pub config: Map<String, Value>,
}

/// Stop a streaming asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopAssetRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub asset_type: AssetType,
}

/// Invoke a device-side signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalRequest {
    pub signal: i32,
}

/// Join a wifi network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectWifiRequest {
    pub ssid: String,
    #[serde(default)]
    pub password: String,
}

/// Identity advertised on the get-identity port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub id: String,
    pub version: String,
    /// Port on which the asset catalog is published
    pub state_port: u16,
}

/// Reply of the get-identity port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_response_shape() {
        let ok = serde_json::to_string(&StandardResponse::ok()).unwrap();
        assert_eq!(ok, r#"{"success":true}"#);

        let failed = serde_json::to_string(&StandardResponse::failure("boom")).unwrap();
        assert_eq!(failed, r#"{"success":false,"message":"boom"}"#);
    }

    #[test]
    fn test_start_request_without_config() {
        let req: StartAssetRequest =
            serde_json::from_str(r#"{"id":"in72e","type":"imu"}"#).unwrap();
        assert_eq!(req.id, "in72e");
        assert_eq!(req.asset_type, AssetType::Imu);
        assert!(req.config.is_empty());
    }

    #[test]
    fn test_start_request_with_config() {
        let req: StartAssetRequest = serde_json::from_str(
            r#"{"id":"2","type":"usb_serial","config":{"baud":9600,"port_pub":11004}}"#,
        )
        .unwrap();
        assert_eq!(req.asset_type, AssetType::UsbSerial);
        assert_eq!(req.config.get("baud"), Some(&Value::from(9600)));
        assert_eq!(req.config.get(CONFIG_PORT_PUB), Some(&Value::from(11004)));
    }

    #[test]
    fn test_subscribe_request_shape() {
        let req: SubscribeRequest = serde_json::from_str(r#"{"subscribe":true}"#).unwrap();
        assert!(req.subscribe);
        assert!(serde_json::from_str::<SubscribeRequest>(r#"{}"#).is_err());
    }
}
