//! Host device control: signals and Wi-Fi

use crate::config::ServerConfig;
use crate::error::{AssetError, AssetResult};
use std::collections::BTreeMap;
use std::process::Command;
use tracing::{info, warn};

/// Device-level operations reachable from the control plane
pub trait DeviceControl: Send + Sync {
    /// Whether `signal` is bound to an action; must not block
    fn knows_signal(&self, signal: i32) -> bool;

    /// Run the action bound to `signal`
    fn invoke_signal(&self, signal: i32) -> AssetResult<()>;

    /// Join a Wi-Fi network
    fn connect_wifi(&self, ssid: &str, password: &str) -> AssetResult<()>;
}

/// [`DeviceControl`] for a Linux host
///
/// Signals map to commands from the `[device.signals]` table. Wi-Fi goes
/// through NetworkManager's `nmcli` when enabled.
pub struct HostDevice {
    signals: BTreeMap<i32, Vec<String>>,
    wifi_enabled: bool,
}

impl HostDevice {
    pub fn new(signals: BTreeMap<i32, Vec<String>>, wifi_enabled: bool) -> Self {
        Self {
            signals,
            wifi_enabled,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        let signals = config
            .device
            .signals
            .iter()
            .filter_map(|(code, command)| {
                let code = code.parse::<i32>().ok()?;
                let argv: Vec<String> = command.split_whitespace().map(str::to_string).collect();
                (!argv.is_empty()).then_some((code, argv))
            })
            .collect();
        Self::new(signals, config.wifi.enabled)
    }

    fn run(argv: &[String]) -> AssetResult<()> {
        let Some((program, args)) = argv.split_first() else {
            return Err(AssetError::InvalidConfig("empty command".to_string()));
        };
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| AssetError::HardwareUnavailable(format!("{}: {}", program, e)))?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(AssetError::HardwareUnavailable(format!(
                "{} failed ({}): {}",
                program,
                output.status,
                stderr.trim()
            )))
        }
    }
}

impl DeviceControl for HostDevice {
    fn knows_signal(&self, signal: i32) -> bool {
        self.signals.contains_key(&signal)
    }

    fn invoke_signal(&self, signal: i32) -> AssetResult<()> {
        let argv = self
            .signals
            .get(&signal)
            .ok_or_else(|| AssetError::BadRequest(format!("unknown signal {}", signal)))?;
        info!("Invoking signal {}: {}", signal, argv.join(" "));
        Self::run(argv)
    }

    fn connect_wifi(&self, ssid: &str, password: &str) -> AssetResult<()> {
        if !self.wifi_enabled {
            return Err(AssetError::HardwareUnavailable(
                "wifi control is disabled".to_string(),
            ));
        }
        if ssid.is_empty() {
            return Err(AssetError::BadRequest("ssid must not be empty".to_string()));
        }

        let mut argv: Vec<String> = ["nmcli", "device", "wifi", "connect", ssid]
            .into_iter()
            .map(str::to_string)
            .collect();
        if !password.is_empty() {
            argv.push("password".to_string());
            argv.push(password.to_string());
        }
        info!("Connecting to wifi network {}", ssid);
        Self::run(&argv).inspect_err(|e| warn!("Wifi connect to {} failed: {}", ssid, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_signal_is_rejected() {
        let device = HostDevice::new(BTreeMap::new(), false);
        assert!(!device.knows_signal(3));
        assert!(matches!(
            device.invoke_signal(3),
            Err(AssetError::BadRequest(_))
        ));
    }

    #[test]
    fn test_signal_runs_command() {
        let mut signals = BTreeMap::new();
        signals.insert(1, vec!["true".to_string()]);
        signals.insert(2, vec!["false".to_string()]);
        let device = HostDevice::new(signals, false);

        assert!(device.knows_signal(1));
        assert!(device.invoke_signal(1).is_ok());
        assert!(matches!(
            device.invoke_signal(2),
            Err(AssetError::HardwareUnavailable(_))
        ));
    }

    #[test]
    fn test_wifi_disabled() {
        let device = HostDevice::new(BTreeMap::new(), false);
        assert!(matches!(
            device.connect_wifi("lab", "secret"),
            Err(AssetError::HardwareUnavailable(_))
        ));
    }
}
