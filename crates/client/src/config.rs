//! Controller configuration management

use anyhow::{Context, Result, anyhow};
use protocol::ports;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Control ports of a device, defaulting to the well-known ones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPorts {
    pub subscribe: u16,
    pub start_asset: u16,
    pub stop_asset: u16,
    pub asset_state: u16,
    pub identity: u16,
    pub signal: u16,
    pub connect_wifi: u16,
}

impl Default for ControlPorts {
    fn default() -> Self {
        Self {
            subscribe: ports::SUBSCRIBE_PORT,
            start_asset: ports::START_ASSET_PORT,
            stop_asset: ports::STOP_ASSET_PORT,
            asset_state: ports::ASSET_STATE_PORT,
            identity: ports::GET_IDENTITY_PORT,
            signal: ports::SIGNAL_RPC_PORT,
            connect_wifi: ports::CONNECT_WIFI_PORT,
        }
    }
}

/// A named device the controller can talk to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    /// Display name (e.g., "rover")
    pub name: String,
    /// Host name or IP address of the device
    pub host: String,
    #[serde(default)]
    pub ports: ControlPorts,
}

impl DeviceProfile {
    /// Ad-hoc profile for a bare host
    pub fn for_host(host: &str) -> Self {
        Self {
            name: host.to_string(),
            host: host.to_string(),
            ports: ControlPorts::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub client: ClientSettings,
    #[serde(default)]
    pub devices: Vec<DeviceProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    pub log_level: String,
    /// Device used when none is given on the command line
    #[serde(default)]
    pub default_device: Option<String>,
    /// Per-request reply timeout
    #[serde(default = "ClientSettings::default_timeout_ms")]
    pub timeout_ms: u64,
}

impl ClientSettings {
    fn default_timeout_ms() -> u64 {
        3000
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client: ClientSettings {
                log_level: "warn".to_string(),
                default_device: None,
                timeout_ms: ClientSettings::default_timeout_ms(),
            },
            devices: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Pick a device by profile name or host
    ///
    /// Without a selector the configured default is used. A selector that
    /// names no profile is taken as a host with the standard ports.
    pub fn resolve_device(&self, selector: Option<&str>) -> Result<DeviceProfile> {
        let selector = selector
            .or(self.client.default_device.as_deref())
            .ok_or_else(|| anyhow!("No device given and no default_device configured"))?;

        Ok(self
            .devices
            .iter()
            .find(|d| d.name == selector)
            .cloned()
            .unwrap_or_else(|| DeviceProfile::for_host(selector)))
    }

    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![Self::default_path(), PathBuf::from("/etc/hermes/client.toml")];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: ClientConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        tracing::debug!("Config: {} device profiles", config.devices.len());
        Ok(config)
    }

    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Config: {}", e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("hermes").join("client.toml")
        } else {
            PathBuf::from(".config/hermes/client.toml")
        }
    }

    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.client.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.client.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.client.timeout_ms == 0 {
            return Err(anyhow!("timeout_ms must be greater than 0"));
        }

        for device in &self.devices {
            if device.name.is_empty() || device.host.is_empty() {
                return Err(anyhow!("Device profiles need a name and a host"));
            }
        }

        Ok(())
    }
}

pub fn load_config(path: &str) -> Result<ClientConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    ClientConfig::load(Some(path_buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.client.log_level, "warn");
        assert_eq!(config.client.timeout(), Duration::from_secs(3));
        assert!(config.devices.is_empty());
    }

    #[test]
    fn test_config_serialization() {
        let mut config = ClientConfig::default();
        config.devices.push(DeviceProfile::for_host("10.0.0.5"));
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: ClientConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.client.log_level, parsed.client.log_level);
        assert_eq!(config.devices, parsed.devices);
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = ClientConfig::default();
        assert!(config.validate().is_ok());

        config.client.log_level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_profile_with_partial_ports() {
        let config: ClientConfig = toml::from_str(
            r#"
            [client]
            log_level = "info"
            default_device = "rover"

            [[devices]]
            name = "rover"
            host = "192.168.4.1"

            [devices.ports]
            subscribe = 20000
            "#,
        )
        .unwrap();

        let rover = config.resolve_device(None).unwrap();
        assert_eq!(rover.host, "192.168.4.1");
        assert_eq!(rover.ports.subscribe, 20000);
        assert_eq!(rover.ports.start_asset, 10001);
    }

    #[test]
    fn test_unknown_selector_is_a_host() {
        let config = ClientConfig::default();
        assert!(config.resolve_device(None).is_err());

        let device = config.resolve_device(Some("bench.local")).unwrap();
        assert_eq!(device.host, "bench.local");
        assert_eq!(device.ports, ControlPorts::default());
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("client.toml");

        let mut config = ClientConfig::default();
        config.client.default_device = Some("rover".to_string());
        config.client.timeout_ms = 1500;
        let mut rover = DeviceProfile::for_host("192.168.4.1");
        rover.name = "rover".to_string();
        rover.ports.signal = 20005;
        config.devices.push(rover.clone());
        config.save(&path).unwrap();

        let loaded = load_config(path.to_str().unwrap()).unwrap();
        assert_eq!(loaded.client.timeout(), Duration::from_millis(1500));
        assert_eq!(loaded.devices, vec![rover.clone()]);
        assert_eq!(loaded.resolve_device(None).unwrap(), rover);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("client.toml");
        fs::write(
            &path,
            r#"
            [client]
            log_level = "loud"
            "#,
        )
        .unwrap();
        assert!(ClientConfig::load(Some(path.clone())).is_err());

        fs::write(&path, "[client\nlog_level = ").unwrap();
        assert!(ClientConfig::load(Some(path)).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        assert!(ClientConfig::load(Some(dir.path().join("absent.toml"))).is_err());
    }
}
