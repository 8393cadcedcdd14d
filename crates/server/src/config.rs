//! Server configuration management

use anyhow::{Context, Result, anyhow};
use protocol::ports;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub ports: PortSettings,
    #[serde(default)]
    pub imu: ImuSettings,
    #[serde(default)]
    pub gnss: GnssSettings,
    #[serde(default)]
    pub serial: SerialSettings,
    #[serde(default)]
    pub camera: CameraSettings,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub wifi: WifiSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address every control and data-plane socket binds on
    pub bind_host: IpAddr,
    pub log_level: String,
    /// Refuse start-asset and signal requests until a controller subscribed
    pub require_subscription: bool,
    /// How long the asset-state publisher waits for subscribers before sending
    pub state_settle_ms: u64,
    /// Drop a control connection that sends nothing for this long
    pub control_idle_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::from([0, 0, 0, 0]),
            log_level: "info".to_string(),
            require_subscription: true,
            state_settle_ms: 500,
            control_idle_ms: crate::comms::DEFAULT_CONTROL_IDLE.as_millis() as u64,
        }
    }
}

impl ServerSettings {
    pub fn state_settle(&self) -> Duration {
        Duration::from_millis(self.state_settle_ms)
    }

    pub fn control_idle(&self) -> Duration {
        Duration::from_millis(self.control_idle_ms)
    }
}

/// Control ports and data-plane port bases
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortSettings {
    pub subscribe: u16,
    pub start_asset: u16,
    pub stop_asset: u16,
    pub asset_state: u16,
    pub identity: u16,
    pub signal: u16,
    pub connect_wifi: u16,
    pub imu_pub: u16,
    pub gnss_pub: u16,
    /// Hot-plugged serial asset at offset `k` publishes on `serial_base + 2k`
    pub serial_base: u16,
    pub camera_base: u16,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            subscribe: ports::SUBSCRIBE_PORT,
            start_asset: ports::START_ASSET_PORT,
            stop_asset: ports::STOP_ASSET_PORT,
            asset_state: ports::ASSET_STATE_PORT,
            identity: ports::GET_IDENTITY_PORT,
            signal: ports::SIGNAL_RPC_PORT,
            connect_wifi: ports::CONNECT_WIFI_PORT,
            imu_pub: 10010,
            gnss_pub: 10011,
            serial_base: 11000,
            camera_base: 12000,
        }
    }
}

impl PortSettings {
    pub fn control_ports(&self) -> [(&'static str, u16); 7] {
        [
            ("subscribe", self.subscribe),
            ("start_asset", self.start_asset),
            ("stop_asset", self.stop_asset),
            ("asset_state", self.asset_state),
            ("identity", self.identity),
            ("signal", self.signal),
            ("connect_wifi", self.connect_wifi),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImuSource {
    #[default]
    Simulated,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImuSettings {
    pub enabled: bool,
    pub id: String,
    pub source: ImuSource,
    /// Rate at which the source emits readings, independent of the publish rate
    pub rate_hz: u32,
}

impl Default for ImuSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            id: crate::assets::imu::DEFAULT_IMU_ID.to_string(),
            source: ImuSource::Simulated,
            rate_hz: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GnssSettings {
    pub enabled: bool,
    pub id: String,
    /// Serial device of an NMEA receiver; `~` is expanded
    pub device: Option<String>,
    pub baud: u32,
}

impl Default for GnssSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            id: crate::assets::gnss::DEFAULT_GNSS_ID.to_string(),
            device: None,
            baud: 9600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    /// VID:PID patterns such as `0x1a86:*`; empty accepts every adapter
    pub filters: Vec<String>,
    pub first_offset: u16,
    pub last_offset: u16,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 1000,
            filters: Vec::new(),
            first_offset: 2,
            last_offset: 100,
        }
    }
}

impl SerialSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraBackendKind {
    #[default]
    Synthetic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    pub enabled: bool,
    pub backend: CameraBackendKind,
    /// Offsets 0 and 1 stay reserved for built-in cameras
    pub first_offset: u16,
    pub last_offset: u16,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: CameraBackendKind::Synthetic,
            first_offset: 2,
            last_offset: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub name: String,
    pub id: String,
    /// Signal code to shell command, e.g. `"1" = "systemctl restart foo"`
    pub signals: BTreeMap<String, String>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            name: "hermes".to_string(),
            id: "hermes-0".to_string(),
            signals: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WifiSettings {
    /// Join networks through `nmcli`
    pub enabled: bool,
}

impl ServerConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![Self::default_path(), PathBuf::from("/etc/hermes/server.toml")];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: ServerConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
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

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("hermes").join("server.toml")
        } else {
            PathBuf::from(".config/hermes/server.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.server.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.server.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.server.control_idle_ms == 0 {
            return Err(anyhow!("server.control_idle_ms must be greater than 0"));
        }

        for filter in &self.serial.filters {
            Self::validate_filter(filter)?;
        }

        Self::validate_offsets("serial", self.serial.first_offset, self.serial.last_offset)?;
        Self::validate_offsets("camera", self.camera.first_offset, self.camera.last_offset)?;
        Self::validate_base("serial", self.ports.serial_base, self.serial.last_offset)?;
        Self::validate_base("camera", self.ports.camera_base, self.camera.last_offset)?;

        let mut seen = HashSet::new();
        for (name, port) in self.ports.control_ports() {
            if port == 0 {
                return Err(anyhow!("Control port '{}' must not be 0", name));
            }
            if !seen.insert(port) {
                return Err(anyhow!("Control port '{}' reuses port {}", name, port));
            }
        }

        for code in self.device.signals.keys() {
            code.parse::<i32>()
                .map_err(|_| anyhow!("Invalid signal code '{}', expected an integer", code))?;
        }

        if self.imu.id.is_empty() || self.gnss.id.is_empty() {
            return Err(anyhow!("Asset ids must not be empty"));
        }

        Ok(())
    }

    fn validate_offsets(pool: &str, first: u16, last: u16) -> Result<()> {
        if first > last {
            return Err(anyhow!(
                "Invalid {} offsets {}..={}, first must not exceed last",
                pool,
                first,
                last
            ));
        }
        Ok(())
    }

    /// The highest offset must still map to a valid `port_sub`
    fn validate_base(pool: &str, base: u16, last_offset: u16) -> Result<()> {
        let top = u32::from(base) + 2 * u32::from(last_offset) + 1;
        if top > u32::from(u16::MAX) {
            return Err(anyhow!(
                "{} port base {} leaves no room for offset {}",
                pool,
                base,
                last_offset
            ));
        }
        Ok(())
    }

    /// Validate a USB device filter pattern (VID:PID)
    fn validate_filter(filter: &str) -> Result<()> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1a86:0x7523' or '0x1a86:*')",
                filter
            ));
        }

        let (vid, pid) = (parts[0], parts[1]);

        if vid != "*" {
            Self::validate_hex_id(vid, "VID")?;
        }

        if pid != "*" {
            Self::validate_hex_id(pid, "PID")?;
        }

        Ok(())
    }

    /// Validate a hex ID (VID or PID)
    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        let Some(hex_part) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) else {
            return Err(anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                name,
                id
            ));
        };

        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;

        Ok(())
    }
}

/// Load from a user-supplied path, expanding `~`
pub fn load_config(path: &str) -> Result<ServerConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    ServerConfig::load(Some(path_buf))
}
