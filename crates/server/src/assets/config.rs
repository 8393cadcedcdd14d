//! Typed, range-checked asset configuration
//!
//! An [`AssetConfig`] is a fixed, ordered list of [`ConfigField`]s for one
//! asset kind plus the asset's data-plane ports. Field values must belong to
//! the field's range whenever the range is non-empty; updates that break this
//! are rejected before anything is copied.

use crate::error::{AssetError, AssetResult};
use crate::hardware::Stream;
use protocol::{AssetType, CONFIG_IP, CONFIG_PORT_PUB, CONFIG_PORT_SUB};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fmt::Debug;
use std::net::IpAddr;

pub const FPS_RANGE: [u32; 13] = [1, 2, 5, 10, 15, 25, 30, 60, 75, 100, 125, 150, 200];
pub const DEFAULT_FPS: u32 = 15;

pub const BAUD_RANGE: [u32; 13] = [
    300, 600, 1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200, 230400, 460800, 921600,
];
pub const DEFAULT_BAUD: u32 = 115200;

pub const DELIMITER_RANGE: [&str; 5] = ["\n", ",", ";", "\r", "\t"];
pub const DEFAULT_DELIMITER: &str = "\n";

pub const QUALITY_RANGE: [u8; 9] = [10, 25, 50, 75, 80, 85, 90, 95, 100];
pub const DEFAULT_QUALITY: u8 = 90;

/// A named configuration value with its allowed choices
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigField<T> {
    name: &'static str,
    value: T,
    range: Vec<T>,
}

impl<T: Clone + PartialEq + Debug> ConfigField<T> {
    pub fn new(name: &'static str, value: T, range: Vec<T>) -> Self {
        Self { name, value, range }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn range(&self) -> &[T] {
        &self.range
    }

    /// An empty range allows any value
    pub fn allows(&self, value: &T) -> bool {
        self.range.is_empty() || self.range.contains(value)
    }

    pub fn set(&mut self, value: T) -> AssetResult<()> {
        if !self.allows(&value) {
            return Err(AssetError::InvalidConfig(format!(
                "{:?} is not a valid value for {}",
                value, self.name
            )));
        }
        self.value = value;
        Ok(())
    }
}

/// Type-erased view of a [`ConfigField`] used for descriptors and wire updates
pub trait FieldDescriptor {
    fn name(&self) -> &'static str;

    /// Allowed values as advertised in the asset descriptor
    fn range_json(&self) -> Value;

    fn value_json(&self) -> Value;

    /// Whether `value` decodes to an allowed value of this field
    fn accepts(&self, value: &Value) -> bool;

    fn set_json(&mut self, value: &Value) -> AssetResult<()>;
}

impl<T> ConfigField<T>
where
    T: Serialize + DeserializeOwned + Clone + PartialEq + Debug,
{
    fn decode(&self, value: &Value) -> AssetResult<T> {
        serde_json::from_value(value.clone()).map_err(|e| {
            AssetError::InvalidConfig(format!("bad value for {}: {}", self.name, e))
        })
    }
}

impl<T> FieldDescriptor for ConfigField<T>
where
    T: Serialize + DeserializeOwned + Clone + PartialEq + Debug,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn range_json(&self) -> Value {
        serde_json::to_value(&self.range).unwrap_or(Value::Array(Vec::new()))
    }

    fn value_json(&self) -> Value {
        serde_json::to_value(&self.value).unwrap_or(Value::Null)
    }

    fn accepts(&self, value: &Value) -> bool {
        self.decode(value).is_ok_and(|v| self.allows(&v))
    }

    fn set_json(&mut self, value: &Value) -> AssetResult<()> {
        let decoded = self.decode(value)?;
        self.set(decoded)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImuConfig {
    pub fps: ConfigField<u32>,
}

impl Default for ImuConfig {
    fn default() -> Self {
        Self {
            fps: ConfigField::new("fps", DEFAULT_FPS, FPS_RANGE.to_vec()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GnssConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct UsbSerialConfig {
    pub baud: ConfigField<u32>,
    pub delimiter: ConfigField<String>,
}

impl UsbSerialConfig {
    /// The delimiter as the single byte the frame splitter scans for
    pub fn delimiter_byte(&self) -> u8 {
        self.delimiter.value().bytes().next().unwrap_or(b'\n')
    }
}

impl Default for UsbSerialConfig {
    fn default() -> Self {
        Self {
            baud: ConfigField::new("baud", DEFAULT_BAUD, BAUD_RANGE.to_vec()),
            delimiter: ConfigField::new(
                "delimiter",
                DEFAULT_DELIMITER.to_string(),
                DELIMITER_RANGE.iter().map(|d| d.to_string()).collect(),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CameraConfig {
    pub stream: ConfigField<Stream>,
    pub compression_quality: ConfigField<u8>,
}

impl CameraConfig {
    /// Config for a camera reporting `streams`; the first one is the default
    pub fn new(streams: Vec<Stream>) -> Self {
        let default = streams.first().copied().unwrap_or_default();
        Self {
            stream: ConfigField::new("stream", default, streams),
            compression_quality: ConfigField::new(
                "compression_quality",
                DEFAULT_QUALITY,
                QUALITY_RANGE.to_vec(),
            ),
        }
    }
}

/// Per-kind fields of an [`AssetConfig`]
#[derive(Debug, Clone, PartialEq)]
pub enum KindConfig {
    Imu(ImuConfig),
    Gnss(GnssConfig),
    UsbSerial(UsbSerialConfig),
    Camera(CameraConfig),
}

impl KindConfig {
    pub fn asset_type(&self) -> AssetType {
        match self {
            KindConfig::Imu(_) => AssetType::Imu,
            KindConfig::Gnss(_) => AssetType::Gnss,
            KindConfig::UsbSerial(_) => AssetType::UsbSerial,
            KindConfig::Camera(_) => AssetType::Camera,
        }
    }

    /// Fields in canonical order
    pub fn fields(&self) -> Vec<&dyn FieldDescriptor> {
        match self {
            KindConfig::Imu(c) => vec![&c.fps as &dyn FieldDescriptor],
            KindConfig::Gnss(_) => Vec::new(),
            KindConfig::UsbSerial(c) => vec![&c.baud as &dyn FieldDescriptor, &c.delimiter],
            KindConfig::Camera(c) => vec![&c.stream as &dyn FieldDescriptor, &c.compression_quality],
        }
    }

    pub fn fields_mut(&mut self) -> Vec<&mut dyn FieldDescriptor> {
        match self {
            KindConfig::Imu(c) => vec![&mut c.fps as &mut dyn FieldDescriptor],
            KindConfig::Gnss(_) => Vec::new(),
            KindConfig::UsbSerial(c) => {
                vec![&mut c.baud as &mut dyn FieldDescriptor, &mut c.delimiter]
            }
            KindConfig::Camera(c) => vec![
                &mut c.stream as &mut dyn FieldDescriptor,
                &mut c.compression_quality,
            ],
        }
    }
}

/// Full configuration of one asset
#[derive(Debug, Clone, PartialEq)]
pub struct AssetConfig {
    /// Device-to-controller port
    pub port_pub: u16,
    /// Controller-to-device port of bidirectional assets
    pub port_sub: Option<u16>,
    /// Controller to connect to instead of binding `port_sub`
    pub connected_device_ip: Option<IpAddr>,
    pub kind: KindConfig,
}

impl AssetConfig {
    pub fn new(kind: KindConfig, port_pub: u16, port_sub: Option<u16>) -> Self {
        Self {
            port_pub,
            port_sub,
            connected_device_ip: None,
            kind,
        }
    }

    pub fn asset_type(&self) -> AssetType {
        self.kind.asset_type()
    }

    pub fn fields(&self) -> Vec<&dyn FieldDescriptor> {
        self.kind.fields()
    }

    /// `{"id": id}` plus `{field: range}` for every field
    pub fn descriptor(&self, id: &str) -> Map<String, Value> {
        let mut desc = Map::new();
        desc.insert("id".to_string(), Value::String(id.to_string()));
        for field in self.fields() {
            desc.insert(field.name().to_string(), field.range_json());
        }
        desc
    }

    /// Current field values keyed by name
    pub fn values(&self) -> Map<String, Value> {
        self.fields()
            .into_iter()
            .map(|f| (f.name().to_string(), f.value_json()))
            .collect()
    }

    /// Copy every field value and the ports of `other` into `self`
    ///
    /// Ranges stay as they are: `other`'s values are checked against this
    /// config's ranges, and nothing is copied unless all of them pass.
    pub fn copy_from(&mut self, other: &AssetConfig) -> AssetResult<()> {
        if other.asset_type() != self.asset_type() {
            return Err(AssetError::UnknownConfigType);
        }

        let incoming: Vec<(&'static str, Value)> = other
            .fields()
            .into_iter()
            .map(|f| (f.name(), f.value_json()))
            .collect();
        for (field, (name, value)) in self.fields().into_iter().zip(&incoming) {
            if !field.accepts(value) {
                return Err(AssetError::InvalidConfig(format!(
                    "{} is not a valid value for {}",
                    value, name
                )));
            }
        }

        for (field, (_, value)) in self.kind.fields_mut().into_iter().zip(&incoming) {
            field.set_json(value)?;
        }
        self.port_pub = other.port_pub;
        self.port_sub = other.port_sub;
        self.connected_device_ip = other.connected_device_ip;
        Ok(())
    }

    /// Apply wire overrides (`{"fps": 30, "port_pub": 10010, "ip": ...}`)
    ///
    /// Unknown keys and out-of-range values are errors. The config may be
    /// partially modified on error, so callers apply overrides to a copy.
    pub fn apply_overrides(&mut self, overrides: &Map<String, Value>) -> AssetResult<()> {
        for (key, value) in overrides {
            match key.as_str() {
                CONFIG_PORT_PUB => self.port_pub = parse_port(key, value)?,
                CONFIG_PORT_SUB => self.port_sub = Some(parse_port(key, value)?),
                CONFIG_IP => self.connected_device_ip = parse_ip(value)?,
                name => {
                    let field = self
                        .kind
                        .fields_mut()
                        .into_iter()
                        .find(|f| f.name() == name)
                        .ok_or_else(|| {
                            AssetError::InvalidConfig(format!("unknown field '{}'", name))
                        })?;
                    field.set_json(value)?;
                }
            }
        }
        Ok(())
    }
}

fn parse_port(key: &str, value: &Value) -> AssetResult<u16> {
    value
        .as_u64()
        .and_then(|p| u16::try_from(p).ok())
        .filter(|p| *p != 0)
        .ok_or_else(|| AssetError::InvalidConfig(format!("{} must be a port number", key)))
}

fn parse_ip(value: &Value) -> AssetResult<Option<IpAddr>> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) if s.is_empty() => Ok(None),
        Value::String(s) => s
            .parse()
            .map(Some)
            .map_err(|_| AssetError::InvalidConfig(format!("'{}' is not an IP address", s))),
        _ => Err(AssetError::InvalidConfig(
            "ip must be a string".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::sim::synthetic_streams;
    use serde_json::json;

    fn imu_config() -> AssetConfig {
        AssetConfig::new(KindConfig::Imu(ImuConfig::default()), 10010, None)
    }

    fn serial_config() -> AssetConfig {
        AssetConfig::new(
            KindConfig::UsbSerial(UsbSerialConfig::default()),
            11004,
            Some(11005),
        )
    }

    #[test]
    fn test_imu_descriptor() {
        let desc = imu_config().descriptor("in72e");
        assert_eq!(
            Value::Object(desc),
            json!({"id": "in72e", "fps": [1, 2, 5, 10, 15, 25, 30, 60, 75, 100, 125, 150, 200]})
        );
    }

    #[test]
    fn test_gnss_descriptor_is_id_only() {
        let config = AssetConfig::new(KindConfig::Gnss(GnssConfig), 10011, None);
        assert_eq!(Value::Object(config.descriptor("gnss0")), json!({"id": "gnss0"}));
    }

    #[test]
    fn test_field_rejects_out_of_range() {
        let mut field = ConfigField::new("fps", 15u32, FPS_RANGE.to_vec());
        assert!(field.set(30).is_ok());
        assert!(matches!(field.set(7), Err(AssetError::InvalidConfig(_))));
        assert_eq!(*field.value(), 30);
    }

    #[test]
    fn test_empty_range_allows_anything() {
        let mut field = ConfigField::new("free", 1u32, Vec::new());
        assert!(field.set(12345).is_ok());
    }

    #[test]
    fn test_copy_from_other_kind_is_rejected() {
        let mut target = imu_config();
        let before = target.clone();
        assert_eq!(
            target.copy_from(&serial_config()),
            Err(AssetError::UnknownConfigType)
        );
        assert_eq!(target, before);
    }

    #[test]
    fn test_copy_from_copies_values_and_ports() {
        let mut target = serial_config();
        let mut source = serial_config();
        let overrides = json!({"baud": 9600, "delimiter": ",", "port_pub": 12000, "port_sub": 12001});
        source
            .apply_overrides(overrides.as_object().unwrap())
            .unwrap();

        target.copy_from(&source).unwrap();
        let KindConfig::UsbSerial(serial) = &target.kind else {
            panic!("wrong kind");
        };
        assert_eq!(*serial.baud.value(), 9600);
        assert_eq!(serial.delimiter_byte(), b',');
        assert_eq!(target.port_pub, 12000);
        assert_eq!(target.port_sub, Some(12001));
    }

    #[test]
    fn test_copy_from_checks_target_ranges_first() {
        let mut target = AssetConfig::new(
            KindConfig::Camera(CameraConfig::new(synthetic_streams())),
            12004,
            None,
        );
        // A camera with different streams produces a value the target never offered
        let mut foreign = CameraConfig::new(vec![Stream::default()]);
        foreign.compression_quality.set(50).unwrap();
        let source = AssetConfig::new(KindConfig::Camera(foreign), 13000, None);

        let before = target.clone();
        assert!(matches!(
            target.copy_from(&source),
            Err(AssetError::InvalidConfig(_))
        ));
        assert_eq!(target, before);
    }

    #[test]
    fn test_overrides_reject_unknown_field() {
        let mut config = imu_config();
        let overrides = json!({"exposure": 3}).as_object().unwrap().clone();
        assert!(matches!(
            config.apply_overrides(&overrides),
            Err(AssetError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_overrides_parse_ip() {
        let mut config = serial_config();
        let overrides = json!({"ip": "192.168.1.20"}).as_object().unwrap().clone();
        config.apply_overrides(&overrides).unwrap();
        assert_eq!(
            config.connected_device_ip,
            Some("192.168.1.20".parse().unwrap())
        );

        let bad = json!({"ip": "controller"}).as_object().unwrap().clone();
        assert!(config.apply_overrides(&bad).is_err());
    }

    #[test]
    fn test_camera_stream_override() {
        let mut config = AssetConfig::new(
            KindConfig::Camera(CameraConfig::new(synthetic_streams())),
            12004,
            None,
        );
        let overrides = json!({"stream": {"fps": 15, "width": 320, "height": 240, "pixel_format": "yuyv"}})
            .as_object()
            .unwrap()
            .clone();
        config.apply_overrides(&overrides).unwrap();
        let KindConfig::Camera(camera) = &config.kind else {
            panic!("wrong kind");
        };
        assert_eq!(camera.stream.value().width, 320);
    }
}
