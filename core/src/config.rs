//! Layered YAML configuration, following the `config` + `serde` pattern
//! used throughout the original source's `*Config::from_file` methods.

use serde::Deserialize;
use std::ffi::OsStr;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DeviceConfig {
    pub node_id: u32,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct GroupConfig {
    pub group_id: u32,
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<u32>,
    #[serde(default)]
    pub channels: Vec<u32>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LocalSensorWiringConfig {
    pub sensor_id: String,
    pub node: u32,
    pub channel: u8,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
}

fn default_scale() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MqttSensorWiringConfig {
    pub sensor_id: String,
    pub channel_id: String,
    pub json_path: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CoreConfig {
    pub can_interface: String,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
    #[serde(default)]
    pub local_sensors: Vec<LocalSensorWiringConfig>,
    #[serde(default)]
    pub mqtt_sensors: Vec<MqttSensorWiringConfig>,
}

impl CoreConfig {
    pub fn from_file<F: AsRef<OsStr>>(filepath: F) -> Self {
        let file = Path::new(&filepath);
        let config_file = config::Config::builder()
            .add_source(config::File::new(
                &file.to_string_lossy(),
                config::FileFormat::Yaml,
            ))
            .build()
            .expect("Failed read config");
        config_file
            .try_deserialize::<CoreConfig>()
            .expect("Failed to deserialize config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn from_file_parses_devices_groups_and_sensors() {
        let mut file = tempfile_with_contents(
            "can_interface: can0\n\
             devices:\n\
             \x20\x20- node_id: 1\n\
             \x20\x20  name: fan-bank\n\
             groups:\n\
             \x20\x20- group_id: 1\n\
             \x20\x20  name: fans\n\
             \x20\x20  nodes: [1]\n\
             \x20\x20  channels: []\n\
             local_sensors:\n\
             \x20\x20- sensor_id: tank_temp\n\
             \x20\x20  node: 1\n\
             \x20\x20  channel: 0\n\
             mqtt_sensors:\n\
             \x20\x20- sensor_id: outside_humidity\n\
             \x20\x20  channel_id: weather\n\
             \x20\x20  json_path: readings.humidity\n",
        );
        let config = CoreConfig::from_file(file.path());
        assert_eq!(config.can_interface, "can0");
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.groups[0].group_id, 1);
        assert_eq!(config.local_sensors[0].scale, 1.0);
        assert_eq!(config.mqtt_sensors[0].json_path, "readings.humidity");
        file.flush().unwrap();
    }

    fn tempfile_with_contents(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }
}
