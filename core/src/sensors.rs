//! C7 — Sensor Value Table: sensor-id -> last value + timestamp, written by
//! local relay readings and by MQTT-sourced channels. Grounded on
//! `SensorManager::updateLocalSensorValue` / `updateMqttSensorValue` /
//! `updateRelaySensorValue`.

use crate::can::codec::ChannelStatus;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};

/// A stored sensor reading. Numbers carry f64 so relay currents and MQTT
/// numeric payloads share one representation.
#[derive(Debug, Clone, PartialEq)]
pub enum SensorValue {
    Number(f64),
    Bool(bool),
    String(String),
}

impl SensorValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SensorValue::Number(n) => Some(*n),
            SensorValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            SensorValue::String(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorEntry {
    pub value: SensorValue,
    pub updated_ms: i64,
}

/// A locally-wired sensor: reads a `(node, channel)` pair and applies an
/// affine transform before storing.
#[derive(Debug, Clone)]
pub struct LocalSensorConfig {
    pub sensor_id: String,
    pub node: u32,
    pub channel: u8,
    pub scale: f64,
    pub offset: f64,
}

/// A cloud/MQTT-sourced sensor: reads a channel's JSON payload at a dotted
/// path.
#[derive(Debug, Clone)]
pub struct MqttSensorConfig {
    pub sensor_id: String,
    pub channel_id: String,
    pub json_path: String,
}

fn relay_status_sensor_id(node: u32, channel: u8) -> String {
    format!("node_{node}_sw{}_status", channel + 1)
}

fn relay_current_sensor_id(node: u32, channel: u8) -> String {
    format!("node_{node}_sw{}_current", channel + 1)
}

#[derive(Debug, Default)]
pub struct SensorTable {
    values: HashMap<String, SensorEntry>,
    local: Vec<LocalSensorConfig>,
    mqtt: Vec<MqttSensorConfig>,
    /// Derived relay sensor ids synthesized on first write because no
    /// config entry pre-registered them — kept so a future listing surface
    /// can distinguish configured from auto-registered sensors.
    auto_registered: HashSet<String>,
}

impl SensorTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_local(&mut self, config: LocalSensorConfig) {
        self.local.push(config);
    }

    pub fn register_mqtt(&mut self, config: MqttSensorConfig) {
        self.mqtt.push(config);
    }

    pub fn update_local(&mut self, node: u32, channel: u8, value: f64, now_ms: i64) {
        let matches: Vec<(String, f64, f64)> = self
            .local
            .iter()
            .filter(|c| c.node == node && c.channel == channel)
            .map(|c| (c.sensor_id.clone(), c.scale, c.offset))
            .collect();
        for (sensor_id, scale, offset) in matches {
            let scaled = value * scale + offset;
            self.values.insert(
                sensor_id,
                SensorEntry {
                    value: SensorValue::Number(scaled),
                    updated_ms: now_ms,
                },
            );
        }
    }

    pub fn update_from_mqtt(&mut self, channel_id: &str, payload: &JsonValue, now_ms: i64) {
        let matches: Vec<(String, String)> = self
            .mqtt
            .iter()
            .filter(|c| c.channel_id == channel_id)
            .map(|c| (c.sensor_id.clone(), c.json_path.clone()))
            .collect();
        for (sensor_id, json_path) in matches {
            if let Some(value) = walk_json_path(payload, &json_path) {
                self.values.insert(
                    sensor_id,
                    SensorEntry {
                        value,
                        updated_ms: now_ms,
                    },
                );
            }
        }
    }

    /// Auto-writes the two derived sensors for a relay channel status,
    /// synthesizing a config entry the first time either id is seen.
    pub fn update_from_relay(&mut self, node: u32, channel: u8, status: ChannelStatus, now_ms: i64) {
        let status_id = relay_status_sensor_id(node, channel);
        let current_id = relay_current_sensor_id(node, channel);

        for id in [&status_id, &current_id] {
            if !self.local.iter().any(|c| &c.sensor_id == id) && self.auto_registered.insert(id.clone()) {
                // Synthesized marker only; the actual value lives in `values`.
            }
        }

        self.values.insert(
            status_id,
            SensorEntry {
                value: SensorValue::Number(f64::from(status.mode_bits())),
                updated_ms: now_ms,
            },
        );
        self.values.insert(
            current_id,
            SensorEntry {
                value: SensorValue::Number(f64::from(status.current_a)),
                updated_ms: now_ms,
            },
        );
    }

    pub fn get(&self, sensor_id: &str) -> Option<&SensorEntry> {
        self.values.get(sensor_id)
    }
}

fn walk_json_path(root: &JsonValue, dotted: &str) -> Option<SensorValue> {
    let mut current = root;
    for segment in dotted.split('.') {
        current = current.get(segment)?;
    }
    match current {
        JsonValue::Null => None,
        JsonValue::Bool(b) => Some(SensorValue::Bool(*b)),
        JsonValue::Number(n) => n.as_f64().map(SensorValue::Number),
        JsonValue::String(s) => Some(SensorValue::String(s.clone())),
        JsonValue::Array(_) | JsonValue::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn update_local_applies_scale_and_offset() {
        let mut table = SensorTable::new();
        table.register_local(LocalSensorConfig {
            sensor_id: "tank_temp".into(),
            node: 1,
            channel: 0,
            scale: 2.0,
            offset: -1.0,
        });
        table.update_local(1, 0, 10.0, 500);
        let entry = table.get("tank_temp").unwrap();
        assert_eq!(entry.value, SensorValue::Number(19.0));
        assert_eq!(entry.updated_ms, 500);
    }

    #[test]
    fn update_local_ignores_sensors_on_other_nodes_or_channels() {
        let mut table = SensorTable::new();
        table.register_local(LocalSensorConfig {
            sensor_id: "x".into(),
            node: 1,
            channel: 0,
            scale: 1.0,
            offset: 0.0,
        });
        table.update_local(2, 0, 5.0, 0);
        assert!(table.get("x").is_none());
    }

    #[test]
    fn update_from_mqtt_walks_dotted_path() {
        let mut table = SensorTable::new();
        table.register_mqtt(MqttSensorConfig {
            sensor_id: "outside_humidity".into(),
            channel_id: "weather".into(),
            json_path: "readings.humidity".into(),
        });
        let payload = json!({"readings": {"humidity": 54.5, "temp": 20.1}});
        table.update_from_mqtt("weather", &payload, 1_000);
        assert_eq!(
            table.get("outside_humidity").unwrap().value,
            SensorValue::Number(54.5)
        );
    }

    #[test]
    fn update_from_mqtt_skips_null_terminal_values() {
        let mut table = SensorTable::new();
        table.register_mqtt(MqttSensorConfig {
            sensor_id: "x".into(),
            channel_id: "c".into(),
            json_path: "a.b".into(),
        });
        let payload = json!({"a": {"b": null}});
        table.update_from_mqtt("c", &payload, 0);
        assert!(table.get("x").is_none());
    }

    #[test]
    fn update_from_relay_auto_registers_status_and_current_sensors() {
        let mut table = SensorTable::new();
        let status = ChannelStatus {
            channel: 2,
            status_byte: 0b0000_0001,
            current_a: 1.75,
        };
        table.update_from_relay(7, 2, status, 42);
        assert_eq!(
            table.get("node_7_sw3_status").unwrap().value,
            SensorValue::Number(1.0)
        );
        assert_eq!(
            table.get("node_7_sw3_current").unwrap().value,
            SensorValue::Number(1.75)
        );
        assert!(table.auto_registered.contains("node_7_sw3_status"));
    }
}
