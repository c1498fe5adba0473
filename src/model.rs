use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "String")]
pub enum DeviceStatus {
    Online,
    Offline,
    NoPower,
    LowPower,
    Unknown,
}

impl DeviceStatus {
    pub const FILTERABLE: [DeviceStatus; 4] = [
        DeviceStatus::Offline,
        DeviceStatus::Online,
        DeviceStatus::NoPower,
        DeviceStatus::LowPower,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::NoPower => "no power",
            Self::LowPower => "low power",
            Self::Unknown => "unknown",
        }
    }
}

impl From<Option<String>> for DeviceStatus {
    fn from(value: Option<String>) -> Self {
        match value.as_deref().map(str::trim) {
            Some("online") => Self::Online,
            Some("offline") => Self::Offline,
            Some("no power") => Self::NoPower,
            Some("low power") => Self::LowPower,
            _ => Self::Unknown,
        }
    }
}

impl From<DeviceStatus> for String {
    fn from(value: DeviceStatus) -> Self {
        value.as_str().to_string()
    }
}

/// A monitored machine as reported by `/api/v1/status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub mac: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub name: String,
    #[serde(default = "unknown_status")]
    pub status: DeviceStatus,
    /// Watts; absent while the device is offline.
    #[serde(default, deserialize_with = "lenient_watts")]
    pub last_power: Option<f64>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub machine_type: Option<String>,
    #[serde(default, alias = "id")]
    pub monitor_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorRecord {
    pub id: i64,
    #[serde(default, deserialize_with = "nullable_string")]
    pub mac: String,
    #[serde(default, alias = "name")]
    pub machine_name: Option<String>,
}

/// A locally received push notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl NotificationRecord {
    /// Device key carried in the payload, used for deep links.
    pub fn device_key(&self) -> Option<&str> {
        device_key_from(&self.data)
    }
}

pub(crate) fn device_key_from(data: &serde_json::Value) -> Option<&str> {
    data.get("mac")
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|mac| !mac.is_empty())
}

/// Query parameters accepted by `/api/v1/status`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusFilter {
    pub location: Option<String>,
    pub status: Option<DeviceStatus>,
    pub machine_type: Option<String>,
}

impl StatusFilter {
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_status(mut self, status: DeviceStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_machine_type(mut self, machine_type: impl Into<String>) -> Self {
        self.machine_type = Some(machine_type.into());
        self
    }

    pub(crate) fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(location) = self.location.as_deref().filter(|v| !v.trim().is_empty()) {
            pairs.push(("location", location.to_string()));
        }
        if let Some(status) = self.status.filter(|s| *s != DeviceStatus::Unknown) {
            pairs.push(("status", status.as_str().to_string()));
        }
        if let Some(kind) = self.machine_type.as_deref().filter(|v| !v.trim().is_empty()) {
            pairs.push(("machine_type", kind.to_string()));
        }
        pairs
    }
}

/// Device counts keyed by status label, from `/api/v1/device_stats`.
pub type DeviceStats = BTreeMap<String, u64>;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum DeviceListWire {
    Bare(Vec<DeviceRecord>),
    Wrapped { devices: Vec<DeviceRecord> },
}

impl DeviceListWire {
    pub(crate) fn into_records(self) -> Vec<DeviceRecord> {
        match self {
            Self::Bare(records) | Self::Wrapped { devices: records } => records,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum MonitorListWire {
    Bare(Vec<MonitorRecord>),
    Wrapped { monitors: Vec<MonitorRecord> },
}

impl MonitorListWire {
    pub(crate) fn into_records(self) -> Vec<MonitorRecord> {
        match self {
            Self::Bare(records) | Self::Wrapped { monitors: records } => records,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum DeviceDetailWire {
    Many(Vec<DeviceRecord>),
    One(DeviceRecord),
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct MutedMachinesWire {
    #[serde(default, rename = "mutedMachines")]
    pub(crate) muted_machines: Vec<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct MuteRequestWire<'a> {
    #[serde(rename = "machineId")]
    pub(crate) machine_id: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct PushRegistrationWire<'a> {
    pub(crate) token: &'a str,
    pub(crate) device_name: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PollCountWire {
    #[serde(default)]
    pub(crate) count: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DeleteResponseWire {
    #[serde(default)]
    pub(crate) status: Option<String>,
}

fn unknown_status() -> DeviceStatus {
    DeviceStatus::Unknown
}

fn nullable_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Accepts a number, a numeric string, or anything else (e.g. `"offline"`)
/// which decodes as no reading.
fn lenient_watts<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Number(number) => number.as_f64(),
        serde_json::Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn device_record_decodes_service_shapes() {
        let online: DeviceRecord = serde_json::from_value(json!({
            "mac": "AA:BB",
            "name": "Press 1",
            "status": "low power",
            "last_power": 12.5,
            "location": "Production line",
            "machine_type": "IPM",
            "id": 7
        }))
        .unwrap();
        assert_eq!(online.status, DeviceStatus::LowPower);
        assert_eq!(online.last_power, Some(12.5));
        assert_eq!(online.monitor_id, Some(7));

        let offline: DeviceRecord = serde_json::from_value(json!({
            "mac": "CC:DD",
            "name": null,
            "status": "offline",
            "last_power": "offline"
        }))
        .unwrap();
        assert_eq!(offline.name, "");
        assert_eq!(offline.last_power, None);
        assert_eq!(offline.monitor_id, None);
        assert_eq!(offline.location, None);
    }

    #[test]
    fn unknown_status_is_preserved_as_unknown() {
        let record: DeviceRecord =
            serde_json::from_value(json!({ "mac": "x", "status": "rebooting" })).unwrap();
        assert_eq!(record.status, DeviceStatus::Unknown);
    }

    #[test]
    fn monitor_accepts_name_alias() {
        let monitor: MonitorRecord =
            serde_json::from_value(json!({ "id": 3, "mac": "m", "name": "Lathe" })).unwrap();
        assert_eq!(monitor.machine_name.as_deref(), Some("Lathe"));
    }

    #[test]
    fn list_wire_accepts_bare_and_wrapped() {
        let bare: DeviceListWire = serde_json::from_value(json!([{ "mac": "a" }])).unwrap();
        assert_eq!(bare.into_records().len(), 1);
        let wrapped: DeviceListWire =
            serde_json::from_value(json!({ "devices": [{ "mac": "a" }, { "mac": "b" }] })).unwrap();
        assert_eq!(wrapped.into_records().len(), 2);
        let monitors: MonitorListWire =
            serde_json::from_value(json!({ "monitors": [{ "id": 1 }] })).unwrap();
        assert_eq!(monitors.into_records()[0].id, 1);
    }

    #[test]
    fn notification_uses_camel_case_timestamp() {
        let record = NotificationRecord {
            id: "n1".into(),
            title: "Alert".into(),
            body: "Pump offline".into(),
            data: json!({ "mac": "AA" }),
            created_at: DateTime::parse_from_rfc3339("2025-01-02T03:04:05Z")
                .unwrap()
                .with_timezone(&Utc),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["createdAt"], "2025-01-02T03:04:05Z");
        assert_eq!(record.device_key(), Some("AA"));
    }

    #[test]
    fn filter_skips_empty_values() {
        let filter = StatusFilter::default()
            .with_location("  ")
            .with_status(DeviceStatus::NoPower)
            .with_machine_type("Pump");
        assert_eq!(
            filter.query_pairs(),
            vec![
                ("status", "no power".to_string()),
                ("machine_type", "Pump".to_string())
            ]
        );
    }
}
