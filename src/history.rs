use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{consts::STORAGE_KEY_GRAPH_RANGE, store::KeyValueStore, SyncError};

/// Graph window and the bucket size the service aggregates it by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TimeRange {
    FiveMinutes,
    TenMinutes,
    ThirtyMinutes,
    OneHour,
    #[default]
    ThreeHours,
    SixHours,
    TwelveHours,
    TwentyFourHours,
}

impl TimeRange {
    pub const ALL: [TimeRange; 8] = [
        TimeRange::FiveMinutes,
        TimeRange::TenMinutes,
        TimeRange::ThirtyMinutes,
        TimeRange::OneHour,
        TimeRange::ThreeHours,
        TimeRange::SixHours,
        TimeRange::TwelveHours,
        TimeRange::TwentyFourHours,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::FiveMinutes => "5m",
            Self::TenMinutes => "10m",
            Self::ThirtyMinutes => "30m",
            Self::OneHour => "1h",
            Self::ThreeHours => "3h",
            Self::SixHours => "6h",
            Self::TwelveHours => "12h",
            Self::TwentyFourHours => "24h",
        }
    }

    pub fn bucket(self) -> &'static str {
        match self {
            Self::FiveMinutes | Self::TenMinutes => "10s",
            Self::ThirtyMinutes => "20s",
            Self::OneHour => "30s",
            Self::ThreeHours => "1m",
            Self::SixHours => "2m",
            Self::TwelveHours => "5m",
            Self::TwentyFourHours => "10m",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::FiveMinutes => "Last 5 minutes",
            Self::TenMinutes => "Last 10 minutes",
            Self::ThirtyMinutes => "Last 30 minutes",
            Self::OneHour => "Last hour",
            Self::ThreeHours => "Last 3 hours",
            Self::SixHours => "Last 6 hours",
            Self::TwelveHours => "Last 12 hours",
            Self::TwentyFourHours => "Last 24 hours",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        Self::ALL.into_iter().find(|range| range.as_str() == value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerPoint {
    pub at: DateTime<Utc>,
    pub watts: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PowerHistory {
    /// Sorted by time, oldest first.
    pub points: Vec<PowerPoint>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub average: Option<f64>,
}

impl PowerHistory {
    /// `false` when every reading is zero, which the graph shows as "no data".
    pub fn has_nonzero_data(&self) -> bool {
        self.points.iter().any(|point| point.watts != 0.0)
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct PowerHistoryWire {
    #[serde(default)]
    points: Option<Vec<PowerPointWire>>,
    #[serde(default)]
    min: Value,
    #[serde(default)]
    max: Value,
    #[serde(default)]
    average: Value,
}

#[derive(Debug, Deserialize)]
struct PowerPointWire {
    #[serde(default)]
    value: Value,
    #[serde(default)]
    date: Option<String>,
}

impl PowerHistoryWire {
    pub(crate) fn into_history(self) -> PowerHistory {
        let mut points: Vec<PowerPoint> = self
            .points
            .unwrap_or_default()
            .into_iter()
            .filter_map(|point| {
                let watts = number(&point.value);
                let at = point.date.as_deref().and_then(parse_timestamp);
                match (at, watts) {
                    (Some(at), Some(watts)) => Some(PowerPoint { at, watts }),
                    _ => {
                        debug!(date = ?point.date, value = %point.value, "history: skipped point");
                        None
                    }
                }
            })
            .collect();
        points.sort_by_key(|point| point.at);

        PowerHistory {
            points,
            min: number(&self.min),
            max: number(&self.max),
            average: number(&self.average),
        }
    }
}

fn number(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|n| n.is_finite())
}

/// RFC 3339, or a naive timestamp taken as UTC.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

/// Selected graph range, or the default when nothing valid is stored.
pub fn load_graph_range(store: &dyn KeyValueStore) -> TimeRange {
    match store.get(STORAGE_KEY_GRAPH_RANGE) {
        Ok(Some(saved)) => TimeRange::parse(&saved).unwrap_or_else(|| {
            debug!(saved = %saved, "history: unknown stored range, using default");
            TimeRange::default()
        }),
        Ok(None) => TimeRange::default(),
        Err(error) => {
            warn!(%error, "history: failed to read graph range");
            TimeRange::default()
        }
    }
}

pub fn save_graph_range(store: &dyn KeyValueStore, range: TimeRange) -> Result<(), SyncError> {
    store.set(STORAGE_KEY_GRAPH_RANGE, range.as_str())?;
    Ok(())
}
