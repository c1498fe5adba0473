use std::cmp::Ordering;

use crate::{
    consts::UNKNOWN_GROUP,
    model::{DeviceRecord, MonitorRecord},
};

/// Deterministic ordering for list screens.
///
/// Devices group by machine type, then location, each under its own priority
/// list, then sort by name. Monitors sort by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOrdering {
    type_order: Vec<String>,
    location_order: Vec<String>,
}

impl RecordOrdering {
    pub fn new(type_order: Vec<String>, location_order: Vec<String>) -> Self {
        Self {
            type_order,
            location_order,
        }
    }

    pub fn sort_devices(&self, devices: &mut [DeviceRecord]) {
        devices.sort_by(|a, b| self.compare_devices(a, b));
    }

    pub fn sort_monitors(&self, monitors: &mut [MonitorRecord]) {
        monitors.sort_by_key(|monitor| monitor.id);
    }

    pub fn compare_devices(&self, a: &DeviceRecord, b: &DeviceRecord) -> Ordering {
        let (type_a, type_b) = (group(&a.machine_type), group(&b.machine_type));
        let (loc_a, loc_b) = (group(&a.location), group(&b.location));

        by_priority(type_a, type_b, &self.type_order)
            .then_with(|| by_priority(loc_a, loc_b, &self.location_order))
            .then_with(|| by_name(&a.name, &b.name))
    }
}

fn group(value: &Option<String>) -> &str {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(UNKNOWN_GROUP)
}

/// Listed values first, in list order; unlisted ones after, alphabetically.
fn by_priority(a: &str, b: &str, order: &[String]) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }
    let position = |value: &str| order.iter().position(|entry| entry == value);
    match (position(a), position(b)) {
        (Some(ia), Some(ib)) => ia.cmp(&ib),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => by_name(a, b),
    }
}

fn by_name(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| a.cmp(b))
}
