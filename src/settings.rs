use std::{path::PathBuf, time::Duration};

use crate::{
    consts::{
        API_BASE_ENV, COMPILED_API_BASE, DEFAULT_LOCATION_ORDER, DEFAULT_TYPE_ORDER,
        FALLBACK_API_BASE, POLL_INTERVAL_SECS,
    },
    endpoint::normalize_base_url,
    ordering::RecordOrdering,
    SyncError,
};

/// Process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL used when no override has been saved.
    pub default_api_base: String,
    pub data_dir: PathBuf,
    pub poll_interval: Duration,
    pub type_order: Vec<String>,
    pub location_order: Vec<String>,
    /// Token handed to the headless push platform, if any.
    pub push_token: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_api_base: default_api_base(None),
            data_dir: default_data_dir(None),
            poll_interval: Duration::from_secs(POLL_INTERVAL_SECS),
            type_order: DEFAULT_TYPE_ORDER.iter().map(|s| s.to_string()).collect(),
            location_order: DEFAULT_LOCATION_ORDER.iter().map(|s| s.to_string()).collect(),
            push_token: None,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SyncError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let optional = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let poll_interval = match optional("POWERMON_POLL_INTERVAL_SECS") {
            Some(raw) => {
                let secs = raw.trim().parse::<u64>().map_err(|_| {
                    SyncError::InvalidInput(format!(
                        "POWERMON_POLL_INTERVAL_SECS must be a positive integer, got {raw:?}"
                    ))
                })?;
                if secs == 0 {
                    return Err(SyncError::InvalidInput(
                        "POWERMON_POLL_INTERVAL_SECS must be greater than 0".to_string(),
                    ));
                }
                Duration::from_secs(secs)
            }
            None => Duration::from_secs(POLL_INTERVAL_SECS),
        };

        let runtime_base = match optional(API_BASE_ENV) {
            Some(raw) => Some(normalize_base_url(&raw)?),
            None => None,
        };

        let defaults = Self::default();
        Ok(Self {
            default_api_base: default_api_base(runtime_base),
            data_dir: default_data_dir(optional("POWERMON_DATA_DIR").map(PathBuf::from)),
            poll_interval,
            type_order: optional("POWERMON_TYPE_ORDER")
                .map(|raw| parse_list(&raw))
                .unwrap_or(defaults.type_order),
            location_order: optional("POWERMON_LOCATION_ORDER")
                .map(|raw| parse_list(&raw))
                .unwrap_or(defaults.location_order),
            push_token: optional("POWERMON_PUSH_TOKEN").map(|t| t.trim().to_string()),
        })
    }

    pub fn ordering(&self) -> RecordOrdering {
        RecordOrdering::new(self.type_order.clone(), self.location_order.clone())
    }
}

/// Runtime environment, then the value compiled in, then the fallback.
fn default_api_base(runtime: Option<String>) -> String {
    runtime
        .or_else(|| {
            COMPILED_API_BASE
                .filter(|value| !value.trim().is_empty())
                .and_then(|value| normalize_base_url(value).ok())
        })
        .unwrap_or_else(|| FALLBACK_API_BASE.to_string())
}

fn default_data_dir(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir;
    }
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".config").join("powermon"),
        None => PathBuf::from(".powermon"),
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = ClientConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.type_order, vec!["IPM".to_string()]);
        assert_eq!(config.location_order, vec!["Production line".to_string()]);
        assert!(config.push_token.is_none());
        assert!(!config.default_api_base.ends_with('/'));
    }

    #[test]
    fn runtime_base_is_normalized() {
        let config =
            ClientConfig::from_lookup(lookup(&[("POWERMON_API_BASE", "https://api.test/")]))
                .unwrap();
        assert_eq!(config.default_api_base, "https://api.test");
    }

    #[test]
    fn invalid_runtime_base_is_rejected() {
        let err = ClientConfig::from_lookup(lookup(&[("POWERMON_API_BASE", "ftp://x")]))
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidInput(_)));
    }

    #[test]
    fn lists_and_interval_are_parsed() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("POWERMON_TYPE_ORDER", "IPM, Pump,,"),
            ("POWERMON_LOCATION_ORDER", "Hall A"),
            ("POWERMON_POLL_INTERVAL_SECS", "10"),
            ("POWERMON_DATA_DIR", "/tmp/powermon-test"),
        ]))
        .unwrap();
        assert_eq!(config.type_order, vec!["IPM".to_string(), "Pump".to_string()]);
        assert_eq!(config.location_order, vec!["Hall A".to_string()]);
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.data_dir, PathBuf::from("/tmp/powermon-test"));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = ClientConfig::from_lookup(lookup(&[("POWERMON_POLL_INTERVAL_SECS", "0")]))
            .unwrap_err();
        assert!(err.to_string().contains("greater than 0"));
    }
}
