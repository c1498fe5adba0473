pub(crate) const FALLBACK_API_BASE: &str = "http://127.0.0.1:8000";
pub(crate) const API_BASE_ENV: &str = "POWERMON_API_BASE";
pub(crate) const COMPILED_API_BASE: Option<&str> = option_env!("POWERMON_API_BASE");

pub(crate) const API_PREFIX: [&str; 2] = ["api", "v1"];

pub(crate) const POLL_INTERVAL_SECS: u64 = 5;
pub(crate) const MIN_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);
pub(crate) const REQUEST_TIMEOUT_SECS: u64 = 15;
pub(crate) const ERROR_BODY_MAX_CHARS: usize = 200;

pub(crate) const STORAGE_KEY_API_URL: &str = "powermon.api_url";
pub(crate) const STORAGE_KEY_INSTALLATION_ID: &str = "powermon.installation_id";
pub(crate) const STORAGE_KEY_NOTIFICATIONS: &str = "powermon.notifications.v1";
pub(crate) const STORAGE_KEY_MUTED: &str = "powermon.muted_machines";
pub(crate) const STORAGE_KEY_GRAPH_RANGE: &str = "powermon.graph_time_range";

pub(crate) const DEFAULT_TYPE_ORDER: [&str; 1] = ["IPM"];
pub(crate) const DEFAULT_LOCATION_ORDER: [&str; 1] = ["Production line"];
pub(crate) const UNKNOWN_GROUP: &str = "Unknown";
