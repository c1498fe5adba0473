use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{consts::STORAGE_KEY_API_URL, store::KeyValueStore, SyncError};

/// Resolves the API base URL: saved override first, then the configured
/// default.
pub struct EndpointResolver {
    store: Arc<dyn KeyValueStore>,
    default_base: String,
}

impl EndpointResolver {
    pub fn new(store: Arc<dyn KeyValueStore>, default_base: impl Into<String>) -> Self {
        let default_base = default_base.into();
        Self {
            store,
            default_base: strip_trailing_slash(&default_base),
        }
    }

    /// Returns the active base URL without a trailing slash.
    ///
    /// Never fails: an unreadable override is logged and ignored. An empty
    /// result means no endpoint is configured and callers must not issue
    /// requests.
    pub async fn resolve(&self) -> String {
        match self.override_url().await {
            Some(url) => url,
            None => self.default_base.clone(),
        }
    }

    pub async fn override_url(&self) -> Option<String> {
        match self.store.get(STORAGE_KEY_API_URL) {
            Ok(Some(raw)) => {
                let url = strip_trailing_slash(raw.trim());
                if url.is_empty() {
                    None
                } else {
                    Some(url)
                }
            }
            Ok(None) => None,
            Err(error) => {
                warn!(%error, "endpoint: failed to read override, using default");
                None
            }
        }
    }

    /// Validates and persists a user-entered base URL. Returns the
    /// normalized value that `resolve` will now produce.
    pub async fn set_override(&self, input: &str) -> Result<String, SyncError> {
        let normalized = normalize_base_url(input)?;
        self.store.set(STORAGE_KEY_API_URL, &normalized)?;
        info!(url = %normalized, "endpoint: override saved");
        Ok(normalized)
    }

    pub async fn clear_override(&self) -> Result<(), SyncError> {
        self.store.delete(STORAGE_KEY_API_URL)?;
        info!(default = %self.default_base, "endpoint: override cleared");
        Ok(())
    }

    pub fn default_url(&self) -> &str {
        &self.default_base
    }
}

pub(crate) fn normalize_base_url(input: &str) -> Result<String, SyncError> {
    let trimmed = strip_trailing_slash(input.trim());
    if trimmed.is_empty() {
        return Err(SyncError::InvalidInput("API URL is required".to_string()));
    }
    if !trimmed.starts_with("http://") && !trimmed.starts_with("https://") {
        return Err(SyncError::InvalidInput(
            "URL must start with http:// or https://".to_string(),
        ));
    }

    reqwest::Url::parse(&trimmed)
        .map_err(|error| SyncError::InvalidInput(format!("Invalid API URL: {error}")))?;
    debug!(url = %trimmed, "endpoint: normalized base url");
    Ok(trimmed)
}

fn strip_trailing_slash(input: &str) -> String {
    input.strip_suffix('/').unwrap_or(input).to_string()
}
