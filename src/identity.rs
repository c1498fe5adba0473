use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::{consts::STORAGE_KEY_INSTALLATION_ID, store::KeyValueStore};

/// Hardware/OS facts the installation identity is derived from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceMetadata {
    pub os_name: Option<String>,
    pub model_id: Option<String>,
    pub device_name: Option<String>,
}

impl DeviceMetadata {
    /// Metadata of the machine this process runs on.
    pub fn detect() -> Self {
        Self {
            os_name: Some(std::env::consts::OS.to_string()),
            model_id: None,
            device_name: hostname::get()
                .ok()
                .and_then(|name| name.into_string().ok()),
        }
    }
}

/// Stable per-installation identifier.
///
/// The same string keys mute preferences on the service and is sent as
/// `device_name` when registering for push, so both bind to one installation.
pub struct IdentityProvider {
    store: Arc<dyn KeyValueStore>,
    metadata: DeviceMetadata,
    cached: OnceCell<String>,
}

impl IdentityProvider {
    pub fn new(store: Arc<dyn KeyValueStore>, metadata: DeviceMetadata) -> Self {
        Self {
            store,
            metadata,
            cached: OnceCell::new(),
        }
    }

    pub async fn identity(&self) -> String {
        self.cached
            .get_or_init(|| async { self.load_or_create() })
            .await
            .clone()
    }

    fn load_or_create(&self) -> String {
        match self.store.get(STORAGE_KEY_INSTALLATION_ID) {
            Ok(Some(stored)) if !stored.trim().is_empty() => return stored.trim().to_string(),
            Ok(_) => {}
            Err(error) => {
                warn!(%error, "identity: failed to read stored identity, deriving");
            }
        }

        let identity = derive_identity(&self.metadata);
        match self.store.set(STORAGE_KEY_INSTALLATION_ID, &identity) {
            Ok(()) => info!(identity = %identity, "identity: created installation identity"),
            Err(error) => warn!(%error, "identity: failed to persist identity"),
        }
        identity
    }
}

/// `{os}-{model}` with unsafe characters replaced. Contains no random or
/// time component, so a reinstall on the same hardware yields the same value.
pub fn derive_identity(metadata: &DeviceMetadata) -> String {
    let pick = |value: &Option<String>| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
    };
    let os = pick(&metadata.os_name).unwrap_or_else(|| "unknown".to_string());
    let unique = pick(&metadata.model_id)
        .or_else(|| pick(&metadata.device_name))
        .unwrap_or_else(|| "unknown".to_string());

    sanitize(&format!("{os}-{unique}"))
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn phone() -> DeviceMetadata {
        DeviceMetadata {
            os_name: Some("iOS".into()),
            model_id: Some("iPhone15,2".into()),
            device_name: Some("Ana's phone".into()),
        }
    }

    #[test]
    fn derivation_prefers_model_then_name() {
        assert_eq!(derive_identity(&phone()), "iOS-iPhone15-2");

        let named = DeviceMetadata {
            model_id: None,
            ..phone()
        };
        assert_eq!(derive_identity(&named), "iOS-Ana-s-phone");

        assert_eq!(derive_identity(&DeviceMetadata::default()), "unknown-unknown");
    }

    #[tokio::test]
    async fn identity_is_stable_across_restarts() {
        let store = Arc::new(MemoryStore::new());

        let first = IdentityProvider::new(store.clone(), phone());
        let a = first.identity().await;
        let b = first.identity().await;
        assert_eq!(a, b);

        // Same persisted storage, different metadata: the stored value wins.
        let restarted = IdentityProvider::new(
            store.clone(),
            DeviceMetadata {
                model_id: Some("other".into()),
                ..phone()
            },
        );
        assert_eq!(restarted.identity().await, a);
    }

    #[tokio::test]
    async fn reinstall_on_same_hardware_yields_same_identity() {
        let before = IdentityProvider::new(Arc::new(MemoryStore::new()), phone());
        let after = IdentityProvider::new(Arc::new(MemoryStore::new()), phone());
        assert_eq!(before.identity().await, after.identity().await);
    }

    #[tokio::test]
    async fn unavailable_storage_still_yields_derived_identity() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let provider = IdentityProvider::new(store, phone());
        assert_eq!(provider.identity().await, "iOS-iPhone15-2");
    }
}
