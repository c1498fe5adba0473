use std::{
    collections::{BTreeSet, HashSet},
    sync::{Arc, Mutex},
};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    api::ApiClient,
    consts::STORAGE_KEY_MUTED,
    endpoint::EndpointResolver,
    identity::IdentityProvider,
    store::{read_json, write_json, KeyValueStore},
    SyncError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuteSnapshot {
    pub muted: BTreeSet<String>,
    /// `true` when the remote read failed and the local cache answered.
    pub from_cache: bool,
}

/// Cache-aside store of muted device keys for this installation.
///
/// The service is authoritative. The local cache is written only after a
/// successful remote read or mutation and is read only when the service
/// cannot be reached.
pub struct MuteSynchronizer {
    api: ApiClient,
    resolver: Arc<EndpointResolver>,
    identity: Arc<IdentityProvider>,
    store: Arc<dyn KeyValueStore>,
    /// Guards cache read-modify-write and counts completed mutations.
    cache_lock: tokio::sync::Mutex<u64>,
    pending: Mutex<HashSet<String>>,
    published: watch::Sender<BTreeSet<String>>,
}

impl MuteSynchronizer {
    pub fn new(
        api: ApiClient,
        resolver: Arc<EndpointResolver>,
        identity: Arc<IdentityProvider>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let (published, _) = watch::channel(BTreeSet::new());
        Self {
            api,
            resolver,
            identity,
            store,
            cache_lock: tokio::sync::Mutex::new(0),
            pending: Mutex::new(HashSet::new()),
            published,
        }
    }

    pub async fn list(&self) -> BTreeSet<String> {
        self.snapshot().await.muted
    }

    pub async fn is_muted(&self, key: &str) -> bool {
        self.list().await.contains(key)
    }

    /// Latest known set, published after every read or successful mutation.
    pub fn subscribe(&self) -> watch::Receiver<BTreeSet<String>> {
        self.published.subscribe()
    }

    /// A remote read that overlaps a completed mutation is returned but not
    /// written through, so it cannot roll the cache back.
    pub async fn snapshot(&self) -> MuteSnapshot {
        let seen = *self.cache_lock.lock().await;
        let remote = match self.target().await {
            Ok((base, identity)) => self.api.muted_machines(&base, &identity).await,
            Err(error) => Err(error),
        };

        match remote {
            Ok(keys) => {
                let muted: BTreeSet<String> = keys.into_iter().collect();
                let superseded = {
                    let mutations = self.cache_lock.lock().await;
                    let superseded = *mutations != seen;
                    if !superseded {
                        self.write_cache(&muted);
                    }
                    superseded
                };
                if superseded {
                    debug!(count = muted.len(), "mute: mutation landed during read, cache kept");
                } else {
                    debug!(count = muted.len(), "mute: remote set loaded");
                    self.publish(&muted);
                }
                MuteSnapshot {
                    muted,
                    from_cache: false,
                }
            }
            Err(error) => {
                warn!(%error, "mute: remote read failed, falling back to cache");
                let muted = {
                    let _guard = self.cache_lock.lock().await;
                    self.read_cache()
                };
                self.publish(&muted);
                MuteSnapshot {
                    muted,
                    from_cache: true,
                }
            }
        }
    }

    /// Mutes `key` remotely, then records it in the cache. On failure the
    /// cache is untouched and the error is returned.
    pub async fn mute(&self, key: &str) -> Result<(), SyncError> {
        let key = validate_key(key)?;
        let _claim = self.claim(key)?;
        let (base, identity) = self.target().await?;

        self.api.mute_machine(&base, &identity, key).await?;
        info!(key, "mute: device muted");
        self.update_cache(|muted| {
            muted.insert(key.to_string());
        })
        .await;
        Ok(())
    }

    pub async fn unmute(&self, key: &str) -> Result<(), SyncError> {
        let key = validate_key(key)?;
        let _claim = self.claim(key)?;
        let (base, identity) = self.target().await?;

        self.api.unmute_machine(&base, &identity, key).await?;
        info!(key, "mute: device unmuted");
        self.update_cache(|muted| {
            muted.remove(key);
        })
        .await;
        Ok(())
    }

    async fn target(&self) -> Result<(String, String), SyncError> {
        let base = self.resolver.resolve().await;
        if base.is_empty() {
            return Err(SyncError::InvalidInput(
                "API endpoint is not configured".to_string(),
            ));
        }
        Ok((base, self.identity.identity().await))
    }

    fn claim(&self, key: &str) -> Result<PendingClaim<'_>, SyncError> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| SyncError::MutationInFlight(key.to_string()))?;
        if !pending.insert(key.to_string()) {
            debug!(key, "mute: rejected concurrent mutation");
            return Err(SyncError::MutationInFlight(key.to_string()));
        }
        Ok(PendingClaim {
            pending: &self.pending,
            key: key.to_string(),
        })
    }

    async fn update_cache(&self, apply: impl FnOnce(&mut BTreeSet<String>)) {
        let muted = {
            let mut mutations = self.cache_lock.lock().await;
            *mutations = mutations.wrapping_add(1);
            let mut muted = self.read_cache();
            apply(&mut muted);
            self.write_cache(&muted);
            muted
        };
        self.publish(&muted);
    }

    fn read_cache(&self) -> BTreeSet<String> {
        match read_json::<Vec<String>>(self.store.as_ref(), STORAGE_KEY_MUTED) {
            Ok(Some(keys)) => keys.into_iter().collect(),
            Ok(None) => BTreeSet::new(),
            Err(error) => {
                warn!(%error, "mute: cache unreadable, treating as empty");
                BTreeSet::new()
            }
        }
    }

    fn write_cache(&self, muted: &BTreeSet<String>) {
        if let Err(error) = write_json(self.store.as_ref(), STORAGE_KEY_MUTED, muted) {
            warn!(%error, "mute: failed to write cache");
        }
    }

    fn publish(&self, muted: &BTreeSet<String>) {
        self.published.send_if_modified(|current| {
            if current == muted {
                return false;
            }
            *current = muted.clone();
            true
        });
    }
}

fn validate_key(key: &str) -> Result<&str, SyncError> {
    let key = key.trim();
    if key.is_empty() {
        return Err(SyncError::InvalidInput("device key is required".to_string()));
    }
    Ok(key)
}

struct PendingClaim<'a> {
    pending: &'a Mutex<HashSet<String>>,
    key: String,
}

impl Drop for PendingClaim<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.key);
        }
    }
}
