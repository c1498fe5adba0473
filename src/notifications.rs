use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;
use tokio::{
    sync::{mpsc, watch, OnceCell},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    api::ApiClient,
    consts::STORAGE_KEY_NOTIFICATIONS,
    endpoint::EndpointResolver,
    identity::IdentityProvider,
    model::{device_key_from, NotificationRecord},
    store::{write_json, KeyValueStore},
    SyncError,
};

/// A push payload as delivered by the platform, before validation.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct IncomingNotification {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl IncomingNotification {
    /// `None` when the payload carries no usable id.
    pub fn into_record(self, received_at: DateTime<Utc>) -> Option<NotificationRecord> {
        let id = self.id.map(|id| id.trim().to_string()).filter(|id| !id.is_empty())?;
        Some(NotificationRecord {
            id,
            title: self.title.unwrap_or_default(),
            body: self.body.unwrap_or_default(),
            data: self
                .data
                .filter(|data| !data.is_null())
                .unwrap_or_else(|| Value::Object(Default::default())),
            created_at: received_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    Received(IncomingNotification),
    /// The user tapped a notification carrying `data`.
    Opened { data: Value },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationRoute {
    Device { mac: String },
    NotificationList,
}

pub fn route_for(data: &Value) -> NotificationRoute {
    match device_key_from(data) {
        Some(mac) => NotificationRoute::Device {
            mac: mac.to_string(),
        },
        None => NotificationRoute::NotificationList,
    }
}

/// Reverse-chronological log of received notifications, unique by id and
/// persisted after every change.
pub struct NotificationStore {
    store: Arc<dyn KeyValueStore>,
    records: Mutex<Vec<NotificationRecord>>,
    published: watch::Sender<Vec<NotificationRecord>>,
}

impl NotificationStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        let (published, _) = watch::channel(Vec::new());
        Self {
            store,
            records: Mutex::new(Vec::new()),
            published,
        }
    }

    /// Loads the persisted log, merging with anything received before the
    /// call. An unparsable log is moved to a backup key. Returns the number
    /// of records held afterwards.
    pub fn restore(&self) -> usize {
        let restored = match self.store.get(STORAGE_KEY_NOTIFICATIONS) {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<NotificationRecord>>(&raw) {
                Ok(records) => records,
                Err(error) => {
                    warn!(%error, "notifications: persisted log is corrupt, moving aside");
                    self.move_aside(&raw);
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(error) => {
                warn!(%error, "notifications: failed to read persisted log");
                Vec::new()
            }
        };

        let Ok(mut records) = self.records.lock() else {
            return 0;
        };
        for record in restored {
            if !records.iter().any(|existing| existing.id == record.id) {
                records.push(record);
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let count = records.len();
        self.commit(&records);
        info!(count, "notifications: restored");
        count
    }

    /// No-op when the id is already present. Returns whether it was inserted.
    pub fn add(&self, record: NotificationRecord) -> bool {
        if record.id.trim().is_empty() {
            debug!("notifications: ignoring record without id");
            return false;
        }
        let Ok(mut records) = self.records.lock() else {
            return false;
        };
        if records.iter().any(|existing| existing.id == record.id) {
            debug!(id = %record.id, "notifications: duplicate ignored");
            return false;
        }

        let position = records.partition_point(|existing| existing.created_at >= record.created_at);
        debug!(id = %record.id, "notifications: stored");
        records.insert(position, record);
        self.commit(&records);
        true
    }

    pub fn list(&self) -> Vec<NotificationRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    pub fn clear_all(&self) {
        if let Ok(mut records) = self.records.lock() {
            records.clear();
            self.commit(&records);
            info!("notifications: cleared");
        }
    }

    pub fn clear_one(&self, id: &str) -> bool {
        let Ok(mut records) = self.records.lock() else {
            return false;
        };
        let before = records.len();
        records.retain(|record| record.id != id);
        if records.len() == before {
            return false;
        }
        self.commit(&records);
        true
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<NotificationRecord>> {
        self.published.subscribe()
    }

    /// Persists and publishes. A failed write keeps the in-memory log.
    fn commit(&self, records: &[NotificationRecord]) {
        if let Err(error) = write_json(self.store.as_ref(), STORAGE_KEY_NOTIFICATIONS, records) {
            warn!(%error, "notifications: failed to persist log");
        }
        self.published.send_replace(records.to_vec());
    }

    fn move_aside(&self, raw: &str) {
        let backup_key = backup_key();
        if let Err(error) = self.store.set(&backup_key, raw) {
            warn!(%error, "notifications: failed to back up corrupt log");
            return;
        }
        if let Err(error) = self.store.delete(STORAGE_KEY_NOTIFICATIONS) {
            warn!(%error, "notifications: failed to remove corrupt log");
        }
    }
}

pub(crate) fn backup_key() -> String {
    format!("{STORAGE_KEY_NOTIFICATIONS}.corrupt")
}

/// Handle to the task draining [`PushEvent`]s.
pub struct PushListener {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PushListener {
    /// Stops the listener and waits for it to exit.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(error) = self.task.await {
            warn!(%error, "push listener: task ended abnormally");
        }
    }
}

/// Received notifications go to `store`; opened ones become routes on
/// `routes`. Ends when stopped or when every event sender is gone.
pub fn spawn_push_listener(
    store: Arc<NotificationStore>,
    mut events: mpsc::Receiver<PushEvent>,
    routes: mpsc::UnboundedSender<NotificationRoute>,
) -> PushListener {
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        debug!("push listener: started");
        loop {
            tokio::select! {
                biased;
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Some(PushEvent::Received(incoming)) => {
                        match incoming.into_record(Utc::now()) {
                            Some(record) => {
                                store.add(record);
                            }
                            None => debug!("push listener: dropped notification without id"),
                        }
                    }
                    Some(PushEvent::Opened { data }) => {
                        let route = route_for(&data);
                        debug!(?route, "push listener: notification opened");
                        if routes.send(route).is_err() {
                            debug!("push listener: no route consumer");
                        }
                    }
                    None => break,
                },
            }
        }
        debug!("push listener: stopped");
    });

    PushListener { stop_tx, task }
}

/// OS push facilities: permission prompts and the delivery token.
pub trait PushPlatform: Send + Sync {
    fn permission_granted(&self) -> BoxFuture<'_, Result<bool, SyncError>>;

    /// Prompts if possible; resolves to the resulting grant state.
    fn request_permission(&self) -> BoxFuture<'_, Result<bool, SyncError>>;

    fn push_token(&self) -> BoxFuture<'_, Result<Option<String>, SyncError>>;
}

/// Platform with a preconfigured token and permission always granted.
pub struct StaticPushPlatform {
    token: Option<String>,
}

impl StaticPushPlatform {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

impl PushPlatform for StaticPushPlatform {
    fn permission_granted(&self) -> BoxFuture<'_, Result<bool, SyncError>> {
        Box::pin(async { Ok(true) })
    }

    fn request_permission(&self) -> BoxFuture<'_, Result<bool, SyncError>> {
        Box::pin(async { Ok(true) })
    }

    fn push_token(&self) -> BoxFuture<'_, Result<Option<String>, SyncError>> {
        Box::pin(async move { Ok(self.token.clone()) })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Registered,
    PermissionDenied,
    NoToken,
    Failed(String),
}

/// Registers this installation for push delivery, once per registrar.
pub struct PushRegistrar {
    api: ApiClient,
    resolver: Arc<EndpointResolver>,
    identity: Arc<IdentityProvider>,
    platform: Arc<dyn PushPlatform>,
    outcome: OnceCell<RegistrationOutcome>,
}

impl PushRegistrar {
    pub fn new(
        api: ApiClient,
        resolver: Arc<EndpointResolver>,
        identity: Arc<IdentityProvider>,
        platform: Arc<dyn PushPlatform>,
    ) -> Self {
        Self {
            api,
            resolver,
            identity,
            platform,
            outcome: OnceCell::new(),
        }
    }

    /// Never fails; every problem is logged and reported in the outcome.
    /// Later calls return the first outcome without repeating the work.
    pub async fn register(&self) -> RegistrationOutcome {
        self.outcome
            .get_or_init(|| async {
                let outcome = match self.try_register().await {
                    Ok(outcome) => outcome,
                    Err(error) => RegistrationOutcome::Failed(error.reason()),
                };
                match &outcome {
                    RegistrationOutcome::Registered => info!("push: registered"),
                    RegistrationOutcome::Failed(reason) => {
                        warn!(reason = %reason, "push: registration failed")
                    }
                    other => warn!(outcome = ?other, "push: registration skipped"),
                }
                outcome
            })
            .await
            .clone()
    }

    async fn try_register(&self) -> Result<RegistrationOutcome, SyncError> {
        let mut granted = self.platform.permission_granted().await?;
        if !granted {
            granted = self.platform.request_permission().await?;
        }
        if !granted {
            return Ok(RegistrationOutcome::PermissionDenied);
        }

        let Some(token) = self
            .platform
            .push_token()
            .await?
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
        else {
            return Ok(RegistrationOutcome::NoToken);
        };

        let base = self.resolver.resolve().await;
        if base.is_empty() {
            return Err(SyncError::Push("API endpoint is not configured".to_string()));
        }
        let device_name = self.identity.identity().await;
        self.api.register_push(&base, &token, &device_name).await?;
        Ok(RegistrationOutcome::Registered)
    }
}
