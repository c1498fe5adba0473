use std::sync::Arc;

use anyhow::Context;
use powermon_sync::{
    history::load_graph_range,
    notifications::{spawn_push_listener, IncomingNotification, StaticPushPlatform},
    ApiClient, ClientConfig, DeviceFeed, DeviceMetadata, DeviceRecord, DeviceStatus,
    EndpointResolver, FeedStatus, FileStore, IdentityProvider, KeyValueStore, MonitorFeed,
    MonitorRecord, MuteSynchronizer, NotificationStore, PollController, PollUpdate, PushEvent,
    PushRegistrar, StatusFilter,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("powermon_sync=info")),
        )
        .init();

    let config = ClientConfig::from_env().context("invalid configuration")?;
    let store: Arc<dyn KeyValueStore> = Arc::new(
        FileStore::open(&config.data_dir)
            .with_context(|| format!("cannot open data dir {}", config.data_dir.display()))?,
    );
    let api = ApiClient::with_reqwest().context("cannot build HTTP client")?;
    let resolver = Arc::new(EndpointResolver::new(
        store.clone(),
        config.default_api_base.clone(),
    ));
    let identity = Arc::new(IdentityProvider::new(store.clone(), DeviceMetadata::detect()));
    info!(
        identity = %identity.identity().await,
        api = %resolver.resolve().await,
        data_dir = %config.data_dir.display(),
        "powermon-sync starting"
    );

    let notifications = Arc::new(NotificationStore::new(store.clone()));
    notifications.restore();
    let (push_tx, push_rx) = mpsc::channel(32);
    let (route_tx, mut route_rx) = mpsc::unbounded_channel();
    let listener = spawn_push_listener(notifications.clone(), push_rx, route_tx);
    tokio::spawn(forward_stdin_notifications(push_tx));

    let registrar = PushRegistrar::new(
        api.clone(),
        resolver.clone(),
        identity.clone(),
        Arc::new(StaticPushPlatform::new(config.push_token.clone())),
    );
    tokio::spawn(async move {
        registrar.register().await;
    });

    let mute = MuteSynchronizer::new(api.clone(), resolver.clone(), identity.clone(), store.clone());
    let muted = mute.snapshot().await;
    info!(count = muted.muted.len(), from_cache = muted.from_cache, "muted devices loaded");
    info!(range = load_graph_range(store.as_ref()).as_str(), "graph range");

    let controller = PollController::new(api, resolver, config.poll_interval);
    let mut devices = controller.subscribe(
        DeviceFeed::new(config.ordering()),
        StatusFilter::default(),
        |update: PollUpdate<DeviceRecord>| match update.status {
            FeedStatus::Healthy => {
                let online = update
                    .records
                    .iter()
                    .filter(|device| device.status == DeviceStatus::Online)
                    .count();
                info!(count = update.records.len(), online, "devices updated");
            }
            FeedStatus::Unreachable(reason) => warn!(%reason, "devices unreachable"),
        },
    );
    let mut monitors = controller.subscribe(
        MonitorFeed::new(config.ordering()),
        (),
        |update: PollUpdate<MonitorRecord>| match update.status {
            FeedStatus::Healthy => info!(count = update.records.len(), "monitors updated"),
            FeedStatus::Unreachable(reason) => warn!(%reason, "monitors unreachable"),
        },
    );

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                break;
            }
            Some(route) = route_rx.recv() => info!(?route, "notification opened"),
        }
    }

    devices.unsubscribe();
    monitors.unsubscribe();
    listener.stop().await;
    info!(
        devices = ?devices.diagnostics(),
        monitors = ?monitors.diagnostics(),
        notifications = notifications.list().len(),
        "powermon-sync stopped"
    );
    Ok(())
}

/// Each stdin line is a notification payload in JSON, standing in for the
/// OS push channel.
async fn forward_stdin_notifications(events: mpsc::Sender<PushEvent>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match serde_json::from_str::<IncomingNotification>(&line) {
                Ok(incoming) => {
                    if events.send(PushEvent::Received(incoming)).await.is_err() {
                        break;
                    }
                }
                Err(error) => warn!(%error, "ignoring malformed notification line"),
            },
            Ok(None) => break,
            Err(error) => {
                warn!(%error, "stdin read failed");
                break;
            }
        }
    }
    debug!("stdin notification source closed");
}
