use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use futures_util::future::{BoxFuture, OptionFuture};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use crate::{
    api::ApiClient,
    consts::MIN_POLL_INTERVAL,
    diagnostics::{DiagnosticsCell, PollDiagnostics, PollState},
    endpoint::EndpointResolver,
    model::{DeviceRecord, MonitorRecord, StatusFilter},
    ordering::RecordOrdering,
    SyncError,
};

/// A list the poller knows how to fetch.
pub trait Feed: Send + Sync + 'static {
    type Record: Clone + Send + 'static;
    type Filter: Clone + Send + Sync + 'static;

    fn name(&self) -> &'static str;

    fn fetch<'a>(
        &'a self,
        api: &'a ApiClient,
        base: &'a str,
        filter: &'a Self::Filter,
    ) -> BoxFuture<'a, Result<Vec<Self::Record>, SyncError>>;
}

/// `/status`, ordered by type, location, then name.
pub struct DeviceFeed {
    ordering: RecordOrdering,
}

impl DeviceFeed {
    pub fn new(ordering: RecordOrdering) -> Self {
        Self { ordering }
    }
}

impl Feed for DeviceFeed {
    type Record = DeviceRecord;
    type Filter = StatusFilter;

    fn name(&self) -> &'static str {
        "devices"
    }

    fn fetch<'a>(
        &'a self,
        api: &'a ApiClient,
        base: &'a str,
        filter: &'a StatusFilter,
    ) -> BoxFuture<'a, Result<Vec<DeviceRecord>, SyncError>> {
        Box::pin(async move {
            let mut devices = api.fetch_status(base, filter).await?;
            self.ordering.sort_devices(&mut devices);
            Ok::<_, SyncError>(devices)
        })
    }
}

pub struct MonitorFeed {
    ordering: RecordOrdering,
}

impl MonitorFeed {
    pub fn new(ordering: RecordOrdering) -> Self {
        Self { ordering }
    }
}

impl Feed for MonitorFeed {
    type Record = MonitorRecord;
    type Filter = ();

    fn name(&self) -> &'static str {
        "monitors"
    }

    fn fetch<'a>(
        &'a self,
        api: &'a ApiClient,
        base: &'a str,
        _filter: &'a (),
    ) -> BoxFuture<'a, Result<Vec<MonitorRecord>, SyncError>> {
        Box::pin(async move {
            let mut monitors = api.fetch_monitors(base).await?;
            self.ordering.sort_monitors(&mut monitors);
            Ok::<_, SyncError>(monitors)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedStatus {
    Healthy,
    /// The last fetch failed; records are empty.
    Unreachable(String),
}

#[derive(Debug, Clone)]
pub struct PollUpdate<R> {
    pub records: Vec<R>,
    pub status: FeedStatus,
}

type Callback<R> = Box<dyn FnMut(PollUpdate<R>) + Send>;

/// Delivery is gated on the generation that `set_filter` bumps, so once it
/// returns no older result can start a callback. The callback runs outside
/// the lock, which lets it call back into the subscription.
struct Gate<R> {
    generation: u64,
    callback: Option<Callback<R>>,
    closed: bool,
}

struct Shared<R> {
    gate: Mutex<Gate<R>>,
    diagnostics: DiagnosticsCell,
}

impl<R> Shared<R> {
    fn deliver(&self, generation: u64, update: PollUpdate<R>) -> bool {
        let mut callback = {
            let Ok(mut gate) = self.gate.lock() else {
                return false;
            };
            if gate.closed || gate.generation != generation {
                return false;
            }
            match gate.callback.take() {
                Some(callback) => callback,
                None => return false,
            }
        };

        callback(update);

        if let Ok(mut gate) = self.gate.lock() {
            if !gate.closed {
                gate.callback = Some(callback);
            }
        }
        true
    }
}

enum Command<Q> {
    SetFilter { filter: Q, generation: u64 },
    Refresh,
}

enum FetchOutcome<R> {
    NotReady,
    Done(Result<Vec<R>, SyncError>),
}

/// Starts recurring fetches for list screens.
#[derive(Clone)]
pub struct PollController {
    api: ApiClient,
    resolver: Arc<EndpointResolver>,
    interval: Duration,
}

impl PollController {
    /// `interval` is raised to at least `MIN_POLL_INTERVAL`.
    pub fn new(api: ApiClient, resolver: Arc<EndpointResolver>, interval: Duration) -> Self {
        if interval < MIN_POLL_INTERVAL {
            warn!(interval_ms = interval.as_millis() as u64, "poller: interval too short, clamping");
        }
        Self {
            api,
            resolver,
            interval: interval.max(MIN_POLL_INTERVAL),
        }
    }

    /// Fetches immediately, then every interval, until the returned
    /// subscription is unsubscribed or dropped. Must be called inside a
    /// tokio runtime.
    pub fn subscribe<F, C>(&self, feed: F, filter: F::Filter, on_update: C) -> Subscription<F>
    where
        F: Feed,
        C: FnMut(PollUpdate<F::Record>) + Send + 'static,
    {
        let shared = Arc::new(Shared {
            gate: Mutex::new(Gate {
                generation: 0,
                callback: Some(Box::new(on_update)),
                closed: false,
            }),
            diagnostics: DiagnosticsCell::default(),
        });
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        info!(feed = feed.name(), interval_ms = self.interval.as_millis() as u64, "poller: subscribed");
        let task = tokio::spawn(run_poll_loop(
            PollTask {
                feed: Arc::new(feed),
                api: self.api.clone(),
                resolver: self.resolver.clone(),
                interval: self.interval,
                shared: shared.clone(),
            },
            filter,
            command_rx,
            stop_rx,
        ));

        Subscription {
            shared,
            commands: command_tx,
            stop_tx,
            task: Some(task),
        }
    }
}

/// Handle to one screen's polling. Dropping it stops the polling.
pub struct Subscription<F: Feed> {
    shared: Arc<Shared<F::Record>>,
    commands: mpsc::UnboundedSender<Command<F::Filter>>,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl<F: Feed> Subscription<F> {
    /// Cancels the pending timer and any in-flight fetch, then restarts with
    /// `filter`. Safe to call from inside the callback; results fetched with
    /// the previous filter are never delivered after this returns.
    pub fn set_filter(&self, filter: F::Filter) {
        let generation = match self.shared.gate.lock() {
            Ok(mut gate) => {
                gate.generation = gate.generation.wrapping_add(1);
                gate.generation
            }
            Err(_) => return,
        };
        let _ = self.commands.send(Command::SetFilter { filter, generation });
    }

    /// One out-of-band fetch without resetting the timer.
    pub fn refresh(&self) {
        let _ = self.commands.send(Command::Refresh);
    }

    /// Idempotent. No callback starts after this returns; one already running
    /// on the poll task finishes and is then dropped.
    pub fn unsubscribe(&mut self) {
        if let Ok(mut gate) = self.shared.gate.lock() {
            gate.closed = true;
            gate.callback = None;
        }
        let _ = self.stop_tx.send(true);
        if self.task.take().is_some() {
            self.shared.diagnostics.set_state(PollState::Stopped);
            debug!("poller: unsubscribed");
        }
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn diagnostics(&self) -> PollDiagnostics {
        self.shared.diagnostics.snapshot()
    }
}

impl<F: Feed> Drop for Subscription<F> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

struct PollTask<F: Feed> {
    feed: Arc<F>,
    api: ApiClient,
    resolver: Arc<EndpointResolver>,
    interval: Duration,
    shared: Arc<Shared<F::Record>>,
}

impl<F: Feed> PollTask<F> {
    fn start_fetch(&self, filter: &F::Filter) -> BoxFuture<'static, FetchOutcome<F::Record>> {
        let feed = self.feed.clone();
        let api = self.api.clone();
        let resolver = self.resolver.clone();
        let shared = self.shared.clone();
        let filter = filter.clone();

        Box::pin(async move {
            let base = resolver.resolve().await;
            if base.is_empty() {
                return FetchOutcome::NotReady;
            }
            shared.diagnostics.fetch_started();
            let _guard = InFlightGuard(&shared.diagnostics);
            FetchOutcome::Done(feed.fetch(&api, &base, &filter).await)
        })
    }

    fn finish(&self, generation: u64, outcome: FetchOutcome<F::Record>) {
        let update = match outcome {
            FetchOutcome::NotReady => {
                debug!(feed = self.feed.name(), "poller: endpoint not configured, skipping fetch");
                return;
            }
            FetchOutcome::Done(Ok(records)) => {
                self.shared.diagnostics.fetch_succeeded();
                debug!(feed = self.feed.name(), count = records.len(), "poller: fetched");
                PollUpdate {
                    records,
                    status: FeedStatus::Healthy,
                }
            }
            FetchOutcome::Done(Err(error)) => {
                let reason = error.reason();
                self.shared.diagnostics.fetch_failed(&reason);
                warn!(feed = self.feed.name(), %error, "poller: fetch failed");
                PollUpdate {
                    records: Vec::new(),
                    status: FeedStatus::Unreachable(reason),
                }
            }
        };

        if !self.shared.deliver(generation, update) {
            self.shared.diagnostics.stale_discarded();
            debug!(feed = self.feed.name(), generation, "poller: discarded stale result");
        }
    }
}

struct InFlightGuard<'a>(&'a DiagnosticsCell);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_ended();
    }
}

async fn run_poll_loop<F: Feed>(
    task: PollTask<F>,
    mut filter: F::Filter,
    mut commands: mpsc::UnboundedReceiver<Command<F::Filter>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let diagnostics = &task.shared.diagnostics;
    let mut generation: u64 = 0;

    'cycle: loop {
        diagnostics.set_generation(generation);
        diagnostics.set_state(PollState::Resolving);
        let base = task.resolver.resolve().await;
        if base.is_empty() {
            warn!(feed = task.feed.name(), "poller: no API endpoint configured");
        }
        diagnostics.set_state(PollState::Polling);

        let mut ticker = tokio::time::interval(task.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight: Option<BoxFuture<'static, FetchOutcome<F::Record>>> = None;
        let mut refresh_pending = false;

        loop {
            tokio::select! {
                biased;
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break 'cycle;
                    }
                }
                command = commands.recv() => match command {
                    None => break 'cycle,
                    Some(Command::SetFilter { filter: next, generation: next_generation }) => {
                        if in_flight.take().is_some() {
                            diagnostics.stale_discarded();
                        }
                        filter = next;
                        generation = next_generation;
                        debug!(feed = task.feed.name(), generation, "poller: filter changed, restarting");
                        continue 'cycle;
                    }
                    Some(Command::Refresh) => {
                        if in_flight.is_some() {
                            refresh_pending = true;
                        } else {
                            in_flight = Some(task.start_fetch(&filter));
                        }
                    }
                },
                Some(outcome) = OptionFuture::from(in_flight.as_mut()), if in_flight.is_some() => {
                    in_flight = None;
                    task.finish(generation, outcome);
                    if refresh_pending {
                        refresh_pending = false;
                        in_flight = Some(task.start_fetch(&filter));
                    }
                }
                _ = ticker.tick() => {
                    if in_flight.is_some() {
                        debug!(feed = task.feed.name(), "poller: tick skipped, request in flight");
                    } else {
                        in_flight = Some(task.start_fetch(&filter));
                    }
                }
            }
        }
    }

    diagnostics.set_state(PollState::Stopped);
    info!(feed = task.feed.name(), "poller: stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use reqwest::Method;
    use serde_json::json;
    use tokio::{sync::mpsc, time::Instant};

    use super::*;
    use crate::{
        api::testing::{FakeTransport, Reply},
        model::StatusFilter,
        store::MemoryStore,
    };

    const STATUS: &str = "/api/v1/status";

    fn controller(fake: Arc<FakeTransport>, base: &str) -> PollController {
        let resolver = Arc::new(EndpointResolver::new(Arc::new(MemoryStore::new()), base));
        PollController::new(ApiClient::new(fake), resolver, Duration::from_secs(5))
    }

    fn device_feed() -> DeviceFeed {
        DeviceFeed::new(RecordOrdering::new(vec!["IPM".into()], Vec::new()))
    }

    type Received = mpsc::UnboundedReceiver<(Instant, PollUpdate<DeviceRecord>)>;

    fn recorder() -> (
        impl FnMut(PollUpdate<DeviceRecord>) + Send + 'static,
        Received,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            move |update| {
                let _ = tx.send((Instant::now(), update));
            },
            rx,
        )
    }

    fn names(update: &PollUpdate<DeviceRecord>) -> Vec<String> {
        update.records.iter().map(|d| d.name.clone()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn fetches_immediately_then_every_interval() {
        let fake = FakeTransport::new();
        fake.route(
            Method::GET,
            STATUS,
            vec![Reply::json(200, json!([{ "mac": "a", "name": "Press" }]))],
        );
        let (callback, mut rx) = recorder();
        let start = Instant::now();
        let _sub = controller(fake.clone(), "http://svc.test").subscribe(
            device_feed(),
            StatusFilter::default(),
            callback,
        );

        let (first, update) = rx.recv().await.unwrap();
        assert_eq!(first - start, Duration::ZERO);
        assert_eq!(update.status, FeedStatus::Healthy);
        assert_eq!(names(&update), vec!["Press"]);

        let (second, _) = rx.recv().await.unwrap();
        assert_eq!(second - start, Duration::from_secs(5));
        assert_eq!(fake.requests().len(), 2);
        assert_eq!(fake.max_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_requests_never_overlap() {
        let fake = FakeTransport::new();
        fake.route(
            Method::GET,
            STATUS,
            vec![Reply::json(200, json!([])).after(Duration::from_secs(7))],
        );
        let (callback, mut rx) = recorder();
        let start = Instant::now();
        let sub = controller(fake.clone(), "http://svc.test").subscribe(
            device_feed(),
            StatusFilter::default(),
            callback,
        );

        let (first, _) = rx.recv().await.unwrap();
        assert_eq!(first - start, Duration::from_secs(7));
        let (second, _) = rx.recv().await.unwrap();
        // Tick at 5s is skipped; next tick at 10s starts the second request.
        assert_eq!(second - start, Duration::from_secs(17));

        assert_eq!(fake.max_in_flight(), 1);
        assert_eq!(sub.diagnostics().max_in_flight, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn filter_change_supersedes_in_flight_request() {
        let fake = FakeTransport::new();
        fake.route(
            Method::GET,
            STATUS,
            vec![
                Reply::json(200, json!([{ "mac": "a", "name": "Old" }]))
                    .after(Duration::from_secs(3)),
                Reply::json(200, json!([{ "mac": "b", "name": "New" }])),
            ],
        );
        let (callback, mut rx) = recorder();
        let sub = controller(fake.clone(), "http://svc.test").subscribe(
            device_feed(),
            StatusFilter::default(),
            callback,
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        sub.set_filter(StatusFilter::default().with_location("Hall B"));

        let (_, update) = rx.recv().await.unwrap();
        assert_eq!(names(&update), vec!["New"]);

        tokio::time::sleep(Duration::from_secs(4)).await;
        while let Ok((_, update)) = rx.try_recv() {
            assert_eq!(names(&update), vec!["New"]);
        }

        let requests = fake.requests();
        assert!(requests[1].url.ends_with("?location=Hall+B"));
        let diag = sub.diagnostics();
        assert!(diag.stale_discarded >= 1);
        assert_eq!(diag.generation, 1);
        assert_eq!(diag.max_in_flight, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn no_callback_after_unsubscribe() {
        let fake = FakeTransport::new();
        fake.route(Method::GET, STATUS, vec![Reply::json(200, json!([]))]);
        let (callback, mut rx) = recorder();
        let mut sub = controller(fake.clone(), "http://svc.test").subscribe(
            device_feed(),
            StatusFilter::default(),
            callback,
        );

        rx.recv().await.unwrap();
        sub.unsubscribe();
        let sent = fake.requests().len();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(fake.requests().len(), sent);
        assert_eq!(sub.diagnostics().state, PollState::Stopped);
        assert!(!sub.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_subscription_stops_polling() {
        let fake = FakeTransport::new();
        fake.route(Method::GET, STATUS, vec![Reply::json(200, json!([]))]);
        let (callback, mut rx) = recorder();
        let sub = controller(fake.clone(), "http://svc.test").subscribe(
            device_feed(),
            StatusFilter::default(),
            callback,
        );

        rx.recv().await.unwrap();
        drop(sub);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fake.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_reports_unreachable_with_empty_records() {
        let fake = FakeTransport::new();
        fake.route(Method::GET, STATUS, vec![Reply::unreachable()]);
        let (callback, mut rx) = recorder();
        let sub = controller(fake.clone(), "http://svc.test").subscribe(
            device_feed(),
            StatusFilter::default(),
            callback,
        );

        let (_, update) = rx.recv().await.unwrap();
        assert!(update.records.is_empty());
        assert!(matches!(update.status, FeedStatus::Unreachable(_)));
        assert!(sub.diagnostics().last_error.is_some());

        // No faster retry than the interval.
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fake.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_during_flight_runs_after_completion() {
        let fake = FakeTransport::new();
        fake.route(
            Method::GET,
            STATUS,
            vec![Reply::json(200, json!([])).after(Duration::from_secs(2))],
        );
        let (callback, mut rx) = recorder();
        let start = Instant::now();
        let sub = controller(fake.clone(), "http://svc.test").subscribe(
            device_feed(),
            StatusFilter::default(),
            callback,
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        sub.refresh();

        let (first, _) = rx.recv().await.unwrap();
        let (second, _) = rx.recv().await.unwrap();
        assert_eq!(first - start, Duration::from_secs(2));
        assert_eq!(second - start, Duration::from_secs(4));
        assert_eq!(fake.max_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unconfigured_endpoint_skips_work() {
        let fake = FakeTransport::new();
        let (callback, mut rx) = recorder();
        let sub = controller(fake.clone(), "").subscribe(
            device_feed(),
            StatusFilter::default(),
            callback,
        );

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(rx.try_recv().is_err());
        assert!(fake.requests().is_empty());
        assert_eq!(sub.diagnostics().fetches_started, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_feed_orders_by_id() {
        let fake = FakeTransport::new();
        fake.route(
            Method::GET,
            "/api/v1/monitors",
            vec![Reply::json(200, json!({ "monitors": [{ "id": 5 }, { "id": 2 }] }))],
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = controller(fake, "http://svc.test").subscribe(
            MonitorFeed::new(RecordOrdering::new(Vec::new(), Vec::new())),
            (),
            move |update: PollUpdate<MonitorRecord>| {
                let _ = tx.send(update);
            },
        );

        let update = rx.recv().await.unwrap();
        assert_eq!(update.records.iter().map(|m| m.id).collect::<Vec<_>>(), vec![2, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn callback_can_change_the_filter() {
        let fake = FakeTransport::new();
        fake.route(Method::GET, STATUS, vec![Reply::json(200, json!([{ "mac": "a", "name": "Press" }]))]);
        let handle: Arc<std::sync::OnceLock<Subscription<DeviceFeed>>> = Arc::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let start = Instant::now();

        let callback_handle = handle.clone();
        let mut switched = false;
        let sub = controller(fake.clone(), "http://svc.test").subscribe(
            device_feed(),
            StatusFilter::default(),
            move |_: PollUpdate<DeviceRecord>| {
                if !switched {
                    switched = true;
                    if let Some(sub) = callback_handle.get() {
                        sub.set_filter(StatusFilter::default().with_location("X"));
                    }
                }
                let _ = tx.send(Instant::now());
            },
        );
        assert!(handle.set(sub).is_ok());

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first - start, Duration::ZERO);
        assert_eq!(second - start, Duration::ZERO);

        let requests = fake.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].url.ends_with("?location=X"));
        let diag = handle.get().unwrap().diagnostics();
        assert_eq!(diag.generation, 1);
        assert_eq!(diag.fetches_completed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_is_clamped() {
        let fake = FakeTransport::new();
        fake.route(Method::GET, STATUS, vec![Reply::json(200, json!([]))]);
        let resolver = Arc::new(EndpointResolver::new(Arc::new(MemoryStore::new()), "http://svc.test"));
        let controller = PollController::new(ApiClient::new(fake.clone()), resolver, Duration::ZERO);
        let (callback, mut rx) = recorder();
        let start = Instant::now();
        let sub = controller.subscribe(device_feed(), StatusFilter::default(), callback);

        rx.recv().await.unwrap();
        let (second, _) = rx.recv().await.unwrap();
        assert_eq!(second - start, MIN_POLL_INTERVAL);
        assert!(sub.is_active());
    }
}
