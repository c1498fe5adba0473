use std::{sync::Arc, time::Duration};

use futures_util::future::BoxFuture;
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::{
    consts::{API_PREFIX, ERROR_BODY_MAX_CHARS, REQUEST_TIMEOUT_SECS},
    core::truncate_message,
    history::{PowerHistory, PowerHistoryWire, TimeRange},
    model::{
        DeleteResponseWire, DeviceDetailWire, DeviceListWire, DeviceRecord, DeviceStats,
        MonitorListWire, MonitorRecord, MuteRequestWire, MutedMachinesWire, PollCountWire,
        PushRegistrationWire, StatusFilter,
    },
    SyncError,
};

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub body: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The network seam. Production uses [`ReqwestTransport`]; tests script
/// responses.
pub trait HttpTransport: Send + Sync {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, SyncError>>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|error| SyncError::Transport {
                url: String::new(),
                message: format!("Failed to build HTTP client: {error}"),
            })?;
        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestTransport {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, SyncError>> {
        Box::pin(async move {
            let url_text = request.url.to_string();
            let mut builder = self.client.request(request.method, request.url);
            if let Some(body) = request.body {
                builder = builder.json(&body);
            }
            let response = builder.send().await.map_err(|error| SyncError::Transport {
                url: url_text.clone(),
                message: error.to_string(),
            })?;
            let status = response.status().as_u16();
            let body = response.text().await.map_err(|error| SyncError::Transport {
                url: url_text,
                message: format!("failed to read response body: {error}"),
            })?;
            Ok::<_, SyncError>(HttpResponse { status, body })
        })
    }
}

/// Typed calls against the monitoring service. Every method takes the
/// already-resolved base URL.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn HttpTransport>,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }

    pub fn with_reqwest() -> Result<Self, SyncError> {
        Ok(Self::new(Arc::new(ReqwestTransport::new()?)))
    }

    pub async fn fetch_status(
        &self,
        base: &str,
        filter: &StatusFilter,
    ) -> Result<Vec<DeviceRecord>, SyncError> {
        let url = api_url(base, &["status"], &filter.query_pairs())?;
        let wire: DeviceListWire = self.get_json(url).await?;
        Ok(wire.into_records())
    }

    pub async fn fetch_monitors(&self, base: &str) -> Result<Vec<MonitorRecord>, SyncError> {
        let url = api_url(base, &["monitors"], &[])?;
        let wire: MonitorListWire = self.get_json(url).await?;
        Ok(wire.into_records())
    }

    pub async fn fetch_device(
        &self,
        base: &str,
        mac: &str,
    ) -> Result<Option<DeviceRecord>, SyncError> {
        let url = api_url(base, &["devices", mac], &[])?;
        let wire: DeviceDetailWire = self.get_json(url).await?;
        Ok(match wire {
            DeviceDetailWire::Many(records) => records.into_iter().next(),
            DeviceDetailWire::One(record) => Some(record),
        })
    }

    /// Number of stored polls for a device, or `None` when the service
    /// cannot tell. Used to confirm destructive deletes.
    pub async fn check_polls(&self, base: &str, mac: &str) -> Option<u64> {
        let url = api_url(base, &["checkPoll", mac], &[]).ok()?;
        let response = self.execute(Method::POST, url, None).await.ok()?;
        let wire: PollCountWire = decode(&response).ok()?;
        wire.count.and_then(|count| count.as_u64())
    }

    /// Returns `true` when the service confirms the deletion.
    pub async fn delete_device(&self, base: &str, mac: &str) -> Result<bool, SyncError> {
        let url = api_url(base, &["devices", mac], &[])?;
        let response = self.execute(Method::DELETE, url, None).await?;
        let wire: DeleteResponseWire = decode(&response)?;
        Ok(wire.status.as_deref() == Some("deleted"))
    }

    pub async fn reassign_monitor(
        &self,
        base: &str,
        monitor_id: i64,
        machine_name: &str,
    ) -> Result<(), SyncError> {
        let id = monitor_id.to_string();
        let url = api_url(
            base,
            &["monitors", &id, "reassign"],
            &[("machine_name", machine_name.to_string())],
        )?;
        self.execute(Method::POST, url, None).await.map(|_| ())
    }

    pub async fn unassign_monitor(&self, base: &str, monitor_id: i64) -> Result<(), SyncError> {
        let id = monitor_id.to_string();
        let url = api_url(base, &["monitors", &id, "unassign"], &[])?;
        self.execute(Method::POST, url, None).await.map(|_| ())
    }

    pub async fn delete_monitor(&self, base: &str, monitor_id: i64) -> Result<(), SyncError> {
        let id = monitor_id.to_string();
        let url = api_url(base, &["monitors", &id], &[])?;
        self.execute(Method::DELETE, url, None).await.map(|_| ())
    }

    pub async fn machine_types(&self, base: &str) -> Result<Vec<String>, SyncError> {
        self.get_json(api_url(base, &["machine_types"], &[])?).await
    }

    pub async fn locations(&self, base: &str) -> Result<Vec<String>, SyncError> {
        self.get_json(api_url(base, &["locations"], &[])?).await
    }

    pub async fn device_stats(&self, base: &str) -> Result<DeviceStats, SyncError> {
        self.get_json(api_url(base, &["device_stats"], &[])?).await
    }

    pub async fn power_history(
        &self,
        base: &str,
        mac: &str,
        range: TimeRange,
    ) -> Result<PowerHistory, SyncError> {
        let url = api_url(
            base,
            &["power"],
            &[
                ("mac", mac.to_string()),
                ("time_range", range.as_str().to_string()),
                ("bucket", range.bucket().to_string()),
            ],
        )?;
        let wire: PowerHistoryWire = self.get_json(url).await?;
        Ok(wire.into_history())
    }

    pub async fn muted_machines(
        &self,
        base: &str,
        identity: &str,
    ) -> Result<Vec<String>, SyncError> {
        let url = api_url(base, &["devices", identity, "muted-machines"], &[])?;
        let wire: MutedMachinesWire = self.get_json(url).await?;
        Ok(wire.muted_machines)
    }

    pub async fn mute_machine(
        &self,
        base: &str,
        identity: &str,
        key: &str,
    ) -> Result<(), SyncError> {
        let url = api_url(base, &["devices", identity, "muted-machines"], &[])?;
        let body = to_body(&MuteRequestWire { machine_id: key })?;
        self.execute(Method::POST, url, Some(body)).await.map(|_| ())
    }

    pub async fn unmute_machine(
        &self,
        base: &str,
        identity: &str,
        key: &str,
    ) -> Result<(), SyncError> {
        let url = api_url(base, &["devices", identity, "muted-machines", key], &[])?;
        self.execute(Method::DELETE, url, None).await.map(|_| ())
    }

    pub async fn register_push(
        &self,
        base: &str,
        token: &str,
        device_name: &str,
    ) -> Result<(), SyncError> {
        let url = api_url(base, &["notifications", "register"], &[])?;
        let body = to_body(&PushRegistrationWire { token, device_name })?;
        self.execute(Method::POST, url, Some(body)).await.map(|_| ())
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, SyncError> {
        let response = self.execute(Method::GET, url, None).await?;
        decode(&response)
    }

    /// Sends the request and maps any non-2xx status to a service error
    /// carrying the reason the service gave.
    async fn execute(
        &self,
        method: Method,
        url: Url,
        body: Option<Value>,
    ) -> Result<HttpResponse, SyncError> {
        debug!(method = %method, url = %url, "api: request");
        let response = self.transport.send(HttpRequest { method, url, body }).await?;
        if !response.is_success() {
            let reason = service_reason(response.status, &response.body);
            debug!(status = response.status, reason = %reason, "api: service error");
            return Err(SyncError::Service {
                status: response.status,
                reason,
            });
        }
        Ok(response)
    }
}

/// `{base}/api/v1/{segments...}?{query}` with every segment percent-encoded.
pub(crate) fn api_url(
    base: &str,
    segments: &[&str],
    query: &[(&str, String)],
) -> Result<Url, SyncError> {
    if base.trim().is_empty() {
        return Err(SyncError::InvalidInput("API endpoint is not configured".to_string()));
    }
    let mut url = Url::parse(base)
        .map_err(|error| SyncError::InvalidInput(format!("Invalid API URL {base:?}: {error}")))?;
    url.path_segments_mut()
        .map_err(|_| SyncError::InvalidInput(format!("API URL {base:?} cannot carry a path")))?
        .pop_if_empty()
        .extend(API_PREFIX)
        .extend(segments);
    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in query {
            pairs.append_pair(key, value);
        }
    }
    Ok(url)
}

/// Pulls a human-readable reason out of an error body:
/// `detail.reason`, `detail`, `message`, `error`, else the raw text.
pub(crate) fn service_reason(status: u16, body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        let candidates = [
            json.pointer("/detail/reason"),
            json.get("detail"),
            json.get("message"),
            json.get("error"),
        ];
        for candidate in candidates.into_iter().flatten() {
            match candidate {
                Value::Null => continue,
                Value::String(text) if text.trim().is_empty() => continue,
                Value::String(text) => return text.clone(),
                other => return other.to_string(),
            }
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {status}")
    } else {
        truncate_message(trimmed, ERROR_BODY_MAX_CHARS)
    }
}

fn decode<T: DeserializeOwned>(response: &HttpResponse) -> Result<T, SyncError> {
    serde_json::from_str(&response.body).map_err(|error| {
        SyncError::Decode(format!(
            "{error} (body: {})",
            truncate_message(&response.body, ERROR_BODY_MAX_CHARS)
        ))
    })
}

fn to_body<T: serde::Serialize>(value: &T) -> Result<Value, SyncError> {
    serde_json::to_value(value)
        .map_err(|error| SyncError::Decode(format!("failed to encode request body: {error}")))
}
