//! Client-side synchronization core for the Powermon monitoring app.
//!
//! Resolves the service endpoint, derives a stable installation identity,
//! polls device and monitor lists, keeps muted-device preferences in sync
//! with an offline cache, and maintains the local push notification log.

pub mod api;
mod consts;
mod core;
pub mod diagnostics;
pub mod endpoint;
mod error;
pub mod history;
pub mod identity;
pub mod model;
pub mod mute;
pub mod notifications;
pub mod ordering;
pub mod poller;
pub mod settings;
pub mod store;

pub use api::{ApiClient, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
pub use diagnostics::{PollDiagnostics, PollState};
pub use endpoint::EndpointResolver;
pub use error::SyncError;
pub use history::{PowerHistory, PowerPoint, TimeRange};
pub use identity::{DeviceMetadata, IdentityProvider};
pub use model::{DeviceRecord, DeviceStatus, MonitorRecord, NotificationRecord, StatusFilter};
pub use mute::{MuteSnapshot, MuteSynchronizer};
pub use notifications::{
    NotificationRoute, NotificationStore, PushEvent, PushListener, PushPlatform, PushRegistrar,
    RegistrationOutcome,
};
pub use ordering::RecordOrdering;
pub use poller::{DeviceFeed, Feed, FeedStatus, MonitorFeed, PollController, PollUpdate, Subscription};
pub use settings::ClientConfig;
pub use store::{FileStore, KeyValueStore, MemoryStore, StoreError};
