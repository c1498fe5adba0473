#[cfg(unix)]
use std::{fs, os::unix::fs::PermissionsExt as _};
use std::{
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use tracing::debug;

static FILE_SUFFIX_COUNTER: AtomicU64 = AtomicU64::new(0);

pub(crate) fn restrict_file_permissions(path: &Path) {
    #[cfg(unix)]
    if path.exists() {
        if let Err(error) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
            debug!(path = %path.display(), %error, "restrict_file_permissions failed");
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

pub(crate) fn truncate_message(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }

    let truncated: String = input.chars().take(max_chars).collect();
    format!("{truncated}...")
}

pub(crate) fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub(crate) fn unique_time_suffix() -> u64 {
    let counter = FILE_SUFFIX_COUNTER.fetch_add(1, Ordering::Relaxed);
    unix_now_secs().wrapping_mul(1_000).wrapping_add(counter)
}
