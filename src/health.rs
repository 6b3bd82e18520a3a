//! Sync health classification
//!
//! The cache is only useful if callers can tell how much to trust it, so
//! every read derives a health snapshot from the repository's sync
//! bookkeeping. Classification is total: any combination of missing or
//! stale fields maps to a defined state.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::models::SyncStatus;

/// Freshness/error state of the cache relative to the authoritative source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Stale,
    Error,
    Syncing,
    NeverSynced,
}

/// Derived health snapshot. Recomputed on every read, never persisted.
///
/// `age_ms`, `is_stale` and `has_error` are filled in regardless of the
/// final state so callers can render detail like "healthy, goes stale in
/// three minutes".
#[derive(Debug, Clone, Serialize)]
pub struct SyncHealth {
    pub state: HealthState,
    /// Time since the last successful sync; absent if there never was one.
    pub age_ms: Option<i64>,
    /// How far past the staleness threshold the cache is; 0 while fresh.
    pub stale_age_ms: Option<i64>,
    pub stale_after_ms: i64,
    pub is_stale: bool,
    pub has_error: bool,
    pub error_message: Option<String>,
}

/// Classify sync bookkeeping into a health snapshot.
///
/// Precedence: never-synced, then syncing (an in-flight sync masks both
/// error and staleness), then error, then the age check against
/// `stale_after`. The threshold is injected because call sites use
/// different freshness expectations for the same repository.
pub fn classify(
    sync_status: SyncStatus,
    sync_error: Option<&str>,
    last_synced_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> SyncHealth {
    let stale_after_ms = stale_after.num_milliseconds();
    let age_ms = last_synced_at.map(|t| (now - t).num_milliseconds());
    let is_stale = age_ms.is_some_and(|age| age > stale_after_ms);
    let stale_age_ms = age_ms.map(|age| (age - stale_after_ms).max(0));
    let has_error = sync_error.is_some();

    let state = if last_synced_at.is_none() {
        HealthState::NeverSynced
    } else if sync_status == SyncStatus::Syncing {
        HealthState::Syncing
    } else if has_error {
        HealthState::Error
    } else if is_stale {
        HealthState::Stale
    } else {
        HealthState::Healthy
    };

    SyncHealth {
        state,
        age_ms,
        stale_age_ms,
        stale_after_ms,
        is_stale,
        has_error,
        error_message: sync_error.map(str::to_string),
    }
}
