//! Pending-change lifecycle and PR status mapping
//!
//! A pending change is one ticket-affecting change request filed against
//! the external forge. The forge reports a pile of noisy, sometimes-stale
//! attributes; `map_status` collapses them into one lifecycle status code
//! with a fixed priority order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Combined CI checks state as reported by the forge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksState {
    Pass,
    Fail,
    Running,
    #[default]
    #[serde(other)]
    Unknown,
}

impl ChecksState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksState::Pass => "pass",
            ChecksState::Fail => "fail",
            ChecksState::Running => "running",
            ChecksState::Unknown => "unknown",
        }
    }

    /// Forges report failures as either "fail" or "error"; both collapse
    /// to `Fail`.
    pub fn parse(s: &str) -> Self {
        match s {
            "pass" | "success" => ChecksState::Pass,
            "fail" | "failure" | "error" => ChecksState::Fail,
            "running" | "pending" => ChecksState::Running,
            _ => ChecksState::Unknown,
        }
    }
}

/// Mergeable-state strings the forge uses that we branch on. Anything
/// else lands in the default bucket.
pub const MERGEABLE_CLEAN: &str = "clean";
pub const MERGEABLE_DIRTY: &str = "dirty";
pub const MERGEABLE_BLOCKED: &str = "blocked";

/// Lifecycle status of a pending change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    /// Change requested but no PR exists on the forge yet
    CreatingPr,
    PendingChecks,
    WaitingReview,
    Mergeable,
    AutoMergeEnabled,
    Merged,
    Conflict,
    Failed,
}

impl ChangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeStatus::CreatingPr => "creating_pr",
            ChangeStatus::PendingChecks => "pending_checks",
            ChangeStatus::WaitingReview => "waiting_review",
            ChangeStatus::Mergeable => "mergeable",
            ChangeStatus::AutoMergeEnabled => "auto_merge_enabled",
            ChangeStatus::Merged => "merged",
            ChangeStatus::Conflict => "conflict",
            ChangeStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "creating_pr" => ChangeStatus::CreatingPr,
            "waiting_review" => ChangeStatus::WaitingReview,
            "mergeable" => ChangeStatus::Mergeable,
            "auto_merge_enabled" => ChangeStatus::AutoMergeEnabled,
            "merged" => ChangeStatus::Merged,
            "conflict" => ChangeStatus::Conflict,
            "failed" => ChangeStatus::Failed,
            _ => ChangeStatus::PendingChecks,
        }
    }

    /// Terminal statuses never leave the state they are in.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChangeStatus::Merged | ChangeStatus::Failed)
    }
}

/// Map raw PR attributes to a lifecycle status.
///
/// First matching rule wins, and the order is deliberate: a merged PR is
/// merged no matter how stale its other fields are; a conflicting PR is a
/// conflict even with green checks; failing checks surface before a
/// review block so the actionable blocker shows first.
pub fn map_status(
    merged: Option<bool>,
    mergeable_state: Option<&str>,
    checks_state: ChecksState,
) -> ChangeStatus {
    if merged == Some(true) {
        return ChangeStatus::Merged;
    }
    if mergeable_state == Some(MERGEABLE_DIRTY) {
        return ChangeStatus::Conflict;
    }
    if checks_state == ChecksState::Fail {
        return ChangeStatus::PendingChecks;
    }
    if mergeable_state == Some(MERGEABLE_BLOCKED) {
        return ChangeStatus::WaitingReview;
    }
    if mergeable_state == Some(MERGEABLE_CLEAN) && checks_state == ChecksState::Pass {
        return ChangeStatus::Mergeable;
    }
    ChangeStatus::PendingChecks
}

/// Derive the stored status for a pending-change row on refresh.
///
/// Wraps `map_status` with the lifecycle edges the raw attributes alone
/// cannot express: a change without a PR number is still being created, a
/// closed-but-unmerged PR is failed, and an armed auto-merge on an
/// otherwise mergeable PR is reported as such.
pub fn derive_status(
    number: Option<i64>,
    open: bool,
    merged: Option<bool>,
    mergeable_state: Option<&str>,
    checks_state: ChecksState,
    auto_merge: bool,
) -> ChangeStatus {
    if number.is_none() {
        return ChangeStatus::CreatingPr;
    }
    if !open && merged != Some(true) {
        return ChangeStatus::Failed;
    }
    let status = map_status(merged, mergeable_state, checks_state);
    if status == ChangeStatus::Mergeable && auto_merge {
        return ChangeStatus::AutoMergeEnabled;
    }
    status
}

/// A cached pending-change row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingChange {
    /// Ticket key as supplied by the sync job: a short ID or a full ID
    pub ticket_key: String,
    pub number: Option<i64>,
    pub url: Option<String>,
    pub title: Option<String>,
    pub merged: Option<bool>,
    pub mergeable_state: Option<String>,
    #[serde(default)]
    pub checks_state: ChecksState,
    pub open: bool,
    pub status: ChangeStatus,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl PendingChange {
    /// An unresolved change still counts toward a ticket's pending work:
    /// not merged and not closed-without-merge.
    pub fn is_unresolved(&self) -> bool {
        !self.status.is_terminal()
    }
}
