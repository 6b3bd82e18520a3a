//! Cached ticket state (shared types between the sync job and the server)
//!
//! Tickets live as files in a version-controlled repository; the sync job
//! pushes snapshots of them here. These types are the normalized shapes the
//! rest of the server works with.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Workflow state of a ticket as recorded in its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    #[default]
    Backlog,
    Ready,
    InProgress,
    Blocked,
    Done,
    #[serde(other)]
    Unknown,
}

impl WorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Backlog => "backlog",
            WorkflowState::Ready => "ready",
            WorkflowState::InProgress => "in_progress",
            WorkflowState::Blocked => "blocked",
            WorkflowState::Done => "done",
            WorkflowState::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "backlog" => WorkflowState::Backlog,
            "ready" => WorkflowState::Ready,
            "in_progress" => WorkflowState::InProgress,
            "blocked" => WorkflowState::Blocked,
            "done" => WorkflowState::Done,
            _ => WorkflowState::Unknown,
        }
    }
}

/// Priority tier for a ticket. Lower tiers rank first in the feed;
/// tickets without a recognized tier sort last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityTier {
    P0,
    P1,
    P2,
    P3,
    #[serde(other)]
    Unknown,
}

impl PriorityTier {
    /// Sort rank: p0 first, unknown last.
    pub fn rank(&self) -> u8 {
        match self {
            PriorityTier::P0 => 0,
            PriorityTier::P1 => 1,
            PriorityTier::P2 => 2,
            PriorityTier::P3 => 3,
            PriorityTier::Unknown => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityTier::P0 => "p0",
            PriorityTier::P1 => "p1",
            PriorityTier::P2 => "p2",
            PriorityTier::P3 => "p3",
            PriorityTier::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "p0" => PriorityTier::P0,
            "p1" => PriorityTier::P1,
            "p2" => PriorityTier::P2,
            "p3" => PriorityTier::P3,
            _ => PriorityTier::Unknown,
        }
    }
}

/// A cached ticket row for one repository snapshot.
///
/// `created_at` comes from the ticket file itself; `refreshed_at` is the
/// last time the sync job rewrote this row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketSnapshot {
    /// 26-character sortable identifier assigned at ticket creation
    pub full_id: String,
    pub title: String,
    #[serde(default)]
    pub workflow_state: WorkflowState,
    #[serde(default = "default_tier")]
    pub priority: PriorityTier,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub refreshed_at: Option<DateTime<Utc>>,
}

fn default_tier() -> PriorityTier {
    PriorityTier::Unknown
}

/// Sync job status for a repository, written by the (external) sync job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "syncing" => SyncStatus::Syncing,
            "error" => SyncStatus::Error,
            _ => SyncStatus::Idle,
        }
    }
}

/// Sync bookkeeping row for one repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoSyncState {
    pub repo: String,
    pub sync_status: SyncStatus,
    #[serde(default)]
    pub sync_error: Option<String>,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
    /// UUID of the sync run that produced the current snapshot
    #[serde(default)]
    pub last_run_id: Option<String>,
}

/// Sync error as reported by clients. Newer clients send a structured
/// object, older ones a bare string; everything downstream of the API
/// boundary only sees the normalized message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SyncErrorPayload {
    Detailed {
        message: String,
        #[serde(default)]
        code: Option<String>,
    },
    Legacy(String),
}

impl SyncErrorPayload {
    pub fn into_message(self) -> String {
        match self {
            SyncErrorPayload::Detailed { message, code } => match code {
                Some(code) => format!("{code}: {message}"),
                None => message,
            },
            SyncErrorPayload::Legacy(message) => message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_state_roundtrips_through_strings() {
        for state in [
            WorkflowState::Backlog,
            WorkflowState::Ready,
            WorkflowState::InProgress,
            WorkflowState::Blocked,
            WorkflowState::Done,
        ] {
            assert_eq!(WorkflowState::parse(state.as_str()), state);
        }
        assert_eq!(WorkflowState::parse("garbage"), WorkflowState::Unknown);
    }

    #[test]
    fn unknown_priority_ranks_last() {
        assert!(PriorityTier::P3.rank() < PriorityTier::Unknown.rank());
        assert_eq!(PriorityTier::parse("p17"), PriorityTier::Unknown);
    }

    #[test]
    fn sync_error_payload_accepts_both_shapes() {
        let legacy: SyncErrorPayload = serde_json::from_str(r#""clone failed""#).unwrap();
        assert_eq!(legacy.into_message(), "clone failed");

        let detailed: SyncErrorPayload =
            serde_json::from_str(r#"{"message": "clone failed", "code": "E_GIT"}"#).unwrap();
        assert_eq!(detailed.into_message(), "E_GIT: clone failed");
    }

    #[test]
    fn ticket_snapshot_tolerates_missing_optional_fields() {
        let ticket: TicketSnapshot = serde_json::from_str(
            r#"{"full_id": "01hv4k8e9qzrmw3ytpnx2c6b7d", "title": "fix login"}"#,
        )
        .unwrap();
        assert_eq!(ticket.workflow_state, WorkflowState::Backlog);
        assert_eq!(ticket.priority, PriorityTier::Unknown);
        assert!(ticket.created_at.is_none());
    }
}
