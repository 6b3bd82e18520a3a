//! Attention feed aggregation
//!
//! Joins cached tickets, pending changes, and PR links per repository,
//! computes the set of reasons each ticket needs a human, and merges every
//! repository into one deterministically ordered feed. A ticket with no
//! reasons does not appear at all; a malformed row contributes no reason
//! rather than failing the whole feed.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::changes::{ChecksState, PendingChange};
use crate::identity::{assign_display_ids, normalize, short_id};
use crate::models::{PriorityTier, TicketSnapshot, WorkflowState};

/// Why a ticket is in the feed. Precedence drives the primary sort key:
/// the smallest value among a ticket's reasons ranks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    Blocked,
    CiFailing,
    StaleInProgress,
    PrWaitingReview,
    PendingPr,
}

impl Reason {
    pub fn precedence(&self) -> u8 {
        match self {
            Reason::Blocked => 0,
            Reason::CiFailing => 1,
            Reason::StaleInProgress => 2,
            Reason::PrWaitingReview => 3,
            Reason::PendingPr => 4,
        }
    }
}

/// Everything the aggregator needs for one repository. The ticket keys in
/// `changes` and `pending` are the Identity Resolver's keys (short or full
/// IDs); the aggregator never re-derives identity on its own.
#[derive(Debug, Clone)]
pub struct RepoSnapshot {
    pub repo: String,
    pub tickets: Vec<TicketSnapshot>,
    pub changes: Vec<PendingChange>,
    /// Normalized keys of tickets with an unresolved pending change.
    pub pending: HashSet<String>,
}

/// Linked-change summary carried on each feed item.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeSummary {
    pub number: Option<i64>,
    pub url: Option<String>,
    pub title: Option<String>,
    pub status: crate::changes::ChangeStatus,
}

/// One entry in the attention feed.
#[derive(Debug, Clone, Serialize)]
pub struct AttentionItem {
    pub repo: String,
    pub ticket_key: String,
    pub display_id: String,
    pub title: String,
    pub workflow_state: WorkflowState,
    pub priority: PriorityTier,
    /// Non-empty by construction, ordered by precedence.
    pub reasons: Vec<Reason>,
    pub linked_changes: Vec<ChangeSummary>,
    pub has_pending_change: bool,
    pub created_at: Option<DateTime<Utc>>,
}

impl AttentionItem {
    fn min_precedence(&self) -> u8 {
        // reasons is non-empty for any item that made it into the feed
        self.reasons.iter().map(Reason::precedence).min().unwrap_or(u8::MAX)
    }

    fn sort_key(&self) -> (u8, u8, i64) {
        let created = self
            .created_at
            .map(|t| t.timestamp_millis())
            .unwrap_or(i64::MIN);
        (self.min_precedence(), self.priority.rank(), created)
    }
}

/// Aggregate all repositories into one feed, ordered by reason precedence,
/// then priority tier, then creation time ascending. Repository identity
/// is deliberately not a sort key.
pub fn aggregate(
    repos: &[RepoSnapshot],
    now: DateTime<Utc>,
    stale_in_progress_after: Duration,
) -> Vec<AttentionItem> {
    let mut items: Vec<AttentionItem> = Vec::new();
    for snapshot in repos {
        collect_repo(snapshot, now, stale_in_progress_after, &mut items);
    }
    items.sort_by_key(AttentionItem::sort_key);
    items
}

fn collect_repo(
    snapshot: &RepoSnapshot,
    now: DateTime<Utc>,
    stale_in_progress_after: Duration,
    items: &mut Vec<AttentionItem>,
) {
    let display_ids = assign_display_ids(snapshot.tickets.iter().map(|t| t.full_id.as_str()));

    for ticket in &snapshot.tickets {
        let full = normalize(&ticket.full_id);
        let short = short_id(&ticket.full_id);

        let linked: Vec<&PendingChange> = snapshot
            .changes
            .iter()
            .filter(|c| {
                let key = normalize(&c.ticket_key);
                key == full || key == short
            })
            .collect();

        let has_pending_change =
            snapshot.pending.contains(&full) || snapshot.pending.contains(&short);

        let mut reasons = Vec::new();
        if ticket.workflow_state == WorkflowState::Blocked {
            reasons.push(Reason::Blocked);
        }
        if linked.iter().any(|c| c.checks_state == ChecksState::Fail) {
            reasons.push(Reason::CiFailing);
        }
        if ticket.workflow_state == WorkflowState::InProgress
            && ticket
                .refreshed_at
                .is_some_and(|t| now - t > stale_in_progress_after)
        {
            reasons.push(Reason::StaleInProgress);
        }
        if linked
            .iter()
            .any(|c| c.open && c.merged != Some(true) && c.number.is_some())
        {
            reasons.push(Reason::PrWaitingReview);
        }
        if has_pending_change {
            reasons.push(Reason::PendingPr);
        }

        if reasons.is_empty() {
            continue;
        }

        let display_id = display_ids
            .get(&full)
            .cloned()
            .unwrap_or_else(|| format!("{}{short}", crate::identity::DISPLAY_PREFIX));

        items.push(AttentionItem {
            repo: snapshot.repo.clone(),
            ticket_key: full,
            display_id,
            title: ticket.title.clone(),
            workflow_state: ticket.workflow_state,
            priority: ticket.priority,
            reasons,
            linked_changes: linked
                .into_iter()
                .map(|c| ChangeSummary {
                    number: c.number,
                    url: c.url.clone(),
                    title: c.title.clone(),
                    status: c.status,
                })
                .collect(),
            has_pending_change,
            created_at: ticket.created_at,
        });
    }
}
