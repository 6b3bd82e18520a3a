//! SQLite cache for tickwatch server
//!
//! The cache holds what the sync job last reported per repository: the
//! ticket rows, the pending-change rows, and the sync bookkeeping the
//! health classifier reads. Timestamps are stored as RFC3339 strings.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use crate::attention::RepoSnapshot;
use crate::changes::{ChangeStatus, ChecksState, PendingChange};
use crate::identity::normalize;
use crate::models::{
    PriorityTier, RepoSyncState, SyncStatus, TicketSnapshot, WorkflowState,
};

/// Thread-safe database wrapper
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;
        Self::from_connection(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    /// Initialize the database schema
    fn init(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            -- Per-repository sync bookkeeping
            CREATE TABLE IF NOT EXISTS repos (
                name TEXT PRIMARY KEY,
                sync_status TEXT NOT NULL DEFAULT 'idle',
                sync_error TEXT,
                last_synced_at TEXT,
                last_run_id TEXT
            );

            -- Cached ticket rows, replaced wholesale on snapshot
            CREATE TABLE IF NOT EXISTS tickets (
                repo TEXT NOT NULL,
                full_id TEXT NOT NULL,
                title TEXT NOT NULL,
                workflow_state TEXT NOT NULL DEFAULT 'backlog',
                priority TEXT NOT NULL DEFAULT 'unknown',
                created_at TEXT,
                refreshed_at TEXT,
                PRIMARY KEY (repo, full_id)
            );

            -- Pending-change / PR rows keyed by the sync job's ticket key
            CREATE TABLE IF NOT EXISTS pending_changes (
                repo TEXT NOT NULL,
                ticket_key TEXT NOT NULL,
                number INTEGER,
                url TEXT,
                title TEXT,
                merged INTEGER,
                mergeable_state TEXT,
                checks_state TEXT NOT NULL DEFAULT 'unknown',
                open INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL,
                updated_at TEXT
            );

            -- Indexes
            CREATE INDEX IF NOT EXISTS idx_tickets_repo ON tickets(repo);
            CREATE INDEX IF NOT EXISTS idx_changes_repo ON pending_changes(repo);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_changes_key
                ON pending_changes(repo, ticket_key, COALESCE(number, -1));
            "#,
        )?;

        Ok(())
    }

    /// Replace a repository's cached tickets and sync bookkeeping in one
    /// transaction
    pub fn replace_snapshot(
        &self,
        state: &RepoSyncState,
        tickets: &[TicketSnapshot],
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            r#"INSERT INTO repos (name, sync_status, sync_error, last_synced_at, last_run_id)
               VALUES (?1, ?2, ?3, ?4, ?5)
               ON CONFLICT(name) DO UPDATE SET
                   sync_status = excluded.sync_status,
                   sync_error = excluded.sync_error,
                   last_synced_at = excluded.last_synced_at,
                   last_run_id = excluded.last_run_id"#,
            params![
                &state.repo,
                state.sync_status.as_str(),
                &state.sync_error,
                state.last_synced_at.map(|t| t.to_rfc3339()),
                &state.last_run_id,
            ],
        )?;

        tx.execute("DELETE FROM tickets WHERE repo = ?1", params![&state.repo])?;
        for ticket in tickets {
            tx.execute(
                r#"INSERT INTO tickets (repo, full_id, title, workflow_state, priority,
                   created_at, refreshed_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
                params![
                    &state.repo,
                    normalize(&ticket.full_id),
                    &ticket.title,
                    ticket.workflow_state.as_str(),
                    ticket.priority.as_str(),
                    ticket.created_at.map(|t| t.to_rfc3339()),
                    ticket.refreshed_at.map(|t| t.to_rfc3339()),
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Sync bookkeeping for one repository
    pub fn get_repo_sync(&self, repo: &str) -> Result<Option<RepoSyncState>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT name, sync_status, sync_error, last_synced_at, last_run_id
             FROM repos WHERE name = ?1",
        )?;
        let mut rows = self.collect_repos(&mut stmt, params![repo])?;
        Ok(rows.pop())
    }

    /// All repositories the cache has seen
    pub fn list_repos(&self) -> Result<Vec<RepoSyncState>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT name, sync_status, sync_error, last_synced_at, last_run_id
             FROM repos ORDER BY name",
        )?;
        self.collect_repos(&mut stmt, [])
    }

    pub fn list_tickets(&self, repo: &str) -> Result<Vec<TicketSnapshot>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT full_id, title, workflow_state, priority, created_at, refreshed_at
             FROM tickets WHERE repo = ?1 ORDER BY full_id",
        )?;
        let rows = stmt.query_map(params![repo], |row| {
            let workflow: String = row.get(2)?;
            let priority: String = row.get(3)?;
            Ok(TicketSnapshot {
                full_id: row.get(0)?,
                title: row.get(1)?,
                workflow_state: WorkflowState::parse(&workflow),
                priority: PriorityTier::parse(&priority),
                created_at: parse_ts(row.get(4)?),
                refreshed_at: parse_ts(row.get(5)?),
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Insert or update one pending-change row. A row that gained a PR
    /// number replaces the numberless creating-PR row for the same ticket.
    pub fn upsert_pending_change(&self, repo: &str, change: &PendingChange) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let key = normalize(&change.ticket_key);

        if change.number.is_some() {
            conn.execute(
                "DELETE FROM pending_changes
                 WHERE repo = ?1 AND ticket_key = ?2 AND (number IS NULL OR number = ?3)",
                params![repo, &key, change.number],
            )?;
        } else {
            conn.execute(
                "DELETE FROM pending_changes
                 WHERE repo = ?1 AND ticket_key = ?2 AND number IS NULL",
                params![repo, &key],
            )?;
        }

        conn.execute(
            r#"INSERT INTO pending_changes (repo, ticket_key, number, url, title, merged,
               mergeable_state, checks_state, open, status, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"#,
            params![
                repo,
                &key,
                change.number,
                &change.url,
                &change.title,
                change.merged.map(|m| m as i32),
                &change.mergeable_state,
                change.checks_state.as_str(),
                change.open as i32,
                change.status.as_str(),
                change.updated_at.map(|t| t.to_rfc3339()),
            ],
        )?;

        Ok(())
    }

    pub fn list_pending_changes(&self, repo: &str) -> Result<Vec<PendingChange>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT ticket_key, number, url, title, merged, mergeable_state,
             checks_state, open, status, updated_at
             FROM pending_changes WHERE repo = ?1 ORDER BY ticket_key",
        )?;
        let rows = stmt.query_map(params![repo], |row| {
            let checks: String = row.get(6)?;
            let status: String = row.get(8)?;
            Ok(PendingChange {
                ticket_key: row.get(0)?,
                number: row.get(1)?,
                url: row.get(2)?,
                title: row.get(3)?,
                merged: row.get::<_, Option<i32>>(4)?.map(|m| m != 0),
                mergeable_state: row.get(5)?,
                checks_state: ChecksState::parse(&checks),
                open: row.get::<_, i32>(7)? != 0,
                status: ChangeStatus::parse(&status),
                updated_at: parse_ts(row.get(9)?),
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Everything the attention aggregator needs for one repository
    pub fn load_snapshot(&self, repo: &str) -> Result<RepoSnapshot> {
        let tickets = self.list_tickets(repo)?;
        let changes = self.list_pending_changes(repo)?;
        let pending: HashSet<String> = changes
            .iter()
            .filter(|c| c.is_unresolved())
            .map(|c| normalize(&c.ticket_key))
            .collect();

        Ok(RepoSnapshot {
            repo: repo.to_string(),
            tickets,
            changes,
            pending,
        })
    }

    fn collect_repos<P: rusqlite::Params>(
        &self,
        stmt: &mut rusqlite::Statement,
        params: P,
    ) -> Result<Vec<RepoSyncState>> {
        let rows = stmt.query_map(params, |row| {
            let status: String = row.get(1)?;
            Ok(RepoSyncState {
                repo: row.get(0)?,
                sync_status: SyncStatus::parse(&status),
                sync_error: row.get(2)?,
                last_synced_at: parse_ts(row.get(3)?),
                last_run_id: row.get(4)?,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}

fn parse_ts(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync_state(repo: &str) -> RepoSyncState {
        RepoSyncState {
            repo: repo.to_string(),
            sync_status: SyncStatus::Idle,
            sync_error: None,
            last_synced_at: Some(Utc::now()),
            last_run_id: Some("run-1".to_string()),
        }
    }

    fn ticket(full_id: &str) -> TicketSnapshot {
        TicketSnapshot {
            full_id: full_id.to_string(),
            title: "a ticket".to_string(),
            workflow_state: WorkflowState::Ready,
            priority: PriorityTier::P1,
            created_at: Some(Utc::now()),
            refreshed_at: Some(Utc::now()),
        }
    }

    fn pr(ticket_key: &str, number: Option<i64>, status: ChangeStatus) -> PendingChange {
        PendingChange {
            ticket_key: ticket_key.to_string(),
            number,
            url: None,
            title: None,
            merged: Some(false),
            mergeable_state: None,
            checks_state: ChecksState::Unknown,
            open: true,
            status,
            updated_at: None,
        }
    }

    #[test]
    fn replace_snapshot_overwrites_previous_tickets() {
        let db = Database::open_in_memory().unwrap();
        let state = sync_state("acme/widgets");

        db.replace_snapshot(&state, &[ticket("01hv4k8e9qzrmw3ytpnx2c6b7d")])
            .unwrap();
        db.replace_snapshot(&state, &[ticket("01hw2n5f7rtkcx4zupqy3d8e9a")])
            .unwrap();

        let tickets = db.list_tickets("acme/widgets").unwrap();
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].full_id, "01hw2n5f7rtkcx4zupqy3d8e9a");
    }

    #[test]
    fn snapshots_normalize_full_id_case() {
        let db = Database::open_in_memory().unwrap();
        db.replace_snapshot(&sync_state("acme/widgets"), &[ticket("01HV4K8E9QZRMW3YTPNX2C6B7D")])
            .unwrap();
        let tickets = db.list_tickets("acme/widgets").unwrap();
        assert_eq!(tickets[0].full_id, "01hv4k8e9qzrmw3ytpnx2c6b7d");
    }

    #[test]
    fn repo_bookkeeping_round_trips() {
        let db = Database::open_in_memory().unwrap();
        let mut state = sync_state("acme/widgets");
        state.sync_error = Some("fetch failed".to_string());
        state.sync_status = SyncStatus::Error;

        db.replace_snapshot(&state, &[]).unwrap();
        let loaded = db.get_repo_sync("acme/widgets").unwrap().unwrap();
        assert_eq!(loaded.sync_status, SyncStatus::Error);
        assert_eq!(loaded.sync_error.as_deref(), Some("fetch failed"));
        assert_eq!(loaded.last_run_id.as_deref(), Some("run-1"));

        assert!(db.get_repo_sync("acme/unknown").unwrap().is_none());
    }

    #[test]
    fn numbered_change_replaces_creating_pr_row() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_pending_change("acme/widgets", &pr("01hv4k8e", None, ChangeStatus::CreatingPr))
            .unwrap();
        db.upsert_pending_change(
            "acme/widgets",
            &pr("01hv4k8e", Some(42), ChangeStatus::PendingChecks),
        )
        .unwrap();

        let changes = db.list_pending_changes("acme/widgets").unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].number, Some(42));
        assert_eq!(changes[0].status, ChangeStatus::PendingChecks);
    }

    #[test]
    fn load_snapshot_marks_unresolved_changes_pending() {
        let db = Database::open_in_memory().unwrap();
        db.replace_snapshot(&sync_state("acme/widgets"), &[ticket("01hv4k8e9qzrmw3ytpnx2c6b7d")])
            .unwrap();
        db.upsert_pending_change(
            "acme/widgets",
            &pr("01hv4k8e", Some(41), ChangeStatus::WaitingReview),
        )
        .unwrap();
        db.upsert_pending_change(
            "acme/widgets",
            &pr("01hw2n5f", Some(42), ChangeStatus::Merged),
        )
        .unwrap();

        let snapshot = db.load_snapshot("acme/widgets").unwrap();
        assert!(snapshot.pending.contains("01hv4k8e"));
        // Terminal statuses are resolved and do not count as pending.
        assert!(!snapshot.pending.contains("01hw2n5f"));
    }
}
