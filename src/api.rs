//! HTTP API for tickwatch server

use axum::{
    Json, Router,
    extract::{ConnectInfo, Extension, Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::attention::{AttentionItem, aggregate};
use crate::changes::{ChecksState, PendingChange, derive_status};
use crate::config::Config;
use crate::db::Database;
use crate::guard::{GuardPolicy, MutationGuard, MutationRequest};
use crate::health::{HealthState, SyncHealth, classify};
use crate::identity::{self, ResolveError, ResolveMode, assign_display_ids, normalize};
use crate::models::{RepoSyncState, SyncErrorPayload, SyncStatus, TicketSnapshot};
use crate::ratelimit::{FixedWindowLimiter, Quota};

/// Application state shared across handlers
pub struct AppState {
    pub db: Database,
    pub config: Config,
    pub guard: MutationGuard,
}

impl AppState {
    pub fn new(db: Database, config: Config) -> Arc<Self> {
        use rand::Rng;
        let policy = GuardPolicy {
            enforce_antiforgery: config.security.enforce_antiforgery,
            canonical_origin: config.security.canonical_origin.clone(),
        };
        let secret: [u8; 32] = rand::rng().random();
        let guard = MutationGuard::new(FixedWindowLimiter::in_memory(), policy, secret);
        Arc::new(Self { db, config, guard })
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = match state
        .config
        .security
        .canonical_origin
        .as_deref()
        .and_then(|o| o.parse::<HeaderValue>().ok())
    {
        Some(origin) => CorsLayer::new()
            .allow_methods(Any)
            .allow_headers(Any)
            .allow_origin(origin),
        None => CorsLayer::new()
            .allow_methods(Any)
            .allow_headers(Any)
            .allow_origin(Any),
    };

    Router::new()
        .route("/health", get(health))
        .route("/api/v1/attention", get(attention))
        .route("/api/v1/antiforgery", get(antiforgery))
        .route("/api/v1/repos/{repo}/sync", get(repo_sync))
        .route("/api/v1/repos/{repo}/tickets/{query}", get(resolve_ticket))
        .route("/api/v1/repos/{repo}/snapshot", put(put_snapshot))
        .route("/api/v1/repos/{repo}/changes", post(post_change))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint (no auth required)
async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "tickwatch",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Authenticated caller, stashed in request extensions by the middleware
#[derive(Debug, Clone)]
pub struct Caller(pub String);

/// Auth middleware - validates Bearer token and records the caller name
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    // Skip auth for health check
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }

    // Extract Authorization header
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let token = match auth_header {
        Some(h) if h.starts_with("Bearer ") => &h[7..],
        _ => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "Missing or invalid Authorization header" })),
            )
                .into_response();
        }
    };

    // Validate token and remember who the caller is
    match state.config.authenticate(token) {
        Some(name) => {
            let caller = Caller(name.to_string());
            request.extensions_mut().insert(caller);
            next.run(request).await
        }
        None => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Invalid API token" })),
        )
            .into_response(),
    }
}

/// The attention feed response shape
#[derive(Debug, serde::Serialize)]
pub struct AttentionFeed {
    pub items: Vec<AttentionItem>,
    pub repos: Vec<RepoFeedInfo>,
    pub loaded_at: DateTime<Utc>,
}

/// Coarse per-repository health summary carried alongside the feed
#[derive(Debug, serde::Serialize)]
pub struct RepoFeedInfo {
    pub repo: String,
    pub sync_state: HealthState,
    pub is_stale: bool,
}

/// Cross-repository attention feed
async fn attention(State(state): State<Arc<AppState>>) -> Result<Json<AttentionFeed>, ApiError> {
    let now = Utc::now();
    let repo_states = state.db.list_repos()?;

    let mut snapshots = Vec::with_capacity(repo_states.len());
    let mut repos = Vec::with_capacity(repo_states.len());
    for rs in &repo_states {
        snapshots.push(state.db.load_snapshot(&rs.repo)?);
        let health = classify(
            rs.sync_status,
            rs.sync_error.as_deref(),
            rs.last_synced_at,
            now,
            Duration::seconds(state.config.staleness.feed_stale_secs),
        );
        repos.push(RepoFeedInfo {
            repo: rs.repo.clone(),
            sync_state: health.state,
            is_stale: health.is_stale,
        });
    }

    let items = aggregate(
        &snapshots,
        now,
        Duration::hours(state.config.staleness.attention_hours),
    );

    tracing::debug!(
        items = items.len(),
        repos = repos.len(),
        "attention feed computed"
    );

    Ok(Json(AttentionFeed {
        items,
        repos,
        loaded_at: now,
    }))
}

/// Per-repository sync health
async fn repo_sync(
    State(state): State<Arc<AppState>>,
    Path(repo): Path<String>,
) -> Result<Json<SyncHealth>, ApiError> {
    let now = Utc::now();
    let stale_after = Duration::seconds(state.config.staleness.sync_stale_secs);

    let health = match state.db.get_repo_sync(&repo)? {
        Some(rs) => classify(
            rs.sync_status,
            rs.sync_error.as_deref(),
            rs.last_synced_at,
            now,
            stale_after,
        ),
        // Unknown repository: never synced, not an error
        None => classify(SyncStatus::Idle, None, None, now, stale_after),
    };

    Ok(Json(health))
}

#[derive(Debug, Deserialize)]
struct ResolveParams {
    #[serde(default)]
    mode: Option<String>,
}

#[derive(Debug, serde::Serialize)]
pub struct ResolvedTicket {
    pub display_id: String,
    #[serde(flatten)]
    pub ticket: TicketSnapshot,
}

/// Resolve a query string to exactly one cached ticket
async fn resolve_ticket(
    State(state): State<Arc<AppState>>,
    Path((repo, query)): Path<(String, String)>,
    Query(params): Query<ResolveParams>,
) -> Result<Json<ResolvedTicket>, ApiError> {
    let tickets = state.db.list_tickets(&repo)?;
    let mode = match params.mode.as_deref() {
        Some("ci") => ResolveMode::Ci,
        _ => ResolveMode::Interactive,
    };

    let ticket = identity::resolve(&query, &tickets, mode)?;
    let display_ids = assign_display_ids(tickets.iter().map(|t| t.full_id.as_str()));
    let display_id = display_ids
        .get(&normalize(&ticket.full_id))
        .cloned()
        .unwrap_or_default();

    Ok(Json(ResolvedTicket {
        display_id,
        ticket: ticket.clone(),
    }))
}

/// Anti-forgery token for the authenticated caller
async fn antiforgery(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> Json<serde_json::Value> {
    Json(json!({ "token": state.guard.token_for(&caller.0) }))
}

/// Snapshot payload posted by the sync job
#[derive(Debug, Deserialize)]
pub struct SnapshotRequest {
    #[serde(default)]
    pub sync_status: SyncStatus,
    #[serde(default)]
    pub sync_error: Option<SyncErrorPayload>,
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tickets: Vec<TicketSnapshot>,
}

/// Replace a repository's cached snapshot
async fn put_snapshot(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(caller): Extension<Caller>,
    Path(repo): Path<String>,
    headers: HeaderMap,
    Json(request): Json<SnapshotRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let now = Utc::now();
    guard_mutation(
        &state,
        "snapshot",
        &caller,
        addr,
        &headers,
        Quota::per_minute(state.config.limits.snapshot_per_minute),
        now,
    )?;

    let run_id = Uuid::new_v4().to_string();
    let sync_error = request.sync_error.map(SyncErrorPayload::into_message);

    // A successful snapshot without an explicit timestamp counts as a sync
    // finishing now; a failed one keeps the previous success time.
    let last_synced_at = match request.synced_at {
        Some(t) => Some(t),
        None if request.sync_status == SyncStatus::Idle && sync_error.is_none() => Some(now),
        None => state
            .db
            .get_repo_sync(&repo)?
            .and_then(|rs| rs.last_synced_at),
    };

    let mut tickets = request.tickets;
    for ticket in &mut tickets {
        if ticket.refreshed_at.is_none() {
            ticket.refreshed_at = Some(now);
        }
    }

    let sync_state = RepoSyncState {
        repo: repo.clone(),
        sync_status: request.sync_status,
        sync_error,
        last_synced_at,
        last_run_id: Some(run_id.clone()),
    };

    state.db.replace_snapshot(&sync_state, &tickets)?;

    // Opportunistic cleanup of expired rate-limit windows
    state.guard.prune(now);

    tracing::info!(
        repo = %repo,
        caller = %caller.0,
        tickets = tickets.len(),
        run_id = %run_id,
        "snapshot replaced"
    );

    Ok(Json(json!({
        "repo": repo,
        "tickets": tickets.len(),
        "run_id": run_id,
    })))
}

fn default_open() -> bool {
    true
}

/// One pending-change observation posted by the sync job
#[derive(Debug, Deserialize)]
pub struct ChangeRequest {
    pub ticket_key: String,
    #[serde(default)]
    pub number: Option<i64>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub merged: Option<bool>,
    #[serde(default)]
    pub mergeable_state: Option<String>,
    #[serde(default)]
    pub checks_state: Option<String>,
    #[serde(default = "default_open")]
    pub open: bool,
    #[serde(default)]
    pub auto_merge: bool,
}

/// Record or refresh one pending change
async fn post_change(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(caller): Extension<Caller>,
    Path(repo): Path<String>,
    headers: HeaderMap,
    Json(request): Json<ChangeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let now = Utc::now();
    guard_mutation(
        &state,
        "changes",
        &caller,
        addr,
        &headers,
        Quota::per_minute(state.config.limits.changes_per_minute),
        now,
    )?;

    let checks_state = request
        .checks_state
        .as_deref()
        .map(ChecksState::parse)
        .unwrap_or_default();
    let status = derive_status(
        request.number,
        request.open,
        request.merged,
        request.mergeable_state.as_deref(),
        checks_state,
        request.auto_merge,
    );

    let change = PendingChange {
        ticket_key: request.ticket_key,
        number: request.number,
        url: request.url,
        title: request.title,
        merged: request.merged,
        mergeable_state: request.mergeable_state,
        checks_state,
        open: request.open,
        status,
        updated_at: Some(now),
    };

    state.db.upsert_pending_change(&repo, &change)?;

    tracing::info!(
        repo = %repo,
        ticket_key = %change.ticket_key,
        status = status.as_str(),
        "pending change recorded"
    );

    Ok(Json(json!({
        "ticket_key": change.ticket_key,
        "status": status,
    })))
}

/// Run the mutation guard for one request. Rate limit first, then the
/// anti-forgery checks; the guard itself enforces that order.
fn guard_mutation(
    state: &AppState,
    bucket: &str,
    caller: &Caller,
    addr: SocketAddr,
    headers: &HeaderMap,
    quota: Quota,
    now: DateTime<Utc>,
) -> Result<(), ApiError> {
    let source_addr = addr.ip().to_string();
    let origin = headers.get(header::ORIGIN).and_then(|h| h.to_str().ok());
    let antiforgery_token = headers
        .get("x-antiforgery-token")
        .and_then(|h| h.to_str().ok());

    let request = MutationRequest {
        bucket,
        identity: &caller.0,
        source_addr: &source_addr,
        antiforgery_token,
        origin,
    };

    state.guard.check(&request, quota, now)?;
    Ok(())
}

/// API error type. Domain rejections keep their structure so clients can
/// branch on kind; everything else is a 500.
#[derive(Debug)]
pub enum ApiError {
    NotFound { query: String },
    Ambiguous { query: String, candidates: Vec<String> },
    RateLimited { retry_after_secs: i64 },
    Forbidden { reason: &'static str },
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl From<ResolveError> for ApiError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::NotFound { query } => ApiError::NotFound { query },
            ResolveError::Ambiguous { query, candidates } => {
                ApiError::Ambiguous { query, candidates }
            }
        }
    }
}

impl From<crate::guard::GuardError> for ApiError {
    fn from(err: crate::guard::GuardError) -> Self {
        match err {
            crate::guard::GuardError::RateLimited { retry_after_secs } => {
                ApiError::RateLimited { retry_after_secs }
            }
            crate::guard::GuardError::Forbidden { reason } => ApiError::Forbidden { reason },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound { query } => (
                StatusCode::NOT_FOUND,
                Json(json!({
                    "kind": "not_found",
                    "error": format!("no ticket matches '{query}'"),
                })),
            )
                .into_response(),
            ApiError::Ambiguous { query, candidates } => (
                StatusCode::CONFLICT,
                Json(json!({
                    "kind": "ambiguous",
                    "error": format!("'{query}' matches more than one ticket"),
                    "candidates": candidates,
                })),
            )
                .into_response(),
            ApiError::RateLimited { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, retry_after_secs.to_string())],
                Json(json!({
                    "kind": "rate_limited",
                    "error": "rate limit exceeded",
                    "retry_after_secs": retry_after_secs,
                })),
            )
                .into_response(),
            ApiError::Forbidden { reason } => (
                StatusCode::FORBIDDEN,
                Json(json!({
                    "kind": "forbidden",
                    "error": reason,
                })),
            )
                .into_response(),
            ApiError::Internal(err) => {
                tracing::error!(error = %err, "API error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": err.to_string() })),
                )
                    .into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_maps_to_429_with_retry_after_header() {
        let response = ApiError::RateLimited {
            retry_after_secs: 17,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            &HeaderValue::from_static("17")
        );
    }

    #[test]
    fn forbidden_maps_to_403() {
        let response = ApiError::Forbidden { reason: "nope" }.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn resolution_errors_map_to_404_and_409() {
        let not_found: ApiError = ResolveError::NotFound {
            query: "x".to_string(),
        }
        .into();
        assert_eq!(not_found.into_response().status(), StatusCode::NOT_FOUND);

        let ambiguous: ApiError = ResolveError::Ambiguous {
            query: "x".to_string(),
            candidates: vec!["a".to_string(), "b".to_string()],
        }
        .into();
        assert_eq!(ambiguous.into_response().status(), StatusCode::CONFLICT);
    }
}
