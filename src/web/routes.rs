//! HTTP routes for the demo pages and the observability API

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use cached::proc_macro::cached;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error};

use super::middleware::{ClientIp, UNKNOWN_IP};
use super::AppState;
use crate::db::{Database, RequestRecord, SuspiciousIp};

/// Serve the front page
pub async fn index() -> &'static str {
    "gatewatch is running\n"
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    #[allow(dead_code)] // Accepted from the body, never logged or stored
    pub password: String,
}

/// Demo login endpoint guarded by the per-IP rate limiter.
/// No account backend is wired in, so every attempt is rejected.
pub async fn login(
    State(state): State<Arc<AppState>>,
    ip: Option<Extension<ClientIp>>,
    body: Option<Json<LoginRequest>>,
) -> Response {
    let ip = ip
        .map(|Extension(ClientIp(ip))| ip)
        .unwrap_or_else(|| UNKNOWN_IP.to_string());

    if !state.limiter.check(&ip) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": "Too many requests. Try again later."})),
        )
            .into_response();
    }

    if let Some(Json(attempt)) = body {
        debug!("Login attempt for '{}' from {}", attempt.username, ip);
    }

    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "Invalid credentials"})),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
pub struct RecentResponse {
    pub total: i64,
    pub records: Vec<RequestRecord>,
}

/// API: Recent audit log entries, newest first
pub async fn api_recent(State(state): State<Arc<AppState>>) -> Json<RecentResponse> {
    let total = state.db.total_records().await.unwrap_or(0);
    let records = state.db.recent_records(25).await.unwrap_or_default();
    Json(RecentResponse { total, records })
}

#[derive(Debug, Serialize)]
pub struct SuspiciousResponse {
    pub total: i64,
    pub flagged: Vec<SuspiciousIp>,
}

/// API: IPs flagged by the anomaly scanner
pub async fn api_suspicious(State(state): State<Arc<AppState>>) -> Json<SuspiciousResponse> {
    let total = state.db.suspicious_count().await.unwrap_or(0);
    let flagged = state.db.list_suspicious(50).await.unwrap_or_default();
    Json(SuspiciousResponse { total, flagged })
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    #[serde(default = "default_hours")]
    pub hours: i64,
}

fn default_hours() -> i64 {
    24
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub total: i64,
    pub window_requests: i64,
    pub unique_ips: i64,
    pub blocked_ips: i64,
    pub suspicious_ips: i64,
}

/// Cached stats query - 5 minute TTL
#[cached(time = 300, key = "i64", convert = r#"{ hours }"#)]
async fn get_cached_stats(hours: i64, db: Database) -> StatsResponse {
    let since = Utc::now() - Duration::hours(hours);
    let (total, window_requests, unique_ips, blocked, suspicious) = tokio::join!(
        db.total_records(),
        db.count_since(since),
        db.unique_ips_since(since),
        db.blocked_count(),
        db.suspicious_count()
    );

    StatsResponse {
        total: total.unwrap_or(0),
        window_requests: window_requests.unwrap_or(0),
        unique_ips: unique_ips.unwrap_or(0),
        blocked_ips: blocked.unwrap_or(0),
        suspicious_ips: suspicious.unwrap_or(0),
    }
}

/// API: Traffic statistics (cached for 5 minutes)
pub async fn api_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatsQuery>,
) -> Json<StatsResponse> {
    Json(get_cached_stats(query.hours, state.db.clone()).await)
}

#[derive(Debug, Serialize)]
pub struct BlocklistResponse {
    pub total: i64,
    pub blocked: Vec<String>,
}

/// API: Current blocklist
pub async fn api_blocklist(State(state): State<Arc<AppState>>) -> Json<BlocklistResponse> {
    let blocked = state.db.list_blocked().await.unwrap_or_default();
    Json(BlocklistResponse {
        total: blocked.len() as i64,
        blocked,
    })
}

#[derive(Debug, Deserialize)]
pub struct BlockRequest {
    pub ip_address: String,
}

/// API: Add an IP to the blocklist. 201 on insert, 200 when already present.
/// Entries are stored in canonical form so they compare equal to client IPs.
pub async fn api_block_ip(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BlockRequest>,
) -> Response {
    let ip = match body.ip_address.parse::<IpAddr>() {
        Ok(addr) => addr.to_string(),
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "invalid IP address"})),
            )
                .into_response();
        }
    };

    match state.db.block_ip(&ip).await {
        Ok(created) => {
            let status = if created {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            };
            (status, Json(json!({"blocked": ip, "created": created}))).into_response()
        }
        Err(e) => {
            error!("Failed to block {}: {}", ip, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "database error"})),
            )
                .into_response()
        }
    }
}

/// API: Remove an IP from the blocklist
pub async fn api_unblock_ip(
    State(state): State<Arc<AppState>>,
    Path(ip): Path<String>,
) -> Response {
    let ip = ip.parse::<IpAddr>().map(|a| a.to_string()).unwrap_or(ip);
    match state.db.unblock_ip(&ip).await {
        Ok(true) => (StatusCode::OK, Json(json!({"unblocked": ip}))).into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "IP not on blocklist"})),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to unblock {}: {}", ip, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "database error"})),
            )
                .into_response()
        }
    }
}

/// Fallback handler; unmatched paths still pass through the interceptor
pub async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not found\n").into_response()
}
