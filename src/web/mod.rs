//! Web server module

pub mod middleware;
mod routes;

use anyhow::Result;
use axum::{
    routing::{delete, get, post},
    Router,
};
use std::{net::SocketAddr, sync::Arc};
use tracing::info;

use crate::config::Config;
use crate::db::Database;
use crate::geo::GeoResolver;
use crate::ratelimit::RateLimiter;
use middleware::InterceptorLayer;

pub struct AppState {
    pub db: Database,
    pub geo: GeoResolver,
    pub limiter: RateLimiter,
    pub trusted_headers: Vec<String>,
}

/// Assemble the router. The interceptor wraps every route, the fallback
/// included, so unmatched paths are audited like any other request.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Demo pages
        .route("/", get(routes::index))
        .route("/login", post(routes::login))
        // Observability API
        .route("/api/recent", get(routes::api_recent))
        .route("/api/suspicious", get(routes::api_suspicious))
        .route("/api/stats", get(routes::api_stats))
        // Blocklist administration
        .route(
            "/api/blocklist",
            get(routes::api_blocklist).post(routes::api_block_ip),
        )
        .route("/api/blocklist/:ip", delete(routes::api_unblock_ip))
        .fallback(routes::not_found)
        .layer(InterceptorLayer::new(state.clone()))
        .with_state(state)
}

pub async fn start_server(config: &Config, db: Database, geo: GeoResolver) -> Result<()> {
    let state = Arc::new(AppState {
        db,
        geo,
        limiter: RateLimiter::new(&config.ratelimit),
        trusted_headers: config.interceptor.trusted_headers.clone(),
    });

    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.http_port);
    info!("Web server starting on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::db::RequestRecord;
    use crate::geo::{GeoError, GeoInfo, GeoProvider};
    use crate::scanner::{run_scan, ScanParams};
    use async_trait::async_trait;
    use axum::{
        body::Body,
        extract::ConnectInfo,
        http::{Request, StatusCode},
    };
    use chrono::{Duration, Utc};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    struct FixedProvider;

    #[async_trait]
    impl GeoProvider for FixedProvider {
        async fn lookup(&self, _ip: &str) -> Result<GeoInfo, GeoError> {
            Ok(GeoInfo {
                country: Some("US".to_string()),
                city: Some("Chicago".to_string()),
            })
        }
    }

    fn test_state(db: Database) -> Arc<AppState> {
        let geo = GeoResolver::new(db.clone(), Arc::new(FixedProvider), 24);
        Arc::new(AppState {
            db,
            geo,
            limiter: RateLimiter::new(&RateLimitConfig {
                window_secs: 60,
                max_requests: 3,
            }),
            trusted_headers: vec!["x-forwarded-for".to_string()],
        })
    }

    fn request(method: &str, path: &str, peer: &str) -> Request<Body> {
        let mut req = Request::builder()
            .method(method)
            .uri(path)
            .body(Body::empty())
            .unwrap();
        let addr: SocketAddr = format!("{}:9999", peer).parse().unwrap();
        req.extensions_mut().insert(ConnectInfo(addr));
        req
    }

    fn json_request(method: &str, path: &str, peer: &str, body: &str) -> Request<Body> {
        let mut req = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let addr: SocketAddr = format!("{}:9999", peer).parse().unwrap();
        req.extensions_mut().insert(ConnectInfo(addr));
        req
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn passthrough_writes_exactly_one_audit_record() {
        let db = Database::open_in_memory().await.unwrap();
        let app = build_router(test_state(db.clone()));

        let response = app
            .oneshot(request("GET", "/", "198.51.100.77"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let records = db.recent_records(10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].ip_address, "198.51.100.77");
        assert_eq!(records[0].path, "/");
        assert_eq!(records[0].method.as_deref(), Some("GET"));
        assert_eq!(records[0].country.as_deref(), Some("US"));
        assert_eq!(records[0].city.as_deref(), Some("Chicago"));
    }

    #[tokio::test]
    async fn blocked_ips_get_403_and_no_audit_record() {
        let db = Database::open_in_memory().await.unwrap();
        db.block_ip("198.51.100.77").await.unwrap();
        let app = build_router(test_state(db.clone()));

        let response = app
            .oneshot(request("GET", "/", "198.51.100.77"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"Your IP is blocked.");
        assert_eq!(db.total_records().await.unwrap(), 0);
        assert_eq!(db.suspicious_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn blocklist_outages_fail_closed() {
        let db = Database::open_in_memory().await.unwrap();
        let app = build_router(test_state(db.clone()));
        db.close().await;

        let response = app
            .oneshot(request("GET", "/", "198.51.100.77"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"Internal server error");
    }

    #[tokio::test]
    async fn a_failed_audit_write_fails_the_request() {
        let db = Database::open_in_memory().await.unwrap();
        let app = build_router(test_state(db.clone()));

        // Blocklist and geo cache stay intact; only the audit write can fail
        sqlx::query("DROP TABLE requests")
            .execute(db.pool())
            .await
            .unwrap();

        let response = app
            .oneshot(request("GET", "/", "198.51.100.77"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"Internal server error");
    }

    #[tokio::test]
    async fn forwarded_header_overrides_the_peer_address() {
        let db = Database::open_in_memory().await.unwrap();
        let app = build_router(test_state(db.clone()));

        let mut req = request("GET", "/", "127.0.0.1");
        req.headers_mut()
            .insert("x-forwarded-for", "203.0.113.9".parse().unwrap());
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let records = db.recent_records(10).await.unwrap();
        assert_eq!(records[0].ip_address, "203.0.113.9");
    }

    #[tokio::test]
    async fn missing_peer_information_records_the_sentinel() {
        let db = Database::open_in_memory().await.unwrap();
        let app = build_router(test_state(db.clone()));

        // No ConnectInfo and no proxy headers
        let req = Request::builder()
            .method("GET")
            .uri("/")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let records = db.recent_records(10).await.unwrap();
        assert_eq!(records[0].ip_address, "0.0.0.0");
        assert!(records[0].country.is_none());
    }

    #[tokio::test]
    async fn unmatched_paths_are_still_audited() {
        let db = Database::open_in_memory().await.unwrap();
        let app = build_router(test_state(db.clone()));

        let response = app
            .oneshot(request("GET", "/wp-admin/setup.php", "198.51.100.77"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let records = db.recent_records(10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, "/wp-admin/setup.php");
    }

    #[tokio::test]
    async fn blocklist_admin_round_trip() {
        let db = Database::open_in_memory().await.unwrap();
        let app = build_router(test_state(db.clone()));

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/blocklist",
                "198.51.100.2",
                r#"{"ip_address": "203.0.113.50"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(db.is_blocked("203.0.113.50").await.unwrap());

        // Re-blocking is reported, not repeated
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/blocklist",
                "198.51.100.2",
                r#"{"ip_address": "203.0.113.50"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let value = body_json(response).await;
        assert_eq!(value["created"], false);

        let response = app
            .clone()
            .oneshot(request("GET", "/api/blocklist", "198.51.100.2"))
            .await
            .unwrap();
        let value = body_json(response).await;
        assert_eq!(value["total"], 1);
        assert_eq!(value["blocked"][0], "203.0.113.50");

        let response = app
            .clone()
            .oneshot(request("DELETE", "/api/blocklist/203.0.113.50", "198.51.100.2"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!db.is_blocked("203.0.113.50").await.unwrap());

        let response = app
            .oneshot(request("DELETE", "/api/blocklist/203.0.113.50", "198.51.100.2"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_blocklist_entries_are_rejected() {
        let db = Database::open_in_memory().await.unwrap();
        let app = build_router(test_state(db.clone()));

        let response = app
            .oneshot(json_request(
                "POST",
                "/api/blocklist",
                "198.51.100.2",
                r#"{"ip_address": "not-an-ip"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = body_json(response).await;
        assert_eq!(value["error"], "invalid IP address");
        assert_eq!(db.blocked_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ipv6_blocks_match_regardless_of_spelling() {
        let db = Database::open_in_memory().await.unwrap();
        let app = build_router(test_state(db.clone()));

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/blocklist",
                "198.51.100.2",
                r#"{"ip_address": "2001:DB8:0:0:0:0:0:1"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let value = body_json(response).await;
        assert_eq!(value["blocked"], "2001:db8::1");

        let mut req = request("GET", "/", "127.0.0.1");
        req.headers_mut()
            .insert("x-forwarded-for", "2001:db8::1".parse().unwrap());
        let response = app.clone().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .oneshot(request("DELETE", "/api/blocklist/2001:DB8::1", "198.51.100.2"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!db.is_blocked("2001:db8::1").await.unwrap());
    }

    #[tokio::test]
    async fn newly_blocked_ips_are_rejected_on_the_next_request() {
        let db = Database::open_in_memory().await.unwrap();
        let app = build_router(test_state(db.clone()));

        let response = app
            .clone()
            .oneshot(request("GET", "/", "203.0.113.50"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        app.clone()
            .oneshot(json_request(
                "POST",
                "/api/blocklist",
                "198.51.100.2",
                r#"{"ip_address": "203.0.113.50"}"#,
            ))
            .await
            .unwrap();

        let response = app
            .oneshot(request("GET", "/", "203.0.113.50"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn login_is_rate_limited_per_ip() {
        let db = Database::open_in_memory().await.unwrap();
        let app = build_router(test_state(db.clone()));

        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(json_request(
                    "POST",
                    "/login",
                    "198.51.100.3",
                    r#"{"username": "admin", "password": "hunter2"}"#,
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            let value = body_json(response).await;
            assert_eq!(value["error"], "Invalid credentials");
        }

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/login",
                "198.51.100.3",
                r#"{"username": "admin", "password": "hunter2"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let value = body_json(response).await;
        assert_eq!(value["error"], "Too many requests. Try again later.");

        // A different IP still has its full allowance
        let response = app
            .oneshot(json_request(
                "POST",
                "/login",
                "198.51.100.4",
                r#"{"username": "admin", "password": "hunter2"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn recent_api_reports_audited_traffic() {
        let db = Database::open_in_memory().await.unwrap();
        let app = build_router(test_state(db.clone()));

        app.clone()
            .oneshot(request("GET", "/", "198.51.100.77"))
            .await
            .unwrap();

        let response = app
            .oneshot(request("GET", "/api/recent", "198.51.100.2"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // The API call itself is audited before its handler runs
        let value = body_json(response).await;
        assert_eq!(value["total"], 2);
        assert_eq!(value["records"][0]["path"], "/api/recent");
        assert_eq!(value["records"][1]["path"], "/");
    }

    #[tokio::test]
    async fn suspicious_api_lists_scanner_flags() {
        let db = Database::open_in_memory().await.unwrap();
        db.insert_record(&RequestRecord::new("9.9.9.9".to_string(), "/admin"))
            .await
            .unwrap();

        let params = ScanParams {
            window: Duration::hours(1),
            volume_threshold: 100,
            sensitive_paths: vec!["/admin".to_string()],
        };
        run_scan(&db, &params, Utc::now()).await.unwrap();

        let app = build_router(test_state(db));
        let response = app
            .oneshot(request("GET", "/api/suspicious", "198.51.100.2"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let value = body_json(response).await;
        assert_eq!(value["total"], 1);
        assert_eq!(value["flagged"][0]["ip_address"], "9.9.9.9");
        assert_eq!(
            value["flagged"][0]["reason"],
            "Accessed sensitive path: /admin"
        );
    }
}
