//! Request interception middleware
//!
//! Every incoming request is resolved to a client IP, checked against the
//! blocklist, enriched with geolocation, and written to the audit log before
//! the inner service runs. Blocked IPs are rejected without an audit record.

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{HeaderMap, Request, StatusCode},
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    task::{Context, Poll},
};
use tower::{Layer, Service};
use tracing::{debug, error, info};

use super::AppState;
use crate::db::RequestRecord;

/// Sentinel recorded when no client IP can be determined
pub const UNKNOWN_IP: &str = "0.0.0.0";

const BLOCKED_BODY: &str = "Your IP is blocked.";

/// Get the client IP, checking configured proxy headers in priority order.
/// A header carrying a chain contributes its first entry only.
fn client_ip(headers: &HeaderMap, trusted: &[String], fallback: Option<IpAddr>) -> String {
    for name in trusted {
        if let Some(value) = headers.get(name.as_str()) {
            if let Ok(raw) = value.to_str() {
                if let Some(first) = raw.split(',').next() {
                    let candidate = first.trim();
                    if candidate.parse::<IpAddr>().is_ok() {
                        return candidate.to_string();
                    }
                }
            }
        }
    }

    match fallback {
        Some(addr) => addr.to_string(),
        None => UNKNOWN_IP.to_string(),
    }
}

/// Client IP as determined by the interceptor, for downstream handlers
#[derive(Debug, Clone)]
pub struct ClientIp(pub String);

fn blocked_response() -> Response {
    (StatusCode::FORBIDDEN, BLOCKED_BODY).into_response()
}

fn server_error_response() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
}

/// Layer for request interception
#[derive(Clone)]
pub struct InterceptorLayer {
    state: Arc<AppState>,
}

impl InterceptorLayer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

impl<S> Layer<S> for InterceptorLayer {
    type Service = InterceptorMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InterceptorMiddleware {
            inner,
            state: self.state.clone(),
        }
    }
}

/// Middleware service wrapping every route behind the interception steps
#[derive(Clone)]
pub struct InterceptorMiddleware<S> {
    inner: S,
    state: Arc<AppState>,
}

impl<S> Service<Request<Body>> for InterceptorMiddleware<S>
where
    S: Service<Request<Body>, Response = Response> + Send + Clone + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<Body>) -> Self::Future {
        let state = self.state.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let method = request.method().to_string();
            let path = request.uri().path().to_string();

            // Client IP - check proxy headers first, then fallback to socket
            let fallback = request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip());
            let ip = client_ip(request.headers(), &state.trusted_headers, fallback);

            // Blocked IPs are turned away before anything is recorded
            match state.db.is_blocked(&ip).await {
                Ok(true) => {
                    info!("Rejected blocked IP {} on {}", ip, path);
                    return Ok(blocked_response());
                }
                Ok(false) => {}
                Err(e) => {
                    error!("Blocklist check failed for {}: {}", ip, e);
                    return Ok(server_error_response());
                }
            }

            let location = state.geo.resolve(&ip).await;

            let record = RequestRecord::new(ip.clone(), &path)
                .with_method(method.clone())
                .with_location(location.country, location.city);

            // The audit log is mandatory; a failed write fails the request
            if let Err(e) = state.db.insert_record(&record).await {
                error!("Failed to record request from {}: {}", ip, e);
                return Ok(server_error_response());
            }

            debug!("{} {} from {}", method, path, ip);

            request.extensions_mut().insert(ClientIp(ip));
            inner.call(request).await
        })
    }
}
