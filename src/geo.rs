//! Geolocation enrichment backed by an external provider and a persistent cache

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::config::GeolocationConfig;
use crate::db::Database;

/// Location attributes attached to an audit record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeoInfo {
    pub country: Option<String>,
    pub city: Option<String>,
}

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("provider returned status {0}")]
    Status(u16),
    #[error("malformed provider response: {0}")]
    Malformed(String),
}

/// Source of location data for public IPs
#[async_trait]
pub trait GeoProvider: Send + Sync {
    async fn lookup(&self, ip: &str) -> Result<GeoInfo, GeoError>;
}

/// Provider speaking the JSON-over-HTTP dialect of services like ipapi.co
pub struct HttpGeoProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct ProviderResponse {
    #[serde(default)]
    country_name: Option<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    city: Option<String>,
}

impl HttpGeoProvider {
    pub fn new(config: &GeolocationConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(StdDuration::from_millis(config.lookup_timeout_ms))
            .build()
            .context("failed to build geolocation HTTP client")?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
        })
    }

    fn url_for(&self, ip: &str) -> String {
        self.endpoint.replace("{ip}", ip).replace("{key}", &self.api_key)
    }
}

#[async_trait]
impl GeoProvider for HttpGeoProvider {
    async fn lookup(&self, ip: &str) -> Result<GeoInfo, GeoError> {
        let url = self.url_for(ip);
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(GeoError::Status(response.status().as_u16()));
        }

        let body: ProviderResponse = response
            .json()
            .await
            .map_err(|e| GeoError::Malformed(e.to_string()))?;

        Ok(GeoInfo {
            country: body.country_name.or(body.country),
            city: body.city,
        })
    }
}

/// Cache-first resolver sitting between the interceptor and the provider
#[derive(Clone)]
pub struct GeoResolver {
    db: Database,
    provider: Arc<dyn GeoProvider>,
    ttl: Duration,
}

impl GeoResolver {
    pub fn new(db: Database, provider: Arc<dyn GeoProvider>, cache_ttl_hours: i64) -> Self {
        Self {
            db,
            provider,
            ttl: Duration::hours(cache_ttl_hours),
        }
    }

    /// Resolve an IP to a location, consulting the cache first.
    ///
    /// Never fails the request path: provider errors produce an empty
    /// location, which is cached for the full TTL like any other result
    /// so a broken provider is not hammered on every request.
    pub async fn resolve(&self, ip: &str) -> GeoInfo {
        match ip.parse::<IpAddr>() {
            Ok(addr) => {
                // Private and unspecified addresses have no meaningful location
                if is_private_ip(&addr) {
                    return GeoInfo::default();
                }
            }
            Err(_) => return GeoInfo::default(),
        }

        let now = Utc::now();
        match self.db.cached_location(ip, now).await {
            Ok(Some((country, city))) => return GeoInfo { country, city },
            Ok(None) => {}
            Err(e) => {
                // Treat an unreadable cache as a miss
                warn!("Geo cache read failed for {}: {}", ip, e);
            }
        }

        let info = match self.provider.lookup(ip).await {
            Ok(info) => info,
            Err(e) => {
                warn!("Geolocation lookup failed for {}: {}", ip, e);
                GeoInfo::default()
            }
        };

        let expires_at = now + self.ttl;
        if let Err(e) = self
            .db
            .store_location(ip, info.country.as_deref(), info.city.as_deref(), expires_at)
            .await
        {
            warn!("Geo cache write failed for {}: {}", ip, e);
        }

        info
    }
}

/// Check if an IP address is private/local
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private()
                || ipv4.is_loopback()
                || ipv4.is_link_local()
                || ipv4.is_broadcast()
                || ipv4.is_documentation()
                || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => ipv6.is_loopback() || ipv6.is_unspecified(),
    }
}
