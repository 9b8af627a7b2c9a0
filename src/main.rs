//! gatewatch - request interception and traffic anomaly detection
//!
//! Sits in front of the routed handlers and:
//! - Resolves every client IP and rejects blocklisted ones
//! - Writes a geolocation-enriched audit record per request
//! - Periodically flags high-volume and sensitive-path traffic

mod config;
mod db;
mod geo;
mod ratelimit;
mod scanner;
mod web;

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    // Load configuration
    let config = config::Config::load()?;

    // Initialize logging based on LOG_FORMAT env var
    // Use LOG_FORMAT=gcp for structured GCP Cloud Logging
    let level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "gcp" {
        tracing_subscriber::registry()
            .with(tracing_subscriber::filter::LevelFilter::from_level(level))
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_max_level(level).init();
    }

    info!("Starting gatewatch...");
    info!("Configuration loaded");

    // Initialize database
    let db = db::Database::new(&config.database).await?;
    db.run_migrations().await?;
    info!("Database initialized");

    // Geolocation provider behind the persistent cache
    let provider = Arc::new(geo::HttpGeoProvider::new(&config.geolocation)?);
    let geo = geo::GeoResolver::new(db.clone(), provider, config.geolocation.cache_ttl_hours);
    info!("Geolocation resolver ready");

    // Start anomaly scanner in background
    scanner::start_scanner(db.clone(), &config.scanner);
    info!(
        "Anomaly scanner scheduled every {}s",
        config.scanner.interval_secs
    );

    // Start web server (blocking)
    web::start_server(&config, db, geo).await?;

    Ok(())
}
