//! Periodic traffic analysis that flags anomalous IPs

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::{error, info};

use crate::config::ScannerConfig;
use crate::db::Database;

/// Tunables for a single scan pass
#[derive(Debug, Clone)]
pub struct ScanParams {
    pub window: Duration,
    pub volume_threshold: i64,
    pub sensitive_paths: Vec<String>,
}

impl ScanParams {
    pub fn from_config(config: &ScannerConfig) -> Self {
        Self {
            window: Duration::seconds(config.window_secs),
            volume_threshold: config.volume_threshold,
            sensitive_paths: config.sensitive_paths.clone(),
        }
    }
}

/// Newly flagged IPs from one pass; already-flagged pairs are not counted
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    pub volume_flags: u64,
    pub path_flags: u64,
}

/// One scan pass over the trailing window ending at `now`.
///
/// Flagging is keyed on (ip, reason), so a rerun over the same traffic
/// inserts nothing while a changed request count produces a new entry.
pub async fn run_scan(
    db: &Database,
    params: &ScanParams,
    now: DateTime<Utc>,
) -> Result<ScanOutcome> {
    let since = now - params.window;
    let mut outcome = ScanOutcome::default();

    for (ip, count) in db.volume_offenders(since, params.volume_threshold).await? {
        let reason = format!("High request volume: {} requests in last hour", count);
        if db.flag_ip(&ip, &reason, now).await? {
            outcome.volume_flags += 1;
            info!("Flagged {} for high volume ({} requests)", ip, count);
        }
    }

    for path in &params.sensitive_paths {
        let reason = format!("Accessed sensitive path: {}", path);
        for ip in db.ips_accessing_path(since, path).await? {
            if db.flag_ip(&ip, &reason, now).await? {
                outcome.path_flags += 1;
                info!("Flagged {} for accessing {}", ip, path);
            }
        }
    }

    Ok(outcome)
}

/// Spawn the scan loop; runs until the process exits
pub fn start_scanner(db: Database, config: &ScannerConfig) {
    let params = ScanParams::from_config(config);
    let interval_secs = config.interval_secs;

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        loop {
            interval.tick().await;
            match run_scan(&db, &params, Utc::now()).await {
                Ok(outcome) => {
                    if outcome.volume_flags > 0 || outcome.path_flags > 0 {
                        info!(
                            "Scan flagged {} high-volume and {} sensitive-path IPs",
                            outcome.volume_flags, outcome.path_flags
                        );
                    }
                }
                Err(e) => error!("Anomaly scan failed: {}", e),
            }
        }
    });
}
