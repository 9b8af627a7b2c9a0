//! Database module

mod schema;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite, SqlitePool};

use crate::config::DatabaseConfig;

/// Longest path stored in the audit log; anything beyond is cut at a char boundary
const MAX_PATH_LEN: usize = 255;

fn truncate_path(path: &str) -> String {
    if path.len() <= MAX_PATH_LEN {
        return path.to_string();
    }
    let mut end = MAX_PATH_LEN;
    while !path.is_char_boundary(end) {
        end -= 1;
    }
    path[..end].to_string()
}

/// One intercepted request, as written to the audit log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: Option<i64>,
    pub ip_address: String,
    pub path: String,
    pub method: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub country: Option<String>,
    pub city: Option<String>,
}

impl RequestRecord {
    pub fn new(ip_address: String, path: &str) -> Self {
        Self {
            id: None,
            ip_address,
            path: truncate_path(path),
            method: None,
            timestamp: Utc::now(),
            country: None,
            city: None,
        }
    }

    pub fn with_method(mut self, method: String) -> Self {
        self.method = Some(method);
        self
    }

    pub fn with_location(mut self, country: Option<String>, city: Option<String>) -> Self {
        self.country = country;
        self.city = city;
        self
    }
}

/// An IP flagged by the anomaly scanner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspiciousIp {
    pub id: Option<i64>,
    pub ip_address: String,
    pub reason: String,
    pub flagged_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = SqlitePool::connect(&format!("sqlite:{}?mode=rwc", config.url)).await?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Close the pool so every subsequent query fails
    #[cfg(test)]
    pub async fn close(&self) {
        self.pool.close().await;
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        // Enable WAL mode for better concurrency
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&self.pool)
            .await?;

        sqlx::query(schema::CREATE_REQUESTS_TABLE)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::CREATE_BLOCKED_IPS_TABLE)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::CREATE_GEO_CACHE_TABLE)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::CREATE_SUSPICIOUS_IPS_TABLE)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::CREATE_INDEX_TIMESTAMP)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::CREATE_INDEX_TS_IP)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::CREATE_INDEX_TS_PATH)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // === Audit log ===

    pub async fn insert_record(&self, record: &RequestRecord) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO requests (ip_address, path, method, timestamp, country, city)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.ip_address)
        .bind(&record.path)
        .bind(&record.method)
        .bind(record.timestamp.timestamp_millis())
        .bind(&record.country)
        .bind(&record.city)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn recent_records(&self, limit: i32) -> Result<Vec<RequestRecord>> {
        let rows: Vec<(i64, String, String, Option<String>, i64, Option<String>, Option<String>)> =
            sqlx::query_as(
                r#"
                SELECT id, ip_address, path, method, timestamp, country, city
                FROM requests
                ORDER BY timestamp DESC, id DESC
                LIMIT ?
                "#,
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(id, ip_address, path, method, ts, country, city)| RequestRecord {
                id: Some(id),
                ip_address,
                path,
                method,
                timestamp: DateTime::from_timestamp_millis(ts).unwrap_or_else(|| Utc::now()),
                country,
                city,
            })
            .collect())
    }

    pub async fn total_records(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM requests")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    pub async fn count_since(&self, since: DateTime<Utc>) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM requests WHERE timestamp >= ?")
            .bind(since.timestamp_millis())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    pub async fn unique_ips_since(&self, since: DateTime<Utc>) -> Result<i64> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(DISTINCT ip_address) FROM requests WHERE timestamp >= ?")
                .bind(since.timestamp_millis())
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }

    // === Blocklist ===

    pub async fn is_blocked(&self, ip: &str) -> Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM blocked_ips WHERE ip_address = ?")
                .bind(ip)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    /// Returns false when the IP was already on the blocklist
    pub async fn block_ip(&self, ip: &str) -> Result<bool> {
        let result = sqlx::query("INSERT OR IGNORE INTO blocked_ips (ip_address) VALUES (?)")
            .bind(ip)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Returns false when the IP was not on the blocklist
    pub async fn unblock_ip(&self, ip: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM blocked_ips WHERE ip_address = ?")
            .bind(ip)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_blocked(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT ip_address FROM blocked_ips ORDER BY ip_address")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(ip,)| ip).collect())
    }

    pub async fn blocked_count(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM blocked_ips")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    // === Geolocation cache ===

    /// Unexpired cache entry for an IP. `Some((None, None))` is a cached
    /// lookup failure and must not trigger another provider call.
    pub async fn cached_location(
        &self,
        ip: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<(Option<String>, Option<String>)>> {
        let row: Option<(Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT country, city FROM geo_cache WHERE ip_address = ? AND expires_at > ?",
        )
        .bind(ip)
        .bind(now.timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn store_location(
        &self,
        ip: &str,
        country: Option<&str>,
        city: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO geo_cache (ip_address, country, city, expires_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(ip)
        .bind(country)
        .bind(city)
        .bind(expires_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // === Suspicious IPs ===

    /// Returns false when the (ip, reason) pair was already flagged
    pub async fn flag_ip(&self, ip: &str, reason: &str, flagged_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO suspicious_ips (ip_address, reason, flagged_at) VALUES (?, ?, ?)",
        )
        .bind(ip)
        .bind(reason)
        .bind(flagged_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_suspicious(&self, limit: i32) -> Result<Vec<SuspiciousIp>> {
        let rows: Vec<(i64, String, String, i64)> = sqlx::query_as(
            r#"
            SELECT id, ip_address, reason, flagged_at
            FROM suspicious_ips
            ORDER BY flagged_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, ip_address, reason, ts)| SuspiciousIp {
                id: Some(id),
                ip_address,
                reason,
                flagged_at: DateTime::from_timestamp_millis(ts).unwrap_or_else(|| Utc::now()),
            })
            .collect())
    }

    pub async fn suspicious_count(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM suspicious_ips")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    // === Scanner queries ===

    /// IPs whose request count in the window is strictly above the threshold
    pub async fn volume_offenders(
        &self,
        since: DateTime<Utc>,
        threshold: i64,
    ) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT ip_address, COUNT(*) as count
            FROM requests
            WHERE timestamp >= ?
            GROUP BY ip_address
            HAVING COUNT(*) > ?
            ORDER BY count DESC
            "#,
        )
        .bind(since.timestamp_millis())
        .bind(threshold)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn ips_accessing_path(
        &self,
        since: DateTime<Utc>,
        path: &str,
    ) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT ip_address
            FROM requests
            WHERE timestamp >= ? AND path = ?
            ORDER BY ip_address
            "#,
        )
        .bind(since.timestamp_millis())
        .bind(path)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(ip,)| ip).collect())
    }
}
