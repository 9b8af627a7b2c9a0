//! Database schema definitions

pub const CREATE_REQUESTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ip_address TEXT NOT NULL,
    path TEXT NOT NULL,
    method TEXT,
    timestamp BIGINT NOT NULL,
    country TEXT,
    city TEXT
)
"#;

pub const CREATE_BLOCKED_IPS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS blocked_ips (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ip_address TEXT NOT NULL UNIQUE
)
"#;

// Geolocation results, successful or failed, kept until expires_at
pub const CREATE_GEO_CACHE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS geo_cache (
    ip_address TEXT PRIMARY KEY,
    country TEXT,
    city TEXT,
    expires_at BIGINT NOT NULL
)
"#;

// UNIQUE(ip_address, reason) makes scanner flagging idempotent
pub const CREATE_SUSPICIOUS_IPS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS suspicious_ips (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ip_address TEXT NOT NULL,
    reason TEXT NOT NULL,
    flagged_at BIGINT NOT NULL,
    UNIQUE(ip_address, reason)
)
"#;

// For recent-request listings (ORDER BY timestamp DESC)
pub const CREATE_INDEX_TIMESTAMP: &str =
    "CREATE INDEX IF NOT EXISTS idx_requests_timestamp ON requests(timestamp)";

// For per-IP volume aggregation over a time window
pub const CREATE_INDEX_TS_IP: &str =
    "CREATE INDEX IF NOT EXISTS idx_ts_ip ON requests(timestamp, ip_address)";

// For sensitive-path scans over a time window
pub const CREATE_INDEX_TS_PATH: &str =
    "CREATE INDEX IF NOT EXISTS idx_ts_path ON requests(timestamp, path)";
