//! SQL migration definitions for the location cache database.
//!
//! Migrations are applied in order on database open.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: location_cache",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Location text -> provider id resolutions. Negative entries have a NULL id.
CREATE TABLE IF NOT EXISTS location_cache (
    query_key     TEXT NOT NULL,
    tier          TEXT NOT NULL,
    location_id   TEXT,
    full_id       TEXT,
    created_at_ms INTEGER NOT NULL,
    ttl_secs      INTEGER NOT NULL,
    UNIQUE(query_key, tier)
);

CREATE INDEX IF NOT EXISTS idx_location_cache_key ON location_cache(query_key);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
