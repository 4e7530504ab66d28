//! v001 -- Initial schema creation.
//!
//! Creates `session_meta` (key/value pairs such as the last visited channel)
//! and `read_watermarks`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS session_meta (
    key   TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS read_watermarks (
    channel_id TEXT PRIMARY KEY NOT NULL,
    last_seen  TEXT NOT NULL                  -- RFC-3339
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
