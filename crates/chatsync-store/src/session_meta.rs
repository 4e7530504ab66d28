//! Session-scoped client state: last visited channel and read watermarks.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use chatsync_shared::ChannelId;

use crate::database::Database;
use crate::error::Result;

const LAST_VISITED_KEY: &str = "last_visited_channel";

impl Database {
    // ------------------------------------------------------------------
    // Last visited channel
    // ------------------------------------------------------------------

    pub fn set_last_visited_channel(&self, channel_id: &ChannelId) -> Result<()> {
        self.conn().execute(
            "INSERT INTO session_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![LAST_VISITED_KEY, channel_id.as_str()],
        )?;
        Ok(())
    }

    pub fn last_visited_channel(&self) -> Result<Option<ChannelId>> {
        let value: Option<String> = self
            .conn()
            .query_row(
                "SELECT value FROM session_meta WHERE key = ?1",
                params![LAST_VISITED_KEY],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.map(ChannelId))
    }

    // ------------------------------------------------------------------
    // Read watermarks
    // ------------------------------------------------------------------

    /// Record that everything up to `last_seen` was viewed. Watermarks only
    /// move forward.
    pub fn save_watermark(&self, channel_id: &ChannelId, last_seen: DateTime<Utc>) -> Result<()> {
        if let Some(existing) = self.watermark(channel_id)? {
            if existing >= last_seen {
                return Ok(());
            }
        }
        self.conn().execute(
            "INSERT INTO read_watermarks (channel_id, last_seen) VALUES (?1, ?2)
             ON CONFLICT(channel_id) DO UPDATE SET last_seen = excluded.last_seen",
            params![channel_id.as_str(), last_seen.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn watermark(&self, channel_id: &ChannelId) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT last_seen FROM read_watermarks WHERE channel_id = ?1",
                params![channel_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|s| parse_timestamp(&s)).transpose()
    }

    pub fn all_watermarks(&self) -> Result<HashMap<ChannelId, DateTime<Utc>>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT channel_id, last_seen FROM read_watermarks")?;

        let rows = stmt.query_map([], |row| {
            let channel: String = row.get(0)?;
            let last_seen: String = row.get(1)?;
            Ok((channel, last_seen))
        })?;

        let mut map = HashMap::new();
        for row in rows {
            let (channel, last_seen) = row?;
            map.insert(ChannelId(channel), parse_timestamp(&last_seen)?);
        }
        Ok(map)
    }

    /// Forget everything tied to the signed-in user (logout).
    pub fn clear_session(&self) -> Result<()> {
        self.conn()
            .execute_batch("DELETE FROM session_meta; DELETE FROM read_watermarks;")?;
        Ok(())
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}
