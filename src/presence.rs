use crate::error::Result;
use crate::model::PresenceStatus;
use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;

/// Clients heartbeat on this cadence while a chat view is open.
pub const HEARTBEAT_INTERVAL_SECS: i64 = 60;
/// A record older than two intervals reads as offline even when the
/// client never managed to say goodbye.
pub const STALE_AFTER_SECS: i64 = 2 * HEARTBEAT_INTERVAL_SECS;

/// Refresh the caller's online record. Best effort: callers log and drop
/// failures, the next tick self-corrects.
pub fn heartbeat(conn: &Connection, user_id: &str) -> Result<()> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    conn.execute(
        "INSERT INTO presence (user_id, is_online, last_seen) VALUES (?1, 1, ?2) \
         ON CONFLICT(user_id) DO UPDATE SET is_online = 1, last_seen = excluded.last_seen",
        params![user_id, now],
    )?;
    Ok(())
}

/// Called on view teardown. A crashed client never calls this; staleness
/// covers that case.
pub fn mark_offline(conn: &Connection, user_id: &str) -> Result<()> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    conn.execute(
        "INSERT INTO presence (user_id, is_online, last_seen) VALUES (?1, 0, ?2) \
         ON CONFLICT(user_id) DO UPDATE SET is_online = 0, last_seen = excluded.last_seen",
        params![user_id, now],
    )?;
    Ok(())
}

pub fn status(conn: &Connection, user_id: &str) -> Result<PresenceStatus> {
    status_at(conn, user_id, OffsetDateTime::now_utc().unix_timestamp())
}

pub fn status_at(conn: &Connection, user_id: &str, now: i64) -> Result<PresenceStatus> {
    let mut stmt = conn.prepare("SELECT is_online, last_seen FROM presence WHERE user_id = ?1")?;
    let row = stmt
        .query_row([user_id], |row| {
            Ok((row.get::<_, i64>(0)? != 0, row.get::<_, i64>(1)?))
        })
        .optional()?;
    Ok(match row {
        Some((is_online, last_seen)) => PresenceStatus {
            is_online: is_online && now - last_seen <= STALE_AFTER_SECS,
            last_seen: Some(last_seen),
        },
        None => PresenceStatus {
            is_online: false,
            last_seen: None,
        },
    })
}

/// Housekeeping: flip records that stopped heartbeating to offline so
/// readers of the raw table agree with `status`.
pub fn sweep_stale(conn: &Connection, now: i64) -> Result<usize> {
    let changed = conn.execute(
        "UPDATE presence SET is_online = 0 WHERE is_online = 1 AND last_seen < ?1",
        [now - STALE_AFTER_SECS],
    )?;
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn heartbeat_then_offline() {
        let conn = db::init_db(":memory:").unwrap();
        assert!(!status(&conn, "u1").unwrap().is_online);
        heartbeat(&conn, "u1").unwrap();
        let s = status(&conn, "u1").unwrap();
        assert!(s.is_online);
        assert!(s.last_seen.is_some());
        mark_offline(&conn, "u1").unwrap();
        assert!(!status(&conn, "u1").unwrap().is_online);
    }

    #[test]
    fn stale_records_read_as_offline() {
        let conn = db::init_db(":memory:").unwrap();
        heartbeat(&conn, "u1").unwrap();
        let now = OffsetDateTime::now_utc().unix_timestamp();
        assert!(status_at(&conn, "u1", now).unwrap().is_online);
        let later = now + STALE_AFTER_SECS + 1;
        assert!(!status_at(&conn, "u1", later).unwrap().is_online);
    }

    #[test]
    fn sweep_flips_stale_rows() {
        let conn = db::init_db(":memory:").unwrap();
        heartbeat(&conn, "u1").unwrap();
        heartbeat(&conn, "u2").unwrap();
        let now = OffsetDateTime::now_utc().unix_timestamp();
        assert_eq!(sweep_stale(&conn, now).unwrap(), 0);
        assert_eq!(sweep_stale(&conn, now + STALE_AFTER_SECS + 1).unwrap(), 2);
        let raw: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM presence WHERE is_online = 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(raw, 0);
    }
}
