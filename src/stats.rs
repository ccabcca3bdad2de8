use crate::error::Result;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

/// Per-user aggregate counters. Writes here are fire-and-forget from the
/// callers' point of view: a failed bump is logged and swallowed, never
/// surfaced as a failure of the primary operation.

#[derive(Debug, Serialize, Clone, PartialEq, Eq, Default)]
pub struct UserStats {
    pub messages_sent: i64,
    pub chats_completed: i64,
}

pub fn record_message_sent(conn: &Connection, user_id: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO user_stats (user_id, messages_sent) VALUES (?1, 1) \
         ON CONFLICT(user_id) DO UPDATE SET messages_sent = messages_sent + 1",
        params![user_id],
    )?;
    Ok(())
}

pub fn record_chat_completed(conn: &Connection, user_id: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO user_stats (user_id, chats_completed) VALUES (?1, 1) \
         ON CONFLICT(user_id) DO UPDATE SET chats_completed = chats_completed + 1",
        params![user_id],
    )?;
    Ok(())
}

pub fn for_user(conn: &Connection, user_id: &str) -> Result<UserStats> {
    let mut stmt = conn.prepare(
        "SELECT messages_sent, chats_completed FROM user_stats WHERE user_id = ?1",
    )?;
    let stats = stmt
        .query_row([user_id], |row| {
            Ok(UserStats {
                messages_sent: row.get(0)?,
                chats_completed: row.get(1)?,
            })
        })
        .optional()?;
    Ok(stats.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn counters_accumulate_independently() {
        let conn = db::init_db(":memory:").unwrap();
        assert_eq!(for_user(&conn, "u1").unwrap(), UserStats::default());
        record_message_sent(&conn, "u1").unwrap();
        record_message_sent(&conn, "u1").unwrap();
        record_chat_completed(&conn, "u1").unwrap();
        let s = for_user(&conn, "u1").unwrap();
        assert_eq!(s.messages_sent, 2);
        assert_eq!(s.chats_completed, 1);
        assert_eq!(for_user(&conn, "u2").unwrap(), UserStats::default());
    }
}
