use crate::error::{ChatError, Result};
use crate::model::{ChatMessage, ChatSession, Participant};
use crate::{moderation, stats};
use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;
use tracing::warn;
use uuid::Uuid;

/// Create a one-to-one session for a freshly matched pair. Only the
/// match queue calls this; it runs inside the queue's claim transaction.
pub fn create(
    conn: &Connection,
    user_a: &str,
    name_a: &str,
    user_b: &str,
    name_b: &str,
) -> Result<ChatSession> {
    let id = Uuid::new_v4();
    let now = OffsetDateTime::now_utc().unix_timestamp();
    conn.execute(
        "INSERT INTO chats (id, is_active, created_at) VALUES (?1, 1, ?2)",
        params![id.to_string(), now],
    )?;
    for (uid, name) in [(user_a, name_a), (user_b, name_b)] {
        conn.execute(
            "INSERT INTO chat_members (chat_id, user_id, display_name, joined_at) VALUES (?1, ?2, ?3, ?4)",
            params![id.to_string(), uid, name, now],
        )?;
    }
    get(conn, &id)
}

pub fn get(conn: &Connection, chat_id: &Uuid) -> Result<ChatSession> {
    let mut stmt = conn.prepare(
        "SELECT is_active, created_at, last_message_at, ended_at FROM chats WHERE id = ?1",
    )?;
    let row = stmt
        .query_row([chat_id.to_string()], |row| {
            Ok((
                row.get::<_, i64>(0)? != 0,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<i64>>(2)?,
                row.get::<_, Option<i64>>(3)?,
            ))
        })
        .optional()?;
    let Some((is_active, created_at, last_message_at, ended_at)) = row else {
        return Err(ChatError::NotFound("chat"));
    };
    let mut stmt = conn.prepare(
        "SELECT user_id, display_name, joined_at FROM chat_members WHERE chat_id = ?1 ORDER BY user_id",
    )?;
    let participants = stmt
        .query_map([chat_id.to_string()], |row| {
            Ok(Participant {
                user_id: row.get(0)?,
                display_name: row.get(1)?,
                joined_at: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ChatSession {
        id: *chat_id,
        participants,
        is_active,
        created_at,
        last_message_at,
        ended_at,
    })
}

/// Append a message. Fails on ended chats and for non-participants;
/// the sent-message counter is bumped best-effort.
pub fn send_message(
    conn: &mut Connection,
    chat_id: &Uuid,
    sender_id: &str,
    text: &str,
) -> Result<ChatMessage> {
    if text.trim().is_empty() {
        return Err(ChatError::Validation("empty_message"));
    }
    let id = Uuid::new_v4();
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let tx = conn.transaction()?;
    {
        let chat = get(&tx, chat_id)?;
        if !chat.has_participant(sender_id) {
            return Err(ChatError::Forbidden("not_a_participant"));
        }
        if !chat.is_active {
            return Err(ChatError::InvalidState("chat_ended"));
        }
        tx.execute(
            "INSERT INTO chat_messages (id, chat_id, sender_id, body, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id.to_string(), chat_id.to_string(), sender_id, text, now],
        )?;
        tx.execute(
            "UPDATE chats SET last_message_at = ?2 WHERE id = ?1",
            params![chat_id.to_string(), now],
        )?;
    }
    tx.commit()?;
    if let Err(e) = stats::record_message_sent(conn, sender_id) {
        warn!("stats update failed for {sender_id}: {e}");
    }
    Ok(ChatMessage {
        id,
        chat_id: *chat_id,
        sender_id: sender_id.to_string(),
        text: text.to_string(),
        created_at: now,
        read_by: Vec::new(),
    })
}

/// Messages in store order: ascending timestamp, insertion order as the
/// tie-break.
pub fn list_messages(conn: &Connection, chat_id: &Uuid, limit: usize) -> Result<Vec<ChatMessage>> {
    let limit = limit.min(500);
    let mut stmt = conn.prepare(
        "SELECT id, sender_id, body, created_at FROM chat_messages WHERE chat_id = ?1 ORDER BY created_at ASC, rowid ASC LIMIT ?2",
    )?;
    let mut messages = stmt
        .query_map(params![chat_id.to_string(), limit as i64], |row| {
            Ok(ChatMessage {
                id: Uuid::parse_str(row.get::<_, String>(0)?.as_str()).unwrap(),
                chat_id: *chat_id,
                sender_id: row.get(1)?,
                text: row.get(2)?,
                created_at: row.get(3)?,
                read_by: Vec::new(),
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let mut stmt = conn.prepare(
        "SELECT r.message_id, r.user_id FROM chat_message_reads r \
         JOIN chat_messages m ON m.id = r.message_id WHERE m.chat_id = ?1",
    )?;
    let reads = stmt
        .query_map([chat_id.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for (message_id, user_id) in reads {
        if let Some(msg) = messages.iter_mut().find(|m| m.id.to_string() == message_id) {
            msg.read_by.push(user_id);
        }
    }
    Ok(messages)
}

/// Record that a participant has read a message. The only mutation a
/// message ever sees.
pub fn mark_read(conn: &Connection, chat_id: &Uuid, message_id: &Uuid, user_id: &str) -> Result<()> {
    let chat = get(conn, chat_id)?;
    if !chat.has_participant(user_id) {
        return Err(ChatError::Forbidden("not_a_participant"));
    }
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let changed = conn.execute(
        "INSERT OR IGNORE INTO chat_message_reads (message_id, user_id, read_at) \
         SELECT id, ?2, ?3 FROM chat_messages WHERE id = ?1 AND chat_id = ?4",
        params![message_id.to_string(), user_id, now, chat_id.to_string()],
    )?;
    let _ = changed; // re-reading an already-read message is a no-op
    Ok(())
}

/// One-way `Active -> Ended`. Idempotent: ending an ended chat succeeds
/// without side effects. Completed-chat counters for both participants
/// are bumped best-effort and never block the result.
pub fn end(conn: &Connection, chat_id: &Uuid, user_id: &str) -> Result<()> {
    let chat = get(conn, chat_id)?;
    if !chat.has_participant(user_id) {
        return Err(ChatError::Forbidden("not_a_participant"));
    }
    if !chat.is_active {
        return Ok(());
    }
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let changed = conn.execute(
        "UPDATE chats SET is_active = 0, ended_at = ?2 WHERE id = ?1 AND is_active = 1",
        params![chat_id.to_string(), now],
    )?;
    if changed == 0 {
        // lost the race to a concurrent end; still a success
        return Ok(());
    }
    for p in &chat.participants {
        if let Err(e) = stats::record_chat_completed(conn, &p.user_id) {
            warn!("stats update failed for {}: {e}", p.user_id);
        }
    }
    Ok(())
}

/// File a report against this chat into the moderation ledger.
pub fn report(conn: &Connection, chat_id: &Uuid, reporter_id: &str, reason: &str) -> Result<()> {
    let chat = get(conn, chat_id)?;
    if !chat.has_participant(reporter_id) {
        return Err(ChatError::Forbidden("not_a_participant"));
    }
    moderation::file_report(conn, reporter_id, &chat_id.to_string(), reason)?;
    Ok(())
}
