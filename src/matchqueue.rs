use crate::chats;
use crate::error::{Result, RetryPolicy};
use crate::model::{ChatSession, QueueEntry};
use rand::seq::SliceRandom;
use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;
use tracing::debug;

#[derive(Debug)]
pub enum EnqueueOutcome {
    /// A waiting partner was claimed and a chat created for both.
    Paired(ChatSession),
    /// Nobody available; the caller is now waiting in the queue.
    Waiting(QueueEntry),
    /// The caller already has a live queue entry. Idempotent no-op.
    AlreadyQueued,
}

/// Random pairing. The partner's queue entry is claimed with a
/// conditional delete: whoever removes the row wins, so two racing
/// callers can never pair with the same third party. A lost claim falls
/// back to waiting, never to an error.
pub fn enqueue(
    conn: &mut Connection,
    user_id: &str,
    display_name: &str,
    retry: &RetryPolicy,
) -> Result<EnqueueOutcome> {
    if entry_for(conn, user_id)?.is_some() {
        return Ok(EnqueueOutcome::AlreadyQueued);
    }

    let candidates = waiting_entries(conn, user_id)?;
    if let Some(partner) = candidates.choose(&mut rand::thread_rng()) {
        let tx = conn.transaction()?;
        let claimed = claim(&tx, &partner.user_id)?;
        if claimed {
            let chat = chats::create(
                &tx,
                user_id,
                display_name,
                &partner.user_id,
                &partner.display_name,
            )?;
            tx.commit()?;
            return Ok(EnqueueOutcome::Paired(chat));
        }
        drop(tx);
        debug!("claim on {} lost to a concurrent match", partner.user_id);
    }

    let entry = retry.run(|| insert_entry(conn, user_id, display_name))?;
    Ok(EnqueueOutcome::Waiting(entry))
}

/// Remove the caller's own entry. No-op when absent.
pub fn cancel(conn: &Connection, user_id: &str) -> Result<()> {
    conn.execute("DELETE FROM match_queue WHERE user_id = ?1", [user_id])?;
    Ok(())
}

pub fn entry_for(conn: &Connection, user_id: &str) -> Result<Option<QueueEntry>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, display_name, enqueued_at FROM match_queue WHERE user_id = ?1",
    )?;
    let entry = stmt.query_row([user_id], row_to_entry).optional()?;
    Ok(entry)
}

fn waiting_entries(conn: &Connection, exclude: &str) -> Result<Vec<QueueEntry>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, display_name, enqueued_at FROM match_queue WHERE user_id <> ?1",
    )?;
    let entries = stmt
        .query_map([exclude], row_to_entry)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(entries)
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueEntry> {
    Ok(QueueEntry {
        user_id: row.get(0)?,
        display_name: row.get(1)?,
        enqueued_at: row.get(2)?,
    })
}

/// Delete-to-acquire. True means this caller won the entry.
fn claim(conn: &Connection, user_id: &str) -> Result<bool> {
    let changed = conn.execute("DELETE FROM match_queue WHERE user_id = ?1", [user_id])?;
    Ok(changed == 1)
}

fn insert_entry(conn: &Connection, user_id: &str, display_name: &str) -> Result<QueueEntry> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    conn.execute(
        "INSERT OR IGNORE INTO match_queue (user_id, display_name, enqueued_at) VALUES (?1, ?2, ?3)",
        params![user_id, display_name, now],
    )?;
    Ok(QueueEntry {
        user_id: user_id.to_string(),
        display_name: display_name.to_string(),
        enqueued_at: now,
    })
}

/// Users pairing off a chat end up referenced from chat_members; the
/// queue itself must hold no trace of either side.
pub fn queue_len(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM match_queue", [], |row| row.get(0))?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::error::RetryPolicy;

    #[test]
    fn first_caller_waits_second_pairs() {
        let mut conn = db::init_db(":memory:").unwrap();
        let retry = RetryPolicy::default();
        let out = enqueue(&mut conn, "u1", "Ann", &retry).unwrap();
        assert!(matches!(out, EnqueueOutcome::Waiting(_)));
        let out = enqueue(&mut conn, "u2", "Ben", &retry).unwrap();
        let EnqueueOutcome::Paired(chat) = out else {
            panic!("expected pairing");
        };
        assert!(chat.has_participant("u1") && chat.has_participant("u2"));
        // neither side keeps a queue entry
        assert_eq!(queue_len(&conn).unwrap(), 0);
    }

    #[test]
    fn enqueue_is_idempotent() {
        let mut conn = db::init_db(":memory:").unwrap();
        let retry = RetryPolicy::default();
        assert!(matches!(
            enqueue(&mut conn, "u1", "Ann", &retry).unwrap(),
            EnqueueOutcome::Waiting(_)
        ));
        assert!(matches!(
            enqueue(&mut conn, "u1", "Ann", &retry).unwrap(),
            EnqueueOutcome::AlreadyQueued
        ));
        assert_eq!(queue_len(&conn).unwrap(), 1);
    }

    #[test]
    fn no_double_pairing_of_a_claimed_entry() {
        let mut conn = db::init_db(":memory:").unwrap();
        let retry = RetryPolicy::default();
        enqueue(&mut conn, "u1", "Ann", &retry).unwrap();
        let out = enqueue(&mut conn, "u2", "Ben", &retry).unwrap();
        assert!(matches!(out, EnqueueOutcome::Paired(_)));
        // u1's entry is gone, so a third caller cannot pair with it
        let out = enqueue(&mut conn, "u3", "Cam", &retry).unwrap();
        assert!(matches!(out, EnqueueOutcome::Waiting(_)));
    }

    #[test]
    fn lost_claim_falls_back_to_waiting() {
        let conn = db::init_db(":memory:").unwrap();
        // the entry vanished under us: the claim must report a loss,
        // not an error
        assert!(!claim(&conn, "ghost").unwrap());
    }

    #[test]
    fn cancel_is_a_noop_when_absent() {
        let mut conn = db::init_db(":memory:").unwrap();
        let retry = RetryPolicy::default();
        cancel(&conn, "u1").unwrap();
        enqueue(&mut conn, "u1", "Ann", &retry).unwrap();
        cancel(&conn, "u1").unwrap();
        assert_eq!(queue_len(&conn).unwrap(), 0);
        // after cancel the intent is fresh again
        assert!(matches!(
            enqueue(&mut conn, "u1", "Ann", &retry).unwrap(),
            EnqueueOutcome::Waiting(_)
        ));
    }
}
