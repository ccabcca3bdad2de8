use crate::error::{ChatError, Result};
use crate::model::{SupportTicket, TicketStatus};
use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;
use uuid::Uuid;

/// Support tickets move strictly forward:
/// `new -> processing -> resolved | rejected`, with `new -> rejected`
/// as a shortcut. Transitions are guarded UPDATEs so two staff members
/// racing on the same ticket cannot both win.

pub fn create(conn: &Connection, user_id: &str, body: &str) -> Result<SupportTicket> {
    if body.trim().is_empty() {
        return Err(ChatError::Validation("empty_ticket"));
    }
    let id = Uuid::new_v4();
    let now = OffsetDateTime::now_utc().unix_timestamp();
    conn.execute(
        "INSERT INTO tickets (id, user_id, body, status, created_at, updated_at) \
         VALUES (?1, ?2, ?3, 'new', ?4, ?4)",
        params![id.to_string(), user_id, body, now],
    )?;
    get(conn, &id)
}

pub fn get(conn: &Connection, ticket_id: &Uuid) -> Result<SupportTicket> {
    let mut stmt = conn.prepare(
        "SELECT user_id, body, status, assigned_to, response, created_at, updated_at \
         FROM tickets WHERE id = ?1",
    )?;
    let ticket = stmt
        .query_row([ticket_id.to_string()], |row| {
            Ok(SupportTicket {
                id: *ticket_id,
                user_id: row.get(0)?,
                body: row.get(1)?,
                status: TicketStatus::parse(row.get::<_, String>(2)?.as_str())
                    .unwrap_or(TicketStatus::New),
                assigned_to: row.get(3)?,
                response: row.get(4)?,
                created_at: row.get(5)?,
                updated_at: row.get(6)?,
            })
        })
        .optional()?;
    ticket.ok_or(ChatError::NotFound("ticket"))
}

/// `new -> processing`.
pub fn assign(conn: &Connection, ticket_id: &Uuid, staff_id: &str) -> Result<SupportTicket> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let changed = conn.execute(
        "UPDATE tickets SET status = 'processing', assigned_to = ?2, updated_at = ?3 \
         WHERE id = ?1 AND status = 'new'",
        params![ticket_id.to_string(), staff_id, now],
    )?;
    if changed == 0 {
        get(conn, ticket_id)?;
        return Err(ChatError::InvalidState("ticket_not_assignable"));
    }
    get(conn, ticket_id)
}

/// `new | processing -> resolved`; requires a non-empty response.
pub fn resolve(
    conn: &Connection,
    ticket_id: &Uuid,
    staff_id: &str,
    response: &str,
) -> Result<SupportTicket> {
    if response.trim().is_empty() {
        return Err(ChatError::Validation("empty_response"));
    }
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let changed = conn.execute(
        "UPDATE tickets SET status = 'resolved', assigned_to = ?2, response = ?3, updated_at = ?4 \
         WHERE id = ?1 AND status IN ('new', 'processing')",
        params![ticket_id.to_string(), staff_id, response, now],
    )?;
    if changed == 0 {
        get(conn, ticket_id)?;
        return Err(ChatError::InvalidState("ticket_closed"));
    }
    get(conn, ticket_id)
}

/// `new | processing -> rejected`.
pub fn reject(conn: &Connection, ticket_id: &Uuid, staff_id: &str) -> Result<SupportTicket> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let changed = conn.execute(
        "UPDATE tickets SET status = 'rejected', assigned_to = ?2, updated_at = ?3 \
         WHERE id = ?1 AND status IN ('new', 'processing')",
        params![ticket_id.to_string(), staff_id, now],
    )?;
    if changed == 0 {
        get(conn, ticket_id)?;
        return Err(ChatError::InvalidState("ticket_closed"));
    }
    get(conn, ticket_id)
}

/// Staff triage listing, newest first, optionally filtered by status.
pub fn list(conn: &Connection, status: Option<TicketStatus>) -> Result<Vec<SupportTicket>> {
    let sql = match status {
        Some(_) => {
            "SELECT id FROM tickets WHERE status = ?1 ORDER BY created_at DESC, id DESC"
        }
        None => "SELECT id FROM tickets ORDER BY created_at DESC, id DESC",
    };
    let mut stmt = conn.prepare(sql)?;
    let ids: Vec<String> = match status {
        Some(s) => stmt
            .query_map([s.as_str()], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?,
        None => stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?,
    };
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        out.push(get(conn, &Uuid::parse_str(&id).unwrap())?);
    }
    Ok(out)
}
