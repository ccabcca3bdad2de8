use crate::error::{ChatError, Result};
use crate::model::ReportRecord;
use rusqlite::{params, Connection};
use time::OffsetDateTime;

/// Append to the ledger. Reports are never deleted by end users.
pub fn file_report(
    conn: &Connection,
    reporter_id: &str,
    target_id: &str,
    reason: &str,
) -> Result<ReportRecord> {
    if reason.trim().is_empty() {
        return Err(ChatError::Validation("empty_reason"));
    }
    let now = OffsetDateTime::now_utc().unix_timestamp();
    conn.execute(
        "INSERT INTO reports (reporter_id, target_id, reason, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![reporter_id, target_id, reason, now],
    )?;
    Ok(ReportRecord {
        id: conn.last_insert_rowid(),
        reporter_id: reporter_id.to_string(),
        target_id: target_id.to_string(),
        reason: reason.to_string(),
        created_at: now,
    })
}

/// Reports against one chat or group, newest first. Staff triage only.
pub fn list_reports(conn: &Connection, target_id: &str) -> Result<Vec<ReportRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, reporter_id, reason, created_at FROM reports \
         WHERE target_id = ?1 ORDER BY created_at DESC, id DESC",
    )?;
    let reports = stmt
        .query_map([target_id], |row| {
            Ok(ReportRecord {
                id: row.get(0)?,
                reporter_id: row.get(1)?,
                target_id: target_id.to_string(),
                reason: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(reports)
}
