use crate::error::{ChatError, Result};
use crate::model::{Group, GroupMessage, GroupMessageKind, MemberRole, Membership};
use crate::stats;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use time::OffsetDateTime;
use tracing::warn;
use uuid::Uuid;

/// Longest `last_message` preview stored on the group row.
const PREVIEW_CHARS: usize = 50;

#[derive(Debug, Deserialize)]
pub struct NewGroup {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_public")]
    pub is_public: bool,
    #[serde(default)]
    pub is_anonymous: bool,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub tags: Option<String>,
}

fn default_public() -> bool {
    true
}

/// Allow-list of fields an admin may change. Anything else on the group
/// row is engine-maintained.
#[derive(Debug, Default, Deserialize)]
pub struct GroupUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_public: Option<bool>,
    pub is_anonymous: Option<bool>,
    pub avatar_url: Option<String>,
    pub tags: Option<String>,
}

pub fn create(
    conn: &mut Connection,
    owner_id: &str,
    owner_name: &str,
    data: &NewGroup,
) -> Result<Group> {
    if data.name.trim().is_empty() {
        return Err(ChatError::Validation("empty_group_name"));
    }
    let id = Uuid::new_v4();
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO groups (id, name, description, is_public, is_anonymous, created_by, member_count, created_at, last_activity, avatar_url, tags) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?7, ?8, ?9)",
        params![
            id.to_string(),
            data.name.trim(),
            data.description,
            data.is_public as i64,
            data.is_anonymous as i64,
            owner_id,
            now,
            data.avatar_url,
            data.tags
        ],
    )?;
    activate_member(&tx, &id, owner_id, MemberRole::Admin, now)?;
    let shown = shown_name(data.is_anonymous, owner_id, owner_name);
    system_message(&tx, &id, &format!("{shown} created the group"), now)?;
    tx.commit()?;
    get(conn, &id)
}

pub fn get(conn: &Connection, group_id: &Uuid) -> Result<Group> {
    let mut stmt = conn.prepare(
        "SELECT name, description, is_public, is_anonymous, created_by, member_count, created_at, last_activity, last_message, avatar_url, tags \
         FROM groups WHERE id = ?1",
    )?;
    let group = stmt
        .query_row([group_id.to_string()], |row| {
            Ok(Group {
                id: *group_id,
                name: row.get(0)?,
                description: row.get(1)?,
                is_public: row.get::<_, i64>(2)? != 0,
                is_anonymous: row.get::<_, i64>(3)? != 0,
                created_by: row.get(4)?,
                member_count: row.get(5)?,
                created_at: row.get(6)?,
                last_activity: row.get(7)?,
                last_message: row.get(8)?,
                avatar_url: row.get(9)?,
                tags: row.get(10)?,
            })
        })
        .optional()?;
    group.ok_or(ChatError::NotFound("group"))
}

/// Join a public group. No-op success (returning false) when already an
/// active member; a returning member is reactivated as a plain member.
pub fn join(
    conn: &mut Connection,
    group_id: &Uuid,
    user_id: &str,
    display_name: &str,
) -> Result<bool> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let tx = conn.transaction()?;
    let group = get(&tx, group_id)?;
    if !group.is_public {
        return Err(ChatError::Forbidden("group_not_public"));
    }
    if !activate_member(&tx, group_id, user_id, MemberRole::Member, now)? {
        // already active: no count change, no duplicate system message
        return Ok(false);
    }
    let shown = shown_name(group.is_anonymous, user_id, display_name);
    system_message(&tx, group_id, &format!("{shown} joined"), now)?;
    tx.commit()?;
    Ok(true)
}

/// Leave a group. The last active admin must hand over first.
pub fn leave(
    conn: &mut Connection,
    group_id: &Uuid,
    user_id: &str,
    display_name: &str,
) -> Result<()> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let tx = conn.transaction()?;
    let group = get(&tx, group_id)?;
    let member = membership(&tx, group_id, user_id)?
        .filter(|m| m.is_active)
        .ok_or(ChatError::NotFound("member"))?;
    if member.role == MemberRole::Admin && active_admin_count(&tx, group_id)? <= 1 {
        return Err(ChatError::InvalidState("sole_admin_cannot_leave"));
    }
    tx.execute(
        "UPDATE group_members SET is_active = 0, left_at = ?3 WHERE group_id = ?1 AND user_id = ?2",
        params![group_id.to_string(), user_id, now],
    )?;
    tx.execute(
        "UPDATE groups SET member_count = member_count - 1 WHERE id = ?1",
        [group_id.to_string()],
    )?;
    tx.execute(
        "DELETE FROM user_groups WHERE user_id = ?1 AND group_id = ?2",
        params![user_id, group_id.to_string()],
    )?;
    let shown = shown_name(group.is_anonymous, user_id, display_name);
    system_message(&tx, group_id, &format!("{shown} left"), now)?;
    tx.commit()?;
    Ok(())
}

/// Admin-only settings change, restricted to the `GroupUpdate` allow-list.
pub fn update_settings(
    conn: &mut Connection,
    group_id: &Uuid,
    acting_user: &str,
    changes: &GroupUpdate,
) -> Result<Group> {
    if let Some(name) = &changes.name {
        if name.trim().is_empty() {
            return Err(ChatError::Validation("empty_group_name"));
        }
    }
    let tx = conn.transaction()?;
    get(&tx, group_id)?;
    require_admin(&tx, group_id, acting_user)?;
    let id = group_id.to_string();
    if let Some(name) = &changes.name {
        tx.execute("UPDATE groups SET name = ?2 WHERE id = ?1", params![id, name.trim()])?;
    }
    if let Some(description) = &changes.description {
        tx.execute(
            "UPDATE groups SET description = ?2 WHERE id = ?1",
            params![id, description],
        )?;
    }
    if let Some(is_public) = changes.is_public {
        tx.execute(
            "UPDATE groups SET is_public = ?2 WHERE id = ?1",
            params![id, is_public as i64],
        )?;
    }
    if let Some(is_anonymous) = changes.is_anonymous {
        tx.execute(
            "UPDATE groups SET is_anonymous = ?2 WHERE id = ?1",
            params![id, is_anonymous as i64],
        )?;
    }
    if let Some(avatar_url) = &changes.avatar_url {
        tx.execute(
            "UPDATE groups SET avatar_url = ?2 WHERE id = ?1",
            params![id, avatar_url],
        )?;
    }
    if let Some(tags) = &changes.tags {
        tx.execute("UPDATE groups SET tags = ?2 WHERE id = ?1", params![id, tags])?;
    }
    tx.commit()?;
    get(conn, group_id)
}

/// Change a member's role. Admin-gated; the sole active admin cannot be
/// demoted.
pub fn set_role(
    conn: &mut Connection,
    group_id: &Uuid,
    acting_user: &str,
    target_user: &str,
    role: MemberRole,
) -> Result<()> {
    let tx = conn.transaction()?;
    get(&tx, group_id)?;
    require_admin(&tx, group_id, acting_user)?;
    let target = membership(&tx, group_id, target_user)?
        .filter(|m| m.is_active)
        .ok_or(ChatError::NotFound("member"))?;
    if target.role == MemberRole::Admin
        && role == MemberRole::Member
        && active_admin_count(&tx, group_id)? <= 1
    {
        return Err(ChatError::InvalidState("sole_admin_cannot_be_demoted"));
    }
    tx.execute(
        "UPDATE group_members SET role = ?3 WHERE group_id = ?1 AND user_id = ?2",
        params![group_id.to_string(), target_user, role.as_str()],
    )?;
    tx.commit()?;
    Ok(())
}

/// Post into a group. A non-member posting to a public group is
/// auto-joined in the same transaction; the same policy applies on every
/// post path.
pub fn post(
    conn: &mut Connection,
    group_id: &Uuid,
    sender_id: &str,
    display_name: &str,
    text: &str,
) -> Result<GroupMessage> {
    if text.trim().is_empty() {
        return Err(ChatError::Validation("empty_message"));
    }
    let id = Uuid::new_v4();
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let tx = conn.transaction()?;
    let group = get(&tx, group_id)?;
    let active = membership(&tx, group_id, sender_id)?
        .map(|m| m.is_active)
        .unwrap_or(false);
    if !active {
        if !group.is_public {
            return Err(ChatError::Forbidden("not_a_member"));
        }
        if activate_member(&tx, group_id, sender_id, MemberRole::Member, now)? {
            let shown = shown_name(group.is_anonymous, sender_id, display_name);
            system_message(&tx, group_id, &format!("{shown} joined"), now)?;
        }
    }
    let sender_name = shown_name(group.is_anonymous, sender_id, display_name);
    tx.execute(
        "INSERT INTO group_messages (id, group_id, sender_id, sender_name, body, kind, created_at, is_deleted) \
         VALUES (?1, ?2, ?3, ?4, ?5, 'message', ?6, 0)",
        params![
            id.to_string(),
            group_id.to_string(),
            sender_id,
            sender_name,
            text,
            now
        ],
    )?;
    tx.execute(
        "UPDATE groups SET last_activity = ?2, last_message = ?3 WHERE id = ?1",
        params![group_id.to_string(), now, preview(text)],
    )?;
    tx.commit()?;
    if let Err(e) = stats::record_message_sent(conn, sender_id) {
        warn!("stats update failed for {sender_id}: {e}");
    }
    Ok(GroupMessage {
        id,
        group_id: *group_id,
        sender_id: sender_id.to_string(),
        sender_name,
        text: text.to_string(),
        kind: GroupMessageKind::Message,
        created_at: now,
        is_deleted: false,
    })
}

/// Visible messages, ascending by timestamp with insertion order as the
/// tie-break.
pub fn list_messages(conn: &Connection, group_id: &Uuid, limit: usize) -> Result<Vec<GroupMessage>> {
    let limit = limit.min(500);
    let mut stmt = conn.prepare(
        "SELECT id, sender_id, sender_name, body, kind, created_at FROM group_messages \
         WHERE group_id = ?1 AND is_deleted = 0 ORDER BY created_at ASC, rowid ASC LIMIT ?2",
    )?;
    let messages = stmt
        .query_map(params![group_id.to_string(), limit as i64], |row| {
            Ok(GroupMessage {
                id: Uuid::parse_str(row.get::<_, String>(0)?.as_str()).unwrap(),
                group_id: *group_id,
                sender_id: row.get(1)?,
                sender_name: row.get(2)?,
                text: row.get(3)?,
                kind: GroupMessageKind::parse(row.get::<_, String>(4)?.as_str())
                    .unwrap_or(GroupMessageKind::Message),
                created_at: row.get(5)?,
                is_deleted: false,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(messages)
}

/// Soft-delete a message. Authors may remove their own; admins any.
/// System messages are never edited or removed.
pub fn remove_message(
    conn: &mut Connection,
    group_id: &Uuid,
    message_id: &Uuid,
    acting_user: &str,
) -> Result<()> {
    let tx = conn.transaction()?;
    get(&tx, group_id)?;
    let mut stmt =
        tx.prepare("SELECT sender_id, kind FROM group_messages WHERE id = ?1 AND group_id = ?2")?;
    let row = stmt
        .query_row(params![message_id.to_string(), group_id.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .optional()?;
    drop(stmt);
    let Some((sender_id, kind)) = row else {
        return Err(ChatError::NotFound("message"));
    };
    if kind == "system" {
        return Err(ChatError::InvalidState("system_message"));
    }
    if sender_id != acting_user {
        require_admin(&tx, group_id, acting_user)?;
    }
    tx.execute(
        "UPDATE group_messages SET is_deleted = 1 WHERE id = ?1",
        [message_id.to_string()],
    )?;
    tx.commit()?;
    Ok(())
}

pub fn members(conn: &Connection, group_id: &Uuid) -> Result<Vec<Membership>> {
    get(conn, group_id)?;
    let mut stmt = conn.prepare(
        "SELECT user_id, role, joined_at, is_active, left_at FROM group_members \
         WHERE group_id = ?1 ORDER BY joined_at ASC, user_id ASC",
    )?;
    let members = stmt
        .query_map([group_id.to_string()], |row| {
            Ok(Membership {
                user_id: row.get(0)?,
                role: MemberRole::parse(row.get::<_, String>(1)?.as_str())
                    .unwrap_or(MemberRole::Member),
                joined_at: row.get(2)?,
                is_active: row.get::<_, i64>(3)? != 0,
                left_at: row.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(members)
}

/// The caller's group list. A dangling reference simply drops out of the
/// join; it is repaired lazily, never treated as an error.
pub fn groups_for_user(conn: &Connection, user_id: &str) -> Result<Vec<Group>> {
    let mut stmt = conn.prepare(
        "SELECT g.id FROM user_groups ug JOIN groups g ON g.id = ug.group_id \
         WHERE ug.user_id = ?1 ORDER BY g.last_activity DESC",
    )?;
    let ids = stmt
        .query_map([user_id], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        out.push(get(conn, &Uuid::parse_str(&id).unwrap())?);
    }
    Ok(out)
}

pub fn list_public(conn: &Connection, limit: usize) -> Result<Vec<Group>> {
    let limit = limit.min(200);
    let mut stmt = conn.prepare(
        "SELECT id FROM groups WHERE is_public = 1 ORDER BY last_activity DESC LIMIT ?1",
    )?;
    let ids = stmt
        .query_map([limit as i64], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        out.push(get(conn, &Uuid::parse_str(&id).unwrap())?);
    }
    Ok(out)
}

/// Repair path for the denormalized counter: recompute from the
/// membership rows and persist the truth.
pub fn recount_members(conn: &Connection, group_id: &Uuid) -> Result<i64> {
    get(conn, group_id)?;
    conn.execute(
        "UPDATE groups SET member_count = \
         (SELECT COUNT(*) FROM group_members WHERE group_id = ?1 AND is_active = 1) \
         WHERE id = ?1",
        [group_id.to_string()],
    )?;
    let count: i64 = conn.query_row(
        "SELECT member_count FROM groups WHERE id = ?1",
        [group_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn membership(
    conn: &Connection,
    group_id: &Uuid,
    user_id: &str,
) -> Result<Option<Membership>> {
    let mut stmt = conn.prepare(
        "SELECT role, joined_at, is_active, left_at FROM group_members \
         WHERE group_id = ?1 AND user_id = ?2",
    )?;
    let member = stmt
        .query_row(params![group_id.to_string(), user_id], |row| {
            Ok(Membership {
                user_id: user_id.to_string(),
                role: MemberRole::parse(row.get::<_, String>(0)?.as_str())
                    .unwrap_or(MemberRole::Member),
                joined_at: row.get(1)?,
                is_active: row.get::<_, i64>(2)? != 0,
                left_at: row.get(3)?,
            })
        })
        .optional()?;
    Ok(member)
}

/// Insert or reactivate a membership row and bump the counter. Returns
/// false when the user was already active (nothing written).
fn activate_member(
    conn: &Connection,
    group_id: &Uuid,
    user_id: &str,
    role: MemberRole,
    now: i64,
) -> Result<bool> {
    match membership(conn, group_id, user_id)? {
        Some(m) if m.is_active => return Ok(false),
        Some(_) => {
            conn.execute(
                "UPDATE group_members SET role = ?3, is_active = 1, joined_at = ?4, left_at = NULL \
                 WHERE group_id = ?1 AND user_id = ?2",
                params![group_id.to_string(), user_id, role.as_str(), now],
            )?;
        }
        None => {
            conn.execute(
                "INSERT INTO group_members (group_id, user_id, role, joined_at, is_active) \
                 VALUES (?1, ?2, ?3, ?4, 1)",
                params![group_id.to_string(), user_id, role.as_str(), now],
            )?;
        }
    }
    conn.execute(
        "UPDATE groups SET member_count = member_count + 1 WHERE id = ?1",
        [group_id.to_string()],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO user_groups (user_id, group_id) VALUES (?1, ?2)",
        params![user_id, group_id.to_string()],
    )?;
    Ok(true)
}

fn active_admin_count(conn: &Connection, group_id: &Uuid) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM group_members WHERE group_id = ?1 AND role = 'admin' AND is_active = 1",
        [group_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(count)
}

fn require_admin(conn: &Connection, group_id: &Uuid, user_id: &str) -> Result<()> {
    let is_admin = membership(conn, group_id, user_id)?
        .map(|m| m.is_active && m.role == MemberRole::Admin)
        .unwrap_or(false);
    if is_admin {
        Ok(())
    } else {
        Err(ChatError::Forbidden("admin_only"))
    }
}

fn system_message(conn: &Connection, group_id: &Uuid, text: &str, now: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO group_messages (id, group_id, sender_id, sender_name, body, kind, created_at, is_deleted) \
         VALUES (?1, ?2, 'system', 'system', ?3, 'system', ?4, 0)",
        params![Uuid::new_v4().to_string(), group_id.to_string(), text, now],
    )?;
    Ok(())
}

/// Deterministic pseudonym for anonymous groups.
fn shown_name(anonymous: bool, user_id: &str, display_name: &str) -> String {
    if anonymous {
        let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("anon:{user_id}").as_bytes());
        format!("anon-{}", &id.simple().to_string()[..8])
    } else {
        display_name.to_string()
    }
}

fn preview(text: &str) -> String {
    text.chars().take(PREVIEW_CHARS).collect()
}
