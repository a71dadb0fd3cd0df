//! Typed query layer over [`DbPool`], replacing ad hoc `serde_json::Value`
//! row maps with the tagged [`crate::model::MessageContent`] variant
//! model. Table and column names are this tool's own generic schema
//! assumption, not any one client's literal layout — message-format
//! transcoding beyond what's needed to populate these types is out of
//! scope.

use crate::error::CoreResult;
use crate::model::{Chatroom, Contact, GroupName, Message, MessageContent, Session};
use crate::pool::DbPool;
use rusqlite::{OptionalExtension, Row};

/// `type_id` values recognized in the `message` table's `type_id` column.
/// Anything else becomes [`MessageContent::Other`].
mod type_id {
    pub const TEXT: i64 = 1;
    pub const IMAGE: i64 = 3;
    pub const VOICE: i64 = 34;
    pub const CARD: i64 = 42;
    pub const VIDEO: i64 = 43;
    pub const LOCATION: i64 = 48;
    pub const VOIP: i64 = 50;
    pub const SHARE: i64 = 49;
    pub const SYSTEM: i64 = 10000;
}

fn row_to_message(row: &Row) -> rusqlite::Result<Message> {
    let local_id: i64 = row.get("local_id")?;
    let talker: String = row.get("talker")?;
    let sender: Option<String> = row.get("sender")?;
    let create_time: i64 = row.get("create_time")?;
    let status: i64 = row.get("status")?;
    let kind: i64 = row.get("type_id")?;
    let body: Option<String> = row.get("body")?;
    let extra: Option<String> = row.get("extra_json")?;

    let extra_value: Option<serde_json::Value> =
        extra.as_deref().and_then(|s| serde_json::from_str(s).ok());

    let content = match kind {
        type_id::TEXT => MessageContent::Text { body: body.unwrap_or_default() },
        type_id::IMAGE => MessageContent::Image {
            content_hash: field_str(&extra_value, "content_hash").unwrap_or_default(),
            thumb_hash: field_str(&extra_value, "thumb_hash"),
        },
        type_id::VIDEO => MessageContent::Video {
            content_hash: field_str(&extra_value, "content_hash").unwrap_or_default(),
            duration_secs: field_u32(&extra_value, "duration_secs"),
        },
        type_id::VOICE => MessageContent::Voice {
            content_hash: field_str(&extra_value, "content_hash").unwrap_or_default(),
            duration_secs: field_u32(&extra_value, "duration_secs"),
        },
        type_id::CARD => MessageContent::Card {
            title: field_str(&extra_value, "title").unwrap_or_default(),
            display_name: field_str(&extra_value, "display_name").unwrap_or_default(),
        },
        type_id::LOCATION => MessageContent::Location {
            label: field_str(&extra_value, "label").unwrap_or_default(),
            lat: field_f64(&extra_value, "lat").unwrap_or(0.0),
            lng: field_f64(&extra_value, "lng").unwrap_or(0.0),
        },
        type_id::SHARE => MessageContent::Share {
            sub: field_str(&extra_value, "sub").unwrap_or_default(),
            title: field_str(&extra_value, "title").unwrap_or_default(),
            url: field_str(&extra_value, "url"),
        },
        type_id::VOIP => MessageContent::Voip { duration_secs: field_u32(&extra_value, "duration_secs") },
        type_id::SYSTEM => MessageContent::System { text: body.unwrap_or_default() },
        other => MessageContent::Other { type_id: other, raw: extra_value.unwrap_or(serde_json::Value::Null) },
    };

    Ok(Message { local_id, talker, sender, create_time, status, content })
}

fn field_str(value: &Option<serde_json::Value>, key: &str) -> Option<String> {
    value.as_ref()?.get(key)?.as_str().map(String::from)
}

fn field_u32(value: &Option<serde_json::Value>, key: &str) -> Option<u32> {
    value.as_ref()?.get(key)?.as_u64().map(|n| n as u32)
}

fn field_f64(value: &Option<serde_json::Value>, key: &str) -> Option<f64> {
    value.as_ref()?.get(key)?.as_f64()
}

/// Messages for one talker, newest first, across every message shard
/// in the group rather than a single handle.
pub fn messages_for_talker(pool: &DbPool, talker: &str, limit: usize, offset: usize) -> CoreResult<Vec<Message>> {
    let sql = "SELECT local_id, talker, sender, create_time, status, type_id, body, extra_json \
               FROM message WHERE talker = ?1 ORDER BY create_time DESC LIMIT ?2 OFFSET ?3";
    let mut out = pool.with_group(GroupName::MessageShards, |conn| {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map((talker, limit as i64, offset as i64), row_to_message)?;
        let mut shard_out = Vec::new();
        for row in rows {
            shard_out.push(row?);
        }
        Ok(shard_out)
    })?;
    let mut flat: Vec<Message> = out.drain(..).flatten().collect();
    flat.sort_by(|a, b| b.create_time.cmp(&a.create_time));
    flat.truncate(limit);
    Ok(flat)
}

/// Full-text-ish substring search across every shard in the group.
pub fn search_messages(pool: &DbPool, keyword: &str, limit: usize) -> CoreResult<Vec<Message>> {
    let sql = "SELECT local_id, talker, sender, create_time, status, type_id, body, extra_json \
               FROM message WHERE body LIKE ?1 ORDER BY create_time DESC LIMIT ?2";
    let pattern = format!("%{}%", keyword);
    let mut out = pool.with_group(GroupName::MessageShards, |conn| {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map((pattern.as_str(), limit as i64), row_to_message)?;
        let mut shard_out = Vec::new();
        for row in rows {
            shard_out.push(row?);
        }
        Ok(shard_out)
    })?;
    let mut flat: Vec<Message> = out.drain(..).flatten().collect();
    flat.sort_by(|a, b| b.create_time.cmp(&a.create_time));
    flat.truncate(limit);
    Ok(flat)
}

pub fn contacts(pool: &DbPool) -> CoreResult<Vec<Contact>> {
    let sql = "SELECT user_name, nickname, remark, account FROM contact";
    let mut out = pool.with_group(GroupName::Contacts, |conn| {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map((), |row: &Row| {
            Ok(Contact {
                user_name: row.get("user_name")?,
                nickname: row.get("nickname")?,
                remark: row.get("remark")?,
                account: row.get("account")?,
            })
        })?;
        let mut shard_out = Vec::new();
        for row in rows {
            shard_out.push(row?);
        }
        Ok(shard_out)
    })?;
    Ok(out.drain(..).flatten().collect())
}

/// Chatrooms with their member list, kept as plain `user_name` strings
/// rather than `Contact` references: contacts and chatrooms are separate
/// maps, joined by the caller rather than cross-referenced in-model.
pub fn chatrooms(pool: &DbPool) -> CoreResult<Vec<Chatroom>> {
    let room_sql = "SELECT user_name, announcement FROM chatroom";
    let member_sql = "SELECT member_user_name FROM chatroom_member WHERE chatroom_user_name = ?1";

    let mut out = pool.with_group(GroupName::Chatrooms, |conn| {
        let mut room_stmt = conn.prepare(room_sql)?;
        let rooms = room_stmt.query_map((), |row: &Row| {
            let user_name: String = row.get("user_name")?;
            let announcement: Option<String> = row.get("announcement")?;
            Ok((user_name, announcement))
        })?;

        let mut shard_out = Vec::new();
        for room in rooms {
            let (user_name, announcement) = room?;
            let mut member_stmt = conn.prepare(member_sql)?;
            let members = member_stmt.query_map((user_name.as_str(),), |row: &Row| row.get::<_, String>(0))?;
            let mut member_user_names = Vec::new();
            for m in members {
                member_user_names.push(m?);
            }
            shard_out.push(Chatroom { user_name, announcement, member_user_names });
        }
        Ok(shard_out)
    })?;
    Ok(out.drain(..).flatten().collect())
}

pub fn sessions(pool: &DbPool) -> CoreResult<Vec<Session>> {
    let sql = "SELECT user_name, unread_count, last_content, last_timestamp \
               FROM session ORDER BY last_timestamp DESC";
    let mut out = pool.with_group(GroupName::Sessions, |conn| {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map((), |row: &Row| {
            Ok(Session {
                user_name: row.get("user_name")?,
                unread_count: row.get("unread_count")?,
                last_content: row.get("last_content")?,
                last_timestamp: row.get("last_timestamp")?,
            })
        })?;
        let mut shard_out = Vec::new();
        for row in rows {
            shard_out.push(row?);
        }
        Ok(shard_out)
    })?;
    let mut flat: Vec<Session> = out.drain(..).flatten().collect();
    flat.sort_by(|a, b| b.last_timestamp.cmp(&a.last_timestamp));
    Ok(flat)
}

/// Looks up a media blob's on-disk path by content hash in the media
/// group (the hardlink/media-index database).
pub fn media_path_by_hash(pool: &DbPool, content_hash: &str) -> CoreResult<Option<String>> {
    let sql = "SELECT file_path FROM media_index WHERE content_hash = ?1 LIMIT 1";
    let mut out = pool.with_group(GroupName::Media, |conn| {
        conn.query_row(sql, (content_hash,), |row| row.get::<_, String>(0))
            .optional()
            .map_err(crate::error::CoreError::from)
    })?;
    Ok(out.drain(..).flatten().next())
}

/// Formats a unix-epoch-seconds timestamp (`create_time`/`last_timestamp`)
/// for CLI display.
pub fn format_timestamp(timestamp: i64) -> String {
    let dt = chrono::DateTime::from_timestamp(timestamp, 0)
        .unwrap_or_else(|| chrono::DateTime::from_timestamp(0, 0).unwrap())
        .naive_local();
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn seed_messages(dir: &std::path::Path) {
        let conn = Connection::open(dir.join("msg_1.db")).unwrap();
        conn.execute_batch(
            "CREATE TABLE message (local_id INTEGER, talker TEXT, sender TEXT, create_time INTEGER,
             status INTEGER, type_id INTEGER, body TEXT, extra_json TEXT);
             INSERT INTO message VALUES (1, 'alice', 'alice', 100, 2, 1, 'hi there', NULL);
             INSERT INTO message VALUES (2, 'alice', 'me', 200, 2, 1, 'hello back', NULL);
             INSERT INTO message VALUES (3, 'bob', 'bob', 150, 2, 99, NULL, '{\"note\":1}');",
        )
        .unwrap();
    }

    #[test]
    fn messages_for_talker_orders_newest_first_and_maps_text_kind() {
        let dir = tempfile::tempdir().unwrap();
        seed_messages(dir.path());
        let pool = DbPool::open(dir.path()).unwrap();

        let msgs = messages_for_talker(&pool, "alice", 10, 0).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].local_id, 2);
        assert!(matches!(&msgs[0].content, MessageContent::Text { body } if body == "hello back"));
    }

    #[test]
    fn unknown_type_id_becomes_other_variant() {
        let dir = tempfile::tempdir().unwrap();
        seed_messages(dir.path());
        let pool = DbPool::open(dir.path()).unwrap();

        let msgs = messages_for_talker(&pool, "bob", 10, 0).unwrap();
        assert_eq!(msgs.len(), 1);
        match &msgs[0].content {
            MessageContent::Other { type_id, raw } => {
                assert_eq!(*type_id, 99);
                assert_eq!(raw.get("note").and_then(|v| v.as_i64()), Some(1));
            }
            other => panic!("expected Other variant, got {:?}", other),
        }
    }
}
