//! DB pool and filesystem watcher. Wraps a directory-walk-plus-regex
//! db-type matcher into a first-class `GroupPattern` table and a
//! reader/writer-locked pool of cached connections.

pub mod copy_cache;
pub mod watcher;

use crate::error::{CoreError, CoreResult};
use crate::model::GroupName;
use regex::Regex;
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

/// One named group's file-name matcher: a first-class table carrying a
/// compiled pattern per group, rather than an ad hoc string array.
struct GroupPattern {
    name: GroupName,
    regex: Regex,
}

fn group_patterns() -> Vec<GroupPattern> {
    // Patterns match this class of messaging client's on-disk db naming
    // conventions: numbered message shards, and one file per other group.
    let table: &[(GroupName, &str)] = &[
        (GroupName::MessageShards, r"(?i)^msg[_-]?\d*\.db$"),
        (GroupName::Contacts, r"(?i)^contacts?\.db$"),
        (GroupName::Chatrooms, r"(?i)^chatrooms?\.db$"),
        (GroupName::Sessions, r"(?i)^sessions?\.db$"),
        (GroupName::Media, r"(?i)^(hardlink|media[_-]?index)\.db$"),
        (GroupName::Voice, r"(?i)^voice\.db$"),
    ];
    table
        .iter()
        .map(|(name, pattern)| GroupPattern { name: *name, regex: Regex::new(pattern).unwrap() })
        .collect()
}

type Handle = Arc<Mutex<Connection>>;

/// A callback registered against one group, run synchronously by the
/// watcher thread after that group's handle list is invalidated. Callback
/// invocation order per group mirrors the filesystem notifier's event
/// order.
type GroupCallback = Box<dyn Fn() + Send + Sync>;

/// Pool of open connections to one data directory's group databases.
/// Readers take the read side of the lock; a rescan (triggered by the
/// watcher on a new file, or manually) takes the write side and swaps
/// in a fresh handle table.
pub struct DbPool {
    data_dir: PathBuf,
    patterns: Vec<GroupPattern>,
    handles: RwLock<HashMap<GroupName, Vec<Handle>>>,
    callbacks: Mutex<HashMap<GroupName, Vec<GroupCallback>>>,
}

impl DbPool {
    pub fn open(data_dir: impl Into<PathBuf>) -> CoreResult<Self> {
        let pool = DbPool {
            data_dir: data_dir.into(),
            patterns: group_patterns(),
            handles: RwLock::new(HashMap::new()),
            callbacks: Mutex::new(HashMap::new()),
        };
        pool.rescan()?;
        Ok(pool)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Registers a callback invoked every time `group`'s handle list is
    /// invalidated. Callbacks run synchronously on the watcher thread, in
    /// registration order, and must finish before the next event for the
    /// same group is processed — a callback that needs background work
    /// must queue it itself rather than block the caller here.
    pub fn on_invalidate(&self, group: GroupName, callback: impl Fn() + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().entry(group).or_default().push(Box::new(callback));
    }

    /// Looks up which group (if any) a bare filename belongs to, per the
    /// same pattern table `rescan` uses. Used by the watcher to decide
    /// which group a `Create` event invalidates without re-deriving the
    /// pattern table itself.
    pub fn group_for_filename(&self, file_name: &str) -> Option<GroupName> {
        self.patterns.iter().find(|p| p.regex.is_match(file_name)).map(|p| p.name)
    }

    /// Walks `data_dir`, matches every file against the group patterns,
    /// opens a connection for each match, and atomically swaps in the
    /// new table. Files that fail to open (e.g. still encrypted, or
    /// mid-write) are logged and skipped rather than aborting the scan.
    pub fn rescan(&self) -> CoreResult<()> {
        let mut fresh: HashMap<GroupName, Vec<Handle>> = HashMap::new();
        for entry in walkdir::WalkDir::new(&self.data_dir) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy();
            let Some(group) = self.patterns.iter().find(|p| p.regex.is_match(&file_name)) else {
                continue;
            };
            match Connection::open(entry.path()) {
                Ok(conn) => fresh.entry(group.name).or_default().push(Arc::new(Mutex::new(conn))),
                Err(e) => log::warn!("skipping {}: {}", entry.path().display(), e),
            }
        }

        let mut guard = self.handles.write().unwrap();
        *guard = fresh;
        Ok(())
    }

    /// Re-walks `data_dir` but only swaps in a fresh handle list for
    /// `group`, leaving every other group's handles untouched, then runs
    /// that group's registered callbacks in order. A per-group
    /// invalidation, as opposed to `rescan`'s whole-pool sweep.
    pub fn invalidate_group(&self, group: GroupName) -> CoreResult<()> {
        let Some(pattern) = self.patterns.iter().find(|p| p.name == group) else {
            return Ok(());
        };
        let mut fresh = Vec::new();
        for entry in walkdir::WalkDir::new(&self.data_dir) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy();
            if !pattern.regex.is_match(&file_name) {
                continue;
            }
            match Connection::open(entry.path()) {
                Ok(conn) => fresh.push(Arc::new(Mutex::new(conn))),
                Err(e) => log::warn!("skipping {}: {}", entry.path().display(), e),
            }
        }

        self.handles.write().unwrap().insert(group, fresh);

        let callbacks = self.callbacks.lock().unwrap();
        if let Some(group_callbacks) = callbacks.get(&group) {
            for callback in group_callbacks {
                callback();
            }
        }
        Ok(())
    }

    /// Runs `f` against every open connection in `group`, collecting
    /// results in file-discovery order. A per-connection failure is
    /// returned immediately rather than silently dropped, since query
    /// callers need to know a shard was unreadable.
    pub fn with_group<F, R>(&self, group: GroupName, mut f: F) -> CoreResult<Vec<R>>
    where
        F: FnMut(&Connection) -> CoreResult<R>,
    {
        let guard = self.handles.read().unwrap();
        let Some(conns) = guard.get(&group) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::with_capacity(conns.len());
        for conn in conns {
            let conn = conn.lock().unwrap();
            out.push(f(&conn)?);
        }
        Ok(out)
    }

    pub fn group_count(&self, group: GroupName) -> usize {
        self.handles.read().unwrap().get(&group).map(|v| v.len()).unwrap_or(0)
    }
}

/// Generic row-to-JSON query helper, for ad hoc table/column
/// introspection (the `db-show`, `table-dump` CLI commands) rather than
/// the typed query layer.
pub fn execute_query_json(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> CoreResult<Vec<serde_json::Value>> {
    let mut stmt = conn.prepare(sql)?;
    let column_names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let rows = stmt.query_map(params, |row| {
        let mut map = serde_json::Map::new();
        for (i, name) in column_names.iter().enumerate() {
            let value = match row.get_ref(i)? {
                rusqlite::types::ValueRef::Null => serde_json::Value::Null,
                rusqlite::types::ValueRef::Integer(i) => serde_json::Value::Number(i.into()),
                rusqlite::types::ValueRef::Real(f) => serde_json::Number::from_f64(f)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::String(f.to_string())),
                rusqlite::types::ValueRef::Text(t) => {
                    serde_json::Value::String(String::from_utf8_lossy(t).to_string())
                }
                rusqlite::types::ValueRef::Blob(b) => {
                    serde_json::Value::String(format!("<blob: {} bytes>", b.len()))
                }
            };
            map.insert(name.clone(), value);
        }
        Ok(serde_json::Value::Object(map))
    })?;

    let mut result = Vec::new();
    for row in rows {
        result.push(row.map_err(CoreError::from)?);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescan_discovers_group_by_filename_pattern() {
        let dir = tempfile::tempdir().unwrap();
        Connection::open(dir.path().join("contacts.db")).unwrap();
        Connection::open(dir.path().join("msg_1.db")).unwrap();
        Connection::open(dir.path().join("msg_2.db")).unwrap();
        Connection::open(dir.path().join("unrelated.txt.db")).unwrap(); // still matches msg? no

        let pool = DbPool::open(dir.path()).unwrap();
        assert_eq!(pool.group_count(GroupName::Contacts), 1);
        assert_eq!(pool.group_count(GroupName::MessageShards), 2);
    }

    #[test]
    fn with_group_returns_empty_for_absent_group() {
        let dir = tempfile::tempdir().unwrap();
        let pool = DbPool::open(dir.path()).unwrap();
        let rows: Vec<i64> = pool.with_group(GroupName::Voice, |_| Ok(0)).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn invalidate_group_picks_up_a_new_file_and_leaves_other_groups_alone() {
        let dir = tempfile::tempdir().unwrap();
        Connection::open(dir.path().join("msg_1.db")).unwrap();
        let pool = DbPool::open(dir.path()).unwrap();
        assert_eq!(pool.group_count(GroupName::Contacts), 0);
        assert_eq!(pool.group_count(GroupName::MessageShards), 1);

        Connection::open(dir.path().join("contacts.db")).unwrap();
        pool.invalidate_group(GroupName::Contacts).unwrap();

        assert_eq!(pool.group_count(GroupName::Contacts), 1);
        assert_eq!(pool.group_count(GroupName::MessageShards), 1);
    }

    #[test]
    fn registered_callback_fires_exactly_on_invalidation_of_its_group() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let dir = tempfile::tempdir().unwrap();
        let pool = DbPool::open(dir.path()).unwrap();

        let contacts_fired = Arc::new(AtomicUsize::new(0));
        let contacts_fired_clone = Arc::clone(&contacts_fired);
        pool.on_invalidate(GroupName::Contacts, move || {
            contacts_fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        pool.invalidate_group(GroupName::Voice).unwrap();
        assert_eq!(contacts_fired.load(Ordering::SeqCst), 0);

        pool.invalidate_group(GroupName::Contacts).unwrap();
        assert_eq!(contacts_fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn group_for_filename_matches_known_patterns() {
        let dir = tempfile::tempdir().unwrap();
        let pool = DbPool::open(dir.path()).unwrap();
        assert_eq!(pool.group_for_filename("contacts.db"), Some(GroupName::Contacts));
        assert_eq!(pool.group_for_filename("MSG3.db"), Some(GroupName::MessageShards));
        assert_eq!(pool.group_for_filename("random.txt"), None);
    }
}
