//! Filesystem watcher triggering a pool rescan, using `notify`, the
//! canonical Rust filesystem-watcher crate, playing the same role
//! `walkdir` plays for one-shot traversal. Reacts only to `Create`
//! events: renames/writes to an already-discovered db file don't need a
//! rescan, only a brand-new group member does.

use crate::error::CoreResult;
use crate::pool::DbPool;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub type CancellationToken = Arc<AtomicBool>;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Spawns a background thread that watches `pool.data_dir()` and, for
/// every `Create`d file matching a group pattern, invalidates that
/// group's handle list and runs its registered callbacks, until `cancel`
/// is set.
pub fn spawn(pool: Arc<DbPool>, cancel: CancellationToken) -> CoreResult<JoinHandle<()>> {
    let (tx, rx) = channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res| {
        let _ = tx.send(res);
    })?;
    watcher.watch(pool.data_dir(), RecursiveMode::Recursive)?;

    let handle = std::thread::spawn(move || {
        // Keep the watcher alive for the duration of the loop; it's
        // dropped (and stops watching) when this closure returns.
        let _watcher = watcher;
        loop {
            if cancel.load(Ordering::SeqCst) {
                return;
            }
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(Ok(event)) => {
                    if matches!(event.kind, EventKind::Create(_)) {
                        for path in &event.paths {
                            let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
                                continue;
                            };
                            let Some(group) = pool.group_for_filename(&file_name) else { continue };
                            log::info!("new file {} matches {:?}, invalidating group", file_name, group);
                            if let Err(e) = pool.invalidate_group(group) {
                                log::error!("group invalidation failed: {}", e);
                            }
                        }
                    }
                }
                Ok(Err(e)) => log::warn!("filesystem watch error: {}", e),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    });

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn new_file_triggers_rescan() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(DbPool::open(dir.path()).unwrap());
        assert_eq!(pool.group_count(crate::model::GroupName::Contacts), 0);

        let cancel = Arc::new(AtomicBool::new(false));
        let handle = spawn(Arc::clone(&pool), Arc::clone(&cancel)).unwrap();

        std::thread::sleep(Duration::from_millis(100));
        Connection::open(dir.path().join("contacts.db")).unwrap();

        // give the watcher a generous window since filesystem event
        // latency varies across platforms in CI sandboxes.
        let mut seen = 0;
        for _ in 0..40 {
            std::thread::sleep(Duration::from_millis(100));
            seen = pool.group_count(crate::model::GroupName::Contacts);
            if seen == 1 {
                break;
            }
        }

        cancel.store(true, Ordering::SeqCst);
        handle.join().unwrap();
        assert_eq!(seen, 1);
    }

    #[test]
    fn registered_callback_runs_on_invalidation() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(DbPool::open(dir.path()).unwrap());

        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = Arc::clone(&fired);
        pool.on_invalidate(crate::model::GroupName::Contacts, move || {
            fired_clone.store(true, Ordering::SeqCst);
        });

        let cancel = Arc::new(AtomicBool::new(false));
        let handle = spawn(Arc::clone(&pool), Arc::clone(&cancel)).unwrap();

        std::thread::sleep(Duration::from_millis(100));
        Connection::open(dir.path().join("contacts.db")).unwrap();

        let mut ok = false;
        for _ in 0..40 {
            std::thread::sleep(Duration::from_millis(100));
            if fired.load(Ordering::SeqCst) {
                ok = true;
                break;
            }
        }

        cancel.store(true, Ordering::SeqCst);
        handle.join().unwrap();
        assert!(ok, "callback should have fired on group invalidation");
    }
}
