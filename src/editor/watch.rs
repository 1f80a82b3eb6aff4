//! File-change notifications for live mappings.
//!
//! Uses the notify crate; every relevant event is re-checked against the
//! file's current identity so that a file replaced by rename (our own save
//! protocol, or another editor's atomic save) does not count as a
//! modification of the inode we still have mapped.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam::channel::Sender;
use notify::event::{AccessKind, AccessMode, ModifyKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tracing::{trace, warn};

use super::FileKey;

type WatchTable = Arc<Mutex<HashMap<PathBuf, Vec<FileKey>>>>;

/// Watches mapped files and forwards the identity of modified ones.
pub(crate) struct MappingWatcher {
    watcher: RecommendedWatcher,
    watched: WatchTable,
}

impl MappingWatcher {
    pub(crate) fn new(events: Sender<FileKey>) -> notify::Result<Self> {
        let watched: WatchTable = Arc::new(Mutex::new(HashMap::new()));
        let table = Arc::clone(&watched);
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if is_modification(&event.kind) => {
                for key in modified_keys(&table, &event) {
                    trace!(?key, "mapped file modified");
                    if let Err(err) = events.send(key) {
                        trace!(%err, "editor gone; dropping change event");
                    }
                }
            }
            Ok(_) => {}
            Err(err) => warn!(%err, "file watch error"),
        })?;

        Ok(Self { watcher, watched })
    }

    /// Registers `key` as mapped from `path`. A file that replaced an
    /// earlier one at the same path is a new inode, so the path is watched
    /// again for it.
    pub(crate) fn watch(&mut self, path: &Path, key: FileKey) -> notify::Result<()> {
        // The table lock must not be held across notify calls: the event
        // thread takes it from the callback.
        let new_inode = {
            let mut table = self.watched.lock();
            let keys = table.entry(path.to_path_buf()).or_default();
            let known = keys.contains(&key);
            keys.push(key);
            !known
        };
        if new_inode {
            if let Err(err) = self.watcher.watch(path, RecursiveMode::NonRecursive) {
                self.forget(path, key);
                return Err(err);
            }
        }
        Ok(())
    }

    pub(crate) fn unwatch(&mut self, path: &Path, key: FileKey) {
        if self.forget(path, key) {
            if let Err(err) = self.watcher.unwatch(path) {
                warn!(path = %path.display(), %err, "failed to remove file watch");
            }
        }
    }

    /// Removes one registration; returns true when the path has none left.
    fn forget(&self, path: &Path, key: FileKey) -> bool {
        let mut table = self.watched.lock();
        let Some(keys) = table.get_mut(path) else {
            return false;
        };
        if let Some(pos) = keys.iter().position(|k| *k == key) {
            keys.swap_remove(pos);
        }
        if keys.is_empty() {
            table.remove(path);
            return true;
        }
        false
    }
}

fn is_modification(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Any
            | EventKind::Modify(ModifyKind::Any | ModifyKind::Data(_))
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    )
}

fn modified_keys(table: &WatchTable, event: &Event) -> Vec<FileKey> {
    let table = table.lock();
    let mut keys = Vec::new();
    for path in &event.paths {
        let Some(watched) = table.get(path) else {
            continue;
        };
        let Ok(meta) = fs::metadata(path) else {
            continue;
        };
        let current = FileKey::from_metadata(&meta, path);
        keys.extend(watched.iter().copied().filter(|key| *key == current));
    }
    keys.dedup();
    keys
}
