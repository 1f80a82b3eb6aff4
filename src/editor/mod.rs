//! Process-wide registry of live mappings and buffers.
//!
//! An [`Editor`] is the explicit context every buffer and mapped fragment is
//! created against. It lets a save detect that its destination is currently
//! mapped, and fans external-modification notifications out to every buffer.

pub(crate) mod watch;

use std::fs::{self, File, Metadata};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::buffer::fragment::FragmentInner;
use crate::config::Config;
use crate::error::Result;
use crate::locator::RemoteProvider;
use watch::MappingWatcher;

/// Identity of a file independent of the path or descriptor used to reach it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileKey {
    pub dev: u64,
    pub ino: u64,
}

impl FileKey {
    #[cfg(unix)]
    pub fn from_metadata(meta: &Metadata, _path: &Path) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
        }
    }

    #[cfg(not(unix))]
    pub fn from_metadata(_meta: &Metadata, path: &Path) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        path.hash(&mut hasher);
        Self {
            dev: 0,
            ino: hasher.finish(),
        }
    }
}

struct MappingEntry {
    key: FileKey,
    path: PathBuf,
    fragment: Weak<FragmentInner>,
}

struct BufferEntry {
    id: u64,
    stale: Weak<AtomicBool>,
}

/// A file renamed aside during a save; unlinked when the editor goes away.
struct DeferredUnlink {
    path: PathBuf,
    _file: File,
}

#[derive(Default)]
struct Registry {
    mappings: Vec<MappingEntry>,
    buffers: Vec<BufferEntry>,
    deferred: Vec<DeferredUnlink>,
    watcher: Option<MappingWatcher>,
    next_buffer_id: u64,
}

struct EditorInner {
    config: Config,
    provider: Option<Arc<dyn RemoteProvider>>,
    registry: Mutex<Registry>,
    events_tx: Sender<FileKey>,
    events_rx: Receiver<FileKey>,
    corrupted: AtomicBool,
}

#[derive(Clone)]
pub struct Editor {
    inner: Arc<EditorInner>,
}

impl Editor {
    pub fn new(config: Config) -> Self {
        Self::build(config, None)
    }

    pub fn with_provider(config: Config, provider: Arc<dyn RemoteProvider>) -> Self {
        Self::build(config, Some(provider))
    }

    fn build(config: Config, provider: Option<Arc<dyn RemoteProvider>>) -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            inner: Arc::new(EditorInner {
                config: config.normalized(),
                provider,
                registry: Mutex::new(Registry::default()),
                events_tx,
                events_rx,
                corrupted: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub(crate) fn provider(&self) -> Option<&Arc<dyn RemoteProvider>> {
        self.inner.provider.as_ref()
    }

    pub fn same_editor(&self, other: &Editor) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Sender for external-modification notifications. The built-in watcher
    /// feeds it; other change sources may too.
    pub fn change_sender(&self) -> Sender<FileKey> {
        self.inner.events_tx.clone()
    }

    /// Queues an external-modification notification for `key`.
    pub fn notify_modified(&self, key: FileKey) {
        let _ = self.inner.events_tx.send(key);
    }

    /// Drains pending notifications, zero-filling every affected mapping.
    /// Returns whether any mapping was corrupted since the previous call.
    pub fn validate_mappings(&self) -> bool {
        let mut corrupted_any = false;
        for key in self.inner.events_rx.try_iter() {
            let victims: Vec<Arc<FragmentInner>> = {
                let registry = self.inner.registry.lock();
                registry
                    .mappings
                    .iter()
                    .filter(|entry| entry.key == key)
                    .filter_map(|entry| entry.fragment.upgrade())
                    .collect()
            };
            for fragment in &victims {
                if fragment.corrupt() {
                    warn!(?key, "mapped file modified externally; mapping zero-filled");
                    corrupted_any = true;
                }
            }
        }
        if corrupted_any {
            self.mark_buffers_stale();
            self.inner.corrupted.store(true, Ordering::Release);
        }
        self.inner.corrupted.swap(false, Ordering::AcqRel)
    }

    /// Whether a live mapping of the file identified by `key` exists.
    pub fn is_mapped(&self, key: FileKey) -> bool {
        let registry = self.inner.registry.lock();
        registry
            .mappings
            .iter()
            .any(|entry| entry.key == key && entry.fragment.strong_count() > 0)
    }

    pub fn live_mappings(&self) -> usize {
        let registry = self.inner.registry.lock();
        registry
            .mappings
            .iter()
            .filter(|entry| entry.fragment.strong_count() > 0)
            .count()
    }

    pub fn live_buffers(&self) -> usize {
        self.inner.registry.lock().buffers.len()
    }

    pub fn deferred_unlinks(&self) -> Vec<PathBuf> {
        let registry = self.inner.registry.lock();
        registry.deferred.iter().map(|d| d.path.clone()).collect()
    }

    pub(crate) fn register_mapping(
        &self,
        key: FileKey,
        path: &Path,
        fragment: Weak<FragmentInner>,
    ) -> Result<bool> {
        let mut registry = self.inner.registry.lock();
        let mut watched = false;
        if self.inner.config.watch_mappings {
            if registry.watcher.is_none() {
                registry.watcher = Some(MappingWatcher::new(self.change_sender())?);
            }
            if let Some(watcher) = registry.watcher.as_mut() {
                watcher.watch(path, key)?;
                watched = true;
            }
        }
        registry.mappings.push(MappingEntry {
            key,
            path: path.to_path_buf(),
            fragment,
        });
        Ok(watched)
    }

    /// Drops the registration of a mapping that was loaded or destroyed.
    pub(crate) fn forget_mapping(&self, fragment: *const FragmentInner, watched: bool) {
        let mut registry = self.inner.registry.lock();
        let Some(pos) = registry
            .mappings
            .iter()
            .position(|entry| std::ptr::eq(entry.fragment.as_ptr(), fragment))
        else {
            return;
        };
        let entry = registry.mappings.swap_remove(pos);
        if watched {
            if let Some(watcher) = registry.watcher.as_mut() {
                watcher.unwatch(&entry.path, entry.key);
            }
        }
    }

    pub(crate) fn register_buffer(&self, stale: &Arc<AtomicBool>) -> u64 {
        let mut registry = self.inner.registry.lock();
        let id = registry.next_buffer_id;
        registry.next_buffer_id += 1;
        registry.buffers.push(BufferEntry {
            id,
            stale: Arc::downgrade(stale),
        });
        id
    }

    pub(crate) fn forget_buffer(&self, id: u64) {
        let mut registry = self.inner.registry.lock();
        registry.buffers.retain(|entry| entry.id != id);
    }

    pub(crate) fn defer_unlink(&self, path: PathBuf, file: File) {
        debug!(path = %path.display(), "deferring unlink until shutdown");
        self.inner
            .registry
            .lock()
            .deferred
            .push(DeferredUnlink { path, _file: file });
    }

    /// Flags every buffer to recompute its cached mmap flags on next query.
    pub(crate) fn mark_buffers_stale(&self) {
        let registry = self.inner.registry.lock();
        for entry in &registry.buffers {
            if let Some(stale) = entry.stale.upgrade() {
                stale.store(true, Ordering::Release);
            }
        }
    }
}

impl Default for Editor {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl std::fmt::Debug for Editor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Editor")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Drop for EditorInner {
    fn drop(&mut self) {
        // Every buffer holds an editor handle, so all of them are gone by now.
        let registry = self.registry.get_mut();
        for deferred in registry.deferred.drain(..) {
            if let Err(err) = fs::remove_file(&deferred.path) {
                warn!(path = %deferred.path.display(), %err, "failed to remove renamed file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_validate_without_events_is_false() {
        let editor = Editor::default();
        assert!(!editor.validate_mappings());
    }

    #[test]
    fn test_unknown_key_is_ignored() {
        let editor = Editor::default();
        editor.notify_modified(FileKey { dev: 1, ino: 2 });
        assert!(!editor.validate_mappings());
    }

    #[test]
    fn test_deferred_unlink_runs_on_teardown() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".renamed.tmp");
        fs::write(&path, "old").unwrap();
        let file = File::open(&path).unwrap();

        let editor = Editor::default();
        editor.defer_unlink(path.clone(), file);
        assert_eq!(editor.deferred_unlinks(), vec![path.clone()]);
        assert!(path.exists());

        drop(editor);
        assert!(!path.exists());
    }

    #[test]
    fn test_buffer_registration() {
        let editor = Editor::default();
        let stale = Arc::new(AtomicBool::new(false));
        let id = editor.register_buffer(&stale);
        assert_eq!(editor.live_buffers(), 1);
        editor.mark_buffers_stale();
        assert!(stale.load(Ordering::Acquire));
        editor.forget_buffer(id);
        assert_eq!(editor.live_buffers(), 0);
    }
}
