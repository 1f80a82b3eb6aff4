//! Owners of contiguous byte ranges.
//!
//! A fragment is heap-owned, owned by a foreign allocator, or memory-mapped.
//! Mapped fragments are registered with the editor so saves and change
//! notifications can find them; they can be moved onto the heap (`load`)
//! and are zero-filled in place when their file changes underneath them.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use memmap2::{Mmap, MmapMut, MmapOptions};
use parking_lot::{MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, error};

use crate::editor::{Editor, FileKey};
use crate::error::{try_alloc, try_copy, Error, IoOp, Result};

/// Bytes allocated and released by someone else's allocator.
pub trait ForeignBytes: AsRef<[u8]> + Send + Sync + 'static {}

impl<T: AsRef<[u8]> + Send + Sync + 'static> ForeignBytes for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Heap,
    Foreign,
    Mapped,
}

enum Storage {
    Heap(Box<[u8]>),
    Foreign(Box<dyn ForeignBytes>),
    Mapped(Mmap),
    /// Corrupted range whose zero fill could not be allocated. Reads as
    /// zeros without any backing memory.
    Zeroed,
}

impl Storage {
    fn bytes(&self) -> &[u8] {
        match self {
            Storage::Heap(data) => data,
            Storage::Foreign(data) => (**data).as_ref(),
            Storage::Mapped(map) => map,
            Storage::Zeroed => &[],
        }
    }
}

struct MappingMeta {
    editor: Editor,
    key: FileKey,
    path: PathBuf,
    /// Cleared once the bytes have been copied onto the heap.
    mapped: AtomicBool,
    /// Never reverts once set.
    corrupt: AtomicBool,
    watched: AtomicBool,
    load_lock: Mutex<()>,
}

pub(crate) struct FragmentInner {
    data: RwLock<Storage>,
    len: usize,
    mapping: Option<MappingMeta>,
}

/// Shared handle to a fragment. Cloning takes a reference.
#[derive(Clone)]
pub struct Fragment(Arc<FragmentInner>);

/// Shared access to a fragment's bytes. A concurrent `load` waits for it.
pub type DataGuard<'a> = MappedRwLockReadGuard<'a, [u8]>;

impl Fragment {
    fn unmapped(storage: Storage) -> Self {
        let len = storage.bytes().len();
        Fragment(Arc::new(FragmentInner {
            data: RwLock::new(storage),
            len,
            mapping: None,
        }))
    }

    pub fn heap(data: Vec<u8>) -> Self {
        Self::unmapped(Storage::Heap(data.into_boxed_slice()))
    }

    pub fn foreign<T: ForeignBytes>(owner: T) -> Self {
        Self::unmapped(Storage::Foreign(Box::new(owner)))
    }

    /// Maps the first `len` bytes of `file` read-only and registers the
    /// mapping with the editor.
    pub(crate) fn map(
        editor: &Editor,
        file: &File,
        path: &Path,
        key: FileKey,
        len: usize,
    ) -> Result<Self> {
        // SAFETY: the mapping is read-only and only reached through the data
        // lock. External writes to the file are reported by the watcher and
        // the range is then replaced with zeros.
        let map = unsafe { MmapOptions::new().len(len).map(file) }
            .map_err(|e| Error::io(IoOp::Map, path, e))?;

        let inner = Arc::new(FragmentInner {
            data: RwLock::new(Storage::Mapped(map)),
            len,
            mapping: Some(MappingMeta {
                editor: editor.clone(),
                key,
                path: path.to_path_buf(),
                mapped: AtomicBool::new(true),
                corrupt: AtomicBool::new(false),
                watched: AtomicBool::new(false),
                load_lock: Mutex::new(()),
            }),
        });
        let watched = editor.register_mapping(key, path, Arc::downgrade(&inner))?;
        if let Some(meta) = &inner.mapping {
            meta.watched.store(watched, Ordering::Release);
        }
        debug!(path = %path.display(), len, watched, "mapped file");
        Ok(Fragment(inner))
    }

    pub fn len(&self) -> usize {
        self.0.len
    }

    pub fn is_empty(&self) -> bool {
        self.0.len == 0
    }

    pub fn owner(&self) -> Owner {
        match &*self.0.data.read() {
            Storage::Heap(_) | Storage::Zeroed => Owner::Heap,
            Storage::Foreign(_) => Owner::Foreign,
            Storage::Mapped(_) => Owner::Mapped,
        }
    }

    pub fn file_key(&self) -> Option<FileKey> {
        self.0.mapping.as_ref().map(|meta| meta.key)
    }

    /// Takes the shared side of the data lock; dropping the guard releases it.
    /// Empty for a corrupted fragment left without backing memory, which
    /// `copy_to` and `write_to` still read as zeros.
    pub fn acquire_data(&self) -> DataGuard<'_> {
        RwLockReadGuard::map(self.0.data.read(), Storage::bytes)
    }

    /// Copies `dest.len()` bytes starting at `start`.
    pub(crate) fn copy_to(&self, start: usize, dest: &mut [u8]) {
        match &*self.0.data.read() {
            Storage::Zeroed => dest.fill(0),
            storage => dest.copy_from_slice(&storage.bytes()[start..start + dest.len()]),
        }
    }

    /// Streams `len` bytes starting at `start` into `sink`.
    pub(crate) fn write_to(&self, start: usize, len: usize, sink: &mut dyn Write) -> io::Result<()> {
        match &*self.0.data.read() {
            Storage::Zeroed => {
                let zeros = [0u8; 4096];
                let mut left = len;
                while left > 0 {
                    let n = left.min(zeros.len());
                    sink.write_all(&zeros[..n])?;
                    left -= n;
                }
                Ok(())
            }
            storage => sink.write_all(&storage.bytes()[start..start + len]),
        }
    }

    pub fn is_healthy_mmap(&self) -> bool {
        self.0.mapping.as_ref().is_some_and(|meta| {
            meta.mapped.load(Ordering::Acquire) && !meta.corrupt.load(Ordering::Acquire)
        })
    }

    pub fn is_corrupt(&self) -> bool {
        self.0
            .mapping
            .as_ref()
            .is_some_and(|meta| meta.corrupt.load(Ordering::Acquire))
    }

    /// Copies a mapped fragment onto the heap and drops the mapping.
    /// Returns whether a transition happened.
    pub fn load(&self) -> Result<bool> {
        let Some(meta) = &self.0.mapping else {
            return Ok(false);
        };
        let _transition = meta.load_lock.lock();
        if !meta.mapped.load(Ordering::Acquire) {
            return Ok(false);
        }

        {
            let mut data = self.0.data.write();
            let copy = match &*data {
                Storage::Zeroed => try_alloc(self.0.len)?,
                storage => try_copy(storage.bytes())?,
            };
            *data = Storage::Heap(copy.into_boxed_slice());
            meta.mapped.store(false, Ordering::Release);
        }
        meta.editor
            .forget_mapping(Arc::as_ptr(&self.0), meta.watched.load(Ordering::Acquire));
        meta.editor.mark_buffers_stale();
        debug!(path = %meta.path.display(), len = self.0.len, "loaded mapping onto heap");
        Ok(true)
    }

    pub(crate) fn ptr_eq(&self, other: &Fragment) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    #[cfg(test)]
    pub(crate) fn corrupt_for_test(&self) -> bool {
        self.0.corrupt()
    }
}

impl FragmentInner {
    /// Replaces the whole mapped range with zeros. Returns true if this call
    /// performed the transition.
    pub(crate) fn corrupt(&self) -> bool {
        let Some(meta) = &self.mapping else {
            return false;
        };
        let mut data = self.data.write();
        if !meta.mapped.load(Ordering::Acquire) {
            return false;
        }
        if meta.corrupt.swap(true, Ordering::AcqRel) {
            return false;
        }
        *data = zero_fill(self.len);
        true
    }
}

/// Zeros for `len` bytes: an anonymous mapping, else a heap block, else no
/// backing at all.
fn zero_fill(len: usize) -> Storage {
    let err = match MmapMut::map_anon(len).and_then(MmapMut::make_read_only) {
        Ok(map) => return Storage::Mapped(map),
        Err(err) => err,
    };
    error!(%err, len, "anonymous mapping failed; zeroing on the heap");
    match try_alloc(len) {
        Ok(data) => Storage::Heap(data.into_boxed_slice()),
        Err(err) => {
            error!(%err, len, "cannot allocate zero fill; reading corrupted range as zeros");
            Storage::Zeroed
        }
    }
}

impl Drop for FragmentInner {
    fn drop(&mut self) {
        let this: *const FragmentInner = self;
        if let Some(meta) = &self.mapping {
            if meta.mapped.load(Ordering::Acquire) {
                meta.editor
                    .forget_mapping(this, meta.watched.load(Ordering::Acquire));
            }
        }
    }
}

impl std::fmt::Debug for Fragment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fragment")
            .field("len", &self.len())
            .field("owner", &self.owner())
            .field("corrupt", &self.is_corrupt())
            .finish()
    }
}
