pub mod fragment;
pub mod iter;
mod node;
mod save;

#[cfg(test)]
mod tests;

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::editor::{Editor, FileKey};
use crate::error::{try_alloc, try_copy, Error, IoOp, Result};
use crate::locator::Locator;
use node::{merge, split, Link, Node};

pub use fragment::{DataGuard, ForeignBytes, Fragment, Owner};
pub use iter::Iter;

/// One version of a byte sequence.
///
/// Cloning is O(1) and freezes the shared tree: further edits on either
/// handle copy only the nodes they touch.
pub struct Buffer {
    editor: Editor,
    root: Link,
    /// Set by the editor when cached mmap flags may be out of date.
    stale: Arc<AtomicBool>,
    id: u64,
}

impl Buffer {
    pub fn new(editor: &Editor) -> Self {
        Self::with_root(editor, None, false)
    }

    fn with_root(editor: &Editor, root: Link, stale: bool) -> Self {
        let stale = Arc::new(AtomicBool::new(stale));
        let id = editor.register_buffer(&stale);
        Self {
            editor: editor.clone(),
            root,
            stale,
            id,
        }
    }

    fn single(editor: &Editor, fragment: Fragment) -> Self {
        let len = fragment.len();
        let root = (len > 0).then(|| Node::leaf(fragment, 0, len));
        Self::with_root(editor, root, false)
    }

    pub fn from_bytes(editor: &Editor, bytes: Vec<u8>) -> Self {
        Self::single(editor, Fragment::heap(bytes))
    }

    /// Adopts bytes owned by another allocator without copying them.
    pub fn from_foreign<T: ForeignBytes>(editor: &Editor, owner: T) -> Self {
        Self::single(editor, Fragment::foreign(owner))
    }

    /// Opens a path or URI. Files at or above the configured threshold are
    /// memory-mapped; smaller ones are read onto the heap.
    pub fn open(editor: &Editor, locator: impl Into<Locator>) -> Result<Self> {
        match locator.into() {
            Locator::Path(path) => Self::open_path(editor, &path),
            Locator::Uri(url) => {
                let provider = editor
                    .provider()
                    .ok_or_else(|| Error::UnsupportedLocator(url.to_string()))?;
                let mut reader = provider.open_reader(&url)?;
                let mut data = Vec::new();
                reader
                    .read_to_end(&mut data)
                    .map_err(|e| Error::stream(IoOp::Read, e))?;
                debug!(%url, len = data.len(), "opened remote locator");
                Ok(Self::from_bytes(editor, data))
            }
        }
    }

    fn open_path(editor: &Editor, path: &Path) -> Result<Self> {
        let real = save::resolve(path)?;
        let mut file = File::open(&real).map_err(|e| Error::io(IoOp::Open, &real, e))?;
        let meta = file.metadata().map_err(|e| Error::io(IoOp::Stat, &real, e))?;
        let len = usize::try_from(meta.len()).map_err(|_| Error::OutOfMemory {
            bytes: usize::MAX,
        })?;

        if len == 0 {
            debug!(path = %real.display(), "opened empty file");
            return Ok(Self::new(editor));
        }
        if len < editor.config().mmap_threshold {
            let mut data = try_alloc(len)?;
            file.read_exact(&mut data)
                .map_err(|e| Error::io(IoOp::Read, &real, e))?;
            debug!(path = %real.display(), len, "read file onto heap");
            return Ok(Self::from_bytes(editor, data));
        }

        let key = FileKey::from_metadata(&meta, &real);
        let fragment = Fragment::map(editor, &file, &real, key, len)?;
        Ok(Self::single(editor, fragment))
    }

    /// Writes the content to a path or URI.
    pub fn save(&self, locator: impl Into<Locator>) -> Result<()> {
        match locator.into() {
            Locator::Path(path) => {
                save::to_path(&self.editor, &self.root, &path)?;
            }
            Locator::Uri(url) => {
                let provider = self
                    .editor
                    .provider()
                    .ok_or_else(|| Error::UnsupportedLocator(url.to_string()))?;
                let mut sink = provider.open_writer(&url)?;
                let written = save::to_writer(&self.root, &mut sink)?;
                debug!(%url, bytes = written, "saved to remote locator");
            }
        }
        Ok(())
    }

    pub fn editor(&self) -> &Editor {
        &self.editor
    }

    pub fn len(&self) -> usize {
        node::total(&self.root)
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Copies bytes from `offset` into `dest`; returns how many were copied.
    pub fn read(&self, offset: usize, dest: &mut [u8]) -> Result<usize> {
        self.check_offset(offset)?;
        Ok(node::read(&self.root, offset, dest))
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut data = try_alloc(self.len())?;
        node::read(&self.root, 0, &mut data);
        Ok(data)
    }

    pub fn iter(&self, offset: usize) -> Result<Iter> {
        Iter::new(&self.root, offset)
    }

    pub fn insert(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check_offset(offset)?;
        if bytes.is_empty() {
            return Ok(());
        }
        let leaf = Node::leaf(Fragment::heap(try_copy(bytes)?), 0, bytes.len());
        let (left, right) = split(self.root.take(), offset);
        self.root = merge(merge(left, Some(leaf)), right);
        Ok(())
    }

    pub fn delete(&mut self, start: usize, end: usize) -> Result<()> {
        if start > end {
            return Err(Error::NegativeRange { start, end });
        }
        self.check_offset(end)?;
        if start == end {
            return Ok(());
        }
        let (left, rest) = split(self.root.take(), start);
        let (_, right) = split(rest, end - start);
        self.root = merge(left, right);
        Ok(())
    }

    /// Splices `src[start..end]` in at `dest_offset`, sharing its nodes.
    ///
    /// # Panics
    ///
    /// Panics if `src` belongs to a different editor.
    pub fn copy(&mut self, dest_offset: usize, src: &Buffer, start: usize, end: usize) -> Result<()> {
        assert!(
            self.editor.same_editor(&src.editor),
            "copy between buffers of different editors"
        );
        if start > end {
            return Err(Error::NegativeRange { start, end });
        }
        src.check_offset(end)?;
        self.check_offset(dest_offset)?;
        if start == end {
            return Ok(());
        }

        let (_, rest) = split(src.root.clone(), start);
        let (slice, _) = split(rest, end - start);
        if src.stale.load(Ordering::Acquire) {
            self.stale.store(true, Ordering::Release);
        }
        let (left, right) = split(self.root.take(), dest_offset);
        self.root = merge(merge(left, slice), right);
        Ok(())
    }

    /// Moves every mapped fragment reachable from this version onto the heap.
    pub fn load(&self) -> Result<()> {
        let mut loaded = 0;
        for fragment in node::fragments(&self.root) {
            if fragment.load()? {
                loaded += 1;
            }
        }
        debug!(buffer = self.id, loaded, "loaded mapped fragments");
        Ok(())
    }

    /// Distinct fragments this version references.
    pub fn fragments(&self) -> Vec<Fragment> {
        node::fragments(&self.root)
    }

    pub fn has_healthy_mmap(&self) -> bool {
        self.refresh_stats();
        self.root.as_ref().is_some_and(|root| root.has_healthy_mmap())
    }

    pub fn has_corrupt_mmap(&self) -> bool {
        self.refresh_stats();
        self.root.as_ref().is_some_and(|root| root.has_corrupt_mmap())
    }

    fn refresh_stats(&self) {
        if self.stale.swap(false, Ordering::AcqRel) {
            if let Some(root) = &self.root {
                root.update_stats(true);
            }
        }
    }

    fn check_offset(&self, offset: usize) -> Result<()> {
        let len = self.len();
        if offset > len {
            return Err(Error::OutOfBounds { offset, len });
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn root(&self) -> &Link {
        &self.root
    }
}

impl Clone for Buffer {
    fn clone(&self) -> Self {
        let stale = self.stale.load(Ordering::Acquire);
        Self::with_root(&self.editor, self.root.clone(), stale)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.editor.forget_buffer(self.id);
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
