//! Edit hunks relating one buffer version to the next.

use std::ops::Range;

use crate::buffer::Buffer;
use crate::error::{Error, Result};

/// One replaced range: `old_len` bytes at `old_start` in the parent version
/// became `new_len` bytes at `new_start` in the derived one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edit {
    pub old_start: usize,
    pub old_len: usize,
    pub new_start: usize,
    pub new_len: usize,
}

impl Edit {
    pub fn new(old_start: usize, old_len: usize, new_start: usize, new_len: usize) -> Self {
        Self {
            old_start,
            old_len,
            new_start,
            new_len,
        }
    }

    pub fn old_end(&self) -> usize {
        self.old_start + self.old_len
    }

    pub fn new_end(&self) -> usize {
        self.new_start + self.new_len
    }

    pub fn old_range(&self) -> Range<usize> {
        self.old_start..self.old_end()
    }

    pub fn new_range(&self) -> Range<usize> {
        self.new_start..self.new_end()
    }

    /// Byte shift applied to everything after the hunk.
    pub fn delta(&self) -> isize {
        self.new_len as isize - self.old_len as isize
    }

    /// The edit that takes the derived version back to the parent.
    pub fn reverse(&self) -> Self {
        Self {
            old_start: self.new_start,
            old_len: self.new_len,
            new_start: self.old_start,
            new_len: self.old_len,
        }
    }
}

/// Ascending, non-overlapping hunks of a single derivation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    edits: Vec<Edit>,
}

impl Diff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(old_start: usize, old_len: usize, new_len: usize) -> Self {
        let mut diff = Self::new();
        diff.edits.push(Edit::new(old_start, old_len, old_start, new_len));
        diff
    }

    /// Appends a hunk given in parent coordinates. Hunks must arrive in
    /// ascending order; one touching the previous hunk is merged into it.
    pub fn push(&mut self, old_start: usize, old_len: usize, new_len: usize) -> Result<()> {
        if old_len == 0 && new_len == 0 {
            return Ok(());
        }
        let Some(last) = self.edits.last_mut() else {
            self.edits.push(Edit::new(old_start, old_len, old_start, new_len));
            return Ok(());
        };
        if old_start < last.old_end() {
            return Err(Error::UnorderedEdit { offset: old_start });
        }
        if old_start == last.old_end() {
            last.old_len += old_len;
            last.new_len += new_len;
            return Ok(());
        }
        let new_start = last.new_end() + (old_start - last.old_end());
        self.edits.push(Edit::new(old_start, old_len, new_start, new_len));
        Ok(())
    }

    pub fn edits(&self) -> &[Edit] {
        &self.edits
    }

    pub fn len(&self) -> usize {
        self.edits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }
}

impl From<Edit> for Diff {
    fn from(edit: Edit) -> Self {
        Self { edits: vec![edit] }
    }
}

/// Buffer edits that report the hunk they produced.
pub struct EditOperations;

impl EditOperations {
    pub fn insert(buffer: &mut Buffer, offset: usize, bytes: &[u8]) -> Result<Edit> {
        buffer.insert(offset, bytes)?;
        Ok(Edit::new(offset, 0, offset, bytes.len()))
    }

    pub fn delete(buffer: &mut Buffer, start: usize, end: usize) -> Result<Edit> {
        buffer.delete(start, end)?;
        Ok(Edit::new(start, end - start, start, 0))
    }

    /// Replaces `[start, end)` with `bytes`.
    pub fn replace(buffer: &mut Buffer, start: usize, end: usize, bytes: &[u8]) -> Result<Edit> {
        if start > end {
            return Err(Error::NegativeRange { start, end });
        }
        if end > buffer.len() {
            return Err(Error::OutOfBounds {
                offset: end,
                len: buffer.len(),
            });
        }
        buffer.insert(end, bytes)?;
        buffer.delete(start, end)?;
        Ok(Edit::new(start, end - start, start, bytes.len()))
    }

    pub fn copy(
        buffer: &mut Buffer,
        dest_offset: usize,
        src: &Buffer,
        start: usize,
        end: usize,
    ) -> Result<Edit> {
        buffer.copy(dest_offset, src, start, end)?;
        Ok(Edit::new(dest_offset, 0, dest_offset, end - start))
    }
}
