//! Byte, codepoint and grapheme iteration over a buffer version.
//!
//! The iterator owns its path of ancestor nodes, so it stays valid (and
//! keeps reading the same version) after the buffer it came from is edited
//! or dropped.

use std::char::REPLACEMENT_CHARACTER;
use std::sync::Arc;

use super::node::{Link, Node};
use crate::error::{Error, InvalidUtf8, Result};
use crate::grapheme::{GraphemeBoundary, UnicodeBoundary};

/// Bytes copied out of the current node per refill.
const WINDOW: usize = 4096;

/// Treap height stays far below this for any realistic node count.
const PATH_CAPACITY: usize = 64;

pub struct Iter {
    /// Ancestors of `node`, root first.
    ancestors: Vec<Arc<Node>>,
    /// Node holding the cursor. `None` only for an empty buffer.
    node: Option<Arc<Node>>,
    /// Cursor inside `node`, `0..=node.len()`.
    pos: usize,
    offset: usize,
    len: usize,
    window: Vec<u8>,
    window_start: usize,
}

impl Iter {
    pub(crate) fn new(root: &Link, offset: usize) -> Result<Self> {
        let len = root.as_ref().map_or(0, |node| node.total());
        if offset > len {
            return Err(Error::OutOfBounds { offset, len });
        }

        let mut iter = Self {
            ancestors: Vec::with_capacity(PATH_CAPACITY),
            node: None,
            pos: 0,
            offset,
            len,
            window: Vec::new(),
            window_start: 0,
        };
        let mut cur = root.clone();
        let mut rel = offset;
        while let Some(node) = cur {
            let left_len = node.left_len();
            let own_end = left_len + node.len();
            let next = if rel < left_len {
                node.left().cloned()
            } else if rel < own_end || (rel == own_end && node.right().is_none()) {
                // The end offset sits past the last byte of the last node.
                iter.pos = rel - left_len;
                iter.node = Some(node);
                break;
            } else {
                rel -= own_end;
                node.right().cloned()
            };
            iter.ancestors.push(node);
            cur = next;
        }
        Ok(iter)
    }

    /// Absolute byte offset of the cursor.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn node_len(&self) -> usize {
        self.node.as_ref().map_or(0, |node| node.len())
    }

    /// Moves to the in-order successor, if any.
    fn step_forward(&mut self) -> bool {
        let Some(node) = self.node.take() else {
            return false;
        };
        self.window.clear();
        if let Some(right) = node.right().cloned() {
            self.ancestors.push(node);
            let mut cur = right;
            while let Some(left) = cur.left().cloned() {
                self.ancestors.push(cur);
                cur = left;
            }
            self.node = Some(cur);
            self.pos = 0;
            return true;
        }

        let mut path = Vec::new();
        let mut child = node;
        while let Some(parent) = self.ancestors.pop() {
            if parent.left().is_some_and(|l| Arc::ptr_eq(l, &child)) {
                self.node = Some(parent);
                self.pos = 0;
                return true;
            }
            path.push(child);
            child = parent;
        }
        // No successor: restore the original path.
        path.push(child);
        while let Some(n) = path.pop() {
            self.ancestors.push(n);
        }
        self.node = self.ancestors.pop();
        false
    }

    /// Moves to the in-order predecessor, if any.
    fn step_backward(&mut self) -> bool {
        let Some(node) = self.node.take() else {
            return false;
        };
        self.window.clear();
        if let Some(left) = node.left().cloned() {
            self.ancestors.push(node);
            let mut cur = left;
            while let Some(right) = cur.right().cloned() {
                self.ancestors.push(cur);
                cur = right;
            }
            self.pos = cur.len();
            self.node = Some(cur);
            return true;
        }

        let mut path = Vec::new();
        let mut child = node;
        while let Some(parent) = self.ancestors.pop() {
            if parent.right().is_some_and(|r| Arc::ptr_eq(r, &child)) {
                self.pos = parent.len();
                self.node = Some(parent);
                return true;
            }
            path.push(child);
            child = parent;
        }
        path.push(child);
        while let Some(n) = path.pop() {
            self.ancestors.push(n);
        }
        self.node = self.ancestors.pop();
        false
    }

    fn byte_at(&mut self, pos: usize, backward: bool) -> Option<u8> {
        let cached = pos >= self.window_start && pos < self.window_start + self.window.len();
        if !cached {
            let node = self.node.as_ref()?;
            let start = if backward {
                (pos + 1).saturating_sub(WINDOW)
            } else {
                pos
            };
            let end = (start + WINDOW).min(node.len());
            self.window.resize(end - start, 0);
            node.copy_slice(start, &mut self.window);
            self.window_start = start;
        }
        self.window.get(pos - self.window_start).copied()
    }

    pub fn prev(&mut self) -> Option<u8> {
        if self.offset == 0 {
            return None;
        }
        while self.pos == 0 {
            if !self.step_backward() {
                return None;
            }
        }
        let byte = self.byte_at(self.pos - 1, true)?;
        self.pos -= 1;
        self.offset -= 1;
        Some(byte)
    }

    /// Steps back `n` bytes (at most to the start).
    pub fn rewind(&mut self, n: usize) {
        let mut n = n.min(self.offset);
        self.offset -= n;
        while n > self.pos {
            n -= self.pos;
            if !self.step_backward() {
                break;
            }
        }
        self.pos -= n.min(self.pos);
    }

    /// Decodes one codepoint. On malformed input the maximal invalid prefix
    /// is consumed and reported; the byte that broke the sequence is not.
    pub fn next_codepoint(&mut self) -> std::result::Result<Option<char>, InvalidUtf8> {
        let Some(lead) = self.next() else {
            return Ok(None);
        };
        let (extra, first_lo, first_hi, mask) = match lead {
            0x00..=0x7F => return Ok(Some(char::from(lead))),
            0xC2..=0xDF => (1, 0x80, 0xBF, 0x1F),
            0xE0 => (2, 0xA0, 0xBF, 0x0F),
            0xE1..=0xEC | 0xEE..=0xEF => (2, 0x80, 0xBF, 0x0F),
            0xED => (2, 0x80, 0x9F, 0x0F),
            0xF0 => (3, 0x90, 0xBF, 0x07),
            0xF1..=0xF3 => (3, 0x80, 0xBF, 0x07),
            0xF4 => (3, 0x80, 0x8F, 0x07),
            _ => return Err(InvalidUtf8 { len: 1 }),
        };

        let mut code = u32::from(lead & mask);
        for i in 0..extra {
            let (lo, hi) = if i == 0 { (first_lo, first_hi) } else { (0x80, 0xBF) };
            match self.next() {
                Some(byte) if (lo..=hi).contains(&byte) => {
                    code = (code << 6) | u32::from(byte & 0x3F);
                }
                Some(_) => {
                    self.rewind(1);
                    return Err(InvalidUtf8 { len: i + 1 });
                }
                None => return Err(InvalidUtf8 { len: i + 1 }),
            }
        }
        char::from_u32(code)
            .map(Some)
            .ok_or(InvalidUtf8 { len: extra + 1 })
    }

    /// Appends the next extended grapheme cluster to `dest` and returns the
    /// number of bytes it spans. Invalid UTF-8 becomes a one-cluster U+FFFD.
    pub fn next_grapheme(&mut self, dest: &mut String) -> Option<usize> {
        self.next_grapheme_with(dest, &UnicodeBoundary)
    }

    pub fn next_grapheme_with<B: GraphemeBoundary + ?Sized>(
        &mut self,
        dest: &mut String,
        boundary: &B,
    ) -> Option<usize> {
        let start = self.offset;
        let first = match self.next_codepoint() {
            Ok(None) => return None,
            Ok(Some(c)) => c,
            Err(_) => {
                dest.push(REPLACEMENT_CHARACTER);
                return Some(self.offset - start);
            }
        };

        let mark = dest.len();
        dest.push(first);
        loop {
            let before = self.offset;
            match self.next_codepoint() {
                Ok(Some(c)) if !boundary.is_boundary(&dest[mark..], c) => dest.push(c),
                Ok(None) => break,
                _ => {
                    self.rewind(self.offset - before);
                    break;
                }
            }
        }
        Some(self.offset - start)
    }
}

impl Iterator for Iter {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        if self.offset >= self.len {
            return None;
        }
        while self.pos == self.node_len() {
            if !self.step_forward() {
                return None;
            }
        }
        let byte = self.byte_at(self.pos, false)?;
        self.pos += 1;
        self.offset += 1;
        Some(byte)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.len - self.offset;
        (remaining, Some(remaining))
    }
}
