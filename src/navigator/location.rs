use std::cmp::Ordering;

use crate::buffer::{Buffer, Iter};
use crate::error::Result;
use crate::grapheme::{display_width, ends_line, is_tab, GraphemeBoundary};

/// A grapheme boundary described in every coordinate system at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Location {
    pub byte: usize,
    pub grapheme: usize,
    pub line: usize,
    /// Grapheme clusters since the start of the line.
    pub col: usize,
    /// Display column, with tabs expanded.
    pub tab_col: usize,
}

impl Location {
    /// The location just past `cluster`, which spans `len` bytes from here.
    pub fn advance(&self, cluster: &str, len: usize, tab_width: usize) -> Location {
        let mut next = Location {
            byte: self.byte + len,
            grapheme: self.grapheme + 1,
            ..*self
        };
        if ends_line(cluster) {
            next.line += 1;
            next.col = 0;
            next.tab_col = 0;
        } else {
            next.col += 1;
            next.tab_col = if is_tab(cluster) {
                (self.tab_col / tab_width + 1) * tab_width
            } else {
                self.tab_col + display_width(cluster)
            };
        }
        next
    }
}

/// What `locate` searches for. The result is the greatest location that
/// does not compare past the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Byte(usize),
    Grapheme(usize),
    LineCol { line: usize, col: usize },
    LineTabCol { line: usize, tab_col: usize },
}

impl Target {
    /// Orders `loc` relative to the target.
    pub fn compare(&self, loc: &Location) -> Ordering {
        match *self {
            Target::Byte(byte) => loc.byte.cmp(&byte),
            Target::Grapheme(grapheme) => loc.grapheme.cmp(&grapheme),
            Target::LineCol { line, col } => (loc.line, loc.col).cmp(&(line, col)),
            Target::LineTabCol { line, tab_col } => {
                (loc.line, loc.tab_col).cmp(&(line, tab_col))
            }
        }
    }

    pub(crate) fn admits(&self, loc: &Location) -> bool {
        self.compare(loc) != Ordering::Greater
    }
}

/// Walks grapheme clusters forward from a known boundary.
pub(crate) struct Scanner<'a> {
    iter: Iter,
    boundary: &'a dyn GraphemeBoundary,
    tab_width: usize,
    cluster: String,
}

impl<'a> Scanner<'a> {
    pub(crate) fn new(
        buffer: &Buffer,
        from: usize,
        boundary: &'a dyn GraphemeBoundary,
        tab_width: usize,
    ) -> Result<Self> {
        Ok(Self {
            iter: buffer.iter(from)?,
            boundary,
            tab_width,
            cluster: String::new(),
        })
    }

    /// The location after the next cluster, or `None` at the end.
    pub(crate) fn step(&mut self, at: &Location) -> Option<Location> {
        self.cluster.clear();
        let len = self
            .iter
            .next_grapheme_with(&mut self.cluster, self.boundary)?;
        Some(at.advance(&self.cluster, len, self.tab_width))
    }
}
