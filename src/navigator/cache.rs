//! Persistent treap of cached locations, ordered by byte offset.
//!
//! Bulk coordinate changes are recorded as a pending [`Shift`] on a subtree
//! root and pushed to the children the next time that node is thawed. An
//! entry's stored location already includes its own pending shift but not
//! the pending shifts of its ancestors.

use std::ops::AddAssign;
use std::sync::Arc;

use super::location::Location;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Shift {
    pub byte: isize,
    pub grapheme: isize,
    pub line: isize,
    pub col: isize,
    pub tab_col: isize,
}

impl Shift {
    pub(crate) fn bytes(byte: isize) -> Self {
        Self {
            byte,
            ..Self::default()
        }
    }

    /// The shift that moves `from` onto `to`.
    pub(crate) fn between(from: &Location, to: &Location) -> Self {
        fn diff(to: usize, from: usize) -> isize {
            to as isize - from as isize
        }
        Self {
            byte: diff(to.byte, from.byte),
            grapheme: diff(to.grapheme, from.grapheme),
            line: diff(to.line, from.line),
            col: diff(to.col, from.col),
            tab_col: diff(to.tab_col, from.tab_col),
        }
    }

    /// Only the document-wide components.
    pub(crate) fn counts_only(self) -> Self {
        Self {
            grapheme: self.grapheme,
            line: self.line,
            ..Self::default()
        }
    }

    fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    fn apply(&self, loc: Location) -> Location {
        Location {
            byte: loc.byte.wrapping_add_signed(self.byte),
            grapheme: loc.grapheme.wrapping_add_signed(self.grapheme),
            line: loc.line.wrapping_add_signed(self.line),
            col: loc.col.wrapping_add_signed(self.col),
            tab_col: loc.tab_col.wrapping_add_signed(self.tab_col),
        }
    }
}

impl AddAssign for Shift {
    fn add_assign(&mut self, rhs: Self) {
        self.byte += rhs.byte;
        self.grapheme += rhs.grapheme;
        self.line += rhs.line;
        self.col += rhs.col;
        self.tab_col += rhs.tab_col;
    }
}

type Link = Option<Arc<Entry>>;

#[derive(Clone)]
struct Entry {
    loc: Location,
    pending: Shift,
    priority: u32,
    size: usize,
    left: Link,
    right: Link,
}

impl Entry {
    fn leaf(loc: Location) -> Arc<Entry> {
        Arc::new(Entry {
            loc,
            pending: Shift::default(),
            priority: rand::random(),
            size: 1,
            left: None,
            right: None,
        })
    }

    fn refresh(&mut self) {
        self.size = 1 + size(&self.left) + size(&self.right);
    }
}

fn size(link: &Link) -> usize {
    link.as_ref().map_or(0, |entry| entry.size)
}

/// Private copy of `node` with its pending shift pushed into the children.
fn thaw(node: &mut Arc<Entry>) -> &mut Entry {
    let entry = Arc::make_mut(node);
    if !entry.pending.is_zero() {
        let shift = std::mem::take(&mut entry.pending);
        for child in [&mut entry.left, &mut entry.right].into_iter().flatten() {
            let child = Arc::make_mut(child);
            child.loc = shift.apply(child.loc);
            child.pending += shift;
        }
    }
    entry
}

fn shifted(link: Link, shift: Shift) -> Link {
    let mut node = link?;
    if !shift.is_zero() {
        let entry = Arc::make_mut(&mut node);
        entry.loc = shift.apply(entry.loc);
        entry.pending += shift;
    }
    Some(node)
}

/// Splits into the prefix whose entries satisfy `goes_left` and the rest.
/// `goes_left` must be monotone along the order.
fn split_by<F: Fn(&Location) -> bool>(link: Link, goes_left: &F) -> (Link, Link) {
    let Some(mut node) = link else {
        return (None, None);
    };
    let entry = thaw(&mut node);
    if goes_left(&entry.loc) {
        let (l, r) = split_by(entry.right.take(), goes_left);
        entry.right = l;
        entry.refresh();
        (Some(node), r)
    } else {
        let (l, r) = split_by(entry.left.take(), goes_left);
        entry.left = r;
        entry.refresh();
        (l, Some(node))
    }
}

/// Splits off the first `k` entries.
fn split_rank(link: Link, k: usize) -> (Link, Link) {
    let Some(mut node) = link else {
        return (None, None);
    };
    let entry = thaw(&mut node);
    let left_size = size(&entry.left);
    if k <= left_size {
        let (l, r) = split_rank(entry.left.take(), k);
        entry.left = r;
        entry.refresh();
        (l, Some(node))
    } else {
        let (l, r) = split_rank(entry.right.take(), k - left_size - 1);
        entry.right = l;
        entry.refresh();
        (Some(node), r)
    }
}

fn merge(a: Link, b: Link) -> Link {
    match (a, b) {
        (None, b) => b,
        (a, None) => a,
        (Some(mut a), Some(mut b)) => {
            if a.priority >= b.priority {
                let entry = thaw(&mut a);
                entry.right = merge(entry.right.take(), Some(b));
                entry.refresh();
                Some(a)
            } else {
                let entry = thaw(&mut b);
                entry.left = merge(Some(a), entry.left.take());
                entry.refresh();
                Some(b)
            }
        }
    }
}

#[derive(Clone, Default)]
pub(crate) struct LocationCache {
    root: Link,
}

impl LocationCache {
    pub(crate) fn len(&self) -> usize {
        size(&self.root)
    }

    /// Greatest entry satisfying the monotone predicate `pred`.
    pub(crate) fn floor<F: Fn(&Location) -> bool>(&self, pred: F) -> Option<Location> {
        let mut best = None;
        let mut acc = Shift::default();
        let mut cur = self.root.as_ref();
        while let Some(entry) = cur {
            let loc = acc.apply(entry.loc);
            acc += entry.pending;
            if pred(&loc) {
                best = Some(loc);
                cur = entry.right.as_ref();
            } else {
                cur = entry.left.as_ref();
            }
        }
        best
    }

    /// Smallest entry at or after `byte`.
    pub(crate) fn ceil_byte(&self, byte: usize) -> Option<Location> {
        let mut best = None;
        let mut acc = Shift::default();
        let mut cur = self.root.as_ref();
        while let Some(entry) = cur {
            let loc = acc.apply(entry.loc);
            acc += entry.pending;
            if loc.byte >= byte {
                best = Some(loc);
                cur = entry.left.as_ref();
            } else {
                cur = entry.right.as_ref();
            }
        }
        best
    }

    /// Adds `loc`, replacing any entry at the same byte.
    pub(crate) fn insert(&mut self, loc: Location) {
        let (before, rest) = split_by(self.root.take(), &|l: &Location| l.byte < loc.byte);
        let (_, after) = split_by(rest, &|l: &Location| l.byte <= loc.byte);
        self.root = merge(merge(before, Some(Entry::leaf(loc))), after);
    }

    /// Drops entries with `start <= byte < end`; returns how many.
    pub(crate) fn remove_range(&mut self, start: usize, end: usize) -> usize {
        if start >= end {
            return 0;
        }
        let (before, rest) = split_by(self.root.take(), &|l: &Location| l.byte < start);
        let (removed, after) = split_by(rest, &|l: &Location| l.byte < end);
        self.root = merge(before, after);
        size(&removed)
    }

    pub(crate) fn remove_nth(&mut self, index: usize) {
        let (before, rest) = split_rank(self.root.take(), index);
        let (_, after) = split_rank(rest, 1);
        self.root = merge(before, after);
    }

    /// Applies `shift` to every entry at or after `byte`.
    pub(crate) fn shift_from(&mut self, byte: usize, shift: Shift) {
        let (before, after) = split_by(self.root.take(), &|l: &Location| l.byte < byte);
        self.root = merge(before, shifted(after, shift));
    }

    /// Corrects entries from `found.byte` on, given that `stale` is what the
    /// cache believes about the boundary whose true location is `found`.
    /// Entries on the same line also get the column corrections; when the
    /// display-column change is not a whole number of tab stops, tabs later
    /// on that line move unevenly and those entries are dropped instead.
    pub(crate) fn realign(&mut self, stale: &Location, found: &Location, tab_width: usize) {
        let delta = Shift::between(stale, found);
        let (before, rest) = split_by(self.root.take(), &|l: &Location| l.byte < found.byte);
        let (mut same_line, later) = split_by(rest, &|l: &Location| l.line <= stale.line);
        if delta.tab_col.rem_euclid(tab_width as isize) != 0 {
            same_line = split_by(same_line, &|l: &Location| l.byte <= found.byte).0;
        }
        let same_line = shifted(same_line, Shift { byte: 0, ..delta });
        let later = shifted(later, delta.counts_only());
        self.root = merge(merge(before, same_line), later);
    }

    /// Every entry in byte order.
    pub(crate) fn to_vec(&self) -> Vec<Location> {
        fn walk(link: &Link, acc: Shift, out: &mut Vec<Location>) {
            if let Some(entry) = link {
                let mut inner = acc;
                inner += entry.pending;
                walk(&entry.left, inner, out);
                out.push(acc.apply(entry.loc));
                walk(&entry.right, inner, out);
            }
        }
        let mut out = Vec::with_capacity(self.len());
        walk(&self.root, Shift::default(), &mut out);
        out
    }
}
