//! Persistent treap of fragment slices, ordered by in-order byte offset.
//!
//! Nodes are shared between buffer versions through `Arc`. A node reachable
//! from more than one place is frozen: `thaw` hands out a private copy whose
//! children are shared (and therefore frozen) one level down. Subtree length
//! is maintained eagerly on every structural change; the mmap health flags
//! can change behind our back (load, external corruption) and are cached
//! with an optimistic version check.

use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::fragment::Fragment;

pub(crate) type Link = Option<Arc<Node>>;

const HEALTHY_MMAP: u64 = 0b01;
const CORRUPT_MMAP: u64 = 0b10;
const FLAG_BITS: u32 = 2;

/// Cached mmap flags, tagged with the version of the update that wrote them.
struct Stats {
    version: AtomicU64,
    packed: AtomicU64,
}

impl Stats {
    fn new(flags: u64) -> Self {
        Self {
            version: AtomicU64::new(0),
            packed: AtomicU64::new(flags),
        }
    }

    fn flags(&self) -> u64 {
        self.packed.load(Ordering::Acquire) & ((1 << FLAG_BITS) - 1)
    }
}

pub(crate) struct Node {
    fragment: Fragment,
    offset: usize,
    len: usize,
    priority: u32,
    left: Link,
    right: Link,
    total: usize,
    stats: Stats,
}

impl Clone for Node {
    fn clone(&self) -> Self {
        Self {
            fragment: self.fragment.clone(),
            offset: self.offset,
            len: self.len,
            priority: self.priority,
            left: self.left.clone(),
            right: self.right.clone(),
            total: self.total,
            stats: Stats::new(self.stats.flags()),
        }
    }
}

impl Node {
    /// A single-slice node with a fresh random priority.
    pub(crate) fn leaf(fragment: Fragment, offset: usize, len: usize) -> Arc<Node> {
        Arc::new(Self::detached(fragment, offset, len, rand::random()))
    }

    fn detached(fragment: Fragment, offset: usize, len: usize, priority: u32) -> Node {
        debug_assert!(len > 0 && offset + len <= fragment.len());
        let flags = own_flags(&fragment);
        Node {
            fragment,
            offset,
            len,
            priority,
            left: None,
            right: None,
            total: len,
            stats: Stats::new(flags),
        }
    }

    pub(crate) fn total(&self) -> usize {
        self.total
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn left(&self) -> Option<&Arc<Node>> {
        self.left.as_ref()
    }

    pub(crate) fn right(&self) -> Option<&Arc<Node>> {
        self.right.as_ref()
    }

    pub(crate) fn left_len(&self) -> usize {
        total(&self.left)
    }

    /// Copies `dest.len()` bytes of this node's own slice starting at `at`.
    pub(crate) fn copy_slice(&self, at: usize, dest: &mut [u8]) {
        self.fragment.copy_to(self.offset + at, dest);
    }

    pub(crate) fn has_healthy_mmap(&self) -> bool {
        self.stats.flags() & HEALTHY_MMAP != 0
    }

    pub(crate) fn has_corrupt_mmap(&self) -> bool {
        self.stats.flags() & CORRUPT_MMAP != 0
    }

    /// Recomputes the mmap flags from the fragment and the children's cached
    /// flags, or from scratch when `should_recurse` is set. A computation
    /// only commits if no newer one started meanwhile.
    pub(crate) fn update_stats(&self, should_recurse: bool) -> u64 {
        let version = self.stats.version.fetch_add(1, Ordering::AcqRel) + 1;
        let mut flags = own_flags(&self.fragment);
        for child in [&self.left, &self.right].into_iter().flatten() {
            flags |= if should_recurse {
                child.update_stats(true)
            } else {
                child.stats.flags()
            };
        }
        let _ = self
            .stats
            .packed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let committed = current >> FLAG_BITS;
                (committed < version && self.stats.version.load(Ordering::Acquire) == version)
                    .then_some(version << FLAG_BITS | flags)
            });
        flags
    }

    /// Recomputes derived state after the children changed.
    fn refresh(&mut self) {
        self.total = total(&self.left) + self.len + total(&self.right);
        self.update_stats(false);
    }
}

fn own_flags(fragment: &Fragment) -> u64 {
    let mut flags = 0;
    if fragment.is_healthy_mmap() {
        flags |= HEALTHY_MMAP;
    }
    if fragment.is_corrupt() {
        flags |= CORRUPT_MMAP;
    }
    flags
}

pub(crate) fn total(link: &Link) -> usize {
    link.as_ref().map_or(0, |node| node.total)
}

/// Whether the node is shared and must not be mutated in place.
#[cfg(test)]
pub(crate) fn is_frozen(node: &Arc<Node>) -> bool {
    Arc::strong_count(node) > 1
}

/// Returns a mutable node: the node itself when exclusively owned,
/// otherwise a shallow copy whose children become shared.
pub(crate) fn thaw(node: &mut Arc<Node>) -> &mut Node {
    Arc::make_mut(node)
}

/// Splits into `[0, at)` and `[at, len)`.
pub(crate) fn split(link: Link, at: usize) -> (Link, Link) {
    let Some(mut node) = link else {
        return (None, None);
    };
    if at == 0 {
        return (None, Some(node));
    }
    if at >= node.total {
        return (Some(node), None);
    }

    let left_len = node.left_len();
    let own_end = left_len + node.len;
    if at <= left_len {
        let n = thaw(&mut node);
        let (l, r) = split(n.left.take(), at);
        n.left = r;
        n.refresh();
        (l, Some(node))
    } else if at >= own_end {
        let n = thaw(&mut node);
        let (l, r) = split(n.right.take(), at - own_end);
        n.right = l;
        n.refresh();
        (Some(node), r)
    } else {
        // Inside this node's own slice: both halves keep the priority, which
        // still dominates the children they inherit.
        let cut = at - left_len;
        let n = thaw(&mut node);
        let mut tail = Node::detached(
            n.fragment.clone(),
            n.offset + cut,
            n.len - cut,
            n.priority,
        );
        tail.right = n.right.take();
        tail.refresh();
        n.len = cut;
        n.refresh();
        (Some(node), Some(Arc::new(tail)))
    }
}

/// Concatenates two treaps; every byte of `a` precedes every byte of `b`.
pub(crate) fn merge(a: Link, b: Link) -> Link {
    match (a, b) {
        (None, b) => b,
        (a, None) => a,
        (Some(mut a), Some(mut b)) => {
            if a.priority >= b.priority {
                let n = thaw(&mut a);
                n.right = merge(n.right.take(), Some(b));
                n.refresh();
                Some(a)
            } else {
                let n = thaw(&mut b);
                n.left = merge(Some(a), n.left.take());
                n.refresh();
                Some(b)
            }
        }
    }
}

/// Copies bytes starting at `offset` into `dest`; returns the count copied.
pub(crate) fn read(link: &Link, offset: usize, dest: &mut [u8]) -> usize {
    let Some(node) = link else {
        return 0;
    };
    if dest.is_empty() || offset >= node.total {
        return 0;
    }

    let left_len = node.left_len();
    let mut written = 0;
    let mut offset = offset;
    if offset < left_len {
        written = read(&node.left, offset, dest);
        offset = left_len;
        if written == dest.len() {
            return written;
        }
    }

    let at = offset - left_len;
    if at < node.len {
        let count = (node.len - at).min(dest.len() - written);
        node.copy_slice(at, &mut dest[written..written + count]);
        written += count;
        offset += count;
        if written == dest.len() {
            return written;
        }
    }

    written + read(&node.right, offset - left_len - node.len, &mut dest[written..])
}

/// Streams the whole subtree in order; returns the byte count written.
pub(crate) fn save(link: &Link, sink: &mut dyn Write) -> io::Result<u64> {
    let mut written = 0u64;
    let mut stack: Vec<&Arc<Node>> = Vec::new();
    let mut cur = link.as_ref();
    loop {
        while let Some(node) = cur {
            stack.push(node);
            cur = node.left.as_ref();
        }
        let Some(node) = stack.pop() else {
            break;
        };
        node.fragment.write_to(node.offset, node.len, sink)?;
        written += node.len as u64;
        cur = node.right.as_ref();
    }
    Ok(written)
}

/// Distinct fragments reachable from the subtree.
pub(crate) fn fragments(link: &Link) -> Vec<Fragment> {
    let mut found: Vec<Fragment> = Vec::new();
    let mut stack: Vec<&Arc<Node>> = link.iter().collect();
    while let Some(node) = stack.pop() {
        if !found.iter().any(|f| f.ptr_eq(&node.fragment)) {
            found.push(node.fragment.clone());
        }
        stack.extend(node.left.iter());
        stack.extend(node.right.iter());
    }
    found
}

#[cfg(test)]
pub(crate) fn depth(link: &Link) -> usize {
    link.as_ref()
        .map_or(0, |node| 1 + depth(&node.left).max(depth(&node.right)))
}

#[cfg(test)]
pub(crate) fn check_invariants(link: &Link) {
    if let Some(node) = link {
        assert!(node.len > 0);
        assert!(node.offset + node.len <= node.fragment.len());
        assert_eq!(node.total, total(&node.left) + node.len + total(&node.right));
        for child in [&node.left, &node.right].into_iter().flatten() {
            assert!(child.priority <= node.priority);
        }
        check_invariants(&node.left);
        check_invariants(&node.right);
    }
}
