//! Incremental repair of location caches after an edit.
//!
//! Cached records strictly before an edit stay valid. Records inside it are
//! dropped, records after it are moved by the byte delta and then corrected
//! by rescanning from the last valid boundary up to the first old record the
//! new grapheme walk lands on exactly: from there on the two walks coincide
//! and the remaining records only need constant offsets.

use tracing::trace;

use super::cache::{LocationCache, Shift};
use super::location::{Location, Scanner};
use crate::buffer::Buffer;
use crate::edit::Diff;
use crate::error::Result;
use crate::grapheme::GraphemeBoundary;

/// Decoding a codepoint reads at most this many bytes past its start, so a
/// boundary closer than this to an edit may have been decided by edited bytes.
const LOOKAHEAD: usize = 4;

pub(crate) struct Repair<'a> {
    pub buffer: &'a Buffer,
    pub boundary: &'a dyn GraphemeBoundary,
    pub tab_width: usize,
}

impl Repair<'_> {
    /// Brings `caches`, valid for the parent version, in line with the
    /// version `diff` produced.
    pub(crate) fn apply(&self, caches: &mut [&mut LocationCache], diff: &Diff) -> Result<()> {
        let mut removed = 0;
        let mut scanned = 0;

        // Old coordinates, back to front so earlier hunks stay put.
        for edit in diff.edits().iter().rev() {
            let start = edit.old_start.saturating_sub(LOOKAHEAD - 1);
            for cache in caches.iter_mut() {
                removed += cache.remove_range(start, edit.old_end() + 1);
                if edit.delta() != 0 {
                    cache.shift_from(edit.old_end() + 1, Shift::bytes(edit.delta()));
                }
            }
        }

        // New coordinates, front to back; a scan never crosses into the next
        // hunk and hands its position over instead.
        let len = self.buffer.len();
        let edits = diff.edits();
        let mut carried: Option<Location> = None;
        for (i, edit) in edits.iter().enumerate() {
            let new_start = edit.new_start.min(len);
            let new_end = edit.new_end().min(len);
            let bound = edits.get(i + 1).map_or(usize::MAX, |next| next.new_start);

            let mut at = anchor(caches, new_start, carried.take());
            let mut scanner = Scanner::new(self.buffer, at.byte, self.boundary, self.tab_width)?;
            let from = at.byte;
            let mut done = false;
            loop {
                if !has_record_from(caches, at.byte) {
                    done = true;
                    break;
                }
                if at.byte >= new_end {
                    if let Some(stale) = record_at(caches, at.byte) {
                        for cache in caches.iter_mut() {
                            cache.realign(&stale, &at, self.tab_width);
                        }
                        break;
                    }
                }
                if at.byte >= bound {
                    carried = Some(at);
                    break;
                }
                let Some(next) = scanner.step(&at) else {
                    done = true;
                    break;
                };
                for cache in caches.iter_mut() {
                    removed += cache.remove_range(at.byte + 1, next.byte);
                }
                at = next;
            }
            scanned += at.byte - from;
            if done {
                break;
            }
        }

        trace!(hunks = edits.len(), removed, scanned, "repaired location caches");
        Ok(())
    }
}

/// The best known-valid starting point at or before `byte`.
fn anchor(caches: &[&mut LocationCache], byte: usize, carried: Option<Location>) -> Location {
    caches
        .iter()
        .filter_map(|cache| cache.floor(|l| l.byte <= byte))
        .chain(carried)
        .max_by_key(|loc| loc.byte)
        .unwrap_or_default()
}

/// Whether any cache still holds a record at or after `byte`. Without one
/// nothing further needs repair.
fn has_record_from(caches: &[&mut LocationCache], byte: usize) -> bool {
    caches.iter().any(|cache| cache.ceil_byte(byte).is_some())
}

fn record_at(caches: &[&mut LocationCache], byte: usize) -> Option<Location> {
    caches
        .iter()
        .filter_map(|cache| cache.ceil_byte(byte))
        .find(|loc| loc.byte == byte)
}
