//! Position index over a buffer version.
//!
//! Translates between byte offsets, grapheme counts and line/column
//! coordinates by scanning forward from the nearest cached location. Two
//! caches are kept: a small local one holding recent answers and a global
//! one holding one location per fixed byte stride. Deriving a navigator for
//! an edited version repairs both caches instead of discarding them.

mod cache;
mod location;
mod repair;

use std::sync::Arc;

use rand::Rng;

use crate::buffer::Buffer;
use crate::edit::Diff;
use crate::error::{Error, Result};
use crate::grapheme::{GraphemeBoundary, UnicodeBoundary};
use cache::LocationCache;
use location::Scanner;
use repair::Repair;

pub use location::{Location, Target};

#[derive(Clone)]
pub struct Navigator {
    buffer: Buffer,
    boundary: Arc<dyn GraphemeBoundary>,
    tab_width: usize,
    local_limit: usize,
    stride: usize,
    local: LocationCache,
    global: LocationCache,
}

impl Navigator {
    pub fn new(buffer: &Buffer) -> Self {
        Self::with_boundary(buffer, Arc::new(UnicodeBoundary))
    }

    pub fn with_boundary(buffer: &Buffer, boundary: Arc<dyn GraphemeBoundary>) -> Self {
        let config = buffer.editor().config();
        Self {
            buffer: buffer.clone(),
            boundary,
            tab_width: config.tab_width,
            local_limit: config.local_cache_limit,
            stride: config.global_stride,
            local: LocationCache::default(),
            global: LocationCache::default(),
        }
    }

    /// A navigator for `buffer`, which `diff` derived from the version
    /// `parent` indexes. Reuses the parent's caches after repairing them.
    pub fn derive_from(parent: &Navigator, buffer: &Buffer, diff: &Diff) -> Result<Self> {
        let mut nav = Self {
            buffer: buffer.clone(),
            boundary: Arc::clone(&parent.boundary),
            tab_width: parent.tab_width,
            local_limit: parent.local_limit,
            stride: parent.stride,
            local: parent.local.clone(),
            global: parent.global.clone(),
        };
        let repair = Repair {
            buffer: &nav.buffer,
            boundary: &*nav.boundary,
            tab_width: nav.tab_width,
        };
        repair.apply(&mut [&mut nav.local, &mut nav.global], diff)?;
        Ok(nav)
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// The greatest grapheme boundary that does not compare past `target`.
    /// `resume` is a location of this version known to the caller; the scan
    /// starts there when it is closer than anything cached.
    pub fn locate(&mut self, target: Target, resume: Option<Location>) -> Result<Location> {
        if let Some(resume) = resume {
            if resume.byte > self.buffer.len() {
                return Err(Error::OutOfBounds {
                    offset: resume.byte,
                    len: self.buffer.len(),
                });
            }
        }

        let start = [
            self.local.floor(|l| target.admits(l)),
            self.global.floor(|l| target.admits(l)),
            resume.filter(|l| target.admits(l)),
        ]
        .into_iter()
        .flatten()
        .max_by_key(|l| l.byte)
        .unwrap_or_default();

        let stride = self.stride;
        let mut scanner = Scanner::new(&self.buffer, start.byte, &*self.boundary, self.tab_width)?;
        let mut at = start;
        let mut bucket = at.byte / stride;
        while let Some(next) = scanner.step(&at) {
            if !target.admits(&next) {
                break;
            }
            at = next;
            if at.byte / stride > bucket {
                bucket = at.byte / stride;
                let sampled = self
                    .global
                    .floor(|l| l.byte <= at.byte)
                    .is_some_and(|l| l.byte / stride == bucket);
                if !sampled {
                    self.global.insert(at);
                }
            }
        }
        drop(scanner);

        self.remember(at);
        Ok(at)
    }

    fn remember(&mut self, loc: Location) {
        self.local.insert(loc);
        let len = self.local.len();
        if len > self.local_limit {
            let victim = rand::thread_rng().gen_range(0..len);
            self.local.remove_nth(victim);
        }
    }

    pub fn locate_byte(&mut self, byte: usize, resume: Option<Location>) -> Result<Location> {
        self.locate(Target::Byte(byte), resume)
    }

    pub fn locate_grapheme(&mut self, grapheme: usize, resume: Option<Location>) -> Result<Location> {
        self.locate(Target::Grapheme(grapheme), resume)
    }

    pub fn locate_line_col(
        &mut self,
        line: usize,
        col: usize,
        resume: Option<Location>,
    ) -> Result<Location> {
        self.locate(Target::LineCol { line, col }, resume)
    }

    pub fn locate_line_tab_col(
        &mut self,
        line: usize,
        tab_col: usize,
        resume: Option<Location>,
    ) -> Result<Location> {
        self.locate(Target::LineTabCol { line, tab_col }, resume)
    }

    /// Every cached location, local and global, in byte order.
    pub fn cached_locations(&self) -> Vec<Location> {
        let mut all = self.local.to_vec();
        all.extend(self.global.to_vec());
        all.sort_by_key(|l| l.byte);
        all.dedup();
        all
    }

    pub fn cache_sizes(&self) -> (usize, usize) {
        (self.local.len(), self.global.len())
    }
}

impl std::fmt::Debug for Navigator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Navigator")
            .field("len", &self.buffer.len())
            .field("tab_width", &self.tab_width)
            .field("local", &self.local.len())
            .field("global", &self.global.len())
            .finish()
    }
}
