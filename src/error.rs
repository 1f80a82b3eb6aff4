use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// The filesystem step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Open,
    Read,
    Write,
    Stat,
    Map,
    Rename,
    Create,
    Truncate,
    Resolve,
}

impl fmt::Display for IoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoOp::Open => write!(f, "open"),
            IoOp::Read => write!(f, "read"),
            IoOp::Write => write!(f, "write"),
            IoOp::Stat => write!(f, "stat"),
            IoOp::Map => write!(f, "mmap"),
            IoOp::Rename => write!(f, "rename"),
            IoOp::Create => write!(f, "create"),
            IoOp::Truncate => write!(f, "truncate"),
            IoOp::Resolve => write!(f, "resolve"),
        }
    }
}

/// A UTF-8 decode failure. `len` bytes were consumed by the failed decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid UTF-8 sequence of {len} byte(s)")]
pub struct InvalidUtf8 {
    pub len: usize,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("offset {offset} is out of bounds (length {len})")]
    OutOfBounds { offset: usize, len: usize },

    #[error("range start {start} is after range end {end}")]
    NegativeRange { start: usize, end: usize },

    #[error("refusing to replace {}: it is mapped and has {links} hard links", path.display())]
    MultipleHardLinks { path: PathBuf, links: u64 },

    #[error(transparent)]
    InvalidUtf8(#[from] InvalidUtf8),

    #[error("out of memory allocating {bytes} bytes")]
    OutOfMemory { bytes: usize },

    #[error("{op} failed for {}: {source}", path.display())]
    Io {
        op: IoOp,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("file watch failed: {0}")]
    Watch(#[from] notify::Error),

    #[error("no provider can handle locator {0}")]
    UnsupportedLocator(String),

    #[error("edit at offset {offset} overlaps or precedes the previous edit")]
    UnorderedEdit { offset: usize },
}

impl Error {
    pub(crate) fn io(op: IoOp, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// Wraps an I/O error that is not tied to a particular path (streams).
    pub(crate) fn stream(op: IoOp, source: io::Error) -> Self {
        Error::Io {
            op,
            path: PathBuf::new(),
            source,
        }
    }
}

/// Allocates a zeroed vector, surfacing allocation failure as an error.
pub(crate) fn try_alloc(len: usize) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    data.try_reserve_exact(len)
        .map_err(|_| Error::OutOfMemory { bytes: len })?;
    data.resize(len, 0);
    Ok(data)
}

/// Copies `bytes` into a fresh heap allocation.
pub(crate) fn try_copy(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    data.try_reserve_exact(bytes.len())
        .map_err(|_| Error::OutOfMemory { bytes: bytes.len() })?;
    data.extend_from_slice(bytes);
    Ok(data)
}
