//! Persistent, versioned byte buffers for large files, with an incremental
//! position index.
//!
//! Buffers are treaps of fragment slices shared between versions; files at
//! or above the configured size are memory-mapped rather than copied. A
//! [`Navigator`] maps byte offsets to grapheme, line and column coordinates
//! and is carried across edits by repairing its caches.

pub mod buffer;
pub mod config;
pub mod edit;
pub mod editor;
pub mod error;
pub mod grapheme;
pub mod locator;
pub mod navigator;

pub use buffer::{Buffer, Fragment, Iter, Owner};
pub use config::Config;
pub use edit::{Diff, Edit, EditOperations};
pub use editor::{Editor, FileKey};
pub use error::{Error, InvalidUtf8, IoOp, Result};
pub use grapheme::{CodepointBoundary, GraphemeBoundary, UnicodeBoundary};
pub use locator::{Locator, RemoteProvider};
pub use navigator::{Location, Navigator, Target};
