//! Resolution of "open by locator" requests.
//!
//! A locator is either a filesystem path, which the engine opens, maps and
//! saves itself, or a URI, which is delegated to a [`RemoteProvider`]
//! registered on the editor.

use std::fmt;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use url::Url;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    Path(PathBuf),
    Uri(Url),
}

impl Locator {
    /// Parses user input. `file://` URIs become paths; anything without a
    /// scheme (or with a one-letter scheme, i.e. a drive letter) is a path.
    pub fn parse(input: &str) -> Self {
        match Url::parse(input) {
            Ok(url) if url.scheme() == "file" => match url.to_file_path() {
                Ok(path) => Locator::Path(path),
                Err(()) => Locator::Uri(url),
            },
            Ok(url) if url.scheme().len() > 1 => Locator::Uri(url),
            _ => Locator::Path(PathBuf::from(input)),
        }
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Locator::Path(path) => Some(path),
            Locator::Uri(_) => None,
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Path(path) => write!(f, "{}", path.display()),
            Locator::Uri(url) => write!(f, "{url}"),
        }
    }
}

impl From<PathBuf> for Locator {
    fn from(path: PathBuf) -> Self {
        Locator::Path(path)
    }
}

impl From<&Path> for Locator {
    fn from(path: &Path) -> Self {
        Locator::Path(path.to_path_buf())
    }
}

impl From<Url> for Locator {
    fn from(url: Url) -> Self {
        Locator::Uri(url)
    }
}

/// Streams content for locators the engine cannot reach itself.
pub trait RemoteProvider: Send + Sync {
    fn open_reader(&self, url: &Url) -> Result<Box<dyn Read + Send>>;
    fn open_writer(&self, url: &Url) -> Result<Box<dyn Write + Send>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_path() {
        assert_eq!(
            Locator::parse("notes/todo.txt"),
            Locator::Path(PathBuf::from("notes/todo.txt"))
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_file_uri_becomes_path() {
        assert_eq!(
            Locator::parse("file:///tmp/a.bin"),
            Locator::Path(PathBuf::from("/tmp/a.bin"))
        );
    }

    #[test]
    fn test_remote_uri() {
        let locator = Locator::parse("sftp://host/data.bin");
        assert!(matches!(locator, Locator::Uri(ref url) if url.scheme() == "sftp"));
        assert!(locator.as_path().is_none());
    }

    #[test]
    fn test_drive_letter_is_path() {
        assert!(matches!(Locator::parse("C:\\data.bin"), Locator::Path(_)));
    }
}
