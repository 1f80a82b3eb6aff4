//! Integrity-preserving save.
//!
//! Writing over a file that a live fragment still maps would change what
//! every buffer reading that mapping sees. When the destination is mapped we
//! rename it aside (keeping the old inode alive until the editor goes away)
//! and write into a freshly created file instead.

use std::fs::{self, File, Metadata, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::node::{self, Link};
use crate::editor::{Editor, FileKey};
use crate::error::{Error, IoOp, Result};

/// Canonical form of `path`. A destination that does not exist yet resolves
/// through its parent directory.
pub(crate) fn resolve(path: &Path) -> Result<PathBuf> {
    match fs::canonicalize(path) {
        Ok(real) => Ok(real),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let name = path
                .file_name()
                .ok_or_else(|| Error::io(IoOp::Resolve, path, err))?;
            let parent = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => Path::new("."),
            };
            let parent =
                fs::canonicalize(parent).map_err(|e| Error::io(IoOp::Resolve, path, e))?;
            Ok(parent.join(name))
        }
        Err(err) => Err(Error::io(IoOp::Resolve, path, err)),
    }
}

#[cfg(unix)]
fn hard_links(meta: &Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.nlink()
}

#[cfg(not(unix))]
fn hard_links(_meta: &Metadata) -> u64 {
    1
}

fn aside_name(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{:08x}.strata", rand::random::<u32>()))
}

#[cfg(unix)]
fn create_like(path: &Path, meta: &Metadata) -> std::io::Result<File> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(meta.permissions().mode())
        .open(path)?;
    // The umask may have dropped bits from the requested mode.
    file.set_permissions(meta.permissions())?;
    Ok(file)
}

#[cfg(not(unix))]
fn create_like(path: &Path, meta: &Metadata) -> std::io::Result<File> {
    let file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.set_permissions(meta.permissions())?;
    Ok(file)
}

/// Writes the tree to `path`. Returns the number of bytes written.
pub(crate) fn to_path(editor: &Editor, root: &Link, path: &Path) -> Result<u64> {
    let real = resolve(path)?;
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&real)
        .map_err(|e| Error::io(IoOp::Open, &real, e))?;
    let meta = file.metadata().map_err(|e| Error::io(IoOp::Stat, &real, e))?;
    let key = FileKey::from_metadata(&meta, &real);

    if editor.is_mapped(key) {
        let links = hard_links(&meta);
        if links > 1 {
            return Err(Error::MultipleHardLinks { path: real, links });
        }
        return replace(editor, &real, &meta, file, |fresh| write_into(fresh, root, &real));
    }

    let written = write_into(&file, root, &real)?;
    debug!(path = %real.display(), bytes = written, "saved");
    Ok(written)
}

fn write_into(file: &File, root: &Link, real: &Path) -> Result<u64> {
    let written = {
        let mut writer = BufWriter::new(file);
        let written = node::save(root, &mut writer).map_err(|e| Error::io(IoOp::Write, real, e))?;
        writer.flush().map_err(|e| Error::io(IoOp::Write, real, e))?;
        written
    };
    file.set_len(written)
        .map_err(|e| Error::io(IoOp::Truncate, real, e))?;
    Ok(written)
}

/// Moves the mapped file at `real` aside and writes a fresh file in its
/// place. The old inode is unlinked at editor teardown once the new file is
/// complete; on any failure it is moved back instead.
fn replace<F>(editor: &Editor, real: &Path, meta: &Metadata, old: File, write: F) -> Result<u64>
where
    F: FnOnce(&File) -> Result<u64>,
{
    let aside = aside_name(real);
    fs::rename(real, &aside).map_err(|e| Error::io(IoOp::Rename, real, e))?;
    debug!(path = %real.display(), aside = %aside.display(), "destination is mapped; renamed aside");

    let result = create_like(real, meta)
        .map_err(|e| Error::io(IoOp::Create, real, e))
        .and_then(|fresh| write(&fresh));
    match result {
        Ok(written) => {
            editor.defer_unlink(aside, old);
            debug!(path = %real.display(), bytes = written, "saved");
            Ok(written)
        }
        Err(err) => {
            if let Err(restore) = fs::rename(&aside, real) {
                warn!(
                    aside = %aside.display(),
                    %restore,
                    "cannot move original back after failed save"
                );
            }
            Err(err)
        }
    }
}

/// Streams the tree into a sink that cannot be truncated or mapped.
pub(crate) fn to_writer(root: &Link, sink: &mut dyn Write) -> Result<u64> {
    let written = node::save(root, sink).map_err(|e| Error::stream(IoOp::Write, e))?;
    sink.flush().map_err(|e| Error::stream(IoOp::Write, e))?;
    Ok(written)
}
