use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use proptest::prelude::*;
use tempfile::tempdir;

use super::node::{check_invariants, depth};
use super::*;
use crate::config::Config;

fn editor_with_threshold(mmap_threshold: usize) -> Editor {
    Editor::new(Config {
        mmap_threshold,
        watch_mappings: false,
        ..Config::default()
    })
}

fn text(buffer: &Buffer) -> String {
    String::from_utf8(buffer.to_vec().unwrap()).unwrap()
}

fn mapped(editor: &Editor, path: &Path, content: &[u8]) -> Buffer {
    fs::write(path, content).unwrap();
    let buffer = Buffer::open(editor, path).unwrap();
    assert!(buffer.has_healthy_mmap(), "expected a mapped buffer");
    buffer
}

#[test]
fn test_insert_then_delete_hello_world() {
    let editor = Editor::default();
    let mut buffer = Buffer::from_bytes(&editor, b"hello world".to_vec());

    buffer.insert(6, b"there ").unwrap();
    let mut out = [0u8; 17];
    assert_eq!(buffer.read(0, &mut out).unwrap(), 17);
    assert_eq!(&out, b"hello there world");

    buffer.delete(6, 12).unwrap();
    assert_eq!(text(&buffer), "hello world");
    check_invariants(buffer.root());
}

#[test]
fn test_bounds_are_checked() {
    let editor = Editor::default();
    let mut buffer = Buffer::from_bytes(&editor, b"abc".to_vec());

    assert!(matches!(
        buffer.insert(4, b"x"),
        Err(Error::OutOfBounds { offset: 4, len: 3 })
    ));
    assert!(matches!(
        buffer.delete(2, 1),
        Err(Error::NegativeRange { start: 2, end: 1 })
    ));
    assert!(matches!(
        buffer.delete(1, 9),
        Err(Error::OutOfBounds { offset: 9, len: 3 })
    ));
    assert!(matches!(buffer.iter(4), Err(Error::OutOfBounds { .. })));

    let mut dest = [0u8; 8];
    assert_eq!(buffer.read(3, &mut dest).unwrap(), 0);
    assert!(buffer.read(4, &mut dest).is_err());

    buffer.insert(1, b"").unwrap();
    buffer.delete(2, 2).unwrap();
    assert_eq!(text(&buffer), "abc");
}

#[test]
fn test_read_is_bounded_by_dest() {
    let editor = Editor::default();
    let mut buffer = Buffer::new(&editor);
    for piece in ["one ", "two ", "three"] {
        let len = buffer.len();
        buffer.insert(len, piece.as_bytes()).unwrap();
    }
    let mut dest = [0u8; 6];
    assert_eq!(buffer.read(2, &mut dest).unwrap(), 6);
    assert_eq!(&dest, b"e two ");
    assert_eq!(buffer.read(10, &mut dest).unwrap(), 3);
    assert_eq!(&dest[..3], b"ree");
}

#[test]
fn test_clone_is_an_independent_version() {
    let editor = Editor::default();
    let mut original = Buffer::from_bytes(&editor, b"shared content".to_vec());
    let snapshot = original.clone();
    assert_eq!(editor.live_buffers(), 2);

    original.insert(0, b"new ").unwrap();
    original.delete(4, 11).unwrap();
    assert_eq!(text(&original), "new content");
    assert_eq!(text(&snapshot), "shared content");

    drop(original);
    assert_eq!(editor.live_buffers(), 1);
}

#[test]
fn test_copy_shares_source_slice() {
    let editor = Editor::default();
    let mut src = Buffer::from_bytes(&editor, b"0123456789".to_vec());
    src.insert(5, b"-").unwrap();
    let mut dest = Buffer::from_bytes(&editor, b"[]".to_vec());

    dest.copy(1, &src, 3, 8).unwrap();
    assert_eq!(text(&dest), "[34-56]");
    assert_eq!(text(&src), "01234-56789");

    // Editing either side afterwards leaves the other alone.
    dest.delete(1, 3).unwrap();
    src.insert(0, b">").unwrap();
    assert_eq!(text(&dest), "[-56]");
    assert_eq!(text(&src), ">01234-56789");
}

#[test]
#[should_panic(expected = "different editors")]
fn test_copy_across_editors_panics() {
    let first = Editor::default();
    let second = Editor::default();
    let src = Buffer::from_bytes(&first, b"abc".to_vec());
    let mut dest = Buffer::new(&second);
    let _ = dest.copy(0, &src, 0, 1);
}

#[test]
fn test_foreign_owner_is_released_with_buffer() {
    struct Tracked(Arc<()>, Vec<u8>);
    impl AsRef<[u8]> for Tracked {
        fn as_ref(&self) -> &[u8] {
            &self.1
        }
    }

    let editor = Editor::default();
    let token = Arc::new(());
    let buffer = Buffer::from_foreign(&editor, Tracked(Arc::clone(&token), b"foreign".to_vec()));
    assert_eq!(buffer.fragments()[0].owner(), Owner::Foreign);
    assert_eq!(text(&buffer), "foreign");
    assert_eq!(Arc::strong_count(&token), 2);
    drop(buffer);
    assert_eq!(Arc::strong_count(&token), 1);
}

#[test]
fn test_open_small_file_reads_onto_heap() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("small.txt");
    fs::write(&path, "tiny").unwrap();

    let editor = editor_with_threshold(1024);
    let buffer = Buffer::open(&editor, path.as_path()).unwrap();
    assert_eq!(text(&buffer), "tiny");
    assert!(!buffer.has_healthy_mmap());
    assert_eq!(editor.live_mappings(), 0);
}

#[test]
fn test_open_empty_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("empty.txt");
    fs::write(&path, "").unwrap();

    let editor = editor_with_threshold(0);
    let buffer = Buffer::open(&editor, path.as_path()).unwrap();
    assert!(buffer.is_empty());
    assert_eq!(editor.live_mappings(), 0);
}

#[test]
fn test_open_missing_file_reports_path() {
    let dir = tempdir().unwrap();
    let editor = Editor::default();
    let err = Buffer::open(&editor, dir.path().join("nope.txt").as_path()).unwrap_err();
    assert!(matches!(err, Error::Io { op: IoOp::Resolve | IoOp::Open, .. }));
}

#[test]
fn test_open_uri_without_provider_is_unsupported() {
    let editor = Editor::default();
    let err = Buffer::open(&editor, Locator::parse("sftp://host/file.txt")).unwrap_err();
    assert!(matches!(err, Error::UnsupportedLocator(_)));
}

#[test]
fn test_large_file_is_mapped_and_loadable() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("large.bin");
    let editor = editor_with_threshold(8);
    let buffer = mapped(&editor, &path, b"mapped file contents");
    assert_eq!(editor.live_mappings(), 1);

    buffer.load().unwrap();
    assert!(!buffer.has_healthy_mmap());
    assert!(!buffer.has_corrupt_mmap());
    assert_eq!(buffer.fragments()[0].owner(), Owner::Heap);
    assert_eq!(text(&buffer), "mapped file contents");
    assert_eq!(editor.live_mappings(), 0);
}

#[test]
fn test_save_preserves_concurrent_mapping() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("f.txt");
    let editor = editor_with_threshold(8);

    let reader = mapped(&editor, &path, b"original bytes on disk");
    let writer = Buffer::from_bytes(&editor, b"replacement".to_vec());
    writer.save(path.as_path()).unwrap();

    assert_eq!(fs::read(&path).unwrap(), b"replacement");
    assert_eq!(text(&reader), "original bytes on disk");
    assert!(!reader.has_corrupt_mmap());

    let aside = editor.deferred_unlinks();
    assert_eq!(aside.len(), 1);
    assert!(aside[0].exists());

    drop(reader);
    drop(writer);
    drop(editor);
    assert!(!aside[0].exists());
}

#[test]
fn test_save_edited_mapping_onto_itself() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("self.txt");
    let editor = editor_with_threshold(8);

    let mut buffer = mapped(&editor, &path, b"line one\nline two\n");
    buffer.insert(9, b"inserted\n").unwrap();
    buffer.save(path.as_path()).unwrap();

    assert_eq!(fs::read_to_string(&path).unwrap(), "line one\ninserted\nline two\n");
    assert_eq!(text(&buffer), "line one\ninserted\nline two\n");
}

#[cfg(unix)]
#[test]
fn test_save_preserves_mode_bits() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempdir().unwrap();
    let path = dir.path().join("script.sh");
    let editor = editor_with_threshold(4);
    let buffer = mapped(&editor, &path, b"#!/bin/sh\necho hi\n");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o751)).unwrap();

    buffer.save(path.as_path()).unwrap();
    let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o751);
}

#[cfg(unix)]
#[test]
fn test_save_refuses_mapped_file_with_hard_links() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("linked.txt");
    let editor = editor_with_threshold(4);
    let reader = mapped(&editor, &path, b"shared inode");
    fs::hard_link(&path, dir.path().join("other-link.txt")).unwrap();

    let writer = Buffer::from_bytes(&editor, b"new".to_vec());
    let err = writer.save(path.as_path()).unwrap_err();
    assert!(matches!(err, Error::MultipleHardLinks { links: 2, .. }));
    assert_eq!(text(&reader), "shared inode");
    assert_eq!(fs::read(&path).unwrap(), b"shared inode");
}

#[test]
fn test_external_modification_zero_fills_only_that_mapping() {
    let dir = tempdir().unwrap();
    let editor = editor_with_threshold(4);
    let victim_path = dir.path().join("victim.bin");
    let other_path = dir.path().join("other.bin");
    let victim = mapped(&editor, &victim_path, b"victim data");
    let other = mapped(&editor, &other_path, b"other data");

    let mut derived = Buffer::from_bytes(&editor, b">> ".to_vec());
    derived.copy(3, &victim, 0, 6).unwrap();
    assert!(!derived.has_corrupt_mmap());

    let key = victim.fragments()[0].file_key().unwrap();
    editor.notify_modified(key);
    assert!(editor.validate_mappings());
    assert!(!editor.validate_mappings());

    assert_eq!(victim.to_vec().unwrap(), vec![0u8; 11]);
    assert!(victim.has_corrupt_mmap());
    assert!(!victim.has_healthy_mmap());
    assert!(derived.has_corrupt_mmap());
    assert_eq!(&derived.to_vec().unwrap()[..3], b">> ");

    assert!(!other.has_corrupt_mmap());
    assert!(other.has_healthy_mmap());
    assert_eq!(text(&other), "other data");
}

#[cfg(target_os = "linux")]
#[test]
fn test_watcher_reports_in_place_write() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("watched.bin");
    let editor = Editor::new(Config {
        mmap_threshold: 4,
        ..Config::default()
    });
    fs::write(&path, b"before the write").unwrap();
    let buffer = Buffer::open(&editor, path.as_path()).unwrap();
    assert!(buffer.has_healthy_mmap());

    {
        use std::io::Write;
        let mut file = fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all(b"AFTER").unwrap();
        file.sync_all().unwrap();
    }

    assert!(wait_for_corruption(&editor), "no modification reported within the deadline");
    assert!(buffer.has_corrupt_mmap());
    assert_eq!(buffer.to_vec().unwrap(), vec![0u8; 16]);
}

#[cfg(target_os = "linux")]
fn wait_for_corruption(editor: &Editor) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if editor.validate_mappings() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

#[cfg(target_os = "linux")]
#[test]
fn test_watcher_follows_file_replaced_by_save() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("resaved.bin");
    let editor = Editor::new(Config {
        mmap_threshold: 4,
        ..Config::default()
    });
    fs::write(&path, b"first content here").unwrap();
    let first = Buffer::open(&editor, path.as_path()).unwrap();
    assert!(first.has_healthy_mmap());

    let writer = Buffer::from_bytes(&editor, b"second content here!!!".to_vec());
    writer.save(path.as_path()).unwrap();
    assert_eq!(editor.deferred_unlinks().len(), 1);
    let second = Buffer::open(&editor, path.as_path()).unwrap();
    assert!(second.has_healthy_mmap());

    {
        use std::io::Write;
        let mut file = fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all(b"EXTERNAL").unwrap();
        file.sync_all().unwrap();
    }

    assert!(wait_for_corruption(&editor), "write to the replacement file went unnoticed");
    assert!(second.has_corrupt_mmap());
    assert_eq!(second.to_vec().unwrap(), vec![0u8; 22]);
    assert!(!first.has_corrupt_mmap());
    assert_eq!(text(&first), "first content here");
}

#[test]
fn test_versions_shared_across_threads() {
    let editor = Editor::default();
    let mut base = Buffer::from_bytes(&editor, vec![b'.'; 256]);
    for i in 0..32 {
        base.insert(i * 8, format!("{i:02}").as_bytes()).unwrap();
    }
    let expected = base.to_vec().unwrap();

    std::thread::scope(|scope| {
        for t in 0..8u8 {
            let version = base.clone();
            let expected = &expected;
            scope.spawn(move || {
                let mut version = version;
                for round in 0..50 {
                    let at = (round * 7 + usize::from(t)) % version.len();
                    version.insert(at, &[t]).unwrap();
                    let snapshot = version.clone();
                    version.delete(at, at + 1).unwrap();
                    drop(snapshot);
                }
                assert_eq!(&version.to_vec().unwrap(), expected);
            });
        }
    });

    assert_eq!(base.to_vec().unwrap(), expected);
    assert_eq!(editor.live_buffers(), 1);
    check_invariants(base.root());
}

#[test]
fn test_many_inserts_stay_shallow() {
    let editor = Editor::default();
    let mut buffer = Buffer::new(&editor);
    for i in 0..2000 {
        let len = buffer.len();
        buffer.insert(len, &[b'a' + (i % 26) as u8]).unwrap();
    }
    assert_eq!(buffer.len(), 2000);
    // Expected depth is ~2 ln n; a degenerate tree would be 2000 deep.
    assert!(depth(buffer.root()) < 60);
}

#[derive(Debug, Clone)]
enum Op {
    Insert(usize, Vec<u8>),
    Delete(usize, usize),
    Copy(usize, usize, usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (any::<usize>(), proptest::collection::vec(any::<u8>(), 1..12))
            .prop_map(|(at, bytes)| Op::Insert(at, bytes)),
        (any::<usize>(), 0usize..16).prop_map(|(at, n)| Op::Delete(at, n)),
        (any::<usize>(), any::<usize>(), 0usize..16).prop_map(|(d, s, n)| Op::Copy(d, s, n)),
    ]
}

proptest! {
    #[test]
    fn prop_edits_match_vec_model(ops in proptest::collection::vec(op_strategy(), 1..60)) {
        let editor = Editor::default();
        let mut buffer = Buffer::from_bytes(&editor, b"seed".to_vec());
        let mut model = b"seed".to_vec();

        for op in ops {
            match op {
                Op::Insert(at, bytes) => {
                    let at = at % (model.len() + 1);
                    buffer.insert(at, &bytes).unwrap();
                    model.splice(at..at, bytes);
                }
                Op::Delete(at, n) => {
                    let start = at % (model.len() + 1);
                    let end = (start + n).min(model.len());
                    buffer.delete(start, end).unwrap();
                    model.drain(start..end);
                }
                Op::Copy(dest, src, n) => {
                    let snapshot = buffer.clone();
                    let start = src % (model.len() + 1);
                    let end = (start + n).min(model.len());
                    let dest = dest % (model.len() + 1);
                    buffer.copy(dest, &snapshot, start, end).unwrap();
                    let slice = model[start..end].to_vec();
                    model.splice(dest..dest, slice);
                }
            }
            prop_assert_eq!(buffer.len(), model.len());
        }

        prop_assert_eq!(buffer.to_vec().unwrap(), model.clone());
        let forward: Vec<u8> = buffer.iter(0).unwrap().collect();
        prop_assert_eq!(forward, model);
        check_invariants(buffer.root());
    }

    #[test]
    fn prop_insert_then_delete_is_identity(
        base in proptest::collection::vec(any::<u8>(), 0..64),
        at in any::<usize>(),
        bytes in proptest::collection::vec(any::<u8>(), 1..32),
    ) {
        let editor = Editor::default();
        let mut buffer = Buffer::from_bytes(&editor, base.clone());
        let at = at % (base.len() + 1);
        buffer.insert(at, &bytes).unwrap();
        buffer.delete(at, at + bytes.len()).unwrap();
        prop_assert_eq!(buffer.to_vec().unwrap(), base);
    }
}
