#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::io::{self, Cursor, Write as _};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use common::wait_for_evictions;
use deep_fs::fs::archive::{TarProvider, ZipProvider};
use deep_fs::fs::local::LocalFs;
use deep_fs::fs::nested::Nested;
use deep_fs::fs::{ReadOnlyFs, VfsFile as _};
use deep_fs::{DeepFs, FsError, ProviderRegistry, VfsPath};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

const MTIME: u64 = 1_700_000_000;

fn tar_bytes(dirs: &[&str], files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for dir in dirs {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        header.set_mtime(MTIME);
        builder.append_data(&mut header, dir, io::empty()).unwrap();
    }
    for (name, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(MTIME);
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

fn zip_bytes(dirs: &[&str], files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for dir in dirs {
        writer
            .add_directory(*dir, SimpleFileOptions::default())
            .unwrap();
    }
    for (name, data) in files {
        writer.start_file(*name, SimpleFileOptions::default()).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn write(root: &Path, name: &str, data: &[u8]) {
    let path = root.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, data).unwrap();
}

fn archive_fs(root: &TempDir) -> DeepFs {
    DeepFs::builder(Arc::new(LocalFs::new(root.path())))
        .provider(Arc::new(TarProvider::new()))
        .provider(Arc::new(ZipProvider::new()))
        .sweep_interval(Duration::ZERO)
        .build()
        .unwrap()
}

fn names(entries: &[deep_fs::fs::DirEntry]) -> Vec<&str> {
    entries.iter().map(|e| e.name.as_str()).collect()
}

#[tokio::test]
async fn tar_entries_and_implied_directories() {
    let root = tempfile::tempdir().unwrap();
    write(
        root.path(),
        "data/bundle.tar",
        &tar_bytes(
            &["docs/"],
            &[
                ("docs/a.txt", b"alpha"),
                ("src/lib/mod.rs", b"pub mod x;"),
                ("README", b"read me"),
            ],
        ),
    );
    let fs = archive_fs(&root);

    let top = fs.read_dir("data/bundle.tar").await.unwrap();
    assert_eq!(names(&top), ["README", "docs", "src"]);
    assert!(!top[0].is_dir());
    assert!(top[1].is_dir() && top[2].is_dir());
    assert_eq!(names(&fs.read_dir("data/bundle.tar/src").await.unwrap()), ["lib"]);

    assert_eq!(&fs.read("data/bundle.tar/docs/a.txt").await.unwrap()[..], b"alpha");
    let stat = fs.stat("data/bundle.tar/src/lib/mod.rs").await.unwrap();
    assert_eq!(stat.size, 10);
    assert_eq!(
        stat.modified,
        Some(SystemTime::UNIX_EPOCH + Duration::from_secs(MTIME))
    );

    let err = fs.read("data/bundle.tar/docs/missing").await.unwrap_err();
    assert!(matches!(err, FsError::Container { .. }));
    assert!(err.is_not_found());
    let err = fs.read("data/bundle.tar/docs").await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::IsADirectory);
}

#[tokio::test]
async fn zip_entries_are_served_with_positional_reads() {
    let root = tempfile::tempdir().unwrap();
    write(
        root.path(),
        "site.zip",
        &zip_bytes(
            &["assets/"],
            &[("index.html", b"<html></html>"), ("assets/app.js", b"let x = 1;")],
        ),
    );
    let fs = archive_fs(&root);

    assert_eq!(names(&fs.read_dir("site.zip").await.unwrap()), ["assets", "index.html"]);

    let handle = fs.open("site.zip/index.html").await.unwrap();
    assert_eq!(&handle.read(1, 4).await.unwrap()[..], b"html");
    assert!(handle.read(1000, 4).await.unwrap().is_empty());
    assert_eq!(handle.stat().await.unwrap().size, 13);
    handle.close().await.unwrap();

    let dir = fs.open("site.zip/assets").await.unwrap();
    assert_eq!(names(&dir.read_dir().await.unwrap()), ["app.js"]);
    dir.close().await.unwrap();
}

#[tokio::test]
async fn corrupt_archives_fail_without_being_cached() {
    let root = tempfile::tempdir().unwrap();
    write(root.path(), "broken.zip", b"definitely not a zip file");
    let fs = archive_fs(&root);

    let err = fs.read("broken.zip/file").await.unwrap_err();
    assert!(matches!(err, FsError::ProviderCreation { .. }), "{err:?}");
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    assert!(fs.view_cache().is_empty());

    // The next request tries again and sees the repaired archive.
    write(root.path(), "broken.zip", &zip_bytes(&[], &[("file", b"fixed")]));
    assert_eq!(&fs.read("broken.zip/file").await.unwrap()[..], b"fixed");
}

#[tokio::test]
async fn missing_containers_are_not_found() {
    let root = tempfile::tempdir().unwrap();
    let fs = archive_fs(&root);

    let err = fs.read_dir("nowhere.tar").await.unwrap_err();
    assert!(matches!(err, FsError::ProviderCreation { .. }));
    assert!(err.is_not_found());
}

#[tokio::test]
async fn archives_inside_archives() {
    let root = tempfile::tempdir().unwrap();
    let inner = zip_bytes(&[], &[("deep/leaf.txt", b"leaf")]);
    write(
        root.path(),
        "outer.tar",
        &tar_bytes(&[], &[("inner.zip", inner.as_slice()), ("top.txt", b"top")]),
    );

    let inner_registry = ProviderRegistry::new()
        .with_provider(Arc::new(ZipProvider::new()))
        .unwrap();
    let fs = DeepFs::builder(Arc::new(LocalFs::new(root.path())))
        .provider(Arc::new(Nested::new(
            Arc::new(TarProvider::new()),
            inner_registry,
        )))
        .sweep_interval(Duration::ZERO)
        .build()
        .unwrap();

    assert_eq!(&fs.read("outer.tar/top.txt").await.unwrap()[..], b"top");
    assert_eq!(&fs.read("outer.tar/inner.zip/deep/leaf.txt").await.unwrap()[..], b"leaf");
    assert_eq!(names(&fs.read_dir("outer.tar/inner.zip").await.unwrap()), ["deep"]);
    assert!(fs.stat("outer.tar/inner.zip").await.unwrap().is_dir());

    assert!(fs.view_cache().purge());
    wait_for_evictions(fs.view_cache()).await;
    assert!(fs.view_cache().is_empty());
}

#[tokio::test]
async fn local_fs_lists_sorted_and_reads_at_offsets() {
    let root = tempfile::tempdir().unwrap();
    write(root.path(), "b.txt", b"0123456789");
    write(root.path(), "a/nested.txt", b"n");
    write(root.path(), "c.bin", b"");
    let fs = LocalFs::new(root.path());

    let entries = fs.read_dir(&VfsPath::root()).await.unwrap();
    assert_eq!(names(&entries), ["a", "b.txt", "c.bin"]);
    assert!(entries[0].is_dir());
    assert_eq!(entries[1].metadata.size, 10);

    let file = fs.open(&VfsPath::parse("b.txt").unwrap()).await.unwrap();
    assert_eq!(&file.read(3, 4).await.unwrap()[..], b"3456");
    assert_eq!(&file.read(8, 100).await.unwrap()[..], b"89");
    assert!(file.read(10, 1).await.unwrap().is_empty());
    // The buffer follows the file, not the requested size.
    assert_eq!(&file.read(0, u32::MAX).await.unwrap()[..], b"0123456789");

    let dir = fs.open(&VfsPath::parse("a").unwrap()).await.unwrap();
    assert_eq!(dir.read(0, 1).await.unwrap_err().kind(), io::ErrorKind::IsADirectory);
    assert_eq!(names(&dir.read_dir().await.unwrap()), ["nested.txt"]);

    let err = fs.open(&VfsPath::parse("missing").unwrap()).await.err().unwrap();
    assert_eq!(err.kind(), io::ErrorKind::NotFound);
}
