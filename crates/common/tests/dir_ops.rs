//! Integration tests for directory emulation: mkdir, readdir, rmdir,
//! rename.

mod common;

use std::sync::atomic::Ordering;

use crate::common as testkit;
use crate::common::{root, setup};

#[tokio::test]
async fn mkdir_creates_a_directory_object() {
    let fs = setup();
    let ctx = root();

    fs.core.mkdir(&ctx, "/docs", 0o755).await.unwrap();
    assert!(fs.backend.object("docs/").is_some());

    let st = fs.core.getattr(&ctx, "/docs").await.unwrap();
    assert!(st.is_dir());

    let err = fs.core.mkdir(&ctx, "/docs", 0o755).await.unwrap_err();
    assert_eq!(err.errno(), libc::EEXIST);
}

#[tokio::test]
async fn readdir_lists_prefixes_and_objects() {
    let fs = setup();
    let ctx = root();
    fs.backend
        .seed("top.txt", &b"x"[..], testkit::file_meta(0o644, 1));
    fs.backend
        .seed("d1/a", &b"a"[..], testkit::file_meta(0o644, 1));
    fs.backend
        .seed("d1/b", &b"bb"[..], testkit::file_meta(0o644, 1));

    let entries = fs.core.read_dir(&ctx, "/").await.unwrap();
    let mut names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, ["d1", "top.txt"]);
    let d1 = entries.iter().find(|e| e.name == "d1").unwrap();
    assert!(d1.stat.is_dir());

    let entries = fs.core.read_dir(&ctx, "/d1").await.unwrap();
    let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["a", "b"]);
    assert_eq!(entries[1].stat.size, 2);
}

#[tokio::test]
async fn readdir_blends_cached_attrs_with_one_batch() {
    let fs = setup();
    let ctx = root();
    for name in ["d1/a", "d1/b", "d1/c"] {
        fs.backend
            .seed(name, &b"x"[..], testkit::file_meta(0o644, 1));
    }

    // Warm the attribute cache for one child only.
    fs.core.getattr(&ctx, "/d1/a").await.unwrap();
    let heads_before = fs.backend.stats().heads.load(Ordering::Relaxed);

    let entries = fs.core.read_dir(&ctx, "/d1").await.unwrap();
    assert_eq!(entries.len(), 3);

    // Only the two cold children go through the batched HEAD.
    let heads = fs.backend.stats().heads.load(Ordering::Relaxed) - heads_before;
    assert_eq!(heads, 2);

    // The batch populated the attribute cache for the cold children too.
    assert!(fs.core.file_manager().try_get("/d1/b").is_some());
    assert!(fs.core.file_manager().try_get("/d1/c").is_some());
}

#[tokio::test]
async fn rmdir_requires_an_empty_directory() {
    let fs = setup();
    let ctx = root();

    fs.core.mkdir(&ctx, "/empty", 0o755).await.unwrap();
    fs.core.rmdir(&ctx, "/empty").await.unwrap();
    assert!(fs.backend.object("empty/").is_none());
    let err = fs.core.getattr(&ctx, "/empty").await.unwrap_err();
    assert_eq!(err.errno(), libc::ENOENT);

    fs.backend
        .seed("full/child", &b"x"[..], testkit::file_meta(0o644, 1));
    let err = fs.core.rmdir(&ctx, "/full").await.unwrap_err();
    assert_eq!(err.errno(), libc::ENOTEMPTY);
    assert!(fs.backend.object("full/child").is_some());
}

#[tokio::test]
async fn rename_file_moves_data_and_attributes() {
    let fs = setup();
    let ctx = root();
    fs.backend
        .seed("a.txt", &b"payload"[..], testkit::file_meta(0o640, 1_700_000_123));

    fs.core.rename(&ctx, "/a.txt", "/b.txt", 0).await.unwrap();
    assert!(fs.backend.object("a.txt").is_none());
    assert_eq!(fs.backend.object("b.txt").unwrap(), b"payload");

    let st = fs.core.getattr(&ctx, "/b.txt").await.unwrap();
    assert_eq!(st.mode & 0o777, 0o640);
    assert_eq!(st.mtime, 1_700_000_123);

    // Renaming back restores the original view.
    fs.core.rename(&ctx, "/b.txt", "/a.txt", 0).await.unwrap();
    let st = fs.core.getattr(&ctx, "/a.txt").await.unwrap();
    assert_eq!(st.mode & 0o777, 0o640);
    assert_eq!(st.size, 7);
    let err = fs.core.getattr(&ctx, "/b.txt").await.unwrap_err();
    assert_eq!(err.errno(), libc::ENOENT);
}

#[tokio::test]
async fn rename_flags_are_rejected() {
    let fs = setup();
    let ctx = root();
    fs.backend
        .seed("x", &b"1"[..], testkit::file_meta(0o644, 1));
    let err = fs.core.rename(&ctx, "/x", "/y", 1).await.unwrap_err();
    assert_eq!(err.errno(), libc::EINVAL);
    assert!(fs.backend.object("x").is_some());
}

#[tokio::test]
async fn rename_directory_moves_the_subtree() {
    let fs = setup();
    let ctx = root();
    fs.backend.seed("dir/", &b""[..], testkit::dir_meta());
    fs.backend
        .seed("dir/x", &b"xx"[..], testkit::file_meta(0o644, 1));
    fs.backend
        .seed("dir/sub/y", &b"yyy"[..], testkit::file_meta(0o644, 1));

    fs.core.rename(&ctx, "/dir", "/moved", 0).await.unwrap();

    assert!(fs.backend.object("dir/x").is_none());
    assert!(fs.backend.object("dir/").is_none());
    assert_eq!(fs.backend.object("moved/x").unwrap(), b"xx");
    assert_eq!(fs.backend.object("moved/sub/y").unwrap(), b"yyy");

    let st = fs.core.getattr(&ctx, "/moved").await.unwrap();
    assert!(st.is_dir());
    let err = fs.core.getattr(&ctx, "/dir").await.unwrap_err();
    assert_eq!(err.errno(), libc::ENOENT);
}

#[tokio::test]
async fn hard_links_are_refused() {
    let fs = setup();
    let err = fs.core.hard_link("/a", "/b").await.unwrap_err();
    assert_eq!(err.errno(), libc::EPERM);
}

#[tokio::test]
async fn mount_prefix_scopes_every_path() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut opts = testkit::test_options(&dir);
    opts.bucket_prefix = "team/area/".to_string();
    let fs = testkit::build(opts, dir);
    let ctx = root();
    fs.backend
        .seed("team/area/doc.txt", &b"scoped"[..], testkit::file_meta(0o644, 1));
    fs.backend
        .seed("elsewhere.txt", &b"hidden"[..], testkit::file_meta(0o644, 1));

    let st = fs.core.getattr(&ctx, "/doc.txt").await.unwrap();
    assert_eq!(st.size, 6);

    let entries = fs.core.read_dir(&ctx, "/").await.unwrap();
    let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["doc.txt"]);
}
