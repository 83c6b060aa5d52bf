//! Integration tests for attribute updates and extended attributes.

mod common;

use bosfs_store::{META_MODE, META_MTIME, META_XATTR};

use crate::common as testkit;
use crate::common::{root, setup, user};

#[tokio::test]
async fn chmod_rewrites_the_object_metadata() {
    let fs = setup();
    let ctx = root();
    fs.backend
        .seed("f", &b"data"[..], testkit::file_meta(0o644, 1));

    fs.core.chmod(&ctx, "/f", 0o600).await.unwrap();

    let meta = fs.backend.object_meta("f").unwrap();
    assert_eq!(meta.user_meta_int(META_MODE), Some(0o600));
    // Copy-in-place keeps the body.
    assert_eq!(fs.backend.object("f").unwrap(), b"data");

    let st = fs.core.getattr(&ctx, "/f").await.unwrap();
    assert_eq!(st.mode & 0o777, 0o600);
}

#[tokio::test(start_paused = true)]
async fn chmod_falls_back_to_the_open_entity() {
    let fs = setup();
    let ctx = root();

    // Created but never flushed: the remote copy-in-place keeps answering
    // not-found through all retries.
    let handle = fs
        .core
        .create(&ctx, "/pending", libc::S_IFREG | 0o644)
        .await
        .unwrap();
    fs.core.write(&handle, b"x", 0).await.unwrap();

    fs.core.chmod(&ctx, "/pending", 0o600).await.unwrap();

    // The mode change rode onto the open entity and stat reflects it while
    // the attribute cache entry is gone.
    assert!(fs.core.file_manager().try_get("/pending").is_none());
    let st = fs.core.getattr(&ctx, "/pending").await.unwrap();
    assert_eq!(st.mode & 0o777, 0o600);

    // The flush carries the new mode to the store.
    fs.core.flush(&handle).await.unwrap();
    fs.core.release(&handle).await.unwrap();
    let meta = fs.backend.object_meta("pending").unwrap();
    assert_eq!(meta.user_meta_int(META_MODE), Some(0o600));
}

#[tokio::test]
async fn chown_is_root_only() {
    let fs = setup();
    fs.backend
        .seed("f", &b"data"[..], testkit::file_meta(0o666, 1));

    let err = fs
        .core
        .chown(&user(1000, 1000), "/f", 2000, 2000)
        .await
        .unwrap_err();
    assert_eq!(err.errno(), libc::EPERM);

    fs.core.chown(&root(), "/f", 2000, 2000).await.unwrap();
    let st = fs.core.getattr(&root(), "/f").await.unwrap();
    assert_eq!(st.uid, 2000);
    assert_eq!(st.gid, 2000);
}

#[tokio::test]
async fn utimens_updates_the_stored_mtime() {
    let fs = setup();
    let ctx = root();
    fs.backend
        .seed("f", &b"data"[..], testkit::file_meta(0o644, 1));

    fs.core.utimens(&ctx, "/f", 1_800_000_000).await.unwrap();
    let meta = fs.backend.object_meta("f").unwrap();
    assert_eq!(meta.user_meta_int(META_MTIME), Some(1_800_000_000));

    let st = fs.core.getattr(&ctx, "/f").await.unwrap();
    assert_eq!(st.mtime, 1_800_000_000);
}

#[tokio::test]
async fn mountpoint_attribute_changes_are_ignored() {
    let fs = setup();
    let ctx = root();
    fs.core.chmod(&ctx, "/", 0o700).await.unwrap();
    fs.core.chown(&ctx, "/", 1, 1).await.unwrap();
    fs.core
        .setxattr(&ctx, "/", "user.x", b"1", false, false)
        .await
        .unwrap();
    // Nothing was written anywhere.
    assert!(fs.backend.keys().is_empty());
}

#[tokio::test]
async fn xattr_round_trip_on_a_stored_object() {
    let fs = setup();
    let ctx = root();
    fs.backend
        .seed("f", &b"data"[..], testkit::file_meta(0o644, 1));

    fs.core
        .setxattr(&ctx, "/f", "user.color", b"blue", false, false)
        .await
        .unwrap();
    fs.core
        .setxattr(&ctx, "/f", "user.area", &[0u8, 1, 2], false, false)
        .await
        .unwrap();

    let value = fs.core.getxattr(&ctx, "/f", "user.color").await.unwrap();
    assert_eq!(value, b"blue");
    let value = fs.core.getxattr(&ctx, "/f", "user.area").await.unwrap();
    assert_eq!(value, [0u8, 1, 2]);

    let names = fs.core.listxattr(&ctx, "/f").await.unwrap();
    assert_eq!(names, ["user.area", "user.color"]);

    fs.core.removexattr(&ctx, "/f", "user.color").await.unwrap();
    let err = fs.core.getxattr(&ctx, "/f", "user.color").await.unwrap_err();
    assert_eq!(err.errno(), libc::ENODATA);
    let names = fs.core.listxattr(&ctx, "/f").await.unwrap();
    assert_eq!(names, ["user.area"]);

    // Everything above survived the round trip through object metadata.
    let meta = fs.backend.object_meta("f").unwrap();
    assert!(meta.user_meta(META_XATTR).unwrap().contains("user.area"));
}

#[tokio::test]
async fn xattr_create_and_replace_flags() {
    let fs = setup();
    let ctx = root();
    fs.backend
        .seed("f", &b"data"[..], testkit::file_meta(0o644, 1));

    fs.core
        .setxattr(&ctx, "/f", "user.a", b"1", true, false)
        .await
        .unwrap();
    let err = fs
        .core
        .setxattr(&ctx, "/f", "user.a", b"2", true, false)
        .await
        .unwrap_err();
    assert_eq!(err.errno(), libc::EEXIST);

    let err = fs
        .core
        .setxattr(&ctx, "/f", "user.missing", b"2", false, true)
        .await
        .unwrap_err();
    assert_eq!(err.errno(), libc::ENODATA);

    let err = fs.core.removexattr(&ctx, "/f", "user.missing").await.unwrap_err();
    assert_eq!(err.errno(), libc::ENODATA);
}

#[tokio::test]
async fn access_checks_follow_the_object_mode() {
    let fs = setup();
    fs.backend
        .seed("private", &b"x"[..], testkit::file_meta(0o600, 1));

    // The stored owner is uid 1000.
    assert!(fs
        .core
        .access(&user(1000, 1000), "/private", libc::R_OK as u32)
        .await
        .is_ok());
    let err = fs
        .core
        .access(&user(4000, 4000), "/private", libc::R_OK as u32)
        .await
        .unwrap_err();
    assert_eq!(err.errno(), libc::EACCES);

    // F_OK is satisfied by existence alone.
    assert!(fs
        .core
        .access(&user(4000, 4000), "/private", libc::F_OK as u32)
        .await
        .is_ok());
}

#[tokio::test]
async fn attribute_cache_is_dropped_after_mutations() {
    let fs = setup();
    let ctx = root();
    fs.backend
        .seed("f", &b"data"[..], testkit::file_meta(0o644, 1));

    fs.core.getattr(&ctx, "/f").await.unwrap();
    assert!(fs.core.file_manager().try_get("/f").is_some());

    fs.core.chmod(&ctx, "/f", 0o640).await.unwrap();
    assert!(fs.core.file_manager().try_get("/f").is_none());

    fs.core.getattr(&ctx, "/f").await.unwrap();
    fs.core.utimens(&ctx, "/f", 1_750_000_000).await.unwrap();
    assert!(fs.core.file_manager().try_get("/f").is_none());
}
