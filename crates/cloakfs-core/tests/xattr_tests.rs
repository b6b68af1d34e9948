//! Extended attribute behavior through the forward view.

mod common;

use std::fs;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use cloakfs_core::corruption_channel;

/// The backing entry for a plaintext path in a flat test tree.
fn backing_entry(dir: &std::path::Path) -> std::path::PathBuf {
    fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap())
        .find(|e| e.file_name() != "gocryptfs.diriv")
        .unwrap()
        .path()
}

#[test]
fn set_get_remove_roundtrip() {
    let (dir, fs_view) = common::forward_fs();
    if !common::xattr_supported(dir.path()) {
        return;
    }
    fs_view.create("f", 0o700).unwrap();

    fs_view.setxattr("f", "user.foo", b"123456789").unwrap();
    assert_eq!(fs_view.getxattr("f", "user.foo").unwrap(), b"123456789");

    fs_view.removexattr("f", "user.foo").unwrap();
    assert!(fs_view.getxattr("f", "user.foo").is_err());
}

#[test]
fn empty_values_roundtrip() {
    let (dir, fs_view) = common::forward_fs();
    if !common::xattr_supported(dir.path()) {
        return;
    }
    fs_view.create("f", 0o700).unwrap();

    fs_view.setxattr("f", "user.foo", b"").unwrap();
    assert_eq!(fs_view.getxattr("f", "user.foo").unwrap(), Vec::<u8>::new());

    fs_view.setxattr("f", "user.foo", b"xyz123").unwrap();
    assert_eq!(fs_view.getxattr("f", "user.foo").unwrap(), b"xyz123");

    fs_view.setxattr("f", "user.foo", b"").unwrap();
    assert_eq!(fs_view.getxattr("f", "user.foo").unwrap(), Vec::<u8>::new());
}

#[test]
fn listing_returns_all_twenty_names() {
    let (dir, fs_view) = common::forward_fs();
    if !common::xattr_supported(dir.path()) {
        return;
    }
    fs_view.create("f", 0o700).unwrap();

    let value = b"xxxxxxxxyyyyyyyyyyyyyyyzzzzzzzzzzzzz";
    for i in 1..=20 {
        fs_view
            .setxattr("f", &format!("user.T.{i:02}"), value)
            .unwrap();
    }
    let names = fs_view.listxattr("f").unwrap();
    assert_eq!(names.len(), 20);
    assert!(names.iter().all(|n| n.starts_with("user.T.")));
}

#[test]
fn legacy_base64_storage_still_decodes() {
    let (dir, fs_view) = common::forward_fs();
    if !common::xattr_supported(dir.path()) {
        return;
    }
    fs_view.create("f", 0o700).unwrap();
    fs_view.setxattr("f", "user.test", b"binary value").unwrap();

    // Re-store the raw record base64url-encoded, the way old versions
    // wrote it; reads must keep working.
    let backing = backing_entry(dir.path());
    let stored_name = xattr::list(&backing)
        .unwrap()
        .find_map(|n| n.into_string().ok())
        .unwrap();
    let raw = xattr::get(&backing, &stored_name).unwrap().unwrap();
    xattr::set(&backing, &stored_name, URL_SAFE_NO_PAD.encode(&raw).as_bytes()).unwrap();

    assert_eq!(fs_view.getxattr("f", "user.test").unwrap(), b"binary value");
}

#[test]
fn broken_stored_values_fail_with_io_kind() {
    let (sink, rx) = corruption_channel(16);
    let (dir, fs_view) = common::forward_fs_with_sink(sink);
    if !common::xattr_supported(dir.path()) {
        return;
    }
    fs_view.create("f", 0o700).unwrap();
    fs_view.setxattr("f", "user.test", b"ok").unwrap();

    let backing = backing_entry(dir.path());
    let stored_name = xattr::list(&backing)
        .unwrap()
        .find_map(|n| n.into_string().ok())
        .unwrap();

    let broken: [&[u8]; 4] = [
        b"111",
        b"raw-test-long-block123",
        b"raw-test-long-block123-xyz11111111111111111111111111111111111111",
        b"$$$$$$$$$$$$$$$$$$$$$$$$$$$$$$$$$$",
    ];
    for val in broken {
        xattr::set(&backing, &stored_name, val).unwrap();
        let err = fs_view.getxattr("f", "user.test").unwrap_err();
        assert_eq!(
            err.io_kind(),
            std::io::ErrorKind::InvalidData,
            "stored value {:?} must read as corrupt",
            String::from_utf8_lossy(val)
        );
    }
    assert!(rx.try_recv().is_ok(), "corruption must be reported");
}

#[test]
fn foreign_attributes_stay_hidden() {
    let (dir, fs_view) = common::forward_fs();
    if !common::xattr_supported(dir.path()) {
        return;
    }
    fs_view.create("f", 0o700).unwrap();
    fs_view.setxattr("f", "user.mine", b"1").unwrap();

    // An attribute written directly to the backing file, outside the
    // encrypted namespace, never shows up in the view.
    let backing = backing_entry(dir.path());
    xattr::set(&backing, "user.unrelated", b"2").unwrap();

    assert_eq!(fs_view.listxattr("f").unwrap(), vec!["user.mine".to_string()]);
}

#[test]
fn non_user_namespaces_are_rejected() {
    let (dir, fs_view) = common::forward_fs();
    if !common::xattr_supported(dir.path()) {
        return;
    }
    fs_view.create("f", 0o700).unwrap();
    let err = fs_view.setxattr("f", "trusted.thing", b"x").unwrap_err();
    assert_eq!(err.io_kind(), std::io::ErrorKind::PermissionDenied);
}
