//! Reverse mode: deterministic synthesis of the ciphertext view.

mod common;

use std::fs;
use std::path::Path;

use cloakfs_core::fs::{FileKind, ForwardFs, ForwardOptions, ReverseFs};
use cloakfs_core::names::{DIRIV_NAME, LONGNAME_SUFFIX};
use cloakfs_core::{BackendKind, KeySchedule};

fn new_reverse(backing: &Path) -> ReverseFs {
    ReverseFs::new(
        backing,
        &common::master_key(),
        BackendKind::AesGcm256,
        KeySchedule::Hkdf,
    )
    .unwrap()
}

fn read_all(rfs: &ReverseFs, cipher_rel: &str) -> Vec<u8> {
    let handle = rfs.open(cipher_rel).unwrap();
    let mut out = Vec::new();
    loop {
        let chunk = handle.read_at(out.len() as u64, 65536).unwrap();
        if chunk.is_empty() {
            break;
        }
        out.extend_from_slice(&chunk);
    }
    out
}

/// Copy the synthesized view into a real directory tree.
fn materialize(rfs: &ReverseFs, cipher_rel: &str, target: &Path) {
    for entry in rfs.readdir(cipher_rel).unwrap() {
        let child_rel = if cipher_rel.is_empty() {
            entry.name.clone()
        } else {
            format!("{cipher_rel}/{}", entry.name)
        };
        match entry.kind {
            FileKind::Dir => {
                fs::create_dir(target.join(&entry.name)).unwrap();
                materialize(rfs, &child_rel, &target.join(&entry.name));
            }
            _ => {
                fs::write(target.join(&entry.name), read_all(rfs, &child_rel)).unwrap();
            }
        }
    }
}

fn sample_tree() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("hello.txt"), b"hello reverse world").unwrap();
    fs::write(dir.path().join("block-aligned"), vec![7u8; 8192]).unwrap();
    fs::create_dir(dir.path().join("sub")).unwrap();
    fs::write(dir.path().join("sub/nested"), vec![3u8; 5000]).unwrap();
    dir
}

#[test]
fn two_mounts_synthesize_identical_views() {
    let plain = sample_tree();
    let a = new_reverse(plain.path());
    let b = new_reverse(plain.path());

    let list_a = a.readdir("").unwrap();
    let list_b = b.readdir("").unwrap();
    assert_eq!(list_a, list_b);

    for entry in &list_a {
        if entry.kind == FileKind::File {
            assert_eq!(
                read_all(&a, &entry.name),
                read_all(&b, &entry.name),
                "file {} differs between mounts",
                entry.name
            );
        }
    }
}

#[test]
fn repeated_reads_are_byte_identical() {
    let plain = sample_tree();
    let rfs = new_reverse(plain.path());
    let entry = rfs
        .readdir("")
        .unwrap()
        .into_iter()
        .find(|e| e.kind == FileKind::File && e.name != DIRIV_NAME)
        .unwrap();
    let first = read_all(&rfs, &entry.name);
    let second = read_all(&rfs, &entry.name);
    assert_eq!(first, second);
    // Interior windows match the full read too.
    let handle = rfs.open(&entry.name).unwrap();
    assert_eq!(handle.read_at(10, 40).unwrap(), &first[10..50]);
}

#[test]
fn stat_sizes_match_synthesized_content() {
    let plain = sample_tree();
    let rfs = new_reverse(plain.path());
    for entry in rfs.readdir("").unwrap() {
        if entry.kind != FileKind::File {
            continue;
        }
        let attr = rfs.getattr(&entry.name).unwrap();
        let content = read_all(&rfs, &entry.name);
        assert_eq!(attr.size, content.len() as u64, "size mismatch for {}", entry.name);
    }
}

#[test]
fn materialized_view_mounts_forward() {
    let plain = sample_tree();
    let rfs = new_reverse(plain.path());

    let cipher = tempfile::tempdir().unwrap();
    materialize(&rfs, "", cipher.path());

    let fwd = ForwardFs::new(cipher.path(), &common::master_key(), ForwardOptions::default())
        .unwrap();
    let mut names: Vec<String> = fwd
        .readdir("")
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["block-aligned", "hello.txt", "sub"]);

    let file = fwd.open("hello.txt", false).unwrap();
    assert_eq!(file.read_at(0, 100).unwrap(), b"hello reverse world");

    let nested = fwd.open("sub/nested", false).unwrap();
    assert_eq!(nested.read_at(0, 5000).unwrap(), vec![3u8; 5000]);
    assert_eq!(fwd.getattr("sub/nested").unwrap().size, 5000);
}

#[test]
fn long_plain_names_synthesize_sidecars() {
    let plain = tempfile::tempdir().unwrap();
    let long = "q".repeat(220);
    fs::write(plain.path().join(&long), b"long content").unwrap();
    let rfs = new_reverse(plain.path());

    let listing = rfs.readdir("").unwrap();
    let stem = listing
        .iter()
        .find(|e| e.name.starts_with("gocryptfs.longname.") && !e.name.ends_with(LONGNAME_SUFFIX))
        .expect("hashed entry")
        .name
        .clone();
    let sidecar = format!("{stem}{LONGNAME_SUFFIX}");
    assert!(listing.iter().any(|e| e.name == sidecar));

    // The sidecar's synthesized content is the full encrypted name.
    let full = read_all(&rfs, &sidecar);
    assert!(full.len() > 255);
    assert_eq!(rfs.getattr(&sidecar).unwrap().size, full.len() as u64);

    // The stem opens the underlying file's ciphertext.
    let cipher = read_all(&rfs, &stem);
    assert_eq!(cipher.len() as u64, 18 + 12 + 32);
}

#[test]
fn config_file_is_mapped_at_the_root() {
    let plain = tempfile::tempdir().unwrap();
    fs::write(plain.path().join(".gocryptfs.reverse.conf"), b"{}").unwrap();
    let rfs = new_reverse(plain.path());

    let listing = rfs.readdir("").unwrap();
    assert!(listing.iter().any(|e| e.name == "gocryptfs.conf"));
    assert_eq!(read_all(&rfs, "gocryptfs.conf"), b"{}");
    assert_eq!(rfs.getattr("gocryptfs.conf").unwrap().size, 2);
}
