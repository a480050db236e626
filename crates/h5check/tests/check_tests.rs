//! End-to-end checks of files written to disk: the sec2 driver, verdicts and
//! exit codes, the bounded error buffer, and external links between files.

use std::fs;
use std::path::Path;

use h5check::{check_file, check_into, CheckOptions, ErrorBuffer, Verdict};
use h5check_format::decode::UNDEF_ADDR;
use h5check_format::message_type::MessageType;
use h5check_format::testutil::{msg, HeaderV2Writer, ImageBuilder};

/// Root group with compact links, followed by the root header address.
fn group_file(links: &[Vec<u8>]) -> (Vec<u8>, u64) {
    let mut b = ImageBuilder::new();
    let root = b.alloc(0);
    let mut h = HeaderV2Writer::new()
        .message(MessageType::LinkInfo, msg::link_info_compact())
        .message(MessageType::GroupInfo, msg::group_info());
    for link in links {
        h = h.message(MessageType::Link, link.clone());
    }
    b.put(&h.serialize());
    b.superblock_v2(root, UNDEF_ADDR);
    (b.into_bytes(), root)
}

fn write(path: &Path, image: &[u8]) {
    fs::write(path, image).unwrap();
}

#[test]
fn clean_file_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clean.h5");
    let (image, _) = group_file(&[msg::link_soft("dangling", "/nowhere")]);
    write(&path, &image);

    let outcome = check_file(&path, &CheckOptions::new());
    assert!(outcome.complaints.is_empty(), "{:?}", outcome.complaints);
    assert_eq!(outcome.verdict, Verdict::Compliant);
    assert_eq!(outcome.verdict.exit_code(), 0);
    assert_eq!(outcome.stats.files, 1);
    assert_eq!(outcome.stats.headers, 1);
}

#[test]
fn checksum_damage_is_non_compliant() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("damaged.h5");
    let (mut image, root) = group_file(&[]);
    let last = image.len() - 1;
    image[last] ^= 0xff;
    write(&path, &image);

    let outcome = check_file(&path, &CheckOptions::new());
    assert_eq!(outcome.verdict, Verdict::NonCompliant);
    assert_eq!(outcome.verdict.exit_code(), 2);
    let c = &outcome.complaints[0];
    assert_eq!(c.address, Some(root));
    assert_eq!(c.file.as_deref(), Some(path.as_path()));

    let mut buffer = ErrorBuffer::new(4);
    let verdict = check_into(&path, None, false, &mut buffer);
    assert_eq!(verdict, Verdict::NonCompliant);
    assert_eq!(buffer.len(), outcome.complaints.len().min(4));
    assert_eq!(buffer.entries()[0].1, Some(root));
}

#[test]
fn not_hdf5_is_non_compliant() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("text.h5");
    write(&path, &[b'x'; 4096]);

    let mut buffer = ErrorBuffer::new(1);
    let verdict = check_into(&path, None, false, &mut buffer);
    assert_eq!(verdict, Verdict::NonCompliant);
    assert_eq!(buffer.len(), 1);
}

#[test]
fn single_object_address() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("one.h5");
    let (image, root) = group_file(&[msg::link_hard("self", 0)]);
    write(&path, &image);

    // The link to address 0 is not followed when only the root is checked.
    let mut buffer = ErrorBuffer::new(8);
    let verdict = check_into(&path, Some(root), false, &mut buffer);
    assert!(buffer.is_empty(), "{:?}", buffer.entries());
    assert_eq!(verdict, Verdict::Compliant);
}

#[test]
fn external_link_cycle_visits_each_file_once() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.h5");
    let b = dir.path().join("b.h5");
    write(&a, &group_file(&[msg::link_external("to_b", "b.h5", "/")]).0);
    write(&b, &group_file(&[msg::link_external("to_a", "a.h5", "/")]).0);

    let outcome = check_file(&a, &CheckOptions::new().with_external_links(true));
    assert!(outcome.complaints.is_empty(), "{:?}", outcome.complaints);
    assert_eq!(outcome.verdict, Verdict::Compliant);
    assert_eq!(outcome.stats.files, 2);
    assert_eq!(outcome.stats.external_links, 2);
    assert_eq!(outcome.stats.headers, 2);
}

#[test]
fn external_target_damage_names_the_target() {
    let dir = tempfile::tempdir().unwrap();
    let sub = dir.path().join("targets");
    fs::create_dir(&sub).unwrap();
    let a = dir.path().join("a.h5");
    let b = sub.join("b.h5");
    write(&a, &group_file(&[msg::link_external("to_b", "b.h5", "/")]).0);
    let (mut target, _) = group_file(&[]);
    let last = target.len() - 1;
    target[last] ^= 0xff;
    write(&b, &target);

    // Without the search prefix the target is not found.
    let outcome = check_file(&a, &CheckOptions::new().with_external_links(true));
    assert_eq!(outcome.verdict, Verdict::NonCompliant);
    assert!(outcome.complaints[0].description.contains("not found"));

    let options = CheckOptions::new().with_external_links(true).with_ext_prefix(&sub);
    let outcome = check_file(&a, &options);
    assert_eq!(outcome.verdict, Verdict::NonCompliant);
    assert_eq!(outcome.stats.files, 2);
    assert_eq!(outcome.complaints.len(), 1, "{:?}", outcome.complaints);
    assert_eq!(outcome.complaints[0].file.as_deref(), Some(b.as_path()));
}

#[test]
fn external_links_ignored_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.h5");
    write(&a, &group_file(&[msg::link_external("gone", "missing.h5", "/x")]).0);

    let outcome = check_file(&a, &CheckOptions::new());
    assert_eq!(outcome.verdict, Verdict::Compliant);
    assert_eq!(outcome.stats.files, 1);
    assert_eq!(outcome.stats.external_links, 1);
}
