// Axel '0vercl0k' Souchet - October 18 2026
use std::fs::{self, File};
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use haystack::{dump, Address, AddressSpace, HaystackError, ReadError, WordSize};

const INDEX: &str = "0x08048000-0x08049000,/usr/bin/true
0x0804a000-0x0804b000,[heap]
0xbffdf000-0xc0000000,[stack]
";

fn heap_bytes() -> Vec<u8> {
    (0..0x1000u32).map(|i| i as u8).collect()
}

/// Add a file to a tar archive.
fn append<W: std::io::Write>(tar: &mut tar::Builder<W>, name: &str, content: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_path(name).unwrap();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    tar.append(&header, content).unwrap();
}

fn check(mappings: &haystack::Mappings) {
    assert_eq!(mappings.len(), 3);
    let heap = mappings.heap().unwrap();
    assert_eq!(heap.start(), Address::new(0x0804_a000));
    assert_eq!(heap.len(), 0x1000);
    assert!(heap.is_captured());
    assert_eq!(
        mappings.read_bytes(Address::new(0x0804_a010), 4).unwrap(),
        [0x10, 0x11, 0x12, 0x13]
    );

    // Listed in the index, but not captured.
    let stack = mappings.stack().unwrap();
    assert!(!stack.is_captured());
    assert!(mappings.is_mapped(Address::new(0xbfff_0000)));
    assert!(matches!(
        mappings.read_word(Address::new(0xbfff_0000)),
        Err(HaystackError::OutOfBounds {
            reason: ReadError::NotCaptured { region_start, .. },
            ..
        }) if region_start == Address::new(0xbffd_f000)
    ));
}

#[test]
fn directory() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join(dump::INDEX_NAME), INDEX).unwrap();
    fs::write(dir.path().join("0x0804a000-0x0804b000"), heap_bytes()).unwrap();
    fs::write(dir.path().join("0x08048000-0x08049000"), vec![0x90; 0x1000]).unwrap();

    let mappings = dump::load(dir.path(), WordSize::Four).unwrap();
    check(&mappings);
    assert_eq!(mappings.read_word(Address::new(0x0804_8000)).unwrap(), 0x9090_9090);
}

#[test]
fn gzipped_tar() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dump.tar.gz");
    let mut tar = tar::Builder::new(GzEncoder::new(
        File::create(&path).unwrap(),
        Compression::default(),
    ));
    append(&mut tar, "./mappings", INDEX.as_bytes());
    append(&mut tar, "./0x0804a000-0x0804b000", &heap_bytes());
    tar.into_inner().unwrap().finish().unwrap();

    let mappings = dump::load(&path, WordSize::Four).unwrap();
    check(&mappings);
    assert!(!mappings.regions().next().unwrap().is_captured());
}

#[test]
fn plain_tar() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dump.tar");
    let mut tar = tar::Builder::new(File::create(&path).unwrap());
    append(&mut tar, "mappings", INDEX.as_bytes());
    append(&mut tar, "0x0804a000-0x0804b000", &heap_bytes());
    tar.finish().unwrap();
    drop(tar);

    check(&dump::load(&path, WordSize::Four).unwrap());
}

#[test]
fn broken_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        dump::load(dir.path(), WordSize::Eight),
        Err(HaystackError::Io(_))
    ));

    fs::write(
        dir.path().join(dump::INDEX_NAME),
        "0x1000-0x2000,a\nnot an index line\n",
    )
    .unwrap();
    assert!(matches!(
        dump::load(dir.path(), WordSize::Eight),
        Err(HaystackError::InvalidIndex { line: 2, .. })
    ));

    fs::write(
        dir.path().join(dump::INDEX_NAME),
        "0x1000-0x3000,a\n0x2000-0x4000,b\n",
    )
    .unwrap();
    assert!(matches!(
        dump::load(dir.path(), WordSize::Eight),
        Err(HaystackError::OverlappingRegion(_))
    ));

    assert!(dump::load(Path::new("/does/not/exist"), WordSize::Eight).is_err());
}

#[test]
fn archives_lying_about_their_sizes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dump.tar");
    let mut tar = tar::Builder::new(File::create(&path).unwrap());
    append(&mut tar, "mappings", INDEX.as_bytes());

    // The header claims way more than what follows it.
    let mut header = tar::Header::new_gnu();
    header.set_path("0x0804a000-0x0804b000").unwrap();
    header.set_size(1 << 46);
    header.set_mode(0o644);
    header.set_cksum();
    tar.append(&header, &heap_bytes()[..]).unwrap();
    tar.finish().unwrap();
    drop(tar);

    assert!(matches!(
        dump::load(&path, WordSize::Four),
        Err(HaystackError::Io(_))
    ));
}
