use std::path::{Path, PathBuf};

use libuchroot::pathmap::{AttrType, PathMap};

#[test]
fn empty_table_translates_nothing() {
    let map = PathMap::new();
    assert_eq!(map.classify(Path::new("/x")), AttrType::Untranslated);
    assert_eq!(map.translate(Path::new("/x")), PathBuf::from("/x"));
}

#[test]
fn root_entry_translation() {
    let mut map = PathMap::new();
    map.add_mapping(AttrType::Emulated, "/", "/tmp/T");
    assert_eq!(map.classify(Path::new("/foo")), AttrType::Emulated);
    assert_eq!(map.translate(Path::new("/foo")), PathBuf::from("/tmp/T/foo"));
    assert_eq!(map.translate(Path::new("/")), PathBuf::from("/tmp/T"));
    assert_eq!(map.translate(Path::new("/a/b")), PathBuf::from("/tmp/T/a/b"));
}

#[test]
fn longest_prefix_wins() {
    let mut map = PathMap::new();
    map.add_mapping(AttrType::Emulated, "/", "/tmp/T");
    map.add_mapping(AttrType::Untranslated, "/dev", "/dev");
    map.add_mapping(AttrType::Mapped, "/dev/shm", "/host/shm");

    assert_eq!(map.classify(Path::new("/dev")), AttrType::Untranslated);
    assert_eq!(map.classify(Path::new("/dev/null")), AttrType::Untranslated);
    assert_eq!(map.classify(Path::new("/dev/shm/x")), AttrType::Mapped);
    assert_eq!(map.classify(Path::new("/devices")), AttrType::Emulated);

    assert_eq!(map.translate(Path::new("/dev/null")), PathBuf::from("/dev/null"));
    assert_eq!(map.translate(Path::new("/dev/shm/x")), PathBuf::from("/host/shm/x"));
    assert_eq!(map.translate(Path::new("/devices")), PathBuf::from("/tmp/T/devices"));
}

#[test]
fn trailing_slashes_are_canonicalized_on_insertion() {
    let mut map = PathMap::new();
    map.add_mapping(AttrType::Mapped, "/data/", "/host/data/");
    assert_eq!(map.classify(Path::new("/data")), AttrType::Mapped);
    assert_eq!(map.classify(Path::new("/data/x")), AttrType::Mapped);
    // a prefix only matches at a component boundary
    assert_eq!(map.classify(Path::new("/database")), AttrType::Untranslated);
    assert_eq!(map.translate(Path::new("/data/x")), PathBuf::from("/host/data/x"));
    assert_eq!(map.translate(Path::new("/data")), PathBuf::from("/host/data"));
}

#[test]
fn seam_slashes_collapse_to_one() {
    let mut map = PathMap::new();
    map.add_mapping(AttrType::Mapped, "/in", "/out");
    assert_eq!(map.translate(Path::new("/in//x")), PathBuf::from("/out/x"));

    let mut identity = PathMap::new();
    identity.add_mapping(AttrType::Emulated, "/", "/");
    assert_eq!(identity.translate(Path::new("/foo")), PathBuf::from("/foo"));
}

#[test]
fn relative_paths_pass_through() {
    let mut map = PathMap::new();
    map.add_mapping(AttrType::Emulated, "/", "/tmp/T");
    assert_eq!(map.classify(Path::new("rel/path")), AttrType::Untranslated);
    assert_eq!(map.translate(Path::new("rel/path")), PathBuf::from("rel/path"));
}
