use std::io::Write;

use libuchroot::idmap::{self, AUTO_RANGE, IdMap, OVERFLOW_ID};

fn sample_map() -> IdMap {
    let mut map = IdMap::new();
    map.add(0, 1000, 1).add(1, 100000, 65536);
    map
}

#[test]
fn lookup_round_trip() {
    let map = sample_map();
    for inner in [0u32, 1, 2, 100, 65535, 65536] {
        let outer = map.lookup(inner);
        assert_ne!(outer, OVERFLOW_ID);
        assert_eq!(map.inverse_lookup(outer), inner);
    }
    assert_eq!(map.lookup(0), 1000);
    assert_eq!(map.lookup(1), 100000);
    assert_eq!(map.lookup(65536), 165535);
}

#[test]
fn misses_map_to_overflow_id_in_both_directions() {
    let map = sample_map();
    assert_eq!(map.lookup(65537), OVERFLOW_ID);
    assert_eq!(map.lookup(u32::MAX), OVERFLOW_ID);
    assert_eq!(map.inverse_lookup(1), OVERFLOW_ID);
    assert_eq!(map.inverse_lookup(999), OVERFLOW_ID);
    assert_eq!(map.inverse_lookup(165536), OVERFLOW_ID);

    let empty = IdMap::new();
    assert_eq!(empty.lookup(0), OVERFLOW_ID);
    assert_eq!(empty.inverse_lookup(0), OVERFLOW_ID);
}

#[test]
fn single_identity_map() {
    let map = IdMap::single(0, 1000);
    assert_eq!(map.lookup(0), 1000);
    assert_eq!(map.inverse_lookup(1000), 0);
    assert_eq!(map.lookup(1), OVERFLOW_ID);
    assert!(map.directly_writable(1000));
}

#[test]
fn covers_inner() {
    let map = sample_map();
    assert!(map.covers_inner(0));
    assert!(map.covers_inner(5));
    assert!(!map.covers_inner(70000));
    assert!(!IdMap::single(0, 1000).covers_inner(5));
}

#[test]
fn subid_file_scan() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "# comment").unwrap();
    writeln!(file, "alice:100000:65536").unwrap();
    writeln!(file, "bob:50000:1000").unwrap();
    writeln!(file, "bob:200000:65536").unwrap();
    writeln!(file, "1042:300000:65536").unwrap();
    file.flush().unwrap();

    // first wide-enough line of the named user wins
    let range = idmap::automatic_range(file.path(), &["bob".to_string()])
        .unwrap()
        .expect("range for bob");
    assert_eq!((range.inner, range.outer, range.count), (0, 200000, AUTO_RANGE));

    // numeric names are accepted as well
    let range = idmap::automatic_range(file.path(), &["1042".to_string()])
        .unwrap()
        .expect("range for 1042");
    assert_eq!(range.outer, 300000);

    // a user with only narrow ranges gets nothing
    assert!(
        idmap::automatic_range(file.path(), &["nobody".to_string()])
            .unwrap()
            .is_none()
    );
}
