use std::fs;
use std::os::unix::fs::PermissionsExt;

use libuchroot::sidecar::{self, ATTR_MASK, Attrs, EntryKind};

#[test]
fn round_trip_masks_the_mode() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("f");
    fs::write(&file, b"").unwrap();

    let attrs = Attrs { uid: 7, gid: 8, mode: 0o4755 };
    sidecar::write_attrs(&file, EntryKind::File, &attrs).unwrap();
    assert_eq!(sidecar::read_attrs(&file, EntryKind::File).unwrap(), attrs);

    // only the attribute bits survive a write
    let typed = Attrs { uid: 1, gid: 2, mode: libc::S_IFREG as u32 | 0o640 };
    sidecar::write_attrs(&file, EntryKind::File, &typed).unwrap();
    let back = sidecar::read_attrs(&file, EntryKind::File).unwrap();
    assert_eq!(back.mode, 0o640);
    assert_eq!(back.mode, typed.mode & ATTR_MASK);
}

#[test]
fn naming_rule_for_files_and_directories() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("name");
    fs::write(&file, b"").unwrap();
    sidecar::write_attrs(&file, EntryKind::File, &Attrs { uid: 0, gid: 0, mode: 0o644 })
        .unwrap();
    assert!(dir.path().join(".erlent.name").exists());

    let sub = dir.path().join("sub");
    fs::create_dir(&sub).unwrap();
    sidecar::write_attrs(&sub, EntryKind::Dir, &Attrs { uid: 0, gid: 0, mode: 0o755 }).unwrap();
    assert!(sub.join(".erlent").exists());
}

#[test]
fn missing_sidecar_yields_defaults_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("plain");
    fs::write(&file, b"x").unwrap();
    fs::set_permissions(&file, fs::Permissions::from_mode(0o640)).unwrap();

    let attrs = sidecar::read_attrs(&file, EntryKind::File).unwrap();
    assert_eq!((attrs.uid, attrs.gid), (0, 0));
    assert_eq!(attrs.mode, 0o640);
}

#[test]
fn missing_sidecar_and_missing_entry_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(sidecar::read_attrs(&dir.path().join("gone"), EntryKind::File).is_err());
}

#[test]
fn visible_entry_count_skips_sidecars() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("a"), b"").unwrap();
    fs::write(dir.path().join("b"), b"").unwrap();
    fs::write(dir.path().join(".erlent"), b"").unwrap();
    fs::write(dir.path().join(".erlent.a"), b"").unwrap();
    assert_eq!(sidecar::visible_entry_count(dir.path()).unwrap(), 2);
}

#[test]
fn short_sidecar_content_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("f");
    fs::write(&file, b"").unwrap();
    fs::write(dir.path().join(".erlent.f"), b"short").unwrap();
    assert!(sidecar::read_attrs(&file, EntryKind::File).is_err());
}
