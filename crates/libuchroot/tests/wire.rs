use std::ffi::OsString;
use std::io::Cursor;
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;

use libuchroot::idmap::IdMap;
use libuchroot::pathmap::PathMap;
use libuchroot::processor::Processor;
use libuchroot::proto::{
    Op, Owner, ProtoError, Reply, ReplyBody, Request, StatRecord, StatfsRecord, serve,
};
use libuchroot::wire::{self, CodecError, Timespec};

#[test]
fn number_round_trips() {
    for value in [0i64, 1, -1, 42, -42, i64::MAX, i64::MIN] {
        let mut buf = Vec::new();
        wire::write_i64(&mut buf, value).unwrap();
        assert_eq!(wire::read_i64(&mut Cursor::new(&buf)).unwrap(), value);
    }
    for value in [0u64, 7, u64::MAX] {
        let mut buf = Vec::new();
        wire::write_u64(&mut buf, value).unwrap();
        assert_eq!(wire::read_u64(&mut Cursor::new(&buf)).unwrap(), value);
    }
    for value in [0u32, 65534, u32::MAX] {
        let mut buf = Vec::new();
        wire::write_u32(&mut buf, value).unwrap();
        assert_eq!(wire::read_u32(&mut Cursor::new(&buf)).unwrap(), value);
    }
}

#[test]
fn string_round_trip_keeps_every_byte() {
    let bytes = b"with\0embedded\0nuls and \xff bytes".to_vec();
    let mut buf = Vec::new();
    wire::write_bytes(&mut buf, &bytes).unwrap();
    assert_eq!(wire::read_bytes(&mut Cursor::new(&buf)).unwrap(), bytes);

    let empty: &[u8] = b"";
    let mut buf = Vec::new();
    wire::write_bytes(&mut buf, empty).unwrap();
    assert_eq!(wire::read_bytes(&mut Cursor::new(&buf)).unwrap(), empty);
}

#[test]
fn timespec_round_trip() {
    for ts in [
        Timespec::new(0, 0),
        Timespec::new(1234567890, 999_999_999),
        Timespec::new(-1, 500),
        Timespec::NOW,
        Timespec::OMIT,
    ] {
        let mut buf = Vec::new();
        wire::write_timespec(&mut buf, ts).unwrap();
        assert_eq!(wire::read_timespec(&mut Cursor::new(&buf)).unwrap(), ts);
    }
}

#[test]
fn short_input_is_an_error() {
    // number cut before its terminator
    let err = wire::read_u64(&mut Cursor::new(b"12")).unwrap_err();
    assert!(matches!(err, CodecError::UnexpectedEof));

    // string cut inside the payload
    let mut buf = Vec::new();
    wire::write_u64(&mut buf, 10).unwrap();
    buf.extend_from_slice(b"abc");
    let err = wire::read_bytes(&mut Cursor::new(&buf)).unwrap_err();
    assert!(matches!(err, CodecError::UnexpectedEof));
}

fn all_requests() -> Vec<Request> {
    let owner = Owner { uid: 1000, gid: 1001 };
    vec![
        Request::Getattr { path: PathBuf::from("/a") },
        Request::Access { path: PathBuf::from("/a"), mask: 5 },
        Request::Readdir { path: PathBuf::from("/") },
        Request::Readlink { path: PathBuf::from("/ln") },
        Request::Read { path: PathBuf::from("/a"), size: 4096, offset: 12 },
        Request::Write { path: PathBuf::from("/a"), data: b"pay\0load".to_vec(), offset: -1 },
        Request::Open { path: PathBuf::from("/a"), flags: libc::O_RDWR, mode: 0o644 },
        Request::Creat { path: PathBuf::from("/a"), owner, mode: 0o600 },
        Request::Mknod { path: PathBuf::from("/dev/x"), rdev: 0x0103, owner, mode: 0o20644 },
        Request::Truncate { path: PathBuf::from("/a"), length: 1 << 40 },
        Request::Chmod { path: PathBuf::from("/a"), mode: 0o4755 },
        Request::Chown { path: PathBuf::from("/a"), owner: Owner { uid: u32::MAX, gid: 8 } },
        Request::Mkdir { path: PathBuf::from("/d"), owner, mode: 0o2775 },
        Request::Unlink { path: PathBuf::from("/a") },
        Request::Rmdir { path: PathBuf::from("/d") },
        Request::Symlink { target: PathBuf::from("../t"), path: PathBuf::from("/ln"), owner },
        Request::Link { path: PathBuf::from("/a"), path2: PathBuf::from("/b") },
        Request::Rename { path: PathBuf::from("/a"), path2: PathBuf::from("/b") },
        Request::Utimens {
            path: PathBuf::from("/a"),
            atime: Timespec::NOW,
            mtime: Timespec::new(5, 6),
        },
        Request::Statfs { path: PathBuf::from("/") },
    ]
}

#[test]
fn request_round_trip_for_every_operation() {
    for req in all_requests() {
        let mut buf = Vec::new();
        req.encode(&mut buf).unwrap();
        let decoded = Request::receive(&mut Cursor::new(&buf)).unwrap().unwrap();
        assert_eq!(decoded, req, "round trip of {}", req.op().name());
    }
}

#[test]
fn request_with_arbitrary_path_bytes() {
    let path = PathBuf::from(OsString::from_vec(b"/we\xc3\x28ird\0name".to_vec()));
    let req = Request::Unlink { path };
    let mut buf = Vec::new();
    req.encode(&mut buf).unwrap();
    assert_eq!(Request::receive(&mut Cursor::new(&buf)).unwrap().unwrap(), req);
}

#[test]
fn reply_round_trips() {
    let stat = Reply {
        result: 0,
        body: ReplyBody::Stat(StatRecord {
            ino: 9,
            mode: libc::S_IFDIR as u32 | 0o755,
            nlink: 3,
            uid: 1000,
            gid: 1000,
            rdev: 0,
            size: 2,
            blksize: 4096,
            blocks: 8,
            atime: Timespec::new(1, 2),
            mtime: Timespec::new(3, 4),
            ctime: Timespec::new(5, 6),
        }),
    };
    let mut buf = Vec::new();
    stat.encode(Op::Getattr, &mut buf).unwrap();
    assert_eq!(Reply::decode(Op::Getattr, &mut Cursor::new(&buf)).unwrap(), stat);

    let names = Reply {
        result: 0,
        body: ReplyBody::Names(vec![
            OsString::from("."),
            OsString::from(".."),
            OsString::from_vec(b"nul\0name".to_vec()),
        ]),
    };
    let mut buf = Vec::new();
    names.encode(Op::Readdir, &mut buf).unwrap();
    assert_eq!(Reply::decode(Op::Readdir, &mut Cursor::new(&buf)).unwrap(), names);

    let read = Reply { result: 4, body: ReplyBody::Data(b"data".to_vec()) };
    let mut buf = Vec::new();
    read.encode(Op::Read, &mut buf).unwrap();
    assert_eq!(Reply::decode(Op::Read, &mut Cursor::new(&buf)).unwrap(), read);

    let statfs = Reply {
        result: 0,
        body: ReplyBody::Statfs(StatfsRecord {
            blocks: 1,
            bfree: 2,
            bavail: 3,
            files: 4,
            ffree: 5,
            bsize: 4096,
            namemax: 255,
            frsize: 4096,
        }),
    };
    let mut buf = Vec::new();
    statfs.encode(Op::Statfs, &mut buf).unwrap();
    assert_eq!(Reply::decode(Op::Statfs, &mut Cursor::new(&buf)).unwrap(), statfs);

    // failures carry no body, whatever the operation
    let failed = Reply { result: -libc::ENOENT, body: ReplyBody::None };
    let mut buf = Vec::new();
    failed.encode(Op::Getattr, &mut buf).unwrap();
    assert_eq!(Reply::decode(Op::Getattr, &mut Cursor::new(&buf)).unwrap(), failed);
}

#[test]
fn unknown_tag_aborts_the_receiver() {
    let mut buf = Vec::new();
    wire::write_u64(&mut buf, 99).unwrap();
    let err = Request::receive(&mut Cursor::new(&buf)).unwrap_err();
    assert!(matches!(err, ProtoError::UnknownTag(99)));
}

#[test]
fn eof_between_messages_is_clean() {
    assert!(Request::receive(&mut Cursor::new(b"")).unwrap().is_none());
}

#[test]
fn serve_loop_over_a_byte_stream() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("payload");
    std::fs::write(&file, b"abcdef").unwrap();

    // An empty table leaves every path untranslated.
    let processor = Processor::new(PathMap::new(), IdMap::new(), IdMap::new(), 0, 0);

    let mut input = Vec::new();
    Request::Getattr { path: file.clone() }.encode(&mut input).unwrap();
    Request::Read { path: file.clone(), size: 4, offset: 0 }.encode(&mut input).unwrap();
    Request::Getattr { path: dir.path().join("missing") }.encode(&mut input).unwrap();

    let mut output = Vec::new();
    serve(&processor, &mut Cursor::new(&input), &mut output).unwrap();

    let mut replies = Cursor::new(&output);
    let stat = Reply::decode(Op::Getattr, &mut replies).unwrap();
    assert_eq!(stat.result, 0);
    match stat.body {
        ReplyBody::Stat(st) => assert_eq!(st.size, 6),
        other => panic!("unexpected body {other:?}"),
    }

    let read = Reply::decode(Op::Read, &mut replies).unwrap();
    assert_eq!(read.result, 4);
    assert_eq!(read.body, ReplyBody::Data(b"abcd".to_vec()));

    let missing = Reply::decode(Op::Getattr, &mut replies).unwrap();
    assert_eq!(missing.result, -libc::ENOENT);

    // a message cut off mid-payload is a hard error
    let mut partial = Vec::new();
    Request::Getattr { path: file }.encode(&mut partial).unwrap();
    partial.truncate(partial.len() - 2);
    let mut output = Vec::new();
    let err = serve(&processor, &mut Cursor::new(&partial), &mut output).unwrap_err();
    assert!(matches!(err, ProtoError::Codec(CodecError::UnexpectedEof)));
}
