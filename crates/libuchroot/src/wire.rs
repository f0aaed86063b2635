//! Byte-level codec for the request/reply protocol.
//!
//! Numbers travel as ASCII decimal, optionally preceded by `-`, terminated
//! by a single NUL byte. Strings travel as a number (their length) followed
//! by exactly that many raw bytes, so arbitrary byte sequences -- including
//! embedded NULs -- survive. A timespec is two numbers, seconds then
//! nanoseconds. The same encoding serves in-process dispatch and the
//! optional pipe protocol between a filesystem front-end and a remote
//! request executor.

use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::os::unix::ffi::{OsStrExt, OsStringExt};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    /// A read ran short in the middle of a message.
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// An instant with nanosecond precision, as passed to `utimensat(2)`.
/// `nsec` may also carry the `UTIME_NOW`/`UTIME_OMIT` markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: i64,
}

impl Timespec {
    pub const NOW: Timespec = Timespec { sec: 0, nsec: libc::UTIME_NOW };
    pub const OMIT: Timespec = Timespec { sec: 0, nsec: libc::UTIME_OMIT };

    pub fn new(sec: i64, nsec: i64) -> Timespec {
        Timespec { sec, nsec }
    }
}

fn read_byte<R: Read>(r: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    match r.read_exact(&mut buf) {
        Ok(()) => Ok(buf[0]),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(CodecError::UnexpectedEof),
        Err(e) => Err(e.into()),
    }
}

/// Reads the first byte of a message, reporting a clean end of stream as
/// `None`. EOF after at least one byte is still an error.
pub fn read_byte_or_eof<R: Read>(r: &mut R) -> Result<Option<u8>> {
    let mut buf = [0u8; 1];
    loop {
        match r.read(&mut buf) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(buf[0])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

pub fn write_i64<W: Write>(w: &mut W, value: i64) -> Result<()> {
    write!(w, "{value}")?;
    w.write_all(&[0])?;
    Ok(())
}

pub fn write_u64<W: Write>(w: &mut W, value: u64) -> Result<()> {
    write!(w, "{value}")?;
    w.write_all(&[0])?;
    Ok(())
}

/// Accumulates decimal digits until the NUL terminator. Wrapping arithmetic
/// mirrors the way two's-complement extremes round-trip: the digit string of
/// `i64::MIN` accumulates to exactly `i64::MIN` again before negation.
pub fn read_i64<R: Read>(r: &mut R) -> Result<i64> {
    let mut value: i64 = 0;
    let mut neg = false;
    loop {
        match read_byte(r)? {
            0 => break,
            b'-' => neg = true,
            c @ b'0'..=b'9' => {
                value = value.wrapping_mul(10).wrapping_add((c - b'0') as i64);
            }
            _ => {}
        }
    }
    Ok(if neg { value.wrapping_neg() } else { value })
}

pub fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut value: u64 = 0;
    loop {
        match read_byte(r)? {
            0 => break,
            c @ b'0'..=b'9' => {
                value = value.wrapping_mul(10).wrapping_add((c - b'0') as u64);
            }
            _ => {}
        }
    }
    Ok(value)
}

pub fn write_u32<W: Write>(w: &mut W, value: u32) -> Result<()> {
    write_u64(w, value as u64)
}

pub fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    Ok(read_u64(r)? as u32)
}

pub fn write_i32<W: Write>(w: &mut W, value: i32) -> Result<()> {
    write_i64(w, value as i64)
}

pub fn read_i32<R: Read>(r: &mut R) -> Result<i32> {
    Ok(read_i64(r)? as i32)
}

pub fn write_bytes<W: Write>(w: &mut W, bytes: &[u8]) -> Result<()> {
    write_u64(w, bytes.len() as u64)?;
    w.write_all(bytes)?;
    Ok(())
}

pub fn read_bytes<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let len = read_u64(r)? as usize;
    let mut buf = vec![0u8; len];
    match r.read_exact(&mut buf) {
        Ok(()) => Ok(buf),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(CodecError::UnexpectedEof),
        Err(e) => Err(e.into()),
    }
}

pub fn write_os_str<W: Write>(w: &mut W, s: &std::ffi::OsStr) -> Result<()> {
    write_bytes(w, s.as_bytes())
}

pub fn read_os_string<R: Read>(r: &mut R) -> Result<OsString> {
    Ok(OsString::from_vec(read_bytes(r)?))
}

pub fn write_timespec<W: Write>(w: &mut W, ts: Timespec) -> Result<()> {
    write_i64(w, ts.sec)?;
    write_i64(w, ts.nsec)
}

pub fn read_timespec<R: Read>(r: &mut R) -> Result<Timespec> {
    let sec = read_i64(r)?;
    let nsec = read_i64(r)?;
    Ok(Timespec { sec, nsec })
}
