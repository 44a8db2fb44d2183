//! Protocol version exchange, RFC 4253 4.2.
//!
//! The client sends its identification string immediately after the TCP
//! connection opens. The server may precede its own identification with
//! other lines; those are skipped. The identification line is
//! `SSH-protoversion-softwareversion SP comments CR LF`, at most 255 bytes
//! including the terminator.

#[allow(unused_imports)]
use {
    crate::error::{self, Error, Result},
    log::{debug, error, info, log, trace, warn},
};

use std::io::{Read, Write};

pub(crate) const CLIENT_VERSION: &str = concat!("SSH-2.0-halyard_", env!("CARGO_PKG_VERSION"));

/// Longest identification line, including CR LF.
const MAX_IDENT_LEN: usize = 255;
/// Lines to skip before giving up on finding an `SSH-` identification.
const MAX_PREAMBLE_LINES: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RemoteVersion {
    /// Full identification line, CR LF excluded. Hashed into the exchange
    /// hash verbatim.
    pub id: String,
    pub protoversion: u32,
    pub software: String,
}

pub(crate) fn send_version<W: Write>(w: &mut W) -> Result<()> {
    let line = format!("{CLIENT_VERSION}\r\n");
    debug_assert!(line.len() <= MAX_IDENT_LEN);
    w.write_all(line.as_bytes())?;
    w.flush()?;
    Ok(())
}

/// Reads lines until the server identification appears, then parses it.
pub(crate) fn recv_version<R: Read>(r: &mut R) -> Result<RemoteVersion> {
    for _ in 0..MAX_PREAMBLE_LINES {
        let line = read_line(r)?;
        if !line.starts_with(b"SSH-") {
            trace!("skipping preamble line of {} bytes", line.len());
            continue;
        }
        return parse_ident(&line);
    }
    error::Protocol { msg: "no identification line from server" }.fail()
}

/// Reads one LF-terminated line, LF excluded, CR retained.
fn read_line<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let mut line = Vec::new();
    loop {
        let mut b = [0u8; 1];
        r.read_exact(&mut b)?;
        if b[0] == b'\n' {
            return Ok(line);
        }
        line.push(b[0]);
        if line.len() >= MAX_IDENT_LEN {
            return error::Protocol { msg: "identification line too long" }.fail();
        }
    }
}

/// Parses `SSH-protoversion-softwareversion [SP comments]`, CR included at
/// the end of `line`.
fn parse_ident(line: &[u8]) -> Result<RemoteVersion> {
    let line = match line.split_last() {
        Some((&b'\r', rest)) => rest,
        _ => return error::Protocol { msg: "identification line missing CR" }.fail(),
    };
    let line = core::str::from_utf8(line)
        .map_err(|_| Error::Protocol { msg: "identification line not ASCII" })?;

    // only the part before any comment carries the dashes
    let ident = line.split(' ').next().unwrap_or("");
    let dashes: Vec<usize> =
        ident.char_indices().filter(|(_, c)| *c == '-').map(|(i, _)| i).collect();
    if dashes.len() != 2 {
        return error::Protocol { msg: "malformed identification line" }.fail();
    }
    let (d1, d2) = (dashes[0], dashes[1]);

    let protoversion = &ident[d1 + 1..d2];
    let software = &ident[d2 + 1..];
    if protoversion.is_empty() || software.is_empty() {
        return error::Protocol { msg: "malformed identification line" }.fail();
    }

    let major: u32 = protoversion
        .split('.')
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or(Error::Protocol { msg: "unparseable protocol version" })?;
    if major != 2 {
        warn!("server offered protocol version {protoversion}");
        return error::Protocol { msg: "server protocol version is not 2" }.fail();
    }

    debug!("server identification: {line}");
    Ok(RemoteVersion {
        id: line.to_string(),
        protoversion: major,
        software: software.to_string(),
    })
}
