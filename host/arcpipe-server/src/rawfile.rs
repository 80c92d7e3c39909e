// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Channel 2: raw file access.
//!
//! The world's simplest host file service: open a file for reading, fetch
//! blocks by position, close. One file at most is open at a time; a new
//! open retires the previous one.
//!
//! Acorn metadata rides on the host filename, HostFS style. Opening `demo`
//! first looks for `demo,XXX` (three hex digits of filetype, from which
//! load/exec are derived together with the host mtime), then for
//! `demo,LLLLLLL-EEEEEEE` (literal load/exec addresses), and finally falls
//! back to the bare name with a default filetype of Data.

use std::fs::File;
use std::io::{self, ErrorKind};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use arcpipe_proto::attrs::{self, LoadExec};
use arcpipe_proto::rawfile::{
    InitReadResponse, ReadBlockRequest, OP_CLOSE, OP_INIT_READ, OP_READ_BLOCK,
};
use arcpipe_proto::{Channel, MAX_PAYLOAD};
use glob::{glob_with, MatchOptions};
use log::{debug, error, info, warn};
use zerocopy::{FromBytes, IntoBytes};

use crate::dispatch::TxQueue;

pub struct RawFile {
    file: Option<File>,
}

impl RawFile {
    pub fn new() -> Self {
        Self { file: None }
    }

    /// Closes anything left open. Runs on reconnect.
    pub fn reset(&mut self) {
        self.file = None;
    }

    pub fn handle(&mut self, payload: &[u8], tx: &mut TxQueue) {
        match payload.first() {
            Some(&OP_INIT_READ) => self.init_read(&payload[1..], tx),
            Some(&OP_READ_BLOCK) => self.read_block(payload, tx),
            Some(&OP_CLOSE) => {
                debug!("rawfile: close");
                self.file = None;
            }
            Some(&op) => warn!("rawfile: unknown opcode {op:#x}"),
            None => warn!("rawfile: empty request"),
        }
    }

    fn init_read(&mut self, name: &[u8], tx: &mut TxQueue) {
        self.file = None;

        let response = match self.open_read(name) {
            Ok((size, attrs)) => InitReadResponse::ok(size, attrs),
            Err(e) => {
                warn!("rawfile: open failed: {e}");
                let errno = e.raw_os_error().unwrap_or(libc::EIO);
                InitReadResponse::failed(errno as u16)
            }
        };
        tx.send(Channel::RawFile.cid(), response.as_bytes());
    }

    fn open_read(&mut self, name: &[u8]) -> io::Result<(u32, LoadExec)> {
        let nul = name.iter().position(|&b| b == 0).unwrap_or(name.len());
        let name = std::str::from_utf8(&name[..nul])
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        info!("rawfile: opening '{name}'");

        let (path, resolved) = resolve_metadata(name);
        let file = File::open(&path)?;
        let meta = file.metadata()?;

        let attrs = match resolved {
            Resolved::Typed(filetype) => {
                let mtime = meta
                    .modified()?
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                attrs::from_filetype(filetype, mtime)
            }
            Resolved::Explicit(le) => le,
            Resolved::Default => attrs::untyped(),
        };

        debug!(
            "rawfile: '{}' size {} load {:08x} exec {:08x}",
            path.display(),
            meta.len(),
            attrs.load,
            attrs.exec
        );
        let size = meta.len().min(u64::from(u32::MAX)) as u32;
        self.file = Some(file);
        Ok((size, attrs))
    }

    fn read_block(&mut self, payload: &[u8], tx: &mut TxQueue) {
        let req = match ReadBlockRequest::read_from_prefix(payload) {
            Ok((req, _)) => req,
            Err(_) => {
                warn!("rawfile: short read-block request");
                return;
            }
        };
        let size = req.size.get() as usize;
        if size > MAX_PAYLOAD {
            error!("rawfile: {size}-byte read exceeds the packet limit");
            return;
        }
        let file = match self.file.as_ref() {
            Some(f) => f,
            None => {
                warn!("rawfile: no file open, ignoring read");
                return;
            }
        };

        // The reply always carries exactly `size` bytes; whatever a short
        // read (EOF) doesn't cover stays zero.
        let mut buf = vec![0u8; size];
        let offset = u64::from(req.offset.get());
        let mut pos = 0;
        while pos < size {
            match file.read_at(&mut buf[pos..], offset + pos as u64) {
                Ok(0) => break,
                Ok(n) => pos += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("rawfile: read failed: {e}");
                    break;
                }
            }
        }
        tx.send(Channel::RawFile.cid(), &buf);
    }
}

enum Resolved {
    Typed(u16),
    Explicit(LoadExec),
    Default,
}

/// Finds the file backing `name` and the metadata encoded in its suffix.
fn resolve_metadata(name: &str) -> (PathBuf, Resolved) {
    let options = MatchOptions {
        case_sensitive: false,
        require_literal_separator: false,
        require_literal_leading_dot: false,
    };

    let typed = format!("{name},[0-9a-f][0-9a-f][0-9a-f]");
    if let Some(path) = first_match(&typed, options) {
        if let Some(filetype) = parse_type_suffix(&path) {
            return (path, Resolved::Typed(filetype));
        }
    }

    let explicit = format!("{name},[0-9a-f]*-[0-9a-f]*");
    if let Some(path) = first_match(&explicit, options) {
        if let Some(le) = parse_load_exec_suffix(&path) {
            return (path, Resolved::Explicit(le));
        }
    }

    (PathBuf::from(name), Resolved::Default)
}

fn first_match(pattern: &str, options: MatchOptions) -> Option<PathBuf> {
    let mut paths = glob_with(pattern, options).ok()?.flatten();
    let first = paths.next()?;
    if paths.next().is_some() {
        warn!(
            "rawfile: multiple matches for '{pattern}', using '{}'",
            first.display()
        );
    }
    Some(first)
}

/// `…,XXX` filetype suffix, already shape-checked by the glob.
fn parse_type_suffix(path: &Path) -> Option<u16> {
    let (_, suffix) = path.to_str()?.rsplit_once(',')?;
    u16::from_str_radix(suffix, 16).ok()
}

/// `…,LLLLLLL-EEEEEEE` suffix: one to seven hex digits each.
fn parse_load_exec_suffix(path: &Path) -> Option<LoadExec> {
    let (_, suffix) = path.to_str()?.rsplit_once(',')?;
    let (l, e) = suffix.split_once('-')?;
    if !(1..=7).contains(&l.len()) || !(1..=7).contains(&e.len()) {
        return None;
    }
    Some(LoadExec {
        load: u32::from_str_radix(l, 16).ok()?,
        exec: u32::from_str_radix(e, 16).ok()?,
    })
}
