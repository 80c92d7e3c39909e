// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Serial device setup.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use anyhow::Context;
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg};

/// Opens the CDC ACM device read/write, non-blocking, and puts the line in
/// raw mode so the tty layer doesn't chew on the packet stream.
pub fn open(path: &Path) -> anyhow::Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;

    let fd = file.as_raw_fd();
    let mut tios = tcgetattr(fd).context("tcgetattr")?;
    cfmakeraw(&mut tios);
    tcsetattr(fd, SetArg::TCSAFLUSH, &tios).context("tcsetattr")?;

    Ok(file)
}
