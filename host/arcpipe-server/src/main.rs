// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side server for the ArcPipe podule.
//!
//! Opens the podule's USB CDC device in raw non-blocking mode, reframes the
//! packet stream, and services channel requests (host identification and raw
//! file access) on behalf of the Archimedes. Single-threaded; everything
//! hangs off one `poll(2)` on the serial fd.
//!
//! The device disappearing (unplug, firmware reboot) is routine: the serial
//! fd is closed, channel state is reset, and we retry the open once a second
//! forever.

use std::fs::File;
use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};

mod device;
mod dispatch;
mod hexdump;
mod hostinfo;
mod rawfile;

use dispatch::Dispatcher;

/// Serves file and host-info requests to an ArcPipe podule over its USB CDC
/// link.
#[derive(Parser)]
#[clap(name = "arcpipe-server")]
struct Args {
    /// Path to the podule's CDC ACM device.
    #[clap(long, default_value = "/dev/ttyACM0")]
    device: PathBuf,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut dispatcher = Dispatcher::new();
    loop {
        info!("opening {}", args.device.display());
        let file = match device::open(&args.device) {
            Ok(f) => f,
            Err(e) => {
                warn!("can't open device: {e:#}");
                thread::sleep(Duration::from_secs(1));
                continue;
            }
        };

        // Anything left over from the previous connection (an open file, a
        // half-framed packet) is meaningless now.
        dispatcher.reset();

        info!("serving");
        service_loop(&file, &mut dispatcher)
            .context("service loop failed")?;
        info!("device hung up, reconnecting");
        thread::sleep(Duration::from_secs(1));
    }
}

/// Pumps the connection until the device hangs up (returns `Ok`) or an
/// unexpected I/O error occurs.
fn service_loop(file: &File, dispatcher: &mut Dispatcher) -> anyhow::Result<()> {
    let mut buf = [0u8; 4096];

    loop {
        // While output is pending we stop taking input (more input mostly
        // means more output) and instead wait for the fd to accept writes.
        let events = if dispatcher.tx_idle() {
            PollFlags::POLLIN
        } else {
            PollFlags::POLLOUT
        };

        let mut fds = [PollFd::new(file.as_raw_fd(), events)];
        match poll(&mut fds, -1) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e).context("poll"),
        }
        let revents = fds[0].revents().unwrap_or_else(PollFlags::empty);

        if revents
            .intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL)
        {
            return Ok(());
        }

        if revents.contains(PollFlags::POLLIN) && dispatcher.tx_idle() {
            if !drain_input(file, &mut buf, dispatcher)? {
                return Ok(());
            }
        }

        let mut writer = file;
        dispatcher.pump_tx(&mut writer)?;
    }
}

/// Non-blocking reads until the fd runs dry or the dispatcher queues output.
/// Returns false on EOF (treated like a hangup).
fn drain_input(
    file: &File,
    buf: &mut [u8],
    dispatcher: &mut Dispatcher,
) -> anyhow::Result<bool> {
    let mut reader = file;
    loop {
        match reader.read(buf) {
            Ok(0) => return Ok(false),
            Ok(n) => {
                debug!("read {n} bytes");
                dispatcher.ingest(&buf[..n]);
                if !dispatcher.tx_idle() {
                    return Ok(true);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                return Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("read"),
        }
    }
}
