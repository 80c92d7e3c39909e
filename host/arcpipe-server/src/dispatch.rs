// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Packet framing and channel dispatch.
//!
//! Inbound bytes append to a 4 KiB buffer; every complete frame is handed to
//! its channel handler and the remainder shuffled down. The framing loop
//! must re-enter itself after each dispatch, since one read commonly carries
//! several frames.
//!
//! Outbound packets go through a small bounded queue. One frame is "active"
//! and drains through non-blocking writes; while anything is queued the
//! caller stops feeding us input, which keeps request/response traffic from
//! ballooning the queue.

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Write};

use arcpipe_proto::{Channel, PacketHeader, HDR_SIZE, MAX_PAYLOAD};
use log::{error, log_enabled, trace, warn};

use crate::hexdump::hexdump;
use crate::hostinfo;
use crate::rawfile::RawFile;

/// Inbound reassembly buffer size. Frames from the podule are at most 515
/// bytes, so this is generous; anything bigger is stream corruption.
pub const RX_BUF_SIZE: usize = 4096;

/// Outbound packets that may wait behind the active one.
pub const TX_QUEUE_DEPTH: usize = 8;

/// Bounded outbound packet queue.
pub struct TxQueue {
    active: Option<Vec<u8>>,
    pos: usize,
    pending: VecDeque<Vec<u8>>,
}

impl TxQueue {
    pub(crate) fn new() -> Self {
        Self {
            active: None,
            pos: 0,
            pending: VecDeque::new(),
        }
    }

    /// Frames `payload` for `cid` and queues it. A full queue drops the
    /// packet with an error log; handlers produce at most one response per
    /// request, so hitting the bound means the pause-input rule is broken
    /// somewhere.
    pub fn send(&mut self, cid: u8, payload: &[u8]) {
        if payload.len() > MAX_PAYLOAD {
            error!(
                "TX packet for CID{cid} is {} bytes, over the {MAX_PAYLOAD} limit; dropping",
                payload.len()
            );
            return;
        }
        let mut frame =
            PacketHeader::new(cid, payload.len() as u16).encode().to_vec();
        frame.extend_from_slice(payload);

        if self.active.is_none() {
            self.active = Some(frame);
            self.pos = 0;
        } else if self.pending.len() < TX_QUEUE_DEPTH {
            self.pending.push_back(frame);
        } else {
            error!("TX queue full; dropping CID{cid} packet");
        }
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_none()
    }

    /// Pushes queued bytes through `writer` until it would block or the
    /// queue empties.
    pub fn pump(&mut self, writer: &mut impl Write) -> io::Result<()> {
        while let Some(frame) = self.active.as_ref() {
            match writer.write(&frame[self.pos..]) {
                Ok(0) => return Ok(()),
                Ok(n) => {
                    self.pos += n;
                    if self.pos == frame.len() {
                        trace!("TX of {} bytes complete", frame.len());
                        self.active = self.pending.pop_front();
                        self.pos = 0;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.active = None;
        self.pos = 0;
        self.pending.clear();
    }
}

/// The per-connection state: framing buffer, outbound queue, channel
/// handlers.
pub struct Dispatcher {
    rx_buf: [u8; RX_BUF_SIZE],
    rx_pos: usize,
    /// Bytes of an impossibly-large frame still to swallow from the stream.
    rx_discard: usize,
    tx: TxQueue,
    rawfile: RawFile,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            rx_buf: [0; RX_BUF_SIZE],
            rx_pos: 0,
            rx_discard: 0,
            tx: TxQueue::new(),
            rawfile: RawFile::new(),
        }
    }

    /// Forgets all connection state. Runs on every reconnect, so a file
    /// left open by a vanished client doesn't stay open forever.
    pub fn reset(&mut self) {
        self.rx_pos = 0;
        self.rx_discard = 0;
        self.tx.clear();
        self.rawfile.reset();
    }

    pub fn tx_idle(&self) -> bool {
        self.tx.is_idle()
    }

    pub fn pump_tx(&mut self, writer: &mut impl Write) -> io::Result<()> {
        self.tx.pump(writer)
    }

    /// Appends `bytes` to the framing buffer and dispatches every complete
    /// packet they finish.
    pub fn ingest(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            if self.rx_discard > 0 {
                let n = self.rx_discard.min(bytes.len());
                self.rx_discard -= n;
                bytes = &bytes[n..];
                continue;
            }

            let space = RX_BUF_SIZE - self.rx_pos;
            let n = bytes.len().min(space);
            self.rx_buf[self.rx_pos..self.rx_pos + n]
                .copy_from_slice(&bytes[..n]);
            self.rx_pos += n;
            bytes = &bytes[n..];

            self.process_frames();
        }
    }

    fn process_frames(&mut self) {
        while self.rx_pos >= HDR_SIZE {
            let header = match PacketHeader::decode(&self.rx_buf) {
                Some(h) => h,
                None => break,
            };
            let total = header.frame_len();

            if total > RX_BUF_SIZE {
                error!(
                    "frame for CID{} declares {} payload bytes; dropping",
                    header.cid, header.size
                );
                self.rx_discard = total - self.rx_pos;
                self.rx_pos = 0;
                return;
            }

            if self.rx_pos < total {
                break;
            }

            let payload = &self.rx_buf[HDR_SIZE..total];
            if log_enabled!(log::Level::Trace) {
                trace!(
                    "packet CID{} len {}\n{}",
                    header.cid,
                    header.size,
                    hexdump(payload)
                );
            }

            match Channel::from_cid(header.cid) {
                Some(Channel::Ignore) => {}
                Some(Channel::HostInfo) => {
                    hostinfo::handle(payload, &mut self.tx)
                }
                Some(Channel::RawFile) => {
                    self.rawfile.handle(payload, &mut self.tx)
                }
                None => warn!("packet for unknown CID{}", header.cid),
            }

            if self.rx_pos > total {
                let excess = self.rx_pos - total;
                self.rx_buf.copy_within(total..self.rx_pos, 0);
                self.rx_pos = excess;
            } else {
                self.rx_pos = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arcpipe_proto::hostinfo::PRODUCT;

    fn frame(cid: u8, payload: &[u8]) -> Vec<u8> {
        let mut f =
            PacketHeader::new(cid, payload.len() as u16).encode().to_vec();
        f.extend_from_slice(payload);
        f
    }

    /// Drains the outbound queue completely (a `Vec` never blocks).
    fn drain(d: &mut Dispatcher) -> Vec<u8> {
        let mut out = Vec::new();
        d.pump_tx(&mut out).unwrap();
        out
    }

    #[test]
    fn hostinfo_query_round_trip() {
        let mut d = Dispatcher::new();
        d.ingest(&frame(1, &[0x00]));

        assert!(!d.tx_idle());
        let out = drain(&mut d);
        assert_eq!(out.len(), 3 + 36);
        assert_eq!(&out[..3], &[1, 36, 0]);
        assert_eq!(&out[3..7], &[1, 0, 0, 0]);
        assert_eq!(&out[7..7 + PRODUCT.len()], PRODUCT);
        assert!(out[7 + PRODUCT.len()..].iter().all(|&b| b == 0));
        assert!(d.tx_idle());
    }

    #[test]
    fn frame_split_across_reads() {
        let mut d = Dispatcher::new();
        let bytes = frame(1, &[0x00]);
        for b in bytes {
            d.ingest(&[b]);
        }
        assert_eq!(drain(&mut d).len(), 39);
    }

    #[test]
    fn two_frames_in_one_read_both_dispatch() {
        let mut d = Dispatcher::new();
        let mut bytes = frame(1, &[0x00]);
        bytes.extend_from_slice(&frame(0, b"padding"));
        bytes.extend_from_slice(&frame(1, &[0x00]));
        d.ingest(&bytes);

        // Two hostinfo responses; the IGNORE frame produced nothing.
        let out = drain(&mut d);
        assert_eq!(out.len(), 39 * 2);
        assert_eq!(&out[..3], &[1, 36, 0]);
        assert_eq!(&out[39..42], &[1, 36, 0]);
    }

    #[test]
    fn ignored_and_unknown_channels_produce_nothing() {
        let mut d = Dispatcher::new();
        d.ingest(&frame(0, &[1, 2, 3]));
        d.ingest(&frame(99, &[0x00]));
        assert!(d.tx_idle());
        assert!(drain(&mut d).is_empty());
    }

    #[test]
    fn oversized_frame_is_discarded_and_stream_recovers() {
        let mut d = Dispatcher::new();

        // A frame bigger than the reassembly buffer, followed by a valid
        // query in the same byte run.
        let mut bytes =
            PacketHeader::new(7, (RX_BUF_SIZE) as u16).encode().to_vec();
        bytes.extend_from_slice(&vec![0xEE; RX_BUF_SIZE]);
        bytes.extend_from_slice(&frame(1, &[0x00]));
        d.ingest(&bytes);

        let out = drain(&mut d);
        assert_eq!(out.len(), 39);
        assert_eq!(out[0], 1);
    }

    #[test]
    fn tx_queue_bounds() {
        let mut q = TxQueue::new();
        for i in 0..12u8 {
            q.send(1, &[i]);
        }
        // One active plus TX_QUEUE_DEPTH pending survive; the rest dropped.
        let mut out = Vec::new();
        q.pump(&mut out).unwrap();
        assert_eq!(out.len(), 4 * (1 + TX_QUEUE_DEPTH));
        assert_eq!(out[3], 0);
        assert_eq!(out[7], 1);
    }

    #[test]
    fn tx_pump_handles_partial_writes() {
        // Writer that takes three bytes per call.
        struct Trickle(Vec<u8>, usize);
        impl Write for Trickle {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                if self.1 == 0 {
                    self.1 = 3;
                    return Err(ErrorKind::WouldBlock.into());
                }
                let n = buf.len().min(self.1);
                self.1 -= n;
                self.0.extend_from_slice(&buf[..n]);
                Ok(n)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut q = TxQueue::new();
        q.send(2, b"hello world");
        let mut w = Trickle(Vec::new(), 3);
        while !q.is_idle() {
            q.pump(&mut w).unwrap();
        }
        assert_eq!(w.0, frame(2, b"hello world"));
    }

    #[test]
    fn oversize_payload_is_refused() {
        let mut q = TxQueue::new();
        q.send(1, &[0; MAX_PAYLOAD + 1]);
        assert!(q.is_idle());
    }

    #[test]
    fn reset_clears_everything() {
        let mut d = Dispatcher::new();
        d.ingest(&frame(1, &[0x00]));
        assert!(!d.tx_idle());
        // A partial frame too.
        d.ingest(&[2, 200]);

        d.reset();
        assert!(d.tx_idle());
        // The partial frame's tail must not be interpreted as a header.
        d.ingest(&frame(1, &[0x00]));
        assert_eq!(drain(&mut d).len(), 39);
    }
}
