// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pipe engine: moves framed packets between the shared window's descriptor
//! rings and the USB CDC byte stream.
//!
//! This runs on the main core, cooperatively, from the firmware's top-level
//! loop: USB device task, then [`PipeEngine::poll`]. One poll does a bounded
//! amount of work and never blocks; when the USB FIFOs fill up or the RX
//! ring backs up, progress simply resumes on a later poll.
//!
//! The external side queues outbound packets by writing a payload into the
//! TX buffer region and then a descriptor with READY set; we stream them out
//! the CDC endpoint, one in flight at a time. Inbound, we reassemble the
//! length-prefixed frames from whatever chunk sizes CDC hands us and publish
//! each completed payload to the RX ring. The RX side deliberately keeps a
//! single descriptor outstanding: payloads always land at offset 0 of the
//! RX buffer region, and a new one is only published after the external
//! consumer has cleared the previous descriptor. Widening that would mean
//! allocating within the payload region; the backpressure this produces is
//! the intended flow control.
//!
//! The engine also owns the two window mailboxes that aren't packet traffic:
//! the ROM page selector and the soft-reset generation counter.

#![cfg_attr(not(test), no_std)]

use arcpipe_proto::{PacketHeader, HDR_SIZE, MAX_FRAME, MAX_PAYLOAD};
use arcpipe_regs::{
    Descriptor, SharedWindow, BUFFER_SIZE, LOADER_BASE, LOADER_SIZE,
    PAGE_LOAD_PENDING, REGS_BASE, REGS_SIZE, REG_PAGE_H, REG_PAGE_L,
    REG_RESET, RING_DEPTH, ROM_PAGE_SIZE, ROM_WINDOW_BASE, RX_BUFFER_BASE,
    TX_BUFFER_BASE,
};
use tracebuf::{trace, TraceBuf};

/// The USB CDC endpoint, as the engine sees it. Mirrors the device stack's
/// non-blocking FIFO surface: reads and writes move as many bytes as the
/// FIFOs allow right now and return the count.
pub trait CdcLink {
    /// A host terminal is connected (DTR asserted).
    fn connected(&self) -> bool;

    /// Bytes waiting in the receive FIFO.
    fn available(&self) -> usize;

    /// Drains up to `buf.len()` bytes from the receive FIFO.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Pushes up to `buf.len()` bytes into the transmit FIFO, returning how
    /// many were accepted.
    fn write(&mut self, buf: &[u8]) -> usize;

    /// Kicks the transmit FIFO.
    fn flush(&mut self);
}

/// Diagnostic events, recorded into the engine's trace ring.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Trace {
    None,
    PageLoad(u16),
    PageOutOfRange(u16),
    PipeReset(u8),
    Disconnected,
    TxStart { cid: u8, len: u16 },
    TxDone,
    /// Descriptor payload ran off the end of the TX buffer region; consumed
    /// without transmitting.
    TxOverrun { addr: u16, len: u16 },
    /// READY descriptor consumed while disconnected.
    TxDrained,
    /// In-flight transmission abandoned on disconnect.
    TxAbandoned,
    RxPacket { cid: u8, len: u16 },
    /// RX ring full; CDC reads paused until the consumer catches up.
    RxStalled,
    /// Inbound frame declared a payload larger than a descriptor can carry;
    /// its bytes are consumed and dropped.
    RxOversize { len: u16 },
}

/// Number of trace entries kept.
const TRACE_DEPTH: usize = 64;

pub struct PipeEngine<'a> {
    window: &'a SharedWindow,
    /// Master ROM image paged into the window 1 KiB at a time.
    rom: &'a [u8],

    // Outbound (window -> USB). At most one packet is in flight; while
    // `tx_ongoing` the descriptor at TX_TAIL stays READY and untouched.
    tx_ongoing: bool,
    tx_total: usize,
    tx_pos: usize,
    tx_buf: [u8; MAX_FRAME],

    // Inbound (USB -> window). `rx_buf` assembles one frame across reads;
    // `rx_discard` counts bytes of an oversize frame still to be thrown
    // away.
    rx_total: usize,
    rx_pos: usize,
    rx_discard: usize,
    rx_packet_pending: bool,
    rx_last_descr: usize,
    rx_buf: [u8; MAX_FRAME],

    reset_generation: u8,
    last_connected: bool,

    trace: TraceBuf<Trace, TRACE_DEPTH>,
}

impl<'a> PipeEngine<'a> {
    pub fn new(window: &'a SharedWindow, rom: &'a [u8]) -> Self {
        Self {
            window,
            rom,
            tx_ongoing: false,
            tx_total: 0,
            tx_pos: 0,
            tx_buf: [0; MAX_FRAME],
            rx_total: 0,
            rx_pos: 0,
            rx_discard: 0,
            rx_packet_pending: false,
            rx_last_descr: 0,
            rx_buf: [0; MAX_FRAME],
            reset_generation: 0,
            last_connected: false,
            trace: TraceBuf::new(Trace::None),
        }
    }

    /// One-time window setup: loader blob into the first KiB, ROM page 0
    /// into the window, register space zeroed, rings and private state
    /// reset.
    pub fn init_window(&mut self, loader: &[u8]) {
        self.window.zero(LOADER_BASE, LOADER_SIZE);
        let n = loader.len().min(LOADER_SIZE);
        self.window.fill(LOADER_BASE, &loader[..n]);

        self.load_rom_page(0);

        self.window.zero(REGS_BASE, REGS_SIZE);
        self.pipe_reset();
        self.reset_generation = 0;
    }

    /// Resets the packet pipe: both descriptor rings zeroed, ring indices
    /// back to 0, any partial transfer forgotten. Runs at startup and on
    /// each soft-reset request from the external side.
    pub fn pipe_reset(&mut self) {
        self.window.reset_rings();

        self.tx_ongoing = false;
        self.tx_pos = 0;
        self.rx_pos = 0;
        self.rx_discard = 0;
        self.rx_last_descr = 0;
        self.rx_packet_pending = false;
    }

    /// Copies `page` of the master ROM image into the window. Returns false
    /// (and leaves the window alone) if the page starts past the end of the
    /// image; a partial final page is zero-padded.
    fn load_rom_page(&mut self, page: u16) -> bool {
        let offset = usize::from(page) * ROM_PAGE_SIZE;
        if offset >= self.rom.len() {
            return false;
        }
        let end = self.rom.len().min(offset + ROM_PAGE_SIZE);
        let chunk = &self.rom[offset..end];
        self.window.fill(ROM_WINDOW_BASE, chunk);
        self.window
            .zero(ROM_WINDOW_BASE + chunk.len(), ROM_PAGE_SIZE - chunk.len());
        true
    }

    /// One iteration of pipe service: ROM page request, reset request, then
    /// RX and TX packet work.
    pub fn poll(&mut self, link: &mut impl CdcLink) {
        // ROM page mailbox: bit 7 of PAGE_H is the handshake. We clear it
        // whether or not the page was valid, so the requester never hangs.
        let page_h = self.window.reg_read(REG_PAGE_H);
        if page_h & PAGE_LOAD_PENDING != 0 {
            let page = (u16::from(page_h & 0x7f) << 8)
                | u16::from(self.window.reg_read(REG_PAGE_L));
            if self.load_rom_page(page) {
                trace!(self.trace, Trace::PageLoad(page));
            } else {
                trace!(self.trace, Trace::PageOutOfRange(page));
            }
            self.window
                .reg_write(REG_PAGE_H, page_h & !PAGE_LOAD_PENDING);
        }

        // Soft reset: the external side bumps a generation counter.
        let generation = self.window.reg_read(REG_RESET);
        if generation != self.reset_generation {
            self.pipe_reset();
            self.reset_generation = generation;
            trace!(self.trace, Trace::PipeReset(generation));
        }

        let connected = link.connected();
        if !connected && self.last_connected {
            trace!(self.trace, Trace::Disconnected);
        }
        self.last_connected = connected;

        // Receive.
        if (connected && link.available() > 0) || self.rx_packet_pending {
            self.rx_service(link);
        }

        // Transmit.
        if self.tx_ongoing {
            if connected {
                self.tx_continue(link);
            } else {
                // Packet abandoned. The descriptor is still READY, so it
                // will be retransmitted from scratch or drained below.
                self.tx_ongoing = false;
                trace!(self.trace, Trace::TxAbandoned);
            }
        } else {
            let tail = self.window.tx_tail();
            let descr = self.window.tx_descriptor(tail);
            if descr.ready() {
                if connected {
                    self.tx_start(link, descr);
                } else {
                    // No link to send it on; consume immediately so the
                    // ring can't back up while unplugged.
                    self.tx_done();
                    trace!(self.trace, Trace::TxDrained);
                }
            }
        }
    }

    /// Consumes the descriptor at TX_TAIL: clears READY, advances the tail.
    fn tx_done(&mut self) {
        let tail = self.window.tx_tail();
        self.window.retire_tx_descriptor(tail);
        self.window.set_tx_tail((tail + 1) & (RING_DEPTH - 1));
    }

    fn tx_start(&mut self, link: &mut impl CdcLink, descr: Descriptor) {
        if descr.check_bounds().is_err() {
            trace!(
                self.trace,
                Trace::TxOverrun {
                    addr: descr.addr(),
                    len: descr.size(),
                }
            );
            self.tx_done();
            return;
        }

        let cid = descr.cid();
        let len = usize::from(descr.size());

        // The header has to precede the payload on the wire, and the FIFO
        // may accept as little as one byte per attempt. Assembling header
        // and payload into one staging buffer keeps the continuation logic
        // to a single cursor.
        self.tx_buf[..HDR_SIZE]
            .copy_from_slice(&PacketHeader::new(cid, descr.size()).encode());
        self.window.read_into(
            REGS_BASE + TX_BUFFER_BASE + usize::from(descr.addr()),
            &mut self.tx_buf[HDR_SIZE..HDR_SIZE + len],
        );
        self.tx_total = HDR_SIZE + len;
        trace!(
            self.trace,
            Trace::TxStart {
                cid,
                len: descr.size(),
            }
        );

        let written = link.write(&self.tx_buf[..self.tx_total]);
        link.flush();

        if written == self.tx_total {
            self.tx_ongoing = false;
            self.tx_done();
            trace!(self.trace, Trace::TxDone);
        } else {
            // The descriptor stays READY until the last byte is accepted;
            // `tx_ongoing` is what stops us re-starting it meanwhile.
            self.tx_ongoing = true;
            self.tx_pos = written;
        }
    }

    fn tx_continue(&mut self, link: &mut impl CdcLink) {
        let written = link.write(&self.tx_buf[self.tx_pos..self.tx_total]);
        link.flush();

        self.tx_pos += written;
        if self.tx_pos >= self.tx_total {
            self.tx_ongoing = false;
            self.tx_done();
            trace!(self.trace, Trace::TxDone);
        }
    }

    /// Inbound frame assembly and delivery.
    fn rx_service(&mut self, link: &mut impl CdcLink) {
        // Finish throwing away an oversize frame before touching the
        // assembly buffer again.
        if self.rx_discard > 0 {
            let n = self.rx_discard.min(self.rx_buf.len());
            let got = link.read(&mut self.rx_buf[..n]);
            self.rx_discard -= got;
            return;
        }

        // If a completed packet is stalled on a full ring, don't read more;
        // unread bytes pile up in the USB FIFO and the backpressure reaches
        // the host.
        if !self.rx_packet_pending {
            let got = link.read(&mut self.rx_buf[self.rx_pos..]);
            self.rx_pos += got;
        }

        // Deliver every complete frame sitting in the buffer. Re-entering
        // after a delivery matters: two frames can arrive in one read.
        while self.rx_pos >= HDR_SIZE {
            let header = match PacketHeader::decode(&self.rx_buf) {
                Some(h) => h,
                None => break,
            };
            let len = usize::from(header.size);
            self.rx_total = header.frame_len();

            if len > MAX_PAYLOAD {
                trace!(self.trace, Trace::RxOversize { len: header.size });
                // Everything buffered so far belongs to this frame (it
                // can't fit in the buffer, so no later frame can have
                // started). Swallow the rest from the stream.
                self.rx_discard = self.rx_total - self.rx_pos;
                self.rx_pos = 0;
                self.rx_packet_pending = false;
                return;
            }

            if self.rx_pos < self.rx_total {
                break;
            }

            if !self.rx_publish(header.cid, len) {
                self.rx_packet_pending = true;
                trace!(self.trace, Trace::RxStalled);
                return;
            }
            self.rx_packet_pending = false;
            trace!(
                self.trace,
                Trace::RxPacket {
                    cid: header.cid,
                    len: header.size,
                }
            );

            if self.rx_pos > self.rx_total {
                // Part of the next frame came along; shuffle it down and
                // go around again.
                let excess = self.rx_pos - self.rx_total;
                self.rx_buf.copy_within(self.rx_total..self.rx_pos, 0);
                self.rx_pos = excess;
            } else {
                self.rx_pos = 0;
            }
        }
    }

    /// Publishes the assembled payload to the RX ring. Returns false if the
    /// ring can't take it yet.
    fn rx_publish(&mut self, cid: u8, len: usize) -> bool {
        // Single outstanding RX buffer: the payload region offset is always
        // 0, so the previous descriptor must be consumed before its bytes
        // can be overwritten.
        if self.window.rx_descriptor(self.rx_last_descr).ready() {
            return false;
        }

        if len > BUFFER_SIZE {
            // Unreachable via frame assembly, which discards oversize
            // frames before they get here. Accept-and-drop keeps the state
            // machine moving if it ever does.
            trace!(self.trace, Trace::RxOversize { len: len as u16 });
            return true;
        }

        let head = self.window.rx_head();
        self.window.fill(
            REGS_BASE + RX_BUFFER_BASE,
            &self.rx_buf[HDR_SIZE..HDR_SIZE + len],
        );
        self.window
            .publish_rx_descriptor(head, Descriptor::new(cid, len as u16, 0));

        self.rx_last_descr = head;
        self.window.set_rx_head((head + 1) & (RING_DEPTH - 1));
        true
    }

    /// The trace ring, for tests and debugger inspection.
    pub fn trace_entries(&self) -> &TraceBuf<Trace, TRACE_DEPTH> {
        &self.trace
    }
}
