// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bus-cycle bridge: services the Archimedes' asynchronous 8-bit read/write
//! cycles against the shared 4 KiB window.
//!
//! This is the latency-critical half of the firmware. Synchronous bus cycles
//! give us under 200 ns from /RD asserting to data needing to be valid on
//! the pins (with at least 50 ns of setup before the strobe rises), so the
//! path from [`BusPort::sample`] to [`BusPort::drive_data`] has to stay
//! within about a dozen instructions. The platform glue that hosts
//! [`BusBridge::run`] owns the other half of that contract: the loop must
//! run on a dedicated core, with interrupts masked, out of uncached RAM
//! rather than execute-in-place flash.
//!
//! The bridge shares exactly one thing with the rest of the firmware, the
//! [`SharedWindow`]; it takes no locks and never allocates. Writes from the
//! bus land only in the register region; the loader and ROM window are
//! read-only from outside.

#![cfg_attr(not(test), no_std)]

use arcpipe_regs::{SharedWindow, REGS_BASE};

// GPIO assignments for the V1 card. The twelve address lines arrive split
// across two contiguous pin groups, a routing concession on the PCB, and are
// reassembled by `bus_addr`.

pub const PIN_D0: u32 = 0; // D0..D7 on GPIO 0..7
pub const PIN_NSEL: u32 = 8;
pub const PIN_HIRQ: u32 = 9;
pub const PIN_HRST: u32 = 10;
pub const PIN_NRD: u32 = 11;
pub const PIN_NWR: u32 = 12;
pub const PIN_A2: u32 = 13; // A2..A4 on GPIO 13..15
pub const PIN_NRST: u32 = 16;
pub const PIN_A5: u32 = 17; // A5..A13 on GPIO 17..25

/// Mask of the eight data pins within a sample word.
pub const DATA_MASK: u32 = 0xff << PIN_D0;

/// Reassembles the canonical 12-bit window address from a sample word.
#[inline(always)]
pub fn bus_addr(sample: u32) -> usize {
    let lo = (sample >> PIN_A2) & 0x7;
    let hi = (sample >> PIN_A5) & 0x1ff;
    (lo | (hi << 3)) as usize
}

/// Extracts the data byte from a sample word.
#[inline(always)]
pub fn bus_data(sample: u32) -> u8 {
    ((sample & DATA_MASK) >> PIN_D0) as u8
}

/// A read cycle is in progress: /SEL and /RD both low.
#[inline(always)]
pub fn is_read(sample: u32) -> bool {
    sample & ((1 << PIN_NSEL) | (1 << PIN_NRD)) == 0
}

/// A write cycle is in progress: /SEL and /WR both low.
#[inline(always)]
pub fn is_write(sample: u32) -> bool {
    sample & ((1 << PIN_NSEL) | (1 << PIN_NWR)) == 0
}

/// The card is selected.
#[inline(always)]
pub fn is_selected(sample: u32) -> bool {
    sample & (1 << PIN_NSEL) == 0
}

/// The GPIO block, from the bridge's point of view.
///
/// One implementation drives real pins; tests script a sequence of sample
/// words. Implementations must keep `sample` and `drive_data` cheap, since
/// they sit inside the timing budget described at the crate root.
pub trait BusPort {
    /// Reads every pin in one access.
    fn sample(&mut self) -> u32;

    /// Presents `data` on D0..D7 and turns the data pins around to outputs,
    /// levels first so the bus never sees a glitch.
    fn drive_data(&mut self, data: u8);

    /// Returns D0..D7 to inputs and clears the output latch.
    fn release_data(&mut self);

    /// Drives the IRQ line to the host.
    fn set_irq(&mut self, asserted: bool);

    /// Drives the reset line to the host.
    fn set_host_reset(&mut self, asserted: bool);
}

/// One completed bus cycle, as observed by [`BusBridge::service`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Cycle {
    Read { addr: u16, data: u8 },
    Write { addr: u16, data: u8 },
}

/// Diagnostic counters. Maintained outside the read fast path's
/// strobe-to-data window, so they cost nothing that matters; they are not
/// part of the bus contract.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub reads: u32,
    pub writes: u32,
    pub last_read_addr: u16,
    pub last_read_data: u8,
    pub last_write_addr: u16,
    pub last_write_data: u8,
}

/// The bridge state machine.
pub struct BusBridge<'w, P: BusPort> {
    port: P,
    window: &'w SharedWindow,
    stats: BridgeStats,
}

impl<'w, P: BusPort> BusBridge<'w, P> {
    /// Takes ownership of the port with the data pins released and both
    /// host-facing control outputs deasserted.
    pub fn new(mut port: P, window: &'w SharedWindow) -> Self {
        port.set_irq(false);
        port.set_host_reset(false);
        port.release_data();
        Self {
            port,
            window,
            stats: BridgeStats::default(),
        }
    }

    /// Services at most one bus cycle and returns what happened.
    ///
    /// A sample showing both strobes low resolves as a read. There is no
    /// timeout: a strobe that never deasserts holds us here, which is the
    /// correct response to the hardware contract.
    #[inline]
    pub fn service(&mut self) -> Option<Cycle> {
        let io = self.port.sample();

        if is_read(io) {
            let addr = bus_addr(io);
            let data = self.window.read(addr);
            self.port.drive_data(data);

            // Hold the byte through the rest of the cycle; /SEL rules, so
            // data stays valid after /RD rises.
            while is_selected(self.port.sample()) {}
            self.port.release_data();

            self.stats.reads = self.stats.reads.wrapping_add(1);
            self.stats.last_read_addr = addr as u16;
            self.stats.last_read_data = data;
            Some(Cycle::Read {
                addr: addr as u16,
                data,
            })
        } else if is_write(io) {
            let addr = bus_addr(io);
            // Resample for the data byte; it settles later than the strobe.
            let io = self.port.sample();
            let data = bus_data(io);

            if addr >= REGS_BASE {
                self.window.write(addr, data);
            }

            while is_write(self.port.sample()) {}

            self.stats.writes = self.stats.writes.wrapping_add(1);
            self.stats.last_write_addr = addr as u16;
            self.stats.last_write_data = data;
            Some(Cycle::Write {
                addr: addr as u16,
                data,
            })
        } else {
            None
        }
    }

    /// The dedicated-core loop. Never returns; see the crate root for the
    /// obligations (core affinity, interrupts, RAM residence) the caller
    /// must satisfy before entering.
    pub fn run(&mut self) -> ! {
        loop {
            self.service();
        }
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    /// Access to the host-facing control outputs.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted port: pops one sample per `sample()` call and repeats the
    /// final one forever, recording everything driven at the pins.
    struct FakePort {
        samples: VecDeque<u32>,
        last: u32,
        driven: Vec<u8>,
        outputs_enabled: bool,
        irq: bool,
        host_reset: bool,
    }

    impl FakePort {
        fn new(samples: Vec<u32>) -> Self {
            Self {
                samples: samples.into(),
                last: IDLE,
                driven: Vec::new(),
                outputs_enabled: false,
                irq: false,
                host_reset: false,
            }
        }
    }

    impl BusPort for FakePort {
        fn sample(&mut self) -> u32 {
            if let Some(s) = self.samples.pop_front() {
                self.last = s;
            }
            self.last
        }

        fn drive_data(&mut self, data: u8) {
            self.driven.push(data);
            self.outputs_enabled = true;
        }

        fn release_data(&mut self) {
            self.outputs_enabled = false;
        }

        fn set_irq(&mut self, asserted: bool) {
            self.irq = asserted;
        }

        fn set_host_reset(&mut self, asserted: bool) {
            self.host_reset = asserted;
        }
    }

    /// All strobes deasserted (they're active low).
    const IDLE: u32 =
        (1 << PIN_NSEL) | (1 << PIN_NRD) | (1 << PIN_NWR) | (1 << PIN_NRST);

    /// Builds a sample word with `addr` scattered across the two address
    /// pin groups and the given strobes pulled low.
    fn sample_word(addr: usize, data: u8, rd: bool, wr: bool) -> u32 {
        let mut s = IDLE | (u32::from(data) << PIN_D0);
        s |= ((addr as u32) & 0x7) << PIN_A2;
        s |= (((addr as u32) >> 3) & 0x1ff) << PIN_A5;
        s &= !(1 << PIN_NSEL);
        if rd {
            s &= !(1 << PIN_NRD);
        }
        if wr {
            s &= !(1 << PIN_NWR);
        }
        s
    }

    #[test]
    fn address_reassembly() {
        for addr in [0usize, 1, 7, 8, 0x123, 0xfff] {
            let s = sample_word(addr, 0, true, false);
            assert_eq!(bus_addr(s), addr, "addr {addr:#x}");
        }
    }

    #[test]
    fn read_cycle_presents_window_byte() {
        let window = SharedWindow::new();
        window.write(0x234, 0x5A);

        let rd = sample_word(0x234, 0, true, false);
        let port = FakePort::new(vec![rd, rd, IDLE]);
        let mut bridge = BusBridge::new(port, &window);

        let cycle = bridge.service();
        assert_eq!(
            cycle,
            Some(Cycle::Read {
                addr: 0x234,
                data: 0x5A
            })
        );
        assert_eq!(bridge.port.driven, vec![0x5A]);
        // Pins are tri-stated again once /SEL rises.
        assert!(!bridge.port.outputs_enabled);
        assert_eq!(bridge.stats().reads, 1);
        assert_eq!(bridge.stats().last_read_addr, 0x234);
        assert_eq!(bridge.stats().last_read_data, 0x5A);
    }

    #[test]
    fn write_cycle_latches_into_register_region() {
        let window = SharedWindow::new();

        let wr = sample_word(0x812, 0x77, false, true);
        let port = FakePort::new(vec![wr, wr, wr, IDLE]);
        let mut bridge = BusBridge::new(port, &window);

        let cycle = bridge.service();
        assert_eq!(
            cycle,
            Some(Cycle::Write {
                addr: 0x812,
                data: 0x77
            })
        );
        assert_eq!(window.read(0x812), 0x77);
        assert_eq!(bridge.stats().writes, 1);
    }

    #[test]
    fn write_to_read_only_region_is_discarded() {
        let window = SharedWindow::new();
        window.write(0x100, 0xAA);

        // Loader region and ROM window are read-only from the bus.
        for addr in [0x100usize, 0x7ff] {
            let wr = sample_word(addr, 0x55, false, true);
            let port = FakePort::new(vec![wr, wr, IDLE]);
            let mut bridge = BusBridge::new(port, &window);
            assert!(matches!(bridge.service(), Some(Cycle::Write { .. })));
        }
        assert_eq!(window.read(0x100), 0xAA);
        assert_eq!(window.read(0x7ff), 0);
    }

    #[test]
    fn idle_sample_does_nothing() {
        let window = SharedWindow::new();
        let port = FakePort::new(vec![IDLE]);
        let mut bridge = BusBridge::new(port, &window);
        assert_eq!(bridge.service(), None);
        assert_eq!(*bridge.stats(), BridgeStats::default());
    }

    #[test]
    fn ambiguous_strobes_resolve_as_read() {
        let window = SharedWindow::new();
        window.write(0x900, 0x42);

        let both = sample_word(0x900, 0xFF, true, true);
        let port = FakePort::new(vec![both, IDLE]);
        let mut bridge = BusBridge::new(port, &window);

        assert!(matches!(bridge.service(), Some(Cycle::Read { .. })));
        // The write half never happened.
        assert_eq!(window.read(0x900), 0x42);
    }

    #[test]
    fn construction_deasserts_host_outputs() {
        let window = SharedWindow::new();
        let mut port = FakePort::new(vec![IDLE]);
        port.irq = true;
        port.host_reset = true;
        let bridge = BusBridge::new(port, &window);
        assert!(!bridge.port.irq);
        assert!(!bridge.port.host_reset);
    }
}
