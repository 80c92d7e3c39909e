// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Diagnostic event ring for the firmware engines.
//!
//! A `TraceBuf` stores the `N` most recent events recorded by the engine that
//! owns it. Entries carry the line number that recorded them; recording the
//! same payload twice in a row increments the existing entry's count instead
//! of consuming a slot, so a tight loop retrying one operation doesn't erase
//! the history leading up to it.
//!
//! Unlike a printf-style log there is no formatting and no I/O: an entry is a
//! couple of stores. The buffers are ordinary struct fields, so they show up
//! in a debugger against the owning engine and can be read back in host-side
//! tests.
//!
//! ```
//! # use tracebuf::{trace, TraceBuf};
//! #[derive(Copy, Clone, Debug, PartialEq, Eq)]
//! enum Trace {
//!     None,
//!     PageLoad(u16),
//! }
//!
//! let mut buf: TraceBuf<Trace, 16> = TraceBuf::new(Trace::None);
//! trace!(buf, Trace::PageLoad(3));
//! ```

#![cfg_attr(not(test), no_std)]

/// One recorded event.
#[derive(Debug, Copy, Clone)]
pub struct Entry<T: Copy> {
    /// Source line that recorded this entry, from `line!()`.
    pub line: u16,
    /// Number of consecutive times this exact payload was recorded.
    pub count: u32,
    pub payload: T,
}

/// Ring of the `N` most recent events.
#[derive(Debug)]
pub struct TraceBuf<T: Copy + PartialEq, const N: usize> {
    buffer: [Entry<T>; N],
    /// Index of the most recently written entry, or `None` if nothing has
    /// been recorded yet.
    last: Option<usize>,
}

impl<T: Copy + PartialEq, const N: usize> TraceBuf<T, N> {
    /// Creates an empty ring. `fill` initializes the unused slots; pick an
    /// inert variant so a partially-filled ring reads sensibly.
    pub const fn new(fill: T) -> Self {
        Self {
            buffer: [Entry {
                line: 0,
                count: 0,
                payload: fill,
            }; N],
            last: None,
        }
    }

    /// Records an event. Use the [`trace!`] macro rather than calling this
    /// directly so `line` is captured for free.
    pub fn record(&mut self, line: u16, payload: T) {
        // Fold consecutive duplicates into the newest entry.
        if let Some(last) = self.last {
            let entry = &mut self.buffer[last];
            if entry.line == line && entry.payload == payload {
                entry.count = entry.count.wrapping_add(1);
                return;
            }
        }

        let ndx = match self.last {
            Some(last) if last + 1 < N => last + 1,
            _ => 0,
        };
        self.buffer[ndx] = Entry {
            line,
            count: 1,
            payload,
        };
        self.last = Some(ndx);
    }

    /// Returns the recorded entries, oldest first. Slots that have never
    /// been written are skipped.
    pub fn entries(&self) -> impl Iterator<Item = &Entry<T>> {
        let last = self.last;
        (0..N)
            .filter_map(move |i| {
                let last = last?;
                // Oldest entry sits just past `last`, modulo wrap.
                let ndx = (last + 1 + i) % N;
                let e = &self.buffer[ndx];
                if e.count == 0 {
                    None
                } else {
                    Some(e)
                }
            })
    }

    /// Payload of the most recent entry, if any.
    pub fn newest(&self) -> Option<&Entry<T>> {
        self.last.map(|ndx| &self.buffer[ndx])
    }
}

/// Records `payload` into `buf`, tagging it with the current source line.
#[macro_export]
macro_rules! trace {
    ($buf:expr, $payload:expr) => {{
        // Evaluate payload before taking the buffer reference so the
        // expression can't alias the buffer's owner.
        let p = $payload;
        $buf.record(line!() as u16, p);
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    enum Ev {
        None,
        A(u8),
        B,
    }

    #[test]
    fn records_in_order() {
        let mut buf: TraceBuf<Ev, 4> = TraceBuf::new(Ev::None);
        trace!(buf, Ev::A(1));
        trace!(buf, Ev::B);
        trace!(buf, Ev::A(2));

        let got: Vec<Ev> = buf.entries().map(|e| e.payload).collect();
        assert_eq!(got, vec![Ev::A(1), Ev::B, Ev::A(2)]);
        assert_eq!(buf.newest().unwrap().payload, Ev::A(2));
    }

    #[test]
    fn consecutive_duplicates_fold() {
        let mut buf: TraceBuf<Ev, 4> = TraceBuf::new(Ev::None);
        for _ in 0..10 {
            buf.record(7, Ev::B);
        }
        let entries: Vec<_> = buf.entries().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].count, 10);
        assert_eq!(entries[0].line, 7);
    }

    #[test]
    fn same_payload_different_line_is_new_entry() {
        let mut buf: TraceBuf<Ev, 4> = TraceBuf::new(Ev::None);
        buf.record(1, Ev::B);
        buf.record(2, Ev::B);
        assert_eq!(buf.entries().count(), 2);
    }

    #[test]
    fn wraps_and_keeps_newest() {
        let mut buf: TraceBuf<Ev, 3> = TraceBuf::new(Ev::None);
        for i in 0..5 {
            buf.record(10, Ev::A(i));
        }
        let got: Vec<Ev> = buf.entries().map(|e| e.payload).collect();
        assert_eq!(got, vec![Ev::A(2), Ev::A(3), Ev::A(4)]);
    }
}
