// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire protocol shared by the podule firmware and the host server.
//!
//! Packets travel over the USB CDC byte stream with a fixed three-byte
//! header and no escaping:
//!
//! ```text
//! +--------+----------+----------+-------- ... --------+
//! | CID(8) | SIZEL(8) | SIZEH(8) | payload (SIZE bytes)|
//! +--------+----------+----------+-------- ... --------+
//! ```
//!
//! `SIZE` is at most 512. Payload formats are channel-specific; the channel
//! message layouts live in the [`hostinfo`] and [`rawfile`] modules so both
//! ends share one definition.

#![cfg_attr(not(test), no_std)]

use zerocopy::{
    byteorder, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned, U16,
    U32,
};

type U16Le = U16<byteorder::LittleEndian>;
type U32Le = U32<byteorder::LittleEndian>;

/// Packet header length on the wire.
pub const HDR_SIZE: usize = 3;

/// Largest payload a single packet may carry, bounded by the 512-byte
/// descriptor buffer regions in the shared window.
pub const MAX_PAYLOAD: usize = 512;

/// Largest complete frame (header + payload).
pub const MAX_FRAME: usize = HDR_SIZE + MAX_PAYLOAD;

/// Decoded packet header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub cid: u8,
    pub size: u16,
}

impl PacketHeader {
    pub const fn new(cid: u8, size: u16) -> Self {
        Self { cid, size }
    }

    /// Decodes a header from the front of `bytes`, or `None` if fewer than
    /// three bytes are available yet.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HDR_SIZE {
            return None;
        }
        Some(Self {
            cid: bytes[0],
            size: u16::from(bytes[1]) | (u16::from(bytes[2]) << 8),
        })
    }

    pub const fn encode(self) -> [u8; HDR_SIZE] {
        [self.cid, self.size as u8, (self.size >> 8) as u8]
    }

    /// Total frame length, header included.
    pub const fn frame_len(self) -> usize {
        HDR_SIZE + self.size as usize
    }
}

/// Channel identifiers. The wire field is 8 bits but descriptors can only
/// carry 7, so 127 is the practical ceiling.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Channel {
    /// Keepalive / padding; dropped on receipt.
    Ignore = 0,
    /// Host identification.
    HostInfo = 1,
    /// Host file access.
    RawFile = 2,
}

impl Channel {
    pub fn from_cid(cid: u8) -> Option<Self> {
        match cid {
            0 => Some(Self::Ignore),
            1 => Some(Self::HostInfo),
            2 => Some(Self::RawFile),
            _ => None,
        }
    }

    pub const fn cid(self) -> u8 {
        self as u8
    }
}

pub mod hostinfo {
    //! Channel 1: host identification.

    use super::*;

    pub const PROTO_VERSION: u32 = 1;
    pub const PRODUCT: &[u8] = b"ArcPipePodule host server";

    /// Subcommand: query host info (the only one defined).
    pub const OP_QUERY: u8 = 0;

    /// Response to [`OP_QUERY`].
    #[derive(
        Copy, Clone, Debug, IntoBytes, FromBytes, KnownLayout, Immutable,
        Unaligned,
    )]
    #[repr(C)]
    pub struct InfoResponse {
        pub proto_version: U32Le,
        /// NUL-padded ASCII product string.
        pub product: [u8; 28],
        pub pad: [u8; 4],
    }

    static_assertions::const_assert_eq!(
        core::mem::size_of::<InfoResponse>(),
        36
    );

    impl InfoResponse {
        pub fn new() -> Self {
            let mut product = [0; 28];
            product[..PRODUCT.len()].copy_from_slice(PRODUCT);
            Self {
                proto_version: U32Le::new(PROTO_VERSION),
                product,
                pad: [0; 4],
            }
        }
    }

    impl Default for InfoResponse {
        fn default() -> Self {
            Self::new()
        }
    }
}

pub mod rawfile {
    //! Channel 2: host file access.
    //!
    //! Requests are distinguished by their first payload byte.

    use super::*;

    /// Open a file for reading. The rest of the payload is a NUL-terminated
    /// host filename; the reply is an [`InitReadResponse`].
    pub const OP_INIT_READ: u8 = 0;
    /// Positional read; the payload is a [`ReadBlockRequest`] and the reply
    /// carries exactly the requested number of data bytes.
    pub const OP_READ_BLOCK: u8 = 1;
    /// Close the open file. No reply.
    pub const OP_CLOSE: u8 = 4;

    pub const STATUS_OK: u8 = 0;
    pub const STATUS_FAILED: u8 = 1;

    /// Reply to [`OP_INIT_READ`].
    ///
    /// On failure `status` is [`STATUS_FAILED`] and `errno` holds the host's
    /// error code; `size`/`load`/`exec` are undefined. (Earlier protocol
    /// revisions jammed the errno into `status` itself, which truncated
    /// values above 255.)
    #[derive(
        Copy, Clone, Debug, IntoBytes, FromBytes, KnownLayout, Immutable,
        Unaligned,
    )]
    #[repr(C)]
    pub struct InitReadResponse {
        pub status: u8,
        pub pad: u8,
        pub errno: U16Le,
        pub size: U32Le,
        pub load: U32Le,
        pub exec: U32Le,
    }

    static_assertions::const_assert_eq!(
        core::mem::size_of::<InitReadResponse>(),
        16
    );

    impl InitReadResponse {
        pub fn ok(size: u32, attrs: super::attrs::LoadExec) -> Self {
            Self {
                status: STATUS_OK,
                pad: 0,
                errno: U16Le::new(0),
                size: U32Le::new(size),
                load: U32Le::new(attrs.load),
                exec: U32Le::new(attrs.exec),
            }
        }

        pub fn failed(errno: u16) -> Self {
            Self {
                status: STATUS_FAILED,
                pad: 0,
                errno: U16Le::new(errno),
                size: U32Le::new(0),
                load: U32Le::new(0),
                exec: U32Le::new(0),
            }
        }
    }

    /// Body of [`OP_READ_BLOCK`].
    #[derive(
        Copy, Clone, Debug, IntoBytes, FromBytes, KnownLayout, Immutable,
        Unaligned,
    )]
    #[repr(C)]
    pub struct ReadBlockRequest {
        pub opcode: u8,
        pub pad: [u8; 3],
        pub offset: U32Le,
        pub size: U32Le,
    }

    static_assertions::const_assert_eq!(
        core::mem::size_of::<ReadBlockRequest>(),
        12
    );
}

pub mod attrs {
    //! Acorn file attributes: filetype, load and exec addresses.
    //!
    //! RISC OS stamps a typed file by folding the 12-bit filetype and a
    //! 40-bit timestamp into the load/exec address pair:
    //!
    //! ```text
    //! load = 0xFFF00000 | type << 8 | timestamp[39:32]
    //! exec = timestamp[31:0]
    //! ```
    //!
    //! The timestamp counts centiseconds since 1900-01-01 UTC.

    /// Seconds between 1900-01-01 and the Unix epoch: 25,567 days (70 years,
    /// 17 of them containing a leap day). The `70 * 365.2425 * 86400`
    /// approximation sometimes seen for this lands about 2.4 days off and is
    /// deliberately not used here.
    pub const SECS_1900_TO_1970: u64 = 2_208_988_800;

    /// Default filetype when the host filename carries no metadata:
    /// `Data` (&FFD).
    pub const TYPE_DATA: u16 = 0xFFD;

    /// Load/exec address pair.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct LoadExec {
        pub load: u32,
        pub exec: u32,
    }

    /// Converts Unix seconds to the 40-bit Acorn centisecond timestamp.
    pub fn acorn_time(unix_secs: u64) -> u64 {
        ((unix_secs + SECS_1900_TO_1970) * 100) & 0xFF_FFFF_FFFF
    }

    /// Attributes for a typed file stamped at `unix_mtime`.
    pub fn from_filetype(filetype: u16, unix_mtime: u64) -> LoadExec {
        let at = acorn_time(unix_mtime);
        LoadExec {
            load: 0xFFF0_0000
                | (u32::from(filetype & 0xFFF) << 8)
                | ((at >> 32) as u32 & 0xFF),
            exec: at as u32,
        }
    }

    /// Attributes for an untyped file: `Data`, no timestamp.
    pub fn untyped() -> LoadExec {
        LoadExec {
            load: 0xFFF0_0000 | (u32::from(TYPE_DATA) << 8),
            exec: 0,
        }
    }
}
