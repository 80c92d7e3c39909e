// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Channel 1: host identification. Stateless; subcommand 0 gets the
//! protocol version and product string back.

use arcpipe_proto::hostinfo::{InfoResponse, OP_QUERY};
use arcpipe_proto::Channel;
use log::warn;
use zerocopy::IntoBytes;

use crate::dispatch::TxQueue;

pub fn handle(payload: &[u8], tx: &mut TxQueue) {
    match payload.first() {
        Some(&OP_QUERY) => {
            tx.send(Channel::HostInfo.cid(), InfoResponse::new().as_bytes());
        }
        Some(&op) => warn!("hostinfo: unknown subcommand {op:#x}"),
        None => warn!("hostinfo: empty request"),
    }
}
