// Copyright 2020 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Wire codec and buffer pool: DNS message packing/unpacking, TCP length-prefix
//! framing, and a power-of-two size-classed buffer pool.

use bytes::{Bytes, BytesMut};
use domain::{
    base::{Message, MessageBuilder},
    rdata::AllRecordData,
};
use std::sync::Mutex;
use thiserror::Error;

/// Largest valid DNS message size (RFC 1035 TCP length-prefix limit).
pub const MAX_MESSAGE_SIZE: usize = 65535;

/// Default UDP payload size in the absence of an advertised EDNS0 size.
pub const DEFAULT_UDP_SIZE: u16 = 512;
/// Default EDNS0 UDP payload size over IPv4.
pub const DEFAULT_UDP_SIZE_V4: u16 = 1472;
/// Default EDNS0 UDP payload size over IPv6.
pub const DEFAULT_UDP_SIZE_V6: u16 = 1452;

/// Smallest DNS message: a 12-byte header with no further sections.
const MIN_MESSAGE_SIZE: usize = 12;

/// Errors raised while packing, unpacking or framing a message.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The framed TCP length was below 12 bytes, or the stream ended mid-message.
    #[error("short read: framed message too small or stream ended early")]
    ShortRead,

    /// An outgoing payload exceeds [`MAX_MESSAGE_SIZE`].
    #[error("message of {0} bytes exceeds the DNS maximum of {MAX_MESSAGE_SIZE}")]
    OverSize(usize),

    /// The message failed to parse.
    #[error(transparent)]
    Parse(#[from] domain::base::ShortBuf),
}

/// Validate a framed TCP length prefix, per §4.A.
pub fn validate_framed_len(len: usize) -> Result<(), CodecError> {
    if len < MIN_MESSAGE_SIZE {
        Err(CodecError::ShortRead)
    } else {
        Ok(())
    }
}

/// Validate an outgoing payload's size before writing it to the wire.
pub fn validate_outgoing_len(len: usize) -> Result<(), CodecError> {
    if len > MAX_MESSAGE_SIZE {
        Err(CodecError::OverSize(len))
    } else {
        Ok(())
    }
}

/// Parse wire bytes into a decoded [`Message`].
pub fn unpack(bytes: Bytes) -> Result<Message<Bytes>, CodecError> {
    Message::from_octets(bytes).map_err(CodecError::from)
}

/// Serialise `msg` into the wire bytes already backing it. `domain::Message` is
/// already octet-backed, so packing is simply surfacing the underlying bytes;
/// kept as a named function so call sites read as "pack"/"unpack" symmetrically.
pub fn pack(msg: &Message<Bytes>) -> Bytes {
    msg.as_octets().clone()
}

/// Return a copy of `msg` with its transaction id overwritten to `id`. Used
/// everywhere an upstream rewrites the outgoing/incoming id internally (TCP
/// multiplexing, DoH's id=0 convention, single-flight sharing) but must
/// still hand the caller back a response carrying their own original id.
pub fn rewrite_id(msg: Message<Bytes>, id: u16) -> Message<Bytes> {
    let mut mutable =
        Message::from_octets(BytesMut::from(msg.as_slice())).expect("already-parsed message reparses");
    mutable.header_mut().set_id(id);
    mutable.for_slice()
}

/// Return a copy of `msg` with every answer/authority/additional record's TTL
/// rewritten to `remaining_secs`, leaving any OPT (EDNS0) pseudo-record
/// untouched. Used on a cache hit so a client sees the TTL actually left on
/// the stored entry rather than the TTL it was cached with.
pub fn rewrite_ttls(msg: &Message<Bytes>, remaining_secs: u32) -> Result<Message<Bytes>, CodecError> {
    let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(msg.as_slice().len()))?;
    *builder.header_mut() = msg.header();
    let mut builder = builder.question();
    for item in msg.question().flatten() {
        builder.push(item)?;
    }

    let mut builder = builder.answer();
    for item in msg.answer()? {
        if let Some(record) = item?.into_record::<AllRecordData<_, _>>()? {
            builder.push((record.owner(), remaining_secs, record.data().clone()))?;
        }
    }
    let mut builder = builder.authority();
    for item in msg.authority()? {
        if let Some(record) = item?.into_record::<AllRecordData<_, _>>()? {
            builder.push((record.owner(), remaining_secs, record.data().clone()))?;
        }
    }
    let mut builder = builder.additional();
    for item in msg.additional()? {
        if let Some(record) = item?.into_record::<AllRecordData<_, _>>()? {
            match record.data() {
                AllRecordData::Opt(_) => builder.push(record)?,
                data => builder.push((record.owner(), remaining_secs, data.clone()))?,
            }
        }
    }
    Ok(builder.into_message())
}

/// The EDNS0-advertised UDP payload size of `msg`, or the protocol default when
/// absent.
pub fn advertised_udp_size(msg: &Message<Bytes>, is_v4: bool) -> u16 {
    msg.opt()
        .map(|opt| opt.udp_payload_size())
        .unwrap_or(if is_v4 {
            DEFAULT_UDP_SIZE_V4
        } else {
            DEFAULT_UDP_SIZE_V6
        })
        .max(DEFAULT_UDP_SIZE)
}

/// Number of size classes: powers of two from 1 B (class 0) to 64 KiB (class 16).
const NUM_CLASSES: usize = 17;

fn class_for(n: usize) -> usize {
    if n <= 1 {
        0
    } else {
        (usize::BITS - (n - 1).leading_zeros()) as usize
    }
}

fn class_capacity(class: usize) -> usize {
    1 << class
}

/// A pooled, power-of-two size-classed buffer pool.
///
/// `get(n)` returns a buffer whose capacity is the smallest class ≥ `n`; `put`
/// returns it to its class's free list. Misusing `put` with a buffer whose
/// capacity isn't an exact class size panics in debug builds, matching the
/// "panics on misuse" design note.
pub struct BufferPool {
    classes: Vec<Mutex<Vec<BytesMut>>>,
}

impl BufferPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            classes: (0..NUM_CLASSES).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    /// Borrow a buffer with capacity ≥ `n` from the pool, allocating a fresh one
    /// if the class's free list is empty.
    pub fn get(&self, n: usize) -> BytesMut {
        let class = class_for(n);
        let mut free = self.classes[class].lock().unwrap();
        free.pop()
            .unwrap_or_else(|| BytesMut::with_capacity(class_capacity(class)))
    }

    /// Return a buffer to the pool. `buf` is cleared before being stored.
    pub fn put(&self, mut buf: BytesMut) {
        let cap = buf.capacity();
        let class = class_for(cap);
        debug_assert_eq!(
            class_capacity(class),
            cap,
            "BufferPool::put called with a non-power-of-two capacity"
        );
        buf.clear();
        self.classes[class].lock().unwrap().push(buf);
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_selection_rounds_up_to_power_of_two() {
        assert_eq!(class_for(0), 0);
        assert_eq!(class_for(1), 0);
        assert_eq!(class_for(2), 1);
        assert_eq!(class_for(513), 10); // 1024
        assert_eq!(class_for(65535), 16); // 65536
    }

    #[test]
    fn pool_round_trip_reuses_capacity() {
        let pool = BufferPool::new();
        let buf = pool.get(100);
        assert!(buf.capacity() >= 100);
        let cap = buf.capacity();
        pool.put(buf);
        let buf2 = pool.get(100);
        assert_eq!(buf2.capacity(), cap);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        assert!(validate_outgoing_len(MAX_MESSAGE_SIZE + 1).is_err());
        assert!(validate_outgoing_len(MAX_MESSAGE_SIZE).is_ok());
    }

    #[test]
    fn short_framed_len_is_rejected() {
        assert!(validate_framed_len(11).is_err());
        assert!(validate_framed_len(12).is_ok());
    }
}
