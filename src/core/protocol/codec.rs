// src/core/protocol/codec.rs

//! The frame codec: a fixed-size command header followed by an optional
//! payload, with all multi-byte integer fields little-endian on the wire.

use super::command::{CommandFlags, Key, Opcode, ID_SIZE};
use crate::core::NodeError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::{Duration, Instant};
use tokio_util::codec::{Decoder, Encoder};

/// Wire size of the command header, in bytes.
pub const HEADER_SIZE: usize = ID_SIZE + 4 + 4 + 4 + 8 + 4 + 8 + 8 + 8 + 4;

/// Default cap on payload size; configurable per node.
pub const DEFAULT_MAX_PAYLOAD: u64 = 1024 * 1024 * 1024;

/// The fixed command header preceding every payload. Host byte order in
/// memory; the codec normalizes endianness on ingress and egress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub key: Key,
    pub opcode: Opcode,
    pub flags: CommandFlags,
    /// Negative errno on replies, zero otherwise.
    pub status: i32,
    /// Payload byte count.
    pub size: u64,
    /// Unique per connection.
    pub trans_id: u64,
    pub trace_id: u64,
    /// Routing hint; stamped by the dispatcher on requests.
    pub backend_id: i32,
}

impl CommandHeader {
    pub fn new(key: Key, opcode: Opcode) -> Self {
        Self {
            key,
            opcode,
            flags: CommandFlags::empty(),
            status: 0,
            size: 0,
            trans_id: 0,
            trace_id: 0,
            backend_id: -1,
        }
    }

    /// Serializes the header into `dst` in wire order.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_slice(&self.key.id);
        dst.put_u32_le(self.key.group_id);
        dst.put_u32_le(self.key.kind);
        dst.put_u32_le(self.opcode as u32);
        dst.put_u64_le(self.flags.bits());
        dst.put_i32_le(self.status);
        dst.put_u64_le(self.size);
        dst.put_u64_le(self.trans_id);
        dst.put_u64_le(self.trace_id);
        dst.put_i32_le(self.backend_id);
    }

    /// Parses a header from exactly `HEADER_SIZE` leading bytes of `src`.
    pub fn decode(src: &[u8]) -> Result<Self, NodeError> {
        debug_assert!(src.len() >= HEADER_SIZE);
        let mut buf = &src[..HEADER_SIZE];

        let mut id = [0u8; ID_SIZE];
        buf.copy_to_slice(&mut id);
        let group_id = buf.get_u32_le();
        let kind = buf.get_u32_le();
        let raw_opcode = buf.get_u32_le();
        let raw_flags = buf.get_u64_le();
        let status = buf.get_i32_le();
        let size = buf.get_u64_le();
        let trans_id = buf.get_u64_le();
        let trace_id = buf.get_u64_le();
        let backend_id = buf.get_i32_le();

        let opcode = Opcode::from_u32(raw_opcode)
            .ok_or_else(|| NodeError::MalformedHeader(format!("unknown opcode {raw_opcode:#x}")))?;
        let flags = CommandFlags::from_bits(raw_flags).ok_or_else(|| {
            NodeError::MalformedHeader(format!("reserved flag bits set: {raw_flags:#x}"))
        })?;

        Ok(Self {
            key: Key {
                id,
                group_id,
                kind,
            },
            opcode,
            flags,
            status,
            size,
            trans_id,
            trace_id,
            backend_id,
        })
    }
}

/// A complete wire frame: header plus in-memory payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: CommandHeader,
    pub payload: Bytes,
}

impl Frame {
    /// Builds a frame, fixing up `header.size` to match the payload.
    pub fn new(mut header: CommandHeader, payload: Bytes) -> Self {
        header.size = payload.len() as u64;
        Self { header, payload }
    }

    pub fn header_only(mut header: CommandHeader) -> Self {
        header.size = 0;
        Self {
            header,
            payload: Bytes::new(),
        }
    }
}

/// A frame decoded off the wire, together with the time it took to receive
/// it (first header byte to payload completion).
#[derive(Debug)]
pub struct DecodedFrame {
    pub frame: Frame,
    pub recv_time: Duration,
}

#[derive(Clone, Copy)]
enum DecodeState {
    Header,
    Body(CommandHeader),
}

/// A `tokio_util::codec` implementation for the command framing.
pub struct FrameCodec {
    state: DecodeState,
    max_payload: u64,
    rcv_start: Option<Instant>,
}

impl FrameCodec {
    pub fn new(max_payload: u64) -> Self {
        Self {
            state: DecodeState::Header,
            max_payload,
            rcv_start: None,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl Decoder for FrameCodec {
    type Item = DecodedFrame;
    type Error = NodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if !src.is_empty() && self.rcv_start.is_none() {
                        self.rcv_start = Some(Instant::now());
                    }
                    if src.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    let header = CommandHeader::decode(&src[..HEADER_SIZE])?;
                    if header.size > self.max_payload {
                        return Err(NodeError::PayloadTooLarge {
                            size: header.size,
                            limit: self.max_payload,
                        });
                    }
                    src.advance(HEADER_SIZE);

                    if header.size == 0 {
                        let started = self.rcv_start.take();
                        return Ok(Some(DecodedFrame {
                            frame: Frame::header_only(header),
                            recv_time: started.map(|t| t.elapsed()).unwrap_or_default(),
                        }));
                    }

                    src.reserve(header.size as usize);
                    self.state = DecodeState::Body(header);
                }
                DecodeState::Body(header) => {
                    let want = header.size as usize;
                    if src.len() < want {
                        return Ok(None);
                    }
                    let payload = src.split_to(want).freeze();
                    self.state = DecodeState::Header;
                    let started = self.rcv_start.take();
                    return Ok(Some(DecodedFrame {
                        frame: Frame { header, payload },
                        recv_time: started.map(|t| t.elapsed()).unwrap_or_default(),
                    }));
                }
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = NodeError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        debug_assert_eq!(item.header.size, item.payload.len() as u64);
        dst.reserve(HEADER_SIZE + item.payload.len());
        item.header.encode(dst);
        dst.put_slice(&item.payload);
        Ok(())
    }
}
