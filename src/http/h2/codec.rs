//! Frame encoding and incremental decoding
//!
//! Encoders append to a caller-owned `BytesMut` so the engine can batch
//! everything it owes the peer into one write. The decoder buffers partial
//! frames across reads.

use super::error::{Error, Result};
use super::frames::*;
use super::DEFAULT_MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size
pub const FRAME_HEADER_SIZE: usize = 9;

/// Incremental frame decoder plus stateless encoders
pub struct FrameCodec {
    read_buffer: BytesMut,
    max_frame_size: u32,
}

impl FrameCodec {
    /// Decoder accepting payloads up to the default 16 KiB
    pub fn new() -> Self {
        FrameCodec {
            read_buffer: BytesMut::with_capacity(64 * 1024),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Largest payload the decoder accepts (our SETTINGS_MAX_FRAME_SIZE)
    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.read_buffer.len()
    }

    /// Feed bytes, get every frame they complete
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.read_buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while self.read_buffer.len() >= FRAME_HEADER_SIZE {
            let (raw_type, flags, stream_id, length) = Self::decode_header(&self.read_buffer[..FRAME_HEADER_SIZE]);

            if length > self.max_frame_size as usize {
                return Err(Error::FrameSize(format!(
                    "{} byte payload exceeds max frame size {}",
                    length, self.max_frame_size
                )));
            }
            if self.read_buffer.len() < FRAME_HEADER_SIZE + length {
                break;
            }

            self.read_buffer.advance(FRAME_HEADER_SIZE);
            let payload = self.read_buffer.split_to(length).freeze();
            frames.push(Frame {
                raw_type,
                flags,
                stream_id,
                payload,
            });
        }
        Ok(frames)
    }

    /// Parse a 9-byte frame header: type byte, flags, stream id, length
    pub fn decode_header(bytes: &[u8]) -> (u8, FrameFlags, u32, usize) {
        let length = ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | bytes[2] as usize;
        let stream_id = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) & 0x7FFF_FFFF;
        (bytes[3], FrameFlags::from_u8(bytes[4]), stream_id, length)
    }

    /// Append a frame header
    pub fn encode_header(dst: &mut BytesMut, frame_type: FrameType, flags: FrameFlags, stream_id: u32, length: usize) {
        dst.put_uint(length as u64, 3);
        dst.put_u8(frame_type.as_u8());
        dst.put_u8(flags.as_u8());
        dst.put_u32(stream_id & 0x7FFF_FFFF);
    }

    fn put_padded(dst: &mut BytesMut, body: &[u8], padding: Option<u8>) {
        if let Some(pad) = padding {
            dst.put_u8(pad);
            dst.put_slice(body);
            dst.put_bytes(0, pad as usize);
        } else {
            dst.put_slice(body);
        }
    }

    pub fn encode_data(dst: &mut BytesMut, frame: &DataFrame) {
        let flags = FrameFlags::empty()
            .with(FrameFlags::END_STREAM, frame.end_stream)
            .with(FrameFlags::PADDED, frame.padding.is_some());
        Self::encode_header(dst, FrameType::Data, flags, frame.stream_id, frame.flow_controlled_len());
        Self::put_padded(dst, &frame.data, frame.padding);
    }

    pub fn encode_headers(dst: &mut BytesMut, frame: &HeadersFrame) {
        let flags = FrameFlags::empty()
            .with(FrameFlags::END_STREAM, frame.end_stream)
            .with(FrameFlags::END_HEADERS, frame.end_headers)
            .with(FrameFlags::PADDED, frame.padding.is_some());
        let len = frame.header_block.len() + frame.padding.map_or(0, |p| 1 + p as usize);
        Self::encode_header(dst, FrameType::Headers, flags, frame.stream_id, len);
        Self::put_padded(dst, &frame.header_block, frame.padding);
    }

    pub fn encode_continuation(dst: &mut BytesMut, frame: &ContinuationFrame) {
        let flags = FrameFlags::empty().with(FrameFlags::END_HEADERS, frame.end_headers);
        Self::encode_header(dst, FrameType::Continuation, flags, frame.stream_id, frame.header_block.len());
        dst.put_slice(&frame.header_block);
    }

    /// Encode a complete header block as HEADERS followed by as many
    /// CONTINUATION frames as `max_frame_size` requires
    pub fn encode_header_block(
        dst: &mut BytesMut,
        stream_id: u32,
        block: Bytes,
        end_stream: bool,
        max_frame_size: usize,
    ) {
        let max = max_frame_size.max(1);
        let first_len = block.len().min(max);
        let mut rest = block.slice(first_len..);

        Self::encode_headers(
            dst,
            &HeadersFrame::new(stream_id, block.slice(..first_len), end_stream, rest.is_empty()),
        );

        while !rest.is_empty() {
            let chunk = rest.split_to(rest.len().min(max));
            Self::encode_continuation(
                dst,
                &ContinuationFrame {
                    stream_id,
                    header_block: chunk,
                    end_headers: rest.is_empty(),
                },
            );
        }
    }

    pub fn encode_settings(dst: &mut BytesMut, frame: &SettingsFrame) {
        let entries = if frame.ack { Vec::new() } else { frame.settings.entries() };
        let flags = FrameFlags::empty().with(FrameFlags::ACK, frame.ack);
        Self::encode_header(dst, FrameType::Settings, flags, 0, entries.len() * 6);
        for (id, value) in entries {
            dst.put_u16(id);
            dst.put_u32(value);
        }
    }

    pub fn encode_ping(dst: &mut BytesMut, frame: &PingFrame) {
        let flags = FrameFlags::empty().with(FrameFlags::ACK, frame.ack);
        Self::encode_header(dst, FrameType::Ping, flags, 0, 8);
        dst.put_slice(&frame.data);
    }

    pub fn encode_goaway(dst: &mut BytesMut, frame: &GoawayFrame) {
        Self::encode_header(dst, FrameType::Goaway, FrameFlags::empty(), 0, 8 + frame.debug_data.len());
        dst.put_u32(frame.last_stream_id & 0x7FFF_FFFF);
        dst.put_u32(frame.error_code.as_u32());
        dst.put_slice(&frame.debug_data);
    }

    pub fn encode_window_update(dst: &mut BytesMut, frame: &WindowUpdateFrame) {
        Self::encode_header(dst, FrameType::WindowUpdate, FrameFlags::empty(), frame.stream_id, 4);
        dst.put_u32(frame.size_increment & 0x7FFF_FFFF);
    }

    pub fn encode_rst_stream(dst: &mut BytesMut, frame: &RstStreamFrame) {
        Self::encode_header(dst, FrameType::RstStream, FrameFlags::empty(), frame.stream_id, 4);
        dst.put_u32(frame.error_code.as_u32());
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}
