//! Conversion between raw socket bytes and WebSocket frames/messages.
//!
//! A [`FrameCodec`] belongs to exactly one direction of one session. It keeps
//! the undecoded tail of the previous read (TCP does not preserve frame
//! boundaries) and the reassembly state of fragmented messages.

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, warn};

use super::frame::{apply_mask, Frame, FrameError, Opcode, MAX_PAYLOAD_LEN};

/// Default ceiling on a reassembled message, across all its fragments.
pub const MAX_MESSAGE_LEN: usize = MAX_PAYLOAD_LEN;

#[derive(Debug)]
pub struct FrameCodec {
    carry: BytesMut,
    max_frame_len: usize,
    max_message_len: usize,
    text: Reassembly,
    binary: Reassembly,
}

/// Reassembly state for one message opcode.
///
/// `open` mirrors every started-but-unfinished data message on the
/// connection, whatever its kind, so a continuation frame can be attributed
/// to the message it extends. Only payloads of the owning kind are buffered.
#[derive(Debug, Default)]
struct Reassembly {
    open: Vec<Opcode>,
    buf: BytesMut,
}

impl Reassembly {
    fn append(&mut self, payload: &[u8], max: usize) -> Result<(), FrameError> {
        if self.buf.len() + payload.len() > max {
            self.buf.clear();
            self.open.clear();
            return Err(FrameError::MessageTooLarge { max });
        }
        self.buf.extend_from_slice(payload);
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            carry: BytesMut::new(),
            max_frame_len: MAX_PAYLOAD_LEN,
            max_message_len: MAX_MESSAGE_LEN,
            text: Reassembly::default(),
            binary: Reassembly::default(),
        }
    }

    /// Lowers the per-frame payload ceiling used for both decoding and
    /// fragmentation. Values are clamped to `1..=MAX_PAYLOAD_LEN`.
    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len.clamp(1, MAX_PAYLOAD_LEN);
        self
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Lowers the ceiling on the total size of a fragmented message.
    pub fn with_max_message_len(mut self, len: usize) -> Self {
        self.max_message_len = len.clamp(1, MAX_MESSAGE_LEN);
        self
    }

    /// Bytes received but not yet decoded into a complete frame.
    pub fn carry(&self) -> &[u8] {
        &self.carry
    }

    /// Decodes every complete frame from the carry-over plus `bytes`.
    ///
    /// A trailing partial frame stays in the carry and is retried on the next
    /// call. An invalid opcode or an over-long declared length is fatal: the
    /// carry is discarded and the error returned.
    pub fn decode(&mut self, bytes: &[u8]) -> Result<Vec<Frame>, FrameError> {
        self.carry.extend_from_slice(bytes);

        let mut frames = Vec::new();
        loop {
            match self.decode_one() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(err) => {
                    self.carry.clear();
                    return Err(err);
                }
            }
        }

        if !self.carry.is_empty() {
            debug!(pending = self.carry.len(), "Partial frame buffered");
        }
        Ok(frames)
    }

    fn decode_one(&mut self) -> Result<Option<Frame>, FrameError> {
        let buf = &self.carry;
        if buf.len() < 2 {
            return Ok(None);
        }

        let b0 = buf[0];
        let b1 = buf[1];
        let opcode = Opcode::from_u8(b0 & 0x0F)?;
        let masked = b1 & 0x80 != 0;

        let (len, mut header_len) = match b1 & 0x7F {
            126 => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
            }
            127 => {
                if buf.len() < 10 {
                    return Ok(None);
                }
                let mut ext = [0u8; 8];
                ext.copy_from_slice(&buf[2..10]);
                (u64::from_be_bytes(ext), 10)
            }
            n => (u64::from(n), 2),
        };

        if len > self.max_frame_len as u64 {
            return Err(FrameError::PayloadTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        let len = len as usize;

        let mask = if masked {
            if buf.len() < header_len + 4 {
                return Ok(None);
            }
            let key = [
                buf[header_len],
                buf[header_len + 1],
                buf[header_len + 2],
                buf[header_len + 3],
            ];
            header_len += 4;
            Some(u32::from_be_bytes(key))
        } else {
            None
        };

        if buf.len() < header_len + len {
            return Ok(None);
        }

        self.carry.advance(header_len);
        let mut payload = self.carry.split_to(len);
        if let Some(mask) = mask {
            apply_mask(&mut payload, mask.to_be_bytes());
        }

        let mut frame = Frame::from_parts(b0 & 0x80 != 0, opcode, mask, payload.freeze());
        frame.rsv1 = b0 & 0x40 != 0;
        frame.rsv2 = b0 & 0x20 != 0;
        frame.rsv3 = b0 & 0x10 != 0;
        Ok(Some(frame))
    }

    /// Concatenated wire form of `frames`.
    pub fn encode(frames: &[Frame]) -> Bytes {
        let mut buf = BytesMut::with_capacity(frames.iter().map(Frame::encoded_len).sum());
        for frame in frames {
            frame.write_to(&mut buf);
        }
        buf.freeze()
    }

    /// Splits `payload` into frames of at most `max_frame_len` bytes.
    ///
    /// Only the last frame has FIN set. The first frame carries `opcode`, the
    /// rest are continuations. With `masked`, every frame gets its own fresh
    /// random key.
    pub fn encode_message(&self, payload: impl Into<Bytes>, opcode: Opcode, masked: bool) -> Vec<Frame> {
        let payload = payload.into();
        let mut frames = Vec::with_capacity(payload.len() / self.max_frame_len + 1);
        let mut opcode = opcode;
        let mut offset = 0;

        loop {
            let end = (offset + self.max_frame_len).min(payload.len());
            let fin = end == payload.len();
            let mask = masked.then(rand::random::<u32>);
            frames.push(Frame::from_parts(fin, opcode, mask, payload.slice(offset..end)));
            if fin {
                break;
            }
            offset = end;
            opcode = Opcode::Continuation;
        }

        frames
    }

    /// Reassembles complete `opcode` messages (TEXT or BIN) from `frames`.
    ///
    /// Partial messages are remembered across calls. Frames of any other
    /// kind are skipped without touching the state kept for `opcode`. A
    /// partial message growing past the message ceiling is dropped and
    /// reported as [`FrameError::MessageTooLarge`].
    pub fn decode_messages(&mut self, frames: &[Frame], opcode: Opcode) -> Result<Vec<Bytes>, FrameError> {
        let max = self.max_message_len;
        let state = match opcode {
            Opcode::Text => &mut self.text,
            Opcode::Binary => &mut self.binary,
            other => {
                warn!(?other, "Only TEXT and BIN messages can be reassembled");
                return Ok(Vec::new());
            }
        };

        let mut messages = Vec::new();
        for frame in frames {
            match frame.opcode {
                Opcode::Text | Opcode::Binary => {
                    let kind = frame.opcode;
                    if let Some(pos) = state.open.iter().position(|open| *open == kind) {
                        state.open.remove(pos);
                        if kind == opcode {
                            warn!(?kind, "Discarding unfinished message");
                            state.buf.clear();
                        }
                    }

                    if frame.fin {
                        if kind == opcode {
                            messages.push(frame.payload().clone());
                        }
                    } else {
                        if kind == opcode {
                            state.append(frame.payload(), max)?;
                        }
                        state.open.push(kind);
                    }
                }
                Opcode::Continuation => {
                    let Some(&owner) = state.open.last() else {
                        debug!("Continuation frame without a started message");
                        continue;
                    };
                    if owner == opcode {
                        state.append(frame.payload(), max)?;
                    }
                    if frame.fin {
                        state.open.pop();
                        if owner == opcode {
                            messages.push(state.buf.split().freeze());
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(messages)
    }

    /// Answer to `ping`: FIN, PONG, masked, payload echoed verbatim.
    pub fn create_pong_frame(ping: &Frame) -> Frame {
        Frame::from_parts(
            true,
            Opcode::Pong,
            Some(rand::random::<u32>()),
            ping.payload().clone(),
        )
    }

    /// Empty, unmasked PING as sent by a server to its client.
    pub fn create_ping_frame() -> Frame {
        Frame::from_parts(true, Opcode::Ping, None, Bytes::new())
    }

    pub fn create_close_frame(masked: bool) -> Frame {
        Frame::from_parts(
            true,
            Opcode::Close,
            masked.then(rand::random::<u32>),
            Bytes::new(),
        )
    }
}
