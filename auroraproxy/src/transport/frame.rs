//! WebSocket frame value type (RFC 6455 Section 5.2).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Largest payload a single frame may carry. Larger messages are fragmented.
pub const MAX_PAYLOAD_LEN: usize = 1 << 30;

/// Largest payload that fits in the 7-bit length field.
pub(crate) const MAX_SHORT_LEN: usize = 125;

/// Largest payload that fits in the 16-bit extended length field.
pub(crate) const MAX_MEDIUM_LEN: usize = u16::MAX as usize;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Invalid opcode: {0:#x}")]
    InvalidOpcode(u8),

    #[error("Declared payload length {len} exceeds the {max} byte limit")]
    PayloadTooLarge { len: u64, max: usize },

    #[error("Fragmented message exceeds the {max} byte limit")]
    MessageTooLarge { max: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(FrameError::InvalidOpcode(value)),
        }
    }

    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// One WebSocket frame.
///
/// The payload is always stored unmasked. The masked wire bytes are derived
/// from the payload and the current mask on demand, so replacing either one
/// can never leave the two views out of sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: Opcode,
    mask: Option<u32>,
    payload: Bytes,
}

impl Frame {
    /// Creates a final, unmasked frame.
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Result<Self, FrameError> {
        let payload = payload.into();
        check_len(payload.len())?;
        Ok(Self::from_parts(true, opcode, None, payload))
    }

    /// Builds a frame whose payload length is already known to be in bounds.
    pub(crate) fn from_parts(fin: bool, opcode: Opcode, mask: Option<u32>, payload: Bytes) -> Self {
        debug_assert!(payload.len() <= MAX_PAYLOAD_LEN);
        Self {
            fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            mask,
            payload,
        }
    }

    /// Unmasked application payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn set_payload(&mut self, payload: impl Into<Bytes>) -> Result<(), FrameError> {
        let payload = payload.into();
        check_len(payload.len())?;
        self.payload = payload;
        Ok(())
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn mask(&self) -> Option<u32> {
        self.mask
    }

    pub fn set_mask(&mut self, mask: Option<u32>) {
        self.mask = mask;
    }

    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// Masking key in wire order.
    pub fn mask_bytes(&self) -> Option<[u8; 4]> {
        self.mask.map(u32::to_be_bytes)
    }

    /// Payload as it appears on the wire: XORed with the mask if one is set,
    /// identical to [`Frame::payload`] otherwise.
    pub fn masked_payload(&self) -> Bytes {
        match self.mask_bytes() {
            Some(key) => {
                let mut buf = BytesMut::from(self.payload.as_ref());
                apply_mask(&mut buf, key);
                buf.freeze()
            }
            None => self.payload.clone(),
        }
    }

    /// Size of the full wire encoding in bytes.
    pub fn encoded_len(&self) -> usize {
        let len = self.payload.len();
        let ext = if len <= MAX_SHORT_LEN {
            0
        } else if len <= MAX_MEDIUM_LEN {
            2
        } else {
            8
        };
        let mask = if self.mask.is_some() { 4 } else { 0 };
        2 + ext + mask + len
    }

    /// Appends the wire encoding of this frame to `dst`.
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());

        let mut b0 = self.opcode as u8;
        if self.fin {
            b0 |= 0x80;
        }
        if self.rsv1 {
            b0 |= 0x40;
        }
        if self.rsv2 {
            b0 |= 0x20;
        }
        if self.rsv3 {
            b0 |= 0x10;
        }
        dst.put_u8(b0);

        let mask_bit = if self.mask.is_some() { 0x80 } else { 0 };
        let len = self.payload.len();
        if len <= MAX_SHORT_LEN {
            dst.put_u8(mask_bit | len as u8);
        } else if len <= MAX_MEDIUM_LEN {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(len as u64);
        }

        match self.mask_bytes() {
            Some(key) => {
                dst.put_slice(&key);
                let start = dst.len();
                dst.put_slice(&self.payload);
                apply_mask(&mut dst[start..], key);
            }
            None => dst.put_slice(&self.payload),
        }
    }
}

/// XORs `buf` in place with the repeating 4-byte `key`, aligned to index 0.
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

fn check_len(len: usize) -> Result<(), FrameError> {
    if len > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge {
            len: len as u64,
            max: MAX_PAYLOAD_LEN,
        });
    }
    Ok(())
}
