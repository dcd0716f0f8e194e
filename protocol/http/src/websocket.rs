//! WebSocket frame codec (RFC 6455 §5).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```

use base64::Engine;
use sha1::{Digest, Sha1};

/// The key-concatenation GUID from RFC 6455 §1.3.
pub const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest possible frame header: 2 bytes + 8-byte length + 4-byte mask key.
pub const MAX_HEADER_LEN: usize = 14;

/// Frame decode errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Need more data to decode the header.
    #[error("incomplete")]
    Incomplete,
    /// One of the RSV bits is set (no extension negotiates them here).
    #[error("reserved bits set")]
    ReservedBits,
    /// Reserved or unknown opcode.
    #[error("reserved opcode {0:#x}")]
    BadOpCode(u8),
    /// A control frame with the FIN bit clear.
    #[error("fragmented control frame")]
    FragmentedControl,
    /// A control frame with a payload longer than 125 bytes.
    #[error("oversized control frame")]
    OversizedControl,
}

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    pub fn from_u8(v: u8) -> Result<Self, FrameError> {
        match v {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(FrameError::BadOpCode(other)),
        }
    }

    /// CLOSE, PING and PONG are control frames.
    pub fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }
}

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: OpCode,
    pub mask: Option<[u8; 4]>,
    pub payload_len: u64,
}

impl FrameHeader {
    /// Decode a header from the front of the buffer.
    ///
    /// Returns the header and the number of header bytes, or
    /// [`FrameError::Incomplete`] when fewer bytes are available than the
    /// header needs. Control-frame framing rules (FIN set, payload ≤ 125)
    /// are enforced here since they are visible at the header level.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), FrameError> {
        if data.len() < 2 {
            return Err(FrameError::Incomplete);
        }
        let b1 = data[0];
        let b2 = data[1];

        if b1 & 0x70 != 0 {
            return Err(FrameError::ReservedBits);
        }
        let fin = b1 & 0x80 != 0;
        let opcode = OpCode::from_u8(b1 & 0x0F)?;
        let masked = b2 & 0x80 != 0;

        let mut n = 2;
        let payload_len = match b2 & 0x7F {
            126 => {
                if data.len() < n + 2 {
                    return Err(FrameError::Incomplete);
                }
                let len = u16::from_be_bytes([data[n], data[n + 1]]) as u64;
                n += 2;
                len
            }
            127 => {
                if data.len() < n + 8 {
                    return Err(FrameError::Incomplete);
                }
                let len = u64::from_be_bytes(data[n..n + 8].try_into().unwrap());
                n += 8;
                len
            }
            len => len as u64,
        };

        let mask = if masked {
            if data.len() < n + 4 {
                return Err(FrameError::Incomplete);
            }
            let key = [data[n], data[n + 1], data[n + 2], data[n + 3]];
            n += 4;
            Some(key)
        } else {
            None
        };

        if opcode.is_control() {
            if !fin {
                return Err(FrameError::FragmentedControl);
            }
            if payload_len > 125 {
                return Err(FrameError::OversizedControl);
            }
        }

        Ok((
            FrameHeader {
                fin,
                opcode,
                mask,
                payload_len,
            },
            n,
        ))
    }

    /// Encode the header into `buf`, returning the number of bytes written.
    pub fn encode(&self, buf: &mut [u8; MAX_HEADER_LEN]) -> usize {
        buf[0] = if self.fin { 0x80 } else { 0 } | self.opcode as u8;

        let mut n = 2;
        if self.payload_len < 126 {
            buf[1] = self.payload_len as u8;
        } else if self.payload_len <= u16::MAX as u64 {
            buf[1] = 126;
            buf[2..4].copy_from_slice(&(self.payload_len as u16).to_be_bytes());
            n += 2;
        } else {
            buf[1] = 127;
            buf[2..10].copy_from_slice(&self.payload_len.to_be_bytes());
            n += 8;
        }

        if let Some(key) = self.mask {
            buf[1] |= 0x80;
            buf[n..n + 4].copy_from_slice(&key);
            n += 4;
        }
        n
    }
}

/// XOR `data` with the masking key, starting at `offset` bytes into the
/// payload. The offset makes the mask continuous across payload parts that
/// are appended separately.
pub fn apply_mask(key: [u8; 4], offset: usize, data: &mut [u8]) {
    for (i, b) in data.iter_mut().enumerate() {
        *b ^= key[(offset + i) & 3];
    }
}

/// Compute the `Sec-WebSocket-Accept` value for a client key:
/// base64(SHA-1(key ∥ GUID)).
pub fn accept_key(client_key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(client_key.as_bytes());
    sha.update(GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(sha.finalize())
}
