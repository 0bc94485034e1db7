//! Hand-rolled RFC 6455 handshake and frame codec.
//!
//! This gateway does not speak plain HTTP upgrade through axum — it owns a
//! raw TCP/TLS listener so it can multiplex binary JPEG frames and text
//! control frames without going through a generic WebSocket crate's framing
//! opinions. The handshake and frame (de)serialization below are the whole
//! of RFC 6455 this service needs: no extensions, no fragmentation beyond
//! single-frame messages.

use sha1::{Digest, Sha1};

use crate::error::ConciergeError;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
pub const SUBPROTOCOL: &str = "concierge.v1";

/// Computes `Sec-WebSocket-Accept` from the client's `Sec-WebSocket-Key`.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, hasher.finalize())
}

/// Parses the `Sec-WebSocket-Key` header value out of a raw HTTP upgrade
/// request's header block (header lines already split, no leading request line).
pub fn find_header<'a>(headers: &'a str, name: &str) -> Option<&'a str> {
    headers.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case(name) {
            Some(value.trim())
        } else {
            None
        }
    })
}

/// Builds the `101 Switching Protocols` response for a validated handshake.
pub fn handshake_response(client_key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         Sec-WebSocket-Protocol: {SUBPROTOCOL}\r\n\
         \r\n",
        accept_key(client_key)
    )
}

/// The six frame opcodes this gateway recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }
}

/// A single decoded WebSocket frame (FIN bit assumed set; fragmentation is unsupported).
#[derive(Debug, Clone)]
pub struct Frame {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// Decodes one frame from the front of `buf`, returning the frame and the
/// number of bytes consumed, or `None` if `buf` doesn't yet hold a full frame.
///
/// Per RFC 6455 §5.1, every client-to-server frame must be masked; an
/// unmasked client frame is a protocol violation.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, ConciergeError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let fin_and_opcode = buf[0];
    let opcode = Opcode::from_u8(fin_and_opcode & 0x0F)
        .ok_or_else(|| ConciergeError::TokenInvalid("unknown websocket opcode".to_string()))?;

    let masked = buf[1] & 0x80 != 0;
    let mut len = (buf[1] & 0x7F) as u64;
    let mut cursor = 2usize;

    if len == 126 {
        if buf.len() < cursor + 2 {
            return Ok(None);
        }
        len = u16::from_be_bytes([buf[cursor], buf[cursor + 1]]) as u64;
        cursor += 2;
    } else if len == 127 {
        if buf.len() < cursor + 8 {
            return Ok(None);
        }
        len = u64::from_be_bytes(buf[cursor..cursor + 8].try_into().unwrap());
        cursor += 8;
    }

    let mask_key = if masked {
        if buf.len() < cursor + 4 {
            return Ok(None);
        }
        let key = [buf[cursor], buf[cursor + 1], buf[cursor + 2], buf[cursor + 3]];
        cursor += 4;
        Some(key)
    } else {
        None
    };

    let total = cursor + len as usize;
    if buf.len() < total {
        return Ok(None);
    }

    let mut payload = buf[cursor..total].to_vec();
    if let Some(key) = mask_key {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
    }

    Ok(Some((Frame { opcode, payload }, total)))
}

/// Encodes an unmasked server-to-client frame (servers never mask per RFC 6455).
pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 10);
    out.push(0x80 | opcode.as_u8());

    let len = payload.len();
    if len < 126 {
        out.push(len as u8);
    } else if len <= u16::MAX as usize {
        out.push(126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
    out.extend_from_slice(payload);
    out
}

pub fn encode_text(s: &str) -> Vec<u8> {
    encode_frame(Opcode::Text, s.as_bytes())
}

pub fn encode_binary(data: &[u8]) -> Vec<u8> {
    encode_frame(Opcode::Binary, data)
}

pub fn encode_close() -> Vec<u8> {
    encode_frame(Opcode::Close, &[])
}

pub fn encode_pong(payload: &[u8]) -> Vec<u8> {
    encode_frame(Opcode::Pong, payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_known_vector() {
        // RFC 6455 §1.3 worked example.
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn round_trips_masked_text_frame() {
        let key = [0x11, 0x22, 0x33, 0x44];
        let payload = b"hello";
        let mut masked: Vec<u8> = payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]).collect();
        let mut buf = vec![0x81, 0x80 | payload.len() as u8];
        buf.extend_from_slice(&key);
        buf.append(&mut masked);

        let (frame, consumed) = decode_frame(&buf).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn incomplete_frame_returns_none() {
        let buf = [0x81, 0x85, 0, 0, 0];
        assert!(decode_frame(&buf).unwrap().is_none());
    }

    #[test]
    fn encoded_server_frame_is_unmasked() {
        let encoded = encode_text("hi");
        assert_eq!(encoded[1] & 0x80, 0);
    }

    #[test]
    fn find_header_is_case_insensitive() {
        let headers = "Host: example.com\r\nSec-WebSocket-Key: abc123==\r\n";
        assert_eq!(find_header(headers, "sec-websocket-key"), Some("abc123=="));
    }
}
