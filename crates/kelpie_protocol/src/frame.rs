//! Frame header layout, request building and response parsing.

use bytes::{BufMut, Bytes, BytesMut};

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 24;

/// First byte of every frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Magic {
    ClientRequest = 0x80,
    ClientResponse = 0x81,
    ServerRequest = 0x82,
    ServerResponse = 0x83,
}

impl Magic {
    pub fn from_byte(byte: u8) -> Option<Magic> {
        match byte {
            0x80 => Some(Magic::ClientRequest),
            0x81 => Some(Magic::ClientResponse),
            0x82 => Some(Magic::ServerRequest),
            0x83 => Some(Magic::ServerResponse),
            _ => None,
        }
    }

    pub fn is_request(self) -> bool {
        matches!(self, Magic::ClientRequest | Magic::ServerRequest)
    }
}

/// Opcodes for server-initiated requests (sent to the auth provider).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerOpcode {
    Authenticate = 0x02,
    ActiveExternalUsers = 0x03,
    GetAuthorization = 0x04,
}

/// Opcodes for client requests emitted by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientOpcode {
    SeqnoAcknowledged = 0x57,
}

/// Payload datatype marker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Datatype {
    Raw = 0x00,
    Json = 0x01,
}

/// Response status codes. Unrecognized codes are preserved as `Other`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Success,
    KeyEnoent,
    AuthError,
    UnknownCommand,
    Einternal,
    Etmpfail,
    Other(u16),
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Success => 0x0000,
            Status::KeyEnoent => 0x0001,
            Status::AuthError => 0x0020,
            Status::UnknownCommand => 0x0081,
            Status::Einternal => 0x0084,
            Status::Etmpfail => 0x0086,
            Status::Other(code) => code,
        }
    }

    pub fn from_code(code: u16) -> Status {
        match code {
            0x0000 => Status::Success,
            0x0001 => Status::KeyEnoent,
            0x0020 => Status::AuthError,
            0x0081 => Status::UnknownCommand,
            0x0084 => Status::Einternal,
            0x0086 => Status::Etmpfail,
            other => Status::Other(other),
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Status::Success)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame truncated: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },
    #[error("bad magic byte {0:#04x}")]
    BadMagic(u8),
    #[error("section lengths exceed body length")]
    LengthMismatch,
}

/// Builder for request frames (client- or server-initiated).
///
/// Key, extras and value are optional; lengths are encoded on `build`.
#[derive(Debug, Default)]
pub struct RequestBuilder {
    magic: u8,
    opcode: u8,
    datatype: u8,
    opaque: u32,
    cas: u64,
    extras: Vec<u8>,
    key: Vec<u8>,
    value: Vec<u8>,
}

impl RequestBuilder {
    pub fn server_request(opcode: ServerOpcode) -> RequestBuilder {
        RequestBuilder {
            magic: Magic::ServerRequest as u8,
            opcode: opcode as u8,
            ..Default::default()
        }
    }

    pub fn client_request(opcode: ClientOpcode) -> RequestBuilder {
        RequestBuilder {
            magic: Magic::ClientRequest as u8,
            opcode: opcode as u8,
            ..Default::default()
        }
    }

    pub fn datatype(mut self, datatype: Datatype) -> RequestBuilder {
        self.datatype = datatype as u8;
        self
    }

    pub fn opaque(mut self, opaque: u32) -> RequestBuilder {
        self.opaque = opaque;
        self
    }

    pub fn extras(mut self, extras: &[u8]) -> RequestBuilder {
        self.extras = extras.to_vec();
        self
    }

    pub fn key(mut self, key: &[u8]) -> RequestBuilder {
        self.key = key.to_vec();
        self
    }

    pub fn value(mut self, value: &[u8]) -> RequestBuilder {
        self.value = value.to_vec();
        self
    }

    pub fn build(self) -> Bytes {
        assert!(self.key.len() <= u16::MAX as usize, "key too long");
        assert!(self.extras.len() <= u8::MAX as usize, "extras too long");
        let body_len = self.extras.len() + self.key.len() + self.value.len();
        let mut buf = BytesMut::with_capacity(HEADER_LEN + body_len);
        buf.put_u8(self.magic);
        buf.put_u8(self.opcode);
        buf.put_u16(self.key.len() as u16);
        buf.put_u8(self.extras.len() as u8);
        buf.put_u8(self.datatype);
        buf.put_u16(0); // vbucket / status
        buf.put_u32(body_len as u32);
        buf.put_u32(self.opaque);
        buf.put_u64(self.cas);
        buf.put_slice(&self.extras);
        buf.put_slice(&self.key);
        buf.put_slice(&self.value);
        buf.freeze()
    }
}

/// Parsed request frame.
#[derive(Clone, Debug)]
pub struct Request {
    pub magic: Magic,
    pub opcode: u8,
    pub datatype: u8,
    pub opaque: u32,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

/// Parsed response frame.
#[derive(Clone, Debug)]
pub struct Response {
    pub magic: Magic,
    pub opcode: u8,
    pub status: Status,
    pub opaque: u32,
    pub value: Bytes,
}

fn split_sections(buf: &[u8]) -> Result<(usize, usize, usize), FrameError> {
    let key_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    let extras_len = buf[4] as usize;
    let body_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
    if extras_len + key_len > body_len {
        return Err(FrameError::LengthMismatch);
    }
    if buf.len() < HEADER_LEN + body_len {
        return Err(FrameError::Truncated {
            needed: HEADER_LEN + body_len,
            got: buf.len(),
        });
    }
    Ok((extras_len, key_len, body_len))
}

impl Request {
    pub fn parse(buf: &[u8]) -> Result<Request, FrameError> {
        if buf.len() < HEADER_LEN {
            return Err(FrameError::Truncated {
                needed: HEADER_LEN,
                got: buf.len(),
            });
        }
        let magic = Magic::from_byte(buf[0]).ok_or(FrameError::BadMagic(buf[0]))?;
        if !magic.is_request() {
            return Err(FrameError::BadMagic(buf[0]));
        }
        let (extras_len, key_len, body_len) = split_sections(buf)?;
        let body = Bytes::copy_from_slice(&buf[HEADER_LEN..HEADER_LEN + body_len]);
        Ok(Request {
            magic,
            opcode: buf[1],
            datatype: buf[5],
            opaque: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            extras: body.slice(0..extras_len),
            key: body.slice(extras_len..extras_len + key_len),
            value: body.slice(extras_len + key_len..),
        })
    }
}

impl Response {
    pub fn parse(buf: &[u8]) -> Result<Response, FrameError> {
        if buf.len() < HEADER_LEN {
            return Err(FrameError::Truncated {
                needed: HEADER_LEN,
                got: buf.len(),
            });
        }
        let magic = Magic::from_byte(buf[0]).ok_or(FrameError::BadMagic(buf[0]))?;
        if magic.is_request() {
            return Err(FrameError::BadMagic(buf[0]));
        }
        let (extras_len, key_len, body_len) = split_sections(buf)?;
        let body = Bytes::copy_from_slice(&buf[HEADER_LEN..HEADER_LEN + body_len]);
        Ok(Response {
            magic,
            opcode: buf[1],
            status: Status::from_code(u16::from_be_bytes([buf[6], buf[7]])),
            opaque: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            value: body.slice(extras_len + key_len..),
        })
    }
}

/// Encode the seqno-acknowledgement a replica sends after its high prepared
/// seqno moves. The seqno travels as 8 big-endian extras bytes.
pub fn encode_seqno_ack(opaque: u32, seqno: u64) -> Bytes {
    RequestBuilder::client_request(ClientOpcode::SeqnoAcknowledged)
        .opaque(opaque)
        .extras(&seqno.to_be_bytes())
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_request_round_trips() {
        let frame = RequestBuilder::server_request(ServerOpcode::Authenticate)
            .datatype(Datatype::Json)
            .opaque(42)
            .value(br#"{"mechanism":"PLAIN"}"#)
            .build();
        let parsed = Request::parse(&frame).expect("parse");
        assert_eq!(parsed.magic, Magic::ServerRequest);
        assert_eq!(parsed.opcode, ServerOpcode::Authenticate as u8);
        assert_eq!(parsed.opaque, 42);
        assert!(parsed.key.is_empty());
        assert_eq!(&parsed.value[..], br#"{"mechanism":"PLAIN"}"#);
    }

    #[test]
    fn keyed_request_sections_are_sliced() {
        let frame = RequestBuilder::server_request(ServerOpcode::GetAuthorization)
            .opaque(7)
            .key(b"bob")
            .build();
        let parsed = Request::parse(&frame).expect("parse");
        assert_eq!(&parsed.key[..], b"bob");
        assert!(parsed.value.is_empty());
        assert!(parsed.extras.is_empty());
    }

    #[test]
    fn seqno_ack_extras_are_big_endian() {
        let frame = encode_seqno_ack(9, 0x0102_0304_0506_0708);
        let parsed = Request::parse(&frame).expect("parse");
        assert_eq!(parsed.magic, Magic::ClientRequest);
        assert_eq!(parsed.opcode, ClientOpcode::SeqnoAcknowledged as u8);
        assert_eq!(
            &parsed.extras[..],
            &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]
        );
    }

    #[test]
    fn response_status_is_decoded() {
        let mut buf = vec![0u8; HEADER_LEN];
        buf[0] = Magic::ServerResponse as u8;
        buf[1] = ServerOpcode::Authenticate as u8;
        buf[6] = 0x00;
        buf[7] = 0x20;
        buf[12..16].copy_from_slice(&77u32.to_be_bytes());
        let parsed = Response::parse(&buf).expect("parse");
        assert_eq!(parsed.status, Status::AuthError);
        assert_eq!(parsed.opaque, 77);
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let frame = RequestBuilder::server_request(ServerOpcode::Authenticate)
            .value(b"payload")
            .build();
        let err = Request::parse(&frame[..frame.len() - 1]).unwrap_err();
        assert!(matches!(err, FrameError::Truncated { .. }));
        let err = Response::parse(&[0x44u8; HEADER_LEN]).unwrap_err();
        assert!(matches!(err, FrameError::BadMagic(0x44)));
    }

    #[test]
    fn unknown_status_codes_are_preserved() {
        assert_eq!(Status::from_code(0x1234), Status::Other(0x1234));
        assert_eq!(Status::Other(0x1234).code(), 0x1234);
        assert!(!Status::Other(0x1234).is_success());
    }
}
