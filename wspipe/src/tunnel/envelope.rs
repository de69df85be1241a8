//! Frame codec for tunneled messages.
//!
//! Wire layout inside a single WebSocket Binary frame:
//!
//! | offset | length | field        |
//! |-------:|-------:|--------------|
//! | 0      | 1      | message kind |
//! | 1      | 16     | message id   |
//! | 17     | ..     | payload      |
//!
//! The payload is the HTTP message in RFC 7230 wire form; the codec is a
//! pure transport and never interprets it.

use bytes::{BufMut, Bytes, BytesMut};
use url::Url;
use uuid::Uuid;

use crate::error::TunnelError;
use crate::tunnel::http_wire::{WireRequest, WireResponse};

const HEADER_LEN: usize = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Request = 0,
    Response = 1,
}

impl MessageKind {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            _ => None,
        }
    }
}

/// A tunneled message. The kind byte is carried raw; it is only validated at
/// the typed decode sites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: u8,
    pub id: Uuid,
    pub message: Bytes,
}

impl Envelope {
    /// Wrap an HTTP request under a fresh message id.
    pub fn request(req: &WireRequest) -> Self {
        Self {
            kind: MessageKind::Request as u8,
            id: Uuid::new_v4(),
            message: req.to_wire(),
        }
    }

    /// Wrap an HTTP response, echoing the originating request's id.
    pub fn response(res: &WireResponse, id: Uuid) -> Self {
        Self {
            kind: MessageKind::Response as u8,
            id,
            message: res.to_wire(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.message.len());
        buf.put_u8(self.kind);
        buf.put_slice(self.id.as_bytes());
        buf.put_slice(&self.message);
        buf.freeze()
    }

    pub fn decode(frame: &[u8]) -> Result<Self, TunnelError> {
        if frame.len() < HEADER_LEN {
            return Err(TunnelError::MalformedFrame("frame shorter than header"));
        }
        let id = Uuid::from_slice(&frame[1..HEADER_LEN])
            .map_err(|_| TunnelError::MalformedFrame("invalid message id"))?;

        Ok(Self {
            kind: frame[0],
            id,
            message: Bytes::copy_from_slice(&frame[HEADER_LEN..]),
        })
    }

    pub fn decode_request(&self) -> Result<WireRequest, TunnelError> {
        self.expect_kind(MessageKind::Request)?;
        WireRequest::from_wire(&self.message)
    }

    pub fn decode_response(&self) -> Result<WireResponse, TunnelError> {
        self.expect_kind(MessageKind::Response)?;
        WireResponse::from_wire(&self.message)
    }

    /// Decode a request and rewrite its target against the upstream base URL,
    /// yielding a request ready for a direct client dispatch.
    pub fn decode_request_with_base(
        &self,
        base: &Url,
    ) -> Result<hyper::Request<http_body_util::Full<Bytes>>, TunnelError> {
        self.decode_request()?.into_upstream(base)
    }

    fn expect_kind(&self, expected: MessageKind) -> Result<(), TunnelError> {
        if self.kind != expected as u8 {
            return Err(TunnelError::TypeMismatch {
                expected: expected as u8,
                found: self.kind,
            });
        }
        Ok(())
    }
}
