//! Message kinds and envelope bodies.
//!
//! A message on a stream is a single kind byte followed by a kind-specific
//! body. Requests open a call; responses answer it; the stream kinds carry
//! the optional client-to-server and server-to-client streams.

use crate::binary::{read_u8, read_u16};
use crate::error::RpcError;
use crate::metadata::Metadata;
use crate::status::{BadStatus, Status, STATUS_DESCRIPTION_KEY};
use arf_proto::{decode_string, decode_value, encode_string, encode_value, DecodeError, Value};
use bytes::{BufMut, BytesMut};
use std::fmt;
use std::io::Read;

/// Flag bit 0 on requests and responses: the sender will stream.
const FLAG_STREAMING: u8 = 0x01;

/// The kind byte at the head of every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Invalid = 0x00,
    Request = 0x01,
    Response = 0x02,
    StartStream = 0x03,
    StreamItem = 0x04,
    StreamMetadata = 0x05,
    EndStream = 0x06,
    StreamError = 0x07,
}

impl MessageKind {
    pub fn from_byte(b: u8) -> MessageKind {
        match b {
            0x01 => MessageKind::Request,
            0x02 => MessageKind::Response,
            0x03 => MessageKind::StartStream,
            0x04 => MessageKind::StreamItem,
            0x05 => MessageKind::StreamMetadata,
            0x06 => MessageKind::EndStream,
            0x07 => MessageKind::StreamError,
            _ => MessageKind::Invalid,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Invalid => "Invalid",
            MessageKind::Request => "Request",
            MessageKind::Response => "Response",
            MessageKind::StartStream => "StartStream",
            MessageKind::StreamItem => "StreamItem",
            MessageKind::StreamMetadata => "StreamMetadata",
            MessageKind::EndStream => "EndStream",
            MessageKind::StreamError => "StreamError",
        };
        f.write_str(name)
    }
}

/// A call request: service, method, metadata and initial parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Request {
    pub service: String,
    pub method: String,
    pub streaming: bool,
    pub metadata: Metadata,
    pub params: Vec<Value>,
}

impl Request {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            ..Default::default()
        }
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        encode_string(&self.service, buf);
        encode_string(&self.method, buf);
        buf.put_u8(if self.streaming { FLAG_STREAMING } else { 0 });
        self.metadata.encode(buf);
        buf.put_u16(self.params.len() as u16);
        for param in &self.params {
            encode_value(param, buf);
        }
    }

    fn decode_body(r: &mut dyn Read) -> Result<Self, DecodeError> {
        let service = decode_string(r)?;
        let method = decode_string(r)?;
        let flags = read_u8(r)?;
        let metadata = Metadata::decode(r)?;
        let params = decode_params(r)?;
        Ok(Self {
            service,
            method,
            streaming: flags & FLAG_STREAMING != 0,
            metadata,
            params,
        })
    }
}

/// A call response: status, metadata and result parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    pub status: u16,
    pub streaming: bool,
    pub metadata: Metadata,
    pub params: Vec<Value>,
}

impl Response {
    pub fn ok(params: Vec<Value>) -> Self {
        Self {
            status: Status::Ok.code(),
            params,
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok.code()
    }

    /// Splits the response into result parameters or a rich status error.
    ///
    /// Non-OK responses use the description carried in metadata when the
    /// handler supplied one, falling back to the status text.
    pub fn result(&self) -> Result<&[Value], BadStatus> {
        if self.is_ok() {
            return Ok(&self.params);
        }
        let code = Status::from_u16(self.status).unwrap_or(Status::Unknown);
        let message = self
            .metadata
            .lookup_string(STATUS_DESCRIPTION_KEY)
            .unwrap_or_else(|| code.to_string());
        Err(BadStatus::new(code, message))
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u16(self.status);
        buf.put_u8(if self.streaming { FLAG_STREAMING } else { 0 });
        self.metadata.encode(buf);
        buf.put_u16(self.params.len() as u16);
        for param in &self.params {
            encode_value(param, buf);
        }
    }

    fn decode_body(r: &mut dyn Read) -> Result<Self, DecodeError> {
        let status = read_u16(r)?;
        let flags = read_u8(r)?;
        let metadata = Metadata::decode(r)?;
        let params = decode_params(r)?;
        Ok(Self {
            status,
            streaming: flags & FLAG_STREAMING != 0,
            metadata,
            params,
        })
    }
}

/// One item of a streamed exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamItem {
    pub value: Value,
}

/// Metadata emitted mid-stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamMetadata {
    pub metadata: Metadata,
}

/// Terminates a stream with a non-OK status.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamError {
    pub status: u16,
    pub metadata: Metadata,
}

impl StreamError {
    /// Converts the message into the error surfaced to consumers.
    pub fn to_bad_status(&self) -> BadStatus {
        let code = Status::from_u16(self.status).unwrap_or(Status::Unknown);
        let message = self
            .metadata
            .lookup_string(STATUS_DESCRIPTION_KEY)
            .unwrap_or_else(|| code.to_string());
        BadStatus::new(code, message)
    }
}

fn decode_params(r: &mut dyn Read) -> Result<Vec<Value>, DecodeError> {
    let count = read_u16(r)? as usize;
    let mut params = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        params.push(decode_value(r)?);
    }
    Ok(params)
}

/// Any message riding a stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    StartStream,
    StreamItem(StreamItem),
    StreamMetadata(StreamMetadata),
    EndStream,
    StreamError(StreamError),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Request(_) => MessageKind::Request,
            Message::Response(_) => MessageKind::Response,
            Message::StartStream => MessageKind::StartStream,
            Message::StreamItem(_) => MessageKind::StreamItem,
            Message::StreamMetadata(_) => MessageKind::StreamMetadata,
            Message::EndStream => MessageKind::EndStream,
            Message::StreamError(_) => MessageKind::StreamError,
        }
    }

    /// Encodes the message with its kind byte prefix.
    pub fn wrap(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(self.kind() as u8);
        match self {
            Message::Request(m) => m.encode_body(&mut buf),
            Message::Response(m) => m.encode_body(&mut buf),
            Message::StartStream | Message::EndStream => {}
            Message::StreamItem(m) => encode_value(&m.value, &mut buf),
            Message::StreamMetadata(m) => m.metadata.encode(&mut buf),
            Message::StreamError(m) => {
                buf.put_u16(m.status);
                m.metadata.encode(&mut buf);
            }
        }
        buf
    }

    /// Reads one message: a kind byte, then the kind-specific body.
    pub fn decode(r: &mut dyn Read) -> Result<Message, RpcError> {
        let raw = read_u8(r)?;
        let kind = MessageKind::from_byte(raw);
        match kind {
            MessageKind::Invalid => Err(RpcError::InvalidKind(raw)),
            MessageKind::Request => Ok(Message::Request(Request::decode_body(r)?)),
            MessageKind::Response => Ok(Message::Response(Response::decode_body(r)?)),
            MessageKind::StartStream => Ok(Message::StartStream),
            MessageKind::EndStream => Ok(Message::EndStream),
            MessageKind::StreamItem => Ok(Message::StreamItem(StreamItem {
                value: decode_value(r)?,
            })),
            MessageKind::StreamMetadata => Ok(Message::StreamMetadata(StreamMetadata {
                metadata: Metadata::decode(r)?,
            })),
            MessageKind::StreamError => {
                let status = read_u16(r)?;
                let metadata = Metadata::decode(r)?;
                Ok(Message::StreamError(StreamError { status, metadata }))
            }
        }
    }

    /// Unwraps a response, failing with a kind mismatch otherwise.
    pub fn into_response(self) -> Result<Response, RpcError> {
        match self {
            Message::Response(resp) => Ok(resp),
            other => Err(RpcError::KindMismatch {
                expected: MessageKind::Response,
                received: other.kind(),
            }),
        }
    }

    /// Unwraps a request, failing with a kind mismatch otherwise.
    pub fn into_request(self) -> Result<Request, RpcError> {
        match self {
            Message::Request(req) => Ok(req),
            other => Err(RpcError::KindMismatch {
                expected: MessageKind::Request,
                received: other.kind(),
            }),
        }
    }
}
