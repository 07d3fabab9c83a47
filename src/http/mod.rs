//! Fixed-size HTTP/1.1 style frames.
//!
//! Every message exchanged between the client generator, the balancer and the
//! workers travels as exactly [`FRAME_SIZE`] bytes on the wire: the encoded
//! text (start line, CRLF-terminated header lines, a blank line and an
//! optional body) padded with NUL bytes. One readiness event therefore always
//! corresponds to one whole message and no partial-frame state has to be kept
//! across events.
//!
//! The codec is intentionally small. Requests and responses recognize a fixed
//! set of headers (see [`request`] and [`response`]); the non-standard
//! `SERVERCHECK` method is spoken only between the balancer and workers to
//! learn a worker's capacity.

pub mod request;
pub mod response;

use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::Error;

/// Size of every message on the wire, padding included.
pub const FRAME_SIZE: usize = 4096;

/// Methods understood by the worker's handlers. `SERVERCHECK` is internal to
/// the balancer/worker pair and is never advertised to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Put,
    Post,
    Trace,
    Options,
    Delete,
    ServerCheck,
}

/// Value of the `Allow` response header. `SERVERCHECK` is deliberately
/// absent, it should not be transparent to clients.
pub const ALLOW: &str = "GET, HEAD, PUT, POST, TRACE, OPTIONS, DELETE";

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Trace => "TRACE",
            Method::Options => "OPTIONS",
            Method::Delete => "DELETE",
            Method::ServerCheck => "SERVERCHECK",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "GET" => Some(Method::Get),
            "HEAD" => Some(Method::Head),
            "PUT" => Some(Method::Put),
            "POST" => Some(Method::Post),
            "TRACE" => Some(Method::Trace),
            "OPTIONS" => Some(Method::Options),
            "DELETE" => Some(Method::Delete),
            "SERVERCHECK" => Some(Method::ServerCheck),
            _ => None,
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status codes used by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Created,
    BadRequest,
    Unauthorized,
    NotFound,
    MethodNotAllowed,
    UrlTooLong,
    InternalServerError,
    ServiceUnavailable,
    VersionNotSupported,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::Created => 201,
            Status::BadRequest => 400,
            Status::Unauthorized => 401,
            Status::NotFound => 404,
            Status::MethodNotAllowed => 405,
            Status::UrlTooLong => 414,
            Status::InternalServerError => 500,
            Status::ServiceUnavailable => 503,
            Status::VersionNotSupported => 505,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Created => "Created",
            Status::BadRequest => "Bad Request",
            Status::Unauthorized => "Unauthorized",
            Status::NotFound => "Not Found",
            Status::MethodNotAllowed => "Method Not Allowed",
            Status::UrlTooLong => "Request URL Too Long",
            Status::InternalServerError => "Internal Server Error",
            Status::ServiceUnavailable => "Service Unavailable",
            Status::VersionNotSupported => "HTTP Version Not Supported",
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            200 => Some(Status::Ok),
            201 => Some(Status::Created),
            400 => Some(Status::BadRequest),
            401 => Some(Status::Unauthorized),
            404 => Some(Status::NotFound),
            405 => Some(Status::MethodNotAllowed),
            414 => Some(Status::UrlTooLong),
            500 => Some(Status::InternalServerError),
            503 => Some(Status::ServiceUnavailable),
            505 => Some(Status::VersionNotSupported),
            _ => None,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

/// Reads one whole frame from `stream`. Returns `None` on a clean EOF, that
/// is, the peer closed the connection between messages. An EOF in the middle
/// of a frame is an error.
pub async fn read_frame<R>(stream: &mut R) -> io::Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::zeroed(FRAME_SIZE);
    let mut filled = 0;

    while filled < FRAME_SIZE {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed in the middle of a frame",
            ));
        }
        filled += n;
    }

    Ok(Some(buf.freeze()))
}

/// Stateful frame reader for use inside `select!` loops. Unlike
/// [`read_frame`], a partially received frame survives the future being
/// dropped: the bytes stay buffered here and the next call picks up where
/// the last one left off.
pub struct FrameReader<R> {
    stream: R,
    buf: BytesMut,
    filled: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(stream: R) -> Self {
        Self {
            stream,
            buf: BytesMut::zeroed(FRAME_SIZE),
            filled: 0,
        }
    }

    /// Reads the next whole frame. Same contract as [`read_frame`]: `None`
    /// on a clean EOF between frames, an error on an EOF inside one.
    pub async fn next(&mut self) -> io::Result<Option<Bytes>> {
        while self.filled < FRAME_SIZE {
            let n = self.stream.read(&mut self.buf[self.filled..]).await?;
            if n == 0 {
                if self.filled == 0 {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed in the middle of a frame",
                ));
            }
            self.filled += n;
        }

        self.filled = 0;
        let frame = std::mem::replace(&mut self.buf, BytesMut::zeroed(FRAME_SIZE));

        Ok(Some(frame.freeze()))
    }
}

/// Writes `payload` to `stream` as one frame, padded with NUL bytes up to
/// [`FRAME_SIZE`].
pub async fn write_frame<W>(stream: &mut W, payload: &[u8]) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > FRAME_SIZE {
        return Err(Error::FrameTooLarge(payload.len()));
    }

    let mut frame = BytesMut::zeroed(FRAME_SIZE);
    frame[..payload.len()].copy_from_slice(payload);
    stream.write_all(&frame).await?;

    Ok(())
}

/// The text of a frame without the NUL padding.
pub fn frame_text(frame: &[u8]) -> &[u8] {
    let end = frame
        .iter()
        .position(|&byte| byte == 0)
        .unwrap_or(frame.len());
    &frame[..end]
}

/// Scans a raw frame for a `Name: value` header line and returns the value.
/// This is what the balancer uses to route frames without parsing them: it
/// only ever needs `Target-IP`, `Target-Port` or `Host` from messages it
/// otherwise relays untouched.
pub fn peek_header(frame: &[u8], name: &str) -> Option<String> {
    let text = frame_text(frame);
    let needle = format!("{name}: ").into_bytes();

    let start = text
        .windows(needle.len())
        .position(|window| window == needle)?
        + needle.len();

    let end = text[start..]
        .windows(2)
        .position(|window| window == b"\r\n")
        .map(|i| start + i)?;

    Some(String::from_utf8_lossy(&text[start..end]).into_owned())
}
