//! Request side of the codec. A request looks like this on the wire (before
//! frame padding):
//!
//! ```text
//! GET ./download.txt HTTP/1.1\r\n
//! Host: localhost\r\n
//! Accept: *\r\n
//! Source-IP: 127.0.0.1\r\n
//! Source-Port: 49152\r\n
//! \r\n
//! ```
//!
//! `Source-IP` and `Source-Port` are the routing headers: workers copy them
//! into `Target-IP`/`Target-Port` on the response, which is the only
//! mechanism the balancer has to correlate a response with the client that
//! is waiting for it.

use super::{frame_text, Method, Status};

/// Headers recognized on requests. Anything else is a protocol error.
const RECOGNIZED: [&str; 6] = [
    "Host",
    "Accept",
    "Content-Type",
    "Content-Length",
    "Source-IP",
    "Source-Port",
];

/// A parsed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub version: String,
    pub host: Option<String>,
    pub accept: Option<String>,
    pub content_type: Option<String>,
    pub content_length: Option<String>,
    pub source_ip: Option<String>,
    pub source_port: Option<String>,
    pub body: String,
}

/// A request that could not be parsed. The status tells the caller which
/// error response to synthesize; the routing pair is whatever `Source-*`
/// headers could still be recovered, so even the error can find its way back
/// to the right client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestError {
    pub status: Status,
    pub target_ip: String,
    pub target_port: String,
}

impl Request {
    /// Creates a request with the mandatory start line pieces; headers and
    /// body start out empty and are filled in by the caller.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            version: String::from("HTTP/1.1"),
            host: None,
            accept: None,
            content_type: None,
            content_length: None,
            source_ip: None,
            source_port: None,
            body: String::new(),
        }
    }

    /// Sets the routing headers. Every request sent through the balancer
    /// needs them.
    pub fn source(mut self, ip: impl Into<String>, port: impl Into<String>) -> Self {
        self.source_ip = Some(ip.into());
        self.source_port = Some(port.into());
        self
    }

    /// Serializes the request, without frame padding.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.method, self.url, self.version);

        let headers = [
            ("Host", &self.host),
            ("Accept", &self.accept),
            ("Content-Type", &self.content_type),
            ("Content-Length", &self.content_length),
            ("Source-IP", &self.source_ip),
            ("Source-Port", &self.source_port),
        ];

        for (name, value) in headers {
            if let Some(value) = value {
                out.push_str(name);
                out.push_str(": ");
                out.push_str(value);
                out.push_str("\r\n");
            }
        }

        out.push_str("\r\n");

        if !self.body.is_empty() {
            out.push_str(&self.body);
            out.push_str("\r\n");
        }

        out.into_bytes()
    }

    /// Parses one frame into a [`Request`].
    ///
    /// Error precedence follows the protocol rules: a version other than
    /// `HTTP/1.1` is `505`, an unrecognized method is `405`, and a header the
    /// method does not admit is `400`. Headers are scanned even on the error
    /// paths so the routing pair survives.
    pub fn parse(frame: &[u8]) -> Result<Self, RequestError> {
        let text = String::from_utf8_lossy(frame_text(frame));

        let (head, body) = match text.split_once("\r\n\r\n") {
            Some((head, body)) => (head, body.strip_suffix("\r\n").unwrap_or(body)),
            None => return Err(RequestError::bare(Status::BadRequest)),
        };

        let mut lines = head.split("\r\n");
        let start_line = lines.next().unwrap_or_default();
        let mut tokens = start_line.split_whitespace();

        let (Some(method_token), Some(url), Some(version)) =
            (tokens.next(), tokens.next(), tokens.next())
        else {
            return Err(RequestError::bare(Status::BadRequest));
        };

        let method = Method::from_token(method_token);

        let mut request = Self {
            method: method.unwrap_or(Method::Get),
            url: url.to_string(),
            version: version.to_string(),
            host: None,
            accept: None,
            content_type: None,
            content_length: None,
            source_ip: None,
            source_port: None,
            body: body.to_string(),
        };

        let mut unknown_header = false;

        for line in lines {
            if line.is_empty() {
                continue;
            }

            let Some((name, value)) = line.split_once(": ") else {
                unknown_header = true;
                continue;
            };

            match name {
                "Host" => request.host = Some(value.to_string()),
                "Accept" => request.accept = Some(value.to_string()),
                "Content-Type" => request.content_type = Some(value.to_string()),
                "Content-Length" => request.content_length = Some(value.to_string()),
                "Source-IP" => request.source_ip = Some(value.to_string()),
                "Source-Port" => request.source_port = Some(value.to_string()),
                _ => unknown_header = true,
            }

            if let Some(method) = method {
                if RECOGNIZED.contains(&name) && !admits(method, name) {
                    unknown_header = true;
                }
            }
        }

        if request.version != "HTTP/1.1" {
            return Err(request.into_error(Status::VersionNotSupported));
        }

        if method.is_none() {
            return Err(request.into_error(Status::MethodNotAllowed));
        }

        if unknown_header {
            return Err(request.into_error(Status::BadRequest));
        }

        Ok(request)
    }

    /// The routing pair of this request, with missing headers mapped to
    /// empty strings.
    pub fn routing_pair(&self) -> (String, String) {
        (
            self.source_ip.clone().unwrap_or_default(),
            self.source_port.clone().unwrap_or_default(),
        )
    }

    fn into_error(self, status: Status) -> RequestError {
        let (target_ip, target_port) = self.routing_pair();

        RequestError {
            status,
            target_ip,
            target_port,
        }
    }
}

impl RequestError {
    fn bare(status: Status) -> Self {
        Self {
            status,
            target_ip: String::new(),
            target_port: String::new(),
        }
    }
}

/// Whether `method` admits the (recognized) header `name`. `Content-Type`
/// and `Content-Length` only make sense on requests that carry a body;
/// `Accept` only on requests that expect one.
fn admits(method: Method, name: &str) -> bool {
    match name {
        "Host" | "Source-IP" | "Source-Port" => true,
        "Accept" => matches!(
            method,
            Method::Get | Method::Head | Method::Trace | Method::Options
        ),
        "Content-Type" | "Content-Length" => matches!(method, Method::Put | Method::Post),
        _ => false,
    }
}
