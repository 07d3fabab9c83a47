//! Response side of the codec.
//!
//! Responses always carry the `Target-IP`/`Target-Port` routing pair, copied
//! from the request's `Source-*` headers by whoever produces the response.
//! The balancer relays response frames untouched; it only reads the routing
//! pair to find the client connection the frame belongs to.

use super::{frame_text, Status};
use crate::Error;

/// A parsed (or about to be encoded) response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub version: String,
    pub status: Status,
    pub location: Option<String>,
    pub allow: Option<String>,
    pub content_type: Option<String>,
    pub content_length: Option<String>,
    pub target_ip: String,
    pub target_port: String,
    pub body: String,
}

impl Response {
    /// A response with the given status, addressed to the client identified
    /// by the routing pair. This is all an error response needs; success
    /// responses add content headers and a body on top.
    pub fn new(status: Status, target_ip: impl Into<String>, target_port: impl Into<String>) -> Self {
        Self {
            version: String::from("HTTP/1.1"),
            status,
            location: None,
            allow: None,
            content_type: None,
            content_length: None,
            target_ip: target_ip.into(),
            target_port: target_port.into(),
            body: String::new(),
        }
    }

    /// Attaches a `text/plain` body and the matching `Content-Length`.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self.content_type = Some(String::from("text/plain"));
        self.content_length = Some(self.body.len().to_string());
        self
    }

    /// Serializes the response, without frame padding.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!("{} {}\r\n", self.version, self.status);

        if let Some(location) = &self.location {
            out.push_str("Location: ");
            out.push_str(location);
            out.push_str("\r\n");
        }
        if let Some(allow) = &self.allow {
            out.push_str("Allow: ");
            out.push_str(allow);
            out.push_str("\r\n");
        }
        if let Some(content_type) = &self.content_type {
            out.push_str("Content-Type: ");
            out.push_str(content_type);
            out.push_str("\r\n");
        }
        if let Some(content_length) = &self.content_length {
            out.push_str("Content-Length: ");
            out.push_str(content_length);
            out.push_str("\r\n");
        }

        out.push_str("Target-IP: ");
        out.push_str(&self.target_ip);
        out.push_str("\r\nTarget-Port: ");
        out.push_str(&self.target_port);
        out.push_str("\r\n\r\n");

        if !self.body.is_empty() {
            out.push_str(&self.body);
            out.push_str("\r\n");
        }

        out.into_bytes()
    }

    /// Parses one frame into a [`Response`]. Parsing is lenient about
    /// unrecognized headers: the consumers of responses (the load generator
    /// and the balancer's capacity probe) only care about the status, the
    /// recognized headers and the body.
    pub fn parse(frame: &[u8]) -> Result<Self, Error> {
        let text = String::from_utf8_lossy(frame_text(frame));

        let (head, body) = text
            .split_once("\r\n\r\n")
            .ok_or_else(|| Error::Protocol(String::from("response has no header block")))?;
        let body = body.strip_suffix("\r\n").unwrap_or(body);

        let mut lines = head.split("\r\n");
        let start_line = lines.next().unwrap_or_default();
        let mut tokens = start_line.split_whitespace();

        let (Some(version), Some(code)) = (tokens.next(), tokens.next()) else {
            return Err(Error::Protocol(format!("bad status line: {start_line:?}")));
        };

        let status = code
            .parse::<u16>()
            .ok()
            .and_then(Status::from_code)
            .ok_or_else(|| Error::Protocol(format!("unknown status code: {code}")))?;

        let mut response = Self::new(status, "", "");
        response.version = version.to_string();
        response.body = body.to_string();

        for line in lines {
            let Some((name, value)) = line.split_once(": ") else {
                continue;
            };

            match name {
                "Location" => response.location = Some(value.to_string()),
                "Allow" => response.allow = Some(value.to_string()),
                "Content-Type" => response.content_type = Some(value.to_string()),
                "Content-Length" => response.content_length = Some(value.to_string()),
                "Target-IP" => response.target_ip = value.to_string(),
                "Target-Port" => response.target_port = value.to_string(),
                _ => {}
            }
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_parse_round_trip() {
        let response =
            Response::new(Status::Ok, "127.0.0.1", "49152").with_body("message to get");

        let parsed = Response::parse(&response.encode()).unwrap();

        assert_eq!(parsed, response);
        assert_eq!(parsed.content_length.as_deref(), Some("14"));
    }

    #[test]
    fn error_responses_only_carry_the_routing_pair() {
        let encoded = Response::new(Status::ServiceUnavailable, "127.0.0.1", "5000").encode();
        let text = String::from_utf8(encoded).unwrap();

        assert!(text.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
        assert!(text.contains("Target-IP: 127.0.0.1\r\n"));
        assert!(text.contains("Target-Port: 5000\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn capacity_probe_body_parses_back() {
        let response = Response::new(Status::Ok, "127.0.0.1", "60000").with_body("10");
        let parsed = Response::parse(&response.encode()).unwrap();

        assert_eq!(parsed.body, "10");
        assert_eq!(parsed.status, Status::Ok);
    }

    #[test]
    fn unknown_status_codes_are_rejected() {
        let frame = b"HTTP/1.1 418 I'm a teapot\r\n\r\n";
        assert!(Response::parse(frame).is_err());
    }
}
