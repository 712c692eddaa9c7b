//! Minimal blocking HTTP/1.1 framing for the redo endpoint.

use std::fmt::Write as _;
use std::io::{Read, Write};

use httparse::Status;

use crate::{Error, Result};

const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// A request with its body fully buffered.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Read one request. Requires `Content-Length` for a body.
pub fn read_request(stream: &mut impl Read) -> Result<HttpRequest> {
    let mut buffer = Vec::new();
    let mut temp = [0u8; 4096];
    let header_len = loop {
        let read = stream.read(&mut temp)?;
        if read == 0 {
            return Err(Error::http("connection closed while reading headers"));
        }
        buffer.extend_from_slice(&temp[..read]);
        if let Some(pos) = find_header_terminator(&buffer) {
            break pos + 4;
        }
        if buffer.len() > MAX_HEADER_BYTES {
            return Err(Error::http("HTTP headers exceed limit"));
        }
    };

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut request = httparse::Request::new(&mut headers);
    match request.parse(&buffer) {
        Ok(Status::Complete(_)) => {}
        Ok(Status::Partial) => return Err(Error::http("incomplete HTTP request headers")),
        Err(err) => return Err(Error::http(format!("failed to parse HTTP request: {}", err))),
    }

    let method = request
        .method
        .ok_or_else(|| Error::http("HTTP method missing"))?
        .to_string();
    let path = request
        .path
        .ok_or_else(|| Error::http("HTTP path missing"))?;
    let path = path.split('?').next().unwrap_or(path).to_string();

    let mut header_pairs = Vec::with_capacity(request.headers.len());
    for header in request.headers.iter() {
        let value = std::str::from_utf8(header.value)
            .map_err(|_| Error::http(format!("invalid value for header {}", header.name)))?;
        header_pairs.push((header.name.to_string(), value.trim().to_string()));
    }

    let content_length = match header_pairs
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
    {
        Some((_, value)) => value
            .parse::<usize>()
            .map_err(|_| Error::http("invalid Content-Length"))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(Error::http("HTTP body exceeds limit"));
    }

    let mut body = Vec::with_capacity(content_length);
    let buffered = &buffer[header_len..];
    body.extend_from_slice(&buffered[..buffered.len().min(content_length)]);
    while body.len() < content_length {
        let read = stream.read(&mut temp)?;
        if read == 0 {
            return Err(Error::http("connection closed before HTTP body completed"));
        }
        let wanted = content_length - body.len();
        body.extend_from_slice(&temp[..read.min(wanted)]);
    }

    Ok(HttpRequest {
        method,
        path,
        headers: header_pairs,
        body,
    })
}

/// Write an empty-bodied response and close the exchange.
pub fn write_response(stream: &mut impl Write, status: u16) -> Result<()> {
    let mut head = String::new();
    // Writing into a String cannot fail.
    let _ = write!(
        head,
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status,
        status_text(status)
    );
    stream.write_all(head.as_bytes())?;
    stream.flush()?;
    Ok(())
}

/// Status code of a complete response held in `buffer`.
pub fn parse_response_status(buffer: &[u8]) -> Result<u16> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(buffer) {
        Ok(Status::Complete(_)) => {}
        _ => return Err(Error::http("failed to parse HTTP response")),
    }
    response
        .code
        .ok_or_else(|| Error::http("HTTP response missing status code"))
}

fn find_header_terminator(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|window| window == b"\r\n\r\n")
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
