// Copyright 2024 Tessera Contributors
// This file is part of the tessera library.

// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:

// http://www.apache.org/licenses/LICENSE-2.0

// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A minimal HTTP/1.1 layer for the peer upgrade: enough to read one request
//! or response off an established stream, with residual bytes preserved for
//! the peer session that follows.

use bytes::BytesMut;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// The maximum accepted size of a request or response head.
pub const MAXIMUM_HEADER_BYTES: usize = 8 * 1024;
/// The maximum accepted size of a response body.
pub const MAXIMUM_BODY_BYTES: usize = 64 * 1024;
/// The maximum number of headers in a request or response.
const MAXIMUM_HEADERS: usize = 32;

/// A parsed HTTP request head.
#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    /// Returns the value of the given header, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        header(&self.headers, name)
    }
}

/// A parsed HTTP response, including its body.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Returns the value of the given header, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        header(&self.headers, name)
    }
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
}

fn invalid(reason: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason.to_string())
}

/// Reads one request head off the stream. Returns the parsed head and any
/// residual bytes read past it.
pub async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<(HttpRequest, BytesMut)> {
    let mut buffer = BytesMut::with_capacity(1024);
    loop {
        let parsed = {
            let mut headers = [httparse::EMPTY_HEADER; MAXIMUM_HEADERS];
            let mut request = httparse::Request::new(&mut headers);
            match request.parse(&buffer) {
                Ok(httparse::Status::Complete(len)) => Some((len, HttpRequest {
                    method: request.method.unwrap_or_default().to_string(),
                    target: request.path.unwrap_or_default().to_string(),
                    headers: owned_headers(request.headers),
                })),
                Ok(httparse::Status::Partial) => None,
                Err(error) => return Err(invalid(&format!("malformed request ({error})"))),
            }
        };
        if let Some((len, request)) = parsed {
            if len > MAXIMUM_HEADER_BYTES {
                return Err(invalid("request headers exceed the size limit"));
            }
            let residue = buffer.split_off(len);
            return Ok((request, residue));
        }

        if buffer.len() > MAXIMUM_HEADER_BYTES {
            return Err(invalid("request headers exceed the size limit"));
        }
        if stream.read_buf(&mut buffer).await? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
    }
}

/// Reads one response off the stream, including a `Content-Length` delimited
/// body. Returns the response and any residual bytes read past it.
pub async fn read_response<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<(HttpResponse, BytesMut)> {
    let mut buffer = BytesMut::with_capacity(1024);
    loop {
        let parsed = {
            let mut headers = [httparse::EMPTY_HEADER; MAXIMUM_HEADERS];
            let mut response = httparse::Response::new(&mut headers);
            match response.parse(&buffer) {
                Ok(httparse::Status::Complete(len)) => Some((len, HttpResponse {
                    status: response.code.unwrap_or_default(),
                    reason: response.reason.unwrap_or_default().to_string(),
                    headers: owned_headers(response.headers),
                    body: Vec::new(),
                })),
                Ok(httparse::Status::Partial) => None,
                Err(error) => return Err(invalid(&format!("malformed response ({error})"))),
            }
        };
        if let Some((len, mut response)) = parsed {
            if len > MAXIMUM_HEADER_BYTES {
                return Err(invalid("response headers exceed the size limit"));
            }
            let mut residue = buffer.split_off(len);

            // Read the body, if the response declares one.
            let content_length = match response.header("Content-Length") {
                Some(value) => value.parse::<usize>().map_err(|_| invalid("bad Content-Length"))?,
                None => 0,
            };
            if content_length > MAXIMUM_BODY_BYTES {
                return Err(invalid("response body exceeds the size limit"));
            }
            while residue.len() < content_length {
                if stream.read_buf(&mut residue).await? == 0 {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
            }
            response.body = residue.split_to(content_length).to_vec();
            return Ok((response, residue));
        }

        if buffer.len() > MAXIMUM_HEADER_BYTES {
            return Err(invalid("response headers exceed the size limit"));
        }
        if stream.read_buf(&mut buffer).await? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
    }
}

fn owned_headers(headers: &[httparse::Header<'_>]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
        .collect()
}

/// Encodes a GET request head with the given headers.
pub fn encode_request(target: &str, headers: &[(String, String)]) -> Vec<u8> {
    let mut out = format!("GET {target} HTTP/1.1\r\n");
    for (name, value) in headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str("\r\n");
    out.into_bytes()
}

/// Encodes a response with the given status line, headers, and body. A
/// `Content-Length` header is appended whenever a body is present.
pub fn encode_response(status: u16, reason: &str, headers: &[(String, String)], body: &[u8]) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {status} {reason}\r\n");
    for (name, value) in headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    if !body.is_empty() {
        out.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    out.push_str("\r\n");
    let mut out = out.into_bytes();
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_request_with_residue() {
        let encoded = encode_request("/", &[("Upgrade".to_string(), "TSRP/1.1".to_string())]);
        let mut wire = encoded.clone();
        wire.extend_from_slice(b"early frame bytes");

        let mut stream: &[u8] = &wire;
        let (request, residue) = read_request(&mut stream).await.unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.target, "/");
        assert_eq!(request.header("upgrade"), Some("TSRP/1.1"));
        assert_eq!(&residue[..], b"early frame bytes");
    }

    #[tokio::test]
    async fn test_read_response_with_body() {
        let body = br#"{"peer-ips":["192.0.2.1:2459"]}"#;
        let encoded = encode_response(503, "Service Unavailable", &[], body);

        let mut stream: &[u8] = &encoded;
        let (response, residue) = read_response(&mut stream).await.unwrap();
        assert_eq!(response.status, 503);
        assert_eq!(response.body, body);
        assert!(residue.is_empty());
    }

    #[tokio::test]
    async fn test_oversize_headers_are_rejected() {
        let filler = "x".repeat(MAXIMUM_HEADER_BYTES);
        let encoded = encode_request("/", &[("Filler".to_string(), filler)]);

        let mut stream: &[u8] = &encoded;
        assert!(read_request(&mut stream).await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_request_is_an_error() {
        let mut stream: &[u8] = b"GET / HTTP/1.1\r\nUpgrade: TSRP";
        let error = read_request(&mut stream).await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::UnexpectedEof);
    }
}
