// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The request machine
//!
//! Consumes lines from the scanner through three states: request line,
//! header section, body. The machine is resumable — [`RequestParser::advance`]
//! picks up wherever the previous call ran out of buffered bytes.

use std::ops::Range;

use tracing::debug;

use super::buffer::{RequestBuffer, Scan};
use super::{Method, Version};

/// A parsed request.
///
/// `body` is a range into the connection's read buffer, valid until the
/// buffer is reset for the next request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Request method.
    pub method: Method,
    /// Normalized target: always begins with `/`; a bare `/` has already
    /// been rewritten to `/homepage.html`.
    pub target: String,
    /// Protocol version.
    pub version: Version,
    /// `Host` header value, when present.
    pub host: Option<String>,
    /// Declared body length in bytes.
    pub content_length: usize,
    /// Whether `Connection: keep-alive` was sent.
    pub keep_alive: bool,
    /// Whether this is a form submission (POST).
    pub form: bool,
    /// Body bytes, once buffered in full.
    pub body: Option<Range<usize>>,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            method: Method::Get,
            target: String::new(),
            version: Version::H1_1,
            host: None,
            content_length: 0,
            keep_alive: false,
            form: false,
            body: None,
        }
    }
}

/// Outcome of one [`RequestParser::advance`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Out of buffered bytes; arm for another read.
    Incomplete,
    /// A full request is available via [`RequestParser::request`].
    Complete,
    /// The request is malformed; answer 400.
    BadRequest,
    /// The declared body can never fit the read buffer; close without a
    /// response.
    Overflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckState {
    RequestLine,
    Headers,
    Body,
}

/// Resumable request parser.
#[derive(Debug)]
pub struct RequestParser {
    state: CheckState,
    request: Request,
}

impl RequestParser {
    /// Creates a parser waiting for a request line.
    pub fn new() -> Self {
        Self {
            state: CheckState::RequestLine,
            request: Request::default(),
        }
    }

    /// The request parsed so far. Only fully populated once `advance` has
    /// returned [`Progress::Complete`].
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Readies the parser for the next request on a kept-alive connection.
    pub fn reset(&mut self) {
        self.state = CheckState::RequestLine;
        self.request = Request::default();
    }

    /// Runs the machine over everything currently buffered.
    pub fn advance(&mut self, buf: &mut RequestBuffer) -> Progress {
        loop {
            if self.state == CheckState::Body {
                return match buf.take_body(self.request.content_length) {
                    Some(range) => {
                        self.request.body = Some(range);
                        Progress::Complete
                    }
                    None => Progress::Incomplete,
                };
            }

            let line = match buf.scan_line() {
                Scan::Line(range) => range,
                Scan::Partial => return Progress::Incomplete,
                Scan::Malformed => return Progress::BadRequest,
            };

            let step = if self.state == CheckState::RequestLine {
                self.parse_request_line(buf.bytes(line))
            } else {
                self.parse_header(buf.bytes(line), buf.capacity())
            };

            if let Some(progress) = step {
                return progress;
            }
        }
    }

    /// `<method> <target> <version>`, tokenized on spaces and tabs.
    fn parse_request_line(&mut self, line: &[u8]) -> Option<Progress> {
        let Ok(text) = std::str::from_utf8(line) else {
            return Some(Progress::BadRequest);
        };
        let mut tokens = text.split(|c| c == ' ' || c == '\t').filter(|t| !t.is_empty());

        self.request.method = match tokens.next() {
            Some("GET") => Method::Get,
            Some("POST") => {
                self.request.form = true;
                Method::Post
            }
            _ => return Some(Progress::BadRequest),
        };

        let Some(raw_target) = tokens.next() else {
            return Some(Progress::BadRequest);
        };

        self.request.version = match tokens.next() {
            Some("HTTP/1.1") => Version::H1_1,
            _ => return Some(Progress::BadRequest),
        };

        // Absolute-form targets carry a scheme and host; serve the path.
        let mut target = raw_target;
        if let Some(rest) = target.strip_prefix("http://") {
            target = match rest.find('/') {
                Some(slash) => &rest[slash..],
                None => return Some(Progress::BadRequest),
            };
        }
        if !target.starts_with('/') {
            return Some(Progress::BadRequest);
        }

        self.request.target = if target == "/" {
            "/homepage.html".to_string()
        } else {
            target.to_string()
        };

        self.state = CheckState::Headers;
        None
    }

    /// One header line, or the empty line ending the section.
    fn parse_header(&mut self, line: &[u8], capacity: usize) -> Option<Progress> {
        if line.is_empty() {
            if self.request.content_length == 0 {
                return Some(Progress::Complete);
            }
            if self.request.content_length >= capacity {
                return Some(Progress::Overflow);
            }
            self.state = CheckState::Body;
            return None;
        }

        let Ok(text) = std::str::from_utf8(line) else {
            return Some(Progress::BadRequest);
        };
        let Some((name, value)) = text.split_once(':') else {
            debug!(line = text, "ignoring header line without a colon");
            return None;
        };
        let value = value.trim();

        if name.eq_ignore_ascii_case("host") {
            self.request.host = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("content-length") {
            self.request.content_length = match value.parse() {
                Ok(n) => n,
                Err(_) => return Some(Progress::BadRequest),
            };
        } else if name.eq_ignore_ascii_case("connection") {
            if value.eq_ignore_ascii_case("keep-alive") {
                self.request.keep_alive = true;
            }
        } else {
            debug!(header = name, "ignoring unknown header");
        }

        None
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}
