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

//! Response statuses, canned error bodies, and the header buffer

use std::fmt::{self, Write};

/// Capacity of the header buffer. Status line, headers, and any inline
/// error body must fit; file bodies never pass through it.
pub const WRITE_BUFFER_SIZE: usize = 1024;

/// Status codes this server emits.
/// [RFC 9110 Section 15](https://www.rfc-editor.org/rfc/rfc9110#section-15)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// 15.3.1
    Ok,
    /// 15.5.1
    BadRequest,
    /// 15.5.4
    Forbidden,
    /// 15.5.5
    NotFound,
    /// 15.6.1
    InternalError,
}

/// Inline body sent with a 400.
pub const ERROR_400_FORM: &str =
    "Your request has bad syntax or is inherently impossible to satisfy.\n";
/// Inline body sent with a 403.
pub const ERROR_403_FORM: &str =
    "You do not have permission to get file from this server.\n";
/// Inline body sent with a 404.
pub const ERROR_404_FORM: &str = "The requested file was not found on this server.\n";
/// Inline body sent with a 500.
pub const ERROR_500_FORM: &str =
    "There was an unusual problem serving the requested file.\n";

impl Status {
    /// Numeric code.
    #[inline]
    pub fn code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::BadRequest => 400,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::InternalError => 500,
        }
    }

    /// Reason phrase.
    #[inline]
    pub fn reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::BadRequest => "Bad Request",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "Not Found",
            Self::InternalError => "Internal Error",
        }
    }

    /// Canned body served with an error status.
    pub fn form(self) -> Option<&'static str> {
        match self {
            Self::Ok => None,
            Self::BadRequest => Some(ERROR_400_FORM),
            Self::Forbidden => Some(ERROR_403_FORM),
            Self::NotFound => Some(ERROR_404_FORM),
            Self::InternalError => Some(ERROR_500_FORM),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

/// Fixed-capacity buffer the response head is formatted into.
///
/// Appends fail rather than truncate once [`WRITE_BUFFER_SIZE`] is reached;
/// the caller treats that as an internal failure and closes the connection.
#[derive(Debug)]
pub struct ResponseBuffer {
    buf: [u8; WRITE_BUFFER_SIZE],
    len: usize,
}

impl ResponseBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self {
            buf: [0; WRITE_BUFFER_SIZE],
            len: 0,
        }
    }

    /// Bytes appended so far.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Number of bytes appended so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing has been appended.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Discards all appended bytes.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Appends `HTTP/1.1 <code> <reason>`.
    pub fn status_line(&mut self, status: Status) -> bool {
        write!(self, "HTTP/1.1 {}\r\n", status).is_ok()
    }

    /// Appends the fixed header block and the blank separator line.
    pub fn headers(&mut self, content_length: usize, keep_alive: bool) -> bool {
        let connection = if keep_alive { "Keep-Alive" } else { "Close" };
        write!(
            self,
            "Content-Length: {content_length}\r\nConnection: {connection}\r\nContent-Type: text/html\r\n\r\n"
        )
        .is_ok()
    }

    /// Appends an inline body (error pages only).
    pub fn body(&mut self, content: &str) -> bool {
        self.write_str(content).is_ok()
    }
}

impl Write for ResponseBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        if self.buf.len() - self.len < bytes.len() {
            return Err(fmt::Error);
        }
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }
}

impl Default for ResponseBuffer {
    fn default() -> Self {
        Self::new()
    }
}
