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

//! Incremental HTTP/1.1 request parsing
//!
//! Two machines share the per-connection read buffer: the line scanner in
//! [`buffer`] slices the buffered bytes into CRLF-terminated lines, and the
//! request machine in [`request`] consumes those lines through the request
//! line, the header section, and the body.

use std::fmt::Display;

pub mod buffer;
pub mod request;

/// Request methods this server accepts.
/// [IETF RFC 9110 Section 9](https://www.rfc-editor.org/rfc/rfc9110#section-9)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// RFC 9110 9.3.1
    Get,
    /// RFC 9110 9.3.3
    Post,
}

impl Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Post => "POST",
        })
    }
}

/// Protocol versions the parser recognizes. Only HTTP/1.1 requests are
/// served; anything else on the request line is answered with 400.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// HTTP/1.1
    H1_1,
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::H1_1 => "HTTP/1.1",
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::io::{Error, ErrorKind, Read, Result};

    /// Reader that hands out `chunk` bytes per call and reports
    /// `WouldBlock` once drained, like a non-blocking socket with no more
    /// data pending.
    pub(crate) struct ChunkedSource<'a> {
        data: &'a [u8],
        chunk: usize,
    }

    impl<'a> ChunkedSource<'a> {
        pub(crate) fn new(data: &'a [u8], chunk: usize) -> Self {
            Self { data, chunk }
        }

        pub(crate) fn whole(data: &'a [u8]) -> Self {
            Self::new(data, data.len().max(1))
        }
    }

    impl Read for ChunkedSource<'_> {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            if self.data.is_empty() {
                return Err(Error::from(ErrorKind::WouldBlock));
            }
            let n = self.chunk.min(self.data.len()).min(buf.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    /// Reader that reports an orderly peer close.
    pub(crate) struct ClosedSource;

    impl Read for ClosedSource {
        fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
            Ok(0)
        }
    }
}
