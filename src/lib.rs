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

#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! brisk is a small HTTP/1.1 server built for high concurrent connection
//! counts on a single host.
//!
//! A single reactor thread multiplexes the listening socket, a signal
//! source, and every connection socket over one poll handle. Read-ready
//! connections are handed to a pool of worker threads that parse the
//! request incrementally and prepare the response: static files are
//! memory-mapped and sent with vectored writes, and two form endpoints run
//! login and registration against a bounded database connection pool. Idle
//! connections are reclaimed by an expiry-sorted timer wheel advanced on a
//! periodic alarm.

pub mod config;
pub mod connection;
pub mod db;
pub mod error;
pub mod handler;
pub mod listener;
pub mod parser;
pub mod response;
pub mod sync;
pub mod timer;
pub mod worker;

pub use error::{Error, Result};
