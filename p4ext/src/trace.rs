/*
Copyright (c) 2021 VMware, Inc.
SPDX-License-Identifier: MIT
Permission is hereby granted, free of charge, to any person obtaining a copy
of this software and associated documentation files (the "Software"), to deal
in the Software without restriction, including without limitation the rights
to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:
The above copyright notice and this permission notice shall be included in all
copies or substantial portions of the Software.
THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
SOFTWARE.
*/

//! Per-session log of every request sent to a switch, in protobuf debug
//! form, for offline debugging.

use std::fmt::Debug;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::{event, Level};

use crate::P4Error;

pub struct RequestLog {
    path: PathBuf,
    out: Mutex<BufWriter<File>>,
    seqno: AtomicU64,
}

impl RequestLog {
    /// Creates or truncates the log at `path`, creating its directory if
    /// needed.
    pub fn create(path: &Path) -> Result<Self, P4Error> {
        let io_error = |source| P4Error::Io {
            context: format!("creating request log {}", path.display()),
            source,
        };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(io_error)?;
        }
        let file = File::create(path).map_err(io_error)?;
        Ok(RequestLog {
            path: path.to_path_buf(),
            out: Mutex::new(BufWriter::new(file)),
            seqno: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one request.  Failing to log is reported but never fails
    /// the request itself.
    pub fn record(&self, rpc: &str, request: &dyn Debug) {
        let seqno = self.seqno.fetch_add(1, Ordering::Relaxed) + 1;
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(out, "[{}] {}\n{:#?}\n---", seqno, rpc, request) {
            event!(Level::WARN, path = %self.path.display(), "cannot write request log: {}", e);
        }
    }

    pub fn flush(&self) -> Result<(), P4Error> {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        out.flush().map_err(|source| P4Error::Io {
            context: format!("flushing request log {}", self.path.display()),
            source,
        })
    }
}
