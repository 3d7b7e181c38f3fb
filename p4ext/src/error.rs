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

use itertools::Itertools;
use prost::Message;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tonic::Code;

/// Whether a request that failed in transit may have reached the switch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// The request never left this process, so it is safe to resend.
    NotSent,
    /// The switch may have applied the request.  Resending a write that
    /// inserts could fail with `ALREADY_EXISTS`.
    Unknown,
}

impl fmt::Display for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delivery::NotSent => write!(f, "not sent"),
            Delivery::Unknown => write!(f, "delivery unknown"),
        }
    }
}

/// The outcome of one update in a rejected write batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateError {
    pub index: usize,
    pub code: Code,
    pub message: String,
}

/// A request the switch received and refused.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcError {
    pub code: Code,
    pub message: String,
    pub updates: Vec<UpdateError>,
}

impl RpcError {
    pub fn from_status(status: &tonic::Status) -> Self {
        RpcError {
            code: status.code(),
            message: status.message().to_string(),
            updates: decode_update_errors(status.details()),
        }
    }

    /// The code that best describes the failure.  A write batch fails as a
    /// whole with `UNKNOWN`; the reason is the code of its first failed
    /// update.
    pub fn update_code(&self) -> Code {
        self.updates.first().map_or(self.code, |u| u.code)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)?;
        if !self.updates.is_empty() {
            let updates = self
                .updates
                .iter()
                .map(|u| format!("update {}: {:?}: {}", u.index, u.code, u.message))
                .join("; ");
            write!(f, " ({})", updates)?;
        }
        Ok(())
    }
}

// Write errors carry a google.rpc.Status in the gRPC details, holding one
// p4.v1.Error per update, OK for the updates that succeeded.
fn decode_update_errors(details: &[u8]) -> Vec<UpdateError> {
    if details.is_empty() {
        return Vec::new();
    }
    let status = match proto::status::Status::decode(details) {
        Ok(status) => status,
        Err(_) => return Vec::new(),
    };
    status
        .details
        .iter()
        .enumerate()
        .filter_map(|(index, any)| {
            let error = proto::p4runtime::Error::decode(any.value.as_slice()).ok()?;
            let code = Code::from(error.canonical_code);
            (code != Code::Ok).then(|| UpdateError {
                index,
                code,
                message: error.message,
            })
        })
        .collect()
}

#[derive(Debug, Error)]
pub enum P4Error {
    #[error("malformed P4Info: {0}")]
    Schema(String),

    #[error("{kind} \"{name}\" not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{0}")]
    SchemaMismatch(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("not master for device {device_id}")]
    NotMaster { device_id: u64 },

    #[error("no forwarding pipeline installed on device {device_id}")]
    NoPipeline { device_id: u64 },

    #[error("switch rejected request: {0}")]
    Rpc(RpcError),

    #[error("transport failure ({delivery}): {message}")]
    Transport { delivery: Delivery, message: String },

    #[error("{operation} timed out after {after:?} ({delivery})")]
    Timeout {
        operation: &'static str,
        after: Duration,
        delivery: Delivery,
    },

    #[error("malformed response from switch: {0}")]
    Decode(String),

    #[error("session is not connected")]
    NotConnected,

    #[error("session is closed")]
    Closed,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl P4Error {
    pub(crate) fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        P4Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Classifies a failed RPC.  Statuses that describe the connection
    /// rather than the request become `Transport` errors; a permission
    /// failure means another controller holds mastership.
    pub fn from_status(status: tonic::Status, device_id: u64) -> Self {
        match status.code() {
            Code::Unavailable => P4Error::Transport {
                delivery: Delivery::NotSent,
                message: status.message().to_string(),
            },
            Code::Cancelled | Code::DeadlineExceeded => P4Error::Transport {
                delivery: Delivery::Unknown,
                message: status.message().to_string(),
            },
            Code::Unknown if status.details().is_empty() && std::error::Error::source(&status).is_some() => {
                P4Error::Transport {
                    delivery: Delivery::Unknown,
                    message: status.message().to_string(),
                }
            }
            Code::PermissionDenied => P4Error::NotMaster { device_id },
            _ => P4Error::Rpc(RpcError::from_status(&status)),
        }
    }

    /// The delivery status for failures that happened in transit.
    pub fn delivery(&self) -> Option<Delivery> {
        match self {
            P4Error::Transport { delivery, .. } | P4Error::Timeout { delivery, .. } => Some(*delivery),
            _ => None,
        }
    }

    /// The canonical code the switch reported, if it reported one.
    pub fn rpc_code(&self) -> Option<Code> {
        match self {
            P4Error::Rpc(e) => Some(e.update_code()),
            _ => None,
        }
    }
}
