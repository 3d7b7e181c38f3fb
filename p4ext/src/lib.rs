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

//! Client-side building blocks for controlling P4Runtime switches.
//!
//! * [`SchemaRegistry`] indexes a program's P4Info for name and id lookup.
//! * [`build_table_entry`] and [`build_mirror_session`] turn names and
//!   values into schema-checked entities.
//! * [`SwitchSession`] holds the connection to one switch: mastership
//!   arbitration, pipeline installation, writes and streaming reads.
//! * [`sim::SimNetwork`] is an in-process switch for tests.

pub mod builder;
pub mod entry;
mod error;
pub mod schema;
pub mod session;
pub mod sim;
pub mod testing;
pub mod trace;
pub mod transport;
pub mod value;
pub mod view;

pub use builder::{build_mirror_session, build_table_entry, MatchValue};
pub use entry::{CounterSample, MirrorSession, TableEntry, UpdateType};
pub use error::{Delivery, P4Error, RpcError, UpdateError};
pub use schema::SchemaRegistry;
pub use session::{
    ElectionId,
    PipelineConfig,
    SessionOptions,
    SessionState,
    SwitchSession,
    ALL_INDEXES,
    ALL_TABLES,
};
pub use transport::{Connector, GrpcConnector, Transport};
pub use value::{MacAddr, Value};
pub use view::EntryView;
