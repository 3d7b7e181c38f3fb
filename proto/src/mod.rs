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

//! Protobuf messages and the gRPC client for the subset of P4Runtime this
//! workspace speaks, generated from the `.proto` files next to this crate.
//!
//! Generated modules are nested by protobuf package so that cross-package
//! references (`p4.v1` to `p4.config.v1` and `google.rpc`) resolve. The
//! short aliases below are what the rest of the workspace imports.

pub mod p4 {
    pub mod v1 {
        tonic::include_proto!("p4.v1");
    }
    pub mod config {
        pub mod v1 {
            tonic::include_proto!("p4.config.v1");
        }
    }
}

pub mod google {
    pub mod rpc {
        tonic::include_proto!("google.rpc");
    }
}

pub use p4::config::v1 as p4info;
pub use p4::v1 as p4runtime;

pub mod status {
    pub use crate::google::rpc::Status;
    pub use prost_types::Any;
}

pub mod p4runtime_grpc {
    pub type P4RuntimeClient =
        crate::p4::v1::p4_runtime_client::P4RuntimeClient<tonic::transport::Channel>;
}

impl From<u128> for p4runtime::Uint128 {
    fn from(value: u128) -> Self {
        p4runtime::Uint128 {
            high: (value >> 64) as u64,
            low: value as u64,
        }
    }
}

impl From<&p4runtime::Uint128> for u128 {
    fn from(value: &p4runtime::Uint128) -> Self {
        (u128::from(value.high) << 64) | u128::from(value.low)
    }
}

impl From<p4runtime::Uint128> for u128 {
    fn from(value: p4runtime::Uint128) -> Self {
        u128::from(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::p4runtime::Uint128;

    #[test]
    fn uint128_splits_into_halves() {
        let id = Uint128::from((7u128 << 64) | 9);
        assert_eq!((id.high, id.low), (7, 9));
        assert_eq!(u128::from(&id), (7u128 << 64) | 9);
    }
}
