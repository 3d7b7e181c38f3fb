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

//! Names and rule builders for the demonstration program: IPv4 forwarding
//! in the ingress pipeline, plus per-port traffic mirroring in egress.

use p4ext::{build_table_entry, CounterSample, MacAddr, MatchValue, P4Error, SchemaRegistry, TableEntry, Value};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::net::Ipv4Addr;

pub const IPV4_LPM_TABLE: &str = "MyIngress.ipv4_lpm";
pub const IPV4_DST_FIELD: &str = "hdr.ipv4.dstAddr";
pub const IPV4_FORWARD_ACTION: &str = "MyIngress.ipv4_forward";
pub const CLONE_ACTION: &str = "MyEgress.action_clone_e2e";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Src,
    Dst,
}

impl Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Selects one of the four filtering tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FilterKey {
    pub protocol: Protocol,
    pub direction: Direction,
}

impl FilterKey {
    pub const ALL: [FilterKey; 4] = [
        FilterKey::new(Protocol::Tcp, Direction::Src),
        FilterKey::new(Protocol::Tcp, Direction::Dst),
        FilterKey::new(Protocol::Udp, Direction::Src),
        FilterKey::new(Protocol::Udp, Direction::Dst),
    ];

    pub const fn new(protocol: Protocol, direction: Direction) -> Self {
        FilterKey { protocol, direction }
    }

    pub fn table_name(self) -> &'static str {
        match (self.protocol, self.direction) {
            (Protocol::Tcp, Direction::Src) => "MyEgress.table_tcp_srcPort_exact",
            (Protocol::Tcp, Direction::Dst) => "MyEgress.table_tcp_dstPort_exact",
            (Protocol::Udp, Direction::Src) => "MyEgress.table_udp_srcPort_exact",
            (Protocol::Udp, Direction::Dst) => "MyEgress.table_udp_dstPort_exact",
        }
    }

    pub fn field_name(self) -> &'static str {
        match (self.protocol, self.direction) {
            (Protocol::Tcp, Direction::Src) => "hdr.tcp.srcPort",
            (Protocol::Tcp, Direction::Dst) => "hdr.tcp.dstPort",
            (Protocol::Udp, Direction::Src) => "hdr.udp.srcPort",
            (Protocol::Udp, Direction::Dst) => "hdr.udp.dstPort",
        }
    }
}

pub fn forwarding_rule(
    registry: &SchemaRegistry,
    dst_ip: Ipv4Addr,
    dst_mac: MacAddr,
    port: u16,
) -> Result<TableEntry, P4Error> {
    build_table_entry(
        registry,
        IPV4_LPM_TABLE,
        &[(IPV4_DST_FIELD, MatchValue::lpm(dst_ip, 32))],
        IPV4_FORWARD_ACTION,
        &[("dstAddr", Value::from(dst_mac)), ("port", Value::from(port))],
        0,
    )
}

pub fn filtering_rule(registry: &SchemaRegistry, key: FilterKey, port: u16) -> Result<TableEntry, P4Error> {
    build_table_entry(
        registry,
        key.table_name(),
        &[(key.field_name(), MatchValue::exact(port))],
        CLONE_ACTION,
        &[],
        0,
    )
}

/// Rules mirroring `protocol` traffic with `port` as either source or
/// destination.
pub fn filtering_rules(registry: &SchemaRegistry, protocol: Protocol, port: u16) -> Result<Vec<TableEntry>, P4Error> {
    [Direction::Src, Direction::Dst]
        .into_iter()
        .map(|direction| filtering_rule(registry, FilterKey::new(protocol, direction), port))
        .collect()
}

pub fn counter_line(switch: &str, counter: &str, sample: &CounterSample) -> String {
    format!(
        "{} {} {}: {} packets ({} bytes)",
        switch, counter, sample.index, sample.packet_count, sample.byte_count
    )
}
