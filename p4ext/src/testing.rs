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

//! P4Info for the packet-inspection demo program, for tests and for
//! running against simulated switches without compiler output.
//!
//! Ids follow the compiler's convention of an 8-bit resource-type prefix.

use prost::Message;
use proto::p4info::{
    action,
    action_ref,
    counter_spec,
    match_field,
    Action,
    ActionRef,
    Counter,
    CounterSpec,
    MatchField,
    P4Info,
    PkgInfo,
    Preamble,
    Register,
    Table,
};

pub const IPV4_LPM_ID: u32 = 0x0200_0001;
pub const ACL_ID: u32 = 0x0200_0002;
pub const FILTER_TABLE_IDS: [u32; 4] = [0x0200_0010, 0x0200_0011, 0x0200_0012, 0x0200_0013];
pub const IPV4_FORWARD_ID: u32 = 0x0100_0001;
pub const DROP_ID: u32 = 0x0100_0002;
pub const NO_ACTION_ID: u32 = 0x0100_0003;
pub const CLONE_E2E_ID: u32 = 0x0100_0004;
pub const INGRESS_COUNTER_ID: u32 = 0x1200_0001;
pub const MIRROR_REGISTER_ID: u32 = 0x1600_0001;

/// Table size of `MyIngress.acl`, small enough to fill in a test.
pub const ACL_SIZE: i64 = 2;

fn preamble(id: u32, name: &str) -> Option<Preamble> {
    let alias = name.rsplit('.').next().unwrap_or(name);
    Some(Preamble {
        id,
        name: name.into(),
        alias: alias.into(),
        annotations: Vec::new(),
    })
}

fn field(id: u32, name: &str, bitwidth: i32, kind: match_field::MatchType) -> MatchField {
    MatchField {
        id,
        name: name.into(),
        annotations: Vec::new(),
        bitwidth,
        r#match: Some(match_field::Match::MatchType(kind as i32)),
    }
}

fn action_ref(id: u32, scope: action_ref::Scope) -> ActionRef {
    ActionRef {
        id,
        annotations: Vec::new(),
        scope: scope as i32,
    }
}

fn param(id: u32, name: &str, bitwidth: i32) -> action::Param {
    action::Param {
        id,
        name: name.into(),
        annotations: Vec::new(),
        bitwidth,
    }
}

pub fn demo_p4info() -> P4Info {
    use action_ref::Scope;
    use match_field::MatchType;

    let mut tables = vec![
        Table {
            preamble: preamble(IPV4_LPM_ID, "MyIngress.ipv4_lpm"),
            match_fields: vec![field(1, "hdr.ipv4.dstAddr", 32, MatchType::Lpm)],
            action_refs: vec![
                action_ref(IPV4_FORWARD_ID, Scope::TableAndDefault),
                action_ref(DROP_ID, Scope::TableAndDefault),
                action_ref(NO_ACTION_ID, Scope::DefaultOnly),
            ],
            size: 1024,
            ..Default::default()
        },
        Table {
            preamble: preamble(ACL_ID, "MyIngress.acl"),
            match_fields: vec![
                field(1, "hdr.ethernet.etherType", 16, MatchType::Ternary),
                field(2, "hdr.ipv4.protocol", 8, MatchType::Ternary),
            ],
            action_refs: vec![
                action_ref(DROP_ID, Scope::TableAndDefault),
                action_ref(NO_ACTION_ID, Scope::TableAndDefault),
            ],
            size: ACL_SIZE,
            ..Default::default()
        },
    ];
    let filters = [
        ("MyEgress.table_tcp_srcPort_exact", "hdr.tcp.srcPort"),
        ("MyEgress.table_tcp_dstPort_exact", "hdr.tcp.dstPort"),
        ("MyEgress.table_udp_srcPort_exact", "hdr.udp.srcPort"),
        ("MyEgress.table_udp_dstPort_exact", "hdr.udp.dstPort"),
    ];
    for (&id, (table, port)) in FILTER_TABLE_IDS.iter().zip(filters) {
        tables.push(Table {
            preamble: preamble(id, table),
            match_fields: vec![field(1, port, 16, MatchType::Exact)],
            action_refs: vec![
                action_ref(CLONE_E2E_ID, Scope::TableAndDefault),
                action_ref(NO_ACTION_ID, Scope::DefaultOnly),
            ],
            size: 64,
            ..Default::default()
        });
    }

    P4Info {
        pkg_info: Some(PkgInfo {
            name: "p4dpi".into(),
            version: String::new(),
            arch: "v1model".into(),
        }),
        tables,
        actions: vec![
            Action {
                preamble: preamble(IPV4_FORWARD_ID, "MyIngress.ipv4_forward"),
                params: vec![param(1, "dstAddr", 48), param(2, "port", 9)],
            },
            Action {
                preamble: preamble(DROP_ID, "MyIngress.drop"),
                params: Vec::new(),
            },
            Action {
                preamble: preamble(NO_ACTION_ID, "NoAction"),
                params: Vec::new(),
            },
            Action {
                preamble: preamble(CLONE_E2E_ID, "MyEgress.action_clone_e2e"),
                params: Vec::new(),
            },
        ],
        counters: vec![Counter {
            preamble: preamble(INGRESS_COUNTER_ID, "MyIngress.ingressPktCounter"),
            spec: Some(CounterSpec {
                unit: counter_spec::Unit::Both as i32,
            }),
            size: 64,
        }],
        registers: vec![Register {
            preamble: preamble(MIRROR_REGISTER_ID, "MyEgress.mirrorRegister"),
            size: 16,
        }],
    }
}

/// `demo_p4info`, binary encoded.
pub fn demo_p4info_bytes() -> Vec<u8> {
    demo_p4info().encode_to_vec()
}
