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

//! Switch topology and the rules to install, as a JSON document.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::program::Protocol;
use crate::ControllerError;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SwitchConfig {
    pub name: String,
    pub address: String,
    pub device_id: u64,
    /// Overrides the controller-wide election id for this switch.
    #[serde(default)]
    pub election_id: Option<u64>,
    /// Every request sent to the switch is appended here.
    #[serde(default)]
    pub proto_dump_file: Option<PathBuf>,
}

impl SwitchConfig {
    pub fn new(name: &str, address: &str, device_id: u64) -> Self {
        SwitchConfig {
            name: name.to_string(),
            address: address.to_string(),
            device_id,
            election_id: None,
            proto_dump_file: None,
        }
    }
}

/// Sends packets for `dst_ip` out of `port`, rewriting the destination MAC.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ForwardingRule {
    pub switch: String,
    pub dst_ip: Ipv4Addr,
    pub dst_mac: String,
    pub port: u16,
}

/// Mirrors traffic to or from `port` for one protocol.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FilteringRule {
    pub switch: String,
    pub protocol: Protocol,
    pub port: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MirrorConfig {
    pub switch: String,
    pub session_id: u32,
    pub egress_port: u32,
    #[serde(default)]
    pub truncate: Option<u32>,
    #[serde(default)]
    pub dry_run: bool,
}

/// A counter to print after the rules are installed.  Index 0 prints every
/// populated cell.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CounterQuery {
    pub switch: String,
    pub counter: String,
    #[serde(default)]
    pub index: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Topology {
    pub switches: Vec<SwitchConfig>,
    #[serde(default)]
    pub forwarding: Vec<ForwardingRule>,
    #[serde(default)]
    pub filtering: Vec<FilteringRule>,
    #[serde(default)]
    pub mirror_sessions: Vec<MirrorConfig>,
    #[serde(default)]
    pub counters: Vec<CounterQuery>,
}

impl Topology {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ControllerError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| ControllerError::Config(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&text).map_err(|e| ControllerError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Three BMv2 switches in a triangle.
    ///
    /// ```text
    /// s1:  1:h1   2:s2    3:s3
    /// s2:  1:h2   2:s1    3:s3
    /// s3:  1:h3   2:s1    3:s2
    /// ```
    pub fn demo() -> Self {
        let switches = (1..=3)
            .map(|i| SwitchConfig {
                proto_dump_file: Some(PathBuf::from(format!("logs/s{}-p4runtime-requests.txt", i))),
                ..SwitchConfig::new(&format!("s{}", i), &format!("127.0.0.1:5005{}", i), i - 1)
            })
            .collect();
        let forward = |switch: &str, dst_ip: [u8; 4], dst_mac: &str, port| ForwardingRule {
            switch: switch.into(),
            dst_ip: Ipv4Addr::from(dst_ip),
            dst_mac: dst_mac.into(),
            port,
        };
        Topology {
            switches,
            forwarding: vec![
                forward("s1", [10, 0, 1, 1], "00:00:00:00:01:01", 1),
                forward("s1", [10, 0, 2, 2], "00:00:00:00:02:02", 2),
                forward("s2", [10, 0, 1, 1], "00:00:00:00:01:01", 2),
                forward("s2", [10, 0, 2, 2], "00:00:00:00:02:02", 1),
            ],
            filtering: vec![FilteringRule {
                switch: "s1".into(),
                protocol: Protocol::Tcp,
                port: 1234,
            }],
            mirror_sessions: vec![MirrorConfig {
                switch: "s1".into(),
                session_id: 1,
                egress_port: 3,
                truncate: None,
                dry_run: false,
            }],
            counters: Vec::new(),
        }
    }

    /// Checks that every rule names a configured switch.
    pub fn validate(&self) -> Result<(), ControllerError> {
        let rule_switches = self
            .forwarding
            .iter()
            .map(|r| &r.switch)
            .chain(self.filtering.iter().map(|r| &r.switch))
            .chain(self.mirror_sessions.iter().map(|r| &r.switch))
            .chain(self.counters.iter().map(|r| &r.switch));
        for name in rule_switches {
            if !self.switches.iter().any(|s| &s.name == name) {
                return Err(ControllerError::UnknownSwitch(name.clone()));
            }
        }
        Ok(())
    }
}
