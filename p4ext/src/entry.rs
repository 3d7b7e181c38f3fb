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

//! Schema-checked entities, ready to be sent to a switch or decoded from
//! one.

use proto::p4runtime::{self as p4r, entity, field_match, packet_replication_engine_entry, table_action};
use std::convert::TryFrom;
use std::fmt::{self, Display};

use crate::P4Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UpdateType {
    Insert,
    Modify,
    Delete,
}

impl Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UpdateType::Insert => "INSERT",
            UpdateType::Modify => "MODIFY",
            UpdateType::Delete => "DELETE",
        };
        write!(f, "{}", s)
    }
}

impl From<UpdateType> for p4r::update::Type {
    fn from(t: UpdateType) -> Self {
        match t {
            UpdateType::Insert => p4r::update::Type::Insert,
            UpdateType::Modify => p4r::update::Type::Modify,
            UpdateType::Delete => p4r::update::Type::Delete,
        }
    }
}

/// One field of a match key, in canonical bytes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Match {
    Exact { value: Vec<u8> },
    Lpm { value: Vec<u8>, prefix_len: u32 },
    Ternary { value: Vec<u8>, mask: Vec<u8> },
    Range { low: Vec<u8>, high: Vec<u8> },
    Optional { value: Vec<u8> },
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FieldMatch {
    pub field_id: u32,
    pub value: Match,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ActionParam {
    pub param_id: u32,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ActionCall {
    pub action_id: u32,
    pub params: Vec<ActionParam>,
}

/// A table entry.  `matches` is sorted by field id and omits wildcarded
/// fields.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TableEntry {
    pub table_id: u32,
    pub matches: Vec<FieldMatch>,
    pub action: Option<ActionCall>,
    pub priority: i32,
    pub is_default_action: bool,
}

impl From<&FieldMatch> for p4r::FieldMatch {
    fn from(fm: &FieldMatch) -> Self {
        use field_match::FieldMatchType;
        let field_match_type = match &fm.value {
            Match::Exact { value } => FieldMatchType::Exact(field_match::Exact { value: value.clone() }),
            Match::Lpm { value, prefix_len } => FieldMatchType::Lpm(field_match::Lpm {
                value: value.clone(),
                prefix_len: *prefix_len as i32,
            }),
            Match::Ternary { value, mask } => FieldMatchType::Ternary(field_match::Ternary {
                value: value.clone(),
                mask: mask.clone(),
            }),
            Match::Range { low, high } => FieldMatchType::Range(field_match::Range {
                low: low.clone(),
                high: high.clone(),
            }),
            Match::Optional { value } => FieldMatchType::Optional(field_match::Optional { value: value.clone() }),
        };
        p4r::FieldMatch {
            field_id: fm.field_id,
            field_match_type: Some(field_match_type),
        }
    }
}

impl TryFrom<&p4r::FieldMatch> for FieldMatch {
    type Error = P4Error;

    fn try_from(fm: &p4r::FieldMatch) -> Result<Self, Self::Error> {
        use field_match::FieldMatchType;
        let value = match &fm.field_match_type {
            Some(FieldMatchType::Exact(m)) => Match::Exact { value: m.value.clone() },
            Some(FieldMatchType::Lpm(m)) => Match::Lpm {
                value: m.value.clone(),
                prefix_len: u32::try_from(m.prefix_len)
                    .map_err(|_| P4Error::Decode(format!("negative prefix length {}", m.prefix_len)))?,
            },
            Some(FieldMatchType::Ternary(m)) => Match::Ternary {
                value: m.value.clone(),
                mask: m.mask.clone(),
            },
            Some(FieldMatchType::Range(m)) => Match::Range {
                low: m.low.clone(),
                high: m.high.clone(),
            },
            Some(FieldMatchType::Optional(m)) => Match::Optional { value: m.value.clone() },
            None => return Err(P4Error::Decode(format!("field {} has no match value", fm.field_id))),
        };
        Ok(FieldMatch {
            field_id: fm.field_id,
            value,
        })
    }
}

impl From<&TableEntry> for p4r::TableEntry {
    fn from(te: &TableEntry) -> Self {
        let action = te.action.as_ref().map(|a| p4r::TableAction {
            r#type: Some(table_action::Type::Action(p4r::Action {
                action_id: a.action_id,
                params: a
                    .params
                    .iter()
                    .map(|p| p4r::action::Param {
                        param_id: p.param_id,
                        value: p.value.clone(),
                    })
                    .collect(),
            })),
        });
        p4r::TableEntry {
            table_id: te.table_id,
            r#match: te.matches.iter().map(|m| m.into()).collect(),
            action,
            priority: te.priority,
            is_default_action: te.is_default_action,
            ..Default::default()
        }
    }
}

impl TryFrom<&p4r::TableEntry> for TableEntry {
    type Error = P4Error;

    fn try_from(te: &p4r::TableEntry) -> Result<Self, Self::Error> {
        let mut matches = te
            .r#match
            .iter()
            .map(FieldMatch::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        matches.sort_by_key(|m| m.field_id);
        let action = match te.action.as_ref().and_then(|a| a.r#type.as_ref()) {
            Some(table_action::Type::Action(a)) => Some(ActionCall {
                action_id: a.action_id,
                params: a
                    .params
                    .iter()
                    .map(|p| ActionParam {
                        param_id: p.param_id,
                        value: p.value.clone(),
                    })
                    .collect(),
            }),
            // Action profile members and groups are not supported.
            _ => None,
        };
        Ok(TableEntry {
            table_id: te.table_id,
            matches,
            action,
            priority: te.priority,
            is_default_action: te.is_default_action,
        })
    }
}

impl From<&TableEntry> for p4r::Entity {
    fn from(te: &TableEntry) -> Self {
        p4r::Entity {
            entity: Some(entity::Entity::TableEntry(te.into())),
        }
    }
}

/// A clone session that copies packets to a single egress port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MirrorSession {
    pub session_id: u32,
    pub egress_port: u32,
    pub class_of_service: u32,
    /// Copies are truncated to this many bytes, if set.
    pub truncate: Option<u32>,
}

impl From<&MirrorSession> for p4r::Entity {
    fn from(ms: &MirrorSession) -> Self {
        let entry = p4r::CloneSessionEntry {
            session_id: ms.session_id,
            replicas: vec![p4r::Replica {
                egress_port: ms.egress_port,
                instance: 1,
            }],
            class_of_service: ms.class_of_service,
            packet_length_bytes: ms.truncate.map_or(0, |t| t as i32),
        };
        p4r::Entity {
            entity: Some(entity::Entity::PacketReplicationEngineEntry(
                p4r::PacketReplicationEngineEntry {
                    r#type: Some(packet_replication_engine_entry::Type::CloneSessionEntry(entry)),
                },
            )),
        }
    }
}

/// One cell of an indexed counter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterSample {
    pub counter_id: u32,
    pub index: i64,
    pub packet_count: i64,
    pub byte_count: i64,
}

impl From<&p4r::CounterEntry> for CounterSample {
    fn from(ce: &p4r::CounterEntry) -> Self {
        let data = ce.data.clone().unwrap_or_default();
        CounterSample {
            counter_id: ce.counter_id,
            index: ce.index.as_ref().map_or(0, |i| i.index),
            packet_count: data.packet_count,
            byte_count: data.byte_count,
        }
    }
}

impl From<&CounterSample> for p4r::Entity {
    fn from(cs: &CounterSample) -> Self {
        p4r::Entity {
            entity: Some(entity::Entity::CounterEntry(p4r::CounterEntry {
                counter_id: cs.counter_id,
                index: Some(p4r::Index { index: cs.index }),
                data: Some(p4r::CounterData {
                    byte_count: cs.byte_count,
                    packet_count: cs.packet_count,
                }),
            })),
        }
    }
}
