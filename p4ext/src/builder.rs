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

//! Builds table entries and mirror sessions from names and values,
//! checking them against the schema before anything is sent.

use std::collections::HashSet;

use crate::entry::{ActionCall, ActionParam, FieldMatch, Match, MirrorSession, TableEntry};
use crate::schema::{MatchKind, SchemaRegistry};
use crate::value::{mask_to_prefix, Value};
use crate::P4Error;

/// Ports at and above this value are reserved by P4Runtime for the CPU
/// port and other special destinations.
pub const FIRST_RESERVED_PORT: u32 = 0xFFFF_FF00;

/// The match shape a caller supplies for one field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MatchValue {
    Exact(Value),
    Lpm(Value, u32),
    Ternary(Value, Value),
}

impl MatchValue {
    pub fn exact(value: impl Into<Value>) -> Self {
        MatchValue::Exact(value.into())
    }

    pub fn lpm(value: impl Into<Value>, prefix_len: u32) -> Self {
        MatchValue::Lpm(value.into(), prefix_len)
    }

    pub fn ternary(value: impl Into<Value>, mask: impl Into<Value>) -> Self {
        MatchValue::Ternary(value.into(), mask.into())
    }

    fn shape(&self) -> MatchKind {
        match self {
            MatchValue::Exact(_) => MatchKind::Exact,
            MatchValue::Lpm(..) => MatchKind::Lpm,
            MatchValue::Ternary(..) => MatchKind::Ternary,
        }
    }
}

/// Builds a table entry.
///
/// Every name is resolved before any other check, so a misspelled name is
/// always reported as `NotFound`.  The match shapes must agree with the
/// declared match kinds, every exact field must be matched, and every
/// action parameter must be given.  A zero-length LPM prefix or an all-zero
/// ternary mask wildcards the field, which omits it from the entry.
/// Tables with ternary, range or optional fields require `priority > 0`;
/// other tables require `priority == 0`.
pub fn build_table_entry(
    registry: &SchemaRegistry,
    table_name: &str,
    matches: &[(&str, MatchValue)],
    action_name: &str,
    params: &[(&str, Value)],
    priority: i32,
) -> Result<TableEntry, P4Error> {
    let table = registry.table(table_name)?;
    let action = registry.action(action_name)?;
    let table_name = table.preamble.name.as_str();
    let action_name = action.preamble.name.as_str();

    let fields = matches
        .iter()
        .map(|(name, value)| {
            table
                .match_field(name)
                .map(|mf| (mf, value))
                .ok_or_else(|| P4Error::not_found("match field", format!("{}.{}", table_name, name)))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let args = params
        .iter()
        .map(|(name, value)| {
            action
                .param(name)
                .map(|p| (p, value))
                .ok_or_else(|| P4Error::not_found("action parameter", format!("{}.{}", action_name, name)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    match table.action_ref(action.preamble.id) {
        None => {
            return Err(P4Error::SchemaMismatch(format!(
                "action {} is not an action of table {}",
                action_name, table_name
            )))
        }
        Some(ar) if !ar.may_be_entry => {
            return Err(P4Error::SchemaMismatch(format!(
                "action {} may only be the default action of table {}",
                action_name, table_name
            )))
        }
        Some(_) => (),
    }

    let mut seen = HashSet::new();
    let mut field_matches = Vec::new();
    for (mf, value) in fields {
        let name = &mf.preamble.name;
        if !seen.insert(mf.preamble.id) {
            return Err(P4Error::SchemaMismatch(format!("match field {} given more than once", name)));
        }
        let shape_fits = mf.match_kind == value.shape()
            || (mf.match_kind == MatchKind::Optional && value.shape() == MatchKind::Exact);
        if !shape_fits {
            return Err(P4Error::SchemaMismatch(format!(
                "{} is a {}-match field but was given a {} match",
                name,
                mf.match_kind,
                value.shape()
            )));
        }
        let context = |e: P4Error| match e {
            P4Error::InvalidValue(msg) => P4Error::InvalidValue(format!("{}: {}", name, msg)),
            e => e,
        };
        let bit_width = mf.bit_width;
        let encoded = match value {
            MatchValue::Exact(v) => {
                let value = v.encode(bit_width).map_err(context)?;
                if mf.match_kind == MatchKind::Optional {
                    Some(Match::Optional { value })
                } else {
                    Some(Match::Exact { value })
                }
            }
            MatchValue::Lpm(v, prefix_len) => {
                if *prefix_len > bit_width {
                    return Err(P4Error::InvalidValue(format!(
                        "{}: prefix length {} exceeds field width {}",
                        name, prefix_len, bit_width
                    )));
                }
                let mut value = v.encode(bit_width).map_err(context)?;
                if *prefix_len == 0 {
                    None
                } else {
                    mask_to_prefix(&mut value, bit_width, *prefix_len);
                    Some(Match::Lpm {
                        value,
                        prefix_len: *prefix_len,
                    })
                }
            }
            MatchValue::Ternary(v, m) => {
                let value = v.encode(bit_width).map_err(context)?;
                let mask = m.encode(bit_width).map_err(context)?;
                if mask.iter().all(|&b| b == 0) {
                    None
                } else {
                    let value = value.iter().zip(&mask).map(|(v, m)| v & m).collect();
                    Some(Match::Ternary { value, mask })
                }
            }
        };
        if let Some(value) = encoded {
            field_matches.push(FieldMatch {
                field_id: mf.preamble.id,
                value,
            });
        }
    }
    if let Some(missing) = table
        .match_fields
        .iter()
        .find(|mf| mf.match_kind == MatchKind::Exact && !seen.contains(&mf.preamble.id))
    {
        return Err(P4Error::SchemaMismatch(format!(
            "exact-match field {} of table {} must be matched",
            missing.preamble.name, table_name
        )));
    }
    field_matches.sort_by_key(|m| m.field_id);

    if table.needs_priority() {
        if priority <= 0 {
            return Err(P4Error::SchemaMismatch(format!(
                "table {} has ternary, range or optional fields and needs a positive priority",
                table_name
            )));
        }
    } else if priority != 0 {
        return Err(P4Error::SchemaMismatch(format!(
            "table {} only has exact and LPM fields and takes no priority",
            table_name
        )));
    }

    let mut given = HashSet::new();
    let mut action_params = Vec::new();
    for (param, value) in args {
        if !given.insert(param.preamble.id) {
            return Err(P4Error::SchemaMismatch(format!(
                "parameter {} of action {} given more than once",
                param.preamble.name, action_name
            )));
        }
        let encoded = value.encode(param.bit_width).map_err(|e| match e {
            P4Error::InvalidValue(msg) => P4Error::InvalidValue(format!("{}: {}", param.preamble.name, msg)),
            e => e,
        })?;
        action_params.push(ActionParam {
            param_id: param.preamble.id,
            value: encoded,
        });
    }
    if let Some(missing) = action.params.iter().find(|p| !given.contains(&p.preamble.id)) {
        return Err(P4Error::SchemaMismatch(format!(
            "action {} requires parameter {}",
            action_name, missing.preamble.name
        )));
    }
    action_params.sort_by_key(|p| p.param_id);

    Ok(TableEntry {
        table_id: table.preamble.id,
        matches: field_matches,
        action: Some(ActionCall {
            action_id: action.preamble.id,
            params: action_params,
        }),
        priority,
        is_default_action: false,
    })
}

/// Builds a clone session that mirrors to `egress_port`, optionally
/// truncating copies to `truncate` bytes.  Session id 0 is reserved and
/// rejected.
pub fn build_mirror_session(
    session_id: u32,
    egress_port: u32,
    truncate: Option<u32>,
) -> Result<MirrorSession, P4Error> {
    if session_id == 0 {
        return Err(P4Error::InvalidValue("mirror session id 0 is reserved".into()));
    }
    if egress_port >= FIRST_RESERVED_PORT {
        return Err(P4Error::InvalidValue(format!(
            "egress port {:#x} is reserved",
            egress_port
        )));
    }
    match truncate {
        Some(0) => {
            return Err(P4Error::InvalidValue("truncation length must be positive".into()));
        }
        Some(t) if t > i32::MAX as u32 => {
            return Err(P4Error::InvalidValue(format!("truncation length {} is too large", t)));
        }
        _ => (),
    }
    Ok(MirrorSession {
        session_id,
        egress_port,
        class_of_service: 0,
        truncate,
    })
}
