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

//! The schema registry: a read-only index over a program's P4Info.

use prost::Message;
use proto::p4info;
use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display};
use std::fs;
use std::path::Path;

use crate::P4Error;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Preamble {
    pub id: u32,
    pub name: String,
    pub alias: String,
}

impl From<&p4info::Preamble> for Preamble {
    fn from(p: &p4info::Preamble) -> Self {
        Preamble {
            id: p.id,
            name: p.name.clone(),
            alias: p.alias.clone(),
        }
    }
}

fn preamble(p: Option<&p4info::Preamble>) -> Preamble {
    p.map(Preamble::from).unwrap_or_default()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MatchKind {
    Unspecified,
    Exact,
    Lpm,
    Ternary,
    Range,
    Optional,
    Other(String),
}

impl Display for MatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use MatchKind::*;
        let s = match self {
            Unspecified => "unspecified",
            Exact => "exact",
            Lpm => "LPM",
            Ternary => "ternary",
            Range => "range",
            Optional => "optional",
            Other(s) => s,
        };
        write!(f, "{}", s)
    }
}

impl MatchKind {
    /// Entries in tables with any of these kinds of field need a priority.
    pub fn needs_priority(&self) -> bool {
        matches!(self, MatchKind::Ternary | MatchKind::Range | MatchKind::Optional)
    }
}

#[derive(Clone, Debug)]
pub struct MatchField {
    // MatchField has no preamble in P4Info, but the id and name are what
    // a preamble holds, so reuse it.
    pub preamble: Preamble,
    pub bit_width: u32,
    pub match_kind: MatchKind,
}

impl From<&p4info::MatchField> for MatchField {
    fn from(mf: &p4info::MatchField) -> Self {
        use p4info::match_field::{Match, MatchType};
        MatchField {
            preamble: Preamble {
                id: mf.id,
                name: mf.name.clone(),
                alias: mf.name.clone(),
            },
            bit_width: mf.bitwidth.max(0) as u32,
            match_kind: match &mf.r#match {
                Some(Match::MatchType(t)) => match MatchType::try_from(*t) {
                    Ok(MatchType::Exact) => MatchKind::Exact,
                    Ok(MatchType::Lpm) => MatchKind::Lpm,
                    Ok(MatchType::Ternary) => MatchKind::Ternary,
                    Ok(MatchType::Range) => MatchKind::Range,
                    Ok(MatchType::Optional) => MatchKind::Optional,
                    Ok(MatchType::Unspecified) | Err(_) => MatchKind::Unspecified,
                },
                Some(Match::OtherMatchType(s)) => MatchKind::Other(s.clone()),
                None => MatchKind::Unspecified,
            },
        }
    }
}

impl Display for MatchField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "field {}: bit<{}> {}-match",
            self.preamble.name, self.bit_width, self.match_kind
        )
    }
}

#[derive(Clone, Debug, Default)]
pub struct Param {
    pub preamble: Preamble,
    pub bit_width: u32,
}

impl From<&p4info::action::Param> for Param {
    fn from(ap: &p4info::action::Param) -> Self {
        Param {
            preamble: Preamble {
                id: ap.id,
                name: ap.name.clone(),
                alias: ap.name.clone(),
            },
            bit_width: ap.bitwidth.max(0) as u32,
        }
    }
}

impl Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: bit<{}>", self.preamble.name, self.bit_width)
    }
}

#[derive(Clone, Debug, Default)]
pub struct Action {
    pub preamble: Preamble,
    pub params: Vec<Param>,
}

impl From<&p4info::Action> for Action {
    fn from(a: &p4info::Action) -> Self {
        Action {
            preamble: preamble(a.preamble.as_ref()),
            params: a.params.iter().map(|x| x.into()).collect(),
        }
    }
}

impl Action {
    pub fn param(&self, name: &str) -> Option<&Param> {
        self.params.iter().find(|p| p.preamble.name == name)
    }

    pub fn param_by_id(&self, id: u32) -> Option<&Param> {
        self.params.iter().find(|p| p.preamble.id == id)
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "action {}(", self.preamble.name)?;
        for (p_index, p) in self.params.iter().enumerate() {
            if p_index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", p)?;
        }
        write!(f, ")")
    }
}

#[derive(Clone, Debug, Default)]
pub struct ActionRef {
    pub action_id: u32,
    pub may_be_default: bool, // Allowed as the default action?
    pub may_be_entry: bool,   // Allowed as an entry's action?
}

impl From<&p4info::ActionRef> for ActionRef {
    fn from(ar: &p4info::ActionRef) -> Self {
        use p4info::action_ref::Scope;
        let scope = Scope::try_from(ar.scope).unwrap_or(Scope::TableAndDefault);
        ActionRef {
            action_id: ar.id,
            may_be_default: scope != Scope::TableOnly,
            may_be_entry: scope != Scope::DefaultOnly,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Table {
    pub preamble: Preamble,
    pub match_fields: Vec<MatchField>,
    pub actions: Vec<ActionRef>,
    pub max_entries: Option<u64>,
    pub is_const_table: bool,
}

impl From<&p4info::Table> for Table {
    fn from(t: &p4info::Table) -> Self {
        Table {
            preamble: preamble(t.preamble.as_ref()),
            match_fields: t.match_fields.iter().map(|x| x.into()).collect(),
            actions: t.action_refs.iter().map(|x| x.into()).collect(),
            max_entries: if t.size > 0 { Some(t.size as u64) } else { None },
            is_const_table: t.is_const_table,
        }
    }
}

impl Table {
    pub fn match_field(&self, name: &str) -> Option<&MatchField> {
        self.match_fields.iter().find(|mf| mf.preamble.name == name)
    }

    pub fn match_field_by_id(&self, id: u32) -> Option<&MatchField> {
        self.match_fields.iter().find(|mf| mf.preamble.id == id)
    }

    pub fn action_ref(&self, action_id: u32) -> Option<&ActionRef> {
        self.actions.iter().find(|ar| ar.action_id == action_id)
    }

    pub fn needs_priority(&self) -> bool {
        self.match_fields.iter().any(|mf| mf.match_kind.needs_priority())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CounterUnit {
    Unspecified,
    Bytes,
    Packets,
    Both,
}

#[derive(Clone, Debug)]
pub struct Counter {
    pub preamble: Preamble,
    pub unit: CounterUnit,
    pub size: u64,
}

impl From<&p4info::Counter> for Counter {
    fn from(c: &p4info::Counter) -> Self {
        use p4info::counter_spec::Unit;
        let unit = match c.spec.as_ref().map(|s| Unit::try_from(s.unit)) {
            Some(Ok(Unit::Bytes)) => CounterUnit::Bytes,
            Some(Ok(Unit::Packets)) => CounterUnit::Packets,
            Some(Ok(Unit::Both)) => CounterUnit::Both,
            _ => CounterUnit::Unspecified,
        };
        Counter {
            preamble: preamble(c.preamble.as_ref()),
            unit,
            size: c.size.max(0) as u64,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Register {
    pub preamble: Preamble,
    pub size: u64,
}

impl From<&p4info::Register> for Register {
    fn from(r: &p4info::Register) -> Self {
        Register {
            preamble: preamble(r.preamble.as_ref()),
            size: r.size.max(0) as u64,
        }
    }
}

// Name and id lookup for one kind of object.
#[derive(Clone, Debug, Default)]
struct Index {
    by_id: HashMap<u32, usize>,
    by_name: HashMap<String, usize>,
    // `None` marks an alias that more than one object shares.
    by_alias: HashMap<String, Option<usize>>,
}

impl Index {
    fn build<'a, I>(kind: &str, preambles: I) -> Result<Index, P4Error>
    where
        I: IntoIterator<Item = &'a Preamble>,
    {
        let mut index = Index::default();
        for (i, p) in preambles.into_iter().enumerate() {
            if p.id == 0 {
                return Err(P4Error::Schema(format!("{} \"{}\" has no id", kind, p.name)));
            }
            if p.name.is_empty() {
                return Err(P4Error::Schema(format!("{} {} has no name", kind, p.id)));
            }
            if index.by_id.insert(p.id, i).is_some() {
                return Err(P4Error::Schema(format!("duplicate {} id {}", kind, p.id)));
            }
            if index.by_name.insert(p.name.clone(), i).is_some() {
                return Err(P4Error::Schema(format!("duplicate {} name \"{}\"", kind, p.name)));
            }
            if !p.alias.is_empty() && p.alias != p.name {
                index
                    .by_alias
                    .entry(p.alias.clone())
                    .and_modify(|e| *e = None)
                    .or_insert(Some(i));
            }
        }
        Ok(index)
    }

    fn lookup(&self, name: &str) -> Option<usize> {
        self.by_name
            .get(name)
            .copied()
            .or_else(|| self.by_alias.get(name).copied().flatten())
    }
}

fn check_members<'a, I>(kind: &str, owner: &str, members: I) -> Result<(), P4Error>
where
    I: IntoIterator<Item = &'a Preamble>,
{
    let mut ids = HashSet::new();
    let mut names = HashSet::new();
    for p in members {
        if !ids.insert(p.id) {
            return Err(P4Error::Schema(format!("{} has duplicate {} id {}", owner, kind, p.id)));
        }
        if !names.insert(p.name.as_str()) {
            return Err(P4Error::Schema(format!("{} has duplicate {} \"{}\"", owner, kind, p.name)));
        }
    }
    Ok(())
}

/// Bidirectional name/id index over a P4 program's tables, actions,
/// counters and registers.  Built once and immutable afterward, so it can
/// be shared between sessions.
#[derive(Clone, Debug)]
pub struct SchemaRegistry {
    tables: Vec<Table>,
    actions: Vec<Action>,
    counters: Vec<Counter>,
    registers: Vec<Register>,
    table_index: Index,
    action_index: Index,
    counter_index: Index,
    register_index: Index,
}

impl SchemaRegistry {
    /// Loads a binary-encoded P4Info.
    pub fn load(metadata: &[u8]) -> Result<Self, P4Error> {
        let p4info = p4info::P4Info::decode(metadata)
            .map_err(|e| P4Error::Schema(format!("cannot decode P4Info: {}", e)))?;
        Self::from_p4info(&p4info)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, P4Error> {
        let path = path.as_ref();
        let metadata = fs::read(path).map_err(|source| P4Error::Io {
            context: format!("reading {}", path.display()),
            source,
        })?;
        Self::load(&metadata)
    }

    pub fn from_p4info(p4info: &p4info::P4Info) -> Result<Self, P4Error> {
        let tables: Vec<Table> = p4info.tables.iter().map(|x| x.into()).collect();
        let actions: Vec<Action> = p4info.actions.iter().map(|x| x.into()).collect();
        let counters: Vec<Counter> = p4info.counters.iter().map(|x| x.into()).collect();
        let registers: Vec<Register> = p4info.registers.iter().map(|x| x.into()).collect();

        let table_index = Index::build("table", tables.iter().map(|t| &t.preamble))?;
        let action_index = Index::build("action", actions.iter().map(|a| &a.preamble))?;
        let counter_index = Index::build("counter", counters.iter().map(|c| &c.preamble))?;
        let register_index = Index::build("register", registers.iter().map(|r| &r.preamble))?;

        for t in &tables {
            check_members("match field", &t.preamble.name, t.match_fields.iter().map(|mf| &mf.preamble))?;
            for ar in &t.actions {
                if !action_index.by_id.contains_key(&ar.action_id) {
                    return Err(P4Error::Schema(format!(
                        "table \"{}\" refers to undefined action {}",
                        t.preamble.name, ar.action_id
                    )));
                }
            }
        }
        for a in &actions {
            check_members("parameter", &a.preamble.name, a.params.iter().map(|p| &p.preamble))?;
        }

        Ok(SchemaRegistry {
            tables,
            actions,
            counters,
            registers,
            table_index,
            action_index,
            counter_index,
            register_index,
        })
    }

    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn counters(&self) -> &[Counter] {
        &self.counters
    }

    pub fn registers(&self) -> &[Register] {
        &self.registers
    }

    /// Looks up a table by its fully qualified name or unambiguous alias.
    pub fn table(&self, name: &str) -> Result<&Table, P4Error> {
        self.table_index
            .lookup(name)
            .map(|i| &self.tables[i])
            .ok_or_else(|| P4Error::not_found("table", name))
    }

    pub fn table_by_id(&self, id: u32) -> Result<&Table, P4Error> {
        self.table_index
            .by_id
            .get(&id)
            .map(|&i| &self.tables[i])
            .ok_or_else(|| P4Error::not_found("table", format!("id {}", id)))
    }

    pub fn action(&self, name: &str) -> Result<&Action, P4Error> {
        self.action_index
            .lookup(name)
            .map(|i| &self.actions[i])
            .ok_or_else(|| P4Error::not_found("action", name))
    }

    pub fn action_by_id(&self, id: u32) -> Result<&Action, P4Error> {
        self.action_index
            .by_id
            .get(&id)
            .map(|&i| &self.actions[i])
            .ok_or_else(|| P4Error::not_found("action", format!("id {}", id)))
    }

    pub fn counter(&self, name: &str) -> Result<&Counter, P4Error> {
        self.counter_index
            .lookup(name)
            .map(|i| &self.counters[i])
            .ok_or_else(|| P4Error::not_found("counter", name))
    }

    pub fn counter_by_id(&self, id: u32) -> Result<&Counter, P4Error> {
        self.counter_index
            .by_id
            .get(&id)
            .map(|&i| &self.counters[i])
            .ok_or_else(|| P4Error::not_found("counter", format!("id {}", id)))
    }

    pub fn register(&self, name: &str) -> Result<&Register, P4Error> {
        self.register_index
            .lookup(name)
            .map(|i| &self.registers[i])
            .ok_or_else(|| P4Error::not_found("register", name))
    }

    pub fn resolve_table(&self, name: &str) -> Result<u32, P4Error> {
        self.table(name).map(|t| t.preamble.id)
    }

    pub fn resolve_action(&self, name: &str) -> Result<u32, P4Error> {
        self.action(name).map(|a| a.preamble.id)
    }

    pub fn resolve_counter(&self, name: &str) -> Result<u32, P4Error> {
        self.counter(name).map(|c| c.preamble.id)
    }

    pub fn resolve_register(&self, name: &str) -> Result<u32, P4Error> {
        self.register(name).map(|r| r.preamble.id)
    }

    /// Resolves a match field, scoped to its table.
    pub fn resolve_match_field(&self, table: &str, field: &str) -> Result<&MatchField, P4Error> {
        let t = self.table(table)?;
        t.match_field(field)
            .ok_or_else(|| P4Error::not_found("match field", format!("{}.{}", t.preamble.name, field)))
    }

    /// Resolves an action parameter, scoped to its action.
    pub fn resolve_action_param(&self, action: &str, param: &str) -> Result<u32, P4Error> {
        let a = self.action(action)?;
        a.param(param)
            .map(|p| p.preamble.id)
            .ok_or_else(|| P4Error::not_found("action parameter", format!("{}.{}", a.preamble.name, param)))
    }

    pub fn table_name(&self, id: u32) -> Result<&str, P4Error> {
        self.table_by_id(id).map(|t| t.preamble.name.as_str())
    }

    pub fn action_name(&self, id: u32) -> Result<&str, P4Error> {
        self.action_by_id(id).map(|a| a.preamble.name.as_str())
    }

    pub fn counter_name(&self, id: u32) -> Result<&str, P4Error> {
        self.counter_by_id(id).map(|c| c.preamble.name.as_str())
    }
}

/// Lists every table with its match fields and the signatures of the
/// actions it accepts.
impl Display for SchemaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for table in &self.tables {
            writeln!(f, "table {}", table.preamble.name)?;
            for mf in &table.match_fields {
                writeln!(f, "    {}", mf)?;
            }
            for ar in &table.actions {
                if let Ok(action) = self.action_by_id(ar.action_id) {
                    let scope = if !ar.may_be_entry {
                        "default-only "
                    } else if !ar.may_be_default {
                        "not-default "
                    } else {
                        ""
                    };
                    writeln!(f, "    {}{}", scope, action)?;
                }
            }
            if let Some(max_entries) = table.max_entries {
                writeln!(f, "    size: {}", max_entries)?;
            }
        }
        Ok(())
    }
}
