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

//! Human-readable rendering of entries read back from a switch.

use std::fmt::{self, Display};
use std::net::Ipv4Addr;

use crate::entry::{Match, TableEntry};
use crate::schema::SchemaRegistry;
use crate::value::{decode_uint, MacAddr};
use crate::P4Error;

fn render_bytes(bytes: &[u8], bit_width: Option<u32>) -> String {
    if bit_width == Some(48) && bytes.len() == 6 {
        let mut octets = [0u8; 6];
        octets.copy_from_slice(bytes);
        return MacAddr(octets).to_string();
    }
    match decode_uint(bytes) {
        Some(x) if bit_width == Some(32) && x <= u128::from(u32::MAX) => Ipv4Addr::from(x as u32).to_string(),
        Some(x) if bit_width.map_or(false, |w| w <= 16) => x.to_string(),
        _ => {
            let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
            format!("0x{}", hex)
        }
    }
}

/// A table entry with ids replaced by names and values rendered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryView {
    pub table: String,
    pub matches: Vec<(String, String)>,
    pub action: Option<String>,
    pub params: Vec<(String, String)>,
    pub priority: i32,
}

impl EntryView {
    /// Fails with `NotFound` if the table or action is not part of the
    /// program.  Unknown match fields and parameters are shown by id.
    pub fn new(registry: &SchemaRegistry, entry: &TableEntry) -> Result<Self, P4Error> {
        let table = registry.table_by_id(entry.table_id)?;
        let matches = entry
            .matches
            .iter()
            .map(|fm| {
                let field = table.match_field_by_id(fm.field_id);
                let name = field.map_or_else(|| format!("#{}", fm.field_id), |mf| mf.preamble.name.clone());
                let width = field.map(|mf| mf.bit_width);
                let value = match &fm.value {
                    Match::Exact { value } | Match::Optional { value } => render_bytes(value, width),
                    Match::Lpm { value, prefix_len } => format!("{}/{}", render_bytes(value, width), prefix_len),
                    Match::Ternary { value, mask } => {
                        format!("{} &&& {}", render_bytes(value, width), render_bytes(mask, width))
                    }
                    Match::Range { low, high } => {
                        format!("{}..{}", render_bytes(low, width), render_bytes(high, width))
                    }
                };
                (name, value)
            })
            .collect();

        let (action, params) = match &entry.action {
            Some(call) => {
                let action = registry.action_by_id(call.action_id)?;
                let params = call
                    .params
                    .iter()
                    .map(|p| match action.param_by_id(p.param_id) {
                        Some(param) => (param.preamble.name.clone(), render_bytes(&p.value, Some(param.bit_width))),
                        None => (format!("#{}", p.param_id), render_bytes(&p.value, None)),
                    })
                    .collect();
                (Some(action.preamble.name.clone()), params)
            }
            None => (None, Vec::new()),
        };

        Ok(EntryView {
            table: table.preamble.name.clone(),
            matches,
            action,
            params,
            priority: entry.priority,
        })
    }
}

impl Display for EntryView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.table)?;
        for (name, value) in &self.matches {
            write!(f, " {}={}", name, value)?;
        }
        if self.priority != 0 {
            write!(f, " priority={}", self.priority)?;
        }
        if let Some(action) = &self.action {
            write!(f, " -> {}(", action)?;
            for (i, (name, value)) in self.params.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}={}", name, value)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl SchemaRegistry {
    pub fn describe(&self, entry: &TableEntry) -> Result<EntryView, P4Error> {
        EntryView::new(self, entry)
    }
}
