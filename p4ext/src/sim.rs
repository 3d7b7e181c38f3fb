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

//! An in-process P4Runtime switch for tests and for running the controller
//! without hardware.  It keeps table entries, clone sessions and counters
//! in memory and implements mastership arbitration among the sessions
//! connected to it.

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::stream::{self, BoxStream, StreamExt};
use prost::Message;
use proto::p4info::P4Info;
use proto::p4runtime::{
    self as p4r,
    entity,
    packet_replication_engine_entry,
    set_forwarding_pipeline_config_request,
    stream_message_request,
    stream_message_response,
    table_action,
    update,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tonic::{Code, Status};
use tracing::{event, Level};

use crate::transport::{Connector, ResponseStream, Transport};
use crate::P4Error;

/// Simulated switches, keyed by address.  Connecting to an address with no
/// switch behaves like a refused connection.
#[derive(Clone, Default)]
pub struct SimNetwork {
    switches: Arc<Mutex<HashMap<String, SimSwitch>>>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_switch(&self, address: &str, device_id: u64) -> SimSwitch {
        let switch = SimSwitch::new(device_id);
        self.switches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.to_string(), switch.clone());
        switch
    }

    pub fn remove_switch(&self, address: &str) -> Option<SimSwitch> {
        self.switches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address)
    }

    pub fn switch(&self, address: &str) -> Option<SimSwitch> {
        self.switches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
    }
}

impl Connector for SimNetwork {
    fn connect(&self, address: &str) -> Result<Arc<dyn Transport>, P4Error> {
        Ok(Arc::new(SimTransport {
            network: self.clone(),
            address: address.to_string(),
        }))
    }
}

struct SimTransport {
    network: SimNetwork,
    address: String,
}

impl SimTransport {
    fn switch(&self) -> Result<SimSwitch, Status> {
        self.network
            .switch(&self.address)
            .ok_or_else(|| Status::unavailable(format!("{}: connection refused", self.address)))
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn stream_channel(
        &self,
        requests: BoxStream<'static, p4r::StreamMessageRequest>,
    ) -> Result<ResponseStream<p4r::StreamMessageResponse>, Status> {
        Ok(self.switch()?.open_stream(requests))
    }

    async fn set_forwarding_pipeline_config(&self, request: p4r::SetForwardingPipelineConfigRequest) -> Result<(), Status> {
        self.switch()?.lock().set_pipeline(request)
    }

    async fn write(&self, request: p4r::WriteRequest) -> Result<(), Status> {
        self.switch()?.lock().write(request)
    }

    async fn read(&self, request: p4r::ReadRequest) -> Result<ResponseStream<p4r::ReadResponse>, Status> {
        let (responses, fail_after) = {
            let switch = self.switch()?;
            let state = switch.lock();
            (state.read(request)?, state.read_fault)
        };
        let responses = responses.into_iter().map(Ok);
        Ok(match fail_after {
            Some(n) => stream::iter(responses.take(n).chain(std::iter::once(Err(Status::unavailable(
                "connection reset during read",
            )))))
            .boxed(),
            None => stream::iter(responses).boxed(),
        })
    }
}

struct Peer {
    election_id: Option<u128>,
    sender: mpsc::UnboundedSender<Result<p4r::StreamMessageResponse, Status>>,
}

struct Pipeline {
    p4info: P4Info,
    cookie: u64,
    tables: HashMap<u32, SimTable>,
    counters: HashMap<u32, i64>,
}

struct SimTable {
    size: i64,
    fields: HashSet<u32>,
    actions: HashSet<u32>,
}

impl Pipeline {
    fn new(p4info: P4Info, cookie: u64) -> Self {
        let tables = p4info
            .tables
            .iter()
            .filter_map(|t| {
                let id = t.preamble.as_ref()?.id;
                Some((
                    id,
                    SimTable {
                        size: t.size,
                        fields: t.match_fields.iter().map(|mf| mf.id).collect(),
                        actions: t.action_refs.iter().map(|ar| ar.id).collect(),
                    },
                ))
            })
            .collect();
        let counters = p4info
            .counters
            .iter()
            .filter_map(|c| Some((c.preamble.as_ref()?.id, c.size)))
            .collect();
        Pipeline {
            p4info,
            cookie,
            tables,
            counters,
        }
    }
}

// Identifies a table entry: table, priority and canonical match key.
type EntryKey = (u32, i32, Vec<Vec<u8>>);

fn entry_key(te: &p4r::TableEntry) -> EntryKey {
    let mut matches = te.r#match.clone();
    matches.sort_by_key(|m| m.field_id);
    (
        te.table_id,
        te.priority,
        matches.iter().map(|m| m.encode_to_vec()).collect(),
    )
}

fn validate_write(op: update::Type, entity_exists: bool) -> Result<(), Status> {
    match (op, entity_exists) {
        (update::Type::Unspecified, _) => Err(Status::invalid_argument("update type is unspecified")),
        (update::Type::Insert, true) => Err(Status::already_exists("entity already exists")),
        (update::Type::Modify, false) | (update::Type::Delete, false) => {
            Err(Status::not_found("entity does not exist"))
        }
        _ => Ok(()),
    }
}

struct SimState {
    device_id: u64,
    next_peer: u64,
    peers: BTreeMap<u64, Peer>,
    primary: Option<u128>,
    pipeline: Option<Pipeline>,
    table_entries: BTreeMap<EntryKey, p4r::TableEntry>,
    clone_sessions: BTreeMap<u32, p4r::CloneSessionEntry>,
    counters: BTreeMap<(u32, i64), p4r::CounterData>,
    read_fault: Option<usize>,
    writes: usize,
}

/// One simulated device.  Clones share state.
#[derive(Clone)]
pub struct SimSwitch {
    state: Arc<Mutex<SimState>>,
}

impl SimSwitch {
    pub fn new(device_id: u64) -> Self {
        SimSwitch {
            state: Arc::new(Mutex::new(SimState {
                device_id,
                next_peer: 0,
                peers: BTreeMap::new(),
                primary: None,
                pipeline: None,
                table_entries: BTreeMap::new(),
                clone_sessions: BTreeMap::new(),
                counters: BTreeMap::new(),
                read_fault: None,
                writes: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_stream(&self, mut requests: BoxStream<'static, p4r::StreamMessageRequest>) -> ResponseStream<p4r::StreamMessageResponse> {
        let (tx, rx) = mpsc::unbounded();
        let peer = self.lock().add_peer(tx);
        let switch = self.clone();
        tokio::spawn(async move {
            while let Some(request) = requests.next().await {
                if let Some(stream_message_request::Update::Arbitration(update)) = request.update {
                    let accepted = switch.lock().arbitrate(peer, update);
                    if !accepted {
                        break;
                    }
                }
            }
            switch.lock().remove_peer(peer);
        });
        rx.boxed()
    }

    pub fn device_id(&self) -> u64 {
        self.lock().device_id
    }

    /// The election id of the current primary controller, if any.
    pub fn primary(&self) -> Option<u128> {
        self.lock().primary
    }

    pub fn connected_controllers(&self) -> usize {
        self.lock().peers.len()
    }

    pub fn has_pipeline(&self) -> bool {
        self.lock().pipeline.is_some()
    }

    pub fn pipeline_cookie(&self) -> Option<u64> {
        self.lock().pipeline.as_ref().map(|p| p.cookie)
    }

    pub fn table_entries(&self) -> Vec<p4r::TableEntry> {
        self.lock().table_entries.values().cloned().collect()
    }

    pub fn clone_session(&self, session_id: u32) -> Option<p4r::CloneSessionEntry> {
        self.lock().clone_sessions.get(&session_id).cloned()
    }

    /// Number of write requests the switch accepted.
    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    /// Makes later reads fail after `n` responses, or restores them.
    pub fn fail_reads_after(&self, n: Option<usize>) {
        self.lock().read_fault = n;
    }

    /// Ends every stream channel, as a switch restart would.
    pub fn drop_streams(&self) {
        let mut state = self.lock();
        state.peers.clear();
        state.primary = None;
    }
}

impl SimState {
    fn add_peer(&mut self, sender: mpsc::UnboundedSender<Result<p4r::StreamMessageResponse, Status>>) -> u64 {
        self.next_peer += 1;
        self.peers.insert(
            self.next_peer,
            Peer {
                election_id: None,
                sender,
            },
        );
        self.next_peer
    }

    fn remove_peer(&mut self, peer: u64) {
        if self.peers.remove(&peer).is_some() {
            self.announce(None);
        }
    }

    fn reject(&mut self, peer: u64, status: Status) {
        if let Some(p) = self.peers.remove(&peer) {
            let _ = p.sender.unbounded_send(Err(status));
        }
        self.announce(None);
    }

    // Returns false if the peer was disconnected.
    fn arbitrate(&mut self, peer: u64, update: p4r::MasterArbitrationUpdate) -> bool {
        if !self.peers.contains_key(&peer) {
            return false;
        }
        if update.device_id != self.device_id {
            let status = Status::not_found(format!("unknown device {}", update.device_id));
            self.reject(peer, status);
            return false;
        }
        let election_id = update.election_id.map(u128::from);
        if election_id.is_some()
            && self
                .peers
                .iter()
                .any(|(&other, p)| other != peer && p.election_id == election_id)
        {
            self.reject(peer, Status::invalid_argument("election id is in use by another controller"));
            return false;
        }
        if let Some(p) = self.peers.get_mut(&peer) {
            p.election_id = election_id;
        }
        self.announce(Some(peer));
        true
    }

    // Recomputes the primary.  Every peer hears about a change; `requester`
    // hears the outcome regardless.
    fn announce(&mut self, requester: Option<u64>) {
        let primary = self.peers.values().filter_map(|p| p.election_id).max();
        let changed = primary != self.primary;
        if changed {
            event!(Level::DEBUG, device_id = self.device_id, ?primary, "primary changed");
        }
        self.primary = primary;
        for (&id, peer) in &self.peers {
            if !changed && Some(id) != requester {
                continue;
            }
            let (code, message) = match primary {
                Some(p) if peer.election_id == Some(p) => (Code::Ok, "this controller is primary"),
                Some(_) => (Code::AlreadyExists, "another controller is primary"),
                None => (Code::NotFound, "there is no primary"),
            };
            let response = p4r::StreamMessageResponse {
                update: Some(stream_message_response::Update::Arbitration(p4r::MasterArbitrationUpdate {
                    device_id: self.device_id,
                    role: None,
                    election_id: primary.map(p4r::Uint128::from),
                    status: Some(proto::status::Status {
                        code: code as i32,
                        message: message.into(),
                        details: Vec::new(),
                    }),
                })),
            };
            let _ = peer.sender.unbounded_send(Ok(response));
        }
    }

    fn check_device(&self, device_id: u64) -> Result<(), Status> {
        if device_id != self.device_id {
            return Err(Status::not_found(format!("unknown device {}", device_id)));
        }
        Ok(())
    }

    fn check_primary(&self, election_id: Option<p4r::Uint128>) -> Result<(), Status> {
        let election_id = election_id.map(u128::from);
        if election_id.is_none() || election_id != self.primary {
            return Err(Status::permission_denied("not the primary controller"));
        }
        Ok(())
    }

    fn set_pipeline(&mut self, request: p4r::SetForwardingPipelineConfigRequest) -> Result<(), Status> {
        use set_forwarding_pipeline_config_request::Action;

        self.check_device(request.device_id)?;
        self.check_primary(request.election_id)?;
        let config = request
            .config
            .ok_or_else(|| Status::invalid_argument("missing forwarding pipeline config"))?;
        let p4info = config
            .p4info
            .ok_or_else(|| Status::invalid_argument("missing P4Info"))?;
        match Action::try_from(request.action) {
            Ok(Action::Verify) => return Ok(()),
            Ok(Action::VerifyAndCommit) | Ok(Action::ReconcileAndCommit) => (),
            _ => return Err(Status::unimplemented("unsupported pipeline config action")),
        }

        let cookie = config.cookie.map_or(0, |c| c.cookie);
        let same_program = self.pipeline.as_ref().map_or(false, |p| p.p4info == p4info);
        if !same_program {
            self.table_entries.clear();
            self.clone_sessions.clear();
            self.counters.clear();
        }
        self.pipeline = Some(Pipeline::new(p4info, cookie));
        event!(Level::DEBUG, device_id = self.device_id, same_program, "installed pipeline");
        Ok(())
    }

    fn write(&mut self, request: p4r::WriteRequest) -> Result<(), Status> {
        self.check_device(request.device_id)?;
        self.check_primary(request.election_id)?;
        if self.pipeline.is_none() {
            return Err(Status::failed_precondition("no forwarding pipeline config"));
        }

        let mut errors = Vec::with_capacity(request.updates.len());
        for u in &request.updates {
            let op = update::Type::try_from(u.r#type).unwrap_or(update::Type::Unspecified);
            let result = match &u.entity {
                Some(entity) => self.write_entity(op, entity),
                None => Err(Status::invalid_argument("update has no entity")),
            };
            errors.push(result.err());
        }
        if errors.iter().all(Option::is_none) {
            self.writes += 1;
            return Ok(());
        }

        let details = proto::status::Status {
            code: Code::Unknown as i32,
            message: String::new(),
            details: errors
                .iter()
                .map(|e| {
                    let (code, message) = e.as_ref().map_or((Code::Ok, ""), |s| (s.code(), s.message()));
                    proto::status::Any {
                        type_url: "type.googleapis.com/p4.v1.Error".into(),
                        value: p4r::Error {
                            canonical_code: code as i32,
                            message: message.into(),
                            ..Default::default()
                        }
                        .encode_to_vec(),
                    }
                })
                .collect(),
        };
        Err(Status::with_details(
            Code::Unknown,
            "write failure",
            Bytes::from(details.encode_to_vec()),
        ))
    }

    fn write_entity(&mut self, op: update::Type, entity: &p4r::Entity) -> Result<(), Status> {
        match &entity.entity {
            Some(entity::Entity::TableEntry(te)) => self.write_table_entry(op, te),
            Some(entity::Entity::CounterEntry(ce)) => self.write_counter(op, ce),
            Some(entity::Entity::PacketReplicationEngineEntry(p4r::PacketReplicationEngineEntry {
                r#type: Some(packet_replication_engine_entry::Type::CloneSessionEntry(cse)),
            })) => {
                if cse.session_id == 0 {
                    return Err(Status::invalid_argument("session_id must not be zero"));
                }
                validate_write(op, self.clone_sessions.contains_key(&cse.session_id))?;
                if op == update::Type::Delete {
                    self.clone_sessions.remove(&cse.session_id);
                } else {
                    self.clone_sessions.insert(cse.session_id, cse.clone());
                }
                Ok(())
            }
            _ => Err(Status::unimplemented("unsupported entity")),
        }
    }

    fn write_table_entry(&mut self, op: update::Type, te: &p4r::TableEntry) -> Result<(), Status> {
        let table = self
            .pipeline
            .as_ref()
            .and_then(|p| p.tables.get(&te.table_id))
            .ok_or_else(|| Status::not_found(format!("unknown table {}", te.table_id)))?;
        if te.is_default_action {
            return Err(Status::unimplemented("default actions cannot be changed"));
        }
        if let Some(fm) = te.r#match.iter().find(|fm| !table.fields.contains(&fm.field_id)) {
            return Err(Status::invalid_argument(format!("unknown match field {}", fm.field_id)));
        }
        if op != update::Type::Delete {
            match te.action.as_ref().and_then(|a| a.r#type.as_ref()) {
                Some(table_action::Type::Action(a)) if table.actions.contains(&a.action_id) => (),
                Some(table_action::Type::Action(a)) => {
                    return Err(Status::invalid_argument(format!(
                        "action {} is not valid for table {}",
                        a.action_id, te.table_id
                    )))
                }
                _ => return Err(Status::invalid_argument("entry has no action")),
            }
        }
        let size = table.size;

        let key = entry_key(te);
        validate_write(op, self.table_entries.contains_key(&key))?;
        match op {
            update::Type::Insert => {
                let used = self.table_entries.keys().filter(|k| k.0 == te.table_id).count();
                if size > 0 && used as i64 >= size {
                    return Err(Status::resource_exhausted(format!("table {} is full", te.table_id)));
                }
                self.table_entries.insert(key, te.clone());
            }
            update::Type::Modify => {
                self.table_entries.insert(key, te.clone());
            }
            update::Type::Delete => {
                self.table_entries.remove(&key);
            }
            update::Type::Unspecified => return Err(Status::invalid_argument("update type is unspecified")),
        }
        Ok(())
    }

    fn write_counter(&mut self, op: update::Type, ce: &p4r::CounterEntry) -> Result<(), Status> {
        if op != update::Type::Modify {
            return Err(Status::invalid_argument("counters can only be modified"));
        }
        let size = self
            .pipeline
            .as_ref()
            .and_then(|p| p.counters.get(&ce.counter_id).copied())
            .ok_or_else(|| Status::not_found(format!("unknown counter {}", ce.counter_id)))?;
        let index = ce
            .index
            .as_ref()
            .map(|i| i.index)
            .ok_or_else(|| Status::invalid_argument("counter writes need an index"))?;
        if index < 0 || index >= size {
            return Err(Status::out_of_range(format!("counter index {} out of range", index)));
        }
        self.counters
            .insert((ce.counter_id, index), ce.data.clone().unwrap_or_default());
        Ok(())
    }

    fn read(&self, request: p4r::ReadRequest) -> Result<Vec<p4r::ReadResponse>, Status> {
        self.check_device(request.device_id)?;
        let pipeline = self
            .pipeline
            .as_ref()
            .ok_or_else(|| Status::failed_precondition("no forwarding pipeline config"))?;

        let mut entities = Vec::new();
        for e in &request.entities {
            match &e.entity {
                Some(entity::Entity::TableEntry(te)) => {
                    if te.table_id != 0 && !pipeline.tables.contains_key(&te.table_id) {
                        return Err(Status::not_found(format!("unknown table {}", te.table_id)));
                    }
                    entities.extend(
                        self.table_entries
                            .values()
                            .filter(|stored| te.table_id == 0 || stored.table_id == te.table_id)
                            .map(|stored| entity::Entity::TableEntry(stored.clone())),
                    );
                }
                Some(entity::Entity::CounterEntry(ce)) => {
                    entities.extend(self.read_counters(pipeline, ce)?.into_iter().map(entity::Entity::CounterEntry));
                }
                _ => return Err(Status::unimplemented("unsupported entity in read")),
            }
        }
        // One entity per response, so that faults can land between them.
        Ok(entities
            .into_iter()
            .map(|e| p4r::ReadResponse {
                entities: vec![p4r::Entity { entity: Some(e) }],
            })
            .collect())
    }

    fn read_counters(&self, pipeline: &Pipeline, ce: &p4r::CounterEntry) -> Result<Vec<p4r::CounterEntry>, Status> {
        let counter_ids: Vec<u32> = if ce.counter_id == 0 {
            let mut ids: Vec<u32> = pipeline.counters.keys().copied().collect();
            ids.sort_unstable();
            ids
        } else if pipeline.counters.contains_key(&ce.counter_id) {
            vec![ce.counter_id]
        } else {
            return Err(Status::not_found(format!("unknown counter {}", ce.counter_id)));
        };

        let mut cells = Vec::new();
        for counter_id in counter_ids {
            match &ce.index {
                Some(p4r::Index { index }) => {
                    let size = pipeline.counters.get(&counter_id).copied().unwrap_or(0);
                    if *index < 0 || *index >= size {
                        return Err(Status::out_of_range(format!("counter index {} out of range", index)));
                    }
                    cells.push(p4r::CounterEntry {
                        counter_id,
                        index: Some(p4r::Index { index: *index }),
                        data: Some(self.counters.get(&(counter_id, *index)).cloned().unwrap_or_default()),
                    });
                }
                None => cells.extend(
                    self.counters
                        .range((counter_id, i64::MIN)..=(counter_id, i64::MAX))
                        .map(|(&(_, index), data)| p4r::CounterEntry {
                            counter_id,
                            index: Some(p4r::Index { index }),
                            data: Some(data.clone()),
                        }),
                ),
            }
        }
        Ok(cells)
    }
}
