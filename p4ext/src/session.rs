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

//! A control-plane session with one switch.
//!
//! States move `Disconnected -> Connecting -> Arbitrating -> Master |
//! Standby -> Active -> Closed`.  Mastership can change later: a background
//! task watches the stream channel, demotes the session to `Standby` when a
//! controller with a higher election id appears, promotes it back when
//! that controller goes away, and moves it to `Closed` when the stream
//! ends.  `Closed` is terminal.

use futures::channel::mpsc;
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use prost::Message;
use proto::p4info::P4Info;
use proto::p4runtime::{
    self as p4r,
    entity,
    forwarding_pipeline_config,
    set_forwarding_pipeline_config_request,
    stream_message_request,
    stream_message_response,
    write_request,
};
use std::cmp::min;
use std::fmt::{self, Display};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tonic::Code;
use tracing::{event, Level};

use crate::entry::{CounterSample, MirrorSession, TableEntry, UpdateType};
use crate::trace::RequestLog;
use crate::transport::{Connector, ResponseStream, Transport};
use crate::{Delivery, P4Error, RpcError};

/// Reads every table when passed as a table id.
pub const ALL_TABLES: u32 = 0;

/// Reads every index when passed as a counter index.
pub const ALL_INDEXES: i64 = 0;

/// A 128-bit election id.  Among controllers of one device the highest id
/// is primary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ElectionId(pub u128);

impl From<u128> for ElectionId {
    fn from(id: u128) -> Self {
        ElectionId(id)
    }
}

impl From<ElectionId> for p4r::Uint128 {
    fn from(id: ElectionId) -> Self {
        id.0.into()
    }
}

impl Display for ElectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Arbitrating,
    Master,
    Standby,
    Active,
    Closed,
}

impl SessionState {
    /// Master or Active: this session's writes are accepted.
    pub fn is_master(self) -> bool {
        matches!(self, SessionState::Master | SessionState::Active)
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Arbitrating => "arbitrating",
            SessionState::Master => "master",
            SessionState::Standby => "standby",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub election_id: ElectionId,
    pub role_id: u64,
    /// Bounds the whole of mastership arbitration, retries included.
    pub arbitration_timeout: Duration,
    /// Bounds each write, read and pipeline request.
    pub request_timeout: Duration,
    /// How long `close` waits for the switch to end the stream.
    pub close_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Records every request sent, if set.
    pub request_log: Option<PathBuf>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            election_id: ElectionId(1),
            role_id: 0,
            arbitration_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(1),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            request_log: None,
        }
    }
}

/// A compiled program: P4Info plus the target-specific device image.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineConfig {
    pub p4info: Vec<u8>,
    pub device_config: Vec<u8>,
    pub cookie: Option<u64>,
}

impl PipelineConfig {
    pub fn new(p4info: Vec<u8>, device_config: Vec<u8>) -> Self {
        PipelineConfig {
            p4info,
            device_config,
            cookie: None,
        }
    }

    /// Reads the binary P4Info and the device image (for BMv2, its JSON)
    /// produced by the compiler.
    pub fn from_files(p4info: &Path, device_config: &Path) -> Result<Self, P4Error> {
        let read = |path: &Path| {
            fs::read(path).map_err(|source| P4Error::Io {
                context: format!("reading {}", path.display()),
                source,
            })
        };
        Ok(PipelineConfig::new(read(p4info)?, read(device_config)?))
    }
}

// The portion of the compiler output worth logging.
#[derive(Debug)]
#[allow(dead_code)]
struct PipelineSummary {
    device_id: u64,
    election_id: ElectionId,
    action: set_forwarding_pipeline_config_request::Action,
    p4info_bytes: usize,
    device_config_bytes: usize,
    cookie: Option<u64>,
}

#[derive(Debug)]
struct Shared {
    state: SessionState,
    primary: Option<ElectionId>,
    pipeline_installed: bool,
}

impl Shared {
    // Applies an arbitration outcome, returning the previous and new states.
    fn on_arbitration(&mut self, is_primary: bool, primary: Option<ElectionId>) -> (SessionState, SessionState) {
        let old = self.state;
        if old == SessionState::Closed {
            return (old, old);
        }
        self.primary = primary;
        self.state = match (is_primary, self.pipeline_installed) {
            (true, true) => SessionState::Active,
            (true, false) => SessionState::Master,
            (false, _) => SessionState::Standby,
        };
        (old, self.state)
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

// Decides whether an arbitration response names us as primary.  A missing
// status is taken at face value from the election id.
fn arbitration_outcome(update: &p4r::MasterArbitrationUpdate, own: ElectionId) -> (bool, Option<ElectionId>) {
    let primary = update.election_id.as_ref().map(|id| ElectionId(id.into()));
    let ok = update.status.as_ref().map_or(true, |s| s.code == Code::Ok as i32);
    (ok && primary == Some(own), primary)
}

pub struct SwitchSession {
    name: String,
    address: String,
    device_id: u64,
    options: SessionOptions,
    transport: Option<Arc<dyn Transport>>,
    shared: Arc<Mutex<Shared>>,
    stream_tx: Option<mpsc::UnboundedSender<p4r::StreamMessageRequest>>,
    watcher: Option<JoinHandle<()>>,
    write_seqno: u64,
    request_log: Option<RequestLog>,
}

impl SwitchSession {
    pub fn new(name: &str, address: &str, device_id: u64, options: SessionOptions) -> Self {
        SwitchSession {
            name: name.to_string(),
            address: address.to_string(),
            device_id,
            options,
            transport: None,
            shared: Arc::new(Mutex::new(Shared {
                state: SessionState::Disconnected,
                primary: None,
                pipeline_installed: false,
            })),
            stream_tx: None,
            watcher: None,
            write_seqno: 0,
            request_log: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn device_id(&self) -> u64 {
        self.device_id
    }

    pub fn election_id(&self) -> ElectionId {
        self.options.election_id
    }

    pub fn state(&self) -> SessionState {
        lock(&self.shared).state
    }

    /// The primary's election id, as last reported by the switch.
    pub fn primary(&self) -> Option<ElectionId> {
        lock(&self.shared).primary
    }

    /// Number of write requests sent so far.
    pub fn write_seqno(&self) -> u64 {
        self.write_seqno
    }

    pub fn request_log(&self) -> Option<&Path> {
        self.request_log.as_ref().map(|log| log.path())
    }

    fn set_state(&self, state: SessionState) -> SessionState {
        let mut shared = lock(&self.shared);
        let old = shared.state;
        if old != SessionState::Closed {
            shared.state = state;
        }
        old
    }

    fn log_request(&self, rpc: &str, request: &dyn fmt::Debug) {
        if let Some(log) = &self.request_log {
            log.record(rpc, request);
        }
    }

    /// Creates the transport.  Nothing is sent until `request_mastership`.
    pub fn open(&mut self, connector: &dyn Connector) -> Result<(), P4Error> {
        match self.state() {
            SessionState::Disconnected => (),
            SessionState::Closed => return Err(P4Error::Closed),
            _ => return Ok(()),
        }
        if let Some(path) = &self.options.request_log {
            self.request_log = Some(RequestLog::create(path)?);
        }
        self.transport = Some(connector.connect(&self.address)?);
        self.set_state(SessionState::Connecting);
        event!(Level::DEBUG, switch = %self.name, address = %self.address, "connecting");
        Ok(())
    }

    fn arbitration_request(&self) -> p4r::StreamMessageRequest {
        p4r::StreamMessageRequest {
            update: Some(stream_message_request::Update::Arbitration(p4r::MasterArbitrationUpdate {
                device_id: self.device_id,
                role: (self.options.role_id != 0).then(|| p4r::Role {
                    id: self.options.role_id,
                    ..Default::default()
                }),
                election_id: Some(self.options.election_id.into()),
                status: None,
            })),
        }
    }

    /// Opens the stream channel and asks to become primary, retrying with
    /// exponential backoff while the switch is unreachable.  Returns
    /// `Master` or `Standby`.  Fails with `Timeout` once
    /// `arbitration_timeout` has passed, after which the session is
    /// `Closed`.
    ///
    /// On a session that already has a stream, resends the arbitration
    /// request and returns the current state.
    pub async fn request_mastership(&mut self) -> Result<SessionState, P4Error> {
        let transport = match self.state() {
            SessionState::Disconnected => return Err(P4Error::NotConnected),
            SessionState::Closed => return Err(P4Error::Closed),
            _ => self.transport.clone().ok_or(P4Error::NotConnected)?,
        };
        if let Some(tx) = &self.stream_tx {
            let request = self.arbitration_request();
            self.log_request("StreamChannel", &request);
            tx.unbounded_send(request).map_err(|_| P4Error::Closed)?;
            return Ok(self.state());
        }

        self.set_state(SessionState::Arbitrating);
        let started = Instant::now();
        let deadline = started + self.options.arbitration_timeout;
        let mut backoff = self.options.initial_backoff;
        let mut attempt = 1;
        loop {
            let error = match self.try_arbitrate(&transport, deadline).await {
                Ok(state) => {
                    event!(Level::INFO, switch = %self.name, election_id = %self.options.election_id, "became {}", state);
                    return Ok(state);
                }
                Err(error) => error,
            };
            let retryable = matches!(error, P4Error::Transport { .. } | P4Error::Timeout { .. });
            if !retryable || Instant::now() + backoff >= deadline {
                event!(Level::WARN, switch = %self.name, attempt, "mastership arbitration failed: {}", error);
                self.abandon();
                return Err(if retryable {
                    P4Error::Timeout {
                        operation: "mastership arbitration",
                        after: started.elapsed(),
                        delivery: Delivery::NotSent,
                    }
                } else {
                    error
                });
            }
            event!(Level::DEBUG, switch = %self.name, attempt, ?backoff, "retrying arbitration: {}", error);
            sleep(backoff).await;
            backoff = min(backoff * 2, self.options.max_backoff);
            attempt += 1;
        }
    }

    async fn try_arbitrate(&mut self, transport: &Arc<dyn Transport>, deadline: Instant) -> Result<SessionState, P4Error> {
        let (tx, rx) = mpsc::unbounded();
        let request = self.arbitration_request();
        self.log_request("StreamChannel", &request);
        // The receiver is alive, so this cannot fail.
        let _ = tx.unbounded_send(request);

        let mut responses = timeout(deadline.saturating_duration_since(Instant::now()), transport.stream_channel(rx.boxed()))
            .await
            .map_err(|_| P4Error::Timeout {
                operation: "opening stream channel",
                after: self.options.arbitration_timeout,
                delivery: Delivery::NotSent,
            })?
            .map_err(|status| P4Error::from_status(status, self.device_id))?;

        let first = timeout(deadline.saturating_duration_since(Instant::now()), responses.next())
            .await
            .map_err(|_| P4Error::Timeout {
                operation: "waiting for arbitration response",
                after: self.options.arbitration_timeout,
                delivery: Delivery::Unknown,
            })?;
        let update = match first {
            Some(Ok(p4r::StreamMessageResponse {
                update: Some(stream_message_response::Update::Arbitration(update)),
            })) => update,
            Some(Ok(other)) => return Err(P4Error::Decode(format!("expected arbitration response, got {:?}", other))),
            Some(Err(status)) => return Err(P4Error::from_status(status, self.device_id)),
            None => {
                return Err(P4Error::Transport {
                    delivery: Delivery::Unknown,
                    message: "stream closed before arbitration response".into(),
                })
            }
        };

        let (is_primary, primary) = arbitration_outcome(&update, self.options.election_id);
        let (_, state) = lock(&self.shared).on_arbitration(is_primary, primary);
        self.stream_tx = Some(tx);
        self.watcher = Some(tokio::spawn(watch_stream(
            responses,
            self.shared.clone(),
            self.options.election_id,
            self.name.clone(),
        )));
        Ok(state)
    }

    // Gives up on the switch after a failed arbitration.
    fn abandon(&mut self) {
        self.stream_tx = None;
        self.transport = None;
        self.set_state(SessionState::Closed);
    }

    fn require_master(&self) -> Result<(), P4Error> {
        match self.state() {
            SessionState::Master | SessionState::Active => Ok(()),
            SessionState::Disconnected => Err(P4Error::NotConnected),
            SessionState::Closed => Err(P4Error::Closed),
            _ => Err(P4Error::NotMaster {
                device_id: self.device_id,
            }),
        }
    }

    fn require_active(&self) -> Result<(), P4Error> {
        self.require_master()?;
        if self.state() == SessionState::Master {
            return Err(P4Error::NoPipeline {
                device_id: self.device_id,
            });
        }
        Ok(())
    }

    fn transport(&self) -> Result<Arc<dyn Transport>, P4Error> {
        match self.state() {
            SessionState::Disconnected => Err(P4Error::NotConnected),
            SessionState::Closed => Err(P4Error::Closed),
            _ => self.transport.clone().ok_or(P4Error::NotConnected),
        }
    }

    // Classifies a failed request, demoting the session if the switch no
    // longer considers it primary.
    fn request_failed(&self, status: tonic::Status) -> P4Error {
        let error = P4Error::from_status(status, self.device_id);
        if let P4Error::NotMaster { .. } = error {
            let mut shared = lock(&self.shared);
            if shared.state.is_master() {
                event!(Level::WARN, switch = %self.name, "switch reports another primary, demoting to standby");
                shared.state = SessionState::Standby;
            }
        }
        error
    }

    /// Installs a program with `VERIFY_AND_COMMIT`, moving the session to
    /// `Active`.  Reinstalling the same program is harmless.
    pub async fn set_forwarding_pipeline_config(&mut self, config: &PipelineConfig) -> Result<(), P4Error> {
        self.require_master()?;
        let transport = self.transport()?;
        let action = set_forwarding_pipeline_config_request::Action::VerifyAndCommit;
        let p4info = P4Info::decode(config.p4info.as_slice())
            .map_err(|e| P4Error::Schema(format!("cannot decode P4Info: {}", e)))?;
        let request = p4r::SetForwardingPipelineConfigRequest {
            device_id: self.device_id,
            role_id: self.options.role_id,
            election_id: Some(self.options.election_id.into()),
            action: action as i32,
            config: Some(p4r::ForwardingPipelineConfig {
                p4info: Some(p4info),
                p4_device_config: config.device_config.clone(),
                cookie: config.cookie.map(|cookie| forwarding_pipeline_config::Cookie { cookie }),
            }),
            role: String::new(),
        };
        self.log_request(
            "SetForwardingPipelineConfig",
            &PipelineSummary {
                device_id: self.device_id,
                election_id: self.options.election_id,
                action,
                p4info_bytes: config.p4info.len(),
                device_config_bytes: config.device_config.len(),
                cookie: config.cookie,
            },
        );

        match timeout(self.options.request_timeout, transport.set_forwarding_pipeline_config(request)).await {
            Err(_) => Err(P4Error::Timeout {
                operation: "SetForwardingPipelineConfig",
                after: self.options.request_timeout,
                delivery: Delivery::Unknown,
            }),
            Ok(Err(status)) => Err(self.request_failed(status)),
            Ok(Ok(())) => {
                self.mark_pipeline_installed()?;
                event!(Level::INFO, switch = %self.name, "installed forwarding pipeline");
                Ok(())
            }
        }
    }

    /// Records that the switch already runs the intended program, for
    /// reconnecting without reinstalling it.
    pub fn mark_pipeline_installed(&mut self) -> Result<(), P4Error> {
        self.require_master()?;
        let mut shared = lock(&self.shared);
        shared.pipeline_installed = true;
        if shared.state == SessionState::Master {
            shared.state = SessionState::Active;
        }
        Ok(())
    }

    async fn write_entity(
        &mut self,
        entity: p4r::Entity,
        op: UpdateType,
        what: &'static str,
        dry_run: bool,
    ) -> Result<(), P4Error> {
        self.require_active()?;
        let transport = self.transport()?;
        let request = p4r::WriteRequest {
            device_id: self.device_id,
            role_id: self.options.role_id,
            election_id: Some(self.options.election_id.into()),
            updates: vec![p4r::Update {
                r#type: p4r::update::Type::from(op) as i32,
                entity: Some(entity),
            }],
            atomicity: write_request::Atomicity::ContinueOnError as i32,
            role: String::new(),
        };
        self.log_request("Write", &request);
        if dry_run {
            event!(Level::INFO, switch = %self.name, "dry run, not sending {} {}", op, what);
            return Ok(());
        }

        self.write_seqno += 1;
        let result = timeout(self.options.request_timeout, transport.write(request)).await;
        match result {
            Err(_) => Err(P4Error::Timeout {
                operation: what,
                after: self.options.request_timeout,
                delivery: Delivery::Unknown,
            }),
            Ok(Err(status)) => {
                let error = self.request_failed(status);
                event!(Level::DEBUG, switch = %self.name, seqno = self.write_seqno, "{} {} failed: {}", op, what, error);
                Err(error)
            }
            Ok(Ok(())) => {
                event!(Level::DEBUG, switch = %self.name, seqno = self.write_seqno, "{} {}", op, what);
                Ok(())
            }
        }
    }

    /// Inserts, modifies or deletes one table entry.  Writes through one
    /// session are sent one at a time, in call order.
    pub async fn write_table_entry(&mut self, entry: &TableEntry, op: UpdateType) -> Result<(), P4Error> {
        self.write_entity(entry.into(), op, "table entry", false).await
    }

    /// Installs a mirror session.  With `dry_run`, the request is validated
    /// and logged but not sent.
    pub async fn write_mirror_session(&mut self, session: &MirrorSession, dry_run: bool) -> Result<(), P4Error> {
        self.write_entity(session.into(), UpdateType::Insert, "mirror session", dry_run)
            .await
    }

    /// Sets one counter cell.
    pub async fn write_counter(&mut self, sample: &CounterSample) -> Result<(), P4Error> {
        self.write_entity(sample.into(), UpdateType::Modify, "counter", false)
            .await
    }

    async fn read_entities(&self, entities: Vec<p4r::Entity>) -> Result<ResponseStream<p4r::ReadResponse>, P4Error> {
        let transport = self.transport()?;
        let request = p4r::ReadRequest {
            device_id: self.device_id,
            entities,
            role: String::new(),
        };
        self.log_request("Read", &request);
        match timeout(self.options.request_timeout, transport.read(request)).await {
            Err(_) => Err(P4Error::Timeout {
                operation: "read",
                after: self.options.request_timeout,
                delivery: Delivery::Unknown,
            }),
            Ok(Err(status)) => Err(P4Error::from_status(status, self.device_id)),
            Ok(Ok(responses)) => Ok(responses),
        }
    }

    /// Streams the entries of one table, or of every table for
    /// `ALL_TABLES`.  Allowed in `Standby`.  An error ends the stream.
    pub async fn read_table_entries(
        &self,
        table_id: u32,
    ) -> Result<BoxStream<'static, Result<TableEntry, P4Error>>, P4Error> {
        let filter = p4r::Entity {
            entity: Some(entity::Entity::TableEntry(p4r::TableEntry {
                table_id,
                ..Default::default()
            })),
        };
        let responses = self.read_entities(vec![filter]).await?;
        Ok(flatten_entities(responses, |e| match e {
            entity::Entity::TableEntry(te) => Some(TableEntry::try_from(&te)),
            _ => None,
        }))
    }

    /// Streams the cells of a counter: one cell, or every cell for
    /// `ALL_INDEXES`.
    pub async fn read_counters(
        &self,
        counter_id: u32,
        index: i64,
    ) -> Result<BoxStream<'static, Result<CounterSample, P4Error>>, P4Error> {
        if index < 0 {
            return Err(P4Error::InvalidValue(format!("negative counter index {}", index)));
        }
        let filter = p4r::Entity {
            entity: Some(entity::Entity::CounterEntry(p4r::CounterEntry {
                counter_id,
                index: (index != ALL_INDEXES).then(|| p4r::Index { index }),
                data: None,
            })),
        };
        let responses = self.read_entities(vec![filter]).await?;
        Ok(flatten_entities(responses, |e| match e {
            entity::Entity::CounterEntry(ce) => Some(Ok(CounterSample::from(&ce))),
            _ => None,
        }))
    }

    /// Ends the stream channel and releases the transport.  Idempotent.
    /// The session is `Closed` afterward even if this returns an error,
    /// which only reports that the shutdown was not clean.
    pub async fn close(&mut self) -> Result<(), P4Error> {
        let previous = {
            let mut shared = lock(&self.shared);
            std::mem::replace(&mut shared.state, SessionState::Closed)
        };
        if previous == SessionState::Closed && self.watcher.is_none() && self.transport.is_none() {
            return Ok(());
        }
        self.stream_tx = None;
        self.transport = None;

        let mut result = Ok(());
        if let Some(mut watcher) = self.watcher.take() {
            if timeout(self.options.close_timeout, &mut watcher).await.is_err() {
                watcher.abort();
                result = Err(P4Error::Timeout {
                    operation: "closing stream channel",
                    after: self.options.close_timeout,
                    delivery: Delivery::Unknown,
                });
            }
        }
        if let Some(log) = &self.request_log {
            if let Err(e) = log.flush() {
                result = result.and(Err(e));
            }
        }
        event!(Level::INFO, switch = %self.name, "closed session");
        result
    }
}

impl Drop for SwitchSession {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

// Follows mastership changes until the switch ends the stream.
async fn watch_stream(
    mut responses: ResponseStream<p4r::StreamMessageResponse>,
    shared: Arc<Mutex<Shared>>,
    own: ElectionId,
    name: String,
) {
    while let Some(response) = responses.next().await {
        match response {
            Ok(p4r::StreamMessageResponse {
                update: Some(stream_message_response::Update::Arbitration(update)),
            }) => {
                let (is_primary, primary) = arbitration_outcome(&update, own);
                let (old, new) = lock(&shared).on_arbitration(is_primary, primary);
                if old != new {
                    event!(Level::INFO, switch = %name, from = %old, to = %new, "mastership changed");
                }
            }
            Ok(p4r::StreamMessageResponse {
                update: Some(stream_message_response::Update::Error(e)),
            }) => {
                event!(Level::WARN, switch = %name, code = e.canonical_code, "switch reported stream error: {}", e.message);
            }
            Ok(_) => (),
            Err(status) => {
                event!(Level::WARN, switch = %name, "stream channel failed: {}", status);
                break;
            }
        }
    }
    let mut shared = lock(&shared);
    if shared.state != SessionState::Closed {
        event!(Level::INFO, switch = %name, "stream channel ended");
        shared.state = SessionState::Closed;
    }
}

// Turns a read response stream into a stream of decoded entities.  A
// failure mid-stream is yielded once and ends the stream.
fn flatten_entities<T, F>(
    responses: ResponseStream<p4r::ReadResponse>,
    mut decode: F,
) -> BoxStream<'static, Result<T, P4Error>>
where
    T: Send + 'static,
    F: FnMut(entity::Entity) -> Option<Result<T, P4Error>> + Send + 'static,
{
    responses
        .map(move |response| match response {
            Ok(response) => response
                .entities
                .into_iter()
                .filter_map(|e| e.entity)
                .filter_map(&mut decode)
                .collect::<Vec<_>>(),
            Err(status) => vec![Err(P4Error::Rpc(RpcError::from_status(&status)))],
        })
        .flat_map(stream::iter)
        .scan(false, |failed, item| {
            if *failed {
                return future::ready(None);
            }
            *failed = item.is_err();
            future::ready(Some(item))
        })
        .boxed()
}
