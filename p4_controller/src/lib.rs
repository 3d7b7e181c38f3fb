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

//! Drives a set of P4Runtime switches that run the same program.
//!
//! A [`Controller`] owns one [`SwitchSession`] per switch.  Sessions are
//! independent: connecting, installing and shutting down proceed on every
//! switch in parallel, and one switch failing never blocks the others.
//! Per-switch outcomes are reported together.

pub mod config;
pub mod program;

use futures::future::join_all;
use futures::stream::BoxStream;
use itertools::Itertools;
use p4ext::{
    Connector,
    CounterSample,
    EntryView,
    MirrorSession,
    P4Error,
    PipelineConfig,
    SchemaRegistry,
    SessionOptions,
    SessionState,
    SwitchSession,
    TableEntry,
    UpdateType,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;
use tracing::{event, Level};

pub use config::{CounterQuery, FilteringRule, ForwardingRule, MirrorConfig, SwitchConfig, Topology};

fn describe_failures(failures: &[(String, P4Error)]) -> String {
    failures
        .iter()
        .map(|(switch, error)| format!("{} ({})", switch, error))
        .join(", ")
}

/// The switches that could not be reached.  The rest stay connected.
#[derive(Debug, Error)]
#[error("could not connect to {}", describe_failures(.failures))]
pub struct ConnectError {
    pub failures: Vec<(String, P4Error)>,
}

impl ConnectError {
    pub fn switches(&self) -> Vec<&str> {
        self.failures.iter().map(|(name, _)| name.as_str()).collect()
    }
}

/// Close failures seen during shutdown.  Every session is closed anyway.
#[derive(Debug, Error)]
#[error("unclean shutdown: {}", describe_failures(.failures))]
pub struct ShutdownReport {
    pub failures: Vec<(String, P4Error)>,
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("no switch named {0}")]
    UnknownSwitch(String),

    #[error("switch {0} is not connected")]
    NotConnected(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("{switch}: {source}")]
    Switch {
        switch: String,
        #[source]
        source: P4Error,
    },
}

impl ControllerError {
    fn switch(switch: &str) -> impl FnOnce(P4Error) -> ControllerError + '_ {
        move |source| ControllerError::Switch {
            switch: switch.to_string(),
            source,
        }
    }
}

/// The switches a program is installed on.
#[derive(Clone, Copy, Debug)]
pub enum Targets<'a> {
    All,
    Only(&'a [&'a str]),
}

/// Outcome of installing a program, per switch.
#[derive(Debug, Default)]
pub struct InstallReport {
    pub outcomes: BTreeMap<String, Result<(), P4Error>>,
}

impl InstallReport {
    pub fn is_ok(&self) -> bool {
        self.outcomes.values().all(Result::is_ok)
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &str> {
        self.outcomes
            .iter()
            .filter(|(_, r)| r.is_ok())
            .map(|(name, _)| name.as_str())
    }

    pub fn failed(&self) -> impl Iterator<Item = (&str, &P4Error)> {
        self.outcomes
            .iter()
            .filter_map(|(name, r)| r.as_ref().err().map(|e| (name.as_str(), e)))
    }
}

pub struct Controller {
    registry: Arc<SchemaRegistry>,
    connector: Arc<dyn Connector>,
    options: SessionOptions,
    switches: Vec<SwitchConfig>,
    sessions: BTreeMap<String, SwitchSession>,
}

impl Controller {
    /// Switch names and device ids must be unique.  Nothing is connected
    /// until `connect_all` or `connect`.
    pub fn new(
        registry: Arc<SchemaRegistry>,
        connector: Arc<dyn Connector>,
        switches: Vec<SwitchConfig>,
        options: SessionOptions,
    ) -> Result<Self, ControllerError> {
        let mut names = HashSet::new();
        let mut devices = HashMap::new();
        for switch in &switches {
            if !names.insert(switch.name.as_str()) {
                return Err(ControllerError::Config(format!("duplicate switch name {}", switch.name)));
            }
            if let Some(other) = devices.insert(switch.device_id, switch.name.as_str()) {
                return Err(ControllerError::Config(format!(
                    "{} and {} both use device id {}",
                    other, switch.name, switch.device_id
                )));
            }
        }
        Ok(Controller {
            registry,
            connector,
            options,
            switches,
            sessions: BTreeMap::new(),
        })
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn switches(&self) -> &[SwitchConfig] {
        &self.switches
    }

    pub fn session(&self, switch: &str) -> Option<&SwitchSession> {
        self.sessions.get(switch)
    }

    /// True if the switch has a session that is not closed.
    pub fn is_connected(&self, switch: &str) -> bool {
        self.sessions
            .get(switch)
            .map_or(false, |s| s.state() != SessionState::Closed)
    }

    fn switch_config(&self, switch: &str) -> Result<&SwitchConfig, ControllerError> {
        self.switches
            .iter()
            .find(|s| s.name == switch)
            .ok_or_else(|| ControllerError::UnknownSwitch(switch.to_string()))
    }

    fn session_options(&self, switch: &SwitchConfig) -> SessionOptions {
        let mut options = self.options.clone();
        if let Some(id) = switch.election_id {
            options.election_id = u128::from(id).into();
        }
        if switch.proto_dump_file.is_some() {
            options.request_log = switch.proto_dump_file.clone();
        }
        options
    }

    fn new_session(&self, switch: &SwitchConfig) -> SwitchSession {
        SwitchSession::new(&switch.name, &switch.address, switch.device_id, self.session_options(switch))
    }

    fn live_session(&mut self, switch: &str) -> Result<&mut SwitchSession, ControllerError> {
        self.switch_config(switch)?;
        match self.sessions.get_mut(switch) {
            Some(session) if session.state() != SessionState::Closed => Ok(session),
            _ => Err(ControllerError::NotConnected(switch.to_string())),
        }
    }

    fn readable_session(&self, switch: &str) -> Result<&SwitchSession, ControllerError> {
        self.switch_config(switch)?;
        match self.sessions.get(switch) {
            Some(session) if session.state() != SessionState::Closed => Ok(session),
            _ => Err(ControllerError::NotConnected(switch.to_string())),
        }
    }

    /// Connects to every switch not already connected and requests
    /// mastership, all in parallel.  Switches that fail are named in the
    /// returned `ConnectError`; the others remain connected and usable.
    pub async fn connect_all(&mut self) -> Result<(), ControllerError> {
        let pending: Vec<SwitchSession> = self
            .switches
            .iter()
            .filter(|s| !self.is_connected(&s.name))
            .map(|s| self.new_session(s))
            .collect();
        let connector = self.connector.clone();
        let results = join_all(pending.into_iter().map(|mut session| {
            let connector = connector.clone();
            async move {
                let result = establish(&mut session, connector.as_ref()).await;
                (session, result)
            }
        }))
        .await;

        let mut failures = Vec::new();
        for (session, result) in results {
            let name = session.name().to_string();
            match result {
                Ok(state) => {
                    event!(Level::INFO, switch = %name, %state, "connected");
                    self.sessions.insert(name, session);
                }
                Err(error) => {
                    event!(Level::WARN, switch = %name, "could not connect: {}", error);
                    self.sessions.remove(&name);
                    failures.push((name, error));
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ConnectError { failures }.into())
        }
    }

    /// Connects one switch, replacing a closed session if there is one.
    pub async fn connect(&mut self, switch: &str) -> Result<SessionState, ControllerError> {
        let config = self.switch_config(switch)?;
        if let Some(session) = self.sessions.get(switch) {
            if session.state() != SessionState::Closed {
                return Ok(session.state());
            }
        }
        let mut session = self.new_session(config);
        let state = establish(&mut session, self.connector.as_ref())
            .await
            .map_err(ControllerError::switch(switch))?;
        self.sessions.insert(switch.to_string(), session);
        Ok(state)
    }

    /// Installs `config` on the targeted switches in parallel.  A switch
    /// that is not connected, or rejects the program, is reported without
    /// affecting the others.
    pub async fn install_program(
        &mut self,
        targets: Targets<'_>,
        config: &PipelineConfig,
    ) -> Result<InstallReport, ControllerError> {
        let names: Vec<String> = match targets {
            Targets::All => self.switches.iter().map(|s| s.name.clone()).collect(),
            Targets::Only(names) => {
                for name in names {
                    self.switch_config(name)?;
                }
                names.iter().map(|name| name.to_string()).collect()
            }
        };

        let mut report = InstallReport::default();
        let installs = self
            .sessions
            .iter_mut()
            .filter(|(name, session)| names.contains(*name) && session.state() != SessionState::Closed)
            .map(|(name, session)| async move { (name.clone(), session.set_forwarding_pipeline_config(config).await) });
        report.outcomes.extend(join_all(installs).await);

        for name in names {
            report.outcomes.entry(name).or_insert(Err(P4Error::NotConnected));
        }
        for (name, outcome) in &report.outcomes {
            match outcome {
                Ok(()) => event!(Level::INFO, switch = %name, "installed program"),
                Err(e) => event!(Level::WARN, switch = %name, "could not install program: {}", e),
            }
        }
        Ok(report)
    }

    pub async fn write(&mut self, switch: &str, entry: &TableEntry, op: UpdateType) -> Result<(), ControllerError> {
        self.live_session(switch)?
            .write_table_entry(entry, op)
            .await
            .map_err(ControllerError::switch(switch))
    }

    pub async fn write_mirror_session(
        &mut self,
        switch: &str,
        mirror: &MirrorSession,
        dry_run: bool,
    ) -> Result<(), ControllerError> {
        self.live_session(switch)?
            .write_mirror_session(mirror, dry_run)
            .await
            .map_err(ControllerError::switch(switch))
    }

    pub async fn write_counter(&mut self, switch: &str, sample: &CounterSample) -> Result<(), ControllerError> {
        self.live_session(switch)?
            .write_counter(sample)
            .await
            .map_err(ControllerError::switch(switch))
    }

    /// Streams the entries of `table`, or of every table if `None`.
    pub async fn read_table_entries(
        &self,
        switch: &str,
        table: Option<&str>,
    ) -> Result<BoxStream<'static, Result<TableEntry, P4Error>>, ControllerError> {
        let table_id = match table {
            Some(name) => self.registry.resolve_table(name).map_err(ControllerError::switch(switch))?,
            None => p4ext::ALL_TABLES,
        };
        self.readable_session(switch)?
            .read_table_entries(table_id)
            .await
            .map_err(ControllerError::switch(switch))
    }

    pub async fn read_counters(
        &self,
        switch: &str,
        counter: &str,
        index: i64,
    ) -> Result<BoxStream<'static, Result<CounterSample, P4Error>>, ControllerError> {
        let counter_id = self
            .registry
            .resolve_counter(counter)
            .map_err(ControllerError::switch(switch))?;
        self.readable_session(switch)?
            .read_counters(counter_id, index)
            .await
            .map_err(ControllerError::switch(switch))
    }

    pub fn describe(&self, entry: &TableEntry) -> Result<EntryView, P4Error> {
        self.registry.describe(entry)
    }

    /// Closes every session, whatever state it is in.  Close failures are
    /// collected into one report.  Calling this again does nothing.
    pub async fn shutdown(&mut self) -> Result<(), ShutdownReport> {
        let sessions = std::mem::take(&mut self.sessions);
        let closes = sessions.into_iter().map(|(name, mut session)| async move {
            let result = session.close().await;
            (name, result)
        });
        let failures: Vec<(String, P4Error)> = join_all(closes)
            .await
            .into_iter()
            .filter_map(|(name, result)| result.err().map(|e| (name, e)))
            .collect();
        if failures.is_empty() {
            event!(Level::DEBUG, "all sessions closed");
            Ok(())
        } else {
            Err(ShutdownReport { failures })
        }
    }
}

impl Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("switches", &self.switches)
            .field("connected", &self.sessions.keys().collect::<Vec<_>>())
            .finish()
    }
}

async fn establish(session: &mut SwitchSession, connector: &dyn Connector) -> Result<SessionState, P4Error> {
    session.open(connector)?;
    session.request_mastership().await
}
