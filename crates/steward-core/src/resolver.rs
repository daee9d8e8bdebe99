// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Desired configuration to step list conversion.
//!
//! [`StateResolver::resolve`] diffs a [`ConfigRequest`] against the last
//! acknowledged state and returns the steps needed to get there. The new
//! state only becomes the baseline once the caller invokes [`Ack::ack`],
//! so a partially applied request is simply recomputed next time.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::descriptor::join_tags;
use crate::error::{Error, Result};
use crate::sync::lock;

/// One program in a configuration request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramConfig {
    /// Program registry name
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Configuration pushed to the worker
    #[serde(default)]
    pub config: Value,
    /// Remove the program together with its installation.
    #[serde(default)]
    pub uninstall: bool,
}

impl ProgramConfig {
    pub fn new(name: impl Into<String>, version: impl Into<String>, config: Value) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            tags: BTreeSet::new(),
            config,
            uninstall: false,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn uninstalled(mut self) -> Self {
        self.uninstall = true;
        self
    }

    /// Name plus tags; versions of the same key replace each other.
    fn key(&self) -> String {
        if self.tags.is_empty() {
            return self.name.clone();
        }
        format!("{}--{}", self.name, join_tags(&self.tags))
    }

    fn checksum(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(&(&self.version, &self.tags, &self.config))?);
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// Desired configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigRequest {
    pub id: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub programs: Vec<ProgramConfig>,
}

impl ConfigRequest {
    pub fn new(id: impl Into<String>, programs: Vec<ProgramConfig>) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
            programs,
        }
    }
}

/// What a step does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepId {
    #[serde(rename = "sc-run")]
    Run,
    #[serde(rename = "sc-remove")]
    Remove,
}

impl StepId {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepId::Run => "sc-run",
            StepId::Remove => "sc-remove",
        }
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work for the operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub version: String,
    /// Program registry name
    pub program: String,
    pub tags: BTreeSet<String>,
    /// `config` for run steps, `uninstall` for remove steps
    pub meta: Map<String, Value>,
}

impl Step {
    fn run(program: &ProgramConfig) -> Self {
        let mut meta = Map::new();
        meta.insert("config".to_string(), program.config.clone());
        Self {
            id: StepId::Run,
            version: program.version.clone(),
            program: program.name.clone(),
            tags: program.tags.clone(),
            meta,
        }
    }

    fn remove(entry: &Materialized, uninstall: bool) -> Self {
        let mut meta = Map::new();
        meta.insert("uninstall".to_string(), Value::Bool(uninstall));
        Self {
            id: StepId::Remove,
            version: entry.version.clone(),
            program: entry.name.clone(),
            tags: entry.tags.clone(),
            meta,
        }
    }

    /// Configuration carried by a run step.
    pub fn config(&self) -> Value {
        self.meta.get("config").cloned().unwrap_or(Value::Null)
    }

    /// Whether a remove step also uninstalls.
    pub fn uninstall(&self) -> bool {
        self.meta
            .get("uninstall")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// A program the last acknowledged request brought up.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Materialized {
    name: String,
    version: String,
    tags: BTreeSet<String>,
    checksum: String,
}

type Snapshot = BTreeMap<String, Materialized>;

/// Compute the steps leading from `current` to `request`, and the state
/// reached once they are applied. Removals come first.
fn converge(current: &Snapshot, request: &ConfigRequest) -> Result<(Snapshot, Vec<Step>)> {
    let mut next = Snapshot::new();
    let mut seen = BTreeSet::new();
    let mut removes = Vec::new();
    let mut runs = Vec::new();

    for program in &request.programs {
        let key = program.key();
        if !seen.insert(key.clone()) {
            return Err(Error::Config(format!("program '{}' listed twice", key)));
        }

        if program.uninstall {
            if let Some(entry) = current.get(&key) {
                removes.push(Step::remove(entry, true));
            }
            continue;
        }

        let entry = Materialized {
            name: program.name.clone(),
            version: program.version.clone(),
            tags: program.tags.clone(),
            checksum: program.checksum()?,
        };
        match current.get(&key) {
            Some(old) if old.checksum == entry.checksum => {}
            Some(old) => {
                if old.version != entry.version {
                    removes.push(Step::remove(old, false));
                }
                runs.push(Step::run(program));
            }
            None => runs.push(Step::run(program)),
        }
        next.insert(key, entry);
    }

    for (key, entry) in current {
        if !seen.contains(key) {
            removes.push(Step::remove(entry, false));
        }
    }

    removes.extend(runs);
    Ok((next, removes))
}

/// Serializes resolution and acknowledgement over one baseline.
#[derive(Debug, Default)]
pub struct StateResolver {
    state: Arc<Mutex<Snapshot>>,
}

/// Commits a resolved state as the new baseline.
#[derive(Debug)]
#[must_use = "the resolved state only becomes the baseline once acked"]
pub struct Ack {
    state: Arc<Mutex<Snapshot>>,
    next: Snapshot,
    id: String,
}

impl Ack {
    /// Call once every step was applied.
    pub fn ack(self) {
        debug!(id = %self.id, programs = self.next.len(), "state acknowledged");
        *lock(&self.state) = self.next;
    }
}

impl StateResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Steps moving the acknowledged baseline to `request`.
    pub fn resolve(&self, request: &ConfigRequest) -> Result<(String, Vec<Step>, Ack)> {
        let current = lock(&self.state);
        let (next, steps) = converge(&current, request)?;
        debug!(id = %request.id, steps = steps.len(), "configuration resolved");
        Ok((
            request.id.clone(),
            steps,
            Ack {
                state: self.state.clone(),
                next,
                id: request.id.clone(),
            },
        ))
    }

    /// Names of the programs in the acknowledged baseline.
    pub fn programs(&self) -> Vec<String> {
        lock(&self.state).keys().cloned().collect()
    }
}
