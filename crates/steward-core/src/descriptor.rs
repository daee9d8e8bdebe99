// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Program specs and the descriptors that identify runnable workers.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::artifact::Layout;

/// Tag marking a worker that runs alongside a primary worker.
pub const SIDECAR_TAG: &str = "sidecar";

/// Static description of a supported program.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProgramSpec {
    /// Registry name, e.g. "filebeat"
    pub name: String,
    /// Binary name inside the install directory
    pub cmd: String,
    /// Arguments always passed to the binary
    #[serde(default)]
    pub args: Vec<String>,
    /// Set when the program runs as a pre-installed service listening on this
    /// loopback port for its connection info, rather than as a child process.
    #[serde(default)]
    pub service_port: Option<u16>,
}

impl ProgramSpec {
    pub fn new(name: impl Into<String>, cmd: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cmd: cmd.into(),
            args: Vec::new(),
            service_port: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_service_port(mut self, port: u16) -> Self {
        self.service_port = Some(port);
        self
    }
}

/// Identity and install metadata of one runnable worker.
///
/// Two descriptors with the same command, version and tags share an
/// [`Descriptor::id`] and therefore the same Application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    spec: ProgramSpec,
    version: String,
    tags: BTreeSet<String>,
    directory: PathBuf,
    artifact_path: PathBuf,
    id: String,
}

impl Descriptor {
    pub fn new<I, S>(spec: ProgramSpec, version: impl Into<String>, tags: I, layout: &Layout) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let version = version.into();
        let tags: BTreeSet<String> = tags
            .into_iter()
            .map(Into::into)
            .filter(|t: &String| !t.is_empty())
            .collect();

        let directory = layout.install_dir(&spec, &version);
        let artifact_path = layout.artifact_path(&spec, &version);
        let id = descriptor_id(&spec.cmd, &version, &tags);

        Self {
            spec,
            version,
            tags,
            directory,
            artifact_path,
            id,
        }
    }

    /// Stable identity: `<cmd>--<version>`, plus `--<tag>-<tag>` when tagged.
    /// Dashes inside a tag are percent-encoded.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn spec(&self) -> &ProgramSpec {
        &self.spec
    }

    pub fn binary_name(&self) -> &str {
        &self.spec.cmd
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// Install directory
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Where the downloaded artifact lives
    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }

    /// Path of the binary inside the install directory
    pub fn executable_path(&self) -> PathBuf {
        self.directory.join(&self.spec.cmd)
    }

    pub fn service_port(&self) -> Option<u16> {
        self.spec.service_port
    }

    pub fn is_sidecar(&self) -> bool {
        self.tags.contains(SIDECAR_TAG)
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

fn descriptor_id(cmd: &str, version: &str, tags: &BTreeSet<String>) -> String {
    let mut id = format!("{}--{}", cmd, version);
    if !tags.is_empty() {
        id.push_str("--");
        id.push_str(&join_tags(tags));
    }
    id
}

/// Tags joined with `-`. A `-` or `%` inside a tag is percent-encoded, so
/// different tag sets never join to the same string.
pub(crate) fn join_tags(tags: &BTreeSet<String>) -> String {
    tags.iter()
        .map(|tag| tag.replace('%', "%25").replace('-', "%2D"))
        .collect::<Vec<_>>()
        .join("-")
}
