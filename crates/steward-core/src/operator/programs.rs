// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Programs the operator knows how to run.

use std::collections::BTreeMap;

use crate::descriptor::ProgramSpec;

/// Registry of supported programs, keyed by [`ProgramSpec::name`].
#[derive(Debug, Clone, Default)]
pub struct ProgramRegistry {
    programs: BTreeMap<String, ProgramSpec>,
}

impl ProgramRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `spec`, replacing a program of the same name.
    pub fn register(&mut self, spec: ProgramSpec) -> &mut Self {
        self.programs.insert(spec.name.clone(), spec);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ProgramSpec> {
        self.programs.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.programs.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }
}

impl FromIterator<ProgramSpec> for ProgramRegistry {
    fn from_iter<I: IntoIterator<Item = ProgramSpec>>(iter: I) -> Self {
        let mut registry = Self::new();
        for spec in iter {
            registry.register(spec);
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let registry: ProgramRegistry = [
            ProgramSpec::new("filebeat", "filebeat"),
            ProgramSpec::new("metricbeat", "metricbeat").with_args(["-e"]),
        ]
        .into_iter()
        .collect();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("metricbeat").unwrap().args, vec!["-e"]);
        assert!(registry.get("heartbeat").is_none());
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["filebeat", "metricbeat"]);
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = ProgramRegistry::new();
        registry
            .register(ProgramSpec::new("endpoint", "endpoint"))
            .register(ProgramSpec::new("endpoint", "endpoint").with_service_port(6788));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("endpoint").unwrap().service_port, Some(6788));
    }
}
