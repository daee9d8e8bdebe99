// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Monitoring hooks consulted when a worker is started and stopped.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Error, Result};

/// Log/metric wiring for supervised workers.
#[async_trait]
pub trait Monitor: Send + Sync {
    /// Add monitoring arguments to the worker's command line.
    fn enrich_args(
        &self,
        process: &str,
        pipeline_id: &str,
        args: Vec<String>,
        is_sidecar: bool,
    ) -> Vec<String>;

    /// File the worker's output is written to, if any.
    fn log_path(&self, process: &str, pipeline_id: &str) -> Option<PathBuf>;

    /// Endpoint the worker exposes metrics on, if any.
    fn metrics_path(&self, process: &str, pipeline_id: &str) -> Option<String>;

    /// [`Monitor::metrics_path`] with its scheme prefix.
    fn metrics_path_prefixed(&self, process: &str, pipeline_id: &str) -> Option<String>;

    /// Create drop paths before the worker starts.
    async fn prepare(&self, process: &str, pipeline_id: &str, uid: u32, gid: u32) -> Result<()>;

    /// Tear down whatever `prepare` created.
    async fn cleanup(&self, process: &str, pipeline_id: &str) -> Result<()>;

    fn watch_logs(&self) -> bool;

    fn watch_metrics(&self) -> bool;

    fn is_monitoring_enabled(&self) -> bool {
        self.watch_logs() || self.watch_metrics()
    }
}

/// Monitor for workers that are not monitored.
#[derive(Debug, Clone, Default)]
pub struct NoopMonitor;

#[async_trait]
impl Monitor for NoopMonitor {
    fn enrich_args(&self, _: &str, _: &str, args: Vec<String>, _: bool) -> Vec<String> {
        args
    }

    fn log_path(&self, _: &str, _: &str) -> Option<PathBuf> {
        None
    }

    fn metrics_path(&self, _: &str, _: &str) -> Option<String> {
        None
    }

    fn metrics_path_prefixed(&self, _: &str, _: &str) -> Option<String> {
        None
    }

    async fn prepare(&self, _: &str, _: &str, _: u32, _: u32) -> Result<()> {
        Ok(())
    }

    async fn cleanup(&self, _: &str, _: &str) -> Result<()> {
        Ok(())
    }

    fn watch_logs(&self) -> bool {
        false
    }

    fn watch_metrics(&self) -> bool {
        false
    }
}

/// Sends each worker's output to `<dir>/<pipeline>/<process>.log`.
#[derive(Debug, Clone)]
pub struct LogDirMonitor {
    dir: PathBuf,
}

impl LogDirMonitor {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn pipeline_dir(&self, pipeline_id: &str) -> PathBuf {
        self.dir.join(pipeline_id)
    }
}

#[async_trait]
impl Monitor for LogDirMonitor {
    fn enrich_args(&self, _: &str, _: &str, args: Vec<String>, _: bool) -> Vec<String> {
        args
    }

    fn log_path(&self, process: &str, pipeline_id: &str) -> Option<PathBuf> {
        Some(self.pipeline_dir(pipeline_id).join(format!("{}.log", process)))
    }

    fn metrics_path(&self, _: &str, _: &str) -> Option<String> {
        None
    }

    fn metrics_path_prefixed(&self, _: &str, _: &str) -> Option<String> {
        None
    }

    async fn prepare(&self, process: &str, pipeline_id: &str, uid: u32, gid: u32) -> Result<()> {
        let dir = self.pipeline_dir(pipeline_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::filesystem(&dir, e))?;

        #[cfg(unix)]
        {
            // only root can hand the directory over; otherwise it already belongs to us
            if nix::unistd::geteuid().is_root() {
                nix::unistd::chown(
                    &dir,
                    Some(nix::unistd::Uid::from_raw(uid)),
                    Some(nix::unistd::Gid::from_raw(gid)),
                )
                .map_err(|e| Error::filesystem(&dir, std::io::Error::from(e)))?;
            }
        }
        #[cfg(not(unix))]
        let _ = (uid, gid);

        debug!(process, pipeline_id, dir = %dir.display(), "log directory prepared");
        Ok(())
    }

    async fn cleanup(&self, process: &str, pipeline_id: &str) -> Result<()> {
        // logs outlive the worker
        debug!(process, pipeline_id, "log directory kept");
        Ok(())
    }

    fn watch_logs(&self) -> bool {
        true
    }

    fn watch_metrics(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_monitor() {
        let m = NoopMonitor;
        let args = vec!["-e".to_string()];
        assert_eq!(m.enrich_args("filebeat", "default", args.clone(), true), args);
        assert!(m.log_path("filebeat", "default").is_none());
        assert!(m.metrics_path_prefixed("filebeat", "default").is_none());
        assert!(!m.is_monitoring_enabled());
        m.prepare("filebeat", "default", 0, 0).await.unwrap();
        m.cleanup("filebeat", "default").await.unwrap();
    }

    #[tokio::test]
    async fn test_log_dir_monitor_prepares_directory() {
        let tmp = tempfile::TempDir::new().unwrap();
        let m = LogDirMonitor::new(tmp.path());
        assert!(m.is_monitoring_enabled());

        let path = m.log_path("filebeat", "edge").unwrap();
        assert_eq!(path, tmp.path().join("edge").join("filebeat.log"));

        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();
        m.prepare("filebeat", "edge", uid, gid).await.unwrap();
        assert!(tmp.path().join("edge").is_dir());
    }
}
