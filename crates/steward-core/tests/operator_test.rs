// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operator flows: configuration requests through the resolver down to real
//! worker processes, with filesystem and recording collaborators.

#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use sha2::{Digest, Sha512};
use steward_core::application::ApplicationStatusHandler;
use steward_core::artifact::{
    CopyInstaller, DirUninstaller, Downloader, FsDownloader, InstallerChecker, Layout,
    Sha512Verifier, Uninstaller, Verifier, checksum_path,
};
use steward_core::descriptor::{Descriptor, ProgramSpec};
use steward_core::error::{Error, ErrorKind, Result};
use steward_core::operator::{Operator, ProgramRegistry};
use steward_core::resolver::{ConfigRequest, ProgramConfig};
use steward_core::retry::RetryConfig;
use steward_core::server::Server;
use steward_core::state::Status;
use steward_protocol::proto::StateObservedStatus;
use tempfile::TempDir;

use common::{RecordingReporter, process_config, script, server_config, start_server, wait_until};

const WAIT: Duration = Duration::from_secs(10);
const WORKER: &str = "exec sleep 30";

struct Fixture {
    dir: TempDir,
    layout: Layout,
    server: Arc<Server>,
    operator: Arc<Operator>,
}

fn programs() -> ProgramRegistry {
    [ProgramSpec::new("worker", "worker")].into_iter().collect()
}

fn quick_retry() -> RetryConfig {
    RetryConfig {
        enabled: true,
        retries_count: 2,
        delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        exponential: false,
    }
}

impl Fixture {
    /// Operator over the filesystem collaborators, fetching from `<tmp>/drop`.
    async fn with_fs(retry: RetryConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let drop_dir = dir.path().join("drop");
        Self::build(dir, |b| {
            b.downloader(Arc::new(FsDownloader::new(drop_dir)))
                .verifier(Arc::new(Sha512Verifier))
                .installer(Arc::new(CopyInstaller))
                .uninstaller(Arc::new(DirUninstaller))
                .retry(retry)
        })
        .await
    }

    async fn build(
        dir: TempDir,
        collaborators: impl FnOnce(steward_core::OperatorBuilder) -> steward_core::OperatorBuilder,
    ) -> Self {
        let layout = Layout::host(dir.path().join("downloads"), dir.path().join("install"));
        let server = start_server(server_config(), Arc::new(ApplicationStatusHandler)).await;
        let builder = Operator::builder()
            .server(server.clone())
            .layout(layout.clone())
            .programs(programs())
            .process(process_config())
            .reporter(Arc::new(RecordingReporter::default()));
        let operator = collaborators(builder).build().unwrap();

        Self {
            dir,
            layout,
            server,
            operator,
        }
    }

    fn descriptor(&self, version: &str) -> Descriptor {
        Descriptor::new(
            ProgramSpec::new("worker", "worker"),
            version,
            Vec::<String>::new(),
            &self.layout,
        )
    }

    /// Drop a worker artifact and its checksum for `version`.
    fn publish(&self, version: &str, body: &str) {
        let descriptor = self.descriptor(version);
        let name = descriptor.artifact_path().file_name().unwrap();
        let drop_dir = self.dir.path().join("drop");
        std::fs::create_dir_all(&drop_dir).unwrap();

        let artifact = drop_dir.join(name);
        let contents = script(body);
        std::fs::write(&artifact, &contents).unwrap();
        let digest = format!("{:x}", Sha512::digest(contents.as_bytes()));
        std::fs::write(
            checksum_path(&artifact),
            format!("{}  {}\n", digest, name.to_string_lossy()),
        )
        .unwrap();
    }

    async fn teardown(self) {
        self.operator.shutdown().await.unwrap();
        self.server.stop();
    }
}

fn request(id: &str, programs: Vec<ProgramConfig>) -> ConfigRequest {
    ConfigRequest::new(id, programs)
}

fn alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

#[tokio::test]
async fn test_operator_waits_for_configuration() {
    let fx = Fixture::with_fs(quick_retry()).await;
    assert_eq!(
        fx.operator.status(),
        (
            StateObservedStatus::Starting,
            "Waiting for configuration".to_string()
        )
    );
    assert!(fx.operator.state_id().is_none());
    assert!(fx.operator.app_states().is_empty());
    fx.teardown().await;
}

#[tokio::test]
async fn test_config_request_installs_runs_and_stops() {
    let fx = Fixture::with_fs(quick_retry()).await;
    fx.publish("1.0.0", WORKER);
    let descriptor = fx.descriptor("1.0.0");

    fx.operator
        .handle_config(&request(
            "r1",
            vec![ProgramConfig::new("worker", "1.0.0", json!({"level": 1}))],
        ))
        .await
        .unwrap();

    assert_eq!(
        fx.operator.status(),
        (StateObservedStatus::Healthy, "Running".to_string())
    );
    assert!(fx.operator.state_id().is_some());
    assert!(descriptor.artifact_path().exists());
    assert!(descriptor.executable_path().exists());

    let states = fx.operator.app_states();
    let state = &states["worker--1.0.0"];
    assert_eq!(state.status, Status::STARTING);
    let pid = state.pid().unwrap();
    assert!(alive(pid));

    let app = fx.operator.app("worker--1.0.0").unwrap();
    assert_eq!(app.server_state().unwrap().config(), r#"{"level":1}"#);

    // the same request again is a no-op
    fx.operator
        .handle_config(&request(
            "r1",
            vec![ProgramConfig::new("worker", "1.0.0", json!({"level": 1}))],
        ))
        .await
        .unwrap();
    assert_eq!(fx.operator.app_states()["worker--1.0.0"].pid(), Some(pid));

    // dropping the program stops it and forgets the application
    fx.operator
        .handle_config(&request("r2", vec![]))
        .await
        .unwrap();
    assert!(fx.operator.app_states().is_empty());
    assert!(fx.operator.app("worker--1.0.0").is_none());
    assert!(wait_until(WAIT, || !alive(pid)).await);
    // a plain stop keeps the installation
    assert!(descriptor.executable_path().exists());

    fx.teardown().await;
}

#[tokio::test]
async fn test_changed_config_is_pushed_to_running_worker() {
    let fx = Fixture::with_fs(quick_retry()).await;
    fx.publish("1.0.0", WORKER);

    fx.operator
        .handle_config(&request(
            "r1",
            vec![ProgramConfig::new("worker", "1.0.0", json!({"level": 1}))],
        ))
        .await
        .unwrap();
    let pid = fx.operator.app_states()["worker--1.0.0"].pid();

    fx.operator
        .handle_config(&request(
            "r2",
            vec![ProgramConfig::new("worker", "1.0.0", json!({"level": 2}))],
        ))
        .await
        .unwrap();

    let app = fx.operator.app("worker--1.0.0").unwrap();
    let srv_state = app.server_state().unwrap();
    assert_eq!(srv_state.expected_config_idx(), 2);
    assert_eq!(srv_state.config(), r#"{"level":2}"#);
    // no restart for a configuration change
    assert_eq!(app.state().pid(), pid);

    fx.teardown().await;
}

#[tokio::test]
async fn test_version_change_replaces_worker() {
    let fx = Fixture::with_fs(quick_retry()).await;
    fx.publish("1.0.0", WORKER);
    fx.publish("2.0.0", WORKER);

    fx.operator
        .handle_config(&request(
            "r1",
            vec![ProgramConfig::new("worker", "1.0.0", json!({}))],
        ))
        .await
        .unwrap();
    let old_pid = fx.operator.app_states()["worker--1.0.0"].pid().unwrap();

    fx.operator
        .handle_config(&request(
            "r2",
            vec![ProgramConfig::new("worker", "2.0.0", json!({}))],
        ))
        .await
        .unwrap();

    let states = fx.operator.app_states();
    assert_eq!(states.len(), 1);
    assert!(states.contains_key("worker--2.0.0"));
    assert!(wait_until(WAIT, || !alive(old_pid)).await);

    fx.teardown().await;
}

#[tokio::test]
async fn test_uninstall_removes_installation() {
    let fx = Fixture::with_fs(quick_retry()).await;
    fx.publish("1.0.0", WORKER);
    let descriptor = fx.descriptor("1.0.0");

    fx.operator
        .handle_config(&request(
            "r1",
            vec![ProgramConfig::new("worker", "1.0.0", json!({}))],
        ))
        .await
        .unwrap();
    assert!(descriptor.directory().exists());

    fx.operator
        .handle_config(&request(
            "r2",
            vec![ProgramConfig::new("worker", "1.0.0", json!({})).uninstalled()],
        ))
        .await
        .unwrap();

    assert!(fx.operator.app_states().is_empty());
    assert!(!descriptor.directory().exists());
    assert!(!descriptor.artifact_path().exists());
    assert!(!checksum_path(descriptor.artifact_path()).exists());

    fx.teardown().await;
}

#[tokio::test]
async fn test_unknown_program_fails_operator() {
    let fx = Fixture::with_fs(quick_retry()).await;

    let err = fx
        .operator
        .handle_config(&request(
            "r1",
            vec![ProgramConfig::new("heartbeat", "8.0.0", json!({}))],
        ))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Application);
    let (status, message) = fx.operator.status();
    assert_eq!(status, StateObservedStatus::Failed);
    assert!(message.contains("unknown program"));
    assert!(fx.operator.app_states().is_empty());

    fx.teardown().await;
}

#[tokio::test]
async fn test_bad_checksum_fails_application() {
    let fx = Fixture::with_fs(RetryConfig::disabled()).await;
    fx.publish("1.0.0", WORKER);
    // corrupt the artifact after its checksum was written
    let descriptor = fx.descriptor("1.0.0");
    let name = descriptor.artifact_path().file_name().unwrap();
    std::fs::write(fx.dir.path().join("drop").join(name), "tampered").unwrap();

    let err = fx
        .operator
        .handle_config(&request(
            "r1",
            vec![ProgramConfig::new("worker", "1.0.0", json!({}))],
        ))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Security);
    assert_eq!(fx.operator.status().0, StateObservedStatus::Failed);
    assert_eq!(
        fx.operator.app_states()["worker--1.0.0"].status,
        Status::FAILED
    );
    // the mismatching download was discarded
    assert!(!descriptor.artifact_path().exists());

    fx.teardown().await;
}

#[tokio::test]
async fn test_failed_request_is_resolved_again() {
    let fx = Fixture::with_fs(RetryConfig::disabled()).await;
    let programs = vec![ProgramConfig::new("worker", "1.0.0", json!({}))];

    // nothing published yet
    assert!(
        fx.operator
            .handle_config(&request("r1", programs.clone()))
            .await
            .is_err()
    );

    fx.publish("1.0.0", WORKER);
    fx.operator
        .handle_config(&request("r1", programs))
        .await
        .unwrap();
    assert_eq!(fx.operator.status().0, StateObservedStatus::Healthy);
    assert!(fx.operator.app("worker--1.0.0").unwrap().is_running());

    fx.teardown().await;
}

#[tokio::test]
async fn test_push_config_requires_live_application() {
    let fx = Fixture::with_fs(quick_retry()).await;
    fx.publish("1.0.0", WORKER);
    let descriptor = fx.descriptor("1.0.0");

    let err = fx
        .operator
        .push_config(&descriptor, json!({"a": 1}))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AppNotRunning(_)));

    fx.operator
        .start(descriptor.clone(), json!({"a": 1}))
        .await
        .unwrap();
    fx.operator
        .push_config(&descriptor, json!({"a": 2}))
        .await
        .unwrap();
    let app = fx.operator.app(descriptor.id()).unwrap();
    assert_eq!(app.server_state().unwrap().config(), r#"{"a":2}"#);

    fx.teardown().await;
}

#[tokio::test]
async fn test_shutdown_stops_every_application() {
    let fx = Fixture::with_fs(quick_retry()).await;
    fx.publish("1.0.0", WORKER);
    fx.publish("2.0.0", WORKER);

    let mut pids = Vec::new();
    for version in ["1.0.0", "2.0.0"] {
        fx.operator
            .start(fx.descriptor(version), json!({}))
            .await
            .unwrap();
        pids.push(
            fx.operator.app_states()[&format!("worker--{}", version)]
                .pid()
                .unwrap(),
        );
    }

    fx.operator.shutdown().await.unwrap();
    assert!(fx.operator.app_states().is_empty());
    for pid in pids {
        assert!(wait_until(WAIT, || !alive(pid)).await);
    }

    fx.teardown().await;
}

/// Downloader that fails a number of times before delegating to the real one.
struct FlakyDownloader {
    inner: FsDownloader,
    failures: AtomicU32,
    calls: AtomicU32,
}

#[async_trait]
impl Downloader for FlakyDownloader {
    async fn download(&self, descriptor: &Descriptor) -> Result<std::path::PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(Error::application(descriptor.id(), "connection reset"));
        }
        self.inner.download(descriptor).await
    }
}

/// Verifier that accepts everything and counts its calls.
#[derive(Default)]
struct CountingVerifier {
    calls: AtomicU32,
}

#[async_trait]
impl Verifier for CountingVerifier {
    async fn verify(&self, _: &Descriptor) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Installer that records installs and checks the executable exists.
#[derive(Default)]
struct RecordingInstaller {
    installs: AtomicU32,
}

#[async_trait]
impl InstallerChecker for RecordingInstaller {
    async fn install(&self, descriptor: &Descriptor) -> Result<()> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        CopyInstaller.install(descriptor).await
    }

    async fn check(&self, descriptor: &Descriptor) -> Result<()> {
        CopyInstaller.check(descriptor).await
    }
}

#[derive(Default)]
struct RecordingUninstaller {
    calls: AtomicU32,
}

#[async_trait]
impl Uninstaller for RecordingUninstaller {
    async fn uninstall(&self, descriptor: &Descriptor) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        DirUninstaller.uninstall(descriptor).await
    }
}

#[tokio::test]
async fn test_fetch_is_retried_and_install_skipped_when_present() {
    let dir = TempDir::new().unwrap();
    let downloader = Arc::new(FlakyDownloader {
        inner: FsDownloader::new(dir.path().join("drop")),
        failures: AtomicU32::new(2),
        calls: AtomicU32::new(0),
    });
    let verifier = Arc::new(CountingVerifier::default());
    let installer = Arc::new(RecordingInstaller::default());
    let uninstaller = Arc::new(RecordingUninstaller::default());

    let fx = Fixture::build(dir, {
        let (downloader, verifier, installer, uninstaller) = (
            downloader.clone(),
            verifier.clone(),
            installer.clone(),
            uninstaller.clone(),
        );
        move |b| {
            b.downloader(downloader)
                .verifier(verifier)
                .installer(installer)
                .uninstaller(uninstaller)
                .retry(quick_retry())
        }
    })
    .await;
    fx.publish("1.0.0", WORKER);
    let descriptor = fx.descriptor("1.0.0");

    fx.operator
        .start(descriptor.clone(), json!({}))
        .await
        .unwrap();
    assert_eq!(downloader.calls.load(Ordering::SeqCst), 3);
    assert_eq!(verifier.calls.load(Ordering::SeqCst), 1);
    assert_eq!(installer.installs.load(Ordering::SeqCst), 1);

    // stopped and started again: the artifact and installation are reused
    fx.operator.stop(descriptor.clone()).await.unwrap();
    fx.operator
        .start(descriptor.clone(), json!({}))
        .await
        .unwrap();
    assert_eq!(downloader.calls.load(Ordering::SeqCst), 3);
    assert_eq!(installer.installs.load(Ordering::SeqCst), 1);

    fx.operator.uninstall(descriptor.clone()).await.unwrap();
    assert_eq!(uninstaller.calls.load(Ordering::SeqCst), 1);
    assert!(!descriptor.directory().exists());

    fx.teardown().await;
}

#[tokio::test]
async fn test_retries_exhausted_fail_the_step() {
    let dir = TempDir::new().unwrap();
    let downloader = Arc::new(FlakyDownloader {
        inner: FsDownloader::new(dir.path().join("drop")),
        failures: AtomicU32::new(10),
        calls: AtomicU32::new(0),
    });

    let fx = Fixture::build(dir, {
        let downloader = downloader.clone();
        move |b| {
            b.downloader(downloader)
                .verifier(Arc::new(CountingVerifier::default()))
                .installer(Arc::new(RecordingInstaller::default()))
                .uninstaller(Arc::new(RecordingUninstaller::default()))
                .retry(quick_retry())
        }
    })
    .await;
    fx.publish("1.0.0", WORKER);

    let err = fx
        .operator
        .start(fx.descriptor("1.0.0"), json!({}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("connection reset"));
    // first attempt plus two retries
    assert_eq!(downloader.calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        fx.operator.app_states()["worker--1.0.0"].status,
        Status::FAILED
    );

    fx.teardown().await;
}
