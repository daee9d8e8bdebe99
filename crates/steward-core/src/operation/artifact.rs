// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operations on artifacts and installations.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::Operation;
use crate::application::Application;
use crate::artifact::{Downloader, InstallerChecker, Uninstaller, Verifier};
use crate::error::{Error, Result};
use crate::state::Status;

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Record `err` as the application's failure and hand it back.
fn fail(app: &Application, err: Error) -> Error {
    app.set_state(Status::FAILED, err.to_string());
    err
}

/// Downloads the artifact. Skipped when it is already present.
pub struct FetchOperation {
    downloader: Arc<dyn Downloader>,
}

impl FetchOperation {
    pub fn new(downloader: Arc<dyn Downloader>) -> Self {
        Self { downloader }
    }
}

#[async_trait]
impl Operation for FetchOperation {
    fn name(&self) -> &str {
        "fetch"
    }

    async fn check(&self, _: &CancellationToken, app: &Arc<Application>) -> Result<bool> {
        Ok(!exists(app.descriptor().artifact_path()).await)
    }

    async fn run(&self, _: &CancellationToken, app: &Arc<Application>) -> Result<()> {
        self.downloader
            .download(app.descriptor())
            .await
            .map_err(|e| fail(app, e))?;
        Ok(())
    }
}

/// Verifies the downloaded artifact. A missing artifact is a fatal error.
pub struct VerifyOperation {
    verifier: Arc<dyn Verifier>,
}

impl VerifyOperation {
    pub fn new(verifier: Arc<dyn Verifier>) -> Self {
        Self { verifier }
    }
}

#[async_trait]
impl Operation for VerifyOperation {
    fn name(&self) -> &str {
        "verify"
    }

    async fn check(&self, _: &CancellationToken, app: &Arc<Application>) -> Result<bool> {
        let path = app.descriptor().artifact_path();
        if !exists(path).await {
            let err = Error::application(
                app.id(),
                format!("artifact {} is missing", path.display()),
            );
            return Err(fail(app, err).fatal());
        }
        Ok(true)
    }

    async fn run(&self, _: &CancellationToken, app: &Arc<Application>) -> Result<()> {
        self.verifier
            .verify(app.descriptor())
            .await
            .map_err(|e| fail(app, e))
    }
}

/// Installs the artifact. Skipped when the installation checks out.
pub struct InstallOperation {
    installer: Arc<dyn InstallerChecker>,
}

impl InstallOperation {
    pub fn new(installer: Arc<dyn InstallerChecker>) -> Self {
        Self { installer }
    }
}

#[async_trait]
impl Operation for InstallOperation {
    fn name(&self) -> &str {
        "install"
    }

    async fn check(&self, _: &CancellationToken, app: &Arc<Application>) -> Result<bool> {
        Ok(self.installer.check(app.descriptor()).await.is_err())
    }

    async fn run(&self, _: &CancellationToken, app: &Arc<Application>) -> Result<()> {
        self.installer
            .install(app.descriptor())
            .await
            .map_err(|e| fail(app, e))
    }
}

/// Removes the installation. Never skipped.
pub struct UninstallOperation {
    uninstaller: Arc<dyn Uninstaller>,
}

impl UninstallOperation {
    pub fn new(uninstaller: Arc<dyn Uninstaller>) -> Self {
        Self { uninstaller }
    }
}

#[async_trait]
impl Operation for UninstallOperation {
    fn name(&self) -> &str {
        "uninstall"
    }

    async fn check(&self, _: &CancellationToken, _: &Arc<Application>) -> Result<bool> {
        Ok(true)
    }

    async fn run(&self, _: &CancellationToken, app: &Arc<Application>) -> Result<()> {
        self.uninstaller
            .uninstall(app.descriptor())
            .await
            .map_err(|e| fail(app, e))
    }
}

/// Deletes the downloaded artifact, its checksum and the install directory.
/// Skipped when none of them exist.
#[derive(Debug, Clone, Default)]
pub struct RemoveOperation;

impl RemoveOperation {
    pub fn new() -> Self {
        Self
    }
}

async fn remove_file(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(Error::filesystem(path, e)),
        _ => Ok(()),
    }
}

#[async_trait]
impl Operation for RemoveOperation {
    fn name(&self) -> &str {
        "remove"
    }

    async fn check(&self, _: &CancellationToken, app: &Arc<Application>) -> Result<bool> {
        let descriptor = app.descriptor();
        Ok(exists(descriptor.artifact_path()).await || exists(descriptor.directory()).await)
    }

    async fn run(&self, _: &CancellationToken, app: &Arc<Application>) -> Result<()> {
        let descriptor = app.descriptor();
        let artifact = descriptor.artifact_path();
        let checksum = crate::artifact::checksum_path(artifact);

        remove_file(artifact).await.map_err(|e| fail(app, e))?;
        remove_file(&checksum).await.map_err(|e| fail(app, e))?;

        let dir = descriptor.directory();
        match tokio::fs::remove_dir_all(dir).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                return Err(fail(app, Error::filesystem(dir, e)));
            }
            _ => {}
        }

        info!(app_id = %app.id(), "artifact and installation removed");
        Ok(())
    }
}
