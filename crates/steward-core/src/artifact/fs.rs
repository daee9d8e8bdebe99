// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local filesystem collaborators.
//!
//! Artifacts are single executables dropped into a directory next to a
//! `<artifact>.sha512` checksum file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha512};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use super::{Downloader, InstallerChecker, Uninstaller, Verifier};
use crate::descriptor::Descriptor;
use crate::error::{Error, Result};

/// `<artifact>.sha512`
pub fn checksum_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_os_string();
    name.push(".sha512");
    PathBuf::from(name)
}

async fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::filesystem(parent, e))?;
    }
    Ok(())
}

/// Copies artifacts (and their checksum files) out of a drop directory.
#[derive(Debug, Clone)]
pub struct FsDownloader {
    drop_dir: PathBuf,
}

impl FsDownloader {
    pub fn new(drop_dir: impl Into<PathBuf>) -> Self {
        Self {
            drop_dir: drop_dir.into(),
        }
    }
}

#[async_trait]
impl Downloader for FsDownloader {
    async fn download(&self, descriptor: &Descriptor) -> Result<PathBuf> {
        let target = descriptor.artifact_path();
        let Some(file_name) = target.file_name() else {
            return Err(Error::application(
                descriptor.id(),
                format!("artifact path {} has no file name", target.display()),
            ));
        };
        let source = self.drop_dir.join(file_name);

        create_parent(target).await?;
        tokio::fs::copy(&source, target)
            .await
            .map_err(|e| Error::filesystem(&source, e))?;

        let source_sum = checksum_path(&source);
        if tokio::fs::try_exists(&source_sum).await.unwrap_or(false) {
            tokio::fs::copy(&source_sum, checksum_path(target))
                .await
                .map_err(|e| Error::filesystem(&source_sum, e))?;
        }

        info!(app_id = %descriptor.id(), path = %target.display(), "artifact fetched");
        Ok(target.to_path_buf())
    }
}

/// Verifies an artifact against its sibling `.sha512` file.
///
/// A mismatching artifact is deleted so the next fetch starts over.
#[derive(Debug, Clone, Default)]
pub struct Sha512Verifier;

impl Sha512Verifier {
    async fn digest(path: &Path) -> Result<String> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| Error::filesystem(path, e))?;
        let mut hasher = Sha512::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file
                .read(&mut buf)
                .await
                .map_err(|e| Error::filesystem(path, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }
}

#[async_trait]
impl Verifier for Sha512Verifier {
    async fn verify(&self, descriptor: &Descriptor) -> Result<()> {
        let artifact = descriptor.artifact_path();
        let sum_path = checksum_path(artifact);

        let expected = match tokio::fs::read_to_string(&sum_path).await {
            Ok(contents) => contents
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_ascii_lowercase(),
            Err(e) => {
                return Err(Error::Security(format!(
                    "missing checksum {}: {}",
                    sum_path.display(),
                    e
                )));
            }
        };

        let actual = Self::digest(artifact).await?;
        if actual != expected {
            warn!(app_id = %descriptor.id(), path = %artifact.display(), "checksum mismatch, removing artifact");
            let _ = tokio::fs::remove_file(artifact).await;
            return Err(Error::Security(format!(
                "checksum mismatch for {}: expected {}, got {}",
                artifact.display(),
                expected,
                actual
            )));
        }

        debug!(app_id = %descriptor.id(), "artifact verified");
        Ok(())
    }
}

/// Installs a single-binary artifact as `<install dir>/<cmd>`.
#[derive(Debug, Clone, Default)]
pub struct CopyInstaller;

#[async_trait]
impl InstallerChecker for CopyInstaller {
    async fn install(&self, descriptor: &Descriptor) -> Result<()> {
        let dir = descriptor.directory();
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::filesystem(dir, e))?;

        let binary = descriptor.executable_path();
        tokio::fs::copy(descriptor.artifact_path(), &binary)
            .await
            .map_err(|e| Error::filesystem(descriptor.artifact_path(), e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755))
                .await
                .map_err(|e| Error::filesystem(&binary, e))?;
        }

        info!(app_id = %descriptor.id(), path = %binary.display(), "installed");
        Ok(())
    }

    async fn check(&self, descriptor: &Descriptor) -> Result<()> {
        let binary = descriptor.executable_path();
        let meta = tokio::fs::metadata(&binary)
            .await
            .map_err(|e| Error::filesystem(&binary, e))?;
        if !meta.is_file() {
            return Err(Error::application(
                descriptor.id(),
                format!("{} is not a file", binary.display()),
            ));
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if meta.permissions().mode() & 0o111 == 0 {
                return Err(Error::application(
                    descriptor.id(),
                    format!("{} is not executable", binary.display()),
                ));
            }
        }
        Ok(())
    }
}

/// Removes the install directory.
#[derive(Debug, Clone, Default)]
pub struct DirUninstaller;

#[async_trait]
impl Uninstaller for DirUninstaller {
    async fn uninstall(&self, descriptor: &Descriptor) -> Result<()> {
        let dir = descriptor.directory();
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {
                info!(app_id = %descriptor.id(), "uninstalled");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::filesystem(dir, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::Layout;
    use crate::descriptor::ProgramSpec;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        drop_dir: PathBuf,
        descriptor: Descriptor,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let drop_dir = tmp.path().join("drop");
        std::fs::create_dir_all(&drop_dir).unwrap();
        let layout = Layout::new(
            tmp.path().join("downloads"),
            tmp.path().join("install"),
            "linux",
            "x86_64",
        );
        let descriptor = Descriptor::new(
            ProgramSpec::new("worker", "worker"),
            "1.0.0",
            Vec::<String>::new(),
            &layout,
        );
        Fixture {
            _tmp: tmp,
            drop_dir,
            descriptor,
        }
    }

    fn drop_artifact(fx: &Fixture, contents: &[u8], checksum: Option<String>) {
        let name = fx.descriptor.artifact_path().file_name().unwrap();
        let path = fx.drop_dir.join(name);
        std::fs::write(&path, contents).unwrap();
        let sum = checksum.unwrap_or_else(|| format!("{:x}", Sha512::digest(contents)));
        std::fs::write(checksum_path(&path), format!("{}  {}\n", sum, name.to_string_lossy()))
            .unwrap();
    }

    #[tokio::test]
    async fn test_fetch_verify_install_uninstall() {
        let fx = fixture();
        drop_artifact(&fx, b"#!/bin/sh\nexit 0\n", None);

        let path = FsDownloader::new(&fx.drop_dir)
            .download(&fx.descriptor)
            .await
            .unwrap();
        assert_eq!(path, fx.descriptor.artifact_path());
        assert!(path.exists());

        Sha512Verifier.verify(&fx.descriptor).await.unwrap();

        assert!(CopyInstaller.check(&fx.descriptor).await.is_err());
        CopyInstaller.install(&fx.descriptor).await.unwrap();
        CopyInstaller.check(&fx.descriptor).await.unwrap();

        DirUninstaller.uninstall(&fx.descriptor).await.unwrap();
        assert!(!fx.descriptor.directory().exists());
        // second uninstall is a no-op
        DirUninstaller.uninstall(&fx.descriptor).await.unwrap();
    }

    #[tokio::test]
    async fn test_download_missing_artifact_is_filesystem_error() {
        let fx = fixture();
        let err = FsDownloader::new(&fx.drop_dir)
            .download(&fx.descriptor)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Filesystem);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_removes_artifact() {
        let fx = fixture();
        drop_artifact(&fx, b"payload", Some("00ff".to_string()));
        FsDownloader::new(&fx.drop_dir)
            .download(&fx.descriptor)
            .await
            .unwrap();

        let err = Sha512Verifier.verify(&fx.descriptor).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Security);
        assert!(!fx.descriptor.artifact_path().exists());
    }

    #[tokio::test]
    async fn test_missing_checksum_is_security_error() {
        let fx = fixture();
        std::fs::create_dir_all(fx.descriptor.artifact_path().parent().unwrap()).unwrap();
        std::fs::write(fx.descriptor.artifact_path(), b"payload").unwrap();

        let err = Sha512Verifier.verify(&fx.descriptor).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Security);
    }
}
