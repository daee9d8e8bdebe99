// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Artifact layout and the collaborators that fetch, verify and install them.
//!
//! The operator only sees the traits below. Filesystem implementations live
//! in [`fs`].

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::descriptor::{Descriptor, ProgramSpec};
use crate::error::Result;

pub mod fs;

pub use fs::{CopyInstaller, DirUninstaller, FsDownloader, Sha512Verifier, checksum_path};

/// Downloads an artifact to [`Descriptor::artifact_path`].
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, descriptor: &Descriptor) -> Result<PathBuf>;
}

/// Checks a downloaded artifact before it is installed.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, descriptor: &Descriptor) -> Result<()>;
}

/// Installs an artifact into [`Descriptor::directory`] and checks an
/// existing installation.
#[async_trait]
pub trait InstallerChecker: Send + Sync {
    async fn install(&self, descriptor: &Descriptor) -> Result<()>;

    /// `Ok` when the installation is complete and usable.
    async fn check(&self, descriptor: &Descriptor) -> Result<()>;
}

/// Removes an installation.
#[async_trait]
pub trait Uninstaller: Send + Sync {
    async fn uninstall(&self, descriptor: &Descriptor) -> Result<()>;
}

/// Directory layout for downloads and installs on one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    downloads: PathBuf,
    install: PathBuf,
    os: String,
    arch: String,
}

impl Layout {
    pub fn new(
        downloads: impl Into<PathBuf>,
        install: impl Into<PathBuf>,
        os: impl Into<String>,
        arch: impl Into<String>,
    ) -> Self {
        Self {
            downloads: downloads.into(),
            install: install.into(),
            os: os.into(),
            arch: arch.into(),
        }
    }

    /// Layout for the host this process runs on.
    pub fn host(downloads: impl Into<PathBuf>, install: impl Into<PathBuf>) -> Self {
        Self::new(downloads, install, host_os(), std::env::consts::ARCH)
    }

    pub fn downloads_dir(&self) -> &Path {
        &self.downloads
    }

    pub fn artifact_path(&self, spec: &ProgramSpec, version: &str) -> PathBuf {
        artifact_path(spec, version, &self.os, &self.arch, &self.downloads)
    }

    pub fn install_dir(&self, spec: &ProgramSpec, version: &str) -> PathBuf {
        install_dir(spec, version, &self.os, &self.arch, &self.install)
    }
}

/// `<cmd>-<version>-<os>-<arch suffix>.<tar.gz|zip>`
pub fn artifact_name(spec: &ProgramSpec, version: &str, os: &str, arch: &str) -> String {
    format!(
        "{}-{}-{}-{}.{}",
        spec.cmd,
        version,
        os,
        arch_suffix(arch),
        archive_extension(os)
    )
}

/// `<target_dir>/<artifact name>`
pub fn artifact_path(
    spec: &ProgramSpec,
    version: &str,
    os: &str,
    arch: &str,
    target_dir: &Path,
) -> PathBuf {
    target_dir.join(artifact_name(spec, version, os, arch))
}

/// The artifact name under `target_dir` with its archive suffix stripped.
pub fn install_dir(
    spec: &ProgramSpec,
    version: &str,
    os: &str,
    arch: &str,
    target_dir: &Path,
) -> PathBuf {
    let name = artifact_name(spec, version, os, arch);
    let suffix = format!(".{}", archive_extension(os));
    let stem = name.strip_suffix(&suffix).unwrap_or(&name);
    target_dir.join(stem)
}

/// Normalized architecture label used in artifact names.
pub fn arch_suffix(arch: &str) -> &str {
    match arch {
        "32" | "x86" | "i386" | "i686" => "x86",
        "64" | "x86_64" | "amd64" => "x86_64",
        "aarch64" | "arm64" => "arm64",
        other => other,
    }
}

fn archive_extension(os: &str) -> &'static str {
    if os == "windows" { "zip" } else { "tar.gz" }
}

fn host_os() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ProgramSpec {
        ProgramSpec::new("filebeat", "filebeat")
    }

    #[test]
    fn test_artifact_name_per_platform() {
        assert_eq!(
            artifact_name(&spec(), "8.0.0", "linux", "64"),
            "filebeat-8.0.0-linux-x86_64.tar.gz"
        );
        assert_eq!(
            artifact_name(&spec(), "8.0.0", "linux", "32"),
            "filebeat-8.0.0-linux-x86.tar.gz"
        );
        assert_eq!(
            artifact_name(&spec(), "8.0.0", "darwin", "arm64"),
            "filebeat-8.0.0-darwin-arm64.tar.gz"
        );
        assert_eq!(
            artifact_name(&spec(), "8.0.0", "windows", "x86_64"),
            "filebeat-8.0.0-windows-x86_64.zip"
        );
    }

    #[test]
    fn test_install_dir_strips_archive_suffix() {
        let dir = Path::new("/opt/steward/install");
        assert_eq!(
            install_dir(&spec(), "8.0.0", "linux", "aarch64", dir),
            PathBuf::from("/opt/steward/install/filebeat-8.0.0-linux-arm64")
        );
        assert_eq!(
            install_dir(&spec(), "8.0.0", "windows", "64", dir),
            PathBuf::from("/opt/steward/install/filebeat-8.0.0-windows-x86_64")
        );
    }

    #[test]
    fn test_unknown_arch_passes_through() {
        assert_eq!(arch_suffix("riscv64"), "riscv64");
    }

    #[test]
    fn test_host_layout_is_deterministic() {
        let a = Layout::host("/d", "/i");
        let b = Layout::host("/d", "/i");
        assert_eq!(a.artifact_path(&spec(), "1.0.0"), b.artifact_path(&spec(), "1.0.0"));
        assert!(a.artifact_path(&spec(), "1.0.0").starts_with("/d"));
        assert!(a.install_dir(&spec(), "1.0.0").starts_with("/i"));
    }
}
