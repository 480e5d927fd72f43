// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Native package manager backends.
//!
//! The native package manager is resolved once at startup into a
//! [`PackageBackend`], then every install or query dispatches on it. The
//! package managers themselves are opaque; only their exit status matters.

use crate::{
    context::Platform,
    exec::{Cmd, ExecError, Runner},
    privilege::{PrivilegeError, PrivilegeGate},
};

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::Path,
};
use tracing::{debug, info, instrument};

/// Native package manager of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageBackend {
    Apt,
    Dnf,
    Brew,
    Unsupported,
}

impl PackageBackend {
    /// Detect package backend for platform.
    ///
    /// macOS always uses Homebrew, even if it still needs to be installed.
    /// Linux uses the first of apt-get or dnf found on `PATH`.
    pub fn detect(platform: Platform, runner: &dyn Runner) -> Self {
        let backend = match platform {
            Platform::MacOs => Self::Brew,
            Platform::Linux if runner.locate("apt-get").is_some() => Self::Apt,
            Platform::Linux if runner.locate("dnf").is_some() => Self::Dnf,
            Platform::Linux => Self::Unsupported,
        };
        debug!("detected package backend {backend}");

        backend
    }

    /// Check whether package is installed.
    pub fn query(&self, runner: &dyn Runner, package: &str) -> bool {
        let cmd = match self {
            Self::Apt => Cmd::new("dpkg").args(["-s", package]),
            Self::Dnf => Cmd::new("rpm").args(["-q", package]),
            Self::Brew => Cmd::new(brew_program(runner)).args(["list", "--versions", package]),
            Self::Unsupported => return false,
        };

        runner.succeeds(&cmd)
    }

    /// Install listing of packages.
    ///
    /// apt and dnf run through the privilege gate. Homebrew refuses to run
    /// as root, so it runs as the invoking user.
    ///
    /// # Errors
    ///
    /// - Return [`BackendError::Unsupported`] if no package manager exists.
    /// - Return [`BackendError::Privilege`] if elevation fails.
    /// - Return [`BackendError::Exec`] if package manager fails.
    #[instrument(skip(self, runner, gate, packages), level = "debug")]
    pub fn install(
        &self,
        runner: &dyn Runner,
        gate: &PrivilegeGate,
        packages: &[&str],
    ) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }

        info!("install {} through {self}", packages.join(" "));
        match self {
            Self::Apt => {
                runner.status(&gate.elevate(runner, Cmd::new("apt-get").arg("update"))?)?;
                let cmd = Cmd::new("apt-get")
                    .args(["install", "-y"])
                    .args(packages.iter().copied())
                    .env("DEBIAN_FRONTEND", "noninteractive");
                runner.status(&gate.elevate(runner, cmd)?)?;
            }
            Self::Dnf => {
                let cmd = Cmd::new("dnf")
                    .args(["install", "-y"])
                    .args(packages.iter().copied());
                runner.status(&gate.elevate(runner, cmd)?)?;
            }
            Self::Brew => {
                let cmd = Cmd::new(brew_program(runner))
                    .arg("install")
                    .args(packages.iter().copied());
                runner.status(&cmd)?;
            }
            Self::Unsupported => {
                return Err(BackendError::Unsupported {
                    packages: packages.join(" "),
                })
            }
        }

        Ok(())
    }

    /// Install local package file, e.g., a downloaded `.deb` or `.rpm`.
    ///
    /// # Errors
    ///
    /// - Return [`BackendError::Unsupported`] if backend cannot install files.
    /// - Return [`BackendError::Privilege`] if elevation fails.
    /// - Return [`BackendError::Exec`] if package manager fails.
    pub fn install_file(
        &self,
        runner: &dyn Runner,
        gate: &PrivilegeGate,
        file: &Path,
    ) -> Result<()> {
        let cmd = match self {
            Self::Apt => Cmd::new("apt-get")
                .args(["install", "-y"])
                .arg(file)
                .env("DEBIAN_FRONTEND", "noninteractive"),
            Self::Dnf => Cmd::new("dnf").args(["install", "-y"]).arg(file),
            Self::Brew | Self::Unsupported => {
                return Err(BackendError::Unsupported {
                    packages: file.display().to_string(),
                })
            }
        };
        runner.status(&gate.elevate(runner, cmd)?)?;

        Ok(())
    }

    /// Package file suffix this backend can install directly.
    pub fn package_suffix(&self) -> Option<&'static str> {
        match self {
            Self::Apt => Some(".deb"),
            Self::Dnf => Some(".rpm"),
            Self::Brew | Self::Unsupported => None,
        }
    }
}

impl Display for PackageBackend {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Apt => fmt.write_str("apt"),
            Self::Dnf => fmt.write_str("dnf"),
            Self::Brew => fmt.write_str("brew"),
            Self::Unsupported => fmt.write_str("unsupported"),
        }
    }
}

fn brew_program(runner: &dyn Runner) -> std::ffi::OsString {
    runner
        .locate("brew")
        .map(std::path::PathBuf::into_os_string)
        .unwrap_or_else(|| "brew".into())
}

/// Package backend error types.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// No supported package manager available.
    #[error("no supported package manager found to install {packages} (need apt-get or dnf)")]
    Unsupported { packages: String },

    /// Elevation failed.
    #[error(transparent)]
    Privilege(#[from] PrivilegeError),

    /// Package manager failed.
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Friendly result alias :3
pub type Result<T, E = BackendError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeRunner;
    use pretty_assertions::assert_eq;

    #[test]
    fn detect_prefers_apt() {
        let runner = FakeRunner::new().with_programs(["apt-get", "dnf"]);
        assert_eq!(PackageBackend::detect(Platform::Linux, &runner), PackageBackend::Apt);

        let runner = FakeRunner::new().with_programs(["dnf"]);
        assert_eq!(PackageBackend::detect(Platform::Linux, &runner), PackageBackend::Dnf);

        let runner = FakeRunner::new();
        assert_eq!(
            PackageBackend::detect(Platform::Linux, &runner),
            PackageBackend::Unsupported
        );
        assert_eq!(PackageBackend::detect(Platform::MacOs, &runner), PackageBackend::Brew);
    }

    #[test]
    fn apt_install_is_elevated_and_noninteractive() -> anyhow::Result<()> {
        let runner = FakeRunner::new().with_programs(["sudo", "apt-get"]);
        let gate = PrivilegeGate::new(false);
        PackageBackend::Apt.install(&runner, &gate, &["git", "curl"])?;

        assert_eq!(
            runner.log(),
            vec![
                "sudo -v",
                "sudo apt-get update",
                "sudo env DEBIAN_FRONTEND=noninteractive apt-get install -y git curl",
            ]
        );

        Ok(())
    }

    #[test]
    fn unsupported_backend_cannot_install() {
        let runner = FakeRunner::new();
        let gate = PrivilegeGate::new(true);
        let result = PackageBackend::Unsupported.install(&runner, &gate, &["git"]);

        assert!(matches!(result, Err(BackendError::Unsupported { .. })));
        assert!(!PackageBackend::Unsupported.query(&runner, "git"));
    }

    #[test]
    fn dnf_query_uses_rpm() {
        let runner = FakeRunner::new().with_programs(["rpm"]);
        assert!(PackageBackend::Dnf.query(&runner, "zsh"));
        assert_eq!(runner.log(), vec!["rpm -q zsh"]);
    }
}
