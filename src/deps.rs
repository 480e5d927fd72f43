// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Dependency ensurer.
//!
//! Makes sure every external tool the rest of the pipeline relies on is
//! present: git, curl (Linux), Nix, and Homebrew (macOS). Presence is
//! probed on every run by exit code, never cached.
//!
//! # macOS and git
//!
//! git on macOS ships with the Xcode command line tools, whose install is
//! controlled by Apple's own GUI prompt. nixboot triggers that prompt but
//! cannot drive it to completion, so the run aborts with instructions to
//! re-run afterwards.

use crate::{
    backend::BackendError,
    context::Platform,
    exec::{Cmd, ExecError, Runner},
    pipeline::{Idempotence, Session, Step},
    privilege::PrivilegeError,
};

use std::path::PathBuf;
use tracing::{debug, info, instrument, warn};

/// Upstream multi-user Nix installer.
pub const NIX_INSTALLER: &str =
    "curl --proto '=https' --tlsv1.2 -sSfL https://nixos.org/nix/install | sh -s -- --daemon";

/// Upstream Homebrew installer.
pub const BREW_INSTALLER: &str =
    "curl -fsSL https://raw.githubusercontent.com/Homebrew/install/HEAD/install.sh | /bin/bash";

/// Tools installed through the native package manager on Linux.
const LINUX_PACKAGES: [&str; 2] = ["git", "curl"];

/// Step ensuring required tools are installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnsureDependencies;

impl Step for EnsureDependencies {
    fn name(&self) -> &'static str {
        "dependencies"
    }

    fn idempotence(&self) -> Idempotence {
        Idempotence::RequiresPreconditionCheck
    }

    fn run(&self, session: &mut Session<'_>) -> crate::error::Result<()> {
        match session.context.platform {
            Platform::Linux => ensure_linux_packages(session)?,
            Platform::MacOs => ensure_xcode_git(session.runner)?,
        }

        session.tools.nix = Some(ensure_nix(session)?);
        if session.context.platform == Platform::MacOs {
            session.tools.brew = Some(ensure_brew(session)?);
        }

        Ok(())
    }
}

/// Probe program presence by running `<program> --version`.
pub fn probe(runner: &dyn Runner, program: &str) -> bool {
    let present = runner.succeeds(&Cmd::new(program).arg("--version"));
    debug!("probe {program}: present = {present}");

    present
}

#[instrument(skip(session), level = "debug")]
fn ensure_linux_packages(session: &Session<'_>) -> Result<()> {
    let missing: Vec<&str> = LINUX_PACKAGES
        .iter()
        .copied()
        .filter(|program| !probe(session.runner, program))
        .collect();
    if missing.is_empty() {
        debug!("all native packages present");
        return Ok(());
    }

    session
        .backend
        .install(session.runner, session.gate, &missing)?;

    Ok(())
}

fn ensure_xcode_git(runner: &dyn Runner) -> Result<()> {
    if probe(runner, "git") {
        return Ok(());
    }

    warn!("git is missing, requesting Xcode command line tools");
    if let Err(err) = runner.status(&Cmd::new("xcode-select").arg("--install")) {
        warn!("xcode-select failed: {err}");
    }

    Err(DependencyError::Prerequisite {
        tool: "git".into(),
        remedy: "finish installing the Xcode command line tools, then re-run nixboot".into(),
    })
}

#[instrument(skip(session), level = "debug")]
fn ensure_nix(session: &Session<'_>) -> Result<PathBuf> {
    if let Some(nix) = session.runner.locate("nix") {
        debug!("nix found at {:?}", nix.display());
        return Ok(nix);
    }

    info!("install nix through upstream installer");
    // INVARIANT: Cache sudo credentials before the installer asks for them.
    session.gate.ensure_elevated(session.runner)?;
    let script = match session.context.platform {
        Platform::Linux => format!("{NIX_INSTALLER} --yes"),
        Platform::MacOs => NIX_INSTALLER.to_string(),
    };
    session
        .runner
        .status(&Cmd::new("sh").args(["-c", script.as_str()]))?;

    session.runner.locate("nix").ok_or(DependencyError::Unavailable {
        tool: "nix".into(),
    })
}

#[instrument(skip(session), level = "debug")]
fn ensure_brew(session: &Session<'_>) -> Result<PathBuf> {
    if let Some(brew) = session.runner.locate("brew") {
        return Ok(brew);
    }

    info!("install homebrew through upstream installer");
    session.gate.ensure_elevated(session.runner)?;
    session.runner.status(
        &Cmd::new("sh")
            .args(["-c", BREW_INSTALLER])
            .env("NONINTERACTIVE", "1"),
    )?;

    session.runner.locate("brew").ok_or(DependencyError::Unavailable {
        tool: "brew".into(),
    })
}

/// Dependency ensurer error types.
#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    /// Dependency must be installed by the operator.
    #[error("{tool} is required: {remedy}")]
    Prerequisite { tool: String, remedy: String },

    /// Installer ran but tool still cannot be found.
    #[error("{tool} still not found after install")]
    Unavailable { tool: String },

    /// Native package manager failed.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Elevation failed.
    #[error(transparent)]
    Privilege(#[from] PrivilegeError),

    /// Installer failed.
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Friendly result alias :3
type Result<T, E = DependencyError> = std::result::Result<T, E>;
