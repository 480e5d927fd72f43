// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Login shell assignment (Linux only).
//!
//! macOS login shells are managed by nix-darwin itself, so this only ever
//! runs on Linux, and only when a login shell was asked for.

use crate::{
    backend::BackendError,
    context::Platform,
    exec::{Cmd, ExecError},
    pipeline::{Idempotence, Session, Step},
    privilege::PrivilegeError,
};

use std::{
    fs::read_to_string,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

/// Listing of valid login shells.
pub const ETC_SHELLS: &str = "/etc/shells";

/// Step assigning login shell to target user.
#[derive(Debug, Clone)]
pub struct SetLoginShell {
    shells_file: PathBuf,
}

impl SetLoginShell {
    /// Construct step checking given listing of valid login shells.
    pub fn new(shells_file: impl Into<PathBuf>) -> Self {
        Self {
            shells_file: shells_file.into(),
        }
    }
}

impl Default for SetLoginShell {
    fn default() -> Self {
        Self::new(ETC_SHELLS)
    }
}

impl Step for SetLoginShell {
    fn name(&self) -> &'static str {
        "login-shell"
    }

    fn idempotence(&self) -> Idempotence {
        Idempotence::RequiresPreconditionCheck
    }

    fn applies(&self, session: &Session<'_>) -> bool {
        session.context.platform == Platform::Linux && session.context.login_shell.is_some()
    }

    fn run(&self, session: &mut Session<'_>) -> crate::error::Result<()> {
        let context = session.context;
        let Some(shell) = context.login_shell.as_deref() else {
            return Ok(());
        };
        let account = context
            .account
            .as_ref()
            .ok_or_else(|| LoginShellError::NoAccount {
                user: context.username.clone(),
            })?;

        if account.shell.file_name().is_some_and(|name| name == shell) {
            info!("{} already uses {shell}", context.username);
            return Ok(());
        }

        let runner = session.runner;
        if runner.locate(shell).is_none() {
            session.backend.install(runner, session.gate, &[shell])?;
        }
        let path = runner
            .locate(shell)
            .ok_or_else(|| LoginShellError::NotFound {
                shell: shell.to_string(),
            })?;

        ensure_listed(session, &self.shells_file, &path)?;

        info!("change login shell of {} to {:?}", context.username, path.display());
        let chsh = Cmd::new("chsh")
            .arg("-s")
            .arg(&path)
            .arg(&context.username);
        runner
            .status(&session.gate.elevate(runner, chsh)?)
            .map_err(LoginShellError::from)?;

        Ok(())
    }
}

#[instrument(skip(session, shells_file, shell), level = "debug")]
fn ensure_listed(session: &Session<'_>, shells_file: &Path, shell: &Path) -> Result<()> {
    let listing = if shells_file.exists() {
        read_to_string(shells_file).map_err(|source| LoginShellError::Read {
            path: shells_file.to_path_buf(),
            source,
        })?
    } else {
        String::new()
    };

    let listed = listing
        .lines()
        .map(str::trim)
        .any(|line| Path::new(line) == shell);
    if listed {
        debug!("{:?} already listed in {:?}", shell.display(), shells_file.display());
        return Ok(());
    }

    info!("add {:?} to {:?}", shell.display(), shells_file.display());
    let mut entry = String::new();
    if !listing.is_empty() && !listing.ends_with('\n') {
        entry.push('\n');
    }
    entry.push_str(&format!("{}\n", shell.display()));
    let tee = Cmd::new("tee").arg("-a").arg(shells_file).stdin(entry);
    session
        .runner
        .status(&session.gate.elevate(session.runner, tee)?)?;

    Ok(())
}

/// Login shell error types.
#[derive(Debug, thiserror::Error)]
pub enum LoginShellError {
    /// Shell still cannot be found after installing it.
    #[error("login shell {shell:?} not found after install")]
    NotFound { shell: String },

    /// Target user has no account to change.
    #[error("cannot change login shell of {user:?}, no such account")]
    NoAccount { user: String },

    /// Shell listing cannot be read.
    #[error("failed to read {:?}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Shell package could not be installed.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Elevation failed.
    #[error(transparent)]
    Privilege(#[from] PrivilegeError),

    /// chsh or tee failed.
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Friendly result alias :3
pub type Result<T, E = LoginShellError> = std::result::Result<T, E>;
