// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Privilege elevation.
//!
//! Several steps need root: package installs, system file edits, and
//! nix-darwin activation. Rather than letting each of them prompt on its
//! own, one [`PrivilegeGate`] is shared by the whole run. The first step
//! that needs root validates sudo credentials, and sudo's own timestamp
//! cache keeps them valid for the rest of the run.

use crate::exec::{Cmd, ExecError, Runner};

use std::cell::Cell;
use tracing::{debug, info, instrument};

/// Shared capability to run commands as root.
#[derive(Debug)]
pub struct PrivilegeGate {
    is_root: bool,
    validated: Cell<bool>,
}

impl PrivilegeGate {
    /// Construct new privilege gate.
    ///
    /// A gate for a process already running as root never prompts.
    pub fn new(is_root: bool) -> Self {
        Self {
            is_root,
            validated: Cell::new(false),
        }
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    /// Ensure root privileges are available.
    ///
    /// Prompts for credentials through `sudo -v` on first call only.
    ///
    /// # Errors
    ///
    /// - Return [`PrivilegeError::MissingSudo`] if sudo is not installed.
    /// - Return [`PrivilegeError::Denied`] if credential validation fails.
    #[instrument(skip(self, runner), level = "debug")]
    pub fn ensure_elevated(&self, runner: &dyn Runner) -> Result<()> {
        if self.is_root || self.validated.get() {
            debug!("privileges already established");
            return Ok(());
        }

        if runner.locate("sudo").is_none() {
            return Err(PrivilegeError::MissingSudo);
        }

        info!("requesting administrator privileges");
        runner
            .status(&Cmd::new("sudo").arg("-v"))
            .map_err(PrivilegeError::Denied)?;
        self.validated.set(true);

        Ok(())
    }

    /// Turn command into its elevated form.
    ///
    /// Ensures privileges first. Environment variables of the command are
    /// forwarded explicitly, since sudo resets the environment.
    ///
    /// # Errors
    ///
    /// - Return [`PrivilegeError`] if privileges cannot be established.
    pub fn elevate(&self, runner: &dyn Runner, cmd: Cmd) -> Result<Cmd> {
        self.ensure_elevated(runner)?;
        if self.is_root {
            return Ok(cmd);
        }

        Ok(cmd.wrapped(["sudo"]))
    }

    /// Turn command into one that runs as another user.
    ///
    /// Only meaningful when running as root on behalf of a regular account;
    /// otherwise the command is returned as is.
    pub fn as_user(&self, cmd: Cmd, username: &str) -> Cmd {
        if !self.is_root {
            return cmd;
        }

        cmd.wrapped(["sudo", "-u", username, "-H"])
    }
}

/// Privilege elevation error types.
#[derive(Debug, thiserror::Error)]
pub enum PrivilegeError {
    /// No elevation mechanism installed.
    #[error("sudo is required but was not found on PATH")]
    MissingSudo,

    /// Credential validation failed.
    #[error("failed to obtain administrator privileges")]
    Denied(#[source] ExecError),
}

/// Friendly result alias :3
pub type Result<T, E = PrivilegeError> = std::result::Result<T, E>;
