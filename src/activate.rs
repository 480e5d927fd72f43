// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Declarative configuration activation.
//!
//! On macOS, the nix-darwin system configuration is built as the invoking
//! user, then its `darwin-rebuild` is run as root to switch to it. On Linux,
//! home-manager switches directly to the `<user>@linux` configuration, and
//! moves pre-existing unmanaged dotfiles aside instead of failing on them.
//!
//! Both evaluate the flake impurely, so the configuration can read the
//! target user's name from the environment. Elevation does not forward the
//! environment, so the variable is passed through explicitly.
//!
//! There is no rollback. The declarative tools keep activation atomic on
//! their own.

use crate::{
    context::Platform,
    exec::{Cmd, ExecError},
    pipeline::{Idempotence, Session, Step},
    privilege::PrivilegeError,
};

use std::fmt::{Display, Formatter, Result as FmtResult};
use tracing::{info, instrument};

/// Stage of activation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Build,
    Switch,
}

impl Display for Stage {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Build => fmt.write_str("build"),
            Self::Switch => fmt.write_str("switch"),
        }
    }
}

/// Step activating declarative configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct Activate;

impl Step for Activate {
    fn name(&self) -> &'static str {
        "activation"
    }

    fn idempotence(&self) -> Idempotence {
        Idempotence::SafeToRepeat
    }

    fn run(&self, session: &mut Session<'_>) -> crate::error::Result<()> {
        match session.context.platform {
            Platform::MacOs => activate_darwin(session)?,
            Platform::Linux => activate_home_manager(session)?,
        }

        Ok(())
    }
}

#[instrument(skip(session), level = "debug")]
fn activate_darwin(session: &Session<'_>) -> Result<()> {
    let context = session.context;
    let settings = &session.settings.activation;
    let dir = context.install_dir.display();
    let target = context.darwin_target.as_str();
    let result = context.install_dir.join("result");

    info!("build darwin configuration {target}");
    let build = Cmd::new(session.tools.nix_program())
        .args(["build", "--impure"])
        .arg(format!("{dir}#darwinConfigurations.{target}.system"))
        .arg("--out-link")
        .arg(&result)
        .env(&settings.user_env, &context.username)
        .current_dir(&context.install_dir);
    let build = session.gate.as_user(build, &context.username);
    session
        .runner
        .status(&build)
        .map_err(|source| ActivationError::Failed {
            stage: Stage::Build,
            source,
        })?;

    info!("switch to darwin configuration {target}");
    let switch = Cmd::new(result.join("sw").join("bin").join("darwin-rebuild"))
        .args(["switch", "--flake"])
        .arg(format!("{dir}#{target}"))
        .arg("--impure")
        .env(&settings.user_env, &context.username)
        .current_dir(&context.install_dir);
    let switch = session.gate.elevate(session.runner, switch)?;
    session
        .runner
        .status(&switch)
        .map_err(|source| ActivationError::Failed {
            stage: Stage::Switch,
            source,
        })?;

    Ok(())
}

#[instrument(skip(session), level = "debug")]
fn activate_home_manager(session: &Session<'_>) -> Result<()> {
    let context = session.context;
    let settings = &session.settings.activation;
    let target = context.home_target();

    info!("switch to home configuration {target}");
    let switch = Cmd::new(session.tools.nix_program())
        .arg("run")
        .arg(&settings.home_manager)
        .args(["--", "switch", "--flake"])
        .arg(format!("{}#{target}", context.install_dir.display()))
        .args(["--impure", "-b"])
        .arg(&settings.backup_extension)
        .env(&settings.user_env, &context.username)
        .current_dir(&context.install_dir);
    let switch = if context.acts_for_other_user() {
        session.gate.as_user(switch, &context.username)
    } else {
        switch
    };
    session
        .runner
        .status(&switch)
        .map_err(|source| ActivationError::Failed {
            stage: Stage::Switch,
            source,
        })?;

    Ok(())
}

/// Activation error types.
#[derive(Debug, thiserror::Error)]
pub enum ActivationError {
    /// Build or switch exited unsuccessfully.
    #[error("activation failed during {stage}")]
    Failed {
        stage: Stage,
        #[source]
        source: ExecError,
    },

    /// Elevation for the switch failed.
    #[error(transparent)]
    Privilege(#[from] PrivilegeError),
}

/// Friendly result alias :3
pub type Result<T, E = ActivationError> = std::result::Result<T, E>;
