// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Error taxonomy.
//!
//! Each module reports failures through its own error type. This module
//! gathers them into one [`Error`] and classifies every failure into an
//! [`ErrorKind`], which decides the process exit code and the `error`
//! field of machine-readable output.

use crate::{
    activate::ActivationError,
    backend::BackendError,
    block::PatchError,
    component::ComponentError,
    config::ConfigError,
    context::ContextError,
    deps::DependencyError,
    lock::LockError,
    login_shell::LoginShellError,
    nixconf::NixConfError,
    privilege::PrivilegeError,
    repo::SyncError,
};

use serde::Serialize;
use std::fmt::{Display, Formatter, Result as FmtResult};

/// Classification of failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Required argument missing or malformed.
    Usage,

    /// Target account cannot be resolved.
    Resolution,

    /// Dependency that cannot be installed automatically is missing.
    Prerequisite,

    /// Required tool such as sudo is missing.
    MissingDependency,

    /// No installation strategy exists for this OS.
    UnsupportedPlatform,

    /// Checkout has local modifications a pull would clobber.
    DirtyRepository,

    /// Checkout cannot be fast-forwarded.
    DivergedHistory,

    /// Declarative build or switch failed.
    Activation,

    /// Non-essential companion application failed.
    OptionalComponent,

    /// Another run holds the advisory lock.
    LockHeld,

    /// Anything else.
    Other,
}

impl ErrorKind {
    /// Process exit code of this kind of failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Other | Self::OptionalComponent => 1,
            Self::Usage => 2,
            Self::Resolution => 3,
            Self::Prerequisite => 4,
            Self::MissingDependency => 5,
            Self::UnsupportedPlatform => 6,
            Self::DirtyRepository => 7,
            Self::Activation => 8,
            Self::LockHeld => 9,
            Self::DivergedHistory => 10,
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            Self::Usage => "usage",
            Self::Resolution => "resolution",
            Self::Prerequisite => "prerequisite",
            Self::MissingDependency => "missing-dependency",
            Self::UnsupportedPlatform => "unsupported-platform",
            Self::DirtyRepository => "dirty-repository",
            Self::DivergedHistory => "diverged-history",
            Self::Activation => "activation",
            Self::OptionalComponent => "optional-component",
            Self::LockHeld => "lock-held",
            Self::Other => "other",
        };
        fmt.write_str(name)
    }
}

/// All possible error types of a run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Privilege(#[from] PrivilegeError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error(transparent)]
    NixConf(#[from] NixConfError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Component(#[from] ComponentError),

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error(transparent)]
    Activation(#[from] ActivationError),

    #[error(transparent)]
    LoginShell(#[from] LoginShellError),
}

impl Error {
    /// Classify error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Usage,
            Self::Context(ContextError::Usage(_)) => ErrorKind::Usage,
            Self::Context(ContextError::Resolution { .. }) => ErrorKind::Resolution,
            Self::Context(ContextError::UnsupportedPlatform { .. }) => {
                ErrorKind::UnsupportedPlatform
            }
            Self::Context(_) => ErrorKind::Other,
            Self::Lock(LockError::Held { .. }) => ErrorKind::LockHeld,
            Self::Lock(_) => ErrorKind::Other,
            Self::Privilege(err) => privilege_kind(err),
            Self::Backend(err) => backend_kind(err),
            Self::Dependency(DependencyError::Prerequisite { .. }) => ErrorKind::Prerequisite,
            Self::Dependency(DependencyError::Backend(err)) => backend_kind(err),
            Self::Dependency(DependencyError::Privilege(err)) => privilege_kind(err),
            Self::Dependency(_) => ErrorKind::Other,
            Self::NixConf(NixConfError::Privilege(err)) => privilege_kind(err),
            Self::NixConf(_) => ErrorKind::Other,
            Self::Sync(SyncError::Dirty { .. } | SyncError::WouldClobber { .. }) => {
                ErrorKind::DirtyRepository
            }
            Self::Sync(SyncError::Diverged { .. }) => ErrorKind::DivergedHistory,
            Self::Sync(_) => ErrorKind::Other,
            Self::Component(_) => ErrorKind::OptionalComponent,
            Self::Patch(_) => ErrorKind::Other,
            Self::Activation(ActivationError::Privilege(err)) => privilege_kind(err),
            Self::Activation(_) => ErrorKind::Activation,
            Self::LoginShell(LoginShellError::Backend(err)) => backend_kind(err),
            Self::LoginShell(LoginShellError::Privilege(err)) => privilege_kind(err),
            Self::LoginShell(_) => ErrorKind::Other,
        }
    }

    /// Process exit code of this error.
    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }

    /// Full message including every source in the chain.
    pub fn chain_message(&self) -> String {
        let mut message = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            let text = err.to_string();
            if !message.contains(text.as_str()) {
                message.push_str(": ");
                message.push_str(text.as_str());
            }
            source = err.source();
        }

        message
    }

    /// Single `ERROR: <message>` line for standard error.
    pub fn failure_line(&self) -> String {
        failure_line(self.chain_message())
    }

    /// Machine-readable report of this error.
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            error: self.kind(),
            message: self.chain_message(),
            exit_code: self.exit_code(),
        }
    }
}

/// Collapse multi-line message into one `ERROR: <message>` line.
pub fn failure_line(message: impl AsRef<str>) -> String {
    let message = message
        .as_ref()
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    format!("ERROR: {message}")
}

fn privilege_kind(err: &PrivilegeError) -> ErrorKind {
    match err {
        PrivilegeError::MissingSudo => ErrorKind::MissingDependency,
        PrivilegeError::Denied(_) => ErrorKind::Other,
    }
}

fn backend_kind(err: &BackendError) -> ErrorKind {
    match err {
        BackendError::Unsupported { .. } => ErrorKind::UnsupportedPlatform,
        BackendError::Privilege(err) => privilege_kind(err),
        BackendError::Exec(_) => ErrorKind::Other,
    }
}

/// Serializable error report for `--json` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub error: ErrorKind,
    pub message: String,
    pub exit_code: i32,
}

/// Friendly result alias :3
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    #[test]
    fn dirty_repository_report() -> anyhow::Result<()> {
        let error = Error::from(SyncError::Dirty {
            path: PathBuf::from("/home/alice/workstation"),
            changed: vec![PathBuf::from("flake.nix")],
        });
        let report = serde_json::to_value(error.report())?;

        assert_eq!(report["error"], "dirty-repository");
        assert_eq!(report["exit_code"], 7);
        assert!(report["message"]
            .as_str()
            .is_some_and(|message| message.contains("flake.nix")));

        Ok(())
    }

    #[test]
    fn failure_is_reported_on_one_prefixed_line() {
        let error = Error::from(SyncError::Dirty {
            path: PathBuf::from("/home/alice/workstation"),
            changed: vec![PathBuf::from("flake.nix"), PathBuf::from("home.nix")],
        });
        let line = error.failure_line();

        assert!(line.starts_with("ERROR: checkout at"));
        assert!(!line.contains('\n'));
        assert!(line.ends_with("(or pass --no-pull): flake.nix home.nix"));
    }

    #[test]
    fn untracked_collision_is_dirty_repository() {
        let error = Error::from(SyncError::WouldClobber {
            path: PathBuf::from("/home/alice/workstation"),
            conflicts: vec![PathBuf::from("home.nix")],
        });
        assert_eq!(error.kind(), ErrorKind::DirtyRepository);
        assert_eq!(error.exit_code(), 7);
    }

    #[test]
    fn missing_sudo_is_missing_dependency() {
        let error = Error::from(BackendError::Privilege(PrivilegeError::MissingSudo));
        assert_eq!(error.kind(), ErrorKind::MissingDependency);
        assert_eq!(error.exit_code(), 5);
    }

    #[test]
    fn unsupported_backend_is_unsupported_platform() {
        let error = Error::from(DependencyError::Backend(BackendError::Unsupported {
            packages: "git".into(),
        }));
        assert_eq!(error.kind(), ErrorKind::UnsupportedPlatform);
        assert_eq!(error.kind().to_string(), "unsupported-platform");
    }

    #[test]
    fn usage_and_resolution_codes() {
        let usage = Error::from(ContextError::Usage("--user must not be empty".into()));
        let resolution = Error::from(ContextError::Resolution {
            user: "mallory".into(),
        });

        assert_eq!(usage.exit_code(), 2);
        assert_eq!(resolution.exit_code(), 3);
    }
}
