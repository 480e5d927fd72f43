// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Nix experimental feature enabling.
//!
//! Flakes and the `nix` command are still experimental features, so they
//! must be switched on in nix.conf before anything can be built.
//!
//! # nix.conf Semantics
//!
//! nix.conf consists of `name = value` pairs, one per line, with `#`
//! starting a comment. A later `experimental-features` line replaces the
//! feature set, while an `extra-experimental-features` line extends it.
//! [`NixConfEdit`] replays the file in order to compute the effective
//! feature set, and only ever _appends_ lines to fix it up. Existing lines
//! are never rewritten in place, so user formatting and comments survive.

use crate::{
    config::ConfScope,
    exec::{Cmd, ExecError},
    path::{system_nix_conf, user_nix_conf},
    pipeline::{Idempotence, Session, Step},
    privilege::PrivilegeError,
};

use std::{
    collections::BTreeSet,
    fmt::{Display, Formatter, Result as FmtResult},
    fs::{create_dir_all, read_to_string, write},
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

const FEATURES_KEY: &str = "experimental-features";
const EXTRA_FEATURES_KEY: &str = "extra-experimental-features";

/// nix.conf feature editor.
///
/// # Invariant
///
/// - Existing lines are never modified or removed.
/// - At most one line is appended per call to [`NixConfEdit::require_features`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NixConfEdit {
    content: String,
    changed: bool,
}

impl NixConfEdit {
    /// Construct new editor over empty nix.conf.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute effective experimental feature set.
    ///
    /// Returns [`None`] if no feature line exists at all.
    pub fn effective_features(&self) -> Option<BTreeSet<String>> {
        let mut features: Option<BTreeSet<String>> = None;
        for line in self.content.lines() {
            let Some((key, value)) = parse_setting(line) else {
                continue;
            };

            let values = value.split_whitespace().map(str::to_owned);
            match key {
                FEATURES_KEY => features = Some(values.collect()),
                EXTRA_FEATURES_KEY => features.get_or_insert_with(BTreeSet::new).extend(values),
                _ => continue,
            }
        }

        features
    }

    /// Require listing of experimental features to be enabled.
    ///
    /// Appends `experimental-features = ...` if no feature line exists, or
    /// `extra-experimental-features = <missing>` if some are missing.
    pub fn require_features(&mut self, required: &[impl AsRef<str>]) {
        let effective = self.effective_features();
        let missing: Vec<&str> = required
            .iter()
            .map(AsRef::as_ref)
            .filter(|feature| {
                effective
                    .as_ref()
                    .is_none_or(|features| !features.contains(*feature))
            })
            .collect();
        if missing.is_empty() {
            return;
        }

        let line = match effective {
            None => format!("{FEATURES_KEY} = {}", missing.join(" ")),
            Some(_) => format!("{EXTRA_FEATURES_KEY} = {}", missing.join(" ")),
        };
        self.append_line(&line);
    }

    /// Whether the editor changed anything.
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    fn append_line(&mut self, line: &str) {
        if !self.content.is_empty() && !self.content.ends_with('\n') {
            self.content.push('\n');
        }
        self.content.push_str(line);
        self.content.push('\n');
        self.changed = true;
    }
}

impl Display for NixConfEdit {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(&self.content)
    }
}

impl From<String> for NixConfEdit {
    fn from(content: String) -> Self {
        Self {
            content,
            changed: false,
        }
    }
}

impl From<&str> for NixConfEdit {
    fn from(content: &str) -> Self {
        Self::from(content.to_string())
    }
}

fn parse_setting(line: &str) -> Option<(&str, &str)> {
    let line = match line.split_once('#') {
        Some((setting, _comment)) => setting,
        None => line,
    };
    let (key, value) = line.split_once('=')?;

    Some((key.trim(), value.trim()))
}

/// Step enabling experimental features in nix.conf.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnableFeatures;

impl Step for EnableFeatures {
    fn name(&self) -> &'static str {
        "nix-features"
    }

    fn idempotence(&self) -> Idempotence {
        Idempotence::SafeToRepeat
    }

    fn run(&self, session: &mut Session<'_>) -> crate::error::Result<()> {
        let features = &session.settings.nix.features;
        match session.settings.nix.conf_scope {
            ConfScope::User => {
                let path = user_nix_conf(&session.context.home);
                let changed = enable_in_file(&path, features)?;
                if changed && session.context.acts_for_other_user() {
                    if let Some(account) = &session.context.account {
                        let dirs = path.ancestors().skip(1).take(2);
                        for entry in std::iter::once(path.as_path()).chain(dirs) {
                            account.take_ownership(entry).map_err(|source| NixConfError::Io {
                                source,
                                path: entry.to_path_buf(),
                            })?;
                        }
                    }
                }
            }
            ConfScope::System => enable_in_system_file(session, &system_nix_conf(), features)?,
        }

        Ok(())
    }
}

/// Enable features in nix.conf owned by current process.
///
/// Creates file and parent directories if missing. File is only written if
/// something changed. Returns whether file was written.
///
/// # Errors
///
/// - Return [`NixConfError::Io`] if file cannot be read or written.
#[instrument(skip(path, features), level = "debug")]
pub fn enable_in_file(path: impl AsRef<Path>, features: &[String]) -> Result<bool> {
    let path = path.as_ref();
    let io_error = |source| NixConfError::Io {
        source,
        path: path.to_path_buf(),
    };

    let content = if path.exists() {
        read_to_string(path).map_err(io_error)?
    } else {
        String::new()
    };

    let mut editor = NixConfEdit::from(content);
    editor.require_features(features);
    if !editor.is_changed() {
        debug!("{:?} already enables {}", path.display(), features.join(" "));
        return Ok(false);
    }

    info!("enable {} in {:?}", features.join(" "), path.display());
    if let Some(parent) = path.parent() {
        create_dir_all(parent).map_err(io_error)?;
    }
    write(path, editor.to_string()).map_err(io_error)?;

    Ok(true)
}

fn enable_in_system_file(session: &Session<'_>, path: &Path, features: &[String]) -> Result<()> {
    let content = if path.exists() {
        read_to_string(path).map_err(|source| NixConfError::Io {
            source,
            path: path.to_path_buf(),
        })?
    } else {
        String::new()
    };

    let mut editor = NixConfEdit::from(content);
    editor.require_features(features);
    if !editor.is_changed() {
        debug!("{:?} already enables {}", path.display(), features.join(" "));
        return Ok(());
    }

    info!("enable {} in {:?}", features.join(" "), path.display());
    let runner = session.runner;
    if let Some(parent) = path.parent() {
        let mkdir = session
            .gate
            .elevate(runner, Cmd::new("mkdir").arg("-p").arg(parent))?;
        runner.status(&mkdir)?;
    }
    let tee = session
        .gate
        .elevate(runner, Cmd::new("tee").arg(path).stdin(editor.to_string()))?;
    runner.status(&tee)?;

    Ok(())
}

/// Nix configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum NixConfError {
    /// nix.conf cannot be read or written.
    #[error("failed to update nix configuration at {:?}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Elevation failed.
    #[error(transparent)]
    Privilege(#[from] PrivilegeError),

    /// Elevated write failed.
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Friendly result alias :3
pub type Result<T, E = NixConfError> = std::result::Result<T, E>;
