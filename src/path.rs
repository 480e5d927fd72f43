// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine relevent path information for external files that need to be
//! interacted with, or managed in some way. None of these functions check
//! whether the paths they return actually exist.

use std::{env::var_os, path::{Path, PathBuf}};

/// Well-known location of the `nix` binary after a multi-user install.
///
/// Freshly installed Nix is not on `PATH` until a new login shell sources
/// the daemon profile, so nixboot falls back to this path.
pub const NIX_PROFILE_BIN: &str = "/nix/var/nix/profiles/default/bin/nix";

/// Known Homebrew binary locations, Apple Silicon prefix first.
pub const BREW_LOCATIONS: [&str; 2] = ["/opt/homebrew/bin/brew", "/usr/local/bin/brew"];

/// Nix daemon profile script sourced by shell integration blocks.
pub const NIX_DAEMON_PROFILE: &str = "/nix/var/nix/profiles/default/etc/profile.d/nix-daemon.sh";

/// Determine absolute path to current user's home directory.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or(NoWayHome)
}

/// Determine default path of the configuration checkout for a home directory.
///
/// Uses `<home>/.config/nixboot/workstation`. The target user's home is
/// used rather than `$XDG_CONFIG_HOME`, since nixboot may run as root on
/// behalf of another account.
pub fn default_install_dir(home: impl AsRef<Path>) -> PathBuf {
    home.as_ref()
        .join(".config")
        .join("nixboot")
        .join("workstation")
}

/// Determine default path of nixboot's own configuration file.
///
/// Uses XDG Base Directory path `$XDG_CONFIG_HOME/nixboot/config.toml`.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_config_file() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|path| path.join("nixboot").join("config.toml"))
        .ok_or(NoWayHome)
}

/// Determine user-level nix.conf for a home directory.
pub fn user_nix_conf(home: impl AsRef<Path>) -> PathBuf {
    home.as_ref().join(".config").join("nix").join("nix.conf")
}

/// Determine system-level nix.conf.
///
/// Follows nix.conf(5): `$NIX_CONF_DIR/nix.conf` when set, otherwise
/// `/etc/nix/nix.conf`.
pub fn system_nix_conf() -> PathBuf {
    match var_os("NIX_CONF_DIR") {
        Some(dir) => PathBuf::from(dir).join("nix.conf"),
        None => PathBuf::from("/etc/nix/nix.conf"),
    }
}

/// Determine download cache directory for a home directory.
pub fn cache_dir(home: impl AsRef<Path>) -> PathBuf {
    home.as_ref().join(".cache").join("nixboot")
}

/// Determine advisory lock file for runs on behalf of the owner of a home
/// directory.
pub fn lock_file(home: impl AsRef<Path>) -> PathBuf {
    cache_dir(home).join("run.lock")
}

/// No way to determine user's home directory.
///
/// # See Also
///
/// - [`dirs::home_dir`](https://docs.rs/dirs/latest/dirs/fn.home_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's home directory")]
pub struct NoWayHome;

/// Friendly result alias :3
pub type Result<T, E = NoWayHome> = std::result::Result<T, E>;
