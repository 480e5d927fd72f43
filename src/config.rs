// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of nixboot's optional configuration file to simplify
//! the process of serialization and deserialization. Every field has a
//! default, so an absent or empty file yields a working configuration.
//! Command line flags and environment variables take precedence over
//! anything set here; that layering happens in [`crate::context`].

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs::read_to_string,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, instrument};

/// Repository cloned when nothing else is configured.
pub const DEFAULT_REPO_URL: &str = "https://github.com/awkless/workstation.git";

/// Top-level settings layout.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Login shell to assign to target user on Linux.
    pub login_shell: Option<String>,

    /// Configuration repository settings.
    pub repository: RepositorySettings,

    /// Declarative configuration activation settings.
    pub activation: ActivationSettings,

    /// Nix configuration file settings.
    pub nix: NixSettings,

    /// Optional companion application settings.
    pub component: ComponentSettings,

    /// Shell startup file integration.
    pub shell: ShellSettings,
}

impl Settings {
    /// Load settings from target file.
    ///
    /// A missing file is not an error, it simply yields default settings.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if file exists but cannot be read.
    /// - Return [`ConfigError::Deserialize`] if file contents are invalid.
    #[instrument(skip(path), level = "debug")]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("no configuration file at {:?}, using defaults", path.display());
            return Ok(Self::default());
        }

        debug!("load configuration file {:?}", path.display());
        read_to_string(path)
            .map_err(|err| ConfigError::Read {
                source: err,
                path: path.to_path_buf(),
            })?
            .parse()
    }
}

impl FromStr for Settings {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut settings: Settings = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on path fields.
        if let Some(dir) = settings.repository.install_dir.take() {
            settings.repository.install_dir = Some(PathBuf::from(
                shellexpand::full(dir.to_string_lossy().as_ref())
                    .map_err(ConfigError::ShellExpansion)?
                    .into_owned(),
            ));
        }

        Ok(settings)
    }
}

impl Display for Settings {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Configuration repository settings.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RepositorySettings {
    /// Remote URL to clone configuration repository from.
    pub url: Option<String>,

    /// Path to clone configuration repository into.
    pub install_dir: Option<PathBuf>,
}

/// Activation settings for nix-darwin and home-manager.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ActivationSettings {
    /// Name of nix-darwin system configuration to build.
    pub darwin_target: String,

    /// Environment variable carrying resolved username into Nix evaluation.
    pub user_env: String,

    /// Flake reference used to run home-manager.
    pub home_manager: String,

    /// Extension home-manager uses to move unmanaged files aside.
    pub backup_extension: String,
}

impl Default for ActivationSettings {
    fn default() -> Self {
        Self {
            darwin_target: "default".into(),
            user_env: "NIXBOOT_USER".into(),
            home_manager: "home-manager/master".into(),
            backup_extension: "backup".into(),
        }
    }
}

/// Which nix.conf to enable experimental features in.
#[derive(Default, Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfScope {
    /// `~/.config/nix/nix.conf` of the target user.
    #[default]
    User,

    /// System-wide nix.conf, written with elevated privileges.
    System,
}

/// Nix configuration file settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NixSettings {
    /// Which nix.conf to edit.
    pub conf_scope: ConfScope,

    /// Experimental features that must be enabled.
    pub features: Vec<String>,
}

impl Default for NixSettings {
    fn default() -> Self {
        Self {
            conf_scope: ConfScope::User,
            features: vec!["nix-command".into(), "flakes".into()],
        }
    }
}

/// Optional companion application settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ComponentSettings {
    /// Install the companion application at all.
    pub enabled: bool,

    /// Package and binary name of the application.
    pub name: String,

    /// GitHub `owner/repo` publishing release assets.
    pub release_repo: String,

    /// Application bundle path checked on macOS.
    pub macos_app: PathBuf,

    /// Package installed instead when no release asset fits.
    pub fallback: Option<String>,
}

impl Default for ComponentSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            name: "rancher-desktop".into(),
            release_repo: "rancher-sandbox/rancher-desktop".into(),
            macos_app: PathBuf::from("/Applications/Rancher Desktop.app"),
            fallback: Some("podman".into()),
        }
    }
}

/// Shell startup file integration settings.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShellSettings {
    /// Blocks to manage, replacing the platform defaults when set.
    #[serde(rename = "block")]
    pub blocks: Option<Vec<BlockSettings>>,
}

/// One managed block and the startup files that receive it.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct BlockSettings {
    /// Name used in the block's marker lines.
    pub name: String,

    /// Startup files relative to the target user's home directory.
    pub files: Vec<PathBuf>,

    /// Only patch files that already exist.
    #[serde(default)]
    pub existing_only: bool,

    /// Content placed between the markers.
    pub body: String,
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read configuration file {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[sealed_test(env = [("WORKSTATION", "/srv/workstation")])]
    fn deserialize_settings() -> anyhow::Result<()> {
        let result: Settings = r#"
            login_shell = "zsh"

            [repository]
            url = "https://blah.org/config.git"
            install_dir = "$WORKSTATION/config"

            [activation]
            darwin_target = "macbook"

            [nix]
            conf_scope = "system"

            [component]
            enabled = false

            [[shell.block]]
            name = "nix"
            files = [".profile"]
            body = ". /etc/profile.d/nix.sh"
        "#
        .parse()?;

        let expect = Settings {
            login_shell: Some("zsh".into()),
            repository: RepositorySettings {
                url: Some("https://blah.org/config.git".into()),
                install_dir: Some(PathBuf::from("/srv/workstation/config")),
            },
            activation: ActivationSettings {
                darwin_target: "macbook".into(),
                ..Default::default()
            },
            nix: NixSettings {
                conf_scope: ConfScope::System,
                ..Default::default()
            },
            component: ComponentSettings {
                enabled: false,
                ..Default::default()
            },
            shell: ShellSettings {
                blocks: Some(vec![BlockSettings {
                    name: "nix".into(),
                    files: vec![PathBuf::from(".profile")],
                    existing_only: false,
                    body: ". /etc/profile.d/nix.sh".into(),
                }]),
            },
        };

        assert_eq!(result, expect);

        Ok(())
    }

    #[test]
    fn empty_file_yields_defaults() -> anyhow::Result<()> {
        let result: Settings = "".parse()?;
        assert_eq!(result, Settings::default());
        assert_eq!(result.activation.user_env, "NIXBOOT_USER");
        assert_eq!(result.nix.features, vec!["nix-command", "flakes"]);

        Ok(())
    }

    #[test]
    fn serialized_settings_parse_back() -> anyhow::Result<()> {
        let settings = Settings {
            login_shell: Some("fish".into()),
            ..Default::default()
        };
        let result: Settings = settings.to_string().parse()?;
        assert_eq!(result, settings);

        Ok(())
    }

    #[test]
    fn missing_file_yields_defaults() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let result = Settings::load(dir.path().join("config.toml"))?;
        assert_eq!(result, Settings::default());

        Ok(())
    }

    #[test]
    fn invalid_file_is_rejected() {
        let result = "login_shell = [".parse::<Settings>();
        assert!(matches!(result, Err(ConfigError::Deserialize(_))));
    }
}
