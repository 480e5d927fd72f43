// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Optional companion application installer.
//!
//! Rancher Desktop provides the container runtime most workstation setups
//! expect, but nothing else depends on it. Hence, this whole step is best
//! effort: any failure becomes a warning and the run carries on.
//!
//! # Installation Channels
//!
//! | platform | arch     | installed | action                                  |
//! |----------|----------|-----------|-----------------------------------------|
//! | any      | any      | yes       | nothing                                 |
//! | macOS    | any      | no        | left to nix-darwin's Homebrew casks     |
//! | Linux    | x86_64   | no        | vendor package repository               |
//! | Linux    | other    | no        | latest release asset, else fallback     |
//!
//! The vendor repository only carries x86_64 packages, so any other
//! architecture never touches it.

pub mod release;

use crate::{
    backend::{BackendError, PackageBackend},
    context::{Account, Arch, Platform},
    exec::{Cmd, ExecError},
    path::cache_dir,
    pipeline::{FailurePolicy, Idempotence, Session, Step},
    privilege::PrivilegeError,
};
use release::{Asset, ReleaseError};

use std::{
    fs::{create_dir_all, set_permissions, write, Permissions},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

/// Signing key of the vendor's Debian repository.
pub const APT_KEY_URL: &str =
    "https://download.opensuse.org/repositories/isv:/Rancher:/stable/deb/Release.key";

/// Where the dearmored vendor signing key is stored.
pub const APT_KEYRING: &str = "/usr/share/keyrings/isv-rancher-stable-archive-keyring.gpg";

/// Where the vendor's apt source entry is stored.
pub const APT_SOURCE_LIST: &str = "/etc/apt/sources.list.d/isv-rancher-stable.list";

const APT_REPOSITORY: &str = "https://download.opensuse.org/repositories/isv:/Rancher:/stable/deb/";

/// Repository definition of the vendor's RPM repository.
pub const RPM_REPOSITORY: &str =
    "https://download.opensuse.org/repositories/isv:/Rancher:/stable/rpm/isv:Rancher:stable.repo";

/// Installation channel chosen for the component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentPlan {
    /// Component is already installed.
    Skip,

    /// Declarative macOS configuration installs it as a Homebrew cask.
    DelegateToCask,

    /// Vendor package repository plus native package manager.
    VendorRepository,

    /// Release asset matching the architecture, or the fallback package.
    ReleaseAsset,
}

/// Decide how to install component.
pub fn plan(platform: Platform, arch: &Arch, installed: bool) -> ComponentPlan {
    match (installed, platform, arch) {
        (true, _, _) => ComponentPlan::Skip,
        (false, Platform::MacOs, _) => ComponentPlan::DelegateToCask,
        (false, Platform::Linux, Arch::X86_64) => ComponentPlan::VendorRepository,
        (false, Platform::Linux, _) => ComponentPlan::ReleaseAsset,
    }
}

/// Select release asset for architecture and package backend.
///
/// Asset names are matched case-insensitively. Native package formats of
/// the backend are preferred over AppImages.
pub fn select_asset<'a>(
    assets: &'a [Asset],
    arch: &Arch,
    backend: PackageBackend,
) -> Option<&'a Asset> {
    let tokens = arch.tokens();
    let suffixes = backend
        .package_suffix()
        .into_iter()
        .chain(std::iter::once(".appimage"));

    for suffix in suffixes {
        let found = assets.iter().find(|asset| {
            let name = asset.name.to_lowercase();
            name.ends_with(suffix) && tokens.iter().any(|token| name.contains(token.as_str()))
        });
        if found.is_some() {
            return found;
        }
    }

    None
}

/// Step installing optional companion application.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstallComponent;

impl Step for InstallComponent {
    fn name(&self) -> &'static str {
        "component"
    }

    fn idempotence(&self) -> Idempotence {
        Idempotence::RequiresPreconditionCheck
    }

    fn policy(&self) -> FailurePolicy {
        FailurePolicy::WarnAndContinue
    }

    fn applies(&self, session: &Session<'_>) -> bool {
        session.context.component
    }

    fn run(&self, session: &mut Session<'_>) -> crate::error::Result<()> {
        let name = session.settings.component.name.as_str();
        let installed = is_installed(session);
        match plan(session.context.platform, &session.context.arch, installed) {
            ComponentPlan::Skip => info!("{name} is already installed"),
            ComponentPlan::DelegateToCask => {
                let brew = session
                    .tools
                    .brew
                    .clone()
                    .or_else(|| session.runner.locate("brew"));
                if brew.is_none() {
                    return Err(ComponentError::BrokerMissing.into());
                }
                info!("{name} is installed by nix-darwin as a Homebrew cask");
            }
            ComponentPlan::VendorRepository => {
                add_vendor_repository(session)?;
                session
                    .backend
                    .install(session.runner, session.gate, &[name])
                    .map_err(ComponentError::from)?;
            }
            ComponentPlan::ReleaseAsset => install_release_asset(session)?,
        }

        Ok(())
    }
}

fn is_installed(session: &Session<'_>) -> bool {
    let settings = &session.settings.component;
    match session.context.platform {
        Platform::MacOs => settings.macos_app.exists(),
        Platform::Linux => {
            session.runner.locate(&settings.name).is_some()
                || appimage_target(&session.context.home, &settings.name).is_file()
                || session.backend.query(session.runner, &settings.name)
        }
    }
}

// INVARIANT: AppImages live in ~/.local/bin, which need not be on PATH as root.
fn appimage_target(home: &Path, name: &str) -> PathBuf {
    home.join(".local").join("bin").join(name)
}

#[instrument(skip(session), level = "debug")]
fn add_vendor_repository(session: &Session<'_>) -> Result<()> {
    let runner = session.runner;
    let gate = session.gate;
    match session.backend {
        PackageBackend::Apt => {
            info!("add vendor apt repository");
            let key = session.releases.fetch(APT_KEY_URL)?;
            let dearmor = Cmd::new("gpg")
                .args(["--dearmor", "--yes", "-o", APT_KEYRING])
                .stdin(key);
            runner.status(&gate.elevate(runner, dearmor)?)?;

            let entry = format!("deb [signed-by={APT_KEYRING}] {APT_REPOSITORY} ./\n");
            let tee = Cmd::new("tee").arg(APT_SOURCE_LIST).stdin(entry);
            runner.status(&gate.elevate(runner, tee)?)?;
        }
        PackageBackend::Dnf => {
            info!("add vendor rpm repository");
            let add_repo = Cmd::new("dnf").args(["config-manager", "--add-repo", RPM_REPOSITORY]);
            runner.status(&gate.elevate(runner, add_repo)?)?;
        }
        backend => {
            return Err(ComponentError::NoVendorChannel {
                backend: backend.to_string(),
            })
        }
    }

    Ok(())
}

#[instrument(skip(session), level = "debug")]
fn install_release_asset(session: &Session<'_>) -> Result<()> {
    let settings = &session.settings.component;
    let context = session.context;
    let release = session.releases.latest(&settings.release_repo)?;
    debug!("inspect {} assets of {}", release.assets.len(), release.tag_name);

    let Some(asset) = select_asset(&release.assets, &context.arch, session.backend) else {
        return install_fallback(session);
    };

    info!("install {} from release {}", asset.name, release.tag_name);
    let bytes = session.releases.fetch(&asset.browser_download_url)?;
    let cache = cache_dir(&context.home);
    let download = cache.join(&asset.name);
    create_dir_all(&cache).map_err(|source| ComponentError::Io {
        path: cache.clone(),
        source,
    })?;
    write(&download, bytes).map_err(|source| ComponentError::Io {
        path: download.clone(),
        source,
    })?;
    hand_over(session, &[cache.as_path(), download.as_path()])?;

    if asset.name.to_lowercase().ends_with(".appimage") {
        let target = appimage_target(&context.home, &settings.name);
        let bin = target.parent().map(Path::to_path_buf).unwrap_or_default();
        create_dir_all(&bin).map_err(|source| ComponentError::Io {
            path: bin.clone(),
            source,
        })?;
        std::fs::copy(&download, &target).map_err(|source| ComponentError::Io {
            path: target.clone(),
            source,
        })?;
        set_permissions(&target, Permissions::from_mode(0o755)).map_err(|source| {
            ComponentError::Io {
                path: target.clone(),
                source,
            }
        })?;
        hand_over(session, &[bin.as_path(), target.as_path()])?;
        info!("installed {:?}", target.display());
    } else {
        session
            .backend
            .install_file(session.runner, session.gate, &download)?;
    }

    Ok(())
}

fn install_fallback(session: &Session<'_>) -> Result<()> {
    let settings = &session.settings.component;
    let arch = &session.context.arch;
    match &settings.fallback {
        Some(fallback) => {
            warn!("no {} release asset for {arch}, installing {fallback} instead", settings.name);
            session
                .backend
                .install(session.runner, session.gate, &[fallback.as_str()])?;
        }
        None => warn!("no {} release asset for {arch}, skipping", settings.name),
    }

    Ok(())
}

fn hand_over(session: &Session<'_>, paths: &[&Path]) -> Result<()> {
    let context = session.context;
    let Some(account) = context.account.as_ref().filter(|_| context.acts_for_other_user()) else {
        return Ok(());
    };

    for path in paths {
        take_ownership(account, path)?;
    }

    Ok(())
}

fn take_ownership(account: &Account, path: &Path) -> Result<()> {
    account
        .take_ownership(path)
        .map_err(|source| ComponentError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Optional component error types.
#[derive(Debug, thiserror::Error)]
pub enum ComponentError {
    /// Homebrew is needed for cask installs but missing.
    #[error("homebrew is required to install casks but was not found")]
    BrokerMissing,

    /// Backend has no vendor repository channel.
    #[error("no vendor repository available for {backend}")]
    NoVendorChannel { backend: String },

    /// Download or file placement failed.
    #[error("failed to write {:?}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Release lookup failed.
    #[error(transparent)]
    Release(#[from] ReleaseError),

    /// Native package manager failed.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Elevation failed.
    #[error(transparent)]
    Privilege(#[from] PrivilegeError),

    /// External command failed.
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Friendly result alias :3
pub type Result<T, E = ComponentError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ErrorKind,
        exec::fake::FakeRunner,
        pipeline::tests::{context_for, SessionFixture},
    };
    use release::tests::FakeReleases;
    use simple_test_case::test_case;

    fn assets(names: &[&str]) -> Vec<Asset> {
        names
            .iter()
            .map(|name| Asset {
                name: name.to_string(),
                browser_download_url: format!("https://example.invalid/{name}"),
            })
            .collect()
    }

    #[test_case(Platform::Linux, Arch::X86_64, true, ComponentPlan::Skip; "installed_is_skipped")]
    #[test_case(Platform::MacOs, Arch::Aarch64, false, ComponentPlan::DelegateToCask; "macos_delegates")]
    #[test_case(Platform::Linux, Arch::X86_64, false, ComponentPlan::VendorRepository; "linux_primary_arch")]
    #[test_case(Platform::Linux, Arch::Aarch64, false, ComponentPlan::ReleaseAsset; "linux_secondary_arch")]
    #[test_case(Platform::Linux, Arch::Other("riscv64".into()), false, ComponentPlan::ReleaseAsset; "linux_unknown_arch")]
    #[test]
    fn decision_table(platform: Platform, arch: Arch, installed: bool, expect: ComponentPlan) {
        assert_eq!(plan(platform, &arch, installed), expect);
    }

    #[test]
    fn native_package_preferred_over_appimage() {
        let assets = assets(&[
            "Rancher.Desktop-1.22.0.x86_64.AppImage",
            "rancher-desktop_1.22.0_arm64.AppImage",
            "rancher-desktop_1.22.0_arm64.deb",
            "Rancher.Desktop-1.22.0-mac.aarch64.dmg",
        ]);

        let selected = select_asset(&assets, &Arch::Aarch64, PackageBackend::Apt);
        assert_eq!(selected.map(|asset| asset.name.as_str()), Some("rancher-desktop_1.22.0_arm64.deb"));

        let selected = select_asset(&assets, &Arch::Aarch64, PackageBackend::Dnf);
        assert_eq!(
            selected.map(|asset| asset.name.as_str()),
            Some("rancher-desktop_1.22.0_arm64.AppImage")
        );
    }

    #[test]
    fn no_asset_for_unknown_architecture() {
        let assets = assets(&["Rancher.Desktop-1.22.0.x86_64.AppImage"]);
        assert_eq!(
            select_asset(&assets, &Arch::Other("riscv64".into()), PackageBackend::Apt),
            None
        );
    }

    #[test]
    fn x86_64_apt_adds_vendor_repository() -> anyhow::Result<()> {
        let runner = FakeRunner::new().with_programs(["sudo", "gpg", "tee", "apt-get"]);
        let releases = FakeReleases::default().with_file(APT_KEY_URL, b"-----BEGIN PGP-----");
        let fixture =
            SessionFixture::new(context_for(Platform::Linux, "x86_64")).with_releases(releases);
        let mut session = fixture.session(&runner, PackageBackend::Apt);
        InstallComponent.run(&mut session)?;

        assert!(runner.ran(&format!("sudo gpg --dearmor --yes -o {APT_KEYRING}")));
        assert!(runner.ran(&format!("sudo tee {APT_SOURCE_LIST}")));
        assert!(runner.ran(
            "sudo env DEBIAN_FRONTEND=noninteractive apt-get install -y rancher-desktop"
        ));

        Ok(())
    }

    #[test]
    fn aarch64_never_touches_vendor_repository() -> anyhow::Result<()> {
        let runner = FakeRunner::new().with_programs(["sudo", "apt-get"]);
        let releases = FakeReleases::with_assets(&["Rancher.Desktop-1.22.0.x86_64.AppImage"]);
        let fixture =
            SessionFixture::new(context_for(Platform::Linux, "aarch64")).with_releases(releases);
        let mut session = fixture.session(&runner, PackageBackend::Apt);
        InstallComponent.run(&mut session)?;

        assert!(!runner.ran("sudo gpg"));
        assert!(!runner.ran("sudo tee"));
        assert!(!runner
            .log()
            .iter()
            .any(|line| line.contains("apt-get install -y rancher-desktop")));
        assert!(runner.ran("sudo env DEBIAN_FRONTEND=noninteractive apt-get install -y podman"));
        assert_eq!(
            fixture.releases.requests(),
            vec!["latest rancher-sandbox/rancher-desktop"]
        );

        Ok(())
    }

    #[test]
    fn aarch64_appimage_lands_in_local_bin() -> anyhow::Result<()> {
        let runner = FakeRunner::new().with_programs(["dnf"]);
        let releases = FakeReleases::with_assets(&["rancher-desktop-1.22.0-aarch64.AppImage"]);
        let fixture =
            SessionFixture::new(context_for(Platform::Linux, "arm64")).with_releases(releases);
        let mut session = fixture.session(&runner, PackageBackend::Dnf);
        InstallComponent.run(&mut session)?;

        let target = fixture.home().join(".local").join("bin").join("rancher-desktop");
        assert!(target.is_file());
        assert_eq!(std::fs::metadata(&target)?.permissions().mode() & 0o777, 0o755);

        Ok(())
    }

    #[test]
    fn installed_component_is_left_alone() -> anyhow::Result<()> {
        let runner = FakeRunner::new().with_programs(["rancher-desktop"]);
        let fixture = SessionFixture::new(context_for(Platform::Linux, "x86_64"));
        let mut session = fixture.session(&runner, PackageBackend::Apt);
        InstallComponent.run(&mut session)?;

        assert!(runner.log().is_empty());
        assert!(fixture.releases.requests().is_empty());

        Ok(())
    }

    #[test]
    fn appimage_from_earlier_run_counts_as_installed() -> anyhow::Result<()> {
        let runner = FakeRunner::new();
        let releases = FakeReleases::with_assets(&["rancher-desktop-1.22.0-aarch64.AppImage"]);
        let fixture =
            SessionFixture::new(context_for(Platform::Linux, "aarch64")).with_releases(releases);
        let bin = fixture.home().join(".local").join("bin");
        std::fs::create_dir_all(&bin)?;
        std::fs::write(bin.join("rancher-desktop"), "#!/bin/sh\n")?;

        let mut session = fixture.session(&runner, PackageBackend::Dnf);
        InstallComponent.run(&mut session)?;

        assert!(runner.log().is_empty());
        assert!(fixture.releases.requests().is_empty());

        Ok(())
    }

    #[test]
    fn failed_lookup_is_optional_component_warning() {
        let runner = FakeRunner::new().with_programs(["dnf"]);
        let fixture = SessionFixture::new(context_for(Platform::Linux, "aarch64"));
        let mut session = fixture.session(&runner, PackageBackend::Dnf);
        let error = InstallComponent.run(&mut session).unwrap_err();

        assert_eq!(error.kind(), ErrorKind::OptionalComponent);
        assert_eq!(InstallComponent.policy(), FailurePolicy::WarnAndContinue);
    }
}
