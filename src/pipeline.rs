// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Reconciliation pipeline.
//!
//! A run is an ordered list of [`Step`]s. Each step declares how safe it is
//! to repeat, and what happens when it fails. The [`Pipeline`] executor
//! walks the list in order, applying those failure policies uniformly:
//! fatal failures abort the run, while best-effort steps only get logged
//! and recorded in the [`RunReport`].
//!
//! All steps share one [`Session`] that carries the resolved invocation
//! context, the privilege gate, the package backend, and the tool paths
//! earlier steps discovered.

use crate::{
    activate::Activate,
    backend::PackageBackend,
    block::PatchShellFiles,
    component::{release::ReleaseSource, InstallComponent},
    config::Settings,
    context::InvocationContext,
    deps::EnsureDependencies,
    error::Result,
    exec::Runner,
    login_shell::SetLoginShell,
    nixconf::EnableFeatures,
    privilege::PrivilegeGate,
    repo::SyncRepository,
};

use std::{ffi::OsString, path::PathBuf};
use tracing::{debug, info, instrument, warn};

/// Whether a step can be blindly re-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Idempotence {
    /// Step converges on the same state no matter how often it runs.
    SafeToRepeat,

    /// Step must probe current state before acting.
    RequiresPreconditionCheck,
}

/// What happens to the run when a step fails.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Abort the whole run.
    #[default]
    Fatal,

    /// Log a warning, record it, and move on.
    WarnAndContinue,
}

/// Tool paths discovered while running.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Tools {
    pub nix: Option<PathBuf>,
    pub brew: Option<PathBuf>,
}

impl Tools {
    /// Program to invoke for `nix`.
    pub fn nix_program(&self) -> OsString {
        self.nix
            .clone()
            .map(PathBuf::into_os_string)
            .unwrap_or_else(|| "nix".into())
    }
}

/// Shared state of one run.
pub struct Session<'a> {
    pub context: &'a InvocationContext,
    pub settings: &'a Settings,
    pub runner: &'a dyn Runner,
    pub gate: &'a PrivilegeGate,
    pub backend: PackageBackend,
    pub releases: &'a dyn ReleaseSource,
    pub tools: Tools,
    pub show_progress: bool,
}

/// One unit of reconciliation work.
pub trait Step {
    /// Short name used in logs and reports.
    fn name(&self) -> &'static str;

    fn idempotence(&self) -> Idempotence;

    fn policy(&self) -> FailurePolicy {
        FailurePolicy::Fatal
    }

    /// Whether the step takes part in this run at all.
    fn applies(&self, _session: &Session<'_>) -> bool {
        true
    }

    /// Perform step.
    ///
    /// # Errors
    ///
    /// - Return [`crate::error::Error`] for whatever went wrong.
    fn run(&self, session: &mut Session<'_>) -> Result<()>;
}

/// Step establishing administrator privileges up front.
///
/// Prompting once at the start of the run keeps the sudo prompt from
/// appearing halfway through a long package install.
#[derive(Debug, Default, Clone, Copy)]
pub struct EstablishPrivileges;

impl Step for EstablishPrivileges {
    fn name(&self) -> &'static str {
        "privilege"
    }

    fn idempotence(&self) -> Idempotence {
        Idempotence::SafeToRepeat
    }

    fn run(&self, session: &mut Session<'_>) -> Result<()> {
        session.gate.ensure_elevated(session.runner)?;
        Ok(())
    }
}

/// Warning recorded for a best-effort step that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepWarning {
    pub step: &'static str,
    pub message: String,
}

/// Outcome of a successful run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub completed: Vec<&'static str>,
    pub skipped: Vec<&'static str>,
    pub warnings: Vec<StepWarning>,
}

/// Ordered listing of steps.
pub struct Pipeline {
    steps: Vec<Box<dyn Step>>,
}

impl Pipeline {
    /// Construct pipeline from explicit listing of steps.
    pub fn new(steps: Vec<Box<dyn Step>>) -> Self {
        Self { steps }
    }

    /// Construct standard pipeline.
    ///
    /// Install and update runs walk the same steps. They only differ in
    /// how the context was resolved, e.g., whether the optional component
    /// is wanted.
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(EstablishPrivileges),
            Box::new(EnsureDependencies),
            Box::new(EnableFeatures),
            Box::new(SyncRepository),
            Box::new(InstallComponent),
            Box::new(PatchShellFiles),
            Box::new(Activate),
            Box::new(SetLoginShell::default()),
        ])
    }

    /// Names of all steps in execution order.
    pub fn names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|step| step.name()).collect()
    }

    /// Execute every applicable step in order.
    ///
    /// # Errors
    ///
    /// - Return first error of a step with [`FailurePolicy::Fatal`].
    #[instrument(skip_all, fields(user = %session.context.username), level = "debug")]
    pub fn execute(&self, session: &mut Session<'_>) -> Result<RunReport> {
        let mut report = RunReport::default();
        for step in &self.steps {
            let name = step.name();
            if !step.applies(session) {
                debug!("skip step {name}");
                report.skipped.push(name);
                continue;
            }

            info!("{name}");
            debug!("step {name} is {:?}", step.idempotence());
            match (step.run(session), step.policy()) {
                (Ok(()), _) => report.completed.push(name),
                (Err(error), FailurePolicy::Fatal) => return Err(error),
                (Err(error), FailurePolicy::WarnAndContinue) => {
                    let message = error.chain_message();
                    warn!("{name} failed, continuing: {message}");
                    report.warnings.push(StepWarning {
                        step: name,
                        message,
                    });
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        component::release::tests::FakeReleases,
        config::DEFAULT_REPO_URL,
        context::{Account, Arch, Platform, PullMode, RunMode},
        error::{Error, ErrorKind},
        exec::fake::FakeRunner,
        path::{default_install_dir, user_nix_conf},
        repo::{
            tests::{commit_file, init_origin},
            SyncError,
        },
    };
    use pretty_assertions::assert_eq;
    use std::{fs::read_to_string, path::Path};
    use tempfile::TempDir;

    pub(crate) fn context_for(platform: Platform, machine: &str) -> InvocationContext {
        let home = PathBuf::from("/home/alice");
        InvocationContext {
            username: "alice".into(),
            account: Some(Account {
                name: "alice".into(),
                uid: 1000,
                gid: 1000,
                home: home.clone(),
                shell: PathBuf::from("/bin/bash"),
            }),
            install_dir: default_install_dir(&home),
            home,
            platform,
            arch: Arch::from_uname(machine),
            pull: PullMode::Pull,
            darwin_target: "default".into(),
            repo_url: DEFAULT_REPO_URL.into(),
            login_shell: None,
            mode: RunMode::Install,
            component: true,
            is_root: false,
        }
    }

    /// Owns everything a [`Session`] borrows, with home inside a scratch
    /// directory.
    pub(crate) struct SessionFixture {
        pub(crate) context: InvocationContext,
        pub(crate) settings: Settings,
        pub(crate) gate: PrivilegeGate,
        pub(crate) releases: FakeReleases,
        _scratch: TempDir,
    }

    impl SessionFixture {
        pub(crate) fn new(mut context: InvocationContext) -> Self {
            let scratch = tempfile::tempdir().expect("scratch directory");
            let home = scratch.path().join("home");
            std::fs::create_dir_all(&home).expect("scratch home");
            context.install_dir = default_install_dir(&home);
            if let Some(account) = context.account.as_mut() {
                account.home = home.clone();
            }
            context.home = home;

            Self {
                gate: PrivilegeGate::new(context.is_root),
                context,
                settings: Settings::default(),
                releases: FakeReleases::default(),
                _scratch: scratch,
            }
        }

        pub(crate) fn with_settings(mut self, settings: Settings) -> Self {
            self.settings = settings;
            self
        }

        pub(crate) fn with_releases(mut self, releases: FakeReleases) -> Self {
            self.releases = releases;
            self
        }

        pub(crate) fn home(&self) -> &Path {
            &self.context.home
        }

        pub(crate) fn session<'a>(
            &'a self,
            runner: &'a FakeRunner,
            backend: PackageBackend,
        ) -> Session<'a> {
            Session {
                context: &self.context,
                settings: &self.settings,
                runner,
                gate: &self.gate,
                backend,
                releases: &self.releases,
                tools: Tools::default(),
                show_progress: false,
            }
        }
    }

    struct Scripted {
        name: &'static str,
        policy: FailurePolicy,
        fails: bool,
    }

    impl Step for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        fn idempotence(&self) -> Idempotence {
            Idempotence::SafeToRepeat
        }

        fn policy(&self) -> FailurePolicy {
            self.policy
        }

        fn run(&self, _session: &mut Session<'_>) -> Result<()> {
            if self.fails {
                return Err(Error::from(SyncError::Diverged {
                    path: PathBuf::from("/tmp/checkout"),
                }));
            }

            Ok(())
        }
    }

    fn scripted(name: &'static str, policy: FailurePolicy, fails: bool) -> Box<dyn Step> {
        Box::new(Scripted { name, policy, fails })
    }

    /// Runner of a freshly provisioned Debian-like host where nothing but
    /// apt and sudo exist yet.
    fn fresh_linux_host() -> FakeRunner {
        FakeRunner::new()
            .with_programs(["sudo", "apt-get", "dpkg", "sh"])
            .provides("sudo env DEBIAN_FRONTEND=noninteractive apt-get install -y git", "git")
            .provides("sudo env DEBIAN_FRONTEND=noninteractive apt-get install -y git", "curl")
            .provides("sh -c curl", "nix")
    }

    #[test]
    fn standard_pipeline_order() {
        assert_eq!(
            Pipeline::standard().names(),
            vec![
                "privilege",
                "dependencies",
                "nix-features",
                "repository",
                "component",
                "shell-integration",
                "activation",
                "login-shell",
            ]
        );
    }

    #[test]
    fn warn_and_continue_records_warning() -> anyhow::Result<()> {
        let runner = FakeRunner::new();
        let fixture = SessionFixture::new(context_for(Platform::Linux, "x86_64"));
        let mut session = fixture.session(&runner, PackageBackend::Apt);
        let pipeline = Pipeline::new(vec![
            scripted("first", FailurePolicy::Fatal, false),
            scripted("optional", FailurePolicy::WarnAndContinue, true),
            scripted("last", FailurePolicy::Fatal, false),
        ]);
        let report = pipeline.execute(&mut session)?;

        assert_eq!(report.completed, vec!["first", "last"]);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].step, "optional");

        Ok(())
    }

    #[test]
    fn fatal_failure_stops_run() {
        let runner = FakeRunner::new();
        let fixture = SessionFixture::new(context_for(Platform::Linux, "x86_64"));
        let mut session = fixture.session(&runner, PackageBackend::Apt);
        let pipeline = Pipeline::new(vec![
            scripted("first", FailurePolicy::Fatal, true),
            scripted("never", FailurePolicy::Fatal, false),
        ]);
        let error = pipeline.execute(&mut session).unwrap_err();

        assert_eq!(error.kind(), ErrorKind::DivergedHistory);
    }

    #[test]
    fn install_then_update_on_fresh_linux_host() -> anyhow::Result<()> {
        let mut context = context_for(Platform::Linux, "x86_64");
        context.pull = PullMode::NoPull;
        context.component = false;
        let mut fixture = SessionFixture::new(context);
        let origin = fixture.home().with_file_name("origin");
        let upstream = init_origin(&origin)?;
        commit_file(&upstream, "flake.nix", "{ outputs = _: { }; }\n")?;
        fixture.context.repo_url = origin.display().to_string();
        let checkout = fixture.context.install_dir.clone();

        let runner = fresh_linux_host();
        let mut session = fixture.session(&runner, PackageBackend::Apt);
        let report = Pipeline::standard().execute(&mut session)?;

        assert_eq!(report.skipped, vec!["component", "login-shell"]);
        assert!(report.warnings.is_empty());
        assert!(runner.ran("sudo env DEBIAN_FRONTEND=noninteractive apt-get install -y git curl"));
        assert!(runner.ran("sh -c curl"));
        assert!(checkout.join("flake.nix").is_file());
        let activation = format!(
            "NIXBOOT_USER=alice /usr/bin/nix run home-manager/master -- switch --flake {}#alice@linux --impure -b backup",
            checkout.display()
        );
        assert!(runner.ran(&activation));
        assert_eq!(runner.count("sudo -v"), 1);

        let nix_conf = user_nix_conf(fixture.home());
        let profile = fixture.home().join(".profile");
        let first_conf = read_to_string(&nix_conf)?;
        let first_profile = read_to_string(&profile)?;
        assert_eq!(first_conf, "experimental-features = nix-command flakes\n");
        let fetch_head = checkout.join(".git").join("FETCH_HEAD");
        if fetch_head.exists() {
            std::fs::remove_file(&fetch_head)?;
        }

        fixture.context.mode = RunMode::Update;
        fixture.context.pull = PullMode::Pull;
        fixture.gate = PrivilegeGate::new(false);
        let runner = FakeRunner::new().with_programs(["sudo", "apt-get", "git", "curl", "nix"]);
        let mut session = fixture.session(&runner, PackageBackend::Apt);
        Pipeline::standard().execute(&mut session)?;

        assert_eq!(read_to_string(&nix_conf)?, first_conf);
        assert_eq!(read_to_string(&profile)?, first_profile);
        assert_eq!(first_profile.matches("# >>> nixboot:nix >>>").count(), 1);
        assert!(fetch_head.exists());
        assert!(!runner.ran("sudo env DEBIAN_FRONTEND=noninteractive apt-get install"));
        assert_eq!(runner.count(&activation), 1);

        Ok(())
    }
}
