// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use nixboot::{
    backend::PackageBackend,
    component::release::GithubReleases,
    config::Settings,
    context::{resolve, PullMode, Request, RunMode, SystemAccounts},
    error::failure_line,
    exec::SystemRunner,
    lock::RunLock,
    path::{default_config_file, lock_file},
    pipeline::{Pipeline, Session, Tools},
    privilege::PrivilegeGate,
    Error, RunReport,
};

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::{path::PathBuf, process::exit};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "\n  nixboot [options] install --user <name> [install-options]\n  nixboot [options] update --user <name> [update-options]",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to configuration file.
    #[arg(long, global = true, env = "NIXBOOT_CONFIG", value_name = "path")]
    pub config: Option<PathBuf>,

    /// Print failures as one JSON object on standard error.
    #[arg(long, global = true)]
    pub json: bool,

    /// Show debug logs.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

impl Cli {
    fn run(self) -> Result<RunReport> {
        let config = match self.config {
            Some(path) => path,
            None => default_config_file()?,
        };
        let settings = Settings::load(config).map_err(Error::from)?;
        let request = self.command.into_request();

        run_pipeline(request, &settings)
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Bootstrap fresh machine for target user.
    #[command(override_usage = "nixboot install [options] --user <name>")]
    Install(InstallOptions),

    /// Update already bootstrapped machine.
    #[command(override_usage = "nixboot update [options] --user <name>")]
    Update(UpdateOptions),
}

impl Command {
    fn into_request(self) -> Request {
        match self {
            Self::Install(opts) => Request {
                username: opts.common.user,
                dir: opts.common.dir,
                pull: pull_mode(opts.common.no_pull),
                darwin_target: opts.common.darwin_target,
                repo: opts.repo,
                login_shell: opts.common.login_shell,
                mode: RunMode::Install,
                component: !opts.skip_component,
            },
            Self::Update(opts) => Request {
                username: opts.common.user,
                dir: opts.common.dir,
                pull: pull_mode(opts.common.no_pull),
                darwin_target: opts.common.darwin_target,
                repo: None,
                login_shell: opts.common.login_shell,
                mode: RunMode::Update,
                component: opts.update_rancher,
            },
        }
    }
}

#[derive(Args, Clone, Debug)]
struct CommonOptions {
    /// Name of account to bootstrap for.
    #[arg(short, long, value_name = "name")]
    pub user: String,

    /// Path to configuration checkout.
    #[arg(short, long, env = "NIXBOOT_DIR", value_name = "path")]
    pub dir: Option<PathBuf>,

    /// Use existing checkout as-is without cloning or pulling.
    #[arg(long, visible_alias = "no-clone")]
    pub no_pull: bool,

    /// Name of nix-darwin configuration to activate on macOS.
    #[arg(long, value_name = "name")]
    pub darwin_target: Option<String>,

    /// Login shell to assign on Linux.
    #[arg(long, value_name = "name")]
    pub login_shell: Option<String>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct InstallOptions {
    #[command(flatten)]
    pub common: CommonOptions,

    /// URL of configuration repository to clone.
    #[arg(long, env = "NIXBOOT_REPO", value_name = "url")]
    pub repo: Option<String>,

    /// Do not install container desktop companion.
    #[arg(long)]
    pub skip_component: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct UpdateOptions {
    #[command(flatten)]
    pub common: CommonOptions,

    /// Also install or update container desktop companion.
    #[arg(long)]
    pub update_rancher: bool,
}

fn main() {
    let cli = Cli::parse();

    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    let json = cli.json;
    match cli.run() {
        Ok(report) => {
            if report.warnings.is_empty() {
                info!("done");
            } else {
                warn!("done with {} warning(s)", report.warnings.len());
            }
            exit(0)
        }
        Err(error) => exit(report_failure(&error, json)),
    }
}

fn report_failure(error: &anyhow::Error, json: bool) -> i32 {
    let Some(error) = error.downcast_ref::<Error>() else {
        if json {
            eprintln!(
                "{}",
                serde_json::json!({ "error": "other", "message": format!("{error:#}"), "exit_code": 1 })
            );
        } else {
            debug!("{error:?}");
            eprintln!("{}", failure_line(format!("{error:#}")));
        }
        return 1;
    };

    if json {
        match serde_json::to_string(&error.report()) {
            Ok(report) => eprintln!("{report}"),
            Err(_) => eprintln!("{}", error.failure_line()),
        }
    } else {
        eprintln!("{}", error.failure_line());
    }

    error.exit_code()
}

fn pull_mode(no_pull: bool) -> PullMode {
    if no_pull {
        PullMode::NoPull
    } else {
        PullMode::Pull
    }
}

fn run_pipeline(request: Request, settings: &Settings) -> Result<RunReport> {
    let runner = SystemRunner::new();
    let context = resolve(request, settings, &runner, &SystemAccounts).map_err(Error::from)?;
    let owner = context
        .account
        .as_ref()
        .filter(|_| context.acts_for_other_user());
    let _lock = RunLock::acquire_as(lock_file(&context.home), owner).map_err(Error::from)?;

    let gate = PrivilegeGate::new(context.is_root);
    let backend = PackageBackend::detect(context.platform, &runner);
    let releases = GithubReleases::new();
    info!(
        "{:?} {} for {} on {} ({}, {backend})",
        context.mode,
        context.install_dir.display(),
        context.username,
        context.platform,
        context.arch,
    );

    let mut session = Session {
        context: &context,
        settings,
        runner: &runner,
        gate: &gate,
        backend,
        releases: &releases,
        tools: Tools::default(),
        show_progress: true,
    };
    let report = Pipeline::standard().execute(&mut session)?;

    Ok(report)
}
