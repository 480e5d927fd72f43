// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Invocation context resolution.
//!
//! Everything nixboot needs to know about a run is resolved exactly once,
//! up front, into an immutable [`InvocationContext`]: who the target user
//! is, where their home directory and configuration checkout live, what
//! platform and architecture we are on, and whether the checkout should be
//! pulled.
//!
//! Resolution never mutates the filesystem or touches the network. Thus,
//! an unresolvable account aborts the run before any side effect happens.

use crate::{
    config::{Settings, DEFAULT_REPO_URL},
    exec::{Cmd, ExecError, Runner},
    path::{default_install_dir, home_dir, NoWayHome},
};

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
};
use tracing::{debug, instrument, warn};

/// Operating system family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    MacOs,
    Linux,
}

impl Platform {
    /// Parse output of `uname -s`.
    pub fn from_uname(system: &str) -> Option<Self> {
        match system.trim() {
            "Darwin" => Some(Self::MacOs),
            "Linux" => Some(Self::Linux),
            _ => None,
        }
    }
}

impl Display for Platform {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::MacOs => fmt.write_str("macos"),
            Self::Linux => fmt.write_str("linux"),
        }
    }
}

/// CPU architecture.
///
/// Unrecognized architecture strings are kept verbatim, because only the
/// package fetching steps care about an exact match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Aarch64,
    Other(String),
}

impl Arch {
    /// Normalize output of `uname -m`.
    pub fn from_uname(machine: &str) -> Self {
        match machine.trim() {
            "x86_64" | "amd64" => Self::X86_64,
            "aarch64" | "arm64" => Self::Aarch64,
            other => Self::Other(other.to_string()),
        }
    }

    /// Lowercase tokens that identify this architecture in file names.
    pub fn tokens(&self) -> Vec<String> {
        match self {
            Self::X86_64 => vec!["x86_64".into(), "amd64".into(), "x64".into()],
            Self::Aarch64 => vec!["aarch64".into(), "arm64".into()],
            Self::Other(raw) => vec![raw.to_lowercase()],
        }
    }
}

impl Display for Arch {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::X86_64 => fmt.write_str("x86_64"),
            Self::Aarch64 => fmt.write_str("aarch64"),
            Self::Other(raw) => fmt.write_str(raw),
        }
    }
}

/// Whether an existing checkout gets updated.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PullMode {
    #[default]
    Pull,
    NoPull,
}

/// Which entry point started the run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    #[default]
    Install,
    Update,
}

/// Account database entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
    pub shell: PathBuf,
}

impl Account {
    /// Hand ownership of file over to this account.
    ///
    /// Used when running as root on behalf of the account, so files nixboot
    /// creates in its home directory do not end up owned by root.
    pub fn take_ownership(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        std::os::unix::fs::chown(path, Some(self.uid), Some(self.gid))
    }
}

/// Layer of indirection for account lookups.
pub trait AccountDatabase {
    /// Lookup account by user name.
    fn lookup(&self, name: &str) -> Option<Account>;

    /// User ID of current process.
    fn current_uid(&self) -> u32;
}

/// Account lookups through the system's passwd database.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAccounts;

impl AccountDatabase for SystemAccounts {
    fn lookup(&self, name: &str) -> Option<Account> {
        use uzers::os::unix::UserExt;

        uzers::get_user_by_name(name).map(|user| Account {
            name: name.to_string(),
            uid: user.uid(),
            gid: user.primary_group_id(),
            home: user.home_dir().to_path_buf(),
            shell: user.shell().to_path_buf(),
        })
    }

    fn current_uid(&self) -> u32 {
        uzers::get_current_uid()
    }
}

/// Raw request gathered from command line and environment.
#[derive(Debug, Default, Clone)]
pub struct Request {
    pub username: String,
    pub dir: Option<PathBuf>,
    pub pull: PullMode,
    pub darwin_target: Option<String>,
    pub repo: Option<String>,
    pub login_shell: Option<String>,
    pub mode: RunMode,
    pub component: bool,
}

/// Immutable description of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationContext {
    pub username: String,
    pub account: Option<Account>,
    pub home: PathBuf,
    pub install_dir: PathBuf,
    pub platform: Platform,
    pub arch: Arch,
    pub pull: PullMode,
    pub darwin_target: String,
    pub repo_url: String,
    pub login_shell: Option<String>,
    pub mode: RunMode,
    pub component: bool,
    pub is_root: bool,
}

impl InvocationContext {
    /// Name of home-manager configuration to activate on Linux.
    pub fn home_target(&self) -> String {
        format!("{}@linux", self.username)
    }

    /// Whether the process acts on behalf of a different account as root.
    pub fn acts_for_other_user(&self) -> bool {
        self.is_root && self.account.as_ref().is_some_and(|account| account.uid != 0)
    }
}

/// Resolve invocation context.
///
/// # Errors
///
/// - Return [`ContextError::Usage`] if user name is empty or malformed.
/// - Return [`ContextError::UnsupportedPlatform`] if OS is neither macOS
///   nor Linux.
/// - Return [`ContextError::Resolution`] if account cannot be found and no
///   install directory override was given.
/// - Return [`ContextError::Exec`] if system identification fails.
#[instrument(skip_all, fields(user = %request.username), level = "debug")]
pub fn resolve(
    request: Request,
    settings: &Settings,
    runner: &dyn Runner,
    accounts: &dyn AccountDatabase,
) -> Result<InvocationContext> {
    validate_username(&request.username)?;

    let system = runner.output(&Cmd::new("uname").arg("-s"))?;
    let platform = Platform::from_uname(&system)
        .ok_or_else(|| ContextError::UnsupportedPlatform { system: system.clone() })?;
    let machine = runner.output(&Cmd::new("uname").arg("-m"))?;
    let arch = Arch::from_uname(&machine);
    if let Arch::Other(raw) = &arch {
        warn!("unrecognized architecture {raw:?}, passing it through verbatim");
    }

    let install_dir = request
        .dir
        .clone()
        .or_else(|| settings.repository.install_dir.clone());
    let account = accounts.lookup(&request.username);
    let home = match (&account, &install_dir) {
        (Some(account), _) => account.home.clone(),
        (None, Some(_)) => {
            warn!(
                "account {:?} not found, falling back to current home directory",
                request.username
            );
            home_dir()?
        }
        (None, None) => {
            return Err(ContextError::Resolution {
                user: request.username,
            })
        }
    };
    let install_dir = install_dir.unwrap_or_else(|| default_install_dir(&home));

    let context = InvocationContext {
        account,
        home,
        install_dir,
        platform,
        arch,
        pull: request.pull,
        darwin_target: request
            .darwin_target
            .unwrap_or_else(|| settings.activation.darwin_target.clone()),
        repo_url: request
            .repo
            .or_else(|| settings.repository.url.clone())
            .unwrap_or_else(|| DEFAULT_REPO_URL.to_string()),
        login_shell: request.login_shell.or_else(|| settings.login_shell.clone()),
        mode: request.mode,
        component: request.component && settings.component.enabled,
        is_root: accounts.current_uid() == 0,
        username: request.username,
    };
    debug!("resolved context: {context:?}");

    Ok(context)
}

fn validate_username(username: &str) -> Result<()> {
    if username.is_empty() {
        return Err(ContextError::Usage("--user must not be empty".into()));
    }

    if username
        .chars()
        .any(|ch| ch.is_whitespace() || ch == '/' || ch == ':' || ch.is_control())
    {
        return Err(ContextError::Usage(format!(
            "{username:?} is not a valid user name"
        )));
    }

    Ok(())
}

/// Context resolution error types.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// Arguments are missing or malformed.
    #[error("{0}")]
    Usage(String),

    /// Account does not exist and no override was given.
    #[error("cannot resolve account {user:?}, pass --dir to override")]
    Resolution { user: String },

    /// Operating system is not supported.
    #[error("unsupported operating system {system:?}")]
    UnsupportedPlatform { system: String },

    /// System identification failed.
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// Home directory cannot be determined.
    #[error(transparent)]
    NoWayHome(#[from] NoWayHome),
}

/// Friendly result alias :3
pub type Result<T, E = ContextError> = std::result::Result<T, E>;

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::exec::fake::FakeRunner;
    use simple_test_case::test_case;
    use std::collections::HashMap;

    #[derive(Debug, Default)]
    pub(crate) struct FakeAccounts {
        pub(crate) accounts: HashMap<String, Account>,
        pub(crate) uid: u32,
    }

    impl FakeAccounts {
        pub(crate) fn with_user(name: &str, home: impl Into<PathBuf>) -> Self {
            let mut accounts = HashMap::new();
            accounts.insert(
                name.to_string(),
                Account {
                    name: name.to_string(),
                    uid: 1000,
                    gid: 1000,
                    home: home.into(),
                    shell: PathBuf::from("/bin/bash"),
                },
            );
            Self { accounts, uid: 1000 }
        }
    }

    impl AccountDatabase for FakeAccounts {
        fn lookup(&self, name: &str) -> Option<Account> {
            self.accounts.get(name).cloned()
        }

        fn current_uid(&self) -> u32 {
            self.uid
        }
    }

    pub(crate) fn linux_runner(machine: &str) -> FakeRunner {
        FakeRunner::new()
            .with_programs(["uname"])
            .respond("uname -s", "Linux")
            .respond("uname -m", machine)
    }

    fn request(user: &str) -> Request {
        Request {
            username: user.into(),
            component: true,
            ..Default::default()
        }
    }

    #[test_case("x86_64", Arch::X86_64; "x86_64")]
    #[test_case("amd64", Arch::X86_64; "amd64")]
    #[test_case("aarch64", Arch::Aarch64; "aarch64")]
    #[test_case("arm64\n", Arch::Aarch64; "arm64_with_newline")]
    #[test_case("riscv64", Arch::Other("riscv64".into()); "unknown_passes_through")]
    #[test]
    fn normalize_architecture(machine: &str, expect: Arch) {
        assert_eq!(Arch::from_uname(machine), expect);
    }

    #[test]
    fn resolve_linux_defaults() -> anyhow::Result<()> {
        let runner = linux_runner("aarch64");
        let accounts = FakeAccounts::with_user("alice", "/home/alice");
        let context = resolve(request("alice"), &Settings::default(), &runner, &accounts)?;

        assert_eq!(context.platform, Platform::Linux);
        assert_eq!(context.arch, Arch::Aarch64);
        assert_eq!(context.home, PathBuf::from("/home/alice"));
        assert_eq!(
            context.install_dir,
            PathBuf::from("/home/alice/.config/nixboot/workstation")
        );
        assert_eq!(context.home_target(), "alice@linux");
        assert_eq!(context.darwin_target, "default");
        assert_eq!(context.repo_url, DEFAULT_REPO_URL);
        assert!(!context.is_root);

        Ok(())
    }

    #[test]
    fn command_line_beats_settings() -> anyhow::Result<()> {
        let runner = linux_runner("x86_64");
        let accounts = FakeAccounts::with_user("alice", "/home/alice");
        let mut settings = Settings::default();
        settings.repository.url = Some("https://settings.example/config.git".into());
        settings.repository.install_dir = Some(PathBuf::from("/srv/settings"));
        settings.component.enabled = false;

        let mut req = request("alice");
        req.dir = Some(PathBuf::from("/srv/flag"));
        let context = resolve(req, &settings, &runner, &accounts)?;

        assert_eq!(context.install_dir, PathBuf::from("/srv/flag"));
        assert_eq!(context.repo_url, "https://settings.example/config.git");
        assert!(!context.component);

        Ok(())
    }

    #[test]
    fn unknown_account_fails_before_side_effects() {
        let runner = linux_runner("x86_64");
        let accounts = FakeAccounts::default();
        let result = resolve(request("mallory"), &Settings::default(), &runner, &accounts);

        assert!(matches!(result, Err(ContextError::Resolution { ref user }) if user == "mallory"));
        assert_eq!(runner.log(), vec!["uname -s", "uname -m"]);
    }

    #[test]
    fn unknown_os_is_unsupported() {
        let runner = FakeRunner::new()
            .with_programs(["uname"])
            .respond("uname -s", "FreeBSD");
        let accounts = FakeAccounts::with_user("alice", "/home/alice");
        let result = resolve(request("alice"), &Settings::default(), &runner, &accounts);

        assert!(matches!(result, Err(ContextError::UnsupportedPlatform { .. })));
    }

    #[test]
    fn malformed_user_is_usage_error() {
        let runner = linux_runner("x86_64");
        let accounts = FakeAccounts::default();
        for user in ["", "al ice", "../root"] {
            let result = resolve(request(user), &Settings::default(), &runner, &accounts);
            assert!(matches!(result, Err(ContextError::Usage(_))), "{user:?}");
        }
        assert!(runner.log().is_empty());
    }
}
