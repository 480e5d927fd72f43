// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! External command execution.
//!
//! Every unit of real work nixboot performs is an external command: package
//! managers, the Nix installer, `nix build`, `darwin-rebuild`, `chsh`, etc.
//! These commands are treated as black boxes whose exit status (and, in a
//! few places, captured standard output) is the only contract.
//!
//! Commands are described through [`Cmd`], and executed through the
//! [`Runner`] layer of indirection. The [`SystemRunner`] actually spawns
//! processes, while the test suite swaps in a scripted runner that records
//! what would have been executed.

#[cfg(test)]
pub(crate) mod fake;

use std::{
    ffi::{OsStr, OsString},
    fmt::{Display, Formatter, Result as FmtResult},
    io::Write,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};
use tracing::{debug, instrument};

use crate::path::{BREW_LOCATIONS, NIX_PROFILE_BIN};

/// Description of an external command.
///
/// Environment variables attached to a command are set on the spawned
/// process directly. Once a command gets wrapped through [`Cmd::wrapped`],
/// those variables are converted into an explicit `env K=V` pass-through,
/// because elevation tools like sudo do not forward arbitrary environment
/// variables.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(String, String)>,
    cwd: Option<PathBuf>,
    stdin: Option<Vec<u8>>,
}

impl Cmd {
    /// Construct new command for target program.
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append a listing of arguments.
    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set environment variable for command.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Set working directory of command.
    pub fn current_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.cwd = Some(path.into());
        self
    }

    /// Feed bytes into standard input of command.
    pub fn stdin(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }

    /// Wrap command behind a prefix command, e.g., `sudo` or `sudo -u user`.
    ///
    /// Environment variables are forwarded explicitly through `env K=V`
    /// right after the prefix. Working directory and standard input carry
    /// over untouched.
    pub fn wrapped(self, prefix: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        let mut prefix = prefix.into_iter().map(Into::into);
        let Some(program) = prefix.next() else {
            return self;
        };

        let mut args: Vec<OsString> = prefix.collect();
        if !self.envs.is_empty() {
            args.push("env".into());
            args.extend(
                self.envs
                    .iter()
                    .map(|(key, value)| OsString::from(format!("{key}={value}"))),
            );
        }
        args.push(self.program);
        args.extend(self.args);

        Self {
            program,
            args,
            envs: Vec::new(),
            cwd: self.cwd,
            stdin: self.stdin,
        }
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    pub fn get_envs(&self) -> &[(String, String)] {
        &self.envs
    }

    pub fn get_current_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn get_stdin(&self) -> Option<&[u8]> {
        self.stdin.as_deref()
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command.envs(self.envs.iter().map(|(key, value)| (key, value)));
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        command
    }
}

impl Display for Cmd {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let mut parts = Vec::new();
        for (key, value) in &self.envs {
            parts.push(format!("{key}={value}"));
        }
        parts.push(self.program.to_string_lossy().into_owned());
        parts.extend(self.args.iter().map(|arg| arg.to_string_lossy().into_owned()));

        fmt.write_str(parts.join(" ").as_str())
    }
}

/// Layer of indirection for external command execution.
pub trait Runner {
    /// Run command to completion and capture its standard output.
    ///
    /// # Errors
    ///
    /// - Return [`ExecError::Spawn`] if command cannot be spawned.
    /// - Return [`ExecError::Failed`] if command exits unsuccessfully.
    fn output(&self, cmd: &Cmd) -> Result<String>;

    /// Run command attached to the current terminal.
    ///
    /// # Errors
    ///
    /// - Return [`ExecError::Spawn`] if command cannot be spawned.
    /// - Return [`ExecError::Failed`] if command exits unsuccessfully.
    fn status(&self, cmd: &Cmd) -> Result<()>;

    /// Probe whether command exits successfully, discarding all output.
    fn succeeds(&self, cmd: &Cmd) -> bool;

    /// Locate program on `PATH`.
    fn locate(&self, program: &str) -> Option<PathBuf>;
}

/// Runner that spawns real processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

impl Runner for SystemRunner {
    #[instrument(skip(self, cmd), fields(cmd = %cmd), level = "debug")]
    fn output(&self, cmd: &Cmd) -> Result<String> {
        let mut command = cmd.to_command();
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        command.stdin(if cmd.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn().map_err(|err| spawn_error(cmd, err))?;
        feed_stdin(cmd, &mut child)?;
        let output = child
            .wait_with_output()
            .map_err(|err| spawn_error(cmd, err))?;
        let stdout = chomp(String::from_utf8_lossy(output.stdout.as_slice()).into_owned());
        let stderr = chomp(String::from_utf8_lossy(output.stderr.as_slice()).into_owned());

        if !output.status.success() {
            return Err(ExecError::Failed {
                command: cmd.to_string(),
                status: output.status.to_string(),
                message: if stderr.is_empty() { stdout } else { stderr },
            });
        }

        Ok(stdout)
    }

    #[instrument(skip(self, cmd), fields(cmd = %cmd), level = "debug")]
    fn status(&self, cmd: &Cmd) -> Result<()> {
        let mut command = cmd.to_command();
        if cmd.stdin.is_some() {
            command.stdin(Stdio::piped());
            command.stdout(Stdio::null());
        }

        let mut child = command.spawn().map_err(|err| spawn_error(cmd, err))?;
        feed_stdin(cmd, &mut child)?;
        let status = child.wait().map_err(|err| spawn_error(cmd, err))?;
        if !status.success() {
            return Err(ExecError::Failed {
                command: cmd.to_string(),
                status: status.to_string(),
                message: String::new(),
            });
        }

        Ok(())
    }

    fn succeeds(&self, cmd: &Cmd) -> bool {
        let status = cmd
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        debug!("probe {cmd}: {status:?}");

        matches!(status, Ok(status) if status.success())
    }

    fn locate(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok().or_else(|| {
            well_known_locations(program)
                .iter()
                .map(PathBuf::from)
                .find(|path| path.is_file())
        })
    }
}

// INVARIANT: Freshly installed Nix and Homebrew are not on PATH until a new
// login shell picks up their profiles.
fn well_known_locations(program: &str) -> &'static [&'static str] {
    match program {
        "nix" => &[NIX_PROFILE_BIN],
        "brew" => &BREW_LOCATIONS,
        _ => &[],
    }
}

fn feed_stdin(cmd: &Cmd, child: &mut std::process::Child) -> Result<()> {
    if let (Some(bytes), Some(mut stdin)) = (cmd.stdin.as_ref(), child.stdin.take()) {
        stdin
            .write_all(bytes)
            .map_err(|err| spawn_error(cmd, err))?;
    }

    Ok(())
}

fn spawn_error(cmd: &Cmd, source: std::io::Error) -> ExecError {
    ExecError::Spawn {
        program: cmd.program.to_string_lossy().into_owned(),
        source,
    }
}

// INVARIANT: Chomp trailing newlines.
fn chomp(message: String) -> String {
    message
        .strip_suffix("\r\n")
        .or(message.strip_suffix('\n'))
        .map(ToString::to_string)
        .unwrap_or(message)
}

fn detail(message: &str) -> String {
    if message.is_empty() {
        String::new()
    } else {
        format!(":\n{message}")
    }
}

/// External command execution error types.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// Command could not be spawned at all, e.g., program not found.
    #[error("failed to run {program:?}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Command ran but exited unsuccessfully.
    #[error("command {command:?} failed ({status}){}", detail(.message))]
    Failed {
        command: String,
        status: String,
        message: String,
    },
}

/// Friendly result alias :3
pub type Result<T, E = ExecError> = std::result::Result<T, E>;
