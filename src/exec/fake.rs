// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Scripted runner for tests.
//!
//! Records every command line it is asked to run. Programs are considered
//! present only if registered, or if given as an absolute path. Responses
//! are matched by command line prefix, and a successful command can make
//! a program appear, which is how package installs are simulated.

use super::{Cmd, ExecError, Result, Runner};

use std::{cell::RefCell, collections::HashMap, path::PathBuf};

#[derive(Debug, Clone)]
enum Response {
    Stdout(String),
    Fail(String),
}

#[derive(Debug, Default)]
pub(crate) struct FakeRunner {
    log: RefCell<Vec<String>>,
    programs: RefCell<HashMap<String, PathBuf>>,
    responses: RefCell<Vec<(String, Response)>>,
    provides: RefCell<Vec<(String, String)>>,
}

impl FakeRunner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Mark programs as present on `PATH`.
    pub(crate) fn with_programs(self, programs: impl IntoIterator<Item = &'static str>) -> Self {
        for program in programs {
            self.add_program(program);
        }
        self
    }

    /// Respond to commands starting with prefix by printing stdout.
    pub(crate) fn respond(self, prefix: impl Into<String>, stdout: impl Into<String>) -> Self {
        self.responses
            .borrow_mut()
            .push((prefix.into(), Response::Stdout(stdout.into())));
        self
    }

    /// Fail commands starting with prefix.
    pub(crate) fn fail(self, prefix: impl Into<String>, message: impl Into<String>) -> Self {
        self.responses
            .borrow_mut()
            .push((prefix.into(), Response::Fail(message.into())));
        self
    }

    /// Make program present once a command starting with prefix succeeds.
    pub(crate) fn provides(self, prefix: impl Into<String>, program: impl Into<String>) -> Self {
        self.provides
            .borrow_mut()
            .push((prefix.into(), program.into()));
        self
    }

    pub(crate) fn add_program(&self, program: &str) {
        self.programs
            .borrow_mut()
            .insert(program.to_string(), PathBuf::from("/usr/bin").join(program));
    }

    /// All command lines executed so far, probes included.
    pub(crate) fn log(&self) -> Vec<String> {
        self.log.borrow().clone()
    }

    /// Whether any executed command line starts with prefix.
    pub(crate) fn ran(&self, prefix: &str) -> bool {
        self.log.borrow().iter().any(|line| line.starts_with(prefix))
    }

    /// Number of executed command lines starting with prefix.
    pub(crate) fn count(&self, prefix: &str) -> usize {
        self.log
            .borrow()
            .iter()
            .filter(|line| line.starts_with(prefix))
            .count()
    }

    fn execute(&self, cmd: &Cmd) -> Result<String> {
        let line = cmd.to_string();
        let program = cmd.program().to_string_lossy().into_owned();
        self.log.borrow_mut().push(line.clone());

        if !program.starts_with('/') && !self.programs.borrow().contains_key(&program) {
            return Err(ExecError::Spawn {
                program,
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }

        let response = self
            .responses
            .borrow()
            .iter()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, response)| response.clone());

        match response {
            Some(Response::Fail(message)) => Err(ExecError::Failed {
                command: line,
                status: "exit status: 1".into(),
                message,
            }),
            Some(Response::Stdout(stdout)) => {
                self.apply_provides(&line);
                Ok(stdout)
            }
            None => {
                self.apply_provides(&line);
                Ok(String::new())
            }
        }
    }

    fn apply_provides(&self, line: &str) {
        let provided: Vec<String> = self
            .provides
            .borrow()
            .iter()
            .filter(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, program)| program.clone())
            .collect();
        for program in provided {
            self.add_program(&program);
        }
    }
}

impl Runner for FakeRunner {
    fn output(&self, cmd: &Cmd) -> Result<String> {
        self.execute(cmd)
    }

    fn status(&self, cmd: &Cmd) -> Result<()> {
        self.execute(cmd).map(|_| ())
    }

    fn succeeds(&self, cmd: &Cmd) -> bool {
        self.execute(cmd).is_ok()
    }

    fn locate(&self, program: &str) -> Option<PathBuf> {
        self.programs.borrow().get(program).cloned()
    }
}
