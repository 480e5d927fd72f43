// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Workstation bootstrapper.
//!
//! Nixboot takes a freshly installed macOS or Linux machine to a state where
//! a declarative, Nix-managed workstation configuration is activated for a
//! target user. It also updates an already bootstrapped machine.
//!
//! # Reconciliation
//!
//! Every run is a sequence of [`pipeline::Step`]s, each of which observes
//! the current machine state and only acts on what is missing:
//!
//! 1. Establish administrative privileges once.
//! 2. Install base dependencies (git, curl, Nix, Homebrew on macOS).
//! 3. Enable the `nix-command` and `flakes` experimental features.
//! 4. Clone or fast-forward the configuration repository.
//! 5. Install the optional container desktop companion.
//! 6. Patch shell startup files with marker-delimited managed blocks.
//! 7. Activate the declarative configuration (nix-darwin or home-manager).
//! 8. Assign the login shell on Linux.
//!
//! Running the same command twice leaves the machine as the first run did.
//! Nothing ever duplicates managed blocks or configuration lines, and local
//! modifications to the configuration checkout are never clobbered.
//!
//! # See Also
//!
//! 1. [nix-darwin](https://github.com/nix-darwin/nix-darwin)
//! 2. [home-manager](https://github.com/nix-community/home-manager)

pub mod activate;
pub mod backend;
pub mod block;
pub mod component;
pub mod config;
pub mod context;
pub mod deps;
pub mod error;
pub mod exec;
pub mod lock;
pub mod login_shell;
pub mod nixconf;
pub mod path;
pub mod pipeline;
pub mod privilege;
pub mod repo;

#[doc(inline)]
pub use error::{Error, ErrorKind, ErrorReport};

#[doc(inline)]
pub use pipeline::{Pipeline, RunReport, Session};
