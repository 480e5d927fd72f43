// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Shell startup file integration.
//!
//! Nix and Homebrew only become usable once a login shell sources their
//! profile scripts. nixboot takes care of that by placing managed blocks
//! into the user's shell startup files.
//!
//! # Managed Blocks
//!
//! A managed block is a machine-owned region inside a user-owned file,
//! delimited by fixed marker lines:
//!
//! ```text
//! # >>> nixboot:nix >>>
//! . /nix/var/nix/profiles/default/etc/profile.d/nix-daemon.sh
//! # <<< nixboot:nix <<<
//! ```
//!
//! Blocks are always rewritten, never skipped: every instance of a named
//! block is stripped out, and a freshly rendered block is appended to the
//! end of the file. Thus, repeated runs produce byte-identical output, and
//! stale or duplicated blocks heal themselves. Content outside of the
//! markers is never touched.

use crate::{
    config::BlockSettings,
    context::{Account, Platform},
    path::{BREW_LOCATIONS, NIX_DAEMON_PROFILE},
    pipeline::{Idempotence, Session, Step},
};

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs::{create_dir_all, read_to_string, write},
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

/// Machine-managed block of shell code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedBlock {
    name: String,
    body: String,
}

impl ManagedBlock {
    /// Construct new managed block.
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn begin_marker(&self) -> String {
        format!("# >>> nixboot:{} >>>", self.name)
    }

    pub fn end_marker(&self) -> String {
        format!("# <<< nixboot:{} <<<", self.name)
    }

    /// Render block with markers, always ending in a newline.
    pub fn render(&self) -> String {
        let mut rendered = self.begin_marker();
        rendered.push('\n');
        if !self.body.is_empty() {
            rendered.push_str(&self.body);
            if !self.body.ends_with('\n') {
                rendered.push('\n');
            }
        }
        rendered.push_str(&self.end_marker());
        rendered.push('\n');

        rendered
    }
}

/// Shell startup file editor.
///
/// # Invariant
///
/// - At most one instance of each named block after [`BlockEdit::apply`].
/// - Content outside of markers keeps its order and bytes, except for a
///   missing trailing newline that gets added before the block.
/// - Changed only if content differs from what the editor started with,
///   no matter how many blocks were applied in between.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BlockEdit {
    original: String,
    content: String,
}

impl BlockEdit {
    /// Construct new editor over empty file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Strip all instances of block, then append it rendered fresh.
    ///
    /// # Errors
    ///
    /// - Return [`PatchError::Unterminated`] if a begin marker of the block
    ///   has no matching end marker. Content is left as is.
    pub fn apply(&mut self, block: &ManagedBlock) -> Result<()> {
        let mut updated = strip(&self.content, block)?;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(&block.render());
        self.content = updated;

        Ok(())
    }

    /// Whether the editor changed anything.
    pub fn is_changed(&self) -> bool {
        self.content != self.original
    }
}

impl Display for BlockEdit {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(&self.content)
    }
}

impl From<String> for BlockEdit {
    fn from(content: String) -> Self {
        Self {
            original: content.clone(),
            content,
        }
    }
}

impl From<&str> for BlockEdit {
    fn from(content: &str) -> Self {
        Self::from(content.to_string())
    }
}

fn strip(content: &str, block: &ManagedBlock) -> Result<String> {
    let begin = block.begin_marker();
    let end = block.end_marker();

    let mut stripped = String::with_capacity(content.len());
    let mut inside = false;
    for line in content.split_inclusive('\n') {
        let marker = line.trim_end();
        match (inside, marker == begin, marker == end) {
            (false, true, _) => inside = true,
            (false, false, _) => stripped.push_str(line),
            (true, _, true) => inside = false,
            (true, _, false) => continue,
        }
    }

    if inside {
        return Err(PatchError::Unterminated {
            name: block.name.clone(),
        });
    }

    Ok(stripped)
}

/// Step placing managed blocks into shell startup files.
#[derive(Debug, Default, Clone, Copy)]
pub struct PatchShellFiles;

impl Step for PatchShellFiles {
    fn name(&self) -> &'static str {
        "shell-integration"
    }

    fn idempotence(&self) -> Idempotence {
        Idempotence::SafeToRepeat
    }

    fn run(&self, session: &mut Session<'_>) -> crate::error::Result<()> {
        let context = session.context;
        let blocks = match &session.settings.shell.blocks {
            Some(blocks) => blocks.clone(),
            None => default_blocks(context.platform, session.tools.brew.as_deref()),
        };

        let mut written = 0;
        for (path, blocks) in group_by_file(&context.home, &blocks) {
            if !patch_blocks(&path, &blocks)? {
                continue;
            }

            written += 1;
            if context.acts_for_other_user() {
                if let Some(account) = &context.account {
                    hand_over(&path, &context.home, account)?;
                }
            }
        }
        debug!("{written} shell file(s) written");

        Ok(())
    }
}

/// Collect blocks per target file, keeping first-seen file order.
///
/// Blocks flagged `existing_only` are dropped for files that do not exist.
pub fn group_by_file(
    home: &Path,
    blocks: &[BlockSettings],
) -> Vec<(PathBuf, Vec<ManagedBlock>)> {
    let mut grouped: Vec<(PathBuf, Vec<ManagedBlock>)> = Vec::new();
    for settings in blocks {
        let block = ManagedBlock::new(&settings.name, &settings.body);
        for file in &settings.files {
            let path = home.join(file);
            if settings.existing_only && !path.exists() {
                debug!("skip absent {:?}", path.display());
                continue;
            }

            match grouped.iter_mut().find(|(known, _)| *known == path) {
                Some((_, blocks)) => blocks.push(block.clone()),
                None => grouped.push((path, vec![block.clone()])),
            }
        }
    }

    grouped
}

/// Place managed block into file.
///
/// Creates file and its parent directories if missing. File is only
/// written if something changed. Returns whether file was written.
///
/// # Errors
///
/// - Return [`PatchError::UnterminatedIn`] if file has a broken block.
/// - Return [`PatchError::Io`] if file cannot be read or written.
pub fn patch_file(path: impl AsRef<Path>, block: &ManagedBlock) -> Result<bool> {
    patch_blocks(path, std::slice::from_ref(block))
}

/// Place several managed blocks into file with at most one write.
///
/// Blocks are applied in order. File is only written if the result
/// differs from what is on disk. Returns whether file was written.
///
/// # Errors
///
/// - Return [`PatchError::UnterminatedIn`] if file has a broken block.
/// - Return [`PatchError::Io`] if file cannot be read or written.
#[instrument(skip(path, blocks), level = "debug")]
pub fn patch_blocks(path: impl AsRef<Path>, blocks: &[ManagedBlock]) -> Result<bool> {
    let path = path.as_ref();
    let io_error = |source| PatchError::Io {
        source,
        path: path.to_path_buf(),
    };

    let content = if path.exists() {
        read_to_string(path).map_err(io_error)?
    } else {
        String::new()
    };

    let mut editor = BlockEdit::from(content);
    for block in blocks {
        editor.apply(block).map_err(|err| match err {
            PatchError::Unterminated { name } => PatchError::UnterminatedIn {
                name,
                path: path.to_path_buf(),
            },
            other => other,
        })?;
    }
    if !editor.is_changed() {
        debug!("{:?} already up to date", path.display());
        return Ok(false);
    }

    let names = blocks.iter().map(ManagedBlock::name).collect::<Vec<_>>();
    info!("update {} block(s) in {:?}", names.join(", "), path.display());
    if let Some(parent) = path.parent() {
        create_dir_all(parent).map_err(io_error)?;
    }
    write(path, editor.to_string()).map_err(io_error)?;

    Ok(true)
}

/// Managed blocks used when settings do not name any.
pub fn default_blocks(platform: Platform, brew: Option<&Path>) -> Vec<BlockSettings> {
    let nix_daemon = format!(
        "if [ -e {NIX_DAEMON_PROFILE} ]; then\n  . {NIX_DAEMON_PROFILE}\nfi\n"
    );

    match platform {
        Platform::Linux => {
            let body = format!(
                "{nix_daemon}{}",
                concat!(
                    "if [ -e \"$HOME/.nix-profile/etc/profile.d/hm-session-vars.sh\" ]; then\n",
                    "  . \"$HOME/.nix-profile/etc/profile.d/hm-session-vars.sh\"\n",
                    "fi\n",
                )
            );
            vec![
                BlockSettings {
                    name: "nix".into(),
                    files: vec![PathBuf::from(".profile"), PathBuf::from(".bashrc")],
                    existing_only: false,
                    body: body.clone(),
                },
                BlockSettings {
                    name: "nix".into(),
                    files: vec![PathBuf::from(".zshrc")],
                    existing_only: true,
                    body,
                },
            ]
        }
        Platform::MacOs => {
            let brew = brew
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(BREW_LOCATIONS[0]));
            vec![
                BlockSettings {
                    name: "homebrew".into(),
                    files: vec![PathBuf::from(".zprofile")],
                    existing_only: false,
                    body: format!("eval \"$({} shellenv)\"\n", brew.display()),
                },
                BlockSettings {
                    name: "nix".into(),
                    files: vec![PathBuf::from(".zprofile")],
                    existing_only: false,
                    body: nix_daemon,
                },
            ]
        }
    }
}

fn hand_over(path: &Path, home: &Path, account: &Account) -> Result<()> {
    let dirs = path
        .ancestors()
        .skip(1)
        .take_while(|dir| dir.starts_with(home) && *dir != home);
    for entry in std::iter::once(path).chain(dirs) {
        account
            .take_ownership(entry)
            .map_err(|source| PatchError::Io {
                source,
                path: entry.to_path_buf(),
            })?;
    }

    Ok(())
}

/// Shell integration error types.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    /// Begin marker without end marker.
    #[error("block {name:?} has no end marker")]
    Unterminated { name: String },

    /// Begin marker without end marker in a file.
    #[error("block {name:?} in {:?} has no end marker, fix or remove it by hand", path.display())]
    UnterminatedIn { name: String, path: PathBuf },

    /// Startup file cannot be read or written.
    #[error("failed to patch {:?}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = PatchError> = std::result::Result<T, E>;
