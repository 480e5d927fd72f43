// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration repository synchronization.
//!
//! The declarative configuration lives in a git repository that gets
//! checked out at the install directory. An absent checkout is cloned. An
//! existing checkout is fast-forwarded to its upstream branch, unless pull
//! was suppressed.
//!
//! # Local Modifications
//!
//! nixboot never throws away work. A checkout with changes to tracked
//! files is refused outright, listing what changed, and no tracked file
//! gets touched. Untracked files are left alone and do not count as
//! changes, but a fast-forward that would overwrite one of them is refused
//! as well. Neither are diverged histories reconciled: only fast-forwards
//! are performed.
//!
//! # Ownership
//!
//! When root bootstraps on behalf of another account, the checkout belongs
//! to that account. Libgit2 refuses to open repositories owned by someone
//! else, so the caller names the owner it trusts through
//! [`synchronize_trusting`].

use crate::{
    context::{Account, PullMode},
    pipeline::{Idempotence, Session, Step},
};

use auth_git2::{GitAuthenticator, Prompter};
use git2::{
    build::{CheckoutBuilder, RepoBuilder},
    CheckoutNotificationType, Config, ErrorCode, FetchOptions, RemoteCallbacks, Repository,
    Status, StatusOptions,
};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::{Password, Text};
use std::{
    fs::{create_dir_all, metadata, read_dir, symlink_metadata},
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use tracing::{debug, info, instrument};

/// What synchronization did to the checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Checkout was absent and got cloned.
    Cloned,

    /// Checkout already matched upstream.
    UpToDate,

    /// Checkout was fast-forwarded.
    FastForwarded { from: String, to: String },

    /// Checkout exists and pull was suppressed.
    Skipped,
}

/// Step synchronizing configuration repository.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncRepository;

impl Step for SyncRepository {
    fn name(&self) -> &'static str {
        "repository"
    }

    fn idempotence(&self) -> Idempotence {
        Idempotence::RequiresPreconditionCheck
    }

    fn run(&self, session: &mut Session<'_>) -> crate::error::Result<()> {
        let context = session.context;
        let bar = if session.show_progress {
            ProgressBar::new(0)
        } else {
            ProgressBar::hidden()
        };

        let account = context
            .account
            .as_ref()
            .filter(|_| context.acts_for_other_user());
        let outcome = synchronize_trusting(
            &context.repo_url,
            &context.install_dir,
            context.pull,
            account.map(|account| account.uid),
            bar,
        )?;

        // INVARIANT: Anything written as root inside the checkout goes back to its owner.
        if let Some(account) = account {
            if outcome != SyncOutcome::Skipped {
                hand_over(&context.install_dir, &context.home, account)?;
            }
        }

        Ok(())
    }
}

/// Synchronize checkout at path with remote repository at url.
///
/// If credentials are required, the user will be prompted for them. The
/// progress bar will be suspended for user input.
///
/// # Errors
///
/// - Return [`SyncError::NotARepository`] if path exists but is no checkout.
/// - Return [`SyncError::DetachedHead`] if checkout is not on a branch.
/// - Return [`SyncError::Dirty`] if tracked files have local changes.
/// - Return [`SyncError::WouldClobber`] if upstream adds files that exist
///   untracked in the checkout.
/// - Return [`SyncError::Diverged`] if checkout cannot be fast-forwarded.
/// - Return [`SyncError::Git2`] if libgit2 operations fail, e.g., network
///   errors during fetch.
pub fn synchronize(
    url: &str,
    path: impl AsRef<Path>,
    pull: PullMode,
    bar: ProgressBar,
) -> Result<SyncOutcome> {
    synchronize_trusting(url, path, pull, None, bar)
}

/// Synchronize checkout, trusting it when owned by given user id.
///
/// Same as [`synchronize`], except that an existing checkout owned by
/// `owner` is opened even though the current user is someone else.
///
/// # Errors
///
/// See [`synchronize`].
#[instrument(skip(url, path, bar), level = "debug")]
pub fn synchronize_trusting(
    url: &str,
    path: impl AsRef<Path>,
    pull: PullMode,
    owner: Option<u32>,
    bar: ProgressBar,
) -> Result<SyncOutcome> {
    let path = path.as_ref();
    if is_absent(path)? {
        clone(url, path, bar)?;
        return Ok(SyncOutcome::Cloned);
    }

    // INVARIANT: Suppressed pull never opens the repository, it only asks for one.
    if pull == PullMode::NoPull {
        if !path.join(".git").exists() {
            return Err(SyncError::NotARepository {
                path: path.to_path_buf(),
                source: git2::Error::from_str("no .git entry found"),
            });
        }
        info!("pull suppressed, leaving {:?} as is", path.display());
        return Ok(SyncOutcome::Skipped);
    }

    let repository = open_checkout(path, owner)?;
    ensure_clean(&repository, path)?;
    fast_forward(&repository, path, bar)
}

fn open_checkout(path: &Path, owner: Option<u32>) -> Result<Repository> {
    let not_a_repository = |source| SyncError::NotARepository {
        path: path.to_path_buf(),
        source,
    };

    let error = match Repository::open(path) {
        Ok(repository) => return Ok(repository),
        Err(error) => error,
    };
    if error.code() != ErrorCode::Owner {
        return Err(not_a_repository(error));
    }

    let actual = metadata(path)
        .map_err(|source| SyncError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .uid();
    if owner != Some(actual) {
        return Err(SyncError::UntrustedOwner {
            path: path.to_path_buf(),
            uid: actual,
        });
    }

    debug!("trust {:?} owned by uid {actual}", path.display());
    // SAFETY: The run is single-threaded, so no other libgit2 call observes
    // the relaxed owner check between these two calls.
    unsafe { git2::opts::set_verify_owner_validation(false)? };
    let opened = Repository::open(path);
    // SAFETY: Same as above.
    unsafe { git2::opts::set_verify_owner_validation(true)? };

    opened.map_err(not_a_repository)
}

fn is_absent(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(true);
    }

    if !path.is_dir() {
        return Ok(false);
    }

    // INVARIANT: An empty directory is as good as no directory for cloning.
    let mut entries = read_dir(path).map_err(|source| SyncError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(entries.next().is_none())
}

fn clone(url: &str, path: &Path, bar: ProgressBar) -> Result<()> {
    info!("clone {url} into {:?}", path.display());
    if let Some(parent) = path.parent() {
        create_dir_all(parent).map_err(|source| SyncError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let style = ProgressStyle::with_template(
        "{elapsed_precise:.green}  {msg:<50}  [{wide_bar:.yellow/blue}]",
    )?
    .progress_chars("-Cco.");
    bar.set_style(style);
    bar.set_message(url.to_string());
    bar.enable_steady_tick(Duration::from_millis(100));

    let prompter = IndicatifPrompter::new(bar.clone());
    let authenticator = GitAuthenticator::default().set_prompter(prompter);
    let config = Config::open_default()?;

    let mut fo = FetchOptions::new();
    fo.remote_callbacks(remote_callbacks(&authenticator, &config, &bar));
    let result = RepoBuilder::new().fetch_options(fo).clone(url, path);
    bar.finish_and_clear();
    result?;

    Ok(())
}

fn ensure_clean(repository: &Repository, path: &Path) -> Result<()> {
    let mut opts = StatusOptions::new();
    opts.include_untracked(false).include_ignored(false);

    let changed: Vec<PathBuf> = repository
        .statuses(Some(&mut opts))?
        .iter()
        .filter(|entry| entry.status() != Status::CURRENT && !entry.status().is_ignored())
        .filter_map(|entry| entry.path().map(PathBuf::from))
        .collect();
    if !changed.is_empty() {
        return Err(SyncError::Dirty {
            path: path.to_path_buf(),
            changed,
        });
    }

    Ok(())
}

fn fast_forward(repository: &Repository, path: &Path, bar: ProgressBar) -> Result<SyncOutcome> {
    let head = repository.head()?;
    if !head.is_branch() {
        return Err(SyncError::DetachedHead {
            path: path.to_path_buf(),
        });
    }
    let branch = head
        .shorthand()
        .ok_or_else(|| git2::Error::from_str("branch name is not valid UTF-8"))?
        .to_string();
    let refname = format!("refs/heads/{branch}");

    info!("fetch {branch} from origin");
    let prompter = IndicatifPrompter::new(bar.clone());
    let authenticator = GitAuthenticator::default().set_prompter(prompter);
    let config = repository.config()?;
    let mut fo = FetchOptions::new();
    fo.remote_callbacks(remote_callbacks(&authenticator, &config, &bar));
    let mut remote = repository.find_remote("origin")?;
    let fetched = remote.fetch(&[branch.as_str()], Some(&mut fo), None);
    bar.finish_and_clear();
    fetched?;

    let fetch_head = repository.find_reference("FETCH_HEAD")?;
    let upstream = repository.reference_to_annotated_commit(&fetch_head)?;
    let (analysis, _) = repository.merge_analysis(&[&upstream])?;
    if analysis.is_up_to_date() {
        debug!("{branch} is up to date");
        return Ok(SyncOutcome::UpToDate);
    }

    if !analysis.is_fast_forward() {
        return Err(SyncError::Diverged {
            path: path.to_path_buf(),
        });
    }

    let mut reference = repository.find_reference(&refname)?;
    let from = reference
        .target()
        .map(|oid| oid.to_string())
        .unwrap_or_default();
    let to = upstream.id().to_string();
    info!("fast-forward {branch} from {from:.7} to {to:.7}");

    // INVARIANT: Work tree moves first, and only when nothing gets overwritten.
    //   - Branch reference stays put if checkout refuses.
    let target = repository.find_commit(upstream.id())?;
    let mut conflicts = Vec::new();
    let checked_out = {
        let mut builder = CheckoutBuilder::new();
        builder
            .safe()
            .notify_on(CheckoutNotificationType::CONFLICT)
            .notify(|_, conflict, _, _, _| {
                if let Some(conflict) = conflict {
                    conflicts.push(conflict.to_path_buf());
                }
                true
            });
        repository.checkout_tree(target.as_object(), Some(&mut builder))
    };
    match checked_out {
        Ok(()) => {}
        Err(error) if error.code() == ErrorCode::Conflict || !conflicts.is_empty() => {
            return Err(SyncError::WouldClobber {
                path: path.to_path_buf(),
                conflicts,
            });
        }
        Err(error) => return Err(error.into()),
    }

    reference.set_target(upstream.id(), "nixboot: fast-forward")?;
    repository.set_head(&refname)?;

    Ok(SyncOutcome::FastForwarded { from, to })
}

fn remote_callbacks<'a>(
    authenticator: &'a GitAuthenticator,
    config: &'a Config,
    bar: &ProgressBar,
) -> RemoteCallbacks<'a> {
    let bar = bar.clone();
    let mut throttle = Instant::now();
    let mut rc = RemoteCallbacks::new();
    rc.credentials(authenticator.credentials(config));
    rc.transfer_progress(move |progress| {
        if throttle.elapsed() > Duration::from_millis(10) {
            throttle = Instant::now();
            bar.set_length(progress.total_objects() as u64);
            bar.set_position(progress.received_objects() as u64);
        }
        true
    });

    rc
}

// INVARIANT: Only hand over directories nixboot may have created, i.e.,
// everything between home and the checkout, plus the checkout itself.
fn hand_over(path: &Path, home: &Path, account: &Account) -> Result<()> {
    for dir in path
        .ancestors()
        .skip(1)
        .take_while(|dir| dir.starts_with(home) && *dir != home)
    {
        take_ownership(dir, account)?;
    }

    let mut pending = vec![path.to_path_buf()];
    while let Some(entry) = pending.pop() {
        take_ownership(&entry, account)?;
        let metadata = symlink_metadata(&entry).map_err(|source| SyncError::Io {
            path: entry.clone(),
            source,
        })?;
        if metadata.is_dir() {
            let children = read_dir(&entry).map_err(|source| SyncError::Io {
                path: entry.clone(),
                source,
            })?;
            for child in children {
                let child = child.map_err(|source| SyncError::Io {
                    path: entry.clone(),
                    source,
                })?;
                pending.push(child.path());
            }
        }
    }

    Ok(())
}

fn take_ownership(path: &Path, account: &Account) -> Result<()> {
    std::os::unix::fs::lchown(path, Some(account.uid), Some(account.gid)).map_err(|source| {
        SyncError::Io {
            path: path.to_path_buf(),
            source,
        }
    })
}

/// Git2 authentication prompter for progress bar.
#[derive(Debug, Clone)]
pub struct IndicatifPrompter {
    pub(crate) bar: ProgressBar,
}

impl IndicatifPrompter {
    /// Construct new progress bar authenticator.
    pub fn new(bar: ProgressBar) -> Self {
        Self { bar }
    }
}

impl Prompter for IndicatifPrompter {
    #[instrument(skip(self, url, _config), level = "debug")]
    fn prompt_username_password(
        &mut self,
        url: &str,
        _config: &git2::Config,
    ) -> Option<(String, String)> {
        info!("authentication required at {url}");
        self.bar.suspend(|| -> Option<(String, String)> {
            let username = Text::new("username").prompt().ok()?;
            let password = Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()?;
            Some((username, password))
        })
    }

    #[instrument(skip(self, username, url, _config), level = "debug")]
    fn prompt_password(
        &mut self,
        username: &str,
        url: &str,
        _config: &git2::Config,
    ) -> Option<String> {
        info!("authentication required at {url} for user {username}");
        self.bar.suspend(|| {
            Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()
        })
    }

    #[instrument(skip(self, ssh_key_path, _config), level = "debug")]
    fn prompt_ssh_key_passphrase(
        &mut self,
        ssh_key_path: &Path,
        _config: &git2::Config,
    ) -> Option<String> {
        info!(
            "authentication required with ssh key at {}",
            ssh_key_path.display()
        );
        self.bar.suspend(|| {
            Password::new("passphrase")
                .without_confirmation()
                .prompt()
                .ok()
        })
    }
}

fn listing(changed: &[PathBuf]) -> String {
    changed
        .iter()
        .map(|path| format!("\n  {}", path.display()))
        .collect()
}

/// Repository synchronization error types.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Tracked files have local modifications.
    #[error(
        "checkout at {:?} has local changes, commit or stash them first (or pass --no-pull):{}",
        path.display(),
        listing(changed)
    )]
    Dirty { path: PathBuf, changed: Vec<PathBuf> },

    /// Fast-forward would overwrite files that are not tracked locally.
    #[error(
        "fast-forward of {:?} would overwrite untracked files, move them aside first (or pass --no-pull):{}",
        path.display(),
        listing(conflicts)
    )]
    WouldClobber {
        path: PathBuf,
        conflicts: Vec<PathBuf>,
    },

    /// Checkout belongs to an account nixboot does not act for.
    #[error("checkout at {:?} is owned by uid {uid}, refusing to open it", path.display())]
    UntrustedOwner { path: PathBuf, uid: u32 },

    /// Local and upstream histories diverged.
    #[error("checkout at {:?} diverged from origin, cannot fast-forward", path.display())]
    Diverged { path: PathBuf },

    /// Checkout is not on a branch.
    #[error("checkout at {:?} has a detached HEAD", path.display())]
    DetachedHead { path: PathBuf },

    /// Install directory is occupied by something else.
    #[error("{:?} exists but is not a git repository", path.display())]
    NotARepository {
        path: PathBuf,
        #[source]
        source: git2::Error,
    },

    /// Filesystem operation failed.
    #[error("failed to prepare {:?}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Style template cannot be set for progress bars.
    #[error(transparent)]
    ProgressStyle(#[from] indicatif::style::TemplateError),

    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),
}

/// Friendly result alias :3
pub type Result<T, E = SyncError> = std::result::Result<T, E>;
