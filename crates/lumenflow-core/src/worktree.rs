//! The micro-worktree protocol (C8, spec.md §4.8): every metadata
//! mutation happens in a transient git worktree on a short-lived
//! `tmp/<operation>-<id>-<timestamp>` branch, fast-forwards into `main`,
//! and is cleaned up on every exit path — success, guard failure, or
//! panic-free error. Grounded on the teacher's release pipeline in
//! `shipper/src/publish.rs` (stage in an isolated checkout, commit, push,
//! clean up), generalised from "one publish" to "any metadata-mutating
//! operation", with the FF-merge and retry-once-after-rebase steps added
//! per spec.md's stronger atomicity requirement.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use lumenflow_git::{CommandGitAdapter, GitAdapter};
use lumenflow_types::LumenError;

use crate::guards::{self, GuardOptions};
use crate::report::Reporter;

/// What `with_micro_worktree` returns alongside the caller's own result.
#[derive(Debug, Clone)]
pub struct WorktreeOutcome<T> {
    pub value: T,
    pub branch: String,
    pub commit_hash: String,
}

/// Run `execute` inside a fresh micro-worktree, commit exactly the files
/// in `allowed_files`, and fast-forward the result into `main`.
///
/// `execute` receives a [`GitAdapter`] bound to the worktree directory
/// and must leave on disk only the files it declared in `allowed_files`
/// (relative to the worktree root); anything else staged is a protocol
/// violation and aborts the operation before any commit is made.
///
/// Steps (spec.md §4.8):
/// 1. Validate the calling process is in the main checkout (not a linked
///    worktree), on branch `main`, and `main` is not behind
///    `origin/main` (refuse if behind).
/// 2. Compute the branch name and worktree path.
/// 3. `git worktree add -b <branch> <path> main`.
/// 4. Run `execute`.
/// 5. Stage only `allowed_files`; refuse if the worktree has other
///    modified/untracked paths.
/// 6. Commit; abort if nothing was staged (empty tree).
/// 7. Run the C9 pre-flight guard suite (drift, divergence, merge-commits,
///    conflict, empty-merge, dirty-main) against `main` and the branch.
/// 8. Fast-forward merge into `main`; on failure, fetch + rebase the
///    branch onto `origin/main` and retry once.
/// 9. Push `main`; on rejection, fetch + rebase and retry once.
/// 10. Remove the worktree and delete the branch, regardless of outcome.
#[allow(clippy::too_many_arguments)]
pub fn with_micro_worktree<T>(
    main_git: &dyn GitAdapter,
    worktrees_dir: &Path,
    operation: &str,
    wu_id: u64,
    now: DateTime<Utc>,
    commit_message: &str,
    allowed_files: &[PathBuf],
    guard_options: &GuardOptions,
    reporter: &mut dyn Reporter,
    execute: impl FnOnce(&dyn GitAdapter) -> Result<T, LumenError>,
) -> Result<WorktreeOutcome<T>, LumenError> {
    validate_preconditions(main_git, reporter)?;

    let branch = format!("tmp/{operation}-{wu_id}-{}", now.format("%Y%m%dT%H%M%SZ"));
    let worktree_path = worktrees_dir.join(&branch.replace('/', "-"));

    main_git.worktree_add(&worktree_path, &branch, "main")?;
    reporter.info(&format!("created micro-worktree {} on {branch}", worktree_path.display()));

    let result = run_in_worktree(
        main_git,
        &worktree_path,
        &branch,
        commit_message,
        allowed_files,
        guard_options,
        reporter,
        execute,
    );

    cleanup(main_git, &worktree_path, &branch, reporter);

    result
}

/// spec.md §4.8 step 1: cwd must be the main checkout (a `.git`
/// directory, not a linked worktree's `.git` file), must be on branch
/// `main`, and must not be behind `origin/main`.
fn validate_preconditions(main_git: &dyn GitAdapter, reporter: &mut dyn Reporter) -> Result<(), LumenError> {
    let git_marker = main_git.dir().join(".git");
    let is_main_checkout = std::fs::symlink_metadata(&git_marker).map(|m| m.is_dir()).unwrap_or(false);
    if !is_main_checkout {
        return Err(LumenError::Validation {
            message: format!(
                "{} is a linked worktree, not the main checkout; refusing to start a micro-worktree operation there",
                main_git.dir().display()
            ),
        });
    }

    let branch = main_git.raw(&["rev-parse", "--abbrev-ref", "HEAD"])?;
    if branch.trim() != "main" {
        return Err(LumenError::Validation {
            message: format!("main checkout is on branch {:?}, not main; refusing to start a micro-worktree operation", branch.trim()),
        });
    }

    match guards::drift_guard(main_git, 0, reporter)? {
        guards::GuardOutcome::Pass => {}
        guards::GuardOutcome::Failed { reason, .. } => {
            return Err(LumenError::Validation { message: reason });
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_in_worktree<T>(
    main_git: &dyn GitAdapter,
    worktree_path: &Path,
    branch: &str,
    commit_message: &str,
    allowed_files: &[PathBuf],
    guard_options: &GuardOptions,
    reporter: &mut dyn Reporter,
    execute: impl FnOnce(&dyn GitAdapter) -> Result<T, LumenError>,
) -> Result<WorktreeOutcome<T>, LumenError> {
    let wt_git = CommandGitAdapter::for_path(worktree_path);

    let value = execute(&wt_git)?;

    refuse_undeclared_changes(&wt_git, allowed_files)?;

    let rel_paths: Vec<String> = allowed_files.iter().map(|p| p.to_string_lossy().into_owned()).collect();
    if rel_paths.is_empty() {
        return Err(LumenError::Validation {
            message: "micro-worktree operation declared no files to commit".into(),
        });
    }
    let rel_refs: Vec<&str> = rel_paths.iter().map(|s| s.as_str()).collect();
    wt_git.add(&rel_refs)?;

    match wt_git.commit(commit_message) {
        Ok(()) => {}
        Err(LumenError::Git { stderr, .. }) if stderr.to_lowercase().contains("nothing to commit") => {
            return Err(LumenError::Validation {
                message: "micro-worktree operation produced no changes to commit".into(),
            });
        }
        Err(e) => return Err(e),
    }

    let commit_hash = wt_git.commit_hash("HEAD")?;

    if let Some(failure) = guards::run_all(main_git, branch, guard_options, reporter)? {
        let guards::GuardOutcome::Failed { reason, .. } = failure else { unreachable!() };
        return Err(LumenError::Validation { message: reason });
    }

    merge_into_main(main_git, &wt_git, branch, reporter)?;
    push_main(main_git, reporter)?;

    Ok(WorktreeOutcome { value, branch: branch.to_string(), commit_hash })
}

fn refuse_undeclared_changes(wt_git: &CommandGitAdapter, allowed_files: &[PathBuf]) -> Result<(), LumenError> {
    let allowed: std::collections::HashSet<String> =
        allowed_files.iter().map(|p| p.to_string_lossy().into_owned()).collect();

    let status = wt_git.status_porcelain()?;
    for line in status.lines() {
        let Some(path) = line.get(3..) else { continue };
        if !allowed.contains(path) {
            return Err(LumenError::Validation {
                message: format!(
                    "micro-worktree operation touched undeclared path {path:?}; only {allowed_files:?} were allowed"
                ),
            });
        }
    }
    Ok(())
}

fn merge_into_main(main_git: &dyn GitAdapter, wt_git: &CommandGitAdapter, branch: &str, reporter: &mut dyn Reporter) -> Result<(), LumenError> {
    match main_git.merge(branch, &["--ff-only"]) {
        Ok(()) => Ok(()),
        Err(first_err) => {
            reporter.warn(&format!("fast-forward merge of {branch} failed, rebasing and retrying once: {first_err}"));
            main_git.fetch("origin", Some("main"))?;
            wt_git.rebase("origin/main")?;
            main_git.merge(branch, &["--ff-only"])
        }
    }
}

fn push_main(main_git: &dyn GitAdapter, reporter: &mut dyn Reporter) -> Result<(), LumenError> {
    match main_git.push("origin", "main", &[]) {
        Ok(()) => Ok(()),
        Err(first_err) => {
            reporter.warn(&format!("push rejected, fetching and rebasing before one retry: {first_err}"));
            main_git.fetch("origin", Some("main"))?;
            main_git.rebase("origin/main")?;
            main_git.push("origin", "main", &[])
        }
    }
}

fn cleanup(main_git: &dyn GitAdapter, worktree_path: &Path, branch: &str, reporter: &mut dyn Reporter) {
    if let Err(e) = main_git.worktree_remove(worktree_path, true) {
        reporter.warn(&format!("failed to remove micro-worktree {}: {e}", worktree_path.display()));
    }
    if let Err(e) = main_git.branch_delete(branch, true) {
        reporter.warn(&format!("failed to delete branch {branch}: {e}"));
    }
}
