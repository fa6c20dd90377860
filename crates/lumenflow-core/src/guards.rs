//! Pre-flight guards (C9, spec.md §4.7): drift, divergence, merge-commit
//! presence, conflict probing, empty-merge, and dirty-main checks, each
//! independently recoverable. Grounded on the teacher's `git.rs`
//! preflight checks (dirty-worktree / detached-HEAD guards before a
//! publish) generalised to the larger guard table spec.md names, built
//! on the supplemented [`lumenflow_git::GitAdapter::merge_tree_check`]
//! and [`lumenflow_git::GitAdapter::rev_list_left_right_count`].
//!
//! Every guard here is called from [`crate::worktree::with_micro_worktree`]
//! (the shared protocol every mutating CLI command runs through), so a
//! failure here stops the mutation before anything is merged or pushed.

use lumenflow_git::{GitAdapter, MergeTreeOutcome};
use lumenflow_types::LumenError;

use crate::report::Reporter;

/// Outcome of one guard check: pass, or a recoverable failure with a
/// human-readable reason and whether an auto-rebase was attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardOutcome {
    Pass,
    Failed { reason: String, auto_rebase_attempted: bool },
}

impl GuardOutcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, GuardOutcome::Pass)
    }
}

/// Drift guard: `main` must not be more than `threshold` commits behind
/// `origin/main`.
pub fn drift_guard(git: &dyn GitAdapter, threshold: u64, reporter: &mut dyn Reporter) -> Result<GuardOutcome, LumenError> {
    git.fetch("origin", Some("main"))?;
    let counts = git.rev_list_left_right_count("main", "origin/main")?;
    if counts.right > threshold {
        reporter.warn(&format!("main is {} commits behind origin/main (threshold {threshold})", counts.right));
        return Ok(GuardOutcome::Failed {
            reason: format!("main is {} commits behind origin/main, exceeding drift threshold {threshold}", counts.right),
            auto_rebase_attempted: false,
        });
    }
    Ok(GuardOutcome::Pass)
}

/// Divergence guard: `main` and `origin/main` must not have diverged
/// (both ahead of each other). With `auto_rebase` set, a divergence is
/// resolved by rebasing `main` onto `origin/main` before re-checking.
pub fn divergence_guard(git: &dyn GitAdapter, auto_rebase: bool, reporter: &mut dyn Reporter) -> Result<GuardOutcome, LumenError> {
    git.fetch("origin", Some("main"))?;
    let counts = git.rev_list_left_right_count("main", "origin/main")?;
    if counts.left > 0 && counts.right > 0 {
        if auto_rebase {
            reporter.info("main and origin/main have diverged; auto-rebasing");
            git.rebase("origin/main")?;
            let after = git.rev_list_left_right_count("main", "origin/main")?;
            if after.left > 0 && after.right > 0 {
                return Ok(GuardOutcome::Failed {
                    reason: "main and origin/main still diverged after rebase".into(),
                    auto_rebase_attempted: true,
                });
            }
            return Ok(GuardOutcome::Pass);
        }
        return Ok(GuardOutcome::Failed {
            reason: format!("main and origin/main have diverged ({} local, {} remote commits)", counts.left, counts.right),
            auto_rebase_attempted: false,
        });
    }
    Ok(GuardOutcome::Pass)
}

/// Merge-commits guard: the range between `base` and `head` must be a
/// linear run of commits, with no merge commit in it (spec.md requires
/// the micro-worktree's history to stay fast-forwardable).
pub fn merge_commits_guard(git: &dyn GitAdapter, base: &str, head: &str) -> Result<GuardOutcome, LumenError> {
    let log = git.raw(&["log", "--merges", "--oneline", &format!("{base}..{head}")])?;
    if log.trim().is_empty() {
        Ok(GuardOutcome::Pass)
    } else {
        Ok(GuardOutcome::Failed {
            reason: format!("merge commit(s) found between {base} and {head}:\n{log}"),
            auto_rebase_attempted: false,
        })
    }
}

/// Conflict guard: a dry-run `merge-tree` probe between `base` and
/// `other` must report a clean outcome.
pub fn conflict_guard(git: &dyn GitAdapter, base: &str, other: &str) -> Result<GuardOutcome, LumenError> {
    match git.merge_tree_check(base, other)? {
        MergeTreeOutcome::Clean => Ok(GuardOutcome::Pass),
        MergeTreeOutcome::Conflict => Ok(GuardOutcome::Failed {
            reason: format!("merging {other} into {base} would conflict"),
            auto_rebase_attempted: false,
        }),
        MergeTreeOutcome::Unknown(code) => {
            Ok(GuardOutcome::Failed {
                reason: format!("merge-tree probe between {base} and {other} exited with unexpected code {code}"),
                auto_rebase_attempted: false,
            })
        }
    }
}

/// Empty-merge guard: `head` must actually contain commits not already
/// on `base`. If `code_paths` is non-empty, the diff between `base` and
/// `head` must additionally touch at least one of them (exact match or a
/// file under that path/glob); a `head` with commits but no matching
/// path change raises, and an empty `code_paths` only warns (spec.md
/// §4.7).
pub fn empty_merge_guard(
    git: &dyn GitAdapter,
    base: &str,
    head: &str,
    code_paths: &[String],
    reporter: &mut dyn Reporter,
) -> Result<GuardOutcome, LumenError> {
    let counts = git.rev_list_left_right_count(base, head)?;
    if counts.right == 0 {
        return Ok(GuardOutcome::Failed {
            reason: format!("{head} has no commits beyond {base}; merge would be empty"),
            auto_rebase_attempted: false,
        });
    }

    if code_paths.is_empty() {
        reporter.warn(&format!("{head} declares no code_paths; skipping the changed-path check"));
        return Ok(GuardOutcome::Pass);
    }

    let diff = git.raw(&["diff", "--name-only", &format!("{base}...{head}")])?;
    let changed: Vec<&str> = diff.lines().collect();
    let matched = code_paths.iter().any(|pattern| changed.iter().any(|file| path_matches(file, pattern)));

    if matched {
        Ok(GuardOutcome::Pass)
    } else {
        Ok(GuardOutcome::Failed {
            reason: format!("none of the declared code_paths {code_paths:?} changed between {base} and {head}"),
            auto_rebase_attempted: false,
        })
    }
}

/// Match a changed file path against a declared `code_paths` entry:
/// exact match, a glob ending in `*` treated as a prefix, or `file`
/// living under `pattern` as a directory.
fn path_matches(file: &str, pattern: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        return file.starts_with(prefix);
    }
    let trimmed = pattern.trim_end_matches('/');
    file == trimmed || file.starts_with(&format!("{trimmed}/"))
}

/// Repo-relative paths exempted from the dirty-main guard (spec.md §4.7):
/// the metadata allow-list (status/backlog/events log), the WU's own
/// YAML, the stamps directory, and the WU's declared `code_paths`
/// (exact, prefix, or reverse-prefix match).
#[derive(Debug, Clone, Default)]
pub struct DirtyMainAllowList {
    pub wu_yaml: Option<String>,
    pub stamps_dir: String,
    pub status_md: String,
    pub backlog_md: String,
    pub events_path: String,
    pub code_paths: Vec<String>,
}

impl DirtyMainAllowList {
    fn allows(&self, path: &str) -> bool {
        if self.wu_yaml.as_deref() == Some(path) {
            return true;
        }
        if path == self.status_md || path == self.backlog_md || path == self.events_path {
            return true;
        }
        let stamps_prefix = self.stamps_dir.trim_end_matches('/');
        if !stamps_prefix.is_empty() && (path == stamps_prefix || path.starts_with(&format!("{stamps_prefix}/"))) {
            return true;
        }
        for code_path in &self.code_paths {
            let cp = code_path.trim_end_matches('/');
            if path == cp || path.starts_with(&format!("{cp}/")) || cp.starts_with(&format!("{path}/")) {
                return true;
            }
        }
        false
    }
}

/// Dirty-main guard: the main checkout's working tree may only carry
/// changes on the allow-list before a micro-worktree operation starts.
/// `force` is the audited `--force` bypass (spec.md §4.7): it still
/// reports every disallowed path, it just doesn't refuse.
pub fn dirty_main_guard(
    git: &dyn GitAdapter,
    allow: &DirtyMainAllowList,
    force: bool,
    reporter: &mut dyn Reporter,
) -> Result<GuardOutcome, LumenError> {
    let status = git.status_porcelain()?;
    let mut offending = Vec::new();
    for line in status.lines() {
        let Some(path) = line.get(3..) else { continue };
        if !allow.allows(path) {
            offending.push(path.to_string());
        }
    }
    if offending.is_empty() {
        return Ok(GuardOutcome::Pass);
    }
    if force {
        reporter.warn(&format!("main checkout has disallowed dirty paths {offending:?}; proceeding because --force was given"));
        return Ok(GuardOutcome::Pass);
    }
    Ok(GuardOutcome::Failed {
        reason: format!("main checkout has uncommitted changes outside the allow-list: {offending:?}"),
        auto_rebase_attempted: false,
    })
}

/// Every tunable the guard suite needs for one micro-worktree operation,
/// bundled so [`crate::worktree::with_micro_worktree`] and
/// [`crate::pipeline::complete_work_unit`] don't have to thread five
/// separate parameters through every call site.
#[derive(Debug, Clone, Default)]
pub struct GuardOptions {
    pub drift_threshold: u64,
    pub auto_rebase: bool,
    pub force_dirty_main: bool,
    pub dirty_main_allow: DirtyMainAllowList,
    pub code_paths: Vec<String>,
}

/// Run the full pre-flight guard suite (spec.md §4.7) against `main` and
/// `branch`. Stops at the first failure; `Ok(None)` means every guard
/// passed.
pub fn run_all(
    git: &dyn GitAdapter,
    branch: &str,
    opts: &GuardOptions,
    reporter: &mut dyn Reporter,
) -> Result<Option<GuardOutcome>, LumenError> {
    for outcome in [
        drift_guard(git, opts.drift_threshold, reporter)?,
        divergence_guard(git, opts.auto_rebase, reporter)?,
        merge_commits_guard(git, "main", branch)?,
        conflict_guard(git, "main", branch)?,
        empty_merge_guard(git, "main", branch, &opts.code_paths, reporter)?,
        dirty_main_guard(git, &opts.dirty_main_allow, opts.force_dirty_main, reporter)?,
    ] {
        if !outcome.is_pass() {
            return Ok(Some(outcome));
        }
    }
    Ok(None)
}
