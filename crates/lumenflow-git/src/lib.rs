//! Narrow, mockable adapter over `git` (spec.md §4.1, component C2).
//!
//! [`GitAdapter`] is the capability surface the rest of LumenFlow depends
//! on instead of shelling out directly. [`CommandGitAdapter`] is the only
//! implementation: it shells to the `git` binary named by the
//! `LUMENFLOW_GIT_BIN` environment variable (default `"git"`), mirroring
//! the teacher's `SHIPPER_GIT_BIN` escape hatch so tests can substitute a
//! fake binary without touching `PATH` globally.
//!
//! Two constructors — [`CommandGitAdapter::for_cwd`] and
//! [`CommandGitAdapter::for_path`] — let the core operate on a worktree
//! without changing the process's current directory (spec.md §4.1).

use std::path::{Path, PathBuf};
use std::process::Command;

use lumenflow_types::LumenError;

fn git_program() -> String {
    std::env::var("LUMENFLOW_GIT_BIN").unwrap_or_else(|_| "git".to_string())
}

/// Result of a `git merge-tree --write-tree` dry-run conflict probe
/// (spec.md §4.7 Conflict guard).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeTreeOutcome {
    /// Exit 0: the merge would succeed cleanly.
    Clean,
    /// Exit 1: the merge would conflict.
    Conflict,
    /// Any other exit status; the guard only warns on this.
    Unknown(i32),
}

/// Left/right commit counts from `rev-list --left-right --count`
/// (spec.md §4.4 drift guard, §4.7 Drift guard).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeftRightCount {
    /// Commits reachable from the left ref only (typically `main`).
    pub left: u64,
    /// Commits reachable from the right ref only (typically the lane branch).
    pub right: u64,
}

/// The capability surface spec.md §4.1 names. All operations are
/// synchronous here (the engine's own "suspension points" are ordinary
/// blocking I/O, per spec.md §5's single-process cooperative model).
pub trait GitAdapter {
    fn fetch(&self, remote: &str, branch: Option<&str>) -> Result<(), LumenError>;
    fn commit_hash(&self, reference: &str) -> Result<String, LumenError>;
    fn rev_list(&self, args: &[&str]) -> Result<String, LumenError>;
    fn raw(&self, args: &[&str]) -> Result<String, LumenError>;
    fn merge_base(&self, a: &str, b: &str) -> Result<String, LumenError>;
    fn list_tree_at_ref(&self, reference: &str, path: &str) -> Result<Vec<String>, LumenError>;
    fn show_file_at_ref(&self, reference: &str, path: &str) -> Result<String, LumenError>;
    fn status_porcelain(&self) -> Result<String, LumenError>;
    fn add(&self, paths: &[&str]) -> Result<(), LumenError>;
    fn commit(&self, message: &str) -> Result<(), LumenError>;
    fn push(&self, remote: &str, branch: &str, flags: &[&str]) -> Result<(), LumenError>;
    fn rebase(&self, onto: &str) -> Result<(), LumenError>;
    fn merge(&self, branch: &str, flags: &[&str]) -> Result<(), LumenError>;
    fn worktree_add(&self, path: &Path, branch: &str, base: &str) -> Result<(), LumenError>;
    fn worktree_remove(&self, path: &Path, force: bool) -> Result<(), LumenError>;
    fn branch_delete(&self, branch: &str, force: bool) -> Result<(), LumenError>;
    fn branch_exists(&self, name: &str) -> Result<bool, LumenError>;
    fn config_get(&self, key: &str) -> Result<Option<String>, LumenError>;

    /// Supplemented per SPEC_FULL.md: a parsed conflict probe, used
    /// directly by the Conflict guard instead of re-parsing exit codes.
    fn merge_tree_check(&self, base: &str, other: &str) -> Result<MergeTreeOutcome, LumenError>;

    /// Supplemented per SPEC_FULL.md: parsed left/right ahead counts,
    /// used directly by the Drift guard.
    fn rev_list_left_right_count(&self, a: &str, b: &str) -> Result<LeftRightCount, LumenError>;

    /// The directory this adapter operates in.
    fn dir(&self) -> &Path;
}

/// `git`-binary-shelling implementation of [`GitAdapter`].
#[derive(Debug, Clone)]
pub struct CommandGitAdapter {
    dir: PathBuf,
    git_bin: String,
}

impl CommandGitAdapter {
    /// Bind to the process's current working directory.
    pub fn for_cwd() -> Self {
        Self::for_path(".")
    }

    /// Bind to an explicit directory (e.g. a micro-worktree path), without
    /// touching the process's cwd.
    pub fn for_path(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            git_bin: git_program(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<std::process::Output, LumenError> {
        Command::new(&self.git_bin)
            .args(args)
            .current_dir(&self.dir)
            .output()
            .map_err(|e| LumenError::Git {
                args: args.iter().map(|s| s.to_string()).collect(),
                stderr: e.to_string(),
                exit_code: None,
            })
    }

    fn run_ok(&self, args: &[&str]) -> Result<String, LumenError> {
        let output = self.run(args)?;
        if !output.status.success() {
            return Err(LumenError::Git {
                args: args.iter().map(|s| s.to_string()).collect(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: output.status.code(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }
}

impl GitAdapter for CommandGitAdapter {
    fn fetch(&self, remote: &str, branch: Option<&str>) -> Result<(), LumenError> {
        let mut args = vec!["fetch", remote];
        if let Some(b) = branch {
            args.push(b);
        }
        self.run_ok(&args).map(|_| ())
    }

    fn commit_hash(&self, reference: &str) -> Result<String, LumenError> {
        self.run_ok(&["rev-parse", reference])
    }

    fn rev_list(&self, args: &[&str]) -> Result<String, LumenError> {
        let mut full = vec!["rev-list"];
        full.extend_from_slice(args);
        self.run_ok(&full)
    }

    fn raw(&self, args: &[&str]) -> Result<String, LumenError> {
        self.run_ok(args)
    }

    fn merge_base(&self, a: &str, b: &str) -> Result<String, LumenError> {
        self.run_ok(&["merge-base", a, b])
    }

    fn list_tree_at_ref(&self, reference: &str, path: &str) -> Result<Vec<String>, LumenError> {
        let out = self.run_ok(&["ls-tree", "-r", "--name-only", reference, "--", path])?;
        Ok(out.lines().map(|l| l.to_string()).filter(|l| !l.is_empty()).collect())
    }

    fn show_file_at_ref(&self, reference: &str, path: &str) -> Result<String, LumenError> {
        self.run_ok(&["show", &format!("{reference}:{path}")])
    }

    fn status_porcelain(&self) -> Result<String, LumenError> {
        self.run_ok(&["status", "--porcelain"])
    }

    fn add(&self, paths: &[&str]) -> Result<(), LumenError> {
        let mut args = vec!["add"];
        args.extend_from_slice(paths);
        self.run_ok(&args).map(|_| ())
    }

    fn commit(&self, message: &str) -> Result<(), LumenError> {
        self.run_ok(&["commit", "-m", message]).map(|_| ())
    }

    fn push(&self, remote: &str, branch: &str, flags: &[&str]) -> Result<(), LumenError> {
        let mut args = vec!["push", remote, branch];
        args.extend_from_slice(flags);
        self.run_ok(&args).map(|_| ())
    }

    fn rebase(&self, onto: &str) -> Result<(), LumenError> {
        self.run_ok(&["rebase", onto]).map(|_| ())
    }

    fn merge(&self, branch: &str, flags: &[&str]) -> Result<(), LumenError> {
        let mut args = vec!["merge"];
        args.extend_from_slice(flags);
        args.push(branch);
        self.run_ok(&args).map(|_| ())
    }

    fn worktree_add(&self, path: &Path, branch: &str, base: &str) -> Result<(), LumenError> {
        let path_str = path.to_string_lossy();
        self.run_ok(&["worktree", "add", "-b", branch, &path_str, base])
            .map(|_| ())
    }

    fn worktree_remove(&self, path: &Path, force: bool) -> Result<(), LumenError> {
        let path_str = path.to_string_lossy();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path_str);
        self.run_ok(&args).map(|_| ())
    }

    fn branch_delete(&self, branch: &str, force: bool) -> Result<(), LumenError> {
        let flag = if force { "-D" } else { "-d" };
        self.run_ok(&["branch", flag, branch]).map(|_| ())
    }

    fn branch_exists(&self, name: &str) -> Result<bool, LumenError> {
        let output = self.run(&["rev-parse", "--verify", "--quiet", name])?;
        Ok(output.status.success())
    }

    fn config_get(&self, key: &str) -> Result<Option<String>, LumenError> {
        let output = self.run(&["config", "--get", key])?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(
            String::from_utf8_lossy(&output.stdout).trim().to_string(),
        ))
    }

    fn merge_tree_check(&self, base: &str, other: &str) -> Result<MergeTreeOutcome, LumenError> {
        let output = self.run(&["merge-tree", "--write-tree", base, other])?;
        match output.status.code() {
            Some(0) => Ok(MergeTreeOutcome::Clean),
            Some(1) => Ok(MergeTreeOutcome::Conflict),
            Some(other) => Ok(MergeTreeOutcome::Unknown(other)),
            None => Err(LumenError::Git {
                args: vec!["merge-tree".into(), "--write-tree".into(), base.into(), other.into()],
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: None,
            }),
        }
    }

    fn rev_list_left_right_count(&self, a: &str, b: &str) -> Result<LeftRightCount, LumenError> {
        let spec = format!("{a}...{b}");
        let out = self.run_ok(&["rev-list", "--left-right", "--count", &spec])?;
        let mut parts = out.split_whitespace();
        let left = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| LumenError::Git {
                args: vec!["rev-list".into(), "--left-right".into(), "--count".into(), spec.clone()],
                stderr: format!("unparseable rev-list output: {out:?}"),
                exit_code: None,
            })?;
        let right = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| LumenError::Git {
                args: vec!["rev-list".into(), "--left-right".into(), "--count".into(), spec],
                stderr: format!("unparseable rev-list output: {out:?}"),
                exit_code: None,
            })?;
        Ok(LeftRightCount { left, right })
    }

    fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn init_repo(dir: &Path) {
        let run = |args: &[&str]| {
            Command::new("git")
                .args(args)
                .current_dir(dir)
                .output()
                .expect("git command");
        };
        run(&["init", "-q", "-b", "main"]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "Test User"]);
    }

    fn commit_file(dir: &Path, name: &str, contents: &str, message: &str) {
        std::fs::write(dir.join(name), contents).expect("write file");
        Command::new("git")
            .args(["add", name])
            .current_dir(dir)
            .output()
            .expect("git add");
        Command::new("git")
            .args(["commit", "-m", message])
            .current_dir(dir)
            .output()
            .expect("git commit");
    }

    #[test]
    fn commit_hash_round_trips_through_rev_parse() {
        let td = tempdir().unwrap();
        init_repo(td.path());
        commit_file(td.path(), "a.txt", "hello", "initial");

        let adapter = CommandGitAdapter::for_path(td.path());
        let hash = adapter.commit_hash("HEAD").unwrap();
        assert_eq!(hash.len(), 40);
    }

    #[test]
    fn status_porcelain_reports_untracked_file() {
        let td = tempdir().unwrap();
        init_repo(td.path());
        commit_file(td.path(), "a.txt", "hello", "initial");
        std::fs::write(td.path().join("b.txt"), "new").unwrap();

        let adapter = CommandGitAdapter::for_path(td.path());
        let status = adapter.status_porcelain().unwrap();
        assert!(status.contains("b.txt"));
    }

    #[test]
    fn branch_exists_false_for_unknown_ref() {
        let td = tempdir().unwrap();
        init_repo(td.path());
        commit_file(td.path(), "a.txt", "hello", "initial");

        let adapter = CommandGitAdapter::for_path(td.path());
        assert!(!adapter.branch_exists("does-not-exist").unwrap());
        assert!(adapter.branch_exists("main").unwrap());
    }

    #[test]
    fn worktree_add_and_remove_round_trip() {
        let td = tempdir().unwrap();
        init_repo(td.path());
        commit_file(td.path(), "a.txt", "hello", "initial");

        let adapter = CommandGitAdapter::for_path(td.path());
        let wt_path = td.path().join("wt");
        adapter.worktree_add(&wt_path, "tmp/test-1", "main").unwrap();
        assert!(wt_path.join("a.txt").exists());

        adapter.worktree_remove(&wt_path, true).unwrap();
        assert!(!wt_path.exists());
    }

    #[test]
    fn merge_tree_check_reports_clean_when_no_divergence() {
        let td = tempdir().unwrap();
        init_repo(td.path());
        commit_file(td.path(), "a.txt", "hello", "initial");

        let adapter = CommandGitAdapter::for_path(td.path());
        let outcome = adapter.merge_tree_check("main", "main").unwrap();
        assert_eq!(outcome, MergeTreeOutcome::Clean);
    }

    #[test]
    fn rev_list_left_right_count_on_identical_refs_is_zero() {
        let td = tempdir().unwrap();
        init_repo(td.path());
        commit_file(td.path(), "a.txt", "hello", "initial");

        let adapter = CommandGitAdapter::for_path(td.path());
        let counts = adapter.rev_list_left_right_count("main", "main").unwrap();
        assert_eq!(counts, LeftRightCount { left: 0, right: 0 });
    }

    #[test]
    fn config_get_returns_none_for_missing_key() {
        let td = tempdir().unwrap();
        init_repo(td.path());

        let adapter = CommandGitAdapter::for_path(td.path());
        assert_eq!(adapter.config_get("lumenflow.does-not-exist").unwrap(), None);
    }

    #[test]
    fn unknown_git_binary_surfaces_as_git_error() {
        temp_env::with_var("LUMENFLOW_GIT_BIN", Some("lumenflow-git-binary-that-does-not-exist"), || {
            let td = tempdir().unwrap();

            let adapter = CommandGitAdapter::for_path(td.path());
            let err = adapter.commit_hash("HEAD").unwrap_err();
            match err {
                LumenError::Git { exit_code, .. } => assert_eq!(exit_code, None),
                other => panic!("expected LumenError::Git, got {other:?}"),
            }
        });
    }

    #[test]
    fn commit_hash_on_non_repo_is_git_error_with_exit_code() {
        let td = tempdir().unwrap();
        let adapter = CommandGitAdapter::for_path(td.path());
        let err = adapter.commit_hash("HEAD").unwrap_err();
        match err {
            LumenError::Git { exit_code, .. } => assert!(exit_code.is_some()),
            other => panic!("expected LumenError::Git, got {other:?}"),
        }
    }
}
