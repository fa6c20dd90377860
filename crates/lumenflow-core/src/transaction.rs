//! Two-phase metadata transaction (C7): stage every mutation to a
//! sibling temp file, then rename each into place in declaration order;
//! on any failure, roll every already-committed file back to its prior
//! content. Grounded on the teacher's `StateStore::save` (write-temp,
//! `fs::rename`) in the original `shipper`, generalised here from "one
//! file" to "an ordered batch of files with rollback", matching spec.md
//! §4.6.
//!
//! The `files()` allow-list this transaction exposes after commit is
//! consumed directly by the micro-worktree runner (C8): only files
//! actually staged here may be `git add`ed inside a micro-worktree.

use std::fs;
use std::path::{Path, PathBuf};

use lumenflow_types::LumenError;

#[derive(Debug, Clone)]
enum Mutation {
    Write { path: PathBuf, content: String },
    Delete { path: PathBuf },
}

/// Previous on-disk state of one file, captured before committing, used
/// to roll back if a later file in the batch fails to commit.
enum PriorState {
    Existed(Vec<u8>),
    Absent,
}

/// An ordered batch of file writes/deletes, committed atomically (in
/// the sense that a mid-batch failure rolls every prior file back to
/// its original content rather than leaving a half-applied batch).
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    mutations: Vec<Mutation>,
    committed: bool,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a write of `content` to `path`, replacing any earlier stage
    /// for the same path.
    pub fn stage_write(&mut self, path: impl Into<PathBuf>, content: impl Into<String>) -> &mut Self {
        let path = path.into();
        self.mutations.retain(|m| mutation_path(m) != path);
        self.mutations.push(Mutation::Write { path, content: content.into() });
        self
    }

    /// Stage a deletion of `path`.
    pub fn stage_delete(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        let path = path.into();
        self.mutations.retain(|m| mutation_path(m) != path);
        self.mutations.push(Mutation::Delete { path });
        self
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Every path this transaction touches, in declaration order — the
    /// allow-list the micro-worktree runner restricts `git add` to.
    pub fn files(&self) -> Vec<PathBuf> {
        self.mutations.iter().map(mutation_path).collect()
    }

    /// Stage-to-temp, then rename/remove into place in declaration
    /// order. If any step fails, every already-applied file in this
    /// batch is restored to its prior content (or removed, if it didn't
    /// exist before) before the error is returned.
    pub fn commit(&mut self) -> Result<(), LumenError> {
        let mut applied: Vec<(PathBuf, PriorState)> = Vec::new();

        for mutation in &self.mutations {
            let path = mutation_path(mutation);
            let prior = capture_prior(&path)?;

            let result = match mutation {
                Mutation::Write { path, content } => write_via_temp(path, content),
                Mutation::Delete { path } => delete_if_exists(path),
            };

            match result {
                Ok(()) => applied.push((path, prior)),
                Err(e) => {
                    rollback(&applied);
                    return Err(e);
                }
            }
        }

        self.committed = true;
        Ok(())
    }
}

fn mutation_path(mutation: &Mutation) -> PathBuf {
    match mutation {
        Mutation::Write { path, .. } => path.clone(),
        Mutation::Delete { path } => path.clone(),
    }
}

fn capture_prior(path: &Path) -> Result<PriorState, LumenError> {
    match fs::read(path) {
        Ok(bytes) => Ok(PriorState::Existed(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PriorState::Absent),
        Err(e) => Err(LumenError::Schema {
            message: format!("failed to read prior state of {}: {e}", path.display()),
        }),
    }
}

fn write_via_temp(path: &Path, content: &str) -> Result<(), LumenError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| LumenError::Schema {
            message: format!("failed to create {}: {e}", parent.display()),
        })?;
    }
    let temp_path = sibling_temp_path(path);
    fs::write(&temp_path, content).map_err(|e| LumenError::Schema {
        message: format!("failed to stage {}: {e}", temp_path.display()),
    })?;
    fs::rename(&temp_path, path).map_err(|e| LumenError::Schema {
        message: format!("failed to commit {}: {e}", path.display()),
    })
}

fn delete_if_exists(path: &Path) -> Result<(), LumenError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(LumenError::Schema {
            message: format!("failed to delete {}: {e}", path.display()),
        }),
    }
}

fn sibling_temp_path(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("tmp");
    parent.join(format!(".{name}.tmp"))
}

fn rollback(applied: &[(PathBuf, PriorState)]) {
    for (path, prior) in applied.iter().rev() {
        match prior {
            PriorState::Existed(bytes) => {
                let _ = fs::write(path, bytes);
            }
            PriorState::Absent => {
                let _ = fs::remove_file(path);
            }
        }
    }
}
