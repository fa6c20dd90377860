//! The completion pipeline (C10, spec.md §4.9): `validating ->
//! preparing -> committing -> merging -> finalizing`, plus zombie
//! detection/recovery and escalation resolution (§4.10). Grounded on the
//! teacher's `publish.rs` orchestration (validate manifest, stage,
//! commit, push, finalize registry state) with the WU-specific
//! validations and the zombie-worktree recovery step layered on top.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use lumenflow_git::GitAdapter;
use lumenflow_types::{Event, EventKind, LumenError, Status, WorkUnit, WuId};

use crate::config::Config;
use crate::report::Reporter;
use crate::worktree::with_micro_worktree;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validating,
    Preparing,
    Committing,
    Merging,
    Finalizing,
}

fn relative_to_repo(repo_root: &Path, path: &Path) -> PathBuf {
    path.strip_prefix(repo_root).map(Path::to_path_buf).unwrap_or_else(|_| path.to_path_buf())
}

/// Run the full completion pipeline for one WU. Each named stage reports
/// through `reporter` so CLI output narrates progress the way spec.md
/// §4.9 describes it.
pub fn complete_work_unit(
    cfg: &Config,
    git: &dyn GitAdapter,
    id: WuId,
    now: DateTime<Utc>,
    force: bool,
    reporter: &mut dyn Reporter,
) -> Result<WorkUnit, LumenError> {
    reporter.info(&format!("[{id}] validating"));
    for zombie in detect_zombies(&cfg.wu_dir)? {
        reporter.warn(&format!("found zombie worktree for {} at {}; recovering before continuing", zombie.id, zombie.worktree_path.display()));
        recover_zombie(&zombie, reporter)?;
    }

    let wu_path = cfg.wu_dir.join(lumenflow_yaml::file_name_for(id));
    let wu = lumenflow_yaml::read_wu_file(&wu_path)?;
    validate_completable(&wu, cfg.min_description_length)?;

    reporter.info(&format!("[{id}] preparing"));
    let mut updated = wu.clone();
    updated.status = Status::Done;
    updated.locked = true;
    updated.completed_at = Some(now);
    updated.completed = Some(now.date_naive());

    let event = Event {
        kind: EventKind::Complete,
        wu_id: id,
        timestamp: now,
        lane: None,
        title: None,
        reason: None,
        extra: Default::default(),
    };

    let wu_rel = relative_to_repo(&cfg.repo_root, &wu_path);
    let events_rel = relative_to_repo(&cfg.repo_root, &cfg.events_path());

    reporter.info(&format!("[{id}] committing"));
    let outcome = with_micro_worktree(
        git,
        &cfg.worktrees_dir,
        "complete",
        id.0,
        now,
        &format!("Complete {id}"),
        &[wu_rel.clone(), events_rel.clone()],
        &cfg.guard_options(Some(&wu_path), &wu.code_paths, force),
        reporter,
        |wt_git| {
            let wt_wu_path = wt_git.dir().join(&wu_rel);
            lumenflow_yaml::write_wu_file(&wt_wu_path, &updated)?;

            let wt_events_path = wt_git.dir().join(&events_rel);
            let log = lumenflow_state::EventLog::new(wt_events_path);
            log.append(&event)?;

            Ok(())
        },
    )?;
    reporter.info(&format!("[{id}] merged as {}", &outcome.commit_hash[..12.min(outcome.commit_hash.len())]));

    reporter.info(&format!("[{id}] finalizing"));
    crate::classify::validate_post_mutation(&wu_path, &cfg.events_path(), id)?;
    lumenflow_state::create_stamp(&cfg.stamps_dir, id)?;

    if let Some(worktree_path) = &updated.worktree_path {
        cleanup_zombie_worktree(Path::new(worktree_path), id, reporter);
    }

    Ok(updated)
}

fn validate_completable(wu: &WorkUnit, min_description_length: usize) -> Result<(), LumenError> {
    if wu.status.normalize() != Status::InProgress {
        return Err(LumenError::Validation {
            message: format!("{} is not in_progress (currently {:?}); cannot complete", wu.id, wu.status),
        });
    }
    if wu.escalation.is_unresolved() {
        return Err(LumenError::Validation {
            message: format!("{} has an unresolved escalation; resolve it before completing", wu.id),
        });
    }
    if wu.description.len() < min_description_length {
        return Err(LumenError::Validation {
            message: format!(
                "{} description is {} characters, below the minimum of {min_description_length}",
                wu.id,
                wu.description.len()
            ),
        });
    }
    if !wu.wu_type.exempt_from_code_and_test_requirements() {
        if wu.code_paths.is_empty() {
            return Err(LumenError::Validation {
                message: format!("{} declares no code_paths and is not an exempt WU type", wu.id),
            });
        }
        if !wu.tests.has_automated() {
            return Err(LumenError::Validation {
                message: format!("{} declares no automated tests and is not an exempt WU type", wu.id),
            });
        }
    }
    if wu.acceptance.is_empty() {
        return Err(LumenError::Validation {
            message: format!("{} has no acceptance criteria", wu.id),
        });
    }
    Ok(())
}

/// Best-effort removal of a completed WU's dev worktree directory. A
/// failure here is reported, not propagated: the completion itself has
/// already merged and pushed successfully.
fn cleanup_zombie_worktree(worktree_path: &Path, id: WuId, reporter: &mut dyn Reporter) {
    if !worktree_path.exists() {
        return;
    }
    match std::fs::remove_dir_all(worktree_path) {
        Ok(()) => reporter.info(&format!("[{id}] removed completed work unit's worktree {}", worktree_path.display())),
        Err(e) => reporter.warn(&format!(
            "[{id}] worktree {} still exists after completion and could not be removed automatically: {e}",
            worktree_path.display()
        )),
    }
}

/// A zombie: a WU whose YAML says `done` but whose declared
/// `worktree_path` still exists on disk (spec.md §4.9 zombie detection).
#[derive(Debug, Clone)]
pub struct Zombie {
    pub id: WuId,
    pub worktree_path: PathBuf,
}

/// Scan every WU for the zombie condition, without mutating anything.
pub fn detect_zombies(wu_dir: &Path) -> Result<Vec<Zombie>, LumenError> {
    let mut zombies = Vec::new();
    for entry in lumenflow_yaml::scan_wu_dir(wu_dir)? {
        let Ok(wu) = entry.result else { continue };
        if wu.status.normalize() != Status::Done {
            continue;
        }
        if let Some(path) = &wu.worktree_path {
            let path = PathBuf::from(path);
            if path.exists() {
                zombies.push(Zombie { id: wu.id, worktree_path: path });
            }
        }
    }
    Ok(zombies)
}

/// Remove a zombie worktree directory found by [`detect_zombies`].
pub fn recover_zombie(zombie: &Zombie, reporter: &mut dyn Reporter) -> Result<(), LumenError> {
    std::fs::remove_dir_all(&zombie.worktree_path).map_err(|e| LumenError::Recovery {
        message: format!(
            "failed to remove zombie worktree {} for {}: {e}",
            zombie.worktree_path.display(),
            zombie.id
        ),
    })?;
    reporter.info(&format!("recovered zombie worktree for {}", zombie.id));
    Ok(())
}

/// Resolve an unresolved escalation on a WU (spec.md §4.10). Refuses if
/// there is no unresolved escalation to resolve (duplicate-resolution
/// guard).
pub fn resolve_escalation(
    cfg: &Config,
    git: &dyn GitAdapter,
    id: WuId,
    resolver_email: &str,
    now: DateTime<Utc>,
    force: bool,
    reporter: &mut dyn Reporter,
) -> Result<WorkUnit, LumenError> {
    let wu_path = cfg.wu_dir.join(lumenflow_yaml::file_name_for(id));
    let wu = lumenflow_yaml::read_wu_file(&wu_path)?;

    if !wu.escalation.is_unresolved() {
        return Err(LumenError::Validation {
            message: format!("{} has no unresolved escalation to resolve", wu.id),
        });
    }

    let mut updated = wu.clone();
    updated.escalation.escalation_resolved_by = Some(resolver_email.to_string());
    updated.escalation.escalation_resolved_at = Some(now);

    let wu_rel = relative_to_repo(&cfg.repo_root, &wu_path);
    let outcome = with_micro_worktree(
        git,
        &cfg.worktrees_dir,
        "resolve-escalation",
        id.0,
        now,
        &format!("Resolve escalation on {id}"),
        &[wu_rel.clone()],
        &cfg.guard_options(Some(&wu_path), &wu.code_paths, force),
        reporter,
        |wt_git| {
            let wt_wu_path = wt_git.dir().join(&wu_rel);
            lumenflow_yaml::write_wu_file(&wt_wu_path, &updated)?;
            Ok(())
        },
    )?;
    reporter.info(&format!("[{id}] escalation resolved in {}", &outcome.commit_hash[..12.min(outcome.commit_hash.len())]));

    Ok(updated)
}
