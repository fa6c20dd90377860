//! WU id allocation (C5): max-across-five-sources + 1, offline-aware,
//! remote-failure-tolerant. Grounded on the teacher's version-bump logic
//! in `shipper/src/cargo.rs` (read the highest known version, add one)
//! generalised from a single source to spec.md §4.4's five sources, and
//! on `lumenflow-retry`'s new `PushCollision` policy for the push-race
//! retry loop.

use std::path::Path;

use lumenflow_git::GitAdapter;
use lumenflow_retry::{is_push_collision, RetryExecutor, RetryPolicy};
use lumenflow_types::{LumenError, WuId};

use crate::report::Reporter;

/// The five id sources spec.md §4.4 names, in the order they're consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSource {
    LocalWuDir,
    LocalStamps,
    LocalEventLog,
    RemoteWuDir,
    RemoteEventLog,
}

/// Highest id observed, tagged with which source produced it (diagnostic
/// only; allocation only cares about the max).
#[derive(Debug, Clone, Copy)]
pub struct ObservedMax {
    pub source: IdSource,
    pub id: WuId,
}

/// Compute the next WU id to allocate: the maximum id observed across
/// every reachable source, plus one. Remote sources are best-effort: a
/// git failure (offline, no remote configured, network error) is
/// downgraded to a warning and that source is skipped, rather than
/// failing the whole allocation (spec.md §4.4 "remote-failure-tolerant").
/// When `config.offline` is set, remote sources are skipped outright
/// without attempting the network call.
pub fn allocate(
    git: &dyn GitAdapter,
    wu_dir: &Path,
    stamps_dir: &Path,
    state_dir: &Path,
    offline: bool,
    reporter: &mut dyn Reporter,
) -> Result<WuId, LumenError> {
    let mut observed: Vec<ObservedMax> = Vec::new();

    if let Some(max) = max_local_wu_dir(wu_dir)? {
        observed.push(ObservedMax { source: IdSource::LocalWuDir, id: max });
    }
    if let Some(max) = max_local_stamps(stamps_dir)? {
        observed.push(ObservedMax { source: IdSource::LocalStamps, id: max });
    }
    if let Some(max) = max_local_event_log(state_dir)? {
        observed.push(ObservedMax { source: IdSource::LocalEventLog, id: max });
    }

    if offline {
        reporter.warn("offline mode: skipping remote id sources");
    } else {
        match max_remote_wu_dir(git) {
            Ok(Some(max)) => observed.push(ObservedMax { source: IdSource::RemoteWuDir, id: max }),
            Ok(None) => {}
            Err(e) => reporter.warn(&format!("could not inspect remote work-units: {e}")),
        }
        match max_remote_event_log(git) {
            Ok(Some(max)) => observed.push(ObservedMax { source: IdSource::RemoteEventLog, id: max }),
            Ok(None) => {}
            Err(e) => reporter.warn(&format!("could not inspect remote event log: {e}")),
        }
    }

    let next = observed.iter().map(|o| o.id.0).max().map(|m| m + 1).unwrap_or(1);
    Ok(WuId::new(next))
}

fn max_local_wu_dir(wu_dir: &Path) -> Result<Option<WuId>, LumenError> {
    let mut max = None;
    for entry in lumenflow_yaml::scan_wu_dir(wu_dir)? {
        let id = match &entry.result {
            Ok(wu) => wu.id,
            Err(_) => match entry
                .path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(lumenflow_yaml::parse_wu_yaml_name)
            {
                Some(n) => WuId::new(n),
                None => continue,
            },
        };
        max = Some(max.map_or(id, |m: WuId| m.max(id)));
    }
    Ok(max)
}

fn max_local_stamps(stamps_dir: &Path) -> Result<Option<WuId>, LumenError> {
    Ok(lumenflow_state::list_stamped_ids(stamps_dir)?.into_iter().max())
}

fn max_local_event_log(state_dir: &Path) -> Result<Option<WuId>, LumenError> {
    let log = lumenflow_state::EventLog::new(lumenflow_state::events_path(state_dir));
    Ok(log.read_events()?.into_iter().map(|e| e.wu_id).max())
}

fn max_remote_wu_dir(git: &dyn GitAdapter) -> Result<Option<WuId>, LumenError> {
    git.fetch("origin", Some("main"))?;
    let files = git.list_tree_at_ref("origin/main", "work-units")?;
    Ok(files
        .iter()
        .filter_map(|f| f.rsplit('/').next())
        .filter_map(lumenflow_yaml::parse_wu_yaml_name)
        .map(WuId::new)
        .max())
}

fn max_remote_event_log(git: &dyn GitAdapter) -> Result<Option<WuId>, LumenError> {
    git.fetch("origin", Some("main"))?;
    let contents = match git.show_file_at_ref("origin/main", ".lumenflow/state/wu-events.jsonl") {
        Ok(c) => c,
        Err(_) => return Ok(None),
    };
    let max = contents
        .lines()
        .filter_map(|line| serde_json::from_str::<lumenflow_types::Event>(line).ok())
        .map(|e| e.wu_id)
        .max();
    Ok(max)
}

/// Run `create` under the push-collision retry protocol of spec.md §4.4:
/// allocate an id, attempt the caller's create operation, and on a push
/// collision re-fetch, recompute the id, and retry (up to
/// `RetryPolicy::PushCollision`'s 3 attempts). Any non-collision error is
/// re-thrown immediately without consuming a retry.
pub fn retry_create_on_push_collision<T>(
    mut create: impl FnMut(WuId) -> Result<T, LumenError>,
    mut allocate_id: impl FnMut() -> Result<WuId, LumenError>,
) -> Result<T, LumenError> {
    let executor = RetryExecutor::from_policy(RetryPolicy::PushCollision);
    let max_attempts = executor.max_attempts();

    executor
        .run_if(
            |_attempt| {
                let id = allocate_id()?;
                create(id)
            },
            |e: &LumenError| matches!(e, LumenError::Git { stderr, .. } if is_push_collision(stderr)),
        )
        .map_err(|e| match e {
            LumenError::Git { stderr, .. } if is_push_collision(&stderr) => LumenError::RetryExhausted {
                attempts: max_attempts,
                message: stderr,
            },
            other => other,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumenflow_types::{Event, EventKind};
    use std::cell::RefCell;
    use tempfile::tempdir;

    #[test]
    fn allocate_returns_one_when_every_source_is_empty() {
        let td = tempdir().unwrap();
        let git = lumenflow_git::CommandGitAdapter::for_path(td.path());
        let mut reporter = crate::report::NullReporter;
        let id = allocate(
            &git,
            &td.path().join("wu"),
            &td.path().join("stamps"),
            &td.path().join("state"),
            true,
            &mut reporter,
        )
        .unwrap();
        assert_eq!(id, WuId::new(1));
    }

    #[test]
    fn allocate_takes_max_across_local_sources_plus_one() {
        let td = tempdir().unwrap();
        let wu_dir = td.path().join("wu");
        let stamps_dir = td.path().join("stamps");
        let state_dir = td.path().join("state");
        std::fs::create_dir_all(&wu_dir).unwrap();

        lumenflow_state::create_stamp(&stamps_dir, WuId::new(4)).unwrap();
        let log = lumenflow_state::EventLog::new(lumenflow_state::events_path(&state_dir));
        log.append(&Event {
            kind: EventKind::Claim,
            wu_id: WuId::new(9),
            timestamp: chrono::Utc::now(),
            lane: None,
            title: None,
            reason: None,
            extra: Default::default(),
        })
        .unwrap();

        let git = lumenflow_git::CommandGitAdapter::for_path(td.path());
        let mut reporter = crate::report::NullReporter;
        let id = allocate(&git, &wu_dir, &stamps_dir, &state_dir, true, &mut reporter).unwrap();
        assert_eq!(id, WuId::new(10));
    }

    #[test]
    fn retry_create_on_push_collision_retries_then_succeeds() {
        let attempts = RefCell::new(0);
        let result = retry_create_on_push_collision(
            |id| {
                *attempts.borrow_mut() += 1;
                if *attempts.borrow() < 2 {
                    Err(LumenError::Git {
                        args: vec!["push".into()],
                        stderr: "! [rejected] main -> main (non-fast-forward)".into(),
                        exit_code: Some(1),
                    })
                } else {
                    Ok(id)
                }
            },
            || Ok(WuId::new(5)),
        );
        assert_eq!(result.unwrap(), WuId::new(5));
        assert_eq!(*attempts.borrow(), 2);
    }

    #[test]
    fn retry_create_on_push_collision_does_not_retry_other_git_errors() {
        let attempts = RefCell::new(0);
        let result: Result<(), LumenError> = retry_create_on_push_collision(
            |_id| {
                *attempts.borrow_mut() += 1;
                Err(LumenError::Git {
                    args: vec!["push".into()],
                    stderr: "fatal: authentication failed".into(),
                    exit_code: Some(128),
                })
            },
            || Ok(WuId::new(5)),
        );
        assert!(result.is_err());
        assert_eq!(*attempts.borrow(), 1);
    }

    #[test]
    fn retry_create_on_push_collision_wraps_exhaustion() {
        let result: Result<(), LumenError> = retry_create_on_push_collision(
            |_id| {
                Err(LumenError::Git {
                    args: vec!["push".into()],
                    stderr: "push rejected".into(),
                    exit_code: Some(1),
                })
            },
            || Ok(WuId::new(5)),
        );
        assert!(matches!(result, Err(LumenError::RetryExhausted { attempts: 3, .. })));
    }
}
