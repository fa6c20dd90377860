//! Event-sourced WU state store (spec.md §4.2, component C4) plus the
//! stamp-file helpers of spec.md §3.3.
//!
//! The event log is the source of truth for WU status; a YAML `status`
//! field is only ever a materialised cache (spec.md §9). This crate knows
//! nothing about YAML *writing* — it reads `WU-*.yaml` files (via
//! `lumenflow-yaml`) only for the one-time cutover bootstrap.
//!
//! # Example
//!
//! ```
//! use lumenflow_state::{EventLog, stamp_path};
//! use lumenflow_types::{Event, EventKind, WuId};
//! use chrono::Utc;
//! use tempfile::tempdir;
//!
//! let dir = tempdir().unwrap();
//! let log = EventLog::new(dir.path().join("wu-events.jsonl"));
//! log.append(&Event {
//!     kind: EventKind::Claim,
//!     wu_id: WuId::new(1),
//!     timestamp: Utc::now(),
//!     lane: Some("Operations: Tooling".into()),
//!     title: Some("Do the thing".into()),
//!     reason: None,
//!     extra: Default::default(),
//! }).unwrap();
//! assert_eq!(stamp_path(dir.path(), WuId::new(1)).file_name().unwrap(), "WU-1.done");
//! ```

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use lumenflow_types::{Event, EventKind, LumenError, Status, WuId};

/// Default event log file name, relative to the configured state directory.
pub const EVENTS_FILE: &str = "wu-events.jsonl";

/// Idempotency marker written after a successful cutover.
pub const CUTOVER_MARKER: &str = ".delegation-cutover-done";

/// Legacy pre-delegation registry file whose presence triggers cutover.
pub const LEGACY_REGISTRY_FILE: &str = "spawn-registry.jsonl";

pub fn events_path(state_dir: &Path) -> PathBuf {
    state_dir.join(EVENTS_FILE)
}

/// The append-only event log described by spec.md §3.2/§4.2.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

/// Full read of the log: every event in file order, plus the folded
/// per-WU status map (spec.md §4.2 `load()`).
#[derive(Debug, Clone, Default)]
pub struct LoadResult {
    pub events: Vec<Event>,
    pub status: HashMap<WuId, Status>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically append one event. Creates the file and parent directory
    /// on first use. Implemented as read-whole-log, append-in-memory,
    /// write-to-sibling-temp-file, rename-into-place — the same
    /// exclusive-create-then-rename discipline the teacher's state store
    /// uses for its single JSON blob, generalised here to a growing
    /// line-oriented log so a crash mid-write never leaves a torn line.
    pub fn append(&self, event: &Event) -> Result<(), LumenError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| LumenError::Schema {
                message: format!("failed to create {}: {e}", parent.display()),
            })?;
        }

        let mut lines = self.read_raw_lines()?;
        let line = serde_json::to_string(event).map_err(|e| LumenError::Schema {
            message: format!("failed to serialize event for {}: {e}", event.wu_id),
        })?;
        lines.push(line);

        self.write_lines_atomically(&lines)
    }

    fn read_raw_lines(&self) -> Result<Vec<String>, LumenError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(contents
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(|l| l.to_string())
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(LumenError::Schema {
                message: format!("failed to read {}: {e}", self.path.display()),
            }),
        }
    }

    fn write_lines_atomically(&self, lines: &[String]) -> Result<(), LumenError> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let temp_path = parent.join(format!(
            ".{}.tmp",
            self.path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("wu-events.jsonl")
        ));

        let mut contents = lines.join("\n");
        if !lines.is_empty() {
            contents.push('\n');
        }

        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&temp_path)
                .map_err(|e| LumenError::Schema {
                    message: format!("failed to create {}: {e}", temp_path.display()),
                })?;
            file.write_all(contents.as_bytes())
                .map_err(|e| LumenError::Schema {
                    message: format!("failed to write {}: {e}", temp_path.display()),
                })?;
            file.sync_all().ok();
        }

        fs::rename(&temp_path, &self.path).map_err(|e| LumenError::Schema {
            message: format!(
                "failed to rename {} into {}: {e}",
                temp_path.display(),
                self.path.display()
            ),
        })
    }

    /// Parse every line, silently skipping malformed ones (spec.md §3.2
    /// "ignore malformed lines").
    pub fn read_events(&self) -> Result<Vec<Event>, LumenError> {
        Ok(self
            .read_raw_lines()?
            .iter()
            .filter_map(|line| serde_json::from_str::<Event>(line).ok())
            .collect())
    }

    /// Fold all events for one WU id to its current status.
    pub fn status(&self, id: WuId) -> Result<Option<Status>, LumenError> {
        let events = self.read_events()?;
        Ok(fold(&events).get(&id).copied())
    }

    /// Full read: every event plus the folded status map for every WU
    /// mentioned in the log.
    pub fn load(&self) -> Result<LoadResult, LumenError> {
        let events = self.read_events()?;
        let status = fold(&events);
        Ok(LoadResult { events, status })
    }
}

/// Fold events in file order: apply the last state-mutating event per WU
/// (spec.md §3.2 "Fold semantics").
pub fn fold(events: &[Event]) -> HashMap<WuId, Status> {
    let mut status = HashMap::new();
    for event in events {
        let new_status = match event.kind {
            EventKind::Create => Status::Ready,
            EventKind::Claim => Status::InProgress,
            EventKind::Release => Status::Ready,
            EventKind::Complete => Status::Done,
            EventKind::Block => Status::Blocked,
            EventKind::Unblock => Status::InProgress,
        };
        status.insert(event.wu_id, new_status);
    }
    status
}

/// Stamp file path for a WU id (spec.md §3.3).
pub fn stamp_path(stamps_dir: &Path, id: WuId) -> PathBuf {
    stamps_dir.join(format!("{id}.done"))
}

/// Create the zero-byte completion stamp. Idempotent: re-creating an
/// existing stamp truncates it back to empty rather than erroring.
pub fn create_stamp(stamps_dir: &Path, id: WuId) -> Result<(), LumenError> {
    fs::create_dir_all(stamps_dir).map_err(|e| LumenError::Schema {
        message: format!("failed to create {}: {e}", stamps_dir.display()),
    })?;
    let path = stamp_path(stamps_dir, id);
    fs::write(&path, []).map_err(|e| LumenError::Schema {
        message: format!("failed to create stamp {}: {e}", path.display()),
    })
}

pub fn stamp_exists(stamps_dir: &Path, id: WuId) -> bool {
    stamp_path(stamps_dir, id).is_file()
}

/// Every WU id with an existing stamp file, used by the ID allocator and
/// by cutover's bootstrap scan.
pub fn list_stamped_ids(stamps_dir: &Path) -> Result<Vec<WuId>, LumenError> {
    let read_dir = match fs::read_dir(stamps_dir) {
        Ok(rd) => rd,
        Err(_) => return Ok(Vec::new()),
    };
    let mut ids = Vec::new();
    for entry in read_dir {
        let entry = entry.map_err(|e| LumenError::Schema {
            message: format!("failed to read {}: {e}", stamps_dir.display()),
        })?;
        let Some(name) = entry.file_name().to_str().map(|s| s.to_string()) else {
            continue;
        };
        if let Some(rest) = name.strip_prefix("WU-").and_then(|r| r.strip_suffix(".done")) {
            if let Ok(n) = rest.parse::<u64>() {
                ids.push(WuId::new(n));
            }
        }
    }
    ids.sort();
    Ok(ids)
}

/// Record written after a successful cutover (spec.md §6 filesystem layout).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CutoverMarker {
    #[serde(rename = "migratedAt")]
    pub migrated_at: DateTime<Utc>,
    #[serde(rename = "archiveDir")]
    pub archive_dir: String,
    #[serde(rename = "bootstrapEvents")]
    pub bootstrap_events: usize,
}

/// One-time migration from the legacy "spawn" state model to the
/// delegation/event model (spec.md §4.2 `runCutoverIfNeeded`,
/// §8 scenario 5).
///
/// Trigger: a legacy registry file coexists in `state_dir`, or the
/// current event log contains a record whose raw `type` field is
/// `"spawn"` (a kind our own [`EventKind`] does not model, since it is
/// legacy-only). On trigger: archive the current log and legacy registry
/// under `<state_dir>/archive/<prefix-timestamp>/`, then synthesise a
/// fresh log by walking every `WU-*.yaml` in `wu_dir` plus every `.done`
/// stamp in `stamps_dir`, emitting a `claim` and (conditionally) a
/// `block`/`complete` event per WU in timestamp order, and finally
/// writing [`CUTOVER_MARKER`]. Returns `true` if cutover ran.
///
/// Cutover is skipped entirely when `state_dir` is not the canonical
/// configured state directory — that check is the caller's
/// responsibility (it depends on config resolution, out of this crate's
/// scope) — this function only implements the migration mechanics once
/// invoked.
pub fn run_cutover_if_needed(
    state_dir: &Path,
    wu_dir: &Path,
    stamps_dir: &Path,
    now: DateTime<Utc>,
) -> Result<bool, LumenError> {
    let marker_path = state_dir.join(CUTOVER_MARKER);
    if marker_path.exists() {
        return Ok(false);
    }

    let legacy_registry = state_dir.join(LEGACY_REGISTRY_FILE);
    let log = EventLog::new(events_path(state_dir));
    let has_legacy_registry = legacy_registry.is_file();
    let has_spawn_event = raw_lines_contain_spawn_kind(&log.path)?;

    if !has_legacy_registry && !has_spawn_event {
        return Ok(false);
    }

    let timestamp = now.format("%Y%m%dT%H%M%SZ").to_string();
    let archive_dir = state_dir.join("archive").join(format!("delegation-cutover-{timestamp}"));
    fs::create_dir_all(&archive_dir).map_err(|e| LumenError::Recovery {
        message: format!("failed to create archive dir {}: {e}", archive_dir.display()),
    })?;

    if log.path.is_file() {
        fs::rename(&log.path, archive_dir.join(EVENTS_FILE)).map_err(|e| LumenError::Recovery {
            message: format!("failed to archive event log: {e}"),
        })?;
    }
    if has_legacy_registry {
        fs::rename(&legacy_registry, archive_dir.join(LEGACY_REGISTRY_FILE)).map_err(|e| {
            LumenError::Recovery {
                message: format!("failed to archive legacy registry: {e}"),
            }
        })?;
    }

    let bootstrap_events = synthesize_bootstrap_log(&log, wu_dir, stamps_dir, now)?;

    let marker = CutoverMarker {
        migrated_at: now,
        archive_dir: archive_dir.display().to_string(),
        bootstrap_events,
    };
    let marker_json = serde_json::to_string_pretty(&marker).map_err(|e| LumenError::Recovery {
        message: format!("failed to serialize cutover marker: {e}"),
    })?;
    fs::write(&marker_path, marker_json).map_err(|e| LumenError::Recovery {
        message: format!("failed to write cutover marker: {e}"),
    })?;

    Ok(true)
}

fn raw_lines_contain_spawn_kind(path: &Path) -> Result<bool, LumenError> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => {
            return Err(LumenError::Schema {
                message: format!("failed to read {}: {e}", path.display()),
            });
        }
    };
    Ok(contents.lines().any(|line| {
        serde_json::from_str::<serde_json::Value>(line)
            .ok()
            .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(|s| s.to_string()))
            .as_deref()
            == Some("spawn")
    }))
}

/// Walk `WU-*.yaml` plus `.done` stamps and synthesise a fresh log.
fn synthesize_bootstrap_log(
    log: &EventLog,
    wu_dir: &Path,
    stamps_dir: &Path,
    now: DateTime<Utc>,
) -> Result<usize, LumenError> {
    let stamped: std::collections::HashSet<WuId> =
        list_stamped_ids(stamps_dir)?.into_iter().collect();

    let mut bootstrapped = Vec::new();
    for entry in lumenflow_yaml::scan_wu_dir(wu_dir)? {
        let Ok(wu) = entry.result else { continue };
        let created_at = wu.created.unwrap_or(now);

        bootstrapped.push((
            created_at,
            Event {
                kind: EventKind::Claim,
                wu_id: wu.id,
                timestamp: created_at,
                lane: Some(wu.lane.to_string()),
                title: Some(wu.title.clone()),
                reason: None,
                extra: Default::default(),
            },
        ));

        match wu.status.normalize() {
            Status::Done => {
                let completed_at = wu.completed_at.unwrap_or(now);
                bootstrapped.push((
                    completed_at,
                    Event {
                        kind: EventKind::Complete,
                        wu_id: wu.id,
                        timestamp: completed_at,
                        lane: None,
                        title: None,
                        reason: None,
                        extra: Default::default(),
                    },
                ));
            }
            Status::Blocked => {
                bootstrapped.push((
                    created_at,
                    Event {
                        kind: EventKind::Block,
                        wu_id: wu.id,
                        timestamp: created_at,
                        lane: None,
                        title: None,
                        reason: Some("bootstrapped during cutover".into()),
                        extra: Default::default(),
                    },
                ));
            }
            _ if stamped.contains(&wu.id) => {
                bootstrapped.push((
                    created_at,
                    Event {
                        kind: EventKind::Complete,
                        wu_id: wu.id,
                        timestamp: created_at,
                        lane: None,
                        title: None,
                        reason: None,
                        extra: Default::default(),
                    },
                ));
            }
            _ => {}
        }
    }

    bootstrapped.sort_by_key(|(ts, _)| *ts);
    let count = bootstrapped.len();
    for (_, event) in &bootstrapped {
        log.append(event)?;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumenflow_types::{Lane, WuType};
    use tempfile::tempdir;

    fn claim_event(id: u64, ts: DateTime<Utc>) -> Event {
        Event {
            kind: EventKind::Claim,
            wu_id: WuId::new(id),
            timestamp: ts,
            lane: Some("Operations: Tooling".into()),
            title: Some("Do the thing".into()),
            reason: None,
            extra: Default::default(),
        }
    }

    #[test]
    fn append_then_status_returns_in_progress_after_claim() {
        let td = tempdir().unwrap();
        let log = EventLog::new(td.path().join(EVENTS_FILE));
        log.append(&claim_event(1, Utc::now())).unwrap();

        assert_eq!(log.status(WuId::new(1)).unwrap(), Some(Status::InProgress));
    }

    #[test]
    fn append_complete_then_status_returns_done() {
        let td = tempdir().unwrap();
        let log = EventLog::new(td.path().join(EVENTS_FILE));
        let now = Utc::now();
        log.append(&claim_event(1, now)).unwrap();
        log.append(&Event {
            kind: EventKind::Complete,
            wu_id: WuId::new(1),
            timestamp: now,
            lane: None,
            title: None,
            reason: None,
            extra: Default::default(),
        })
        .unwrap();

        assert_eq!(log.status(WuId::new(1)).unwrap(), Some(Status::Done));
    }

    #[test]
    fn fold_ignores_malformed_lines() {
        let td = tempdir().unwrap();
        let path = td.path().join(EVENTS_FILE);
        fs::create_dir_all(td.path()).unwrap();
        fs::write(&path, "not valid json\n{\"type\":\"claim\",\"wuId\":\"WU-2\",\"timestamp\":\"2024-01-01T00:00:00Z\"}\n").unwrap();

        let log = EventLog::new(path);
        let events = log.read_events().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].wu_id, WuId::new(2));
    }

    #[test]
    fn load_returns_full_events_and_status_map() {
        let td = tempdir().unwrap();
        let log = EventLog::new(td.path().join(EVENTS_FILE));
        log.append(&claim_event(1, Utc::now())).unwrap();
        log.append(&claim_event(2, Utc::now())).unwrap();

        let loaded = log.load().unwrap();
        assert_eq!(loaded.events.len(), 2);
        assert_eq!(loaded.status.len(), 2);
    }

    #[test]
    fn stamp_create_exists_round_trip() {
        let td = tempdir().unwrap();
        assert!(!stamp_exists(td.path(), WuId::new(5)));
        create_stamp(td.path(), WuId::new(5)).unwrap();
        assert!(stamp_exists(td.path(), WuId::new(5)));
    }

    #[test]
    fn list_stamped_ids_parses_filenames() {
        let td = tempdir().unwrap();
        create_stamp(td.path(), WuId::new(3)).unwrap();
        create_stamp(td.path(), WuId::new(10)).unwrap();
        std::fs::write(td.path().join("notes.txt"), "x").unwrap();

        let ids = list_stamped_ids(td.path()).unwrap();
        assert_eq!(ids, vec![WuId::new(3), WuId::new(10)]);
    }

    fn sample_wu(id: u64, status: Status) -> lumenflow_types::WorkUnit {
        lumenflow_types::WorkUnit {
            id: WuId::new(id),
            title: "Sample".into(),
            description: "Long enough description for validation purposes.".into(),
            lane: Lane::new("Operations", "Tooling"),
            wu_type: WuType::Engineering,
            status,
            exposure: None,
            priority: None,
            created: Some(Utc::now()),
            claimed_at: None,
            completed_at: if status == Status::Done {
                Some(Utc::now())
            } else {
                None
            },
            completed: None,
            locked: status == Status::Done,
            code_paths: vec![],
            tests: Default::default(),
            acceptance: Default::default(),
            blocks: vec![],
            blocked_by: vec![],
            escalation: Default::default(),
            worktree_path: None,
        }
    }

    #[test]
    fn cutover_triggers_on_legacy_registry_and_bootstraps_from_yaml() {
        let td = tempdir().unwrap();
        let state_dir = td.path().join("state");
        let wu_dir = td.path().join("wu");
        let stamps_dir = td.path().join("stamps");
        fs::create_dir_all(&state_dir).unwrap();
        fs::create_dir_all(&wu_dir).unwrap();
        fs::create_dir_all(&stamps_dir).unwrap();

        fs::write(state_dir.join(LEGACY_REGISTRY_FILE), "{}\n").unwrap();
        lumenflow_yaml::write_wu_file(&wu_dir.join("WU-1.yaml"), &sample_wu(1, Status::Done))
            .unwrap();
        create_stamp(&stamps_dir, WuId::new(1)).unwrap();

        let now = Utc::now();
        let ran = run_cutover_if_needed(&state_dir, &wu_dir, &stamps_dir, now).unwrap();
        assert!(ran);
        assert!(state_dir.join(CUTOVER_MARKER).exists());

        let log = EventLog::new(events_path(&state_dir));
        assert_eq!(log.status(WuId::new(1)).unwrap(), Some(Status::Done));

        // Second invocation is a no-op thanks to the marker.
        let ran_again = run_cutover_if_needed(&state_dir, &wu_dir, &stamps_dir, now).unwrap();
        assert!(!ran_again);
    }

    #[test]
    fn cutover_skipped_without_trigger() {
        let td = tempdir().unwrap();
        let state_dir = td.path().join("state");
        fs::create_dir_all(&state_dir).unwrap();

        let ran = run_cutover_if_needed(&state_dir, td.path(), td.path(), Utc::now()).unwrap();
        assert!(!ran);
        assert!(!state_dir.join(CUTOVER_MARKER).exists());
    }
}
