//! Work-domain classification, post-mutation validation, and
//! duplicate-id repair (C11). Grounded on the teacher's changeset
//! classifier in `shipper/src/cargo.rs` (weighted signals deciding
//! whether a change is a patch/minor/major bump), generalised from
//! version-bump classes to spec.md's `frontend`/`backend`/`infra`/`docs`
//! work-domain taxonomy.

use std::collections::HashMap;
use std::path::Path;

use lumenflow_types::{LumenError, WorkUnit, WuId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Domain {
    Backend,
    Frontend,
    Infra,
    Docs,
    Mixed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub domain: Domain,
    pub confidence: f64,
    pub smoke_test_hint: bool,
}

const CODE_PATH_WEIGHT: f64 = 1.0;
const LANE_HINT_WEIGHT: f64 = 0.6;
const TYPE_WEIGHT: f64 = 0.3;
const DESCRIPTION_KEYWORD_WEIGHT: f64 = 0.2;
const UI_SMOKE_TEST_THRESHOLD: f64 = 0.5;

/// Classify a WU's primary work domain from weighted signals: code-path
/// globs score highest, then lane hints, then WU type, then description
/// keywords. Signals for the same domain take the `max` of their
/// weights rather than summing (spec.md's "strongest single signal
/// wins" rule) so a WU with five backend-ish keywords doesn't outrank
/// one with a single unambiguous code path. When two or more domains
/// each have a code-path signal, the result *is* [`Domain::Mixed`]
/// rather than whichever of those domains happened to score highest.
/// `Frontend`'s own signal strength at or above
/// [`UI_SMOKE_TEST_THRESHOLD`] confidence emits a smoke-test hint, even
/// when the overall domain resolves to `Mixed`.
pub fn classify(wu: &WorkUnit) -> Classification {
    let mut scores: HashMap<Domain, f64> = HashMap::new();
    let mut code_path_domains: HashMap<Domain, bool> = HashMap::new();

    for path in &wu.code_paths {
        if let Some(domain) = domain_from_code_path(path) {
            bump(&mut scores, domain, CODE_PATH_WEIGHT);
            code_path_domains.insert(domain, true);
        }
    }

    if let Some(domain) = domain_from_lane(&wu.lane.parent) {
        bump(&mut scores, domain, LANE_HINT_WEIGHT);
    }

    if let Some(domain) = domain_from_type(wu.wu_type) {
        bump(&mut scores, domain, TYPE_WEIGHT);
    }

    for domain in domains_from_keywords(&wu.description) {
        bump(&mut scores, domain, DESCRIPTION_KEYWORD_WEIGHT);
    }

    let (leading_domain, confidence) = scores
        .iter()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap().then(b.0.cmp(a.0)))
        .map(|(d, s)| (*d, *s))
        .unwrap_or((Domain::Backend, 0.0));

    let smoke_test_hint = scores.get(&Domain::Frontend).copied().unwrap_or(0.0) >= UI_SMOKE_TEST_THRESHOLD;
    let domain = if code_path_domains.len() >= 2 { Domain::Mixed } else { leading_domain };

    Classification { domain, confidence, smoke_test_hint }
}

fn bump(scores: &mut HashMap<Domain, f64>, domain: Domain, weight: f64) {
    let entry = scores.entry(domain).or_insert(0.0);
    if weight > *entry {
        *entry = weight;
    }
}

fn domain_from_code_path(path: &str) -> Option<Domain> {
    let p = path.to_ascii_lowercase();
    if p.contains("frontend") || p.contains("/ui/") || p.ends_with(".tsx") || p.ends_with(".jsx") || p.ends_with(".css") {
        Some(Domain::Frontend)
    } else if p.contains("infra") || p.contains("terraform") || p.contains("deploy") || p.contains(".tf") {
        Some(Domain::Infra)
    } else if p.contains("docs/") || p.ends_with(".md") {
        Some(Domain::Docs)
    } else if p.ends_with(".rs") || p.contains("backend") || p.contains("server") {
        Some(Domain::Backend)
    } else {
        None
    }
}

fn domain_from_lane(lane_parent: &str) -> Option<Domain> {
    let l = lane_parent.to_ascii_lowercase();
    if l.contains("frontend") || l.contains("ux") {
        Some(Domain::Frontend)
    } else if l.contains("infra") || l.contains("operations") || l.contains("platform") {
        Some(Domain::Infra)
    } else if l.contains("docs") || l.contains("documentation") {
        Some(Domain::Docs)
    } else if l.contains("backend") || l.contains("engineering") {
        Some(Domain::Backend)
    } else {
        None
    }
}

fn domain_from_type(wu_type: lumenflow_types::WuType) -> Option<Domain> {
    use lumenflow_types::WuType;
    match wu_type {
        WuType::Documentation => Some(Domain::Docs),
        WuType::Engineering | WuType::Bug | WuType::Refactor => Some(Domain::Backend),
        WuType::Process => None,
    }
}

fn domains_from_keywords(description: &str) -> Vec<Domain> {
    let d = description.to_ascii_lowercase();
    let mut found = Vec::new();
    if d.contains("ui") || d.contains("component") || d.contains("button") || d.contains("screen") {
        found.push(Domain::Frontend);
    }
    if d.contains("deploy") || d.contains("infrastructure") || d.contains("pipeline") {
        found.push(Domain::Infra);
    }
    if d.contains("document") || d.contains("readme") {
        found.push(Domain::Docs);
    }
    if d.contains("api") || d.contains("database") || d.contains("server") {
        found.push(Domain::Backend);
    }
    found
}

/// Re-read a WU's YAML and re-fold the event log after a mutation,
/// confirming the done-state invariant (I2) still holds when the WU is
/// marked done. Used as a post-mutation sanity check by the completion
/// pipeline and by tests.
pub fn validate_post_mutation(wu_path: &Path, events_path: &Path, id: WuId) -> Result<(), LumenError> {
    let wu = lumenflow_yaml::read_wu_file(wu_path)?;
    let log = lumenflow_state::EventLog::new(events_path);
    let folded = log.status(id)?;

    if wu.status.normalize() == lumenflow_types::Status::Done {
        if !wu.satisfies_done_field_invariant() {
            return Err(LumenError::Validation {
                message: format!("{id} is marked done but its YAML fields don't satisfy the done-state invariant"),
            });
        }
        if folded != Some(lumenflow_types::Status::Done) {
            return Err(LumenError::Validation {
                message: format!(
                    "{id}'s YAML says done but the event log folds to {folded:?}; status and log have diverged"
                ),
            });
        }
    }
    Ok(())
}

/// One duplicate-id finding: more than one file in `wu_dir` claims the
/// same WU id.
#[derive(Debug, Clone)]
pub struct DuplicateGroup {
    pub id: WuId,
    pub canonical_path: std::path::PathBuf,
    pub duplicate_paths: Vec<std::path::PathBuf>,
}

/// Find every id claimed by more than one file. The canonical file is
/// the one whose path matches the expected `WU-<id>.yaml` name exactly;
/// all others are duplicates to repair.
pub fn find_duplicate_ids(wu_dir: &Path) -> Result<Vec<DuplicateGroup>, LumenError> {
    let mut by_id: HashMap<WuId, Vec<std::path::PathBuf>> = HashMap::new();
    for entry in lumenflow_yaml::scan_wu_dir(wu_dir)? {
        if let Ok(wu) = entry.result {
            by_id.entry(wu.id).or_default().push(entry.path);
        }
    }

    let mut groups = Vec::new();
    for (id, mut paths) in by_id {
        if paths.len() < 2 {
            continue;
        }
        paths.sort();
        let canonical_name = lumenflow_yaml::file_name_for(id);
        let canonical_index = paths
            .iter()
            .position(|p| p.file_name().and_then(|n| n.to_str()) == Some(canonical_name.as_str()))
            .unwrap_or(0);
        let canonical_path = paths.remove(canonical_index);
        groups.push(DuplicateGroup { id, canonical_path, duplicate_paths: paths });
    }
    groups.sort_by_key(|g| g.id);
    Ok(groups)
}

/// Repair one duplicate group by remapping every duplicate file to a
/// fresh id (`max known id + 1`, advancing for each duplicate in turn),
/// rewriting the file's own `id` field, its stamp file, and any matching
/// `wuId` entries in the event log. In `dry_run` mode, nothing is
/// written; the planned remap is returned for the caller to print.
pub fn repair_duplicate(
    group: &DuplicateGroup,
    mut next_id: WuId,
    stamps_dir: &Path,
    events_path: &Path,
    dry_run: bool,
) -> Result<Vec<(WuId, WuId)>, LumenError> {
    let mut remaps = Vec::new();

    for dup_path in &group.duplicate_paths {
        let mut wu = lumenflow_yaml::read_wu_file(dup_path)?;
        let old_id = wu.id;
        let new_id = next_id;
        next_id = WuId::new(next_id.0 + 1);

        if dry_run {
            remaps.push((old_id, new_id));
            continue;
        }

        wu.id = new_id;
        lumenflow_yaml::write_wu_file(dup_path, &wu)?;

        let new_path = dup_path
            .parent()
            .map(|p| p.join(lumenflow_yaml::file_name_for(new_id)))
            .unwrap_or_else(|| std::path::PathBuf::from(lumenflow_yaml::file_name_for(new_id)));
        if new_path != *dup_path {
            std::fs::rename(dup_path, &new_path).map_err(|e| LumenError::Recovery {
                message: format!("failed to rename {} to {}: {e}", dup_path.display(), new_path.display()),
            })?;
        }

        if lumenflow_state::stamp_exists(stamps_dir, old_id) {
            let old_stamp = lumenflow_state::stamp_path(stamps_dir, old_id);
            let new_stamp = lumenflow_state::stamp_path(stamps_dir, new_id);
            std::fs::rename(&old_stamp, &new_stamp).map_err(|e| LumenError::Recovery {
                message: format!("failed to rename stamp for {old_id} to {new_id}: {e}"),
            })?;
        }

        rewrite_event_log_ids(events_path, old_id, new_id)?;
        remaps.push((old_id, new_id));
    }

    Ok(remaps)
}

fn rewrite_event_log_ids(events_path: &Path, old_id: WuId, new_id: WuId) -> Result<(), LumenError> {
    let log = lumenflow_state::EventLog::new(events_path);
    let mut events = log.read_events()?;
    let mut changed = false;
    for event in &mut events {
        if event.wu_id == old_id {
            event.wu_id = new_id;
            changed = true;
        }
    }
    if !changed {
        return Ok(());
    }

    std::fs::write(events_path, String::new()).ok();
    for event in &events {
        log.append(event)?;
    }
    Ok(())
}
