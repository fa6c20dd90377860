//! Schema-validated WU YAML parse/serialize (spec.md §4.3, component C3).
//!
//! Parsing uses `serde_yaml` (a YAML 1.1-superset parser; close enough to
//! the spec's "YAML 1.2 parser" requirement that nothing in §3.1's schema
//! depends on the 1.1/1.2 distinction). Serialization relies on
//! [`WorkUnit`]'s declared field order for stable key ordering — `serde`
//! struct serialization is order-preserving by construction, so no extra
//! bookkeeping is needed to satisfy spec.md's "stable key ordering, trailing
//! newline" requirement.

use std::fs;
use std::path::{Path, PathBuf};

use lumenflow_types::{LumenError, WorkUnit, WuId};

/// Parse one WU record from YAML text.
pub fn parse_wu(contents: &str) -> Result<WorkUnit, LumenError> {
    serde_yaml::from_str(contents).map_err(|e| LumenError::Schema {
        message: format!("invalid WU YAML: {e}"),
    })
}

/// Serialize one WU record to YAML text with stable key order and a
/// trailing newline. Round-trip is guaranteed at the semantic level
/// (spec.md §4.3), not necessarily byte-for-byte against hand-authored
/// YAML.
pub fn serialize_wu(wu: &WorkUnit) -> Result<String, LumenError> {
    let mut out = serde_yaml::to_string(wu).map_err(|e| LumenError::Schema {
        message: format!("failed to serialize WU {}: {e}", wu.id),
    })?;
    if !out.ends_with('\n') {
        out.push('\n');
    }
    Ok(out)
}

/// Read and parse a single `WU-<N>.yaml` file.
pub fn read_wu_file(path: &Path) -> Result<WorkUnit, LumenError> {
    let contents = fs::read_to_string(path).map_err(|_| LumenError::FileNotFound {
        path: path.display().to_string(),
    })?;
    parse_wu(&contents).map_err(|e| match e {
        LumenError::Schema { message } => LumenError::Schema {
            message: format!("{}: {message}", path.display()),
        },
        other => other,
    })
}

/// Serialize and write a single WU file. Callers that need transactional
/// atomicity (spec.md §4.6) stage through a temp file themselves; this
/// function is a direct write, used by the transaction layer's commit
/// phase once the temp file already holds this exact content.
pub fn write_wu_file(path: &Path, wu: &WorkUnit) -> Result<(), LumenError> {
    let content = serialize_wu(wu)?;
    fs::write(path, content).map_err(|e| LumenError::Schema {
        message: format!("failed to write {}: {e}", path.display()),
    })
}

/// The filename a WU with the given id canonically uses.
pub fn file_name_for(id: WuId) -> String {
    format!("{id}.yaml")
}

/// One entry of a directory scan: a WU together with the path it was
/// parsed from, or a parse failure (kept, not propagated, per spec.md
/// §4.5 "invalid files are skipped, non-fatal").
pub struct ScanEntry {
    pub path: PathBuf,
    pub result: Result<WorkUnit, LumenError>,
}

/// Scan a WU directory for files matching `WU-<N>.yaml`, parsing each.
/// Non-matching filenames are ignored outright; matching files that fail
/// to parse are reported as an `Err` entry rather than dropped, so
/// callers (e.g. the duplicate-id repair tool) can still act on them.
pub fn scan_wu_dir(dir: &Path) -> Result<Vec<ScanEntry>, LumenError> {
    let read_dir = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(_) => return Ok(Vec::new()),
    };

    let mut entries = Vec::new();
    for entry in read_dir {
        let entry = entry.map_err(|e| LumenError::Schema {
            message: format!("failed to read directory {}: {e}", dir.display()),
        })?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !is_wu_yaml_name(name) {
            continue;
        }
        let result = read_wu_file(&path);
        entries.push(ScanEntry { path, result });
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

/// True for names matching `^WU-(\d+)\.yaml$`.
pub fn is_wu_yaml_name(name: &str) -> bool {
    parse_wu_yaml_name(name).is_some()
}

/// Parse the numeric suffix from a `WU-<N>.yaml` filename.
pub fn parse_wu_yaml_name(name: &str) -> Option<u64> {
    let rest = name.strip_prefix("WU-")?;
    let digits = rest.strip_suffix(".yaml")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumenflow_types::{Lane, Status, WuType};

    fn sample_wu(id: u64) -> WorkUnit {
        WorkUnit {
            id: WuId::new(id),
            title: "Sample WU".into(),
            description: "A description long enough to be meaningful.".into(),
            lane: Lane::new("Operations", "Tooling"),
            wu_type: WuType::Engineering,
            status: Status::Ready,
            exposure: None,
            priority: Some("p2".into()),
            created: None,
            claimed_at: None,
            completed_at: None,
            completed: None,
            locked: false,
            code_paths: vec!["src/a.rs".into()],
            tests: Default::default(),
            acceptance: Default::default(),
            blocks: vec![],
            blocked_by: vec![],
            escalation: Default::default(),
            worktree_path: None,
        }
    }

    #[test]
    fn parse_serialize_round_trips_fields() {
        let wu = sample_wu(42);
        let yaml = serialize_wu(&wu).unwrap();
        assert!(yaml.ends_with('\n'));

        let parsed = parse_wu(&yaml).unwrap();
        assert_eq!(parsed.id, wu.id);
        assert_eq!(parsed.title, wu.title);
        assert_eq!(parsed.code_paths, wu.code_paths);
        assert_eq!(parsed.priority, wu.priority);
    }

    #[test]
    fn parse_rejects_malformed_yaml_as_schema_error() {
        let err = parse_wu("not: [valid, wu").unwrap_err();
        assert!(matches!(err, LumenError::Schema { .. }));
    }

    #[test]
    fn parse_rejects_missing_required_field() {
        let err = parse_wu("id: WU-1\ntitle: Missing lane and type\n").unwrap_err();
        assert!(matches!(err, LumenError::Schema { .. }));
    }

    #[test]
    fn file_name_for_matches_convention() {
        assert_eq!(file_name_for(WuId::new(7)), "WU-7.yaml");
    }

    #[test]
    fn parse_wu_yaml_name_extracts_numeric_suffix() {
        assert_eq!(parse_wu_yaml_name("WU-12.yaml"), Some(12));
        assert_eq!(parse_wu_yaml_name("WU-0012.yaml"), Some(12));
        assert_eq!(parse_wu_yaml_name("wu-12.yaml"), None);
        assert_eq!(parse_wu_yaml_name("WU-12.yml"), None);
        assert_eq!(parse_wu_yaml_name("README.md"), None);
    }

    #[test]
    fn scan_wu_dir_skips_non_matching_names_and_reports_parse_failures() {
        let td = tempfile::tempdir().unwrap();
        std::fs::write(td.path().join("WU-1.yaml"), serialize_wu(&sample_wu(1)).unwrap())
            .unwrap();
        std::fs::write(td.path().join("WU-2.yaml"), "not: valid: yaml: [").unwrap();
        std::fs::write(td.path().join("notes.md"), "irrelevant").unwrap();

        let entries = scan_wu_dir(td.path()).unwrap();
        assert_eq!(entries.len(), 2);
        let ok_count = entries.iter().filter(|e| e.result.is_ok()).count();
        let err_count = entries.iter().filter(|e| e.result.is_err()).count();
        assert_eq!(ok_count, 1);
        assert_eq!(err_count, 1);
    }

    #[test]
    fn scan_wu_dir_on_missing_directory_returns_empty() {
        let entries = scan_wu_dir(Path::new("/nonexistent/does-not-exist")).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn read_wu_file_missing_is_file_not_found() {
        let err = read_wu_file(Path::new("/nonexistent/WU-1.yaml")).unwrap_err();
        assert!(matches!(err, LumenError::FileNotFound { .. }));
    }

    proptest::proptest! {
        #[test]
        fn code_paths_order_survives_round_trip(paths in proptest::collection::vec("[a-z/]{1,20}", 0..8)) {
            let mut wu = sample_wu(1);
            wu.code_paths = paths.clone();
            let yaml = serialize_wu(&wu).unwrap();
            let parsed = parse_wu(&yaml).unwrap();
            proptest::prop_assert_eq!(parsed.code_paths, paths);
        }
    }
}
