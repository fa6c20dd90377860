use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};

use lumenflow_core::config::Config;
use lumenflow_core::report::Reporter;
use lumenflow_core::worktree::with_micro_worktree;
use lumenflow_core::{classify, graph::Graph, ids, pipeline};
use lumenflow_git::{CommandGitAdapter, GitAdapter};
use lumenflow_types::{Event, EventKind, LumenError, Status, WuId};

#[derive(Parser, Debug)]
#[command(name = "lumenflow", version)]
#[command(about = "Local, git-backed Work Unit orchestration")]
struct Cli {
    /// Directory to resolve the repo root and config from (default: cwd)
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    /// Bypass the dirty-main guard for disallowed uncommitted changes
    /// (spec.md §4.7), logging an audit warning instead of refusing.
    #[arg(long, global = true)]
    force: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new Work Unit.
    Create {
        #[arg(long)]
        title: String,
        #[arg(long)]
        description: String,
        /// "Parent: Sublane"
        #[arg(long)]
        lane: String,
        #[arg(long, default_value = "engineering")]
        r#type: String,
        #[arg(long = "code-path")]
        code_paths: Vec<String>,
        #[arg(long = "unit-test")]
        unit_tests: Vec<String>,
        #[arg(long = "e2e-test")]
        e2e_tests: Vec<String>,
        #[arg(long)]
        acceptance: Vec<String>,
    },
    /// Claim a Work Unit (ready -> in_progress).
    Claim { id: String },
    /// Release a claimed Work Unit back to ready.
    Release { id: String },
    /// Mark a Work Unit as blocked.
    Block {
        id: String,
        #[arg(long)]
        reason: String,
    },
    /// Clear a Work Unit's blocked status.
    Unblock { id: String },
    /// Run the completion pipeline on a Work Unit.
    Complete { id: String },
    /// Print a Work Unit's current status.
    Status { id: String },
    /// Print dependency-graph analyses.
    Graph {
        #[command(subcommand)]
        view: GraphView,
    },
    /// Find and fix duplicate Work Unit ids.
    Repair {
        #[arg(long)]
        apply: bool,
    },
}

#[derive(Subcommand, Debug)]
enum GraphView {
    /// Topological order of active (non-done) Work Units.
    Order,
    /// The longest dependency chain through active Work Units.
    CriticalPath,
    /// Top Work Units ranked by downstream impact.
    Bottlenecks {
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, message: &str) {
        eprintln!("[info] {message}");
    }
    fn warn(&mut self, message: &str) {
        eprintln!("[warn] {message}");
    }
    fn error(&mut self, message: &str) {
        eprintln!("[error] {message}");
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        if let Some(lumen_err) = e.downcast_ref::<LumenError>() {
            eprintln!("[error] {lumen_err}");
            std::process::exit(lumen_err.exit_code());
        }
        eprintln!("[error] {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let cfg = Config::load(&cli.dir)?;
    lumenflow_state::run_cutover_if_needed(&cfg.state_dir, &cfg.wu_dir, &cfg.stamps_dir, Utc::now())?;

    let mut reporter = CliReporter;
    let git = CommandGitAdapter::for_path(&cfg.repo_root);

    match &cli.cmd {
        Commands::Create { title, description, lane, r#type, code_paths, unit_tests, e2e_tests, acceptance } => {
            cmd_create(&cfg, &git, title, description, lane, r#type, code_paths, unit_tests, e2e_tests, acceptance, cli.force, &mut reporter)
        }
        Commands::Claim { id } => cmd_transition(&cfg, &git, id, "claim", EventKind::Claim, Status::InProgress, cli.force, &mut reporter),
        Commands::Release { id } => cmd_transition(&cfg, &git, id, "release", EventKind::Release, Status::Ready, cli.force, &mut reporter),
        Commands::Unblock { id } => cmd_transition(&cfg, &git, id, "unblock", EventKind::Unblock, Status::InProgress, cli.force, &mut reporter),
        Commands::Block { id, reason } => cmd_block(&cfg, &git, id, reason, cli.force, &mut reporter),
        Commands::Complete { id } => cmd_complete(&cfg, &git, id, cli.force, &mut reporter),
        Commands::Status { id } => cmd_status(&cfg, id),
        Commands::Graph { view } => cmd_graph(&cfg, view),
        Commands::Repair { apply } => cmd_repair(&cfg, *apply),
    }
}

fn parse_id(raw: &str) -> Result<WuId> {
    raw.parse::<WuId>().with_context(|| format!("invalid Work Unit id: {raw}"))
}

fn relative_to_repo(repo_root: &Path, path: &Path) -> PathBuf {
    path.strip_prefix(repo_root).map(Path::to_path_buf).unwrap_or_else(|_| path.to_path_buf())
}

#[allow(clippy::too_many_arguments)]
fn cmd_create(
    cfg: &Config,
    git: &dyn GitAdapter,
    title: &str,
    description: &str,
    lane: &str,
    wu_type: &str,
    code_paths: &[String],
    unit_tests: &[String],
    e2e_tests: &[String],
    acceptance: &[String],
    force: bool,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    let lane = lumenflow_types::Lane::try_from(lane.to_string())
        .map_err(|e| anyhow::anyhow!("invalid --lane {lane:?}: {e}"))?;
    let wu_type: lumenflow_types::WuType = serde_json::from_value(serde_json::Value::String(wu_type.to_string()))
        .with_context(|| format!("invalid --type {wu_type:?}"))?;

    let now = Utc::now();
    let outcome = ids::retry_create_on_push_collision(
        |id| {
            let wu = lumenflow_types::WorkUnit {
                id,
                title: title.to_string(),
                description: description.to_string(),
                lane: lane.clone(),
                wu_type,
                status: Status::Ready,
                exposure: None,
                priority: None,
                created: Some(now),
                claimed_at: None,
                completed_at: None,
                completed: None,
                locked: false,
                code_paths: code_paths.to_vec(),
                tests: lumenflow_types::TestPaths {
                    unit: unit_tests.to_vec(),
                    e2e: e2e_tests.to_vec(),
                    ..Default::default()
                },
                acceptance: lumenflow_types::Acceptance::List(acceptance.to_vec()),
                blocks: vec![],
                blocked_by: vec![],
                escalation: Default::default(),
                worktree_path: None,
            };
            let wu_path = cfg.wu_dir.join(lumenflow_yaml::file_name_for(id));
            let wu_rel = relative_to_repo(&cfg.repo_root, &wu_path);
            let events_rel = relative_to_repo(&cfg.repo_root, &cfg.events_path());

            with_micro_worktree(
                git,
                &cfg.worktrees_dir,
                "create",
                id.0,
                now,
                &format!("Create {id}"),
                &[wu_rel.clone(), events_rel.clone()],
                &cfg.guard_options(Some(&wu_path), code_paths, force),
                &mut NullReporterRef,
                |wt_git| {
                    let wt_wu_path = wt_git.dir().join(&wu_rel);
                    if let Some(parent) = wt_wu_path.parent() {
                        std::fs::create_dir_all(parent).map_err(|e| LumenError::Schema {
                            message: format!("failed to create {}: {e}", parent.display()),
                        })?;
                    }
                    lumenflow_yaml::write_wu_file(&wt_wu_path, &wu)?;
                    let log = lumenflow_state::EventLog::new(wt_git.dir().join(&events_rel));
                    log.append(&Event {
                        kind: EventKind::Create,
                        wu_id: id,
                        timestamp: now,
                        lane: Some(wu.lane.to_string()),
                        title: Some(wu.title.clone()),
                        reason: None,
                        extra: Default::default(),
                    })?;
                    Ok(())
                },
            )
        },
        || ids::allocate(git, &cfg.wu_dir, &cfg.stamps_dir, &cfg.state_dir, cfg.offline, reporter),
    )?;

    reporter.info(&format!("created {}", outcome.value));
    println!("{}", outcome.value);
    Ok(())
}

/// A no-op `Reporter`, used where `with_micro_worktree` requires one but
/// the caller's own reporter is already borrowed elsewhere in the call.
struct NullReporterRef;
impl Reporter for NullReporterRef {
    fn info(&mut self, _message: &str) {}
    fn warn(&mut self, _message: &str) {}
    fn error(&mut self, _message: &str) {}
}

fn cmd_transition(
    cfg: &Config,
    git: &dyn GitAdapter,
    id: &str,
    operation: &str,
    kind: EventKind,
    new_status: Status,
    force: bool,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    let id = parse_id(id)?;
    let now = Utc::now();
    let wu_path = cfg.wu_dir.join(lumenflow_yaml::file_name_for(id));
    let mut wu = lumenflow_yaml::read_wu_file(&wu_path)?;
    wu.status = new_status;
    if kind == EventKind::Claim {
        wu.claimed_at = Some(now);
    }

    let wu_rel = relative_to_repo(&cfg.repo_root, &wu_path);
    let events_rel = relative_to_repo(&cfg.repo_root, &cfg.events_path());
    let guard_options = cfg.guard_options(Some(&wu_path), &wu.code_paths, force);

    with_micro_worktree(
        git,
        &cfg.worktrees_dir,
        operation,
        id.0,
        now,
        &format!("{operation} {id}"),
        &[wu_rel.clone(), events_rel.clone()],
        &guard_options,
        reporter,
        |wt_git| {
            lumenflow_yaml::write_wu_file(&wt_git.dir().join(&wu_rel), &wu)?;
            let log = lumenflow_state::EventLog::new(wt_git.dir().join(&events_rel));
            log.append(&Event {
                kind,
                wu_id: id,
                timestamp: now,
                lane: None,
                title: None,
                reason: None,
                extra: Default::default(),
            })?;
            Ok(())
        },
    )?;

    println!("{id}: {new_status:?}");
    Ok(())
}

fn cmd_block(cfg: &Config, git: &dyn GitAdapter, id: &str, reason: &str, force: bool, reporter: &mut dyn Reporter) -> Result<()> {
    let id = parse_id(id)?;
    let now = Utc::now();
    let wu_path = cfg.wu_dir.join(lumenflow_yaml::file_name_for(id));
    let mut wu = lumenflow_yaml::read_wu_file(&wu_path)?;
    wu.status = Status::Blocked;

    let wu_rel = relative_to_repo(&cfg.repo_root, &wu_path);
    let events_rel = relative_to_repo(&cfg.repo_root, &cfg.events_path());
    let guard_options = cfg.guard_options(Some(&wu_path), &wu.code_paths, force);

    with_micro_worktree(
        git,
        &cfg.worktrees_dir,
        "block",
        id.0,
        now,
        &format!("Block {id}"),
        &[wu_rel.clone(), events_rel.clone()],
        &guard_options,
        reporter,
        |wt_git| {
            lumenflow_yaml::write_wu_file(&wt_git.dir().join(&wu_rel), &wu)?;
            let log = lumenflow_state::EventLog::new(wt_git.dir().join(&events_rel));
            log.append(&Event {
                kind: EventKind::Block,
                wu_id: id,
                timestamp: now,
                lane: None,
                title: None,
                reason: Some(reason.to_string()),
                extra: Default::default(),
            })?;
            Ok(())
        },
    )?;

    println!("{id}: Blocked ({reason})");
    Ok(())
}

fn cmd_complete(cfg: &Config, git: &dyn GitAdapter, id: &str, force: bool, reporter: &mut dyn Reporter) -> Result<()> {
    let id = parse_id(id)?;
    let wu = pipeline::complete_work_unit(cfg, git, id, Utc::now(), force, reporter)?;
    println!("{}: Done", wu.id);
    Ok(())
}

fn cmd_status(cfg: &Config, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    let wu_path = cfg.wu_dir.join(lumenflow_yaml::file_name_for(id));
    let wu = lumenflow_yaml::read_wu_file(&wu_path)?;
    let log = lumenflow_state::EventLog::new(cfg.events_path());
    let folded = log.status(id)?;
    let classification = classify::classify(&wu);

    println!("id: {}", wu.id);
    println!("title: {}", wu.title);
    println!("yaml_status: {:?}", wu.status.normalize());
    println!("event_log_status: {folded:?}");
    println!("domain: {:?} (confidence {:.2})", classification.domain, classification.confidence);
    if wu.escalation.is_unresolved() {
        println!("escalation: UNRESOLVED ({} trigger(s))", wu.escalation.escalation_triggers.len());
    }
    Ok(())
}

fn cmd_graph(cfg: &Config, view: &GraphView) -> Result<()> {
    let graph = Graph::build(&cfg.wu_dir)?;
    if let Some(cycle) = graph.detect_cycle() {
        eprintln!("[warn] dependency cycle detected: {cycle:?}");
    }
    for (id, target) in graph.detect_orphans() {
        eprintln!("[warn] {id} references unknown Work Unit {target}");
    }

    match view {
        GraphView::Order => {
            let result = graph.topo_sort();
            for id in &result.order {
                println!("{id}");
            }
            if let Some(warning) = &result.warning {
                eprintln!("[warn] {warning}");
            }
        }
        GraphView::CriticalPath => {
            for id in graph.critical_path() {
                println!("{id}");
            }
        }
        GraphView::Bottlenecks { limit } => {
            for (id, score) in graph.bottlenecks(*limit) {
                println!("{id}: impact {score}");
            }
        }
    }
    Ok(())
}

fn cmd_repair(cfg: &Config, apply: bool) -> Result<()> {
    let groups = classify::find_duplicate_ids(&cfg.wu_dir)?;
    if groups.is_empty() {
        println!("no duplicate Work Unit ids found");
        return Ok(());
    }

    let mut next_id = highest_known_id(cfg)?.0 + 1;
    for group in &groups {
        let remaps = classify::repair_duplicate(
            group,
            WuId::new(next_id),
            &cfg.stamps_dir,
            &cfg.events_path(),
            !apply,
        )?;
        next_id += remaps.len() as u64;
        for (old, new) in remaps {
            println!("{old} -> {new}{}", if apply { "" } else { " (dry run)" });
        }
    }

    if !apply {
        println!("re-run with --apply to write these changes");
    }
    Ok(())
}

fn highest_known_id(cfg: &Config) -> Result<WuId> {
    let graph = Graph::build(&cfg.wu_dir)?;
    match graph.nodes.keys().max() {
        Some(id) => Ok(*id),
        None => bail!("no Work Units found in {}", cfg.wu_dir.display()),
    }
}
