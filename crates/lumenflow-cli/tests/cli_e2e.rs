use std::path::{Path, PathBuf};
use std::process::Command;

use assert_cmd::Command as AssertCommand;
use predicates::str::contains;

/// Every micro-worktree operation ends with a push to `origin`
/// (spec.md §4.8 step 8), so the fixture is a bare "remote" plus a clone,
/// not a lone local repo.
fn init_bare_and_clone(td: &Path) -> PathBuf {
    let bare = td.join("origin.git");
    let work = td.join("work");
    run(&["init", "-q", "--bare", "-b", "main"], td, Some(&bare));
    Command::new("git").args(["clone", "-q"]).arg(&bare).arg(&work).output().expect("clone");
    run(&["config", "user.email", "test@example.com"], &work, None);
    run(&["config", "user.name", "Test User"], &work, None);
    work
}

fn run(args: &[&str], cwd: &Path, extra_target: Option<&Path>) {
    let mut cmd = Command::new("git");
    cmd.args(args).current_dir(cwd);
    if let Some(target) = extra_target {
        cmd.arg(target);
    }
    let output = cmd.output().expect("git command");
    assert!(output.status.success(), "git {args:?} failed: {}", String::from_utf8_lossy(&output.stderr));
}

fn seed_commit(work: &Path) {
    std::fs::write(work.join("README.md"), "hello\n").unwrap();
    run(&["add", "README.md"], work, None);
    run(&["commit", "-q", "-m", "seed"], work, None);
    run(&["push", "-q", "origin", "main"], work, None);
}

fn lumenflow(work: &Path) -> AssertCommand {
    let mut cmd = AssertCommand::cargo_bin("lumenflow").unwrap();
    cmd.current_dir(work);
    cmd
}

#[test]
fn create_claim_complete_round_trips_through_the_real_cli() {
    let td = tempfile::tempdir().unwrap();
    let work = init_bare_and_clone(td.path());
    seed_commit(&work);

    let create_output = lumenflow(&work)
        .args([
            "create",
            "--title",
            "Wire up the retry loop",
            "--description",
            "Add exponential backoff around the push-collision retry path.",
            "--lane",
            "Operations: Tooling",
            "--type",
            "engineering",
            "--code-path",
            "src/ids.rs",
            "--unit-test",
            "tests/ids.rs",
            "--acceptance",
            "retries three times before giving up",
        ])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let id = String::from_utf8(create_output).unwrap().trim().to_string();
    assert_eq!(id, "WU-1");

    lumenflow(&work).args(["status", &id]).assert().success().stdout(contains("yaml_status: Ready"));

    lumenflow(&work).args(["claim", &id]).assert().success();
    lumenflow(&work).args(["status", &id]).assert().success().stdout(contains("yaml_status: InProgress"));

    lumenflow(&work).args(["complete", &id]).assert().success();
    lumenflow(&work).args(["status", &id]).assert().success().stdout(contains("yaml_status: Done"));
}

#[test]
fn block_then_unblock_round_trips_status() {
    let td = tempfile::tempdir().unwrap();
    let work = init_bare_and_clone(td.path());
    seed_commit(&work);

    let id = {
        let out = lumenflow(&work)
            .args([
                "create",
                "--title",
                "Draft the release notes",
                "--description",
                "Summarize the changes for the upcoming release.",
                "--lane",
                "Operations: Docs",
                "--type",
                "documentation",
            ])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        String::from_utf8(out).unwrap().trim().to_string()
    };

    lumenflow(&work).args(["claim", &id]).assert().success();
    lumenflow(&work).args(["block", &id, "--reason", "waiting on product sign-off"]).assert().success();
    lumenflow(&work).args(["status", &id]).assert().success().stdout(contains("yaml_status: Blocked"));

    lumenflow(&work).args(["unblock", &id]).assert().success();
    lumenflow(&work).args(["status", &id]).assert().success().stdout(contains("yaml_status: InProgress"));
}

#[test]
fn graph_order_lists_dependency_respecting_sequence() {
    let td = tempfile::tempdir().unwrap();
    let work = init_bare_and_clone(td.path());
    seed_commit(&work);

    lumenflow(&work)
        .args([
            "create",
            "--title",
            "Foundation work",
            "--description",
            "Lay the groundwork the follow-up unit depends on.",
            "--lane",
            "Operations: Tooling",
        ])
        .assert()
        .success();

    let graph = lumenflow(&work).args(["graph", "order"]).assert().success().get_output().stdout.clone();
    assert_eq!(String::from_utf8(graph).unwrap().trim(), "WU-1");
}

#[test]
fn repair_reports_no_duplicates_on_a_clean_repo() {
    let td = tempfile::tempdir().unwrap();
    let work = init_bare_and_clone(td.path());
    seed_commit(&work);

    lumenflow(&work).args(["repair"]).assert().success().stdout(contains("no duplicate Work Unit ids found"));
}

#[test]
fn complete_without_required_fields_fails_with_the_documented_exit_code() {
    let td = tempfile::tempdir().unwrap();
    let work = init_bare_and_clone(td.path());
    seed_commit(&work);

    let id = {
        let out = lumenflow(&work)
            .args([
                "create",
                "--title",
                "Incomplete unit",
                "--description",
                "This unit has no acceptance criteria attached to it.",
                "--lane",
                "Operations: Tooling",
            ])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        String::from_utf8(out).unwrap().trim().to_string()
    };

    lumenflow(&work).args(["claim", &id]).assert().success();
    lumenflow(&work).args(["complete", &id]).assert().failure().code(2);
}
