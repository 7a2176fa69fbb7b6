//! End-to-end tests of the `slotstore` binary.
//!
//! Every invocation is its own process, so these also cover attaching to a
//! store another process created and wrote.

use std::path::Path;

use assert_cmd::Command;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn slotstore(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("slotstore").unwrap();
    cmd.env_remove("RUST_LOG").args([
        "--dir",
        dir.to_str().unwrap(),
        "--name",
        "quotes",
        "--max-records",
        "4",
        "--record-size",
        "32",
        "--buckets",
        "8",
        "--primary-len",
        "16",
        "--secondary-len",
        "16",
    ]);
    cmd
}

fn stdout_of(cmd: &mut Command) -> String {
    let output = cmd.output().unwrap();
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    String::from_utf8(output.stdout).unwrap()
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[test]
fn test_put_then_get_from_another_process() {
    let dir = TempDir::new().unwrap();
    slotstore(dir.path()).args(["put", "7203.T", "last=2841.5", "--skey", "JP3633400001"]).assert().success();

    let by_primary = stdout_of(slotstore(dir.path()).args(["get", "7203.T"]));
    assert_eq!(by_primary.trim_end(), "last=2841.5");

    let by_secondary = stdout_of(slotstore(dir.path()).args(["get", "JP3633400001", "--secondary"]));
    assert_eq!(by_secondary.trim_end(), "last=2841.5");
}

#[test]
fn test_get_missing_key_fails() {
    let dir = TempDir::new().unwrap();
    slotstore(dir.path()).args(["get", "absent"]).assert().code(1);
}

#[test]
fn test_duplicate_put_reports_error() {
    let dir = TempDir::new().unwrap();
    slotstore(dir.path()).args(["put", "k", "v", "--skey", "s"]).assert().success();

    let output = slotstore(dir.path()).args(["put", "k", "w", "--skey", "t"]).output().unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("already exists"));
}

#[test]
fn test_del_and_dump() {
    let dir = TempDir::new().unwrap();
    slotstore(dir.path()).args(["put", "a", "1", "--skey", "x"]).assert().success();
    slotstore(dir.path()).args(["put", "b", "2", "--skey", "y"]).assert().success();
    slotstore(dir.path()).args(["del", "a"]).assert().success();

    let dump = stdout_of(slotstore(dir.path()).arg("dump"));
    assert_eq!(dump, "2\tb\t2\n");
}

#[test]
fn test_get_seq_reports_occupancy() {
    let dir = TempDir::new().unwrap();
    slotstore(dir.path()).args(["put", "a", "hello", "--skey", "x"]).assert().success();

    let first = stdout_of(slotstore(dir.path()).args(["get-seq", "1"]));
    assert_eq!(first, "1\toccupied\thello\n");

    let second = stdout_of(slotstore(dir.path()).args(["get-seq", "2"]));
    assert!(second.starts_with("2\tfree"));

    slotstore(dir.path()).args(["get-seq", "5"]).assert().code(2);
}

#[test]
fn test_inspect_stats_verify() {
    let dir = TempDir::new().unwrap();
    slotstore(dir.path()).args(["put", "a", "1", "--skey", "x"]).assert().success();

    let inspect = stdout_of(slotstore(dir.path()).arg("inspect"));
    assert!(inspect.contains("max record count   4"));
    assert!(inspect.contains("live records       1"));

    let stats = stdout_of(slotstore(dir.path()).arg("stats"));
    assert!(stats.contains("used=1"));
    assert!(stats.contains("secondary"));

    let verify = stdout_of(slotstore(dir.path()).arg("verify"));
    assert_eq!(verify.trim_end(), "ok: 1 live records");
}

#[test]
fn test_clear() {
    let dir = TempDir::new().unwrap();
    slotstore(dir.path()).args(["put", "a", "1", "--skey", "x"]).assert().success();
    slotstore(dir.path()).arg("clear").assert().success();
    slotstore(dir.path()).args(["get", "a"]).assert().code(1);
}

#[test]
fn test_inspect_without_store_fails() {
    let dir = TempDir::new().unwrap();
    slotstore(dir.path()).arg("inspect").assert().code(2);
}

#[test]
fn test_geometry_mismatch_and_trust_file() {
    let dir = TempDir::new().unwrap();
    slotstore(dir.path()).args(["put", "a", "1", "--skey", "x"]).assert().success();

    let mut mismatched = slotstore(dir.path());
    mismatched.args(["--max-records", "8", "stats"]).assert().code(2);

    let mut trusting = slotstore(dir.path());
    let stats = stdout_of(trusting.args(["--max-records", "8", "--trust-file", "stats"]));
    assert!(stats.contains("total=4"));
}
