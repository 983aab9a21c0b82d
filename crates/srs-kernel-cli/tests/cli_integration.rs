use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_db() -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    std::env::temp_dir().join(format!("srsk-cli-{now}.sqlite3"))
}

fn run_srsk<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_srsk"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute srsk binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_srsk(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "srsk command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_str<'a>(value: &'a Value, pointer: &str) -> &'a str {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string at `{pointer}` in payload: {value}"))
}

fn as_i64(value: &Value, pointer: &str) -> i64 {
    value
        .pointer(pointer)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer at `{pointer}` in payload: {value}"))
}

const FIXTURE_USER: &str = "01HZY9D4Q3SG7PV9A6EXJ8N2E4";

#[test]
fn migrate_reports_schema_version_and_contract() {
    let db = unique_temp_db();
    let db_arg = db.display().to_string();
    let value = run_json(["--db", db_arg.as_str(), "db", "migrate"]);

    assert_eq!(as_str(&value, "/contract_version"), "cli.v1");
    assert_eq!(as_i64(&value, "/current_version"), 1);
    assert_eq!(as_i64(&value, "/target_version"), 1);
    let _ = std::fs::remove_file(&db);
}

#[test]
fn enroll_answer_and_streak_flow() {
    let db = unique_temp_db();
    let db_arg = db.display().to_string();

    let enrolled = run_json([
        "--db",
        db_arg.as_str(),
        "card",
        "enroll",
        "--user",
        FIXTURE_USER,
        "--item-id",
        "11",
    ]);
    let card_id = as_str(&enrolled, "/cards/0/id").to_string();
    assert_eq!(as_i64(&enrolled, "/cards/0/stage"), 0);

    let outcome = run_json([
        "--db",
        db_arg.as_str(),
        "answer",
        "--user",
        FIXTURE_USER,
        "--card",
        card_id.as_str(),
        "--correct",
    ]);
    assert_eq!(as_str(&outcome, "/status"), "pass");
    assert_eq!(as_i64(&outcome, "/stage"), 1);

    let streak = run_json(["--db", db_arg.as_str(), "streak", "--user", FIXTURE_USER]);
    assert_eq!(as_i64(&streak, "/daily_quiz_count"), 1);
    let _ = std::fs::remove_file(&db);
}

#[test]
fn wrong_answer_shows_up_in_wrong_list() {
    let db = unique_temp_db();
    let db_arg = db.display().to_string();

    let enrolled = run_json([
        "--db",
        db_arg.as_str(),
        "card",
        "enroll",
        "--user",
        FIXTURE_USER,
        "--item-id",
        "42",
    ]);
    let card_id = as_str(&enrolled, "/cards/0/id").to_string();

    let outcome = run_json([
        "--db",
        db_arg.as_str(),
        "answer",
        "--user",
        FIXTURE_USER,
        "--card",
        card_id.as_str(),
    ]);
    assert_eq!(as_str(&outcome, "/status"), "fail");

    let entries = run_json(["--db", db_arg.as_str(), "wrong", "list", "--user", FIXTURE_USER]);
    assert_eq!(as_i64(&entries, "/entries/0/attempts"), 1);
    assert_eq!(as_str(&entries, "/entries/0/status"), "pending");
    let _ = std::fs::remove_file(&db);
}

#[test]
fn out_of_range_factor_fails_with_nonzero_exit() {
    let db = unique_temp_db();
    let db_arg = db.display().to_string();
    let output = run_srsk(["--db", db_arg.as_str(), "time", "set-factor", "20000"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid argument"), "stderr was: {stderr}");
    let _ = std::fs::remove_file(&db);
}

#[test]
fn set_factor_reports_recalculation() {
    let db = unique_temp_db();
    let db_arg = db.display().to_string();

    run_json(["--db", db_arg.as_str(), "db", "migrate"]);
    let report = run_json(["--db", db_arg.as_str(), "time", "set-factor", "60"]);
    assert_eq!(as_i64(&report, "/current/acceleration_factor"), 60);
    assert_eq!(as_i64(&report, "/previous/acceleration_factor"), 1);
    assert_eq!(as_i64(&report, "/total"), 0, "empty database rescales nothing");
    let _ = std::fs::remove_file(&db);
}
