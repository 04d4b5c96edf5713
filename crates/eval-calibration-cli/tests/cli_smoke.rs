#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use rusqlite::Connection;
use serde_json::Value;
use ulid::Ulid;

fn evalcal_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_evalcal") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/evalcal");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "eval-calibration-cli", "--bin", "evalcal"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build evalcal binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn evalcal_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(evalcal_binary_path());
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run evalcal command {:?}: {err}", args),
    }
}

fn must_succeed(output: &Output, label: &str) {
    assert!(
        output.status.success(),
        "{label} failed: stdout={} stderr={}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn write_catalog() -> PathBuf {
    let path = std::env::temp_dir().join(format!("evalcal-catalog-{}.json", Ulid::new()));
    let body = r#"[
  {"id": "empathy", "label": "Empathy"},
  {"id": "clarity_pace", "label": "Clarity & Pace"}
]"#;
    if let Err(err) = std::fs::write(&path, body) {
        panic!("failed to write catalog fixture: {err}");
    }
    path
}

fn temp_db(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("evalcal-{label}-{}.sqlite3", Ulid::new()))
}

#[test]
fn help_lists_expected_subcommands() {
    let output = match Command::new(evalcal_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["score", "voice", "evaluator", "feedback", "calibrate"] {
        assert!(
            stdout.contains(required),
            "expected help output to contain subcommand {required}; output={stdout}"
        );
    }
}

#[test]
fn full_calibration_flow_over_the_binary() {
    let db_path = temp_db("flow");
    let catalog_path = write_catalog();
    let catalog = catalog_path.to_string_lossy().to_string();

    for (id, name) in [("ev-1", "Alice"), ("ev-2", "Bob")] {
        must_succeed(
            &evalcal_output(&db_path, &["evaluator", "add", "--id", id, "--name", name]),
            "evaluator add",
        );
    }

    for (evaluation, value) in [("eval-1", "3"), ("eval-2", "3"), ("eval-3", "4")] {
        must_succeed(
            &evalcal_output(
                &db_path,
                &[
                    "score",
                    "set",
                    "--evaluation",
                    evaluation,
                    "--parameter",
                    "empathy",
                    "--value",
                    value,
                ],
            ),
            "score set",
        );
    }

    for (evaluation, evaluator, original, adjusted) in [
        ("eval-1", "ev-1", "3", "4"),
        ("eval-2", "ev-2", "3", "5"),
        ("eval-3", "ev-1", "4", "4"),
    ] {
        must_succeed(
            &evalcal_output(
                &db_path,
                &[
                    "feedback",
                    "submit",
                    "--evaluation",
                    evaluation,
                    "--evaluator",
                    evaluator,
                    "--type",
                    "score",
                    "--parameter",
                    "empathy",
                    "--original",
                    original,
                    "--adjusted",
                    adjusted,
                    "--comment",
                    "human correction",
                ],
            ),
            "feedback submit",
        );
    }

    let run_output = evalcal_output(
        &db_path,
        &[
            "calibrate",
            "run",
            "--catalog",
            &catalog,
            "--period-days",
            "7",
        ],
    );
    must_succeed(&run_output, "calibrate run");
    let report = stdout_json(&run_output);
    assert_eq!(
        report["contract_version"],
        Value::String("calibration_report.v1".to_string())
    );
    assert_eq!(report["total_feedbacks_analyzed"], Value::from(3));
    assert_eq!(report["results"]["empathy"]["feedback_count"], Value::from(3));
    assert_eq!(
        report["results"]["empathy"]["avg_adjustment"],
        Value::from(1.0)
    );
    assert_eq!(
        report["results"]["clarity_pace"]["feedback_count"],
        Value::from(0)
    );

    let state_output = evalcal_output(&db_path, &["calibrate", "state", "--catalog", &catalog]);
    must_succeed(&state_output, "calibrate state");
    let state = stdout_json(&state_output);
    assert_eq!(
        state["contract_version"],
        Value::String("calibration_state.v1".to_string())
    );
    assert_eq!(state["states"][0]["parameter_id"], Value::from("empathy"));
    assert_eq!(state["states"][0]["adjustment"], Value::from(1.0));
    assert_eq!(state["states"][1]["adjustment"], Value::from(0.0));

    let history_output = evalcal_output(
        &db_path,
        &["calibrate", "history", "--parameter", "empathy", "--limit", "5"],
    );
    must_succeed(&history_output, "calibrate history");
    let history = stdout_json(&history_output);
    let entries = match history["entries"].as_array() {
        Some(entries) => entries.clone(),
        None => panic!("expected entries array, got {history}"),
    };
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["feedback_count"], Value::from(3));
    let names = match entries[0]["evaluator_names"].as_array() {
        Some(names) => names.clone(),
        None => panic!("expected evaluator_names array"),
    };
    assert!(names.contains(&Value::from("Alice")));
    assert!(names.contains(&Value::from("Bob")));

    let list_output = evalcal_output(&db_path, &["feedback", "list", "--evaluation", "eval-1"]);
    must_succeed(&list_output, "feedback list");
    let listed = stdout_json(&list_output);
    let records = match listed.as_array() {
        Some(records) => records.clone(),
        None => panic!("expected feedback array, got {listed}"),
    };
    assert_eq!(records.len(), 1);
    let feedback_id = match records[0]["feedback_id"].as_str() {
        Some(id) => id.to_string(),
        None => panic!("expected feedback_id string"),
    };

    let forbidden = evalcal_output(
        &db_path,
        &[
            "feedback",
            "delete",
            "--id",
            &feedback_id,
            "--requester",
            "ev-2",
        ],
    );
    assert!(!forbidden.status.success());
    let stderr = String::from_utf8_lossy(&forbidden.stderr);
    assert!(
        stderr.contains("forbidden"),
        "expected forbidden error shape, got stderr={stderr}"
    );

    let delete_output = evalcal_output(
        &db_path,
        &[
            "feedback",
            "delete",
            "--id",
            &feedback_id,
            "--requester",
            "ev-2",
            "--admin",
        ],
    );
    must_succeed(&delete_output, "feedback delete");
    let deletion = stdout_json(&delete_output);
    assert_eq!(deletion["override_retained"], Value::Bool(true));

    let conn = match Connection::open(&db_path) {
        Ok(conn) => conn,
        Err(err) => panic!("failed to open db for inspection: {err}"),
    };
    let remaining: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM feedback_records",
        [],
        |row| row.get(0),
    ) {
        Ok(count) => count,
        Err(err) => panic!("failed to count feedback records: {err}"),
    };
    assert_eq!(remaining, 2);

    let _ = std::fs::remove_file(&db_path);
    let _ = std::fs::remove_file(&catalog_path);
}

#[test]
fn voice_feedback_recomputes_overall_over_the_binary() {
    let db_path = temp_db("voice");

    for metric in ["clarity", "volume", "pace", "tone"] {
        must_succeed(
            &evalcal_output(
                &db_path,
                &[
                    "voice",
                    "set",
                    "--evaluation",
                    "eval-1",
                    "--metric",
                    metric,
                    "--value",
                    "4.0",
                ],
            ),
            "voice set",
        );
    }

    must_succeed(
        &evalcal_output(
            &db_path,
            &[
                "feedback",
                "submit",
                "--evaluation",
                "eval-1",
                "--evaluator",
                "ev-1",
                "--type",
                "voice-quality",
                "--metric",
                "tone",
                "--adjusted",
                "2.0",
                "--comment",
                "tone was flat",
            ],
        ),
        "voice feedback submit",
    );

    let show_output = evalcal_output(&db_path, &["voice", "show", "--evaluation", "eval-1"]);
    must_succeed(&show_output, "voice show");
    let snapshot = stdout_json(&show_output);
    assert_eq!(snapshot["tone"], Value::from(2.0));
    let overall = match snapshot["overall"].as_f64() {
        Some(value) => value,
        None => panic!("expected numeric overall, got {snapshot}"),
    };
    assert!((overall - 3.7).abs() < 1e-9);

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn blank_comment_is_rejected_with_stable_error_shape() {
    let db_path = temp_db("validation");

    let output = evalcal_output(
        &db_path,
        &[
            "feedback",
            "submit",
            "--evaluation",
            "eval-1",
            "--evaluator",
            "ev-1",
            "--type",
            "score",
            "--parameter",
            "empathy",
            "--adjusted",
            "4",
            "--comment",
            "   ",
        ],
    );
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("validation error"),
        "expected validation error shape, got stderr={stderr}"
    );

    let _ = std::fs::remove_file(&db_path);
}
