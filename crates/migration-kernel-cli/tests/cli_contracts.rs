#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use jsonschema::JSONSchema;
use rusqlite::Connection;
use serde_json::Value;
use ulid::Ulid;

fn mk_binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_mk"))
}

fn contracts_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("contracts/v1")
}

fn fixture(name: &str) -> PathBuf {
    contracts_dir().join("fixtures").join(name)
}

fn temp_path(label: &str, extension: &str) -> PathBuf {
    std::env::temp_dir().join(format!("mk-{label}-{}.{extension}", Ulid::new()))
}

fn mk_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(mk_binary_path());
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run mk command {:?}: {err}", args),
    }
}

fn path_arg(path: &Path) -> &str {
    match path.to_str() {
        Some(value) => value,
        None => panic!("non UTF-8 fixture path: {}", path.display()),
    }
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

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "mk failed\nstdout={}\nstderr={}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn assert_schema(schema_name: &str, value: &Value) {
    let schema_path = contracts_dir().join("schemas").join(schema_name);
    let body = match fs::read_to_string(&schema_path) {
        Ok(body) => body,
        Err(err) => panic!("failed to read {}: {err}", schema_path.display()),
    };
    let schema: Value = match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(err) => panic!("failed to parse {}: {err}", schema_path.display()),
    };
    let compiled = match JSONSchema::compile(&schema) {
        Ok(compiled) => compiled,
        Err(err) => panic!("failed to compile {}: {err}", schema_path.display()),
    };
    if let Some(errors) = compiled
        .validate(value)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
    {
        panic!(
            "schema validation failed for {}:\n{}",
            schema_path.display(),
            errors.join("\n")
        );
    }
}

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = match Command::new(mk_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["plan", "upgrade", "status", "history", "state", "schema"] {
        assert!(
            stdout.contains(required),
            "help output missing subcommand {required}: {stdout}"
        );
    }
}

#[test]
fn plan_validate_reports_final_state_without_opening_the_database() {
    let db_path = temp_path("validate", "sqlite3");
    let plan = fixture("blog-plan.json");
    let output = mk_output(&db_path, &["plan", "validate", "--plan", path_arg(&plan), "--json"]);
    assert_success(&output);

    let payload = stdout_json(&output);
    assert_eq!(payload["contract_version"], "plan_validation.v1");
    assert_eq!(payload["final_state"], "1.0.0");
    assert_eq!(
        payload["states"],
        serde_json::json!(["", "{posts}", "{slug}", "1.0.0"])
    );
    assert!(!db_path.exists());
}

#[test]
fn plan_script_renders_sql_server_dialect() {
    let db_path = temp_path("script", "sqlite3");
    let plan = fixture("blog-plan.json");
    let output = mk_output(
        &db_path,
        &["plan", "script", "--plan", path_arg(&plan), "--dialect", "sqlserver"],
    );
    assert_success(&output);

    let script = String::from_utf8_lossy(&output.stdout);
    assert!(script.starts_with("-- plan Blog (sqlserver)"));
    assert!(script.contains("CREATE TABLE [post]"));
    assert!(script.contains("-- when column post.slug is missing"));
}

#[test]
fn upgrade_status_and_schema_check_emit_stable_contracts() {
    let db_path = temp_path("upgrade", "sqlite3");
    let plan = fixture("blog-plan.json");
    let schema = fixture("blog-schema.json");

    let before = mk_output(&db_path, &["status", "--plan", path_arg(&plan), "--json"]);
    assert_success(&before);
    let before = stdout_json(&before);
    assert_schema("upgrade-status.schema.json", &before);
    assert_eq!(before["requires_upgrade"], true);
    assert_eq!(before["pending"].as_array().map(Vec::len), Some(3));

    let upgrade = mk_output(&db_path, &["upgrade", "--plan", path_arg(&plan), "--json"]);
    assert_success(&upgrade);
    let report = stdout_json(&upgrade);
    assert_schema("executed-plan.schema.json", &report);
    assert_eq!(report["successful"], true);
    assert_eq!(report["initial_state"], "");
    assert_eq!(report["final_state"], "1.0.0");

    let rerun = mk_output(&db_path, &["upgrade", "--plan", path_arg(&plan), "--json"]);
    assert_success(&rerun);
    let rerun = stdout_json(&rerun);
    assert_eq!(rerun["completed_transitions"], serde_json::json!([]));

    let after = mk_output(&db_path, &["status", "--plan", path_arg(&plan), "--json"]);
    assert_success(&after);
    let after = stdout_json(&after);
    assert_eq!(after["requires_upgrade"], false);
    assert_eq!(after["current_state"], "1.0.0");

    let check = mk_output(&db_path, &["schema", "check", "--expected", path_arg(&schema), "--json"]);
    assert_success(&check);
    let check = stdout_json(&check);
    assert_schema("schema-check.schema.json", &check);
    assert_eq!(check["healthy"], true);

    let conn = match Connection::open(&db_path) {
        Ok(conn) => conn,
        Err(err) => panic!("failed to open upgraded db: {err}"),
    };
    let posts = match conn.query_row("SELECT COUNT(*) FROM post", [], |row| row.get::<_, i64>(0)) {
        Ok(count) => count,
        Err(err) => panic!("failed to count posts: {err}"),
    };
    assert_eq!(posts, 1);
}

#[test]
fn unhealthy_schema_check_exits_non_zero() {
    let db_path = temp_path("unhealthy", "sqlite3");
    let schema = fixture("blog-schema.json");

    let output = mk_output(&db_path, &["schema", "check", "--expected", path_arg(&schema), "--json"]);
    assert!(!output.status.success());
    let check = stdout_json(&output);
    assert_schema("schema-check.schema.json", &check);
    assert_eq!(check["healthy"], false);
    assert_eq!(check["issues"][0]["code"], "missing_table");
}

#[test]
fn failed_upgrade_exits_non_zero_and_keeps_last_state() {
    let db_path = temp_path("failed", "sqlite3");
    let plan_path = temp_path("failed-plan", "json");
    let plan = serde_json::json!({
        "name": "Broken",
        "steps": [
            {"to": "{one}", "migration": {"name": "CreateLog", "operations": [
                {"kind": "execute_sql", "sql": "CREATE TABLE log (id INTEGER)"}
            ]}},
            {"to": "{two}", "migration": {"name": "Explode", "operations": [
                {"kind": "execute_sql", "sql": "INSERT INTO nowhere VALUES (1)"}
            ]}}
        ]
    });
    if let Err(err) = fs::write(&plan_path, plan.to_string()) {
        panic!("failed to write plan fixture: {err}");
    }

    let output = mk_output(&db_path, &["upgrade", "--plan", path_arg(&plan_path), "--json"]);
    assert!(!output.status.success());
    let report = stdout_json(&output);
    assert_schema("executed-plan.schema.json", &report);
    assert_eq!(report["successful"], false);
    assert_eq!(report["final_state"], "{one}");
    assert!(report["error"]
        .as_str()
        .is_some_and(|error| error.contains("Explode")));

    let state = mk_output(
        &db_path,
        &["state", "get", "--key", "Migrations.Upgrader.State+Broken"],
    );
    assert_success(&state);
    assert_eq!(String::from_utf8_lossy(&state.stdout).trim(), "{one}");

    let history = mk_output(&db_path, &["history", "--plan", "Broken"]);
    assert_success(&history);
    let history = stdout_json(&history);
    assert_eq!(history.as_array().map(Vec::len), Some(1));
    assert_eq!(history[0]["migration"], "CreateLog");
}

#[test]
fn state_set_get_and_list_round_trip_through_the_store() {
    let db_path = temp_path("state", "sqlite3");

    assert!(!mk_output(&db_path, &["state", "get", "--key", "missing"]).status.success());
    assert_success(&mk_output(&db_path, &["state", "set", "--key", "release", "--value", "7.0"]));

    let value = mk_output(&db_path, &["state", "get", "--key", "release"]);
    assert_success(&value);
    assert_eq!(String::from_utf8_lossy(&value.stdout).trim(), "7.0");

    let list = mk_output(&db_path, &["state", "list"]);
    assert_success(&list);
    let list = stdout_json(&list);
    assert_eq!(list[0]["key"], "release");
    assert_eq!(list[0]["value"], "7.0");
}
