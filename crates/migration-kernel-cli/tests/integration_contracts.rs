use std::fs;
use std::path::{Path, PathBuf};

use jsonschema::JSONSchema;
use migration_kernel_core::{PlanDocument, TableDefinition};
use serde_json::Value;

fn contracts_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("contracts/v1")
}

fn read_text(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_else(|err| panic!("failed to read {}: {err}", path.display()))
}

fn read_json(path: &Path) -> Value {
    serde_json::from_str(&read_text(path))
        .unwrap_or_else(|err| panic!("failed to parse {}: {err}", path.display()))
}

fn compile(schema_name: &str) -> JSONSchema {
    let path = contracts_dir().join("schemas").join(schema_name);
    let schema = read_json(&path);
    JSONSchema::compile(&schema)
        .unwrap_or_else(|err| panic!("failed to compile {}: {err}", path.display()))
}

#[test]
fn contract_schemas_pin_their_versions() {
    for (schema_name, version) in [
        ("executed-plan.schema.json", "executed_plan.v1"),
        ("upgrade-status.schema.json", "upgrade_status.v1"),
        ("schema-check.schema.json", "schema_check.v1"),
    ] {
        let schema = read_json(&contracts_dir().join("schemas").join(schema_name));
        assert_eq!(schema["title"], version);
        assert_eq!(schema["properties"]["contract_version"]["const"], version);
        let _ = compile(schema_name);
    }
}

#[test]
fn executed_plan_schema_rejects_unknown_fields_and_versions() {
    let compiled = compile("executed-plan.schema.json");
    let valid = serde_json::json!({
        "contract_version": "executed_plan.v1",
        "plan": "Blog",
        "initial_state": "",
        "final_state": "{posts}",
        "completed_transitions": [{
            "source": "",
            "target": "{posts}",
            "migration": "CreatePosts",
            "statements": ["CREATE TABLE \"post\" (\"id\" INTEGER)"],
            "skipped": []
        }],
        "post_migrations": [],
        "successful": true
    });
    assert!(compiled.is_valid(&valid));

    let mut wrong_version = valid.clone();
    wrong_version["contract_version"] = serde_json::json!("executed_plan.v2");
    assert!(!compiled.is_valid(&wrong_version));

    let mut extra = valid;
    extra["unexpected"] = serde_json::json!(1);
    assert!(!compiled.is_valid(&extra));
}

#[test]
fn upgrade_status_schema_accepts_pending_post_migrations() {
    let compiled = compile("upgrade-status.schema.json");
    let mut status = serde_json::json!({
        "contract_version": "upgrade_status.v1",
        "plan": "Blog",
        "current_state": "{posts}",
        "final_state": "{posts}",
        "requires_upgrade": true,
        "pending": [],
        "pending_post_migrations": ["RebuildCache"]
    });
    assert!(compiled.is_valid(&status));

    status["pending_post_migrations"] = serde_json::json!([""]);
    assert!(!compiled.is_valid(&status));
}

#[test]
fn fixtures_load_as_valid_plan_and_schema() {
    let fixtures = contracts_dir().join("fixtures");

    let document = PlanDocument::from_json(&read_text(&fixtures.join("blog-plan.json")))
        .unwrap_or_else(|err| panic!("blog plan fixture rejected: {err}"));
    let plan = document
        .into_plan()
        .unwrap_or_else(|err| panic!("blog plan fixture invalid: {err}"));
    assert_eq!(plan.name(), "Blog");

    let tables: Vec<TableDefinition> =
        serde_json::from_str(&read_text(&fixtures.join("blog-schema.json")))
            .unwrap_or_else(|err| panic!("blog schema fixture rejected: {err}"));
    assert_eq!(tables.len(), 1);
    for table in &tables {
        table
            .validate()
            .unwrap_or_else(|err| panic!("table {} invalid: {err}", table.name));
    }
}
