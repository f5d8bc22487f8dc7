mod common;

use common::{assert_exit, fixture};

#[test]
fn incomplete_evidence_is_rejected_without_consuming_ids() {
    let gate = fixture();
    let output = gate.vgate(&[
        "evidence", "collect", "--type", "test_result", "--field", "test_command=cargo test",
    ]);
    assert_exit(&output, 1);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("exit_code"), "stderr: {stderr}");
    assert!(stderr.contains("output_sample"), "stderr: {stderr}");

    let id = gate.vgate_ok(&[
        "evidence",
        "collect",
        "--type",
        "test_result",
        "--field",
        "test_command=cargo test",
        "--field",
        "exit_code=0",
        "--field",
        "output_sample=ok",
    ]);
    assert_eq!(id, "EVID-W1-001");

    let record = gate.vgate_json(&["evidence", "show", &id], 0);
    assert_eq!(record["type"], "test_result");
    assert_eq!(record["fields"]["exit_code"], 0);
}

#[test]
fn unknown_evidence_type_is_a_schema_error() {
    let gate = fixture();
    let output = gate.vgate(&["evidence", "collect", "--type", "hunch", "--field", "a=b"]);
    assert_exit(&output, 1);
    assert!(gate.vgate_ok(&["evidence", "list"]).is_empty());
}

#[test]
fn evidence_validate_checks_files_on_disk() {
    let gate = fixture();
    gate.write(
        "incoming.json",
        r#"{"schema_version": 1, "id": "EVID-W1-007", "type": "code_review",
            "fields": {"reviewer": "sam"}, "collected_at_epoch_ms": 1}"#,
    );
    let path = gate.path("incoming.json");
    let output = gate.vgate(&["evidence", "validate", path.to_str().expect("utf-8 path")]);
    assert_exit(&output, 1);
    assert!(String::from_utf8_lossy(&output.stderr).contains("findings"));
}

#[test]
fn checklist_items_map_to_one_requirement() {
    let gate = fixture();
    let first = gate.vgate_ok(&["registry", "add-requirement", "Ship login"]);
    let second = gate.vgate_ok(&["registry", "add-requirement", "Ship logout"]);
    assert_eq!(first, "REQ-W1-001");
    assert_eq!(second, "REQ-W1-002");

    let item = gate.vgate_ok(&["registry", "add-item", "Form posts", "--requirement", &first]);
    assert_eq!(item, "CL-W1-001");

    let duplicate = gate.vgate(&["registry", "link", &second, &item]);
    assert_exit(&duplicate, 1);
    assert!(String::from_utf8_lossy(&duplicate.stderr).contains("duplicate mapping"));

    let resolved = gate.vgate_json(&["registry", "resolve", &item, "--json"], 0);
    assert_eq!(resolved["state"], "mapped");
    assert_eq!(resolved["requirement"], first.as_str());

    gate.vgate_ok(&["registry", "describe", &first, "Ship redesigned login"]);
    assert_eq!(gate.vgate_ok(&["registry", "resolve", &item]), first);

    assert_eq!(gate.vgate_ok(&["registry", "resolve", "CL-W9-404"]), "unmapped");
}

#[test]
fn completion_requires_valid_attached_evidence() {
    let gate = fixture();
    let item = gate.vgate_ok(&["registry", "add-item", "Unit tests pass"]);
    assert_exit(&gate.vgate(&["registry", "complete", &item]), 1);

    let evidence = gate.vgate_ok(&[
        "evidence",
        "collect",
        "--type",
        "command_output",
        "--field",
        "command=make check",
        "--field",
        "exit_code=0",
        "--field",
        "output_sample=all good",
    ]);
    gate.vgate_ok(&["registry", "attach", &item, &evidence]);
    gate.vgate_ok(&["registry", "complete", &item]);

    let report = gate.vgate_json(&["registry", "report", "--json"], 0);
    assert_eq!(report["checklist_items"], 1);
    assert!(report["incomplete_checklist"]
        .as_array()
        .expect("array")
        .is_empty());
    assert_eq!(report["unmapped_checklist"][0], item.as_str());
}

#[test]
fn swapped_identifier_kinds_are_rejected() {
    let gate = fixture();
    let output = gate.vgate(&["registry", "link", "CL-W1-001", "REQ-W1-001"]);
    assert_exit(&output, 1);
    assert!(String::from_utf8_lossy(&output.stderr).contains("invalid identifier"));
}

#[test]
fn scan_ignores_fenced_examples_and_flags_unknown_ids() {
    let gate = fixture();
    let requirement = gate.vgate_ok(&["registry", "add-requirement", "Cache verdicts"]);
    gate.write(
        "plan.md",
        &format!(
            "Covers {requirement}.\n\n```text\nExample: REQ-W1-099\n```\nAlso CL-W1-050 (C++ bindings).\n"
        ),
    );
    let path = gate.path("plan.md");
    let path = path.to_str().expect("utf-8 path");

    let output = gate.vgate(&["registry", "scan", path, "--keyword", "C++", "--json"]);
    assert_exit(&output, 1);
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    let ids: Vec<&str> = report["identifiers"]
        .as_array()
        .expect("identifiers")
        .iter()
        .filter_map(|mention| mention["id"].as_str())
        .collect();
    assert_eq!(ids, [requirement.as_str(), "CL-W1-050"]);
    assert_eq!(report["unknown"], 1);
    assert_eq!(report["keyword_lines"][0]["line"], 6);
}
