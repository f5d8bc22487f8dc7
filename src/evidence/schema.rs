//! Closed evidence type registry and required-field validation.
//!
//! Adding a type means declaring its required fields here; anything not
//! listed is rejected outright.
use crate::error::{FieldIssue, SchemaError};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EvidenceType {
    TestResult,
    CodeReview,
    CommandOutput,
    FunctionalTest,
    ManualCheck,
}

/// How a required field's value is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Non-blank string, number, bool, or non-empty array/object.
    Text,
    /// JSON integer.
    Integer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
}

const fn text(name: &'static str) -> FieldSpec {
    FieldSpec {
        name,
        kind: FieldKind::Text,
    }
}

const fn integer(name: &'static str) -> FieldSpec {
    FieldSpec {
        name,
        kind: FieldKind::Integer,
    }
}

const TEST_RESULT_FIELDS: &[FieldSpec] = &[
    text("test_command"),
    integer("exit_code"),
    text("output_sample"),
];
const CODE_REVIEW_FIELDS: &[FieldSpec] = &[text("reviewer"), text("findings")];
const COMMAND_OUTPUT_FIELDS: &[FieldSpec] =
    &[text("command"), integer("exit_code"), text("output_sample")];
const FUNCTIONAL_TEST_FIELDS: &[FieldSpec] =
    &[text("scenario"), text("expected"), text("observed")];
const MANUAL_CHECK_FIELDS: &[FieldSpec] = &[text("verifier"), text("notes")];

impl EvidenceType {
    pub const ALL: [EvidenceType; 5] = [
        EvidenceType::TestResult,
        EvidenceType::CodeReview,
        EvidenceType::CommandOutput,
        EvidenceType::FunctionalTest,
        EvidenceType::ManualCheck,
    ];

    /// Return the stable string identifier used in records.
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceType::TestResult => "test_result",
            EvidenceType::CodeReview => "code_review",
            EvidenceType::CommandOutput => "command_output",
            EvidenceType::FunctionalTest => "functional_test",
            EvidenceType::ManualCheck => "manual_check",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }

    pub fn required_fields(&self) -> &'static [FieldSpec] {
        match self {
            EvidenceType::TestResult => TEST_RESULT_FIELDS,
            EvidenceType::CodeReview => CODE_REVIEW_FIELDS,
            EvidenceType::CommandOutput => COMMAND_OUTPUT_FIELDS,
            EvidenceType::FunctionalTest => FUNCTIONAL_TEST_FIELDS,
            EvidenceType::ManualCheck => MANUAL_CHECK_FIELDS,
        }
    }

    pub fn field_kind(&self, name: &str) -> Option<FieldKind> {
        self.required_fields()
            .iter()
            .find(|spec| spec.name == name)
            .map(|spec| spec.kind)
    }
}

impl fmt::Display for EvidenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check `fields` against the required set for `type_name`.
///
/// Every absent field is listed under `missing` and every present-but-bad
/// field under `invalid`; nothing is short-circuited.
pub fn validate_fields(
    type_name: &str,
    fields: &BTreeMap<String, Value>,
) -> Result<EvidenceType, SchemaError> {
    let kind = EvidenceType::parse(type_name)
        .ok_or_else(|| SchemaError::UnknownType(type_name.to_string()))?;
    let mut missing = Vec::new();
    let mut invalid = Vec::new();
    for spec in kind.required_fields() {
        match fields.get(spec.name) {
            None | Some(Value::Null) => missing.push(spec.name.to_string()),
            Some(value) => {
                if let Some(reason) = check_value(spec.kind, value) {
                    invalid.push(FieldIssue {
                        field: spec.name.to_string(),
                        reason,
                    });
                }
            }
        }
    }
    if missing.is_empty() && invalid.is_empty() {
        return Ok(kind);
    }
    Err(SchemaError::Fields {
        evidence_type: kind.as_str().to_string(),
        missing,
        invalid,
    })
}

fn check_value(kind: FieldKind, value: &Value) -> Option<String> {
    match kind {
        FieldKind::Integer => {
            if value.is_i64() || value.is_u64() {
                None
            } else {
                Some("expected integer".to_string())
            }
        }
        FieldKind::Text => {
            let empty = match value {
                Value::String(text) => text.trim().is_empty(),
                Value::Array(items) => items.is_empty(),
                Value::Object(map) => map.is_empty(),
                Value::Number(_) | Value::Bool(_) => false,
                Value::Null => true,
            };
            empty.then(|| "empty value".to_string())
        }
    }
}

/// Turn a `key=value` CLI string into JSON according to the declared kind.
///
/// Integer fields that do not parse stay strings so validation reports them
/// as invalid rather than silently dropping them.
pub fn coerce_cli_value(kind: Option<EvidenceType>, field: &str, raw: &str) -> Value {
    let declared = kind.and_then(|kind| kind.field_kind(field));
    match declared {
        Some(FieldKind::Integer) => match raw.trim().parse::<i64>() {
            Ok(number) => Value::from(number),
            Err(_) => Value::String(raw.to_string()),
        },
        _ => Value::String(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> BTreeMap<String, Value> {
        serde_json::from_value(value).expect("fields map")
    }

    #[test]
    fn complete_test_result_passes() {
        let kind = validate_fields(
            "test_result",
            &fields(json!({"test_command": "x", "exit_code": 1, "output_sample": "fail"})),
        )
        .expect("valid");
        assert_eq!(kind, EvidenceType::TestResult);
    }

    #[test]
    fn partial_test_result_names_missing_fields() {
        let err = validate_fields("test_result", &fields(json!({"test_command": "x"})))
            .expect_err("partial");
        assert_eq!(err.missing(), ["exit_code", "output_sample"]);
        assert!(err.invalid().is_empty());
    }

    #[test]
    fn empty_and_mistyped_values_are_invalid() {
        let err = validate_fields(
            "command_output",
            &fields(json!({"command": "  ", "exit_code": "zero", "output_sample": "ok"})),
        )
        .expect_err("invalid");
        let names: Vec<&str> = err.invalid().iter().map(|issue| issue.field.as_str()).collect();
        assert_eq!(names, ["command", "exit_code"]);
        assert!(err.to_string().contains("exit_code (expected integer)"));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = validate_fields("vibes", &BTreeMap::new()).expect_err("unknown");
        assert_eq!(err, SchemaError::UnknownType("vibes".to_string()));
    }

    #[test]
    fn every_type_declares_required_fields() {
        for kind in EvidenceType::ALL {
            assert!(!kind.required_fields().is_empty(), "{kind} has no fields");
            assert_eq!(EvidenceType::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn cli_values_follow_declared_kinds() {
        let kind = Some(EvidenceType::TestResult);
        assert_eq!(coerce_cli_value(kind, "exit_code", "3"), json!(3));
        assert_eq!(coerce_cli_value(kind, "exit_code", "x"), json!("x"));
        assert_eq!(coerce_cli_value(kind, "test_command", "42"), json!("42"));
        assert_eq!(coerce_cli_value(None, "extra", "1"), json!("1"));
    }
}
