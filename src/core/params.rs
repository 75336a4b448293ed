//! Per-job-type parameter schemas
//!
//! Parameters are opaque JSON to the engine, but each job type declares the
//! fields it needs so bad requests are rejected before a job is stored.

use crate::core::error::{EngineError, Result};
use crate::core::job::JobType;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use tracing::debug;

const MIN_SAMPLE_SIZE: i64 = 100;
const MAX_SAMPLE_SIZE: i64 = 1_000_000;

/// Expected shape of one parameter
#[derive(Debug, Clone, Copy)]
enum FieldKind {
    Text,
    /// Table or column identifier, optionally schema-qualified
    Identifier,
    Identifiers,
    Strings,
    Integer { min: i64, max: i64 },
    Object,
    Array,
    OneOf(&'static [&'static str]),
}

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    kind: FieldKind,
    required: bool,
}

const fn required(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec { name, kind, required: true }
}

const fn optional(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec { name, kind, required: false }
}

const SAMPLE_SIZE: FieldKind = FieldKind::Integer {
    min: MIN_SAMPLE_SIZE,
    max: MAX_SAMPLE_SIZE,
};

const INGEST: &[FieldSpec] = &[
    required("source_id", FieldKind::Text),
    optional("mode", FieldKind::OneOf(&["full", "incremental"])),
    optional("tables", FieldKind::Identifiers),
];

const PROFILE: &[FieldSpec] = &[
    required("source_id", FieldKind::Text),
    optional("table", FieldKind::Identifier),
    optional("sample_size", SAMPLE_SIZE),
];

const QUALITY: &[FieldSpec] = &[
    required("source_id", FieldKind::Text),
    optional("table", FieldKind::Identifier),
    optional("checks", FieldKind::Strings),
];

const KPI: &[FieldSpec] = &[
    required("sql", FieldKind::Text),
    optional("source_id", FieldKind::Text),
    optional("parameters", FieldKind::Object),
];

const ANALYZE: &[FieldSpec] = &[
    required("source_id", FieldKind::Text),
    optional("tables", FieldKind::Identifiers),
    optional("sample_size", SAMPLE_SIZE),
    optional("kpis", FieldKind::Array),
];

const PRESET: &[FieldSpec] = &[
    required("preset_name", FieldKind::Text),
    required("source_id", FieldKind::Text),
    optional("parameters", FieldKind::Object),
];

fn schema_for(job_type: JobType) -> &'static [FieldSpec] {
    match job_type {
        JobType::Ingest => INGEST,
        JobType::Profile => PROFILE,
        JobType::Quality => QUALITY,
        JobType::Kpi => KPI,
        JobType::Analyze => ANALYZE,
        JobType::Preset => PRESET,
    }
}

fn identifier_regex() -> &'static Regex {
    static IDENTIFIER: OnceLock<Regex> = OnceLock::new();
    IDENTIFIER.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$")
            .unwrap_or_else(|e| unreachable!("identifier pattern is valid: {e}"))
    })
}

/// Whether `name` is a valid (optionally schema-qualified) table identifier
pub fn is_identifier(name: &str) -> bool {
    identifier_regex().is_match(name)
}

/// Check `params` against the schema declared for `job_type`
pub fn validate_params(job_type: JobType, params: &Value) -> Result<()> {
    let object = params.as_object().ok_or_else(|| {
        EngineError::Validation(format!("{} params must be a JSON object", job_type))
    })?;

    let schema = schema_for(job_type);
    for spec in schema {
        match object.get(spec.name) {
            None | Some(Value::Null) if spec.required => {
                return Err(EngineError::Validation(format!(
                    "{} job requires '{}'",
                    job_type, spec.name
                )));
            }
            None | Some(Value::Null) => {}
            Some(value) => check_field(job_type, spec, value)?,
        }
    }

    for key in object.keys() {
        if !schema.iter().any(|spec| spec.name == key) {
            debug!("Ignoring unknown {} parameter '{}'", job_type, key);
        }
    }

    Ok(())
}

fn check_field(job_type: JobType, spec: &FieldSpec, value: &Value) -> Result<()> {
    let invalid = |reason: String| {
        EngineError::Validation(format!("{} parameter '{}' {}", job_type, spec.name, reason))
    };

    match spec.kind {
        FieldKind::Text => match value.as_str() {
            Some(s) if !s.trim().is_empty() => Ok(()),
            Some(_) => Err(invalid("must not be empty".to_string())),
            None => Err(invalid("must be a string".to_string())),
        },
        FieldKind::Identifier => match value.as_str() {
            Some(s) if is_identifier(s) => Ok(()),
            Some(s) => Err(invalid(format!("is not a valid identifier: '{}'", s))),
            None => Err(invalid("must be a string".to_string())),
        },
        FieldKind::Identifiers => {
            let items = value
                .as_array()
                .ok_or_else(|| invalid("must be an array of identifiers".to_string()))?;
            for item in items {
                match item.as_str() {
                    Some(s) if is_identifier(s) => {}
                    _ => return Err(invalid(format!("contains an invalid identifier: {}", item))),
                }
            }
            Ok(())
        }
        FieldKind::Strings => {
            let items = value
                .as_array()
                .ok_or_else(|| invalid("must be an array of strings".to_string()))?;
            if items.iter().all(Value::is_string) {
                Ok(())
            } else {
                Err(invalid("must contain only strings".to_string()))
            }
        }
        FieldKind::Integer { min, max } => match value.as_i64() {
            Some(n) if (min..=max).contains(&n) => Ok(()),
            Some(n) => Err(invalid(format!("must be between {} and {}, got {}", min, max, n))),
            None => Err(invalid("must be an integer".to_string())),
        },
        FieldKind::Object => {
            if value.is_object() {
                Ok(())
            } else {
                Err(invalid("must be an object".to_string()))
            }
        }
        FieldKind::Array => {
            if value.is_array() {
                Ok(())
            } else {
                Err(invalid("must be an array".to_string()))
            }
        }
        FieldKind::OneOf(choices) => match value.as_str() {
            Some(s) if choices.contains(&s) => Ok(()),
            _ => Err(invalid(format!("must be one of {:?}", choices))),
        },
    }
}

/// Tables named by `table` and/or `tables`, in declaration order
pub fn tables_from_params(params: &Value) -> Vec<String> {
    let mut tables = Vec::new();
    if let Some(table) = params.get("table").and_then(Value::as_str) {
        tables.push(table.to_string());
    }
    if let Some(items) = params.get("tables").and_then(Value::as_array) {
        for table in items.iter().filter_map(Value::as_str) {
            if !tables.iter().any(|t| t == table) {
                tables.push(table.to_string());
            }
        }
    }
    tables
}
