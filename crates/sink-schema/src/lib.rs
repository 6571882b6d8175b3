//! Translates the upstream's JSON-schema fragments into the warehouse's
//! column model.
//!
//! The mapping is deterministic and has no side effects: feed it the same
//! JSON-schema fragment twice and it returns the same [`Column`] list twice.
//! The one knob is `ignore_required`, which the hybrid engine always sets to
//! `true` so that nullability never blocks schema evolution (see the
//! `sink-engine` crate docs for why).

use serde_json::Value;
use std::fmt;

// ---------------------------------------------------------------------------
// Warehouse column model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    String,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Record,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::String => "STRING",
            ColumnType::Integer => "INTEGER",
            ColumnType::Float => "FLOAT",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Timestamp => "TIMESTAMP",
            ColumnType::Record => "RECORD",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnMode {
    Nullable,
    Required,
    Repeated,
}

impl ColumnMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnMode::Nullable => "NULLABLE",
            ColumnMode::Required => "REQUIRED",
            ColumnMode::Repeated => "REPEATED",
        }
    }
}

/// One warehouse column. `fields` is non-empty only for [`ColumnType::Record`]
/// columns (including repeated records).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
    pub mode: ColumnMode,
    pub description: Option<String>,
    pub fields: Vec<Column>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A JSON-schema fragment that doesn't have the shape this translator
/// expects. The translator is total over every fragment a well-behaved tap
/// actually produces; this is the escape hatch for fragments that don't.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaTranslateError {
    MissingProperties,
    MissingType { field: String },
    MissingItems { field: String },
}

impl fmt::Display for SchemaTranslateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaTranslateError::MissingProperties => {
                write!(f, "schema fragment has no 'properties' object")
            }
            SchemaTranslateError::MissingType { field } => {
                write!(f, "field '{field}' has neither 'type' nor a usable 'anyOf'")
            }
            SchemaTranslateError::MissingItems { field } => {
                write!(f, "array field '{field}' has no 'items' fragment")
            }
        }
    }
}

impl std::error::Error for SchemaTranslateError {}

// ---------------------------------------------------------------------------
// Translation
// ---------------------------------------------------------------------------

/// Translate every property of an `object`-shaped schema fragment into a
/// warehouse column list. Properties whose fragment is empty (`{}` or
/// otherwise falsy) are skipped rather than emitted as columns.
pub fn build_schema(
    schema: &Value,
    ignore_required: bool,
) -> Result<Vec<Column>, SchemaTranslateError> {
    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .ok_or(SchemaTranslateError::MissingProperties)?;

    let mut columns = Vec::with_capacity(properties.len());
    for (name, field) in properties {
        if !is_truthy(field) {
            continue;
        }
        columns.push(define_schema(field, name, ignore_required)?);
    }
    Ok(columns)
}

/// Translate a single property fragment into one [`Column`].
fn define_schema(
    field: &Value,
    name: &str,
    ignore_required: bool,
) -> Result<Column, SchemaTranslateError> {
    // Step 1: anyOf substitution when `type` is absent.
    let resolved: &Value = if field.get("type").is_none() {
        first_non_null_any_of(field, name)?
    } else {
        field
    };

    // Step 2: resolve mode + the raw type tag from a possibly-list `type`.
    let type_value = resolved
        .get("type")
        .ok_or_else(|| SchemaTranslateError::MissingType {
            field: name.to_string(),
        })?;

    let (mut mode, mut type_tag) = match type_value {
        Value::Array(tags) => {
            let first_is_null = tags.first().and_then(Value::as_str) == Some("null");
            let mode = if !first_is_null && !ignore_required {
                ColumnMode::Required
            } else {
                ColumnMode::Nullable
            };
            let last = tags
                .last()
                .and_then(Value::as_str)
                .unwrap_or("string")
                .to_string();
            (mode, last)
        }
        Value::String(s) => (ColumnMode::Nullable, s.clone()),
        _ => (ColumnMode::Nullable, "string".to_string()),
    };

    let mut fields = Vec::new();

    // Step 3 / 4: object and array expansion. Mirrors the reference
    // implementation's order — both checks run against whatever `type_tag`
    // resolved to above, and array expansion can itself resolve to RECORD.
    if type_tag == "object" {
        fields = build_schema(resolved, ignore_required)?;
    }
    if type_tag == "array" {
        let items = resolved
            .get("items")
            .ok_or_else(|| SchemaTranslateError::MissingItems {
                field: name.to_string(),
            })?;
        let element_tag = match items.get("type") {
            Some(Value::Array(tags)) => {
                tags.last().and_then(Value::as_str).unwrap_or("string").to_string()
            }
            Some(Value::String(s)) => s.clone(),
            _ => "string".to_string(),
        };
        mode = ColumnMode::Repeated;
        if element_tag == "object" {
            fields = build_schema(items, ignore_required)?;
            type_tag = "object".to_string();
        } else {
            type_tag = element_tag;
        }
    }

    // Step 5 / 6: string->timestamp promotion and number->float, evaluated
    // against the (possibly anyOf-substituted) enclosing fragment, even when
    // `type_tag` came from an array's `items` above.
    if type_tag == "string" && resolved.get("format").and_then(Value::as_str) == Some("date-time") {
        type_tag = "timestamp".to_string();
    }
    if type_tag == "number" {
        type_tag = "float".to_string();
    }

    let column_type = match type_tag.as_str() {
        "object" => ColumnType::Record,
        "integer" => ColumnType::Integer,
        "float" => ColumnType::Float,
        "boolean" => ColumnType::Boolean,
        "timestamp" => ColumnType::Timestamp,
        _ => ColumnType::String,
    };

    Ok(Column {
        name: name.to_string(),
        column_type,
        mode,
        description: None,
        fields,
    })
}

fn first_non_null_any_of<'a>(field: &'a Value, name: &str) -> Result<&'a Value, SchemaTranslateError> {
    let branches = field
        .get("anyOf")
        .and_then(Value::as_array)
        .ok_or_else(|| SchemaTranslateError::MissingType {
            field: name.to_string(),
        })?;

    branches
        .iter()
        .find(|branch| branch.get("type").and_then(Value::as_str) != Some("null"))
        .ok_or_else(|| SchemaTranslateError::MissingType {
            field: name.to_string(),
        })
}

fn is_truthy(field: &Value) -> bool {
    match field {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Object(m) => !m.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64() != Some(0.0),
    }
}
