//! Optional record validation against a stream's declared JSON schema
//! (`validate_records`, default `true`). Validation failures are fatal —
//! unlike everything else this engine handles, they abort the run rather
//! than being quarantined into `failed_lines`.

use serde_json::Value;

/// Validate `record` against `schema`. `Err` carries a human-readable
/// description of the first violation; the caller decides whether that's
/// fatal.
pub fn validate_record(schema: &Value, record: &Value) -> Result<(), String> {
    let compiled =
        jsonschema::JSONSchema::compile(schema).map_err(|err| format!("invalid schema: {err}"))?;

    match compiled.validate(record) {
        Ok(()) => Ok(()),
        Err(errors) => {
            let messages: Vec<String> = errors.map(|e| e.to_string()).collect();
            Err(messages.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_record_passes() {
        let schema = json!({
            "type": "object",
            "properties": {"id": {"type": "integer"}},
            "required": ["id"]
        });
        assert!(validate_record(&schema, &json!({"id": 1})).is_ok());
    }

    #[test]
    fn record_missing_required_field_fails() {
        let schema = json!({
            "type": "object",
            "properties": {"id": {"type": "integer"}},
            "required": ["id"]
        });
        assert!(validate_record(&schema, &json!({})).is_err());
    }

    #[test]
    fn wrong_type_fails() {
        let schema = json!({
            "type": "object",
            "properties": {"id": {"type": "integer"}}
        });
        assert!(validate_record(&schema, &json!({"id": "not-a-number"})).is_err());
    }
}
