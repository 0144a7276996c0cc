//! JSON-schema gating for cached candidates.
//!
//! When a request is in JSON_SCHEMA mode, a cached answer is only served if
//! its assistant content still validates against the schema the live request
//! carries. An invalid candidate is a silent rejection, never a request
//! error.

use serde_json::Value;

/// Outcome of validating a candidate's content against a request schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaCheck {
    Valid,
    /// Content failed validation, with the first error rendered.
    Invalid(String),
    /// Content was not parseable JSON at all.
    NotJson,
}

impl SchemaCheck {
    pub fn is_valid(&self) -> bool {
        matches!(self, SchemaCheck::Valid)
    }
}

/// Validate an assistant message's content against a JSON schema.
///
/// The content arrives as the raw string from the cached response; it must
/// parse as JSON and then satisfy the schema. A schema that itself fails to
/// compile rejects the candidate (a guard that cannot run must not pass).
pub fn check_content(schema: &Value, content: &str) -> SchemaCheck {
    let instance: Value = match serde_json::from_str(content) {
        Ok(v) => v,
        Err(_) => return SchemaCheck::NotJson,
    };

    match jsonschema::draft202012::new(schema) {
        Ok(validator) => match validator.iter_errors(&instance).next() {
            None => SchemaCheck::Valid,
            Some(error) => SchemaCheck::Invalid(error.to_string()),
        },
        Err(e) => SchemaCheck::Invalid(format!("schema failed to compile: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn user_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "age": {"type": "integer"},
            },
            "required": ["name"],
        })
    }

    #[test]
    fn conforming_content_passes() {
        let check = check_content(&user_schema(), r#"{"name": "Ada", "age": 36}"#);
        assert!(check.is_valid());
    }

    #[test]
    fn missing_required_field_fails() {
        let check = check_content(&user_schema(), r#"{"age": 36}"#);
        assert!(matches!(check, SchemaCheck::Invalid(_)));
    }

    #[test]
    fn wrong_type_fails() {
        let check = check_content(&user_schema(), r#"{"name": 42}"#);
        assert!(matches!(check, SchemaCheck::Invalid(_)));
    }

    #[test]
    fn non_json_content_is_not_json() {
        let check = check_content(&user_schema(), "plain prose answer");
        assert_eq!(check, SchemaCheck::NotJson);
    }

    #[test]
    fn broken_schema_rejects() {
        let schema = json!({"type": "no-such-type"});
        let check = check_content(&schema, r#"{}"#);
        assert!(matches!(check, SchemaCheck::Invalid(_)));
    }
}
