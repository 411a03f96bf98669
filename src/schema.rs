//! Schema validation for inbound records. The expression-language validator
//! referenced in a pipeline's mapper config is an external collaborator; what
//! lives here is the structural JSON-field validator used when no such
//! validator is wired in, so DLQ coverage for validation failures is testable
//! end to end without it.

use serde_json::Value;

use crate::config::{MapperFieldConfig, MapperFieldType};

/// Validates a decoded record body against a field list. Kept as a trait so
/// the processor can be driven by a fake in tests or swapped for the real
/// expression-language validator without touching call sites.
pub trait SchemaValidator: Send + Sync {
    fn validate(&self, topic: &str, body: &Value) -> Result<(), String>;
}

/// Default structural validator: checks required-field presence and a loose
/// type match for every field the topic's mapper declares. Unknown fields are
/// ignored; this only rejects records missing or mistyping declared fields.
pub struct StructuralValidator {
    fields: std::collections::HashMap<String, Vec<MapperFieldConfig>>,
}

impl StructuralValidator {
    pub fn new(fields: std::collections::HashMap<String, Vec<MapperFieldConfig>>) -> Self {
        Self { fields }
    }
}

impl SchemaValidator for StructuralValidator {
    fn validate(&self, topic: &str, body: &Value) -> Result<(), String> {
        let Some(fields) = self.fields.get(topic) else {
            return Ok(());
        };

        for field in fields {
            let value = lookup_path(body, &field.field_path);
            match value {
                None if field.required => {
                    return Err(format!("missing required field '{}'", field.field_path));
                }
                None => continue,
                Some(v) => {
                    if !type_matches(v, field.field_type) {
                        return Err(format!(
                            "field '{}' does not match declared type {:?}",
                            field.field_path, field.field_type
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

fn lookup_path<'a>(body: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = body;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn type_matches(value: &Value, expected: MapperFieldType) -> bool {
    match expected {
        MapperFieldType::Any => true,
        MapperFieldType::String => value.is_string(),
        MapperFieldType::Integer => value.is_i64() || value.is_u64(),
        MapperFieldType::Float => value.is_number(),
        MapperFieldType::Bool => value.is_boolean(),
        MapperFieldType::Object => value.is_object(),
        MapperFieldType::Array => value.is_array(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validator() -> StructuralValidator {
        let mut fields = std::collections::HashMap::new();
        fields.insert(
            "orders".to_string(),
            vec![
                MapperFieldConfig {
                    field_path: "order_id".into(),
                    required: true,
                    field_type: MapperFieldType::String,
                },
                MapperFieldConfig {
                    field_path: "amount".into(),
                    required: true,
                    field_type: MapperFieldType::Float,
                },
                MapperFieldConfig {
                    field_path: "metadata.region".into(),
                    required: false,
                    field_type: MapperFieldType::String,
                },
            ],
        );
        StructuralValidator::new(fields)
    }

    #[test]
    fn accepts_well_formed_record() {
        let body = json!({"order_id": "o-1", "amount": 9.99});
        assert!(validator().validate("orders", &body).is_ok());
    }

    #[test]
    fn rejects_missing_required_field() {
        let body = json!({"amount": 9.99});
        assert!(validator().validate("orders", &body).is_err());
    }

    #[test]
    fn rejects_wrong_type() {
        let body = json!({"order_id": "o-1", "amount": "not-a-number"});
        assert!(validator().validate("orders", &body).is_err());
    }

    #[test]
    fn ignores_optional_missing_nested_field() {
        let body = json!({"order_id": "o-1", "amount": 1.0});
        assert!(validator().validate("orders", &body).is_ok());
    }

    #[test]
    fn unknown_topic_passes_through() {
        let body = json!({"anything": true});
        assert!(validator().validate("unmapped_topic", &body).is_ok());
    }
}
