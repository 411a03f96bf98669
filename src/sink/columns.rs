//! Columnar batch builder: accumulates decoded JSON records into per-column
//! buffers matching a sink's declared `ColumnMapping`s, coercing each field
//! to its declared ClickHouse type. A coercion failure is message-local (row
//! granularity), not a batch failure.

use serde_json::Value;

use crate::config::{ColumnMapping, ColumnType};

/// One column's accumulated values, typed loosely as JSON so the insert
/// layer can bind without a generic column-type dispatch table.
#[derive(Debug, Clone, Default)]
pub struct ColumnBuffer {
    pub name: String,
    pub values: Vec<Value>,
}

pub struct BatchBuilder {
    mappings: Vec<ColumnMapping>,
    columns: Vec<ColumnBuffer>,
    rows: usize,
}

impl BatchBuilder {
    pub fn new(mappings: Vec<ColumnMapping>) -> Self {
        let columns = mappings
            .iter()
            .map(|m| ColumnBuffer {
                name: m.column_name.clone(),
                values: Vec::new(),
            })
            .collect();
        Self {
            mappings,
            columns,
            rows: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Appends one record's fields, coercing each to its column type.
    /// Returns `Err` with the offending column name on the first coercion
    /// failure; nothing is appended to any column when a row is rejected.
    pub fn push_row(&mut self, record: &Value) -> Result<(), String> {
        let mut coerced = Vec::with_capacity(self.mappings.len());
        for mapping in &self.mappings {
            let raw = lookup_path(record, &mapping.source_field);
            let value = coerce(raw, &mapping.column_type, mapping.nullable)
                .map_err(|e| format!("column '{}': {}", mapping.column_name, e))?;
            coerced.push(value);
        }

        for (col, value) in self.columns.iter_mut().zip(coerced) {
            col.values.push(value);
        }
        self.rows += 1;
        Ok(())
    }

    pub fn columns(&self) -> &[ColumnBuffer] {
        &self.columns
    }

    pub fn clear(&mut self) {
        for col in &mut self.columns {
            col.values.clear();
        }
        self.rows = 0;
    }
}

fn lookup_path<'a>(body: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = body;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn coerce(raw: Option<&Value>, column_type: &ColumnType, nullable: bool) -> Result<Value, String> {
    let raw = match raw {
        Some(v) if !v.is_null() => v,
        _ if nullable => return Ok(Value::Null),
        _ => return Err("missing value for non-nullable column".to_string()),
    };

    let ok = match column_type {
        ColumnType::Int8
        | ColumnType::Int16
        | ColumnType::Int32
        | ColumnType::Int64
        | ColumnType::UInt8
        | ColumnType::UInt16
        | ColumnType::UInt32
        | ColumnType::UInt64 => raw.is_i64() || raw.is_u64(),
        ColumnType::Float32 | ColumnType::Float64 => raw.is_number(),
        ColumnType::Bool => raw.is_boolean(),
        ColumnType::String | ColumnType::LowCardinalityString => raw.is_string(),
        ColumnType::FixedString { length } => raw.as_str().map(|s| s.len() <= *length).unwrap_or(false),
        ColumnType::DateTime | ColumnType::DateTime64 { .. } => raw.is_string() || raw.is_number(),
        ColumnType::Uuid => raw.is_string(),
        ColumnType::Array { .. } => raw.is_array(),
        ColumnType::Map { .. } => raw.is_object(),
    };

    if ok {
        Ok(raw.clone())
    } else {
        Err(format!("value {} is not coercible to {:?}", raw, column_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mappings() -> Vec<ColumnMapping> {
        vec![
            ColumnMapping {
                source_field: "id".into(),
                column_name: "id".into(),
                column_type: ColumnType::Int64,
                nullable: false,
            },
            ColumnMapping {
                source_field: "name".into(),
                column_name: "name".into(),
                column_type: ColumnType::String,
                nullable: false,
            },
            ColumnMapping {
                source_field: "region".into(),
                column_name: "region".into(),
                column_type: ColumnType::String,
                nullable: true,
            },
        ]
    }

    #[test]
    fn accepts_and_buffers_matching_row() {
        let mut builder = BatchBuilder::new(mappings());
        builder.push_row(&json!({"id": 1, "name": "a"})).unwrap();
        assert_eq!(builder.len(), 1);
        assert_eq!(builder.columns()[0].values[0], json!(1));
    }

    #[test]
    fn rejects_type_mismatch_without_partial_append() {
        let mut builder = BatchBuilder::new(mappings());
        let err = builder.push_row(&json!({"id": "not-a-number", "name": "a"}));
        assert!(err.is_err());
        assert_eq!(builder.len(), 0);
    }

    #[test]
    fn nullable_column_accepts_missing_value() {
        let mut builder = BatchBuilder::new(mappings());
        builder.push_row(&json!({"id": 1, "name": "a"})).unwrap();
        assert_eq!(builder.columns()[2].values[0], Value::Null);
    }

    #[test]
    fn clear_resets_rows_and_columns() {
        let mut builder = BatchBuilder::new(mappings());
        builder.push_row(&json!({"id": 1, "name": "a"})).unwrap();
        builder.clear();
        assert_eq!(builder.len(), 0);
        assert!(builder.columns()[0].values.is_empty());
    }
}
