use serde_json::Value;

use crate::schema::{FieldType, TableSchema};
use crate::sink::{FieldValue, WriteRecord};
use crate::source::ResultSet;
use crate::timestamps::parse_value_to_nanos;

/// Destination field names may not contain spaces.
fn sanitize_field_name(name: &str) -> String {
    name.replace(' ', "_")
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Does the cell satisfy its declared field type? Integers satisfy `float`
/// the way the source's own numeric widening does.
fn matches_declared(value: &Value, declared: FieldType) -> bool {
    match declared {
        FieldType::Boolean => value.is_boolean(),
        FieldType::Integer => value.as_i64().is_some(),
        FieldType::Unsigned => value.as_u64().is_some(),
        FieldType::Float => value.is_number(),
        FieldType::String => value.is_string(),
    }
}

fn coerce_declared(value: &Value, declared: FieldType) -> Option<FieldValue> {
    match declared {
        FieldType::Boolean => value.as_bool().map(FieldValue::Boolean),
        FieldType::Integer => value.as_i64().map(FieldValue::Integer),
        FieldType::Unsigned => value.as_u64().map(FieldValue::UInteger),
        FieldType::Float => value.as_f64().map(FieldValue::Float),
        FieldType::String => value.as_str().map(|s| FieldValue::Text(s.to_string())),
    }
}

/// Infers the value's actual type, in order: boolean, integer, unsigned,
/// float, string. Anything else is stringified.
fn infer_field_value(value: &Value) -> FieldValue {
    match value {
        Value::Bool(flag) => FieldValue::Boolean(*flag),
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                FieldValue::Integer(int)
            } else if let Some(uint) = number.as_u64() {
                FieldValue::UInteger(uint)
            } else {
                FieldValue::Float(number.as_f64().unwrap_or_default())
            }
        }
        Value::String(text) => FieldValue::Text(text.clone()),
        other => FieldValue::Text(other.to_string()),
    }
}

/// Column roles resolved against the schema for one result set.
#[derive(Debug, Default, PartialEq)]
struct ColumnPlan {
    /// (column index, destination tag name after conflict renaming)
    tags: Vec<(usize, String)>,
    /// (column index, source field name, declared type)
    fields: Vec<(usize, String, FieldType)>,
}

/// Classifies each non-time column as tag or field. Conflicted names follow
/// the source's own output conventions: a `{name}_1` column is the renamed
/// tag duplicate; a plain conflicted column with a `_1` sibling is the
/// field; a plain conflicted column without one is decided by checking the
/// first row's value against the declared field type.
fn classify_columns(
    columns: &[String],
    first_row: &[Value],
    schema: &TableSchema,
) -> ColumnPlan {
    let renames = schema.tag_renames();
    let renamed_tag = |name: &str| {
        renames
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    };
    let has_sibling =
        |name: &str| columns.iter().any(|col| *col == format!("{}_1", name));

    let mut plan = ColumnPlan::default();
    for (index, column) in columns.iter().enumerate() {
        if column == "time" {
            continue;
        }

        let declared = schema.field_types.get(column).copied();
        let is_tag = schema.is_tag(column);

        if is_tag && declared.is_none() {
            plan.tags.push((index, renamed_tag(column)));
            continue;
        }

        if let Some(base) = column.strip_suffix("_1") {
            if schema.is_tag(base) && schema.field_types.contains_key(base) {
                // Renamed tag duplicate of a conflicted column.
                plan.tags.push((index, renamed_tag(base)));
                continue;
            }
        }

        if let Some(declared) = declared {
            if is_tag && !has_sibling(column) {
                let first = first_row.get(index).unwrap_or(&Value::Null);
                if matches_declared(first, declared) {
                    plan.fields.push((index, column.clone(), declared));
                } else {
                    plan.tags.push((index, renamed_tag(column)));
                }
                continue;
            }
            plan.fields.push((index, column.clone(), declared));
        }
    }
    plan
}

/// Converts one window's result set into destination write records. Returns
/// the records plus the number of rows dropped for yielding no usable
/// fields or an unparseable timestamp.
pub fn to_write_records(
    table: &str,
    result: &ResultSet,
    schema: &TableSchema,
) -> (Vec<WriteRecord>, usize) {
    if result.rows.is_empty() {
        return (Vec::new(), 0);
    }

    let renames = schema.tag_renames();
    let plan = classify_columns(&result.columns, &result.rows[0], schema);
    let time_idx = result.time_column_index();

    let mut records = Vec::with_capacity(result.rows.len());
    let mut dropped = 0usize;

    for row in &result.rows {
        let mut record = WriteRecord::new(table);

        // GROUP BY tags arrive out of band, once per series.
        for (key, value) in &result.tags {
            let renamed = renames.get(key).cloned().unwrap_or_else(|| key.clone());
            record = record.tag(renamed, stringify(value));
        }

        for (index, name) in &plan.tags {
            match row.get(*index) {
                Some(Value::Null) | None => {}
                Some(value) => record = record.tag(name.clone(), stringify(value)),
            }
        }

        for (index, name, declared) in &plan.fields {
            let value = match row.get(*index) {
                Some(Value::Null) | None => continue,
                Some(value) => value,
            };
            if matches_declared(value, *declared) {
                if let Some(field) = coerce_declared(value, *declared) {
                    record = record.field(sanitize_field_name(name), field);
                }
            } else {
                let field = infer_field_value(value);
                let fallback = sanitize_field_name(&format!("{}_{}", name, field.influx_type()));
                log::warn!(
                    "Type mismatch for '{}': expected {}, got {}. Creating field '{}'",
                    name,
                    declared.as_str(),
                    field.influx_type(),
                    fallback
                );
                record = record.field(fallback, field);
            }
        }

        if !record.has_fields() {
            dropped += 1;
            continue;
        }

        match row.get(time_idx).map(parse_value_to_nanos) {
            Some(Ok(nanos)) => records.push(record.timestamp_ns(nanos)),
            _ => {
                log::warn!("Unparseable timestamp in '{}' row, dropping", table);
                dropped += 1;
            }
        }
    }

    (records, dropped)
}
