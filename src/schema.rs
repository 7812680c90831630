use std::collections::BTreeMap;

use crate::error::ImportResult;
use crate::source::{first_column_strings, SourceQueryExecutor};

/// Declared field type from the source's `SHOW FIELD KEYS` metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Boolean,
    Integer,
    Unsigned,
    Float,
    String,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Boolean => "boolean",
            FieldType::Integer => "integer",
            FieldType::Unsigned => "unsigned",
            FieldType::Float => "float",
            FieldType::String => "string",
        }
    }

    pub fn from_keyword(value: &str) -> Option<Self> {
        match value {
            "boolean" => Some(FieldType::Boolean),
            "integer" => Some(FieldType::Integer),
            "unsigned" => Some(FieldType::Unsigned),
            "float" => Some(FieldType::Float),
            "string" => Some(FieldType::String),
            _ => None,
        }
    }
}

/// Per-table schema discovered from source metadata: tag names plus field
/// names with their declared types. Derived once per table per run, never
/// persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableSchema {
    pub tag_keys: Vec<String>,
    pub field_types: BTreeMap<String, FieldType>,
}

impl TableSchema {
    /// Names present both as a tag and as a field. Reported to the
    /// orchestrator as a schema issue; the transcoder resolves them by
    /// renaming the tag.
    pub fn conflicts(&self) -> Vec<String> {
        self.tag_keys
            .iter()
            .filter(|tag| self.field_types.contains_key(*tag))
            .cloned()
            .collect()
    }

    /// `name -> name_tag` rename map for every conflicted tag.
    pub fn tag_renames(&self) -> BTreeMap<String, String> {
        self.conflicts()
            .into_iter()
            .map(|name| {
                let renamed = format!("{}_tag", name);
                (name, renamed)
            })
            .collect()
    }

    pub fn is_tag(&self, name: &str) -> bool {
        self.tag_keys.iter().any(|tag| tag == name)
    }
}

/// Lists measurements in the source database, keeping only names in the
/// filter when one is present. Sorted.
pub async fn discover_measurements(
    executor: &dyn SourceQueryExecutor,
    filter: Option<&[String]>,
) -> ImportResult<Vec<String>> {
    let result = executor.query("SHOW MEASUREMENTS").await?;
    let mut measurements = first_column_strings(&result);
    if let Some(filter) = filter {
        measurements.retain(|name| filter.contains(name));
    }
    measurements.sort();
    Ok(measurements)
}

pub async fn tag_keys(
    executor: &dyn SourceQueryExecutor,
    table: &str,
) -> ImportResult<Vec<String>> {
    let result = executor
        .query(&format!("SHOW TAG KEYS FROM \"{}\"", table))
        .await?;
    Ok(first_column_strings(&result))
}

pub async fn field_keys(
    executor: &dyn SourceQueryExecutor,
    table: &str,
) -> ImportResult<BTreeMap<String, FieldType>> {
    let result = executor
        .query(&format!("SHOW FIELD KEYS FROM \"{}\"", table))
        .await?;

    let mut fields = BTreeMap::new();
    for row in &result.rows {
        let name = row.first().and_then(|cell| cell.as_str());
        let declared = row.get(1).and_then(|cell| cell.as_str());
        if let (Some(name), Some(declared)) = (name, declared) {
            match FieldType::from_keyword(declared) {
                Some(field_type) => {
                    fields.insert(name.to_string(), field_type);
                }
                None => {
                    log::warn!(
                        "Unknown field type '{}' for '{}'.'{}', skipping",
                        declared,
                        table,
                        name
                    );
                }
            }
        }
    }
    Ok(fields)
}

/// Runs both metadata queries for one table.
pub async fn table_schema(
    executor: &dyn SourceQueryExecutor,
    table: &str,
) -> ImportResult<TableSchema> {
    let tag_keys = tag_keys(executor, table).await?;
    let field_types = field_keys(executor, table).await?;
    Ok(TableSchema {
        tag_keys,
        field_types,
    })
}
