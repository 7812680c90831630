use serde_json::{Map, Value};

use crate::error::ImportResult;

/// A typed field value, rendered to line protocol by the sink.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Boolean(bool),
    Integer(i64),
    UInteger(u64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    pub fn influx_type(&self) -> &'static str {
        match self {
            FieldValue::Boolean(_) => "boolean",
            FieldValue::Integer(_) => "integer",
            FieldValue::UInteger(_) => "unsigned",
            FieldValue::Float(_) => "float",
            FieldValue::Text(_) => "string",
        }
    }

    fn render(&self) -> String {
        match self {
            FieldValue::Boolean(value) => value.to_string(),
            FieldValue::Integer(value) => format!("{}i", value),
            FieldValue::UInteger(value) => format!("{}u", value),
            FieldValue::Float(value) => value.to_string(),
            FieldValue::Text(value) => {
                format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
            }
        }
    }
}

/// One destination write record: measurement, tags, typed fields, and a
/// nanosecond timestamp. Replaces ad-hoc builder objects with a single
/// value type every sink understands.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub table: String,
    pub tags: Vec<(String, String)>,
    pub fields: Vec<(String, FieldValue)>,
    pub timestamp_ns: Option<i64>,
}

impl WriteRecord {
    pub fn new(table: impl Into<String>) -> Self {
        WriteRecord {
            table: table.into(),
            tags: Vec::new(),
            fields: Vec::new(),
            timestamp_ns: None,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: FieldValue) -> Self {
        self.fields.push((key.into(), value));
        self
    }

    pub fn timestamp_ns(mut self, nanos: i64) -> Self {
        self.timestamp_ns = Some(nanos);
        self
    }

    pub fn has_fields(&self) -> bool {
        !self.fields.is_empty()
    }

    pub fn to_line_protocol(&self) -> String {
        let mut line = escape_measurement(&self.table);
        for (key, value) in &self.tags {
            line.push(',');
            line.push_str(&escape_key(key));
            line.push('=');
            line.push_str(&escape_key(value));
        }
        line.push(' ');
        let rendered: Vec<String> = self
            .fields
            .iter()
            .map(|(key, value)| format!("{}={}", escape_key(key), value.render()))
            .collect();
        line.push_str(&rendered.join(","));
        if let Some(nanos) = self.timestamp_ns {
            line.push(' ');
            line.push_str(&nanos.to_string());
        }
        line
    }
}

fn escape_measurement(name: &str) -> String {
    name.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_key(name: &str) -> String {
    name.replace(',', "\\,").replace('=', "\\=").replace(' ', "\\ ")
}

/// Destination write seam. Both migrated data and checkpoint records go
/// through this; `database` of None targets the default database.
#[async_trait::async_trait]
pub trait WriteSink: Send + Sync {
    async fn write_batch(&self, database: Option<&str>, records: &[WriteRecord])
        -> ImportResult<()>;
}

/// Local query seam over the destination/checkpoint store, returning rows
/// as column-name maps.
#[async_trait::async_trait]
pub trait StateQuery: Send + Sync {
    async fn query(&self, query: &str) -> ImportResult<Vec<Map<String, Value>>>;
}
