//! Standard endpoint parameters and their query-string serialization.

use crate::metadata::{DateKind, ValueDesc, ValueKind};
use crate::model::convert::format_date;
use crate::model::FieldValue;
use std::collections::BTreeMap;

/// Encode one query-string component, leaving unreserved characters alone.
pub fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// A chosen server-side data source plus its parameter values.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSourceInstance {
    pub name: String,
    pub params: BTreeMap<String, FieldValue>,
}

impl DataSourceInstance {
    pub fn new(name: &str) -> Self {
        DataSourceInstance {
            name: name.to_string(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }
}

/// Parameters accepted by every data-returning endpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataSourceParams {
    /// Server-interpreted hint for which related data to include.
    pub includes: Option<String>,
    pub data_source: Option<DataSourceInstance>,
}

/// Parameters for endpoints that filter (list and count).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterParams {
    pub source: DataSourceParams,
    pub search: Option<String>,
    /// Field name to filter value. Values are already strings on the wire.
    pub filter: BTreeMap<String, String>,
}

/// Parameters for the list endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ListParams {
    pub filter: FilterParams,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    pub order_by: Option<String>,
    pub order_by_descending: Option<String>,
    /// Restrict returned objects to these fields. Repeated on the wire.
    pub fields: Vec<String>,
    /// Ask the server to skip computing a total count.
    pub no_count: bool,
}

impl Default for ListParams {
    fn default() -> Self {
        ListParams {
            filter: FilterParams::default(),
            page: Some(1),
            page_size: Some(10),
            order_by: None,
            order_by_descending: None,
            fields: Vec::new(),
            no_count: false,
        }
    }
}

impl DataSourceParams {
    pub fn to_query(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        self.push_query(&mut out);
        out
    }

    fn push_query(&self, out: &mut Vec<(String, String)>) {
        push_opt(out, "includes", self.includes.as_deref());
        if let Some(source) = &self.data_source {
            out.push(("dataSource".to_string(), source.name.clone()));
            for (name, value) in &source.params {
                if let Some(s) = loose_query_string(value) {
                    out.push((format!("dataSource.{}", name), s));
                }
            }
        }
    }
}

impl FilterParams {
    pub fn to_query(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        self.push_query(&mut out);
        out
    }

    fn push_query(&self, out: &mut Vec<(String, String)>) {
        self.source.push_query(out);
        push_opt(out, "search", self.search.as_deref());
        for (field, value) in &self.filter {
            out.push((format!("filter.{}", field), value.clone()));
        }
    }
}

impl ListParams {
    pub fn to_query(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        self.filter.push_query(&mut out);
        if let Some(page) = self.page {
            out.push(("page".to_string(), page.to_string()));
        }
        if let Some(size) = self.page_size {
            out.push(("pageSize".to_string(), size.to_string()));
        }
        push_opt(&mut out, "orderBy", self.order_by.as_deref());
        push_opt(&mut out, "orderByDescending", self.order_by_descending.as_deref());
        if self.no_count {
            out.push(("noCount".to_string(), "true".to_string()));
        }
        for field in &self.fields {
            out.push(("fields".to_string(), field.clone()));
        }
        out
    }
}

fn push_opt(out: &mut Vec<(String, String)>, key: &str, value: Option<&str>) {
    if let Some(v) = value {
        out.push((key.to_string(), v.to_string()));
    }
}

/// Query-string form of a value with no descriptor available. Collections
/// serialize as JSON so they survive the round trip.
pub fn loose_query_string(value: &FieldValue) -> Option<String> {
    match value {
        FieldValue::Null => None,
        FieldValue::String(s) => Some(s.clone()),
        FieldValue::Int(n) => Some(n.to_string()),
        FieldValue::Float(f) => Some(f.to_string()),
        FieldValue::Bool(b) => Some(b.to_string()),
        FieldValue::Date(d) => Some(d.to_rfc3339()),
        FieldValue::Binary(bytes) => {
            use base64::Engine;
            Some(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
        FieldValue::List(_) => serde_json::to_string(&loose_json(value)).ok(),
        FieldValue::File(_) | FieldValue::Object(_) | FieldValue::WeakObject(_) => None,
    }
}

/// Query-string form of a value whose descriptor is known. Dates follow
/// the property's wire format.
pub fn value_to_query_string(desc: &ValueDesc, value: &FieldValue) -> Option<String> {
    match (&desc.kind, value) {
        (ValueKind::Date(kind), FieldValue::Date(d)) => Some(format_date(*kind, d)),
        (ValueKind::Collection(_), FieldValue::List(_)) => {
            serde_json::to_string(&loose_json(value)).ok()
        }
        _ => loose_query_string(value),
    }
}

fn loose_json(value: &FieldValue) -> serde_json::Value {
    use serde_json::Value;
    match value {
        FieldValue::Null => Value::Null,
        FieldValue::Bool(b) => Value::Bool(*b),
        FieldValue::Int(n) => Value::Number((*n).into()),
        FieldValue::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        FieldValue::String(s) => Value::String(s.clone()),
        FieldValue::Date(d) => Value::String(format_date(DateKind::DateTimeOffset, d)),
        FieldValue::Binary(bytes) => {
            use base64::Engine;
            Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
        FieldValue::List(items) => Value::Array(items.iter().map(loose_json).collect()),
        FieldValue::File(_) | FieldValue::Object(_) | FieldValue::WeakObject(_) => Value::Null,
    }
}
