//! Conversion between wire JSON, loose inputs, and typed model graphs.

use super::{FieldValue, ModelObject};
use crate::error::DataError;
use crate::metadata::{DateKind, Domain, Role, ValueDesc, ValueKind};
use base64::Engine;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use std::collections::{HashMap, HashSet};

/// Coerce a loose field value to the shape its descriptor declares. Null
/// always passes through. Strings parse to numbers, booleans, dates, enum
/// members and collections; numbers parse to dates (unix millis) and enum
/// members. Anything unrepresentable is an error, never a silent change.
pub fn parse_value(
    domain: &Domain,
    desc: &ValueDesc,
    value: FieldValue,
) -> Result<FieldValue, DataError> {
    if value.is_null() {
        return Ok(FieldValue::Null);
    }
    match &desc.kind {
        ValueKind::String => parse_string(desc, value),
        ValueKind::Number => parse_number(desc, value),
        ValueKind::Boolean => parse_boolean(desc, value),
        ValueKind::Date(_) => parse_date(desc, value),
        ValueKind::Enum(name) => parse_enum(domain, desc, name, value),
        ValueKind::Binary => parse_binary(desc, value),
        ValueKind::File => match value {
            FieldValue::File(f) => Ok(FieldValue::File(f)),
            other => Err(DataError::parse(
                &desc.name,
                kind_of(&other),
                "file values cannot be parsed from data",
            )),
        },
        ValueKind::Object(type_name) | ValueKind::Model(type_name) => match value {
            FieldValue::Object(o) if o.type_name() == *type_name => Ok(FieldValue::Object(o)),
            FieldValue::WeakObject(w) => Ok(FieldValue::WeakObject(w)),
            FieldValue::Object(o) => Err(DataError::TypeMismatch {
                expected: type_name.clone(),
                actual: o.type_name(),
            }),
            other => Err(DataError::TypeMismatch {
                expected: type_name.clone(),
                actual: kind_of(&other).to_string(),
            }),
        },
        ValueKind::Collection(item) => parse_collection(domain, desc, item, value),
    }
}

fn parse_string(desc: &ValueDesc, value: FieldValue) -> Result<FieldValue, DataError> {
    match value {
        FieldValue::String(s) => Ok(FieldValue::String(s)),
        FieldValue::Int(n) => Ok(FieldValue::String(n.to_string())),
        FieldValue::Float(f) => Ok(FieldValue::String(f.to_string())),
        FieldValue::Bool(b) => Ok(FieldValue::String(b.to_string())),
        FieldValue::Date(d) => Ok(FieldValue::String(d.to_rfc3339())),
        other => Err(DataError::parse(
            &desc.name,
            kind_of(&other),
            "cannot represent as string",
        )),
    }
}

fn parse_number(desc: &ValueDesc, value: FieldValue) -> Result<FieldValue, DataError> {
    match value {
        FieldValue::Int(n) => Ok(FieldValue::Int(n)),
        FieldValue::Float(f) => Ok(FieldValue::Float(f)),
        FieldValue::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Ok(FieldValue::Null);
            }
            if let Ok(n) = trimmed.parse::<i64>() {
                return Ok(FieldValue::Int(n));
            }
            match trimmed.parse::<f64>() {
                Ok(f) => Ok(FieldValue::Float(f)),
                Err(_) => Err(DataError::parse(&desc.name, &s, "not a number")),
            }
        }
        other => Err(DataError::TypeMismatch {
            expected: "number".into(),
            actual: kind_of(&other).to_string(),
        }),
    }
}

fn parse_boolean(desc: &ValueDesc, value: FieldValue) -> Result<FieldValue, DataError> {
    match value {
        FieldValue::Bool(b) => Ok(FieldValue::Bool(b)),
        FieldValue::String(s) => match s.trim() {
            "true" => Ok(FieldValue::Bool(true)),
            "false" => Ok(FieldValue::Bool(false)),
            _ => Err(DataError::parse(&desc.name, &s, "not a boolean")),
        },
        other => Err(DataError::TypeMismatch {
            expected: "boolean".into(),
            actual: kind_of(&other).to_string(),
        }),
    }
}

fn parse_date(desc: &ValueDesc, value: FieldValue) -> Result<FieldValue, DataError> {
    match value {
        FieldValue::Date(d) => Ok(FieldValue::Date(d)),
        FieldValue::String(s) => parse_date_str(s.trim())
            .map(FieldValue::Date)
            .ok_or_else(|| DataError::parse(&desc.name, &s, "not a recognized date")),
        // Unix epoch milliseconds.
        FieldValue::Int(ms) => DateTime::from_timestamp_millis(ms)
            .map(|d| FieldValue::Date(d.fixed_offset()))
            .ok_or_else(|| DataError::parse(&desc.name, ms, "timestamp out of range")),
        FieldValue::Float(ms) => DateTime::from_timestamp_millis(ms as i64)
            .map(|d| FieldValue::Date(d.fixed_offset()))
            .ok_or_else(|| DataError::parse(&desc.name, ms, "timestamp out of range")),
        other => Err(DataError::TypeMismatch {
            expected: "date".into(),
            actual: kind_of(&other).to_string(),
        }),
    }
}

/// Accepts RFC 3339, offset-less datetimes (taken as UTC), bare dates, and
/// bare times (anchored to the epoch date).
fn parse_date_str(s: &str) -> Option<DateTime<FixedOffset>> {
    if let Ok(d) = DateTime::parse_from_rfc3339(s) {
        return Some(d);
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive).fixed_offset());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        let naive = date.and_hms_opt(0, 0, 0)?;
        return Some(Utc.from_utc_datetime(&naive).fixed_offset());
    }
    if let Ok(time) = NaiveTime::parse_from_str(s, "%H:%M:%S%.f") {
        let naive = NaiveDate::from_ymd_opt(1970, 1, 1)?.and_time(time);
        return Some(Utc.from_utc_datetime(&naive).fixed_offset());
    }
    None
}

/// Enum values accept any integer so flag combinations survive, a member
/// string value, or an integer-looking string.
fn parse_enum(
    domain: &Domain,
    desc: &ValueDesc,
    enum_name: &str,
    value: FieldValue,
) -> Result<FieldValue, DataError> {
    let enum_type = domain.enumeration(enum_name)?;
    match value {
        FieldValue::Int(n) => Ok(FieldValue::Int(n)),
        FieldValue::Float(f) if f.fract() == 0.0 => Ok(FieldValue::Int(f as i64)),
        FieldValue::String(s) => {
            let trimmed = s.trim();
            if let Some(member) = enum_type.by_str(trimmed) {
                return Ok(FieldValue::Int(member.value));
            }
            match trimmed.parse::<i64>() {
                Ok(n) => Ok(FieldValue::Int(n)),
                Err(_) => Err(DataError::parse(
                    &desc.name,
                    &s,
                    "not a member of the enum",
                )),
            }
        }
        other => Err(DataError::TypeMismatch {
            expected: format!("enum {}", enum_name),
            actual: kind_of(&other).to_string(),
        }),
    }
}

fn parse_binary(desc: &ValueDesc, value: FieldValue) -> Result<FieldValue, DataError> {
    match value {
        FieldValue::Binary(b) => Ok(FieldValue::Binary(b)),
        FieldValue::String(s) => base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map(FieldValue::Binary)
            .map_err(|_| DataError::parse(&desc.name, &s, "not valid base64")),
        FieldValue::List(items) => {
            let mut bytes = Vec::with_capacity(items.len());
            for item in &items {
                match item.as_i64() {
                    Some(n) if (0..=255).contains(&n) => bytes.push(n as u8),
                    _ => {
                        return Err(DataError::parse(
                            &desc.name,
                            "<array>",
                            "byte arrays must hold integers 0..=255",
                        ))
                    }
                }
            }
            Ok(FieldValue::Binary(bytes))
        }
        other => Err(DataError::TypeMismatch {
            expected: "binary".into(),
            actual: kind_of(&other).to_string(),
        }),
    }
}

fn parse_collection(
    domain: &Domain,
    desc: &ValueDesc,
    item: &ValueDesc,
    value: FieldValue,
) -> Result<FieldValue, DataError> {
    match value {
        FieldValue::List(items) => {
            let drop_nulls = matches!(item.kind, ValueKind::Model(_) | ValueKind::Object(_));
            let mut out = Vec::with_capacity(items.len());
            for entry in items {
                if drop_nulls && entry.is_null() {
                    continue;
                }
                out.push(parse_value(domain, item, entry)?);
            }
            Ok(FieldValue::List(out))
        }
        // Strings parse as JSON arrays, with a bare comma-separated
        // fallback so "1,2,3" round-trips from query strings.
        FieldValue::String(s) => {
            let parsed = serde_json::from_str::<serde_json::Value>(&s)
                .or_else(|_| serde_json::from_str(&format!("[{}]", s)));
            match parsed {
                Ok(serde_json::Value::Array(values)) => {
                    let mut out = Vec::with_capacity(values.len());
                    for v in &values {
                        let fv = convert_value(domain, item, v)?;
                        if fv.is_null()
                            && matches!(item.kind, ValueKind::Model(_) | ValueKind::Object(_))
                        {
                            continue;
                        }
                        out.push(fv);
                    }
                    Ok(FieldValue::List(out))
                }
                _ => Err(DataError::parse(&desc.name, &s, "not a collection")),
            }
        }
        other => Err(DataError::TypeMismatch {
            expected: "collection".into(),
            actual: kind_of(&other).to_string(),
        }),
    }
}

fn kind_of(value: &FieldValue) -> &'static str {
    match value {
        FieldValue::Null => "null",
        FieldValue::Bool(_) => "boolean",
        FieldValue::Int(_) | FieldValue::Float(_) => "number",
        FieldValue::String(_) => "string",
        FieldValue::Date(_) => "date",
        FieldValue::Binary(_) => "binary",
        FieldValue::File(_) => "file",
        FieldValue::Object(_) | FieldValue::WeakObject(_) => "object",
        FieldValue::List(_) => "collection",
    }
}

/// Bookkeeping for one wire payload: `$id` registrations and the chain of
/// objects currently being built, so `$ref` back-references become weak
/// links instead of ownership cycles.
struct RefContext {
    by_id: HashMap<String, ModelObject>,
    path: Vec<usize>,
}

impl RefContext {
    fn new() -> Self {
        RefContext {
            by_id: HashMap::new(),
            path: Vec::new(),
        }
    }

    fn resolve(&self, id: &str) -> Option<FieldValue> {
        let target = self.by_id.get(id)?;
        if self.path.contains(&target.ptr_id()) {
            Some(FieldValue::WeakObject(target.downgrade()))
        } else {
            Some(FieldValue::Object(target.clone()))
        }
    }
}

/// Marker value, as a map key: `$id` markers may be numbers or strings.
fn marker_key(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Build a typed model graph from one wire JSON object.
pub fn convert_to_model(
    domain: &Domain,
    type_name: &str,
    json: &serde_json::Value,
) -> Result<ModelObject, DataError> {
    let mut ctx = RefContext::new();
    match json_to_object(&mut ctx, domain, type_name, json)? {
        FieldValue::Object(o) => Ok(o),
        FieldValue::WeakObject(w) => w.upgrade().ok_or_else(|| DataError::TypeMismatch {
            expected: type_name.to_string(),
            actual: "dropped reference".to_string(),
        }),
        FieldValue::Null => Err(DataError::TypeMismatch {
            expected: type_name.to_string(),
            actual: "null".to_string(),
        }),
        other => Err(DataError::TypeMismatch {
            expected: type_name.to_string(),
            actual: kind_of(&other).to_string(),
        }),
    }
}

/// Convert one standalone wire value by its descriptor. Method returns and
/// loose parameters come through here.
pub fn convert_value(
    domain: &Domain,
    desc: &ValueDesc,
    json: &serde_json::Value,
) -> Result<FieldValue, DataError> {
    let mut ctx = RefContext::new();
    json_to_field(&mut ctx, domain, desc, json)
}

fn json_to_field(
    ctx: &mut RefContext,
    domain: &Domain,
    desc: &ValueDesc,
    json: &serde_json::Value,
) -> Result<FieldValue, DataError> {
    use serde_json::Value;
    if json.is_null() {
        return Ok(FieldValue::Null);
    }
    match &desc.kind {
        ValueKind::Object(type_name) | ValueKind::Model(type_name) => {
            json_to_object(ctx, domain, type_name, json)
        }
        ValueKind::Collection(item) => match json {
            Value::Array(values) => {
                let drop_nulls =
                    matches!(item.kind, ValueKind::Model(_) | ValueKind::Object(_));
                let mut out = Vec::with_capacity(values.len());
                for v in values {
                    if drop_nulls && v.is_null() {
                        continue;
                    }
                    out.push(json_to_field(ctx, domain, item, v)?);
                }
                Ok(FieldValue::List(out))
            }
            other => parse_value(domain, desc, json_scalar(desc, other)?),
        },
        _ => parse_value(domain, desc, json_scalar(desc, json)?),
    }
}

/// Lossless JSON scalar to field value. Integer-valued numbers become Int.
fn json_scalar(desc: &ValueDesc, json: &serde_json::Value) -> Result<FieldValue, DataError> {
    use serde_json::Value;
    Ok(match json {
        Value::Null => FieldValue::Null,
        Value::Bool(b) => FieldValue::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => FieldValue::Int(i),
            None => FieldValue::Float(n.as_f64().ok_or_else(|| {
                DataError::parse(&desc.name, n, "number out of range")
            })?),
        },
        Value::String(s) => FieldValue::String(s.clone()),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(json_scalar(desc, item)?);
            }
            FieldValue::List(out)
        }
        Value::Object(_) => {
            return Err(DataError::parse(
                &desc.name,
                "<object>",
                "expected a scalar value",
            ))
        }
    })
}

fn json_to_object(
    ctx: &mut RefContext,
    domain: &Domain,
    declared_type: &str,
    json: &serde_json::Value,
) -> Result<FieldValue, DataError> {
    let serde_json::Value::Object(map) = json else {
        return Err(DataError::TypeMismatch {
            expected: declared_type.to_string(),
            actual: "non-object value".to_string(),
        });
    };

    if let Some(ref_marker) = map.get("$ref").and_then(marker_key) {
        return Ok(ctx.resolve(&ref_marker).unwrap_or_else(|| {
            tracing::warn!(marker = %ref_marker, "unresolved $ref in payload");
            FieldValue::Null
        }));
    }

    // $type picks a more specific registered type when present.
    let type_name = map
        .get("$type")
        .and_then(|v| v.as_str())
        .filter(|t| domain.types.contains_key(*t))
        .unwrap_or(declared_type);
    let class = domain.class(type_name)?;

    let object = ModelObject::new(type_name);
    if let Some(id_marker) = map.get("$id").and_then(marker_key) {
        ctx.by_id.insert(id_marker, object.clone());
    }

    ctx.path.push(object.ptr_id());
    let result: Result<(), DataError> = (|| {
        for prop in &class.props {
            let Some(raw) = map.get(prop.name()) else {
                continue;
            };
            let value = json_to_field(ctx, domain, &prop.value, raw)?;
            object.set(prop.name(), value);
        }
        Ok(())
    })();
    ctx.path.pop();
    result?;

    object.mark_converted();
    Ok(FieldValue::Object(object))
}

/// Coerce every field of an existing object graph to its declared shape.
/// Idempotent: instances already converted are skipped, and shared
/// instances are visited once.
pub fn convert_in_place(domain: &Domain, object: &ModelObject) -> Result<(), DataError> {
    let mut visited = HashSet::new();
    convert_object_fields(domain, object, &mut visited)
}

fn convert_object_fields(
    domain: &Domain,
    object: &ModelObject,
    visited: &mut HashSet<usize>,
) -> Result<(), DataError> {
    if !visited.insert(object.ptr_id()) {
        return Ok(());
    }
    let already = object.is_converted();
    let class = domain.class(&object.type_name())?;
    for (name, value) in object.fields_snapshot() {
        let Some(prop) = class.prop(&name) else {
            continue;
        };
        let parsed = if already {
            value
        } else {
            parse_value(domain, &prop.value, value)?
        };
        descend(domain, &parsed, visited)?;
        if !already {
            object.set(&name, parsed);
        }
    }
    object.mark_converted();
    Ok(())
}

fn descend(
    domain: &Domain,
    value: &FieldValue,
    visited: &mut HashSet<usize>,
) -> Result<(), DataError> {
    match value {
        FieldValue::Object(o) => convert_object_fields(domain, o, visited),
        FieldValue::List(items) => {
            for item in items {
                descend(domain, item, visited)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Deep copy of a model graph. Shared instances stay shared in the copy;
/// weak back-links re-target their copied counterparts.
pub fn map_copy(domain: &Domain, object: &ModelObject) -> Result<ModelObject, DataError> {
    let mut memo = HashMap::new();
    copy_object(domain, object, &mut memo)
}

fn copy_object(
    domain: &Domain,
    object: &ModelObject,
    memo: &mut HashMap<usize, ModelObject>,
) -> Result<ModelObject, DataError> {
    if let Some(existing) = memo.get(&object.ptr_id()) {
        return Ok(existing.clone());
    }
    let type_name = object.type_name();
    domain.class(&type_name)?;
    let copy = ModelObject::new(&type_name);
    memo.insert(object.ptr_id(), copy.clone());
    for (name, value) in object.fields_snapshot() {
        copy.set(&name, copy_value(domain, &value, memo)?);
    }
    if object.is_converted() {
        copy.mark_converted();
    }
    Ok(copy)
}

fn copy_value(
    domain: &Domain,
    value: &FieldValue,
    memo: &mut HashMap<usize, ModelObject>,
) -> Result<FieldValue, DataError> {
    Ok(match value {
        FieldValue::Object(o) => FieldValue::Object(copy_object(domain, o, memo)?),
        FieldValue::WeakObject(w) => match w.upgrade() {
            // Re-target only if the link points into the copied graph;
            // external links stay shared with the original.
            Some(target) => match memo.get(&target.ptr_id()) {
                Some(copied) => FieldValue::WeakObject(copied.downgrade()),
                None => FieldValue::WeakObject(w.clone()),
            },
            None => FieldValue::Null,
        },
        FieldValue::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(copy_value(domain, item, memo)?);
            }
            FieldValue::List(out)
        }
        other => other.clone(),
    })
}

/// Options for DTO mapping.
#[derive(Debug, Clone, Default)]
pub struct MapToDtoOptions {
    /// Maximum object nesting to serialize. Fields beyond the limit are
    /// omitted. None means unbounded; cycles are still cut by omission.
    pub max_depth: Option<u32>,
}

/// Map a model graph to a JSON-safe plain object.
pub fn map_to_dto(
    domain: &Domain,
    object: &ModelObject,
    options: &MapToDtoOptions,
) -> Result<serde_json::Value, DataError> {
    let mut path = Vec::new();
    dto_object(domain, object, options, 0, &mut path, None)?.ok_or_else(|| {
        DataError::TypeMismatch {
            expected: object.type_name(),
            actual: "unserializable root".to_string(),
        }
    })
}

/// DTO form of one standalone value. None when the value cannot appear at
/// the root (cycles, exceeded depth).
pub fn value_to_dto(
    domain: &Domain,
    desc: &ValueDesc,
    value: &FieldValue,
    options: &MapToDtoOptions,
) -> Result<Option<serde_json::Value>, DataError> {
    let mut path = Vec::new();
    dto_value(domain, &desc.name, desc, value, options, 0, &mut path)
}

/// DTO mapping restricted to the named root properties. Nested objects
/// still serialize fully. Used for surgical saves.
pub fn map_to_dto_filtered(
    domain: &Domain,
    object: &ModelObject,
    props: &[String],
    options: &MapToDtoOptions,
) -> Result<serde_json::Value, DataError> {
    let mut path = Vec::new();
    dto_object(domain, object, options, 0, &mut path, Some(props))?.ok_or_else(|| {
        DataError::TypeMismatch {
            expected: object.type_name(),
            actual: "unserializable root".to_string(),
        }
    })
}

fn dto_object(
    domain: &Domain,
    object: &ModelObject,
    options: &MapToDtoOptions,
    depth: u32,
    path: &mut Vec<usize>,
    filter: Option<&[String]>,
) -> Result<Option<serde_json::Value>, DataError> {
    if path.contains(&object.ptr_id()) {
        return Ok(None);
    }
    if let Some(max) = options.max_depth {
        if depth >= max {
            return Ok(None);
        }
    }
    let class = domain.class(&object.type_name())?;

    path.push(object.ptr_id());
    let result: Result<Option<serde_json::Value>, DataError> = (|| {
        let mut map = serde_json::Map::new();
        for prop in &class.props {
            if prop.dont_serialize {
                continue;
            }
            if let Some(names) = filter {
                if !names.iter().any(|n| n == prop.name()) {
                    continue;
                }
            }
            let mut value = object.get(prop.name());

            // A foreign key the caller never set still serializes when its
            // navigation object carries a key.
            if value.is_null() {
                if let Role::ForeignKey {
                    principal_key,
                    navigation_prop: Some(nav),
                    ..
                } = &prop.role
                {
                    if let Some(principal) = object.get(nav).as_object() {
                        value = principal.get(principal_key);
                    }
                }
            }

            if value.is_null() && !object.has(prop.name()) {
                continue;
            }
            if let Some(dto) = dto_value(domain, prop.name(), &prop.value, &value, options, depth, path)? {
                map.insert(prop.name().to_string(), dto);
            }
        }
        Ok(Some(serde_json::Value::Object(map)))
    })();
    path.pop();
    result
}

fn dto_value(
    domain: &Domain,
    field: &str,
    desc: &ValueDesc,
    value: &FieldValue,
    options: &MapToDtoOptions,
    depth: u32,
    path: &mut Vec<usize>,
) -> Result<Option<serde_json::Value>, DataError> {
    use serde_json::Value;
    if value.is_null() {
        return Ok(Some(Value::Null));
    }
    Ok(match (&desc.kind, value) {
        (ValueKind::Date(kind), FieldValue::Date(d)) => {
            Some(Value::String(format_date(*kind, d)))
        }
        (ValueKind::Binary, FieldValue::Binary(bytes)) => Some(Value::String(
            base64::engine::general_purpose::STANDARD.encode(bytes),
        )),
        (ValueKind::File, _) => {
            return Err(DataError::FileSerialization(field.to_string()))
        }
        (ValueKind::Object(_) | ValueKind::Model(_), _) => match value.as_object() {
            Some(o) => dto_object(domain, &o, options, depth + 1, path, None)?,
            None => Some(Value::Null),
        },
        (ValueKind::Collection(item), FieldValue::List(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for entry in items {
                if let Some(v) = dto_value(domain, field, item, entry, options, depth, path)? {
                    out.push(v);
                }
            }
            Some(Value::Array(out))
        }
        (_, FieldValue::Bool(b)) => Some(Value::Bool(*b)),
        (_, FieldValue::Int(n)) => Some(Value::Number((*n).into())),
        (_, FieldValue::Float(f)) => serde_json::Number::from_f64(*f).map(Value::Number),
        (_, FieldValue::String(s)) => Some(Value::String(s.clone())),
        (_, FieldValue::Date(d)) => Some(Value::String(d.to_rfc3339())),
        (kind, other) => {
            return Err(DataError::TypeMismatch {
                expected: kind.label().to_string(),
                actual: kind_of(other).to_string(),
            })
        }
    })
}

/// Wire format for each date flavor.
pub fn format_date(kind: DateKind, d: &DateTime<FixedOffset>) -> String {
    match kind {
        DateKind::DateTimeOffset => d.format("%Y-%m-%dT%H:%M:%S%.3f%:z").to_string(),
        DateKind::DateTime => d.format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
        DateKind::DateOnly => d.format("%Y-%m-%d").to_string(),
        DateKind::TimeOnly => d.format("%H:%M:%S").to_string(),
    }
}
