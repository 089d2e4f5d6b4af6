//! Runtime model values: dynamic field storage with shared object identity.

pub mod convert;
pub mod display;

use chrono::{DateTime, FixedOffset};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

/// In-memory file attachment. Bytes are shared so copies stay cheap.
#[derive(Debug, Clone)]
pub struct FileValue {
    pub name: String,
    pub content_type: Option<String>,
    pub bytes: Arc<Vec<u8>>,
}

impl PartialEq for FileValue {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.content_type == other.content_type
            && Arc::ptr_eq(&self.bytes, &other.bytes)
    }
}

/// A dynamically typed field value. The closed set mirrors the metadata
/// value kinds; objects hold shared identity so two fields can observe the
/// same instance.
#[derive(Debug, Clone, Default)]
pub enum FieldValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// All dates carry an offset internally; the kind in metadata decides
    /// how they serialize and display.
    Date(DateTime<FixedOffset>),
    Binary(Vec<u8>),
    File(FileValue),
    Object(ModelObject),
    /// Non-owning link used where an owning one would keep a reference
    /// cycle alive (back-references to an ancestor in the object graph).
    WeakObject(WeakModelObject),
    List(Vec<FieldValue>),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// The object behind this value, upgrading weak links. None for
    /// non-object values and for weak links whose target was dropped.
    pub fn as_object(&self) -> Option<ModelObject> {
        match self {
            FieldValue::Object(o) => Some(o.clone()),
            FieldValue::WeakObject(w) => w.upgrade(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(n) => Some(*n),
            FieldValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Int(n) => Some(*n as f64),
            FieldValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[FieldValue]> {
        match self {
            FieldValue::List(items) => Some(items),
            _ => None,
        }
    }
}

/// Equality follows value semantics for scalars and identity for objects.
/// Ints and floats compare numerically; dates compare by instant.
impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        use FieldValue::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Int(a), Float(b)) | (Float(b), Int(a)) => *a as f64 == *b,
            (String(a), String(b)) => a == b,
            (Date(a), Date(b)) => a == b,
            (Binary(a), Binary(b)) => a == b,
            (File(a), File(b)) => a == b,
            (List(a), List(b)) => a == b,
            (Object(_) | WeakObject(_), Object(_) | WeakObject(_)) => {
                match (self.as_object(), other.as_object()) {
                    (Some(a), Some(b)) => a.ptr_id() == b.ptr_id(),
                    _ => false,
                }
            }
            _ => false,
        }
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Int(v as i64)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

impl From<DateTime<FixedOffset>> for FieldValue {
    fn from(v: DateTime<FixedOffset>) -> Self {
        FieldValue::Date(v)
    }
}

impl From<ModelObject> for FieldValue {
    fn from(v: ModelObject) -> Self {
        FieldValue::Object(v)
    }
}

impl From<Vec<FieldValue>> for FieldValue {
    fn from(v: Vec<FieldValue>) -> Self {
        FieldValue::List(v)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => FieldValue::Null,
        }
    }
}

#[derive(Debug)]
struct ModelData {
    type_name: String,
    fields: HashMap<String, FieldValue>,
    /// Set once field values have been coerced to their metadata kinds, so
    /// repeated conversion passes skip this instance.
    converted: bool,
}

/// A shared, mutable bag of fields for one model or object instance.
/// Cloning shares the instance; two clones observe each other's writes.
#[derive(Debug, Clone)]
pub struct ModelObject(Arc<RwLock<ModelData>>);

impl ModelObject {
    pub fn new(type_name: &str) -> Self {
        ModelObject(Arc::new(RwLock::new(ModelData {
            type_name: type_name.to_string(),
            fields: HashMap::new(),
            converted: false,
        })))
    }

    fn read(&self) -> RwLockReadGuard<'_, ModelData> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ModelData> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn type_name(&self) -> String {
        self.read().type_name.clone()
    }

    /// Stable identity for the lifetime of the instance.
    pub fn ptr_id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub fn same_instance(&self, other: &ModelObject) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn downgrade(&self) -> WeakModelObject {
        WeakModelObject(Arc::downgrade(&self.0))
    }

    /// Field value, or Null when the field was never set.
    pub fn get(&self, name: &str) -> FieldValue {
        self.read().fields.get(name).cloned().unwrap_or_default()
    }

    /// Whether the field has ever been set, even to Null.
    pub fn has(&self, name: &str) -> bool {
        self.read().fields.contains_key(name)
    }

    pub fn set(&self, name: &str, value: impl Into<FieldValue>) {
        self.write().fields.insert(name.to_string(), value.into());
    }

    pub fn remove(&self, name: &str) {
        self.write().fields.remove(name);
    }

    pub fn is_converted(&self) -> bool {
        self.read().converted
    }

    pub fn mark_converted(&self) {
        self.write().converted = true;
    }

    /// Point-in-time copy of all fields, for iteration without holding the
    /// lock.
    pub fn fields_snapshot(&self) -> Vec<(String, FieldValue)> {
        self.read()
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Non-owning handle to a [`ModelObject`].
#[derive(Debug, Clone)]
pub struct WeakModelObject(Weak<RwLock<ModelData>>);

impl WeakModelObject {
    pub fn upgrade(&self) -> Option<ModelObject> {
        self.0.upgrade().map(ModelObject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn numeric_values_compare_across_int_and_float() {
        assert_eq!(FieldValue::Int(5), FieldValue::Float(5.0));
        assert_ne!(FieldValue::Int(5), FieldValue::Float(5.5));
    }

    #[test]
    fn dates_compare_by_instant() {
        let utc = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 1, 12, 0, 0)
            .unwrap();
        let plus_two = FixedOffset::east_opt(2 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 1, 14, 0, 0)
            .unwrap();
        assert_eq!(FieldValue::Date(utc), FieldValue::Date(plus_two));
    }

    #[test]
    fn objects_compare_by_instance() {
        let a = ModelObject::new("Person");
        let b = ModelObject::new("Person");
        assert_eq!(FieldValue::Object(a.clone()), FieldValue::Object(a.clone()));
        assert_ne!(FieldValue::Object(a.clone()), FieldValue::Object(b));
        assert_eq!(
            FieldValue::Object(a.clone()),
            FieldValue::WeakObject(a.downgrade())
        );
    }

    #[test]
    fn clones_share_writes() {
        let a = ModelObject::new("Person");
        let b = a.clone();
        a.set("name", "Ada");
        assert_eq!(b.get("name"), FieldValue::String("Ada".into()));
        assert!(!a.has("missing"));
        assert!(a.get("missing").is_null());
    }
}
