//! Human-readable rendering of model values. Best-effort: display never
//! fails, it falls back to neutral placeholders.

use super::{FieldValue, ModelObject};
use crate::metadata::{DateKind, Domain, ValueDesc, ValueKind};
use chrono::{DateTime, FixedOffset, Utc};

/// How dates render.
#[derive(Debug, Clone)]
pub enum DateDisplay {
    /// Default format for the property's date kind.
    Standard,
    /// A chrono format string.
    Format(String),
    /// Relative distance from now ("about 2 hours ago").
    Distance,
}

#[derive(Debug, Clone)]
pub struct DisplayOptions {
    /// Collections longer than this render as a count instead of items.
    pub collection_max: usize,
    pub separator: String,
    pub date: DateDisplay,
}

impl Default for DisplayOptions {
    fn default() -> Self {
        DisplayOptions {
            collection_max: 5,
            separator: ", ".to_string(),
            date: DateDisplay::Standard,
        }
    }
}

/// Display string for a whole model instance: its display property when
/// declared, otherwise a one-level JSON rendering.
pub fn model_display(
    domain: &Domain,
    object: &ModelObject,
    options: &DisplayOptions,
) -> Option<String> {
    let mut path = Vec::new();
    object_display(domain, object, options, &mut path)
}

/// Display string for one property of an instance. None when the value is
/// null or the property is unknown.
pub fn prop_display(
    domain: &Domain,
    object: &ModelObject,
    prop: &str,
    options: &DisplayOptions,
) -> Option<String> {
    let class = domain.class(&object.type_name()).ok()?;
    let prop = class.prop(prop)?;
    let mut path = vec![object.ptr_id()];
    render(domain, &prop.value, &object.get(prop.name()), options, &mut path)
}

/// Display string for a standalone value.
pub fn value_display(
    domain: &Domain,
    desc: &ValueDesc,
    value: &FieldValue,
    options: &DisplayOptions,
) -> Option<String> {
    let mut path = Vec::new();
    render(domain, desc, value, options, &mut path)
}

fn object_display(
    domain: &Domain,
    object: &ModelObject,
    options: &DisplayOptions,
    path: &mut Vec<usize>,
) -> Option<String> {
    let class = domain.class(&object.type_name()).ok()?;
    if path.contains(&object.ptr_id()) {
        return Some(class.display_name.clone());
    }

    if let Some(display_prop) = &class.display_prop {
        let prop = class.prop(display_prop)?;
        path.push(object.ptr_id());
        let out = render(domain, &prop.value, &object.get(display_prop), options, path);
        path.pop();
        return out;
    }

    // No display property: render set fields one level deep as JSON, with
    // complex values replaced by their display strings.
    path.push(object.ptr_id());
    let mut map = serde_json::Map::new();
    for prop in &class.props {
        if !object.has(prop.name()) {
            continue;
        }
        let value = object.get(prop.name());
        let rendered = match (&prop.value.kind, &value) {
            (_, FieldValue::Null) => serde_json::Value::Null,
            (ValueKind::String, FieldValue::String(s)) => {
                serde_json::Value::String(s.clone())
            }
            (ValueKind::Number, FieldValue::Int(n)) => serde_json::Value::Number((*n).into()),
            (ValueKind::Number, FieldValue::Float(f)) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            (ValueKind::Boolean, FieldValue::Bool(b)) => serde_json::Value::Bool(*b),
            _ => match render(domain, &prop.value, &value, options, path) {
                Some(s) => serde_json::Value::String(s),
                None => serde_json::Value::Null,
            },
        };
        map.insert(prop.name().to_string(), rendered);
    }
    path.pop();
    serde_json::to_string(&serde_json::Value::Object(map)).ok()
}

fn render(
    domain: &Domain,
    desc: &ValueDesc,
    value: &FieldValue,
    options: &DisplayOptions,
    path: &mut Vec<usize>,
) -> Option<String> {
    if value.is_null() {
        return None;
    }
    match (&desc.kind, value) {
        (ValueKind::Date(kind), FieldValue::Date(d)) => Some(date_display(*kind, d, options)),
        (ValueKind::Enum(name), FieldValue::Int(n)) => {
            let label = domain
                .enumeration(name)
                .ok()
                .and_then(|e| e.by_value(*n))
                .map(|m| m.display_name.clone());
            Some(label.unwrap_or_else(|| n.to_string()))
        }
        (ValueKind::Binary, FieldValue::Binary(bytes)) => Some(format!("{} bytes", bytes.len())),
        (ValueKind::File, FieldValue::File(f)) => Some(f.name.clone()),
        (ValueKind::Object(_) | ValueKind::Model(_), _) => {
            let object = value.as_object()?;
            object_display(domain, &object, options, path)
        }
        (ValueKind::Collection(item), FieldValue::List(items)) => {
            if items.len() > options.collection_max {
                return Some(format!("{} items", items.len()));
            }
            let parts: Vec<String> = items
                .iter()
                .map(|entry| {
                    render(domain, item, entry, options, path)
                        .unwrap_or_else(|| "???".to_string())
                })
                .collect();
            Some(parts.join(&options.separator))
        }
        (_, FieldValue::String(s)) => Some(s.clone()),
        (_, FieldValue::Int(n)) => Some(n.to_string()),
        (_, FieldValue::Float(f)) => Some(f.to_string()),
        (_, FieldValue::Bool(b)) => Some(b.to_string()),
        (_, FieldValue::Date(d)) => Some(date_display(DateKind::DateTime, d, options)),
        _ => None,
    }
}

fn date_display(kind: DateKind, d: &DateTime<FixedOffset>, options: &DisplayOptions) -> String {
    match &options.date {
        DateDisplay::Format(fmt) => d.format(fmt).to_string(),
        DateDisplay::Distance => distance_to_now(d),
        DateDisplay::Standard => match kind {
            DateKind::DateOnly => d.format("%Y-%m-%d").to_string(),
            DateKind::TimeOnly => d.format("%H:%M:%S").to_string(),
            DateKind::DateTime | DateKind::DateTimeOffset => {
                d.format("%Y-%m-%d %H:%M:%S").to_string()
            }
        },
    }
}

/// Coarse relative time, in the style of human changelogs.
fn distance_to_now(d: &DateTime<FixedOffset>) -> String {
    let seconds = (Utc::now().fixed_offset() - *d).num_seconds();
    let future = seconds < 0;
    let s = seconds.unsigned_abs();

    let phrase = if s < 45 {
        "less than a minute".to_string()
    } else if s < 90 {
        "a minute".to_string()
    } else if s < 45 * 60 {
        format!("{} minutes", s / 60)
    } else if s < 90 * 60 {
        "about an hour".to_string()
    } else if s < 24 * 3600 {
        format!("about {} hours", s / 3600)
    } else if s < 48 * 3600 {
        "a day".to_string()
    } else if s < 30 * 86_400 {
        format!("{} days", s / 86_400)
    } else if s < 60 * 86_400 {
        "about a month".to_string()
    } else if s < 365 * 86_400 {
        format!("{} months", s / (30 * 86_400))
    } else if s < 2 * 365 * 86_400 {
        "about a year".to_string()
    } else {
        format!("{} years", s / (365 * 86_400))
    };

    if future {
        format!("in {}", phrase)
    } else {
        format!("{} ago", phrase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{DomainBuilder, EnumBuilder, ModelBuilder, PropBuilder};
    use std::sync::Arc;

    fn domain() -> Arc<Domain> {
        DomainBuilder::new()
            .add(
                ModelBuilder::model("Person")
                    .display_prop("name")
                    .prop(PropBuilder::number("personId").primary_key())
                    .prop(PropBuilder::string("name"))
                    .prop(PropBuilder::enumeration("gender", "Genders"))
                    .prop(PropBuilder::collection_of_string("nicknames")),
            )
            .add(
                ModelBuilder::model("Pet")
                    .prop(PropBuilder::number("petId").primary_key())
                    .prop(PropBuilder::string("species")),
            )
            .add_enum(EnumBuilder::new("Genders").member(0, "nonSpecified").member(1, "male"))
            .build()
            .unwrap()
    }

    #[test]
    fn display_prop_wins_and_enum_labels_resolve() {
        let d = domain();
        let person = ModelObject::new("Person");
        person.set("name", "Ada");
        person.set("gender", 1);
        let opts = DisplayOptions::default();
        assert_eq!(model_display(&d, &person, &opts).unwrap(), "Ada");
        assert_eq!(prop_display(&d, &person, "gender", &opts).unwrap(), "Male");
        person.set("gender", 42);
        assert_eq!(prop_display(&d, &person, "gender", &opts).unwrap(), "42");
    }

    #[test]
    fn short_collections_join_and_long_ones_count() {
        let d = domain();
        let person = ModelObject::new("Person");
        let opts = DisplayOptions::default();

        person.set(
            "nicknames",
            vec![FieldValue::from("Lovelace"), FieldValue::from("Countess")],
        );
        assert_eq!(
            prop_display(&d, &person, "nicknames", &opts).unwrap(),
            "Lovelace, Countess"
        );

        let many: Vec<FieldValue> = (0..6).map(|n| FieldValue::from(n.to_string())).collect();
        person.set("nicknames", many);
        assert_eq!(prop_display(&d, &person, "nicknames", &opts).unwrap(), "6 items");

        person.set("nicknames", Vec::<FieldValue>::new());
        assert_eq!(prop_display(&d, &person, "nicknames", &opts).unwrap(), "");
    }

    #[test]
    fn undeclared_display_prop_renders_one_level_json() {
        let d = domain();
        let pet = ModelObject::new("Pet");
        pet.set("petId", 3);
        pet.set("species", "cat");
        let rendered = model_display(&d, &pet, &DisplayOptions::default()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed["petId"], serde_json::json!(3));
        assert_eq!(parsed["species"], serde_json::json!("cat"));
    }
}
