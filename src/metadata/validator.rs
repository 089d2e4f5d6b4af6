//! Cross-reference checks run once over a fully assembled domain.

use super::{ClassType, Domain, Property, Role, ValueDesc, ValueKind};
use crate::error::MetadataError;
use std::collections::HashSet;

/// Verify that every name in the domain resolves and every relationship is
/// declared consistently on both ends. Runs after construction so checks
/// can see the whole type set.
pub fn validate(domain: &Domain) -> Result<(), MetadataError> {
    for class in domain.types.values() {
        check_unique_prop_names(class)?;
        check_display_prop(class)?;
        check_key_prop(class)?;
        for prop in &class.props {
            check_value(domain, &prop.value)?;
            check_role(domain, class, prop)?;
        }
        if let Some(model) = &class.model {
            for method in &model.methods {
                for param in &method.params {
                    check_value(domain, param)?;
                }
                if let Some(ret) = &method.return_value {
                    check_value(domain, ret)?;
                }
            }
            for source in &model.data_sources {
                for param in &source.params {
                    check_value(domain, param)?;
                }
            }
        }
    }
    Ok(())
}

fn check_unique_prop_names(class: &ClassType) -> Result<(), MetadataError> {
    let mut seen = HashSet::new();
    for prop in &class.props {
        if !seen.insert(prop.name()) {
            return Err(MetadataError::Duplicate {
                kind: "property",
                name: format!("{}.{}", class.name, prop.name()),
            });
        }
    }
    Ok(())
}

fn check_display_prop(class: &ClassType) -> Result<(), MetadataError> {
    let Some(name) = &class.display_prop else {
        return Ok(());
    };
    if class.prop(name).is_none() {
        return Err(MetadataError::MissingReference {
            kind: "display property",
            name: format!("{}.{}", class.name, name),
        });
    }
    Ok(())
}

fn check_key_prop(class: &ClassType) -> Result<(), MetadataError> {
    let Some(model) = &class.model else {
        return Ok(());
    };
    let Some(key) = class.prop(&model.key_prop) else {
        return Err(MetadataError::InvalidPrimaryKey {
            type_name: class.name.clone(),
            prop: model.key_prop.clone(),
        });
    };
    if !key.is_primary_key() || !matches!(key.value.kind, ValueKind::String | ValueKind::Number) {
        return Err(MetadataError::InvalidPrimaryKey {
            type_name: class.name.clone(),
            prop: model.key_prop.clone(),
        });
    }
    Ok(())
}

/// Every enum/object/model name a value mentions must exist, including
/// inside collection items.
fn check_value(domain: &Domain, value: &ValueDesc) -> Result<(), MetadataError> {
    match &value.kind {
        ValueKind::Enum(name) => {
            if !domain.enums.contains_key(name) {
                return Err(MetadataError::MissingReference {
                    kind: "enum",
                    name: name.clone(),
                });
            }
        }
        ValueKind::Object(name) => {
            if !domain.types.contains_key(name) {
                return Err(MetadataError::MissingReference {
                    kind: "type",
                    name: name.clone(),
                });
            }
        }
        ValueKind::Model(name) => {
            let class = domain.types.get(name).ok_or(MetadataError::MissingReference {
                kind: "type",
                name: name.clone(),
            })?;
            if !class.is_model() {
                return Err(MetadataError::Validation(format!(
                    "'{}' is used as a model but declared as a plain object",
                    name
                )));
            }
        }
        ValueKind::Collection(item) => check_value(domain, item)?,
        _ => {}
    }
    Ok(())
}

fn check_role(domain: &Domain, class: &ClassType, prop: &Property) -> Result<(), MetadataError> {
    match &prop.role {
        Role::Value | Role::PrimaryKey => Ok(()),
        Role::ForeignKey {
            principal_type,
            navigation_prop,
            ..
        } => {
            let principal = domain.types.get(principal_type);
            if principal.map_or(true, |c| !c.is_model()) {
                return Err(MetadataError::MissingReference {
                    kind: "model",
                    name: principal_type.clone(),
                });
            }
            if let Some(nav_name) = navigation_prop {
                let nav = class.prop(nav_name).ok_or(MetadataError::MissingReference {
                    kind: "navigation property",
                    name: format!("{}.{}", class.name, nav_name),
                })?;
                if !nav.is_reference_navigation() {
                    return Err(MetadataError::Validation(format!(
                        "'{}.{}' names '{}' as its navigation, but that property is not a reference navigation",
                        class.name,
                        prop.name(),
                        nav_name
                    )));
                }
            }
            Ok(())
        }
        Role::ReferenceNavigation { foreign_key, .. } => {
            let fk = class.prop(foreign_key).ok_or(MetadataError::MissingReference {
                kind: "foreign key",
                name: format!("{}.{}", class.name, foreign_key),
            })?;
            if !fk.is_foreign_key() {
                return Err(MetadataError::Validation(format!(
                    "'{}.{}' names '{}' as its foreign key, but that property has no foreign key role",
                    class.name,
                    prop.name(),
                    foreign_key
                )));
            }
            Ok(())
        }
        Role::CollectionNavigation { foreign_key, .. } => {
            let item_type = match &prop.value.kind {
                ValueKind::Collection(item) => match &item.kind {
                    ValueKind::Model(t) => t.clone(),
                    other => {
                        return Err(MetadataError::Validation(format!(
                            "collection navigation '{}.{}' must hold models, got {}",
                            class.name,
                            prop.name(),
                            other.label()
                        )))
                    }
                },
                other => {
                    return Err(MetadataError::Validation(format!(
                        "collection navigation '{}.{}' must be a collection, got {}",
                        class.name,
                        prop.name(),
                        other.label()
                    )))
                }
            };
            let item_class = domain.types.get(&item_type).ok_or(MetadataError::MissingReference {
                kind: "type",
                name: item_type.clone(),
            })?;
            if item_class.prop(foreign_key).is_none() {
                return Err(MetadataError::MissingReference {
                    kind: "foreign key",
                    name: format!("{}.{}", item_type, foreign_key),
                });
            }
            Ok(())
        }
    }
}
