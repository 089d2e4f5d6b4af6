//! Immutable metadata descriptors: types, properties, relationships, methods, data sources.

mod builder;
mod validator;

pub use builder::{
    DataSourceBuilder, DomainBuilder, EnumBuilder, MethodBuilder, ModelBuilder, PropBuilder,
};

use crate::error::DataError;
use std::collections::HashMap;

/// Root registry for one application's data model. Types reference each
/// other by name through this registry, never by direct pointer, so the
/// descriptor graph stays acyclic even when the domain model is circular.
#[derive(Debug)]
pub struct Domain {
    pub types: HashMap<String, ClassType>,
    pub enums: HashMap<String, EnumType>,
}

impl Domain {
    /// Look up a class type by name.
    pub fn class(&self, name: &str) -> Result<&ClassType, DataError> {
        self.types
            .get(name)
            .ok_or_else(|| DataError::UnknownType(name.to_string()))
    }

    /// Look up a class type that must be a relational model.
    pub fn model(&self, name: &str) -> Result<&ClassType, DataError> {
        let class = self.class(name)?;
        if class.model.is_none() {
            return Err(DataError::TypeMismatch {
                expected: "model".into(),
                actual: format!("object '{}'", name),
            });
        }
        Ok(class)
    }

    /// Look up an enum type by name.
    pub fn enumeration(&self, name: &str) -> Result<&EnumType, DataError> {
        self.enums
            .get(name)
            .ok_or_else(|| DataError::UnknownType(name.to_string()))
    }
}

/// A custom object type: either a relational model (`model` is Some) or a
/// plain external object.
#[derive(Debug, Clone)]
pub struct ClassType {
    /// camelCase-free machine name; also the registry key (e.g. "Person").
    pub name: String,
    pub display_name: String,
    /// Declaration-ordered property list. Order is the DTO field order.
    pub props: Vec<Property>,
    /// Name of the property whose value represents this type in displays.
    pub display_prop: Option<String>,
    pub model: Option<ModelInfo>,
}

impl ClassType {
    pub fn prop(&self, name: &str) -> Option<&Property> {
        self.props.iter().find(|p| p.value.name == name)
    }

    pub fn expect_prop(&self, name: &str) -> Result<&Property, DataError> {
        self.prop(name).ok_or_else(|| DataError::UnknownProperty {
            type_name: self.name.clone(),
            prop: name.to_string(),
        })
    }

    pub fn is_model(&self) -> bool {
        self.model.is_some()
    }

    /// The primary key property, for model types.
    pub fn key_prop(&self) -> Option<&Property> {
        self.model.as_ref().and_then(|m| self.prop(&m.key_prop))
    }
}

/// Model-only metadata: key, API route, capabilities, data sources, methods.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub key_prop: String,
    /// URI path segment identifying this model in API endpoints. No slashes.
    pub controller_route: String,
    pub behaviors: Behaviors,
    pub data_sources: Vec<DataSourceType>,
    pub methods: Vec<Method>,
}

impl ModelInfo {
    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn data_source(&self, name: &str) -> Option<&DataSourceType> {
        self.data_sources.iter().find(|d| d.name == name)
    }
}

/// CRUD capability flags for a model type.
#[derive(Debug, Clone, Copy)]
pub struct Behaviors {
    pub create: bool,
    pub edit: bool,
    pub delete: bool,
}

impl Default for Behaviors {
    fn default() -> Self {
        Behaviors {
            create: true,
            edit: true,
            delete: true,
        }
    }
}

/// The usage of a type: name plus kind. Properties, method parameters,
/// method returns and collection items are all values.
#[derive(Debug, Clone)]
pub struct ValueDesc {
    pub name: String,
    pub display_name: String,
    pub kind: ValueKind,
}

/// Closed set of value kinds. Custom types are referenced by registry name.
#[derive(Debug, Clone)]
pub enum ValueKind {
    String,
    Number,
    Boolean,
    Date(DateKind),
    Binary,
    File,
    Enum(String),
    Object(String),
    Model(String),
    Collection(Box<ValueDesc>),
}

impl ValueKind {
    /// Registry name for enum/object/model kinds.
    pub fn type_name(&self) -> Option<&str> {
        match self {
            ValueKind::Enum(n) | ValueKind::Object(n) | ValueKind::Model(n) => Some(n),
            _ => None,
        }
    }

    /// Short label for error messages.
    pub fn label(&self) -> &'static str {
        match self {
            ValueKind::String => "string",
            ValueKind::Number => "number",
            ValueKind::Boolean => "boolean",
            ValueKind::Date(_) => "date",
            ValueKind::Binary => "binary",
            ValueKind::File => "file",
            ValueKind::Enum(_) => "enum",
            ValueKind::Object(_) => "object",
            ValueKind::Model(_) => "model",
            ValueKind::Collection(_) => "collection",
        }
    }
}

/// Date flavor, governing wire formats and display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateKind {
    /// Local datetime; serialized without an offset.
    DateTime,
    /// Offset-aware datetime; serialized with its offset.
    DateTimeOffset,
    DateOnly,
    TimeOnly,
}

/// Role a property plays in the relational model.
#[derive(Debug, Clone)]
pub enum Role {
    Value,
    PrimaryKey,
    ForeignKey {
        principal_type: String,
        principal_key: String,
        navigation_prop: Option<String>,
    },
    ReferenceNavigation {
        foreign_key: String,
        principal_key: String,
    },
    CollectionNavigation {
        /// FK property on the item type that points back at the owner.
        foreign_key: String,
        many_to_many: Option<ManyToMany>,
    },
}

/// Describes the join behind a many-to-many collection navigation.
#[derive(Debug, Clone)]
pub struct ManyToMany {
    pub name: String,
    pub display_name: String,
    pub far_type: String,
    pub far_foreign_key: String,
    pub near_foreign_key: String,
}

/// One property of a class type.
#[derive(Debug, Clone)]
pub struct Property {
    pub value: ValueDesc,
    pub role: Role,
    /// Excluded from DTO mapping when set.
    pub dont_serialize: bool,
    pub rules: PropertyRules,
}

impl Property {
    pub fn name(&self) -> &str {
        &self.value.name
    }

    pub fn is_primary_key(&self) -> bool {
        matches!(self.role, Role::PrimaryKey)
    }

    pub fn is_foreign_key(&self) -> bool {
        matches!(self.role, Role::ForeignKey { .. })
    }

    pub fn is_reference_navigation(&self) -> bool {
        matches!(self.role, Role::ReferenceNavigation { .. })
    }

    pub fn is_collection_navigation(&self) -> bool {
        matches!(self.role, Role::CollectionNavigation { .. })
    }
}

/// Declared validation rules for one property.
#[derive(Debug, Clone, Default)]
pub struct PropertyRules {
    pub required: bool,
    pub min_length: Option<u32>,
    pub max_length: Option<u32>,
    /// Pre-compiled at domain build time.
    pub pattern: Option<regex::Regex>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
}

impl PropertyRules {
    pub fn is_empty(&self) -> bool {
        !self.required
            && self.min_length.is_none()
            && self.max_length.is_none()
            && self.pattern.is_none()
            && self.minimum.is_none()
            && self.maximum.is_none()
    }
}

/// Numeric enum with string values and display labels.
#[derive(Debug, Clone)]
pub struct EnumType {
    pub name: String,
    pub display_name: String,
    pub members: Vec<EnumMember>,
}

impl EnumType {
    pub fn by_value(&self, value: i64) -> Option<&EnumMember> {
        self.members.iter().find(|m| m.value == value)
    }

    pub fn by_str(&self, s: &str) -> Option<&EnumMember> {
        self.members.iter().find(|m| m.str_value == s)
    }
}

#[derive(Debug, Clone)]
pub struct EnumMember {
    pub value: i64,
    pub str_value: String,
    pub display_name: String,
}

/// HTTP verb declared on a custom method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// Whether a method's endpoint returns an item or list envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodTransport {
    Item,
    List,
}

/// A custom invocable method on a model type.
#[derive(Debug, Clone)]
pub struct Method {
    pub name: String,
    pub display_name: String,
    pub http_method: HttpMethod,
    pub params: Vec<ValueDesc>,
    /// None means void.
    pub return_value: Option<ValueDesc>,
    pub transport: MethodTransport,
}

/// A named server-side data source variant with its own parameters.
#[derive(Debug, Clone)]
pub struct DataSourceType {
    pub name: String,
    pub display_name: String,
    pub params: Vec<ValueDesc>,
}
