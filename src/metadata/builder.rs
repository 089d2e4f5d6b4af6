//! Fluent construction of a metadata domain, with cross-reference resolution.

use super::validator;
use super::{
    Behaviors, ClassType, DataSourceType, Domain, EnumMember, EnumType, HttpMethod, ManyToMany,
    Method, MethodTransport, ModelInfo, Property, PropertyRules, Role, ValueDesc, ValueKind,
};
use crate::case::humanize;
use crate::error::MetadataError;
use std::collections::HashMap;
use std::sync::Arc;

/// Role declarations before principal keys are known. Resolved against the
/// full type set during [`DomainBuilder::build`].
#[derive(Debug, Clone)]
enum RawRole {
    Value,
    PrimaryKey,
    ForeignKey {
        principal_type: String,
        navigation_prop: Option<String>,
    },
    ReferenceNavigation {
        foreign_key: String,
    },
    CollectionNavigation {
        foreign_key: String,
        many_to_many: Option<ManyToMany>,
    },
}

#[derive(Debug, Clone, Default)]
struct RawRules {
    required: bool,
    min_length: Option<u32>,
    max_length: Option<u32>,
    pattern: Option<String>,
    minimum: Option<f64>,
    maximum: Option<f64>,
}

/// Builds one property (or method parameter, or data source parameter).
#[derive(Debug, Clone)]
pub struct PropBuilder {
    name: String,
    display_name: Option<String>,
    kind: ValueKind,
    role: RawRole,
    dont_serialize: bool,
    rules: RawRules,
}

impl PropBuilder {
    fn new(name: &str, kind: ValueKind) -> Self {
        PropBuilder {
            name: name.to_string(),
            display_name: None,
            kind,
            role: RawRole::Value,
            dont_serialize: false,
            rules: RawRules::default(),
        }
    }

    pub fn string(name: &str) -> Self {
        Self::new(name, ValueKind::String)
    }

    pub fn number(name: &str) -> Self {
        Self::new(name, ValueKind::Number)
    }

    pub fn boolean(name: &str) -> Self {
        Self::new(name, ValueKind::Boolean)
    }

    pub fn date(name: &str, kind: super::DateKind) -> Self {
        Self::new(name, ValueKind::Date(kind))
    }

    pub fn binary(name: &str) -> Self {
        Self::new(name, ValueKind::Binary)
    }

    pub fn file(name: &str) -> Self {
        Self::new(name, ValueKind::File)
    }

    pub fn enumeration(name: &str, enum_type: &str) -> Self {
        Self::new(name, ValueKind::Enum(enum_type.to_string()))
    }

    pub fn object(name: &str, type_name: &str) -> Self {
        Self::new(name, ValueKind::Object(type_name.to_string()))
    }

    pub fn model(name: &str, type_name: &str) -> Self {
        Self::new(name, ValueKind::Model(type_name.to_string()))
    }

    /// Collection whose item shape is given by another builder. Only the
    /// item's kind matters; its name is fixed.
    pub fn collection(name: &str, item: PropBuilder) -> Self {
        let item_desc = ValueDesc {
            name: "$item".to_string(),
            display_name: humanize("$item"),
            kind: item.kind,
        };
        Self::new(name, ValueKind::Collection(Box::new(item_desc)))
    }

    pub fn collection_of_string(name: &str) -> Self {
        Self::collection(name, PropBuilder::string("$item"))
    }

    pub fn collection_of_number(name: &str) -> Self {
        Self::collection(name, PropBuilder::number("$item"))
    }

    pub fn collection_of_model(name: &str, type_name: &str) -> Self {
        Self::collection(name, PropBuilder::model("$item", type_name))
    }

    pub fn collection_of_object(name: &str, type_name: &str) -> Self {
        Self::collection(name, PropBuilder::object("$item", type_name))
    }

    pub fn display_name(mut self, label: &str) -> Self {
        self.display_name = Some(label.to_string());
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.role = RawRole::PrimaryKey;
        self
    }

    pub fn foreign_key(mut self, principal_type: &str, navigation_prop: Option<&str>) -> Self {
        self.role = RawRole::ForeignKey {
            principal_type: principal_type.to_string(),
            navigation_prop: navigation_prop.map(str::to_string),
        };
        self
    }

    pub fn reference_navigation(mut self, foreign_key: &str) -> Self {
        self.role = RawRole::ReferenceNavigation {
            foreign_key: foreign_key.to_string(),
        };
        self
    }

    pub fn collection_navigation(mut self, foreign_key: &str) -> Self {
        self.role = RawRole::CollectionNavigation {
            foreign_key: foreign_key.to_string(),
            many_to_many: None,
        };
        self
    }

    pub fn many_to_many(
        mut self,
        foreign_key: &str,
        name: &str,
        far_type: &str,
        far_foreign_key: &str,
        near_foreign_key: &str,
    ) -> Self {
        self.role = RawRole::CollectionNavigation {
            foreign_key: foreign_key.to_string(),
            many_to_many: Some(ManyToMany {
                name: name.to_string(),
                display_name: humanize(name),
                far_type: far_type.to_string(),
                far_foreign_key: far_foreign_key.to_string(),
                near_foreign_key: near_foreign_key.to_string(),
            }),
        };
        self
    }

    pub fn dont_serialize(mut self) -> Self {
        self.dont_serialize = true;
        self
    }

    pub fn required(mut self) -> Self {
        self.rules.required = true;
        self
    }

    pub fn min_length(mut self, n: u32) -> Self {
        self.rules.min_length = Some(n);
        self
    }

    pub fn max_length(mut self, n: u32) -> Self {
        self.rules.max_length = Some(n);
        self
    }

    pub fn pattern(mut self, re: &str) -> Self {
        self.rules.pattern = Some(re.to_string());
        self
    }

    pub fn minimum(mut self, n: f64) -> Self {
        self.rules.minimum = Some(n);
        self
    }

    pub fn maximum(mut self, n: f64) -> Self {
        self.rules.maximum = Some(n);
        self
    }

    fn value_desc(&self) -> ValueDesc {
        ValueDesc {
            name: self.name.clone(),
            display_name: self
                .display_name
                .clone()
                .unwrap_or_else(|| humanize(&self.name)),
            kind: self.kind.clone(),
        }
    }
}

/// Builds a custom method declaration.
#[derive(Debug, Clone)]
pub struct MethodBuilder {
    name: String,
    http_method: HttpMethod,
    transport: MethodTransport,
    params: Vec<PropBuilder>,
    return_value: Option<PropBuilder>,
}

impl MethodBuilder {
    fn new(name: &str, http_method: HttpMethod, transport: MethodTransport) -> Self {
        MethodBuilder {
            name: name.to_string(),
            http_method,
            transport,
            params: Vec::new(),
            return_value: None,
        }
    }

    pub fn item_get(name: &str) -> Self {
        Self::new(name, HttpMethod::Get, MethodTransport::Item)
    }

    pub fn item_post(name: &str) -> Self {
        Self::new(name, HttpMethod::Post, MethodTransport::Item)
    }

    pub fn list_get(name: &str) -> Self {
        Self::new(name, HttpMethod::Get, MethodTransport::List)
    }

    pub fn list_post(name: &str) -> Self {
        Self::new(name, HttpMethod::Post, MethodTransport::List)
    }

    pub fn verb(mut self, http_method: HttpMethod) -> Self {
        self.http_method = http_method;
        self
    }

    pub fn param(mut self, param: PropBuilder) -> Self {
        self.params.push(param);
        self
    }

    pub fn returns(mut self, value: PropBuilder) -> Self {
        self.return_value = Some(value);
        self
    }

    fn build(self) -> Method {
        Method {
            display_name: humanize(&self.name),
            name: self.name,
            http_method: self.http_method,
            params: self.params.iter().map(PropBuilder::value_desc).collect(),
            return_value: self.return_value.as_ref().map(PropBuilder::value_desc),
            transport: self.transport,
        }
    }
}

/// Builds a named data source declaration.
#[derive(Debug, Clone)]
pub struct DataSourceBuilder {
    name: String,
    params: Vec<PropBuilder>,
}

impl DataSourceBuilder {
    pub fn new(name: &str) -> Self {
        DataSourceBuilder {
            name: name.to_string(),
            params: Vec::new(),
        }
    }

    pub fn param(mut self, param: PropBuilder) -> Self {
        self.params.push(param);
        self
    }

    fn build(self) -> DataSourceType {
        DataSourceType {
            display_name: humanize(&self.name),
            name: self.name,
            params: self.params.iter().map(PropBuilder::value_desc).collect(),
        }
    }
}

/// Builds one class type, model or plain object.
#[derive(Debug, Clone)]
pub struct ModelBuilder {
    name: String,
    display_name: Option<String>,
    is_model: bool,
    controller_route: Option<String>,
    behaviors: Behaviors,
    display_prop: Option<String>,
    props: Vec<PropBuilder>,
    methods: Vec<MethodBuilder>,
    data_sources: Vec<DataSourceBuilder>,
}

impl ModelBuilder {
    /// A relational model type, served by CRUD endpoints.
    pub fn model(name: &str) -> Self {
        ModelBuilder {
            name: name.to_string(),
            display_name: None,
            is_model: true,
            controller_route: None,
            behaviors: Behaviors::default(),
            display_prop: None,
            props: Vec::new(),
            methods: Vec::new(),
            data_sources: Vec::new(),
        }
    }

    /// A plain external object type with no endpoints of its own.
    pub fn object(name: &str) -> Self {
        let mut b = Self::model(name);
        b.is_model = false;
        b
    }

    pub fn display_name(mut self, label: &str) -> Self {
        self.display_name = Some(label.to_string());
        self
    }

    pub fn route(mut self, route: &str) -> Self {
        self.controller_route = Some(route.to_string());
        self
    }

    pub fn behaviors(mut self, behaviors: Behaviors) -> Self {
        self.behaviors = behaviors;
        self
    }

    pub fn display_prop(mut self, prop: &str) -> Self {
        self.display_prop = Some(prop.to_string());
        self
    }

    pub fn prop(mut self, prop: PropBuilder) -> Self {
        self.props.push(prop);
        self
    }

    pub fn method(mut self, method: MethodBuilder) -> Self {
        self.methods.push(method);
        self
    }

    pub fn data_source(mut self, source: DataSourceBuilder) -> Self {
        self.data_sources.push(source);
        self
    }
}

/// Builds a numeric enum type.
#[derive(Debug, Clone)]
pub struct EnumBuilder {
    name: String,
    members: Vec<EnumMember>,
}

impl EnumBuilder {
    pub fn new(name: &str) -> Self {
        EnumBuilder {
            name: name.to_string(),
            members: Vec::new(),
        }
    }

    pub fn member(mut self, value: i64, str_value: &str) -> Self {
        self.members.push(EnumMember {
            value,
            str_value: str_value.to_string(),
            display_name: humanize(str_value),
        });
        self
    }

    fn build(self) -> EnumType {
        EnumType {
            display_name: humanize(&self.name),
            name: self.name,
            members: self.members,
        }
    }
}

/// Assembles a full domain. Types may reference each other in any order;
/// principal keys are resolved once the whole set is known.
#[derive(Debug, Clone, Default)]
pub struct DomainBuilder {
    types: Vec<ModelBuilder>,
    enums: Vec<EnumBuilder>,
}

impl DomainBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, builder: ModelBuilder) -> Self {
        self.types.push(builder);
        self
    }

    pub fn add_enum(mut self, builder: EnumBuilder) -> Self {
        self.enums.push(builder);
        self
    }

    pub fn build(self) -> Result<Arc<Domain>, MetadataError> {
        let mut enums = HashMap::new();
        for builder in self.enums {
            let e = builder.build();
            let name = e.name.clone();
            if enums.insert(name.clone(), e).is_some() {
                return Err(MetadataError::Duplicate { kind: "enum", name });
            }
        }

        // Key props of every model type, so foreign keys and navigations
        // can name a principal type and get its key resolved here.
        let mut key_props: HashMap<String, String> = HashMap::new();
        for builder in &self.types {
            if !builder.is_model {
                continue;
            }
            let key = builder
                .props
                .iter()
                .find(|p| matches!(p.role, RawRole::PrimaryKey))
                .ok_or_else(|| MetadataError::InvalidPrimaryKey {
                    type_name: builder.name.clone(),
                    prop: "<none>".to_string(),
                })?;
            key_props.insert(builder.name.clone(), key.name.clone());
        }

        let mut types = HashMap::new();
        for builder in self.types {
            let class = build_class(builder, &key_props)?;
            let name = class.name.clone();
            if types.insert(name.clone(), class).is_some() {
                return Err(MetadataError::Duplicate {
                    kind: "type",
                    name,
                });
            }
        }

        let domain = Domain { types, enums };
        validator::validate(&domain)?;
        Ok(Arc::new(domain))
    }
}

fn build_class(
    builder: ModelBuilder,
    key_props: &HashMap<String, String>,
) -> Result<ClassType, MetadataError> {
    let mut props = Vec::with_capacity(builder.props.len());
    for pb in &builder.props {
        props.push(build_prop(pb, key_props)?);
    }

    let model = if builder.is_model {
        let key_prop = key_props
            .get(&builder.name)
            .cloned()
            .ok_or_else(|| MetadataError::InvalidPrimaryKey {
                type_name: builder.name.clone(),
                prop: "<none>".to_string(),
            })?;
        Some(ModelInfo {
            key_prop,
            controller_route: builder
                .controller_route
                .unwrap_or_else(|| builder.name.clone()),
            behaviors: builder.behaviors,
            data_sources: builder
                .data_sources
                .into_iter()
                .map(DataSourceBuilder::build)
                .collect(),
            methods: builder.methods.into_iter().map(MethodBuilder::build).collect(),
        })
    } else {
        None
    };

    Ok(ClassType {
        display_name: builder
            .display_name
            .unwrap_or_else(|| humanize(&builder.name)),
        name: builder.name,
        props,
        display_prop: builder.display_prop,
        model,
    })
}

fn build_prop(
    pb: &PropBuilder,
    key_props: &HashMap<String, String>,
) -> Result<Property, MetadataError> {
    let principal_key_of = |type_name: &str| {
        key_props
            .get(type_name)
            .cloned()
            .ok_or(MetadataError::MissingReference {
                kind: "model",
                name: type_name.to_string(),
            })
    };

    let role = match &pb.role {
        RawRole::Value => Role::Value,
        RawRole::PrimaryKey => Role::PrimaryKey,
        RawRole::ForeignKey {
            principal_type,
            navigation_prop,
        } => Role::ForeignKey {
            principal_key: principal_key_of(principal_type)?,
            principal_type: principal_type.clone(),
            navigation_prop: navigation_prop.clone(),
        },
        RawRole::ReferenceNavigation { foreign_key } => {
            let principal_type = match &pb.kind {
                ValueKind::Model(t) => t.clone(),
                other => {
                    return Err(MetadataError::Validation(format!(
                        "reference navigation '{}' must be a model value, got {}",
                        pb.name,
                        other.label()
                    )))
                }
            };
            Role::ReferenceNavigation {
                foreign_key: foreign_key.clone(),
                principal_key: principal_key_of(&principal_type)?,
            }
        }
        RawRole::CollectionNavigation {
            foreign_key,
            many_to_many,
        } => Role::CollectionNavigation {
            foreign_key: foreign_key.clone(),
            many_to_many: many_to_many.clone(),
        },
    };

    let pattern = match &pb.rules.pattern {
        Some(re) => Some(regex::Regex::new(re).map_err(|e| MetadataError::InvalidPattern {
            prop: pb.name.clone(),
            detail: e.to_string(),
        })?),
        None => None,
    };

    Ok(Property {
        value: pb.value_desc(),
        role,
        dont_serialize: pb.dont_serialize,
        rules: PropertyRules {
            required: pb.rules.required,
            min_length: pb.rules.min_length,
            max_length: pb.rules.max_length,
            pattern,
            minimum: pb.rules.minimum,
            maximum: pb.rules.maximum,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::DateKind;

    fn people_domain() -> Arc<Domain> {
        DomainBuilder::new()
            .add(
                ModelBuilder::model("Person")
                    .display_prop("name")
                    .prop(PropBuilder::number("personId").primary_key())
                    .prop(PropBuilder::string("name").required().max_length(100))
                    .prop(
                        PropBuilder::number("companyId")
                            .foreign_key("Company", Some("company")),
                    )
                    .prop(PropBuilder::model("company", "Company").reference_navigation("companyId"))
                    .prop(PropBuilder::date("birthDate", DateKind::DateOnly)),
            )
            .add(
                ModelBuilder::model("Company")
                    .display_prop("companyName")
                    .prop(PropBuilder::number("companyId").primary_key())
                    .prop(PropBuilder::string("companyName"))
                    .prop(
                        PropBuilder::collection_of_model("employees", "Person")
                            .collection_navigation("companyId"),
                    ),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn resolves_principal_keys_across_types() {
        let domain = people_domain();
        let person = domain.class("Person").unwrap();
        match &person.prop("companyId").unwrap().role {
            Role::ForeignKey {
                principal_type,
                principal_key,
                navigation_prop,
            } => {
                assert_eq!(principal_type, "Company");
                assert_eq!(principal_key, "companyId");
                assert_eq!(navigation_prop.as_deref(), Some("company"));
            }
            other => panic!("expected foreign key role, got {:?}", other),
        }
        match &person.prop("company").unwrap().role {
            Role::ReferenceNavigation { principal_key, .. } => {
                assert_eq!(principal_key, "companyId")
            }
            other => panic!("expected reference navigation, got {:?}", other),
        }
    }

    #[test]
    fn defaults_display_names_and_route() {
        let domain = people_domain();
        let person = domain.class("Person").unwrap();
        assert_eq!(person.prop("birthDate").unwrap().value.display_name, "Birth Date");
        assert_eq!(person.model.as_ref().unwrap().controller_route, "Person");
    }

    #[test]
    fn model_without_primary_key_is_rejected() {
        let err = DomainBuilder::new()
            .add(ModelBuilder::model("Orphan").prop(PropBuilder::string("name")))
            .build()
            .unwrap_err();
        assert!(matches!(err, MetadataError::InvalidPrimaryKey { .. }));
    }

    #[test]
    fn bad_pattern_is_rejected_at_build() {
        let err = DomainBuilder::new()
            .add(
                ModelBuilder::model("Widget")
                    .prop(PropBuilder::number("widgetId").primary_key())
                    .prop(PropBuilder::string("code").pattern("(unclosed")),
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, MetadataError::InvalidPattern { .. }));
    }
}
