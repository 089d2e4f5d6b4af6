//! Typed API clients over the standard CRUD endpoint surface.

pub mod cache;
pub mod caller;
pub mod query;
pub mod transport;

pub use caller::{
    Caller, CallerEnv, ConcurrencyMode, Hydration, ItemCaller, ItemOutcome, ListCaller,
    ListOutcome,
};
pub use query::{DataSourceInstance, DataSourceParams, FilterParams, ListParams};
pub use transport::{HttpRequest, HttpResponse, HttpTransport};

use crate::error::{ApiError, DataError};
use crate::metadata::{HttpMethod, Method, MethodTransport};
use crate::model::convert::{convert_to_model, convert_value, value_to_dto, MapToDtoOptions};
use crate::model::{FieldValue, ModelObject};
use crate::response::{BulkSavePayload, ItemResult, ListResult};
use crate::state::ClientState;
use query::{loose_query_string, percent_encode, value_to_query_string};
use std::collections::BTreeMap;

/// Arguments for the get endpoint.
#[derive(Debug, Clone, Default)]
pub struct GetArgs {
    pub id: FieldValue,
    pub params: DataSourceParams,
}

/// Arguments for the save endpoint. The body is an already-mapped DTO.
#[derive(Debug, Clone, Default)]
pub struct SaveArgs {
    pub dto: serde_json::Value,
    pub params: DataSourceParams,
}

/// Arguments for the delete endpoint.
#[derive(Debug, Clone, Default)]
pub struct DeleteArgs {
    pub id: FieldValue,
    pub params: DataSourceParams,
}

/// Arguments for the bulk save endpoint.
#[derive(Debug, Clone)]
pub struct BulkSaveArgs {
    pub payload: BulkSavePayload,
    pub params: DataSourceParams,
}

/// Custom method arguments by declared parameter name. Undeclared names
/// are ignored; missing ones are omitted from the request.
pub type MethodArgs = BTreeMap<String, FieldValue>;

/// Endpoint caller factory for one model type.
#[derive(Clone)]
pub struct ApiClient {
    state: ClientState,
    type_name: String,
    route: String,
}

impl ApiClient {
    pub fn new(state: &ClientState, type_name: &str) -> Result<Self, DataError> {
        let class = state.domain().model(type_name)?;
        let model = class.model.as_ref().ok_or_else(|| DataError::TypeMismatch {
            expected: "model".into(),
            actual: type_name.to_string(),
        })?;
        Ok(ApiClient {
            route: format!("{}/{}", state.base_path(), model.controller_route),
            state: state.clone(),
            type_name: type_name.to_string(),
        })
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn state(&self) -> &ClientState {
        &self.state
    }

    fn model_hydrator(
        &self,
    ) -> impl Fn(&serde_json::Value) -> Result<caller::Hydration<ItemOutcome<ModelObject>>, ApiError>
           + Send
           + Sync
           + 'static {
        let state = self.state.clone();
        let type_name = self.type_name.clone();
        move |json| hydrate_item(json, |v| convert_to_model(state.domain(), &type_name, v))
    }

    /// GET {route}/get/{id}
    pub fn get_caller(&self) -> ItemCaller<GetArgs, ModelObject> {
        let route = self.route.clone();
        Caller::new(
            self.state.caller_env(),
            move |args: &GetArgs| {
                let id = loose_query_string(&args.id).ok_or_else(|| {
                    DataError::parse("id", "<null>", "a primary key is required")
                })?;
                let mut request =
                    HttpRequest::get(&format!("{}/get/{}", route, percent_encode(&id)));
                request.query = args.params.to_query();
                Ok(request)
            },
            self.model_hydrator(),
        )
    }

    /// GET {route}/list
    pub fn list_caller(&self) -> ListCaller<ListParams, ModelObject> {
        let route = self.route.clone();
        let state = self.state.clone();
        let type_name = self.type_name.clone();
        Caller::new(
            self.state.caller_env(),
            move |params: &ListParams| {
                let mut request = HttpRequest::get(&format!("{}/list", route));
                request.query = params.to_query();
                Ok(request)
            },
            move |json| hydrate_list(json, |v| convert_to_model(state.domain(), &type_name, v)),
        )
    }

    /// GET {route}/count
    pub fn count_caller(&self) -> ItemCaller<FilterParams, i64> {
        let route = self.route.clone();
        Caller::new(
            self.state.caller_env(),
            move |params: &FilterParams| {
                let mut request = HttpRequest::get(&format!("{}/count", route));
                request.query = params.to_query();
                Ok(request)
            },
            |json| {
                hydrate_item(json, |v| {
                    v.as_i64().ok_or_else(|| {
                        DataError::parse("count", v.clone(), "expected an integer")
                    })
                })
            },
        )
    }

    /// POST {route}/save
    pub fn save_caller(&self) -> ItemCaller<SaveArgs, ModelObject> {
        let route = self.route.clone();
        Caller::new(
            self.state.caller_env(),
            move |args: &SaveArgs| {
                let mut request = HttpRequest::post(&format!("{}/save", route))
                    .with_body(args.dto.clone());
                request.query = args.params.to_query();
                Ok(request)
            },
            self.model_hydrator(),
        )
    }

    /// POST {route}/delete/{id}
    pub fn delete_caller(&self) -> ItemCaller<DeleteArgs, ModelObject> {
        let route = self.route.clone();
        Caller::new(
            self.state.caller_env(),
            move |args: &DeleteArgs| {
                let id = loose_query_string(&args.id).ok_or_else(|| {
                    DataError::parse("id", "<null>", "a primary key is required")
                })?;
                let mut request =
                    HttpRequest::post(&format!("{}/delete/{}", route, percent_encode(&id)));
                request.query = args.params.to_query();
                Ok(request)
            },
            self.model_hydrator(),
        )
    }

    /// POST {base}/bulkSave. The endpoint lives at the service root; the
    /// response object is the refreshed root model.
    pub fn bulk_save_caller(&self) -> ItemCaller<BulkSaveArgs, ModelObject> {
        let base = self.state.base_path().to_string();
        Caller::new(
            self.state.caller_env(),
            move |args: &BulkSaveArgs| {
                let body = serde_json::to_value(&args.payload).map_err(|e| {
                    DataError::parse("bulkSave", "<payload>", &e.to_string())
                })?;
                let mut request =
                    HttpRequest::post(&format!("{}/bulkSave", base)).with_body(body);
                request.query = args.params.to_query();
                Ok(request)
            },
            self.model_hydrator(),
        )
    }

    fn find_method(&self, name: &str) -> Result<Method, DataError> {
        let class = self.state.domain().model(&self.type_name)?;
        class
            .model
            .as_ref()
            .and_then(|m| m.method(name))
            .cloned()
            .ok_or_else(|| DataError::UnknownMethod {
                type_name: self.type_name.clone(),
                method: name.to_string(),
            })
    }

    fn method_request_builder(
        &self,
        method: Method,
    ) -> impl Fn(&MethodArgs) -> Result<HttpRequest, ApiError> + Send + Sync + 'static {
        let route = self.route.clone();
        let state = self.state.clone();
        move |args: &MethodArgs| {
            let mut request = HttpRequest::new(
                method.http_method,
                &format!("{}/{}", route, method.name),
            );
            match method.http_method {
                HttpMethod::Get | HttpMethod::Delete => {
                    for param in &method.params {
                        if let Some(value) = args.get(&param.name) {
                            if let Some(s) = value_to_query_string(param, value) {
                                request = request.with_query(&param.name, &s);
                            }
                        }
                    }
                }
                _ => {
                    let mut body = serde_json::Map::new();
                    for param in &method.params {
                        if let Some(value) = args.get(&param.name) {
                            if let Some(v) = value_to_dto(
                                state.domain(),
                                param,
                                value,
                                &MapToDtoOptions::default(),
                            )? {
                                body.insert(param.name.clone(), v);
                            }
                        }
                    }
                    request = request.with_body(serde_json::Value::Object(body));
                }
            }
            Ok(request)
        }
    }

    /// Caller for a custom method returning an item envelope.
    pub fn item_method_caller(
        &self,
        name: &str,
    ) -> Result<ItemCaller<MethodArgs, FieldValue>, DataError> {
        let method = self.find_method(name)?;
        if method.transport != MethodTransport::Item {
            return Err(DataError::TypeMismatch {
                expected: "item method".into(),
                actual: format!("list method '{}'", name),
            });
        }
        let state = self.state.clone();
        let ret = method.return_value.clone();
        Ok(Caller::new(
            self.state.caller_env(),
            self.method_request_builder(method),
            move |json| {
                hydrate_item(json, |v| match &ret {
                    Some(desc) => convert_value(state.domain(), desc, v),
                    None => Ok(FieldValue::Null),
                })
            },
        ))
    }

    /// Caller for a custom method returning a list envelope. The declared
    /// return value describes the list items.
    pub fn list_method_caller(
        &self,
        name: &str,
    ) -> Result<ListCaller<MethodArgs, FieldValue>, DataError> {
        let method = self.find_method(name)?;
        if method.transport != MethodTransport::List {
            return Err(DataError::TypeMismatch {
                expected: "list method".into(),
                actual: format!("item method '{}'", name),
            });
        }
        let state = self.state.clone();
        let ret = method.return_value.clone();
        Ok(Caller::new(
            self.state.caller_env(),
            self.method_request_builder(method),
            move |json| {
                hydrate_list(json, |v| match &ret {
                    Some(desc) => convert_value(state.domain(), desc, v),
                    None => Ok(FieldValue::Null),
                })
            },
        ))
    }
}

fn parse_envelope<T: serde::de::DeserializeOwned>(
    json: &serde_json::Value,
) -> Result<T, ApiError> {
    serde_json::from_value(json.clone()).map_err(|e| {
        ApiError::Data(DataError::parse("response envelope", "<json>", &e.to_string()))
    })
}

/// Interpret an item envelope, mapping its object through `map`.
pub fn hydrate_item<R>(
    json: &serde_json::Value,
    map: impl Fn(&serde_json::Value) -> Result<R, DataError>,
) -> Result<Hydration<ItemOutcome<R>>, ApiError> {
    let envelope: ItemResult<serde_json::Value> = parse_envelope(json)?;
    if !envelope.was_successful {
        return Ok(Hydration {
            message: envelope.message,
            validation_issues: envelope.validation_issues,
            success: None,
        });
    }
    let object = match &envelope.object {
        Some(v) if !v.is_null() => Some(map(v)?),
        _ => None,
    };
    Ok(Hydration {
        message: envelope.message,
        validation_issues: envelope.validation_issues,
        success: Some(ItemOutcome {
            object,
            ref_map: envelope.ref_map,
        }),
    })
}

/// Interpret a list envelope, mapping each element through `map`.
pub fn hydrate_list<R>(
    json: &serde_json::Value,
    map: impl Fn(&serde_json::Value) -> Result<R, DataError>,
) -> Result<Hydration<ListOutcome<R>>, ApiError> {
    let envelope: ListResult<serde_json::Value> = parse_envelope(json)?;
    if !envelope.was_successful {
        return Ok(Hydration {
            message: envelope.message,
            validation_issues: Vec::new(),
            success: None,
        });
    }
    let mut items = Vec::with_capacity(envelope.list.len());
    for v in &envelope.list {
        items.push(map(v)?);
    }
    Ok(Hydration {
        message: envelope.message,
        validation_issues: Vec::new(),
        success: Some(ListOutcome {
            items,
            page: envelope.page,
            page_size: envelope.page_size,
            page_count: envelope.page_count,
            total_count: envelope.total_count,
        }),
    })
}
