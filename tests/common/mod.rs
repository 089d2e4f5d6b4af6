//! Shared fixtures for the integration suite: a relational test domain and
//! transports that replay scripts or dispatch into an in-process router.

#![allow(dead_code)]

use async_trait::async_trait;
use bindery_sdk::api::{HttpRequest, HttpResponse, HttpTransport};
use bindery_sdk::metadata::{
    Domain, DomainBuilder, MethodBuilder, ModelBuilder, PropBuilder,
};
use bindery_sdk::{ApiError, ClientState};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Person/Company/Pet graph with custom methods on Person.
pub fn domain() -> Arc<Domain> {
    DomainBuilder::new()
        .add(
            ModelBuilder::model("Person")
                .display_prop("name")
                .prop(PropBuilder::number("personId").primary_key())
                .prop(PropBuilder::string("name").required())
                .prop(
                    PropBuilder::number("companyId")
                        .foreign_key("Company", Some("company"))
                        .required(),
                )
                .prop(PropBuilder::model("company", "Company").reference_navigation("companyId"))
                .prop(
                    PropBuilder::collection_of_model("pets", "Pet")
                        .collection_navigation("ownerId"),
                )
                .method(
                    MethodBuilder::item_post("rename")
                        .param(PropBuilder::number("id"))
                        .param(PropBuilder::string("name"))
                        .returns(PropBuilder::model("person", "Person")),
                )
                .method(
                    MethodBuilder::list_get("namesStartingWith")
                        .param(PropBuilder::string("prefix"))
                        .returns(PropBuilder::string("name")),
                ),
        )
        .add(
            ModelBuilder::model("Pet")
                .display_prop("name")
                .prop(PropBuilder::number("petId").primary_key())
                .prop(PropBuilder::string("name"))
                .prop(PropBuilder::number("ownerId").foreign_key("Person", None)),
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

/// Replays scripted responses in order, recording every request. An
/// optional delay holds each request in flight so tests can overlap calls
/// under a paused clock.
pub struct QueueTransport {
    delay: Duration,
    responses: Mutex<VecDeque<Result<HttpResponse, ApiError>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl QueueTransport {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(QueueTransport {
            delay,
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn push_json(&self, status: u16, body: serde_json::Value) {
        self.push_raw(status, Some("application/json"), &body.to_string());
    }

    pub fn push_raw(&self, status: u16, content_type: Option<&str>, body: &str) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Ok(HttpResponse {
                status,
                content_type: content_type.map(str::to_string),
                body: body.to_string(),
            }));
    }

    pub fn push_error(&self, error: ApiError) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Err(error));
    }

    pub fn request_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn request(&self, index: usize) -> HttpRequest {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)[index]
            .clone()
    }
}

#[async_trait]
impl HttpTransport for QueueTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        let response = {
            let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
            requests.push(request);
            self.responses
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
        };
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        response.unwrap_or_else(|| Err(ApiError::Network("unscripted request".into())))
    }
}

/// Dispatches requests into an axum router without binding a socket.
pub struct RouterTransport {
    router: axum::Router,
}

impl RouterTransport {
    pub fn new(router: axum::Router) -> Arc<Self> {
        Arc::new(RouterTransport { router })
    }
}

#[async_trait]
impl HttpTransport for RouterTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        use axum::http;
        use tower::ServiceExt;

        let method = match request.method {
            bindery_sdk::metadata::HttpMethod::Get => http::Method::GET,
            bindery_sdk::metadata::HttpMethod::Post => http::Method::POST,
            bindery_sdk::metadata::HttpMethod::Put => http::Method::PUT,
            bindery_sdk::metadata::HttpMethod::Patch => http::Method::PATCH,
            bindery_sdk::metadata::HttpMethod::Delete => http::Method::DELETE,
        };
        let mut builder = http::Request::builder().method(method).uri(request.uri());
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        let body = match &request.body {
            Some(json) => {
                builder = builder.header(http::header::CONTENT_TYPE, "application/json");
                axum::body::Body::from(json.to_string())
            }
            None => axum::body::Body::empty(),
        };
        let req = builder
            .body(body)
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let response = self
            .router
            .clone()
            .oneshot(req)
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Ok(HttpResponse {
            status,
            content_type,
            body: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }
}

pub fn client(transport: Arc<dyn HttpTransport>) -> ClientState {
    ClientState::new(domain(), transport)
}
