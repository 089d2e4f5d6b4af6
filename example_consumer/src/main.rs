//! Example consumer: a separate Rust project that uses bindery-sdk as a dependency.
//!
//! Run from repo root: `cargo run -p example-consumer`
//! Or from this directory: `cargo run`
//!
//! The backend here is an axum router running in-process, standing in for a
//! generated CRUD API. The SDK only sees the transport seam, so swapping in
//! a real HTTP client changes nothing below.

use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use bindery_sdk::api::{HttpRequest, HttpResponse, HttpTransport};
use bindery_sdk::metadata::HttpMethod;
use bindery_sdk::{
    ApiError, AutoSaveOptions, ClientState, Domain, DomainBuilder, ListViewModel, MemoryRoute,
    ModelBuilder, PropBuilder, QueryBinder, ViewModel,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

fn domain() -> Result<Arc<Domain>, bindery_sdk::MetadataError> {
    DomainBuilder::new()
        .add(
            ModelBuilder::model("Author")
                .display_prop("name")
                .prop(PropBuilder::number("authorId").primary_key())
                .prop(PropBuilder::string("name").required().max_length(100))
                .prop(
                    PropBuilder::collection_of_model("books", "Book")
                        .collection_navigation("authorId"),
                ),
        )
        .add(
            ModelBuilder::model("Book")
                .display_prop("title")
                .prop(PropBuilder::number("bookId").primary_key())
                .prop(PropBuilder::string("title").required())
                .prop(PropBuilder::number("authorId").foreign_key("Author", None)),
        )
        .build()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("bindery_sdk=info,example_consumer=info")),
        )
        .init();

    let store = Store::new();
    let state = ClientState::new(domain()?, RouterTransport::new(router(store.clone())));

    // Build an object graph locally and persist it in one round trip.
    let author = ViewModel::new(&state, "Author")?;
    author.set("name", "Ursula K. Le Guin")?;
    for title in ["A Wizard of Earthsea", "The Dispossessed"] {
        let book = author.add_child("books")?;
        book.set("title", title)?;
    }
    author.bulk_save().await?;
    tracing::info!(
        author = %author.display().unwrap_or_default(),
        key = ?author.primary_key(),
        books = author.get_collection("books").len(),
        "bulk save assigned server keys"
    );

    // Page through the list endpoint.
    let list = ListViewModel::new(&state, "Author")?;
    list.set_page_size(10);
    list.load().await?;
    for item in list.items() {
        tracing::info!(
            author = %item.display().unwrap_or_default(),
            key = ?item.primary_key(),
            "listed"
        );
    }

    // Auto save: edits flush on their own after the quiet period.
    author.start_auto_save(AutoSaveOptions {
        wait: Duration::from_millis(200),
        deep: true,
        ..Default::default()
    });
    author.set("name", "U. K. Le Guin")?;
    let book = author.get_collection("books")[0].clone();
    book.set("title", "A Wizard of Earthsea (revised)")?;
    tokio::time::sleep(Duration::from_millis(600)).await;
    author.stop_auto_save();
    tracing::info!(
        dirty = author.is_dirty() || book.is_dirty(),
        stored = %store.author_name(1000).unwrap_or_default(),
        "auto save flushed pending edits"
    );

    // Two-way query string binding for list parameters.
    let route = Arc::new(MemoryRoute::new());
    let binder = QueryBinder::new(route.clone());
    binder.bind_list_params(&list);
    list.set_page(2);
    tokio::time::sleep(Duration::from_millis(50)).await;
    tracing::info!(
        page = %route.query_value("page").unwrap_or_default(),
        "list paging reflected into the query string"
    );
    binder.stop();

    Ok(())
}

/// In-memory backend the router serves from.
struct Store {
    authors: Mutex<BTreeMap<i64, Value>>,
    books: Mutex<BTreeMap<i64, Value>>,
    next_id: AtomicI64,
}

impl Store {
    fn new() -> Arc<Self> {
        Arc::new(Store {
            authors: Mutex::new(BTreeMap::new()),
            books: Mutex::new(BTreeMap::new()),
            next_id: AtomicI64::new(1000),
        })
    }

    fn assign_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn author_name(&self, id: i64) -> Option<String> {
        self.authors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .and_then(|a| a["name"].as_str().map(str::to_string))
    }

    fn expanded_author(&self, id: i64) -> Option<Value> {
        let mut author = self
            .authors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()?;
        let books: Vec<Value> = self
            .books
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|b| b["authorId"].as_i64() == Some(id))
            .cloned()
            .collect();
        author["books"] = Value::Array(books);
        Some(author)
    }

    fn merge(&self, type_name: &str, id: i64, dto: &Value) {
        let (mut table, key) = match type_name {
            "Author" => (
                self.authors.lock().unwrap_or_else(PoisonError::into_inner),
                "authorId",
            ),
            _ => (
                self.books.lock().unwrap_or_else(PoisonError::into_inner),
                "bookId",
            ),
        };
        let entry = table.entry(id).or_insert_with(|| json!({}));
        if let (Some(target), Some(fields)) = (entry.as_object_mut(), dto.as_object()) {
            for (name, value) in fields {
                if name != "books" {
                    target.insert(name.clone(), value.clone());
                }
            }
            target.insert(key.into(), json!(id));
        }
    }
}

fn ok(object: Value) -> Json<Value> {
    Json(json!({"wasSuccessful": true, "object": object}))
}

fn not_found() -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"wasSuccessful": false, "message": "not found"})),
    )
}

async fn get_author(
    State(store): State<Arc<Store>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    store.expanded_author(id).map(ok).ok_or_else(not_found)
}

async fn list_authors(
    State(store): State<Arc<Store>>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    let all: Vec<Value> = store
        .authors
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .values()
        .cloned()
        .collect();
    let page: i64 = query.get("page").and_then(|p| p.parse().ok()).unwrap_or(1);
    let page_size: i64 = query
        .get("pageSize")
        .and_then(|p| p.parse().ok())
        .unwrap_or(10);
    let total = all.len() as i64;
    let items: Vec<Value> = all
        .into_iter()
        .skip(((page - 1) * page_size).max(0) as usize)
        .take(page_size as usize)
        .collect();
    Json(json!({
        "wasSuccessful": true,
        "list": items,
        "page": page,
        "pageSize": page_size,
        "pageCount": (total + page_size - 1) / page_size,
        "totalCount": total
    }))
}

/// Save responses are shallow: children come back from get and bulkSave,
/// never from a plain save, so a parent save cannot clobber unsaved child
/// edits on the client.
async fn save_author(
    State(store): State<Arc<Store>>,
    Json(dto): Json<Value>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let id = dto["authorId"].as_i64().unwrap_or_else(|| store.assign_id());
    store.merge("Author", id, &dto);
    let author = store
        .authors
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&id)
        .cloned();
    author.map(ok).ok_or_else(not_found)
}

async fn save_book(
    State(store): State<Arc<Store>>,
    Json(dto): Json<Value>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let id = dto["bookId"].as_i64().unwrap_or_else(|| store.assign_id());
    store.merge("Book", id, &dto);
    let book = store
        .books
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&id)
        .cloned();
    book.map(ok).ok_or_else(not_found)
}

async fn bulk_save(
    State(store): State<Arc<Store>>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let mut assigned: HashMap<u64, i64> = HashMap::new();
    let mut ref_map = serde_json::Map::new();
    let mut root: Option<i64> = None;

    for item in payload["items"].as_array().cloned().unwrap_or_default() {
        let type_name = item["type"].as_str().unwrap_or_default().to_string();
        let key_prop = if type_name == "Author" { "authorId" } else { "bookId" };
        let mut data = item["data"].clone();
        let refs = item["refs"].as_object().cloned().unwrap_or_default();

        if item["action"].as_str() != Some("save") {
            continue;
        }
        let id = match data[key_prop].as_i64() {
            Some(id) => id,
            None => {
                let id = store.assign_id();
                if let Some(stable) = refs.get(key_prop).and_then(Value::as_u64) {
                    assigned.insert(stable, id);
                    ref_map.insert(stable.to_string(), json!(id));
                }
                id
            }
        };
        for (prop, stable) in &refs {
            if prop != key_prop {
                if let Some(key) = stable.as_u64().and_then(|s| assigned.get(&s)).copied() {
                    data[prop.as_str()] = json!(key);
                }
            }
        }
        store.merge(&type_name, id, &data);
        if item["root"].as_bool() == Some(true) {
            root = Some(id);
        }
    }

    let object = root
        .and_then(|id| store.expanded_author(id))
        .ok_or_else(not_found)?;
    Ok(Json(json!({
        "wasSuccessful": true,
        "object": object,
        "refMap": ref_map
    })))
}

fn router(store: Arc<Store>) -> Router {
    Router::new()
        .route("/api/Author/get/:id", get(get_author))
        .route("/api/Author/list", get(list_authors))
        .route("/api/Author/save", post(save_author))
        .route("/api/Book/save", post(save_book))
        .route("/api/bulkSave", post(bulk_save))
        .with_state(store)
}

/// Dispatches SDK requests straight into the router, no socket involved.
struct RouterTransport {
    router: Router,
}

impl RouterTransport {
    fn new(router: Router) -> Arc<Self> {
        Arc::new(RouterTransport { router })
    }
}

#[async_trait]
impl HttpTransport for RouterTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        use axum::http;
        use tower::ServiceExt;

        let method = match request.method {
            HttpMethod::Get => http::Method::GET,
            HttpMethod::Post => http::Method::POST,
            HttpMethod::Put => http::Method::PUT,
            HttpMethod::Patch => http::Method::PATCH,
            HttpMethod::Delete => http::Method::DELETE,
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
