//! Full-stack flows against an in-process axum API: load, edit, save,
//! delete, list paging, bulk save, and query-string binding.

mod common;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use bindery_sdk::{FieldValue, ListViewModel, MemoryRoute, QueryBinder, ViewModel};
use common::{client, QueueTransport, RouterTransport};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

struct Store {
    people: Mutex<BTreeMap<i64, Value>>,
    pets: Mutex<BTreeMap<i64, Value>>,
    next_id: AtomicI64,
}

impl Store {
    fn new() -> Arc<Self> {
        Arc::new(Store {
            people: Mutex::new(BTreeMap::new()),
            pets: Mutex::new(BTreeMap::new()),
            next_id: AtomicI64::new(1000),
        })
    }

    fn seed_person(&self, id: i64, name: &str) {
        self.people
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, json!({"personId": id, "name": name, "companyId": 9}));
    }

    fn seed_pet(&self, id: i64, name: &str, owner: i64) {
        self.pets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, json!({"petId": id, "name": name, "ownerId": owner}));
    }

    fn person_name(&self, id: i64) -> Option<String> {
        self.people
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .and_then(|p| p["name"].as_str().map(str::to_string))
    }

    fn assign_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Person with its company and pets embedded, as the get and save
    /// endpoints return it.
    fn expanded_person(&self, id: i64) -> Option<Value> {
        let mut person = self
            .people
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()?;
        if person["companyId"].as_i64() == Some(9) {
            person["company"] = json!({"companyId": 9, "companyName": "Initech"});
        }
        let pets: Vec<Value> = self
            .pets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|p| p["ownerId"].as_i64() == Some(id))
            .cloned()
            .collect();
        person["pets"] = Value::Array(pets);
        Some(person)
    }

    fn merge_person(&self, id: i64, dto: &Value) {
        let mut people = self.people.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = people
            .entry(id)
            .or_insert_with(|| json!({"personId": id}));
        if let (Some(target), Some(fields)) = (entry.as_object_mut(), dto.as_object()) {
            for (name, value) in fields {
                if name != "pets" && name != "company" {
                    target.insert(name.clone(), value.clone());
                }
            }
            target.insert("personId".into(), json!(id));
        }
    }

    fn merge_pet(&self, id: i64, dto: &Value) {
        let mut pets = self.pets.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = pets.entry(id).or_insert_with(|| json!({"petId": id}));
        if let (Some(target), Some(fields)) = (entry.as_object_mut(), dto.as_object()) {
            for (name, value) in fields {
                target.insert(name.clone(), value.clone());
            }
            target.insert("petId".into(), json!(id));
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

async fn get_person(
    State(store): State<Arc<Store>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    store.expanded_person(id).map(ok).ok_or_else(not_found)
}

fn filtered_people(store: &Store, search: Option<&str>) -> Vec<Value> {
    store
        .people
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .values()
        .filter(|p| match search {
            Some(s) => p["name"]
                .as_str()
                .is_some_and(|n| n.to_lowercase().contains(&s.to_lowercase())),
            None => true,
        })
        .cloned()
        .collect()
}

async fn list_people(
    State(store): State<Arc<Store>>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    let matches = filtered_people(&store, query.get("search").map(String::as_str));
    let page: i64 = query.get("page").and_then(|p| p.parse().ok()).unwrap_or(1);
    let page_size: i64 = query
        .get("pageSize")
        .and_then(|p| p.parse().ok())
        .unwrap_or(10);
    let total = matches.len() as i64;
    let start = ((page - 1) * page_size).max(0) as usize;
    let items: Vec<Value> = matches
        .into_iter()
        .skip(start)
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

async fn count_people(
    State(store): State<Arc<Store>>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    let matches = filtered_people(&store, query.get("search").map(String::as_str));
    Json(json!({"wasSuccessful": true, "object": matches.len()}))
}

// Save responses are shallow; only get and bulkSave embed related data.
async fn save_person(
    State(store): State<Arc<Store>>,
    Json(dto): Json<Value>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let id = dto["personId"].as_i64().unwrap_or_else(|| store.assign_id());
    store.merge_person(id, &dto);
    let person = store
        .people
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&id)
        .cloned();
    person.map(ok).ok_or_else(not_found)
}

async fn delete_person(
    State(store): State<Arc<Store>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let removed = store
        .people
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&id);
    match removed {
        Some(_) => Ok(Json(json!({"wasSuccessful": true}))),
        None => Err(not_found()),
    }
}

async fn bulk_save(
    State(store): State<Arc<Store>>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let mut assigned: HashMap<u64, i64> = HashMap::new();
    let mut ref_map = serde_json::Map::new();
    let mut root_key: Option<(String, i64)> = None;

    let items = payload["items"].as_array().cloned().unwrap_or_default();
    for item in &items {
        let type_name = item["type"].as_str().unwrap_or_default().to_string();
        let key_prop = match type_name.as_str() {
            "Person" => "personId",
            "Pet" => "petId",
            _ => continue,
        };
        let mut data = item["data"].clone();
        let refs = item["refs"].as_object().cloned().unwrap_or_default();

        match item["action"].as_str() {
            Some("save") => {
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
                        if let Some(key) =
                            stable.as_u64().and_then(|s| assigned.get(&s)).copied()
                        {
                            data[prop.as_str()] = json!(key);
                        }
                    }
                }
                match type_name.as_str() {
                    "Person" => store.merge_person(id, &data),
                    _ => store.merge_pet(id, &data),
                }
                if item["root"].as_bool() == Some(true) {
                    root_key = Some((type_name.clone(), id));
                }
            }
            Some("delete") => {
                if let Some(id) = data[key_prop].as_i64() {
                    match type_name.as_str() {
                        "Person" => {
                            store
                                .people
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .remove(&id);
                        }
                        _ => {
                            store
                                .pets
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .remove(&id);
                        }
                    }
                }
            }
            _ => {
                if item["root"].as_bool() == Some(true) {
                    if let Some(id) = data[key_prop].as_i64() {
                        root_key = Some((type_name.clone(), id));
                    }
                }
            }
        }
    }

    let object = match root_key {
        Some((_, id)) => store.expanded_person(id).ok_or_else(not_found)?,
        None => return Err(not_found()),
    };
    Ok(Json(json!({
        "wasSuccessful": true,
        "object": object,
        "refMap": ref_map
    })))
}

fn router(store: Arc<Store>) -> Router {
    Router::new()
        .route("/api/Person/get/:id", get(get_person))
        .route("/api/Person/list", get(list_people))
        .route("/api/Person/count", get(count_people))
        .route("/api/Person/save", post(save_person))
        .route("/api/Person/delete/:id", post(delete_person))
        .route("/api/bulkSave", post(bulk_save))
        .with_state(store)
}

fn server(store: Arc<Store>) -> bindery_sdk::ClientState {
    client(RouterTransport::new(router(store)))
}

#[tokio::test]
async fn load_edit_save_round_trip() {
    let store = Store::new();
    store.seed_person(1, "Alice");
    store.seed_pet(10, "Rex", 1);
    let state = server(store.clone());

    let person = ViewModel::new(&state, "Person").unwrap();
    assert!(person.load(Some(1.into())).await.unwrap());
    assert_eq!(person.get("name"), FieldValue::from("Alice"));
    assert!(!person.is_dirty());

    let company = person.get_object("company").unwrap();
    assert_eq!(company.get("companyName"), FieldValue::from("Initech"));
    let pets = person.get_collection("pets");
    assert_eq!(pets.len(), 1);
    assert_eq!(pets[0].get("name"), FieldValue::from("Rex"));

    person.set("name", "Alicia").unwrap();
    assert_eq!(person.dirty_props(), vec!["name".to_string()]);
    assert!(person.save().await.unwrap());
    assert!(!person.is_dirty());
    assert_eq!(store.person_name(1).as_deref(), Some("Alicia"));
    // Untouched fields survive the partial save.
    assert_eq!(person.get("companyId"), FieldValue::Int(9));
}

#[tokio::test]
async fn saving_a_new_person_adopts_the_server_key() {
    let store = Store::new();
    let state = server(store.clone());

    let person = ViewModel::new(&state, "Person").unwrap();
    person.set("name", "Kai").unwrap();
    person.set("companyId", 9).unwrap();
    assert!(!person.is_persisted());

    assert!(person.save().await.unwrap());
    assert!(person.is_persisted());
    assert_eq!(person.primary_key(), FieldValue::Int(1000));
    assert_eq!(store.person_name(1000).as_deref(), Some("Kai"));
}

#[tokio::test]
async fn extra_save_props_ride_along_with_dirty_fields() {
    let transport = QueueTransport::new();
    transport.push_json(
        200,
        json!({"wasSuccessful": true, "object": {"personId": 1, "name": "Ada", "companyId": 9}}),
    );
    let state = client(transport.clone());

    let person = ViewModel::new(&state, "Person").unwrap();
    person.set("personId", 1).unwrap();
    person.set("companyId", 9).unwrap();
    person.set_is_dirty(false);
    person.set("name", "Ada").unwrap();
    person.set_extra_save_props(&["companyId"]);

    assert!(person.save().await.unwrap());
    let body = transport.request(0).body.unwrap();
    assert_eq!(body["name"], json!("Ada"));
    // Clean, but configured to always ride along.
    assert_eq!(body["companyId"], json!(9));
    assert!(body.get("pets").is_none());
}

#[tokio::test]
async fn saving_a_referenced_company_first_fills_the_waiting_foreign_key() {
    let transport = QueueTransport::new();
    transport.push_json(
        200,
        json!({"wasSuccessful": true, "object": {"companyId": 77, "companyName": "Initech"}}),
    );
    let state = client(transport.clone());

    let person = ViewModel::new(&state, "Person").unwrap();
    person.set("name", "Ada").unwrap();
    let company = ViewModel::new(&state, "Company").unwrap();
    company.set("companyName", "Initech").unwrap();
    person.set_object("company", Some(&company)).unwrap();
    assert!(person.get("companyId").is_null());

    assert!(company.save().await.unwrap());

    // The person was waiting on the new key and picks it up dirty, ready
    // for its own save.
    assert_eq!(person.get("companyId"), FieldValue::Int(77));
    assert!(person.dirty_props().contains(&"companyId".to_string()));
    assert!(person.get_object("company").unwrap().same_instance(&company));
}

#[tokio::test]
async fn validation_stops_saves_before_the_network() {
    let store = Store::new();
    let state = server(store.clone());

    let person = ViewModel::new(&state, "Person").unwrap();
    person.set("companyId", 9).unwrap();
    let error = person.save().await.unwrap_err();
    assert!(error.to_string().contains("Name is required"));
    assert!(store.people.lock().unwrap().is_empty());
}

#[tokio::test]
async fn lists_page_and_filter_server_side() {
    let store = Store::new();
    let names = [
        "Ada", "Alan", "Bea", "Bob", "Cleo", "Dan", "Eve", "Fay", "Gus", "Hal", "Ivy", "Jo",
    ];
    for (i, name) in names.iter().enumerate() {
        store.seed_person(i as i64 + 1, name);
    }
    let state = server(store.clone());

    let list = ListViewModel::new(&state, "Person").unwrap();
    list.set_page_size(5);
    assert!(list.load().await.unwrap());
    assert_eq!(list.items().len(), 5);
    assert_eq!(list.total_count(), Some(12));
    assert_eq!(list.page_count(), Some(3));
    assert!(list.has_next_page());
    assert!(!list.has_previous_page());

    list.set_page(3);
    assert!(list.load().await.unwrap());
    assert_eq!(list.items().len(), 2);
    assert!(!list.has_next_page());

    list.set_page(1);
    list.update_params(|p| p.filter.search = Some("al".into()));
    assert!(list.load().await.unwrap());
    let found: Vec<FieldValue> = list.items().iter().map(|vm| vm.get("name")).collect();
    assert_eq!(found, vec![FieldValue::from("Alan"), FieldValue::from("Hal")]);
    assert_eq!(list.count().await.unwrap(), Some(2));
}

#[tokio::test]
async fn delete_removes_on_both_sides() {
    let store = Store::new();
    store.seed_person(2, "Bob");
    let state = server(store.clone());

    let person = ViewModel::new(&state, "Person").unwrap();
    assert!(person.load(Some(2.into())).await.unwrap());
    assert!(person.delete().await.unwrap());
    assert!(person.is_removed());
    assert!(store.people.lock().unwrap().is_empty());
}

#[tokio::test]
async fn bulk_save_persists_a_new_graph_and_keeps_identity() {
    let store = Store::new();
    let state = server(store.clone());

    let person = ViewModel::new(&state, "Person").unwrap();
    person.set("name", "Kai").unwrap();
    person.set("companyId", 9).unwrap();
    let pet = person.add_child("pets").unwrap();
    pet.set("name", "Rex").unwrap();

    assert!(person.bulk_save().await.unwrap());

    assert_eq!(person.primary_key(), FieldValue::Int(1000));
    assert_eq!(pet.primary_key(), FieldValue::Int(1001));
    assert_eq!(pet.get("ownerId"), FieldValue::Int(1000));
    assert!(!person.is_dirty());
    assert!(!pet.is_dirty());

    // Reconciliation kept the very instances the caller was holding.
    let pets = person.get_collection("pets");
    assert_eq!(pets.len(), 1);
    assert!(pets[0].same_instance(&pet));

    let stored = store.pets.lock().unwrap().get(&1001).cloned().unwrap();
    assert_eq!(stored["ownerId"].as_i64(), Some(1000));
}

#[tokio::test]
async fn bulk_save_sends_removed_children_as_deletes() {
    let store = Store::new();
    store.seed_person(1, "Alice");
    store.seed_pet(10, "Rex", 1);
    store.seed_pet(11, "Moss", 1);
    let state = server(store.clone());

    let person = ViewModel::new(&state, "Person").unwrap();
    assert!(person.load(Some(1.into())).await.unwrap());
    let pets = person.get_collection("pets");
    assert_eq!(pets.len(), 2);
    pets[0].remove();

    assert!(person.bulk_save().await.unwrap());
    assert_eq!(store.pets.lock().unwrap().len(), 1);
    assert_eq!(person.get_collection("pets").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn query_binding_drives_list_parameters() {
    let store = Store::new();
    for i in 1..=12 {
        store.seed_person(i, &format!("Person {i}"));
    }
    let state = server(store.clone());

    let route = Arc::new(MemoryRoute::new());
    let binder = QueryBinder::new(route.clone());
    let list = ListViewModel::new(&state, "Person").unwrap();
    list.set_page_size(5);
    binder.bind_list_params(&list);

    route.set_query_value("page", Some("2"));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(list.page(), 2);

    assert!(list.load().await.unwrap());
    let first = list.items()[0].get("name");
    assert_eq!(first, FieldValue::from("Person 6"));

    list.set_page(3);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(route.query_value("page").as_deref(), Some("3"));
}
