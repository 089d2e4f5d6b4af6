//! Bulk save: persist a whole object graph in one request.

use super::{SaveMode, ViewModel};
use crate::api::BulkSaveArgs;
use crate::error::{ApiError, DataError};
use crate::metadata::Role;
use crate::model::convert::{map_to_dto, map_to_dto_filtered, MapToDtoOptions};
use crate::model::FieldValue;
use crate::response::{BulkSaveAction, BulkSaveItem, BulkSavePayload};
use std::collections::{HashMap, HashSet};

struct Entry {
    vm: ViewModel,
    action: BulkSaveAction,
    is_root: bool,
}

impl ViewModel {
    /// Persist this instance and everything reachable from it in one
    /// request: dirty and unsaved descendants save, removed persisted
    /// children delete, and foreign keys between unsaved instances are
    /// wired up server-side through stable ids. On success the whole
    /// graph reloads from the response. Returns false when superseded.
    pub async fn bulk_save(&self) -> Result<bool, ApiError> {
        let entries = self.gather_graph()?;
        preflight(&entries)?;

        let mut items = Vec::with_capacity(entries.len());
        for entry in &entries {
            items.push(build_item(entry)?);
        }

        // Clear before sending so edits made during the request stay
        // dirty; put everything back if the request never lands.
        let mut cleared: Vec<(ViewModel, HashSet<String>)> = Vec::new();
        for entry in &entries {
            if matches!(entry.action, BulkSaveAction::Save) {
                let taken = std::mem::take(&mut entry.vm.inner.vm_write().dirty);
                cleared.push((entry.vm.clone(), taken));
            }
        }

        let params = self.inner.vm_read().params.clone();
        let outcome = match self
            .bulk_saver()
            .invoke(BulkSaveArgs {
                payload: BulkSavePayload { items },
                params,
            })
            .await
        {
            Ok(Some(outcome)) => outcome,
            Ok(None) => {
                for (vm, taken) in cleared {
                    vm.inner.vm_write().dirty.extend(taken);
                }
                return Ok(false);
            }
            Err(e) => {
                for (vm, taken) in cleared {
                    vm.inner.vm_write().dirty.extend(taken);
                }
                return Err(e);
            }
        };

        // Stable id to real key: adopt new keys on the original instances
        // so references held elsewhere see them.
        if let Some(ref_map) = &outcome.ref_map {
            for entry in &entries {
                if let Some(value) = ref_map.get(&entry.vm.stable_id().to_string()) {
                    let key_prop = entry.vm.key_prop_name()?;
                    entry.vm.adopt_primary_key(&key_prop, json_key(value))?;
                }
            }
        }

        // The deletions went through; forget them.
        let deleted: HashSet<u32> = entries
            .iter()
            .filter(|e| matches!(e.action, BulkSaveAction::Delete))
            .map(|e| e.vm.stable_id())
            .collect();
        for entry in &entries {
            let mut vm = entry.vm.inner.vm_write();
            for children in vm.removed_children.values_mut() {
                children.retain(|c| !deleted.contains(&c.stable_id()));
            }
            vm.removed_children.retain(|_, c| !c.is_empty());
        }

        if let Some(fresh) = outcome.object {
            // Locally-added items are in the response now; purge the tail
            // copies instead of duplicating them.
            self.apply_clean_load(&fresh, true)?;
        }
        Ok(true)
    }

    /// Everything reachable from this instance through navigation
    /// properties and pending removals, classified by what the request
    /// should do with it.
    fn gather_graph(&self) -> Result<Vec<Entry>, DataError> {
        let mut visited: HashSet<u32> = HashSet::new();
        let mut queue: Vec<ViewModel> = vec![self.clone()];
        let mut entries: Vec<Entry> = Vec::new();

        while let Some(vm) = queue.pop() {
            if !visited.insert(vm.stable_id()) {
                continue;
            }
            let is_root = vm.same_instance(self);
            let removed = vm.is_removed();
            let persisted = vm.is_persisted();
            let action = if removed {
                if !persisted {
                    continue;
                }
                BulkSaveAction::Delete
            } else if vm.is_dirty() || !persisted {
                BulkSaveAction::Save
            } else if is_root {
                // The root rides along even when clean so the response
                // carries its refreshed object graph.
                BulkSaveAction::None
            } else {
                enqueue_children(&vm, &mut queue);
                continue;
            };
            enqueue_children(&vm, &mut queue);
            entries.push(Entry { vm, action, is_root });
        }
        Ok(entries)
    }
}

fn enqueue_children(vm: &ViewModel, queue: &mut Vec<ViewModel>) {
    let domain = vm.state().domain().clone();
    if let Ok(class) = domain.class(vm.type_name()) {
        for prop in &class.props {
            if prop.is_reference_navigation() {
                if let Some(child) = vm.get_object(prop.name()) {
                    queue.push(child);
                }
            } else if prop.is_collection_navigation() {
                queue.extend(vm.get_collection(prop.name()));
            }
        }
    }
    let removed: Vec<ViewModel> = vm
        .inner
        .vm_read()
        .removed_children
        .values()
        .flatten()
        .cloned()
        .collect();
    queue.extend(removed);
}

fn preflight(entries: &[Entry]) -> Result<(), ApiError> {
    let mut problems = Vec::new();
    for entry in entries {
        if !matches!(entry.action, BulkSaveAction::Save) {
            continue;
        }
        let errors = entry.vm.errors();
        if errors.is_empty() {
            continue;
        }
        let label = match crate::api::query::loose_query_string(&entry.vm.primary_key()) {
            Some(key) => key,
            None => "new".to_string(),
        };
        problems.push(format!(
            "{} {}: {}",
            entry.vm.type_name(),
            label,
            errors.join(", ")
        ));
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(ApiError::LocalValidation(format!(
            "cannot save: {}",
            problems.join("; ")
        )))
    }
}

fn build_item(entry: &Entry) -> Result<BulkSaveItem, ApiError> {
    let vm = &entry.vm;
    let domain = vm.state().domain();
    let key_prop = vm.key_prop_name()?;
    let options = MapToDtoOptions { max_depth: Some(1) };

    let data = match entry.action {
        BulkSaveAction::Delete => {
            map_to_dto_filtered(domain, &vm.inner.object, &[key_prop.clone()], &options)?
        }
        _ => match vm.save_mode() {
            SaveMode::Surgical => {
                let props = vm.surgical_props(&key_prop);
                map_to_dto_filtered(domain, &vm.inner.object, &props, &options)?
            }
            SaveMode::Whole => map_to_dto(domain, &vm.inner.object, &options)?,
        },
    };

    let mut refs: HashMap<String, u32> = HashMap::new();
    if matches!(entry.action, BulkSaveAction::Save) && !vm.is_persisted() {
        refs.insert(key_prop.clone(), vm.stable_id());
        collect_foreign_refs(vm, &mut refs)?;
    }

    Ok(BulkSaveItem {
        type_name: vm.type_name().to_string(),
        action: entry.action,
        root: entry.is_root.then_some(true),
        data,
        refs: (!refs.is_empty()).then_some(refs),
    })
}

/// Foreign keys that cannot be sent as values yet because their principal
/// has no key. The server fills them from the stable id correlation.
fn collect_foreign_refs(vm: &ViewModel, refs: &mut HashMap<String, u32>) -> Result<(), ApiError> {
    let domain = vm.state().domain().clone();
    let class = domain.class(vm.type_name())?;
    for prop in &class.props {
        let navigation = match &prop.role {
            Role::ForeignKey {
                navigation_prop, ..
            } => navigation_prop,
            _ => continue,
        };
        if !vm.get(prop.name()).is_null() {
            continue;
        }
        // Through the loaded navigation object, or through the owner of
        // the collection this item sits in.
        let principal = match navigation {
            Some(nav) => vm.get_object(nav),
            None => None,
        };
        let principal = match principal {
            Some(p) => Some(p),
            None => parent_for_foreign_key(vm, prop.name()),
        };
        if let Some(principal) = principal {
            if !principal.is_persisted() {
                refs.insert(prop.name().to_string(), principal.stable_id());
            }
        }
    }
    Ok(())
}

fn parent_for_foreign_key(vm: &ViewModel, foreign_key: &str) -> Option<ViewModel> {
    let (parent, collection) = {
        let state = vm.inner.vm_read();
        (
            state.parent.as_ref().and_then(std::sync::Weak::upgrade),
            state.parent_collection.clone(),
        )
    };
    let parent = ViewModel { inner: parent? };
    let collection = collection?;
    let domain = parent.state().domain().clone();
    let class = domain.class(parent.type_name()).ok()?;
    match &class.prop(&collection)?.role {
        Role::CollectionNavigation {
            foreign_key: fk, ..
        } if fk == foreign_key => Some(parent),
        _ => None,
    }
}

fn json_key(value: &serde_json::Value) -> FieldValue {
    match value {
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => FieldValue::Int(i),
            None => n
                .as_f64()
                .map(FieldValue::Float)
                .unwrap_or(FieldValue::Null),
        },
        serde_json::Value::String(s) => FieldValue::String(s.clone()),
        _ => FieldValue::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{client, ScriptedTransport};
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn unsaved_graph_wires_references_through_stable_ids() {
        let transport = ScriptedTransport::new();
        let state = client(transport.clone());

        let person = ViewModel::new(&state, "Person").unwrap();
        person.set("name", "Ada").unwrap();
        let company = ViewModel::new(&state, "Company").unwrap();
        company.set("companyName", "Initech").unwrap();
        person.set_object("company", Some(&company)).unwrap();

        let mut ref_map = serde_json::Map::new();
        ref_map.insert(person.stable_id().to_string(), json!(101));
        ref_map.insert(company.stable_id().to_string(), json!(7));
        transport.push_json(
            200,
            json!({
                "wasSuccessful": true,
                "refMap": ref_map,
                "object": {
                    "personId": 101, "name": "Ada", "companyId": 7,
                    "company": { "companyId": 7, "companyName": "Initech" }
                }
            }),
        );

        assert!(person.bulk_save().await.unwrap());

        // The request carried both unsaved items with their stable ids.
        let request = transport.request(0);
        assert!(request.path.ends_with("/bulkSave"), "{}", request.path);
        let body = request.body.unwrap();
        let items = body["items"].as_array().unwrap();
        assert_eq!(items.len(), 2);
        let root_item = items
            .iter()
            .find(|i| i["root"] == json!(true))
            .expect("root item present");
        assert_eq!(root_item["type"], "Person");
        assert_eq!(root_item["action"], "save");
        assert_eq!(
            root_item["refs"]["personId"],
            json!(person.stable_id())
        );
        assert_eq!(
            root_item["refs"]["companyId"],
            json!(company.stable_id())
        );

        // Real keys landed on the original instances.
        assert_eq!(person.get("personId"), FieldValue::Int(101));
        assert_eq!(company.get("companyId"), FieldValue::Int(7));
        assert!(!person.is_dirty());
    }

    #[tokio::test]
    async fn removed_persisted_children_become_deletes() {
        let transport = ScriptedTransport::new();
        let state = client(transport.clone());

        let person = ViewModel::new(&state, "Person").unwrap();
        person.set("personId", 1).unwrap();
        person.set("name", "Ada").unwrap();
        person.set("companyId", 7).unwrap();
        let pet = person.add_child("pets").unwrap();
        pet.set("petId", 10).unwrap();
        person.set_is_dirty(false);
        pet.set_is_dirty(false);
        pet.remove();

        transport.push_json(
            200,
            json!({
                "wasSuccessful": true,
                "object": { "personId": 1, "name": "Ada", "companyId": 7, "pets": [] }
            }),
        );

        assert!(person.bulk_save().await.unwrap());
        let body = transport.request(0).body.unwrap();
        let items = body["items"].as_array().unwrap();
        let delete = items
            .iter()
            .find(|i| i["action"] == "delete")
            .expect("delete item present");
        assert_eq!(delete["type"], "Pet");
        assert_eq!(delete["data"]["petId"], json!(10));

        // The pending removal was consumed.
        assert!(person.inner.vm_read().removed_children.is_empty());
    }

    #[tokio::test]
    async fn validation_problems_stop_the_request_locally() {
        let transport = ScriptedTransport::new();
        let state = client(transport.clone());
        let person = ViewModel::new(&state, "Person").unwrap();
        person.set("companyId", 7).unwrap();

        let err = person.bulk_save().await.unwrap_err();
        match err {
            ApiError::LocalValidation(msg) => {
                assert!(msg.contains("Person new"), "{}", msg);
                assert!(msg.contains("Name is required"), "{}", msg);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(transport.request_count(), 0);
    }
}
