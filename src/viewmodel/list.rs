//! Paged collections of view models over the list and count endpoints.

use super::ViewModel;
use crate::api::query::loose_query_string;
use crate::api::{ApiClient, FilterParams, ItemCaller, ListCaller, ListParams};
use crate::error::{ApiError, DataError};
use crate::model::ModelObject;
use crate::state::ClientState;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use tokio::sync::watch;

pub(crate) struct ListInner {
    pub(crate) state: ClientState,
    pub(crate) type_name: String,
    pub(crate) api: ApiClient,
    pub(crate) params: RwLock<ListParams>,
    pub(crate) items: RwLock<Vec<ViewModel>>,
    load_caller: OnceLock<ListCaller<ListParams, ModelObject>>,
    count_caller: OnceLock<ItemCaller<FilterParams, i64>>,
    pub(crate) changed: watch::Sender<u64>,
    /// Ticks only on parameter changes, so auto load is not retriggered
    /// by the loads it performs.
    pub(crate) params_changed: watch::Sender<u64>,
    pub(crate) auto_load: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Drop for ListInner {
    fn drop(&mut self) {
        if let Some(task) = self
            .auto_load
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

impl ListInner {
    pub(crate) fn bump(&self) {
        self.changed.send_modify(|v| *v = v.wrapping_add(1));
    }
}

/// A pageable, filterable collection of one model type. Loads reuse the
/// view models of items that are still present, so UI state attached to
/// them survives a refresh.
#[derive(Clone)]
pub struct ListViewModel {
    pub(crate) inner: Arc<ListInner>,
}

impl ListViewModel {
    pub fn new(state: &ClientState, type_name: &str) -> Result<ListViewModel, DataError> {
        let api = ApiClient::new(state, type_name)?;
        let (changed, _) = watch::channel(0);
        let (params_changed, _) = watch::channel(0);
        Ok(ListViewModel {
            inner: Arc::new(ListInner {
                state: state.clone(),
                type_name: type_name.to_string(),
                api,
                params: RwLock::new(ListParams::default()),
                items: RwLock::new(Vec::new()),
                load_caller: OnceLock::new(),
                count_caller: OnceLock::new(),
                changed,
                params_changed,
                auto_load: Mutex::new(None),
            }),
        })
    }

    pub fn type_name(&self) -> &str {
        &self.inner.type_name
    }

    pub fn state(&self) -> &ClientState {
        &self.inner.state
    }

    pub fn api(&self) -> &ApiClient {
        &self.inner.api
    }

    /// Ticks when the parameters or the loaded items change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.changed.subscribe()
    }

    /// Ticks on parameter changes only.
    pub fn subscribe_params(&self) -> watch::Receiver<u64> {
        self.inner.params_changed.subscribe()
    }

    pub fn items(&self) -> Vec<ViewModel> {
        self.inner
            .items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn params(&self) -> ListParams {
        self.inner
            .params
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_params(&self, params: ListParams) {
        let changed = {
            let mut current = self
                .inner
                .params
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if *current == params {
                false
            } else {
                *current = params;
                true
            }
        };
        if changed {
            self.inner.bump();
            self.inner
                .params_changed
                .send_modify(|v| *v = v.wrapping_add(1));
        }
    }

    /// Adjust the parameters in place. No tick when nothing changed.
    pub fn update_params(&self, f: impl FnOnce(&mut ListParams)) {
        let mut params = self.params();
        f(&mut params);
        self.set_params(params);
    }

    pub fn loader(&self) -> &ListCaller<ListParams, ModelObject> {
        self.inner
            .load_caller
            .get_or_init(|| self.inner.api.list_caller())
    }

    pub fn counter(&self) -> &ItemCaller<FilterParams, i64> {
        self.inner
            .count_caller
            .get_or_init(|| self.inner.api.count_caller())
    }

    /// Fetch the current page. Returns true when results were applied.
    pub async fn load(&self) -> Result<bool, ApiError> {
        let params = self.params();
        let outcome = self.loader().invoke(params).await?;
        match outcome {
            Some(list) => {
                self.reconcile(list.items)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Fetch the total count for the current filters, without items.
    pub async fn count(&self) -> Result<Option<i64>, ApiError> {
        let filter = self.params().filter;
        let outcome = self.counter().invoke(filter).await?;
        Ok(outcome.and_then(|o| o.object))
    }

    fn reconcile(&self, incoming: Vec<ModelObject>) -> Result<(), ApiError> {
        let key_prop = {
            let domain = self.inner.state.domain();
            let class = domain.model(&self.inner.type_name)?;
            class
                .model
                .as_ref()
                .map(|m| m.key_prop.clone())
                .unwrap_or_default()
        };
        let mut existing: HashMap<String, ViewModel> = HashMap::new();
        for vm in self.items() {
            if let Some(key) = loose_query_string(&vm.get(&key_prop)) {
                existing.insert(key, vm);
            }
        }
        let mut fresh = Vec::with_capacity(incoming.len());
        for obj in incoming {
            let key = loose_query_string(&obj.get(&key_prop));
            match key.and_then(|k| existing.remove(&k)) {
                Some(vm) => {
                    if !vm.object().same_instance(&obj) {
                        vm.apply_clean_load(&obj, false)?;
                    }
                    fresh.push(vm);
                }
                None => fresh.push(ViewModel::for_object(&self.inner.state, obj)?),
            }
        }
        tracing::debug!(model = %self.inner.type_name, items = fresh.len(), "list reconciled");
        *self
            .inner
            .items
            .write()
            .unwrap_or_else(PoisonError::into_inner) = fresh;
        self.inner.bump();
        Ok(())
    }

    // ----- paging -----

    pub fn page(&self) -> i64 {
        self.params().page.unwrap_or(1)
    }

    pub fn page_size(&self) -> i64 {
        self.params().page_size.unwrap_or(10)
    }

    pub fn set_page(&self, page: i64) {
        self.update_params(|p| p.page = Some(page.max(1)));
    }

    pub fn set_page_size(&self, size: i64) {
        self.update_params(|p| p.page_size = Some(size.max(1)));
    }

    /// Page count from the last load. None before any load; a server that
    /// skipped counting reports -1.
    pub fn page_count(&self) -> Option<i64> {
        self.loader().page_count()
    }

    pub fn total_count(&self) -> Option<i64> {
        self.loader().total_count()
    }

    pub fn has_previous_page(&self) -> bool {
        self.page() > 1
    }

    /// Whether another page may exist. Unknown counts stay permissive so
    /// paging is never artificially capped.
    pub fn has_next_page(&self) -> bool {
        match self.page_count() {
            Some(count) if count >= 0 => self.page() < count,
            _ => true,
        }
    }

    pub fn next_page(&self) {
        if self.has_next_page() {
            self.update_params(|p| p.page = Some(p.page.unwrap_or(1) + 1));
        }
    }

    pub fn previous_page(&self) {
        if self.has_previous_page() {
            self.update_params(|p| p.page = Some((p.page.unwrap_or(1) - 1).max(1)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{client, ScriptedTransport};
    use super::*;
    use crate::model::FieldValue;
    use serde_json::json;

    #[tokio::test]
    async fn load_reuses_view_models_for_surviving_items() {
        let transport = ScriptedTransport::new();
        let state = client(transport.clone());
        let list = ListViewModel::new(&state, "Person").unwrap();

        transport.push_json(
            200,
            json!({
                "wasSuccessful": true,
                "list": [
                    { "personId": 1, "name": "Ada", "companyId": 7 },
                    { "personId": 2, "name": "Bob", "companyId": 7 }
                ],
                "page": 1, "pageSize": 10, "pageCount": 1, "totalCount": 2
            }),
        );
        assert!(list.load().await.unwrap());
        let first = list.items();
        assert_eq!(first.len(), 2);

        transport.push_json(
            200,
            json!({
                "wasSuccessful": true,
                "list": [
                    { "personId": 2, "name": "Bobby", "companyId": 7 },
                    { "personId": 3, "name": "Cleo", "companyId": 7 }
                ],
                "page": 1, "pageSize": 10, "pageCount": 1, "totalCount": 2
            }),
        );
        assert!(list.load().await.unwrap());
        let second = list.items();
        assert_eq!(second.len(), 2);

        // Bob survived the refresh as the same instance with new data.
        assert!(second[0].same_instance(&first[1]));
        assert_eq!(second[0].get("name"), FieldValue::from("Bobby"));
        assert_eq!(second[1].get("personId"), FieldValue::Int(3));

        let uri = transport.request(0).uri();
        assert!(uri.starts_with("/api/Person/list?"), "{}", uri);
        assert!(uri.contains("page=1"), "{}", uri);
    }

    #[tokio::test]
    async fn paging_respects_known_and_unknown_counts() {
        let transport = ScriptedTransport::new();
        let state = client(transport.clone());
        let list = ListViewModel::new(&state, "Person").unwrap();

        // Nothing loaded yet: permissive.
        assert!(list.has_next_page());
        assert!(!list.has_previous_page());

        transport.push_json(
            200,
            json!({
                "wasSuccessful": true,
                "list": [],
                "page": 1, "pageSize": 10, "pageCount": 3, "totalCount": 25
            }),
        );
        list.load().await.unwrap();
        assert!(list.has_next_page());
        list.next_page();
        assert_eq!(list.page(), 2);
        list.previous_page();
        list.previous_page();
        assert_eq!(list.page(), 1);

        // An uncounted response keeps paging open.
        transport.push_json(
            200,
            json!({
                "wasSuccessful": true,
                "list": [],
                "page": 3, "pageSize": 10, "pageCount": -1, "totalCount": -1
            }),
        );
        list.load().await.unwrap();
        assert!(list.has_next_page());
    }

    #[tokio::test]
    async fn count_returns_the_total_without_items() {
        let transport = ScriptedTransport::new();
        let state = client(transport.clone());
        let list = ListViewModel::new(&state, "Person").unwrap();
        list.update_params(|p| {
            p.filter.search = Some("ada".into());
        });

        transport.push_json(200, json!({ "wasSuccessful": true, "object": 12 }));
        let total = list.count().await.unwrap();
        assert_eq!(total, Some(12));
        let uri = transport.request(0).uri();
        assert!(uri.starts_with("/api/Person/count?"), "{}", uri);
        assert!(uri.contains("search=ada"), "{}", uri);
    }
}
