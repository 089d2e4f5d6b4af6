//! Two-way binding between client state and a route's query string.

use crate::api::query::loose_query_string;
use crate::model::FieldValue;
use crate::viewmodel::{ListViewModel, ViewModel};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{watch, Notify};

/// The host application's router, reduced to what bindings need: read the
/// query, write a batch of changes, and observe changes.
pub trait QueryRoute: Send + Sync {
    /// Snapshot of the current query parameters.
    fn query(&self) -> BTreeMap<String, String>;

    /// Apply one batch of changes. A None value removes the key. Each
    /// call is one navigation, so a burst of edits becomes one history
    /// entry.
    fn navigate(&self, changes: BTreeMap<String, Option<String>>);

    /// Ticks whenever the query changes, including through navigate.
    fn changes(&self) -> watch::Receiver<u64>;
}

/// An in-process route for tests and headless use.
pub struct MemoryRoute {
    query: Mutex<BTreeMap<String, String>>,
    changed: watch::Sender<u64>,
    navigations: AtomicUsize,
}

impl Default for MemoryRoute {
    fn default() -> Self {
        let (changed, _) = watch::channel(0);
        MemoryRoute {
            query: Mutex::new(BTreeMap::new()),
            changed,
            navigations: AtomicUsize::new(0),
        }
    }
}

impl MemoryRoute {
    pub fn new() -> Self {
        Self::default()
    }

    /// Change the query from outside, like a user editing the URL.
    pub fn set_query_value(&self, key: &str, value: Option<&str>) {
        {
            let mut query = self.query.lock().unwrap_or_else(PoisonError::into_inner);
            match value {
                Some(v) => {
                    query.insert(key.to_string(), v.to_string());
                }
                None => {
                    query.remove(key);
                }
            }
        }
        self.changed.send_modify(|v| *v = v.wrapping_add(1));
    }

    pub fn query_value(&self, key: &str) -> Option<String> {
        self.query
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// How many navigations bindings have produced.
    pub fn navigation_count(&self) -> usize {
        self.navigations.load(Ordering::Relaxed)
    }
}

impl QueryRoute for MemoryRoute {
    fn query(&self) -> BTreeMap<String, String> {
        self.query
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn navigate(&self, changes: BTreeMap<String, Option<String>>) {
        {
            let mut query = self.query.lock().unwrap_or_else(PoisonError::into_inner);
            for (key, value) in changes {
                match value {
                    Some(v) => {
                        query.insert(key, v);
                    }
                    None => {
                        query.remove(&key);
                    }
                }
            }
        }
        self.navigations.fetch_add(1, Ordering::Relaxed);
        self.changed.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn changes(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }
}

struct Binding {
    key: String,
    read: Box<dyn Fn() -> Option<String> + Send + Sync>,
    write: Box<dyn Fn(Option<&str>) + Send + Sync>,
}

struct BinderInner {
    route: Arc<dyn QueryRoute>,
    bindings: Mutex<Vec<Arc<Binding>>>,
    pending: Mutex<BTreeMap<String, Option<String>>>,
    flush: Arc<Notify>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Drop for BinderInner {
    fn drop(&mut self) {
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}

impl BinderInner {
    fn queue(&self, key: String, value: Option<String>) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value);
        self.flush.notify_one();
    }
}

/// Keeps a set of values and the route's query string in sync, in both
/// directions. Outbound changes occurring together collapse into a single
/// navigation; inbound changes apply through the ordinary setters so
/// echoes die out on value equality. Requires a Tokio runtime.
pub struct QueryBinder {
    inner: Arc<BinderInner>,
}

impl QueryBinder {
    pub fn new(route: Arc<dyn QueryRoute>) -> QueryBinder {
        let inner = Arc::new(BinderInner {
            route: route.clone(),
            bindings: Mutex::new(Vec::new()),
            pending: Mutex::new(BTreeMap::new()),
            flush: Arc::new(Notify::new()),
            tasks: Mutex::new(Vec::new()),
        });

        let flush_task = tokio::spawn(flush_task(Arc::downgrade(&inner), inner.flush.clone()));
        let inbound_task = tokio::spawn(inbound_task(Arc::downgrade(&inner), route.changes()));
        inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([flush_task, inbound_task]);

        QueryBinder { inner }
    }

    /// Bind one key to a readable, writable value. `changes` must tick
    /// when the underlying value may have changed. At bind time an
    /// existing query value wins over the local one.
    pub fn bind(
        &self,
        key: &str,
        changes: watch::Receiver<u64>,
        read: impl Fn() -> Option<String> + Send + Sync + 'static,
        write: impl Fn(Option<&str>) + Send + Sync + 'static,
    ) {
        let binding = Arc::new(Binding {
            key: key.to_string(),
            read: Box::new(read),
            write: Box::new(write),
        });

        match self.inner.route.query().get(key) {
            Some(existing) => (binding.write)(Some(existing)),
            None => {
                if let Some(value) = (binding.read)() {
                    self.inner.queue(key.to_string(), Some(value));
                }
            }
        }

        let weak = Arc::downgrade(&self.inner);
        let outbound = binding.clone();
        let mut rx = changes;
        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let inner = match weak.upgrade() {
                    Some(inner) => inner,
                    None => break,
                };
                let value = (outbound.read)();
                let published = inner.route.query().get(&outbound.key).cloned();
                if value != published {
                    inner.queue(outbound.key.clone(), value);
                }
            }
        });

        let mut guard = self
            .inner
            .bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        guard.push(binding);
        drop(guard);
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    /// Bind one property of a view model under the given key (defaults to
    /// the property name). Inbound strings coerce through the property's
    /// declared type.
    pub fn bind_vm_prop(&self, vm: &ViewModel, prop: &str, key: Option<&str>) {
        let key = key.unwrap_or(prop);
        let prop = prop.to_string();
        let reader = vm.clone();
        let read_prop = prop.clone();
        let writer = vm.clone();
        self.bind(
            key,
            vm.subscribe(),
            move || loose_query_string(&reader.get(&read_prop)),
            move |value| {
                let field = match value {
                    Some(s) => FieldValue::String(s.to_string()),
                    None => FieldValue::Null,
                };
                if let Err(error) = writer.set(&prop, field) {
                    tracing::warn!(%error, prop = %prop, "query value rejected");
                }
            },
        );
    }

    /// Bind a list's paging and search parameters under the conventional
    /// keys: page, pageSize and search.
    pub fn bind_list_params(&self, list: &ListViewModel) {
        let source = list.clone();
        let target = list.clone();
        self.bind(
            "page",
            list.subscribe_params(),
            move || Some(source.page().to_string()),
            move |value| {
                if let Some(n) = value.and_then(|s| s.parse::<i64>().ok()) {
                    target.set_page(n);
                }
            },
        );

        let source = list.clone();
        let target = list.clone();
        self.bind(
            "pageSize",
            list.subscribe_params(),
            move || Some(source.page_size().to_string()),
            move |value| {
                if let Some(n) = value.and_then(|s| s.parse::<i64>().ok()) {
                    target.set_page_size(n);
                }
            },
        );

        let source = list.clone();
        let target = list.clone();
        self.bind(
            "search",
            list.subscribe_params(),
            move || source.params().filter.search.clone(),
            move |value| {
                let search = value.map(str::to_string);
                target.update_params(|p| p.filter.search = search);
            },
        );
    }

    /// Detach every binding and stop syncing.
    pub fn stop(&self) {
        for task in self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        self.inner
            .bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Collapse queued changes into single navigations. The short pause lets
/// every binding woken by the same burst contribute before the write.
async fn flush_task(inner: Weak<BinderInner>, flush: Arc<Notify>) {
    loop {
        flush.notified().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        let inner = match inner.upgrade() {
            Some(inner) => inner,
            None => break,
        };
        let changes = std::mem::take(
            &mut *inner
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if !changes.is_empty() {
            inner.route.navigate(changes);
        }
    }
}

async fn inbound_task(inner: Weak<BinderInner>, mut route_changes: watch::Receiver<u64>) {
    while route_changes.changed().await.is_ok() {
        let inner = match inner.upgrade() {
            Some(inner) => inner,
            None => break,
        };
        let query = inner.route.query();
        let bindings: Vec<Arc<Binding>> = inner
            .bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for binding in bindings {
            match query.get(&binding.key) {
                Some(value) => (binding.write)(Some(value)),
                None => (binding.write)(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::viewmodel::testing::{client, ScriptedTransport};
    use std::time::Duration;

    fn setup() -> (Arc<MemoryRoute>, QueryBinder, crate::state::ClientState) {
        let route = Arc::new(MemoryRoute::new());
        let binder = QueryBinder::new(route.clone());
        let state = client(ScriptedTransport::new());
        (route, binder, state)
    }

    #[tokio::test(start_paused = true)]
    async fn local_changes_flow_out_as_one_navigation() {
        let (route, binder, state) = setup();
        let person = ViewModel::new(&state, "Person").unwrap();
        binder.bind_vm_prop(&person, "name", None);
        binder.bind_vm_prop(&person, "personId", Some("id"));

        person.set("name", "Ada").unwrap();
        person.set("personId", 42).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(route.query_value("name").as_deref(), Some("Ada"));
        assert_eq!(route.query_value("id").as_deref(), Some("42"));
        assert_eq!(route.navigation_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn query_changes_flow_in_through_typed_setters() {
        let (route, binder, state) = setup();
        let person = ViewModel::new(&state, "Person").unwrap();
        binder.bind_vm_prop(&person, "personId", Some("id"));

        route.set_query_value("id", Some("7"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(person.get("personId"), FieldValue::Int(7));

        route.set_query_value("id", None);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(person.get("personId").is_null());
    }

    #[tokio::test(start_paused = true)]
    async fn existing_query_wins_at_bind_time() {
        let (route, binder, state) = setup();
        route.set_query_value("name", Some("Zoe"));
        let person = ViewModel::new(&state, "Person").unwrap();
        person.set("name", "Ada").unwrap();

        binder.bind_vm_prop(&person, "name", None);
        assert_eq!(person.get("name"), FieldValue::from("Zoe"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(route.query_value("name").as_deref(), Some("Zoe"));
    }

    #[tokio::test(start_paused = true)]
    async fn list_params_round_trip() {
        let (route, binder, state) = setup();
        let list = ListViewModel::new(&state, "Person").unwrap();
        binder.bind_list_params(&list);

        tokio::time::sleep(Duration::from_millis(20)).await;
        // Defaults published at bind time.
        assert_eq!(route.query_value("page").as_deref(), Some("1"));
        assert_eq!(route.query_value("pageSize").as_deref(), Some("10"));

        route.set_query_value("page", Some("3"));
        route.set_query_value("search", Some("ada"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(list.page(), 3);
        assert_eq!(list.params().filter.search.as_deref(), Some("ada"));

        list.set_page(5);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(route.query_value("page").as_deref(), Some("5"));
    }
}
