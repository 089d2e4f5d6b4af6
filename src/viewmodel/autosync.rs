//! Background synchronization: debounced auto save for view models and
//! parameter-driven auto load for lists.

use super::list::{ListInner, ListViewModel};
use super::{ViewModel, VmInner};
use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;

/// How an enrolled view model keeps itself saved.
#[derive(Clone)]
pub struct AutoSaveOptions {
    /// Quiet period after the last change before a save fires.
    pub wait: Duration,
    /// Enroll navigation children too, including ones attached later.
    pub deep: bool,
    /// When present, saves only run while this returns true.
    pub predicate: Option<Arc<dyn Fn(&ViewModel) -> bool + Send + Sync>>,
}

impl Default for AutoSaveOptions {
    fn default() -> Self {
        AutoSaveOptions {
            wait: Duration::from_secs(1),
            deep: false,
            predicate: None,
        }
    }
}

pub(crate) struct AutoSaveHandle {
    pub(crate) options: AutoSaveOptions,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for AutoSaveHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl ViewModel {
    /// Keep this instance saved: after every change settles for the
    /// configured quiet period, a save fires if the instance is dirty and
    /// valid. Failed saves wait for the next change instead of retrying
    /// in a loop. Requires a Tokio runtime.
    pub fn start_auto_save(&self, options: AutoSaveOptions) {
        self.stop_auto_save();
        let task = tokio::spawn(auto_save_task(
            Arc::downgrade(&self.inner),
            self.subscribe(),
            options.clone(),
        ));
        self.inner.vm_write().auto_save = Some(AutoSaveHandle {
            options: options.clone(),
            task,
        });
        if options.deep {
            enroll_children(self, &options);
        }
    }

    /// Stop auto saving this instance. Children enrolled through a deep
    /// start keep their own enrollment.
    pub fn stop_auto_save(&self) {
        self.inner.vm_write().auto_save.take();
    }

    pub fn is_auto_save_enabled(&self) -> bool {
        self.inner.vm_read().auto_save.is_some()
    }
}

async fn auto_save_task(
    inner: Weak<VmInner>,
    mut changes: watch::Receiver<u64>,
    options: AutoSaveOptions,
) {
    loop {
        tokio::time::sleep(options.wait).await;
        changes.borrow_and_update();
        match inner.upgrade() {
            None => break,
            Some(strong) => {
                let vm = ViewModel { inner: strong };
                if vm.is_removed() {
                    break;
                }
                if options.deep {
                    enroll_children(&vm, &options);
                }
                let allowed = options.predicate.as_ref().map_or(true, |p| p(&vm));
                if vm.is_dirty() && allowed && !vm.has_error() {
                    // Let an explicit save or load settle first.
                    while vm.saver().is_loading() || vm.loader().is_loading() {
                        tokio::time::sleep(options.wait).await;
                    }
                    tracing::debug!(model = vm.type_name(), "auto saving");
                    if let Err(error) = vm.save().await {
                        tracing::warn!(%error, model = vm.type_name(), "auto save failed");
                    }
                }
            }
        }
        if changes.changed().await.is_err() {
            break;
        }
    }
}

/// Enroll navigation children that are not enrolled yet. Newly attached
/// children get picked up on the owner's next change tick.
fn enroll_children(vm: &ViewModel, options: &AutoSaveOptions) {
    let domain = vm.state().domain().clone();
    let class = match domain.class(vm.type_name()) {
        Ok(c) => c,
        Err(_) => return,
    };
    let mut children = Vec::new();
    for prop in &class.props {
        if prop.is_reference_navigation() {
            children.extend(vm.get_object(prop.name()));
        } else if prop.is_collection_navigation() {
            children.extend(vm.get_collection(prop.name()));
        }
    }
    for child in children {
        if !child.is_auto_save_enabled() {
            child.start_auto_save(options.clone());
        }
    }
}

impl ListViewModel {
    /// Reload shortly after every parameter change, coalescing bursts.
    /// Requires a Tokio runtime.
    pub fn start_auto_load(&self, wait: Duration) {
        self.stop_auto_load();
        let task = tokio::spawn(auto_load_task(
            Arc::downgrade(&self.inner),
            self.subscribe_params(),
            wait,
        ));
        *self
            .inner
            .auto_load
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    pub fn stop_auto_load(&self) {
        if let Some(task) = self
            .inner
            .auto_load
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

async fn auto_load_task(inner: Weak<ListInner>, mut params: watch::Receiver<u64>, wait: Duration) {
    loop {
        if params.changed().await.is_err() {
            break;
        }
        tokio::time::sleep(wait).await;
        params.borrow_and_update();
        let list = match inner.upgrade() {
            Some(strong) => ListViewModel { inner: strong },
            None => break,
        };
        while list.loader().is_loading() {
            tokio::time::sleep(wait).await;
        }
        if let Err(error) = list.load().await {
            tracing::warn!(%error, model = list.type_name(), "auto load failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{client, ScriptedTransport};
    use super::*;
    use crate::model::FieldValue;
    use serde_json::json;

    fn save_response(id: i64) -> serde_json::Value {
        json!({
            "wasSuccessful": true,
            "object": { "personId": id, "name": "Ada", "companyId": 7 }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn edits_coalesce_into_one_save() {
        let transport = ScriptedTransport::new();
        let state = client(transport.clone());
        let person = ViewModel::new(&state, "Person").unwrap();
        person.start_auto_save(AutoSaveOptions {
            wait: Duration::from_millis(50),
            ..AutoSaveOptions::default()
        });

        transport.push_json(200, save_response(101));
        person.set("name", "A").unwrap();
        person.set("name", "Ad").unwrap();
        person.set("name", "Ada").unwrap();
        person.set("companyId", 7).unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(transport.request_count(), 1);
        assert!(!person.is_dirty());
        assert_eq!(person.get("personId"), FieldValue::Int(101));

        // Nothing new to save: quiet.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_or_excluded_instances_do_not_save() {
        let transport = ScriptedTransport::new();
        let state = client(transport.clone());

        // Missing required fields: no request.
        let person = ViewModel::new(&state, "Person").unwrap();
        person.start_auto_save(AutoSaveOptions {
            wait: Duration::from_millis(10),
            ..AutoSaveOptions::default()
        });
        person.set("personId", 1).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.request_count(), 0);

        // A false predicate holds an otherwise valid save.
        person.set("name", "Ada").unwrap();
        person.set("companyId", 7).unwrap();
        person.start_auto_save(AutoSaveOptions {
            wait: Duration::from_millis(10),
            predicate: Some(Arc::new(|_| false)),
            ..AutoSaveOptions::default()
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deep_enrollment_saves_attached_children() {
        let transport = ScriptedTransport::new();
        let state = client(transport.clone());
        let person = ViewModel::new(&state, "Person").unwrap();
        person.set("personId", 1).unwrap();
        person.set("name", "Ada").unwrap();
        person.set("companyId", 7).unwrap();
        person.set_is_dirty(false);

        person.start_auto_save(AutoSaveOptions {
            wait: Duration::from_millis(10),
            deep: true,
            ..AutoSaveOptions::default()
        });

        let pet = person.add_child("pets").unwrap();
        pet.set("name", "Rex").unwrap();
        transport.push_json(
            200,
            json!({
                "wasSuccessful": true,
                "object": { "petId": 5, "name": "Rex", "ownerId": 1 }
            }),
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(pet.is_auto_save_enabled());
        assert_eq!(transport.request_count(), 1);
        let request = transport.request(0);
        assert!(request.path.ends_with("/Pet/save"), "{}", request.path);
        assert_eq!(pet.get("petId"), FieldValue::Int(5));
    }

    #[tokio::test(start_paused = true)]
    async fn parameter_changes_reload_the_list_once() {
        let transport = ScriptedTransport::new();
        let state = client(transport.clone());
        let list = ListViewModel::new(&state, "Person").unwrap();
        list.start_auto_load(Duration::from_millis(20));

        transport.push_json(
            200,
            json!({
                "wasSuccessful": true, "list": [],
                "page": 1, "pageSize": 10, "pageCount": 0, "totalCount": 0
            }),
        );
        list.update_params(|p| p.filter.search = Some("a".into()));
        list.update_params(|p| p.filter.search = Some("ad".into()));
        list.update_params(|p| p.filter.search = Some("ada".into()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.request_count(), 1);
        let uri = transport.request(0).uri();
        assert!(uri.contains("search=ada"), "{}", uri);

        // The load itself does not retrigger a load.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.request_count(), 1);
    }
}
