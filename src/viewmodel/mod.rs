//! Reactive wrappers around model instances: role-aware setters, dirty
//! tracking, validation, and the standard CRUD call surface.

pub mod autosync;
pub mod bulk;
pub mod list;
pub mod rules;

pub use autosync::AutoSaveOptions;
pub use list::ListViewModel;
pub use rules::Rule;

use self::rules::RuleOverrides;
use crate::api::query::loose_query_string;
use crate::api::{
    ApiClient, BulkSaveArgs, DataSourceParams, DeleteArgs, GetArgs, ItemCaller, SaveArgs,
};
use crate::error::{ApiError, DataError};
use crate::metadata::{Behaviors, Property, Role, ValueKind};
use crate::model::convert::{
    convert_in_place, map_to_dto, map_to_dto_filtered, parse_value, MapToDtoOptions,
};
use crate::model::display::{self, DisplayOptions};
use crate::model::{FieldValue, ModelObject};
use crate::state::ClientState;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{
    Arc, Mutex, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use tokio::sync::watch;

/// Identity map from model instance to its view model. One instance never
/// gets two wrappers, so edits made through either are the same edits.
#[derive(Default)]
pub(crate) struct ViewModelRegistry {
    entries: Mutex<HashMap<usize, Weak<VmInner>>>,
}

impl ViewModelRegistry {
    fn get_or_insert(&self, key: usize, make: impl FnOnce() -> Arc<VmInner>) -> Arc<VmInner> {
        let mut map = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(found) = map.get(&key).and_then(Weak::upgrade) {
            return found;
        }
        map.retain(|_, w| w.strong_count() > 0);
        let made = make();
        map.insert(key, Arc::downgrade(&made));
        made
    }
}

static NEXT_STABLE_ID: AtomicU32 = AtomicU32::new(1);

/// Which properties a save sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaveMode {
    /// Dirty properties plus the primary key.
    #[default]
    Surgical,
    /// Every serializable property.
    Whole,
}

pub(crate) struct VmState {
    pub(crate) dirty: HashSet<String>,
    pub(crate) removed: bool,
    /// Persisted children pulled out of a collection, pending bulk delete.
    /// Keyed by the collection property they were removed from.
    pub(crate) removed_children: HashMap<String, Vec<ViewModel>>,
    pub(crate) parent: Option<Weak<VmInner>>,
    pub(crate) parent_collection: Option<String>,
    pub(crate) rules: RuleOverrides,
    pub(crate) save_mode: SaveMode,
    pub(crate) extra_save_props: Vec<String>,
    pub(crate) load_response_from_saves: bool,
    pub(crate) params: DataSourceParams,
    pub(crate) auto_save: Option<autosync::AutoSaveHandle>,
}

pub(crate) struct VmInner {
    pub(crate) state: ClientState,
    pub(crate) type_name: String,
    pub(crate) stable_id: u32,
    pub(crate) object: ModelObject,
    pub(crate) api: ApiClient,
    pub(crate) vm: RwLock<VmState>,
    load_caller: OnceLock<ItemCaller<GetArgs, ModelObject>>,
    save_caller: OnceLock<ItemCaller<SaveArgs, ModelObject>>,
    delete_caller: OnceLock<ItemCaller<DeleteArgs, ModelObject>>,
    bulk_caller: OnceLock<ItemCaller<BulkSaveArgs, ModelObject>>,
    pub(crate) changed: watch::Sender<u64>,
}

impl VmInner {
    pub(crate) fn vm_read(&self) -> RwLockReadGuard<'_, VmState> {
        self.vm.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn vm_write(&self) -> RwLockWriteGuard<'_, VmState> {
        self.vm.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn bump(&self) {
        self.changed.send_modify(|v| *v = v.wrapping_add(1));
    }
}

/// A stateful handle to one model instance. Cheap to clone; clones share
/// the instance, its dirty state, and its callers.
#[derive(Clone)]
pub struct ViewModel {
    pub(crate) inner: Arc<VmInner>,
}

impl fmt::Debug for ViewModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ViewModel<{} #{}>", self.inner.type_name, self.inner.stable_id)
    }
}

impl ViewModel {
    /// A view model over a fresh, unsaved instance.
    pub fn new(state: &ClientState, type_name: &str) -> Result<ViewModel, DataError> {
        let object = ModelObject::new(type_name);
        object.mark_converted();
        ViewModel::for_object(state, object)
    }

    /// The view model for an existing instance. Returns the same wrapper
    /// for the same instance across calls. Converts raw field values.
    pub fn for_object(state: &ClientState, object: ModelObject) -> Result<ViewModel, DataError> {
        let type_name = object.type_name();
        let api = ApiClient::new(state, &type_name)?;
        convert_in_place(state.domain(), &object)?;
        let key = object.ptr_id();
        let state_clone = state.clone();
        let inner = state.vm_registry().get_or_insert(key, move || {
            let (changed, _) = watch::channel(0);
            Arc::new(VmInner {
                state: state_clone,
                type_name,
                stable_id: NEXT_STABLE_ID.fetch_add(1, Ordering::Relaxed),
                object,
                api,
                vm: RwLock::new(VmState {
                    dirty: HashSet::new(),
                    removed: false,
                    removed_children: HashMap::new(),
                    parent: None,
                    parent_collection: None,
                    rules: RuleOverrides::default(),
                    save_mode: SaveMode::default(),
                    extra_save_props: Vec::new(),
                    load_response_from_saves: true,
                    params: DataSourceParams::default(),
                    auto_save: None,
                }),
                load_caller: OnceLock::new(),
                save_caller: OnceLock::new(),
                delete_caller: OnceLock::new(),
                bulk_caller: OnceLock::new(),
                changed,
            })
        });
        Ok(ViewModel { inner })
    }

    pub fn type_name(&self) -> &str {
        &self.inner.type_name
    }

    /// Process-unique id that survives the instance gaining a real primary
    /// key. Bulk save uses it to correlate request items with responses.
    pub fn stable_id(&self) -> u32 {
        self.inner.stable_id
    }

    pub fn object(&self) -> ModelObject {
        self.inner.object.clone()
    }

    pub fn api(&self) -> &ApiClient {
        &self.inner.api
    }

    pub fn state(&self) -> &ClientState {
        &self.inner.state
    }

    pub fn same_instance(&self, other: &ViewModel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Ticks on every observable change: field writes, dirty transitions,
    /// loads, removals.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.changed.subscribe()
    }

    pub fn primary_key(&self) -> FieldValue {
        match self.key_prop_name() {
            Ok(key) => self.inner.object.get(&key),
            Err(_) => FieldValue::Null,
        }
    }

    pub fn is_persisted(&self) -> bool {
        !self.primary_key().is_null()
    }

    pub fn is_removed(&self) -> bool {
        self.inner.vm_read().removed
    }

    pub fn display(&self) -> Option<String> {
        display::model_display(
            self.inner.state.domain(),
            &self.inner.object,
            &DisplayOptions::default(),
        )
    }

    pub fn prop_display(&self, prop: &str) -> Option<String> {
        display::prop_display(
            self.inner.state.domain(),
            &self.inner.object,
            prop,
            &DisplayOptions::default(),
        )
    }

    // ----- dirty tracking -----

    pub fn is_dirty(&self) -> bool {
        !self.inner.vm_read().dirty.is_empty()
    }

    pub fn dirty_props(&self) -> Vec<String> {
        let mut props: Vec<String> = self.inner.vm_read().dirty.iter().cloned().collect();
        props.sort();
        props
    }

    /// Props a surgical save sends: everything dirty, the configured
    /// always-send props, and the primary key.
    pub(crate) fn surgical_props(&self, key_prop: &str) -> Vec<String> {
        let mut props = self.dirty_props();
        let extras = self.inner.vm_read().extra_save_props.clone();
        for extra in extras {
            if !props.contains(&extra) {
                props.push(extra);
            }
        }
        if !props.iter().any(|p| p == key_prop) {
            props.push(key_prop.to_string());
        }
        props
    }

    /// Force the dirty state. True marks every data property; false clears.
    pub fn set_is_dirty(&self, dirty: bool) {
        {
            let mut vm = self.inner.vm_write();
            if dirty {
                if let Ok(class) = self.inner.state.domain().class(&self.inner.type_name) {
                    for prop in &class.props {
                        if !prop.is_reference_navigation() && !prop.is_collection_navigation() {
                            vm.dirty.insert(prop.name().to_string());
                        }
                    }
                }
            } else {
                vm.dirty.clear();
            }
        }
        self.inner.bump();
    }

    // ----- getters and role-aware setters -----

    /// Raw field value. Unknown or unset properties read as null.
    pub fn get(&self, prop: &str) -> FieldValue {
        self.inner.object.get(prop)
    }

    /// The wrapped navigation object, when set.
    pub fn get_object(&self, prop: &str) -> Option<ViewModel> {
        let value = self.inner.object.get(prop);
        let obj = value.as_object()?;
        ViewModel::for_object(&self.inner.state, obj).ok()
    }

    /// Wrapped items of a collection navigation. Empty when unset.
    pub fn get_collection(&self, prop: &str) -> Vec<ViewModel> {
        let value = self.inner.object.get(prop);
        let items = match value.as_list() {
            Some(items) => items,
            None => return Vec::new(),
        };
        items
            .iter()
            .filter_map(|v| v.as_object())
            .filter_map(|o| ViewModel::for_object(&self.inner.state, o).ok())
            .collect()
    }

    /// Assign a property. The write is role-aware: values coerce through
    /// the declared type, foreign keys and reference navigations keep each
    /// other consistent, and collection items adopt this instance as their
    /// parent.
    pub fn set(&self, prop: &str, value: impl Into<FieldValue>) -> Result<(), DataError> {
        let value = value.into();
        let prop = {
            let domain = self.inner.state.domain();
            domain.class(&self.inner.type_name)?.expect_prop(prop)?.clone()
        };
        match prop.role.clone() {
            Role::ReferenceNavigation {
                foreign_key,
                principal_key,
            } => self.set_reference(&prop, &foreign_key, &principal_key, value),
            Role::CollectionNavigation { foreign_key, .. } => {
                self.set_collection_items(&prop, &foreign_key, value)
            }
            Role::ForeignKey {
                principal_key,
                navigation_prop,
                ..
            } => self.set_foreign_key(&prop, &principal_key, navigation_prop.as_deref(), value),
            _ => self.set_value(&prop, value),
        }
    }

    /// Assign a reference navigation from another view model.
    pub fn set_object(&self, prop: &str, child: Option<&ViewModel>) -> Result<(), DataError> {
        let value = match child {
            Some(vm) => FieldValue::Object(vm.inner.object.clone()),
            None => FieldValue::Null,
        };
        self.set(prop, value)
    }

    /// Create a fresh item in a collection navigation, wired back to this
    /// instance.
    pub fn add_child(&self, prop: &str) -> Result<ViewModel, DataError> {
        let p = {
            let domain = self.inner.state.domain();
            domain.class(&self.inner.type_name)?.expect_prop(prop)?.clone()
        };
        let (foreign_key, item_type) = match (&p.role, collection_item_type(&p)) {
            (Role::CollectionNavigation { foreign_key, .. }, Some(item_type)) => {
                (foreign_key.clone(), item_type)
            }
            _ => {
                return Err(DataError::TypeMismatch {
                    expected: "collection navigation".into(),
                    actual: p.name().to_string(),
                })
            }
        };
        let child = ViewModel::new(&self.inner.state, &item_type)?;
        self.adopt_into_collection(&child, p.name(), &foreign_key, &self.primary_key());
        let current = self.inner.object.get(p.name());
        let mut items = current.as_list().map(|s| s.to_vec()).unwrap_or_default();
        items.push(FieldValue::Object(child.inner.object.clone()));
        self.inner.object.set(p.name(), FieldValue::List(items));
        self.inner.bump();
        Ok(child)
    }

    /// Detach this instance from its parent collection. Persisted items
    /// are remembered for deletion by the next bulk save; unsaved ones
    /// just vanish.
    pub fn remove(&self) {
        self.detach_from_parent(self.is_persisted());
    }

    fn set_value(&self, prop: &Property, value: FieldValue) -> Result<(), DataError> {
        let parsed = parse_value(self.inner.state.domain(), &prop.value, value)?;
        self.write_field(prop.name(), parsed);
        Ok(())
    }

    fn set_foreign_key(
        &self,
        prop: &Property,
        principal_key: &str,
        navigation: Option<&str>,
        value: FieldValue,
    ) -> Result<(), DataError> {
        let parsed = parse_value(self.inner.state.domain(), &prop.value, value)?;
        if let Some(nav) = navigation {
            let current_nav = self.inner.object.get(nav);
            if let Some(nav_obj) = current_nav.as_object() {
                if parsed.is_null() {
                    // The loaded navigation object still implies this key.
                    return Ok(());
                }
                if nav_obj.get(principal_key) != parsed {
                    self.inner.object.set(nav, FieldValue::Null);
                    self.inner.bump();
                }
            }
        }
        self.write_field(prop.name(), parsed);
        Ok(())
    }

    fn set_reference(
        &self,
        prop: &Property,
        foreign_key: &str,
        principal_key: &str,
        value: FieldValue,
    ) -> Result<(), DataError> {
        if value.is_null() {
            // Clearing a navigation leaves the foreign key in place.
            let current = self.inner.object.get(prop.name());
            if !current.is_null() || !self.inner.object.has(prop.name()) {
                self.inner.object.set(prop.name(), FieldValue::Null);
                self.inner.bump();
            }
            return Ok(());
        }
        let obj = match value {
            FieldValue::Object(o) => o,
            FieldValue::WeakObject(w) => match w.upgrade() {
                Some(o) => o,
                None => return Ok(()),
            },
            other => {
                return Err(DataError::TypeMismatch {
                    expected: prop.value.kind.type_name().unwrap_or("model").to_string(),
                    actual: format!("{:?}", other),
                })
            }
        };
        if let Some(expected) = prop.value.kind.type_name() {
            if obj.type_name() != expected {
                return Err(DataError::TypeMismatch {
                    expected: expected.to_string(),
                    actual: obj.type_name(),
                });
            }
        }
        let child = ViewModel::for_object(&self.inner.state, obj.clone())?;
        {
            let mut child_state = child.inner.vm_write();
            let orphan = child_state
                .parent
                .as_ref()
                .and_then(Weak::upgrade)
                .is_none();
            if orphan && !Arc::ptr_eq(&child.inner, &self.inner) {
                child_state.parent = Some(Arc::downgrade(&self.inner));
                child_state.parent_collection = None;
            }
        }
        // Hold ancestors weakly so the graph can drop.
        let stored = if self.has_ancestor(&obj) {
            FieldValue::WeakObject(obj.downgrade())
        } else {
            FieldValue::Object(obj.clone())
        };
        let current = self.inner.object.get(prop.name());
        if !(self.inner.object.has(prop.name()) && current == stored) {
            self.inner.object.set(prop.name(), stored);
            self.inner.bump();
        }
        // The foreign key follows the referenced key, even to null.
        self.write_field(foreign_key, obj.get(principal_key));
        Ok(())
    }

    fn set_collection_items(
        &self,
        prop: &Property,
        foreign_key: &str,
        value: FieldValue,
    ) -> Result<(), DataError> {
        let item_type = collection_item_type(prop).ok_or_else(|| DataError::TypeMismatch {
            expected: "model collection".into(),
            actual: prop.name().to_string(),
        })?;
        let incoming = match value {
            FieldValue::Null => Vec::new(),
            FieldValue::List(items) => items,
            other => {
                return Err(DataError::TypeMismatch {
                    expected: "list".into(),
                    actual: format!("{:?}", other),
                })
            }
        };
        let owner_key = self.primary_key();
        let mut stored = Vec::with_capacity(incoming.len());
        for item in incoming {
            let obj = item.as_object().ok_or_else(|| DataError::TypeMismatch {
                expected: item_type.clone(),
                actual: "non-object item".into(),
            })?;
            if obj.type_name() != item_type {
                return Err(DataError::TypeMismatch {
                    expected: item_type.clone(),
                    actual: obj.type_name(),
                });
            }
            let child = ViewModel::for_object(&self.inner.state, obj.clone())?;
            self.adopt_into_collection(&child, prop.name(), foreign_key, &owner_key);
            stored.push(FieldValue::Object(obj));
        }
        self.inner.object.set(prop.name(), FieldValue::List(stored));
        self.inner.bump();
        Ok(())
    }

    /// Write one field, marking it dirty when the value actually changed.
    fn write_field(&self, name: &str, value: FieldValue) {
        let object = &self.inner.object;
        if object.has(name) && object.get(name) == value {
            return;
        }
        object.set(name, value);
        self.inner.vm_write().dirty.insert(name.to_string());
        self.inner.bump();
    }

    fn adopt_into_collection(
        &self,
        child: &ViewModel,
        prop: &str,
        foreign_key: &str,
        owner_key: &FieldValue,
    ) {
        {
            let mut child_state = child.inner.vm_write();
            child_state.parent = Some(Arc::downgrade(&self.inner));
            child_state.parent_collection = Some(prop.to_string());
        }
        if !owner_key.is_null() && child.inner.object.get(foreign_key).is_null() {
            child.write_field(foreign_key, owner_key.clone());
        }
    }

    fn has_ancestor(&self, candidate: &ModelObject) -> bool {
        if candidate.same_instance(&self.inner.object) {
            return true;
        }
        let mut cursor = self.inner.vm_read().parent.clone();
        while let Some(weak) = cursor {
            match weak.upgrade() {
                Some(ancestor) => {
                    if candidate.same_instance(&ancestor.object) {
                        return true;
                    }
                    cursor = ancestor.vm_read().parent.clone();
                }
                None => break,
            }
        }
        false
    }

    fn detach_from_parent(&self, track_removed: bool) {
        let (parent, prop) = {
            let vm = self.inner.vm_read();
            (
                vm.parent.as_ref().and_then(Weak::upgrade),
                vm.parent_collection.clone(),
            )
        };
        if let (Some(parent), Some(prop)) = (parent, prop) {
            let current = parent.object.get(&prop);
            if let Some(items) = current.as_list() {
                let remaining: Vec<FieldValue> = items
                    .iter()
                    .filter(|v| {
                        v.as_object()
                            .map_or(true, |o| !o.same_instance(&self.inner.object))
                    })
                    .cloned()
                    .collect();
                parent.object.set(&prop, FieldValue::List(remaining));
            }
            if track_removed {
                parent
                    .vm_write()
                    .removed_children
                    .entry(prop)
                    .or_default()
                    .push(self.clone());
            }
            parent.bump();
        }
        self.inner.vm_write().removed = true;
        self.inner.bump();
    }

    // ----- validation -----

    /// Replace or add one rule under an identifier. Standard identifiers
    /// are required, minLength, maxLength, pattern, min and max.
    pub fn add_rule(&self, prop: &str, identifier: &str, rule: Rule) {
        self.inner.vm_write().rules.add(prop, identifier, rule);
        self.inner.bump();
    }

    /// Suppress a declared rule by identifier.
    pub fn remove_rule(&self, prop: &str, identifier: &str) {
        self.inner.vm_write().rules.remove(prop, identifier);
        self.inner.bump();
    }

    /// Current error messages for one property.
    pub fn prop_errors(&self, prop: &str) -> Vec<String> {
        let domain = self.inner.state.domain();
        let class = match domain.class(&self.inner.type_name) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };
        match class.prop(prop) {
            Some(p) => self.errors_for(p),
            None => Vec::new(),
        }
    }

    /// Current error messages across every property, in declaration order.
    pub fn errors(&self) -> Vec<String> {
        let domain = self.inner.state.domain();
        let class = match domain.class(&self.inner.type_name) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };
        class.props.iter().flat_map(|p| self.errors_for(p)).collect()
    }

    pub fn has_error(&self) -> bool {
        !self.errors().is_empty()
    }

    fn errors_for(&self, prop: &Property) -> Vec<String> {
        let effective = self.inner.vm_write().rules.effective(prop);
        let value = self.inner.object.get(prop.name());
        // A required foreign key is satisfied by a loaded navigation
        // object; the key materializes when the object saves.
        let satisfied_elsewhere = match &prop.role {
            Role::ForeignKey {
                navigation_prop: Some(nav),
                ..
            } => value.is_null() && self.inner.object.get(nav).as_object().is_some(),
            _ => false,
        };
        effective
            .iter()
            .filter_map(|(_, rule)| {
                rules::evaluate(rule, &prop.value.display_name, &value, satisfied_elsewhere)
            })
            .collect()
    }

    // ----- configuration -----

    pub fn save_mode(&self) -> SaveMode {
        self.inner.vm_read().save_mode
    }

    pub fn set_save_mode(&self, mode: SaveMode) {
        self.inner.vm_write().save_mode = mode;
    }

    pub fn extra_save_props(&self) -> Vec<String> {
        self.inner.vm_read().extra_save_props.clone()
    }

    /// Props included in every surgical save even when clean, for fields
    /// the server recomputes from other inputs.
    pub fn set_extra_save_props(&self, props: &[&str]) {
        self.inner.vm_write().extra_save_props = props.iter().map(|p| p.to_string()).collect();
    }

    /// When false, a successful save only adopts the new primary key
    /// instead of reloading every returned field.
    pub fn set_load_response_from_saves(&self, enabled: bool) {
        self.inner.vm_write().load_response_from_saves = enabled;
    }

    pub fn params(&self) -> DataSourceParams {
        self.inner.vm_read().params.clone()
    }

    pub fn set_params(&self, params: DataSourceParams) {
        self.inner.vm_write().params = params;
        self.inner.bump();
    }

    // ----- endpoint callers -----

    pub fn loader(&self) -> &ItemCaller<GetArgs, ModelObject> {
        self.inner
            .load_caller
            .get_or_init(|| self.inner.api.get_caller())
    }

    pub fn saver(&self) -> &ItemCaller<SaveArgs, ModelObject> {
        self.inner
            .save_caller
            .get_or_init(|| self.inner.api.save_caller())
    }

    pub fn deleter(&self) -> &ItemCaller<DeleteArgs, ModelObject> {
        self.inner
            .delete_caller
            .get_or_init(|| self.inner.api.delete_caller())
    }

    pub(crate) fn bulk_saver(&self) -> &ItemCaller<BulkSaveArgs, ModelObject> {
        self.inner
            .bulk_caller
            .get_or_init(|| self.inner.api.bulk_save_caller())
    }

    // ----- CRUD -----

    /// Fetch the instance by id, or by its current primary key. Returns
    /// true when fresh data was applied.
    pub async fn load(&self, id: Option<FieldValue>) -> Result<bool, ApiError> {
        let id = match id {
            Some(v) if !v.is_null() => v,
            _ => self.primary_key(),
        };
        let params = self.inner.vm_read().params.clone();
        let outcome = self.loader().invoke(GetArgs { id, params }).await?;
        match outcome.and_then(|o| o.object) {
            Some(fresh) => {
                self.apply_clean_load(&fresh, false)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Persist this instance. Fails locally when validation rules report
    /// errors or the type's behaviors forbid the operation. Returns false
    /// when the call was superseded before being sent.
    pub async fn save(&self) -> Result<bool, ApiError> {
        let (behaviors, display_name, key_prop) = self.model_facts()?;
        let was_persisted = self.is_persisted();
        if was_persisted && !behaviors.edit {
            return Err(ApiError::LocalValidation(format!(
                "{} does not allow edits",
                display_name
            )));
        }
        if !was_persisted && !behaviors.create {
            return Err(ApiError::LocalValidation(format!(
                "{} does not allow creation",
                display_name
            )));
        }
        let errors = self.errors();
        if !errors.is_empty() {
            return Err(ApiError::LocalValidation(format!(
                "cannot save {}: {}",
                display_name,
                errors.join("; ")
            )));
        }

        let (mode, params) = {
            let vm = self.inner.vm_read();
            (vm.save_mode, vm.params.clone())
        };
        let domain = self.inner.state.domain();
        let options = MapToDtoOptions { max_depth: Some(1) };
        let dto = match mode {
            SaveMode::Surgical => {
                let props = self.surgical_props(&key_prop);
                map_to_dto_filtered(domain, &self.inner.object, &props, &options)
            }
            SaveMode::Whole => map_to_dto(domain, &self.inner.object, &options),
        }
        .map_err(ApiError::from)?;

        // Clear before sending so edits made during the request stay dirty.
        let cleared = std::mem::take(&mut self.inner.vm_write().dirty);

        match self.saver().invoke(SaveArgs { dto, params }).await {
            Err(e) => {
                self.remark_dirty(cleared);
                Err(e)
            }
            Ok(None) => {
                self.remark_dirty(cleared);
                Ok(false)
            }
            Ok(Some(outcome)) => {
                if let Some(returned) = outcome.object {
                    let load_response = self.inner.vm_read().load_response_from_saves;
                    if load_response {
                        self.apply_clean_load(&returned, false)?;
                    } else if !was_persisted {
                        self.adopt_primary_key(&key_prop, returned.get(&key_prop))?;
                    }
                    if !was_persisted {
                        self.propagate_key_to_parent(&self.inner.object.get(&key_prop))?;
                    }
                }
                Ok(true)
            }
        }
    }

    /// Delete this instance on the server (when persisted) and detach it
    /// locally. Returns false when the call was superseded.
    pub async fn delete(&self) -> Result<bool, ApiError> {
        let (behaviors, display_name, _) = self.model_facts()?;
        if !behaviors.delete {
            return Err(ApiError::LocalValidation(format!(
                "{} does not allow deletes",
                display_name
            )));
        }
        if self.is_persisted() {
            let params = self.inner.vm_read().params.clone();
            let outcome = self
                .deleter()
                .invoke(DeleteArgs {
                    id: self.primary_key(),
                    params,
                })
                .await?;
            if outcome.is_none() {
                return Ok(false);
            }
        }
        // Already gone server-side; nothing for bulk save to delete.
        self.detach_from_parent(false);
        Ok(true)
    }

    /// Re-mark without a change tick so a failed auto save does not
    /// immediately requeue itself.
    fn remark_dirty(&self, props: HashSet<String>) {
        self.inner.vm_write().dirty.extend(props);
    }

    fn model_facts(&self) -> Result<(Behaviors, String, String), ApiError> {
        let domain = self.inner.state.domain();
        let class = domain.model(&self.inner.type_name).map_err(ApiError::from)?;
        let model = class.model.as_ref().ok_or_else(|| {
            ApiError::from(DataError::TypeMismatch {
                expected: "model".into(),
                actual: self.inner.type_name.clone(),
            })
        })?;
        Ok((
            model.behaviors,
            class.display_name.clone(),
            model.key_prop.clone(),
        ))
    }

    pub(crate) fn key_prop_name(&self) -> Result<String, DataError> {
        let domain = self.inner.state.domain();
        let class = domain.model(&self.inner.type_name)?;
        Ok(class
            .model
            .as_ref()
            .map(|m| m.key_prop.clone())
            .unwrap_or_default())
    }

    /// Take a freshly assigned primary key and push it into children whose
    /// foreign keys were waiting on it.
    pub(crate) fn adopt_primary_key(
        &self,
        key_prop: &str,
        key: FieldValue,
    ) -> Result<(), DataError> {
        if key.is_null() {
            return Ok(());
        }
        self.inner.object.set(key_prop, key.clone());
        let domain = self.inner.state.domain();
        let class = domain.class(&self.inner.type_name)?;
        for prop in &class.props {
            if let Role::CollectionNavigation { foreign_key, .. } = &prop.role {
                let value = self.inner.object.get(prop.name());
                if let Some(items) = value.as_list() {
                    for item in items {
                        if let Some(obj) = item.as_object() {
                            if obj.get(foreign_key).is_null() {
                                let child =
                                    ViewModel::for_object(&self.inner.state, obj.clone())?;
                                child.write_field(foreign_key, key.clone());
                            }
                        }
                    }
                }
            }
        }
        self.inner.bump();
        Ok(())
    }

    /// When a parent holds this instance through a reference navigation and
    /// this instance saved first, the parent's foreign key gets the new
    /// value so the parent's own save persists the relationship.
    fn propagate_key_to_parent(&self, key: &FieldValue) -> Result<(), DataError> {
        if key.is_null() {
            return Ok(());
        }
        let parent = {
            let vm = self.inner.vm_read();
            if vm.parent_collection.is_some() {
                return Ok(());
            }
            vm.parent.as_ref().and_then(Weak::upgrade)
        };
        let Some(parent) = parent else {
            return Ok(());
        };
        let domain = self.inner.state.domain();
        let class = domain.class(&parent.type_name)?;
        let parent_vm = ViewModel {
            inner: parent.clone(),
        };
        for prop in &class.props {
            let Role::ReferenceNavigation { foreign_key, .. } = &prop.role else {
                continue;
            };
            if let Some(held) = parent.object.get(prop.name()).as_object() {
                if held.same_instance(&self.inner.object) {
                    parent_vm.write_field(foreign_key, key.clone());
                }
            }
        }
        Ok(())
    }

    /// Merge server data into this instance without touching fields the
    /// response omitted, reusing child instances by key, and leaving the
    /// result clean. Unsaved collection items survive at the tail unless
    /// `purge_unsaved` is set.
    pub(crate) fn apply_clean_load(
        &self,
        source: &ModelObject,
        purge_unsaved: bool,
    ) -> Result<(), DataError> {
        let domain = self.inner.state.domain().clone();
        let class = domain.class(&self.inner.type_name)?;
        for prop in &class.props {
            if !source.has(prop.name()) {
                continue;
            }
            let incoming = source.get(prop.name());
            match &prop.role {
                Role::ReferenceNavigation { principal_key, .. } => {
                    self.reconcile_reference(prop, principal_key, incoming, purge_unsaved)?;
                }
                Role::CollectionNavigation { foreign_key, .. } => {
                    self.reconcile_collection(prop, foreign_key, incoming, purge_unsaved)?;
                }
                _ => {
                    self.inner.object.set(prop.name(), incoming);
                }
            }
        }
        self.inner.vm_write().dirty.clear();
        self.inner.bump();
        Ok(())
    }

    fn reconcile_reference(
        &self,
        prop: &Property,
        principal_key: &str,
        incoming: FieldValue,
        purge_unsaved: bool,
    ) -> Result<(), DataError> {
        let incoming_obj = match incoming.as_object() {
            Some(o) => o,
            None => {
                self.inner.object.set(prop.name(), FieldValue::Null);
                return Ok(());
            }
        };
        let current = self.inner.object.get(prop.name());
        if let Some(existing) = current.as_object() {
            let key = existing.get(principal_key);
            if !key.is_null() && key == incoming_obj.get(principal_key) {
                // Same entity: merge into the instance views already hold.
                if !existing.same_instance(&incoming_obj) {
                    let child = ViewModel::for_object(&self.inner.state, existing)?;
                    child.apply_clean_load(&incoming_obj, purge_unsaved)?;
                }
                return Ok(());
            }
        }
        let child = ViewModel::for_object(&self.inner.state, incoming_obj.clone())?;
        {
            let mut child_state = child.inner.vm_write();
            if child_state.parent.as_ref().and_then(Weak::upgrade).is_none() {
                child_state.parent = Some(Arc::downgrade(&self.inner));
                child_state.parent_collection = None;
            }
        }
        self.inner
            .object
            .set(prop.name(), FieldValue::Object(incoming_obj));
        Ok(())
    }

    fn reconcile_collection(
        &self,
        prop: &Property,
        foreign_key: &str,
        incoming: FieldValue,
        purge_unsaved: bool,
    ) -> Result<(), DataError> {
        let item_type = collection_item_type(prop).ok_or_else(|| DataError::TypeMismatch {
            expected: "model collection".into(),
            actual: prop.name().to_string(),
        })?;
        let item_key = {
            let domain = self.inner.state.domain();
            domain
                .model(&item_type)?
                .model
                .as_ref()
                .map(|m| m.key_prop.clone())
                .unwrap_or_default()
        };

        let incoming_items: Vec<ModelObject> = incoming
            .as_list()
            .map(|items| items.iter().filter_map(|v| v.as_object()).collect())
            .unwrap_or_default();

        // Index what we hold now: persisted items by key, unsaved in order.
        let current = self.inner.object.get(prop.name());
        let mut existing_by_key: HashMap<String, ModelObject> = HashMap::new();
        let mut unsaved: Vec<ModelObject> = Vec::new();
        if let Some(items) = current.as_list() {
            for v in items {
                if let Some(obj) = v.as_object() {
                    match loose_query_string(&obj.get(&item_key)) {
                        Some(k) => {
                            existing_by_key.insert(k, obj);
                        }
                        None => unsaved.push(obj),
                    }
                }
            }
        }

        let owner_key = self.primary_key();
        let mut rebuilt: Vec<FieldValue> = Vec::with_capacity(incoming_items.len());
        for inc in incoming_items {
            let key = loose_query_string(&inc.get(&item_key));
            match key.and_then(|k| existing_by_key.remove(&k)) {
                Some(existing) if !existing.same_instance(&inc) => {
                    let child = ViewModel::for_object(&self.inner.state, existing.clone())?;
                    child.apply_clean_load(&inc, purge_unsaved)?;
                    rebuilt.push(FieldValue::Object(existing));
                }
                Some(existing) => rebuilt.push(FieldValue::Object(existing)),
                None => {
                    let child = ViewModel::for_object(&self.inner.state, inc.clone())?;
                    self.adopt_into_collection(&child, prop.name(), foreign_key, &owner_key);
                    rebuilt.push(FieldValue::Object(inc));
                }
            }
        }
        // Items the server no longer returns are dropped; local additions
        // that were never saved stay at the tail.
        if !purge_unsaved {
            for obj in unsaved {
                if obj.get(foreign_key).is_null() && !owner_key.is_null() {
                    let child = ViewModel::for_object(&self.inner.state, obj.clone())?;
                    child.write_field(foreign_key, owner_key.clone());
                }
                rebuilt.push(FieldValue::Object(obj));
            }
        }
        self.inner.object.set(prop.name(), FieldValue::List(rebuilt));
        Ok(())
    }
}

fn collection_item_type(prop: &Property) -> Option<String> {
    match &prop.value.kind {
        ValueKind::Collection(inner) => inner.kind.type_name().map(str::to_string),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::api::transport::{HttpRequest, HttpResponse, HttpTransport};
    use crate::error::ApiError;
    use crate::metadata::{Domain, DomainBuilder, ModelBuilder, PropBuilder};
    use crate::state::ClientState;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex, PoisonError};

    /// Person/Company/Pet graph exercising every relational role.
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
                    .prop(
                        PropBuilder::model("company", "Company")
                            .reference_navigation("companyId"),
                    )
                    .prop(
                        PropBuilder::collection_of_model("pets", "Pet")
                            .collection_navigation("ownerId"),
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

    /// Transport that replays scripted responses in order and records
    /// every request it saw.
    #[derive(Default)]
    pub struct ScriptedTransport {
        responses: Mutex<VecDeque<Result<HttpResponse, ApiError>>>,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn push_json(&self, status: u16, body: serde_json::Value) {
            self.responses
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(Ok(HttpResponse {
                    status,
                    content_type: Some("application/json".into()),
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
    impl HttpTransport for ScriptedTransport {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
            self.requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(request);
            self.responses
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
                .unwrap_or_else(|| Err(ApiError::Network("unscripted request".into())))
        }
    }

    pub fn client(transport: Arc<ScriptedTransport>) -> ClientState {
        ClientState::new(domain(), transport)
    }
}
