//! Shared client context threaded through callers and view models.

use crate::api::cache::{CacheStorage, InflightRegistry, ResponseCache};
use crate::api::caller::CallerEnv;
use crate::api::transport::HttpTransport;
use crate::metadata::Domain;
use crate::viewmodel::ViewModelRegistry;
use std::sync::Arc;

/// Construction options. Defaults match a same-origin API mounted at /api.
pub struct ClientOptions {
    pub base_path: String,
    /// Backing store for response caching. Defaults to process memory.
    pub storage: Option<Arc<dyn CacheStorage>>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            base_path: "/api".to_string(),
            storage: None,
        }
    }
}

struct ClientInner {
    domain: Arc<Domain>,
    transport: Arc<dyn HttpTransport>,
    base_path: String,
    cache: Arc<ResponseCache>,
    inflight: Arc<InflightRegistry>,
    vm_registry: ViewModelRegistry,
}

/// One application's client runtime: metadata, transport, caches, and the
/// view model identity registry. Cheap to clone.
#[derive(Clone)]
pub struct ClientState {
    inner: Arc<ClientInner>,
}

impl ClientState {
    pub fn new(domain: Arc<Domain>, transport: Arc<dyn HttpTransport>) -> Self {
        Self::with_options(domain, transport, ClientOptions::default())
    }

    pub fn with_options(
        domain: Arc<Domain>,
        transport: Arc<dyn HttpTransport>,
        options: ClientOptions,
    ) -> Self {
        let cache = match options.storage {
            Some(storage) => ResponseCache::new(storage),
            None => ResponseCache::in_memory(),
        };
        ClientState {
            inner: Arc::new(ClientInner {
                domain,
                transport,
                base_path: options.base_path.trim_end_matches('/').to_string(),
                cache: Arc::new(cache),
                inflight: Arc::new(InflightRegistry::default()),
                vm_registry: ViewModelRegistry::default(),
            }),
        }
    }

    pub fn domain(&self) -> &Arc<Domain> {
        &self.inner.domain
    }

    pub fn base_path(&self) -> &str {
        &self.inner.base_path
    }

    pub fn transport(&self) -> &Arc<dyn HttpTransport> {
        &self.inner.transport
    }

    pub fn response_cache(&self) -> &Arc<ResponseCache> {
        &self.inner.cache
    }

    pub(crate) fn caller_env(&self) -> CallerEnv {
        CallerEnv {
            transport: self.inner.transport.clone(),
            cache: self.inner.cache.clone(),
            inflight: self.inner.inflight.clone(),
        }
    }

    pub(crate) fn vm_registry(&self) -> &ViewModelRegistry {
        &self.inner.vm_registry
    }
}
