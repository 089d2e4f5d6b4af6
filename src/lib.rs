//! Bindery SDK: metadata-driven client runtime for generated CRUD APIs.

pub mod api;
pub mod binding;
pub mod case;
pub mod error;
pub mod metadata;
pub mod model;
pub mod response;
pub mod state;
pub mod viewmodel;

pub use api::{
    ApiClient, ConcurrencyMode, DataSourceParams, FilterParams, HttpRequest, HttpResponse,
    HttpTransport, ListParams,
};
pub use binding::{MemoryRoute, QueryBinder, QueryRoute};
pub use error::{ApiError, DataError, MetadataError};
pub use metadata::{Domain, DomainBuilder, EnumBuilder, MethodBuilder, ModelBuilder, PropBuilder};
pub use model::{FieldValue, ModelObject};
pub use state::{ClientOptions, ClientState};
pub use viewmodel::{AutoSaveOptions, ListViewModel, Rule, SaveMode, ViewModel};
