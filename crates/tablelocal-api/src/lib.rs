//! tablelocal API - Table service REST layer
//!
//! Translates the HTTP/OData wire protocol into catalog and entity store
//! calls: path parsing, JSON entity codec, `$batch` multipart codec,
//! SharedKey authorization, per-operation metrics and the error envelope.

pub mod auth;
pub mod batch;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod odata;
pub mod resource;

pub use auth::Authenticator;
pub use error::{ApiError, ApiResult};
pub use handlers::{AppState, dispatch, effective_method, health_check, metrics_handler};
pub use metrics::{TableMetrics, TableOperation};
pub use odata::MetadataLevel;
pub use resource::{Resource, parse_path};
