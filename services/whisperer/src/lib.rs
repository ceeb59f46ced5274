pub mod clients;
pub mod config;
pub mod error;
pub mod groups;
pub mod metrics;
pub mod pipeline;
pub mod query;
pub mod stream;
pub mod transport_axum;

pub use error::{DetailedError, FailureKind};
pub use pipeline::{DataRequest, Gateway, PipelineOutcome, PipelineSettings, Stage};
pub use query::{DataQueryParams, build_query};
