pub mod model_metadata;
pub mod config;

pub use model_metadata::{log_metadata_info, BackendState, ModelMetadata, TrainedModel};
pub use config::{AppConfig, BackendKind, DatasetSettings, LocalBackendSettings, RemoteBackendSettings};
