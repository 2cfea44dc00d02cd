pub mod types;
pub mod error;
pub mod dataset;
pub mod logging;
pub mod app;

// 学習・推論機能のモジュール
pub mod model;
pub mod ml;

pub use app::{AppState, AppSummary};
pub use dataset::{DatasetSnapshot, DatasetStore, Readiness, SharedDatasetStore};
pub use error::{CoreError, CoreResult, NotReadyReason, TrainingError, TrainingErrorKind};
pub use ml::{
    ClassificationBackend, InferenceEngine, TrainingEvent, TrainingOrchestrator, TrainingOutcome,
    TrainingState,
};
pub use model::{AppConfig, BackendKind, TrainedModel};
pub use types::{
    AlgorithmVariant, AppStep, CategoryId, ClassCategory, Metrics, PredictionResult, Sample,
    SampleId,
};
