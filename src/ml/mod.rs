pub mod backend;
pub mod ml_model;
pub mod local_backend;
#[cfg(feature = "remote")]
pub mod remote_backend;
pub mod training;
pub mod inference;

#[cfg(test)]
pub(crate) mod test_support;

pub use backend::{build_backend, BackendError, BackendModel, CancelFlag, ClassificationBackend, RawVerdict};
pub use ml_model::{load_and_normalize_image_bytes, LocalModel, Strategy};
pub use local_backend::LocalBackend;
#[cfg(feature = "remote")]
pub use remote_backend::RemoteBackend;
pub use training::{TrainingEvent, TrainingOrchestrator, TrainingOutcome, TrainingRun, TrainingState};
pub use inference::{validate_verdict, InferenceEngine};
