//! プロセス内で完結するローカル分類バックエンド

use std::sync::Arc;

use crate::dataset::DatasetSnapshot;
use crate::ml::backend::{BackendError, BackendModel, CancelFlag, ClassificationBackend, RawVerdict};
use crate::ml::ml_model::{load_and_normalize_image_bytes, LocalModel, Strategy};
use crate::model::{LocalBackendSettings, TrainedModel};
use crate::types::AlgorithmVariant;

/// ローカルバックエンド
#[derive(Debug, Clone, Default)]
pub struct LocalBackend {
    settings: LocalBackendSettings,
}

impl LocalBackend {
    pub fn new(settings: LocalBackendSettings) -> Self {
        Self { settings }
    }
}

impl ClassificationBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    fn train(
        &self,
        snapshot: &DatasetSnapshot,
        variant: AlgorithmVariant,
        cancel: &CancelFlag,
    ) -> Result<BackendModel, BackendError> {
        let size = self.settings.feature_size;
        let mut examples = Vec::with_capacity(snapshot.total_samples());

        for (class_index, sample) in snapshot.labelled_samples() {
            if cancel.is_cancelled() {
                return Err(BackendError::Cancelled);
            }
            let features = load_and_normalize_image_bytes(&sample.image, size).map_err(|e| {
                let category = &snapshot.categories()[class_index];
                BackendError::InvalidDataset(format!(
                    "クラス '{}' の画像 '{}' を読み込めません: {}",
                    category.name, sample.id, e
                ))
            })?;
            examples.push((class_index, features));
        }

        let strategy = Strategy::for_variant(variant);
        let model = LocalModel::fit(
            strategy,
            size,
            self.settings.neighbours,
            self.settings.temperature,
            snapshot.categories().len(),
            examples,
        );
        let accuracy = model.training_accuracy();
        tracing::debug!("ローカル学習完了: {:?}, 学習データ精度 {:.3}", strategy, accuracy);

        Ok(BackendModel {
            state: Arc::new(model),
            accuracy,
        })
    }

    fn infer(&self, model: &TrainedModel, image: &[u8]) -> Result<RawVerdict, BackendError> {
        let local = model
            .backend_state::<LocalModel>()
            .ok_or_else(|| BackendError::Other("このモデルはローカルバックエンドで学習されていません".to_string()))?;

        let features = load_and_normalize_image_bytes(image, local.feature_size)
            .map_err(|e| BackendError::InvalidInput(e.to_string()))?;

        let prediction = local
            .predict(&features)
            .ok_or_else(|| BackendError::Malformed("モデルにクラスがありません".to_string()))?;

        let category = model.snapshot().categories().get(prediction.class_index);
        let reasoning = match local.strategy {
            Strategy::Centroid => format!(
                "クラス重心との平均二乗距離 {:.3} が最小でした",
                prediction.distance
            ),
            Strategy::PooledCentroid => format!(
                "プーリング後の特徴でクラス重心との距離 {:.3} が最小でした",
                prediction.distance
            ),
            Strategy::NearestNeighbours => format!(
                "近傍 {} 件のうち {:.0}% が同じクラスでした",
                local.neighbours,
                prediction.confidence * 100.0
            ),
        };

        Ok(RawVerdict {
            predicted_class_id: category.map(|c| c.id.to_string()),
            confidence: Some(prediction.confidence),
            reasoning: Some(reasoning),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DatasetStore;
    use crate::ml::ml_model::tests::solid_png;
    use crate::model::ModelMetadata;
    use crate::types::Metrics;
    use std::time::Duration;

    fn colour_snapshot() -> DatasetSnapshot {
        let mut store = DatasetStore::default();
        let red = store.add_category("red");
        let blue = store.add_category("blue");
        store.add_sample(&red.id, solid_png([250, 0, 0])).unwrap();
        store.add_sample(&blue.id, solid_png([0, 0, 250])).unwrap();
        store.snapshot()
    }

    fn trained(backend: &LocalBackend, variant: AlgorithmVariant) -> TrainedModel {
        let snapshot = colour_snapshot();
        let out = backend.train(&snapshot, variant, &CancelFlag::new()).unwrap();
        TrainedModel::new(
            ModelMetadata::new(variant, &snapshot, backend.name(), 1),
            snapshot,
            Metrics {
                accuracy: out.accuracy,
                total_samples: 2,
                last_training_duration: Duration::ZERO,
            },
            out.state,
        )
    }

    #[test]
    fn test_train_and_infer_every_variant() {
        let backend = LocalBackend::default();
        for variant in AlgorithmVariant::ALL {
            let model = trained(&backend, variant);
            let verdict = backend.infer(&model, &solid_png([0, 0, 255])).unwrap();
            assert_eq!(verdict.predicted_class_id.as_deref(), Some("class_2"));
            assert!(verdict.reasoning.is_some());
        }
    }

    #[test]
    fn test_train_rejects_corrupt_sample() {
        let mut store = DatasetStore::default();
        let a = store.add_category("a");
        let b = store.add_category("b");
        store.add_sample(&a.id, solid_png([1, 2, 3])).unwrap();
        store.add_sample(&b.id, vec![0u8, 1, 2]).unwrap();

        let err = LocalBackend::default()
            .train(&store.snapshot(), AlgorithmVariant::LogisticRegression, &CancelFlag::new())
            .err()
            .unwrap();
        assert!(matches!(err, BackendError::InvalidDataset(_)));
    }

    #[test]
    fn test_train_honours_cancel_flag() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = LocalBackend::default()
            .train(&colour_snapshot(), AlgorithmVariant::RandomForest, &cancel)
            .err()
            .unwrap();
        assert_eq!(err, BackendError::Cancelled);
    }

    #[test]
    fn test_infer_rejects_undecodable_query() {
        let backend = LocalBackend::default();
        let model = trained(&backend, AlgorithmVariant::LogisticRegression);
        let err = backend.infer(&model, b"nope").unwrap_err();
        assert!(matches!(err, BackendError::InvalidInput(_)));
    }
}
