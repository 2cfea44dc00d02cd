//! モデル推論機能
//!
//! バックエンドの判定は信頼せず、学習時のデータセットと現在の
//! データセットの両方に照らして検証してから `PredictionResult` に変換する。

use std::sync::Arc;

use crate::dataset::lock_store;
use crate::error::{CoreError, CoreResult};
use crate::ml::backend::{BackendError, ClassificationBackend, RawVerdict};
use crate::ml::training::TrainingOrchestrator;
use crate::model::TrainedModel;
use crate::types::{CategoryId, PredictionResult};

/// 理由が空のときの表示
pub const NO_REASONING: &str = "判定理由は提供されませんでした";

/// 推論エンジン
#[derive(Clone)]
pub struct InferenceEngine {
    orchestrator: TrainingOrchestrator,
}

impl InferenceEngine {
    pub fn new(orchestrator: TrainingOrchestrator) -> Self {
        Self { orchestrator }
    }

    fn backend(&self) -> Arc<dyn ClassificationBackend> {
        Arc::clone(self.orchestrator.backend())
    }

    /// 単一画像を分類
    ///
    /// 学習済みモデルがなければ `NoTrainedModel`。
    /// バックエンドへの呼び出しはブロッキングスレッドで実行する。
    pub async fn classify(&self, image: &[u8]) -> CoreResult<PredictionResult> {
        let model = self
            .orchestrator
            .current_model()
            .ok_or(CoreError::NoTrainedModel)?;
        if image.is_empty() {
            return Err(CoreError::InvalidImage("画像が空です".to_string()));
        }

        let backend = self.backend();
        let task_model = Arc::clone(&model);
        let bytes = image.to_vec();
        let verdict = tokio::task::spawn_blocking(move || backend.infer(&task_model, &bytes))
            .await
            .map_err(|e| CoreError::Unknown(format!("推論スレッドエラー: {}", e)))?
            .map_err(inference_error)?;

        let result = validate_verdict(&model, verdict)?;
        self.ensure_category_exists(&result.predicted_class_id)?;
        tracing::debug!(
            "推論: {} ({:.1}%) [{}]",
            result.predicted_class_name,
            result.confidence * 100.0,
            result.algorithm_variant
        );
        Ok(result)
    }

    /// 複数画像を順に分類
    ///
    /// 画像ごとに結果を返し、1枚の失敗で全体を止めない。
    pub async fn classify_batch(&self, images: &[Vec<u8>]) -> Vec<CoreResult<PredictionResult>> {
        let mut results = Vec::with_capacity(images.len());
        for image in images {
            results.push(self.classify(image).await);
        }
        results
    }

    /// 予測クラスが現在のデータセットにも存在するか確認する
    ///
    /// 学習後に削除されたクラスを結果として返さない。
    fn ensure_category_exists(&self, id: &CategoryId) -> CoreResult<()> {
        let store = lock_store(self.orchestrator.store());
        if store.category(id).is_none() {
            return Err(CoreError::InvalidBackendResponse(format!(
                "予測されたクラス {} は既に削除されています",
                id
            )));
        }
        Ok(())
    }

    /// 予測クラスの現在の表示名
    ///
    /// 学習後にクラス名が変更されていればそれを返す。
    /// 削除済みなら学習時の名前を返す。
    pub fn predicted_class_name(&self, result: &PredictionResult) -> String {
        let store = lock_store(self.orchestrator.store());
        store
            .category(&result.predicted_class_id)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| result.predicted_class_name.clone())
    }
}

/// バックエンドの判定を検証する
///
/// - 予測IDは学習時のクラスに含まれていなければならない
/// - 信頼度は [0, 1] に丸める（NaNは0）
/// - 理由が空なら既定文言を入れる
pub fn validate_verdict(model: &TrainedModel, verdict: RawVerdict) -> CoreResult<PredictionResult> {
    let raw_id = verdict
        .predicted_class_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| CoreError::InvalidBackendResponse("予測クラスIDがありません".to_string()))?;

    let class_id = CategoryId::new(raw_id);
    let category = model.snapshot().category(&class_id).ok_or_else(|| {
        CoreError::InvalidBackendResponse(format!("未知のクラスIDが返されました: {}", class_id))
    })?;

    let confidence = verdict
        .confidence
        .ok_or_else(|| CoreError::InvalidBackendResponse("信頼度がありません".to_string()))?;
    let confidence = if confidence.is_nan() {
        tracing::warn!("信頼度がNaNでした。0として扱います");
        0.0
    } else {
        if !(0.0..=1.0).contains(&confidence) {
            tracing::warn!("信頼度 {} が範囲外のため丸めます", confidence);
        }
        confidence.clamp(0.0, 1.0)
    };

    let reasoning = verdict
        .reasoning
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| NO_REASONING.to_string());

    Ok(PredictionResult {
        algorithm_variant: model.variant(),
        predicted_class_id: class_id,
        predicted_class_name: category.name.clone(),
        confidence,
        reasoning,
        timestamp: chrono::Utc::now(),
    })
}

fn inference_error(err: BackendError) -> CoreError {
    match err {
        BackendError::Unavailable(msg) => CoreError::BackendUnavailable(msg),
        BackendError::Malformed(msg) => CoreError::InvalidBackendResponse(msg),
        BackendError::InvalidInput(msg) | BackendError::InvalidDataset(msg) => {
            CoreError::InvalidImage(msg)
        }
        other => CoreError::Unknown(other.to_string()),
    }
}
