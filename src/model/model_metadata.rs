//! 学習済みモデルのハンドルとメタデータ
//!
//! 学習済みモデルは作成後に変更されない。新しい学習が完了すると
//! 古いハンドルは単に破棄される。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;

use crate::dataset::DatasetSnapshot;
use crate::types::{AlgorithmVariant, CategoryId, Metrics};

/// モデルメタデータ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// 学習に使用したアルゴリズム
    pub variant: AlgorithmVariant,

    /// 学習時のクラスID（追加順）
    pub class_ids: Vec<CategoryId>,

    /// 学習時のクラス表示名（class_idsと同じ順）
    pub class_names: Vec<String>,

    /// バックエンド名
    pub backend: String,

    /// 学習の世代番号
    pub generation: u64,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        variant: AlgorithmVariant,
        snapshot: &DatasetSnapshot,
        backend: impl Into<String>,
        generation: u64,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            variant,
            class_ids: snapshot.category_ids().cloned().collect(),
            class_names: snapshot.categories().iter().map(|c| c.name.clone()).collect(),
            backend: backend.into(),
            generation,
            trained_at,
        }
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}

/// バックエンド固有の状態（コアからは不透明）
pub type BackendState = Arc<dyn Any + Send + Sync>;

/// 学習済みモデルのハンドル
#[derive(Clone)]
pub struct TrainedModel {
    metadata: ModelMetadata,
    snapshot: DatasetSnapshot,
    metrics: Metrics,
    state: BackendState,
}

impl TrainedModel {
    pub fn new(
        metadata: ModelMetadata,
        snapshot: DatasetSnapshot,
        metrics: Metrics,
        state: BackendState,
    ) -> Self {
        Self {
            metadata,
            snapshot,
            metrics,
            state,
        }
    }

    pub fn variant(&self) -> AlgorithmVariant {
        self.metadata.variant
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    /// 学習に使用したデータセット
    pub fn snapshot(&self) -> &DatasetSnapshot {
        &self.snapshot
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// バックエンド固有の状態を取り出す
    pub fn backend_state<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.state.downcast_ref::<T>()
    }
}

impl std::fmt::Debug for TrainedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainedModel")
            .field("metadata", &self.metadata)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

/// メタデータをログに出力
pub fn log_metadata_info(model: &TrainedModel) {
    let metadata = model.metadata();
    tracing::info!("=== モデルメタデータ ===");
    tracing::info!("アルゴリズム: {}", metadata.variant);
    tracing::info!("バックエンド: {}", metadata.backend);
    tracing::info!("クラス: {}", metadata.class_names.join(", "));
    tracing::info!("サンプル数: {}", model.metrics().total_samples);
    tracing::info!("精度: {:.1}%", model.metrics().accuracy * 100.0);
    tracing::info!("学習時間: {:?}", model.metrics().last_training_duration);
    tracing::info!("学習日時: {}", metadata.trained_at);
}
