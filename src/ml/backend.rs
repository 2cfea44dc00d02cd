//! 分類バックエンドの契約
//!
//! コアはこのトレイトのみに依存し、各アルゴリズムの内部には立ち入らない。
//! メソッドは同期的で、呼び出し側が `spawn_blocking` で実行する。

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::dataset::DatasetSnapshot;
use crate::model::{AppConfig, BackendKind, BackendState, TrainedModel};
use crate::types::AlgorithmVariant;

/// 協調的キャンセル用フラグ
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// バックエンドが報告するエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// 通信失敗・タイムアウトなど
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// 学習データを受け付けられない
    #[error("invalid dataset: {0}")]
    InvalidDataset(String),
    /// 推論対象の画像を受け付けられない
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// 応答を解釈できない
    #[error("malformed response: {0}")]
    Malformed(String),
    /// キャンセル要求を受けて中断した
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Other(String),
}

/// 学習の成果（モデル状態と学習データ上の精度）
pub struct BackendModel {
    pub state: BackendState,
    pub accuracy: f64,
}

/// バックエンドが返す未検証の判定
///
/// 内容は信頼しない。InferenceEngine が検証してから結果に変換する。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawVerdict {
    #[serde(default, alias = "predictedClassId", alias = "classId", alias = "class_id")]
    pub predicted_class_id: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default, alias = "explanation")]
    pub reasoning: Option<String>,
}

/// 分類バックエンド
pub trait ClassificationBackend: Send + Sync + 'static {
    /// ログ・メタデータ用の名前
    fn name(&self) -> &str;

    /// データセットを学習する
    fn train(
        &self,
        snapshot: &DatasetSnapshot,
        variant: AlgorithmVariant,
        cancel: &CancelFlag,
    ) -> Result<BackendModel, BackendError>;

    /// 学習済みモデルで1枚の画像を分類する
    fn infer(&self, model: &TrainedModel, image: &[u8]) -> Result<RawVerdict, BackendError>;
}

/// 設定からバックエンドを構築する
pub fn build_backend(config: &AppConfig) -> anyhow::Result<Arc<dyn ClassificationBackend>> {
    match config.backend {
        BackendKind::Local => Ok(Arc::new(super::LocalBackend::new(config.local.clone()))),
        #[cfg(feature = "remote")]
        BackendKind::Remote => Ok(Arc::new(super::RemoteBackend::from_settings(&config.remote)?)),
        #[cfg(not(feature = "remote"))]
        BackendKind::Remote => Err(anyhow::anyhow!(
            "リモートバックエンドが有効化されていません (feature \"remote\")"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_cancelled());
        flag.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_raw_verdict_accepts_camel_case() {
        let verdict: RawVerdict = serde_json::from_str(
            r#"{"predictedClassId":"class_2","confidence":0.8,"reasoning":"ears"}"#,
        )
        .unwrap();
        assert_eq!(verdict.predicted_class_id.as_deref(), Some("class_2"));
        assert_eq!(verdict.confidence, Some(0.8));
    }

    #[test]
    fn test_raw_verdict_missing_fields_are_none() {
        let verdict: RawVerdict = serde_json::from_str(r#"{"predicted_class_id":"class_1"}"#).unwrap();
        assert!(verdict.confidence.is_none());
        assert!(verdict.reasoning.is_none());
    }

    #[test]
    fn test_build_local_backend() {
        let backend = build_backend(&AppConfig::default()).unwrap();
        assert_eq!(backend.name(), "local");
    }
}
