//! コアのエラー型
//!
//! UI層へはすべて型付きで返す。正常系の制御フローには使わない。

use serde::Serialize;
use std::fmt;

use crate::dataset::Readiness;

/// 見つからなかった対象
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Category,
    Sample,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Category => write!(f, "category"),
            EntityKind::Sample => write!(f, "sample"),
        }
    }
}

/// 要求を受け付けられない理由
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum NotReadyReason {
    /// データセットが学習条件を満たしていない
    Dataset(Readiness),
    /// 既に学習中
    TrainingInProgress,
    /// プレビューには学習済みモデルが必要
    ModelRequired,
}

impl fmt::Display for NotReadyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotReadyReason::Dataset(readiness) => write!(f, "{}", readiness),
            NotReadyReason::TrainingInProgress => write!(f, "学習が既に実行中です"),
            NotReadyReason::ModelRequired => write!(f, "先にモデルを学習してください"),
        }
    }
}

/// 学習失敗の分類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrainingErrorKind {
    BackendUnavailable,
    InvalidDataset,
    Unknown,
}

/// バックエンドから報告された学習失敗
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("学習に失敗しました ({kind:?}): {message}")]
pub struct TrainingError {
    pub kind: TrainingErrorKind,
    pub message: String,
}

impl TrainingError {
    pub fn new(kind: TrainingErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// コア全体のエラー
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    #[error("{kind} が見つかりません: {id}")]
    NotFound { kind: EntityKind, id: String },

    #[error("準備ができていません: {0}")]
    NotReady(NotReadyReason),

    #[error("バックエンドに接続できません: {0}")]
    BackendUnavailable(String),

    #[error("データセットが不正です: {0}")]
    InvalidDataset(String),

    #[error("バックエンドの応答が不正です: {0}")]
    InvalidBackendResponse(String),

    #[error("学習済みモデルがありません")]
    NoTrainedModel,

    #[error("画像を処理できません: {0}")]
    InvalidImage(String),

    #[error("不明なエラー: {0}")]
    Unknown(String),
}

impl CoreError {
    pub fn category_not_found(id: impl fmt::Display) -> Self {
        CoreError::NotFound {
            kind: EntityKind::Category,
            id: id.to_string(),
        }
    }

    pub fn sample_not_found(id: impl fmt::Display) -> Self {
        CoreError::NotFound {
            kind: EntityKind::Sample,
            id: id.to_string(),
        }
    }
}

impl From<TrainingError> for CoreError {
    fn from(err: TrainingError) -> Self {
        match err.kind {
            TrainingErrorKind::BackendUnavailable => CoreError::BackendUnavailable(err.message),
            TrainingErrorKind::InvalidDataset => CoreError::InvalidDataset(err.message),
            TrainingErrorKind::Unknown => CoreError::Unknown(err.message),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_training_error_maps_to_core_taxonomy() {
        let err = TrainingError::new(TrainingErrorKind::InvalidDataset, "壊れた画像");
        assert_eq!(
            CoreError::from(err),
            CoreError::InvalidDataset("壊れた画像".to_string())
        );

        let err = TrainingError::new(TrainingErrorKind::BackendUnavailable, "timeout");
        assert!(matches!(CoreError::from(err), CoreError::BackendUnavailable(_)));
    }

    #[test]
    fn test_not_found_helpers() {
        let err = CoreError::category_not_found("class_9");
        assert_eq!(
            err,
            CoreError::NotFound {
                kind: EntityKind::Category,
                id: "class_9".to_string()
            }
        );
    }
}
