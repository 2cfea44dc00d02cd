use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// カテゴリID（データセット内で一意）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CategoryId(String);

impl CategoryId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CategoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// サンプルID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SampleId(String);

impl SampleId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SampleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 学習用画像サンプル
///
/// 作成後は不変。画像バイト列は共有されるため、スナップショットの複製は安価。
#[derive(Debug, Clone)]
pub struct Sample {
    pub id: SampleId,
    pub image: Arc<[u8]>,
}

impl Sample {
    pub fn new(id: SampleId, image: impl Into<Arc<[u8]>>) -> Self {
        Self {
            id,
            image: image.into(),
        }
    }
}

/// ユーザー定義のクラスとそのサンプル
#[derive(Debug, Clone)]
pub struct ClassCategory {
    pub id: CategoryId,
    /// 表示名（重複可）
    pub name: String,
    /// 追加順を保持
    pub samples: Vec<Sample>,
}

impl ClassCategory {
    pub fn new(id: CategoryId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            samples: Vec::new(),
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

/// 分類アルゴリズムの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmVariant {
    LogisticRegression,
    RandomForest,
    ConvolutionalNetwork,
}

impl AlgorithmVariant {
    pub const ALL: [AlgorithmVariant; 3] = [
        AlgorithmVariant::LogisticRegression,
        AlgorithmVariant::RandomForest,
        AlgorithmVariant::ConvolutionalNetwork,
    ];
}

impl Default for AlgorithmVariant {
    fn default() -> Self {
        AlgorithmVariant::LogisticRegression
    }
}

impl fmt::Display for AlgorithmVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlgorithmVariant::LogisticRegression => write!(f, "Logistic Regression"),
            AlgorithmVariant::RandomForest => write!(f, "Random Forest"),
            AlgorithmVariant::ConvolutionalNetwork => write!(f, "CNN (TensorFlow/Keras)"),
        }
    }
}

impl FromStr for AlgorithmVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "logistic_regression" | "logreg" | "lr" => Ok(AlgorithmVariant::LogisticRegression),
            "random_forest" | "rf" => Ok(AlgorithmVariant::RandomForest),
            "convolutional_network" | "cnn" => Ok(AlgorithmVariant::ConvolutionalNetwork),
            other => Err(format!("不明なアルゴリズム: {}", other)),
        }
    }
}

/// 学習結果の指標
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// 精度 [0, 1]
    pub accuracy: f64,
    pub total_samples: usize,
    pub last_training_duration: Duration,
}

/// 検証済みの推論結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub algorithm_variant: AlgorithmVariant,
    pub predicted_class_id: CategoryId,
    pub predicted_class_name: String,
    /// 信頼度 [0, 1]
    pub confidence: f64,
    pub reasoning: String,
    pub timestamp: DateTime<Utc>,
}

/// ウィザードの現在ステップ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStep {
    Collect,
    Train,
    Preview,
}

impl Default for AppStep {
    fn default() -> Self {
        AppStep::Collect
    }
}
