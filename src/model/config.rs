//! アプリケーション設定管理モジュール
//!
//! バックエンドの種類やデータセット条件などをJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::types::AlgorithmVariant;

/// 分類バックエンドの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// プロセス内で計算するローカルバックエンド
    Local,
    /// 生成モデルAPIを呼び出すリモートバックエンド
    Remote,
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::Local
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Local => write!(f, "Local"),
            BackendKind::Remote => write!(f, "Remote (generative API)"),
        }
    }
}

/// 学習可能と判定するデータセット条件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetSettings {
    /// 最低クラス数（2未満は2として扱う）
    pub min_categories: usize,
    /// 最低サンプル総数
    pub min_total_samples: usize,
}

impl Default for DatasetSettings {
    fn default() -> Self {
        Self {
            min_categories: 2,
            min_total_samples: 2,
        }
    }
}

/// ローカルバックエンド設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalBackendSettings {
    /// 特徴抽出時のリサイズ後の一辺（ピクセル）
    pub feature_size: u32,
    /// 近傍投票に使う近傍数
    pub neighbours: usize,
    /// softmaxの温度
    pub temperature: f64,
}

impl Default for LocalBackendSettings {
    fn default() -> Self {
        Self {
            feature_size: 16,
            neighbours: 3,
            temperature: 0.5,
        }
    }
}

/// リモートバックエンド設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteBackendSettings {
    /// APIのベースURL
    pub endpoint: String,
    /// モデル名
    pub model: String,
    /// APIキーを読み込む環境変数名
    pub api_key_env: String,
    /// 1リクエストのタイムアウト（秒）
    pub timeout_secs: u64,
    /// 参照用に送信するクラスごとの最大画像数
    pub max_examples_per_class: usize,
}

impl Default for RemoteBackendSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            model: "gemini-2.5-flash".to_string(),
            api_key_env: "GEMINI_API_KEY".to_string(),
            timeout_secs: 60,
            max_examples_per_class: 5,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// 分類バックエンド
    pub backend: BackendKind,
    /// 既定のアルゴリズム
    pub default_variant: AlgorithmVariant,
    /// データセット条件
    pub dataset: DatasetSettings,
    /// ローカルバックエンド設定
    pub local: LocalBackendSettings,
    /// リモートバックエンド設定
    pub remote: RemoteBackendSettings,
    /// 保持する推論履歴の最大件数
    pub history_limit: usize,
    /// ログフィルタ（RUST_LOGが優先）
    pub log_filter: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            default_variant: AlgorithmVariant::default(),
            dataset: DatasetSettings::default(),
            local: LocalBackendSettings::default(),
            remote: RemoteBackendSettings::default(),
            history_limit: 50,
            log_filter: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 指定パスから設定を読み込む、存在しない場合はデフォルト設定を返す
    pub fn load_or_default_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    tracing::info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            tracing::info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// デフォルトパスから設定を読み込む
    pub fn load_or_default() -> Self {
        Self::load_or_default_from(Self::default_path())
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 設定情報をログに出力
    pub fn log_summary(&self) {
        tracing::info!("バックエンド: {}", self.backend);
        tracing::info!("既定アルゴリズム: {}", self.default_variant);
        tracing::info!(
            "学習条件: クラス {} 個以上, サンプル {} 枚以上",
            self.dataset.min_categories,
            self.dataset.min_total_samples
        );
        if self.backend == BackendKind::Remote {
            tracing::info!("リモートモデル: {} ({})", self.remote.model, self.remote.endpoint);
        }
    }
}
