//! ディレクトリのデータセットで学習し、画像を分類するコマンドライン

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;

use teachable_lite_lib::ml::build_backend;
use teachable_lite_lib::model::log_metadata_info;
use teachable_lite_lib::{
    logging, AlgorithmVariant, AppConfig, AppState, BackendKind, DatasetStore, PredictionResult,
    TrainingOutcome,
};

#[derive(Parser, Debug)]
#[command(name = "teachable_lite", version, about = "画像分類モデルを学習して推論する")]
struct Cli {
    /// データセットのディレクトリ（サブディレクトリ名がクラス名）
    data_dir: PathBuf,

    /// 分類する画像ファイル
    #[arg(required = true)]
    queries: Vec<PathBuf>,

    /// アルゴリズム (logistic_regression / random_forest / cnn)
    #[arg(long)]
    variant: Option<AlgorithmVariant>,

    /// 設定ファイル（省略時は config.json があれば使用）
    #[arg(long)]
    config: Option<PathBuf>,

    /// バックエンド (local / remote)
    #[arg(long, value_parser = parse_backend)]
    backend: Option<BackendKind>,
}

fn parse_backend(value: &str) -> Result<BackendKind, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "local" => Ok(BackendKind::Local),
        "remote" => Ok(BackendKind::Remote),
        other => Err(format!("不明なバックエンド: {}", other)),
    }
}

/// 1画像分の出力
#[derive(Debug, Serialize)]
struct QueryReport {
    file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    prediction: Option<PredictionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("設定ファイルを読み込めません: {}", path.display()))?,
        None => AppConfig::load_or_default(),
    };
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }

    logging::init(&config.log_filter)?;
    config.log_summary();

    let store = DatasetStore::import_directory(&cli.data_dir, config.dataset.clone())
        .with_context(|| format!("データセットを読み込めません: {}", cli.data_dir.display()))?;
    let backend = build_backend(&config)?;
    let variant: AlgorithmVariant = cli.variant.unwrap_or(config.default_variant);
    let app = AppState::with_store(config, backend, store);

    match app.train(variant).await? {
        TrainingOutcome::Completed(_) => {
            if let Some(model) = app.orchestrator().current_model() {
                log_metadata_info(&model);
            }
        }
        TrainingOutcome::Failed(error) => return Err(error.into()),
        TrainingOutcome::Discarded => anyhow::bail!("学習結果が破棄されました"),
    }

    let mut reports = Vec::with_capacity(cli.queries.len());
    for path in &cli.queries {
        let file = path.display().to_string();
        let report = match std::fs::read(path) {
            Ok(bytes) => match app.classify(&bytes).await {
                Ok(prediction) => QueryReport {
                    file,
                    prediction: Some(prediction),
                    error: None,
                },
                Err(e) => {
                    tracing::warn!("分類に失敗しました {}: {}", path.display(), e);
                    QueryReport {
                        file,
                        prediction: None,
                        error: Some(e.to_string()),
                    }
                }
            },
            Err(e) => QueryReport {
                file,
                prediction: None,
                error: Some(format!("読み込みエラー: {}", e)),
            },
        };
        reports.push(report);
    }

    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}
