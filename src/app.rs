//! アプリケーション全体の状態
//!
//! UI層はこの構造体を通してデータセット・学習・推論を操作し、
//! ウィザードの現在ステップもここで明示的に保持する。

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::dataset::{lock_store, DatasetStore, SharedDatasetStore};
use crate::error::{CoreError, CoreResult, NotReadyReason};
use crate::ml::{
    build_backend, ClassificationBackend, InferenceEngine, TrainingOrchestrator, TrainingOutcome,
    TrainingRun, TrainingState,
};
use crate::model::AppConfig;
use crate::types::{
    AlgorithmVariant, AppStep, CategoryId, ClassCategory, Metrics, PredictionResult, Sample,
    SampleId,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 画面表示用の要約
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppSummary {
    pub step: AppStep,
    pub categories: usize,
    pub total_samples: usize,
    pub trainable: bool,
    /// 学習できない理由（学習可能なら説明文）
    pub readiness: String,
    pub training: TrainingState,
    pub metrics: Option<Metrics>,
    pub history_len: usize,
}

pub struct AppState {
    config: AppConfig,
    store: SharedDatasetStore,
    orchestrator: TrainingOrchestrator,
    engine: InferenceEngine,
    step: Mutex<AppStep>,
    history: Mutex<VecDeque<PredictionResult>>,
}

impl AppState {
    /// 設定からバックエンドを構築し、"Class 1" / "Class 2" で始める
    pub fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        let backend = build_backend(&config)?;
        let store = DatasetStore::with_default_categories(config.dataset.clone());
        Ok(Self::with_store(config, backend, store))
    }

    pub fn with_store(
        config: AppConfig,
        backend: Arc<dyn ClassificationBackend>,
        store: DatasetStore,
    ) -> Self {
        let store = Arc::new(Mutex::new(store));
        let orchestrator = TrainingOrchestrator::new(backend, Arc::clone(&store));
        let engine = InferenceEngine::new(orchestrator.clone());
        Self {
            config,
            store,
            orchestrator,
            engine,
            step: Mutex::new(AppStep::default()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &SharedDatasetStore {
        &self.store
    }

    pub fn orchestrator(&self) -> &TrainingOrchestrator {
        &self.orchestrator
    }

    pub fn engine(&self) -> &InferenceEngine {
        &self.engine
    }

    // ---- ウィザード ----

    pub fn step(&self) -> AppStep {
        *lock(&self.step)
    }

    /// ステップを移動する。プレビューには学習済みモデルが必要。
    pub fn go_to(&self, step: AppStep) -> CoreResult<()> {
        if step == AppStep::Preview && self.orchestrator.current_model().is_none() {
            return Err(CoreError::NotReady(NotReadyReason::ModelRequired));
        }
        *lock(&self.step) = step;
        tracing::debug!("ステップ移動: {:?}", step);
        Ok(())
    }

    // ---- データセット ----

    pub fn categories(&self) -> Vec<ClassCategory> {
        lock_store(&self.store).categories().to_vec()
    }

    /// クラスを追加する。名前がなければ "Class {n}" を使う。
    pub fn add_category(&self, name: Option<&str>) -> ClassCategory {
        let mut store = lock_store(&self.store);
        match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => store.add_category(name),
            None => store.add_default_category(),
        }
    }

    pub fn rename_category(&self, id: &CategoryId, name: &str) -> CoreResult<()> {
        lock_store(&self.store).rename_category(id, name)
    }

    /// クラスを削除する。学習済みモデルが無効になれば `true`。
    pub fn remove_category(&self, id: &CategoryId) -> bool {
        lock_store(&self.store).remove_category(id);
        self.after_removal()
    }

    pub fn add_sample(&self, category_id: &CategoryId, image: Vec<u8>) -> CoreResult<Sample> {
        lock_store(&self.store).add_sample(category_id, image)
    }

    /// サンプルを削除する。学習済みモデルが無効になれば `Ok(true)`。
    pub fn remove_sample(&self, category_id: &CategoryId, sample_id: &SampleId) -> CoreResult<bool> {
        lock_store(&self.store).remove_sample(category_id, sample_id)?;
        Ok(self.after_removal())
    }

    fn after_removal(&self) -> bool {
        let reset = self.orchestrator.revalidate();
        if reset {
            let mut step = lock(&self.step);
            if *step == AppStep::Preview {
                *step = AppStep::Train;
            }
        }
        reset
    }

    // ---- 学習 ----

    /// 学習を開始して結果を待たずに返す
    pub fn start_training(&self, variant: AlgorithmVariant) -> CoreResult<TrainingRun> {
        let run = self.orchestrator.start_training(variant)?;
        *lock(&self.step) = AppStep::Train;
        Ok(run)
    }

    /// 学習して完了を待つ。完了したらプレビューへ進む。
    pub async fn train(&self, variant: AlgorithmVariant) -> CoreResult<TrainingOutcome> {
        let outcome = self.start_training(variant)?.wait().await;
        if let TrainingOutcome::Completed(_) = outcome {
            if self.orchestrator.current_model().is_some() {
                *lock(&self.step) = AppStep::Preview;
            }
        }
        Ok(outcome)
    }

    pub fn cancel_training(&self) -> bool {
        self.orchestrator.cancel_training()
    }

    // ---- 推論 ----

    /// 分類して、成功した結果を履歴に残す
    pub async fn classify(&self, image: &[u8]) -> CoreResult<PredictionResult> {
        let result = self.engine.classify(image).await?;
        let limit = self.config.history_limit;
        if limit > 0 {
            let mut history = lock(&self.history);
            history.push_front(result.clone());
            history.truncate(limit);
        }
        Ok(result)
    }

    /// 新しい順の推論履歴
    pub fn history(&self) -> Vec<PredictionResult> {
        lock(&self.history).iter().cloned().collect()
    }

    pub fn clear_history(&self) {
        lock(&self.history).clear();
    }

    pub fn summary(&self) -> AppSummary {
        let (categories, total_samples, readiness) = {
            let store = lock_store(&self.store);
            (store.len(), store.total_samples(), store.readiness())
        };
        AppSummary {
            step: self.step(),
            categories,
            total_samples,
            trainable: readiness.is_ready(),
            readiness: readiness.to_string(),
            training: self.orchestrator.state(),
            metrics: self.orchestrator.current_metrics(),
            history_len: lock(&self.history).len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::test_support::ScriptedBackend;
    use crate::ml::RawVerdict;
    use crate::model::DatasetSettings;

    fn app(history_limit: usize) -> (AppState, Arc<ScriptedBackend>, std::sync::mpsc::Sender<Result<f64, crate::ml::BackendError>>) {
        let (backend, script) = ScriptedBackend::new();
        let config = AppConfig {
            history_limit,
            ..AppConfig::default()
        };
        let store = DatasetStore::with_default_categories(DatasetSettings::default());
        (AppState::with_store(config, backend.clone(), store), backend, script)
    }

    fn fill(app: &AppState) {
        for category in app.categories() {
            app.add_sample(&category.id, vec![1u8]).unwrap();
        }
    }

    #[test]
    fn test_starts_on_collect_with_default_categories() {
        let (app, _, _) = app(10);
        assert_eq!(app.step(), AppStep::Collect);
        let summary = app.summary();
        assert_eq!(summary.categories, 2);
        assert!(!summary.trainable);
        assert_eq!(summary.training, TrainingState::Idle);
    }

    #[test]
    fn test_preview_requires_model() {
        let (app, _, _) = app(10);
        assert_eq!(
            app.go_to(AppStep::Preview),
            Err(CoreError::NotReady(NotReadyReason::ModelRequired))
        );
        app.go_to(AppStep::Train).unwrap();
        assert_eq!(app.step(), AppStep::Train);
    }

    #[test]
    fn test_add_category_default_name() {
        let (app, _, _) = app(10);
        assert_eq!(app.add_category(None).name, "Class 3");
        assert_eq!(app.add_category(Some("  ")).name, "Class 4");
        assert_eq!(app.add_category(Some("Dogs")).name, "Dogs");
    }

    #[tokio::test]
    async fn test_train_then_classify_records_history() {
        let (app, backend, script) = app(2);
        fill(&app);
        script.send(Ok(1.0)).unwrap();

        let outcome = app.train(AlgorithmVariant::LogisticRegression).await.unwrap();
        assert!(matches!(outcome, TrainingOutcome::Completed(_)));
        assert_eq!(app.step(), AppStep::Preview);

        backend.set_verdict(Ok(RawVerdict {
            predicted_class_id: Some("class_1".to_string()),
            confidence: Some(0.8),
            reasoning: Some("色".to_string()),
        }));
        for _ in 0..3 {
            app.classify(&[5]).await.unwrap();
        }
        assert_eq!(app.history().len(), 2);
        assert_eq!(app.summary().history_len, 2);

        app.clear_history();
        assert!(app.history().is_empty());
    }

    #[tokio::test]
    async fn test_failed_classification_is_not_recorded() {
        let (app, backend, script) = app(5);
        fill(&app);
        script.send(Ok(1.0)).unwrap();
        app.train(AlgorithmVariant::RandomForest).await.unwrap();

        backend.set_verdict(Ok(RawVerdict {
            predicted_class_id: Some("class_99".to_string()),
            confidence: Some(0.5),
            reasoning: None,
        }));
        assert!(app.classify(&[5]).await.is_err());
        assert!(app.history().is_empty());
    }

    #[tokio::test]
    async fn test_removing_trained_category_resets_preview() {
        let (app, _, script) = app(5);
        fill(&app);
        script.send(Ok(1.0)).unwrap();
        app.train(AlgorithmVariant::ConvolutionalNetwork).await.unwrap();
        assert_eq!(app.step(), AppStep::Preview);

        let extra = app.add_category(None);
        assert!(!app.remove_category(&extra.id));
        assert!(app.orchestrator().current_model().is_some());

        let first = app.categories()[0].id.clone();
        assert!(app.remove_category(&first));
        assert!(app.orchestrator().current_model().is_none());
        assert_eq!(app.step(), AppStep::Train);
        assert!(app.engine().classify(&[1]).await.is_err());
    }

    #[tokio::test]
    async fn test_training_untrainable_dataset_keeps_step() {
        let (app, _, _) = app(5);
        let err = app.train(AlgorithmVariant::LogisticRegression).await.unwrap_err();
        assert!(matches!(err, CoreError::NotReady(NotReadyReason::Dataset(_))));
        assert_eq!(app.step(), AppStep::Collect);
    }
}
