//! モデル学習のオーケストレーション
//!
//! 学習は常に1件のみ。開始時点のデータセットを固定して
//! バックエンドの `train` をブロッキングスレッドで実行する。
//! キャンセルや新しい学習で世代番号が進むと、古い結果は破棄される。

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::dataset::{lock_store, DatasetSnapshot, DatasetStore, SharedDatasetStore};
use crate::error::{CoreError, CoreResult, NotReadyReason, TrainingError, TrainingErrorKind};
use crate::ml::backend::{BackendError, BackendModel, CancelFlag, ClassificationBackend};
use crate::model::{ModelMetadata, TrainedModel};
use crate::types::{AlgorithmVariant, Metrics};

/// イベントチャネルの容量
const EVENT_CAPACITY: usize = 32;

/// 学習の状態
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TrainingState {
    Idle,
    Training {
        generation: u64,
        variant: AlgorithmVariant,
    },
    Trained,
    Failed(TrainingError),
}

impl TrainingState {
    pub fn is_training(&self) -> bool {
        matches!(self, TrainingState::Training { .. })
    }
}

/// 購読者へ通知する学習イベント
#[derive(Debug, Clone, PartialEq)]
pub enum TrainingEvent {
    Started {
        generation: u64,
        variant: AlgorithmVariant,
    },
    Completed {
        generation: u64,
        metrics: Metrics,
    },
    Failed {
        generation: u64,
        error: TrainingError,
    },
    Cancelled {
        generation: u64,
    },
    /// データセットの変更で学習済みモデルが無効になった
    ModelReset,
}

/// 学習1回分の結末
#[derive(Debug, Clone, PartialEq)]
pub enum TrainingOutcome {
    Completed(Metrics),
    Failed(TrainingError),
    /// キャンセル済み、新しい世代に追い越された、
    /// または学習中にデータセットが変更されて結果が使えない
    Discarded,
}

/// 実行中の学習
#[derive(Debug)]
pub struct TrainingRun {
    generation: u64,
    variant: AlgorithmVariant,
    handle: JoinHandle<TrainingOutcome>,
}

impl TrainingRun {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn variant(&self) -> AlgorithmVariant {
        self.variant
    }

    /// 学習の完了を待つ
    ///
    /// 待たずに破棄しても学習は継続し、結果は状態に反映される。
    pub async fn wait(self) -> TrainingOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => TrainingOutcome::Failed(TrainingError::new(
                TrainingErrorKind::Unknown,
                format!("学習タスクが異常終了しました: {}", e),
            )),
        }
    }
}

struct Lifecycle {
    state: TrainingState,
    generation: u64,
    cancel: Option<CancelFlag>,
    model: Option<Arc<TrainedModel>>,
    last_error: Option<TrainingError>,
}

struct Inner {
    backend: Arc<dyn ClassificationBackend>,
    store: SharedDatasetStore,
    lifecycle: Mutex<Lifecycle>,
    state_tx: watch::Sender<TrainingState>,
    events: broadcast::Sender<TrainingEvent>,
}

/// 学習オーケストレータ
///
/// クローンは同じ状態を共有する。
#[derive(Clone)]
pub struct TrainingOrchestrator {
    inner: Arc<Inner>,
}

impl TrainingOrchestrator {
    pub fn new(backend: Arc<dyn ClassificationBackend>, store: SharedDatasetStore) -> Self {
        let (state_tx, _) = watch::channel(TrainingState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                backend,
                store,
                lifecycle: Mutex::new(Lifecycle {
                    state: TrainingState::Idle,
                    generation: 0,
                    cancel: None,
                    model: None,
                    last_error: None,
                }),
                state_tx,
                events,
            }),
        }
    }

    pub fn backend(&self) -> &Arc<dyn ClassificationBackend> {
        &self.inner.backend
    }

    pub fn store(&self) -> &SharedDatasetStore {
        &self.inner.store
    }

    /// 学習を開始する
    ///
    /// データセットが学習条件を満たさない場合、または学習中の場合は
    /// `NotReady` を返し、状態は変化しない。tokioランタイム内から呼ぶこと。
    pub fn start_training(&self, variant: AlgorithmVariant) -> CoreResult<TrainingRun> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| CoreError::Unknown(format!("tokioランタイムがありません: {}", e)))?;

        let mut lifecycle = self.inner.lock_lifecycle();
        if lifecycle.state.is_training() {
            return Err(CoreError::NotReady(NotReadyReason::TrainingInProgress));
        }

        let snapshot = {
            let store = lock_store(&self.inner.store);
            let readiness = store.readiness();
            if !readiness.is_ready() {
                return Err(CoreError::NotReady(NotReadyReason::Dataset(readiness)));
            }
            store.snapshot()
        };

        lifecycle.generation += 1;
        let generation = lifecycle.generation;
        let cancel = CancelFlag::new();
        lifecycle.cancel = Some(cancel.clone());
        lifecycle.last_error = None;
        self.inner
            .set_state(&mut lifecycle, TrainingState::Training { generation, variant });
        drop(lifecycle);

        tracing::info!(
            "学習開始: 世代 {}, {} ({} クラス, {} 枚, バックエンド {})",
            generation,
            variant,
            snapshot.categories().len(),
            snapshot.total_samples(),
            self.inner.backend.name()
        );
        self.inner.emit(TrainingEvent::Started { generation, variant });

        let inner = Arc::clone(&self.inner);
        let handle = runtime.spawn(async move {
            let backend = Arc::clone(&inner.backend);
            let task_snapshot = snapshot.clone();
            let started = Instant::now();
            let result = tokio::task::spawn_blocking(move || {
                backend.train(&task_snapshot, variant, &cancel)
            })
            .await
            .unwrap_or_else(|e| Err(BackendError::Other(format!("学習スレッドエラー: {}", e))));
            inner.finish(generation, variant, snapshot, result, started.elapsed())
        });

        Ok(TrainingRun {
            generation,
            variant,
            handle,
        })
    }

    /// 実行中の学習をキャンセルする
    ///
    /// 学習中でなければ何もせず `false` を返す。
    /// バックエンドが後から結果を返しても破棄され、直前のモデルは残る。
    pub fn cancel_training(&self) -> bool {
        let mut lifecycle = self.inner.lock_lifecycle();
        let TrainingState::Training { generation, .. } = lifecycle.state else {
            return false;
        };

        if let Some(cancel) = lifecycle.cancel.take() {
            cancel.cancel();
        }
        lifecycle.generation += 1;
        self.inner.set_state(&mut lifecycle, TrainingState::Idle);
        drop(lifecycle);

        tracing::info!("学習をキャンセルしました: 世代 {}", generation);
        self.inner.emit(TrainingEvent::Cancelled { generation });
        true
    }

    /// 現在の学習済みモデル
    pub fn current_model(&self) -> Option<Arc<TrainedModel>> {
        self.inner.lock_lifecycle().model.clone()
    }

    pub fn current_metrics(&self) -> Option<Metrics> {
        self.current_model().map(|m| m.metrics().clone())
    }

    pub fn state(&self) -> TrainingState {
        self.inner.lock_lifecycle().state.clone()
    }

    pub fn is_training(&self) -> bool {
        self.state().is_training()
    }

    /// 直近の学習失敗
    pub fn last_error(&self) -> Option<TrainingError> {
        self.inner.lock_lifecycle().last_error.clone()
    }

    /// 状態の変化を購読する
    pub fn subscribe(&self) -> watch::Receiver<TrainingState> {
        self.inner.state_tx.subscribe()
    }

    /// 学習イベントを購読する
    pub fn events(&self) -> broadcast::Receiver<TrainingEvent> {
        self.inner.events.subscribe()
    }

    /// データセットの変更後に学習済みモデルを検証する
    ///
    /// データセットが学習不可になったか、モデルが予測しうるクラスが
    /// 削除されていればモデルを破棄して `true` を返す。
    pub fn revalidate(&self) -> bool {
        let mut lifecycle = self.inner.lock_lifecycle();
        let Some(model) = lifecycle.model.as_ref() else {
            return false;
        };
        let reason = {
            let store = lock_store(&self.inner.store);
            stale_model_reason(&store, model.snapshot())
        };
        let Some(reason) = reason else {
            return false;
        };

        lifecycle.model = None;
        if lifecycle.state == TrainingState::Trained {
            self.inner.set_state(&mut lifecycle, TrainingState::Idle);
        }
        drop(lifecycle);

        tracing::info!("モデルを破棄しました: {}", reason);
        self.inner.emit(TrainingEvent::ModelReset);
        true
    }
}

impl Inner {
    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, lifecycle: &mut Lifecycle, state: TrainingState) {
        lifecycle.state = state.clone();
        self.state_tx.send_replace(state);
    }

    fn emit(&self, event: TrainingEvent) {
        // 購読者がいなければ捨てる
        let _ = self.events.send(event);
    }

    /// バックエンドの結果を反映する
    fn finish(
        &self,
        generation: u64,
        variant: AlgorithmVariant,
        snapshot: DatasetSnapshot,
        result: Result<BackendModel, BackendError>,
        elapsed: Duration,
    ) -> TrainingOutcome {
        let mut lifecycle = self.lock_lifecycle();
        let current = matches!(
            lifecycle.state,
            TrainingState::Training { generation: g, .. } if g == generation
        ) && lifecycle.generation == generation;
        if !current {
            tracing::debug!(
                "古い学習結果を破棄: 世代 {} (現在 {})",
                generation,
                lifecycle.generation
            );
            return TrainingOutcome::Discarded;
        }
        lifecycle.cancel = None;

        match result {
            Ok(output) => {
                // 学習中にクラスが削除されていれば結果は使えない
                let (stale, previous_stale) = {
                    let store = lock_store(&self.store);
                    let previous_stale = lifecycle
                        .model
                        .as_ref()
                        .is_some_and(|m| stale_model_reason(&store, m.snapshot()).is_some());
                    (stale_model_reason(&store, &snapshot), previous_stale)
                };
                if let Some(reason) = stale {
                    if previous_stale {
                        lifecycle.model = None;
                    }
                    self.set_state(&mut lifecycle, TrainingState::Idle);
                    drop(lifecycle);

                    tracing::info!(
                        "学習中にデータセットが変更されたため結果を破棄: 世代 {}, {}",
                        generation,
                        reason
                    );
                    if previous_stale {
                        self.emit(TrainingEvent::ModelReset);
                    }
                    return TrainingOutcome::Discarded;
                }

                let metrics = Metrics {
                    accuracy: clamp_accuracy(output.accuracy),
                    total_samples: snapshot.total_samples(),
                    last_training_duration: elapsed,
                };
                let metadata = ModelMetadata::new(variant, &snapshot, self.backend.name(), generation);
                let model = TrainedModel::new(metadata, snapshot, metrics.clone(), output.state);
                lifecycle.model = Some(Arc::new(model));
                self.set_state(&mut lifecycle, TrainingState::Trained);
                drop(lifecycle);

                tracing::info!(
                    "学習完了: 世代 {}, 精度 {:.1}%, {} 枚, {:.2}秒",
                    generation,
                    metrics.accuracy * 100.0,
                    metrics.total_samples,
                    elapsed.as_secs_f64()
                );
                self.emit(TrainingEvent::Completed {
                    generation,
                    metrics: metrics.clone(),
                });
                TrainingOutcome::Completed(metrics)
            }
            Err(err) => {
                let error = training_error(err);
                lifecycle.last_error = Some(error.clone());
                // 次の start_training まで Failed のまま残す
                self.set_state(&mut lifecycle, TrainingState::Failed(error.clone()));
                drop(lifecycle);

                tracing::warn!("学習失敗: 世代 {}, {}", generation, error);
                self.emit(TrainingEvent::Failed {
                    generation,
                    error: error.clone(),
                });
                TrainingOutcome::Failed(error)
            }
        }
    }
}

/// モデルが現在のデータセットでは使えない理由
fn stale_model_reason(store: &DatasetStore, snapshot: &DatasetSnapshot) -> Option<String> {
    if let Some(id) = snapshot.category_ids().find(|id| store.category(id).is_none()) {
        return Some(format!("クラス {} が削除されました", id));
    }
    let readiness = store.readiness();
    if !readiness.is_ready() {
        return Some(readiness.to_string());
    }
    None
}

fn clamp_accuracy(accuracy: f64) -> f64 {
    if accuracy.is_nan() {
        tracing::warn!("バックエンドの精度がNaNでした。0として扱います");
        return 0.0;
    }
    if !(0.0..=1.0).contains(&accuracy) {
        tracing::warn!("バックエンドの精度 {} が範囲外のため丸めます", accuracy);
    }
    accuracy.clamp(0.0, 1.0)
}

fn training_error(err: BackendError) -> TrainingError {
    let kind = match &err {
        BackendError::Unavailable(_) => TrainingErrorKind::BackendUnavailable,
        BackendError::InvalidDataset(_) => TrainingErrorKind::InvalidDataset,
        _ => TrainingErrorKind::Unknown,
    };
    TrainingError::new(kind, err.to_string())
}
