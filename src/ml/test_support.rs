//! テスト用の台本付きバックエンド

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use crate::dataset::{DatasetSnapshot, DatasetStore, SharedDatasetStore};
use crate::ml::backend::{BackendError, BackendModel, CancelFlag, ClassificationBackend, RawVerdict};
use crate::model::TrainedModel;
use crate::types::AlgorithmVariant;

/// 学習呼び出しは送られてきた応答を受け取るまでブロックする
pub struct ScriptedBackend {
    replies: Mutex<Receiver<Result<f64, BackendError>>>,
    verdict: Mutex<Result<RawVerdict, BackendError>>,
    pub train_calls: AtomicUsize,
    pub infer_calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> (Arc<Self>, Sender<Result<f64, BackendError>>) {
        let (tx, rx) = mpsc::channel();
        let backend = Arc::new(Self {
            replies: Mutex::new(rx),
            verdict: Mutex::new(Ok(RawVerdict::default())),
            train_calls: AtomicUsize::new(0),
            infer_calls: AtomicUsize::new(0),
        });
        (backend, tx)
    }

    pub fn set_verdict(&self, verdict: Result<RawVerdict, BackendError>) {
        *self.verdict.lock().unwrap() = verdict;
    }
}

impl ClassificationBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn train(
        &self,
        _snapshot: &DatasetSnapshot,
        _variant: AlgorithmVariant,
        _cancel: &CancelFlag,
    ) -> Result<BackendModel, BackendError> {
        self.train_calls.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .recv()
            .map_err(|_| BackendError::Unavailable("script closed".to_string()))?;
        reply.map(|accuracy| BackendModel {
            state: Arc::new(()),
            accuracy,
        })
    }

    fn infer(&self, _model: &TrainedModel, _image: &[u8]) -> Result<RawVerdict, BackendError> {
        self.infer_calls.fetch_add(1, Ordering::SeqCst);
        self.verdict.lock().unwrap().clone()
    }
}

/// 2クラス・各1サンプルの共有データセット
pub fn two_class_store() -> SharedDatasetStore {
    let mut store = DatasetStore::default();
    let a = store.add_category("Class 1");
    let b = store.add_category("Class 2");
    store.add_sample(&a.id, vec![1u8]).unwrap();
    store.add_sample(&b.id, vec![2u8]).unwrap();
    Arc::new(Mutex::new(store))
}
