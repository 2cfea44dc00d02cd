//! 生成モデルAPIを使うリモート分類バックエンド
//!
//! 学習では参照画像を検証・エンコードして保持し、推論のたびに
//! 参照画像と対象画像をまとめて送信してJSONの判定を受け取ります。

use anyhow::Context;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::dataset::DatasetSnapshot;
use crate::ml::backend::{BackendError, BackendModel, CancelFlag, ClassificationBackend, RawVerdict};
use crate::model::{RemoteBackendSettings, TrainedModel};
use crate::types::AlgorithmVariant;

/// base64エンコード済み画像
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineImage {
    pub mime_type: String,
    pub data: String,
}

impl InlineImage {
    /// 画像として解釈できるか検証してからエンコードする
    pub fn encode(bytes: &[u8]) -> Result<Self, String> {
        let format = image::guess_format(bytes).map_err(|e| e.to_string())?;
        image::load_from_memory_with_format(bytes, format).map_err(|e| e.to_string())?;
        Ok(Self {
            mime_type: format.to_mime_type().to_string(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        })
    }

    fn to_part(&self) -> Value {
        json!({ "inlineData": { "mimeType": self.mime_type, "data": self.data } })
    }
}

/// クラスごとの参照画像
#[derive(Debug, Clone)]
pub struct ReferenceClass {
    pub id: String,
    pub name: String,
    pub images: Vec<InlineImage>,
}

/// リモートモデルの状態（参照セット）
#[derive(Debug, Clone)]
pub struct RemoteModelState {
    pub variant: AlgorithmVariant,
    pub classes: Vec<ReferenceClass>,
}

/// リモートバックエンド
pub struct RemoteBackend {
    agent: ureq::Agent,
    settings: RemoteBackendSettings,
    api_key: String,
}

impl RemoteBackend {
    /// 環境変数からAPIキーを読み込んで構築する
    pub fn from_settings(settings: &RemoteBackendSettings) -> anyhow::Result<Self> {
        let api_key = std::env::var(&settings.api_key_env)
            .with_context(|| format!("APIキーが設定されていません: {}", settings.api_key_env))?;
        Ok(Self::with_api_key(settings.clone(), api_key))
    }

    pub fn with_api_key(settings: RemoteBackendSettings, api_key: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(settings.timeout_secs.max(1)))
            .build();
        Self {
            agent,
            settings,
            api_key: api_key.into(),
        }
    }

    fn url(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.settings.endpoint.trim_end_matches('/'),
            self.settings.model
        )
    }

    fn post(&self, body: &Value) -> Result<GenerateResponse, BackendError> {
        let response = self
            .agent
            .post(&self.url())
            .set("x-goog-api-key", &self.api_key)
            .send_json(body.clone())
            .map_err(map_transport_error)?;

        response
            .into_json::<GenerateResponse>()
            .map_err(|e| BackendError::Malformed(e.to_string()))
    }
}

fn map_transport_error(err: ureq::Error) -> BackendError {
    match err {
        ureq::Error::Status(code, response) if code == 429 || code >= 500 => {
            BackendError::Unavailable(format!("HTTP {} ({})", code, response.status_text()))
        }
        ureq::Error::Status(code @ (401 | 403), _) => BackendError::Unavailable(format!(
            "HTTP {}: APIキーが拒否されました。設定と環境変数を確認してください",
            code
        )),
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            BackendError::Other(format!("HTTP {}: {}", code, body))
        }
        ureq::Error::Transport(transport) => BackendError::Unavailable(transport.to_string()),
    }
}

/// generateContent のリクエスト本文を組み立てる
pub fn build_request(state: &RemoteModelState, query: &InlineImage) -> Value {
    let mut parts = vec![json!({
        "text": format!(
            "You are an image classifier emulating a {} model trained on the labelled examples below.",
            state.variant
        )
    })];

    for class in &state.classes {
        parts.push(json!({
            "text": format!("Examples for class '{}' (id: {}):", class.name, class.id)
        }));
        parts.extend(class.images.iter().map(InlineImage::to_part));
    }

    let ids: Vec<&str> = state.classes.iter().map(|c| c.id.as_str()).collect();
    parts.push(json!({ "text": "Classify this image:" }));
    parts.push(query.to_part());
    parts.push(json!({
        "text": format!(
            "Reply with JSON only: {{\"predictedClassId\": one of [{}], \"confidence\": number between 0 and 1, \"reasoning\": short explanation}}.",
            ids.join(", ")
        )
    }));

    json!({
        "contents": [{ "role": "user", "parts": parts }],
        "generationConfig": { "responseMimeType": "application/json", "temperature": 0.2 }
    })
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

impl GenerateResponse {
    fn first_text(&self) -> Option<&str> {
        self.candidates
            .iter()
            .filter_map(|c| c.content.as_ref())
            .flat_map(|c| c.parts.iter())
            .find_map(|p| p.text.as_deref())
    }
}

/// モデルが返したテキストを判定として解釈する（```json フェンスも許容）
pub fn parse_verdict_text(text: &str) -> Result<RawVerdict, BackendError> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end().trim_end_matches("```"))
        .unwrap_or(trimmed)
        .trim();
    serde_json::from_str(body).map_err(|e| BackendError::Malformed(format!("{}: {}", e, body)))
}

impl ClassificationBackend for RemoteBackend {
    fn name(&self) -> &str {
        "remote"
    }

    fn train(
        &self,
        snapshot: &DatasetSnapshot,
        variant: AlgorithmVariant,
        cancel: &CancelFlag,
    ) -> Result<BackendModel, BackendError> {
        let state = prepare_reference_set(snapshot, variant, self.settings.max_examples_per_class, cancel)?;
        tracing::debug!(
            "参照セットを準備しました: {} クラス, モデル {}",
            state.classes.len(),
            self.settings.model
        );
        // 参照セットをそのまま使うため、学習データ上の精度は1.0とする
        Ok(BackendModel {
            state: Arc::new(state),
            accuracy: 1.0,
        })
    }

    fn infer(&self, model: &TrainedModel, image: &[u8]) -> Result<RawVerdict, BackendError> {
        let state = model
            .backend_state::<RemoteModelState>()
            .ok_or_else(|| BackendError::Other("このモデルはリモートバックエンドで学習されていません".to_string()))?;
        let query = InlineImage::encode(image).map_err(BackendError::InvalidInput)?;

        let response = self.post(&build_request(state, &query))?;
        let text = response
            .first_text()
            .ok_or_else(|| BackendError::Malformed("応答にテキストがありません".to_string()))?;
        parse_verdict_text(text)
    }
}

/// 全サンプルを検証し、クラスごとに最大 `max_per_class` 枚を参照用にエンコードする
pub fn prepare_reference_set(
    snapshot: &DatasetSnapshot,
    variant: AlgorithmVariant,
    max_per_class: usize,
    cancel: &CancelFlag,
) -> Result<RemoteModelState, BackendError> {
    let mut classes = Vec::with_capacity(snapshot.categories().len());
    for category in snapshot.categories() {
        let mut images = Vec::new();
        for sample in &category.samples {
            if cancel.is_cancelled() {
                return Err(BackendError::Cancelled);
            }
            let encoded = InlineImage::encode(&sample.image).map_err(|e| {
                BackendError::InvalidDataset(format!(
                    "クラス '{}' の画像 '{}' を読み込めません: {}",
                    category.name, sample.id, e
                ))
            })?;
            if images.len() < max_per_class.max(1) {
                images.push(encoded);
            }
        }
        classes.push(ReferenceClass {
            id: category.id.to_string(),
            name: category.name.clone(),
            images,
        });
    }
    Ok(RemoteModelState { variant, classes })
}
