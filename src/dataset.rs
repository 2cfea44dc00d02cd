//! データセット（クラスとラベル付きサンプル）の管理

use anyhow::Result;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{CoreError, CoreResult};
use crate::model::config::DatasetSettings;
use crate::types::{CategoryId, ClassCategory, Sample, SampleId};

/// 学習可否の判定結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Readiness {
    Ready,
    TooFewCategories { found: usize, required: usize },
    EmptyCategory { id: CategoryId, name: String },
    TooFewSamples { found: usize, required: usize },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Readiness::Ready => write!(f, "学習可能です"),
            Readiness::TooFewCategories { found, required } => {
                write!(f, "クラスが不足しています: {} 個 (最低 {} 個)", found, required)
            }
            Readiness::EmptyCategory { id, name } => {
                write!(f, "クラス '{}' ({}) に画像が1枚もありません", name, id)
            }
            Readiness::TooFewSamples { found, required } => {
                write!(f, "サンプルが不足しています: {} 枚 (最低 {} 枚)", found, required)
            }
        }
    }
}

/// 学習開始時点で固定したデータセット
///
/// 以降のデータセット編集は影響しない。
#[derive(Debug, Clone)]
pub struct DatasetSnapshot {
    categories: Vec<ClassCategory>,
}

impl DatasetSnapshot {
    pub fn new(categories: Vec<ClassCategory>) -> Self {
        Self { categories }
    }

    pub fn categories(&self) -> &[ClassCategory] {
        &self.categories
    }

    pub fn category(&self, id: &CategoryId) -> Option<&ClassCategory> {
        self.categories.iter().find(|c| &c.id == id)
    }

    pub fn contains(&self, id: &CategoryId) -> bool {
        self.category(id).is_some()
    }

    pub fn category_ids(&self) -> impl Iterator<Item = &CategoryId> {
        self.categories.iter().map(|c| &c.id)
    }

    pub fn total_samples(&self) -> usize {
        self.categories.iter().map(|c| c.samples.len()).sum()
    }

    /// (クラスインデックス, サンプル) を追加順に列挙
    pub fn labelled_samples(&self) -> impl Iterator<Item = (usize, &Sample)> {
        self.categories
            .iter()
            .enumerate()
            .flat_map(|(idx, c)| c.samples.iter().map(move |s| (idx, s)))
    }
}

/// クラスとサンプルの所有者
///
/// すべての変更は同期的で、即座に反映される。
#[derive(Debug, Clone)]
pub struct DatasetStore {
    categories: Vec<ClassCategory>,
    settings: DatasetSettings,
    next_category: u64,
    next_sample: u64,
}

impl Default for DatasetStore {
    fn default() -> Self {
        Self::new(DatasetSettings::default())
    }
}

impl DatasetStore {
    pub fn new(settings: DatasetSettings) -> Self {
        Self {
            categories: Vec::new(),
            settings,
            next_category: 0,
            next_sample: 0,
        }
    }

    /// 初期画面と同じく "Class 1" / "Class 2" を用意する
    pub fn with_default_categories(settings: DatasetSettings) -> Self {
        let mut store = Self::new(settings);
        store.add_default_category();
        store.add_default_category();
        store
    }

    /// ディレクトリからデータセットを構築する
    ///
    /// サブディレクトリ名をクラス名とし、png/jpg/jpeg をサンプルとして読み込む。
    pub fn import_directory(data_dir: &Path, settings: DatasetSettings) -> Result<Self> {
        let mut class_dirs = Vec::new();
        for entry in std::fs::read_dir(data_dir)? {
            let path = entry?.path();
            if path.is_dir() {
                class_dirs.push(path);
            }
        }
        class_dirs.sort();

        let mut store = Self::new(settings);
        for class_dir in class_dirs {
            let class_name = class_dir
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| anyhow::anyhow!("Invalid directory name: {}", class_dir.display()))?
                .to_string();

            let mut image_paths = Vec::new();
            for entry in std::fs::read_dir(&class_dir)? {
                let path = entry?.path();
                if path.is_file() && is_image_file(&path) {
                    image_paths.push(path);
                }
            }
            image_paths.sort();

            let category_id = store.add_category(class_name.clone()).id;
            for path in &image_paths {
                let bytes = std::fs::read(path)?;
                store.add_sample(&category_id, bytes)?;
            }
            tracing::info!("  クラス '{}': {} 枚", class_name, image_paths.len());
        }

        if store.total_samples() == 0 {
            anyhow::bail!("No training samples found in {}", data_dir.display());
        }

        tracing::info!(
            "{} クラスから {} 枚のサンプルを読み込みました",
            store.len(),
            store.total_samples()
        );
        Ok(store)
    }

    pub fn settings(&self) -> &DatasetSettings {
        &self.settings
    }

    /// 新しいクラスを追加する（名前の重複は許可）
    pub fn add_category(&mut self, name: impl Into<String>) -> ClassCategory {
        self.next_category += 1;
        let id = CategoryId::new(format!("class_{}", self.next_category));
        let category = ClassCategory::new(id, name);
        self.categories.push(category.clone());
        category
    }

    /// "Class {n}" という名前でクラスを追加する
    pub fn add_default_category(&mut self) -> ClassCategory {
        let name = format!("Class {}", self.categories.len() + 1);
        self.add_category(name)
    }

    /// クラスとそのサンプルを削除する。存在しないIDは無視する。
    pub fn remove_category(&mut self, id: &CategoryId) {
        self.categories.retain(|c| &c.id != id);
    }

    pub fn rename_category(&mut self, id: &CategoryId, name: impl Into<String>) -> CoreResult<()> {
        let category = self.category_mut(id)?;
        category.name = name.into();
        Ok(())
    }

    pub fn add_sample(
        &mut self,
        category_id: &CategoryId,
        image: impl Into<Arc<[u8]>>,
    ) -> CoreResult<Sample> {
        let sample_id = SampleId::new(format!("sample_{}", self.next_sample + 1));
        let category = self.category_mut(category_id)?;
        let sample = Sample::new(sample_id, image);
        category.samples.push(sample.clone());
        self.next_sample += 1;
        Ok(sample)
    }

    pub fn remove_sample(&mut self, category_id: &CategoryId, sample_id: &SampleId) -> CoreResult<()> {
        let category = self.category_mut(category_id)?;
        let position = category
            .samples
            .iter()
            .position(|s| &s.id == sample_id)
            .ok_or_else(|| CoreError::sample_not_found(sample_id))?;
        category.samples.remove(position);
        Ok(())
    }

    pub fn categories(&self) -> &[ClassCategory] {
        &self.categories
    }

    pub fn category(&self, id: &CategoryId) -> Option<&ClassCategory> {
        self.categories.iter().find(|c| &c.id == id)
    }

    fn category_mut(&mut self, id: &CategoryId) -> CoreResult<&mut ClassCategory> {
        self.categories
            .iter_mut()
            .find(|c| &c.id == id)
            .ok_or_else(|| CoreError::category_not_found(id))
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    pub fn total_samples(&self) -> usize {
        self.categories.iter().map(|c| c.samples.len()).sum()
    }

    pub fn readiness(&self) -> Readiness {
        let required = self.settings.min_categories.max(2);
        if self.categories.len() < required {
            return Readiness::TooFewCategories {
                found: self.categories.len(),
                required,
            };
        }

        if let Some(empty) = self.categories.iter().find(|c| c.samples.is_empty()) {
            return Readiness::EmptyCategory {
                id: empty.id.clone(),
                name: empty.name.clone(),
            };
        }

        let total = self.total_samples();
        if total < self.settings.min_total_samples {
            return Readiness::TooFewSamples {
                found: total,
                required: self.settings.min_total_samples,
            };
        }

        Readiness::Ready
    }

    pub fn is_trainable(&self) -> bool {
        self.readiness().is_ready()
    }

    pub fn snapshot(&self) -> DatasetSnapshot {
        DatasetSnapshot::new(self.categories.clone())
    }
}

/// UI層とオーケストレータで共有するデータセット
pub type SharedDatasetStore = Arc<Mutex<DatasetStore>>;

/// 共有データセットをロックする（パニックで汚染されていても中身を使う）
pub fn lock_store(store: &SharedDatasetStore) -> MutexGuard<'_, DatasetStore> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            ext == "png" || ext == "jpg" || ext == "jpeg"
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> DatasetStore {
        DatasetStore::default()
    }

    #[test]
    fn test_default_categories() {
        let store = DatasetStore::with_default_categories(DatasetSettings::default());
        let names: Vec<_> = store.categories().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Class 1", "Class 2"]);
        assert_eq!(store.categories()[0].id.as_str(), "class_1");
        assert!(!store.is_trainable());
    }

    #[test]
    fn test_add_then_remove_category_round_trip() {
        let mut store = DatasetStore::with_default_categories(DatasetSettings::default());
        let a = store.categories()[0].id.clone();
        store.add_sample(&a, vec![1u8, 2, 3]).unwrap();
        let before: Vec<_> = store
            .categories()
            .iter()
            .map(|c| (c.id.clone(), c.name.clone(), c.samples.len()))
            .collect();

        let added = store.add_category("Class 3");
        store.remove_category(&added.id);

        let after: Vec<_> = store
            .categories()
            .iter()
            .map(|c| (c.id.clone(), c.name.clone(), c.samples.len()))
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_ids_are_unique_and_names_may_repeat() {
        let mut store = store();
        let a = store.add_category("Cat");
        let b = store.add_category("Cat");
        assert_ne!(a.id, b.id);

        store.remove_category(&b.id);
        let c = store.add_category("Cat");
        assert_ne!(b.id, c.id);
    }

    #[test]
    fn test_remove_category_is_idempotent() {
        let mut store = store();
        let a = store.add_category("A");
        store.remove_category(&a.id);
        store.remove_category(&a.id);
        store.remove_category(&CategoryId::new("missing"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_add_sample_to_unknown_category_fails() {
        let mut store = store();
        let err = store
            .add_sample(&CategoryId::new("nope"), vec![0u8])
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { kind: crate::error::EntityKind::Category, .. }));
    }

    #[test]
    fn test_remove_sample_not_found_cases() {
        let mut store = store();
        let a = store.add_category("A");
        let sample = store.add_sample(&a.id, vec![0u8]).unwrap();

        assert!(store
            .remove_sample(&CategoryId::new("nope"), &sample.id)
            .is_err());
        let err = store
            .remove_sample(&a.id, &SampleId::new("sample_999"))
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { kind: crate::error::EntityKind::Sample, .. }));

        store.remove_sample(&a.id, &sample.id).unwrap();
        assert_eq!(store.total_samples(), 0);
    }

    #[test]
    fn test_samples_keep_insertion_order() {
        let mut store = store();
        let a = store.add_category("A");
        let s1 = store.add_sample(&a.id, vec![1u8]).unwrap();
        let s2 = store.add_sample(&a.id, vec![2u8]).unwrap();
        let ids: Vec<_> = store.category(&a.id).unwrap().samples.iter().map(|s| s.id.clone()).collect();
        assert_eq!(ids, vec![s1.id, s2.id]);
    }

    #[test]
    fn test_readiness_rules() {
        let mut store = store();
        assert_eq!(
            store.readiness(),
            Readiness::TooFewCategories { found: 0, required: 2 }
        );

        let a = store.add_category("A");
        store.add_sample(&a.id, vec![1u8]).unwrap();
        store.add_sample(&a.id, vec![2u8]).unwrap();
        assert!(!store.is_trainable());

        let b = store.add_category("B");
        assert!(matches!(store.readiness(), Readiness::EmptyCategory { ref id, .. } if id == &b.id));

        store.add_sample(&b.id, vec![3u8]).unwrap();
        assert!(store.is_trainable());

        // 空のクラスが1つでもあれば学習不可
        store.add_category("C");
        assert!(!store.is_trainable());
    }

    #[test]
    fn test_minimum_total_samples() {
        let settings = DatasetSettings {
            min_categories: 2,
            min_total_samples: 3,
        };
        let mut store = DatasetStore::new(settings);
        let a = store.add_category("A");
        let b = store.add_category("B");
        store.add_sample(&a.id, vec![1u8]).unwrap();
        store.add_sample(&b.id, vec![2u8]).unwrap();
        assert_eq!(
            store.readiness(),
            Readiness::TooFewSamples { found: 2, required: 3 }
        );
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_edits() {
        let mut store = store();
        let a = store.add_category("A");
        store.add_sample(&a.id, vec![1u8]).unwrap();
        let snapshot = store.snapshot();

        store.add_sample(&a.id, vec![2u8]).unwrap();
        store.remove_category(&a.id);

        assert!(snapshot.contains(&a.id));
        assert_eq!(snapshot.total_samples(), 1);
    }

    #[test]
    fn test_import_directory() {
        let dir = tempfile::tempdir().unwrap();
        for (class, files) in [("cat", 2), ("dog", 1)] {
            let class_dir = dir.path().join(class);
            std::fs::create_dir_all(&class_dir).unwrap();
            for i in 0..files {
                std::fs::write(class_dir.join(format!("{}.png", i)), [i as u8]).unwrap();
            }
            std::fs::write(class_dir.join("notes.txt"), b"ignored").unwrap();
        }

        let store = DatasetStore::import_directory(dir.path(), DatasetSettings::default()).unwrap();
        let names: Vec<_> = store.categories().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["cat", "dog"]);
        assert_eq!(store.total_samples(), 3);
        assert!(store.is_trainable());
    }

    #[test]
    fn test_import_empty_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(DatasetStore::import_directory(dir.path(), DatasetSettings::default()).is_err());
    }
}
