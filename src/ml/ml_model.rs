//! ローカル分類モデルの共通定義
//!
//! 画像をImageNet正規化した特徴ベクトルに変換し、
//! アルゴリズムごとの戦略で分類します。

use anyhow::Result;
use image::imageops::FilterType;

use crate::types::AlgorithmVariant;

/// ImageNetの平均
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNetの標準偏差
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// 分類戦略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// クラス重心への距離をsoftmaxで確率化
    Centroid,
    /// k近傍の多数決
    NearestNeighbours,
    /// 2x2平均プーリング後の特徴で重心分類
    PooledCentroid,
}

impl Strategy {
    /// アルゴリズム種別から戦略を選ぶ
    pub fn for_variant(variant: AlgorithmVariant) -> Self {
        match variant {
            AlgorithmVariant::LogisticRegression => Strategy::Centroid,
            AlgorithmVariant::RandomForest => Strategy::NearestNeighbours,
            AlgorithmVariant::ConvolutionalNetwork => Strategy::PooledCentroid,
        }
    }
}

/// 画像バイト列を読み込んで正規化
///
/// 任意フォーマットの画像を `size`x`size` にリサイズし、
/// ImageNetの平均と標準偏差で正規化します。
///
/// # 戻り値
/// - 正規化されたRGB画像データ (C, H, W) の順で平坦化
pub fn load_and_normalize_image_bytes(bytes: &[u8], size: u32) -> Result<Vec<f32>> {
    if size == 0 {
        anyhow::bail!("特徴サイズが0です");
    }
    let img = image::load_from_memory(bytes)?.to_rgb8();
    let img = image::imageops::resize(&img, size, size, FilterType::Triangle);

    let mut data = Vec::with_capacity(3 * (size * size) as usize);
    for channel in 0..3 {
        for y in 0..size {
            for x in 0..size {
                let pixel = img.get_pixel(x, y);
                let value = pixel[channel] as f32 / 255.0;
                data.push((value - MEAN[channel]) / STD[channel]);
            }
        }
    }

    Ok(data)
}

/// (C, H, W) 特徴を2x2平均プーリングする
pub fn average_pool_2x2(features: &[f32], size: usize) -> Vec<f32> {
    let pooled_size = (size / 2).max(1);
    if size < 2 {
        return features.to_vec();
    }
    let plane = size * size;
    let mut out = Vec::with_capacity(3 * pooled_size * pooled_size);
    for channel in 0..3 {
        let base = channel * plane;
        for py in 0..pooled_size {
            for px in 0..pooled_size {
                let (y, x) = (py * 2, px * 2);
                let sum = features[base + y * size + x]
                    + features[base + y * size + x + 1]
                    + features[base + (y + 1) * size + x]
                    + features[base + (y + 1) * size + x + 1];
                out.push(sum / 4.0);
            }
        }
    }
    out
}

/// 平均二乗距離
fn mean_squared_distance(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() {
        return 0.0;
    }
    let sum: f64 = a
        .iter()
        .zip(b)
        .map(|(x, y)| {
            let d = (*x - *y) as f64;
            d * d
        })
        .sum();
    sum / a.len() as f64
}

/// 1件の予測
#[derive(Debug, Clone, PartialEq)]
pub struct LocalPrediction {
    pub class_index: usize,
    pub confidence: f64,
    /// 予測クラスへの平均二乗距離
    pub distance: f64,
}

/// 学習済みローカルモデル
#[derive(Debug, Clone)]
pub struct LocalModel {
    pub strategy: Strategy,
    pub feature_size: u32,
    pub neighbours: usize,
    pub temperature: f64,
    pub num_classes: usize,
    /// クラスごとの重心（戦略の特徴空間）
    centroids: Vec<Vec<f32>>,
    /// (クラスインデックス, 特徴)
    examples: Vec<(usize, Vec<f32>)>,
}

impl LocalModel {
    /// 正規化済み特徴からモデルを構築する
    pub fn fit(
        strategy: Strategy,
        feature_size: u32,
        neighbours: usize,
        temperature: f64,
        num_classes: usize,
        examples: Vec<(usize, Vec<f32>)>,
    ) -> Self {
        let examples: Vec<(usize, Vec<f32>)> = examples
            .into_iter()
            .map(|(label, features)| (label, project(strategy, &features, feature_size)))
            .collect();

        let dim = examples.first().map(|(_, f)| f.len()).unwrap_or(0);
        let mut sums = vec![vec![0.0f32; dim]; num_classes];
        let mut counts = vec![0usize; num_classes];
        for (label, features) in &examples {
            if *label >= num_classes {
                continue;
            }
            for (acc, v) in sums[*label].iter_mut().zip(features) {
                *acc += *v;
            }
            counts[*label] += 1;
        }
        let centroids = sums
            .into_iter()
            .zip(&counts)
            .map(|(sum, &count)| {
                let n = count.max(1) as f32;
                sum.into_iter().map(|v| v / n).collect()
            })
            .collect();

        Self {
            strategy,
            feature_size,
            neighbours: neighbours.max(1),
            temperature: if temperature > 0.0 { temperature } else { 1.0 },
            num_classes,
            centroids,
            examples,
        }
    }

    /// 正規化済み特徴を分類する
    pub fn predict(&self, features: &[f32]) -> Option<LocalPrediction> {
        let features = project(self.strategy, features, self.feature_size);
        match self.strategy {
            Strategy::Centroid | Strategy::PooledCentroid => self.predict_centroid(&features),
            Strategy::NearestNeighbours => self.predict_neighbours(&features),
        }
    }

    fn predict_centroid(&self, features: &[f32]) -> Option<LocalPrediction> {
        if self.centroids.is_empty() {
            return None;
        }
        let distances: Vec<f64> = self
            .centroids
            .iter()
            .map(|c| mean_squared_distance(features, c))
            .collect();

        // softmax(-d / T)、最小距離で正規化して桁あふれを防ぐ
        let min = distances.iter().cloned().fold(f64::INFINITY, f64::min);
        let weights: Vec<f64> = distances
            .iter()
            .map(|d| (-(d - min) / self.temperature).exp())
            .collect();
        let total: f64 = weights.iter().sum();

        let (class_index, distance) = distances
            .iter()
            .cloned()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(&b.1))?;

        Some(LocalPrediction {
            class_index,
            confidence: weights[class_index] / total,
            distance,
        })
    }

    fn predict_neighbours(&self, features: &[f32]) -> Option<LocalPrediction> {
        if self.examples.is_empty() {
            return None;
        }
        let mut ranked: Vec<(usize, f64)> = self
            .examples
            .iter()
            .map(|(label, f)| (*label, mean_squared_distance(features, f)))
            .collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1));

        let k = self.neighbours.min(ranked.len());
        let mut votes = vec![(0usize, 0.0f64); self.num_classes];
        for (label, distance) in &ranked[..k] {
            if let Some(slot) = votes.get_mut(*label) {
                slot.0 += 1;
                slot.1 += distance;
            }
        }

        // 得票数が多い順、同数なら距離の合計が小さい方
        let (class_index, (count, distance_sum)) = votes
            .iter()
            .cloned()
            .enumerate()
            .filter(|(_, (count, _))| *count > 0)
            .max_by(|a, b| a.1 .0.cmp(&b.1 .0).then(b.1 .1.total_cmp(&a.1 .1)))?;

        Some(LocalPrediction {
            class_index,
            confidence: count as f64 / k as f64,
            distance: distance_sum / count as f64,
        })
    }

    /// 学習データ上の正解率
    pub fn training_accuracy(&self) -> f64 {
        if self.examples.is_empty() {
            return 0.0;
        }
        let correct = self
            .examples
            .iter()
            .filter(|(label, features)| {
                let prediction = match self.strategy {
                    Strategy::Centroid | Strategy::PooledCentroid => self.predict_centroid(features),
                    Strategy::NearestNeighbours => self.predict_neighbours(features),
                };
                prediction.map(|p| p.class_index == *label).unwrap_or(false)
            })
            .count();
        correct as f64 / self.examples.len() as f64
    }
}

/// 戦略ごとの特徴空間へ射影する
fn project(strategy: Strategy, features: &[f32], feature_size: u32) -> Vec<f32> {
    match strategy {
        Strategy::PooledCentroid => average_pool_2x2(features, feature_size as usize),
        Strategy::Centroid | Strategy::NearestNeighbours => features.to_vec(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    /// 単色PNGを生成
    pub(crate) fn solid_png(rgb: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(8, 8, Rgb(rgb));
        let mut buffer = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buffer, ImageFormat::Png)
            .unwrap();
        buffer.into_inner()
    }

    fn features(rgb: [u8; 3]) -> Vec<f32> {
        load_and_normalize_image_bytes(&solid_png(rgb), 4).unwrap()
    }

    #[test]
    fn test_normalized_feature_layout() {
        let data = load_and_normalize_image_bytes(&solid_png([255, 0, 0]), 4).unwrap();
        assert_eq!(data.len(), 3 * 4 * 4);
        let expected_red = (1.0 - MEAN[0]) / STD[0];
        assert!((data[0] - expected_red).abs() < 1e-4);
        let expected_green = (0.0 - MEAN[1]) / STD[1];
        assert!((data[16] - expected_green).abs() < 1e-4);
    }

    #[test]
    fn test_rejects_non_image_bytes() {
        assert!(load_and_normalize_image_bytes(b"definitely not an image", 4).is_err());
    }

    #[test]
    fn test_average_pool_shape() {
        let pooled = average_pool_2x2(&vec![1.0; 3 * 4 * 4], 4);
        assert_eq!(pooled.len(), 3 * 2 * 2);
        assert!(pooled.iter().all(|v| (*v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_variant_dispatch_table() {
        assert_eq!(Strategy::for_variant(AlgorithmVariant::LogisticRegression), Strategy::Centroid);
        assert_eq!(Strategy::for_variant(AlgorithmVariant::RandomForest), Strategy::NearestNeighbours);
        assert_eq!(
            Strategy::for_variant(AlgorithmVariant::ConvolutionalNetwork),
            Strategy::PooledCentroid
        );
    }

    #[test]
    fn test_each_strategy_separates_colours() {
        let examples = vec![
            (0, features([250, 10, 10])),
            (0, features([240, 20, 20])),
            (1, features([10, 10, 250])),
            (1, features([20, 20, 240])),
        ];
        for strategy in [Strategy::Centroid, Strategy::NearestNeighbours, Strategy::PooledCentroid] {
            let model = LocalModel::fit(strategy, 4, 3, 0.5, 2, examples.clone());
            let red = model.predict(&features([255, 0, 0])).unwrap();
            let blue = model.predict(&features([0, 0, 255])).unwrap();
            assert_eq!(red.class_index, 0, "{:?}", strategy);
            assert_eq!(blue.class_index, 1, "{:?}", strategy);
            assert!(red.confidence > 0.5 && red.confidence <= 1.0);
            assert_eq!(model.training_accuracy(), 1.0);
        }
    }
}
