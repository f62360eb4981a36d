//! データセットの構築・分割・バッチ化
//!
//! 有効なID画像を `Original/` と `Augmented/` から読み込み、合成した負例と合わせて
//! シャッフルし、クラス比を保ったまま学習/検証/テストに分割します。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Int, Tensor, TensorData},
};
use burn_dataset::InMemDataset;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::ml::augmentation::Augmenter;
use crate::ml::ml_model::{images_to_tensor, load_and_preprocess_image, CHANNELS, CLASS_NAMES};
use crate::ml::synthesis::NegativeSynthesizer;
use crate::model::AppConfig;
use crate::utils::VerificationError;

/// 読み込み対象の拡張子
const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// 2値ラベル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Label {
    /// 無効（合成負例）
    Invalid = 0,
    /// 有効なID画像
    Valid = 1,
}

impl Label {
    /// 数値ラベル
    pub fn value(self) -> i64 {
        self as i64
    }

    /// クラス名
    pub fn name(self) -> &'static str {
        CLASS_NAMES[self as usize]
    }
}

/// 前処理済み画像とラベルの組
#[derive(Debug, Clone)]
pub struct Sample {
    /// (C, H, W) 順で平坦化された [0, 1] の画素値
    pub pixels: Vec<f32>,
    pub label: Label,
}

impl Sample {
    pub fn new(pixels: Vec<f32>, label: Label) -> Self {
        Self { pixels, label }
    }
}

/// ディレクトリ直下の画像ファイルを列挙する（名前順）
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("ディレクトリを読めません: {}", dir.display()))?
    {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        if let Some(ext) = path.extension() {
            let ext_str = ext.to_string_lossy().to_lowercase();
            if IMAGE_EXTENSIONS.contains(&ext_str.as_str()) {
                paths.push(path);
            }
        }
    }
    paths.sort();
    Ok(paths)
}

/// 有効なID画像を読み込む
///
/// 存在しないディレクトリは飛ばし、読み込めない画像は警告を出して飛ばします。
pub fn load_valid_images(dirs: &[PathBuf], size: usize) -> Result<Vec<Sample>> {
    let mut samples = Vec::new();

    for dir in dirs {
        if !dir.is_dir() {
            tracing::debug!("ディレクトリがないためスキップ: {}", dir.display());
            continue;
        }

        for path in list_images(dir)? {
            match load_and_preprocess_image(&path, size) {
                Ok(pixels) => samples.push(Sample::new(pixels, Label::Valid)),
                Err(e) => tracing::warn!("画像読み込み失敗のためスキップ {}: {:#}", path.display(), e),
            }
        }
    }

    Ok(samples)
}

/// 設定に従ってデータセット全体を構築する
///
/// 有効画像 + 合成負例をシャッフルして返します。
pub fn build_dataset(config: &AppConfig) -> Result<Vec<Sample>> {
    let paths = &config.paths;
    if !paths.dataset_dir.is_dir() {
        return Err(VerificationError::DatasetNotFound(paths.dataset_dir.clone()).into());
    }

    let size = config.model.image_size;
    tracing::info!("データセットを読み込みます: {}", paths.dataset_dir.display());
    let valid = load_valid_images(&[paths.original_dir(), paths.augmented_dir()], size)?;
    tracing::info!("有効なID画像: {} 枚", valid.len());

    let mut rng = StdRng::seed_from_u64(config.training.seed);
    let num_negatives = config.synthesis.num_negatives.unwrap_or(valid.len());
    let negatives = NegativeSynthesizer::new(&valid, size, &config.synthesis)?
        .synthesize(num_negatives, &mut rng);
    tracing::info!("合成した無効画像: {} 枚", negatives.len());

    let mut all = valid;
    all.extend(negatives);
    if all.is_empty() {
        return Err(VerificationError::NoImages(paths.dataset_dir.clone()).into());
    }
    all.shuffle(&mut rng);

    let num_valid = all.iter().filter(|s| s.label == Label::Valid).count();
    tracing::info!(
        "データセット合計: {} 枚 (有効: {} / 無効: {})",
        all.len(),
        num_valid,
        all.len() - num_valid
    );

    Ok(all)
}

/// クラス比を保ってサンプルを2つに分ける
///
/// 各クラスから `round(n * holdout_ratio)` 件を後者に回します。
pub fn stratified_split(samples: Vec<Sample>, holdout_ratio: f32, seed: u64) -> (Vec<Sample>, Vec<Sample>) {
    let ratio = holdout_ratio.clamp(0.0, 1.0);
    let mut by_class: BTreeMap<Label, Vec<Sample>> = BTreeMap::new();
    for sample in samples {
        by_class.entry(sample.label).or_default().push(sample);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut kept = Vec::new();
    let mut holdout = Vec::new();

    for (_, mut group) in by_class {
        group.shuffle(&mut rng);
        let n_holdout = ((group.len() as f32) * ratio).round() as usize;
        let n_kept = group.len() - n_holdout.min(group.len());
        holdout.extend(group.split_off(n_kept));
        kept.extend(group);
    }

    kept.shuffle(&mut rng);
    holdout.shuffle(&mut rng);
    (kept, holdout)
}

/// 学習/検証/テストの3分割
#[derive(Debug, Clone)]
pub struct DatasetSplits {
    pub train: Vec<Sample>,
    pub validation: Vec<Sample>,
    pub test: Vec<Sample>,
}

impl DatasetSplits {
    /// ホールドアウトを切り出してから検証とテストに二分する
    pub fn new(samples: Vec<Sample>, holdout_ratio: f32, test_ratio_of_holdout: f32, seed: u64) -> Self {
        let (train, holdout) = stratified_split(samples, holdout_ratio, seed);
        let (validation, test) = stratified_split(holdout, test_ratio_of_holdout, seed);
        Self {
            train,
            validation,
            test,
        }
    }

    /// 合計サンプル数
    pub fn total(&self) -> usize {
        self.train.len() + self.validation.len() + self.test.len()
    }
}

/// 学習用データセット（取得時にランダム拡張する）
pub struct AugmentedDataset {
    inner: InMemDataset<Sample>,
    augmenter: Option<Augmenter>,
    size: usize,
    rng: Mutex<StdRng>,
}

impl AugmentedDataset {
    pub fn new(samples: Vec<Sample>, size: usize, augmenter: Option<Augmenter>, seed: u64) -> Self {
        Self {
            inner: InMemDataset::new(samples),
            augmenter,
            size,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Dataset<Sample> for AugmentedDataset {
    fn get(&self, index: usize) -> Option<Sample> {
        let sample = self.inner.get(index)?;
        let Some(augmenter) = &self.augmenter else {
            return Some(sample);
        };

        // 他スレッドのパニック後も乱数状態はそのまま使える
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let pixels = augmenter.augment(&sample.pixels, self.size, &mut *rng);
        Some(Sample::new(pixels, sample.label))
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct IdCardBatch<B: Backend> {
    /// [batch_size, 3, size, size]
    pub images: Tensor<B, 4>,
    /// [batch_size, 1]
    pub targets: Tensor<B, 2, Int>,
}

/// バッチャー
#[derive(Clone)]
pub struct IdCardBatcher<B: Backend> {
    size: usize,
    _marker: std::marker::PhantomData<B>,
}

impl<B: Backend> IdCardBatcher<B> {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<B: Backend> Batcher<B, Sample, IdCardBatch<B>> for IdCardBatcher<B> {
    fn batch(&self, items: Vec<Sample>, device: &B::Device) -> IdCardBatch<B> {
        let batch_size = items.len();
        let mut pixels = Vec::with_capacity(batch_size * CHANNELS * self.size * self.size);
        let mut labels = Vec::with_capacity(batch_size);

        for item in items {
            pixels.extend_from_slice(&item.pixels);
            labels.push(item.label.value());
        }

        let images = images_to_tensor::<B>(pixels, batch_size, self.size, device);
        let targets =
            Tensor::<B, 2, Int>::from_data(TensorData::new(labels, [batch_size, 1]), device);

        IdCardBatch { images, targets }
    }
}

/// 評価用データセット
pub fn in_memory(samples: Vec<Sample>) -> Arc<InMemDataset<Sample>> {
    Arc::new(InMemDataset::new(samples))
}
