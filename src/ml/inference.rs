//! モデル推論機能

use anyhow::{anyhow, Result};
use std::path::Path;

use burn::tensor::backend::Backend;

use crate::ml::ml_model::{images_to_tensor, load_and_preprocess_image, IdCardClassifier, DECISION_THRESHOLD};
use crate::model::{self, PathSettings};
use crate::utils::VerificationError;

/// 1枚の判定結果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verification {
    pub is_valid: bool,
    /// 判定したクラスに対する確信度
    pub confidence: f32,
    /// モデル出力の確率そのもの
    pub raw_score: f32,
}

impl Verification {
    /// 確率から判定結果を作る
    pub fn from_score(raw_score: f32) -> Self {
        let is_valid = raw_score > DECISION_THRESHOLD;
        let confidence = if is_valid { raw_score } else { 1.0 - raw_score };
        Self {
            is_valid,
            confidence,
            raw_score,
        }
    }

    pub fn status(&self) -> &'static str {
        if self.is_valid {
            "valid"
        } else {
            "invalid"
        }
    }
}

/// 推論エンジン
pub struct InferenceEngine<B: Backend> {
    model: IdCardClassifier<B>,
    image_size: usize,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// ネイティブ形式のモデルディレクトリから読み込む
    pub fn load(native_dir: &Path, device: B::Device) -> Result<Self> {
        let (config, model) = model::load_native::<B>(native_dir, &device)?;
        Ok(Self {
            model,
            image_size: config.image_size,
            device,
        })
    }

    /// 単一ファイル形式（tar.gz）から読み込む
    pub fn load_bundle(bundle_path: &Path, device: B::Device) -> Result<Self> {
        let bundle = model::load_bundle(bundle_path)?;
        let image_size = bundle.config.image_size;
        let model = bundle.into_model::<B>(&device)?;
        Ok(Self {
            model,
            image_size,
            device,
        })
    }

    /// ネイティブ形式を優先し、なければ単一ファイル形式を読み込む
    pub fn load_from_paths(paths: &PathSettings, device: B::Device) -> Result<Self> {
        let native_dir = paths.native_model_dir();
        if native_dir.is_dir() {
            tracing::info!("モデルを読み込みます: {}", native_dir.display());
            return Self::load(&native_dir, device);
        }

        let bundle_path = paths.bundle_path();
        if bundle_path.is_file() {
            tracing::info!("単一ファイル形式のモデルを読み込みます: {}", bundle_path.display());
            return Self::load_bundle(&bundle_path, device);
        }

        Err(VerificationError::ModelNotFound(native_dir).into())
    }

    /// モデルの入力画像サイズ
    pub fn image_size(&self) -> usize {
        self.image_size
    }

    /// 画像ファイルを判定
    pub fn verify_image(&self, image_path: &Path) -> Result<Verification> {
        if !image_path.is_file() {
            return Err(VerificationError::ImageNotFound(image_path.to_path_buf()).into());
        }
        let pixels = load_and_preprocess_image(image_path, self.image_size)?;
        self.verify_pixels(pixels)
    }

    /// 前処理済みの画像 (C, H, W) を判定
    pub fn verify_pixels(&self, pixels: Vec<f32>) -> Result<Verification> {
        let tensor = images_to_tensor::<B>(pixels, 1, self.image_size, &self.device);
        let probabilities = self
            .model
            .forward_probability(tensor)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| anyhow!("推論結果の取得エラー: {:?}", e))?;

        let score = probabilities
            .first()
            .copied()
            .ok_or_else(|| anyhow!("推論結果が空です"))?;
        Ok(Verification::from_score(score))
    }
}
