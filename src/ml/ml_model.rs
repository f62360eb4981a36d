//! 機械学習モデルの共通定義
//!
//! ID画像判定用のCNNモデルと前処理を提供します。

use std::path::Path;

use anyhow::Context;
use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig,
        PaddingConfig2d, Relu,
    },
    tensor::{activation::sigmoid, backend::Backend, Tensor, TensorData},
};
use image::{imageops::FilterType, DynamicImage};

/// 画像サイズ
pub const IMAGE_SIZE: usize = 224;

/// チャネル数（RGB）
pub const CHANNELS: usize = 3;

/// クラス名の定義（インデックス = ラベル値）
pub const CLASS_NAMES: [&str; 2] = ["invalid", "valid"];

/// 判定しきい値（これより大きければ有効）
pub const DECISION_THRESHOLD: f32 = 0.5;

/// 畳み込みブロックのチャネル数
const BLOCK_CHANNELS: [usize; 4] = [32, 64, 128, 256];

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 入力画像サイズ（正方形）
    #[config(default = 224)]
    pub image_size: usize,
    /// 畳み込みブロックのドロップアウト率
    #[config(default = 0.25)]
    pub conv_dropout: f64,
    /// 全結合層1のドロップアウト率
    #[config(default = 0.5)]
    pub dense_dropout: f64,
    /// 全結合層2のドロップアウト率
    #[config(default = 0.3)]
    pub head_dropout: f64,
}

impl ModelConfig {
    /// アプリケーション設定から作成
    pub fn from_settings(settings: &crate::model::ModelSettings) -> Self {
        Self::new()
            .with_image_size(settings.image_size)
            .with_conv_dropout(settings.conv_dropout)
            .with_dense_dropout(settings.dense_dropout)
            .with_head_dropout(settings.head_dropout)
    }

    /// 4回のプーリング後の特徴マップサイズ
    pub fn feature_map_size(&self) -> usize {
        BLOCK_CHANNELS
            .iter()
            .fold(self.image_size, |size, _| size / 2)
    }

    /// Flatten後の特徴次元
    pub fn flatten_dim(&self) -> usize {
        let size = self.feature_map_size();
        BLOCK_CHANNELS[BLOCK_CHANNELS.len() - 1] * size * size
    }

    /// 4回のプーリングに耐える入力サイズか確認
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.feature_map_size() == 0 {
            anyhow::bail!(
                "入力サイズが小さすぎます: {} (最小16x16が必要)",
                self.image_size
            );
        }
        Ok(())
    }

    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> IdCardClassifier<B> {
        assert!(
            self.feature_map_size() > 0,
            "入力サイズが小さすぎます: {} (最小16x16が必要)",
            self.image_size
        );

        let d = self.flatten_dim();
        tracing::debug!(
            "[Model] 入力 {}x{} -> 特徴マップ 256 x {}x{} -> Flatten {}",
            self.image_size,
            self.image_size,
            self.feature_map_size(),
            self.feature_map_size(),
            d
        );

        let mut in_channels = CHANNELS;
        let blocks = BLOCK_CHANNELS
            .iter()
            .map(|&out_channels| {
                let block = ConvBlock::new(in_channels, out_channels, self.conv_dropout, device);
                in_channels = out_channels;
                block
            })
            .collect();

        IdCardClassifier {
            blocks,
            fc1: LinearConfig::new(d, 256).init(device),
            norm1: BatchNormConfig::new(256).init(device),
            dropout1: DropoutConfig::new(self.dense_dropout).init(),
            fc2: LinearConfig::new(256, 128).init(device),
            dropout2: DropoutConfig::new(self.head_dropout).init(),
            output: LinearConfig::new(128, 1).init(device),
            activation: Relu::new(),
        }
    }
}

/// Conv 3x3 (same) + ReLU -> BatchNorm -> MaxPool 2x2 -> Dropout
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B>,
    pool: MaxPool2d,
    dropout: Dropout,
    activation: Relu,
}

impl<B: Backend> ConvBlock<B> {
    fn new(in_channels: usize, out_channels: usize, dropout: f64, device: &B::Device) -> Self {
        Self {
            conv: Conv2dConfig::new([in_channels, out_channels], [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .init(device),
            norm: BatchNormConfig::new(out_channels).init(device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            dropout: DropoutConfig::new(dropout).init(),
            activation: Relu::new(),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.activation.forward(x);
        let x = self.norm.forward(x);
        let x = self.pool.forward(x);
        self.dropout.forward(x)
    }
}

/// ID画像判定用CNNモデル
///
/// # アーキテクチャ
/// - {Conv 3x3 + ReLU, BatchNorm, MaxPool 2x2, Dropout} x 4 (32 -> 64 -> 128 -> 256)
/// - Flatten
/// - FC: d -> 256 + ReLU, BatchNorm, Dropout
/// - FC: 256 -> 128 + ReLU, Dropout
/// - FC: 128 -> 1 (sigmoidで有効確率)
///
/// ドロップアウトとBatchNormの統計更新は自動微分バックエンド上でのみ働きます。
#[derive(Module, Debug)]
pub struct IdCardClassifier<B: Backend> {
    blocks: Vec<ConvBlock<B>>,

    // 全結合層
    fc1: Linear<B>,
    norm1: BatchNorm<B>,
    dropout1: Dropout,
    fc2: Linear<B>,
    dropout2: Dropout,
    output: Linear<B>,

    activation: Relu,
}

impl<B: Backend> IdCardClassifier<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - ロジット [batch_size, 1]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self
            .blocks
            .iter()
            .fold(images, |x, block| block.forward(x));

        // Flatten
        let [batch_size, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);
        // BatchNormはチャネル次元の後ろに空間次元を要求する
        let x = self
            .norm1
            .forward(x.reshape([batch_size, 256, 1]))
            .reshape([batch_size, 256]);
        let x = self.dropout1.forward(x);

        let x = self.fc2.forward(x);
        let x = self.activation.forward(x);
        let x = self.dropout2.forward(x);

        self.output.forward(x)
    }

    /// 有効である確率 [batch_size]
    pub fn forward_probability(&self, images: Tensor<B, 4>) -> Tensor<B, 1> {
        let logits = self.forward(images);
        let [batch_size, _] = logits.dims();
        sigmoid(logits).reshape([batch_size])
    }
}

/// 画像をモデル入力形式に変換
///
/// RGBに変換して `size x size` にLanczos3でリサイズし、[0, 1] に正規化します。
///
/// # 戻り値
/// - RGB画像データ (C, H, W) の順で平坦化
pub fn preprocess_image(image: &DynamicImage, size: usize) -> Vec<f32> {
    let mut rgb = image.to_rgb8();
    if rgb.width() != size as u32 || rgb.height() != size as u32 {
        rgb = image::imageops::resize(&rgb, size as u32, size as u32, FilterType::Lanczos3);
    }

    let mut data = vec![0.0f32; CHANNELS * size * size];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        for c in 0..CHANNELS {
            let idx = c * size * size + y as usize * size + x as usize;
            data[idx] = pixel[c] as f32 / 255.0;
        }
    }

    data
}

/// 画像を読み込んで前処理
pub fn load_and_preprocess_image(path: &Path, size: usize) -> anyhow::Result<Vec<f32>> {
    let image = image::open(path)
        .with_context(|| format!("画像を読み込めません: {}", path.display()))?;
    Ok(preprocess_image(&image, size))
}

/// 前処理済み画像を4次元テンソルにまとめる
pub fn images_to_tensor<B: Backend>(
    pixels: Vec<f32>,
    batch_size: usize,
    size: usize,
    device: &B::Device,
) -> Tensor<B, 4> {
    Tensor::<B, 4>::from_data(
        TensorData::new(pixels, [batch_size, CHANNELS, size, size]),
        device,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use image::{Rgb, RgbImage};

    type TestBackend = NdArray<f32>;

    fn checkerboard(width: u32, height: u32) -> DynamicImage {
        let img = RgbImage::from_fn(width, height, |x, y| {
            if (x / 4 + y / 4) % 2 == 0 {
                Rgb([250, 10, 128])
            } else {
                Rgb([5, 200, 60])
            }
        });
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn test_preprocess_shape_and_range() {
        let data = preprocess_image(&checkerboard(50, 30), 32);
        assert_eq!(data.len(), CHANNELS * 32 * 32);
        assert!(data.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_preprocess_is_deterministic() {
        let image = checkerboard(64, 48);
        let first = preprocess_image(&image, 32);
        let second = preprocess_image(&image, 32);
        assert_eq!(first, second);
    }

    #[test]
    fn test_preprocess_channel_major_layout() {
        let img = RgbImage::from_pixel(4, 4, Rgb([255, 0, 51]));
        let data = preprocess_image(&DynamicImage::ImageRgb8(img), 4);
        assert!(data[..16].iter().all(|v| (*v - 1.0).abs() < 1e-6));
        assert!(data[16..32].iter().all(|v| *v == 0.0));
        assert!(data[32..].iter().all(|v| (*v - 0.2).abs() < 1e-6));
    }

    #[test]
    fn test_feature_map_size() {
        let config = ModelConfig::new();
        assert_eq!(config.feature_map_size(), 14);
        assert_eq!(config.flatten_dim(), 256 * 14 * 14);
        assert_eq!(ModelConfig::new().with_image_size(15).feature_map_size(), 0);
    }

    #[test]
    fn test_validate_rejects_small_input() {
        assert!(ModelConfig::new().validate().is_ok());
        assert!(ModelConfig::new().with_image_size(16).validate().is_ok());
        assert!(ModelConfig::new().with_image_size(8).validate().is_err());
    }

    #[test]
    fn test_forward_shapes() {
        let device = Default::default();
        let model = ModelConfig::new()
            .with_image_size(32)
            .init::<TestBackend>(&device);

        let pixels = vec![0.5f32; 2 * CHANNELS * 32 * 32];
        let images = images_to_tensor::<TestBackend>(pixels, 2, 32, &device);

        assert_eq!(model.forward(images.clone()).dims(), [2, 1]);

        let probs = model
            .forward_probability(images)
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert_eq!(probs.len(), 2);
        assert!(probs.iter().all(|p| (0.0..=1.0).contains(p)));
    }
}
