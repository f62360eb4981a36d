//! 負例（無効なID画像）の合成
//!
//! 無効クラスの実画像は存在しないため、有効なID画像のプールから
//! 4種類の手法のいずれかを一様に選んで負例を作ります。
//!
//! - ノイズ: 一様乱数のみの画像
//! - 劣化: 有効画像 + ガウスノイズ
//! - 色パッチ: 単色に縦方向グラデーションを掛けた画像
//! - ぼかし: 有効画像を縮小→拡大 + ガウスノイズ
//!
//! 生成物が実際の無効書類を代表している保証はありません。

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use image::{imageops::FilterType, ImageBuffer, Rgb, Rgb32FImage};
use rand::{seq::SliceRandom, Rng};
use rand_distr::{Distribution, Normal};

use crate::ml::dataset::{Label, Sample};
use crate::ml::ml_model::CHANNELS;
use crate::model::SynthesisSettings;

/// 負例の生成手法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegativeStrategy {
    Noise,
    Distorted,
    ColorPatch,
    Blur,
}

impl NegativeStrategy {
    pub const ALL: [NegativeStrategy; 4] = [
        NegativeStrategy::Noise,
        NegativeStrategy::Distorted,
        NegativeStrategy::ColorPatch,
        NegativeStrategy::Blur,
    ];
}

impl std::fmt::Display for NegativeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NegativeStrategy::Noise => write!(f, "noise"),
            NegativeStrategy::Distorted => write!(f, "distorted"),
            NegativeStrategy::ColorPatch => write!(f, "color_patch"),
            NegativeStrategy::Blur => write!(f, "blur"),
        }
    }
}

/// 負例の生成器
pub struct NegativeSynthesizer<'a> {
    positives: &'a [Sample],
    size: usize,
    distortion: Normal<f32>,
    blur_noise: Normal<f32>,
    blur_size: u32,
}

impl<'a> NegativeSynthesizer<'a> {
    /// 正例プールと画像サイズから生成器を作成
    pub fn new(positives: &'a [Sample], size: usize, settings: &SynthesisSettings) -> Result<Self> {
        let distortion = Normal::new(0.0, settings.distortion_std)
            .map_err(|e| anyhow!("distortion_std が不正です ({}): {e}", settings.distortion_std))?;
        let blur_noise = Normal::new(0.0, settings.blur_noise_std)
            .map_err(|e| anyhow!("blur_noise_std が不正です ({}): {e}", settings.blur_noise_std))?;
        if settings.blur_size == 0 {
            return Err(anyhow!("blur_size は1以上である必要があります"));
        }

        Ok(Self {
            positives,
            size,
            distortion,
            blur_noise,
            blur_size: settings.blur_size,
        })
    }

    /// 負例を `count` 回生成する
    ///
    /// 正例プールが空の場合、正例を元にする手法が選ばれた回は何も生成しません。
    pub fn synthesize<R: Rng + ?Sized>(&self, count: usize, rng: &mut R) -> Vec<Sample> {
        let mut negatives = Vec::with_capacity(count);
        let mut counts: HashMap<NegativeStrategy, usize> = HashMap::new();

        for _ in 0..count {
            let strategy = *NegativeStrategy::ALL
                .choose(rng)
                .unwrap_or(&NegativeStrategy::Noise);
            if let Some(pixels) = self.generate(strategy, rng) {
                *counts.entry(strategy).or_default() += 1;
                negatives.push(Sample::new(pixels, Label::Invalid));
            }
        }

        for strategy in NegativeStrategy::ALL {
            tracing::debug!(
                "負例 {}: {} 枚",
                strategy,
                counts.get(&strategy).copied().unwrap_or(0)
            );
        }

        negatives
    }

    /// 指定手法で1枚生成する
    pub fn generate<R: Rng + ?Sized>(
        &self,
        strategy: NegativeStrategy,
        rng: &mut R,
    ) -> Option<Vec<f32>> {
        match strategy {
            NegativeStrategy::Noise => Some(self.noise(rng)),
            NegativeStrategy::Distorted => {
                let base = self.positives.choose(rng)?;
                Some(add_noise(&base.pixels, &self.distortion, rng))
            }
            NegativeStrategy::ColorPatch => Some(self.color_patch(rng)),
            NegativeStrategy::Blur => {
                let base = self.positives.choose(rng)?;
                let blurred = resample(&base.pixels, self.size, self.blur_size);
                Some(add_noise(&blurred, &self.blur_noise, rng))
            }
        }
    }

    fn noise<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f32> {
        (0..CHANNELS * self.size * self.size)
            .map(|_| rng.gen::<f32>())
            .collect()
    }

    fn color_patch<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f32> {
        let color: [f32; CHANNELS] = [rng.gen(), rng.gen(), rng.gen()];
        let size = self.size;
        let mut data = Vec::with_capacity(CHANNELS * size * size);

        for value in color {
            for y in 0..size {
                let t = if size > 1 {
                    y as f32 / (size - 1) as f32
                } else {
                    0.0
                };
                let shade = value * (0.5 + 0.5 * t);
                data.extend(std::iter::repeat(shade).take(size));
            }
        }

        data
    }
}

/// ガウスノイズを加えて [0, 1] に切り詰める
fn add_noise<R: Rng + ?Sized>(pixels: &[f32], normal: &Normal<f32>, rng: &mut R) -> Vec<f32> {
    pixels
        .iter()
        .map(|v| (v + normal.sample(rng)).clamp(0.0, 1.0))
        .collect()
}

/// 縮小してから元のサイズへ拡大する（強いぼかし）
fn resample(pixels: &[f32], size: usize, small: u32) -> Vec<f32> {
    let image = chw_to_image(pixels, size);
    let reduced = image::imageops::resize(&image, small, small, FilterType::Triangle);
    let restored =
        image::imageops::resize(&reduced, size as u32, size as u32, FilterType::Triangle);
    image_to_chw(&restored, size)
}

/// (C, H, W) の平坦データを浮動小数RGB画像へ
pub(crate) fn chw_to_image(pixels: &[f32], size: usize) -> Rgb32FImage {
    let plane = size * size;
    ImageBuffer::from_fn(size as u32, size as u32, |x, y| {
        let idx = y as usize * size + x as usize;
        Rgb([pixels[idx], pixels[plane + idx], pixels[2 * plane + idx]])
    })
}

/// 浮動小数RGB画像を (C, H, W) の平坦データへ
pub(crate) fn image_to_chw(image: &Rgb32FImage, size: usize) -> Vec<f32> {
    let plane = size * size;
    let mut data = vec![0.0f32; CHANNELS * plane];
    for (x, y, pixel) in image.enumerate_pixels() {
        let idx = y as usize * size + x as usize;
        for c in 0..CHANNELS {
            data[c * plane + idx] = pixel[c];
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    const SIZE: usize = 24;

    fn positives(n: usize) -> Vec<Sample> {
        (0..n)
            .map(|i| {
                let value = (i as f32 + 1.0) / (n as f32 + 1.0);
                Sample::new(vec![value; CHANNELS * SIZE * SIZE], Label::Valid)
            })
            .collect()
    }

    #[test]
    fn test_negatives_are_labeled_invalid() {
        let pool = positives(5);
        let synthesizer =
            NegativeSynthesizer::new(&pool, SIZE, &SynthesisSettings::default()).unwrap();
        let mut rng = StdRng::seed_from_u64(7);

        let negatives = synthesizer.synthesize(40, &mut rng);
        assert_eq!(negatives.len(), 40);
        for sample in &negatives {
            assert_eq!(sample.label, Label::Invalid);
            assert_eq!(sample.pixels.len(), CHANNELS * SIZE * SIZE);
            assert!(sample.pixels.iter().all(|v| (0.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn test_empty_pool_skips_positive_based_strategies() {
        let synthesizer =
            NegativeSynthesizer::new(&[], SIZE, &SynthesisSettings::default()).unwrap();
        let mut rng = StdRng::seed_from_u64(3);

        assert!(synthesizer
            .generate(NegativeStrategy::Distorted, &mut rng)
            .is_none());
        assert!(synthesizer.generate(NegativeStrategy::Blur, &mut rng).is_none());
        assert!(synthesizer.generate(NegativeStrategy::Noise, &mut rng).is_some());

        let negatives = synthesizer.synthesize(50, &mut rng);
        assert!(negatives.len() < 50);
    }

    #[test]
    fn test_same_seed_same_negatives() {
        let pool = positives(3);
        let synthesizer =
            NegativeSynthesizer::new(&pool, SIZE, &SynthesisSettings::default()).unwrap();

        let a = synthesizer.synthesize(10, &mut StdRng::seed_from_u64(11));
        let b = synthesizer.synthesize(10, &mut StdRng::seed_from_u64(11));
        let pixels = |s: &[Sample]| s.iter().map(|x| x.pixels.clone()).collect::<Vec<_>>();
        assert_eq!(pixels(&a), pixels(&b));
    }

    #[test]
    fn test_color_patch_gradient_runs_top_to_bottom() {
        let synthesizer =
            NegativeSynthesizer::new(&[], SIZE, &SynthesisSettings::default()).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let patch = synthesizer
            .generate(NegativeStrategy::ColorPatch, &mut rng)
            .unwrap();

        for c in 0..CHANNELS {
            let plane = &patch[c * SIZE * SIZE..(c + 1) * SIZE * SIZE];
            let top = plane[0];
            let bottom = plane[(SIZE - 1) * SIZE];
            // 最上段は色の半分、最下段は色そのもの
            assert!((bottom - 2.0 * top).abs() < 1e-5);
            assert!(plane[..SIZE].iter().all(|v| *v == top));
        }
    }

    #[test]
    fn test_blur_without_noise_smooths_edges() {
        let mut pixels = vec![0.0f32; CHANNELS * SIZE * SIZE];
        for c in 0..CHANNELS {
            for y in 0..SIZE {
                for x in SIZE / 2..SIZE {
                    pixels[c * SIZE * SIZE + y * SIZE + x] = 1.0;
                }
            }
        }
        let blurred = resample(&pixels, SIZE, 4);
        let row = &blurred[SIZE * (SIZE / 2)..SIZE * (SIZE / 2 + 1)];
        assert!(row.iter().any(|v| *v > 0.05 && *v < 0.95));
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let settings = SynthesisSettings {
            distortion_std: -1.0,
            ..SynthesisSettings::default()
        };
        assert!(NegativeSynthesizer::new(&[], SIZE, &settings).is_err());
    }
}
