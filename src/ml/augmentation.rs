//! 学習時のデータ拡張
//!
//! 左右反転・回転・ズーム・コントラストを (C, H, W) の平坦データに適用します。
//! 画像外の参照は鏡像反転（d c b a | a b c d | d c b a）で埋めます。

use std::f32::consts::PI;

use rand::Rng;

use crate::ml::ml_model::CHANNELS;

/// データ拡張の設定
#[derive(Debug, Clone)]
pub struct Augmenter {
    /// 左右反転の確率
    pub flip_probability: f32,
    /// 回転角の上限（1回転に対する割合）
    pub rotation_factor: f32,
    /// ズーム倍率の変動幅
    pub zoom_factor: f32,
    /// コントラスト係数の変動幅
    pub contrast_factor: f32,
}

impl Default for Augmenter {
    fn default() -> Self {
        Self {
            flip_probability: 0.5,
            rotation_factor: 0.1,
            zoom_factor: 0.1,
            contrast_factor: 0.1,
        }
    }
}

/// 1枚分の変換パラメータ
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AugmentParams {
    pub flip: bool,
    /// ラジアン
    pub angle: f32,
    /// 1より大きいと縮小（ズームアウト）
    pub zoom: f32,
    pub contrast: f32,
}

impl AugmentParams {
    /// 何も変えないパラメータ
    pub fn identity() -> Self {
        Self {
            flip: false,
            angle: 0.0,
            zoom: 1.0,
            contrast: 1.0,
        }
    }
}

impl Augmenter {
    /// ランダムな変換パラメータを引く
    pub fn sample_params<R: Rng + ?Sized>(&self, rng: &mut R) -> AugmentParams {
        AugmentParams {
            flip: rng.gen::<f32>() < self.flip_probability,
            angle: symmetric(rng, self.rotation_factor) * 2.0 * PI,
            zoom: 1.0 + symmetric(rng, self.zoom_factor),
            contrast: 1.0 + symmetric(rng, self.contrast_factor),
        }
    }

    /// ランダムに拡張した画像を返す
    pub fn augment<R: Rng + ?Sized>(&self, pixels: &[f32], size: usize, rng: &mut R) -> Vec<f32> {
        apply(pixels, size, self.sample_params(rng))
    }
}

fn symmetric<R: Rng + ?Sized>(rng: &mut R, factor: f32) -> f32 {
    if factor <= 0.0 {
        0.0
    } else {
        rng.gen_range(-factor..=factor)
    }
}

/// 変換パラメータを適用する
pub fn apply(pixels: &[f32], size: usize, params: AugmentParams) -> Vec<f32> {
    let geometric = params.flip || params.angle != 0.0 || params.zoom != 1.0;
    let mut out = if geometric {
        warp(pixels, size, params)
    } else {
        pixels.to_vec()
    };
    if params.contrast != 1.0 {
        adjust_contrast(&mut out, size, params.contrast);
    }
    out
}

/// 反転・回転・ズームを出力画素からの逆写像で適用する
fn warp(pixels: &[f32], size: usize, params: AugmentParams) -> Vec<f32> {
    let plane = size * size;
    let center = (size as f32 - 1.0) / 2.0;
    let (sin, cos) = params.angle.sin_cos();
    let mut out = vec![0.0f32; CHANNELS * plane];

    for y in 0..size {
        for x in 0..size {
            let u = x as f32 - center;
            let v = y as f32 - center;
            // 逆回転してからズーム
            let mut sx = (cos * u + sin * v) * params.zoom;
            let sy = (-sin * u + cos * v) * params.zoom;
            if params.flip {
                sx = -sx;
            }
            let sx = sx + center;
            let sy = sy + center;

            for c in 0..CHANNELS {
                out[c * plane + y * size + x] = bilinear(&pixels[c * plane..(c + 1) * plane], size, sx, sy);
            }
        }
    }

    out
}

fn bilinear(channel: &[f32], size: usize, x: f32, y: f32) -> f32 {
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let (x0, y0) = (x0 as i64, y0 as i64);

    let at = |xi: i64, yi: i64| {
        let xi = reflect_index(xi, size);
        let yi = reflect_index(yi, size);
        channel[yi * size + xi]
    };

    let top = at(x0, y0) * (1.0 - fx) + at(x0 + 1, y0) * fx;
    let bottom = at(x0, y0 + 1) * (1.0 - fx) + at(x0 + 1, y0 + 1) * fx;
    top * (1.0 - fy) + bottom * fy
}

/// 範囲外の添字を端で鏡像反転する
fn reflect_index(index: i64, size: usize) -> usize {
    let n = size as i64;
    let m = index.rem_euclid(2 * n);
    (if m >= n { 2 * n - 1 - m } else { m }) as usize
}

/// チャネル平均を中心にコントラストを変え、[0, 1] に切り詰める
fn adjust_contrast(pixels: &mut [f32], size: usize, factor: f32) {
    let plane = size * size;
    for channel in pixels.chunks_mut(plane) {
        let mean = channel.iter().sum::<f32>() / plane as f32;
        for v in channel.iter_mut() {
            *v = ((*v - mean) * factor + mean).clamp(0.0, 1.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn gradient(size: usize) -> Vec<f32> {
        let mut data = Vec::with_capacity(CHANNELS * size * size);
        for _ in 0..CHANNELS {
            for y in 0..size {
                for x in 0..size {
                    data.push((x + y) as f32 / (2 * size) as f32);
                }
            }
        }
        data
    }

    #[test]
    fn test_identity_keeps_pixels() {
        let pixels = gradient(8);
        assert_eq!(apply(&pixels, 8, AugmentParams::identity()), pixels);
    }

    #[test]
    fn test_flip_mirrors_rows() {
        let pixels = gradient(6);
        let params = AugmentParams {
            flip: true,
            ..AugmentParams::identity()
        };
        let flipped = apply(&pixels, 6, params);
        for y in 0..6 {
            for x in 0..6 {
                let a = flipped[y * 6 + x];
                let b = pixels[y * 6 + (5 - x)];
                assert!((a - b).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_reflect_index() {
        assert_eq!(reflect_index(-1, 4), 0);
        assert_eq!(reflect_index(-2, 4), 1);
        assert_eq!(reflect_index(4, 4), 3);
        assert_eq!(reflect_index(5, 4), 2);
        assert_eq!(reflect_index(2, 4), 2);
    }

    #[test]
    fn test_contrast_keeps_mean_and_range() {
        let mut pixels = gradient(8);
        let before: f32 = pixels[..64].iter().sum::<f32>() / 64.0;
        adjust_contrast(&mut pixels, 8, 0.9);
        let after: f32 = pixels[..64].iter().sum::<f32>() / 64.0;
        assert!((before - after).abs() < 1e-4);
        assert!(pixels.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_random_params_within_bounds() {
        let augmenter = Augmenter::default();
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..100 {
            let p = augmenter.sample_params(&mut rng);
            assert!(p.angle.abs() <= 0.1 * 2.0 * PI + 1e-6);
            assert!((0.9 - 1e-6..=1.1 + 1e-6).contains(&p.zoom));
            assert!((0.9 - 1e-6..=1.1 + 1e-6).contains(&p.contrast));
        }
        let out = augmenter.augment(&gradient(8), 8, &mut rng);
        assert_eq!(out.len(), CHANNELS * 64);
        assert!(out.iter().all(|v| (0.0..=1.0).contains(v)));
    }
}
