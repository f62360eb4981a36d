//! モデルメタデータの定義
//!
//! 学習済みモデルに添えるJSON。キーは固定で、このクレート自身は読み返しません。
//!
//! ```json
//! {
//!   "model_name": "ID Card Verification Model",
//!   "version": "1.0.0",
//!   "input_shape": [224, 224, 3],
//!   "output": "probability (0-1), >0.5 = valid ID card",
//!   "classes": ["invalid", "valid"],
//!   "training_dataset": "IndCard (MASK-RCNN-Dataset)",
//!   "accuracy": "0.9512"
//! }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ml::{CHANNELS, CLASS_NAMES};

pub const MODEL_NAME: &str = "ID Card Verification Model";
pub const MODEL_VERSION: &str = "1.0.0";
pub const TRAINING_DATASET: &str = "IndCard (MASK-RCNN-Dataset)";

/// モデルメタデータ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub model_name: String,
    pub version: String,
    /// [高さ, 幅, チャネル]
    pub input_shape: [usize; 3],
    /// 出力の意味
    pub output: String,
    /// インデックス順のクラス名
    pub classes: Vec<String>,
    pub training_dataset: String,
    /// テストデータでの正解率（小数4桁）。未評価なら学習ログを参照する旨
    pub accuracy: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(image_size: usize, test_accuracy: Option<f64>) -> Self {
        let accuracy = match test_accuracy {
            Some(acc) => format!("{acc:.4}"),
            None => "See training logs".to_string(),
        };

        Self {
            model_name: MODEL_NAME.to_string(),
            version: MODEL_VERSION.to_string(),
            input_shape: [image_size, image_size, CHANNELS],
            output: "probability (0-1), >0.5 = valid ID card".to_string(),
            classes: CLASS_NAMES.iter().map(|s| s.to_string()).collect(),
            training_dataset: TRAINING_DATASET.to_string(),
            accuracy,
        }
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_keys() {
        let metadata = ModelMetadata::new(224, Some(0.95));
        let value: serde_json::Value =
            serde_json::from_str(&metadata.to_json_string().unwrap()).unwrap();
        let mut keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "accuracy",
                "classes",
                "input_shape",
                "model_name",
                "output",
                "training_dataset",
                "version"
            ]
        );
        assert_eq!(value["input_shape"], serde_json::json!([224, 224, 3]));
        assert_eq!(value["classes"], serde_json::json!(["invalid", "valid"]));
        assert_eq!(value["accuracy"], "0.9500");
    }

    #[test]
    fn test_accuracy_placeholder() {
        let metadata = ModelMetadata::new(128, None);
        assert_eq!(metadata.accuracy, "See training logs");
        assert_eq!(metadata.input_shape, [128, 128, 3]);
    }

    #[test]
    fn test_json_roundtrip() {
        let metadata = ModelMetadata::new(64, Some(0.5));
        let json = metadata.to_json_string().unwrap();
        assert_eq!(ModelMetadata::from_json_string(&json).unwrap(), metadata);
    }
}
