//! アプリケーション設定管理モジュール
//!
//! 計算デバイス、データセット・出力先パス、モデル/学習/負例合成の設定を
//! JSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 計算デバイスの種類
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl Default for DeviceType {
    fn default() -> Self {
        DeviceType::Wgpu
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// 入出力パス設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    /// IndCardデータセットのルート（`Original/` と `Augmented/` を含む）
    pub dataset_dir: PathBuf,
    /// ネイティブ形式モデル・単一ファイル形式・メタデータの出力先
    pub model_output_dir: PathBuf,
    /// ブラウザ向けモデルの出力先
    pub web_output_dir: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            dataset_dir: PathBuf::from("MASK-RCNN-Dataset-master/IndCard"),
            model_output_dir: PathBuf::from("ml-model/saved_model"),
            web_output_dir: PathBuf::from("public/ml-model"),
        }
    }
}

impl PathSettings {
    /// ネイティブ形式モデルのディレクトリ
    pub fn native_model_dir(&self) -> PathBuf {
        self.model_output_dir.join("id_verification_model")
    }

    /// 単一ファイル形式（tar.gz）のパス
    pub fn bundle_path(&self) -> PathBuf {
        self.model_output_dir.join("id_verification_model.tar.gz")
    }

    /// メタデータJSONのパス
    pub fn metadata_path(&self) -> PathBuf {
        self.model_output_dir.join("model_metadata.json")
    }

    /// 有効なID画像（原本）のディレクトリ
    pub fn original_dir(&self) -> PathBuf {
        self.dataset_dir.join("Original")
    }

    /// 有効なID画像（拡張済み）のディレクトリ
    pub fn augmented_dir(&self) -> PathBuf {
        self.dataset_dir.join("Augmented")
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// 入力画像サイズ（正方形、ピクセル）
    pub image_size: usize,
    /// 畳み込みブロック後のドロップアウト率
    pub conv_dropout: f64,
    /// 1つ目の全結合層後のドロップアウト率
    pub dense_dropout: f64,
    /// 2つ目の全結合層後のドロップアウト率
    pub head_dropout: f64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            image_size: 224,
            conv_dropout: 0.25,
            dense_dropout: 0.5,
            head_dropout: 0.3,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// ワーカー数
    pub num_workers: usize,
    /// 学習率
    pub learning_rate: f64,
    /// ランダムシード
    pub seed: u64,
    /// 学習に使わないデータの割合（検証+テスト）
    pub holdout_ratio: f32,
    /// ホールドアウトのうちテストに回す割合
    pub test_ratio_of_holdout: f32,
    /// 早期終了の待機エポック数（val_loss監視）
    pub early_stopping_patience: usize,
    /// 学習率減衰の係数
    pub lr_decay_factor: f64,
    /// 学習率減衰の待機エポック数
    pub lr_decay_patience: usize,
    /// 学習率の下限
    pub min_learning_rate: f64,
    /// 改善とみなす検証損失の最小減少量
    pub lr_min_delta: f64,
    /// 学習時のデータ拡張を有効にするか
    pub augment: bool,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 30,
            batch_size: 8,
            num_workers: 1,
            learning_rate: 1e-3,
            seed: 42,
            holdout_ratio: 0.3,
            test_ratio_of_holdout: 0.5,
            early_stopping_patience: 5,
            lr_decay_factor: 0.5,
            lr_decay_patience: 3,
            min_learning_rate: 1e-6,
            lr_min_delta: crate::ml::scheduler::PLATEAU_MIN_DELTA,
            augment: true,
        }
    }
}

/// 負例合成の設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisSettings {
    /// 生成する負例の数。Noneなら正例と同数
    pub num_negatives: Option<usize>,
    /// 劣化画像に加えるガウスノイズの標準偏差
    pub distortion_std: f32,
    /// ぼかし画像の縮小サイズ
    pub blur_size: u32,
    /// ぼかし画像に加えるガウスノイズの標準偏差
    pub blur_noise_std: f32,
}

impl Default for SynthesisSettings {
    fn default() -> Self {
        Self {
            num_negatives: None,
            distortion_std: 0.3,
            blur_size: 16,
            blur_noise_std: 0.1,
        }
    }
}

/// アプリケーション設定
///
/// 欠けているセクションや項目はデフォルト値で補います。
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    /// 入出力パス
    pub paths: PathSettings,
    /// モデル設定
    pub model: ModelSettings,
    /// トレーニング設定
    pub training: TrainingSettings,
    /// 負例合成の設定
    pub synthesis: SynthesisSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 指定パスから設定を読み込む、読めない場合はデフォルト設定を返す
    pub fn load_from_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    tracing::info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            tracing::info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// 設定情報を表示
    pub fn display(&self) {
        println!("=== アプリケーション設定 ===");
        println!("計算デバイス: {}", self.device_type);
        println!("データセット: {}", self.paths.dataset_dir.display());
        println!("モデル出力先: {}", self.paths.model_output_dir.display());
        println!("ブラウザ向け出力先: {}", self.paths.web_output_dir.display());
        println!("入力サイズ: {}x{}", self.model.image_size, self.model.image_size);
        println!("\n--- トレーニング設定 ---");
        println!("エポック数: {}", self.training.num_epochs);
        println!("バッチサイズ: {}", self.training.batch_size);
        println!("学習率: {}", self.training.learning_rate);
        println!("シード: {}", self.training.seed);
        println!(
            "早期終了: patience={} / 学習率減衰: x{} (patience={}, min={}, min_delta={})",
            self.training.early_stopping_patience,
            self.training.lr_decay_factor,
            self.training.lr_decay_patience,
            self.training.min_learning_rate,
            self.training.lr_min_delta
        );
        println!("========================\n");
    }
}
