//! モデル学習と評価
//!
//! データセット構築 → 3分割 → 学習（早期終了・学習率減衰付き）→ テスト評価 → 保存
//! の流れを1つの関数にまとめています。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder},
    module::AutodiffModule,
    nn::loss::{BinaryCrossEntropyLoss, BinaryCrossEntropyLossConfig},
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion,
    },
};
use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::{Wgpu, WgpuDevice};

use crate::ml::augmentation::Augmenter;
use crate::ml::dataset::{
    build_dataset, in_memory, AugmentedDataset, DatasetSplits, IdCardBatch, IdCardBatcher, Label,
};
use crate::ml::metrics::BinaryMetrics;
use crate::ml::ml_model::{IdCardClassifier, ModelConfig};
use crate::ml::scheduler::{EarlyStopping, ReduceLrOnPlateau, StopDecision};
use crate::model::{self, AppConfig, DeviceType, ModelMetadata};

/// テスト評価後に表示する予測の件数
const PREDICTION_PREVIEW: usize = 10;

/// 1件の予測（表示用）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictionPreview {
    pub probability: f32,
    pub actual: i64,
}

impl PredictionPreview {
    /// しきい値で判定した結果が正解と一致するか
    pub fn is_correct(&self) -> bool {
        let predicted = self.probability > crate::ml::DECISION_THRESHOLD;
        predicted == (self.actual == Label::Valid.value())
    }
}

/// 評価結果
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    pub metrics: BinaryMetrics,
    pub previews: Vec<PredictionPreview>,
}

/// 学習結果
#[derive(Debug, Clone)]
pub struct TrainingReport {
    /// 実行したエポック数
    pub epochs_run: usize,
    /// 最良の検証損失を出したエポック（1始まり）
    pub best_epoch: Option<usize>,
    pub best_val_loss: Option<f64>,
    pub final_learning_rate: f64,
    pub train_size: usize,
    pub validation_size: usize,
    pub test_size: usize,
    pub test: Evaluation,
    pub native_dir: PathBuf,
    pub bundle_path: PathBuf,
    pub web_path: Option<PathBuf>,
    pub metadata_path: PathBuf,
}

/// 設定のデバイス種別に応じたバックエンドで学習する
pub fn run_training(config: &AppConfig) -> Result<TrainingReport> {
    tracing::info!("計算デバイス: {}", config.device_type);
    match config.device_type {
        DeviceType::Wgpu => {
            let device = WgpuDevice::default();
            train::<Autodiff<Wgpu>>(config, device)
        }
        DeviceType::Cpu => train::<Autodiff<NdArray<f32>>>(config, NdArrayDevice::Cpu),
    }
}

/// モデル学習を実行
pub fn train<B: AutodiffBackend>(config: &AppConfig, device: B::Device) -> Result<TrainingReport> {
    let started_at = chrono::Local::now();
    let timer = Instant::now();
    tracing::info!("学習開始: {}", started_at.format("%Y-%m-%d %H:%M:%S"));

    let settings = &config.training;
    let size = config.model.image_size;
    let model_config = ModelConfig::from_settings(&config.model);
    model_config.validate()?;

    let samples = build_dataset(config)?;
    let splits = DatasetSplits::new(
        samples,
        settings.holdout_ratio,
        settings.test_ratio_of_holdout,
        settings.seed,
    );
    let DatasetSplits {
        train: train_samples,
        validation: val_samples,
        test: test_samples,
    } = splits;
    let (train_size, validation_size, test_size) =
        (train_samples.len(), val_samples.len(), test_samples.len());

    tracing::info!(
        "学習データ: {} 枚 / 検証データ: {} 枚 / テストデータ: {} 枚",
        train_size,
        validation_size,
        test_size
    );
    if train_size == 0 {
        return Err(anyhow!("学習データが空です。データセットの枚数を確認してください"));
    }
    if validation_size == 0 {
        tracing::warn!("検証データが空です。学習損失でコールバックを判定します");
    }

    let augmenter = settings.augment.then(Augmenter::default);
    let train_loader = DataLoaderBuilder::new(IdCardBatcher::<B>::new(size))
        .batch_size(settings.batch_size)
        .shuffle(settings.seed)
        .num_workers(settings.num_workers)
        .set_device(device.clone())
        .build(AugmentedDataset::new(train_samples, size, augmenter, settings.seed));
    let val_loader = eval_loader::<B::InnerBackend>(val_samples, config, device.clone());
    let test_loader = eval_loader::<B::InnerBackend>(test_samples, config, device.clone());

    let mut model: IdCardClassifier<B> = model_config.init(&device);
    let mut optimizer = AdamConfig::new().init();
    let loss_fn = BinaryCrossEntropyLossConfig::new()
        .with_logits(true)
        .init(&device);
    let valid_loss_fn: BinaryCrossEntropyLoss<B::InnerBackend> = BinaryCrossEntropyLossConfig::new()
        .with_logits(true)
        .init(&device);

    let mut early_stopping = EarlyStopping::new(settings.early_stopping_patience);
    let mut lr_scheduler = ReduceLrOnPlateau::new(
        settings.learning_rate,
        settings.lr_decay_factor,
        settings.lr_decay_patience,
        settings.min_learning_rate,
    )
    .with_min_delta(settings.lr_min_delta);
    let mut best_model: Option<IdCardClassifier<B>> = None;
    let mut epochs_run = 0;

    tracing::info!(
        "エポック数: {}, バッチサイズ: {}, 学習率: {}",
        settings.num_epochs,
        settings.batch_size,
        settings.learning_rate
    );

    for epoch in 0..settings.num_epochs {
        let mut train_metrics = BinaryMetrics::default();

        for batch in train_loader.iter() {
            let logits = model.forward(batch.images.clone());
            let loss = loss_fn.forward(logits.clone(), batch.targets.clone());
            let [batch_size, _] = logits.dims();
            train_metrics.record_loss(loss.clone().into_scalar().elem::<f64>(), batch_size);

            let probabilities = burn::tensor::activation::sigmoid(logits.detach());
            train_metrics.record_predictions(
                &to_f32_vec(probabilities.reshape([batch_size]).into_data())?,
                &to_i64_vec(batch.targets.clone().into_data())?,
            );

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optimizer.step(lr_scheduler.lr(), model, grads);
        }
        epochs_run = epoch + 1;

        let val = evaluate(&model.valid(), &valid_loss_fn, val_loader.as_ref())?;
        let monitored = if validation_size > 0 {
            val.metrics.avg_loss()
        } else {
            train_metrics.avg_loss()
        };

        tracing::info!(
            "epoch {:>3}/{:<3} | loss: {:.4} | acc: {:.4} | val_loss: {:.4} | val_acc: {:.4} | lr: {:.2e}",
            epochs_run,
            settings.num_epochs,
            train_metrics.avg_loss(),
            train_metrics.accuracy(),
            val.metrics.avg_loss(),
            val.metrics.accuracy(),
            lr_scheduler.lr()
        );

        if let Some(lr) = lr_scheduler.observe(monitored) {
            tracing::info!("学習率を {:.2e} に下げました", lr);
        }

        match early_stopping.observe(epoch, monitored) {
            StopDecision::Improved => best_model = Some(model.clone()),
            StopDecision::Continue => {}
            StopDecision::Stop => {
                tracing::info!(
                    "{} エポック改善がないため早期終了します",
                    settings.early_stopping_patience
                );
                break;
            }
        }
    }

    if let (Some(best), Some(best_epoch)) = (best_model, early_stopping.best_epoch()) {
        tracing::info!("最良の重み（epoch {}）に戻します", best_epoch + 1);
        model = best;
    }
    let model = model.valid();

    let test = evaluate(&model, &valid_loss_fn, test_loader.as_ref())?;
    print_evaluation(&test);

    let test_accuracy = (test.metrics.examples() > 0).then(|| test.metrics.accuracy());
    let metadata = ModelMetadata::new(size, test_accuracy);
    let paths = &config.paths;

    let native_dir = paths.native_model_dir();
    model::save_native(&native_dir, &model_config, &model)?;
    tracing::info!("ネイティブ形式で保存しました: {}", native_dir.display());

    let model_binary = model::model_to_bytes(&model)?;
    let bundle_path = model::save_bundle(&paths.bundle_path(), &metadata, &model_config, &model_binary)?;
    tracing::info!("単一ファイル形式で保存しました: {}", bundle_path.display());

    let web_path = match model::export_web(&paths.web_output_dir, &metadata, &model_config, &model_binary) {
        Ok(path) => {
            tracing::info!("ブラウザ形式で保存しました: {}", path.display());
            Some(path)
        }
        Err(e) => {
            tracing::warn!("ブラウザ形式への変換をスキップしました: {:#}", e);
            None
        }
    };

    let metadata_path = paths.metadata_path();
    model::save_metadata(&metadata_path, &metadata)
        .context("メタデータの保存に失敗しました")?;
    tracing::info!("メタデータを保存しました: {}", metadata_path.display());

    tracing::info!(
        "学習完了: {} ({:.1} 秒)",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        timer.elapsed().as_secs_f64()
    );

    Ok(TrainingReport {
        epochs_run,
        best_epoch: early_stopping.best_epoch().map(|e| e + 1),
        best_val_loss: early_stopping.best(),
        final_learning_rate: lr_scheduler.lr(),
        train_size,
        validation_size,
        test_size,
        test,
        native_dir,
        bundle_path,
        web_path,
        metadata_path,
    })
}

fn eval_loader<B: Backend>(
    samples: Vec<crate::ml::Sample>,
    config: &AppConfig,
    device: B::Device,
) -> Arc<dyn DataLoader<B, IdCardBatch<B>>> {
    DataLoaderBuilder::new(IdCardBatcher::<B>::new(config.model.image_size))
        .batch_size(config.training.batch_size)
        .num_workers(config.training.num_workers)
        .set_device(device)
        .build(in_memory(samples))
}

/// 損失と混同行列を集計する（ドロップアウトなし）
pub fn evaluate<B: Backend>(
    model: &IdCardClassifier<B>,
    loss_fn: &BinaryCrossEntropyLoss<B>,
    loader: &dyn DataLoader<B, IdCardBatch<B>>,
) -> Result<Evaluation> {
    let mut evaluation = Evaluation::default();

    for batch in loader.iter() {
        let logits = model.forward(batch.images.clone());
        let loss = loss_fn.forward(logits.clone(), batch.targets.clone());
        let [batch_size, _] = logits.dims();
        evaluation
            .metrics
            .record_loss(loss.into_scalar().elem::<f64>(), batch_size);
        let probabilities =
            to_f32_vec(burn::tensor::activation::sigmoid(logits).reshape([batch_size]).into_data())?;
        let targets = to_i64_vec(batch.targets.into_data())?;
        evaluation.metrics.record_predictions(&probabilities, &targets);

        for (probability, actual) in probabilities.iter().zip(&targets) {
            if evaluation.previews.len() >= PREDICTION_PREVIEW {
                break;
            }
            evaluation.previews.push(PredictionPreview {
                probability: *probability,
                actual: *actual,
            });
        }
    }

    Ok(evaluation)
}

/// テスト評価の結果を表示
pub fn print_evaluation(evaluation: &Evaluation) {
    let metrics = &evaluation.metrics;
    println!("\n=== テストデータでの評価 ===");
    println!("サンプル数: {}", metrics.examples());
    println!("Test Loss: {:.4}", metrics.avg_loss());
    println!("Test Accuracy: {:.4}", metrics.accuracy());
    println!("Test Precision: {:.4}", metrics.precision());
    println!("Test Recall: {:.4}", metrics.recall());

    if !evaluation.previews.is_empty() {
        println!("\n--- 予測サンプル ---");
        for preview in &evaluation.previews {
            let mark = if preview.is_correct() { "✓" } else { "✗" };
            println!(
                "{} Pred: {:.3} | Actual: {}",
                mark, preview.probability, preview.actual
            );
        }
    }
    println!("============================");
}

fn to_f32_vec(data: burn::tensor::TensorData) -> Result<Vec<f32>> {
    data.convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow!("予測テンソルの読み出しエラー: {:?}", e))
}

fn to_i64_vec(data: burn::tensor::TensorData) -> Result<Vec<i64>> {
    data.convert::<i64>()
        .to_vec::<i64>()
        .map_err(|e| anyhow!("ラベルテンソルの読み出しエラー: {:?}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::Sample;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_prediction_preview_correctness() {
        let hit = PredictionPreview {
            probability: 0.9,
            actual: 1,
        };
        let miss = PredictionPreview {
            probability: 0.5,
            actual: 1,
        };
        let negative = PredictionPreview {
            probability: 0.1,
            actual: 0,
        };
        assert!(hit.is_correct());
        assert!(!miss.is_correct());
        assert!(negative.is_correct());
    }

    #[test]
    fn test_evaluate_collects_previews() {
        let device = NdArrayDevice::Cpu;
        let mut config = AppConfig::default();
        config.model.image_size = 16;
        config.training.batch_size = 4;

        let pixels = vec![0.5f32; 3 * 16 * 16];
        let samples: Vec<Sample> = (0..12)
            .map(|i| {
                let label = if i % 2 == 0 { Label::Valid } else { Label::Invalid };
                Sample::new(pixels.clone(), label)
            })
            .collect();

        let model = ModelConfig::new()
            .with_image_size(16)
            .init::<TestBackend>(&device);
        let loss_fn = BinaryCrossEntropyLossConfig::new()
            .with_logits(true)
            .init(&device);
        let loader = eval_loader::<TestBackend>(samples, &config, device);

        let evaluation = evaluate(&model, &loss_fn, loader.as_ref()).unwrap();
        assert_eq!(evaluation.metrics.examples(), 12);
        assert_eq!(evaluation.previews.len(), PREDICTION_PREVIEW);
        assert!(evaluation.metrics.avg_loss() > 0.0);
    }
}
