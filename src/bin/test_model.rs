//! 学習済みモデルの動作確認
//!
//! 画像パスを指定するとその1枚を判定し、省略するとデータセットから無作為に数枚を判定します。

#![recursion_limit = "256"]

use std::path::PathBuf;

use anyhow::Result;
use burn::tensor::backend::Backend;
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::{Wgpu, WgpuDevice};
use clap::Parser;
use rand::seq::SliceRandom;

use id_verification::ml::dataset::list_images;
use id_verification::ml::InferenceEngine;
use id_verification::model::{load_metadata, print_metadata_info, AppConfig, DeviceType};
use id_verification::utils::{init_logging, VerificationError};

#[derive(Parser, Debug)]
#[command(name = "test_model", about = "学習済みのID画像判定モデルを試します")]
struct Args {
    /// 判定する画像（省略時はデータセットから無作為に選ぶ）
    image: Option<PathBuf>,

    /// 設定ファイル（省略時は config.json、なければデフォルト設定）
    #[arg(long)]
    config: Option<PathBuf>,

    /// 無作為に選ぶ画像の枚数
    #[arg(long, default_value_t = 5)]
    samples: usize,

    /// 詳細ログを出力
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    println!("{}", "=".repeat(60));
    println!("ID Card Verification Model Test");
    println!("{}", "=".repeat(60));

    let config = AppConfig::load_from_or_default(
        args.config.clone().unwrap_or_else(AppConfig::default_path),
    );

    let result = match config.device_type {
        DeviceType::Wgpu => run::<Wgpu>(&args, &config, WgpuDevice::default()),
        DeviceType::Cpu => run::<NdArray<f32>>(&args, &config, NdArrayDevice::Cpu),
    };

    if let Err(e) = result {
        if let Some(terminal) = e.downcast_ref::<VerificationError>() {
            println!("✗ {}", terminal);
            if let Some(hint) = terminal.hint() {
                println!("  {}", hint);
            }
            return Ok(());
        }
        return Err(e);
    }

    println!("\n{}", "=".repeat(60));
    println!("✓ テスト完了");
    Ok(())
}

fn run<B: Backend>(args: &Args, config: &AppConfig, device: B::Device) -> Result<()> {
    let engine = InferenceEngine::<B>::load_from_paths(&config.paths, device)?;
    println!(
        "✓ モデルを読み込みました (入力サイズ: {}x{})",
        engine.image_size(),
        engine.image_size()
    );

    let metadata_path = config.paths.metadata_path();
    if metadata_path.is_file() {
        match load_metadata(&metadata_path) {
            Ok(metadata) => print_metadata_info(&metadata),
            Err(e) => tracing::warn!("メタデータを読み込めませんでした: {:#}", e),
        }
    }

    if let Some(image_path) = &args.image {
        println!("\n画像を判定します: {}", image_path.display());
        let result = engine.verify_image(image_path)?;
        tracing::debug!("判定: {} (raw: {:.6})", result.status(), result.raw_score);
        let status = if result.is_valid { "✓ VALID ID CARD" } else { "✗ INVALID" };
        println!("\n  Status: {}", status);
        println!("  Confidence: {:.2}%", result.confidence * 100.0);
        println!("  Raw Score: {:.4}", result.raw_score);
        return Ok(());
    }

    let original_dir = config.paths.original_dir();
    if !original_dir.is_dir() {
        return Err(VerificationError::DatasetNotFound(original_dir).into());
    }
    let images = list_images(&original_dir)?;
    if images.is_empty() {
        return Err(VerificationError::NoImages(original_dir).into());
    }

    let count = args.samples.min(images.len());
    println!("\n{} 枚の画像を無作為に判定します\n", count);

    let mut rng = rand::thread_rng();
    for path in images.choose_multiple(&mut rng, count) {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        match engine.verify_image(path) {
            Ok(result) => {
                let status = if result.is_valid { "✓ VALID" } else { "✗ INVALID" };
                println!(
                    "  {}: {} (confidence: {:.2}%)",
                    name,
                    status,
                    result.confidence * 100.0
                );
            }
            Err(e) => tracing::warn!("{} の判定に失敗しました: {:#}", name, e),
        }
    }

    Ok(())
}
