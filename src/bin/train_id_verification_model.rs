//! ID画像判定モデルの学習
//!
//! データセットを読み込み、負例を合成して学習し、3形式とメタデータを書き出します。

#![recursion_limit = "256"]

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use id_verification::ml::run_training;
use id_verification::model::AppConfig;
use id_verification::utils::{init_logging, VerificationError};

#[derive(Parser, Debug)]
#[command(name = "train_id_verification_model", about = "ID画像判定モデルを学習します")]
struct Args {
    /// 設定ファイル（省略時は config.json、なければデフォルト設定）
    #[arg(long)]
    config: Option<PathBuf>,

    /// 詳細ログを出力
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    println!("{}", "=".repeat(60));
    println!("ID Card Verification Model Training");
    println!("{}", "=".repeat(60));

    let config = AppConfig::load_from_or_default(args.config.unwrap_or_else(AppConfig::default_path));
    config.display();

    let report = match run_training(&config) {
        Ok(report) => report,
        Err(e) => {
            if let Some(terminal) = e.downcast_ref::<VerificationError>() {
                println!("✗ {}", terminal);
                if let Some(hint) = terminal.hint() {
                    println!("  {}", hint);
                }
                return Ok(());
            }
            return Err(e);
        }
    };

    println!("\n=== 学習結果 ===");
    println!(
        "データ: 学習 {} / 検証 {} / テスト {}",
        report.train_size, report.validation_size, report.test_size
    );
    println!("実行エポック数: {}", report.epochs_run);
    if let (Some(epoch), Some(loss)) = (report.best_epoch, report.best_val_loss) {
        println!("最良エポック: {} (val_loss: {:.4})", epoch, loss);
    }
    println!("最終学習率: {:.2e}", report.final_learning_rate);
    println!("\n保存先:");
    println!("  ネイティブ形式: {}", report.native_dir.display());
    println!("  単一ファイル形式: {}", report.bundle_path.display());
    match &report.web_path {
        Some(path) => println!("  ブラウザ形式: {}", path.display()),
        None => println!("  ブラウザ形式: (スキップ)"),
    }
    println!("  メタデータ: {}", report.metadata_path.display());

    println!("\n次のステップ:");
    println!("1. test_model でモデルを確認してください");
    println!(
        "2. ブラウザ形式のモデルを {} から配信してください",
        config.paths.web_output_dir.display()
    );
    println!("{}", "=".repeat(60));

    Ok(())
}
