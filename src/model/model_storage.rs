//! 学習済みモデルの永続化
//!
//! 同じネットワークを3つの形式で保存します。
//!
//! - ネイティブ形式（ディレクトリ）: `config.json` + `model.mpk`
//! - 単一ファイル形式（tar.gz）: `metadata.json` + `config.json` + `model.bin`
//! - ブラウザ形式（ディレクトリ）: `model.json`（設定・メタデータ・base64化した重み）
//!
//! ブラウザ形式は `web-export` フィーチャーが有効な場合のみ出力できます。

use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use burn::{
    config::Config,
    module::Module,
    record::{BinBytesRecorder, DefaultFileRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder};

use crate::ml::{IdCardClassifier, ModelConfig};
use crate::model::model_metadata::ModelMetadata;
use crate::utils::VerificationError;

const CONFIG_FILE: &str = "config.json";
const WEIGHTS_STEM: &str = "model";
const BUNDLE_METADATA: &str = "metadata.json";
const BUNDLE_WEIGHTS: &str = "model.bin";

/// モデルの重みをバイト列に変換
pub fn model_to_bytes<B: Backend>(model: &IdCardClassifier<B>) -> Result<Vec<u8>> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    Recorder::<B>::record(&recorder, model.clone().into_record(), ())
        .map_err(|e| anyhow!("モデル重みのシリアライズエラー: {:?}", e))
}

/// バイト列から重みを復元
pub fn model_from_bytes<B: Backend>(
    config: &ModelConfig,
    bytes: Vec<u8>,
    device: &B::Device,
) -> Result<IdCardClassifier<B>> {
    config.validate()?;
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let record = recorder
        .load(bytes, device)
        .map_err(|e| anyhow!("モデル重みの読み込みエラー: {:?}", e))?;
    Ok(config.init::<B>(device).load_record(record))
}

/// ネイティブ形式で保存
pub fn save_native<B: Backend>(
    dir: &Path,
    config: &ModelConfig,
    model: &IdCardClassifier<B>,
) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create model directory: {:?}", dir))?;

    config
        .save(dir.join(CONFIG_FILE))
        .with_context(|| format!("Failed to write {CONFIG_FILE} in {:?}", dir))?;

    model
        .clone()
        .save_file(dir.join(WEIGHTS_STEM), &DefaultFileRecorder::<FullPrecisionSettings>::new())
        .map_err(|e| anyhow!("モデルの保存に失敗しました ({}): {:?}", dir.display(), e))?;

    Ok(())
}

/// ネイティブ形式から読み込み
pub fn load_native<B: Backend>(
    dir: &Path,
    device: &B::Device,
) -> Result<(ModelConfig, IdCardClassifier<B>)> {
    if !dir.is_dir() {
        return Err(VerificationError::ModelNotFound(dir.to_path_buf()).into());
    }

    let config = ModelConfig::load(dir.join(CONFIG_FILE))
        .map_err(|e| anyhow!("モデル設定の読み込みエラー ({}): {:?}", dir.display(), e))?;
    config
        .validate()
        .with_context(|| format!("モデル設定が不正です: {}", dir.display()))?;

    let model = config
        .init::<B>(device)
        .load_file(
            dir.join(WEIGHTS_STEM),
            &DefaultFileRecorder::<FullPrecisionSettings>::new(),
            device,
        )
        .map_err(|e| anyhow!("モデル重みの読み込みエラー ({}): {:?}", dir.display(), e))?;

    Ok((config, model))
}

/// 単一ファイル形式（tar.gz）で保存
pub fn save_bundle(
    output_path: &Path,
    metadata: &ModelMetadata,
    config: &ModelConfig,
    model_binary: &[u8],
) -> Result<PathBuf> {
    // output_pathがすでに.gzで終わっている場合はそのまま、そうでなければ拡張子を追加
    let tar_gz_path = if output_path.extension().and_then(|s| s.to_str()) == Some("gz") {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    };

    if let Some(parent) = tar_gz_path.parent() {
        std::fs::create_dir_all(parent)
            .context(format!("Failed to create parent directory: {:?}", parent))?;
    }

    let tar_gz_file = File::create(&tar_gz_path)
        .context(format!("Failed to create tar.gz file: {:?}", tar_gz_path))?;

    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    let metadata_json = metadata.to_json_string()?;
    append_entry(&mut tar_builder, BUNDLE_METADATA, metadata_json.as_bytes())?;
    append_entry(&mut tar_builder, CONFIG_FILE, config.to_string().as_bytes())?;
    append_entry(&mut tar_builder, BUNDLE_WEIGHTS, model_binary)?;

    tar_builder
        .into_inner()
        .context("Failed to finalize tar.gz archive")?
        .finish()
        .context("Failed to finish gzip stream")?;

    Ok(tar_gz_path)
}

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, bytes)
        .with_context(|| format!("Failed to add {name} to tar"))
}

/// 単一ファイル形式の中身
pub struct ModelBundle {
    pub metadata: ModelMetadata,
    pub config: ModelConfig,
    pub model_binary: Vec<u8>,
}

impl ModelBundle {
    /// 重みを復元してモデルを作る
    pub fn into_model<B: Backend>(self, device: &B::Device) -> Result<IdCardClassifier<B>> {
        model_from_bytes(&self.config, self.model_binary, device)
    }
}

/// 単一ファイル形式（tar.gz）から読み込む
pub fn load_bundle(tar_gz_path: &Path) -> Result<ModelBundle> {
    if !tar_gz_path.is_file() {
        return Err(VerificationError::ModelNotFound(tar_gz_path.to_path_buf()).into());
    }

    let tar_gz_file = File::open(tar_gz_path)
        .context(format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;

    let decoder = GzDecoder::new(tar_gz_file);
    let mut archive = Archive::new(decoder);

    let mut metadata_opt: Option<ModelMetadata> = None;
    let mut config_opt: Option<ModelConfig> = None;
    let mut model_binary_opt: Option<Vec<u8>> = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?;

        match path.to_str() {
            Some(BUNDLE_METADATA) => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str)?;
                metadata_opt = Some(ModelMetadata::from_json_string(&json_str)?);
            }
            Some(CONFIG_FILE) => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str)?;
                config_opt = Some(
                    serde_json::from_str(&json_str)
                        .context("Failed to deserialize model config from JSON")?,
                );
            }
            Some(BUNDLE_WEIGHTS) => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                model_binary_opt = Some(buffer);
            }
            _ => {}
        }
    }

    match (metadata_opt, config_opt, model_binary_opt) {
        (Some(metadata), Some(config), Some(model_binary)) => Ok(ModelBundle {
            metadata,
            config,
            model_binary,
        }),
        (None, _, _) => Err(anyhow!("{BUNDLE_METADATA} not found in tar.gz archive")),
        (_, None, _) => Err(anyhow!("{CONFIG_FILE} not found in tar.gz archive")),
        (_, _, None) => Err(anyhow!("{BUNDLE_WEIGHTS} not found in tar.gz archive")),
    }
}

/// メタデータJSONを書き出す
pub fn save_metadata(path: &Path, metadata: &ModelMetadata) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }
    }
    std::fs::write(path, metadata.to_json_string()?)
        .with_context(|| format!("Failed to write metadata: {:?}", path))
}

/// メタデータJSONを読み込む
pub fn load_metadata(path: &Path) -> Result<ModelMetadata> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read metadata: {:?}", path))?;
    ModelMetadata::from_json_string(&json)
}

/// ブラウザ形式で書き出す
///
/// `model.json` にモデル設定・メタデータ・base64化した重みをまとめます。
#[cfg(feature = "web-export")]
pub fn export_web(
    dir: &Path,
    metadata: &ModelMetadata,
    config: &ModelConfig,
    model_binary: &[u8],
) -> Result<PathBuf> {
    use base64::Engine;

    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create web model directory: {:?}", dir))?;

    let document = serde_json::json!({
        "format": "burn-bin-base64",
        "format_version": 1,
        "precision": "f32",
        "metadata": metadata,
        "config": config,
        "weights": base64::engine::general_purpose::STANDARD.encode(model_binary),
    });

    let path = dir.join("model.json");
    let file = File::create(&path).with_context(|| format!("Failed to create {:?}", path))?;
    serde_json::to_writer(file, &document)
        .with_context(|| format!("Failed to write {:?}", path))?;

    Ok(path)
}

/// ブラウザ形式で書き出す（フィーチャー無効時）
#[cfg(not(feature = "web-export"))]
pub fn export_web(
    _dir: &Path,
    _metadata: &ModelMetadata,
    _config: &ModelConfig,
    _model_binary: &[u8],
) -> Result<PathBuf> {
    Err(anyhow!(
        "web-export フィーチャーが無効です。`cargo build --features web-export` で再ビルドしてください"
    ))
}

/// メタデータをコンソールに表示
pub fn print_metadata_info(metadata: &ModelMetadata) {
    println!("\n=== モデルメタデータ ===");
    println!("モデル名: {} (v{})", metadata.model_name, metadata.version);
    println!(
        "入力形状: {}x{}x{}",
        metadata.input_shape[0], metadata.input_shape[1], metadata.input_shape[2]
    );
    println!("出力: {}", metadata.output);
    println!("クラス: {}", metadata.classes.join(", "));
    println!("学習データ: {}", metadata.training_dataset);
    println!("正解率: {}", metadata.accuracy);
    println!("========================");
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Tensor;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn small_config() -> ModelConfig {
        ModelConfig::new().with_image_size(16)
    }

    fn fixed_output(model: &IdCardClassifier<TestBackend>) -> Vec<f32> {
        let device = Default::default();
        let input = Tensor::<TestBackend, 4>::ones([1, 3, 16, 16], &device);
        model.forward(input).into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn test_native_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let config = small_config();
        let model = config.init::<TestBackend>(&device);

        save_native(dir.path(), &config, &model).unwrap();
        assert!(dir.path().join("config.json").is_file());
        assert!(dir.path().join("model.mpk").is_file());

        let (loaded_config, loaded) = load_native::<TestBackend>(dir.path(), &device).unwrap();
        assert_eq!(loaded_config.image_size, 16);
        assert_eq!(fixed_output(&model), fixed_output(&loaded));
    }

    #[test]
    fn test_missing_native_dir_is_model_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let err = load_native::<TestBackend>(&dir.path().join("missing"), &device)
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<VerificationError>(),
            Some(VerificationError::ModelNotFound(_))
        ));
    }

    #[test]
    fn test_undersized_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        ModelConfig::new()
            .with_image_size(8)
            .save(dir.path().join("config.json"))
            .unwrap();

        let result = load_native::<TestBackend>(dir.path(), &device);
        assert!(result.is_err());

        let config = ModelConfig::new().with_image_size(8);
        assert!(model_from_bytes::<TestBackend>(&config, Vec::new(), &device).is_err());
    }

    #[test]
    fn test_bundle_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let config = small_config();
        let model = config.init::<TestBackend>(&device);
        let metadata = ModelMetadata::new(16, Some(0.75));
        let bytes = model_to_bytes(&model).unwrap();

        let path = save_bundle(&dir.path().join("model"), &metadata, &config, &bytes).unwrap();
        assert!(path.to_string_lossy().ends_with(".tar.gz"));

        let bundle = load_bundle(&path).unwrap();
        assert_eq!(bundle.metadata, metadata);
        assert_eq!(bundle.config.image_size, 16);
        let restored = bundle.into_model::<TestBackend>(&device).unwrap();
        assert_eq!(fixed_output(&model), fixed_output(&restored));
    }

    #[test]
    fn test_save_metadata_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("model_metadata.json");
        let metadata = ModelMetadata::new(224, None);
        save_metadata(&path, &metadata).unwrap();
        assert_eq!(load_metadata(&path).unwrap(), metadata);
        assert!(load_metadata(&dir.path().join("absent.json")).is_err());
    }

    #[cfg(not(feature = "web-export"))]
    #[test]
    fn test_web_export_disabled_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = ModelMetadata::new(16, None);
        assert!(export_web(dir.path(), &metadata, &small_config(), &[1, 2, 3, 4]).is_err());
        assert!(!dir.path().join("model.json").exists());
    }

    #[cfg(feature = "web-export")]
    #[test]
    fn test_web_export_embeds_weights() {
        use base64::Engine;

        let dir = tempfile::tempdir().unwrap();
        let metadata = ModelMetadata::new(16, None);
        let path = export_web(dir.path(), &metadata, &small_config(), &[1, 2, 3, 4]).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(value["format"], "burn-bin-base64");
        assert_eq!(value["config"]["image_size"], 16);
        let weights = base64::engine::general_purpose::STANDARD
            .decode(value["weights"].as_str().unwrap())
            .unwrap();
        assert_eq!(weights, vec![1, 2, 3, 4]);
    }
}
