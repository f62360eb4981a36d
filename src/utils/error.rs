//! スクリプト終端で「メッセージを表示して終了する」条件の型付きエラー

use std::path::PathBuf;

use thiserror::Error;

/// 利用者に表示して正常終了すべき条件
///
/// バイナリ側で `anyhow::Error::downcast_ref` して判定します。
#[derive(Error, Debug)]
pub enum VerificationError {
    /// データセットディレクトリが存在しない
    #[error("データセットが見つかりません: {}", .0.display())]
    DatasetNotFound(PathBuf),

    /// データセットに読み込める画像が1枚もない
    #[error("データセットに画像がありません: {}", .0.display())]
    NoImages(PathBuf),

    /// 学習済みモデルが存在しない
    #[error("モデルが見つかりません: {}", .0.display())]
    ModelNotFound(PathBuf),

    /// 推論対象の画像が存在しない
    #[error("画像が見つかりません: {}", .0.display())]
    ImageNotFound(PathBuf),
}

impl VerificationError {
    /// 利用者向けの補足メッセージ
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            VerificationError::DatasetNotFound(_) => {
                Some("MASK-RCNN-Dataset を設定ファイルの dataset_dir に配置してください")
            }
            VerificationError::ModelNotFound(_) => {
                Some("先に train_id_verification_model を実行してください")
            }
            _ => None,
        }
    }
}
