//! パイプライン共通のエラー型
//!
//! 呼び出し側で分岐したいエラーだけを列挙します。
//! ステージ単位のエラー伝播は `anyhow` で行います。

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// 設定ファイルの内容が不正
    #[error("設定エラー: {0}")]
    Config(String),

    /// 設定ファイルの読み込み・パース失敗
    #[error("設定ファイルを読み込めません '{path}': {message}")]
    ConfigFile { path: PathBuf, message: String },

    /// 学習データの構成が不正
    #[error("データセットエラー: {0}")]
    Dataset(String),

    /// 画像の読み込み失敗
    #[error("画像を読み込めません '{0}': {1}")]
    ImageLoad(PathBuf, String),

    /// モデルの構築・読み込み・保存失敗
    #[error("モデルエラー: {0}")]
    Model(String),

    /// アーカイブ展開の失敗
    #[error("アーカイブエラー: {0}")]
    Archive(String),

    /// ダウンロード失敗
    #[error("ダウンロードエラー ({url}): {message}")]
    Download { url: String, message: String },

    /// 実験トラッキングサービスとの通信失敗
    #[error("トラッキングエラー: {0}")]
    Tracking(String),

    #[error("IOエラー: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
