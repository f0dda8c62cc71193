//! 実験トラッキング（MLflow互換）
//!
//! トラッキングURIのスキームで保存先を切り替えます。
//! - `file:` またはスキームなしのパス: ローカルの `mlruns` ディレクトリに直接書き込む
//! - `http(s)://`: MLflowトラッキングサーバーのREST APIを呼び出す
//!
//! モデルレジストリへの登録はリモートストアの場合のみ行います。

pub mod file_store;
pub mod rest_store;

use std::path::{Path, PathBuf};

use url::Url;

use crate::error::{PipelineError, Result};

pub use file_store::FileStore;
pub use rest_store::RestStore;

/// トラッキングURIを上書きする環境変数
pub const TRACKING_URI_ENV: &str = "MLFLOW_TRACKING_URI";

/// ランの終了状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
}

impl RunStatus {
    /// REST APIでの表記
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Finished => "FINISHED",
            RunStatus::Failed => "FAILED",
        }
    }

    /// FileStoreのmeta.yamlでの数値表記
    pub fn as_code(&self) -> u8 {
        match self {
            RunStatus::Running => 1,
            RunStatus::Finished => 3,
            RunStatus::Failed => 4,
        }
    }
}

/// 作成したランの情報
#[derive(Debug, Clone)]
pub struct RunInfo {
    pub experiment_id: String,
    pub run_id: String,
    pub artifact_uri: String,
}

/// トラッキングストアの共通操作
pub trait TrackingStore {
    /// 実験名に対応する実験（なければ作成）の下にランを開始する
    fn create_run(&self, experiment_name: &str, run_name: &str) -> Result<RunInfo>;

    fn log_params(&self, run: &RunInfo, params: &[(String, String)]) -> Result<()>;

    fn log_metrics(&self, run: &RunInfo, metrics: &[(String, f64)], step: i64) -> Result<()>;

    /// ローカルファイルを `artifact_path` 配下にアップロードする
    fn log_artifact(&self, run: &RunInfo, local_path: &Path, artifact_path: &str) -> Result<()>;

    /// モデルレジストリに登録し、バージョン番号を返す
    fn register_model(&self, run: &RunInfo, artifact_path: &str, name: &str) -> Result<String>;

    fn end_run(&self, run: &RunInfo, status: RunStatus) -> Result<()>;

    /// URIのスキーム（"file" / "http" / "https"）
    fn scheme(&self) -> &str;

    /// レジストリに登録するかどうか（file以外）
    fn supports_registry(&self) -> bool {
        self.scheme() != "file"
    }
}

/// トラッキングURI
#[derive(Debug, Clone, PartialEq)]
pub enum TrackingUri {
    File(PathBuf),
    Http(Url),
}

impl TrackingUri {
    pub fn parse(uri: &str) -> Result<Self> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(PipelineError::Tracking("トラッキングURIが空です".to_string()));
        }

        if let Some(rest) = uri.strip_prefix("file://") {
            return Ok(TrackingUri::File(PathBuf::from(rest)));
        }
        if let Some(rest) = uri.strip_prefix("file:") {
            return Ok(TrackingUri::File(PathBuf::from(rest)));
        }

        match Url::parse(uri) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => Ok(TrackingUri::Http(url)),
            // Windowsのドライブレター(C:\...)はスキームとして解釈されるので1文字スキームはパス扱い
            Ok(url) if url.scheme().len() == 1 => Ok(TrackingUri::File(PathBuf::from(uri))),
            Ok(url) => Err(PipelineError::Tracking(format!(
                "未対応のトラッキングURIスキームです: {}",
                url.scheme()
            ))),
            Err(_) => Ok(TrackingUri::File(PathBuf::from(uri))),
        }
    }

    pub fn scheme(&self) -> &str {
        match self {
            TrackingUri::File(_) => "file",
            TrackingUri::Http(url) => url.scheme(),
        }
    }
}

/// 環境変数 > 設定ファイル の優先順でトラッキングURIを決定
pub fn resolve_tracking_uri(configured: &str) -> String {
    match std::env::var(TRACKING_URI_ENV) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => configured.to_string(),
    }
}

/// URIに対応するストアを作成
pub fn store_for_uri(uri: &str) -> Result<Box<dyn TrackingStore>> {
    match TrackingUri::parse(uri)? {
        TrackingUri::File(root) => Ok(Box::new(FileStore::new(root))),
        TrackingUri::Http(url) => Ok(Box::new(RestStore::new(url)?)),
    }
}

/// 現在時刻（UNIXミリ秒）
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
