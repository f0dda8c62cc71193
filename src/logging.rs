//! ログ初期化
//!
//! 標準出力と `logs/run-logs-<日時>.log` の両方へ同じ内容を出力します。

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// ログ出力先ディレクトリ（デフォルト）
pub const LOG_DIR: &str = "logs";

/// ログファイル名を生成（例: run-logs-2024-05-01_12-30-00.log）
pub fn log_file_name(now: chrono::DateTime<chrono::Local>) -> String {
    format!("run-logs-{}.log", now.format("%Y-%m-%d_%H-%M-%S"))
}

/// ログを初期化し、作成したログファイルのパスを返す
///
/// `RUST_LOG` が設定されていればそちらを優先します。
pub fn init_logging(log_dir: &Path, verbose: bool) -> Result<PathBuf> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("ログディレクトリを作成できません: {}", log_dir.display()))?;

    let log_path = log_dir.join(log_file_name(chrono::Local::now()));
    let file = File::create(&log_path)
        .with_context(|| format!("ログファイルを作成できません: {}", log_path.display()))?;

    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(
            fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("ロガーの初期化に失敗しました: {e}"))?;

    Ok(log_path)
}
