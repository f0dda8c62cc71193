//! VGG16転移学習パイプラインのCLI

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use cnn_classifier_lib::config::{ConfigurationManager, CONFIG_FILE_PATH, PARAMS_FILE_PATH};
use cnn_classifier_lib::logging::{init_logging, LOG_DIR};
use cnn_classifier_lib::ml::PredictionPipeline;
use cnn_classifier_lib::pipeline::{
    run_all, run_stage, DataIngestionTrainingPipeline, EvaluationPipeline,
    ModelTrainingPipeline, PrepareBaseModelTrainingPipeline,
};

/// 画像分類モデルの学習パイプライン
#[derive(Parser, Debug)]
#[command(name = "cnn_classifier")]
#[command(version)]
#[command(about = "Staged VGG16 transfer learning for image classification", long_about = None)]
struct Cli {
    /// パス設定ファイル
    #[arg(long, global = true, default_value = CONFIG_FILE_PATH)]
    config: PathBuf,

    /// ハイパーパラメータファイル
    #[arg(long, global = true, default_value = PARAMS_FILE_PATH)]
    params: PathBuf,

    /// デバッグログを出力
    #[arg(short, long, global = true, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// データセットをダウンロードして展開
    Ingest,

    /// VGG16を準備し、分類層を付けて保存
    PrepareBaseModel,

    /// モデルを学習
    Train,

    /// モデルを評価し、実験トラッキングに記録
    Evaluate,

    /// 4つのステージを順に実行
    Run,

    /// 画像1枚を分類し、結果をJSONで出力
    Predict {
        /// 入力画像
        image: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_path = init_logging(Path::new(LOG_DIR), cli.verbose)?;
    tracing::debug!("ログファイル: {}", log_path.display());

    let manager = ConfigurationManager::new(&cli.config, &cli.params).with_context(|| {
        format!(
            "設定を読み込めません: {}, {}",
            cli.config.display(),
            cli.params.display()
        )
    })?;

    match cli.command {
        Commands::Ingest => run_stage(DataIngestionTrainingPipeline::STAGE_NAME, || {
            DataIngestionTrainingPipeline::main(&manager)
        })?,
        Commands::PrepareBaseModel => run_stage(PrepareBaseModelTrainingPipeline::STAGE_NAME, || {
            PrepareBaseModelTrainingPipeline::main(&manager)
        })?,
        Commands::Train => run_stage(ModelTrainingPipeline::STAGE_NAME, || {
            ModelTrainingPipeline::main(&manager)
        })?,
        Commands::Evaluate => run_stage(EvaluationPipeline::STAGE_NAME, || {
            EvaluationPipeline::main(&manager)
        })?,
        Commands::Run => run_all(&manager)?,
        Commands::Predict { image } => {
            let result = PredictionPipeline::new(&image, manager.prediction_config()).predict()?;
            println!("{}", serde_json::to_string(&result)?);
        }
    }

    Ok(())
}
