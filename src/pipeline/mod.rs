//! ステージの実行とログ出力
//!
//! 各ステージは `run_stage` で包まれ、開始・完了・失敗をログに残します。
//! 失敗時はエラーをそのまま呼び出し元へ返します。

use anyhow::Result;

use crate::config::ConfigurationManager;
use crate::ingestion::DataIngestion;
#[cfg(feature = "ml")]
use crate::ml::{Evaluation, PrepareBaseModel, Training};

/// ステージをログ付きで実行する
pub fn run_stage<T, F>(name: &str, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    tracing::info!(">>>>>>>>>>>>>> {} STARTED <<<<<<<<<<<<<<<", name);
    match f() {
        Ok(value) => {
            tracing::info!(">>>>>>>>>>>>>> {} COMPLETED <<<<<<<<<<<<<<<", name);
            Ok(value)
        }
        Err(err) => {
            tracing::error!("Exception raised while running {}: {:#}", name, err);
            Err(err)
        }
    }
}

pub struct DataIngestionTrainingPipeline;

impl DataIngestionTrainingPipeline {
    pub const STAGE_NAME: &'static str = "Stage: Data Ingestion";

    pub fn main(config: &ConfigurationManager) -> Result<()> {
        let data_ingestion = DataIngestion::new(config.data_ingestion_config()?);
        data_ingestion.download_file()?;
        data_ingestion.extract_zip_file()?;
        Ok(())
    }
}

#[cfg(feature = "ml")]
pub struct PrepareBaseModelTrainingPipeline;

#[cfg(feature = "ml")]
impl PrepareBaseModelTrainingPipeline {
    pub const STAGE_NAME: &'static str = "Stage: Prepare Base Model";

    pub fn main(config: &ConfigurationManager) -> Result<()> {
        let prepare_base_model = PrepareBaseModel::new(config.prepare_base_model_config()?);
        prepare_base_model.get_base_model()?;
        prepare_base_model.update_base_model()?;
        Ok(())
    }
}

#[cfg(feature = "ml")]
pub struct ModelTrainingPipeline;

#[cfg(feature = "ml")]
impl ModelTrainingPipeline {
    pub const STAGE_NAME: &'static str = "Stage: Train Model";

    pub fn main(config: &ConfigurationManager) -> Result<()> {
        let training = Training::new(config.training_config()?);
        training.train()?;
        Ok(())
    }
}

#[cfg(feature = "ml")]
pub struct EvaluationPipeline;

#[cfg(feature = "ml")]
impl EvaluationPipeline {
    pub const STAGE_NAME: &'static str = "Stage: Model Evaluation";

    pub fn main(config: &ConfigurationManager) -> Result<()> {
        let mut evaluation = Evaluation::new(config.evaluation_config()?);
        evaluation.evaluate()?;
        evaluation.save_score()?;
        evaluation.log_into_mlflow()?;
        Ok(())
    }
}

/// 4つの学習ステージを順に実行する（最初の失敗で停止）
#[cfg(feature = "ml")]
pub fn run_all(config: &ConfigurationManager) -> Result<()> {
    run_stage(DataIngestionTrainingPipeline::STAGE_NAME, || {
        DataIngestionTrainingPipeline::main(config)
    })?;
    run_stage(PrepareBaseModelTrainingPipeline::STAGE_NAME, || {
        PrepareBaseModelTrainingPipeline::main(config)
    })?;
    run_stage(ModelTrainingPipeline::STAGE_NAME, || {
        ModelTrainingPipeline::main(config)
    })?;
    run_stage(EvaluationPipeline::STAGE_NAME, || EvaluationPipeline::main(config))?;
    Ok(())
}
