//! 設定ファイルを読み込み、ステージごとの設定レコードを組み立てる

use std::path::{Path, PathBuf};

use crate::config::entity::{
    DataIngestionConfig, EvaluationConfig, PredictionConfig, PrepareBaseModelConfig,
    TrainingConfig,
};
use crate::config::schema::{ConfigFile, Params, PRETRAINED_WEIGHTS_FILE};
use crate::error::{PipelineError, Result};
use crate::utils::{create_directories, read_yaml};

/// パス設定ファイルのデフォルトパス
pub const CONFIG_FILE_PATH: &str = "config/config.yaml";
/// ハイパーパラメータファイルのデフォルトパス
pub const PARAMS_FILE_PATH: &str = "params.yaml";

#[derive(Debug, Clone)]
pub struct ConfigurationManager {
    config: ConfigFile,
    params: Params,
}

impl ConfigurationManager {
    /// 2つのYAMLを読み込み、成果物ルートを作成する
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(config_path: P, params_path: Q) -> Result<Self> {
        let config: ConfigFile = read_yaml(config_path.as_ref())?;
        let params: Params = read_yaml(params_path.as_ref())?;
        Self::from_parts(config, params)
    }

    /// 読み込み済みの設定から組み立てる
    pub fn from_parts(config: ConfigFile, params: Params) -> Result<Self> {
        params.validate()?;
        validate_split("training.validation_split", config.training.validation_split)?;
        validate_split("evaluation.validation_split", config.evaluation.validation_split)?;

        create_directories(&[&config.artifacts_root])?;
        Ok(Self { config, params })
    }

    pub fn data_ingestion_config(&self) -> Result<DataIngestionConfig> {
        let section = &self.config.data_ingestion;
        create_directories(&[&section.root_dir])?;

        Ok(DataIngestionConfig {
            root_dir: section.root_dir.clone(),
            source_url: section.source_url.clone(),
            local_data_file: section.local_data_file.clone(),
            unzip_dir: section.unzip_dir.clone(),
        })
    }

    pub fn prepare_base_model_config(&self) -> Result<PrepareBaseModelConfig> {
        let section = &self.config.prepare_base_model;
        create_directories(&[&section.root_dir])?;

        Ok(PrepareBaseModelConfig {
            root_dir: section.root_dir.clone(),
            base_model_path: section.base_model_path.clone(),
            updated_base_model_path: section.updated_base_model_path.clone(),
            pretrained_weights_path: section
                .pretrained_weights_path
                .clone()
                .unwrap_or_else(|| section.root_dir.join(PRETRAINED_WEIGHTS_FILE)),
            pretrained_weights_url: section.pretrained_weights_url.clone(),
            params_image_size: self.params.image_size()?,
            params_include_top: self.params.include_top,
            params_imagenet_weights: self.params.use_imagenet_weights()?,
            params_classes: self.params.classes,
            params_freeze: self.params.freeze_spec(),
            device: self.config.device,
        })
    }

    pub fn training_config(&self) -> Result<TrainingConfig> {
        let training = &self.config.training;
        let prepare_base_model = &self.config.prepare_base_model;
        create_directories(&[&training.root_dir])?;

        Ok(TrainingConfig {
            root_dir: training.root_dir.clone(),
            trained_model_path: training.trained_model_path.clone(),
            trained_model_path_for_tracking: training.trained_model_path_for_tracking.clone(),
            updated_base_model_path: prepare_base_model.updated_base_model_path.clone(),
            training_data: training.training_data.clone(),
            validation_split: training.validation_split,
            params_epochs: self.params.epochs,
            params_batch_size: self.params.batch_size,
            params_is_augmentation: self.params.augmentation,
            params_image_size: self.params.image_size()?,
            params_learning_rate: self.params.learning_rate,
            params_seed: self.params.seed,
            params_num_workers: self.params.num_workers,
            device: self.config.device,
        })
    }

    pub fn evaluation_config(&self) -> Result<EvaluationConfig> {
        let training = &self.config.training;
        let evaluation = &self.config.evaluation;

        Ok(EvaluationConfig {
            path_of_model: training.trained_model_path.clone(),
            training_data: training.training_data.clone(),
            all_params: self.params.tracking_params()?,
            mlflow_uri: evaluation.mlflow_uri.clone(),
            score_path: evaluation.score_path.clone(),
            validation_split: evaluation.validation_split,
            experiment_name: evaluation.experiment_name.clone(),
            registered_model_name: evaluation.registered_model_name.clone(),
            params_image_size: self.params.image_size()?,
            params_batch_size: self.params.batch_size,
            device: self.config.device,
        })
    }

    pub fn prediction_config(&self) -> PredictionConfig {
        let prediction = &self.config.prediction;
        PredictionConfig {
            model_path: prediction.model_path.clone(),
            class_labels: prediction.class_labels.clone(),
            device: self.config.device,
        }
    }
}

fn validate_split(name: &str, value: f64) -> Result<()> {
    if value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(PipelineError::Config(format!(
            "{} は 0 と 1 の間である必要があります (現在: {})",
            name, value
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::DeviceType;
    use crate::model::FreezeSpec;

    fn write_configs(root: &Path, params: &str) -> (PathBuf, PathBuf) {
        let artifacts = root.join("artifacts");
        let config = format!(
            r#"artifacts_root: {a}
device: cpu
data_ingestion:
  root_dir: {a}/data_ingestion
  source_url: https://drive.google.com/file/d/abc123/view?usp=sharing
  local_data_file: {a}/data_ingestion/data.zip
  unzip_dir: {a}/data_ingestion
prepare_base_model:
  root_dir: {a}/prepare_base_model
  base_model_path: {a}/prepare_base_model/base_model.tar.gz
  updated_base_model_path: {a}/prepare_base_model/base_model_updated.tar.gz
training:
  root_dir: {a}/training
  trained_model_path: {a}/training/model.tar.gz
  trained_model_path_for_tracking: {a}/model/model.tar.gz
  training_data: {a}/data_ingestion/images
evaluation:
  mlflow_uri: file:./mlruns
"#,
            a = artifacts.display()
        );
        let config_path = root.join("config.yaml");
        let params_path = root.join("params.yaml");
        std::fs::write(&config_path, config).unwrap();
        std::fs::write(&params_path, params).unwrap();
        (config_path, params_path)
    }

    const PARAMS: &str = "AUGMENTATION: False\nIMAGE_SIZE: [64, 64, 3]\nBATCH_SIZE: 4\n\
                          INCLUDE_TOP: False\nEPOCHS: 2\nCLASSES: 2\nWEIGHTS: null\nLEARNING_RATE: 0.01\n";

    #[test]
    fn test_manager_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let (config_path, params_path) = write_configs(dir.path(), PARAMS);

        let manager = ConfigurationManager::new(&config_path, &params_path).unwrap();
        assert!(dir.path().join("artifacts").is_dir());

        let ingestion = manager.data_ingestion_config().unwrap();
        assert!(ingestion.root_dir.is_dir());
        assert!(ingestion.source_url.contains("abc123"));

        let base = manager.prepare_base_model_config().unwrap();
        assert!(base.root_dir.is_dir());
        assert_eq!(
            base.pretrained_weights_path,
            dir.path().join("artifacts/prepare_base_model/vgg16-397923af.pth")
        );
        assert!(!base.params_imagenet_weights);
        assert_eq!(base.params_freeze, FreezeSpec::All);
        assert_eq!(base.device, DeviceType::Cpu);

        let training = manager.training_config().unwrap();
        assert!(training.root_dir.is_dir());
        assert_eq!(training.validation_split, 0.2);
        assert_eq!(training.params_image_size.height, 64);
        assert_eq!(training.updated_base_model_path, base.updated_base_model_path);
    }

    #[test]
    fn test_evaluation_config_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let (config_path, params_path) = write_configs(dir.path(), PARAMS);
        let manager = ConfigurationManager::new(&config_path, &params_path).unwrap();

        let evaluation = manager.evaluation_config().unwrap();
        assert_eq!(evaluation.validation_split, 0.3);
        assert_eq!(evaluation.score_path, PathBuf::from("scores.json"));
        assert_eq!(evaluation.registered_model_name, "VGG16Model");
        assert_eq!(evaluation.experiment_name, "Default");
        assert!(evaluation.all_params.iter().any(|(k, v)| k == "EPOCHS" && v == "2"));
        assert_eq!(
            evaluation.path_of_model,
            manager.training_config().unwrap().trained_model_path
        );
    }

    #[test]
    fn test_explicit_weights_path_kept() {
        let dir = tempfile::tempdir().unwrap();
        let (config_path, params_path) = write_configs(dir.path(), PARAMS);
        let weights = dir.path().join("weights/vgg16.pth");
        let config = std::fs::read_to_string(&config_path).unwrap().replace(
            "prepare_base_model:\n",
            &format!("prepare_base_model:\n  pretrained_weights_path: {}\n", weights.display()),
        );
        std::fs::write(&config_path, config).unwrap();

        let manager = ConfigurationManager::new(&config_path, &params_path).unwrap();
        let base = manager.prepare_base_model_config().unwrap();
        assert_eq!(base.pretrained_weights_path, weights);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let params = PARAMS.replace("CLASSES: 2", "CLASSES: 1");
        let (config_path, params_path) = write_configs(dir.path(), &params);
        let result = ConfigurationManager::new(&config_path, &params_path);
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_missing_params_file() {
        let dir = tempfile::tempdir().unwrap();
        let (config_path, _) = write_configs(dir.path(), PARAMS);
        let result = ConfigurationManager::new(&config_path, dir.path().join("missing.yaml"));
        assert!(matches!(result, Err(PipelineError::ConfigFile { .. })));
    }

    #[test]
    fn test_bundled_config_files_parse() {
        let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
        let config: ConfigFile = read_yaml(&manifest.join(CONFIG_FILE_PATH)).unwrap();
        let params: Params = read_yaml(&manifest.join(PARAMS_FILE_PATH)).unwrap();
        params.validate().unwrap();
        assert_eq!(config.evaluation.registered_model_name, "VGG16Model");
        assert_eq!(config.prediction.class_labels["normal"], "Normal");
    }
}
