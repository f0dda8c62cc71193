//! ステージごとの設定レコード

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::config::schema::{DeviceType, ImageSize};
use crate::model::FreezeSpec;

#[derive(Debug, Clone)]
pub struct DataIngestionConfig {
    pub root_dir: PathBuf,
    pub source_url: String,
    pub local_data_file: PathBuf,
    pub unzip_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PrepareBaseModelConfig {
    pub root_dir: PathBuf,
    pub base_model_path: PathBuf,
    pub updated_base_model_path: PathBuf,
    pub pretrained_weights_path: PathBuf,
    pub pretrained_weights_url: String,
    pub params_image_size: ImageSize,
    pub params_include_top: bool,
    /// imagenetの事前学習済み重みを使うか
    pub params_imagenet_weights: bool,
    pub params_classes: usize,
    pub params_freeze: FreezeSpec,
    pub device: DeviceType,
}

#[derive(Debug, Clone)]
pub struct TrainingConfig {
    pub root_dir: PathBuf,
    pub trained_model_path: PathBuf,
    pub trained_model_path_for_tracking: PathBuf,
    pub updated_base_model_path: PathBuf,
    pub training_data: PathBuf,
    pub validation_split: f64,
    pub params_epochs: usize,
    pub params_batch_size: usize,
    pub params_is_augmentation: bool,
    pub params_image_size: ImageSize,
    pub params_learning_rate: f64,
    pub params_seed: u64,
    pub params_num_workers: usize,
    pub device: DeviceType,
}

#[derive(Debug, Clone)]
pub struct EvaluationConfig {
    pub path_of_model: PathBuf,
    pub training_data: PathBuf,
    /// トラッキングへ記録する全パラメータ
    pub all_params: Vec<(String, String)>,
    pub mlflow_uri: String,
    pub score_path: PathBuf,
    pub validation_split: f64,
    pub experiment_name: String,
    pub registered_model_name: String,
    pub params_image_size: ImageSize,
    pub params_batch_size: usize,
    pub device: DeviceType,
}

#[derive(Debug, Clone)]
pub struct PredictionConfig {
    pub model_path: PathBuf,
    pub class_labels: BTreeMap<String, String>,
    pub device: DeviceType,
}
