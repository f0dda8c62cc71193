pub mod entity;
pub mod manager;
pub mod schema;

pub use entity::{
    DataIngestionConfig, EvaluationConfig, PredictionConfig, PrepareBaseModelConfig,
    TrainingConfig,
};
pub use manager::{ConfigurationManager, CONFIG_FILE_PATH, PARAMS_FILE_PATH};
pub use schema::{ConfigFile, DeviceType, ImageSize, Params};
