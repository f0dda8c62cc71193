pub mod augmentation;
pub mod backend;
pub mod base_model;
pub mod classifier;
pub mod dataset;
pub mod evaluation;
pub mod prediction;
pub mod trainer;
pub mod vgg16;

pub use augmentation::{AugmentationConfig, Augmenter};
pub use base_model::{prepare_full_model, PrepareBaseModel};
pub use classifier::{ClassifierConfig, CnnClassifier};
pub use dataset::{ImageBatch, ImageBatcher, ImageFolderDataset, ImageItem, ImageSubset, Subset};
pub use evaluation::{ConfusionMatrix, Evaluation, EvaluationScores};
pub use prediction::{InferenceEngine, PredictionPipeline, PredictionResult};
pub use trainer::{Training, TrainValidSplit};
pub use vgg16::{Vgg16, Vgg16Config};
