//! 単一画像の推論

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::tensor::{backend::Backend, Tensor};
use serde::{Deserialize, Serialize};

use super::backend::{cpu_device, gpu_device, CpuBackend, GpuBackend};
use super::classifier::{ClassifierConfig, CnnClassifier};
use super::dataset::load_image_tensor_data;
use crate::config::{DeviceType, ImageSize, PredictionConfig};
use crate::model::{load_model_with_metadata, InferenceConfig};

/// 推論結果 `{"image": <表示名>}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictionResult {
    pub image: String,
}

/// 推論エンジン
pub struct InferenceEngine<B: Backend> {
    model: CnnClassifier<B>,
    config: InferenceConfig,
    image_size: ImageSize,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// モデルを読み込んで推論エンジンを初期化
    pub fn load(
        model_path: &Path,
        display_labels: std::collections::BTreeMap<String, String>,
        device: B::Device,
    ) -> Result<Self> {
        let (metadata, bytes) = load_model_with_metadata(model_path)
            .with_context(|| format!("モデルを読み込めません: {}", model_path.display()))?;
        let config = InferenceConfig::from_metadata(&metadata, display_labels)?;
        let image_size = ImageSize::from_dims(&metadata.image_size)?;

        let model = ClassifierConfig::from_metadata(&metadata)?
            .init::<B>(&device)
            .load_bytes(bytes, &device)?;

        Ok(Self {
            model,
            config,
            image_size,
            device,
        })
    }

    /// クラスごとの確率
    pub fn probabilities(&self, image_path: &Path) -> Result<Vec<f32>> {
        let image_data = load_image_tensor_data(image_path, &self.image_size)?;
        let ImageSize { height, width, .. } = self.image_size;

        let tensor = Tensor::<B, 1>::from_floats(image_data.as_slice(), &self.device)
            .reshape([1, 3, height, width]);

        let proba = self.model.predict_proba(tensor);
        Ok(proba.into_data().iter::<f32>().collect())
    }

    /// 単一画像を分類し、表示名を返す
    pub fn classify_image(&self, image_path: &Path) -> Result<String> {
        let proba = self.probabilities(image_path)?;
        tracing::info!("RAW PREDICTION RESULT: {:?}", proba);

        let class_idx = argmax(&proba).context("推論結果が空です")?;
        self.config
            .class_index_to_label(class_idx)
            .with_context(|| format!("クラスインデックス {} は範囲外です", class_idx))
    }
}

fn argmax(values: &[f32]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
}

/// 画像1枚を分類するパイプライン
pub struct PredictionPipeline {
    filename: PathBuf,
    config: PredictionConfig,
}

impl PredictionPipeline {
    pub fn new<P: AsRef<Path>>(filename: P, config: PredictionConfig) -> Self {
        Self {
            filename: filename.as_ref().to_path_buf(),
            config,
        }
    }

    pub fn predict(&self) -> Result<Vec<PredictionResult>> {
        let label = match self.config.device {
            DeviceType::Wgpu => self.predict_on::<GpuBackend>(gpu_device())?,
            DeviceType::Cpu => self.predict_on::<CpuBackend>(cpu_device())?,
        };
        tracing::info!("予測結果: {} -> {}", self.filename.display(), label);
        Ok(vec![PredictionResult { image: label }])
    }

    fn predict_on<B: Backend>(&self, device: B::Device) -> Result<String> {
        let engine = InferenceEngine::<B>::load(
            &self.config.model_path,
            self.config.class_labels.clone(),
            device,
        )?;
        engine.classify_image(&self.filename)
    }
}
