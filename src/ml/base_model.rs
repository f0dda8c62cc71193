//! ベースモデルの準備（学習済みVGG16 + 分類層）

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::tensor::backend::Backend;

use super::backend::{cpu_device, gpu_device, log_device, CpuBackend, GpuBackend};
use super::classifier::{base_config_from_metadata, base_from_bytes, base_to_bytes, ClassifierConfig, CnnClassifier};
use super::vgg16::{Vgg16, Vgg16Config};
use crate::config::{DeviceType, PrepareBaseModelConfig};
use crate::ingestion::{download_to_file, http_client};
use crate::model::{load_model_with_metadata, save_model_with_metadata, FreezeSpec, ModelKind, ModelMetadata};

/// ImageNet学習済み重みを表す WEIGHTS の値
const IMAGENET_WEIGHTS: &str = "imagenet";

pub struct PrepareBaseModel {
    config: PrepareBaseModelConfig,
}

/// ベースモデルに分類層を付けて凍結する
pub fn prepare_full_model<B: Backend>(
    base: Vgg16<B>,
    base_config: &Vgg16Config,
    classes: usize,
    freeze: &FreezeSpec,
    device: &B::Device,
) -> CnnClassifier<B> {
    ClassifierConfig::new(classes, base_config.clone())
        .with_base(base, device)
        .apply_freeze(freeze)
}

impl PrepareBaseModel {
    pub fn new(config: PrepareBaseModelConfig) -> Self {
        Self { config }
    }

    fn vgg16_config(&self) -> Vgg16Config {
        let size = &self.config.params_image_size;
        Vgg16Config::new()
            .with_include_top(self.config.params_include_top)
            .with_height(size.height)
            .with_width(size.width)
    }

    /// VGG16を構築し（必要なら学習済み重みを読み込み）、`base_model_path` に保存する
    pub fn get_base_model(&self) -> Result<PathBuf> {
        log_device(self.config.device);
        match self.config.device {
            DeviceType::Wgpu => self.get_base_model_on::<GpuBackend>(&gpu_device()),
            DeviceType::Cpu => self.get_base_model_on::<CpuBackend>(&cpu_device()),
        }
    }

    /// 分類層を付けて凍結し、`updated_base_model_path` に保存する
    pub fn update_base_model(&self) -> Result<PathBuf> {
        match self.config.device {
            DeviceType::Wgpu => self.update_base_model_on::<GpuBackend>(&gpu_device()),
            DeviceType::Cpu => self.update_base_model_on::<CpuBackend>(&cpu_device()),
        }
    }

    fn get_base_model_on<B: Backend>(&self, device: &B::Device) -> Result<PathBuf> {
        let vgg_config = self.vgg16_config();
        vgg_config.validate()?;

        tracing::info!(
            "VGG16を構築します: 入力 {}, include_top={}",
            self.config.params_image_size,
            self.config.params_include_top
        );
        let mut model = vgg_config.init::<B>(device);

        let weights = if self.config.params_imagenet_weights {
            let weights_path = self.ensure_pretrained_weights()?;
            tracing::info!("学習済み重みを読み込み中: {}", weights_path.display());
            model = model
                .load_pretrained(&weights_path, device)
                .context("学習済み重みの読み込みに失敗しました")?;
            Some(IMAGENET_WEIGHTS.to_string())
        } else {
            tracing::warn!("WEIGHTS が指定されていないため、ランダムな初期値を使用します");
            None
        };

        let metadata = ModelMetadata::base_model(
            self.config.params_image_size.as_array(),
            self.config.params_include_top,
            weights,
        );
        let bytes = base_to_bytes(model)?;
        let saved = save_model_with_metadata(&self.config.base_model_path, &metadata, &bytes)?;
        Ok(saved)
    }

    fn update_base_model_on<B: Backend>(&self, device: &B::Device) -> Result<PathBuf> {
        let (base_metadata, bytes) = load_model_with_metadata(&self.config.base_model_path)
            .with_context(|| {
                format!(
                    "ベースモデルを読み込めません: {}",
                    self.config.base_model_path.display()
                )
            })?;
        if base_metadata.kind != ModelKind::BaseModel {
            anyhow::bail!(
                "ベースモデルではありません: {} (kind: {:?})",
                self.config.base_model_path.display(),
                base_metadata.kind
            );
        }

        let base_config = base_config_from_metadata(&base_metadata);
        let base = base_from_bytes(base_config.init::<B>(device), bytes, device)?;

        let freeze = self.config.params_freeze;
        let full_model = prepare_full_model(
            base,
            &base_config,
            self.config.params_classes,
            &freeze,
            device,
        );

        let (total, trainable) = full_model.param_summary(&freeze);
        tracing::info!("=== モデル概要 ===");
        tracing::info!("ベース: vgg16 (include_top={})", base_config.include_top);
        tracing::info!("分類層: {} -> {}", base_config.output_features(), self.config.params_classes);
        tracing::info!("凍結範囲: {}", freeze);
        tracing::info!("Total params: {}", total);
        tracing::info!("Trainable params: {}", trainable);
        tracing::info!("Non-trainable params: {}", total - trainable);

        let metadata = ModelMetadata::classifier_from(&base_metadata, self.config.params_classes, freeze);
        let bytes = full_model.to_bytes()?;
        let saved = save_model_with_metadata(&self.config.updated_base_model_path, &metadata, &bytes)?;
        Ok(saved)
    }

    /// 学習済み重みファイルを用意する（無ければダウンロード）
    fn ensure_pretrained_weights(&self) -> Result<PathBuf> {
        let path = &self.config.pretrained_weights_path;
        if path.is_file() {
            tracing::info!("学習済み重みは取得済みです: {}", path.display());
            return Ok(path.clone());
        }

        tracing::info!(
            "学習済み重みをダウンロード中: {} -> {}",
            self.config.pretrained_weights_url,
            path.display()
        );
        let client = http_client()?;
        let written = download_to_file(&client, &self.config.pretrained_weights_url, path)
            .context("学習済み重みのダウンロードに失敗しました")?;
        tracing::info!("ダウンロード完了 ({:.2} MB)", written as f64 / 1024.0 / 1024.0);
        Ok(path.clone())
    }
}
