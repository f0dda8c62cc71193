//! モデル学習（ファインチューニング）

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::{
    data::dataloader::DataLoaderBuilder,
    data::dataset::Dataset,
    optim::SgdConfig,
    tensor::backend::AutodiffBackend,
    train::{
        metric::{AccuracyMetric, LossMetric},
        LearnerBuilder, LearningStrategy,
    },
};

use super::augmentation::Augmenter;
use super::backend::{cpu_device, gpu_device, log_device, CpuTrainBackend, GpuTrainBackend};
use super::classifier::{ClassifierConfig, CnnClassifier};
use super::dataset::{ImageBatcher, ImageFolderDataset, ImageSubset, Subset};
use crate::config::{DeviceType, ImageSize, TrainingConfig};
use crate::model::{load_model_with_metadata, save_model_with_metadata, ModelMetadata};

/// 学習用と検証用のデータセット
pub struct TrainValidSplit {
    pub train: ImageSubset,
    pub valid: ImageSubset,
}

pub struct Training {
    config: TrainingConfig,
}

impl Training {
    pub fn new(config: TrainingConfig) -> Self {
        Self { config }
    }

    /// 分類層付きのベースモデルを読み込み、凍結を再適用する
    pub fn get_base_model<B: AutodiffBackend>(
        &self,
        device: &B::Device,
    ) -> Result<(CnnClassifier<B>, ModelMetadata)> {
        let path = &self.config.updated_base_model_path;
        let (metadata, bytes) = load_model_with_metadata(path)
            .with_context(|| format!("ベースモデルを読み込めません: {}", path.display()))?;

        let model_config = ClassifierConfig::from_metadata(&metadata)?;
        let model = model_config
            .init::<B>(device)
            .load_bytes(bytes, device)?
            .apply_freeze(&metadata.freeze);

        tracing::info!(
            "ベースモデルを読み込みました: {} クラス, 凍結範囲: {}",
            model_config.num_classes,
            metadata.freeze
        );
        Ok((model, metadata))
    }

    /// 学習用/検証用のデータセットを作成
    pub fn train_valid_generator(&self) -> Result<TrainValidSplit> {
        let dataset = ImageFolderDataset::from_directory(&self.config.training_data)
            .context("学習データを読み込めません")?;

        for (name, count) in dataset.class_counts() {
            tracing::info!("  クラス '{}': {} 枚", name, count);
        }

        let valid = dataset.split(self.config.validation_split, Subset::Validation)?;
        let train = dataset.split(self.config.validation_split, Subset::Training)?;

        tracing::info!(
            "Found {} images belonging to {} classes. (validation)",
            valid.len(),
            dataset.num_classes()
        );
        tracing::info!("validation class indices: {}", valid.class_indices());
        tracing::info!(
            "Found {} images belonging to {} classes. (training)",
            train.len(),
            dataset.num_classes()
        );
        tracing::info!("training class indices: {}", train.class_indices());

        Ok(TrainValidSplit { train, valid })
    }

    /// 学習を実行し、学習済みモデルを保存する
    pub fn train(&self) -> Result<PathBuf> {
        log_device(self.config.device);
        match self.config.device {
            DeviceType::Wgpu => self.train_on::<GpuTrainBackend>(gpu_device()),
            DeviceType::Cpu => self.train_on::<CpuTrainBackend>(cpu_device()),
        }
    }

    fn train_on<B: AutodiffBackend>(&self, device: B::Device) -> Result<PathBuf> {
        let (model, base_metadata) = self.get_base_model::<B>(&device)?;
        let split = self.train_valid_generator()?;

        let num_classes = base_metadata.require_classifier()?;
        if split.train.class_names().len() != num_classes {
            anyhow::bail!(
                "クラス数が一致しません: モデル {} クラス, データ {} クラス ({})",
                num_classes,
                split.train.class_names().len(),
                split.train.class_names().join(", ")
            );
        }
        let class_names = split.train.class_names().to_vec();

        // バッチはモデルの入力サイズに合わせる
        let image_size = ImageSize::from_dims(&base_metadata.image_size)?;
        if image_size != self.config.params_image_size {
            tracing::warn!(
                "IMAGE_SIZE ({}) とモデルの入力サイズ ({}) が異なります。モデル側を使用します",
                self.config.params_image_size,
                image_size
            );
        }
        let mut batcher_train = ImageBatcher::<B>::new(device.clone(), image_size);
        if self.config.params_is_augmentation {
            tracing::info!("データ拡張を有効にしました");
            batcher_train = batcher_train.with_augmentation(Augmenter::default(), self.config.params_seed);
        }
        let batcher_valid = ImageBatcher::<B::InnerBackend>::new(device.clone(), image_size);

        let dataloader_train = DataLoaderBuilder::new(batcher_train)
            .batch_size(self.config.params_batch_size)
            .shuffle(self.config.params_seed)
            .num_workers(self.config.params_num_workers)
            .build(split.train);

        let dataloader_valid = DataLoaderBuilder::new(batcher_valid)
            .batch_size(self.config.params_batch_size)
            .num_workers(self.config.params_num_workers)
            .build(split.valid);

        // Learnerのチェックポイントやログの出力先
        let artifact_dir = self.config.root_dir.join("learner");
        std::fs::create_dir_all(&artifact_dir)?;
        let artifact_dir_str = artifact_dir.to_string_lossy().to_string();

        tracing::info!(
            "学習を開始します: エポック数 {}, バッチサイズ {}, 学習率 {}",
            self.config.params_epochs,
            self.config.params_batch_size,
            self.config.params_learning_rate
        );

        let learner = LearnerBuilder::new(&artifact_dir_str)
            .metric_train_numeric(AccuracyMetric::new())
            .metric_valid_numeric(AccuracyMetric::new())
            .metric_train_numeric(LossMetric::new())
            .metric_valid_numeric(LossMetric::new())
            .learning_strategy(LearningStrategy::SingleDevice(device.clone()))
            .num_epochs(self.config.params_epochs)
            .summary()
            .build(model, SgdConfig::new().init(), self.config.params_learning_rate);

        let model_trained = learner.fit(dataloader_train, dataloader_valid);
        let trained_model = model_trained.model;
        tracing::info!("学習が完了しました");

        let metadata = base_metadata.trained(
            class_names,
            self.config.params_epochs,
            self.config.params_learning_rate,
        );
        let bytes = trained_model.to_bytes()?;
        self.save_model(&metadata, &bytes)
    }

    /// 学習済みモデルを保存（トラッキング用のコピーも作成）
    fn save_model(&self, metadata: &ModelMetadata, bytes: &[u8]) -> Result<PathBuf> {
        let saved = save_model_with_metadata(&self.config.trained_model_path, metadata, bytes)?;
        save_model_with_metadata(&self.config.trained_model_path_for_tracking, metadata, bytes)?;
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::load_metadata;
    use crate::ml::classifier::base_to_bytes;
    use crate::ml::dataset::tests::write_image_folder;
    use crate::ml::vgg16::Vgg16Config;
    use crate::model::FreezeSpec;

    fn test_config(dir: &std::path::Path) -> TrainingConfig {
        TrainingConfig {
            root_dir: dir.join("training"),
            trained_model_path: dir.join("training/model.tar.gz"),
            trained_model_path_for_tracking: dir.join("model/model.tar.gz"),
            updated_base_model_path: dir.join("base_model_updated.tar.gz"),
            training_data: dir.join("data"),
            validation_split: 0.2,
            params_epochs: 1,
            params_batch_size: 2,
            params_is_augmentation: true,
            params_image_size: ImageSize::square(32),
            params_learning_rate: 0.01,
            params_seed: 42,
            params_num_workers: 1,
            device: DeviceType::Cpu,
        }
    }

    fn write_updated_base(path: &std::path::Path, classes: usize) {
        let device = cpu_device();
        let vgg = Vgg16Config::new().with_height(32).with_width(32);
        let model = ClassifierConfig::new(classes, vgg).init::<burn_ndarray::NdArray>(&device);
        let base_meta = ModelMetadata::base_model([32, 32, 3], false, None);
        let meta = ModelMetadata::classifier_from(&base_meta, classes, FreezeSpec::All);
        save_model_with_metadata(path, &meta, &model.to_bytes().unwrap()).unwrap();
    }

    #[test]
    fn test_train_valid_generator() {
        let dir = tempfile::tempdir().unwrap();
        write_image_folder(&dir.path().join("data"), &[("adenocarcinoma", 10), ("normal", 5)], 8);

        let training = Training::new(test_config(dir.path()));
        let split = training.train_valid_generator().unwrap();
        assert_eq!(split.valid.len(), 2 + 1);
        assert_eq!(split.train.len(), 8 + 4);
        assert_eq!(split.train.class_names(), &["adenocarcinoma", "normal"]);
    }

    #[test]
    fn test_get_base_model_requires_classifier() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let device = cpu_device();
        let vgg = Vgg16Config::new().with_height(32).with_width(32);
        let bytes = base_to_bytes(vgg.init::<burn_ndarray::NdArray>(&device)).unwrap();
        let meta = ModelMetadata::base_model([32, 32, 3], false, None);
        save_model_with_metadata(&config.updated_base_model_path, &meta, &bytes).unwrap();

        let training = Training::new(config);
        assert!(training.get_base_model::<CpuTrainBackend>(&device).is_err());
    }

    #[test]
    fn test_class_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        write_updated_base(&config.updated_base_model_path, 3);
        write_image_folder(&config.training_data, &[("a", 5), ("b", 5)], 8);

        let err = Training::new(config).train().unwrap_err();
        assert!(err.to_string().contains("クラス数が一致しません"));
    }

    #[test]
    fn test_train_saves_both_bundles() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        write_updated_base(&config.updated_base_model_path, 2);
        write_image_folder(&config.training_data, &[("a", 5), ("b", 5)], 32);

        let saved = Training::new(config.clone()).train().unwrap();
        assert_eq!(saved, config.trained_model_path);
        assert!(config.trained_model_path.is_file());
        assert!(config.trained_model_path_for_tracking.is_file());

        let metadata = load_metadata(&config.trained_model_path_for_tracking).unwrap();
        assert_eq!(metadata.class_names, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(metadata.num_epochs, Some(1));
    }

    #[test]
    fn test_train_uses_model_image_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.params_image_size = ImageSize::square(64);
        config.params_is_augmentation = false;
        write_updated_base(&config.updated_base_model_path, 2);
        write_image_folder(&config.training_data, &[("a", 5), ("b", 5)], 48);

        let saved = Training::new(config).train().unwrap();
        let metadata = load_metadata(&saved).unwrap();
        assert_eq!(metadata.image_size, [32, 32, 3]);
    }
}
