//! 学習済みモデルの評価と実験トラッキングへの記録

use std::path::Path;

use anyhow::{Context, Result};
use burn::{
    data::dataloader::batcher::Batcher,
    data::dataset::Dataset,
    nn::loss::CrossEntropyLossConfig,
    tensor::{backend::Backend, ElementConversion},
};
use serde::{Deserialize, Serialize};

use super::backend::{cpu_device, gpu_device, log_device, CpuBackend, GpuBackend};
use super::classifier::{ClassifierConfig, CnnClassifier};
use super::dataset::{ImageBatcher, ImageFolderDataset, Subset};
use crate::config::{DeviceType, EvaluationConfig, ImageSize};
use crate::model::load_model_with_metadata;
use crate::tracking::{resolve_tracking_uri, store_for_uri, RunStatus, TrackingStore};
use crate::utils::save_json;

/// 登録・アップロード時のアーティファクトパス
const MODEL_ARTIFACT_PATH: &str = "model";

/// 評価指標
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EvaluationScores {
    pub loss: f64,
    pub accuracy: f64,
    /// マクロ平均の適合率
    pub precision: f64,
    /// マクロ平均の再現率
    pub recall: f64,
}

impl EvaluationScores {
    /// トラッキング用の (名前, 値) 一覧
    pub fn as_metrics(&self) -> Vec<(String, f64)> {
        vec![
            ("loss".to_string(), self.loss),
            ("accuracy".to_string(), self.accuracy),
            ("precision".to_string(), self.precision),
            ("recall".to_string(), self.recall),
        ]
    }
}

/// 混同行列（行: 正解, 列: 予測）
#[derive(Debug, Clone)]
pub struct ConfusionMatrix {
    counts: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        Self {
            counts: vec![vec![0; num_classes]; num_classes],
        }
    }

    pub fn add(&mut self, actual: usize, predicted: usize) {
        if let Some(count) = self
            .counts
            .get_mut(actual)
            .and_then(|row| row.get_mut(predicted))
        {
            *count += 1;
        }
    }

    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }

    pub fn accuracy(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        let correct: usize = (0..self.counts.len()).map(|i| self.counts[i][i]).sum();
        correct as f64 / total as f64
    }

    /// 予測が1件もないクラスは適合率0として平均
    pub fn macro_precision(&self) -> f64 {
        let n = self.counts.len();
        if n == 0 {
            return 0.0;
        }
        let sum: f64 = (0..n)
            .map(|c| {
                let predicted: usize = self.counts.iter().map(|row| row[c]).sum();
                if predicted == 0 {
                    0.0
                } else {
                    self.counts[c][c] as f64 / predicted as f64
                }
            })
            .sum();
        sum / n as f64
    }

    pub fn macro_recall(&self) -> f64 {
        let n = self.counts.len();
        if n == 0 {
            return 0.0;
        }
        let sum: f64 = self
            .counts
            .iter()
            .enumerate()
            .map(|(c, row)| {
                let actual: usize = row.iter().sum();
                if actual == 0 {
                    0.0
                } else {
                    row[c] as f64 / actual as f64
                }
            })
            .sum();
        sum / n as f64
    }
}

pub struct Evaluation {
    config: EvaluationConfig,
    scores: Option<EvaluationScores>,
}

impl Evaluation {
    pub fn new(config: EvaluationConfig) -> Self {
        Self {
            config,
            scores: None,
        }
    }

    /// 検証用データで学習済みモデルを評価
    pub fn evaluate(&mut self) -> Result<EvaluationScores> {
        log_device(self.config.device);
        let scores = match self.config.device {
            DeviceType::Wgpu => self.evaluate_on::<GpuBackend>(&gpu_device())?,
            DeviceType::Cpu => self.evaluate_on::<CpuBackend>(&cpu_device())?,
        };

        tracing::info!(
            "評価結果: loss={:.4}, accuracy={:.4}, precision={:.4}, recall={:.4}",
            scores.loss,
            scores.accuracy,
            scores.precision,
            scores.recall
        );
        self.scores = Some(scores);
        Ok(scores)
    }

    fn evaluate_on<B: Backend>(&self, device: &B::Device) -> Result<EvaluationScores> {
        let (metadata, bytes) = load_model_with_metadata(&self.config.path_of_model)
            .with_context(|| {
                format!("学習済みモデルを読み込めません: {}", self.config.path_of_model.display())
            })?;
        let model_config = ClassifierConfig::from_metadata(&metadata)?;
        let model: CnnClassifier<B> = model_config.init::<B>(device).load_bytes(bytes, device)?;
        let image_size = ImageSize::from_dims(&metadata.image_size)?;
        if image_size != self.config.params_image_size {
            tracing::warn!(
                "IMAGE_SIZE ({}) とモデルの入力サイズ ({}) が異なります。モデル側を使用します",
                self.config.params_image_size,
                image_size
            );
        }

        let dataset = ImageFolderDataset::from_directory(&self.config.training_data)
            .context("評価データを読み込めません")?;
        if dataset.num_classes() != model_config.num_classes {
            anyhow::bail!(
                "クラス数が一致しません: モデル {} クラス, データ {} クラス",
                model_config.num_classes,
                dataset.num_classes()
            );
        }
        let valid = dataset.split(self.config.validation_split, Subset::Validation)?;
        tracing::info!(
            "Found {} images belonging to {} classes. (validation_split={})",
            valid.len(),
            dataset.num_classes(),
            self.config.validation_split
        );

        let batcher = ImageBatcher::<B>::new(device.clone(), image_size);
        let loss_fn = CrossEntropyLossConfig::new().init(device);
        let mut matrix = ConfusionMatrix::new(model_config.num_classes);
        let mut total_loss = 0.0f64;

        for chunk in valid.items().chunks(self.config.params_batch_size.max(1)) {
            let labels: Vec<usize> = chunk.iter().map(|item| item.label).collect();
            let batch = batcher.batch(chunk.to_vec(), device);

            let output = model.forward(batch.images);
            let loss = loss_fn.forward(output.clone(), batch.targets);
            let loss_value: f64 = loss.into_scalar().elem();
            total_loss += loss_value * labels.len() as f64;

            let predictions: Vec<i64> = output.argmax(1).into_data().iter::<i64>().collect();
            for (actual, predicted) in labels.into_iter().zip(predictions) {
                matrix.add(actual, predicted as usize);
            }
        }

        let total = matrix.total();
        Ok(EvaluationScores {
            loss: if total == 0 { 0.0 } else { total_loss / total as f64 },
            accuracy: matrix.accuracy(),
            precision: matrix.macro_precision(),
            recall: matrix.macro_recall(),
        })
    }

    fn require_scores(&self) -> Result<&EvaluationScores> {
        self.scores
            .as_ref()
            .context("評価が実行されていません (evaluate() を先に呼び出してください)")
    }

    /// 評価結果をJSONに保存
    pub fn save_score(&self) -> Result<()> {
        let scores = self.require_scores()?;
        save_json(&self.config.score_path, scores)
    }

    /// パラメータ・評価指標・モデルを実験トラッキングに記録する
    ///
    /// トラッキングURIが `file` 以外の場合はモデルレジストリにも登録します。
    pub fn log_into_mlflow(&self) -> Result<()> {
        let scores = *self.require_scores()?;
        let uri = resolve_tracking_uri(&self.config.mlflow_uri);
        let store = store_for_uri(&uri)?;
        tracing::info!("トラッキングURI: {} (scheme: {})", uri, store.scheme());

        let run_name = format!("evaluation-{}", chrono::Local::now().format("%Y%m%d-%H%M%S"));
        let run = store.create_run(&self.config.experiment_name, &run_name)?;
        tracing::info!("ランを開始しました: {} (実験ID: {})", run.run_id, run.experiment_id);

        let result = self.log_run(store.as_ref(), &run, &scores);
        let status = if result.is_ok() {
            RunStatus::Finished
        } else {
            RunStatus::Failed
        };
        store.end_run(&run, status)?;
        result
    }

    fn log_run(
        &self,
        store: &dyn TrackingStore,
        run: &crate::tracking::RunInfo,
        scores: &EvaluationScores,
    ) -> Result<()> {
        store.log_params(run, &self.config.all_params)?;
        store.log_metrics(run, &scores.as_metrics(), 0)?;
        store.log_artifact(run, &self.config.path_of_model, MODEL_ARTIFACT_PATH)?;

        if store.supports_registry() {
            let version = store.register_model(
                run,
                MODEL_ARTIFACT_PATH,
                &self.config.registered_model_name,
            )?;
            tracing::info!(
                "モデルを登録しました: {} (version {})",
                self.config.registered_model_name,
                version
            );
        } else {
            tracing::info!("fileストアのためモデルレジストリへの登録は行いません");
        }
        Ok(())
    }
}

/// スコアファイルを読み込む
pub fn load_scores(path: &Path) -> Result<EvaluationScores> {
    crate::utils::load_json(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::dataset::tests::write_image_folder;
    use crate::ml::vgg16::Vgg16Config;
    use crate::model::{save_model_with_metadata, FreezeSpec, ModelMetadata};

    #[test]
    fn test_confusion_matrix_metrics() {
        let mut m = ConfusionMatrix::new(2);
        // 正解0: 3件中2件正解, 正解1: 1件中1件正解
        m.add(0, 0);
        m.add(0, 0);
        m.add(0, 1);
        m.add(1, 1);

        assert_eq!(m.total(), 4);
        assert!((m.accuracy() - 0.75).abs() < 1e-9);
        // precision: class0 = 2/2, class1 = 1/2
        assert!((m.macro_precision() - 0.75).abs() < 1e-9);
        // recall: class0 = 2/3, class1 = 1/1
        assert!((m.macro_recall() - (2.0 / 3.0 + 1.0) / 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_confusion_matrix_ignores_out_of_range() {
        let mut m = ConfusionMatrix::new(2);
        m.add(0, 5);
        assert_eq!(m.total(), 0);
        assert_eq!(m.accuracy(), 0.0);
    }

    fn test_config(dir: &Path) -> EvaluationConfig {
        EvaluationConfig {
            path_of_model: dir.join("model.tar.gz"),
            training_data: dir.join("data"),
            all_params: vec![("EPOCHS".to_string(), "1".to_string())],
            mlflow_uri: format!("file:{}", dir.join("mlruns").display()),
            score_path: dir.join("scores.json"),
            validation_split: 0.3,
            experiment_name: "Default".to_string(),
            registered_model_name: "VGG16Model".to_string(),
            params_image_size: ImageSize::square(32),
            params_batch_size: 4,
            device: DeviceType::Cpu,
        }
    }

    fn write_trained_model(path: &Path) {
        let device = cpu_device();
        let vgg = Vgg16Config::new().with_height(32).with_width(32);
        let model = ClassifierConfig::new(2, vgg).init::<CpuBackend>(&device);
        let base = ModelMetadata::base_model([32, 32, 3], false, None);
        let meta = ModelMetadata::classifier_from(&base, 2, FreezeSpec::All).trained(
            vec!["a".to_string(), "b".to_string()],
            1,
            0.01,
        );
        save_model_with_metadata(path, &meta, &model.to_bytes().unwrap()).unwrap();
    }

    #[test]
    fn test_save_score_requires_evaluate() {
        let dir = tempfile::tempdir().unwrap();
        let evaluation = Evaluation::new(test_config(dir.path()));
        assert!(evaluation.save_score().is_err());
        assert!(evaluation.log_into_mlflow().is_err());
    }

    #[test]
    fn test_evaluate_save_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        write_trained_model(&config.path_of_model);
        write_image_folder(&config.training_data, &[("a", 10), ("b", 10)], 32);

        let mut evaluation = Evaluation::new(config.clone());
        let scores = evaluation.evaluate().unwrap();
        assert!((0.0..=1.0).contains(&scores.accuracy));
        assert!(scores.loss.is_finite());

        evaluation.save_score().unwrap();
        let saved = load_scores(&config.score_path).unwrap();
        assert_eq!(saved, scores);

        evaluation.log_into_mlflow().unwrap();
        let experiment_dir = dir.path().join("mlruns/0");
        let run_dir = std::fs::read_dir(&experiment_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| p.is_dir())
            .unwrap();
        assert!(run_dir.join("metrics/accuracy").is_file());
        assert_eq!(std::fs::read_to_string(run_dir.join("params/EPOCHS")).unwrap(), "1");
        assert!(run_dir.join("artifacts/model/model.tar.gz").is_file());
    }
}
