//! 転移学習用の分類モデル
//!
//! VGG16ベースモデルの出力を平坦化し、全結合層1層でクラス数に射影します。

use burn::{
    config::Config,
    module::Module,
    nn::{loss::CrossEntropyLossConfig, Linear, LinearConfig},
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{activation::softmax, backend::{AutodiffBackend, Backend}, Int, Tensor},
    train::{ClassificationOutput, TrainOutput, TrainStep, ValidStep},
};

use super::dataset::ImageBatch;
use super::vgg16::{Vgg16, Vgg16Config};
use crate::error::{PipelineError, Result};
use crate::model::{FreezeSpec, ModelMetadata};

#[derive(Config, Debug)]
pub struct ClassifierConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// ベースモデルの設定
    pub base: Vgg16Config,
}

impl ClassifierConfig {
    /// メタデータから設定を復元
    pub fn from_metadata(metadata: &ModelMetadata) -> anyhow::Result<Self> {
        let num_classes = metadata.require_classifier()?;
        Ok(Self::new(num_classes, base_config_from_metadata(metadata)))
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> CnnClassifier<B> {
        let base = self.base.init(device);
        self.with_base(base, device)
    }

    /// 既存のベースモデルに新しい分類層を付ける
    pub fn with_base<B: Backend>(&self, base: Vgg16<B>, device: &B::Device) -> CnnClassifier<B> {
        CnnClassifier {
            base,
            head: LinearConfig::new(self.base.output_features(), self.num_classes).init(device),
        }
    }
}

/// ベースモデルのメタデータからVGG16の設定を作る
pub fn base_config_from_metadata(metadata: &ModelMetadata) -> Vgg16Config {
    let [height, width, _] = metadata.image_size;
    Vgg16Config::new()
        .with_include_top(metadata.include_top)
        .with_height(height)
        .with_width(width)
}

/// 分類モデル
///
/// # アーキテクチャ
/// - VGG16（凍結可能）
/// - Flatten
/// - FC: features -> num_classes
/// - Softmax (分類時)
#[derive(Module, Debug)]
pub struct CnnClassifier<B: Backend> {
    base: Vgg16<B>,
    head: Linear<B>,
}

impl<B: Backend> CnnClassifier<B> {
    /// 順伝播（ロジットを返す）
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.base.forward(images);
        self.head.forward(features)
    }

    /// クラスごとの確率 [batch_size, num_classes]
    pub fn predict_proba(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// 順伝播と損失計算
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }

    /// ベースモデルを凍結する（分類層は常に学習対象）
    pub fn apply_freeze(self, spec: &FreezeSpec) -> Self {
        Self {
            base: self.base.freeze(spec),
            head: self.head,
        }
    }

    /// (総パラメータ数, 学習対象のパラメータ数)
    pub fn param_summary(&self, spec: &FreezeSpec) -> (usize, usize) {
        let total = self.num_params();
        let trainable = self.base.trainable_params(spec) + self.head.num_params();
        (total, trainable)
    }

    /// 重みをバイト列に変換
    pub fn to_bytes(self) -> Result<Vec<u8>> {
        BinBytesRecorder::<FullPrecisionSettings>::default()
            .record(self.into_record(), ())
            .map_err(|e| PipelineError::Model(format!("モデルのシリアライズエラー: {:?}", e)))
    }

    /// バイト列から重みを復元
    pub fn load_bytes(self, bytes: Vec<u8>, device: &B::Device) -> Result<Self> {
        let record = BinBytesRecorder::<FullPrecisionSettings>::default()
            .load(bytes, device)
            .map_err(|e| PipelineError::Model(format!("モデル重みの読み込みエラー: {:?}", e)))?;
        Ok(self.load_record(record))
    }
}

/// ベースモデル単体の重みをバイト列に変換
pub fn base_to_bytes<B: Backend>(base: Vgg16<B>) -> Result<Vec<u8>> {
    BinBytesRecorder::<FullPrecisionSettings>::default()
        .record(base.into_record(), ())
        .map_err(|e| PipelineError::Model(format!("ベースモデルのシリアライズエラー: {:?}", e)))
}

/// バイト列からベースモデルの重みを復元
pub fn base_from_bytes<B: Backend>(base: Vgg16<B>, bytes: Vec<u8>, device: &B::Device) -> Result<Vgg16<B>> {
    let record = BinBytesRecorder::<FullPrecisionSettings>::default()
        .load(bytes, device)
        .map_err(|e| PipelineError::Model(format!("ベースモデル重みの読み込みエラー: {:?}", e)))?;
    Ok(base.load_record(record))
}

/// TrainStep実装 (学習時の順伝播 + 逆伝播)
impl<B: AutodiffBackend> TrainStep<ImageBatch<B>, ClassificationOutput<B>> for CnnClassifier<B> {
    fn step(&self, batch: ImageBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        let item = self.forward_classification(batch.images, batch.targets);
        let grads = item.loss.backward();
        TrainOutput::new(self, grads, item)
    }
}

/// ValidStep実装 (検証時の順伝播のみ)
impl<B: Backend> ValidStep<ImageBatch<B>, ClassificationOutput<B>> for CnnClassifier<B> {
    fn step(&self, batch: ImageBatch<B>) -> ClassificationOutput<B> {
        self.forward_classification(batch.images, batch.targets)
    }
}
