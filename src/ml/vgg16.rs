//! VGG16 ベースモデル
//!
//! torchvision の `vgg16` と同じ層構成を持ち、公開されている学習済み重み
//! (`vgg16-397923af.pth`) をそのまま読み込めます。

use std::path::Path;

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    record::{FullPrecisionSettings, Recorder},
    tensor::{activation::softmax, backend::Backend, Tensor},
};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};

use crate::error::{PipelineError, Result};
use crate::model::FreezeSpec;

/// ブロックごとの畳み込み層の出力チャネル数
pub const VGG16_BLOCKS: [&[usize]; 5] = [
    &[64, 64],
    &[128, 128],
    &[256, 256, 256],
    &[512, 512, 512],
    &[512, 512, 512],
];

/// 畳み込み層の総数
pub const NUM_CONV_LAYERS: usize = 13;

/// torchvision の `features.N` における畳み込み層の番号
const TORCHVISION_CONV_INDICES: [usize; NUM_CONV_LAYERS] =
    [0, 2, 5, 7, 10, 12, 14, 17, 19, 21, 24, 26, 28];

/// ImageNet分類ヘッドの出力クラス数
pub const IMAGENET_CLASSES: usize = 1000;

const TOP_HIDDEN: usize = 4096;
const LAST_CHANNELS: usize = 512;
const DOWNSAMPLE: usize = 32;

#[derive(Config, Debug)]
pub struct Vgg16Config {
    /// ImageNet分類ヘッド（全結合3層）を含めるか
    #[config(default = false)]
    pub include_top: bool,
    /// 入力画像の高さ
    #[config(default = 224)]
    pub height: usize,
    /// 入力画像の幅
    #[config(default = 224)]
    pub width: usize,
}

impl Vgg16Config {
    /// 最後のプーリング後の特徴マップの次元数
    pub fn flattened_features(&self) -> usize {
        LAST_CHANNELS * (self.height / DOWNSAMPLE) * (self.width / DOWNSAMPLE)
    }

    /// ベースモデルの出力次元数
    pub fn output_features(&self) -> usize {
        if self.include_top {
            IMAGENET_CLASSES
        } else {
            self.flattened_features()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.height < DOWNSAMPLE || self.width < DOWNSAMPLE {
            return Err(PipelineError::Model(format!(
                "入力サイズが小さすぎます: {}x{} (最小{}x{})",
                self.height, self.width, DOWNSAMPLE, DOWNSAMPLE
            )));
        }
        if self.include_top && (self.height != 224 || self.width != 224) {
            return Err(PipelineError::Model(format!(
                "分類ヘッド付きのVGG16は224x224入力のみ対応しています: {}x{}",
                self.height, self.width
            )));
        }
        Ok(())
    }

    /// モデルを初期化（重みはランダム）
    pub fn init<B: Backend>(&self, device: &B::Device) -> Vgg16<B> {
        let mut convs = Vec::with_capacity(NUM_CONV_LAYERS);
        let mut in_channels = 3;
        for block in VGG16_BLOCKS {
            for &out_channels in block {
                convs.push(
                    Conv2dConfig::new([in_channels, out_channels], [3, 3])
                        .with_padding(PaddingConfig2d::Explicit(1, 1))
                        .init(device),
                );
                in_channels = out_channels;
            }
        }

        let top = self.include_top.then(|| Vgg16Top {
            fc1: LinearConfig::new(self.flattened_features(), TOP_HIDDEN).init(device),
            fc2: LinearConfig::new(TOP_HIDDEN, TOP_HIDDEN).init(device),
            fc3: LinearConfig::new(TOP_HIDDEN, IMAGENET_CLASSES).init(device),
            activation: Relu::new(),
        });

        Vgg16 {
            features: Vgg16Features {
                convs,
                pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
                activation: Relu::new(),
            },
            top,
        }
    }
}

/// 畳み込み部
///
/// 5ブロック、各ブロックは {Conv 3x3 (padding 1) + ReLU} x n の後に 2x2 Max Pooling。
#[derive(Module, Debug)]
pub struct Vgg16Features<B: Backend> {
    convs: Vec<Conv2d<B>>,
    pool: MaxPool2d,
    activation: Relu,
}

impl<B: Backend> Vgg16Features<B> {
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = images;
        let mut layer = 0;
        for block in VGG16_BLOCKS {
            for _ in 0..block.len() {
                x = self.convs[layer].forward(x);
                x = self.activation.forward(x);
                layer += 1;
            }
            x = self.pool.forward(x);
        }
        x
    }
}

/// ImageNet分類ヘッド
///
/// Flatten -> FC 4096 + ReLU -> FC 4096 + ReLU -> FC 1000 + Softmax
#[derive(Module, Debug)]
pub struct Vgg16Top<B: Backend> {
    fc1: Linear<B>,
    fc2: Linear<B>,
    fc3: Linear<B>,
    activation: Relu,
}

impl<B: Backend> Vgg16Top<B> {
    pub fn forward(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.activation.forward(self.fc1.forward(features));
        let x = self.activation.forward(self.fc2.forward(x));
        softmax(self.fc3.forward(x), 1)
    }

    fn layers(&self) -> [&Linear<B>; 3] {
        [&self.fc1, &self.fc2, &self.fc3]
    }
}

#[derive(Module, Debug)]
pub struct Vgg16<B: Backend> {
    features: Vgg16Features<B>,
    top: Option<Vgg16Top<B>>,
}

impl<B: Backend> Vgg16<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: [batch_size, 3, height, width]
    ///
    /// # 戻り値
    /// - ヘッドなし: 平坦化した特徴 [batch_size, 512 * (h/32) * (w/32)]
    /// - ヘッドあり: ImageNetクラス確率 [batch_size, 1000]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.features.forward(images);
        let [batch_size, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        match &self.top {
            Some(top) => top.forward(x),
            None => x,
        }
    }

    pub fn has_top(&self) -> bool {
        self.top.is_some()
    }

    /// パラメータを持つ層の数（畳み込み13層 + ヘッド3層）
    pub fn num_layers(&self) -> usize {
        NUM_CONV_LAYERS + if self.has_top() { 3 } else { 0 }
    }

    /// 凍結する層の数（先頭から数える）
    pub fn frozen_layers(&self, spec: &FreezeSpec) -> usize {
        let total = self.num_layers();
        match spec {
            FreezeSpec::None => 0,
            FreezeSpec::All => total,
            FreezeSpec::AllBut(trainable) => total.saturating_sub(*trainable),
        }
    }

    /// 先頭から `frozen_layers` 層の勾配計算を止める
    pub fn freeze(self, spec: &FreezeSpec) -> Self {
        let frozen = self.frozen_layers(spec);
        if frozen == 0 {
            return self;
        }

        let Vgg16 { features, top } = self;
        let convs = features
            .convs
            .into_iter()
            .enumerate()
            .map(|(i, conv)| if i < frozen { conv.no_grad() } else { conv })
            .collect();

        let top = top.map(|top| {
            let freeze = |offset: usize, layer: Linear<B>| {
                if NUM_CONV_LAYERS + offset < frozen {
                    layer.no_grad()
                } else {
                    layer
                }
            };
            Vgg16Top {
                fc1: freeze(0, top.fc1),
                fc2: freeze(1, top.fc2),
                fc3: freeze(2, top.fc3),
                activation: top.activation,
            }
        });

        Vgg16 {
            features: Vgg16Features {
                convs,
                pool: features.pool,
                activation: features.activation,
            },
            top,
        }
    }

    /// 学習対象になるパラメータ数
    pub fn trainable_params(&self, spec: &FreezeSpec) -> usize {
        let frozen = self.frozen_layers(spec);
        let conv_params: usize = self
            .features
            .convs
            .iter()
            .enumerate()
            .filter(|(i, _)| *i >= frozen)
            .map(|(_, conv)| conv.num_params())
            .sum();
        let top_params: usize = self
            .top
            .iter()
            .flat_map(|top| top.layers().into_iter().enumerate())
            .filter(|(i, _)| NUM_CONV_LAYERS + i >= frozen)
            .map(|(_, layer)| layer.num_params())
            .sum();
        conv_params + top_params
    }

    /// torchvision形式の学習済み重みを読み込む
    ///
    /// `features.N.*` を畳み込み層へ、`classifier.{0,3,6}.*` を分類ヘッドへ割り当てます。
    pub fn load_pretrained(self, weights_path: &Path, device: &B::Device) -> Result<Self> {
        let recorder = PyTorchFileRecorder::<FullPrecisionSettings>::default();

        let mut features_args = LoadArgs::new(weights_path.to_path_buf());
        for (layer, torch_index) in TORCHVISION_CONV_INDICES.iter().enumerate() {
            features_args = features_args.with_key_remap(
                &format!(r"^features\.{}\.(.+)$", torch_index),
                &format!("convs.{}.$1", layer),
            );
        }
        let features_record: Vgg16FeaturesRecord<B> = recorder
            .load(features_args, device)
            .map_err(|e| PipelineError::Model(format!("学習済み重みの読み込みエラー: {:?}", e)))?;

        let Vgg16 { features, top } = self;
        let features = features.load_record(features_record);

        let top = match top {
            Some(top) => {
                let top_args = LoadArgs::new(weights_path.to_path_buf())
                    .with_key_remap(r"^classifier\.0\.(.+)$", "fc1.$1")
                    .with_key_remap(r"^classifier\.3\.(.+)$", "fc2.$1")
                    .with_key_remap(r"^classifier\.6\.(.+)$", "fc3.$1");
                let top_record: Vgg16TopRecord<B> = recorder.load(top_args, device).map_err(|e| {
                    PipelineError::Model(format!("分類ヘッドの重みの読み込みエラー: {:?}", e))
                })?;
                Some(top.load_record(top_record))
            }
            None => None,
        };

        Ok(Vgg16 { features, top })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray;

    fn small_config() -> Vgg16Config {
        Vgg16Config::new().with_height(32).with_width(64)
    }

    #[test]
    fn test_output_features() {
        assert_eq!(Vgg16Config::new().flattened_features(), 25088);
        assert_eq!(Vgg16Config::new().with_include_top(true).output_features(), 1000);
        assert_eq!(small_config().output_features(), 512 * 2);
    }

    #[test]
    fn test_validate() {
        assert!(Vgg16Config::new().validate().is_ok());
        assert!(Vgg16Config::new().with_height(16).validate().is_err());
        assert!(small_config().with_include_top(true).validate().is_err());
    }

    #[test]
    fn test_config_file_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vgg16.json");
        small_config().save(&path).unwrap();

        let loaded = Vgg16Config::load(&path).unwrap();
        assert!(!loaded.include_top);
        assert_eq!((loaded.height, loaded.width), (32, 64));
    }

    #[test]
    fn test_forward_shape() {
        let device = NdArrayDevice::Cpu;
        let model = small_config().init::<TestBackend>(&device);
        assert_eq!(model.num_layers(), 13);

        let images = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 64], &device);
        let output = model.forward(images);
        assert_eq!(output.dims(), [2, 1024]);
    }

    #[test]
    fn test_frozen_layers() {
        let device = NdArrayDevice::Cpu;
        let model = small_config().init::<TestBackend>(&device);

        assert_eq!(model.frozen_layers(&FreezeSpec::None), 0);
        assert_eq!(model.frozen_layers(&FreezeSpec::All), 13);
        assert_eq!(model.frozen_layers(&FreezeSpec::AllBut(3)), 10);
        assert_eq!(model.frozen_layers(&FreezeSpec::AllBut(20)), 0);

        assert_eq!(model.trainable_params(&FreezeSpec::All), 0);
        assert_eq!(model.trainable_params(&FreezeSpec::None), model.num_params());
        // 最後の畳み込み層: 512 * 512 * 3 * 3 + 512
        assert_eq!(model.trainable_params(&FreezeSpec::AllBut(1)), 512 * 512 * 9 + 512);
    }
}
