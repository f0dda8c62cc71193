//! 設定ファイルのスキーマ
//!
//! `config/config.yaml`（パス類）と `params.yaml`（ハイパーパラメータ）の
//! 2ファイルを型付きで読み込みます。

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::model::FreezeSpec;

/// torchvision が配布している VGG16 の重みファイル名
pub const PRETRAINED_WEIGHTS_FILE: &str = "vgg16-397923af.pth";

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl Default for DeviceType {
    fn default() -> Self {
        DeviceType::Wgpu
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// `config.yaml` 全体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    /// 成果物のルートディレクトリ
    pub artifacts_root: PathBuf,
    /// 計算デバイス
    #[serde(default)]
    pub device: DeviceType,
    pub data_ingestion: DataIngestionSection,
    pub prepare_base_model: PrepareBaseModelSection,
    pub training: TrainingSection,
    pub evaluation: EvaluationSection,
    #[serde(default)]
    pub prediction: PredictionSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataIngestionSection {
    pub root_dir: PathBuf,
    /// データセットのURL（Google Driveの共有URLも可）
    pub source_url: String,
    /// ダウンロード先のアーカイブファイル
    pub local_data_file: PathBuf,
    /// 展開先ディレクトリ
    pub unzip_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareBaseModelSection {
    pub root_dir: PathBuf,
    pub base_model_path: PathBuf,
    pub updated_base_model_path: PathBuf,
    /// torchvision形式の事前学習済み重み (.pth)。省略時は `root_dir` 直下
    #[serde(default)]
    pub pretrained_weights_path: Option<PathBuf>,
    /// 重みファイルが無い場合の取得元
    #[serde(default = "default_pretrained_weights_url")]
    pub pretrained_weights_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSection {
    pub root_dir: PathBuf,
    pub trained_model_path: PathBuf,
    /// トラッキング用にもう1部保存するパス
    pub trained_model_path_for_tracking: PathBuf,
    /// クラスごとのサブディレクトリを持つ画像フォルダ
    pub training_data: PathBuf,
    #[serde(default = "default_training_validation_split")]
    pub validation_split: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationSection {
    pub mlflow_uri: String,
    #[serde(default = "default_score_path")]
    pub score_path: PathBuf,
    #[serde(default = "default_evaluation_validation_split")]
    pub validation_split: f64,
    #[serde(default = "default_experiment_name")]
    pub experiment_name: String,
    #[serde(default = "default_registered_model_name")]
    pub registered_model_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionSection {
    pub model_path: PathBuf,
    /// クラスディレクトリ名 -> 表示名
    #[serde(default)]
    pub class_labels: BTreeMap<String, String>,
}

impl Default for PredictionSection {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("model/model.tar.gz"),
            class_labels: BTreeMap::new(),
        }
    }
}

fn default_pretrained_weights_url() -> String {
    format!("https://download.pytorch.org/models/{}", PRETRAINED_WEIGHTS_FILE)
}

fn default_training_validation_split() -> f64 {
    0.2
}

fn default_evaluation_validation_split() -> f64 {
    0.3
}

fn default_score_path() -> PathBuf {
    PathBuf::from("scores.json")
}

fn default_experiment_name() -> String {
    "Default".to_string()
}

fn default_registered_model_name() -> String {
    "VGG16Model".to_string()
}

/// 入力画像サイズ (高さ, 幅, チャネル)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageSize {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl ImageSize {
    /// VGG16の5段プーリングに必要な最小辺長
    pub const MIN_SIDE: usize = 32;

    pub fn square(side: usize) -> Self {
        Self {
            height: side,
            width: side,
            channels: 3,
        }
    }

    pub fn from_dims(dims: &[usize]) -> Result<Self> {
        let [height, width, channels] = dims else {
            return Err(PipelineError::Config(format!(
                "IMAGE_SIZE は [高さ, 幅, チャネル] の3要素が必要です: {:?}",
                dims
            )));
        };
        let size = Self {
            height: *height,
            width: *width,
            channels: *channels,
        };
        size.validate()?;
        Ok(size)
    }

    pub fn validate(&self) -> Result<()> {
        if self.channels != 3 {
            return Err(PipelineError::Config(format!(
                "RGB画像のみ対応しています (チャネル数: {})",
                self.channels
            )));
        }
        if self.height < Self::MIN_SIDE || self.width < Self::MIN_SIDE {
            return Err(PipelineError::Config(format!(
                "入力サイズが小さすぎます: {}x{} (最小{}x{})",
                self.height,
                self.width,
                Self::MIN_SIDE,
                Self::MIN_SIDE
            )));
        }
        Ok(())
    }

    pub fn as_array(&self) -> [usize; 3] {
        [self.height, self.width, self.channels]
    }
}

impl std::fmt::Display for ImageSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{}", self.height, self.width, self.channels)
    }
}

/// `params.yaml` のハイパーパラメータ
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Params {
    /// 学習時のデータ拡張
    pub augmentation: bool,
    /// [高さ, 幅, チャネル]
    pub image_size: Vec<usize>,
    pub batch_size: usize,
    /// VGG16の全結合層(1000クラス)を含めるか
    pub include_top: bool,
    pub epochs: usize,
    pub classes: usize,
    /// "imagenet" または null
    #[serde(default)]
    pub weights: Option<String>,
    pub learning_rate: f64,
    /// ベースモデルを全て凍結
    #[serde(default = "default_true")]
    pub freeze_all: bool,
    /// FREEZE_ALL=false のとき、末尾から学習対象に残す畳み込み層数
    #[serde(default)]
    pub freeze_till: Option<usize>,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
}

fn default_true() -> bool {
    true
}

fn default_seed() -> u64 {
    42
}

fn default_num_workers() -> usize {
    2
}

impl Params {
    /// 値の範囲を検証
    pub fn validate(&self) -> Result<()> {
        let size = self.image_size()?;
        if self.include_top && (size.height != 224 || size.width != 224) {
            return Err(PipelineError::Config(format!(
                "INCLUDE_TOP=true の場合、IMAGE_SIZE は 224x224 である必要があります (現在: {})",
                size
            )));
        }
        if self.classes < 2 {
            return Err(PipelineError::Config(format!(
                "CLASSES は2以上が必要です (現在: {})",
                self.classes
            )));
        }
        if self.batch_size == 0 {
            return Err(PipelineError::Config("BATCH_SIZE は1以上が必要です".to_string()));
        }
        if self.epochs == 0 {
            return Err(PipelineError::Config("EPOCHS は1以上が必要です".to_string()));
        }
        if !(self.learning_rate > 0.0) {
            return Err(PipelineError::Config(format!(
                "LEARNING_RATE は正の値が必要です (現在: {})",
                self.learning_rate
            )));
        }
        self.use_imagenet_weights()?;
        Ok(())
    }

    pub fn image_size(&self) -> Result<ImageSize> {
        ImageSize::from_dims(&self.image_size)
    }

    /// WEIGHTS が imagenet かどうか（それ以外の文字列はエラー）
    pub fn use_imagenet_weights(&self) -> Result<bool> {
        match self.weights.as_deref().map(|s| s.trim().to_lowercase()) {
            None => Ok(false),
            Some(w) if w.is_empty() || w == "none" || w == "null" => Ok(false),
            Some(w) if w == "imagenet" => Ok(true),
            Some(other) => Err(PipelineError::Config(format!(
                "未対応の WEIGHTS です: {} (imagenet または null)",
                other
            ))),
        }
    }

    /// ベースモデルの凍結方法
    pub fn freeze_spec(&self) -> FreezeSpec {
        if self.freeze_all {
            FreezeSpec::All
        } else if let Some(n) = self.freeze_till {
            FreezeSpec::AllBut(n)
        } else {
            FreezeSpec::None
        }
    }

    /// トラッキング用に全パラメータを (キー, 文字列値) に平坦化
    pub fn tracking_params(&self) -> Result<Vec<(String, String)>> {
        flatten_for_tracking(self)
    }
}

/// トップレベルがオブジェクトになる値を (キー, 文字列値) の列にする
fn flatten_for_tracking<T: Serialize>(value: &T) -> Result<Vec<(String, String)>> {
    let value = serde_json::to_value(value)
        .map_err(|e| PipelineError::Config(format!("パラメータを変換できません: {}", e)))?;
    let map = match value {
        serde_json::Value::Object(map) => map,
        other => {
            return Err(PipelineError::Config(format!(
                "パラメータはキーと値の組である必要があります: {}",
                other
            )))
        }
    };

    Ok(map
        .into_iter()
        .map(|(key, value)| {
            let text = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => "None".to_string(),
                other => other.to_string(),
            };
            (key, text)
        })
        .collect())
}
