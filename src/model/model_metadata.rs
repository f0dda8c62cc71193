//! モデルメタデータの定義と永続化
//!
//! 各ステージが保存するモデルバンドル(tar.gz)に同梱されるメタデータです。
//! 重みそのものには含まれない情報（入力サイズ、クラス名、凍結範囲など）を保持し、
//! 後続ステージがモデルを同じ構成で再構築できるようにします。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// バンドルに保存されているモデルの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// 分類ヘッドなしのVGG16（特徴抽出器）
    BaseModel,
    /// VGG16 + 分類ヘッド
    Classifier,
}

/// ベースモデルの凍結範囲
///
/// Burnのレコードには勾配計算の有無が保存されないため、
/// 読み込み時にこの値から凍結を再適用します。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "mode", content = "trainable_layers", rename_all = "snake_case")]
pub enum FreezeSpec {
    /// 凍結しない
    #[default]
    None,
    /// ベースモデル全体を凍結
    All,
    /// パラメータを持つ層のうち末尾n層以外を凍結
    AllBut(usize),
}

impl std::fmt::Display for FreezeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FreezeSpec::None => write!(f, "なし"),
            FreezeSpec::All => write!(f, "ベースモデル全体"),
            FreezeSpec::AllBut(n) => write!(f, "末尾{}層以外", n),
        }
    }
}

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub kind: ModelKind,

    /// ネットワーク名（現在は "vgg16" のみ）
    pub architecture: String,

    /// 入力サイズ [高さ, 幅, チャネル]
    pub image_size: [usize; 3],

    /// VGG16の全結合層(1000クラス)を含むか
    pub include_top: bool,

    /// 分類クラス数（ベースモデルはNone）
    #[serde(default)]
    pub num_classes: Option<usize>,

    /// クラス名（インデックス順、学習後に確定）
    #[serde(default)]
    pub class_names: Vec<String>,

    #[serde(default)]
    pub freeze: FreezeSpec,

    /// 初期重み（"imagenet" またはNone）
    #[serde(default)]
    pub weights: Option<String>,

    /// 学習エポック数
    #[serde(default)]
    pub num_epochs: Option<usize>,

    /// 学習率
    #[serde(default)]
    pub learning_rate: Option<f64>,

    /// 作成時刻（ISO8601形式）
    pub created_at: String,
}

impl ModelMetadata {
    /// ベースモデル用のメタデータを作成
    pub fn base_model(image_size: [usize; 3], include_top: bool, weights: Option<String>) -> Self {
        Self {
            kind: ModelKind::BaseModel,
            architecture: "vgg16".to_string(),
            image_size,
            include_top,
            num_classes: None,
            class_names: Vec::new(),
            freeze: FreezeSpec::None,
            weights,
            num_epochs: None,
            learning_rate: None,
            created_at: chrono::Local::now().to_rfc3339(),
        }
    }

    /// ベースモデルのメタデータから分類器用のメタデータを作成
    pub fn classifier_from(base: &ModelMetadata, num_classes: usize, freeze: FreezeSpec) -> Self {
        Self {
            kind: ModelKind::Classifier,
            num_classes: Some(num_classes),
            freeze,
            created_at: chrono::Local::now().to_rfc3339(),
            ..base.clone()
        }
    }

    /// 学習結果を反映したメタデータを作成
    pub fn trained(&self, class_names: Vec<String>, num_epochs: usize, learning_rate: f64) -> Self {
        Self {
            class_names,
            num_epochs: Some(num_epochs),
            learning_rate: Some(learning_rate),
            created_at: chrono::Local::now().to_rfc3339(),
            ..self.clone()
        }
    }

    /// 分類器であればクラス数を返す
    pub fn require_classifier(&self) -> Result<usize> {
        match (self.kind, self.num_classes) {
            (ModelKind::Classifier, Some(n)) => Ok(n),
            _ => Err(anyhow::anyhow!(
                "分類ヘッドを持つモデルではありません (kind: {:?})",
                self.kind
            )),
        }
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifier_inherits_base_fields() {
        let base = ModelMetadata::base_model([224, 224, 3], false, Some("imagenet".to_string()));
        let classifier = ModelMetadata::classifier_from(&base, 2, FreezeSpec::All);

        assert_eq!(classifier.kind, ModelKind::Classifier);
        assert_eq!(classifier.image_size, [224, 224, 3]);
        assert_eq!(classifier.weights.as_deref(), Some("imagenet"));
        assert_eq!(classifier.require_classifier().unwrap(), 2);
        assert!(base.require_classifier().is_err());
    }

    #[test]
    fn test_trained_sets_class_names() {
        let base = ModelMetadata::base_model([64, 64, 3], false, None);
        let classifier = ModelMetadata::classifier_from(&base, 2, FreezeSpec::AllBut(2));
        let trained = classifier.trained(vec!["a".into(), "b".into()], 5, 0.01);

        assert_eq!(trained.class_names, vec!["a", "b"]);
        assert_eq!(trained.num_epochs, Some(5));
        assert_eq!(trained.freeze, FreezeSpec::AllBut(2));
    }

    #[test]
    fn test_freeze_spec_json_shape() {
        let json = serde_json::to_string(&FreezeSpec::AllBut(3)).unwrap();
        assert_eq!(json, r#"{"mode":"all_but","trainable_layers":3}"#);
        let all: FreezeSpec = serde_json::from_str(r#"{"mode":"all"}"#).unwrap();
        assert_eq!(all, FreezeSpec::All);
    }

    #[test]
    fn test_metadata_defaults_for_missing_fields() {
        let json = r#"{
            "kind": "base_model",
            "architecture": "vgg16",
            "image_size": [224, 224, 3],
            "include_top": false,
            "created_at": "2024-01-01T00:00:00+09:00"
        }"#;
        let metadata = ModelMetadata::from_json_string(json).unwrap();
        assert_eq!(metadata.freeze, FreezeSpec::None);
        assert!(metadata.class_names.is_empty());
        assert_eq!(metadata.num_classes, None);
    }
}
