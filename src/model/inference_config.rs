//! モデルメタデータを使用した推論設定
//!
//! 保存されたモデルメタデータから推論に必要な情報（入力サイズ、クラス名）を取得します。

use anyhow::Result;
use std::collections::BTreeMap;

use crate::model::model_metadata::ModelMetadata;

/// モデルメタデータから推論用情報を取得
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// クラス名（インデックス順）
    pub class_names: Vec<String>,

    /// クラス名 -> 表示名（未登録ならクラス名をそのまま使用）
    pub display_labels: BTreeMap<String, String>,

    /// モデル入力解像度 [高さ, 幅, チャネル]
    pub image_size: [usize; 3],
}

impl InferenceConfig {
    /// メタデータからInferenceConfigを作成
    pub fn from_metadata(metadata: &ModelMetadata, display_labels: BTreeMap<String, String>) -> Result<Self> {
        let num_classes = metadata.require_classifier()?;

        // 学習前のモデルにはクラス名が無いので番号で代用
        let class_names = if metadata.class_names.len() == num_classes {
            metadata.class_names.clone()
        } else {
            (0..num_classes).map(|i| format!("class_{}", i)).collect()
        };

        Ok(Self {
            class_names,
            display_labels,
            image_size: metadata.image_size,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// クラスインデックスからクラス名を取得
    pub fn class_index_to_name(&self, index: usize) -> Option<&str> {
        self.class_names.get(index).map(|s| s.as_str())
    }

    /// クラスインデックスから表示名を取得
    pub fn class_index_to_label(&self, index: usize) -> Option<String> {
        let name = self.class_index_to_name(index)?;
        Some(
            self.display_labels
                .get(name)
                .cloned()
                .unwrap_or_else(|| name.to_string()),
        )
    }

    /// 設定情報を表示
    pub fn print_info(&self) {
        println!("\n=== 推論設定 ===");
        println!("クラス数: {}", self.num_classes());
        for (i, name) in self.class_names.iter().enumerate() {
            let label = self.class_index_to_label(i).unwrap_or_default();
            println!("  {}: {} -> {}", i, name, label);
        }
        println!(
            "モデル入力サイズ: {}x{}",
            self.image_size[0], self.image_size[1]
        );
        println!("==================");
    }
}
