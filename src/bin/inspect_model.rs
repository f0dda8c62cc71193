//! 保存済みモデルバンドルのメタデータを表示する

use std::path::PathBuf;

use anyhow::{Context, Result};
use cnn_classifier_lib::model::{load_metadata, print_metadata_info, InferenceConfig, ModelKind};

fn main() -> Result<()> {
    let model_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .context("使い方: inspect_model <model.tar.gz>")?;

    let metadata = load_metadata(&model_path)
        .with_context(|| format!("メタデータを読み込めません: {}", model_path.display()))?;
    print_metadata_info(&metadata);

    if metadata.kind == ModelKind::Classifier {
        InferenceConfig::from_metadata(&metadata, Default::default())?.print_info();
    }

    Ok(())
}
