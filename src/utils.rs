//! ファイル操作の共通ヘルパー

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{PipelineError, Result};

/// YAMLファイルを読み込んで型付きの値に変換
///
/// 空ファイルはエラーとして扱います。
pub fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| PipelineError::ConfigFile {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    if content.trim().is_empty() {
        return Err(PipelineError::ConfigFile {
            path: path.to_path_buf(),
            message: "ファイルが空です".to_string(),
        });
    }

    let value = serde_yaml::from_str(&content).map_err(|e| PipelineError::ConfigFile {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    tracing::info!("yaml file: {} loaded successfully", path.display());
    Ok(value)
}

/// ディレクトリをまとめて作成（既存なら何もしない）
pub fn create_directories<P: AsRef<Path>>(paths: &[P]) -> Result<()> {
    for path in paths {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;
        tracing::debug!("created directory at: {}", path.display());
    }
    Ok(())
}

/// 親ディレクトリを作成（ファイル保存前に使用）
pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// 値を整形済みJSONとして保存
pub fn save_json<T: Serialize>(path: &Path, data: &T) -> anyhow::Result<()> {
    ensure_parent_dir(path)?;
    let json = serde_json::to_string_pretty(data).context("JSONへの変換に失敗しました")?;
    std::fs::write(path, json).with_context(|| format!("JSONを保存できません: {}", path.display()))?;
    tracing::info!("json file saved at: {}", path.display());
    Ok(())
}

/// JSONファイルを読み込む
pub fn load_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("JSONを読み込めません: {}", path.display()))?;
    let value = serde_json::from_str(&content)
        .with_context(|| format!("JSONのパースに失敗しました: {}", path.display()))?;
    Ok(value)
}

/// `.tar.gz` 拡張子を付与したパスを返す（付いていればそのまま）
pub fn with_bundle_extension(path: &Path) -> PathBuf {
    let name = path.file_name().and_then(|s| s.to_str()).unwrap_or_default();
    if name.ends_with(".tar.gz") {
        path.to_path_buf()
    } else {
        let mut os = path.as_os_str().to_owned();
        os.push(".tar.gz");
        PathBuf::from(os)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        size: Vec<usize>,
    }

    #[test]
    fn test_read_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.yaml");
        std::fs::write(&path, "name: vgg\nsize: [224, 224, 3]\n").unwrap();

        let sample: Sample = read_yaml(&path).unwrap();
        assert_eq!(sample.name, "vgg");
        assert_eq!(sample.size, vec![224, 224, 3]);
    }

    #[test]
    fn test_read_yaml_empty_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.yaml");
        std::fs::write(&path, "  \n").unwrap();

        let result: Result<Sample> = read_yaml(&path);
        assert!(matches!(result, Err(PipelineError::ConfigFile { .. })));
    }

    #[test]
    fn test_read_yaml_missing_file_is_error() {
        let result: Result<Sample> = read_yaml(Path::new("/nonexistent/config.yaml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_create_directories_nested() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a/b/c");
        let b = dir.path().join("d");
        create_directories(&[&a, &b]).unwrap();
        assert!(a.is_dir());
        assert!(b.is_dir());
        // 2回目も成功する
        create_directories(&[&a]).unwrap();
    }

    #[test]
    fn test_save_and_load_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/scores.json");
        let mut data = BTreeMap::new();
        data.insert("loss".to_string(), 0.5f64);
        save_json(&path, &data).unwrap();

        let loaded: BTreeMap<String, f64> = load_json(&path).unwrap();
        assert_eq!(loaded["loss"], 0.5);
    }

    #[test]
    fn test_with_bundle_extension() {
        assert_eq!(
            with_bundle_extension(Path::new("artifacts/model")),
            PathBuf::from("artifacts/model.tar.gz")
        );
        assert_eq!(
            with_bundle_extension(Path::new("artifacts/model.tar.gz")),
            PathBuf::from("artifacts/model.tar.gz")
        );
        assert_eq!(
            with_bundle_extension(Path::new("model/model.h5")),
            PathBuf::from("model/model.h5.tar.gz")
        );
    }
}
