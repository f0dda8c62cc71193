//! ローカルディレクトリへの記録（MLflowの `mlruns` レイアウト）
//!
//! ```text
//! mlruns/
//!   <experiment_id>/
//!     meta.yaml
//!     <run_id>/
//!       meta.yaml
//!       params/<key>
//!       metrics/<key>      "<timestamp> <value> <step>" を1行ずつ追記
//!       tags/<key>
//!       artifacts/<artifact_path>/<file>
//! ```

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{now_millis, RunInfo, RunStatus, TrackingStore};
use crate::error::{PipelineError, Result};

const DEFAULT_EXPERIMENT_ID: &str = "0";
const DEFAULT_EXPERIMENT_NAME: &str = "Default";
const META_FILE: &str = "meta.yaml";

#[derive(Debug, Serialize, Deserialize)]
struct ExperimentMeta {
    artifact_location: String,
    creation_time: i64,
    experiment_id: String,
    last_update_time: i64,
    lifecycle_stage: String,
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct RunMeta {
    artifact_uri: String,
    end_time: Option<i64>,
    entry_point_name: String,
    experiment_id: String,
    lifecycle_stage: String,
    run_id: String,
    run_name: String,
    run_uuid: String,
    source_name: String,
    source_type: u8,
    source_version: String,
    start_time: i64,
    status: u8,
    tags: Vec<String>,
    user_id: String,
}

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn run_dir(&self, run: &RunInfo) -> PathBuf {
        self.root.join(&run.experiment_id).join(&run.run_id)
    }

    fn read_meta<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
        let text = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&text)
            .map_err(|e| PipelineError::Tracking(format!("{} を解析できません: {}", path.display(), e)))
    }

    fn write_meta<T: Serialize>(path: &Path, meta: &T) -> Result<()> {
        let text = serde_yaml::to_string(meta)
            .map_err(|e| PipelineError::Tracking(format!("meta.yamlを生成できません: {}", e)))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// 既存の実験を名前で探す
    fn find_experiment(&self, name: &str) -> Result<Option<String>> {
        if !self.root.is_dir() {
            return Ok(None);
        }
        for entry in std::fs::read_dir(&self.root)? {
            let meta_path = entry?.path().join(META_FILE);
            if !meta_path.is_file() {
                continue;
            }
            let meta: ExperimentMeta = Self::read_meta(&meta_path)?;
            if meta.name == name && meta.lifecycle_stage == "active" {
                return Ok(Some(meta.experiment_id));
            }
        }
        Ok(None)
    }

    fn next_experiment_id(&self) -> Result<String> {
        let mut max_id: i64 = 0;
        if self.root.is_dir() {
            for entry in std::fs::read_dir(&self.root)? {
                let name = entry?.file_name().to_string_lossy().to_string();
                if let Ok(id) = name.parse::<i64>() {
                    max_id = max_id.max(id);
                }
            }
        }
        Ok((max_id + 1).to_string())
    }

    fn get_or_create_experiment(&self, name: &str) -> Result<String> {
        if let Some(id) = self.find_experiment(name)? {
            return Ok(id);
        }

        let id = if name == DEFAULT_EXPERIMENT_NAME {
            DEFAULT_EXPERIMENT_ID.to_string()
        } else {
            self.next_experiment_id()?
        };
        let dir = self.root.join(&id);
        std::fs::create_dir_all(&dir)?;

        let now = now_millis();
        let meta = ExperimentMeta {
            artifact_location: path_uri(&dir),
            creation_time: now,
            experiment_id: id.clone(),
            last_update_time: now,
            lifecycle_stage: "active".to_string(),
            name: name.to_string(),
        };
        Self::write_meta(&dir.join(META_FILE), &meta)?;
        tracing::debug!("実験を作成しました: {} (id={})", name, id);
        Ok(id)
    }
}

/// ローカルパスを `file://` URIに変換
fn path_uri(path: &Path) -> String {
    let absolute = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    format!("file://{}", absolute.display())
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains("..") || key.starts_with('/') {
        return Err(PipelineError::Tracking(format!("不正なキーです: {:?}", key)));
    }
    Ok(())
}

impl TrackingStore for FileStore {
    fn create_run(&self, experiment_name: &str, run_name: &str) -> Result<RunInfo> {
        let experiment_id = self.get_or_create_experiment(experiment_name)?;
        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let run_dir = self.root.join(&experiment_id).join(&run_id);
        for sub in ["params", "metrics", "tags", "artifacts"] {
            std::fs::create_dir_all(run_dir.join(sub))?;
        }

        let artifact_uri = path_uri(&run_dir.join("artifacts"));
        let meta = RunMeta {
            artifact_uri: artifact_uri.clone(),
            end_time: None,
            entry_point_name: String::new(),
            experiment_id: experiment_id.clone(),
            lifecycle_stage: "active".to_string(),
            run_id: run_id.clone(),
            run_name: run_name.to_string(),
            run_uuid: run_id.clone(),
            source_name: String::new(),
            source_type: 4,
            source_version: String::new(),
            start_time: now_millis(),
            status: RunStatus::Running.as_code(),
            tags: Vec::new(),
            user_id: std::env::var("USER").unwrap_or_else(|_| "unknown".to_string()),
        };
        Self::write_meta(&run_dir.join(META_FILE), &meta)?;
        std::fs::write(run_dir.join("tags").join("mlflow.runName"), run_name)?;

        Ok(RunInfo {
            experiment_id,
            run_id,
            artifact_uri,
        })
    }

    fn log_params(&self, run: &RunInfo, params: &[(String, String)]) -> Result<()> {
        let dir = self.run_dir(run).join("params");
        for (key, value) in params {
            validate_key(key)?;
            std::fs::write(dir.join(key), value)?;
        }
        Ok(())
    }

    fn log_metrics(&self, run: &RunInfo, metrics: &[(String, f64)], step: i64) -> Result<()> {
        let dir = self.run_dir(run).join("metrics");
        let timestamp = now_millis();
        for (key, value) in metrics {
            validate_key(key)?;
            let mut file = OpenOptions::new().create(true).append(true).open(dir.join(key))?;
            writeln!(file, "{} {} {}", timestamp, value, step)?;
        }
        Ok(())
    }

    fn log_artifact(&self, run: &RunInfo, local_path: &Path, artifact_path: &str) -> Result<()> {
        let file_name = local_path.file_name().ok_or_else(|| {
            PipelineError::Tracking(format!("ファイル名がありません: {}", local_path.display()))
        })?;
        let mut dest_dir = self.run_dir(run).join("artifacts");
        if !artifact_path.is_empty() {
            validate_key(artifact_path)?;
            dest_dir = dest_dir.join(artifact_path);
        }
        std::fs::create_dir_all(&dest_dir)?;
        std::fs::copy(local_path, dest_dir.join(file_name))?;
        Ok(())
    }

    fn register_model(&self, _run: &RunInfo, _artifact_path: &str, name: &str) -> Result<String> {
        Err(PipelineError::Tracking(format!(
            "fileストアはモデルレジストリに対応していません: {}",
            name
        )))
    }

    fn end_run(&self, run: &RunInfo, status: RunStatus) -> Result<()> {
        let meta_path = self.run_dir(run).join(META_FILE);
        let mut meta: RunMeta = Self::read_meta(&meta_path)?;
        meta.status = status.as_code();
        meta.end_time = Some(now_millis());
        Self::write_meta(&meta_path, &meta)
    }

    fn scheme(&self) -> &str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("mlruns"));

        let run = store.create_run("Default", "evaluation").unwrap();
        assert_eq!(run.experiment_id, "0");
        assert!(run.artifact_uri.starts_with("file://"));

        store
            .log_params(
                &run,
                &[
                    ("EPOCHS".to_string(), "10".to_string()),
                    ("IMAGE_SIZE".to_string(), "[224,224,3]".to_string()),
                ],
            )
            .unwrap();
        store
            .log_metrics(&run, &[("loss".to_string(), 0.5), ("accuracy".to_string(), 0.75)], 0)
            .unwrap();

        let run_dir = dir.path().join("mlruns/0").join(&run.run_id);
        assert_eq!(std::fs::read_to_string(run_dir.join("params/EPOCHS")).unwrap(), "10");
        let metric = std::fs::read_to_string(run_dir.join("metrics/accuracy")).unwrap();
        let fields: Vec<&str> = metric.trim().split(' ').collect();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[1], "0.75");
        assert_eq!(fields[2], "0");

        store.end_run(&run, RunStatus::Finished).unwrap();
        let meta: RunMeta = FileStore::read_meta(&run_dir.join(META_FILE)).unwrap();
        assert_eq!(meta.status, 3);
        assert!(meta.end_time.is_some());
    }

    #[test]
    fn test_experiment_reused_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        let first = store.create_run("chest-ct", "a").unwrap();
        let second = store.create_run("chest-ct", "b").unwrap();
        let other = store.create_run("other", "c").unwrap();

        assert_eq!(first.experiment_id, second.experiment_id);
        assert_ne!(first.run_id, second.run_id);
        assert_ne!(first.experiment_id, other.experiment_id);
    }

    #[test]
    fn test_log_artifact_copies_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("mlruns"));
        let run = store.create_run("Default", "r").unwrap();

        let model = dir.path().join("model.tar.gz");
        std::fs::write(&model, b"bundle").unwrap();
        store.log_artifact(&run, &model, "model").unwrap();

        let copied = dir
            .path()
            .join("mlruns/0")
            .join(&run.run_id)
            .join("artifacts/model/model.tar.gz");
        assert_eq!(std::fs::read(copied).unwrap(), b"bundle");
    }

    #[test]
    fn test_register_model_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let run = store.create_run("Default", "r").unwrap();
        assert!(store.register_model(&run, "model", "VGG16Model").is_err());
    }

    #[test]
    fn test_invalid_param_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let run = store.create_run("Default", "r").unwrap();
        assert!(store
            .log_params(&run, &[("../x".to_string(), "1".to_string())])
            .is_err());
    }
}
