//! MLflowトラッキングサーバー（REST API 2.0）への記録
//!
//! 認証情報は環境変数から読み込みます。
//! - `MLFLOW_TRACKING_USERNAME` / `MLFLOW_TRACKING_PASSWORD`: Basic認証
//! - `MLFLOW_TRACKING_TOKEN`: Bearerトークン

use std::path::Path;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use super::{now_millis, RunInfo, RunStatus, TrackingStore};
use crate::error::{PipelineError, Result};

const API_PREFIX: &str = "api/2.0/mlflow/";
const ARTIFACTS_PREFIX: &str = "api/2.0/mlflow-artifacts/artifacts/";
const PROXIED_ARTIFACT_SCHEME: &str = "mlflow-artifacts:/";

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ExperimentResponse {
    experiment: ExperimentBody,
}

#[derive(Debug, Deserialize)]
struct ExperimentBody {
    experiment_id: String,
}

#[derive(Debug, Deserialize)]
struct CreateExperimentResponse {
    experiment_id: String,
}

#[derive(Debug, Deserialize)]
struct CreateRunResponse {
    run: RunBody,
}

#[derive(Debug, Deserialize)]
struct RunBody {
    info: RunInfoBody,
}

#[derive(Debug, Deserialize)]
struct RunInfoBody {
    run_id: String,
    experiment_id: String,
    artifact_uri: String,
}

#[derive(Debug, Deserialize)]
struct ModelVersionResponse {
    model_version: ModelVersionBody,
}

#[derive(Debug, Deserialize)]
struct ModelVersionBody {
    version: String,
}

enum Auth {
    None,
    Basic { username: String, password: String },
    Bearer(String),
}

impl Auth {
    fn from_env() -> Self {
        let username = std::env::var("MLFLOW_TRACKING_USERNAME").ok();
        let password = std::env::var("MLFLOW_TRACKING_PASSWORD").ok();
        if let (Some(username), Some(password)) = (username, password) {
            return Auth::Basic { username, password };
        }
        match std::env::var("MLFLOW_TRACKING_TOKEN") {
            Ok(token) => Auth::Bearer(token),
            Err(_) => Auth::None,
        }
    }

    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Auth::None => request,
            Auth::Basic { username, password } => request.basic_auth(username, Some(password)),
            Auth::Bearer(token) => request.bearer_auth(token),
        }
    }
}

pub struct RestStore {
    base: Url,
    client: Client,
    auth: Auth,
}

impl RestStore {
    pub fn new(base: Url) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("cnn_classifier/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| PipelineError::Tracking(format!("HTTPクライアントを作成できません: {}", e)))?;

        Ok(Self {
            base: with_trailing_slash(base),
            client,
            auth: Auth::from_env(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| PipelineError::Tracking(format!("URLを組み立てられません ({}): {}", path, e)))
    }

    fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        self.auth
            .apply(request)
            .send()
            .map_err(|e| PipelineError::Tracking(format!("{} に失敗しました: {}", what, e)))
    }

    /// レスポンスをJSONとして読み、エラー応答はerror_code付きで返す
    fn read_json(response: Response, what: &str) -> std::result::Result<Value, ApiError> {
        let status = response.status();
        let body = response.text().unwrap_or_default();
        if status.is_success() {
            return Ok(serde_json::from_str(&body).unwrap_or(Value::Null));
        }
        let mut error = serde_json::from_str::<ApiError>(&body).unwrap_or(ApiError {
            error_code: String::new(),
            message: String::new(),
        });
        if error.message.is_empty() {
            error.message = format!("{} がHTTP {} を返しました: {}", what, status, body);
        }
        Err(error)
    }

    fn post(&self, path: &str, body: &Value) -> std::result::Result<Value, ApiError> {
        let url = self.endpoint(&format!("{}{}", API_PREFIX, path)).map_err(to_api_error)?;
        let response = self
            .send(self.client.post(url).json(body), path)
            .map_err(to_api_error)?;
        Self::read_json(response, path)
    }

    fn get(&self, path: &str, query: &[(&str, &str)]) -> std::result::Result<Value, ApiError> {
        let url = self.endpoint(&format!("{}{}", API_PREFIX, path)).map_err(to_api_error)?;
        let response = self
            .send(self.client.get(url).query(query), path)
            .map_err(to_api_error)?;
        Self::read_json(response, path)
    }

    fn get_or_create_experiment(&self, name: &str) -> Result<String> {
        match self.get("experiments/get-by-name", &[("experiment_name", name)]) {
            Ok(value) => {
                let parsed: ExperimentResponse = decode(value, "experiments/get-by-name")?;
                return Ok(parsed.experiment.experiment_id);
            }
            Err(e) if e.error_code == "RESOURCE_DOES_NOT_EXIST" => {}
            Err(e) => return Err(from_api_error(e)),
        }

        let value = self
            .post("experiments/create", &json!({ "name": name }))
            .map_err(from_api_error)?;
        let parsed: CreateExperimentResponse = decode(value, "experiments/create")?;
        tracing::info!("実験を作成しました: {} (id={})", name, parsed.experiment_id);
        Ok(parsed.experiment_id)
    }
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

fn to_api_error(e: PipelineError) -> ApiError {
    ApiError {
        error_code: String::new(),
        message: e.to_string(),
    }
}

fn from_api_error(e: ApiError) -> PipelineError {
    if e.error_code.is_empty() {
        PipelineError::Tracking(e.message)
    } else {
        PipelineError::Tracking(format!("{}: {}", e.error_code, e.message))
    }
}

fn decode<T: for<'de> Deserialize<'de>>(value: Value, what: &str) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| PipelineError::Tracking(format!("{} の応答を解析できません: {}", what, e)))
}

/// `mlflow-artifacts:/<exp>/<run>/artifacts` をプロキシ経由のアップロードパスに変換
pub fn proxied_artifact_path(artifact_uri: &str, artifact_path: &str, file_name: &str) -> Option<String> {
    let root = artifact_uri.strip_prefix(PROXIED_ARTIFACT_SCHEME)?;
    let root = root.trim_matches('/');
    let mut parts = vec![root.to_string()];
    let artifact_path = artifact_path.trim_matches('/');
    if !artifact_path.is_empty() {
        parts.push(artifact_path.to_string());
    }
    parts.push(file_name.to_string());
    Some(parts.join("/"))
}

impl TrackingStore for RestStore {
    fn create_run(&self, experiment_name: &str, run_name: &str) -> Result<RunInfo> {
        let experiment_id = self.get_or_create_experiment(experiment_name)?;
        let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
        let body = json!({
            "experiment_id": experiment_id,
            "start_time": now_millis(),
            "run_name": run_name,
            "tags": [
                { "key": "mlflow.runName", "value": run_name },
                { "key": "mlflow.user", "value": user },
            ],
        });
        let value = self.post("runs/create", &body).map_err(from_api_error)?;
        let parsed: CreateRunResponse = decode(value, "runs/create")?;

        Ok(RunInfo {
            experiment_id: parsed.run.info.experiment_id,
            run_id: parsed.run.info.run_id,
            artifact_uri: parsed.run.info.artifact_uri,
        })
    }

    fn log_params(&self, run: &RunInfo, params: &[(String, String)]) -> Result<()> {
        let params: Vec<Value> = params
            .iter()
            .map(|(key, value)| json!({ "key": key, "value": value }))
            .collect();
        // log-batchはパラメータ100件までなので分割して送る
        for chunk in params.chunks(100) {
            self.post("runs/log-batch", &json!({ "run_id": run.run_id, "params": chunk }))
                .map_err(from_api_error)?;
        }
        Ok(())
    }

    fn log_metrics(&self, run: &RunInfo, metrics: &[(String, f64)], step: i64) -> Result<()> {
        let timestamp = now_millis();
        let metrics: Vec<Value> = metrics
            .iter()
            .map(|(key, value)| json!({ "key": key, "value": value, "timestamp": timestamp, "step": step }))
            .collect();
        self.post("runs/log-batch", &json!({ "run_id": run.run_id, "metrics": metrics }))
            .map_err(from_api_error)?;
        Ok(())
    }

    fn log_artifact(&self, run: &RunInfo, local_path: &Path, artifact_path: &str) -> Result<()> {
        let file_name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| {
                PipelineError::Tracking(format!("ファイル名がありません: {}", local_path.display()))
            })?;
        let upload_path = proxied_artifact_path(&run.artifact_uri, artifact_path, &file_name)
            .ok_or_else(|| {
                PipelineError::Tracking(format!(
                    "アーティファクトの保存先に対応していません: {}",
                    run.artifact_uri
                ))
            })?;

        let url = self.endpoint(&format!("{}{}", ARTIFACTS_PREFIX, upload_path))?;
        let data = std::fs::read(local_path)?;
        tracing::info!("アーティファクトをアップロード中: {} ({} bytes)", file_name, data.len());
        let response = self.send(self.client.put(url).body(data), "artifact upload")?;
        Self::read_json(response, "artifact upload").map_err(from_api_error)?;
        Ok(())
    }

    fn register_model(&self, run: &RunInfo, artifact_path: &str, name: &str) -> Result<String> {
        match self.post("registered-models/create", &json!({ "name": name })) {
            Ok(_) => tracing::info!("登録モデルを作成しました: {}", name),
            Err(e) if e.error_code == "RESOURCE_ALREADY_EXISTS" => {
                tracing::debug!("登録モデルは既に存在します: {}", name)
            }
            Err(e) => return Err(from_api_error(e)),
        }

        let source = format!("{}/{}", run.artifact_uri.trim_end_matches('/'), artifact_path);
        let value = self
            .post(
                "model-versions/create",
                &json!({ "name": name, "source": source, "run_id": run.run_id }),
            )
            .map_err(from_api_error)?;
        let parsed: ModelVersionResponse = decode(value, "model-versions/create")?;
        Ok(parsed.model_version.version)
    }

    fn end_run(&self, run: &RunInfo, status: RunStatus) -> Result<()> {
        self.post(
            "runs/update",
            &json!({ "run_id": run.run_id, "status": status.as_str(), "end_time": now_millis() }),
        )
        .map_err(from_api_error)?;
        Ok(())
    }

    fn scheme(&self) -> &str {
        self.base.scheme()
    }
}
