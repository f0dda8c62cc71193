//! モデルとメタデータの永続化
//!
//! モデルは1つの `.tar.gz` バンドルとして保存します。
//!
//! - `metadata.json`: 入力サイズ、クラス名、凍結範囲など
//! - `model.bin`: Burnのレコード（バイナリ）

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder, Header};

use crate::model::model_metadata::ModelMetadata;
use crate::utils::{ensure_parent_dir, with_bundle_extension};

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

/// メタデータと共にモデルをTar.gz形式で保存
///
/// 保存先のパスを返します（`.tar.gz` で終わらない場合は付与）。
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> Result<PathBuf> {
    let tar_gz_path = with_bundle_extension(output_path);

    ensure_parent_dir(&tar_gz_path)?;
    let file = File::create(&tar_gz_path)
        .with_context(|| format!("モデルバンドルを作成できません: {}", tar_gz_path.display()))?;

    let mut bundle = Builder::new(GzEncoder::new(file, Compression::default()));
    let metadata_json = metadata.to_json_string()?;
    append_entry(&mut bundle, METADATA_ENTRY, metadata_json.as_bytes())?;
    append_entry(&mut bundle, MODEL_ENTRY, model_binary)?;

    // gzipストリームまで確実に書き切る
    bundle
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .with_context(|| format!("モデルバンドルを書き込めません: {}", tar_gz_path.display()))?;

    tracing::info!(
        "モデルを保存しました: {} ({:.2} MB)",
        tar_gz_path.display(),
        model_binary.len() as f64 / 1024.0 / 1024.0
    );

    Ok(tar_gz_path)
}

fn append_entry<W: std::io::Write>(bundle: &mut Builder<W>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    bundle
        .append_data(&mut header, name, data)
        .with_context(|| format!("{} をバンドルに追加できません", name))
}

/// バンドルから読み出したエントリ
#[derive(Default)]
struct BundleEntries {
    metadata: Option<ModelMetadata>,
    model: Option<Vec<u8>>,
}

impl BundleEntries {
    fn require_metadata(&mut self) -> Result<ModelMetadata> {
        self.metadata
            .take()
            .with_context(|| format!("{} がバンドルにありません", METADATA_ENTRY))
    }

    fn require_model(&mut self) -> Result<Vec<u8>> {
        self.model
            .take()
            .with_context(|| format!("{} がバンドルにありません", MODEL_ENTRY))
    }
}

/// バンドルを先頭から走査し、`wanted` に含まれるエントリだけ読み込む
fn read_bundle(tar_gz_path: &Path, wanted: &[&str]) -> Result<BundleEntries> {
    let path = with_bundle_extension(tar_gz_path);
    let file = File::open(&path)
        .with_context(|| format!("モデルバンドルを開けません: {}", path.display()))?;
    let mut archive = Archive::new(GzDecoder::new(file));

    let mut found = BundleEntries::default();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().to_string();
        if !wanted.contains(&name.as_str()) {
            continue;
        }

        let mut buffer = Vec::new();
        entry.read_to_end(&mut buffer)?;
        match name.as_str() {
            METADATA_ENTRY => {
                let json = String::from_utf8(buffer).context("metadata.json がUTF-8ではありません")?;
                found.metadata = Some(ModelMetadata::from_json_string(&json)?);
            }
            MODEL_ENTRY => found.model = Some(buffer),
            _ => {}
        }

        let done = (found.metadata.is_some() || !wanted.contains(&METADATA_ENTRY))
            && (found.model.is_some() || !wanted.contains(&MODEL_ENTRY));
        if done {
            break;
        }
    }
    Ok(found)
}

/// Tar.gzからモデルメタデータを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    read_bundle(tar_gz_path, &[METADATA_ENTRY])?.require_metadata()
}

/// Tar.gzからモデルバイナリを読み込む
pub fn load_model_binary(tar_gz_path: &Path) -> Result<Vec<u8>> {
    read_bundle(tar_gz_path, &[MODEL_ENTRY])?.require_model()
}

/// メタデータとモデルバイナリを共に読み込む
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    let mut entries = read_bundle(tar_gz_path, &[METADATA_ENTRY, MODEL_ENTRY])?;
    Ok((entries.require_metadata()?, entries.require_model()?))
}

/// メタデータをコンソールに表示
pub fn print_metadata_info(metadata: &ModelMetadata) {
    println!("\n=== {} ===", metadata.architecture);
    println!("種類: {:?}", metadata.kind);
    println!("アーキテクチャ: {}", metadata.architecture);
    println!(
        "入力サイズ: {}x{}x{}",
        metadata.image_size[0], metadata.image_size[1], metadata.image_size[2]
    );
    println!("全結合層(include_top): {}", metadata.include_top);
    match metadata.num_classes {
        Some(n) => println!("クラス数: {}", n),
        None => println!("クラス数: (分類ヘッドなし)"),
    }
    if !metadata.class_names.is_empty() {
        println!("クラス名: {}", metadata.class_names.join(", "));
    }
    println!("凍結範囲: {}", metadata.freeze);
    println!("初期重み: {}", metadata.weights.as_deref().unwrap_or("なし"));
    if let Some(epochs) = metadata.num_epochs {
        println!("学習エポック数: {}", epochs);
    }
    if let Some(lr) = metadata.learning_rate {
        println!("学習率: {}", lr);
    }
    println!("作成日時: {}", metadata.created_at);
    println!("{}", "=".repeat(24));
}
