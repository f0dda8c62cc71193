//! 画像フォルダのデータセット
//!
//! `data_dir/<クラス名>/<画像>` の構成を読み込みます。
//! クラスはサブディレクトリ名の昇順でインデックスを割り当て、
//! 各クラスの画像もファイル名順に並べるため、分割結果は常に同じになります。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Int, Tensor},
};
use image::imageops::FilterType;
use image::RgbImage;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::augmentation::Augmenter;
use crate::config::ImageSize;
use crate::error::{PipelineError, Result};

/// 読み込み対象の拡張子
pub const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// 分割後のどちらを使うか
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subset {
    Training,
    Validation,
}

/// データセットアイテム（画像パスのみ保持）
#[derive(Clone, Debug, PartialEq)]
pub struct ImageItem {
    pub path: PathBuf,
    pub label: usize,
}

/// クラスごとのファイル一覧
#[derive(Debug, Clone)]
pub struct ImageFolderDataset {
    root: PathBuf,
    class_names: Vec<String>,
    files_per_class: Vec<Vec<PathBuf>>,
}

fn is_image_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map(|ext| {
                let ext = ext.to_string_lossy().to_lowercase();
                IMAGE_EXTENSIONS.contains(&ext.as_str())
            })
            .unwrap_or(false)
}

impl ImageFolderDataset {
    /// ディレクトリから学習データを読み込む
    pub fn from_directory(data_dir: &Path) -> Result<Self> {
        if !data_dir.is_dir() {
            return Err(PipelineError::Dataset(format!(
                "データディレクトリが存在しません: {}",
                data_dir.display()
            )));
        }

        let mut class_dirs: Vec<(String, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(data_dir)? {
            let path = entry?.path();
            if path.is_dir() {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                class_dirs.push((name, path));
            }
        }
        class_dirs.sort_by(|a, b| a.0.cmp(&b.0));

        if class_dirs.is_empty() {
            return Err(PipelineError::Dataset(format!(
                "クラスディレクトリが見つかりません: {}",
                data_dir.display()
            )));
        }

        let mut class_names = Vec::with_capacity(class_dirs.len());
        let mut files_per_class = Vec::with_capacity(class_dirs.len());
        for (name, dir) in class_dirs {
            let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| is_image_file(path))
                .collect();
            files.sort();
            class_names.push(name);
            files_per_class.push(files);
        }

        Ok(Self {
            root: data_dir.to_path_buf(),
            class_names,
            files_per_class,
        })
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// 全画像数
    pub fn total_images(&self) -> usize {
        self.files_per_class.iter().map(Vec::len).sum()
    }

    /// (クラス名, 画像数) の一覧
    pub fn class_counts(&self) -> Vec<(String, usize)> {
        self.class_names
            .iter()
            .cloned()
            .zip(self.files_per_class.iter().map(Vec::len))
            .collect()
    }

    /// 学習用/検証用に分割
    ///
    /// 各クラスの先頭 `floor(n * validation_split)` 枚を検証用、残りを学習用とします。
    pub fn split(&self, validation_split: f64, subset: Subset) -> Result<ImageSubset> {
        if !(0.0..1.0).contains(&validation_split) {
            return Err(PipelineError::Dataset(format!(
                "validation_split は [0, 1) の範囲で指定してください: {}",
                validation_split
            )));
        }

        let mut items = Vec::new();
        for (label, files) in self.files_per_class.iter().enumerate() {
            let n_validation = (files.len() as f64 * validation_split).floor() as usize;
            let range = match subset {
                Subset::Validation => 0..n_validation,
                Subset::Training => n_validation..files.len(),
            };
            items.extend(files[range].iter().map(|path| ImageItem {
                path: path.clone(),
                label,
            }));
        }

        if items.is_empty() {
            return Err(PipelineError::Dataset(format!(
                "{:?} 用の画像が1枚もありません: {} (validation_split={})",
                subset,
                self.root.display(),
                validation_split
            )));
        }

        Ok(ImageSubset {
            items,
            class_names: self.class_names.clone(),
        })
    }
}

/// 分割後のデータセット
#[derive(Debug, Clone)]
pub struct ImageSubset {
    items: Vec<ImageItem>,
    class_names: Vec<String>,
}

impl ImageSubset {
    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn items(&self) -> &[ImageItem] {
        &self.items
    }

    /// クラス名 -> インデックス の一覧（ログ用）
    pub fn class_indices(&self) -> String {
        let pairs: Vec<String> = self
            .class_names
            .iter()
            .enumerate()
            .map(|(i, name)| format!("'{}': {}", name, i))
            .collect();
        format!("{{{}}}", pairs.join(", "))
    }
}

impl Dataset<ImageItem> for ImageSubset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// 画像を読み込んでリサイズ
pub fn load_resized_image(path: &Path, size: &ImageSize) -> Result<RgbImage> {
    let img = image::open(path)
        .map_err(|e| PipelineError::ImageLoad(path.to_path_buf(), e.to_string()))?
        .to_rgb8();

    if img.width() as usize == size.width && img.height() as usize == size.height {
        return Ok(img);
    }
    Ok(image::imageops::resize(
        &img,
        size.width as u32,
        size.height as u32,
        FilterType::Triangle,
    ))
}

/// RGB画像を 1/255 でスケーリングし (C, H, W) の順で平坦化
pub fn image_to_chw(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let mut data = Vec::with_capacity(3 * (width * height) as usize);
    for channel in 0..3 {
        for y in 0..height {
            for x in 0..width {
                data.push(img.get_pixel(x, y)[channel] as f32 / 255.0);
            }
        }
    }
    data
}

/// 画像ファイルをモデル入力用のデータに変換
pub fn load_image_tensor_data(path: &Path, size: &ImageSize) -> Result<Vec<f32>> {
    let img = load_resized_image(path, size)?;
    Ok(image_to_chw(&img))
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

/// バッチャー
///
/// 拡張を有効にした場合、バッチごとに `seed` と通し番号から乱数を作ります。
#[derive(Clone)]
pub struct ImageBatcher<B: Backend> {
    device: B::Device,
    image_size: ImageSize,
    augmenter: Option<Augmenter>,
    seed: u64,
    counter: Arc<AtomicU64>,
}

impl<B: Backend> ImageBatcher<B> {
    pub fn new(device: B::Device, image_size: ImageSize) -> Self {
        Self {
            device,
            image_size,
            augmenter: None,
            seed: 0,
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// データ拡張を有効にする
    pub fn with_augmentation(mut self, augmenter: Augmenter, seed: u64) -> Self {
        self.augmenter = Some(augmenter);
        self.seed = seed;
        self
    }

    fn load_item(&self, item: &ImageItem, rng: Option<&mut StdRng>) -> Result<Vec<f32>> {
        let img = load_resized_image(&item.path, &self.image_size)?;
        let img = match (&self.augmenter, rng) {
            (Some(augmenter), Some(rng)) => augmenter.augment(&img, rng),
            _ => img,
        };
        Ok(image_to_chw(&img))
    }
}

impl<B: Backend> Batcher<B, ImageItem, ImageBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<ImageItem>, _device: &B::Device) -> ImageBatch<B> {
        let batch_size = items.len();
        let ImageSize { height, width, .. } = self.image_size;
        let pixels_per_image = 3 * height * width;

        let mut rng = self.augmenter.as_ref().map(|_| {
            let step = self.counter.fetch_add(1, Ordering::Relaxed);
            StdRng::seed_from_u64(self.seed.wrapping_add(step))
        });

        let mut all_pixels = Vec::with_capacity(batch_size * pixels_per_image);
        let mut targets_vec = Vec::with_capacity(batch_size);

        for item in items {
            match self.load_item(&item, rng.as_mut()) {
                Ok(image_data) => all_pixels.extend_from_slice(&image_data),
                Err(e) => {
                    tracing::warn!("画像読み込み失敗のためゼロで埋めます: {}", e);
                    all_pixels.extend(std::iter::repeat(0.0f32).take(pixels_per_image));
                }
            }
            targets_vec.push(item.label as i64);
        }

        // 1回の転送でバッチ全体をデバイスへ
        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device)
            .reshape([batch_size, 3, height, width]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets_vec.as_slice(), &self.device);

        ImageBatch { images, targets }
    }
}
