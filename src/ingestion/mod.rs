//! データ取り込み（ダウンロードと展開）

pub mod archive;
pub mod download;

pub use archive::{extract_archive, ArchiveFormat};
pub use download::{download_to_file, drive_file_id, http_client, resolve_download_url};

use crate::config::DataIngestionConfig;
use crate::error::Result;
use crate::utils::create_directories;

pub struct DataIngestion {
    config: DataIngestionConfig,
}

impl DataIngestion {
    pub fn new(config: DataIngestionConfig) -> Self {
        Self { config }
    }

    /// データセットのアーカイブをダウンロードする
    pub fn download_file(&self) -> Result<()> {
        let dataset_url = &self.config.source_url;
        let zip_download_dir = &self.config.local_data_file;

        let result: Result<()> = (|| {
            create_directories(&[&self.config.root_dir])?;
            tracing::info!(
                "Downloading data from {} into file {}",
                dataset_url,
                zip_download_dir.display()
            );

            let client = http_client()?;
            let bytes = download_to_file(&client, dataset_url, zip_download_dir)?;

            tracing::info!(
                "Finished downloading data from {} into file {} ({:.2} MB)",
                dataset_url,
                zip_download_dir.display(),
                bytes as f64 / 1024.0 / 1024.0
            );
            Ok(())
        })();

        if let Err(e) = &result {
            tracing::error!(
                "Exception raised while downloading data from {} into file {}: {}",
                dataset_url,
                zip_download_dir.display(),
                e
            );
        }
        result
    }

    /// ダウンロードしたアーカイブを展開する
    pub fn extract_zip_file(&self) -> Result<()> {
        let unzip_path = &self.config.unzip_dir;
        let zip_download_dir = &self.config.local_data_file;

        let result: Result<()> = (|| {
            create_directories(&[unzip_path])?;
            let count = extract_archive(zip_download_dir, unzip_path)?;
            tracing::info!(
                "Unzipped downloaded file in {} to {} ({} files)",
                zip_download_dir.display(),
                unzip_path.display(),
                count
            );
            Ok(())
        })();

        if let Err(e) = &result {
            tracing::error!(
                "Exception raised while unzipping downloaded file in {} to {}: {}",
                zip_download_dir.display(),
                unzip_path.display(),
                e
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_extract_zip_file_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("ingest/data.zip");
        std::fs::create_dir_all(zip_path.parent().unwrap()).unwrap();
        {
            let file = std::fs::File::create(&zip_path).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            writer
                .start_file("data/normal/1.png", zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(b"png").unwrap();
            writer.finish().unwrap();
        }

        let ingestion = DataIngestion::new(DataIngestionConfig {
            root_dir: dir.path().join("ingest"),
            source_url: "https://example.com/data.zip".to_string(),
            local_data_file: zip_path,
            unzip_dir: dir.path().join("ingest/unzipped"),
        });
        ingestion.extract_zip_file().unwrap();
        assert!(dir.path().join("ingest/unzipped/data/normal/1.png").is_file());
    }

    #[test]
    fn test_extract_missing_archive_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ingestion = DataIngestion::new(DataIngestionConfig {
            root_dir: dir.path().to_path_buf(),
            source_url: String::new(),
            local_data_file: dir.path().join("missing.zip"),
            unzip_dir: dir.path().join("out"),
        });
        assert!(ingestion.extract_zip_file().is_err());
    }
}
