//! アーカイブ展開（zip / tar.gz）

use std::fs::File;
use std::path::Path;

use flate2::read::GzDecoder;

use crate::error::{PipelineError, Result};

/// アーカイブ形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    /// 拡張子から形式を判定（不明ならzip扱い）
    pub fn from_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            ArchiveFormat::TarGz
        } else {
            ArchiveFormat::Zip
        }
    }
}

/// アーカイブを展開し、展開したファイル数を返す
pub fn extract_archive(archive_path: &Path, output_dir: &Path) -> Result<usize> {
    std::fs::create_dir_all(output_dir)?;
    match ArchiveFormat::from_path(archive_path) {
        ArchiveFormat::Zip => extract_zip(archive_path, output_dir),
        ArchiveFormat::TarGz => extract_tar_gz(archive_path, output_dir),
    }
}

fn extract_zip(archive_path: &Path, output_dir: &Path) -> Result<usize> {
    let file = File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| PipelineError::Archive(format!("zipを開けません {}: {}", archive_path.display(), e)))?;

    let mut extracted = 0;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| PipelineError::Archive(format!("zipエントリを読めません: {}", e)))?;

        // 展開先の外を指すエントリは拒否
        let relative = entry.enclosed_name().ok_or_else(|| {
            PipelineError::Archive(format!("不正なパスを含むエントリです: {}", entry.name()))
        })?;
        let out_path = output_dir.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out_file = File::create(&out_path)?;
        std::io::copy(&mut entry, &mut out_file)?;
        extracted += 1;
    }

    Ok(extracted)
}

fn extract_tar_gz(archive_path: &Path, output_dir: &Path) -> Result<usize> {
    let tar_gz = File::open(archive_path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(tar_gz));

    let mut extracted = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let is_file = entry.header().entry_type().is_file();
        // unpack_in は展開先の外へ出るエントリを書き込まずに false を返す
        let unpacked = entry.unpack_in(output_dir)?;
        if !unpacked {
            return Err(PipelineError::Archive(format!(
                "不正なパスを含むエントリです: {}",
                entry.path()?.display()
            )));
        }
        if is_file {
            extracted += 1;
        }
    }

    Ok(extracted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, data) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(ArchiveFormat::from_path(Path::new("data.zip")), ArchiveFormat::Zip);
        assert_eq!(ArchiveFormat::from_path(Path::new("data.TAR.GZ")), ArchiveFormat::TarGz);
        assert_eq!(ArchiveFormat::from_path(Path::new("data.tgz")), ArchiveFormat::TarGz);
    }

    #[test]
    fn test_extract_zip() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("data.zip");
        write_zip(
            &zip_path,
            &[("images/normal/a.png", b"aaa"), ("images/adenocarcinoma/b.png", b"bb")],
        );

        let out = dir.path().join("out");
        let count = extract_archive(&zip_path, &out).unwrap();
        assert_eq!(count, 2);
        assert_eq!(std::fs::read(out.join("images/normal/a.png")).unwrap(), b"aaa");
    }

    #[test]
    fn test_zip_slip_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("evil.zip");
        write_zip(&zip_path, &[("../escape.txt", b"x")]);

        let out = dir.path().join("out");
        let err = extract_archive(&zip_path, &out).unwrap_err();
        assert!(matches!(err, PipelineError::Archive(_)));
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[test]
    fn test_extract_tar_gz() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("data.tar.gz");
        {
            let file = File::create(&archive_path).unwrap();
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            let data = b"hello";
            let mut header = tar::Header::new_gnu();
            header.set_path("set/normal/x.png").unwrap();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, &data[..]).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let out = dir.path().join("out");
        assert_eq!(extract_archive(&archive_path, &out).unwrap(), 1);
        assert_eq!(std::fs::read(out.join("set/normal/x.png")).unwrap(), b"hello");
    }

    #[test]
    fn test_corrupt_zip() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("broken.zip");
        std::fs::write(&zip_path, b"not a zip").unwrap();
        assert!(matches!(
            extract_archive(&zip_path, dir.path()),
            Err(PipelineError::Archive(_))
        ));
    }
}
