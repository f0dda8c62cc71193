//! HTTPダウンロード
//!
//! Google Driveの共有URLは直接ダウンロード用のURLに変換します。
//! 大きなファイルではDriveがウイルススキャン確認ページ(HTML)を返すため、
//! ページ内のフォームから確認付きURLを組み立てて再取得します。

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::{Client, Response};
use reqwest::header::CONTENT_TYPE;
use url::Url;

use crate::error::{PipelineError, Result};
use crate::utils::ensure_parent_dir;

const DRIVE_DOWNLOAD_PREFIX: &str = "https://drive.google.com/uc?/export=download&id=";

/// Google Driveの共有URLからファイルIDを取り出す
///
/// `https://drive.google.com/file/d/<ID>/view?usp=sharing` の末尾から2番目のセグメント。
pub fn drive_file_id(source_url: &str) -> Option<String> {
    let url = Url::parse(source_url).ok()?;
    if url.host_str() != Some("drive.google.com") {
        return None;
    }
    let segments: Vec<&str> = url.path_segments()?.filter(|s| !s.is_empty()).collect();
    if segments.len() < 2 {
        return None;
    }
    let id = segments[segments.len() - 2];
    if id == "d" || id.is_empty() {
        return None;
    }
    Some(id.to_string())
}

/// 実際に取得するURLを決定する
pub fn resolve_download_url(source_url: &str) -> String {
    match drive_file_id(source_url) {
        Some(id) => format!("{}{}", DRIVE_DOWNLOAD_PREFIX, id),
        None => source_url.to_string(),
    }
}

/// Driveの確認ページから確認付きダウンロードURLを組み立てる
pub fn parse_drive_confirm_page(html: &str, original_url: &str) -> Option<String> {
    if let Some(form_start) = html.find("id=\"download-form\"") {
        let form_html = &html[form_start..];
        let form_end = form_html.find("</form>").unwrap_or(form_html.len());
        let form_html = &form_html[..form_end];

        let action = attribute_value(form_html, "action")?;
        let mut fields = Vec::new();
        let mut rest = form_html;
        while let Some(pos) = rest.find("<input") {
            rest = &rest[pos + "<input".len()..];
            let tag_end = rest.find('>').unwrap_or(rest.len());
            let tag = &rest[..tag_end];
            if attribute_value(tag, "type").as_deref() == Some("hidden") {
                if let (Some(name), Some(value)) =
                    (attribute_value(tag, "name"), attribute_value(tag, "value"))
                {
                    fields.push((name, value));
                }
            }
        }

        let url = Url::parse_with_params(&action, &fields).ok()?;
        return Some(url.to_string());
    }

    // 旧形式: ページ内リンクの confirm=XXXX を元URLに付与
    let pos = html.find("confirm=")?;
    let token: String = html[pos + "confirm=".len()..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if token.is_empty() {
        return None;
    }
    let mut url = Url::parse(original_url).ok()?;
    url.query_pairs_mut().append_pair("confirm", &token);
    Some(url.to_string())
}

fn attribute_value(tag: &str, name: &str) -> Option<String> {
    let pattern = format!("{}=\"", name);
    let mut search = tag;
    loop {
        let pos = search.find(&pattern)?;
        // "id=" が "uuid=" などにマッチしないよう直前の文字を確認
        let preceded_ok = pos == 0
            || search[..pos]
                .chars()
                .last()
                .map(|c| c.is_whitespace() || c == '<')
                .unwrap_or(true);
        let after = &search[pos + pattern.len()..];
        if preceded_ok {
            let end = after.find('"')?;
            return Some(after[..end].replace("&amp;", "&"));
        }
        search = after;
    }
}

/// ダウンロード用HTTPクライアントを作成
pub fn http_client() -> Result<Client> {
    Client::builder()
        .user_agent(concat!("cnn_classifier/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(30))
        .timeout(None)
        .build()
        .map_err(|e| PipelineError::Download {
            url: String::new(),
            message: format!("HTTPクライアントを作成できません: {e}"),
        })
}

fn get(client: &Client, url: &str) -> Result<Response> {
    let response = client.get(url).send().map_err(|e| PipelineError::Download {
        url: url.to_string(),
        message: e.to_string(),
    })?;

    if !response.status().is_success() {
        return Err(PipelineError::Download {
            url: url.to_string(),
            message: format!("HTTPステータス {}", response.status()),
        });
    }
    Ok(response)
}

fn is_html(response: &Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("text/html"))
        .unwrap_or(false)
}

/// URLの内容をファイルへ保存し、書き込んだバイト数を返す
///
/// 途中で失敗した場合は `.part` ファイルを残さず削除します。
pub fn download_to_file(client: &Client, source_url: &str, dest: &Path) -> Result<u64> {
    let url = resolve_download_url(source_url);
    let mut response = get(client, &url)?;

    if drive_file_id(source_url).is_some() && is_html(&response) {
        let html = response.text().map_err(|e| PipelineError::Download {
            url: url.clone(),
            message: e.to_string(),
        })?;
        let confirm_url = parse_drive_confirm_page(&html, &url).ok_or_else(|| {
            PipelineError::Download {
                url: url.clone(),
                message: "Google Driveの確認ページを解析できません（共有設定を確認してください）"
                    .to_string(),
            }
        })?;
        tracing::debug!("Google Driveの確認ページを検出しました: {}", confirm_url);
        response = get(client, &confirm_url)?;
        if is_html(&response) {
            return Err(PipelineError::Download {
                url: confirm_url,
                message: "ファイルではなくHTMLが返されました".to_string(),
            });
        }
    }

    ensure_parent_dir(dest)?;
    let part_path = dest.with_extension("part");
    let written = write_with_progress(response, &part_path).map_err(|e| {
        std::fs::remove_file(&part_path).ok();
        e
    })?;
    std::fs::rename(&part_path, dest)?;

    Ok(written)
}

fn write_with_progress(response: Response, part_path: &Path) -> Result<u64> {
    let pb = match response.content_length() {
        Some(len) => {
            let pb = ProgressBar::new(len);
            if let Ok(style) = ProgressStyle::default_bar()
                .template("  {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})")
            {
                pb.set_style(style.progress_chars("#>-"));
            }
            pb
        }
        None => ProgressBar::new_spinner(),
    };

    let mut file = File::create(part_path)?;
    let mut reader = pb.wrap_read(response);
    let written = std::io::copy(&mut reader, &mut file)?;
    file.flush()?;
    pb.finish_and_clear();

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drive_file_id() {
        assert_eq!(
            drive_file_id("https://drive.google.com/file/d/1AbC-xyz_9/view?usp=sharing").as_deref(),
            Some("1AbC-xyz_9")
        );
        assert_eq!(drive_file_id("https://example.com/file/d/abc/view"), None);
        assert_eq!(drive_file_id("not a url"), None);
    }

    #[test]
    fn test_resolve_download_url() {
        assert_eq!(
            resolve_download_url("https://drive.google.com/file/d/XYZ/view?usp=sharing"),
            "https://drive.google.com/uc?/export=download&id=XYZ"
        );
        assert_eq!(
            resolve_download_url("https://example.com/data.zip"),
            "https://example.com/data.zip"
        );
    }

    #[test]
    fn test_parse_confirm_form() {
        let html = r#"<html><body>
            <form id="download-form" action="https://drive.usercontent.google.com/download" method="get">
            <input type="submit" id="uc-download-link" value="Download anyway"/>
            <input type="hidden" name="id" value="XYZ">
            <input type="hidden" name="export" value="download">
            <input type="hidden" name="confirm" value="t">
            <input type="hidden" name="uuid" value="1234-abcd">
            </form></body></html>"#;

        let url = parse_drive_confirm_page(html, "https://drive.google.com/uc?id=XYZ").unwrap();
        let parsed = Url::parse(&url).unwrap();
        assert_eq!(parsed.host_str(), Some("drive.usercontent.google.com"));
        let pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("id".to_string(), "XYZ".to_string())));
        assert!(pairs.contains(&("confirm".to_string(), "t".to_string())));
        assert!(pairs.contains(&("uuid".to_string(), "1234-abcd".to_string())));
    }

    #[test]
    fn test_parse_legacy_confirm_token() {
        let html = r#"<a href="/uc?export=download&amp;confirm=Ab_9&amp;id=XYZ">Download</a>"#;
        let url = parse_drive_confirm_page(html, "https://drive.google.com/uc?export=download&id=XYZ")
            .unwrap();
        assert!(url.ends_with("confirm=Ab_9"));
    }

    #[test]
    fn test_parse_unrelated_html() {
        assert_eq!(parse_drive_confirm_page("<html>nothing</html>", "https://x.y/"), None);
    }

    #[test]
    fn test_attribute_value_does_not_match_suffix() {
        let tag = r#" type="hidden" uuid="u1" id="real""#;
        assert_eq!(attribute_value(tag, "id").as_deref(), Some("real"));
    }
}
