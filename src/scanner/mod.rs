//! 画像スキャナ
//!
//! 対応形式の画像をディレクトリから収集し、有効性チェックと
//! エンコード後サイズの見積もりを提供する。

use crate::error::{Result, TaggerError};
use crate::pipeline::chunker::SizeEstimator;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// 対応する画像拡張子（小文字で比較）
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

/// 拡張子からMIMEタイプを引く
pub fn mime_type(path: &Path) -> Result<&'static str> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => Ok("image/jpeg"),
        "png" => Ok("image/png"),
        "webp" => Ok("image/webp"),
        _ => Err(TaggerError::ImageLoad(format!(
            "未対応の画像形式です: {}",
            path.display()
        ))),
    }
}

/// 画像ファイルとして扱えるかどうか
///
/// 存在する・通常ファイルである・対応拡張子である・空でない、を確認する。
/// 画像のデコードまでは行わない。
pub fn validate_image(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    if mime_type(path).is_err() {
        return false;
    }
    match std::fs::metadata(path) {
        Ok(metadata) => metadata.len() > 0,
        Err(_) => false,
    }
}

/// ディレクトリを再帰的にスキャンし、有効な画像をソート済みで返す
pub fn scan_directory(directory: &Path) -> Result<Vec<PathBuf>> {
    if !directory.exists() {
        return Err(TaggerError::FolderNotFound(directory.display().to_string()));
    }
    if !directory.is_dir() {
        return Err(TaggerError::FolderNotFound(format!(
            "パスがディレクトリではありません: {}",
            directory.display()
        )));
    }

    let mut images = Vec::new();
    let mut invalid_count = 0usize;

    for entry in WalkDir::new(directory).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();

        if !path.is_file() {
            continue;
        }

        let Some(ext) = path.extension() else {
            continue;
        };
        let ext = ext.to_string_lossy().to_lowercase();
        if !IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            continue;
        }

        if !validate_image(path) {
            invalid_count += 1;
            continue;
        }

        images.push(path.to_path_buf());
    }

    images.sort();
    images.dedup();

    if invalid_count > 0 {
        eprintln!("⚠️ 無効な画像ファイルを{}件スキップしました", invalid_count);
    }

    Ok(images)
}

/// Base64エンコード後のペイロードサイズを見積もるエスティメータ
///
/// Base64でファイルサイズが約33%増えるのに加え、リクエストJSONの
/// 画像1枚あたりのオーバーヘッドとして1KBを上乗せする。
#[derive(Debug, Default, Clone, Copy)]
pub struct Base64SizeEstimator;

impl SizeEstimator for Base64SizeEstimator {
    fn estimate_encoded_size(&self, path: &Path) -> Result<u64> {
        let metadata = std::fs::metadata(path)?;
        Ok((metadata.len() as f64 * 1.33) as u64 + 1024)
    }

    fn is_valid(&self, path: &Path) -> bool {
        validate_image(path)
    }
}
