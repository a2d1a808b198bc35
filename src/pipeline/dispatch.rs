//! チャンク単位のディスパッチ
//!
//! 1チャンク = 1回のvision API呼び出し。APIは複数画像のチャンクに
//! 対して画像ごとの結果を返さないため、返ってきた1つのキャプションを
//! チャンク内の全画像に複製する。失敗時はチャンク内の全画像が
//! 同じエラーメッセージの失敗タプルになる。

use crate::api::{ImagePayload, VisionApi};
use crate::error::{Result, TaggerError};
use crate::scanner;
use std::path::PathBuf;

/// 1画像分の処理結果
#[derive(Debug, Clone)]
pub struct TagResult {
    pub path: PathBuf,
    pub text: String,
    pub success: bool,
}

impl TagResult {
    pub fn success(path: PathBuf, text: String) -> Self {
        Self {
            path,
            text,
            success: true,
        }
    }

    pub fn failure(path: PathBuf, message: String) -> Self {
        Self {
            path,
            text: message,
            success: false,
        }
    }
}

/// チャンク内の画像を読み込んでAPIペイロードへ変換する
fn load_payloads(chunk: &[PathBuf]) -> Result<Vec<ImagePayload>> {
    let mut payloads = Vec::with_capacity(chunk.len());
    for path in chunk {
        let mime_type = scanner::mime_type(path)?;
        let bytes = std::fs::read(path)?;
        if bytes.is_empty() {
            return Err(TaggerError::ImageLoad(format!(
                "画像ファイルが空です: {}",
                path.display()
            )));
        }
        payloads.push(ImagePayload {
            mime_type: mime_type.to_string(),
            bytes,
        });
    }
    Ok(payloads)
}

async fn dispatch_chunk(
    client: &dyn VisionApi,
    chunk: &[PathBuf],
    prompt: &str,
    system_prompt: Option<&str>,
) -> Result<String> {
    let payloads = load_payloads(chunk)?;
    client.generate(prompt, &payloads, system_prompt).await
}

/// 1チャンクを処理する
///
/// どの失敗経路（読み込み・通信・パース・リトライ枯渇）でも
/// エラーは伝播させず、チャンク内の全画像を失敗タプルに変換する。
pub async fn process_chunk(
    client: &dyn VisionApi,
    chunk: &[PathBuf],
    prompt: &str,
    system_prompt: Option<&str>,
) -> Vec<TagResult> {
    match dispatch_chunk(client, chunk, prompt, system_prompt).await {
        Ok(caption) => chunk
            .iter()
            .map(|path| TagResult::success(path.clone(), caption.clone()))
            .collect(),
        Err(err) => {
            let message = format!("API呼び出しに失敗しました: {}", err);
            chunk
                .iter()
                .map(|path| TagResult::failure(path.clone(), message.clone()))
                .collect()
        }
    }
}
