//! パイプライン統合テスト
//!
//! モックのvision APIクライアントと実ファイルを使い、
//! チャンク分割からディスパッチ・集約までの動作を検証する

use async_trait::async_trait;
use image_tagger_rust::api::{ImagePayload, VisionApi};
use image_tagger_rust::error::{Result, TaggerError};
use image_tagger_rust::pipeline::{
    self, CancelFlag, ChunkerConfig, PipelineConfig, TagRequest,
};
use image_tagger_rust::scanner::Base64SizeEstimator;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

/// モッククライアント
///
/// 呼び出し回数を数え、fail_markerを含む画像が入ったチャンクは失敗させる
struct MockVision {
    calls: AtomicUsize,
    fail_marker: Option<Vec<u8>>,
}

impl MockVision {
    fn ok() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_marker: None,
        }
    }

    fn failing_on(marker: &[u8]) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_marker: Some(marker.to_vec()),
        }
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VisionApi for MockVision {
    async fn generate(
        &self,
        _prompt: &str,
        images: &[ImagePayload],
        _system_prompt: Option<&str>,
    ) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(marker) = &self.fail_marker {
            for image in images {
                if image
                    .bytes
                    .windows(marker.len())
                    .any(|window| window == marker.as_slice())
                {
                    return Err(TaggerError::ApiCall("疑似的な失敗".into()));
                }
            }
        }

        Ok(format!("caption-{}枚", images.len()))
    }
}

/// 内容を指定してダミー画像を作る
fn write_image(dir: &std::path::Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).expect("ファイル作成失敗");
    path
}

/// 1チャンクに収まるファイル数を制御するための設定
///
/// 100バイトのファイルは見積もり1157バイトになるので、
/// max_bytesの調整でチャンクあたりの枚数を決められる。
fn config_with_chunk_capacity(items_per_chunk: usize, concurrency: usize) -> PipelineConfig {
    let per_item = 1157u64;
    let base = 2048u64;
    PipelineConfig {
        chunker: ChunkerConfig {
            max_bytes: base + per_item * items_per_chunk as u64,
            per_item_overhead: 0,
            base_overhead: base,
        },
        concurrency,
    }
}

fn request() -> TagRequest {
    TagRequest {
        prompt: "キャプションを生成してください".to_string(),
        system_prompt: None,
    }
}

/// 全ファイルがちょうど1件ずつ結果に現れ、チャンク内のテキストは同一
#[tokio::test]
async fn test_every_file_has_exactly_one_result() {
    let dir = tempdir().expect("Failed to create temp dir");
    let files: Vec<PathBuf> = (0..6)
        .map(|i| write_image(dir.path(), &format!("img{}.jpg", i), &[b'x'; 100]))
        .collect();

    let client = Arc::new(MockVision::ok());
    let report = pipeline::run_pipeline(
        Arc::clone(&client) as Arc<dyn VisionApi>,
        &files,
        &request(),
        &Base64SizeEstimator,
        &config_with_chunk_capacity(2, 2),
        None,
        CancelFlag::new(),
    )
    .await;

    assert_eq!(report.results.len(), 6);
    assert_eq!(report.success_count(), 6);
    assert!(report.skipped.is_empty());
    // 2枚ずつ3チャンク = API呼び出し3回
    assert_eq!(client.call_count(), 3);

    // 各ファイルはちょうど1回ずつ
    for file in &files {
        let count = report.results.iter().filter(|r| &r.path == file).count();
        assert_eq!(count, 1, "{} の結果件数が1ではない", file.display());
    }
}

/// 複数画像のチャンクでは同一キャプションが全画像に複製される
#[tokio::test]
async fn test_caption_duplicated_across_chunk() {
    let dir = tempdir().expect("Failed to create temp dir");
    let files: Vec<PathBuf> = (0..3)
        .map(|i| write_image(dir.path(), &format!("img{}.jpg", i), &[b'x'; 100]))
        .collect();

    let client = Arc::new(MockVision::ok());
    let report = pipeline::run_pipeline(
        Arc::clone(&client) as Arc<dyn VisionApi>,
        &files,
        &request(),
        &Base64SizeEstimator,
        &config_with_chunk_capacity(10, 1),
        None,
        CancelFlag::new(),
    )
    .await;

    assert_eq!(client.call_count(), 1);
    assert_eq!(report.results.len(), 3);
    let first_text = &report.results[0].text;
    assert_eq!(first_text, "caption-3枚");
    for result in &report.results {
        assert!(result.success);
        assert_eq!(&result.text, first_text);
    }
}

/// 失敗したチャンクは失敗タプルになり、他のチャンクは影響を受けない
#[tokio::test]
async fn test_chunk_failure_is_isolated() {
    let dir = tempdir().expect("Failed to create temp dir");
    let ok1 = write_image(dir.path(), "a.jpg", &[b'a'; 100]);
    let bad = write_image(dir.path(), "b.jpg", b"BADBADBADBADBAD");
    let ok2 = write_image(dir.path(), "c.jpg", &[b'c'; 100]);
    let files = vec![ok1.clone(), bad.clone(), ok2.clone()];

    let client = Arc::new(MockVision::failing_on(b"BAD"));
    let report = pipeline::run_pipeline(
        Arc::clone(&client) as Arc<dyn VisionApi>,
        &files,
        &request(),
        &Base64SizeEstimator,
        &config_with_chunk_capacity(1, 3),
        None,
        CancelFlag::new(),
    )
    .await;

    assert_eq!(report.results.len(), 3);
    assert_eq!(report.success_count(), 2);
    assert_eq!(report.failure_count(), 1);

    let failed = report
        .results
        .iter()
        .find(|r| r.path == bad)
        .expect("失敗レコードが見つからない");
    assert!(!failed.success);
    assert!(failed.text.contains("失敗"));

    for path in [&ok1, &ok2] {
        let result = report
            .results
            .iter()
            .find(|r| &r.path == path)
            .expect("成功レコードが見つからない");
        assert!(result.success);
    }
}

/// 進捗はチャンク単位で単調に増え、最後に (total, total) に達する
#[tokio::test]
async fn test_progress_monotonic() {
    let dir = tempdir().expect("Failed to create temp dir");
    let files: Vec<PathBuf> = (0..8)
        .map(|i| write_image(dir.path(), &format!("img{}.jpg", i), &[b'x'; 100]))
        .collect();

    let observed: Arc<Mutex<Vec<(usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&observed);
    let progress: pipeline::ProgressFn = Arc::new(move |completed, total| {
        sink.lock().expect("lock失敗").push((completed, total));
    });

    let client = Arc::new(MockVision::ok());
    pipeline::run_pipeline(
        Arc::clone(&client) as Arc<dyn VisionApi>,
        &files,
        &request(),
        &Base64SizeEstimator,
        &config_with_chunk_capacity(2, 3),
        Some(progress),
        CancelFlag::new(),
    )
    .await;

    let observed = observed.lock().expect("lock失敗");
    // 2枚ずつ4チャンク
    assert_eq!(observed.len(), 4);
    let mut previous = 0usize;
    for (completed, total) in observed.iter() {
        assert_eq!(*total, 4);
        assert!(*completed > previous, "進捗が単調増加していない");
        previous = *completed;
    }
    assert_eq!(observed.last(), Some(&(4, 4)));
}

/// キャンセル済みフラグで開始すると全チャンクが失敗タプルになり、APIは呼ばれない
#[tokio::test]
async fn test_cancelled_before_start() {
    let dir = tempdir().expect("Failed to create temp dir");
    let files: Vec<PathBuf> = (0..4)
        .map(|i| write_image(dir.path(), &format!("img{}.jpg", i), &[b'x'; 100]))
        .collect();

    let cancel = CancelFlag::new();
    cancel.cancel();

    let client = Arc::new(MockVision::ok());
    let report = pipeline::run_pipeline(
        Arc::clone(&client) as Arc<dyn VisionApi>,
        &files,
        &request(),
        &Base64SizeEstimator,
        &config_with_chunk_capacity(2, 2),
        None,
        cancel,
    )
    .await;

    assert_eq!(client.call_count(), 0);
    assert_eq!(report.results.len(), 4);
    for result in &report.results {
        assert!(!result.success);
        assert!(result.text.contains("キャンセル"));
    }
}

/// 空の入力は空のレポートを返し、APIは呼ばれない
#[tokio::test]
async fn test_empty_input() {
    let client = Arc::new(MockVision::ok());
    let report = pipeline::run_pipeline(
        Arc::clone(&client) as Arc<dyn VisionApi>,
        &[],
        &request(),
        &Base64SizeEstimator,
        &PipelineConfig::default(),
        None,
        CancelFlag::new(),
    )
    .await;

    assert!(report.results.is_empty());
    assert!(report.skipped.is_empty());
    assert_eq!(client.call_count(), 0);
}

/// サイズ超過の画像は結果に現れず、スキップ一覧に理由つきで記録される
#[tokio::test]
async fn test_skipped_files_reported_not_silent() {
    let dir = tempdir().expect("Failed to create temp dir");
    let ok = write_image(dir.path(), "ok.jpg", &[b'x'; 100]);
    // 見積もり 5000*1.33+1024 = 7674 > max 4000 で単体超過になる
    let big = write_image(dir.path(), "big.jpg", &[b'x'; 5000]);
    let files = vec![ok.clone(), big.clone()];

    let config = PipelineConfig {
        chunker: ChunkerConfig {
            max_bytes: 4000,
            per_item_overhead: 0,
            base_overhead: 2048,
        },
        concurrency: 1,
    };

    let client = Arc::new(MockVision::ok());
    let report = pipeline::run_pipeline(
        Arc::clone(&client) as Arc<dyn VisionApi>,
        &files,
        &request(),
        &Base64SizeEstimator,
        &config,
        None,
        CancelFlag::new(),
    )
    .await;

    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].path, ok);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].path, big);
}
