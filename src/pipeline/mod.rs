//! バッチ処理パイプライン
//!
//! 入力画像列 → 動的チャンク分割 → 同時実行数制限付きディスパッチ →
//! 結果集約までを組み立てる。チャンク単位の失敗は失敗タプルに
//! 変換され、実行全体を止めない。

pub mod chunker;
pub mod dispatch;

pub use chunker::{ChunkPlan, Chunker, ChunkerConfig, SizeEstimator, SkipReason, SkippedImage};
pub use dispatch::{process_chunk, TagResult};

use crate::api::VisionApi;
use crate::concurrency::ConcurrencyLimiter;
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// パイプラインの設定
///
/// 共有のグローバル設定は持たず、実行ごとに値で渡す。
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub chunker: ChunkerConfig,
    pub concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunker: ChunkerConfig::default(),
            concurrency: 1,
        }
    }
}

/// 進捗コールバック（完了チャンク数, 総チャンク数）
pub type ProgressFn = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// 協調的キャンセルフラグ
///
/// チャンクのディスパッチ間で確認される。セット後は新しいチャンクを
/// 投入せず、実行中のAPI呼び出しは中断せずに完了を待つ。
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// キャプション生成リクエスト
#[derive(Debug, Clone)]
pub struct TagRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
}

/// パイプラインの実行結果
#[derive(Debug, Default)]
pub struct PipelineReport {
    /// スキップ分を除く全入力画像の結果（1画像につきちょうど1件）
    pub results: Vec<TagResult>,
    /// チャンク分割の段階で除外された画像
    pub skipped: Vec<SkippedImage>,
}

impl PipelineReport {
    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failure_count(&self) -> usize {
        self.results.iter().filter(|r| !r.success).count()
    }
}

fn cancelled_results(chunk: &[PathBuf]) -> Vec<TagResult> {
    chunk
        .iter()
        .map(|path| TagResult::failure(path.clone(), "処理がキャンセルされました".to_string()))
        .collect()
}

fn failure_results(chunk: &[PathBuf], message: &str) -> Vec<TagResult> {
    chunk
        .iter()
        .map(|path| {
            TagResult::failure(path.clone(), format!("チャンク処理に失敗しました: {}", message))
        })
        .collect()
}

/// パイプラインを実行する
///
/// 全チャンクのディスパッチタスクをConcurrencyLimiterの下で並行実行し、
/// 完了したチャンクごとに進捗コールバックを呼ぶ。結果の並びはチャンクの
/// 投入順だが、チャンク間の完了順序は保証しない。スキップ分を除く
/// 全入力画像がちょうど1件ずつ結果に現れる。
pub async fn run_pipeline(
    client: Arc<dyn VisionApi>,
    files: &[PathBuf],
    request: &TagRequest,
    estimator: &dyn SizeEstimator,
    config: &PipelineConfig,
    progress: Option<ProgressFn>,
    cancel: CancelFlag,
) -> PipelineReport {
    if files.is_empty() {
        return PipelineReport::default();
    }

    let plan = Chunker::new(config.chunker.clone()).plan(files, estimator);
    let total = plan.chunks.len();
    let limiter = Arc::new(ConcurrencyLimiter::new(config.concurrency));
    let completed = Arc::new(AtomicUsize::new(0));

    let tasks = plan.chunks.iter().map(|chunk| {
        let client = Arc::clone(&client);
        let limiter = Arc::clone(&limiter);
        let completed = Arc::clone(&completed);
        let progress = progress.clone();
        let cancel = cancel.clone();
        let chunk = chunk.clone();
        let prompt = request.prompt.clone();
        let system_prompt = request.system_prompt.clone();

        async move {
            let results = match limiter.acquire().await {
                Ok(_permit) => {
                    if cancel.is_cancelled() {
                        cancelled_results(&chunk)
                    } else {
                        process_chunk(client.as_ref(), &chunk, &prompt, system_prompt.as_deref())
                            .await
                    }
                }
                Err(err) => failure_results(&chunk, &err.to_string()),
            };

            let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(progress) = &progress {
                progress(done, total);
            }
            results
        }
    });

    let chunk_results = join_all(tasks).await;

    let mut report = PipelineReport {
        results: Vec::with_capacity(files.len()),
        skipped: plan.skipped,
    };
    for results in chunk_results {
        report.results.extend(results);
    }
    report
}
