//! 動的チャンク分割
//!
//! ファイルサイズの見積もりをもとに、1回のAPI呼び出しに載せる
//! 画像群をペイロード上限以下に収める。入力順を保った貪欲な
//! 一回走査で、チャンク数の最小化（再詰め込み）は行わない。

use crate::error::Result;
use std::fmt;
use std::path::{Path, PathBuf};

/// エンコード後サイズの見積もりと有効性チェックを提供する
pub trait SizeEstimator: Send + Sync {
    /// エンコード後のペイロードサイズ（バイト）を見積もる
    fn estimate_encoded_size(&self, path: &Path) -> Result<u64>;

    /// 対応形式の有効な画像ファイルかどうか
    fn is_valid(&self, path: &Path) -> bool;
}

/// チャンク分割の設定
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// 1チャンクの合計ペイロード上限（バイト）
    pub max_bytes: u64,
    /// 画像1枚あたりに上乗せするオーバーヘッド
    pub per_item_overhead: u64,
    /// リクエストJSON構造そのもののオーバーヘッド
    pub base_overhead: u64,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_bytes: 15 * 1024 * 1024,
            per_item_overhead: 0,
            base_overhead: 2048,
        }
    }
}

/// チャンクに入らなかった画像のスキップ理由
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// 単体でペイロード上限を超えるため、どのチャンクにも入らない
    TooLarge { estimated: u64 },
    /// サイズの見積もりに失敗した（IOエラー等）
    Unreadable(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::TooLarge { estimated } => {
                write!(f, "サイズ超過（約{}バイト）", estimated)
            }
            SkipReason::Unreadable(message) => write!(f, "サイズ取得失敗: {}", message),
        }
    }
}

/// スキップされた画像の記録
#[derive(Debug, Clone)]
pub struct SkippedImage {
    pub path: PathBuf,
    pub reason: SkipReason,
}

/// 分割結果：チャンク一覧とスキップ一覧
///
/// スキップされたファイルは黙って消えるのではなく、
/// 理由つきで呼び出し元へ返される。
#[derive(Debug, Default)]
pub struct ChunkPlan {
    pub chunks: Vec<Vec<PathBuf>>,
    pub skipped: Vec<SkippedImage>,
}

/// サイズ上限付きのチャンク分割器
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    /// チャンクを遅延的に生成するイテレータを返す
    pub fn stream<'a, E>(&'a self, files: &'a [PathBuf], estimator: &'a E) -> ChunkStream<'a, E>
    where
        E: SizeEstimator + ?Sized,
    {
        ChunkStream {
            config: &self.config,
            estimator,
            files,
            index: 0,
            current: Vec::new(),
            current_size: self.config.base_overhead,
            skipped: Vec::new(),
            done: false,
        }
    }

    /// 全チャンクとスキップ一覧をまとめて返す
    pub fn plan<E>(&self, files: &[PathBuf], estimator: &E) -> ChunkPlan
    where
        E: SizeEstimator + ?Sized,
    {
        let mut stream = self.stream(files, estimator);
        let mut chunks = Vec::new();
        for chunk in &mut stream {
            chunks.push(chunk);
        }
        ChunkPlan {
            chunks,
            skipped: stream.into_skipped(),
        }
    }
}

/// チャンクの遅延イテレータ
///
/// next()が呼ばれたぶんだけファイルのサイズを見積もる。
pub struct ChunkStream<'a, E: ?Sized> {
    config: &'a ChunkerConfig,
    estimator: &'a E,
    files: &'a [PathBuf],
    index: usize,
    current: Vec<PathBuf>,
    current_size: u64,
    skipped: Vec<SkippedImage>,
    done: bool,
}

impl<'a, E: ?Sized> ChunkStream<'a, E> {
    /// ここまでに記録されたスキップ一覧
    pub fn skipped(&self) -> &[SkippedImage] {
        &self.skipped
    }

    pub fn into_skipped(self) -> Vec<SkippedImage> {
        self.skipped
    }
}

impl<'a, E> Iterator for ChunkStream<'a, E>
where
    E: SizeEstimator + ?Sized,
{
    type Item = Vec<PathBuf>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        while self.index < self.files.len() {
            let path = &self.files[self.index];
            self.index += 1;

            let estimated = match self.estimator.estimate_encoded_size(path) {
                Ok(size) => size + self.config.per_item_overhead,
                Err(err) => {
                    eprintln!(
                        "⚠️ サイズ見積もりに失敗したためスキップします: {} ({})",
                        path.display(),
                        err
                    );
                    self.skipped.push(SkippedImage {
                        path: path.clone(),
                        reason: SkipReason::Unreadable(err.to_string()),
                    });
                    continue;
                }
            };

            // 単体で上限を超える画像はどのチャンクにも入らない
            if estimated + self.config.base_overhead > self.config.max_bytes {
                eprintln!(
                    "⚠️ 画像が大きすぎるためスキップします: {} (約{}バイト)",
                    path.display(),
                    estimated
                );
                self.skipped.push(SkippedImage {
                    path: path.clone(),
                    reason: SkipReason::TooLarge { estimated },
                });
                continue;
            }

            // 追加すると上限を超える場合は現在のチャンクを確定し、
            // この画像から新しいチャンクを始める
            if !self.current.is_empty() && self.current_size + estimated > self.config.max_bytes {
                let chunk = std::mem::take(&mut self.current);
                self.current.push(path.clone());
                self.current_size = self.config.base_overhead + estimated;
                return Some(chunk);
            }

            self.current.push(path.clone());
            self.current_size += estimated;
        }

        self.done = true;
        if self.current.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.current))
        }
    }
}
