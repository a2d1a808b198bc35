//! 並行処理ユーティリティ
//!
//! - retry_async: 指数バックオフ＋ジッター付きリトライ
//! - ConcurrencyLimiter: 同時実行数の上限制御（RAIIで確実に解放）

use crate::error::{Result, TaggerError};
use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// リトライ設定
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// 初回を除くリトライ回数の上限
    pub max_retries: u32,
    /// 初回リトライまでの基準遅延
    pub base_delay: Duration,
    /// バックオフ遅延の上限
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// ジッター適用前のバックオフ遅延を計算する
///
/// `min(base_delay * 2^attempt, max_delay)`。attemptは0始まり。
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponential = config.base_delay.as_secs_f64() * 2f64.powi(attempt.min(i32::MAX as u32) as i32);
    Duration::from_secs_f64(exponential.min(config.max_delay.as_secs_f64()))
}

/// [0.5, 1.0) の一様乱数を掛けて、同時リトライの集中を避ける
fn apply_jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

/// 非同期操作をリトライ付きで実行する
///
/// 最大 `max_retries + 1` 回試行し、全て失敗した場合は
/// 最後のエラーを包んだ `RetryExhausted` を返す。
/// 失敗の種類による分類は行わず、すべて再試行の対象とする。
pub async fn retry_async<T, F, Fut>(config: &RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= config.max_retries => {
                return Err(TaggerError::RetryExhausted {
                    attempts: attempt + 1,
                    source: Box::new(err),
                });
            }
            Err(err) => {
                let delay = apply_jitter(backoff_delay(config, attempt));
                eprintln!(
                    "⚠️ {}回目の試行に失敗、{:.2}秒後にリトライします: {}",
                    attempt + 1,
                    delay.as_secs_f64(),
                    err
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// 同時実行数の上限を制御するリミッタ
///
/// スロットはRAIIガード（ConcurrencyPermit）として貸し出され、
/// 成功・失敗どちらの経路でもDropで必ず解放される。
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
    active: Arc<AtomicUsize>,
}

impl ConcurrencyLimiter {
    /// 上限を指定して作成する。0は1に切り上げる
    pub fn new(max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// スロットが空くまで待ってから許可を取得する
    pub async fn acquire(&self) -> Result<ConcurrencyPermit> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| TaggerError::Concurrency("セマフォが閉じられています".into()))?;
        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(ConcurrencyPermit {
            _permit: permit,
            active: Arc::clone(&self.active),
        })
    }

    /// 現在実行中のタスク数
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }
}

/// 実行スロットのRAIIガード
pub struct ConcurrencyPermit {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}
