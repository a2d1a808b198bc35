//! 画像キャプション一括生成ツールのコアライブラリ
//!
//! リモートのvision APIに対して画像をサイズ上限付きのチャンクに
//! まとめ、同時実行数制限とリトライ付きでディスパッチし、結果を
//! manifestの承認ワークフローへ反映する。

pub mod api;
pub mod cli;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod manifest;
pub mod pipeline;
pub mod scanner;
