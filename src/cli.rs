use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "image-tagger")]
#[command(about = "画像キャプション一括生成・タグ付けツール", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 詳細ログを出力
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 画像フォルダまたはmanifest CSVを一括処理してキャプションを生成
    Run {
        /// 入力パス：manifest CSVファイルまたは画像フォルダ
        #[arg(required = true)]
        input: PathBuf,

        /// 生成プロンプトのテンプレート
        #[arg(short, long)]
        prompt: String,

        /// システムプロンプト（省略時は設定値を使用）
        #[arg(long)]
        system_prompt: Option<String>,

        /// 並行実行するチャンク数
        #[arg(short, long, default_value = "1")]
        concurrency: usize,

        /// 失敗時のリトライ回数上限
        #[arg(short, long, default_value = "3")]
        retry: u32,

        /// 1チャンクの最大ペイロードサイズ（バイト）
        #[arg(long)]
        max_batch_bytes: Option<u64>,

        /// manifestを作り直す
        #[arg(long)]
        force_recreate: bool,
    },

    /// 生成済みキャプションを対話的に承認/却下する
    Review {
        /// manifest CSVファイル
        #[arg(required = true)]
        manifest: PathBuf,
    },

    /// 指定レコードを再生成する（retry_cntを加算して再実行）
    Regenerate {
        /// manifest CSVファイル
        #[arg(required = true)]
        manifest: PathBuf,

        /// 対象画像の相対パス
        #[arg(required = true)]
        filepath: String,

        /// 生成プロンプトのテンプレート
        #[arg(short, long)]
        prompt: String,
    },

    /// 承認済みキャプションを.txtファイルとして書き出す
    Export {
        /// manifest CSVファイル
        #[arg(required = true)]
        manifest: PathBuf,

        /// 出力先フォルダ（省略時は画像と同じ場所）
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// フォルダから画像を取り込みmanifestを作成/更新する
    Import {
        /// 画像フォルダ
        #[arg(required = true)]
        folder: PathBuf,

        /// manifestの出力先（デフォルト: フォルダ内のmanifest.csv）
        #[arg(short, long)]
        manifest: Option<PathBuf>,
    },

    /// API設定を検証する（テスト画像で1回呼び出す）
    Check,

    /// 設定を表示/編集
    Config {
        /// APIキーを設定
        #[arg(long)]
        set_api_key: Option<String>,

        /// APIのベースURLを設定
        #[arg(long)]
        set_base_url: Option<String>,

        /// モデル名を設定
        #[arg(long)]
        set_model: Option<String>,

        /// 設定を表示
        #[arg(long)]
        show: bool,
    },
}
