use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaggerError {
    #[error("設定エラー: {0}")]
    Config(String),

    #[error("APIキーが設定されていません。`image-tagger config --set-api-key YOUR_KEY` か環境変数 MINIMAX_API_KEY で設定してください")]
    MissingApiKey,

    #[error("ファイルが見つかりません: {0}")]
    FileNotFound(String),

    #[error("フォルダが見つかりません: {0}")]
    FolderNotFound(String),

    #[error("画像読み込みエラー: {0}")]
    ImageLoad(String),

    #[error("API呼び出しエラー: {0}")]
    ApiCall(String),

    #[error("APIレスポンスのパースに失敗: {0}")]
    ApiParse(String),

    #[error("{attempts}回の試行がすべて失敗しました: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<TaggerError>,
    },

    #[error("並行処理エラー: {0}")]
    Concurrency(String),

    #[error("不正な状態遷移です: {filepath} ({from} → {to})")]
    InvalidStatusTransition {
        filepath: String,
        from: String,
        to: String,
    },

    #[error("レコードが見つかりません: {0}")]
    RecordNotFound(String),

    #[error("不正なステータス値です: {0}")]
    InvalidStatus(String),

    #[error("manifest読み書きエラー: {0}")]
    Manifest(#[from] csv::Error),

    #[error("JSON解析エラー: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("HTTP通信エラー: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IOエラー: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TaggerError>;
