use crate::concurrency::RetryConfig;
use crate::error::{Result, TaggerError};
use crate::pipeline::{ChunkerConfig, PipelineConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const MINIMAX_BASE_URL: &str = "https://api.minimax.chat/v1/chat/completions";
const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// 永続化される設定
///
/// ここで読み込んだ値は `retry_config()` / `pipeline_config()` で
/// 不変の設定値に変換してから各コンポーネントへ渡す。
/// 各コンポーネントがプロセス全体の共有状態を読むことはない。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_key: Option<String>,
    pub group_id: Option<String>,
    pub api_base_url: String,
    pub model: String,
    pub system_prompt: String,
    pub concurrency: usize,
    pub retry_max: u32,
    pub retry_delay_secs: f64,
    pub retry_max_delay_secs: f64,
    pub max_batch_size_bytes: u64,
    pub timeout_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            group_id: None,
            api_base_url: MINIMAX_BASE_URL.into(),
            model: "MiniMax-VL-01".into(),
            system_prompt: "あなたはプロの画像アナリストです。画像を注意深く観察し、正確な英語キャプションを生成してください。".into(),
            concurrency: 1,
            retry_max: 3,
            retry_delay_secs: 1.0,
            retry_max_delay_secs: 60.0,
            max_batch_size_bytes: 15 * 1024 * 1024,
            timeout_seconds: 60,
        }
    }
}

impl Config {
    /// 設定ファイルと環境変数から読み込む（環境変数が優先）
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            serde_json::from_str(&content)?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| TaggerError::Config("ホームディレクトリが見つかりません".into()))?;
        Ok(home.join(".config").join("image-tagger").join("config.json"))
    }

    fn apply_env_overrides(&mut self) {
        // OpenRouterキーがあればそちらを優先する
        if let Ok(key) = std::env::var("OPENROUTER_API_KEY") {
            if !key.is_empty() {
                self.api_key = Some(key);
                self.api_base_url = OPENROUTER_BASE_URL.into();
                self.model = std::env::var("OPENROUTER_MODEL_NAME")
                    .unwrap_or_else(|_| "minimax/minimax-01".into());
            }
        } else {
            if let Ok(key) = std::env::var("MINIMAX_API_KEY") {
                if !key.is_empty() {
                    self.api_key = Some(key);
                }
            }
            if let Ok(url) = std::env::var("MINIMAX_API_BASE_URL") {
                if !url.is_empty() {
                    self.api_base_url = url;
                }
            }
            if let Ok(model) = std::env::var("MINIMAX_MODEL_NAME") {
                if !model.is_empty() {
                    self.model = model;
                }
            }
        }

        if let Ok(group_id) = std::env::var("MINIMAX_GROUP_ID") {
            if !group_id.is_empty() {
                self.group_id = Some(group_id);
            }
        }
        if let Ok(prompt) = std::env::var("SYSTEM_PROMPT") {
            if !prompt.is_empty() {
                self.system_prompt = prompt;
            }
        }
    }

    /// ディスパッチ開始前の致命的な設定エラーはここで検出する
    pub fn validate(&self) -> Result<()> {
        if self.api_key.as_deref().map_or(true, str::is_empty) {
            return Err(TaggerError::MissingApiKey);
        }
        if self.concurrency == 0 {
            return Err(TaggerError::Config("並行数は1以上を指定してください".into()));
        }
        if self.retry_delay_secs <= 0.0 {
            return Err(TaggerError::Config(
                "リトライ遅延は正の値を指定してください".into(),
            ));
        }
        if !self.is_openrouter() && self.group_id.is_none() {
            eprintln!("⚠️ MINIMAX_GROUP_IDが未設定です。一部の機能が制限される場合があります");
        }
        Ok(())
    }

    pub fn is_openrouter(&self) -> bool {
        self.api_base_url.to_lowercase().contains("openrouter")
    }

    pub fn set_api_key(&mut self, key: String) -> Result<()> {
        self.api_key = Some(key);
        self.save()
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.retry_max,
            base_delay: Duration::from_secs_f64(self.retry_delay_secs),
            max_delay: Duration::from_secs_f64(self.retry_max_delay_secs),
        }
    }

    pub fn chunker_config(&self) -> ChunkerConfig {
        ChunkerConfig {
            max_bytes: self.max_batch_size_bytes,
            ..ChunkerConfig::default()
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            chunker: self.chunker_config(),
            concurrency: self.concurrency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.retry_max, 3);
        assert_eq!(config.max_batch_size_bytes, 15 * 1024 * 1024);
        assert!(config.api_key.is_none());
        assert!(!config.is_openrouter());
    }

    #[test]
    fn test_serde_round_trip() {
        let mut config = Config::default();
        config.api_key = Some("test-key".into());
        config.concurrency = 3;

        let json = serde_json::to_string(&config).unwrap();
        let loaded: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.api_key.as_deref(), Some("test-key"));
        assert_eq!(loaded.concurrency, 3);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let loaded: Config = serde_json::from_str(r#"{"concurrency": 5}"#).unwrap();
        assert_eq!(loaded.concurrency, 5);
        assert_eq!(loaded.retry_max, 3);
        assert_eq!(loaded.api_base_url, MINIMAX_BASE_URL);
    }

    #[test]
    fn test_validate_requires_api_key() {
        let config = Config::default();
        assert!(matches!(
            config.validate(),
            Err(TaggerError::MissingApiKey)
        ));
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.api_key = Some("key".into());
        config.group_id = Some("group".into());
        config.concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_component_configs() {
        let mut config = Config::default();
        config.retry_max = 5;
        config.retry_delay_secs = 0.5;
        config.max_batch_size_bytes = 1024;
        config.concurrency = 4;

        let retry = config.retry_config();
        assert_eq!(retry.max_retries, 5);
        assert_eq!(retry.base_delay, Duration::from_millis(500));

        let pipeline = config.pipeline_config();
        assert_eq!(pipeline.concurrency, 4);
        assert_eq!(pipeline.chunker.max_bytes, 1024);
        assert_eq!(pipeline.chunker.base_overhead, 2048);
    }
}
