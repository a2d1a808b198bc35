//! Vision APIクライアント
//!
//! OpenAI互換のchat/completionsエンドポイントに画像つきメッセージを
//! 投げ、生成テキストを取り出す。通信とレスポンス抽出をひとまとめに
//! リトライするため、壊れたレスポンスも通信エラーと同様に再試行される。

use crate::concurrency::{retry_async, RetryConfig};
use crate::config::Config;
use crate::error::{Result, TaggerError};
use async_trait::async_trait;
use base64::Engine as _;
use serde_json::{json, Value};
use std::time::Duration;

/// API 1回分に載せる画像データ
#[derive(Debug, Clone)]
pub struct ImagePayload {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl ImagePayload {
    /// data URL形式（`data:<mime>;base64,...`）へ変換する
    pub fn to_data_url(&self) -> String {
        let encoded = base64::engine::general_purpose::STANDARD.encode(&self.bytes);
        format!("data:{};base64,{}", self.mime_type, encoded)
    }
}

/// vision APIの呼び出し口
///
/// プロンプトと画像列を渡してキャプションを1つ受け取る。
/// テストではこのトレイトを差し替える。
#[async_trait]
pub trait VisionApi: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        images: &[ImagePayload],
        system_prompt: Option<&str>,
    ) -> Result<String>;
}

/// HTTP経由のvision APIクライアント
pub struct VisionClient {
    http: reqwest::Client,
    api_key: String,
    group_id: Option<String>,
    base_url: String,
    model: String,
    max_tokens: Option<u32>,
    retry: RetryConfig,
}

impl VisionClient {
    pub fn new(config: &Config) -> Result<Self> {
        let api_key = config.api_key.clone().ok_or(TaggerError::MissingApiKey)?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            http,
            api_key,
            group_id: config.group_id.clone(),
            base_url: config.api_base_url.clone(),
            model: config.model.clone(),
            // OpenRouter経由では出力長を抑えて課金を抑制する
            max_tokens: if config.is_openrouter() { Some(500) } else { None },
            retry: config.retry_config(),
        })
    }

    fn build_request_body(
        &self,
        prompt: &str,
        images: &[ImagePayload],
        system_prompt: Option<&str>,
    ) -> Value {
        let mut messages = Vec::new();

        if let Some(system) = system_prompt {
            messages.push(json!({
                "role": "system",
                "content": system,
            }));
        }

        let mut content = vec![json!({ "type": "text", "text": prompt })];
        for image in images {
            content.push(json!({
                "type": "image_url",
                "image_url": { "url": image.to_data_url() },
            }));
        }
        messages.push(json!({
            "role": "user",
            "content": content,
        }));

        let mut body = json!({
            "model": self.model,
            "temperature": 0.2,
            "messages": messages,
        });
        if let Some(max_tokens) = self.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }

    /// 1回ぶんのリクエスト送信＋キャプション抽出
    async fn post_once(&self, body: &Value) -> Result<String> {
        let mut request = self
            .http
            .post(&self.base_url)
            .bearer_auth(&self.api_key)
            .json(body);
        if let Some(group_id) = &self.group_id {
            request = request.header("X-Group-ID", group_id);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TaggerError::ApiCall(format!("リクエスト送信に失敗: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(TaggerError::ApiCall("APIレート制限に達しました (429)".into()));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let preview: String = text.chars().take(200).collect();
            return Err(TaggerError::ApiCall(format!(
                "APIがステータス{}を返しました: {}",
                status.as_u16(),
                preview
            )));
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| TaggerError::ApiParse(format!("レスポンスのJSON解析に失敗: {}", e)))?;
        extract_caption(&value)
    }
}

#[async_trait]
impl VisionApi for VisionClient {
    async fn generate(
        &self,
        prompt: &str,
        images: &[ImagePayload],
        system_prompt: Option<&str>,
    ) -> Result<String> {
        if images.is_empty() {
            return Err(TaggerError::ApiCall("画像が指定されていません".into()));
        }

        let body = self.build_request_body(prompt, images, system_prompt);
        retry_async(&self.retry, || self.post_once(&body)).await
    }
}

/// APIレスポンスから生成テキストを取り出す
pub fn extract_caption(response: &Value) -> Result<String> {
    // エラーレスポンスの検出
    if let Some(error) = response.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(TaggerError::ApiCall(format!(
            "APIがエラーを返しました: {}",
            message
        )));
    }

    if let Some(content) = response
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
    {
        return Ok(content.trim().to_string());
    }

    // 旧形式のフォールバック
    if let Some(reply) = response.get("reply").and_then(Value::as_str) {
        return Ok(reply.trim().to_string());
    }

    let keys: Vec<&str> = response
        .as_object()
        .map(|obj| obj.keys().map(String::as_str).collect())
        .unwrap_or_default();
    Err(TaggerError::ApiParse(format!(
        "キャプションを抽出できません（トップレベルキー: {:?}）",
        keys
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_caption_choices_format() {
        let response = json!({
            "choices": [
                { "message": { "role": "assistant", "content": "  a cat on a sofa  " } }
            ]
        });
        assert_eq!(extract_caption(&response).unwrap(), "a cat on a sofa");
    }

    #[test]
    fn test_extract_caption_reply_fallback() {
        let response = json!({ "reply": "古い形式の応答" });
        assert_eq!(extract_caption(&response).unwrap(), "古い形式の応答");
    }

    #[test]
    fn test_extract_caption_error_object() {
        let response = json!({
            "error": { "message": "invalid api key", "code": 401 }
        });
        let err = extract_caption(&response).unwrap_err();
        assert!(matches!(err, TaggerError::ApiCall(_)));
        assert!(err.to_string().contains("invalid api key"));
    }

    #[test]
    fn test_extract_caption_malformed() {
        let response = json!({ "unexpected": true });
        let err = extract_caption(&response).unwrap_err();
        assert!(matches!(err, TaggerError::ApiParse(_)));
    }

    #[test]
    fn test_extract_caption_empty_choices() {
        let response = json!({ "choices": [] });
        assert!(extract_caption(&response).is_err());
    }

    #[test]
    fn test_data_url() {
        let payload = ImagePayload {
            mime_type: "image/png".to_string(),
            bytes: vec![0x89, 0x50, 0x4e, 0x47],
        };
        assert_eq!(payload.to_data_url(), "data:image/png;base64,iVBORw==");
    }

    #[test]
    fn test_build_request_body() {
        let client = VisionClient {
            http: reqwest::Client::new(),
            api_key: "test-key".to_string(),
            group_id: None,
            base_url: "https://example.com/v1/chat/completions".to_string(),
            model: "test-model".to_string(),
            max_tokens: Some(500),
            retry: RetryConfig::default(),
        };
        let images = vec![ImagePayload {
            mime_type: "image/jpeg".to_string(),
            bytes: vec![1, 2, 3],
        }];

        let body = client.build_request_body("describe", &images, Some("system"));

        assert_eq!(body["model"], "test-model");
        assert_eq!(body["max_tokens"], 500);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["messages"][1]["content"][0]["type"], "text");
        assert_eq!(body["messages"][1]["content"][1]["type"], "image_url");
        let url = body["messages"][1]["content"][1]["image_url"]["url"]
            .as_str()
            .unwrap();
        assert!(url.starts_with("data:image/jpeg;base64,"));
    }

    #[test]
    fn test_build_request_body_without_system() {
        let client = VisionClient {
            http: reqwest::Client::new(),
            api_key: "test-key".to_string(),
            group_id: None,
            base_url: "https://example.com".to_string(),
            model: "m".to_string(),
            max_tokens: None,
            retry: RetryConfig::default(),
        };
        let body = client.build_request_body("p", &[], None);

        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");
        assert!(body.get("max_tokens").is_none());
    }
}
