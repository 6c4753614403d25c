use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::Model;

const REQUEST_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    n: usize,
    #[serde(flatten)]
    params: SamplingParams,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiModel {
    client: reqwest::Client,
    model: String,
    base_url: String,
    api_key: String,
    params: SamplingParams,
}

impl OpenAiModel {
    pub fn new(model: &str, base_url: &str, api_key: String, params: SamplingParams) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("Failed to build HTTP client for the model provider")?;
        Ok(Self {
            client,
            model: model.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            params,
        })
    }

    fn request<'a>(&'a self, prompt: &'a str, n: usize) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            n,
            params: self.params,
        }
    }
}

fn parse_completions(response: ChatResponse) -> Vec<String> {
    response
        .choices
        .into_iter()
        .map(|choice| choice.message.content.unwrap_or_default())
        .collect()
}

#[async_trait]
impl Model for OpenAiModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, n: usize) -> Result<Vec<String>> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(url = %url, model = %self.model, n, "Sending chat completion request");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request(prompt, n))
            .send()
            .await
            .context("Failed to send request to the model provider")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "Model provider returned HTTP {}: {}",
                status.as_u16(),
                body.chars().take(500).collect::<String>()
            );
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .context("Failed to parse chat completion response")?;
        Ok(parse_completions(parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params() -> SamplingParams {
        SamplingParams {
            temperature: 0.2,
            top_p: 0.95,
            max_tokens: 512,
        }
    }

    #[test]
    fn test_request_body() {
        let model = OpenAiModel::new("gpt-4o-mini", "https://api.openai.com/v1/", "sk".into(), params())
            .unwrap();
        assert_eq!(model.base_url, "https://api.openai.com/v1");

        let body = serde_json::to_value(model.request("Hello", 3)).unwrap();
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["n"], 3);
        assert_eq!(body["max_tokens"], 512);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "Hello");
        assert!(body.get("params").is_none());
    }

    #[test]
    fn test_parse_completions() {
        let response: ChatResponse = serde_json::from_value(json!({
            "id": "chatcmpl-1",
            "choices": [
                {"index": 0, "message": {"role": "assistant", "content": "a"}},
                {"index": 1, "message": {"role": "assistant", "content": null}}
            ]
        }))
        .unwrap();
        assert_eq!(parse_completions(response), vec!["a", ""]);
    }
}
