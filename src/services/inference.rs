use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::models::metadata::RawMetadata;
use crate::services::retry::HttpStatus;

const PROMPT: &str = concat!(
    "You are a stock photography metadata expert. Analyze this image and produce ",
    "metadata for a stock marketplace listing.\n",
    "Return ONLY a JSON object (optionally inside a ```json code block) with exactly these fields:\n",
    "- \"title\": a descriptive, natural-language title of at most 200 characters, no trailing period\n",
    "- \"keywords\": an array of 25 to 49 single- or two-word keywords, most important first\n",
    "- \"category\": the number (1-21) of the best matching category: ",
    "1 Animals, 2 Buildings and Architecture, 3 Business, 4 Drinks, 5 The Environment, ",
    "6 States of Mind, 7 Food, 8 Graphic Resources, 9 Hobbies and Leisure, 10 Industry, ",
    "11 Landscapes, 12 Lifestyle, 13 People, 14 Plants and Flowers, 15 Culture and Religion, ",
    "16 Science, 17 Social Issues, 18 Sports, 19 Technology, 20 Transport, 21 Travel.\n",
    "Do not mention brand names, trademarks, or people's names."
);

/// Produces raw metadata for an image reachable at a public URL.
#[async_trait]
pub trait MetadataGenerator: Send + Sync {
    async fn generate_metadata(&self, image_url: &str) -> Result<RawMetadata, InferenceError>;
}

/// Client for an OpenAI-compatible chat-completions vision endpoint.
pub struct VisionClient {
    http: Client,
    endpoint: String,
    api_token: String,
    model: String,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

impl VisionClient {
    pub fn new(endpoint: &str, api_token: &str, model: &str) -> Result<Self, InferenceError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| InferenceError::Request {
                image_url: String::new(),
                model: model.to_string(),
                status: None,
                message: "failed to build HTTP client".to_string(),
                source: Some(e),
            })?;

        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
            api_token: api_token.to_string(),
            model: model.to_string(),
            max_tokens: 1024,
        })
    }

    fn request_error(&self, image_url: &str, status: Option<u16>, message: String, source: Option<reqwest::Error>) -> InferenceError {
        InferenceError::Request {
            image_url: image_url.to_string(),
            model: self.model.clone(),
            status,
            message,
            source,
        }
    }
}

#[async_trait]
impl MetadataGenerator for VisionClient {
    async fn generate_metadata(&self, image_url: &str) -> Result<RawMetadata, InferenceError> {
        let request_body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": PROMPT },
                    { "type": "image_url", "image_url": { "url": image_url } }
                ]
            }]
        });

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_token)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| {
                let status = e.status().map(|s| s.as_u16());
                self.request_error(image_url, status, e.to_string(), Some(e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(300).collect();
            return Err(self.request_error(
                image_url,
                Some(status.as_u16()),
                format!("HTTP {}: {}", status.as_u16(), snippet),
                None,
            ));
        }

        let chat: ChatResponse = response.json().await.map_err(|e| InferenceError::InvalidResponse {
            model: self.model.clone(),
            reason: format!("response body is not a chat completion: {e}"),
        })?;

        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| InferenceError::InvalidResponse {
                model: self.model.clone(),
                reason: "response contained no message content".to_string(),
            })?;

        tracing::debug!(model = %self.model, image_url, reply_len = content.len(), "Vision model replied");

        parse_reply(&content).map_err(|reason| InferenceError::InvalidResponse {
            model: self.model.clone(),
            reason,
        })
    }
}

/// Extract the body of the first fenced code block, if any.
fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after_fence = &text[start + 3..];
    // Skip an info string such as `json` up to the end of the line.
    let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_fence[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

/// Parse the model's free-form reply into raw metadata. A fenced JSON block
/// wins; otherwise the whole reply must be JSON.
pub fn parse_reply(text: &str) -> Result<RawMetadata, String> {
    let candidate = fenced_block(text).unwrap_or_else(|| text.trim());
    serde_json::from_str::<RawMetadata>(candidate)
        .map_err(|e| format!("could not parse metadata JSON: {e}"))
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Vision model {model} request for {image_url} failed: {message}")]
    Request {
        image_url: String,
        model: String,
        status: Option<u16>,
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    #[error("Invalid response from vision model {model}: {reason}")]
    InvalidResponse { model: String, reason: String },
}

impl HttpStatus for InferenceError {
    fn http_status(&self) -> Option<u16> {
        match self {
            InferenceError::Request { status, .. } => *status,
            InferenceError::InvalidResponse { .. } => None,
        }
    }
}
