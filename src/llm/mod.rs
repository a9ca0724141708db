//! Optional query translation via an OpenAI-compatible LLM.
//!
//! Raw search queries ("fotky psa na pláži") embed poorly; a small chat
//! model rewrites them into the kind of short English sentence the CLIP
//! text encoder was trained on. Strictly optional: without a configured
//! endpoint the raw query is embedded as-is.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;

/// Maps a raw user query to a CLIP-friendly English sentence.
pub trait QueryTranslator: Send + Sync {
    fn translate(&self, query: &str) -> Result<String>;
}

#[derive(Clone)]
pub struct ChatTranslator {
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

impl ChatTranslator {
    /// Build a translator when an endpoint is configured.
    pub fn from_config(config: &LlmConfig) -> Option<Self> {
        config.endpoint.as_ref().map(|endpoint| Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

impl QueryTranslator for ChatTranslator {
    fn translate(&self, query: &str) -> Result<String> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![Message {
                role: "user".to_string(),
                content: format!(
                    "Rewrite the following photo search query as one short \
                     English sentence describing the image content, suitable \
                     for a CLIP text encoder. Return only the sentence.\n\n\
                     Query: {}",
                    query
                ),
            }],
            max_tokens: 100,
            temperature: 0.2,
        };

        let url = format!("{}/chat/completions", self.endpoint);
        let mut builder = ureq::post(&url).set("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            builder = builder.set("Authorization", &format!("Bearer {}", key));
        }

        let response = builder
            .send_json(&request)
            .map_err(|e| anyhow!("LLM request failed: {}", e))?;

        let chat_response: ChatResponse = response
            .into_json()
            .map_err(|e| anyhow!("Failed to parse LLM response: {}", e))?;

        let sentence = chat_response
            .choices
            .first()
            .map(|c| c.message.content.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("No response from LLM"))?;

        Ok(sentence)
    }
}
