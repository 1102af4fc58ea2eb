//! Generative-text enrichment: prompt profiles and the chat-completions client.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::warn;

pub const CRATE_NAME: &str = "eotrack-enrich";

pub const ANALYSIS_PROMPT_FILE: &str = "full_analysis_prompt.txt";
pub const POSTS_PROMPT_FILE: &str = "x_posts_prompt.txt";

pub const ANALYSIS_ROLE: &str = "You are a highly specialized government policy analyst AI with expertise in analyzing U.S. executive orders and legislation.";
pub const POSTS_ROLE: &str = "You are a policy communications AI focused on creating neutral, factual, and engaging social media posts summarizing executive orders and legislation.";

pub const ANALYSIS_MAX_TOKENS: usize = 800;
pub const POSTS_MAX_TOKENS: usize = 300;

pub const DEFAULT_MODEL: &str = "gpt-4";
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

pub const API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Role, template, and output budget for one kind of generated text.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptProfile {
    pub name: &'static str,
    pub role: String,
    pub template: String,
    pub max_tokens: usize,
}

impl PromptProfile {
    pub fn analysis(template: impl Into<String>) -> Self {
        Self {
            name: "analysis",
            role: ANALYSIS_ROLE.to_string(),
            template: template.into(),
            max_tokens: ANALYSIS_MAX_TOKENS,
        }
    }

    pub fn posts(template: impl Into<String>) -> Self {
        Self {
            name: "posts",
            role: POSTS_ROLE.to_string(),
            template: template.into(),
            max_tokens: POSTS_MAX_TOKENS,
        }
    }

    /// User message: the template, a blank line, then the document text.
    pub fn render(&self, text: &str) -> String {
        format!("{}\n\n{}", self.template, text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptSet {
    pub analysis: PromptProfile,
    pub posts: PromptProfile,
}

impl PromptSet {
    /// Reads both templates from `dir`.
    pub async fn load(dir: &Path) -> anyhow::Result<Self> {
        let analysis = read_template(&dir.join(ANALYSIS_PROMPT_FILE)).await?;
        let posts = read_template(&dir.join(POSTS_PROMPT_FILE)).await?;
        Ok(Self {
            analysis: PromptProfile::analysis(analysis),
            posts: PromptProfile::posts(posts),
        })
    }
}

async fn read_template(path: &Path) -> anyhow::Result<String> {
    fs::read_to_string(path)
        .await
        .with_context(|| format!("reading prompt template {}", path.display()))
}

#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error("generation request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("generation api returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("generation api returned no content")]
    EmptyResponse,
}

/// Turns a document plus a prompt profile into generated text.
#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate(&self, text: &str, profile: &PromptProfile) -> Result<String, EnrichmentError>;
}

/// Client for generation calls, separate from the page-fetch client.
pub fn generation_client(timeout: Duration) -> anyhow::Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .context("building generation client")
}

#[derive(Debug, Clone)]
pub struct OpenAiGenerator {
    client: Client,
    api_url: String,
    api_key: String,
    model: String,
    temperature: f64,
}

impl OpenAiGenerator {
    pub fn new(client: Client, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            api_url: API_URL.to_string(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: DEFAULT_TEMPERATURE,
        }
    }

    /// Builds a generator when `OPENAI_API_KEY` is set; `None` disables enrichment.
    pub fn from_env(client: Client, model: impl Into<String>) -> Option<Self> {
        Self::from_key(client, std::env::var("OPENAI_API_KEY").ok(), model)
    }

    pub fn from_key(client: Client, api_key: Option<String>, model: impl Into<String>) -> Option<Self> {
        match api_key {
            Some(key) if !key.trim().is_empty() => Some(Self::new(client, key, model)),
            _ => {
                warn!("OPENAI_API_KEY not set, enrichment disabled");
                None
            }
        }
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    fn request_for(&self, text: &str, profile: &PromptProfile) -> Request {
        Request {
            model: self.model.clone(),
            max_tokens: profile.max_tokens,
            temperature: self.temperature,
            messages: vec![
                Message {
                    role: "system",
                    content: profile.role.clone(),
                },
                Message {
                    role: "user",
                    content: profile.render(text),
                },
            ],
        }
    }
}

#[derive(Debug, Serialize)]
struct Request {
    model: String,
    max_tokens: usize,
    temperature: f64,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct Response {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

fn first_choice_text(response: Response) -> Result<String, EnrichmentError> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|content| content.trim().to_string())
        .filter(|content| !content.is_empty())
        .ok_or(EnrichmentError::EmptyResponse)
}

#[async_trait]
impl Generator for OpenAiGenerator {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn generate(&self, text: &str, profile: &PromptProfile) -> Result<String, EnrichmentError> {
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&self.request_for(text, profile))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EnrichmentError::Status {
                status: status.as_u16(),
                body,
            });
        }

        first_choice_text(response.json::<Response>().await?)
    }
}
