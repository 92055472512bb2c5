use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Profile;
use crate::models::Listing;

/// Template input for one cover letter: the listing plus the applicant
/// profile, with an optional per-user prompt override.
pub struct LetterParams<'a> {
    pub listing: &'a Listing,
    pub profile: &'a Profile,
    pub prompt_override: Option<&'a str>,
}

/// Cover-letter text generation. Implementations may fail or time out;
/// the pipeline falls back to `fallback_letter` and never blocks on this.
#[async_trait]
pub trait LetterGenerator: Send + Sync {
    async fn generate(&self, params: &LetterParams<'_>) -> Result<String>;
}

// --- OpenAI provider ---

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

const SYSTEM_PROMPT: &str = "You are a professional HR consultant who writes \
effective, concise cover letters tailored to a specific job posting.";

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

pub struct OpenAiLetterGenerator {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiLetterGenerator {
    pub fn new(api_key: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            api_key,
            model: "gpt-4o-mini".to_string(),
            client,
        })
    }
}

#[async_trait]
impl LetterGenerator for OpenAiLetterGenerator {
    async fn generate(&self, params: &LetterParams<'_>) -> Result<String> {
        let request = ChatRequest {
            model: self.model.clone(),
            max_tokens: 500,
            temperature: 0.7,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: build_prompt(params),
                },
            ],
        };

        let response = self
            .client
            .post(OPENAI_API_URL)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .context("Failed to send request to OpenAI API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "OpenAI API request failed with status {}: {}",
                status,
                error_text
            ));
        }

        let api_response: ChatResponse = response
            .json()
            .await
            .context("Failed to parse OpenAI API response")?;

        let letter = api_response
            .choices
            .first()
            .map(|choice| choice.message.content.trim().to_string())
            .ok_or_else(|| anyhow!("No choices in OpenAI API response"))?;
        if letter.is_empty() {
            return Err(anyhow!("Empty cover letter from OpenAI API"));
        }
        Ok(letter)
    }
}

fn build_prompt(params: &LetterParams<'_>) -> String {
    if let Some(custom) = params.prompt_override {
        return format!(
            "{}\n\nJob title: {}\nCompany: {}\nJob description:\n{}",
            custom,
            params.listing.title,
            params.listing.company,
            params.listing.description.as_deref().unwrap_or("(none)"),
        );
    }

    format!(
        "Write a short cover letter (under 200 words) for the job below.\n\
         Be specific about why the applicant fits; no generic filler.\n\n\
         Job title: {}\n\
         Company: {}\n\
         Job description:\n{}\n\n\
         Applicant: {} ({})\n\
         Summary: {}\n\
         Key skills: {}",
        params.listing.title,
        params.listing.company,
        params.listing.description.as_deref().unwrap_or("(none)"),
        params.profile.name,
        params.profile.position,
        params.profile.summary,
        params.profile.skills.join(", "),
    )
}

/// Deterministic letter used whenever the generator fails or times out.
/// Built from the same template parameters, so a degraded pipeline still
/// submits something presentable.
pub fn fallback_letter(listing: &Listing, profile: &Profile) -> String {
    let skills = profile
        .skills
        .iter()
        .take(5)
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");

    let mut letter = format!(
        "Hello,\n\nI am interested in the {} position at {}.\n",
        listing.title, listing.company
    );
    if !profile.summary.is_empty() {
        letter.push_str(&format!("\n{}\n", profile.summary.trim()));
    }
    if !skills.is_empty() {
        letter.push_str(&format!("\nMy key skills: {}.\n", skills));
    }
    letter.push_str("\nI would be glad to discuss the details.\n\nBest regards");
    if !profile.name.is_empty() {
        letter.push_str(&format!(",\n{}", profile.name));
    }
    letter
}
