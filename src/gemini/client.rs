//! # Gemini REST Client
//!
//! Request/response coach features backed by `generateContent`:
//! - **market_insights**: search-grounded market analysis
//! - **mastermind_advice**: long-form strategic advice with a large thinking budget
//! - **analyze_job_match**: structured JSON job-fit analysis
//! - **generate_vision_board**: 16:9 image generation
//!
//! Each feature builds its request body with a plain function so the wire
//! shape can be tested without a network.

use crate::config::GeminiConfig;
use crate::gemini::types::{
    ChatRole, ChatTurn, Content, GenerateContentRequest, GenerateContentResponse, GenerationConfig, GoogleSearch,
    ImageConfig, ImageSize, JobAnalysis, MarketInsight, Part, ThinkingConfig, Tool,
};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

const MASTERMIND_INSTRUCTION: &str = "You are 'Wealth Coach', an elite financial and career advisor. You provide strategic advice. Use your thinking budget to deeply analyze the user's situation before responding.";

#[derive(Debug, Error)]
pub enum GeminiError {
    #[error("Gemini API key is not configured")]
    MissingApiKey,

    #[error("request to Gemini failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Gemini returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Gemini blocked the request: {0}")]
    Blocked(String),

    #[error("Gemini returned no usable content")]
    EmptyResponse,

    #[error("unexpected Gemini payload: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    config: GeminiConfig,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Result<Self, GeminiError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { http, config })
    }

    pub fn is_configured(&self) -> bool {
        !self.config.api_key.trim().is_empty()
    }

    fn endpoint(&self, model: &str) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.config.api_base.trim_end_matches('/'),
            model
        )
    }

    async fn generate(
        &self,
        model: &str,
        request: &GenerateContentRequest,
    ) -> Result<GenerateContentResponse, GeminiError> {
        if !self.is_configured() {
            return Err(GeminiError::MissingApiKey);
        }

        debug!(model, "Calling generateContent");
        let response = self
            .http
            .post(self.endpoint(model))
            .header("x-goog-api-key", &self.config.api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(model, status = status.as_u16(), "Gemini request failed");
            return Err(GeminiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: GenerateContentResponse = response.json().await?;
        if let Some(reason) = parsed
            .prompt_feedback
            .as_ref()
            .and_then(|feedback| feedback.block_reason.clone())
        {
            return Err(GeminiError::Blocked(reason));
        }
        Ok(parsed)
    }

    pub async fn market_insights(&self, query: &str) -> Result<MarketInsight, GeminiError> {
        let response = self
            .generate(&self.config.insights_model, &insights_request(query))
            .await?;
        let text = response.text().ok_or(GeminiError::EmptyResponse)?;
        Ok(MarketInsight {
            text,
            sources: response.web_sources(),
        })
    }

    pub async fn mastermind_advice(&self, history: &[ChatTurn], message: &str) -> Result<String, GeminiError> {
        let request = mastermind_request(history, message, self.config.thinking_budget);
        let response = self.generate(&self.config.mastermind_model, &request).await?;
        response.text().ok_or(GeminiError::EmptyResponse)
    }

    pub async fn analyze_job_match(
        &self,
        title: &str,
        description: &str,
        tags: &[String],
    ) -> Result<JobAnalysis, GeminiError> {
        let request = job_match_request(title, description, tags);
        let response = self.generate(&self.config.analysis_model, &request).await?;
        let text = response.text().ok_or(GeminiError::EmptyResponse)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Returns the generated image as a `data:` URL, or `None` if the model
    /// answered without an image.
    pub async fn generate_vision_board(&self, prompt: &str, size: ImageSize) -> Result<Option<String>, GeminiError> {
        let response = self
            .generate(&self.config.image_model, &vision_board_request(prompt, size))
            .await?;
        Ok(vision_board_image(&response))
    }
}

/// First inline image of a response as a `data:image/png;base64,...` URL.
pub fn vision_board_image(response: &GenerateContentResponse) -> Option<String> {
    response
        .inline_data()
        .map(|inline| format!("data:image/png;base64,{}", inline.data))
}

pub fn insights_request(query: &str) -> GenerateContentRequest {
    GenerateContentRequest {
        contents: vec![Content::text(
            Some("user"),
            format!(
                "Provide a concise market analysis for: {}. Focus on trends and actionable data.",
                query
            ),
        )],
        tools: Some(vec![Tool {
            google_search: Some(GoogleSearch {}),
        }]),
        ..GenerateContentRequest::default()
    }
}

/// Prior turns become `user`/`model` contents; `system` turns are UI notices and are skipped.
pub fn mastermind_request(history: &[ChatTurn], message: &str, thinking_budget: u32) -> GenerateContentRequest {
    let mut contents: Vec<Content> = history
        .iter()
        .filter_map(|turn| match turn.role {
            ChatRole::User => Some(Content::text(Some("user"), turn.content.clone())),
            ChatRole::Model => Some(Content::text(Some("model"), turn.content.clone())),
            ChatRole::System => None,
        })
        .collect();
    contents.push(Content::text(Some("user"), message));

    GenerateContentRequest {
        contents,
        system_instruction: Some(Content::text(None, MASTERMIND_INSTRUCTION)),
        generation_config: Some(GenerationConfig {
            thinking_config: Some(ThinkingConfig { thinking_budget }),
            ..GenerationConfig::default()
        }),
        ..GenerateContentRequest::default()
    }
}

pub fn job_match_request(title: &str, description: &str, tags: &[String]) -> GenerateContentRequest {
    let prompt = format!(
        "Analyze this job opportunity: \"{} - {}\". My skills are: {}.\n\
         Return a JSON object with:\n\
         - matchAnalysis (string, 1 sentence summary)\n\
         - pros (array of strings)\n\
         - cons (array of strings)\n\
         - growthPotential (number 0-100)",
        title,
        description,
        tags.join(", ")
    );

    GenerateContentRequest {
        contents: vec![Content::text(Some("user"), prompt)],
        generation_config: Some(GenerationConfig {
            response_mime_type: Some("application/json".to_string()),
            response_schema: Some(json!({
                "type": "OBJECT",
                "properties": {
                    "matchAnalysis": { "type": "STRING" },
                    "pros": { "type": "ARRAY", "items": { "type": "STRING" } },
                    "cons": { "type": "ARRAY", "items": { "type": "STRING" } },
                    "growthPotential": { "type": "NUMBER" }
                }
            })),
            ..GenerationConfig::default()
        }),
        ..GenerateContentRequest::default()
    }
}

pub fn vision_board_request(prompt: &str, size: ImageSize) -> GenerateContentRequest {
    GenerateContentRequest {
        contents: vec![Content {
            role: Some("user".to_string()),
            parts: vec![Part::text(prompt)],
        }],
        generation_config: Some(GenerationConfig {
            image_config: Some(ImageConfig {
                image_size: size,
                aspect_ratio: "16:9".to_string(),
            }),
            ..GenerationConfig::default()
        }),
        ..GenerateContentRequest::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn to_json(request: &GenerateContentRequest) -> serde_json::Value {
        serde_json::to_value(request).unwrap()
    }

    #[test]
    fn test_insights_request_uses_search_tool() {
        let body = to_json(&insights_request("remote Rust jobs"));
        assert_eq!(body["tools"], json!([{ "googleSearch": {} }]));
        assert_eq!(
            body["contents"][0]["parts"][0]["text"],
            "Provide a concise market analysis for: remote Rust jobs. Focus on trends and actionable data."
        );
        assert!(body.get("generationConfig").is_none());
    }

    #[test]
    fn test_mastermind_request_carries_history_and_budget() {
        let history = vec![
            ChatTurn {
                role: ChatRole::System,
                content: "Session started".to_string(),
            },
            ChatTurn {
                role: ChatRole::User,
                content: "I earn 60k.".to_string(),
            },
            ChatTurn {
                role: ChatRole::Model,
                content: "What are your goals?".to_string(),
            },
        ];
        let body = to_json(&mastermind_request(&history, "Reach 100k.", 32768));

        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[2]["parts"][0]["text"], "Reach 100k.");
        assert_eq!(body["generationConfig"]["thinkingConfig"]["thinkingBudget"], 32768);
        assert!(body["generationConfig"].get("maxOutputTokens").is_none());
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], MASTERMIND_INSTRUCTION);
    }

    #[test]
    fn test_job_match_request_asks_for_json() {
        let tags = vec!["Rust".to_string(), "Audio".to_string()];
        let body = to_json(&job_match_request("Engineer", "Build DSP", &tags));
        assert_eq!(body["generationConfig"]["responseMimeType"], "application/json");
        assert_eq!(
            body["generationConfig"]["responseSchema"]["properties"]["growthPotential"]["type"],
            "NUMBER"
        );
        let prompt = body["contents"][0]["parts"][0]["text"].as_str().unwrap();
        assert!(prompt.contains("\"Engineer - Build DSP\""));
        assert!(prompt.contains("My skills are: Rust, Audio."));
    }

    #[test]
    fn test_vision_board_request_shape() {
        let body = to_json(&vision_board_request("a beach office", ImageSize::TwoK));
        assert_eq!(
            body["generationConfig"]["imageConfig"],
            json!({ "imageSize": "2K", "aspectRatio": "16:9" })
        );
    }

    #[test]
    fn test_vision_board_image_is_png_data_url() {
        let response: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {
                    "parts": [
                        { "text": "Here is your board" },
                        { "inlineData": { "mimeType": "image/jpeg", "data": "iVBORw0KGgo=" } }
                    ]
                }
            }]
        }))
        .unwrap();
        assert_eq!(
            vision_board_image(&response).as_deref(),
            Some("data:image/png;base64,iVBORw0KGgo=")
        );
        assert_eq!(vision_board_image(&GenerateContentResponse::default()), None);
    }

    #[test]
    fn test_job_analysis_parses_model_json() {
        let analysis: JobAnalysis = serde_json::from_str(
            r#"{"matchAnalysis": "Strong fit.", "pros": ["Remote"], "cons": [], "growthPotential": 82}"#,
        )
        .unwrap();
        assert_eq!(analysis.growth_potential, 82.0);
        assert_eq!(analysis.pros, vec!["Remote"]);
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let mut config = AppConfig::default().gemini;
        config.api_base = "https://example.test/v1beta/".to_string();
        let client = GeminiClient::new(config).unwrap();
        assert_eq!(
            client.endpoint("gemini-2.5-flash"),
            "https://example.test/v1beta/models/gemini-2.5-flash:generateContent"
        );
    }

    #[tokio::test]
    async fn test_missing_key_fails_without_network() {
        let client = GeminiClient::new(AppConfig::default().gemini).unwrap();
        assert!(!client.is_configured());
        assert!(matches!(
            client.market_insights("anything").await,
            Err(GeminiError::MissingApiKey)
        ));
        assert!(matches!(
            client.generate_vision_board("anything", ImageSize::OneK).await,
            Err(GeminiError::MissingApiKey)
        ));
    }
}
