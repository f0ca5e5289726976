//! # Coach Feature Handlers
//!
//! HTTP endpoints for the request/response coach features under `/api/v1/coach`.
//!
//! ## Degrading gracefully:
//! Upstream failures (missing key, rate limits, network errors, malformed model
//! output) are logged and answered with `200` and a fallback body, so the
//! dashboard always has something to render. Only invalid requests fail, with
//! `400`.

use crate::error::{AppError, AppResult};
use crate::gemini::{ChatTurn, ImageSize, WebSource};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

pub const INSIGHTS_FALLBACK: &str = "Unable to fetch market data at this moment.";
pub const MASTERMIND_FALLBACK: &str = "The Wealth Coach is currently offline (Rate Limit or Network Error).";

#[derive(Debug, Deserialize)]
pub struct InsightsRequest {
    pub query: String,
}

#[derive(Debug, Deserialize)]
pub struct MastermindRequest {
    #[serde(default)]
    pub history: Vec<ChatTurn>,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct JobMatchRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct VisionBoardRequest {
    pub prompt: String,
    #[serde(default)]
    pub size: ImageSize,
}

fn require(field: &str, value: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::ValidationError(format!("{} cannot be empty", field)));
    }
    Ok(())
}

/// `POST /api/v1/coach/insights`
pub async fn market_insights(
    state: web::Data<AppState>,
    body: web::Json<InsightsRequest>,
) -> AppResult<HttpResponse> {
    require("query", &body.query)?;

    let (text, sources) = match state.gemini.market_insights(body.query.trim()).await {
        Ok(insight) => {
            info!(sources = insight.sources.len(), "Market insight generated");
            (insight.text, insight.sources)
        }
        Err(e) => {
            error!("Market insights failed: {}", e);
            (INSIGHTS_FALLBACK.to_string(), Vec::<WebSource>::new())
        }
    };

    Ok(HttpResponse::Ok().json(json!({ "text": text, "sources": sources })))
}

/// `POST /api/v1/coach/mastermind`
pub async fn mastermind(
    state: web::Data<AppState>,
    body: web::Json<MastermindRequest>,
) -> AppResult<HttpResponse> {
    require("message", &body.message)?;

    let reply = match state.gemini.mastermind_advice(&body.history, body.message.trim()).await {
        Ok(reply) => reply,
        Err(e) => {
            error!("Mastermind advice failed: {}", e);
            MASTERMIND_FALLBACK.to_string()
        }
    };

    Ok(HttpResponse::Ok().json(json!({ "reply": reply })))
}

/// `POST /api/v1/coach/jobs/analyze`
pub async fn analyze_job(
    state: web::Data<AppState>,
    body: web::Json<JobMatchRequest>,
) -> AppResult<HttpResponse> {
    require("title", &body.title)?;

    let analysis = match state
        .gemini
        .analyze_job_match(&body.title, &body.description, &body.tags)
        .await
    {
        Ok(analysis) => Some(analysis),
        Err(e) => {
            error!(title = %body.title, "Job analysis failed: {}", e);
            None
        }
    };

    Ok(HttpResponse::Ok().json(json!({ "analysis": analysis })))
}

/// `POST /api/v1/coach/vision-board`
pub async fn vision_board(
    state: web::Data<AppState>,
    body: web::Json<VisionBoardRequest>,
) -> AppResult<HttpResponse> {
    require("prompt", &body.prompt)?;

    let image = match state.gemini.generate_vision_board(body.prompt.trim(), body.size).await {
        Ok(image) => image,
        Err(e) => {
            error!("Vision board generation failed: {}", e);
            None
        }
    };

    Ok(HttpResponse::Ok().json(json!({ "image": image })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};

    macro_rules! coach_app {
        () => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new(AppState::new(AppConfig::default()).unwrap()))
                    .route("/insights", web::post().to(market_insights))
                    .route("/mastermind", web::post().to(mastermind))
                    .route("/jobs/analyze", web::post().to(analyze_job))
                    .route("/vision-board", web::post().to(vision_board)),
            )
            .await
        };
    }

    async fn post(uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let app = coach_app!();
        let req = test::TestRequest::post().uri(uri).set_json(body).to_request();
        let resp = test::call_service(&app, req).await;
        let status = resp.status();
        let body: serde_json::Value = test::read_body_json(resp).await;
        (status, body)
    }

    #[actix_web::test]
    async fn test_empty_inputs_are_rejected() {
        let (status, body) = post("/insights", json!({ "query": "   " })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["type"], "validation_error");

        let (status, _) = post("/mastermind", json!({ "message": "" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = post("/vision-board", json!({ "prompt": "" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    // No API key is configured in tests, so every call takes the fallback path.
    #[actix_web::test]
    async fn test_fallbacks_without_api_key() {
        let (status, body) = post("/insights", json!({ "query": "freelance design rates" })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["text"], INSIGHTS_FALLBACK);
        assert_eq!(body["sources"], json!([]));

        let (_, body) = post(
            "/mastermind",
            json!({ "history": [{ "role": "user", "content": "hi" }], "message": "Plan my week" }),
        )
        .await;
        assert_eq!(body["reply"], MASTERMIND_FALLBACK);

        let (_, body) = post("/jobs/analyze", json!({ "title": "Rust Engineer", "tags": ["Rust"] })).await;
        assert!(body["analysis"].is_null());

        let (_, body) = post("/vision-board", json!({ "prompt": "a cabin office", "size": "4K" })).await;
        assert!(body["image"].is_null());
    }
}
