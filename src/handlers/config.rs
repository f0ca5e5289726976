use crate::{
    error::{AppError, AppResult},
    state::AppState,
};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /api/v1/config`. The API key is never serialized; only whether one is set.
pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "api_key_configured": config.has_api_key(),
        "config": config
    })))
}

/// `PUT /api/v1/config`. Partial update of `server`, `live`, `audio` and `performance`.
///
/// Changes to `live` and `audio` apply to live sessions opened afterwards;
/// sessions already running keep the setup they connected with.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> AppResult<HttpResponse> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    tracing::info!(
        voice = %current_config.live.voice_name,
        max_sessions = current_config.performance.max_concurrent_sessions,
        "Configuration updated"
    );

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": current_config
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{test, App};

    fn app_state() -> web::Data<AppState> {
        let mut config = AppConfig::default();
        config.gemini.api_key = "secret-key".to_string();
        web::Data::new(AppState::new(config).unwrap())
    }

    #[actix_web::test]
    async fn test_get_config_hides_api_key() {
        let app = test::init_service(
            App::new()
                .app_data(app_state())
                .route("/config", web::get().to(get_config)),
        )
        .await;

        let req = test::TestRequest::get().uri("/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["api_key_configured"], true);
        assert_eq!(body["config"]["live"]["voice_name"], "Zephyr");
        assert!(!body.to_string().contains("secret-key"));
    }

    #[actix_web::test]
    async fn test_update_config() {
        let state = app_state();
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({ "live": { "voice_name": "Puck" } }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        assert_eq!(state.get_config().live.voice_name, "Puck");

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({ "audio": { "capture_block_size": 0 } }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);
        assert_eq!(state.get_config().audio.capture_block_size, 4096);
    }
}
