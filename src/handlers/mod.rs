pub mod coach;
pub mod config;

pub use coach::*;
pub use config::*;

use crate::error::{AppError, AppResult};
use actix_web::{HttpRequest, HttpResponse};

/// Fallback for unmatched routes, answered with the standard error envelope.
pub async fn not_found(req: HttpRequest) -> AppResult<HttpResponse> {
    Err(AppError::NotFound(format!("No route for {} {}", req.method(), req.path())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;
    use actix_web::{test, web, App};

    #[actix_web::test]
    async fn test_unknown_route_is_not_found() {
        let app = test::init_service(App::new().default_service(web::route().to(not_found))).await;

        let req = test::TestRequest::get().uri("/api/v1/nowhere").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["type"], "not_found");
        assert_eq!(body["error"]["message"], "No route for GET /api/v1/nowhere");
    }
}
