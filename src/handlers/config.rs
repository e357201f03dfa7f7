use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config().redacted();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config
    })))
}

/// Partial update: only the keys present in the body change.
///
/// Endpoint and audio settings apply to calls that start afterwards; the call
/// limit applies to the next admission.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": current_config.redacted()
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use actix_web::{http::StatusCode, test as actix_test, App};

    #[actix_web::test]
    async fn test_update_then_read_masks_api_key() {
        let state = test_state();
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::get().to(get_config))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = actix_test::TestRequest::put()
            .uri("/config")
            .set_json(json!({
                "endpoint": { "api_key": "sk-live-123" },
                "performance": { "max_concurrent_calls": 7 }
            }))
            .to_request();
        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["updated_config"]["endpoint"]["api_key"], "***");

        assert_eq!(state.calls.max_concurrent_calls(), 7);
        assert_eq!(state.get_config().endpoint.api_key.as_deref(), Some("sk-live-123"));

        let req = actix_test::TestRequest::get().uri("/config").to_request();
        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["config"]["endpoint"]["api_key"], "***");
        assert_eq!(body["config"]["performance"]["max_concurrent_calls"], 7);
    }

    #[actix_web::test]
    async fn test_invalid_update_is_rejected_and_not_applied() {
        let state = test_state();
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = actix_test::TestRequest::put()
            .uri("/config")
            .set_json(json!({ "endpoint": { "url": "http://not-a-socket" } }))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.get_config().endpoint.url, "ws://127.0.0.1:9090/v1/voice");
    }
}
