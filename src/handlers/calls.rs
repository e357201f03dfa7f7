//! Inspection and control of active calls.

use crate::{
    error::{AppError, AppResult},
    state::AppState,
};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn list_calls(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let calls = state.calls.snapshots();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "summary": state.calls.summary(),
        "calls": calls
    })))
}

pub async fn get_call(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let call_id = path.into_inner();
    let record = state
        .calls
        .get(&call_id)
        .ok_or_else(|| AppError::NotFound(format!("Call '{}' is not active", call_id)))?;

    Ok(HttpResponse::Ok().json(record.snapshot()))
}

/// Cancel an active call. The call winds down asynchronously; the response
/// only confirms that cancellation was requested.
pub async fn hang_up_call(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let call_id = path.into_inner();
    if !state.calls.hang_up(&call_id) {
        return Err(AppError::NotFound(format!("Call '{}' is not active", call_id)));
    }

    tracing::info!(call_id = %call_id, "hang up requested via API");

    Ok(HttpResponse::Accepted().json(json!({
        "status": "cancelling",
        "call_id": call_id,
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use crate::voice::CallContext;
    use actix_web::{http::StatusCode, test as actix_test, App};

    #[actix_web::test]
    async fn test_list_get_and_hang_up() {
        let state = test_state();
        let (record, _signal) = state
            .calls
            .admit(CallContext::new("CA9", "+15550100").with_metadata("campaign", "spring"))
            .unwrap();

        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/calls", web::get().to(list_calls))
                .route("/calls/{call_id}", web::get().to(get_call))
                .route("/calls/{call_id}", web::delete().to(hang_up_call)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/calls").to_request();
        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["summary"]["active_calls"], 1);
        assert_eq!(body["calls"][0]["call_id"], "CA9");
        assert_eq!(body["calls"][0]["state"], "init");

        let req = actix_test::TestRequest::get().uri("/calls/CA9").to_request();
        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["phone_number"], "+15550100");

        let req = actix_test::TestRequest::delete().uri("/calls/CA9").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert!(record.is_cancelled());
    }

    #[actix_web::test]
    async fn test_unknown_call_is_not_found() {
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(test_state()))
                .route("/calls/{call_id}", web::get().to(get_call))
                .route("/calls/{call_id}", web::delete().to(hang_up_call)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/calls/missing").to_request();
        assert_eq!(actix_test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

        let req = actix_test::TestRequest::delete().uri("/calls/missing").to_request();
        assert_eq!(actix_test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
    }
}
