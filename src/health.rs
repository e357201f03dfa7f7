//! # Health and Metrics Endpoints
//!
//! `GET /health` answers load balancers and humans; `GET /api/v1/metrics`
//! breaks the HTTP counters down per endpoint and adds call totals.

use crate::config::AppConfig;
use crate::relay::registry::RegistrySummary;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let calls = state.calls.summary();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": ratio(metrics.error_count, metrics.request_count),
            "active_calls": calls.active_calls
        },
        "endpoint": {
            "url": config.endpoint.url,
            "api_key_configured": config.endpoint.api_key.is_some()
        },
        "memory": get_memory_info(),
        "system": get_system_status(&config, &calls)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let config = state.get_config();

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": ratio(metrics.error_count, metrics.request_count),
            "requests_per_second": ratio(metrics.request_count, uptime_seconds)
        },
        "endpoints": endpoint_stats,
        "calls": state.calls.summary(),
        "memory": get_memory_info(),
        "performance": {
            "max_concurrent_calls": config.performance.max_concurrent_calls,
            "uplink_queue_frames": config.audio.uplink_queue_frames,
            "egress_queue_frames": config.audio.egress_queue_frames,
            "telephony_queue_frames": config.audio.telephony_queue_frames
        }
    }))
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator > 0 {
        numerator as f64 / denominator as f64
    } else {
        0.0
    }
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", process::id())) {
            let field = |name: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .unwrap_or(0)
                    * 1024
            };

            return json!({
                "resident_memory_bytes": field("VmRSS:"),
                "virtual_memory_bytes": field("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": format!("Memory info not available for pid {}", process::id())
    })
}

/// Load level from call slot usage.
fn get_system_status(config: &AppConfig, calls: &RegistrySummary) -> serde_json::Value {
    let max_calls = config.performance.max_concurrent_calls;
    let usage = ratio(calls.active_calls as u64, max_calls as u64);

    let status = if usage > 0.9 {
        "high_load"
    } else if usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "call_usage_percent": (usage * 100.0).round(),
        "max_calls": max_calls,
        "current_calls": calls.active_calls,
        "load_warnings": if usage > 0.8 {
            vec!["High call usage - consider increasing max_concurrent_calls"]
        } else {
            vec![]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use crate::voice::CallContext;
    use actix_web::{test as actix_test, App};

    #[actix_web::test]
    async fn test_health_reports_active_calls() {
        let state = test_state();
        state.calls.admit(CallContext::new("CA1", "+15550100")).unwrap();

        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["metrics"]["active_calls"], 1);
        assert_eq!(body["endpoint"]["api_key_configured"], false);
        assert_eq!(body["system"]["status"], "normal");
    }

    #[test]
    fn test_system_status_thresholds() {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_calls = 10;

        let registry = crate::relay::CallRegistry::new(10);
        for i in 0..10 {
            registry.admit(CallContext::new(format!("CA{}", i), "")).unwrap();
        }

        let status = get_system_status(&config, &registry.summary());
        assert_eq!(status["status"], "high_load");
        assert_eq!(status["call_usage_percent"], 100.0);
        assert_eq!(status["load_warnings"].as_array().map(Vec::len), Some(1));
    }
}
