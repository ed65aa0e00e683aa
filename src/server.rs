//! HTTP surface for the inference service

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::TurnoverError;
use crate::models::FeatureVector;
use crate::predict::InferenceService;

pub fn router(service: Arc<InferenceService>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/predict", post(predict_handler))
        .with_state(service)
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(service: InferenceService, addr: SocketAddr) -> anyhow::Result<()> {
    if !service.is_ready() {
        warn!("serving without a model; /predict will answer 503 until restarted with artifacts");
    }
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "inference API listening");
    axum::serve(listener, router(Arc::new(service)))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;
    Ok(())
}

async fn health_handler(State(service): State<Arc<InferenceService>>) -> Response {
    let status = if service.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(service.health())).into_response()
}

async fn predict_handler(
    State(service): State<Arc<InferenceService>>,
    payload: Result<Json<FeatureVector>, JsonRejection>,
) -> Response {
    let Json(features) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return error_response(StatusCode::UNPROCESSABLE_ENTITY, rejection.body_text());
        }
    };
    // attribution walks every tree, so scoring runs off the async workers
    let scored = tokio::task::spawn_blocking(move || service.predict(&features)).await;
    let outcome = match scored {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(error = %err, "prediction task failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "prediction task failed".to_string());
        }
    };
    match outcome {
        Ok(result) => {
            info!(
                risk_score = result.risk_score,
                risk_level = %result.risk_level,
                "scored request"
            );
            (StatusCode::OK, Json(result)).into_response()
        }
        Err(err @ TurnoverError::NotReady(_)) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
        }
        Err(err @ TurnoverError::Validation(_)) => {
            error_response(StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
        }
        Err(err) => {
            warn!(error = %err, "prediction failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

fn error_response(status: StatusCode, detail: String) -> Response {
    (status, Json(json!({ "detail": detail }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{tests::tiny_bundle, ArtifactPaths};
    use crate::models::tests::sample_vector;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    fn ready() -> Router {
        router(Arc::new(InferenceService::from_bundle(tiny_bundle())))
    }

    fn not_ready(dir: &tempfile::TempDir) -> Router {
        router(Arc::new(InferenceService::load(&ArtifactPaths::in_dir(dir.path()))))
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn predict_request(body: String) -> Request<Body> {
        Request::post("/predict")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_loaded_model() {
        let (status, body) = send(ready(), Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["model_loaded"], true);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn health_is_unavailable_without_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) =
            send(not_ready(&dir), Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["model_loaded"], false);
    }

    #[tokio::test]
    async fn predict_returns_scored_result() {
        let body = serde_json::to_string(&sample_vector()).unwrap();
        let (status, json) = send(ready(), predict_request(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["risk_level"], "HIGH");
        assert_eq!(json["top_drivers"][0]["feature"], "manager_mean");
        assert_eq!(json["suggested_actions"][0], "HR-partner/leadership escalation");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_predictions_agree() {
        let app = ready();
        let body = serde_json::to_string(&sample_vector()).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| tokio::spawn(send(app.clone(), predict_request(body.clone()))))
            .collect();
        let mut scores = Vec::new();
        for handle in handles {
            let (status, json) = handle.await.unwrap();
            assert_eq!(status, StatusCode::OK);
            scores.push(json["risk_score"].as_f64().unwrap());
        }
        assert!(scores.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[tokio::test]
    async fn predict_without_model_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let body = serde_json::to_string(&sample_vector()).unwrap();
        let (status, json) = send(not_ready(&dir), predict_request(body)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(json["detail"].as_str().unwrap().contains("not loaded"));
    }

    #[tokio::test]
    async fn missing_field_is_unprocessable() {
        let mut value = serde_json::to_value(sample_vector()).unwrap();
        value.as_object_mut().unwrap().remove("manager_mean");
        let (status, _) = send(ready(), predict_request(value.to_string())).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn excessive_flag_counts_are_unprocessable() {
        let mut features = sample_vector();
        features.red_flag_count = 20;
        features.yellow_flag_count = 10;
        let body = serde_json::to_string(&features).unwrap();
        let (status, json) = send(ready(), predict_request(body)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(json["detail"].as_str().unwrap().contains("flag counts"));
    }
}
