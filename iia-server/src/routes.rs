use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use iia_core::GenerationRequest;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::io::Cursor;
use tracing::{error, warn};

use crate::host::{Host, HostError, LoadIntent};

#[derive(Clone)]
struct AppState(Arc<Host>);

#[derive(Serialize)]
struct GenerationResponse {
    image: String,
    width: u32,
    height: u32,
}

#[derive(Deserialize)]
struct DragRequest {
    dx: f32,
    dy: f32,
}

#[derive(Deserialize)]
struct ExpandRequest {
    expanded: bool,
}

pub fn router(host: Arc<Host>) -> Router {
    Router::new()
        .route("/v1/state", get(state_handler))
        .route("/v1/models/load", post(load_handler))
        .route("/v1/models", delete(unload_handler))
        .route("/v1/images/generations", post(generate_handler))
        .route("/v1/images/latest", get(latest_image_handler))
        .route("/v1/overlay/show", post(show_overlay_handler))
        .route("/v1/overlay/expand", post(expand_overlay_handler))
        .route("/v1/overlay/drag", post(drag_overlay_handler))
        .with_state(AppState(host))
}

/// Encodes an image as a base64 PNG.
fn image_to_base64_png(img: &DynamicImage) -> anyhow::Result<String> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(BASE64_STANDARD.encode(&bytes))
}

fn rejected(reason: impl ToString) -> axum::response::Response {
    (
        StatusCode::CONFLICT,
        Json(json!({ "accepted": false, "error": reason.to_string() })),
    )
        .into_response()
}

async fn state_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.0.view())
}

async fn load_handler(
    State(state): State<AppState>,
    Json(intent): Json<LoadIntent>,
) -> impl IntoResponse {
    match state.0.load(intent).await {
        Ok(status) => (
            StatusCode::ACCEPTED,
            Json(json!({ "accepted": true, "status": status.to_string() })),
        )
            .into_response(),
        Err(HostError::Rejected(conflict)) => rejected(conflict),
        Err(e) => {
            warn!("load intent failed: {e}");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "accepted": false, "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn unload_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.0.orchestrator().unload().await;
    StatusCode::NO_CONTENT
}

async fn generate_handler(
    State(state): State<AppState>,
    Json(request): Json<GenerationRequest>,
) -> impl IntoResponse {
    match state.0.orchestrator().submit(request) {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({ "accepted": true }))).into_response(),
        Err(conflict) => rejected(conflict),
    }
}

async fn latest_image_handler(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.0.orchestrator().snapshot();
    let Some(result) = snapshot.latest_result() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match result.to_image().and_then(|img| image_to_base64_png(&img)) {
        Ok(image) => Json(GenerationResponse {
            image,
            width: result.width,
            height: result.height,
        })
        .into_response(),
        Err(e) => {
            error!("error encoding image: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {e:#}")).into_response()
        }
    }
}

async fn show_overlay_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.0.show_overlay())
}

async fn expand_overlay_handler(
    State(state): State<AppState>,
    Json(req): Json<ExpandRequest>,
) -> impl IntoResponse {
    Json(state.0.update_overlay(|overlay| overlay.set_expanded(req.expanded)))
}

async fn drag_overlay_handler(
    State(state): State<AppState>,
    Json(req): Json<DragRequest>,
) -> impl IntoResponse {
    Json(state.0.update_overlay(|overlay| overlay.drag(req.dx, req.dy)))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use iia_core::Orchestrator;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::testing::{model_file, wait_for, FakeEngine};

    use super::*;

    fn app(engine: FakeEngine, cache_dir: Option<PathBuf>) -> (Arc<Host>, Router) {
        let host = Arc::new(Host::new(Orchestrator::new(engine).unwrap(), cache_dir, 2));
        (host.clone(), router(host))
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => request
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn load_is_accepted_then_conflicts_while_loading() {
        let dir = tempfile::tempdir().unwrap();
        let model = model_file(dir.path(), "model.gguf", b"GGUF");
        let (_host, app) = app(FakeEngine::new().with_load_delay(Duration::from_millis(300)), None);
        let intent = json!({ "model_path": model });

        let (status, body) = send(&app, Method::POST, "/v1/models/load", Some(intent.clone())).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["accepted"], true);
        assert_eq!(body["status"], "Loading model...");

        let (status, body) = send(&app, Method::POST, "/v1/models/load", Some(intent)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["accepted"], false);
    }

    #[tokio::test]
    async fn staging_without_cache_dir_is_a_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let model = model_file(dir.path(), "model.gguf", b"GGUF");
        let (host, app) = app(FakeEngine::new(), None);

        let (status, body) = send(
            &app,
            Method::POST,
            "/v1/models/load",
            Some(json!({ "model_path": model, "stage": true })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["accepted"], false);
        assert_eq!(host.orchestrator().snapshot().revision, 0);
    }

    #[tokio::test]
    async fn generation_needs_a_ready_model() {
        let dir = tempfile::tempdir().unwrap();
        let model = model_file(dir.path(), "model.gguf", b"GGUF");
        let (host, app) = app(FakeEngine::new(), None);
        let request = json!({ "prompt": "a cat", "width": 64, "height": 64, "steps": 2 });

        let (status, _) =
            send(&app, Method::POST, "/v1/images/generations", Some(request.clone())).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let mut stream = host.orchestrator().subscribe();
        send(&app, Method::POST, "/v1/models/load", Some(json!({ "model_path": model }))).await;
        wait_for(&mut stream, |s| s.can_generate()).await;

        let (status, body) = send(&app, Method::POST, "/v1/images/generations", Some(request)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["accepted"], true);
    }

    #[tokio::test]
    async fn latest_image_is_not_found_until_a_generation_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let model = model_file(dir.path(), "model.gguf", b"GGUF");
        let (host, app) = app(FakeEngine::new(), None);

        let (status, _) = send(&app, Method::GET, "/v1/images/latest", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let mut stream = host.orchestrator().subscribe();
        send(&app, Method::POST, "/v1/models/load", Some(json!({ "model_path": model }))).await;
        wait_for(&mut stream, |s| s.can_generate()).await;
        send(
            &app,
            Method::POST,
            "/v1/images/generations",
            Some(json!({ "prompt": "a cat", "width": 32, "height": 16 })),
        )
        .await;
        wait_for(&mut stream, |s| s.generation.is_terminal()).await;

        let (status, body) = send(&app, Method::GET, "/v1/images/latest", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!((body["width"].clone(), body["height"].clone()), (json!(32), json!(16)));
        assert!(!body["image"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unload_returns_no_content_and_state_follows() {
        let dir = tempfile::tempdir().unwrap();
        let model = model_file(dir.path(), "model.gguf", b"GGUF");
        let (host, app) = app(FakeEngine::new(), None);

        let mut stream = host.orchestrator().subscribe();
        send(&app, Method::POST, "/v1/models/load", Some(json!({ "model_path": model }))).await;
        wait_for(&mut stream, |s| s.model.is_ready()).await;

        let (status, body) = send(&app, Method::DELETE, "/v1/models", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(body, Value::Null);

        let (status, view) = send(&app, Method::GET, "/v1/state", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["can_generate"], false);
        assert_eq!(view["model"], "No model loaded");
    }

    #[tokio::test]
    async fn overlay_routes_share_geometry() {
        let (_host, app) = app(FakeEngine::new(), None);

        let (_, shown) = send(&app, Method::POST, "/v1/overlay/show", None).await;
        assert_eq!(shown["visible"], true);
        let (_, moved) = send(
            &app,
            Method::POST,
            "/v1/overlay/drag",
            Some(json!({ "dx": 12.0, "dy": -4.0 })),
        )
        .await;
        assert_eq!((moved["x"].clone(), moved["y"].clone()), (json!(12), json!(196)));
        let (_, view) = send(&app, Method::GET, "/v1/state", None).await;
        assert_eq!(view["overlay"], moved);
    }
}
