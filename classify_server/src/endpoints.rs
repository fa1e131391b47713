//! HTTP endpoints and the embedded browser page.
//!
use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::Multipart,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Html, IntoResponse, Response,
    },
    Extension, Json,
};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio_stream::wrappers::WatchStream;

use crate::{capture::CaptureError, gateway::GatewayState, AppContext};

const MODEL_LOAD_GUIDANCE: &str =
    "Could not load the model files. Make sure 'model.onnx' and 'metadata.json' are in the model directory.";
const CAMERA_GUIDANCE: &str =
    "Could not access the camera. Check device permissions or use the file upload instead.";

pub async fn index() -> Html<&'static str> {
    Html(INDEX_PAGE)
}

pub async fn healthcheck() -> &'static str {
    "Healthy"
}

/// Classify one uploaded still image.
///
/// A request without a usable `image` part is a no-op, not an error.
pub async fn classify_image(
    Extension(ctx): Extension<Arc<AppContext>>,
    mut multipart: Multipart,
) -> Result<Response, (StatusCode, String)> {
    let Some(data) = image_part(&mut multipart).await? else {
        return Ok(StatusCode::NO_CONTENT.into_response());
    };

    let image = match image::load_from_memory(&data) {
        Ok(image) => image.to_rgb8(),
        Err(err) => {
            return Err(notify(
                StatusCode::BAD_REQUEST,
                "Could not decode the uploaded image.",
                err,
            ))
        }
    };

    let model = ctx
        .gateway
        .acquire()
        .await
        .map_err(|err| notify(StatusCode::SERVICE_UNAVAILABLE, MODEL_LOAD_GUIDANCE, err))?;

    let mut buffer = ctx.frame.lock().await;
    buffer.normalize(&image, Some(image.dimensions()));
    let predictions = model
        .classify(&buffer)
        .map_err(|err| notify(StatusCode::INTERNAL_SERVER_ERROR, "Classification failed.", err))?;
    let lines = ctx.renderer.render(&predictions);

    Ok(Json(lines).into_response())
}

#[derive(Serialize)]
pub struct CameraStarted {
    started: bool,
    model_error: Option<String>,
}

pub async fn start_camera(
    Extension(ctx): Extension<Arc<AppContext>>,
) -> Result<Json<CameraStarted>, (StatusCode, String)> {
    let config = ctx.camera_config.clone();
    match ctx.capture.start(Arc::clone(&ctx), config).await {
        Ok(()) => {}
        Err(CaptureError::AlreadyActive) => {
            return Err((StatusCode::CONFLICT, "Camera is already running.".into()))
        }
        Err(CaptureError::Camera(err)) => {
            return Err(notify(StatusCode::SERVICE_UNAVAILABLE, CAMERA_GUIDANCE, err))
        }
    }

    // The loop runs either way; a failed warm-up is reported so the page
    // can alert it the way a failed upload would.
    let model_error = match ctx.gateway.state() {
        GatewayState::Failed => Some(MODEL_LOAD_GUIDANCE.to_owned()),
        _ => None,
    };

    Ok(Json(CameraStarted {
        started: true,
        model_error,
    }))
}

#[derive(Serialize)]
pub struct CameraStopped {
    stopped: bool,
}

pub async fn stop_camera(Extension(ctx): Extension<Arc<AppContext>>) -> Json<CameraStopped> {
    let stopped = ctx.capture.stop().await.is_some();
    Json(CameraStopped { stopped })
}

/// Snapshot of the currently rendered prediction lines.
pub async fn predictions(Extension(ctx): Extension<Arc<AppContext>>) -> Json<Vec<String>> {
    Json(ctx.renderer.current())
}

/// Server-sent events; each event carries the full replacement line list.
pub async fn prediction_stream(
    Extension(ctx): Extension<Arc<AppContext>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = WatchStream::new(ctx.renderer.subscribe())
        .map(|lines| Ok(Event::default().data(lines.join("\n"))));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn image_part(multipart: &mut Multipart) -> Result<Option<Vec<u8>>, (StatusCode, String)> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| notify(StatusCode::BAD_REQUEST, "Malformed upload.", err))?
    {
        if field.name() == Some("image") {
            let data = field
                .bytes()
                .await
                .map_err(|err| notify(StatusCode::BAD_REQUEST, "Malformed upload.", err))?;
            if data.is_empty() {
                return Ok(None);
            }
            return Ok(Some(data.to_vec()));
        }
    }
    Ok(None)
}

/// Log the diagnostic detail, hand the user-facing message to the page.
fn notify(
    status: StatusCode,
    user_message: &str,
    err: impl std::fmt::Display,
) -> (StatusCode, String) {
    log::error!("{user_message} ({err})");
    (status, user_message.to_owned())
}

const INDEX_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Image classification</title></head>
<body>
<h3>Image classification</h3>
<input type="file" id="fileInput" accept="image/*">
<button id="startBtn">Start camera</button>
<button id="stopBtn">Stop camera</button>
<ul id="predictions"></ul>
<script>
const predictionsEl = document.getElementById("predictions");

function show(lines) {
  predictionsEl.innerHTML = "";
  for (const line of lines) {
    const li = document.createElement("li");
    li.textContent = line;
    predictionsEl.appendChild(li);
  }
}

new EventSource("/predictions/stream").onmessage = (ev) => {
  show(ev.data ? ev.data.split("\n") : []);
};

document.getElementById("fileInput").addEventListener("change", async (ev) => {
  const file = ev.target.files[0];
  if (!file) return;
  const form = new FormData();
  form.append("image", file);
  const resp = await fetch("/classify_image", { method: "POST", body: form });
  if (!resp.ok) { alert(await resp.text()); return; }
  if (resp.status !== 204) show(await resp.json());
});

document.getElementById("startBtn").addEventListener("click", async () => {
  const resp = await fetch("/camera/start", { method: "POST" });
  if (!resp.ok) { alert(await resp.text()); return; }
  const body = await resp.json();
  if (body.model_error) alert(body.model_error);
});

document.getElementById("stopBtn").addEventListener("click", () => {
  fetch("/camera/stop", { method: "POST" });
});
</script>
</body>
</html>
"#;
