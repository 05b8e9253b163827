//! Endpoints of HTTP server.
//!
use std::sync::Arc;

use axum::{
    body::StreamBody,
    extract::Path,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use common::protocol::ErrorBody;
use futures::StreamExt;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

use crate::{
    app::{DetectError, MoodApp},
    meter::METER,
};

/// Build the router with all endpoints.
pub fn router(app: Arc<MoodApp>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/healthcheck", get(healthcheck))
        .route("/stream", get(camera_stream))
        .route("/snapshot", get(snapshot))
        .route("/detect", post(detect))
        .route("/status", get(status))
        .route("/songs", get(songs))
        .route("/songs/:index/toggle", post(toggle_song))
        .layer(Extension(app))
}

/// Health check endpoint.
pub async fn healthcheck() -> &'static str {
    "healthy"
}

pub async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// Live camera stream.
pub async fn camera_stream(Extension(app): Extension<Arc<MoodApp>>) -> impl IntoResponse {
    log::info!("Camera stream requested");

    // Subscribe to the broadcasted camera frames, dropping items a slow viewer missed
    let rx = app.frames().subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|item| async move {
        match item {
            Ok(frame) => {
                METER.tick_streamed();
                Some(Ok::<_, std::io::Error>(frame))
            }
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                METER.add_skipped(skipped);
                None
            }
        }
    });

    // Set body and headers for multipart streaming
    let body = StreamBody::new(stream);
    let headers = [(
        header::CONTENT_TYPE,
        "multipart/x-mixed-replace; boundary=frame",
    )];

    (headers, body)
}

/// Frame the last mood was detected on, with the face marked.
pub async fn snapshot(Extension(app): Extension<Arc<MoodApp>>) -> Response {
    match app.frames().analyzed() {
        Some(jpeg) => ([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "No mood detected yet."),
    }
}

pub async fn detect(Extension(app): Extension<Arc<MoodApp>>) -> Response {
    log::info!("Mood detection requested");

    match app.detect_mood().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => {
            let status = match e {
                DetectError::Busy => StatusCode::CONFLICT,
                DetectError::NoFace => StatusCode::UNPROCESSABLE_ENTITY,
                DetectError::Failed(_) => StatusCode::BAD_GATEWAY,
            };
            error_response(status, &e.to_string())
        }
    }
}

pub async fn status(Extension(app): Extension<Arc<MoodApp>>) -> impl IntoResponse {
    Json(app.status())
}

pub async fn songs(Extension(app): Extension<Arc<MoodApp>>) -> impl IntoResponse {
    Json(app.songs())
}

pub async fn toggle_song(
    Extension(app): Extension<Arc<MoodApp>>,
    Path(index): Path<usize>,
) -> Response {
    match app.toggle(index) {
        Ok(view) => Json(view).into_response(),
        Err(e) => {
            log::debug!("Toggle rejected: {e}");
            error_response(StatusCode::NOT_FOUND, &e.to_string())
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    let body = ErrorBody {
        error: message.to_owned(),
    };
    (status, Json(body)).into_response()
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <title>Moodify</title>
</head>
<body>
  <h3>Live Mood Detection</h3>
  <img src="./stream" width="640">
  <p>
    <button id="detect" onclick="detectMood()">Detect Mood</button>
    <span id="mood"></span>
    <span id="error"></span>
  </p>
  <h2>Recommended Songs</h2>
  <ol id="songs"></ol>
  <script>
    const emojis = { happy: "😄", sad: "😢", angry: "😠", surprised: "😲", disgusted: "🤢", fearful: "😨", neutral: "😐" };

    async function detectMood() {
      const button = document.getElementById("detect");
      button.disabled = true;
      button.textContent = "Detecting...";
      document.getElementById("mood").textContent = "";
      document.getElementById("error").textContent = "";
      try {
        const resp = await fetch("./detect", { method: "POST" });
        const body = await resp.json();
        if (resp.ok) {
          document.getElementById("mood").textContent = (emojis[body.mood] || "🙂") + " " + body.mood;
        } else {
          document.getElementById("error").textContent = body.error;
        }
      } finally {
        button.disabled = false;
        button.textContent = "Detect Mood";
        await renderSongs();
      }
    }

    async function toggle(index) {
      await fetch("./songs/" + index + "/toggle", { method: "POST" });
      await renderSongs();
    }

    async function renderSongs() {
      const view = await (await fetch("./songs")).json();
      const list = document.getElementById("songs");
      list.innerHTML = "";
      if (view.songs.length === 0) {
        list.textContent = "No recommendations yet. Try detecting your mood!";
      }
      view.songs.forEach((song, index) => {
        const item = document.createElement("li");
        const button = document.createElement("button");
        button.textContent = view.playing === index ? "Pause" : "Play";
        button.onclick = () => toggle(index);
        item.textContent = song.title + " - " + song.artist + " ";
        item.appendChild(button);
        const link = document.createElement("a");
        link.href = song.audio;
        link.target = "_blank";
        link.rel = "noopener noreferrer";
        link.textContent = "Open";
        item.appendChild(document.createTextNode(" "));
        item.appendChild(link);
        list.appendChild(item);
      });
    }

    renderSongs();
    setInterval(renderSongs, 2000);
  </script>
</body>
</html>
"#;
